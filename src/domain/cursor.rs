//! IR Cursor
//!
//! Derives a screen cursor from the dots the IR camera sees. The two sensor
//! bar clusters give a centroid, a separation (distance) and a yaw; the
//! centroid is shifted by the sensor bar placement and mapped onto a
//! 640×480 screen.

use crate::domain::imu::Accelerometer;

pub const SCREEN_WIDTH: i32 = 640;
pub const SCREEN_HEIGHT: i32 = 480;

/// Centre of the camera's 1024×768 coordinate space.
pub const CAMERA_CENTER: (f32, f32) = (512.0, 384.0);

/// Part of the camera space the screen is mapped from, `(min, max)`.
pub const CAMERA_AREA: (Point, Point) = (Point::new(184, 140), Point::new(743, 627));

/// Vertical shift applied for the sensor bar's placement.
pub const SENSOR_BAR_OFFSET: i32 = 140;

/// Largest acceleration for which the resting roll is trusted.
const MAX_ROLL_MAGNITUDE: f32 = 1.1;

const FIXED_SHIFT: u32 = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Which sensor bar cluster a dot belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Side {
    #[default]
    Unknown,
    Left,
    Right,
}

/// One dot tracked by the IR camera.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IrDot {
    pub visible: bool,
    pub side: Side,
    /// Camera coordinates, X already mirrored.
    pub pos: Point,
    /// 0..15, Extended and Full formats only.
    pub size: u8,
    /// `(min, max)`, Full format only.
    pub bbox: (Point, Point),
    /// Full format only.
    pub intensity: u8,
}

/// Cursor derived from the IR dots.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Cursor {
    /// A position was derived from the latest dots.
    pub valid: bool,
    /// Screen position, within 640×480.
    pub pos: Point,
    /// Separation of the two clusters in camera units.
    pub distance: f32,
    /// `1023 - distance`.
    pub z: f32,
    pub yaw: f32,
    /// Most dots seen since they were last all lost.
    pub known_dots: u8,
    sides: [Side; 4],
}

fn rotate(p: Point, angle: f32) -> (f32, f32) {
    let (sin, cos) = angle.sin_cos();
    let dx = p.x as f32 - CAMERA_CENTER.0;
    let dy = p.y as f32 - CAMERA_CENTER.1;
    (
        CAMERA_CENTER.0 + dx * cos - dy * sin,
        CAMERA_CENTER.1 + dx * sin + dy * cos,
    )
}

/// `(value * scale) >> 32` rounded half up, with both in 16.16.
fn fixed_mul(value: i64, scale: i64) -> i64 {
    (value * scale + (1 << (2 * FIXED_SHIFT - 1))) >> (2 * FIXED_SHIFT)
}

/// Map camera coordinates onto the screen, relative to the centres.
pub fn map_to_screen(x: f32, y: f32) -> Point {
    let (min, max) = CAMERA_AREA;
    let scale_x = ((SCREEN_WIDTH as i64) << FIXED_SHIFT) / (max.x - min.x) as i64;
    let scale_y = ((SCREEN_HEIGHT as i64) << FIXED_SHIFT) / (max.y - min.y) as i64;

    let dx = ((x - CAMERA_CENTER.0) * (1 << FIXED_SHIFT) as f32).round() as i64;
    let dy = ((y - CAMERA_CENTER.1) * (1 << FIXED_SHIFT) as f32).round() as i64;

    let px = SCREEN_WIDTH as i64 / 2 + fixed_mul(dx, scale_x);
    let py = SCREEN_HEIGHT as i64 / 2 + fixed_mul(dy, scale_y);
    Point::new(
        px.clamp(0, SCREEN_WIDTH as i64 - 1) as i32,
        py.clamp(0, SCREEN_HEIGHT as i64 - 1) as i32,
    )
}

impl Cursor {
    /// Recompute from `dots`, tagging each visible dot with its side.
    ///
    /// `accelerometer` is the latest reading when the report carried one;
    /// `bar_offset` is added to the centroid before mapping.
    pub fn update(
        &mut self,
        dots: &mut [IrDot; 4],
        accelerometer: Option<&Accelerometer>,
        bar_offset: Point,
    ) {
        let visible: Vec<usize> = (0..dots.len()).filter(|&i| dots[i].visible).collect();
        if visible.is_empty() {
            *self = Self::default();
            return;
        }

        let roll = accelerometer
            .filter(|a| a.spherical.magnitude < MAX_ROLL_MAGNITUDE)
            .map_or(0.0, |a| a.orientation.roll);

        let centroid = if visible.len() >= 2 {
            let points: Vec<(f32, f32)> = visible.iter().map(|&i| rotate(dots[i].pos, -roll)).collect();
            let n = points.len() as f32;
            let cx = points.iter().map(|p| p.0).sum::<f32>() / n;
            let cy = points.iter().map(|p| p.1).sum::<f32>() / n;

            for (&i, p) in visible.iter().zip(points.iter()) {
                let side = if p.0 < cx { Side::Left } else { Side::Right };
                dots[i].side = side;
                self.sides[i] = side;
            }

            let (a, b) = (points[0], points[1]);
            self.distance = (b.0 - a.0).hypot(b.1 - a.1);
            self.z = 1023.0 - self.distance;
            self.yaw = if self.z != 0.0 {
                (((cx - CAMERA_CENTER.0) * self.z / 1024.0) / self.z).atan()
            } else {
                0.0
            };
            Some((cx, cy))
        } else if self.known_dots >= 2 {
            let i = visible[0];
            let p = rotate(dots[i].pos, -roll);
            let side = self.sides[i];
            dots[i].side = side;
            match side {
                Side::Left => Some((p.0 + self.distance / 2.0, p.1)),
                Side::Right => Some((p.0 - self.distance / 2.0, p.1)),
                Side::Unknown => None,
            }
        } else {
            None
        };

        self.known_dots = self.known_dots.max(visible.len() as u8);

        match centroid {
            Some((cx, cy)) => {
                self.pos = map_to_screen(cx + bar_offset.x as f32, cy + bar_offset.y as f32);
                self.valid = true;
            }
            None => self.valid = false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::imu::Spherical;

    fn dot(x: i32, y: i32) -> IrDot {
        IrDot {
            visible: true,
            pos: Point::new(x, y),
            ..Default::default()
        }
    }

    fn level() -> Accelerometer {
        Accelerometer {
            spherical: Spherical {
                magnitude: 1.0,
                roll: 0.0,
                pitch: 0.0,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_two_dots() {
        let mut dots = [dot(300, 384), dot(724, 384), IrDot::default(), IrDot::default()];
        let mut cursor = Cursor::default();
        cursor.update(&mut dots, Some(&level()), Point::new(0, -SENSOR_BAR_OFFSET));

        assert!(cursor.valid);
        assert_eq!(cursor.pos, Point::new(320, 102));
        assert_eq!(cursor.distance, 424.0);
        assert_eq!(cursor.z, 599.0);
        assert!(cursor.yaw.abs() < 1e-6);
        assert_eq!(cursor.known_dots, 2);
        assert_eq!(dots[0].side, Side::Left);
        assert_eq!(dots[1].side, Side::Right);
    }

    #[test]
    fn test_symmetric_dots_centre_horizontally() {
        for offset in [40, 150, 300] {
            let mut dots = [
                dot(512 - offset, 300),
                dot(512 + offset, 300),
                IrDot::default(),
                IrDot::default(),
            ];
            let mut cursor = Cursor::default();
            cursor.update(&mut dots, None, Point::new(0, SENSOR_BAR_OFFSET));
            assert_eq!(cursor.pos.x, 320);
        }
    }

    #[test]
    fn test_single_dot_uses_remembered_pair() {
        let mut cursor = Cursor::default();
        let mut dots = [dot(300, 384), dot(724, 384), IrDot::default(), IrDot::default()];
        cursor.update(&mut dots, None, Point::default());
        let paired = cursor.pos;

        let mut dots = [dot(300, 384), IrDot::default(), IrDot::default(), IrDot::default()];
        cursor.update(&mut dots, None, Point::default());
        assert!(cursor.valid);
        assert_eq!(cursor.pos, paired);
        assert_eq!(dots[0].side, Side::Left);
        assert_eq!(cursor.known_dots, 2);
    }

    #[test]
    fn test_single_dot_without_history() {
        let mut cursor = Cursor::default();
        let mut dots = [IrDot::default(), dot(500, 500), IrDot::default(), IrDot::default()];
        cursor.update(&mut dots, None, Point::default());
        assert!(!cursor.valid);
        assert_eq!(cursor.known_dots, 1);
    }

    #[test]
    fn test_no_dots_clears() {
        let mut cursor = Cursor::default();
        let mut dots = [dot(300, 384), dot(724, 384), IrDot::default(), IrDot::default()];
        cursor.update(&mut dots, None, Point::default());

        let mut dots = [IrDot::default(); 4];
        cursor.update(&mut dots, None, Point::default());
        assert_eq!(cursor, Cursor::default());
    }

    #[test]
    fn test_mapping_clamps() {
        assert_eq!(map_to_screen(-5000.0, -5000.0), Point::new(0, 0));
        assert_eq!(map_to_screen(5000.0, 5000.0), Point::new(639, 479));
        assert_eq!(map_to_screen(512.0, 384.0), Point::new(320, 240));
    }

    #[test]
    fn test_roll_is_compensated() {
        let mut rolled = level();
        rolled.orientation.roll = std::f32::consts::FRAC_PI_2;

        // Bar seen vertically because the controller is on its side.
        let mut dots = [dot(512, 172), dot(512, 596), IrDot::default(), IrDot::default()];
        let mut cursor = Cursor::default();
        cursor.update(&mut dots, Some(&rolled), Point::default());
        assert_eq!(cursor.distance.round(), 424.0);
        assert_eq!(cursor.pos, Point::new(320, 240));
    }
}
