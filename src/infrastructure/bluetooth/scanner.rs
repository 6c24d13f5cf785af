//! Automatic Discovery
//!
//! Keeps the controller inquiring for a total time budget. Each inquiry asks
//! for the remaining time in 1.28 s units; when it ends the registry waits
//! a short while and starts another one as long as enough time is left.

use crate::error::{BtError, Result};
use crate::infrastructure::bluetooth::service::{secs, DriverRegistry, WorkerMessage};
use crate::infrastructure::lock;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Inquiry length unit used by the controller.
pub const INQUIRY_UNIT: Duration = Duration::from_millis(1280);

/// Longest inquiry the controller accepts, in units.
pub const MAX_INQUIRY_LENGTH: u8 = 0x30;

/// Pause between the end of one inquiry and the start of the next.
pub const RESTART_DELAY: Duration = Duration::from_millis(500);

/// Another inquiry starts only while more than this is left.
pub const MIN_REMAINING: Duration = Duration::from_secs(1);

/// Inquiry length covering `remaining`, within the controller's limits.
pub fn inquiry_length(remaining: Duration) -> u8 {
    let units = remaining.as_millis() / INQUIRY_UNIT.as_millis();
    units.clamp(1, MAX_INQUIRY_LENGTH as u128) as u8
}

struct Scan {
    remaining: Duration,
    started: Instant,
}

/// Time budget of an automatic discovery run.
pub struct Scanner {
    scan: Mutex<Option<Scan>>,
}

impl Scanner {
    pub fn new() -> Self {
        Self {
            scan: Mutex::new(None),
        }
    }

    /// Start a run of `duration`. Fails if one is already going.
    pub fn start(&self, duration: Duration) -> Result<()> {
        let mut scan = lock(&self.scan);
        if scan.is_some() {
            return Err(BtError::runtime("automatic discovery already running"));
        }
        *scan = Some(Scan {
            remaining: duration,
            started: Instant::now(),
        });
        Ok(())
    }

    pub fn stop(&self) {
        lock(&self.scan).take();
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.scan).is_some()
    }

    /// Length of the next inquiry, or `None` if the run was stopped.
    pub fn next_inquiry(&self) -> Option<u8> {
        let mut scan = lock(&self.scan);
        let scan = scan.as_mut()?;
        scan.started = Instant::now();
        Some(inquiry_length(scan.remaining))
    }

    /// Account for a finished inquiry plus the restart pause.
    /// Returns whether another inquiry should follow.
    pub fn inquiry_finished(&self) -> bool {
        let mut guard = lock(&self.scan);
        let Some(scan) = guard.as_mut() else {
            return false;
        };
        let spent = scan.started.elapsed() + RESTART_DELAY;
        scan.remaining = scan.remaining.saturating_sub(spent);
        debug!(target: "bltools", "{:.1}s of discovery left", secs(scan.remaining));

        if scan.remaining > MIN_REMAINING {
            true
        } else {
            *guard = None;
            false
        }
    }
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverRegistry {
    /// Inquire for devices for `duration`, handing each one found to the drivers.
    pub fn begin_automatic_discovery(&self, duration: Duration) -> Result<()> {
        self.scanner.start(duration)?;
        info!(target: "bltools", "Automatic discovery for {:.1}s", secs(duration));
        Self::post(self.sender(), WorkerMessage::StartDiscovery);
        Ok(())
    }

    /// Stop after the current inquiry.
    pub fn stop_automatic_discovery(&self) {
        self.scanner.stop();
    }

    pub fn is_discovering(&self) -> bool {
        self.scanner.is_scanning()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{BdAddr, DiscoveredDevice};
    use crate::infrastructure::bluetooth::hci::{Hci, HciConfig};
    use crate::infrastructure::bluetooth::protocol::{event, opcode};
    use crate::infrastructure::bluetooth::service::{BluetoothDriver, BoxFuture, DriverInstance};
    use crate::testing::FakeController;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_inquiry_length() {
        assert_eq!(inquiry_length(Duration::from_millis(100)), 1);
        assert_eq!(inquiry_length(Duration::from_secs(5)), 3);
        assert_eq!(inquiry_length(Duration::from_secs(600)), MAX_INQUIRY_LENGTH);
    }

    #[test]
    fn test_scanner_budget() {
        let scanner = Scanner::new();
        assert_eq!(scanner.next_inquiry(), None);

        scanner.start(Duration::from_secs(2)).unwrap();
        assert!(matches!(
            scanner.start(Duration::from_secs(2)),
            Err(BtError::Runtime(_))
        ));

        assert_eq!(scanner.next_inquiry(), Some(1));
        assert!(scanner.inquiry_finished());
        scanner.next_inquiry();
        assert!(!scanner.inquiry_finished());
        assert!(!scanner.is_scanning());
    }

    struct Recorder {
        seen: AtomicUsize,
    }

    impl BluetoothDriver for Recorder {
        fn id(&self) -> u16 {
            0x0100
        }

        fn name(&self) -> &str {
            "recorder"
        }

        fn filter_inquiry(&self, _device: &DiscoveredDevice, name: &str) -> bool {
            name == "Nintendo RVL-CNT-01"
        }

        fn filter_paired(&self, _device: &DiscoveredDevice) -> bool {
            false
        }

        fn initialize_new<'a>(&'a self, _device: &'a DiscoveredDevice) -> BoxFuture<'a, Option<DriverInstance>> {
            Box::pin(async move {
                self.seen.fetch_add(1, Ordering::SeqCst);
                Some(Arc::new(()) as DriverInstance)
            })
        }

        fn initialize_paired<'a>(
            &'a self,
            _device: &'a DiscoveredDevice,
        ) -> BoxFuture<'a, Option<DriverInstance>> {
            Box::pin(async { None })
        }

        fn free(&self, _instance: DriverInstance) {}
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_automatic_discovery_hands_devices_to_drivers() {
        let fake = FakeController::new();
        let address = BdAddr::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        fake.set_remote_name("Nintendo RVL-CNT-01");

        let mut result = vec![0x01];
        result.extend_from_slice(&address.to_wire());
        result.extend_from_slice(&[0x01, 0x00, 0x00, 0x04, 0x25, 0x00, 0x00, 0x00]);
        fake.script_inquiry(vec![
            (event::INQUIRY_RESULT, result),
            (event::INQUIRY_COMPLETE, vec![0x00]),
        ]);

        let hci = Hci::with_device(fake.clone(), HciConfig::default())
            .await
            .unwrap();
        let registry = DriverRegistry::new(hci);
        let driver = Arc::new(Recorder {
            seen: AtomicUsize::new(0),
        });
        registry.register_driver(driver.clone()).unwrap();

        registry
            .begin_automatic_discovery(Duration::from_secs(2))
            .unwrap();
        assert!(registry.is_discovering());
        assert!(fake.wait_for(|_| driver.seen.load(Ordering::SeqCst) >= 1).await);
        assert!(fake.wait_for(|_| !registry.is_discovering()).await);

        let inquiries = fake
            .sent_commands()
            .iter()
            .filter(|(op, _)| *op == opcode::INQUIRY)
            .count();
        assert!((1..=2).contains(&inquiries));
        registry.close();
    }
}
