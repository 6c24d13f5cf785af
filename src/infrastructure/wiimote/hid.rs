//! One connected Wiimote.
//!
//! Output commands go out on the interrupt channel as `{0xA2, id, ..}`.
//! Input reports come back on the same channel and are handled from its
//! receive event: status and memory reads update the session directly,
//! data reports are only copied into the [`RawState`] for `poll`.

use crate::domain::extension::ExtensionType;
use crate::domain::imu::Calibration;
use crate::domain::models::BdAddr;
use crate::error::Result;
use crate::infrastructure::bluetooth::l2cap::{status, Channel, ChannelEvent, L2cap, L2capDevice};
use crate::infrastructure::lock;
use crate::infrastructure::wiimote::decoder::RawState;
use crate::infrastructure::wiimote::protocol::{
    self, input, output, register, report, ReadData, StatusReport, DEFAULT_SENSITIVITY, SENSITIVITY,
};
use crate::infrastructure::wiimote::WiimoteConfig;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, trace};

pub const CONTROL_PSM: u16 = 0x11;
pub const INTERRUPT_PSM: u16 = 0x13;

const CONTROL_CID: u16 = 0x0040;
const INTERRUPT_CID: u16 = 0x0041;
const CONTROL_BUFFER: usize = 16;
const INTERRUPT_BUFFER: usize = 256;

/// Largest input report we expect.
const MAX_INPUT: usize = 64;

/// Status waits while a paired controller opens its channels.
const PEER_OPEN_ATTEMPTS: usize = 5;

/// Output state the controller does not report back.
#[derive(Debug, Default)]
struct Modes {
    /// Reporting mode last sent, 0 when none.
    report_mode: u8,
    ir_mode: Option<u8>,
    extension: bool,
    rumble: bool,
}

pub struct WiimoteHid {
    slot: usize,
    l2cap: Arc<L2cap>,
    device: Arc<L2capDevice>,
    control: Arc<Channel>,
    interrupt: Arc<Channel>,
    config: WiimoteConfig,
    raw: Mutex<RawState>,
    modes: Mutex<Modes>,
}

impl WiimoteHid {
    /// Control and interrupt channels to declare on the L2CAP device.
    pub fn declare_channels(l2cap: &L2cap) -> Result<(Arc<Channel>, Arc<Channel>)> {
        let control = l2cap.initialize_channel(CONTROL_CID, 0, CONTROL_PSM, CONTROL_BUFFER)?;
        let interrupt = l2cap.initialize_channel(INTERRUPT_CID, 0, INTERRUPT_PSM, INTERRUPT_BUFFER)?;
        Ok((control, interrupt))
    }

    /// Bind a session to an opened device and start handling its input.
    pub fn new(
        slot: usize,
        l2cap: Arc<L2cap>,
        device: Arc<L2capDevice>,
        control: Arc<Channel>,
        interrupt: Arc<Channel>,
        config: WiimoteConfig,
    ) -> Arc<Self> {
        let hid = Arc::new(Self {
            slot,
            l2cap,
            device,
            control,
            interrupt,
            config,
            raw: Mutex::new(RawState::default()),
            modes: Mutex::new(Modes::default()),
        });

        let weak = Arc::downgrade(&hid);
        let on_input: ChannelEvent = Arc::new(move |channel: &Arc<Channel>| {
            if let Some(hid) = weak.upgrade() {
                hid.on_input(channel);
            }
        });
        hid.l2cap
            .set_channel_receive_event(&hid.interrupt, Some(on_input));
        hid
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn address(&self) -> BdAddr {
        self.device.mac()
    }

    pub fn device(&self) -> &Arc<L2capDevice> {
        &self.device
    }

    /// Copy of what the receive path has collected.
    pub fn snapshot(&self) -> RawState {
        lock(&self.raw).clone()
    }

    pub fn report_mode(&self) -> u8 {
        lock(&self.modes).report_mode
    }

    /// Open both channels ourselves. The controller needs a pause before
    /// each one.
    pub async fn open_channels(&self) -> Result<()> {
        for channel in [&self.control, &self.interrupt] {
            tokio::time::sleep(self.config.channel_open_delay).await;
            self.l2cap.open_channel(&self.device, channel).await?;
        }
        Ok(())
    }

    /// Wait for a paired controller to open and configure both channels.
    pub async fn await_channels(&self) -> Result<()> {
        for channel in [&self.control, &self.interrupt] {
            let mut attempt = 1;
            loop {
                match self
                    .l2cap
                    .wait_channel_status(channel, status::CONFIGURED)
                    .await
                {
                    Ok(()) => break,
                    Err(e) if e.is_connection_failure() && attempt < PEER_OPEN_ATTEMPTS => {
                        trace!(target: "wiimote", "Channel {:#06x} not ready yet ({})", channel.source_id(), e);
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// LEDs, reporting mode, calibration read, camera, status.
    pub async fn setup(&self) -> Result<()> {
        self.set_leds(protocol::led_mask(self.slot)).await?;
        self.set_report(report::BUTTONS_ACCEL_IR12, false).await?;
        self.read_memory(register::CALIBRATION, Calibration::BLOCK_SIZE as u16)
            .await?;
        self.initialize_ir_camera().await?;
        self.request_status().await
    }

    /// Stop handling input and forget the L2CAP device.
    pub fn close(&self) {
        self.l2cap.set_channel_receive_event(&self.interrupt, None);
        self.l2cap.set_disconnect_handler(&self.device, None);
        self.l2cap.close_device(&self.device);
    }

    /// Drop the baseband link.
    pub async fn disconnect(&self) {
        if let Err(e) = self.l2cap.hci().disconnect(self.device.handle()).await {
            info!(target: "wiimote", "Disconnect of {} failed: {}", self.address(), e);
        }
    }

    async fn send(&self, id: u8, payload: &[u8]) -> Result<()> {
        let rumble = lock(&self.modes).rumble;
        let packet = protocol::output_report(id, payload, rumble);
        self.l2cap.send_channel(&self.interrupt, &packet).await
    }

    pub async fn set_leds(&self, leds: u8) -> Result<()> {
        self.send(output::LEDS, &[leds]).await
    }

    /// Start or stop the motor. Ignored while the motor is disabled in the
    /// system settings.
    pub async fn set_rumble(&self, on: bool) -> Result<()> {
        if on && !self.config.motor_enabled {
            debug!(target: "wiimote", "Rumble disabled in system settings");
        }
        let on = on && self.config.motor_enabled;
        lock(&self.modes).rumble = on;
        self.send(output::RUMBLE, &[0x00]).await
    }

    pub async fn request_status(&self) -> Result<()> {
        self.send(output::STATUS_REQUEST, &[0x00]).await
    }

    /// Write up to 16 bytes of controller memory.
    pub async fn write_memory(&self, address: u32, data: &[u8]) -> Result<()> {
        let payload = protocol::write_memory(address, data)?;
        self.send(output::WRITE_MEMORY, &payload).await
    }

    /// Ask for `size` bytes; they arrive as read data reports.
    pub async fn read_memory(&self, address: u32, size: u16) -> Result<()> {
        self.send(output::READ_MEMORY, &protocol::read_memory(address, size))
            .await
    }

    /// Select a reporting mode. Nothing is sent when `mode` is already
    /// selected. With `update_ir_mode` the camera format follows the mode.
    ///
    /// The mode counts as selected only once its output went out.
    pub async fn set_report(&self, mode: u8, update_ir_mode: bool) -> Result<()> {
        let current = lock(&self.modes).report_mode;
        if current != mode {
            debug!(target: "wiimote", "Slot {} report mode {:#04x}", self.slot, mode);
            self.send(output::REPORT_MODE, &[0x00, mode]).await?;
            lock(&self.modes).report_mode = mode;
        }

        if !update_ir_mode {
            return Ok(());
        }
        let ir_mode = protocol::ir_format(mode).register_value();
        let current = lock(&self.modes).ir_mode;
        if current != Some(ir_mode) {
            self.write_memory(register::IR_MODE, &[ir_mode]).await?;
            lock(&self.modes).ir_mode = Some(ir_mode);
        }
        Ok(())
    }

    fn sensitivity(&self) -> usize {
        let index = self.config.ir_sensitivity as usize;
        if index < SENSITIVITY.len() {
            index
        } else {
            error!(target: "wiimote", "Invalid IR sensitivity {}", self.config.ir_sensitivity);
            DEFAULT_SENSITIVITY
        }
    }

    async fn initialize_ir_camera(&self) -> Result<()> {
        self.send(output::IR_CLOCK, &[0x04]).await?;
        self.send(output::IR_ENABLE, &[0x04]).await?;
        self.write_memory(register::IR_CONTROL, &[0x08]).await?;
        // The camera ignores its program until it has settled.
        tokio::time::sleep(self.config.ir_settle_delay).await;

        let program = &SENSITIVITY[self.sensitivity()];
        self.write_memory(register::IR_BLOCK1, &program[..9]).await?;
        self.write_memory(register::IR_BLOCK2, &program[9..]).await?;
        tokio::time::sleep(self.config.ir_settle_delay).await;

        let mode = self.report_mode();
        self.set_report(mode, true).await?;
        self.write_memory(register::IR_CONTROL, &[0x08]).await
    }

    async fn initialize_extension(&self) -> Result<()> {
        self.write_memory(register::EXTENSION_INIT1, &[0x55]).await?;
        self.write_memory(register::EXTENSION_INIT2, &[0x00]).await?;
        self.read_memory(register::EXTENSION_ID, 6).await
    }

    fn on_input(self: &Arc<Self>, channel: &Arc<Channel>) {
        let mut packet = [0u8; MAX_INPUT];
        loop {
            match channel.try_receive(&mut packet) {
                Ok(Some(n)) if !(3..=MAX_INPUT).contains(&n) => {
                    error!(target: "wiimote", "Data drop detected ({} bytes)", n);
                }
                Ok(Some(n)) => self.handle_input(&packet[..n]),
                Ok(None) | Err(_) => break,
            }
        }
    }

    fn handle_input(self: &Arc<Self>, packet: &[u8]) {
        if packet[0] != protocol::INPUT_REPORT {
            error!(target: "wiimote", "Unknown HID transaction {:#04x}", packet[0]);
            return;
        }
        let (id, body) = (packet[1], &packet[2..]);
        match id {
            input::STATUS => self.on_status(body),
            input::READ_DATA => self.on_read_data(body),
            input::ACKNOWLEDGE => {
                debug!(target: "wiimote", "Slot {} acknowledged output {:02X?}", self.slot, body.get(2..4));
            }
            id if report::is_data(id) => self.on_data_report(id, body),
            _ => error!(target: "wiimote", "Unhandled report {:#04x}", id),
        }
    }

    fn on_status(self: &Arc<Self>, body: &[u8]) {
        let Some(status) = StatusReport::parse(body) else {
            error!(target: "wiimote", "Status report too small ({} bytes)", body.len());
            return;
        };
        {
            let mut raw = lock(&self.raw);
            raw.core_buttons = status.buttons;
            raw.flags = status.flags;
            raw.battery = status.battery;
        }

        let plugged = status.extension_connected();
        let hotplug = {
            let mut modes = lock(&self.modes);
            let changed = modes.extension != plugged;
            modes.extension = plugged;
            changed.then_some(plugged)
        };

        // The controller stops reporting after a status report.
        let hid = self.clone();
        tokio::spawn(async move {
            if let Err(e) = hid.after_status(hotplug).await {
                error!(target: "wiimote", "Slot {} status handling failed: {}", hid.slot, e);
            }
        });
    }

    async fn after_status(&self, hotplug: Option<bool>) -> Result<()> {
        let previous = std::mem::take(&mut lock(&self.modes).report_mode);
        let result = self.reselect_report(hotplug, previous).await;
        if result.is_err() {
            // Keep the mode for the next status report, and retry the
            // extension change with it.
            let mut modes = lock(&self.modes);
            if modes.report_mode == 0 {
                modes.report_mode = previous;
            }
            if let Some(plugged) = hotplug {
                modes.extension = !plugged;
            }
        }
        result
    }

    async fn reselect_report(&self, hotplug: Option<bool>, previous: u8) -> Result<()> {
        match hotplug {
            Some(true) => {
                info!(target: "wiimote", "Slot {} extension connected", self.slot);
                self.initialize_extension().await?;
                self.set_report(report::BUTTONS_ACCEL_IR10_EXT6, true).await
            }
            Some(false) => {
                info!(target: "wiimote", "Slot {} extension removed", self.slot);
                lock(&self.raw).extension = ExtensionType::None;
                self.set_report(report::BUTTONS_ACCEL_IR12, true).await
            }
            None if previous == 0 => Ok(()),
            None => self.set_report(previous, false).await,
        }
    }

    fn on_read_data(&self, body: &[u8]) {
        let Some(read) = ReadData::parse(body) else {
            error!(target: "wiimote", "Read data report too small ({} bytes)", body.len());
            return;
        };
        if read.error != 0 {
            error!(
                target: "wiimote",
                "Memory read at {:#06x} failed with error {}",
                read.address_low,
                read.error
            );
            return;
        }
        if read.data.len() < read.size {
            error!(
                target: "wiimote",
                "Read of {} bytes carries only {}",
                read.size,
                read.data.len()
            );
        }

        if read.is_for(register::CALIBRATION) {
            match Calibration::from_block(&read.data) {
                Some(calibration) => {
                    debug!(target: "wiimote", "Slot {} calibration {:?}", self.slot, calibration);
                    lock(&self.raw).calibration = calibration;
                }
                None => info!(target: "wiimote", "Slot {} keeps default calibration", self.slot),
            }
        } else if read.is_for(register::EXTENSION_ID) {
            let Ok(id) = <[u8; 6]>::try_from(read.data.as_slice()) else {
                error!(target: "wiimote", "Extension id of {} bytes", read.data.len());
                return;
            };
            let kind = ExtensionType::from_id(&id);
            info!(target: "wiimote", "Slot {} extension: {}", self.slot, kind.name());
            lock(&self.raw).extension = kind;
        } else {
            info!(target: "wiimote", "Unexpected memory read at {:#06x}", read.address_low);
        }
    }

    fn on_data_report(&self, id: u8, body: &[u8]) {
        let length = report::length(id);
        if body.len() < length {
            error!(
                target: "wiimote",
                "Report {:#04x} too small ({} of {} bytes)",
                id,
                body.len(),
                length
            );
            return;
        }
        lock(&self.raw).store_report(id, &body[..length]);
    }
}
