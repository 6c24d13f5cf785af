//! Wiimote Driver
//!
//! Binds Nintendo Wiimotes to up to four controller slots.
//!
//! ## Flow
//!
//! 1. The registry offers a discovered or paired device to [`WiimoteDriver`]
//! 2. The driver reserves a slot, brings up the ACL link and both L2CAP channels
//! 3. [`WiimoteHid`] configures the controller and collects its reports
//! 4. [`WiimoteSystem::poll`] decodes the latest reports into [`ControllerState`]
//!
//! ## Modules
//!
//! - [`protocol`] - Report ids, registers and packet layouts
//! - [`decoder`] - Data report decoding
//! - [`hid`] - One connected controller

pub mod decoder;
pub mod hid;
pub mod protocol;

pub use hid::WiimoteHid;

use crate::domain::controller::ControllerState;
use crate::domain::cursor::Point;
use crate::domain::models::{BdAddr, ConnectionStatus, DiscoveredDevice};
use crate::domain::settings::Settings;
use crate::domain::sys_config::{ConfigStore, SensorBarPosition, WiimoteSysConfig};
use crate::error::Result;
use crate::infrastructure::bluetooth::l2cap::{Channel, DisconnectCallback, L2cap, L2capDevice};
use crate::infrastructure::bluetooth::service::{
    BluetoothDriver, BoxFuture, DriverInstance, DriverRegistry,
};
use crate::infrastructure::lock;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const MAX_CONTROLLERS: usize = 4;
pub const DRIVER_ID: u16 = 1;

/// Tunables for controller bring-up.
#[derive(Debug, Clone)]
pub struct WiimoteConfig {
    /// Pause before each outgoing channel open.
    pub channel_open_delay: Duration,
    /// Pause between IR camera programming steps.
    pub ir_settle_delay: Duration,
    /// Index into the camera sensitivity table.
    pub ir_sensitivity: u32,
    pub sensor_bar: SensorBarPosition,
    pub motor_enabled: bool,
}

impl Default for WiimoteConfig {
    fn default() -> Self {
        Self {
            channel_open_delay: Duration::from_millis(500),
            ir_settle_delay: Duration::from_millis(50),
            ir_sensitivity: protocol::DEFAULT_SENSITIVITY as u32,
            sensor_bar: SensorBarPosition::Bottom,
            motor_enabled: true,
        }
    }
}

impl WiimoteConfig {
    pub fn from_settings(settings: &Settings, sys: &WiimoteSysConfig) -> Self {
        Self {
            channel_open_delay: Duration::from_millis(settings.channel_open_delay_ms),
            ir_settle_delay: Duration::from_millis(settings.ir_settle_delay_ms),
            ir_sensitivity: sys.ir_sensitivity,
            sensor_bar: sys.sensor_bar,
            motor_enabled: sys.motor_enabled,
        }
    }
}

#[derive(Clone)]
enum Slot {
    Free,
    /// Taken while a connection is being set up.
    Reserved(BdAddr),
    Active(Arc<WiimoteHid>),
}

impl Slot {
    fn address(&self) -> Option<BdAddr> {
        match self {
            Self::Free => None,
            Self::Reserved(address) => Some(*address),
            Self::Active(hid) => Some(hid.address()),
        }
    }
}

/// The four controller slots and their decoded state.
pub struct WiimoteSystem {
    slots: Mutex<Vec<Slot>>,
    states: Mutex<[ControllerState; MAX_CONTROLLERS]>,
    bar_offset: Point,
}

impl WiimoteSystem {
    pub fn new(sensor_bar: SensorBarPosition) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(vec![Slot::Free; MAX_CONTROLLERS]),
            states: Mutex::new(Default::default()),
            bar_offset: sensor_bar.cursor_offset(),
        })
    }

    /// Whether `address` already holds a slot.
    pub fn contains(&self, address: BdAddr) -> bool {
        lock(&self.slots)
            .iter()
            .any(|slot| slot.address() == Some(address))
    }

    fn reserve(&self, address: BdAddr) -> Option<usize> {
        let mut slots = lock(&self.slots);
        if slots.iter().any(|slot| slot.address() == Some(address)) {
            return None;
        }
        let index = slots.iter().position(|slot| matches!(slot, Slot::Free))?;
        slots[index] = Slot::Reserved(address);
        lock(&self.states)[index].status = ConnectionStatus::Connecting;
        Some(index)
    }

    fn activate(&self, hid: Arc<WiimoteHid>) {
        let index = hid.slot();
        lock(&self.slots)[index] = Slot::Active(hid);
        let mut states = lock(&self.states);
        states[index] = ControllerState::default();
        states[index].status = ConnectionStatus::Connected;
    }

    /// Free the slot of `hid` if it still holds that session.
    fn release_session(&self, hid: &Arc<WiimoteHid>, status: ConnectionStatus) -> bool {
        let index = hid.slot();
        let mut slots = lock(&self.slots);
        match &slots[index] {
            Slot::Active(active) if Arc::ptr_eq(active, hid) => {}
            _ => return false,
        }
        slots[index] = Slot::Free;
        let mut states = lock(&self.states);
        states[index] = ControllerState::default();
        states[index].status = status;
        true
    }

    /// Free `index` if it still belongs to `address`.
    fn release(&self, index: usize, address: BdAddr, status: ConnectionStatus) -> bool {
        let mut slots = lock(&self.slots);
        if slots[index].address() != Some(address) {
            return false;
        }
        slots[index] = Slot::Free;
        let mut states = lock(&self.states);
        states[index] = ControllerState::default();
        states[index].status = status;
        true
    }

    /// Decode the latest reports of every connected controller.
    pub fn poll(&self) {
        let active: Vec<Arc<WiimoteHid>> = lock(&self.slots)
            .iter()
            .filter_map(|slot| match slot {
                Slot::Active(hid) => Some(hid.clone()),
                _ => None,
            })
            .collect();

        for hid in active {
            let raw = hid.snapshot();
            let mut states = lock(&self.states);
            decoder::decode(&raw, &mut states[hid.slot()], self.bar_offset);
        }
    }

    pub fn state(&self, index: usize) -> Option<ControllerState> {
        lock(&self.states).get(index).cloned()
    }

    pub fn states(&self) -> [ControllerState; MAX_CONTROLLERS] {
        lock(&self.states).clone()
    }

    pub fn controller(&self, index: usize) -> Option<Arc<WiimoteHid>> {
        match lock(&self.slots).get(index) {
            Some(Slot::Active(hid)) => Some(hid.clone()),
            _ => None,
        }
    }
}

/// Registry driver for Wiimotes.
pub struct WiimoteDriver {
    l2cap: Arc<L2cap>,
    system: Arc<WiimoteSystem>,
    config: WiimoteConfig,
    sys: WiimoteSysConfig,
    /// Told when a tracked session loses its link.
    registry: Mutex<Weak<DriverRegistry>>,
}

impl WiimoteDriver {
    pub fn new(l2cap: Arc<L2cap>, config: WiimoteConfig, sys: WiimoteSysConfig) -> Arc<Self> {
        Arc::new(Self {
            l2cap,
            system: WiimoteSystem::new(config.sensor_bar),
            config,
            sys,
            registry: Mutex::new(Weak::new()),
        })
    }

    /// Report lost links to `registry` so it stops tracking their sessions.
    pub fn bind(&self, registry: &Arc<DriverRegistry>) {
        *lock(&self.registry) = Arc::downgrade(registry);
    }

    pub fn system(&self) -> &Arc<WiimoteSystem> {
        &self.system
    }

    /// Page every registered controller that is not connected yet.
    ///
    /// Returns how many came up.
    pub async fn connect_registered(self: &Arc<Self>, registry: &Arc<DriverRegistry>) -> usize {
        self.bind(registry);
        let driver: Arc<dyn BluetoothDriver> = self.clone();
        let mut connected = 0;
        for paired in &self.sys.registered {
            if self.system.contains(paired.mac) {
                continue;
            }
            let device = DiscoveredDevice::from_address(paired.mac);
            match registry.load_driver(&driver, &device).await {
                Ok(_) => connected += 1,
                Err(e) => info!(target: "wiimote", "Registered {} \"{}\" not reachable: {}", paired.mac, paired.name, e),
            }
        }
        connected
    }

    async fn attach(&self, device: &DiscoveredDevice, incoming: bool) -> Option<DriverInstance> {
        let address = device.address;
        let Some(index) = self.system.reserve(address) else {
            warn!(target: "wiimote", "No free slot for {}", address);
            return None;
        };

        match self.connect(index, device, incoming).await {
            Ok(hid) => {
                info!(target: "wiimote", "{} ready in slot {}", address, index);
                self.system.activate(hid.clone());
                Some(hid as DriverInstance)
            }
            Err(e) => {
                if e.is_connection_failure() {
                    info!(target: "wiimote", "Could not attach {}: {}", address, e);
                } else {
                    error!(target: "wiimote", "Could not attach {}: {}", address, e);
                }
                self.system
                    .release(index, address, ConnectionStatus::Error);
                None
            }
        }
    }

    async fn connect(
        &self,
        index: usize,
        device: &DiscoveredDevice,
        incoming: bool,
    ) -> Result<Arc<WiimoteHid>> {
        let hci = self.l2cap.hci();
        let handle = if incoming {
            hci.accept_connection(device, true).await?
        } else {
            hci.create_connection(device).await?
        };

        let (l2cap_device, control, interrupt) = match self.open_device(handle, device.address).await {
            Ok(opened) => opened,
            Err(e) => {
                self.drop_link(handle).await;
                return Err(e);
            }
        };

        let hid = WiimoteHid::new(
            index,
            self.l2cap.clone(),
            l2cap_device.clone(),
            control,
            interrupt,
            self.config.clone(),
        );
        self.install_disconnect_handler(&hid);

        let ready = if incoming {
            hid.await_channels().await
        } else {
            hid.open_channels().await
        };
        let ready = match ready {
            Ok(()) => hid.setup().await,
            Err(e) => Err(e),
        };
        if let Err(e) = ready {
            hid.close();
            self.drop_link(handle).await;
            return Err(e);
        }
        Ok(hid)
    }

    async fn open_device(
        &self,
        handle: u16,
        address: BdAddr,
    ) -> Result<(Arc<L2capDevice>, Arc<Channel>, Arc<Channel>)> {
        let (control, interrupt) = WiimoteHid::declare_channels(&self.l2cap)?;
        let device = self
            .l2cap
            .open_device(handle, address, vec![control.clone(), interrupt.clone()])
            .await?;
        Ok((device, control, interrupt))
    }

    async fn drop_link(&self, handle: u16) {
        if let Err(e) = self.l2cap.hci().disconnect(handle).await {
            debug!(target: "wiimote", "Disconnect of {:#05x} failed: {}", handle, e);
        }
    }

    fn install_disconnect_handler(&self, hid: &Arc<WiimoteHid>) {
        let index = hid.slot();
        let system: Weak<WiimoteSystem> = Arc::downgrade(&self.system);
        let registry = lock(&self.registry).clone();
        let session = Arc::downgrade(hid);
        let on_disconnect: DisconnectCallback = Arc::new(move |device: &Arc<L2capDevice>, reason: u8| {
            if let Some(system) = system.upgrade() {
                if system.release(index, device.mac(), ConnectionStatus::Disconnected) {
                    info!(target: "wiimote", "Slot {} freed ({} left, reason {:#04x})", index, device.mac(), reason);
                }
            }
            if let (Some(registry), Some(hid)) = (registry.upgrade(), session.upgrade()) {
                let instance: DriverInstance = hid;
                if registry.untrack(&instance) {
                    debug!(target: "wiimote", "Slot {} session dropped from the registry", index);
                }
            }
        });
        self.l2cap
            .set_disconnect_handler(hid.device(), Some(on_disconnect));
    }
}

impl BluetoothDriver for WiimoteDriver {
    fn id(&self) -> u16 {
        DRIVER_ID
    }

    fn name(&self) -> &str {
        "Wiimote"
    }

    fn filter_inquiry(&self, device: &DiscoveredDevice, name: &str) -> bool {
        protocol::is_wiimote(device.class_of_device, name) && !self.system.contains(device.address)
    }

    fn filter_paired(&self, device: &DiscoveredDevice) -> bool {
        self.sys.is_registered(device.address) && !self.system.contains(device.address)
    }

    fn initialize_new<'a>(&'a self, device: &'a DiscoveredDevice) -> BoxFuture<'a, Option<DriverInstance>> {
        Box::pin(self.attach(device, false))
    }

    fn initialize_paired<'a>(
        &'a self,
        device: &'a DiscoveredDevice,
    ) -> BoxFuture<'a, Option<DriverInstance>> {
        Box::pin(self.attach(device, true))
    }

    fn free(&self, instance: DriverInstance) {
        let Ok(hid) = instance.downcast::<WiimoteHid>() else {
            error!(target: "wiimote", "Asked to free a foreign instance");
            return;
        };
        if !self
            .system
            .release_session(&hid, ConnectionStatus::Disconnected)
        {
            // Link already lost; the slot may belong to a newer session.
            debug!(target: "wiimote", "Slot {} no longer holds {}; nothing to free", hid.slot(), hid.address());
            return;
        }
        hid.close();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { hid.disconnect().await });
            }
            Err(_) => debug!(target: "wiimote", "No runtime to disconnect {}", hid.address()),
        }
    }
}

/// Create the Wiimote driver from the stored settings and register it.
pub fn install(
    registry: &Arc<DriverRegistry>,
    l2cap: Arc<L2cap>,
    store: &dyn ConfigStore,
    settings: &Settings,
) -> Result<Arc<WiimoteDriver>> {
    let sys = WiimoteSysConfig::load(store);
    let config = WiimoteConfig::from_settings(settings, &sys);
    let driver = WiimoteDriver::new(l2cap, config, sys);
    driver.bind(registry);
    registry.register_driver(driver.clone())?;
    Ok(driver)
}
