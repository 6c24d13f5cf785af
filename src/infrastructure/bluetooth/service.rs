//! Controller Registry
//!
//! Coordinates discovery and connection requests with the registered
//! controller drivers. A worker task serializes the work: for every device
//! found by an inquiry it asks for the remote name and offers the device to
//! each driver in registration order; for every incoming connection request
//! it looks for a driver that knows the device as paired.

use crate::domain::models::DiscoveredDevice;
use crate::error::{BtError, Result};
use crate::infrastructure::bluetooth::hci::{ConnectionRequestHandler, Hci};
use crate::infrastructure::bluetooth::protocol::{GIAC_LAP, REASON_UNACCEPTABLE_BD_ADDR};
use crate::infrastructure::bluetooth::scanner::{Scanner, RESTART_DELAY};
use crate::infrastructure::lock;
use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Depth of the worker queue. Messages beyond it are dropped.
pub const WORKER_QUEUE_DEPTH: usize = 5;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opaque per-device state returned by a driver.
pub type DriverInstance = Arc<dyn Any + Send + Sync>;

/// A driver for one family of Bluetooth controllers.
pub trait BluetoothDriver: Send + Sync {
    /// Unique driver id.
    fn id(&self) -> u16;

    fn name(&self) -> &str;

    /// Does this driver handle a device found by an inquiry?
    fn filter_inquiry(&self, device: &DiscoveredDevice, name: &str) -> bool;

    /// Does this driver know the device asking to connect?
    fn filter_paired(&self, device: &DiscoveredDevice) -> bool;

    /// Connect to and set up a freshly discovered device.
    fn initialize_new<'a>(&'a self, device: &'a DiscoveredDevice) -> BoxFuture<'a, Option<DriverInstance>>;

    /// Accept and set up a paired device that connected to us.
    fn initialize_paired<'a>(
        &'a self,
        device: &'a DiscoveredDevice,
    ) -> BoxFuture<'a, Option<DriverInstance>>;

    /// Release an instance returned by one of the initializers.
    fn free(&self, instance: DriverInstance);
}

/// A live driver instance.
#[derive(Clone)]
pub struct ActiveDriver {
    pub driver_id: u16,
    pub instance: DriverInstance,
}

pub(crate) enum WorkerMessage {
    StartDiscovery,
    Discovered(DiscoveredDevice),
    DiscoveryEnd(u8),
    DiscoveryError(BtError),
    ConnectionRequest(DiscoveredDevice),
}

/// Registry of controller drivers bound to one host controller.
pub struct DriverRegistry {
    hci: Arc<Hci>,
    drivers: Mutex<Vec<Arc<dyn BluetoothDriver>>>,
    active: Mutex<Vec<ActiveDriver>>,
    pub(crate) scanner: Scanner,
    sender: mpsc::Sender<WorkerMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DriverRegistry {
    /// Create the registry, start its worker and take over connection requests.
    pub fn new(hci: Arc<Hci>) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(WORKER_QUEUE_DEPTH);
        let registry = Arc::new(Self {
            hci,
            drivers: Mutex::new(Vec::new()),
            active: Mutex::new(Vec::new()),
            scanner: Scanner::new(),
            sender,
            worker: Mutex::new(None),
        });

        let worker = tokio::spawn(Self::worker(Arc::downgrade(&registry), receiver));
        *lock(&registry.worker) = Some(worker);

        let sender = registry.sender.clone();
        let on_request: ConnectionRequestHandler = Arc::new(move |device: DiscoveredDevice| {
            Self::post(&sender, WorkerMessage::ConnectionRequest(device));
        });
        registry
            .hci
            .set_connection_request_handler(Some(on_request));

        registry
    }

    pub(crate) fn post(sender: &mpsc::Sender<WorkerMessage>, message: WorkerMessage) {
        if sender.try_send(message).is_err() {
            warn!(target: "bltools", "Worker queue full; dropping message");
        }
    }

    pub(crate) fn sender(&self) -> &mpsc::Sender<WorkerMessage> {
        &self.sender
    }

    pub fn hci(&self) -> &Arc<Hci> {
        &self.hci
    }

    /// Add a driver. Ids must be unique.
    pub fn register_driver(&self, driver: Arc<dyn BluetoothDriver>) -> Result<()> {
        let mut drivers = lock(&self.drivers);
        if drivers.iter().any(|d| d.id() == driver.id()) {
            return Err(BtError::argument(format!(
                "driver id {:#06x} already registered",
                driver.id()
            )));
        }
        info!(target: "bltools", "Registered driver {} ({:#06x})", driver.name(), driver.id());
        drivers.push(driver);
        Ok(())
    }

    pub fn find_driver_by_id(&self, id: u16) -> Option<Arc<dyn BluetoothDriver>> {
        lock(&self.drivers).iter().find(|d| d.id() == id).cloned()
    }

    /// First driver, in registration order, whose inquiry filter accepts the device.
    pub fn find_compatible_driver(
        &self,
        device: &DiscoveredDevice,
        name: &str,
    ) -> Option<Arc<dyn BluetoothDriver>> {
        lock(&self.drivers)
            .iter()
            .find(|d| d.filter_inquiry(device, name))
            .cloned()
    }

    fn find_paired_driver(&self, device: &DiscoveredDevice) -> Option<Arc<dyn BluetoothDriver>> {
        lock(&self.drivers)
            .iter()
            .find(|d| d.filter_paired(device))
            .cloned()
    }

    /// Set up `device` with `driver` and track the instance.
    pub async fn load_driver(
        &self,
        driver: &Arc<dyn BluetoothDriver>,
        device: &DiscoveredDevice,
    ) -> Result<DriverInstance> {
        let instance = driver
            .initialize_new(device)
            .await
            .ok_or(BtError::DriverInitFail(driver.id()))?;
        self.track(driver.id(), instance.clone());
        Ok(instance)
    }

    /// Find a driver for `device` and set it up.
    pub async fn load_compatible_driver(
        &self,
        device: &DiscoveredDevice,
        name: &str,
    ) -> Result<DriverInstance> {
        let driver = self
            .find_compatible_driver(device, name)
            .ok_or_else(|| BtError::NoDriverFound(format!("{} \"{}\"", device.address, name)))?;
        self.load_driver(&driver, device).await
    }

    fn track(&self, driver_id: u16, instance: DriverInstance) {
        lock(&self.active).push(ActiveDriver {
            driver_id,
            instance,
        });
    }

    /// Stop tracking `instance` once its link is gone. Returns whether it
    /// was tracked.
    pub fn untrack(&self, instance: &DriverInstance) -> bool {
        let mut active = lock(&self.active);
        let before = active.len();
        active.retain(|entry| !same_instance(&entry.instance, instance));
        active.len() != before
    }

    pub fn active_drivers(&self) -> Vec<ActiveDriver> {
        lock(&self.active).clone()
    }

    /// Release every active instance through its driver.
    pub fn free_all(&self) {
        let active: Vec<_> = lock(&self.active).drain(..).collect();
        for entry in active {
            match self.find_driver_by_id(entry.driver_id) {
                Some(driver) => driver.free(entry.instance),
                None => error!(target: "bltools", "No driver {:#06x} to free an instance", entry.driver_id),
            }
        }
    }

    /// Stop the worker, stop discovery and free every instance.
    pub fn close(&self) {
        self.scanner.stop();
        if let Some(worker) = lock(&self.worker).take() {
            worker.abort();
        }
        self.hci.set_connection_request_handler(None);
        self.free_all();
    }

    async fn worker(registry: Weak<Self>, mut receiver: mpsc::Receiver<WorkerMessage>) {
        while let Some(message) = receiver.recv().await {
            let Some(registry) = registry.upgrade() else { break };
            match message {
                WorkerMessage::StartDiscovery => registry.start_inquiry().await,
                WorkerMessage::Discovered(device) => registry.on_discovered(device).await,
                WorkerMessage::DiscoveryEnd(status) => {
                    debug!(target: "bltools", "Inquiry ended with status {:#04x}", status);
                    registry.after_inquiry();
                }
                WorkerMessage::DiscoveryError(e) => {
                    info!(target: "bltools", "Discovery failed: {}", e);
                    registry.after_inquiry();
                }
                WorkerMessage::ConnectionRequest(device) => registry.on_connection_request(device).await,
            }
        }
        debug!(target: "bltools", "Worker stopped");
    }

    async fn start_inquiry(&self) {
        let Some(length) = self.scanner.next_inquiry() else {
            return;
        };

        let found = self.sender.clone();
        let done = self.sender.clone();
        let result = self
            .hci
            .begin_discovery(
                GIAC_LAP,
                length,
                0,
                move |device| Self::post(&found, WorkerMessage::Discovered(*device)),
                move |status| Self::post(&done, WorkerMessage::DiscoveryEnd(status)),
            )
            .await;

        if let Err(e) = result {
            Self::post(&self.sender, WorkerMessage::DiscoveryError(e));
        }
    }

    fn after_inquiry(&self) {
        if !self.scanner.inquiry_finished() {
            info!(target: "bltools", "Automatic discovery finished");
            return;
        }
        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RESTART_DELAY).await;
            Self::post(&sender, WorkerMessage::StartDiscovery);
        });
    }

    async fn on_discovered(&self, device: DiscoveredDevice) {
        let name = match self.hci.get_remote_name(&device).await {
            Ok(name) => name,
            Err(e) => {
                info!(target: "bltools", "No name for {}: {}", device.address, e);
                String::new()
            }
        };

        let Some(driver) = self.find_compatible_driver(&device, &name) else {
            debug!(target: "bltools", "No driver for {} \"{}\"", device.address, name);
            return;
        };

        info!(target: "bltools", "{} \"{}\" handled by {}", device.address, name, driver.name());
        if let Err(e) = self.load_driver(&driver, &device).await {
            info!(target: "bltools", "Driver {} failed on {}: {}", driver.name(), device.address, e);
        }
    }

    async fn on_connection_request(&self, device: DiscoveredDevice) {
        let Some(driver) = self.find_paired_driver(&device) else {
            info!(target: "bltools", "Rejecting unknown device {}", device.address);
            if let Err(e) = self
                .hci
                .reject_connection(&device, REASON_UNACCEPTABLE_BD_ADDR)
                .await
            {
                info!(target: "bltools", "Reject of {} failed: {}", device.address, e);
            }
            return;
        };

        info!(target: "bltools", "Paired device {} handled by {}", device.address, driver.name());
        match driver.initialize_paired(&device).await {
            Some(instance) => self.track(driver.id(), instance),
            None => info!(target: "bltools", "Driver {} could not attach {}", driver.name(), device.address),
        }
    }
}

fn same_instance(a: &DriverInstance, b: &DriverInstance) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

/// Seconds in a `Duration`, for log lines.
pub(crate) fn secs(duration: Duration) -> f32 {
    duration.as_secs_f32()
}
