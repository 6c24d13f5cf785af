//! Bring-up and teardown of the whole stack from [`Settings`].

use crate::domain::controller::ControllerState;
use crate::domain::settings::Settings;
use crate::domain::sys_config::{ConfigStore, JsonConfigStore, MemoryConfigStore};
use crate::error::Result;
use crate::infrastructure::bluetooth::hci::Hci;
use crate::infrastructure::bluetooth::l2cap::L2cap;
use crate::infrastructure::bluetooth::service::DriverRegistry;
use crate::infrastructure::transport::HostInterface;
use crate::infrastructure::wiimote::{self, WiimoteDriver, MAX_CONTROLLERS};
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Controller records named by `settings.config_store_path`, or an empty
/// store when none is configured.
pub fn config_store(settings: &Settings) -> anyhow::Result<Box<dyn ConfigStore>> {
    match &settings.config_store_path {
        Some(path) => {
            let store = JsonConfigStore::load(Path::new(path))
                .with_context(|| format!("loading controller records from {}", path))?;
            Ok(Box::new(store))
        }
        None => Ok(Box::new(MemoryConfigStore::new())),
    }
}

pub struct BluetoothStack {
    hci: Arc<Hci>,
    l2cap: Arc<L2cap>,
    registry: Arc<DriverRegistry>,
    wiimotes: Arc<WiimoteDriver>,
}

impl BluetoothStack {
    /// Open the host controller, start L2CAP and the driver registry, and
    /// page every registered Wiimote.
    pub async fn start(
        host: &dyn HostInterface,
        settings: &Settings,
        store: &dyn ConfigStore,
    ) -> Result<Self> {
        let hci = Hci::initialize(host, &settings.device_path, settings.into()).await?;
        let l2cap = L2cap::initialize(hci.clone(), settings.into())?;
        let registry = DriverRegistry::new(hci.clone());
        let wiimotes = wiimote::install(&registry, l2cap.clone(), store, settings)?;

        let connected = wiimotes.connect_registered(&registry).await;
        info!(target: "bltools", "Stack up, {} registered controller(s) connected", connected);

        Ok(Self {
            hci,
            l2cap,
            registry,
            wiimotes,
        })
    }

    /// Look for new controllers for the configured discovery duration.
    pub fn begin_discovery(&self, settings: &Settings) -> Result<()> {
        self.registry
            .begin_automatic_discovery(settings.discovery_duration())
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    pub fn wiimotes(&self) -> &Arc<WiimoteDriver> {
        &self.wiimotes
    }

    /// Decode the latest reports and return every slot's state.
    pub fn poll(&self) -> [ControllerState; MAX_CONTROLLERS] {
        let system = self.wiimotes.system();
        system.poll();
        system.states()
    }

    pub async fn shutdown(self) {
        self.registry.close();
        self.l2cap.close();
        self.hci.close().await;
        info!(target: "bltools", "Stack shut down");
    }
}
