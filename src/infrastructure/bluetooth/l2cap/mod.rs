//! L2CAP Layer
//!
//! Multiplexes channels over the ACL links of the HCI driver.
//!
//! ## Receive path
//!
//! ```text
//!  HCI ACL reader ──(slot 0/1)──► L2CAP task ──► device reassembly ──► channel FIFO
//!                                     │                                   │
//!                                     ▼                                   ▼
//!                            signalling (cid 1)               receive event callback
//! ```
//!
//! Two receive buffers are kept armed on the HCI driver. The task processes
//! one, then hands it back, so fragments of a link are reassembled in the
//! order the controller delivered them.
//!
//! ## Modules
//!
//! - [`channel`] - Channel status flags and packet FIFO
//! - [`device`] - Per-link channel list and fragment reassembly
//! - [`signal`] - Signalling PDU layouts
//! - `signalling` - Open/configure/disconnect state machine

pub mod channel;
pub mod device;
pub mod signal;
mod signalling;

pub use channel::{status, Channel, ChannelEvent, ChannelFifo, ChannelStatus};
pub use device::{DisconnectCallback, L2capDevice};

use crate::domain::models::BdAddr;
use crate::domain::settings::Settings;
use crate::error::{BtError, Result};
use crate::infrastructure::bluetooth::hci::{DisconnectionHandler, Hci};
use crate::infrastructure::bluetooth::protocol::{AclHeader, BroadcastFlag, PacketBoundary};
use crate::infrastructure::lock;
use signal::Signal;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// L2CAP configuration
#[derive(Debug, Clone)]
pub struct L2capConfig {
    /// How long a channel open waits for each status change.
    pub signal_timeout: Duration,
    /// ACL receive buffers kept armed on the HCI driver.
    pub receive_slots: usize,
}

impl Default for L2capConfig {
    fn default() -> Self {
        Self {
            signal_timeout: Duration::from_secs(1),
            receive_slots: 2,
        }
    }
}

impl From<&Settings> for L2capConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            signal_timeout: Duration::from_millis(settings.signal_timeout_ms),
            ..Default::default()
        }
    }
}

/// An ACL packet that arrived before its device was opened.
struct FloatingPacket {
    handle: u16,
    pb: PacketBoundary,
    bc: BroadcastFlag,
    payload: Vec<u8>,
}

struct AclSlot {
    buffer: Vec<u8>,
    result: Result<usize>,
}

/// Handle on the L2CAP layer of one host controller.
pub struct L2cap {
    hci: Arc<Hci>,
    config: L2capConfig,
    devices: Mutex<Vec<Option<Arc<L2capDevice>>>>,
    floating: Mutex<Option<FloatingPacket>>,
    /// Held while a received packet is routed, and while a device is
    /// registered and its floating packet replayed.
    receive_gate: tokio::sync::Mutex<()>,
    acl_out: tokio::sync::Mutex<()>,
    next_signal_id: AtomicU8,
    exit: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl L2cap {
    /// Start the receive task and take over HCI disconnection events.
    pub fn initialize(hci: Arc<Hci>, config: L2capConfig) -> Result<Arc<Self>> {
        let slots = config.receive_slots.max(1);
        let l2cap = Arc::new(Self {
            hci,
            config,
            devices: Mutex::new(Vec::new()),
            floating: Mutex::new(None),
            receive_gate: tokio::sync::Mutex::new(()),
            acl_out: tokio::sync::Mutex::new(()),
            next_signal_id: AtomicU8::new(0),
            exit: AtomicBool::new(false),
            task: Mutex::new(None),
        });

        let (tx, rx) = mpsc::channel::<AclSlot>(slots + 1);
        let task = tokio::spawn(Self::receive_task(Arc::downgrade(&l2cap), rx, tx.clone(), slots));
        *lock(&l2cap.task) = Some(task);

        let buffer_length = l2cap.hci.acl_max_packet_length() + AclHeader::SIZE;
        for _ in 0..slots {
            Self::arm(&l2cap.hci, vec![0; buffer_length], tx.clone())?;
        }

        let weak = Arc::downgrade(&l2cap);
        let on_disconnect: DisconnectionHandler = Arc::new(move |handle: u16, reason: u8| {
            if let Some(l2cap) = weak.upgrade() {
                l2cap.on_hci_disconnect(handle, reason);
            }
        });
        l2cap
            .hci
            .set_disconnection_complete_handler(Some(on_disconnect));

        info!(target: "l2cap", "L2CAP ready with {} receive slots", slots);
        Ok(l2cap)
    }

    fn arm(hci: &Hci, buffer: Vec<u8>, tx: mpsc::Sender<AclSlot>) -> Result<()> {
        hci.receive_acl_async(buffer, move |buffer, result| {
            // Runs on the HCI reader thread, outside the runtime.
            if tx.blocking_send(AclSlot { buffer, result }).is_err() {
                debug!(target: "l2cap", "Receive task gone; dropping ACL slot");
            }
        })
    }

    async fn receive_task(
        l2cap: Weak<Self>,
        mut rx: mpsc::Receiver<AclSlot>,
        tx: mpsc::Sender<AclSlot>,
        mut live_slots: usize,
    ) {
        while let Some(AclSlot { buffer, result }) = rx.recv().await {
            let Some(this) = l2cap.upgrade() else { break };
            if this.exit.load(Ordering::Acquire) {
                break;
            }

            match result {
                Ok(n) => this.handle_acl(&buffer[..n.min(buffer.len())]).await,
                Err(e) => {
                    error!(target: "l2cap", "ACL receive failed: {}", e);
                    live_slots -= 1;
                    if live_slots == 0 {
                        error!(target: "l2cap", "No ACL receive slots left");
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = Self::arm(&this.hci, buffer, tx.clone()) {
                error!(target: "l2cap", "Could not re-arm ACL receive: {}", e);
                break;
            }
        }
        debug!(target: "l2cap", "Receive task stopped");
    }

    async fn handle_acl(&self, packet: &[u8]) {
        let header = match Hci::decode_received_acl(packet) {
            Ok(header) => header,
            Err(e) => {
                error!(target: "l2cap", "Bad ACL packet: {}", e);
                return;
            }
        };
        let payload = &packet[AclHeader::SIZE..AclHeader::SIZE + header.length as usize];

        let _gate = self.receive_gate.lock().await;
        match self.find_device_by_handle(header.handle) {
            Some(device) => self.deliver(&device, header.pb, header.bc, payload).await,
            None => {
                let mut floating = lock(&self.floating);
                if floating.is_some() {
                    error!(
                        target: "l2cap",
                        "Second packet for unknown handle {:#05x}; dropping it",
                        header.handle
                    );
                    return;
                }
                debug!(target: "l2cap", "Holding packet for unknown handle {:#05x}", header.handle);
                *floating = Some(FloatingPacket {
                    handle: header.handle,
                    pb: header.pb,
                    bc: header.bc,
                    payload: payload.to_vec(),
                });
            }
        }
    }

    async fn deliver(&self, device: &Arc<L2capDevice>, pb: PacketBoundary, bc: BroadcastFlag, payload: &[u8]) {
        let Some(channel) = device.receive_fragment(pb, bc, payload) else {
            return;
        };
        if channel.source_id() == signal::SIGNAL_CID {
            self.process_signals(device).await;
        } else {
            channel.fire_receive_event();
        }
    }

    /// Stop re-arming ACL receives; the task winds down on the next packet.
    pub fn signal_close(&self) {
        self.exit.store(true, Ordering::Release);
    }

    /// Stop the receive task and drop every device.
    pub fn close(&self) {
        self.signal_close();
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        self.hci.set_disconnection_complete_handler(None);

        let devices: Vec<_> = lock(&self.devices).drain(..).flatten().collect();
        for device in devices {
            device.shutdown();
        }
        lock(&self.floating).take();
        info!(target: "l2cap", "L2CAP closed");
    }

    pub fn hci(&self) -> &Arc<Hci> {
        &self.hci
    }

    pub fn config(&self) -> &L2capConfig {
        &self.config
    }

    /// Create a channel to hand to [`Self::open_device`].
    ///
    /// `buffer_length` is the FIFO size and must be a power of two.
    pub fn initialize_channel(
        &self,
        source_id: u16,
        destination_id: u16,
        protocol_id: u16,
        buffer_length: usize,
    ) -> Result<Arc<Channel>> {
        Channel::new(source_id, destination_id, protocol_id, buffer_length)
    }

    /// Register the L2CAP side of an ACL link.
    ///
    /// A packet that arrived for `handle` before this call is replayed once,
    /// ahead of anything received after it.
    pub async fn open_device(
        &self,
        handle: u16,
        mac: BdAddr,
        channels: Vec<Arc<Channel>>,
    ) -> Result<Arc<L2capDevice>> {
        if let Some(channel) = channels.iter().find(|c| c.device().is_some()) {
            return Err(BtError::AlreadyOpen(format!(
                "channel {:#06x} already belongs to a device",
                channel.source_id()
            )));
        }

        let _gate = self.receive_gate.lock().await;
        let device = {
            let mut devices = lock(&self.devices);
            if let Some(existing) = devices
                .iter()
                .flatten()
                .find(|d| d.handle() == handle || d.mac() == mac)
            {
                return Err(BtError::AlreadyOpen(format!(
                    "{} (handle {:#05x}) already open",
                    existing.mac(),
                    existing.handle()
                )));
            }

            let device = L2capDevice::new(handle, mac, channels)?;
            match devices.iter_mut().find(|slot| slot.is_none()) {
                Some(slot) => *slot = Some(device.clone()),
                None => devices.push(Some(device.clone())),
            }
            device
        };
        info!(target: "l2cap", "Opened device {} on handle {:#05x}", mac, handle);

        let floating = {
            let mut floating = lock(&self.floating);
            match floating.as_ref() {
                Some(packet) if packet.handle == handle => floating.take(),
                _ => None,
            }
        };
        if let Some(packet) = floating {
            debug!(target: "l2cap", "Replaying held packet for {:#05x}", handle);
            self.deliver(&device, packet.pb, packet.bc, &packet.payload)
                .await;
        }

        Ok(device)
    }

    /// Forget a device. Its channels are reset and detached.
    pub fn close_device(&self, device: &Arc<L2capDevice>) {
        let removed = {
            let mut devices = lock(&self.devices);
            devices
                .iter_mut()
                .find(|slot| slot.as_ref().is_some_and(|d| Arc::ptr_eq(d, device)))
                .and_then(Option::take)
        };
        if removed.is_some() {
            debug!(target: "l2cap", "Closed device on handle {:#05x}", device.handle());
        }
        device.shutdown();
    }

    pub fn set_disconnect_handler(&self, device: &L2capDevice, callback: Option<DisconnectCallback>) {
        device.set_on_disconnect(callback);
    }

    pub fn find_device_by_handle(&self, handle: u16) -> Option<Arc<L2capDevice>> {
        lock(&self.devices)
            .iter()
            .flatten()
            .find(|d| d.handle() == handle)
            .cloned()
    }

    pub fn find_device_by_mac(&self, mac: BdAddr) -> Option<Arc<L2capDevice>> {
        lock(&self.devices)
            .iter()
            .flatten()
            .find(|d| d.mac() == mac)
            .cloned()
    }

    pub fn device_count(&self) -> usize {
        lock(&self.devices).iter().flatten().count()
    }

    fn on_hci_disconnect(&self, handle: u16, reason: u8) {
        {
            let mut floating = lock(&self.floating);
            if floating.as_ref().is_some_and(|packet| packet.handle == handle) {
                debug!(target: "l2cap", "Dropping held packet for {:#05x}", handle);
                floating.take();
            }
        }

        let device = {
            let mut devices = lock(&self.devices);
            devices
                .iter_mut()
                .find(|slot| slot.as_ref().is_some_and(|d| d.handle() == handle))
                .and_then(Option::take)
        };
        let Some(device) = device else {
            debug!(target: "l2cap", "Disconnect of unknown handle {:#05x}", handle);
            return;
        };

        info!(target: "l2cap", "Device {} disconnected ({:#04x})", device.mac(), reason);
        let callback = device.on_disconnect();
        device.shutdown();
        if let Some(callback) = callback {
            callback(&device, reason);
        }
    }

    /// Open an outgoing channel: connect, then configure our direction.
    pub async fn open_channel(&self, device: &Arc<L2capDevice>, channel: &Arc<Channel>) -> Result<()> {
        let attached = channel.device().ok_or_else(|| {
            BtError::runtime(format!("channel {:#06x} has no device", channel.source_id()))
        })?;
        if !Arc::ptr_eq(&attached, device) {
            return Err(BtError::runtime(format!(
                "channel {:#06x} belongs to another device",
                channel.source_id()
            )));
        }

        let id = self.next_signal_id();
        channel.expect_signal(id);
        self.send_signal(
            device,
            Signal::connection_request(id, channel.protocol_id(), channel.source_id()),
        )
        .await?;
        self.wait_channel_status(channel, status::OPEN).await?;

        let id = self.next_signal_id();
        channel.expect_signal(id);
        self.send_signal(
            device,
            Signal::configure_request(id, channel.destination_id(), &[])?,
        )
        .await?;
        self.wait_channel_status(channel, status::LOCAL_CONFIGURED)
            .await?;

        info!(
            target: "l2cap",
            "Channel {:#06x} -> {:#06x} (psm {:#06x}) open",
            channel.source_id(),
            channel.destination_id(),
            channel.protocol_id()
        );
        Ok(())
    }

    /// Send one L2CAP packet, fragmented to the controller's ACL size.
    pub async fn send_channel(&self, channel: &Channel, data: &[u8]) -> Result<()> {
        let device = channel.device().ok_or_else(|| {
            BtError::runtime(format!("channel {:#06x} has no device", channel.source_id()))
        })?;
        let length = u16::try_from(data.len())
            .map_err(|_| BtError::argument(format!("L2CAP packet of {} bytes", data.len())))?;
        let max = self.hci.acl_max_packet_length();
        if max <= 4 {
            return Err(BtError::runtime(format!("ACL packet length {} too small", max)));
        }

        let _buffer = self.acl_out.lock().await;
        let _device = device.tx_lock.lock().await;

        let first_chunk = data.len().min(max - 4);
        let mut first = Vec::with_capacity(4 + first_chunk);
        first.extend_from_slice(&length.to_le_bytes());
        first.extend_from_slice(&channel.destination_id().to_le_bytes());
        first.extend_from_slice(&data[..first_chunk]);
        self.hci
            .send_acl(
                device.handle(),
                PacketBoundary::FirstAutoFlushable,
                BroadcastFlag::PointToPoint,
                &first,
            )
            .await?;

        for chunk in data[first_chunk..].chunks(max) {
            self.hci
                .send_acl(
                    device.handle(),
                    PacketBoundary::Continuing,
                    BroadcastFlag::PointToPoint,
                    chunk,
                )
                .await?;
        }
        Ok(())
    }

    /// Wait for the next packet on `channel`. Returns its full length.
    pub async fn receive_channel(&self, channel: &Channel, out: &mut [u8]) -> Result<usize> {
        channel.receive(out).await
    }

    pub fn set_channel_receive_event(&self, channel: &Channel, event: Option<ChannelEvent>) {
        channel.set_receive_event(event);
    }

    pub async fn wait_channel_status(&self, channel: &Channel, mask: u8) -> Result<()> {
        channel.wait_status(mask, self.config.signal_timeout).await
    }

    fn next_signal_id(&self) -> u8 {
        loop {
            let id = self
                .next_signal_id
                .fetch_add(1, Ordering::AcqRel)
                .wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    pub(crate) async fn send_signal(&self, device: &L2capDevice, signal: Signal) -> Result<()> {
        let result = self
            .send_channel(device.signalling_channel(), &signal.to_bytes())
            .await;
        if let Err(e) = &result {
            warn!(
                target: "l2cap",
                "Signal {:#04x} to {:#05x} failed: {}",
                signal.code,
                device.handle(),
                e
            );
        }
        result
    }
}
