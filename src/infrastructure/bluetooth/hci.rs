//! HCI Driver
//!
//! Owns the USB transport and talks HCI to the dongle:
//!
//! - commands go out as control transfers and are matched to their
//!   Command Complete / Command Status reply through a single in-flight slot,
//! - a dedicated event pump thread reads the interrupt endpoint and
//!   dispatches events (discovery, connection, completed packets...),
//! - ACL data goes out on the bulk endpoint, gated by the controller's
//!   advertised buffer count, and comes in through an ordered reader thread.
//!
//! Commands have no timeout of their own. A controller that never answers
//! leaves the caller waiting; wrap calls in `tokio::time::timeout` if needed.

use crate::domain::models::{BdAddr, DiscoveredDevice};
use crate::domain::settings::Settings;
use crate::error::{BtError, Result};
use crate::infrastructure::bluetooth::protocol::{
    self, event, opcode, AclHeader, BroadcastFlag, BufferSize, Event, LocalVersion,
    PacketBoundary, EVENT_BUFFER_SIZE, EVENT_MASK, INIT_SEQUENCE,
};
use crate::infrastructure::lock;
use crate::infrastructure::transport::{endpoint, HostInterface, IoctlDevice, UsbTransport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, error, info, trace, warn};

const CLOSE_RESET_TIMEOUT: Duration = Duration::from_secs(1);
const CLOSE_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Called for every device an inquiry finds.
pub type DiscoveredHandler = Arc<dyn Fn(&DiscoveredDevice) + Send + Sync>;
/// Called once when an inquiry ends, with the controller's status byte.
pub type DiscoveryCompleteHandler = Box<dyn FnOnce(u8) + Send>;
/// Called when a remote device asks to connect.
pub type ConnectionRequestHandler = Arc<dyn Fn(DiscoveredDevice) + Send + Sync>;
/// Called with `(handle, reason)` when a link goes down.
pub type DisconnectionHandler = Arc<dyn Fn(u16, u8) + Send + Sync>;
/// Receives the ACL buffer back together with the transfer result.
pub type AclCompletion = Box<dyn FnOnce(Vec<u8>, Result<usize>) + Send>;

/// Driver configuration
#[derive(Debug, Clone)]
pub struct HciConfig {
    /// Largest ACL packet the host side accepts from the controller's
    /// buffer size report.
    pub max_acl_packet_length: usize,
}

impl Default for HciConfig {
    fn default() -> Self {
        Self {
            max_acl_packet_length: protocol::MAX_ACL_PACKET_LENGTH,
        }
    }
}

impl From<&Settings> for HciConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            max_acl_packet_length: settings.max_acl_packet_length,
        }
    }
}

/// What the controller told us about itself during initialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalInfo {
    pub version: LocalVersion,
    pub features: [u8; 8],
    pub address: BdAddr,
    pub buffer_size: BufferSize,
}

struct PendingCommand {
    opcode: u16,
    reply: oneshot::Sender<Result<Vec<u8>>>,
}

struct Waiter<T> {
    address: BdAddr,
    reply: oneshot::Sender<Result<T>>,
}

struct Discovery {
    on_found: DiscoveredHandler,
    on_complete: Option<DiscoveryCompleteHandler>,
}

struct AclReceive {
    buffer: Vec<u8>,
    completion: AclCompletion,
}

/// Handle on an initialized host controller.
pub struct Hci {
    transport: UsbTransport,
    config: HciConfig,
    command_lock: tokio::sync::Mutex<()>,
    pending: Mutex<Option<PendingCommand>>,
    connection_waiters: Mutex<Vec<Waiter<u16>>>,
    name_waiters: Mutex<Vec<Waiter<String>>>,
    discovery: Mutex<Option<Discovery>>,
    connection_request_handler: Mutex<Option<ConnectionRequestHandler>>,
    disconnection_handler: Mutex<Option<DisconnectionHandler>>,
    acl_tokens: Semaphore,
    local: Mutex<LocalInfo>,
    exit: AtomicBool,
    event_thread: Mutex<Option<thread::JoinHandle<()>>>,
    acl_requests: Mutex<Option<std_mpsc::Sender<AclReceive>>>,
}

impl Hci {
    /// Open the device file at `device_path` and bring the controller up.
    pub async fn initialize(
        host: &dyn HostInterface,
        device_path: &str,
        config: HciConfig,
    ) -> Result<Arc<Self>> {
        info!(target: "hci", "Opening host controller {}", device_path);
        let device = host.open(device_path).map_err(|e| {
            error!(target: "hci", "Failed to open {}: {}", device_path, e);
            BtError::IosException(e)
        })?;
        Self::with_device(device, config).await
    }

    /// Bring up a controller on an already opened device.
    pub async fn with_device(device: Arc<dyn IoctlDevice>, config: HciConfig) -> Result<Arc<Self>> {
        let hci = Arc::new(Self {
            transport: UsbTransport::new(device),
            config,
            command_lock: tokio::sync::Mutex::new(()),
            pending: Mutex::new(None),
            connection_waiters: Mutex::new(Vec::new()),
            name_waiters: Mutex::new(Vec::new()),
            discovery: Mutex::new(None),
            connection_request_handler: Mutex::new(None),
            disconnection_handler: Mutex::new(None),
            acl_tokens: Semaphore::new(0),
            local: Mutex::new(LocalInfo::default()),
            exit: AtomicBool::new(false),
            event_thread: Mutex::new(None),
            acl_requests: Mutex::new(None),
        });

        hci.spawn_event_pump()?;
        hci.spawn_acl_reader()?;

        if let Err(e) = hci.bring_up().await {
            error!(target: "hci", "Controller initialization failed: {}", e);
            hci.close().await;
            return Err(e);
        }
        Ok(hci)
    }

    async fn bring_up(&self) -> Result<()> {
        self.reset().await?;

        let mut local = LocalInfo::default();
        for &op in INIT_SEQUENCE {
            let reply = self.send_command(op, &[]).await?;
            match op {
                opcode::READ_LOCAL_VERSION => local.version = protocol::parse_local_version(&reply)?,
                opcode::READ_LOCAL_FEATURES => local.features = protocol::parse_local_features(&reply)?,
                opcode::READ_BD_ADDR => local.address = protocol::parse_bd_addr(&reply)?,
                opcode::READ_BUFFER_SIZE => local.buffer_size = protocol::parse_buffer_size(&reply)?,
                _ => {}
            }
        }

        let acl_len = local.buffer_size.acl_max_packet_length as usize;
        if acl_len == 0 || acl_len > self.config.max_acl_packet_length {
            return Err(BtError::runtime(format!(
                "controller ACL packet length {} outside 1..={}",
                acl_len, self.config.max_acl_packet_length
            )));
        }
        if local.buffer_size.acl_max_packets == 0 {
            return Err(BtError::runtime("controller advertises no ACL buffers"));
        }
        self.acl_tokens
            .add_permits(local.buffer_size.acl_max_packets as usize);
        *lock(&self.local) = local;

        self.send_command(opcode::SET_EVENT_MASK, &EVENT_MASK.to_le_bytes())
            .await?;

        info!(
            target: "hci",
            "Controller {} ready: HCI {}.{:04x}, manufacturer {:#06x}, ACL {}x{} bytes",
            local.address,
            local.version.hci_version,
            local.version.hci_revision,
            local.version.manufacturer,
            local.buffer_size.acl_max_packets,
            acl_len
        );
        Ok(())
    }

    fn spawn_event_pump(self: &Arc<Self>) -> Result<()> {
        let weak = Arc::downgrade(self);
        let transport = self.transport.clone();

        let handle = thread::Builder::new()
            .name("hci-events".into())
            .spawn(move || {
                let mut buffer = vec![0u8; EVENT_BUFFER_SIZE];
                loop {
                    buffer.fill(0);
                    let result = transport.interrupt_in(endpoint::EVENTS, &mut buffer);
                    let Some(hci) = weak.upgrade() else { break };
                    match result {
                        Ok(n) => hci.dispatch_event(&buffer[..n.min(buffer.len())]),
                        Err(e) => {
                            if !hci.exit.load(Ordering::Acquire) {
                                error!(target: "hci", "Event receive failed: {}", e);
                            }
                            break;
                        }
                    }
                    if hci.exit.load(Ordering::Acquire) {
                        break;
                    }
                }
                debug!(target: "hci", "Event pump stopped");
            })
            .map_err(|e| BtError::SchedulerFailure(format!("event pump: {}", e)))?;

        *lock(&self.event_thread) = Some(handle);
        Ok(())
    }

    fn spawn_acl_reader(&self) -> Result<()> {
        let (tx, rx) = std_mpsc::channel::<AclReceive>();
        let transport = self.transport.clone();

        // Requests are served one at a time so completions fire in the
        // order the controller delivered the packets.
        thread::Builder::new()
            .name("hci-acl-in".into())
            .spawn(move || {
                while let Ok(AclReceive {
                    mut buffer,
                    completion,
                }) = rx.recv()
                {
                    let result = transport.bulk_in(endpoint::ACL_IN, &mut buffer);
                    completion(buffer, result);
                }
                debug!(target: "hci", "ACL reader stopped");
            })
            .map_err(|e| BtError::SchedulerFailure(format!("acl reader: {}", e)))?;

        *lock(&self.acl_requests) = Some(tx);
        Ok(())
    }

    /// Stop the event pump and release every waiter.
    pub async fn close(&self) {
        if self.exit.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(target: "hci", "Closing host controller");

        // A reset produces an event, which wakes the pump so it sees `exit`.
        match tokio::time::timeout(CLOSE_RESET_TIMEOUT, self.reset()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(target: "hci", "Reset during close failed: {}", e),
            Err(_) => warn!(target: "hci", "Controller did not answer the closing reset"),
        }

        let thread = lock(&self.event_thread).take();
        if let Some(thread) = thread {
            Self::join_event_pump(thread).await;
        }

        lock(&self.acl_requests).take();
        lock(&self.pending).take();
        lock(&self.connection_waiters).clear();
        lock(&self.name_waiters).clear();
        lock(&self.discovery).take();
        self.acl_tokens.close();
    }

    /// Wait for the pump to notice `exit`. A transport stuck in a read is
    /// left behind after [`CLOSE_JOIN_TIMEOUT`].
    async fn join_event_pump(thread: thread::JoinHandle<()>) {
        let deadline = tokio::time::Instant::now() + CLOSE_JOIN_TIMEOUT;
        while !thread.is_finished() {
            if tokio::time::Instant::now() >= deadline {
                warn!(target: "hci", "Event pump still blocked in the transport; detaching it");
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if thread.join().is_err() {
            warn!(target: "hci", "Event pump did not stop cleanly");
        }
    }

    /// Issue a command and wait for its Command Complete / Command Status.
    ///
    /// Returns the reply's return parameters (for Command Status, just the
    /// status byte).
    pub async fn send_command(&self, opcode: u16, params: &[u8]) -> Result<Vec<u8>> {
        let packet = protocol::encode_command(opcode, params)?;

        let _guard = self.command_lock.lock().await;
        let (tx, rx) = oneshot::channel();
        *lock(&self.pending) = Some(PendingCommand { opcode, reply: tx });

        trace!(target: "hci", "Command {:#06x} {:02X?}", opcode, params);
        if let Err(e) = self.transport.control_out_async(packet).await {
            lock(&self.pending).take();
            error!(target: "hci", "Send command {:#06x} failed: {}", opcode, e);
            return Err(e);
        }

        rx.await
            .map_err(|_| BtError::runtime(format!("command {:#06x} abandoned", opcode)))?
    }

    pub async fn reset(&self) -> Result<()> {
        self.send_command(opcode::RESET, &[]).await.map(|_| ())
    }

    /// Control whether we are discoverable (inquiry scan) and connectable
    /// (page scan).
    pub async fn write_scan_enable(&self, inquiry: bool, page: bool) -> Result<()> {
        let scan = (inquiry as u8) | ((page as u8) << 1);
        self.send_command(opcode::WRITE_SCAN_ENABLE, &[scan])
            .await
            .map(|_| ())
    }

    /// Start an inquiry.
    ///
    /// `length` is in units of 1.28 s (1..=0x30); `max_responses` 0 means
    /// unlimited. Only one inquiry may run at a time.
    pub async fn begin_discovery<F, C>(
        &self,
        lap: u32,
        length: u8,
        max_responses: u8,
        on_found: F,
        on_complete: C,
    ) -> Result<()>
    where
        F: Fn(&DiscoveredDevice) + Send + Sync + 'static,
        C: FnOnce(u8) + Send + 'static,
    {
        if length == 0 || length > 0x30 {
            return Err(BtError::argument(format!(
                "inquiry length {:#04x} outside 0x01..=0x30",
                length
            )));
        }

        {
            let mut discovery = lock(&self.discovery);
            if discovery.is_some() {
                return Err(BtError::runtime("discovery already started"));
            }
            *discovery = Some(Discovery {
                on_found: Arc::new(on_found),
                on_complete: Some(Box::new(on_complete)),
            });
        }

        let lap = lap.to_le_bytes();
        let params = [lap[0], lap[1], lap[2], length, max_responses];
        if let Err(e) = self.send_command(opcode::INQUIRY, &params).await {
            info!(target: "hci", "Could not start discovery: {}", e);
            lock(&self.discovery).take();
            return Err(e);
        }

        debug!(target: "hci", "Discovery started for {} units", length);
        Ok(())
    }

    /// Cancel the running inquiry. Succeeds iff the controller's status is 0.
    pub async fn cancel_discovery(&self) -> Result<()> {
        self.send_command(opcode::INQUIRY_CANCEL, &[]).await?;
        lock(&self.discovery).take();
        debug!(target: "hci", "Discovery cancelled");
        Ok(())
    }

    pub fn is_discovering(&self) -> bool {
        lock(&self.discovery).is_some()
    }

    /// Ask a device for its user-friendly name.
    pub async fn get_remote_name(&self, device: &DiscoveredDevice) -> Result<String> {
        let mut params = Vec::with_capacity(10);
        params.extend_from_slice(&device.address.to_wire());
        params.push(device.page_scan_repetition_mode);
        params.push(0); // reserved
        params.extend_from_slice(&device.clock_offset.to_le_bytes());

        let rx = Self::register_waiter(&self.name_waiters, device.address);
        if let Err(e) = self
            .send_command(opcode::REMOTE_NAME_REQUEST, &params)
            .await
        {
            Self::remove_waiter(&self.name_waiters, device.address);
            info!(target: "hci", "Name request to {} failed: {}", device.address, e);
            return Err(e);
        }

        Self::await_waiter(rx, "remote name").await
    }

    /// Page a device and wait for the link.
    pub async fn create_connection(&self, device: &DiscoveredDevice) -> Result<u16> {
        let features = lock(&self.local).features;
        let packet_types = protocol::packet_types(&features);

        let mut params = Vec::with_capacity(13);
        params.extend_from_slice(&device.address.to_wire());
        params.extend_from_slice(&packet_types.to_le_bytes());
        params.push(device.page_scan_repetition_mode);
        params.push(0); // reserved
        params.extend_from_slice(&device.clock_offset.to_le_bytes());
        params.push(0); // no role switch

        info!(target: "hci", "Connecting to {}", device.address);
        self.connect_with(opcode::CREATE_CONNECTION, &params, device.address)
            .await
    }

    /// Accept an incoming connection request.
    ///
    /// With `role_switch` we ask to become master of the link.
    pub async fn accept_connection(&self, device: &DiscoveredDevice, role_switch: bool) -> Result<u16> {
        let mut params = Vec::with_capacity(7);
        params.extend_from_slice(&device.address.to_wire());
        params.push(if role_switch { 0x00 } else { 0x01 });

        info!(target: "hci", "Accepting connection from {}", device.address);
        self.connect_with(opcode::ACCEPT_CONNECTION_REQUEST, &params, device.address)
            .await
    }

    async fn connect_with(&self, op: u16, params: &[u8], address: BdAddr) -> Result<u16> {
        let rx = Self::register_waiter(&self.connection_waiters, address);
        if let Err(e) = self.send_command(op, params).await {
            Self::remove_waiter(&self.connection_waiters, address);
            info!(target: "hci", "Connection to {} refused: {}", address, e);
            return Err(e);
        }

        let handle = Self::await_waiter(rx, "connection complete").await?;
        info!(target: "hci", "Connected to {} with handle {:#05x}", address, handle);
        Ok(handle)
    }

    pub async fn reject_connection(&self, device: &DiscoveredDevice, reason: u8) -> Result<()> {
        let mut params = Vec::with_capacity(7);
        params.extend_from_slice(&device.address.to_wire());
        params.push(reason);

        info!(target: "hci", "Rejecting connection from {} ({:#04x})", device.address, reason);
        self.send_command(opcode::REJECT_CONNECTION_REQUEST, &params)
            .await
            .map(|_| ())
    }

    pub async fn disconnect(&self, handle: u16) -> Result<()> {
        let mut params = Vec::with_capacity(3);
        params.extend_from_slice(&(handle & 0x0FFF).to_le_bytes());
        params.push(protocol::REASON_USER_TERMINATED);

        info!(target: "hci", "Disconnecting handle {:#05x}", handle);
        self.send_command(opcode::DISCONNECT, &params)
            .await
            .map(|_| ())
    }

    /// Send one ACL packet. Waits for a free controller buffer first.
    pub async fn send_acl(
        &self,
        handle: u16,
        pb: PacketBoundary,
        bc: BroadcastFlag,
        payload: &[u8],
    ) -> Result<()> {
        let max = self.acl_max_packet_length();
        if payload.len() > max {
            return Err(BtError::argument(format!(
                "ACL payload of {} bytes exceeds {}",
                payload.len(),
                max
            )));
        }

        let permit = self
            .acl_tokens
            .acquire()
            .await
            .map_err(|_| BtError::SchedulerFailure("ACL buffers closed".into()))?;
        // Returned by Number Of Completed Packets, not by dropping.
        permit.forget();

        let header = AclHeader {
            handle,
            pb,
            bc,
            length: payload.len() as u16,
        };
        let mut packet = Vec::with_capacity(AclHeader::SIZE + payload.len());
        packet.extend_from_slice(&header.to_bytes());
        packet.extend_from_slice(payload);

        trace!(target: "hci", "ACL out {:?} {} bytes", pb, payload.len());
        match self.transport.bulk_out_async(endpoint::ACL_OUT, packet).await {
            Ok(_) => Ok(()),
            Err(e) => {
                // Never reached the controller, so no completion will return it.
                self.acl_tokens.add_permits(1);
                Err(e)
            }
        }
    }

    /// Queue a receive on the ACL in endpoint.
    ///
    /// `completion` runs on the reader thread with the buffer and the number
    /// of bytes received. Receives complete in the order they were queued.
    pub fn receive_acl_async<F>(&self, buffer: Vec<u8>, completion: F) -> Result<()>
    where
        F: FnOnce(Vec<u8>, Result<usize>) + Send + 'static,
    {
        let requests = lock(&self.acl_requests);
        let sender = requests
            .as_ref()
            .ok_or_else(|| BtError::SchedulerFailure("ACL reader stopped".into()))?;
        sender
            .send(AclReceive {
                buffer,
                completion: Box::new(completion),
            })
            .map_err(|_| BtError::SchedulerFailure("ACL reader stopped".into()))
    }

    /// Decode the header of a received ACL packet.
    pub fn decode_received_acl(buffer: &[u8]) -> Result<AclHeader> {
        AclHeader::decode(buffer)
    }

    pub fn set_connection_request_handler(&self, handler: Option<ConnectionRequestHandler>) {
        *lock(&self.connection_request_handler) = handler;
    }

    pub fn set_disconnection_complete_handler(&self, handler: Option<DisconnectionHandler>) {
        *lock(&self.disconnection_handler) = handler;
    }

    pub fn local_info(&self) -> LocalInfo {
        *lock(&self.local)
    }

    pub fn acl_max_packet_length(&self) -> usize {
        lock(&self.local).buffer_size.acl_max_packet_length as usize
    }

    /// Free ACL buffers on the controller side.
    pub fn available_acl_buffers(&self) -> usize {
        self.acl_tokens.available_permits()
    }

    fn register_waiter<T>(waiters: &Mutex<Vec<Waiter<T>>>, address: BdAddr) -> oneshot::Receiver<Result<T>> {
        let (tx, rx) = oneshot::channel();
        lock(waiters).push(Waiter { address, reply: tx });
        rx
    }

    fn remove_waiter<T>(waiters: &Mutex<Vec<Waiter<T>>>, address: BdAddr) {
        lock(waiters).retain(|w| w.address != address);
    }

    fn take_waiter<T>(waiters: &Mutex<Vec<Waiter<T>>>, address: BdAddr) -> Option<Waiter<T>> {
        let mut waiters = lock(waiters);
        let index = waiters.iter().position(|w| w.address == address)?;
        Some(waiters.remove(index))
    }

    async fn await_waiter<T>(rx: oneshot::Receiver<Result<T>>, what: &str) -> Result<T> {
        rx.await
            .map_err(|_| BtError::runtime(format!("{} abandoned", what)))?
    }

    // ---- event pump side ----

    fn dispatch_event(&self, buffer: &[u8]) {
        let event = match Event::parse(buffer) {
            Ok(event) => event,
            Err(e) => {
                error!(target: "hci", "Malformed event: {}", e);
                return;
            }
        };
        trace!(target: "hci", "Event {:#04x} {:02X?}", event.code, event.params);

        let result = match event.code {
            event::COMMAND_COMPLETE => self.on_command_complete(event.params),
            event::COMMAND_STATUS => self.on_command_status(event.params),
            event::INQUIRY_RESULT => self.on_inquiry_result(event.params),
            event::INQUIRY_COMPLETE => self.on_inquiry_complete(event.params),
            event::CONNECTION_REQUEST => self.on_connection_request(event.params),
            event::CONNECTION_COMPLETE => self.on_connection_complete(event.params),
            event::DISCONNECTION_COMPLETE => self.on_disconnection_complete(event.params),
            event::REMOTE_NAME_REQUEST_COMPLETE => self.on_remote_name(event.params),
            event::NUMBER_OF_COMPLETED_PACKETS => self.on_completed_packets(event.params),
            event::HARDWARE_ERROR => {
                error!(
                    target: "hci",
                    "Hardware error {:#04x}",
                    event.params.first().copied().unwrap_or(0)
                );
                Ok(())
            }
            other => {
                warn!(target: "hci", "Unhandled event {:#04x}", other);
                Ok(())
            }
        };

        if let Err(e) = result {
            error!(target: "hci", "Event {:#04x} dropped: {}", event.code, e);
        }
    }

    fn complete_command(&self, opcode: u16, result: Result<Vec<u8>>, kind: &str) {
        let mut pending = lock(&self.pending);
        match pending.take() {
            Some(command) if command.opcode == opcode => {
                drop(pending);
                let _ = command.reply.send(result);
            }
            other => {
                *pending = other;
                warn!(target: "hci", "spurious command {} for opcode {:#06x}", kind, opcode);
            }
        }
    }

    fn on_command_complete(&self, params: &[u8]) -> Result<()> {
        let (opcode, reply) = protocol::parse_command_complete(params)?;
        if opcode == 0 {
            // "ready for commands" notification
            return Ok(());
        }
        let result = match reply.first() {
            Some(&status) if status != 0 => Err(BtError::RequestError { opcode, status }),
            _ => Ok(reply.to_vec()),
        };
        self.complete_command(opcode, result, "complete");
        Ok(())
    }

    fn on_command_status(&self, params: &[u8]) -> Result<()> {
        let (opcode, status) = protocol::parse_command_status(params)?;
        if opcode == 0 {
            return Ok(());
        }
        let result = if status != 0 {
            Err(BtError::RequestError { opcode, status })
        } else {
            Ok(vec![status])
        };
        self.complete_command(opcode, result, "status");
        Ok(())
    }

    fn on_inquiry_result(&self, params: &[u8]) -> Result<()> {
        let devices = protocol::parse_inquiry_results(params)?;
        let handler = lock(&self.discovery).as_ref().map(|d| d.on_found.clone());

        match handler {
            Some(on_found) => {
                for device in &devices {
                    debug!(
                        target: "hci",
                        "Found {} (class {:#08x})",
                        device.address,
                        device.class_of_device
                    );
                    on_found(device);
                }
            }
            None => debug!(target: "hci", "Inquiry result with no discovery running"),
        }
        Ok(())
    }

    fn on_inquiry_complete(&self, params: &[u8]) -> Result<()> {
        let status = params.first().copied().unwrap_or(0);
        let discovery = lock(&self.discovery).take();

        match discovery {
            Some(mut discovery) => {
                if status != 0 {
                    info!(target: "hci", "Discovery ended with status {:#04x}", status);
                }
                if let Some(on_complete) = discovery.on_complete.take() {
                    on_complete(status);
                }
            }
            None => debug!(target: "hci", "Inquiry complete with no discovery running"),
        }
        Ok(())
    }

    fn on_connection_request(&self, params: &[u8]) -> Result<()> {
        let (device, link_type) = protocol::parse_connection_request(params)?;
        info!(
            target: "hci",
            "Connection request from {} (class {:#08x}, link {})",
            device.address,
            device.class_of_device,
            link_type
        );

        let handler = lock(&self.connection_request_handler).clone();
        match handler {
            Some(handler) => handler(device),
            None => info!(target: "hci", "No connection request handler installed"),
        }
        Ok(())
    }

    fn on_connection_complete(&self, params: &[u8]) -> Result<()> {
        let complete = protocol::parse_connection_complete(params)?;
        let Some(waiter) = Self::take_waiter(&self.connection_waiters, complete.address) else {
            debug!(
                target: "hci",
                "Connection complete for {} with nobody waiting",
                complete.address
            );
            return Ok(());
        };

        let result = if complete.status == 0 {
            Ok(complete.handle)
        } else {
            Err(BtError::ConnectFailed(format!(
                "{} answered with status {:#04x}",
                complete.address, complete.status
            )))
        };
        let _ = waiter.reply.send(result);
        Ok(())
    }

    fn on_disconnection_complete(&self, params: &[u8]) -> Result<()> {
        let (status, handle, reason) = protocol::parse_disconnection_complete(params)?;
        if status != 0 {
            warn!(target: "hci", "Disconnect of {:#05x} failed with {:#04x}", handle, status);
            return Ok(());
        }

        info!(target: "hci", "Handle {:#05x} disconnected, reason {:#04x}", handle, reason);
        let handler = lock(&self.disconnection_handler).clone();
        if let Some(handler) = handler {
            handler(handle, reason);
        }
        Ok(())
    }

    fn on_remote_name(&self, params: &[u8]) -> Result<()> {
        let (status, address, name) = protocol::parse_remote_name(params)?;
        let Some(waiter) = Self::take_waiter(&self.name_waiters, address) else {
            debug!(target: "hci", "Remote name for {} with nobody waiting", address);
            return Ok(());
        };

        let result = if status == 0 {
            Ok(name)
        } else {
            Err(BtError::RequestError {
                opcode: opcode::REMOTE_NAME_REQUEST,
                status,
            })
        };
        let _ = waiter.reply.send(result);
        Ok(())
    }

    fn on_completed_packets(&self, params: &[u8]) -> Result<()> {
        for (handle, completed) in protocol::parse_completed_packets(params)? {
            trace!(target: "hci", "{} packets completed on {:#05x}", completed, handle);
            self.acl_tokens.add_permits(completed as usize);
        }
        Ok(())
    }
}
