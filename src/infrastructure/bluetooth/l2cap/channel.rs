//! L2CAP channel: status flags, packet FIFO and the wake-ups around them.

use crate::error::{BtError, Result};
use crate::infrastructure::bluetooth::l2cap::device::L2capDevice;
use crate::infrastructure::lock;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, warn};

/// Channel status flags.
pub mod status {
    pub const OPEN: u8 = 0x01;
    pub const LOCAL_CONFIGURED: u8 = 0x02;
    pub const REMOTE_CONFIGURED: u8 = 0x04;
    pub const ERROR: u8 = 0x80;

    pub const CONFIGURED: u8 = LOCAL_CONFIGURED | REMOTE_CONFIGURED;
}

/// Called when a complete packet lands in the channel's FIFO.
///
/// Runs on the L2CAP receive task with no L2CAP lock held; use
/// [`Channel::try_receive`] to take the packet.
pub type ChannelEvent = Arc<dyn Fn(&Arc<Channel>) + Send + Sync>;

/// Ring buffer holding received packets as `[len:be16, payload]`.
///
/// `packet_head` marks the end of the last complete packet; readers never
/// go past it. One byte is kept free so a full ring is distinguishable
/// from an empty one.
#[derive(Debug)]
pub struct ChannelFifo {
    buffer: Vec<u8>,
    write_head: usize,
    packet_head: usize,
    read_head: usize,
    pending_start: Option<usize>,
}

impl ChannelFifo {
    pub fn new(length: usize) -> Result<Self> {
        if length < 4 || !length.is_power_of_two() {
            return Err(BtError::argument(format!(
                "channel buffer length {} is not a power of two >= 4",
                length
            )));
        }
        Ok(Self {
            buffer: vec![0; length],
            write_head: 0,
            packet_head: 0,
            read_head: 0,
            pending_start: None,
        })
    }

    fn mask(&self) -> usize {
        self.buffer.len() - 1
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes written but not yet read, including an incomplete packet.
    pub fn used(&self) -> usize {
        self.write_head.wrapping_sub(self.read_head) & self.mask()
    }

    pub fn free(&self) -> usize {
        self.buffer.len() - 1 - self.used()
    }

    /// Bytes of complete packets waiting to be read.
    pub fn available(&self) -> usize {
        self.packet_head.wrapping_sub(self.read_head) & self.mask()
    }

    pub fn is_receiving(&self) -> bool {
        self.pending_start.is_some()
    }

    fn put(&mut self, at: usize, data: &[u8]) {
        let mask = self.mask();
        for (i, byte) in data.iter().enumerate() {
            self.buffer[(at + i) & mask] = *byte;
        }
    }

    fn get(&self, at: usize, out: &mut [u8]) {
        let mask = self.mask();
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.buffer[(at + i) & mask];
        }
    }

    /// Drop the packet being received, if any.
    pub fn discard_partial(&mut self) {
        if self.pending_start.take().is_some() {
            self.write_head = self.packet_head;
        }
    }

    /// Reserve the length prefix of a new packet.
    pub fn begin_packet(&mut self) -> Result<()> {
        if self.pending_start.is_some() {
            warn!(target: "l2cap", "New packet before the previous one completed; dropping it");
            self.discard_partial();
        }
        if self.free() < 2 {
            return Err(BtError::OutOfMemory("channel FIFO full".into()));
        }
        self.pending_start = Some(self.write_head);
        self.write_head = (self.write_head + 2) & self.mask();
        Ok(())
    }

    /// Append payload bytes to the packet being received.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.pending_start.is_none() {
            return Err(BtError::runtime("FIFO write outside a packet"));
        }
        if data.len() > self.free() {
            self.discard_partial();
            return Err(BtError::OutOfMemory(format!(
                "channel FIFO overflow: {} bytes, {} free",
                data.len(),
                self.free()
            )));
        }
        self.put(self.write_head, data);
        self.write_head = (self.write_head + data.len()) & self.mask();
        Ok(())
    }

    /// Backfill the length prefix and publish the packet.
    pub fn end_packet(&mut self) -> Result<()> {
        let start = self
            .pending_start
            .take()
            .ok_or_else(|| BtError::runtime("FIFO end outside a packet"))?;
        let length = self.write_head.wrapping_sub(start).wrapping_sub(2) & self.mask();
        self.put(start, &(length as u16).to_be_bytes());
        self.packet_head = self.write_head;
        Ok(())
    }

    /// Pop the oldest complete packet into `out`.
    ///
    /// Copies `min(out.len(), length)` bytes and returns the full length, so a
    /// caller can tell its buffer was too small.
    pub fn pop(&mut self, out: &mut [u8]) -> Result<usize> {
        let available = self.available();
        if available < 2 {
            return Err(BtError::runtime(format!(
                "incomplete packet in FIFO ({} bytes)",
                available
            )));
        }

        let mut prefix = [0u8; 2];
        self.get(self.read_head, &mut prefix);
        let length = u16::from_be_bytes(prefix) as usize;
        if length + 2 > available {
            self.read_head = self.packet_head;
            return Err(BtError::runtime(format!(
                "packet of {} bytes exceeds the {} available; FIFO drained",
                length, available
            )));
        }

        let copy = length.min(out.len());
        self.get(self.read_head + 2, &mut out[..copy]);
        self.read_head = (self.read_head + 2 + length) & self.mask();
        Ok(length)
    }

    pub fn clear(&mut self) {
        self.write_head = 0;
        self.packet_head = 0;
        self.read_head = 0;
        self.pending_start = None;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStatus {
    pub flags: u8,
    pub last_error: u16,
    /// Identifier of the signal we are waiting on a response for.
    pub pending_signal: Option<u8>,
}

/// One L2CAP channel on a device.
pub struct Channel {
    source_id: u16,
    destination_id: AtomicU16,
    protocol_id: u16,
    device: Mutex<Weak<L2capDevice>>,
    fifo: Mutex<ChannelFifo>,
    status: Mutex<ChannelStatus>,
    status_changed: Notify,
    packet_available: Semaphore,
    on_packet: Mutex<Option<ChannelEvent>>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("source_id", &self.source_id)
            .field("destination_id", &self.destination_id())
            .field("protocol_id", &self.protocol_id)
            .field("status", &self.status())
            .finish()
    }
}

impl Channel {
    /// `buffer_length` must be a power of two.
    pub fn new(
        source_id: u16,
        destination_id: u16,
        protocol_id: u16,
        buffer_length: usize,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            source_id,
            destination_id: AtomicU16::new(destination_id),
            protocol_id,
            device: Mutex::new(Weak::new()),
            fifo: Mutex::new(ChannelFifo::new(buffer_length)?),
            status: Mutex::new(ChannelStatus::default()),
            status_changed: Notify::new(),
            packet_available: Semaphore::new(0),
            on_packet: Mutex::new(None),
        }))
    }

    pub fn source_id(&self) -> u16 {
        self.source_id
    }

    pub fn destination_id(&self) -> u16 {
        self.destination_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_destination_id(&self, id: u16) {
        self.destination_id.store(id, Ordering::Release);
    }

    pub fn protocol_id(&self) -> u16 {
        self.protocol_id
    }

    /// The device this channel is attached to, if it is still open.
    pub fn device(&self) -> Option<Arc<L2capDevice>> {
        lock(&self.device).upgrade()
    }

    pub(crate) fn attach(&self, device: Weak<L2capDevice>) {
        *lock(&self.device) = device;
    }

    pub fn status(&self) -> ChannelStatus {
        *lock(&self.status)
    }

    pub fn flags(&self) -> u8 {
        lock(&self.status).flags
    }

    pub fn has_flags(&self, mask: u8) -> bool {
        self.flags() & mask == mask
    }

    pub(crate) fn update_status<F>(&self, f: F)
    where
        F: FnOnce(&mut ChannelStatus),
    {
        {
            let mut status = lock(&self.status);
            f(&mut status);
        }
        self.status_changed.notify_waiters();
    }

    pub(crate) fn set_flags(&self, flags: u8) {
        self.update_status(|s| s.flags |= flags);
    }

    /// Mark the channel failed with a signalling result / reject reason.
    pub(crate) fn fail(&self, code: u16) {
        self.update_status(|s| {
            s.flags |= status::ERROR;
            s.last_error = code;
            s.pending_signal = None;
        });
    }

    pub(crate) fn expect_signal(&self, id: u8) {
        lock(&self.status).pending_signal = Some(id);
    }

    pub(crate) fn is_expecting(&self, id: u8) -> bool {
        lock(&self.status).pending_signal == Some(id)
    }

    /// Wait until every flag in `mask` is set.
    ///
    /// Fails with `SignalFailed` once the error flag is raised and with
    /// `Timeout` when the status does not change for `timeout`.
    pub async fn wait_status(&self, mask: u8, timeout: Duration) -> Result<()> {
        loop {
            let notified = self.status_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let current = self.status();
            if current.flags & status::ERROR != 0 {
                return Err(BtError::SignalFailed(current.last_error));
            }
            if current.flags & mask == mask {
                return Ok(());
            }

            if tokio::time::timeout(timeout, notified).await.is_err() {
                debug!(
                    target: "l2cap",
                    "Channel {:#06x} timed out waiting for {:#04x} (have {:#04x})",
                    self.source_id, mask, current.flags
                );
                return Err(BtError::Timeout(format!(
                    "channel {:#06x} status {:#04x}",
                    self.source_id, mask
                )));
            }
        }
    }

    pub(crate) fn with_fifo<T>(&self, f: impl FnOnce(&mut ChannelFifo) -> T) -> T {
        f(&mut lock(&self.fifo))
    }

    /// Publish a packet completed by the reassembler.
    pub(crate) fn packet_completed(&self) {
        self.packet_available.add_permits(1);
    }

    /// Wait for a packet and pop it into `out`. Returns the full packet length.
    pub async fn receive(&self, out: &mut [u8]) -> Result<usize> {
        let permit = self
            .packet_available
            .acquire()
            .await
            .map_err(|_| BtError::runtime("channel closed"))?;
        permit.forget();
        self.pop(out)
    }

    /// Pop a packet if one is ready.
    pub fn try_receive(&self, out: &mut [u8]) -> Result<Option<usize>> {
        match self.packet_available.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.pop(out).map(Some)
            }
            Err(_) => Ok(None),
        }
    }

    fn pop(&self, out: &mut [u8]) -> Result<usize> {
        let result = lock(&self.fifo).pop(out);
        if let Err(e) = &result {
            error!(target: "l2cap", "Channel {:#06x}: {}", self.source_id, e);
        }
        result
    }

    pub fn set_receive_event(&self, event: Option<ChannelEvent>) {
        *lock(&self.on_packet) = event;
    }

    /// Invoke the receive event, if any. Must be called with no L2CAP lock held.
    pub(crate) fn fire_receive_event(self: &Arc<Self>) {
        let event = lock(&self.on_packet).clone();
        if let Some(event) = event {
            event(self);
        }
    }

    /// Forget the peer: flags, FIFO content and receive event are cleared.
    pub(crate) fn reset(&self) {
        self.set_receive_event(None);
        lock(&self.fifo).clear();
        while let Ok(permit) = self.packet_available.try_acquire() {
            permit.forget();
        }
        self.update_status(|s| *s = ChannelStatus::default());
        self.attach(Weak::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(fifo: &mut ChannelFifo, data: &[u8]) {
        fifo.begin_packet().unwrap();
        fifo.write(data).unwrap();
        fifo.end_packet().unwrap();
    }

    #[test]
    fn test_buffer_length_must_be_power_of_two() {
        assert!(matches!(ChannelFifo::new(100), Err(BtError::Argument(_))));
        assert!(ChannelFifo::new(128).is_ok());
    }

    #[test]
    fn test_packets_come_out_in_order() {
        let mut fifo = ChannelFifo::new(64).unwrap();
        push(&mut fifo, b"hello");
        push(&mut fifo, b"world!");

        let mut out = [0u8; 16];
        assert_eq!(fifo.pop(&mut out).unwrap(), 5);
        assert_eq!(&out[..5], b"hello");
        assert_eq!(fifo.pop(&mut out).unwrap(), 6);
        assert_eq!(&out[..6], b"world!");
        assert!(fifo.pop(&mut out).is_err());
    }

    #[test]
    fn test_length_prefix_is_big_endian() {
        let mut fifo = ChannelFifo::new(512).unwrap();
        push(&mut fifo, &[0xAB; 0x0102]);
        assert_eq!(&fifo.buffer[..2], &[0x01, 0x02]);
    }

    #[test]
    fn test_truncated_read_reports_full_length() {
        let mut fifo = ChannelFifo::new(64).unwrap();
        push(&mut fifo, b"0123456789");

        let mut out = [0u8; 4];
        assert_eq!(fifo.pop(&mut out).unwrap(), 10);
        assert_eq!(&out, b"0123");
        assert_eq!(fifo.available(), 0);
    }

    #[test]
    fn test_reader_never_passes_incomplete_packet() {
        let mut fifo = ChannelFifo::new(32).unwrap();
        push(&mut fifo, b"done");
        fifo.begin_packet().unwrap();
        fifo.write(b"partial").unwrap();

        let mut out = [0u8; 16];
        assert_eq!(fifo.pop(&mut out).unwrap(), 4);
        assert_eq!(fifo.read_head, fifo.packet_head);
        assert!(fifo.pop(&mut out).is_err());
        assert_eq!(fifo.read_head, fifo.packet_head);
    }

    #[test]
    fn test_wrap_around_keeps_one_byte_free() {
        let mut fifo = ChannelFifo::new(16).unwrap();
        let mut out = [0u8; 16];
        for round in 0..10u8 {
            push(&mut fifo, &[round; 5]);
            push(&mut fifo, &[round.wrapping_add(100); 4]);
            assert!(fifo.used() <= fifo.capacity() - 1);
            assert_eq!(fifo.pop(&mut out).unwrap(), 5);
            assert_eq!(&out[..5], &[round; 5]);
            assert_eq!(fifo.pop(&mut out).unwrap(), 4);
            assert_eq!(&out[..4], &[round.wrapping_add(100); 4]);
        }
    }

    #[test]
    fn test_overflow_drops_the_packet() {
        let mut fifo = ChannelFifo::new(16).unwrap();
        push(&mut fifo, b"keep");
        fifo.begin_packet().unwrap();
        assert!(matches!(fifo.write(&[0u8; 12]), Err(BtError::OutOfMemory(_))));
        assert!(!fifo.is_receiving());

        let mut out = [0u8; 16];
        assert_eq!(fifo.pop(&mut out).unwrap(), 4);
        assert_eq!(fifo.used(), 0);
    }

    #[test]
    fn test_new_packet_discards_incomplete_one() {
        let mut fifo = ChannelFifo::new(64).unwrap();
        fifo.begin_packet().unwrap();
        fifo.write(b"lost").unwrap();
        push(&mut fifo, b"kept");

        let mut out = [0u8; 16];
        assert_eq!(fifo.pop(&mut out).unwrap(), 4);
        assert_eq!(&out[..4], b"kept");
        assert!(fifo.pop(&mut out).is_err());
    }

    #[test]
    fn test_corrupt_length_drains_to_packet_head() {
        let mut fifo = ChannelFifo::new(64).unwrap();
        push(&mut fifo, b"abc");
        fifo.buffer[0] = 0x7F;

        let mut out = [0u8; 16];
        assert!(fifo.pop(&mut out).is_err());
        assert_eq!(fifo.read_head, fifo.packet_head);
    }

    #[tokio::test]
    async fn test_wait_status_outcomes() {
        let channel = Channel::new(0x40, 0, 0x11, 64).unwrap();

        let waiter = channel.clone();
        let task = tokio::spawn(async move {
            waiter
                .wait_status(status::OPEN, Duration::from_secs(1))
                .await
        });
        tokio::task::yield_now().await;
        channel.set_flags(status::OPEN);
        task.await.unwrap().unwrap();

        channel.fail(0x0002);
        assert!(matches!(
            channel
                .wait_status(status::LOCAL_CONFIGURED, Duration::from_secs(1))
                .await,
            Err(BtError::SignalFailed(2))
        ));

        let fresh = Channel::new(0x41, 0, 0x13, 64).unwrap();
        assert!(matches!(
            fresh
                .wait_status(status::OPEN, Duration::from_millis(20))
                .await,
            Err(BtError::Timeout(_))
        ));
    }

    #[test]
    fn test_try_receive_without_packet() {
        let channel = Channel::new(0x40, 0, 0x11, 64).unwrap();
        let mut out = [0u8; 8];
        assert_eq!(channel.try_receive(&mut out).unwrap(), None);

        channel.with_fifo(|fifo| push(fifo, b"hi"));
        channel.packet_completed();
        assert_eq!(channel.try_receive(&mut out).unwrap(), Some(2));
        assert_eq!(&out[..2], b"hi");
    }
}
