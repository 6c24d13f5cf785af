//! L2CAP device: the channels on one ACL link and the reassembly of
//! incoming fragments into them.

use crate::domain::models::BdAddr;
use crate::error::{BtError, Result};
use crate::infrastructure::bluetooth::l2cap::channel::Channel;
use crate::infrastructure::bluetooth::l2cap::signal::SIGNAL_CID;
use crate::infrastructure::bluetooth::protocol::{BroadcastFlag, PacketBoundary};
use crate::infrastructure::lock;
use std::sync::{Arc, Mutex};
use tracing::{error, trace, warn};

/// Ring size of the signalling channel.
pub const SIGNAL_BUFFER_LENGTH: usize = 256;

/// Called with the HCI reason code when the link goes down.
pub type DisconnectCallback = Arc<dyn Fn(&Arc<L2capDevice>, u8) + Send + Sync>;

#[derive(Default)]
struct Reassembly {
    reading: Option<Arc<Channel>>,
    remaining: usize,
}

pub struct L2capDevice {
    handle: u16,
    mac: BdAddr,
    channels: Vec<Arc<Channel>>,
    reassembly: Mutex<Reassembly>,
    pub(crate) tx_lock: tokio::sync::Mutex<()>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
}

impl std::fmt::Debug for L2capDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("L2capDevice")
            .field("handle", &self.handle)
            .field("mac", &self.mac)
            .field("channels", &self.channels.len())
            .finish()
    }
}

impl L2capDevice {
    /// Build a device around `channels`, prepending the signalling channel.
    pub(crate) fn new(handle: u16, mac: BdAddr, channels: Vec<Arc<Channel>>) -> Result<Arc<Self>> {
        let signalling = Channel::new(SIGNAL_CID, SIGNAL_CID, 0, SIGNAL_BUFFER_LENGTH)?;

        let mut all = Vec::with_capacity(channels.len() + 1);
        all.push(signalling);
        for channel in channels {
            if all.iter().any(|c| c.source_id() == channel.source_id()) {
                return Err(BtError::argument(format!(
                    "duplicate channel id {:#06x}",
                    channel.source_id()
                )));
            }
            all.push(channel);
        }

        let device = Arc::new(Self {
            handle,
            mac,
            channels: all,
            reassembly: Mutex::new(Reassembly::default()),
            tx_lock: tokio::sync::Mutex::new(()),
            on_disconnect: Mutex::new(None),
        });
        for channel in &device.channels {
            channel.attach(Arc::downgrade(&device));
        }
        Ok(device)
    }

    pub fn handle(&self) -> u16 {
        self.handle
    }

    pub fn mac(&self) -> BdAddr {
        self.mac
    }

    /// All channels, the signalling channel first.
    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }

    pub fn signalling_channel(&self) -> &Arc<Channel> {
        &self.channels[0]
    }

    pub fn channel_by_source(&self, source_id: u16) -> Option<&Arc<Channel>> {
        self.channels.iter().find(|c| c.source_id() == source_id)
    }

    /// Pre-declared (non-signalling) channel for a PSM.
    pub fn channel_by_protocol(&self, protocol_id: u16) -> Option<&Arc<Channel>> {
        self.channels[1..]
            .iter()
            .find(|c| c.protocol_id() == protocol_id)
    }

    /// Channel waiting on a response to signal `id`.
    pub fn channel_expecting(&self, id: u8) -> Option<&Arc<Channel>> {
        self.channels[1..].iter().find(|c| c.is_expecting(id))
    }

    pub(crate) fn set_on_disconnect(&self, callback: Option<DisconnectCallback>) {
        *lock(&self.on_disconnect) = callback;
    }

    pub(crate) fn on_disconnect(&self) -> Option<DisconnectCallback> {
        lock(&self.on_disconnect).clone()
    }

    /// Feed one ACL fragment. Returns the channel whose packet it completed.
    pub(crate) fn receive_fragment(
        &self,
        pb: PacketBoundary,
        bc: BroadcastFlag,
        payload: &[u8],
    ) -> Option<Arc<Channel>> {
        if bc != BroadcastFlag::PointToPoint {
            warn!(target: "l2cap", "Dropping {:?} ACL packet on {:#05x}", bc, self.handle);
            return None;
        }

        let mut reassembly = lock(&self.reassembly);
        match pb {
            PacketBoundary::FirstAutoFlushable | PacketBoundary::FirstNonFlushable => {
                if payload.len() < 4 {
                    error!(
                        target: "l2cap",
                        "First fragment of {} bytes has no L2CAP header",
                        payload.len()
                    );
                    return None;
                }
                let length = u16::from_le_bytes([payload[0], payload[1]]) as usize;
                let cid = u16::from_le_bytes([payload[2], payload[3]]);

                if let Some(previous) = reassembly.reading.take() {
                    warn!(
                        target: "l2cap",
                        "Channel {:#06x} lost a packet with {} bytes missing",
                        previous.source_id(),
                        reassembly.remaining
                    );
                    previous.with_fifo(|fifo| fifo.discard_partial());
                }

                let Some(channel) = self.channel_by_source(cid).cloned() else {
                    error!(target: "l2cap", "Packet for unknown channel {:#06x} on {:#05x}", cid, self.handle);
                    return None;
                };
                if let Err(e) = channel.with_fifo(|fifo| fifo.begin_packet()) {
                    error!(target: "l2cap", "Channel {:#06x}: {}", cid, e);
                    return None;
                }

                trace!(target: "l2cap", "Packet of {} bytes for {:#06x}", length, cid);
                reassembly.reading = Some(channel);
                reassembly.remaining = length;
                Self::append(&mut reassembly, &payload[4..])
            }
            PacketBoundary::Continuing => {
                if reassembly.reading.is_none() {
                    warn!(target: "l2cap", "Continuation with no packet in progress on {:#05x}", self.handle);
                    return None;
                }
                Self::append(&mut reassembly, payload)
            }
            PacketBoundary::Complete => {
                warn!(target: "l2cap", "Unsupported packet boundary {:?}", pb);
                None
            }
        }
    }

    fn append(reassembly: &mut Reassembly, data: &[u8]) -> Option<Arc<Channel>> {
        let channel = reassembly.reading.clone()?;

        let take = if data.len() > reassembly.remaining {
            error!(
                target: "l2cap",
                "Channel {:#06x} overfilled by {} bytes",
                channel.source_id(),
                data.len() - reassembly.remaining
            );
            reassembly.remaining
        } else {
            data.len()
        };

        let result = channel.with_fifo(|fifo| {
            fifo.write(&data[..take])?;
            if reassembly.remaining == take {
                fifo.end_packet()?;
            }
            Ok::<_, BtError>(())
        });
        if let Err(e) = result {
            error!(target: "l2cap", "Channel {:#06x}: {}", channel.source_id(), e);
            reassembly.reading = None;
            reassembly.remaining = 0;
            return None;
        }

        reassembly.remaining -= take;
        if reassembly.remaining == 0 {
            reassembly.reading = None;
            channel.packet_completed();
            return Some(channel);
        }
        None
    }

    /// Detach every channel and drop any half-received packet.
    pub(crate) fn shutdown(&self) {
        *lock(&self.reassembly) = Reassembly::default();
        for channel in &self.channels {
            channel.reset();
        }
    }
}
