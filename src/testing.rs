//! Scripted host controller for tests.
//!
//! [`FakeController`] plays the USB dongle: it answers HCI commands the way a
//! real controller does, lets tests push events and ACL packets, and records
//! everything the stack sends. [`L2capPeer`] can be installed as its ACL
//! responder to play the remote side of L2CAP signalling.

use crate::domain::models::BdAddr;
use crate::infrastructure::bluetooth::protocol::{
    event, opcode, AclHeader, BroadcastFlag, PacketBoundary, MAX_REMOTE_NAME_LENGTH,
};
use crate::infrastructure::transport::{endpoint, request, HostInterface, IoctlDevice};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

type AclResponder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

struct State {
    events: VecDeque<Vec<u8>>,
    acl_in: VecDeque<Vec<u8>>,
    commands: Vec<(u16, Vec<u8>)>,
    acl_out: Vec<Vec<u8>>,
    failures: HashMap<u16, u8>,
    connection_failure: Option<u8>,
    next_handle: u16,
    remote_name: String,
    acl_max_packet_length: u16,
    acl_max_packets: u16,
    auto_complete_packets: bool,
    refuse_acl_out: bool,
    refused_acl_out: usize,
    silent: bool,
    inquiry_script: Vec<(u8, Vec<u8>)>,
}

type Queue = fn(&mut State) -> &mut VecDeque<Vec<u8>>;

fn events_queue(state: &mut State) -> &mut VecDeque<Vec<u8>> {
    &mut state.events
}

fn acl_queue(state: &mut State) -> &mut VecDeque<Vec<u8>> {
    &mut state.acl_in
}

pub struct FakeController {
    state: Mutex<State>,
    events_ready: Condvar,
    acl_ready: Condvar,
    responder: Mutex<Option<AclResponder>>,
}

impl FakeController {
    pub const LOCAL_ADDRESS: BdAddr = BdAddr::new([0x00, 0x17, 0xAB, 0x12, 0x34, 0x56]);
    pub const FIRST_HANDLE: u16 = 0x0001;

    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                events: VecDeque::new(),
                acl_in: VecDeque::new(),
                commands: Vec::new(),
                acl_out: Vec::new(),
                failures: HashMap::new(),
                connection_failure: None,
                next_handle: Self::FIRST_HANDLE,
                remote_name: String::new(),
                acl_max_packet_length: 64,
                acl_max_packets: 8,
                auto_complete_packets: false,
                refuse_acl_out: false,
                refused_acl_out: 0,
                silent: false,
                inquiry_script: Vec::new(),
            }),
            events_ready: Condvar::new(),
            acl_ready: Condvar::new(),
            responder: Mutex::new(None),
        })
    }

    pub fn set_buffer_size(&self, acl_max_packet_length: u16, acl_max_packets: u16) {
        let mut state = self.state.lock().unwrap();
        state.acl_max_packet_length = acl_max_packet_length;
        state.acl_max_packets = acl_max_packets;
    }

    /// Answer `op` with a non-zero status from now on.
    pub fn fail_opcode(&self, op: u16, status: u8) {
        self.state.lock().unwrap().failures.insert(op, status);
    }

    /// Make Connection Complete carry `status`.
    pub fn fail_connections(&self, status: u8) {
        self.state.lock().unwrap().connection_failure = Some(status);
    }

    pub fn set_remote_name(&self, name: &str) {
        self.state.lock().unwrap().remote_name = name.to_string();
    }

    /// Emit Number Of Completed Packets after every ACL packet sent.
    pub fn complete_packets_automatically(&self) {
        self.state.lock().unwrap().auto_complete_packets = true;
    }

    /// Record commands from now on but never answer them.
    pub fn go_silent(&self) {
        self.state.lock().unwrap().silent = true;
    }

    /// Fail outgoing ACL transfers while `refuse` is set.
    pub fn refuse_acl_out(&self, refuse: bool) {
        self.state.lock().unwrap().refuse_acl_out = refuse;
    }

    /// Outgoing ACL transfers failed so far.
    pub fn refused_acl_out(&self) -> usize {
        self.state.lock().unwrap().refused_acl_out
    }

    /// Events emitted after every successful Inquiry command status.
    pub fn script_inquiry(&self, events: Vec<(u8, Vec<u8>)>) {
        self.state.lock().unwrap().inquiry_script = events;
    }

    pub fn set_acl_responder<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(responder));
    }

    pub fn push_event(&self, code: u8, params: &[u8]) {
        let packet = event_packet(code, params);
        self.state.lock().unwrap().events.push_back(packet);
        self.events_ready.notify_all();
    }

    pub fn push_acl(&self, handle: u16, pb: PacketBoundary, payload: &[u8]) {
        self.push_acl_raw(acl_packet(handle, pb, payload));
    }

    pub fn push_acl_raw(&self, packet: Vec<u8>) {
        self.state.lock().unwrap().acl_in.push_back(packet);
        self.acl_ready.notify_all();
    }

    pub fn sent_commands(&self) -> Vec<(u16, Vec<u8>)> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn sent_acl(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().acl_out.clone()
    }

    /// Poll `condition` until it holds or two seconds pass.
    pub async fn wait_for<F>(&self, condition: F) -> bool
    where
        F: Fn(&Self) -> bool,
    {
        for _ in 0..200 {
            if condition(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition(self)
    }

    fn command_complete(op: u16, reply: &[u8]) -> Vec<u8> {
        let mut params = vec![0x01];
        params.extend_from_slice(&op.to_le_bytes());
        params.extend_from_slice(reply);
        event_packet(event::COMMAND_COMPLETE, &params)
    }

    fn command_status(op: u16, status: u8) -> Vec<u8> {
        let o = op.to_le_bytes();
        event_packet(event::COMMAND_STATUS, &[status, 0x01, o[0], o[1]])
    }

    fn on_command(&self, packet: &[u8]) {
        let op = u16::from_le_bytes([packet[0], packet[1]]);
        let params = packet[3..3 + packet[2] as usize].to_vec();

        let mut state = self.state.lock().unwrap();
        state.commands.push((op, params.clone()));
        if state.silent {
            return;
        }
        let failure = state.failures.get(&op).copied();

        let mut replies = Vec::new();
        match op {
            opcode::INQUIRY
            | opcode::CREATE_CONNECTION
            | opcode::ACCEPT_CONNECTION_REQUEST
            | opcode::REJECT_CONNECTION_REQUEST
            | opcode::DISCONNECT
            | opcode::REMOTE_NAME_REQUEST => {
                let status = failure.unwrap_or(0);
                replies.push(Self::command_status(op, status));
                if status == 0 {
                    replies.extend(self.follow_up(&mut state, op, &params));
                }
            }
            _ => {
                let reply = match failure {
                    Some(status) => vec![status],
                    None => Self::reply_for(&state, op),
                };
                replies.push(Self::command_complete(op, &reply));
            }
        }

        state.events.extend(replies);
        drop(state);
        self.events_ready.notify_all();
    }

    fn reply_for(state: &State, op: u16) -> Vec<u8> {
        match op {
            opcode::READ_LOCAL_VERSION => vec![0x00, 0x04, 0x00, 0x00, 0x04, 0x0F, 0x00, 0x00, 0x00],
            opcode::READ_LOCAL_FEATURES => vec![0x00, 0x03, 0, 0, 0, 0, 0, 0, 0],
            opcode::READ_BD_ADDR => {
                let mut reply = vec![0x00];
                reply.extend_from_slice(&Self::LOCAL_ADDRESS.to_wire());
                reply
            }
            opcode::READ_BUFFER_SIZE => {
                let mut reply = vec![0x00];
                reply.extend_from_slice(&state.acl_max_packet_length.to_le_bytes());
                reply.push(0x40);
                reply.extend_from_slice(&state.acl_max_packets.to_le_bytes());
                reply.extend_from_slice(&1u16.to_le_bytes());
                reply
            }
            _ => vec![0x00],
        }
    }

    fn follow_up(&self, state: &mut State, op: u16, params: &[u8]) -> Vec<Vec<u8>> {
        match op {
            opcode::CREATE_CONNECTION | opcode::ACCEPT_CONNECTION_REQUEST => {
                let handle = state.next_handle;
                state.next_handle += 1;
                let mut complete = vec![state.connection_failure.unwrap_or(0)];
                complete.extend_from_slice(&handle.to_le_bytes());
                complete.extend_from_slice(&params[0..6]);
                complete.extend_from_slice(&[0x01, 0x00]);
                vec![event_packet(event::CONNECTION_COMPLETE, &complete)]
            }
            opcode::REMOTE_NAME_REQUEST => {
                let mut complete = vec![0x00];
                complete.extend_from_slice(&params[0..6]);
                let mut name = state.remote_name.as_bytes().to_vec();
                name.resize(MAX_REMOTE_NAME_LENGTH, 0);
                complete.extend_from_slice(&name);
                vec![event_packet(event::REMOTE_NAME_REQUEST_COMPLETE, &complete)]
            }
            opcode::DISCONNECT => {
                let complete = [0x00, params[0], params[1], 0x16];
                vec![event_packet(event::DISCONNECTION_COMPLETE, &complete)]
            }
            opcode::INQUIRY => state
                .inquiry_script
                .iter()
                .map(|(code, params)| event_packet(*code, params))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn on_acl_out(&self, packet: &[u8]) {
        {
            let mut state = self.state.lock().unwrap();
            state.acl_out.push(packet.to_vec());
            if state.auto_complete_packets {
                let h = u16::from_le_bytes([packet[0], packet[1]]) & 0x0FFF;
                let h = h.to_le_bytes();
                state.events.push_back(event_packet(
                    event::NUMBER_OF_COMPLETED_PACKETS,
                    &[0x01, h[0], h[1], 0x01, 0x00],
                ));
            }
        }
        self.events_ready.notify_all();

        let replies = match self.responder.lock().unwrap().as_mut() {
            Some(responder) => responder(packet),
            None => Vec::new(),
        };
        for reply in replies {
            self.push_acl_raw(reply);
        }
    }

    fn refuse_out(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.refuse_acl_out {
            state.refused_acl_out += 1;
        }
        state.refuse_acl_out
    }

    fn take_blocking(&self, queue: Queue, ready: &Condvar, io: &mut [u8]) -> usize {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(packet) = queue(&mut state).pop_front() {
                let n = packet.len().min(io.len());
                io[..n].copy_from_slice(&packet[..n]);
                return n;
            }
            state = ready.wait(state).unwrap();
        }
    }
}

impl IoctlDevice for FakeController {
    fn ioctlv(&self, request: u32, inputs: &[&[u8]], io: &mut [u8]) -> io::Result<usize> {
        match request {
            request::CONTROL => {
                self.on_command(io);
                Ok(io.len())
            }
            request::INTERRUPT => Ok(self.take_blocking(events_queue, &self.events_ready, io)),
            request::BULK => {
                let endpoint = inputs[0][0];
                if endpoint == endpoint::ACL_IN {
                    Ok(self.take_blocking(acl_queue, &self.acl_ready, io))
                } else if self.refuse_out() {
                    Err(io::Error::new(io::ErrorKind::BrokenPipe, "ACL out refused"))
                } else {
                    self.on_acl_out(io);
                    Ok(io.len())
                }
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown ioctl {}", other),
            )),
        }
    }
}

/// Opens the same fake for any path.
pub struct FakeHost(pub Arc<FakeController>);

impl HostInterface for FakeHost {
    fn open(&self, _path: &str) -> io::Result<Arc<dyn IoctlDevice>> {
        Ok(self.0.clone())
    }
}

pub fn event_packet(code: u8, params: &[u8]) -> Vec<u8> {
    let mut packet = vec![code, params.len() as u8];
    packet.extend_from_slice(params);
    packet
}

pub fn acl_packet(handle: u16, pb: PacketBoundary, payload: &[u8]) -> Vec<u8> {
    let header = AclHeader {
        handle,
        pb,
        bc: BroadcastFlag::PointToPoint,
        length: payload.len() as u16,
    };
    let mut packet = header.to_bytes().to_vec();
    packet.extend_from_slice(payload);
    packet
}

/// A complete L2CAP packet in a single ACL fragment.
pub fn l2cap_packet(handle: u16, cid: u16, payload: &[u8]) -> Vec<u8> {
    let mut l2cap = (payload.len() as u16).to_le_bytes().to_vec();
    l2cap.extend_from_slice(&cid.to_le_bytes());
    l2cap.extend_from_slice(payload);
    acl_packet(handle, PacketBoundary::FirstAutoFlushable, &l2cap)
}

/// A signalling PDU `{code, id, len:le16, data}` on cid 1.
pub fn signal_packet(handle: u16, code: u8, id: u8, data: &[u8]) -> Vec<u8> {
    let mut pdu = vec![code, id];
    pdu.extend_from_slice(&(data.len() as u16).to_le_bytes());
    pdu.extend_from_slice(data);
    l2cap_packet(handle, 0x0001, &pdu)
}

type DataHandler = Box<dyn FnMut(u16, &[u8]) -> Vec<Vec<u8>> + Send>;

/// Remote L2CAP endpoint that accepts and configures every channel we open.
///
/// Channel data (anything not on cid 1) goes to `on_data` with the remote's
/// psm and the payload; it returns payloads to send back on the same channel.
pub struct L2capPeer {
    next_cid: u16,
    next_id: u8,
    /// remote cid -> (our cid, psm)
    channels: HashMap<u16, (u16, u16)>,
    on_data: Option<DataHandler>,
}

impl L2capPeer {
    pub fn new() -> Self {
        Self {
            next_cid: 0x0050,
            next_id: 0x80,
            channels: HashMap::new(),
            on_data: None,
        }
    }

    pub fn on_data<F>(mut self, handler: F) -> Self
    where
        F: FnMut(u16, &[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        self.on_data = Some(Box::new(handler));
        self
    }

    /// Install on `fake` as its ACL responder.
    pub fn install(mut self, fake: &FakeController) {
        fake.set_acl_responder(move |packet| self.respond(packet));
    }

    pub fn respond(&mut self, packet: &[u8]) -> Vec<Vec<u8>> {
        let Ok(header) = AclHeader::decode(packet) else {
            return Vec::new();
        };
        // Continuations are never answered; everything we answer fits one fragment.
        if header.pb == PacketBoundary::Continuing || packet.len() < 8 {
            return Vec::new();
        }
        let handle = header.handle;
        let cid = u16::from_le_bytes([packet[6], packet[7]]);
        let payload = &packet[8..];

        if cid != 0x0001 {
            let Some(&(our_cid, psm)) = self.channels.get(&cid) else {
                return Vec::new();
            };
            let Some(on_data) = self.on_data.as_mut() else {
                return Vec::new();
            };
            return on_data(psm, payload)
                .into_iter()
                .map(|reply| l2cap_packet(handle, our_cid, &reply))
                .collect();
        }

        if payload.len() < 4 {
            return Vec::new();
        }
        let (code, id) = (payload[0], payload[1]);
        let data = &payload[4..];
        match code {
            // Connection Request {psm, scid}
            0x02 => {
                let psm = u16::from_le_bytes([data[0], data[1]]);
                let our_cid = u16::from_le_bytes([data[2], data[3]]);
                let remote_cid = self.next_cid;
                self.next_cid += 1;
                self.channels.insert(remote_cid, (our_cid, psm));

                let mut response = Vec::new();
                response.extend_from_slice(&remote_cid.to_le_bytes());
                response.extend_from_slice(&our_cid.to_le_bytes());
                response.extend_from_slice(&[0, 0, 0, 0]);

                let mut config = Vec::new();
                config.extend_from_slice(&our_cid.to_le_bytes());
                config.extend_from_slice(&[0, 0]);
                config.extend_from_slice(&[0x01, 0x02, 0xB9, 0x00]); // MTU 185
                self.next_id = self.next_id.wrapping_add(1).max(1);

                vec![
                    signal_packet(handle, 0x03, id, &response),
                    signal_packet(handle, 0x04, self.next_id, &config),
                ]
            }
            // Configuration Request {dcid, flags}
            0x04 => {
                let remote_cid = u16::from_le_bytes([data[0], data[1]]);
                let our_cid = self
                    .channels
                    .get(&remote_cid)
                    .map(|(ours, _)| *ours)
                    .unwrap_or(0);
                let mut response = our_cid.to_le_bytes().to_vec();
                response.extend_from_slice(&[0, 0, 0, 0]);
                vec![signal_packet(handle, 0x05, id, &response)]
            }
            _ => Vec::new(),
        }
    }
}
