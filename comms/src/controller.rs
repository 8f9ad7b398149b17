//! # Connection Manager
//!
//! The [`Controller`] owns a [`Transceiver`] and a fixed table of
//! [`Connection`] slots. It routes inbound packets to connections, turns
//! their pending data into [`ConnectionData`] chunks and serializes every
//! acknowledged message through the transceiver's single in-flight slot.
//!
//! ## Driving
//!
//! Nothing happens outside of [`Controller::tick`]. Each tick:
//!
//! 1. drains link acks and received packets from the transceiver
//! 2. enforces open and receipt deadlines
//! 3. lets each open connection prepare one chunk, round-robin
//! 4. sends the next queued message if the link is free
//! 5. frees terminal connections the application released
//!
//! Application facing outcomes are reported as [`ControllerEvent`]s from
//! [`Controller::poll_event`].

use heapless::{Deque, String};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::connection::{Connection, ConnectionId, State};
use crate::protocol::{
    BroadcastData, BroadcastEnd, BroadcastStart, ConnectionAccept, ConnectionClose,
    ConnectionData, ConnectionOpen, ConnectionReceived, ConnectionReject, DebugPrint, DeviceId,
    Message, Packet, Ping, BROADCAST_ID,
};
use crate::traits::Hardware;
use crate::transceiver::{Ack, Event, Transceiver};

const OUTBOX_SIZE: usize = 16;
const EVENT_QUEUE_SIZE: usize = 16;

/// Controller configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Time the peer has to accept or reject a connection request
    pub open_timeout_us: u64,
    /// Time to wait for a [`ConnectionReceived`] after a chunk was delivered
    pub receipt_timeout_us: u64,
    /// Consecutive link failures after which a connection times out
    pub max_retries: u8,
    /// Bytes a connection may send per tick when no receipt granted more
    pub tick_budget: u16,
    /// Announced in pings
    pub user_id: u64,
    pub user_name: String<20>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            open_timeout_us: 1_000_000,
            receipt_timeout_us: 200_000,
            max_retries: 3,
            tick_budget: 30,
            user_id: 0,
            user_name: String::new(),
        }
    }
}

/// Errors of the controller API
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommsError {
    #[error("no free connection slot")]
    NoFreeSlot,
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("connection {0} is not open")]
    NotOpen(ConnectionId),
    #[error("outgoing queue is full")]
    OutboxFull,
    #[error("hardware failed to transmit")]
    TransmitFailed,
}

/// Something the application should know about
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControllerEvent {
    /// A peer asks for a connection, answer with
    /// [`Controller::accept`] or [`Controller::reject`]
    IncomingRequest(ConnectionOpen),
    Opened(ConnectionId),
    Rejected { id: ConnectionId, reason: u16 },
    /// Closed by the peer
    Closed(ConnectionId),
    /// The peer did not answer or the link failed repeatedly
    TimedOut(ConnectionId),
    Ping(Ping),
    BroadcastStarted(BroadcastStart),
    BroadcastData(BroadcastData),
    BroadcastEnded(BroadcastEnd),
}

/// Link counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkStats {
    /// Packets accepted by the hardware
    pub packets_sent: u32,
    pub packets_received: u32,
    /// Hardware errors, nacks and ack timeouts
    pub link_failures: u32,
    /// Received packets that did not decode
    pub decode_errors: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    /// Chunk of connection `id` carrying the `odd` sequence bit
    Data { id: ConnectionId, odd: bool },
    /// Control message, resent on failure if `retry` is set. `conn` names the
    /// connection and the state the message was sent for; once the
    /// connection left that state the message is dropped, otherwise its
    /// final failure times the connection out.
    Control {
        conn: Option<(ConnectionId, State)>,
        retry: bool,
    },
}

/// Identifies an outgoing message when its link ack arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tag {
    target: DeviceId,
    kind: Kind,
    attempts: u8,
}

impl Tag {
    fn data(target: DeviceId, id: ConnectionId, odd: bool) -> Self {
        Self {
            target,
            kind: Kind::Data { id, odd },
            attempts: 0,
        }
    }

    fn control(target: DeviceId, conn: Option<(ConnectionId, State)>, retry: bool) -> Self {
        Self {
            target,
            kind: Kind::Control { conn, retry },
            attempts: 0,
        }
    }
}

#[derive(Debug)]
struct Outgoing {
    target: DeviceId,
    message: Message,
    tag: Tag,
}

/// Connection manager for up to `N` simultaneous connections.
///
/// Connection ids are slot indices, so `N` must stay below 256.
pub struct Controller<H: Hardware, const N: usize = 8> {
    transceiver: Transceiver<H, Tag>,
    config: ControllerConfig,
    connections: [Option<Connection>; N],
    outbox: Deque<Outgoing, OUTBOX_SIZE>,
    events: Deque<ControllerEvent, EVENT_QUEUE_SIZE>,
    /// First slot considered by the next scheduling round
    cursor: usize,
    ping_index: u8,
    broadcast_index: u8,
    stats: LinkStats,
}

impl<H: Hardware, const N: usize> Controller<H, N> {
    const VALID_SLOTS: () = assert!(N > 0 && N < 256, "connection ids must fit a byte");

    /// Create a controller for device `own_id`. The hardware stays disabled
    /// until [`Controller::enable`].
    pub fn new(own_id: DeviceId, hardware: H, config: ControllerConfig) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID_SLOTS;
        Self {
            transceiver: Transceiver::new(own_id, hardware),
            config,
            connections: core::array::from_fn(|_| None),
            outbox: Deque::new(),
            events: Deque::new(),
            cursor: 0,
            ping_index: 0,
            broadcast_index: 0,
            stats: LinkStats::default(),
        }
    }

    pub fn own_id(&self) -> DeviceId {
        self.transceiver.own_id()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn hardware(&self) -> &H {
        self.transceiver.hardware()
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        self.transceiver.hardware_mut()
    }

    /// Enable the transceiver, returns whether it is enabled
    pub fn enable(&mut self) -> bool {
        self.transceiver.enable();
        self.transceiver.enabled()
    }

    /// Disable the transceiver. Queued messages are kept and sent once
    /// enabled again.
    pub fn disable(&mut self) {
        self.transceiver.disable();
    }

    pub fn enabled(&self) -> bool {
        self.transceiver.enabled()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(id as usize).and_then(Option::as_ref)
    }

    pub fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(id as usize).and_then(Option::as_mut)
    }

    /// All live connections
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter().flatten()
    }

    /// Next application event
    pub fn poll_event(&mut self) -> Option<ControllerEvent> {
        self.events.pop_front()
    }

    /// Nothing queued, nothing in flight and no connection with unsent data
    pub fn is_idle(&self) -> bool {
        self.outbox.is_empty()
            && !self.transceiver.is_busy()
            && self
                .connections()
                .all(|c| !c.is_open() || (c.unsent() == 0 && !c.is_transmit_pending()))
    }

    /// Request a connection to `target`. The connection starts
    /// [`State::Requested`] and reports [`ControllerEvent::Opened`],
    /// [`ControllerEvent::Rejected`] or [`ControllerEvent::TimedOut`].
    pub fn connect(&mut self, target: DeviceId, param: u8) -> Result<ConnectionId, CommsError> {
        if self.outbox.is_full() {
            return Err(CommsError::OutboxFull);
        }
        let id = self.free_slot()?;
        let mut conn = Connection::requested(id, target, param);
        conn.deadline = Some(self.now().saturating_add(self.config.open_timeout_us));
        self.connections[id as usize] = Some(conn);

        let open = ConnectionOpen {
            sender: self.own_id(),
            request_id: id,
            param,
        };
        debug!("requesting connection {} to device {}", id, target);
        let tag = Tag::control(target, Some((id, State::Requested)), true);
        self.enqueue(target, open.into(), tag)?;
        Ok(id)
    }

    /// Accept an incoming request, the new connection is open right away
    pub fn accept(&mut self, request: &ConnectionOpen) -> Result<ConnectionId, CommsError> {
        if self.outbox.is_full() {
            return Err(CommsError::OutboxFull);
        }
        let id = self.free_slot()?;
        self.connections[id as usize] = Some(Connection::incoming(
            id,
            request.request_id,
            request.sender,
            request.param,
        ));
        let accept = ConnectionAccept {
            request_id: request.request_id,
            response_id: id,
        };
        debug!("accepted request {} from device {} as {}", request.request_id, request.sender, id);
        let tag = Tag::control(request.sender, Some((id, State::Open)), true);
        self.enqueue(request.sender, accept.into(), tag)?;
        Ok(id)
    }

    /// Decline an incoming request with an application defined reason
    pub fn reject(&mut self, request: &ConnectionOpen, reason: u16) -> Result<(), CommsError> {
        let reject = ConnectionReject::to_request(request, reason);
        self.enqueue(request.sender, reject.into(), Tag::control(request.sender, None, true))
    }

    /// Close an open connection. Received data stays readable until the
    /// connection is released.
    pub fn close(&mut self, id: ConnectionId, reason: &str) -> Result<(), CommsError> {
        if self.outbox.is_full() {
            return Err(CommsError::OutboxFull);
        }
        let conn = self
            .connection_mut(id)
            .ok_or(CommsError::UnknownConnection(id))?;
        if !conn.is_open() {
            return Err(CommsError::NotOpen(id));
        }
        conn.closed();
        conn.abort_transmit();
        conn.deadline = None;
        let (target, other_id) = (conn.other(), conn.other_id());
        debug!("closing connection {}", id);
        self.enqueue(
            target,
            ConnectionClose::new(other_id, reason).into(),
            Tag::control(target, None, true),
        )
    }

    /// Hand the connection back. An open connection is closed, the slot is
    /// freed once the connection is terminal.
    pub fn release(&mut self, id: ConnectionId) -> Result<(), CommsError> {
        let conn = self
            .connection_mut(id)
            .ok_or(CommsError::UnknownConnection(id))?;
        conn.released = true;
        if conn.is_open() {
            self.close(id, "")?;
        }
        Ok(())
    }

    /// Announce this device to `target`
    pub fn ping(&mut self, target: DeviceId) -> Result<(), CommsError> {
        let ping = Ping::new(self.own_id(), self.ping_index, self.config.user_id)
            .with_user_name(&self.config.user_name);
        self.enqueue(target, ping.into(), Tag::control(target, None, false))?;
        self.ping_index = self.ping_index.wrapping_add(1);
        Ok(())
    }

    pub fn broadcast_start(&mut self, kind: u8, repeat_count: u8) -> Result<(), CommsError> {
        self.broadcast_index = 0;
        let start = BroadcastStart {
            sender: self.own_id(),
            kind,
            repeat_count,
        };
        self.send_now(BROADCAST_ID, start.into())
    }

    /// Broadcast up to 30 bytes, longer payloads are truncated
    pub fn broadcast_data(&mut self, payload: &[u8]) -> Result<(), CommsError> {
        let data = BroadcastData::new(self.broadcast_index, payload);
        self.send_now(BROADCAST_ID, data.into())?;
        self.broadcast_index = self.broadcast_index.wrapping_add(1);
        Ok(())
    }

    pub fn broadcast_end(&mut self) -> Result<(), CommsError> {
        let end = BroadcastEnd {
            sender: self.own_id(),
        };
        self.send_now(BROADCAST_ID, end.into())
    }

    pub fn debug_print(&mut self, target: DeviceId, text: &str) -> Result<(), CommsError> {
        self.send_now(target, DebugPrint::new(text).into())
    }

    /// Drive the controller, see the module documentation
    pub fn tick(&mut self) {
        while let Some(event) = self.transceiver.poll() {
            match event {
                Event::Ack(ack) => self.on_link_ack(ack),
                Event::Received(packet) => self.on_packet(&packet),
            }
        }
        let now = self.now();
        self.check_deadlines(now);
        self.schedule();
        self.flush_outbox();
        self.sweep();
    }

    fn now(&self) -> u64 {
        self.transceiver.hardware().uptime_us()
    }

    fn free_slot(&self) -> Result<ConnectionId, CommsError> {
        self.connections
            .iter()
            .position(Option::is_none)
            .map(|slot| slot as ConnectionId)
            .ok_or(CommsError::NoFreeSlot)
    }

    fn open_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connection_mut(id).filter(|c| c.is_open())
    }

    fn push_event(&mut self, event: ControllerEvent) {
        if let Err(event) = self.events.push_back(event) {
            warn!("event queue full, dropping {:?}", event);
        }
    }

    fn enqueue(&mut self, target: DeviceId, message: Message, tag: Tag) -> Result<(), CommsError> {
        self.outbox
            .push_back(Outgoing {
                target,
                message,
                tag,
            })
            .map_err(|_| CommsError::OutboxFull)
    }

    /// Unacknowledged messages bypass the outbox
    fn send_now(&mut self, target: DeviceId, message: Message) -> Result<(), CommsError> {
        if self.transceiver.send(target, &message) {
            self.stats.packets_sent += 1;
            Ok(())
        } else {
            Err(CommsError::TransmitFailed)
        }
    }

    fn on_link_ack(&mut self, ack: Ack<Tag>) {
        let Some(tag) = ack.tag else {
            return;
        };
        if !ack.ok {
            self.on_send_failed(tag, &ack.packet);
            return;
        }
        if let Kind::Data { id, odd } = tag.kind {
            self.clear_queued(id);
            let deadline = self.now().saturating_add(self.config.receipt_timeout_us);
            if let Some(conn) = self.open_mut(id) {
                if conn.is_transmit_pending() && conn.tx_odd() == odd {
                    conn.deadline = Some(deadline);
                }
            }
        }
    }

    fn on_send_failed(&mut self, tag: Tag, packet: &Packet) {
        self.stats.link_failures += 1;
        let max_retries = self.config.max_retries;
        match tag.kind {
            Kind::Data { id, odd } => {
                self.clear_queued(id);
                let Some(conn) = self.open_mut(id) else {
                    return;
                };
                if !conn.is_transmit_pending() || conn.tx_odd() != odd {
                    return;
                }
                conn.deadline = None;
                let failures = conn.transmit_failed();
                debug!("chunk on connection {} failed {} times", id, failures);
                if failures >= max_retries {
                    self.time_out(id);
                }
            }
            Kind::Control { conn, retry } => {
                if let Some((id, state)) = conn {
                    if self.connection(id).map(Connection::state) != Some(state) {
                        debug!("connection {} moved on, dropping control message", id);
                        return;
                    }
                }
                if retry && tag.attempts + 1 < max_retries {
                    match Message::decode(packet) {
                        Ok(message) => {
                            let resend = Outgoing {
                                target: tag.target,
                                message,
                                tag: Tag {
                                    attempts: tag.attempts + 1,
                                    ..tag
                                },
                            };
                            if self.outbox.push_front(resend).is_ok() {
                                return;
                            }
                            warn!("outbox full, not resending to {}", tag.target);
                        }
                        Err(e) => warn!("cannot resend packet: {}", e),
                    }
                }
                debug!("giving up on control message to {}", tag.target);
                if let Some((id, _)) = conn {
                    self.time_out(id);
                }
            }
        }
    }

    /// The data message sent for `id` has left the link, whatever its fate
    fn clear_queued(&mut self, id: ConnectionId) {
        if let Some(conn) = self.connection_mut(id) {
            conn.queued = false;
        }
    }

    /// Move a requested or open connection to [`State::Timeout`]
    fn time_out(&mut self, id: ConnectionId) {
        let Some(conn) = self.connection_mut(id) else {
            return;
        };
        if !matches!(conn.state(), State::Requested | State::Open) {
            return;
        }
        conn.timed_out();
        conn.abort_transmit();
        conn.deadline = None;
        info!("connection {} timed out", id);
        self.push_event(ControllerEvent::TimedOut(id));
    }

    fn on_packet(&mut self, packet: &Packet) {
        self.stats.packets_received += 1;
        let message = match Message::decode(packet) {
            Ok(message) => message,
            Err(e) => {
                self.stats.decode_errors += 1;
                warn!("dropping packet: {}", e);
                return;
            }
        };
        trace!("received {:?}", message.id());
        match message {
            Message::ConnectionData(data) => self.on_data(&data),
            Message::ConnectionReceived(receipt) => self.on_receipt(receipt),
            Message::ConnectionOpen(open) => {
                debug!("connection request {} from device {}", open.request_id, open.sender);
                self.push_event(ControllerEvent::IncomingRequest(open));
            }
            Message::ConnectionAccept(accept) => self.on_accept(accept),
            Message::ConnectionReject(reject) => self.on_reject(&reject),
            Message::ConnectionClose(close) => self.on_close(&close),
            Message::Ping(ping) => self.push_event(ControllerEvent::Ping(ping)),
            Message::BroadcastStart(start) => {
                self.push_event(ControllerEvent::BroadcastStarted(start))
            }
            Message::BroadcastData(data) => self.push_event(ControllerEvent::BroadcastData(data)),
            Message::BroadcastEnd(end) => self.push_event(ControllerEvent::BroadcastEnded(end)),
            Message::DebugPrint(print) => info!("debug print: {}", print.text),
        }
    }

    fn on_data(&mut self, data: &ConnectionData) {
        let Some(conn) = self.open_mut(data.connection_id) else {
            debug!("data for connection {} which is not open", data.connection_id);
            return;
        };
        let (stored, receipt) = conn.receive(&data.payload, data.odd);
        if !stored {
            debug!("connection {} out of receive space", data.connection_id);
        }
        let target = conn.other();
        if self
            .enqueue(target, receipt.into(), Tag::control(target, None, false))
            .is_err()
        {
            warn!("outbox full, dropping receipt for connection {}", data.connection_id);
        }
    }

    fn on_receipt(&mut self, receipt: ConnectionReceived) {
        let room = !self.outbox.is_full();
        let Some(conn) = self.open_mut(receipt.connection_id) else {
            return;
        };
        conn.deadline = None;
        // a copy of the chunk still queued or in flight blocks the next one
        let budget = if room && !conn.queued {
            receipt.available as usize
        } else {
            0
        };
        let Some(next) = conn.transmit_ack(receipt.length, budget) else {
            return;
        };
        let target = conn.other();
        let tag = Tag::data(target, receipt.connection_id, next.odd);
        let queued = self.enqueue(target, next.into(), tag).is_ok();
        if let Some(conn) = self.connection_mut(receipt.connection_id) {
            if queued {
                conn.queued = true;
            } else {
                conn.abort_transmit();
            }
        }
    }

    fn on_accept(&mut self, accept: ConnectionAccept) {
        let id = accept.request_id;
        let Some(conn) = self
            .connection_mut(id)
            .filter(|c| c.state() == State::Requested)
        else {
            warn!("unexpected accept for connection {}", id);
            return;
        };
        conn.accepted(accept.response_id);
        conn.deadline = None;
        info!("connection {} opened", id);
        if conn.released {
            if let Err(e) = self.close(id, "") {
                warn!("closing released connection {}: {}", id, e);
            }
        } else {
            self.push_event(ControllerEvent::Opened(id));
        }
    }

    fn on_reject(&mut self, reject: &ConnectionReject) {
        let id = reject.request_id;
        let Some(conn) = self
            .connection_mut(id)
            .filter(|c| c.state() == State::Requested)
        else {
            warn!("unexpected reject for connection {}", id);
            return;
        };
        conn.rejected(reject.reason);
        conn.deadline = None;
        info!("connection {} rejected: {} {}", id, reject.reason, reject.extra);
        self.push_event(ControllerEvent::Rejected {
            id,
            reason: reject.reason,
        });
    }

    fn on_close(&mut self, close: &ConnectionClose) {
        let id = close.connection_id;
        let Some(conn) = self.open_mut(id) else {
            debug!("close for connection {} which is not open", id);
            return;
        };
        conn.closed();
        conn.abort_transmit();
        conn.deadline = None;
        info!("connection {} closed by peer: {}", id, close.extra);
        self.push_event(ControllerEvent::Closed(id));
    }

    fn check_deadlines(&mut self, now: u64) {
        let max_retries = self.config.max_retries;
        for slot in 0..N {
            let Some(conn) = self.connections[slot].as_mut() else {
                continue;
            };
            if !conn.deadline.is_some_and(|d| now >= d) {
                continue;
            }
            conn.deadline = None;
            let expired = match conn.state() {
                State::Requested => true,
                State::Open if conn.is_transmit_pending() => {
                    debug!("receipt timeout on connection {}", slot);
                    conn.transmit_failed() >= max_retries
                }
                _ => false,
            };
            if expired {
                self.time_out(slot as ConnectionId);
            }
        }
    }

    /// Give every open connection a chance to queue one chunk
    fn schedule(&mut self) {
        let budget = self.config.tick_budget as usize;
        for i in 0..N {
            if self.outbox.is_full() {
                break;
            }
            let slot = (self.cursor + i) % N;
            let Some(conn) = self.connections[slot].as_mut().filter(|c| !c.queued) else {
                continue;
            };
            if let Some(data) = conn.transmit(budget) {
                let target = conn.other();
                let tag = Tag::data(target, slot as ConnectionId, data.odd);
                let queued = self.outbox.push_back(Outgoing {
                    target,
                    message: data.into(),
                    tag,
                });
                match queued {
                    Ok(()) => conn.queued = true,
                    Err(_) => conn.abort_transmit(),
                }
            }
        }
        self.cursor = (self.cursor + 1) % N;
    }

    fn flush_outbox(&mut self) {
        while self.transceiver.enabled() && !self.transceiver.is_busy() {
            let Some(out) = self.outbox.pop_front() else {
                break;
            };
            if self
                .transceiver
                .send_with_ack(out.target, &out.message, out.tag)
            {
                self.stats.packets_sent += 1;
            } else {
                self.on_send_failed(out.tag, &out.message.encode());
                break;
            }
        }
    }

    fn sweep(&mut self) {
        for slot in self.connections.iter_mut() {
            if slot
                .as_ref()
                .is_some_and(|c| c.released && c.state().is_terminal())
            {
                trace!("freeing connection slot");
                *slot = None;
            }
        }
    }
}
