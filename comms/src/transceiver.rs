//! # Transceiver
//!
//! Hardware agnostic packet layer. Encodes messages into packets, hands them
//! to a [`Hardware`] backend and tracks the link acknowledgement of the
//! single acknowledged message allowed in flight.
//!
//! ## Acknowledgements
//!
//! ```text
//! send_with_ack(tag) ──► transmit ──► requires ack? ──no──► Ack { ok: true } queued
//!                            │              │
//!                          false           yes
//!                            │              ▼
//!                     nothing sent     in flight ──► Frame::Ack(ok) ──► Ack { ok }
//!                                           │
//!                                      deadline passed ──────────────► Ack { ok: false }
//! ```
//!
//! Completions are delivered by [`Transceiver::poll`] together with received
//! packets. Retrying a failed message is left to the caller.

use heapless::Deque;
use log::{debug, trace, warn};

use crate::protocol::{DeviceId, Message, Packet};
use crate::traits::{Frame, Hardware};

const COMPLETION_QUEUE_SIZE: usize = 4;

/// Outcome of an acknowledged (or fire and forget) send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Ack<T> {
    /// Tag given to [`Transceiver::send_with_ack`], `None` for plain sends
    pub tag: Option<T>,
    pub ok: bool,
    /// The packet as it was sent
    pub packet: Packet,
}

/// Result of polling the transceiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event<T> {
    Ack(Ack<T>),
    Received(Packet),
}

#[derive(Debug)]
struct InFlight<T> {
    tag: Option<T>,
    packet: Packet,
    deadline: u64,
}

/// Packet transceiver over the hardware backend `H`.
///
/// `T` is a caller chosen tag identifying what an acknowledgement belongs to.
pub struct Transceiver<H, T = ()> {
    hardware: H,
    own_id: DeviceId,
    enabled: bool,
    in_flight: Option<InFlight<T>>,
    completed: Deque<Ack<T>, COMPLETION_QUEUE_SIZE>,
}

impl<H: Hardware, T: Copy> Transceiver<H, T> {
    /// Create a disabled transceiver for the device `own_id`
    pub fn new(own_id: DeviceId, hardware: H) -> Self {
        Self {
            hardware,
            own_id,
            enabled: false,
            in_flight: None,
            completed: Deque::new(),
        }
    }

    pub fn own_id(&self) -> DeviceId {
        self.own_id
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn hardware(&self) -> &H {
        &self.hardware
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hardware
    }

    /// Whether an acknowledged message is awaiting its link ack
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Power up the hardware. Does nothing if already enabled.
    pub fn enable(&mut self) {
        if self.enabled {
            return;
        }
        self.enabled = self.hardware.enable_hardware();
        debug!("transceiver {} enabled: {}", self.own_id, self.enabled);
    }

    /// Power down the hardware. A message still awaiting its ack fails.
    pub fn disable(&mut self) {
        if !self.enabled {
            return;
        }
        self.hardware.disable_hardware();
        self.enabled = false;
        if let Some(ack) = self.on_ack_received(false) {
            self.complete(ack);
        }
        debug!("transceiver {} disabled", self.own_id);
    }

    /// Send a message without tracking its outcome.
    ///
    /// Returns `false` if the hardware failed to transmit.
    pub fn send(&mut self, target: DeviceId, message: &Message) -> bool {
        self.send_inner(target, message, None)
    }

    /// Send a message and report its outcome through [`Transceiver::poll`].
    ///
    /// Messages that need no acknowledgement complete successfully as soon
    /// as the hardware accepted them. When the hardware fails, `false` is
    /// returned and no completion is ever reported.
    ///
    /// # Panics
    ///
    /// Only one acknowledged message may be in flight. Sending another one
    /// before the previous completed is a caller bug.
    pub fn send_with_ack(&mut self, target: DeviceId, message: &Message, tag: T) -> bool {
        self.send_inner(target, message, Some(tag))
    }

    fn send_inner(&mut self, target: DeviceId, message: &Message, tag: Option<T>) -> bool {
        let requires_ack = message.requires_ack();
        assert!(
            !(requires_ack && self.in_flight.is_some()),
            "only one acknowledged message may be in flight"
        );
        if !self.enabled {
            return false;
        }

        let packet = message.encode();
        let deadline = self
            .hardware
            .uptime_us()
            .saturating_add(self.hardware.ack_timeout_us());
        if !self.hardware.transmit(target, &packet) {
            debug!("transmit of {:?} to {} failed", message.id(), target);
            return false;
        }
        trace!("sent {:?} to {}", message.id(), target);

        if requires_ack {
            self.in_flight = Some(InFlight {
                tag,
                packet,
                deadline,
            });
        } else if tag.is_some() {
            self.complete(Ack {
                tag,
                ok: true,
                packet,
            });
        }
        true
    }

    /// Resolve the message in flight with a link ack (`true`) or nack.
    ///
    /// Called by [`Transceiver::poll`] for acks reported by the hardware and
    /// on timeout, owners that detect acks themselves may call it directly.
    /// Returns `None` when nothing was in flight.
    pub fn on_ack_received(&mut self, ok: bool) -> Option<Ack<T>> {
        let in_flight = self.in_flight.take()?;
        Some(Ack {
            tag: in_flight.tag,
            ok,
            packet: in_flight.packet,
        })
    }

    /// Drive the transceiver.
    ///
    /// Returns pending completions first, then frames from the hardware, and
    /// finally fails the message in flight once its ack deadline passed.
    /// Call repeatedly until it returns `None`.
    pub fn poll(&mut self) -> Option<Event<T>> {
        if let Some(ack) = self.completed.pop_front() {
            return Some(Event::Ack(ack));
        }
        if !self.enabled {
            return None;
        }

        while let Some(frame) = self.hardware.receive() {
            match frame {
                Frame::Packet(packet) => return Some(Event::Received(packet)),
                Frame::Ack(ok) => match self.on_ack_received(ok) {
                    Some(ack) => return Some(Event::Ack(ack)),
                    None => trace!("ignoring stray link ack"),
                },
            }
        }

        let now = self.hardware.uptime_us();
        if self.in_flight.as_ref().is_some_and(|f| now >= f.deadline) {
            debug!("link ack timeout");
            return self.on_ack_received(false).map(Event::Ack);
        }
        None
    }

    fn complete(&mut self, ack: Ack<T>) {
        if self.completed.push_back(ack).is_err() {
            warn!("completion queue full, dropping ack");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BroadcastData, ConnectionOpen, Ping, BROADCAST_ID};
    use crate::traits::mock::MockHardware;
    use crate::traits::DEFAULT_ACK_TIMEOUT_US;

    fn open() -> Message {
        Message::from(ConnectionOpen {
            sender: 67,
            request_id: 1,
            param: 2,
        })
    }

    fn enabled() -> Transceiver<MockHardware, u8> {
        let mut t = Transceiver::new(67, MockHardware::new());
        t.enable();
        t
    }

    #[test]
    fn test_enable_disable_idempotent() {
        let mut t: Transceiver<MockHardware> = Transceiver::new(67, MockHardware::new());
        assert_eq!(t.own_id(), 67);
        assert!(!t.enabled());
        t.enable();
        assert!(t.enabled());
        t.enable();
        assert!(t.enabled());
        t.disable();
        assert!(!t.enabled());
        t.disable();
        assert!(!t.enabled());
    }

    #[test]
    fn test_enable_failure_keeps_disabled() {
        let mut hw = MockHardware::new();
        hw.fail_enable = true;
        let mut t: Transceiver<_> = Transceiver::new(1, hw);
        t.enable();
        assert!(!t.enabled());
    }

    #[test]
    fn test_send_while_disabled_fails_fast() {
        let mut t: Transceiver<MockHardware, u8> = Transceiver::new(67, MockHardware::new());
        assert!(!t.send_with_ack(68, &open(), 1));
        assert!(!t.is_busy());
        assert!(t.hardware().sent.is_empty());
        assert_eq!(t.poll(), None);
    }

    #[test]
    fn test_unacked_message_completes_immediately() {
        let mut t = enabled();
        let msg = Message::from(BroadcastData::new(0, b"hi"));
        assert!(t.send_with_ack(BROADCAST_ID, &msg, 9));
        assert!(!t.is_busy());
        match t.poll() {
            Some(Event::Ack(ack)) => {
                assert_eq!(ack.tag, Some(9));
                assert!(ack.ok);
                assert_eq!(ack.packet, msg.encode());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(t.poll(), None);
    }

    #[test]
    fn test_ack_received() {
        let mut t = enabled();
        assert!(t.send_with_ack(68, &open(), 3));
        assert!(t.is_busy());
        assert_eq!(t.hardware().sent.len(), 1);
        assert_eq!(t.hardware().sent[0], (68, open().encode()));
        // no ack yet
        assert_eq!(t.poll(), None);

        t.hardware_mut().inbox.push_back(Frame::Ack(true));
        match t.poll() {
            Some(Event::Ack(ack)) => {
                assert_eq!(ack.tag, Some(3));
                assert!(ack.ok);
                assert_eq!(ack.packet, open().encode());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!t.is_busy());
    }

    #[test]
    fn test_ack_timeout() {
        let mut t = enabled();
        assert!(t.send_with_ack(68, &open(), 3));
        t.hardware_mut().now += DEFAULT_ACK_TIMEOUT_US / 2;
        assert_eq!(t.poll(), None);
        t.hardware_mut().now += DEFAULT_ACK_TIMEOUT_US;
        match t.poll() {
            Some(Event::Ack(ack)) => assert!(!ack.ok),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!t.is_busy());
    }

    #[test]
    fn test_hardware_failure_reports_nothing() {
        let mut t = enabled();
        t.hardware_mut().fail_transmit = true;
        assert!(!t.send_with_ack(68, &open(), 3));
        assert!(!t.is_busy());
        assert_eq!(t.poll(), None);
        // slot is free again
        t.hardware_mut().fail_transmit = false;
        assert!(t.send_with_ack(68, &open(), 4));
    }

    #[test]
    #[should_panic(expected = "only one acknowledged message")]
    fn test_second_acked_send_panics() {
        let mut t = enabled();
        t.send_with_ack(68, &open(), 1);
        t.send_with_ack(68, &open(), 2);
    }

    #[test]
    fn test_broadcast_while_ack_pending() {
        let mut t = enabled();
        assert!(t.send_with_ack(68, &open(), 1));
        assert!(t.send(BROADCAST_ID, &Message::from(BroadcastData::new(0, b"x"))));
        assert!(t.is_busy());
        assert_eq!(t.hardware().sent.len(), 2);
    }

    #[test]
    fn test_received_packets_and_stray_acks() {
        let mut t = enabled();
        let ping = Message::from(Ping::new(5, 1, 42)).encode();
        t.hardware_mut().inbox.push_back(Frame::Ack(true));
        t.hardware_mut().inbox.push_back(Frame::Packet(ping));
        assert_eq!(t.poll(), Some(Event::Received(ping)));
        assert_eq!(t.poll(), None);
    }

    #[test]
    fn test_disable_fails_message_in_flight() {
        let mut t = enabled();
        assert!(t.send_with_ack(68, &open(), 7));
        t.disable();
        assert!(!t.is_busy());
        match t.poll() {
            Some(Event::Ack(ack)) => {
                assert_eq!(ack.tag, Some(7));
                assert!(!ack.ok);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
