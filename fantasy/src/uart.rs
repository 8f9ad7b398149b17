//! In-memory UART link between two fantasy consoles.
//!
//! Each endpoint owns a handle to the shared [`Link`] state. Frames sent by
//! one endpoint are queued for the other one and handed out by
//! [`Hardware::receive`]. The link can lose frames in either direction and
//! an endpoint can refuse to transmit, which is how the tests simulate an
//! unreliable medium.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use comms::protocol::{DeviceId, MessageId, Packet};
use comms::traits::{Clock, Frame, Hardware, DEFAULT_ACK_TIMEOUT_US};
use log::{debug, trace};
use serde::{Deserialize, Serialize};

/// Manually advanced microsecond clock shared by all simulated devices
#[derive(Debug, Clone, Default)]
pub struct SimClock(Arc<AtomicU64>);

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn advance(&self, us: u64) {
        self.0.fetch_add(us, Ordering::AcqRel);
    }

    pub fn set(&self, us: u64) {
        self.0.store(us, Ordering::Release);
    }
}

/// Behaviour of a UART endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UartOptions {
    /// Acknowledge received packets that require it right away, like the
    /// UART target does
    pub auto_ack: bool,
    /// Time the transceiver waits for a link ack
    pub ack_timeout_us: u64,
}

impl Default for UartOptions {
    fn default() -> Self {
        Self {
            auto_ack: true,
            ack_timeout_us: DEFAULT_ACK_TIMEOUT_US,
        }
    }
}

/// Frames travelling towards one endpoint
#[derive(Debug, Default)]
struct Channel {
    frames: VecDeque<Frame>,
    /// Frames still to be lost
    drop_next: usize,
    dropped: u64,
}

impl Channel {
    fn push(&mut self, frame: Frame) {
        if self.drop_next > 0 {
            self.drop_next -= 1;
            self.dropped += 1;
            debug!("link lost {:?}", frame);
            return;
        }
        self.frames.push_back(frame);
    }
}

/// State shared by both ends of a link, `channels[i]` is read by endpoint `i`
#[derive(Debug, Default)]
struct Link {
    channels: [Channel; 2],
}

/// One end of a fantasy UART link
#[derive(Debug)]
pub struct FantasyUart {
    link: Arc<Mutex<Link>>,
    side: usize,
    clock: SimClock,
    options: UartOptions,
    enabled: bool,
    refuse_transmit: bool,
}

impl FantasyUart {
    /// Two endpoints connected to each other
    pub fn pair(options: UartOptions, clock: SimClock) -> (Self, Self) {
        let link = Arc::new(Mutex::new(Link::default()));
        let endpoint = |side| Self {
            link: Arc::clone(&link),
            side,
            clock: clock.clone(),
            options,
            enabled: false,
            refuse_transmit: false,
        };
        (endpoint(0), endpoint(1))
    }

    pub fn options(&self) -> &UartOptions {
        &self.options
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Frames waiting to be received by this endpoint
    pub fn pending_rx(&self) -> usize {
        self.lock().channels[self.side].frames.len()
    }

    /// Frames sent by this endpoint and lost on the way
    pub fn dropped_tx(&self) -> u64 {
        self.lock().channels[self.peer()].dropped
    }

    /// Lose the next `count` frames sent by this endpoint, including its
    /// link acks
    pub fn drop_outgoing(&self, count: usize) {
        self.lock().channels[self.peer()].drop_next += count;
    }

    /// Make [`Hardware::transmit`] fail as if the UART was broken
    pub fn set_refuse_transmit(&mut self, refuse: bool) {
        self.refuse_transmit = refuse;
    }

    /// Queue a frame as if the peer had sent it
    pub fn inject(&self, frame: Frame) {
        self.lock().channels[self.side].frames.push_back(frame);
    }

    fn peer(&self) -> usize {
        1 - self.side
    }

    fn lock(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clock for FantasyUart {
    fn uptime_us(&self) -> u64 {
        self.clock.now()
    }
}

impl Hardware for FantasyUart {
    fn enable_hardware(&mut self) -> bool {
        self.enabled = true;
        true
    }

    fn disable_hardware(&mut self) {
        self.enabled = false;
    }

    fn transmit(&mut self, _target: DeviceId, packet: &Packet) -> bool {
        if !self.enabled || self.refuse_transmit {
            return false;
        }
        let peer = self.peer();
        self.lock().channels[peer].push(Frame::Packet(*packet));
        true
    }

    fn receive(&mut self) -> Option<Frame> {
        if !self.enabled {
            return None;
        }
        let (side, peer) = (self.side, self.peer());
        let mut link = self.lock();
        let frame = link.channels[side].frames.pop_front()?;
        if let Frame::Packet(packet) = &frame {
            let requires_ack = MessageId::from_header(packet[0]).is_ok_and(MessageId::requires_ack);
            if self.options.auto_ack && requires_ack {
                trace!("endpoint {} acking packet 0x{:02x}", side, packet[0]);
                link.channels[peer].push(Frame::Ack(true));
            }
        }
        Some(frame)
    }

    fn ack_timeout_us(&self) -> u64 {
        self.options.ack_timeout_us
    }
}
