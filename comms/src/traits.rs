//! # Hardware Abstractions
//!
//! Every communication backend (UART cartridge, packet radio, the desktop
//! simulator) implements [`Hardware`] and is plugged into a
//! [`Transceiver`](crate::transceiver::Transceiver). The transceiver adds
//! framing and acknowledgement tracking on top, so a backend only moves raw
//! 32-byte packets.
//!
//! ## Design Rationale
//!
//! 1. **Testability**: mock backends drive the protocol in unit tests
//! 2. **Flexibility**: backends are selected at compile time via generics
//! 3. **No Globals**: all backend state lives in the implementing value

use crate::protocol::{DeviceId, Packet};

/// Default time to wait for a link acknowledgement
pub const DEFAULT_ACK_TIMEOUT_US: u64 = 1000;

/// Monotonic microsecond clock
pub trait Clock {
    /// Microseconds since an arbitrary fixed point, never decreasing
    fn uptime_us(&self) -> u64;
}

/// Unit of data reported by the hardware when polled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Frame {
    /// A packet addressed to this device
    Packet(Packet),
    /// Link level acknowledgement (`true`) or negative acknowledgement
    /// (`false`) of the message currently in flight
    Ack(bool),
}

/// Capability set of a raw packet medium.
///
/// Calling [`Hardware::transmit`] or [`Hardware::receive`] on a disabled
/// backend must fail immediately. The transceiver guards against this, but
/// backends should not rely on it.
pub trait Hardware: Clock {
    /// Power up the medium. Returns `true` if it is ready for use.
    fn enable_hardware(&mut self) -> bool;

    /// Power down the medium
    fn disable_hardware(&mut self);

    /// Hand a packet to the medium.
    ///
    /// Returns `false` on a local hardware error, in which case nothing was
    /// sent. `true` only means the packet left this device.
    fn transmit(&mut self, target: DeviceId, packet: &Packet) -> bool;

    /// Next pending frame, if any. Never blocks.
    fn receive(&mut self) -> Option<Frame>;

    /// How long a sent message may wait for its link acknowledgement
    fn ack_timeout_us(&self) -> u64 {
        DEFAULT_ACK_TIMEOUT_US
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;

    /// Records transmitted packets and serves queued frames
    #[derive(Debug, Default)]
    pub struct MockHardware {
        pub enabled: bool,
        pub fail_enable: bool,
        pub fail_transmit: bool,
        pub sent: Vec<(DeviceId, Packet)>,
        pub inbox: VecDeque<Frame>,
        pub now: u64,
    }

    impl MockHardware {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl Clock for MockHardware {
        fn uptime_us(&self) -> u64 {
            self.now
        }
    }

    impl Hardware for MockHardware {
        fn enable_hardware(&mut self) -> bool {
            self.enabled = !self.fail_enable;
            self.enabled
        }

        fn disable_hardware(&mut self) {
            self.enabled = false;
        }

        fn transmit(&mut self, target: DeviceId, packet: &Packet) -> bool {
            if !self.enabled || self.fail_transmit {
                return false;
            }
            self.sent.push((target, *packet));
            true
        }

        fn receive(&mut self) -> Option<Frame> {
            if !self.enabled {
                return None;
            }
            self.inbox.pop_front()
        }
    }
}
