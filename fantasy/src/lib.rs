//! # Fantasy Console Comms Backend
//!
//! Runs the comms stack on the desktop. Two [`Controller`]s talk over an
//! in-memory [`FantasyUart`] link and share a [`SimClock`] that only moves
//! when the simulation is stepped, so complete sessions are deterministic.
//!
//! ```text
//!  Controller a ──► FantasyUart ══ link ══ FantasyUart ◄── Controller b
//!                        └──────── SimClock ───────┘
//! ```

pub mod config;
pub mod uart;

use comms::controller::Controller;
use log::info;

pub use config::{SimConfig, SimError};
pub use uart::{FantasyUart, SimClock, UartOptions};

/// Two linked devices and their clock
pub struct Simulation {
    pub a: Controller<FantasyUart>,
    pub b: Controller<FantasyUart>,
    clock: SimClock,
}

impl Simulation {
    /// Create both devices with their transceivers enabled
    pub fn new(config: &SimConfig) -> Self {
        let clock = SimClock::new();
        let (uart_a, uart_b) = FantasyUart::pair(config.uart, clock.clone());
        let [id_a, id_b] = config.device_ids;
        let mut a = Controller::new(id_a, uart_a, config.controller.clone());
        let mut b = Controller::new(id_b, uart_b, config.controller.clone());
        a.enable();
        b.enable();
        info!("simulating devices {} and {}", id_a, id_b);
        Self { a, b, clock }
    }

    pub fn clock(&self) -> &SimClock {
        &self.clock
    }

    /// Advance the clock by `us` and tick both devices
    pub fn step(&mut self, us: u64) {
        self.clock.advance(us);
        self.a.tick();
        self.b.tick();
    }

    /// Step until both devices are idle and the link is empty. Returns
    /// `false` if that did not happen within `max_steps`.
    pub fn run_until_idle(&mut self, step_us: u64, max_steps: usize) -> bool {
        for _ in 0..max_steps {
            self.step(step_us);
            if self.is_idle() {
                return true;
            }
        }
        false
    }

    pub fn is_idle(&self) -> bool {
        self.a.is_idle()
            && self.b.is_idle()
            && self.a.hardware().pending_rx() == 0
            && self.b.hardware().pending_rx() == 0
    }
}
