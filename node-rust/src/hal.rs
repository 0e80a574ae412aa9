//! # hal
//!
//! The electrical pin layer consumed by the drivers. The real GPIO matrix
//! and PWM peripheral live outside this crate; the drivers only ever talk
//! to these two traits. [`SimGpio`] and [`SimPwm`] are the in-tree
//! implementations used by the binary and the test harness: plain in-memory
//! pin state plus an edge channel that stands in for the GPIO interrupt
//! service.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum HalError {
    #[error("pin {0} is unavailable")]
    PinUnavailable(u8),
}

// ── Traits ────────────────────────────────────────────────────────────────────

/// Digital pin access. `write`/`read` operate on the raw electrical level;
/// polarity and inversion are driver concerns.
pub trait GpioHal: Send + Sync {
    fn configure_output(&self, pin: u8, open_drain: bool) -> Result<(), HalError>;
    fn configure_input(&self, pin: u8, pullup: bool, pulldown: bool) -> Result<(), HalError>;
    fn write(&self, pin: u8, high: bool);
    fn read(&self, pin: u8) -> bool;
    /// Return the pin to its unconfigured default.
    fn release(&self, pin: u8);
    /// Register the channel on which pin numbers are delivered on any edge.
    fn set_edge_sender(&self, tx: mpsc::UnboundedSender<u8>);
}

/// PWM peripheral access. Duty values are raw 13-bit; inversion is applied
/// by the driver before the value reaches this layer.
pub trait PwmHal: Send + Sync {
    fn configure_channel(&self, ch: usize, pin: u8, freq_hz: u32) -> Result<(), HalError>;
    fn apply_duty(&self, ch: usize, duty: u32);
    fn release_channel(&self, ch: usize);
}

// ── Simulated GPIO ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum PinMode {
    Output { open_drain: bool },
    Input { pullup: bool, pulldown: bool },
}

#[derive(Debug)]
struct PinState {
    mode: PinMode,
    level: bool,
}

#[derive(Default)]
pub struct SimGpio {
    pins: Mutex<HashMap<u8, PinState>>,
    edge_tx: Mutex<Option<mpsc::UnboundedSender<u8>>>,
    /// Pins that refuse configuration (test knob for init-failure paths).
    broken: Mutex<Vec<u8>>,
}

impl SimGpio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a pin refuse configuration from now on.
    pub fn break_pin(&self, pin: u8) {
        self.broken.lock().unwrap().push(pin);
    }

    /// Drive an input pin from the outside (button, sensor). Fires the edge
    /// channel when the level actually changes.
    pub fn inject_level(&self, pin: u8, high: bool) {
        let mut pins = self.pins.lock().unwrap();
        if let Some(p) = pins.get_mut(&pin) {
            if matches!(p.mode, PinMode::Input { .. }) && p.level != high {
                p.level = high;
                drop(pins);
                if let Some(tx) = self.edge_tx.lock().unwrap().as_ref() {
                    let _ = tx.send(pin);
                }
            }
        }
    }

    /// Current electrical level as seen from outside (test observation).
    pub fn level(&self, pin: u8) -> Option<bool> {
        self.pins.lock().unwrap().get(&pin).map(|p| p.level)
    }

    pub fn is_configured(&self, pin: u8) -> bool {
        self.pins.lock().unwrap().contains_key(&pin)
    }
}

impl GpioHal for SimGpio {
    fn configure_output(&self, pin: u8, open_drain: bool) -> Result<(), HalError> {
        if self.broken.lock().unwrap().contains(&pin) {
            return Err(HalError::PinUnavailable(pin));
        }
        self.pins.lock().unwrap().insert(
            pin,
            PinState {
                mode: PinMode::Output { open_drain },
                level: false,
            },
        );
        Ok(())
    }

    fn configure_input(&self, pin: u8, pullup: bool, pulldown: bool) -> Result<(), HalError> {
        if self.broken.lock().unwrap().contains(&pin) {
            return Err(HalError::PinUnavailable(pin));
        }
        // idle level follows the pull resistor
        self.pins.lock().unwrap().insert(
            pin,
            PinState {
                mode: PinMode::Input { pullup, pulldown },
                level: pullup && !pulldown,
            },
        );
        Ok(())
    }

    fn write(&self, pin: u8, high: bool) {
        if let Some(p) = self.pins.lock().unwrap().get_mut(&pin) {
            if matches!(p.mode, PinMode::Output { .. }) {
                p.level = high;
            }
        }
    }

    fn read(&self, pin: u8) -> bool {
        self.pins
            .lock()
            .unwrap()
            .get(&pin)
            .map(|p| p.level)
            .unwrap_or(false)
    }

    fn release(&self, pin: u8) {
        self.pins.lock().unwrap().remove(&pin);
    }

    fn set_edge_sender(&self, tx: mpsc::UnboundedSender<u8>) {
        *self.edge_tx.lock().unwrap() = Some(tx);
    }
}

// ── Simulated PWM ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct PwmChannel {
    pin: u8,
    freq_hz: u32,
    duty: u32,
}

#[derive(Default)]
pub struct SimPwm {
    channels: Mutex<HashMap<usize, PwmChannel>>,
    broken: Mutex<Vec<u8>>,
}

impl SimPwm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn break_pin(&self, pin: u8) {
        self.broken.lock().unwrap().push(pin);
    }

    /// Raw duty currently applied to the peripheral (test observation).
    pub fn duty(&self, ch: usize) -> Option<u32> {
        self.channels.lock().unwrap().get(&ch).map(|c| c.duty)
    }

    pub fn freq_hz(&self, ch: usize) -> Option<u32> {
        self.channels.lock().unwrap().get(&ch).map(|c| c.freq_hz)
    }
}

impl PwmHal for SimPwm {
    fn configure_channel(&self, ch: usize, pin: u8, freq_hz: u32) -> Result<(), HalError> {
        if self.broken.lock().unwrap().contains(&pin) {
            return Err(HalError::PinUnavailable(pin));
        }
        self.channels
            .lock()
            .unwrap()
            .insert(ch, PwmChannel { pin, freq_hz, duty: 0 });
        Ok(())
    }

    fn apply_duty(&self, ch: usize, duty: u32) {
        if let Some(c) = self.channels.lock().unwrap().get_mut(&ch) {
            c.duty = duty;
        }
    }

    fn release_channel(&self, ch: usize) {
        self.channels.lock().unwrap().remove(&ch);
    }
}
