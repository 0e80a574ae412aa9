//! # relay_ctrl
//!
//! N-channel digital relay driver: per-channel polarity (active-low mask),
//! open-drain mask, and one-shot auto-off timers. ON with a configured
//! auto-off arms (or re-arms) the timer; OFF always cancels it. `deinit`
//! drives every channel to its inactive electrical level before releasing
//! the pin and is idempotent.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::hal::{GpioHal, HalError};

pub const RELAY_CH_MAX: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("channel {0} out of range")]
    ChannelOutOfRange(usize),
    #[error("channel count {0} exceeds maximum")]
    TooManyChannels(usize),
    #[error("driver not initialized")]
    NotInitialized,
    #[error(transparent)]
    Hal(#[from] HalError),
}

pub type RelayHook = Arc<dyn Fn(usize, bool) + Send + Sync>;

struct Bank {
    pins: Vec<u8>,
    active_low_mask: u32,
    state: Vec<bool>,
    autoff_sec: Vec<u32>,
    off_tasks: Vec<Option<JoinHandle<()>>>,
}

impl Bank {
    fn is_active_low(&self, ch: usize) -> bool {
        (self.active_low_mask >> ch) & 1 != 0
    }

    /// Electrical level for a logical on/off on this channel.
    fn level_for(&self, ch: usize, on: bool) -> bool {
        on != self.is_active_low(ch)
    }
}

pub struct RelayCtrl {
    gpio: Arc<dyn GpioHal>,
    bank: Mutex<Option<Bank>>,
    hook: Mutex<Option<RelayHook>>,
}

impl RelayCtrl {
    pub fn new(gpio: Arc<dyn GpioHal>) -> Arc<Self> {
        Arc::new(Self {
            gpio,
            bank: Mutex::new(None),
            hook: Mutex::new(None),
        })
    }

    pub fn init(
        &self,
        pins: &[u8],
        active_low_mask: u32,
        open_drain_mask: u32,
    ) -> Result<(), DriverError> {
        if pins.len() > RELAY_CH_MAX {
            return Err(DriverError::TooManyChannels(pins.len()));
        }
        // re-config: tear the previous bank down first
        self.deinit();

        let count = pins.len();
        for (ch, &pin) in pins.iter().enumerate() {
            let open_drain = (open_drain_mask >> ch) & 1 != 0;
            if let Err(e) = self.gpio.configure_output(pin, open_drain) {
                for &p in &pins[..ch] {
                    self.gpio.release(p);
                }
                return Err(e.into());
            }
            // park at the inactive level
            let active_low = (active_low_mask >> ch) & 1 != 0;
            self.gpio.write(pin, active_low);
        }

        *self.bank.lock().unwrap() = Some(Bank {
            pins: pins.to_vec(),
            active_low_mask,
            state: vec![false; count],
            autoff_sec: vec![0; count],
            off_tasks: (0..count).map(|_| None).collect(),
        });
        info!(
            count,
            active_low_mask = format_args!("{active_low_mask:#06x}"),
            open_drain_mask = format_args!("{open_drain_mask:#06x}"),
            "relay init ok"
        );
        Ok(())
    }

    pub fn deinit(&self) {
        let mut guard = self.bank.lock().unwrap();
        let Some(bank) = guard.take() else {
            return; // idempotent
        };
        for (ch, &pin) in bank.pins.iter().enumerate() {
            if let Some(task) = &bank.off_tasks[ch] {
                task.abort();
            }
            self.gpio.write(pin, bank.level_for(ch, false));
            self.gpio.release(pin);
        }
        info!("relay deinit done");
    }

    pub fn on(self: &Arc<Self>, ch: usize) -> Result<(), DriverError> {
        self.apply(ch, true)?;
        self.arm_if_configured(ch);
        Ok(())
    }

    pub fn off(self: &Arc<Self>, ch: usize) -> Result<(), DriverError> {
        self.apply(ch, false)?;
        self.cancel_timer(ch);
        Ok(())
    }

    pub fn toggle(self: &Arc<Self>, ch: usize) -> Result<(), DriverError> {
        let now_on = {
            let guard = self.bank.lock().unwrap();
            let bank = guard.as_ref().ok_or(DriverError::NotInitialized)?;
            *bank
                .state
                .get(ch)
                .ok_or(DriverError::ChannelOutOfRange(ch))?
        };
        if now_on {
            self.off(ch)
        } else {
            self.on(ch)
        }
    }

    /// Set the auto-off interval; 0 disables. A new value while the channel
    /// is ON re-arms immediately with that value.
    pub fn set_autoff_seconds(self: &Arc<Self>, ch: usize, sec: u32) -> Result<(), DriverError> {
        let is_on = {
            let mut guard = self.bank.lock().unwrap();
            let bank = guard.as_mut().ok_or(DriverError::NotInitialized)?;
            if ch >= bank.pins.len() {
                return Err(DriverError::ChannelOutOfRange(ch));
            }
            bank.autoff_sec[ch] = sec;
            if let Some(task) = bank.off_tasks[ch].take() {
                task.abort();
            }
            bank.state[ch]
        };
        if sec > 0 && is_on {
            self.arm(ch, sec);
        }
        Ok(())
    }

    pub fn is_on(&self, ch: usize) -> bool {
        self.bank
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|b| b.state.get(ch).copied())
            .unwrap_or(false)
    }

    pub fn set_state_hook(&self, hook: RelayHook) {
        *self.hook.lock().unwrap() = Some(hook);
    }

    // ── internals ─────────────────────────────────────────────────────────────

    fn apply(&self, ch: usize, on: bool) -> Result<(), DriverError> {
        {
            let mut guard = self.bank.lock().unwrap();
            let bank = guard.as_mut().ok_or(DriverError::NotInitialized)?;
            if ch >= bank.pins.len() {
                return Err(DriverError::ChannelOutOfRange(ch));
            }
            self.gpio.write(bank.pins[ch], bank.level_for(ch, on));
            bank.state[ch] = on;
        }
        if let Some(hook) = self.hook.lock().unwrap().clone() {
            hook(ch, on);
        }
        Ok(())
    }

    fn arm_if_configured(self: &Arc<Self>, ch: usize) {
        let sec = {
            let mut guard = self.bank.lock().unwrap();
            let Some(bank) = guard.as_mut() else { return };
            if let Some(task) = bank.off_tasks[ch].take() {
                task.abort();
            }
            bank.autoff_sec[ch]
        };
        if sec > 0 {
            self.arm(ch, sec);
        }
    }

    fn arm(self: &Arc<Self>, ch: usize, sec: u32) {
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            sleep(Duration::from_secs(u64::from(sec))).await;
            if let Err(e) = this.off(ch) {
                warn!(ch, "auto-off skipped: {e}");
            }
        });
        let mut guard = self.bank.lock().unwrap();
        if let Some(bank) = guard.as_mut() {
            if let Some(old) = bank.off_tasks[ch].replace(task) {
                old.abort();
            }
        } else {
            task.abort();
        }
    }

    fn cancel_timer(&self, ch: usize) {
        let mut guard = self.bank.lock().unwrap();
        if let Some(bank) = guard.as_mut() {
            if let Some(task) = bank.off_tasks[ch].take() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::SimGpio;
    use tokio::time::advance;

    fn setup(active_low: u32) -> (Arc<SimGpio>, Arc<RelayCtrl>) {
        let gpio = Arc::new(SimGpio::new());
        let relays = RelayCtrl::new(gpio.clone());
        relays.init(&[26, 27], active_low, 0).unwrap();
        (gpio, relays)
    }

    #[tokio::test]
    async fn polarity_applied_to_pin() {
        let (gpio, relays) = setup(0b01);
        // ch0 active-low: parked high, ON drives low
        assert_eq!(gpio.level(26), Some(true));
        relays.on(0).unwrap();
        assert_eq!(gpio.level(26), Some(false));
        assert!(relays.is_on(0));
        // ch1 active-high
        relays.on(1).unwrap();
        assert_eq!(gpio.level(27), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn auto_off_fires_once() {
        let (gpio, relays) = setup(0);
        relays.set_autoff_seconds(0, 60).unwrap();
        relays.on(0).unwrap();
        assert!(relays.is_on(0));

        advance(Duration::from_secs(59)).await;
        assert!(relays.is_on(0));
        advance(Duration::from_secs(2)).await;
        assert!(!relays.is_on(0));
        assert_eq!(gpio.level(26), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn retrigger_restarts_the_timer() {
        let (_gpio, relays) = setup(0);
        relays.set_autoff_seconds(0, 10).unwrap();
        relays.on(0).unwrap();
        advance(Duration::from_secs(8)).await;
        relays.on(0).unwrap(); // retrigger
        advance(Duration::from_secs(8)).await;
        assert!(relays.is_on(0));
        advance(Duration::from_secs(3)).await;
        assert!(!relays.is_on(0));
    }

    #[tokio::test(start_paused = true)]
    async fn off_cancels_pending_auto_off() {
        let (_gpio, relays) = setup(0);
        relays.set_autoff_seconds(0, 5).unwrap();
        relays.on(0).unwrap();
        relays.off(0).unwrap();
        relays.set_autoff_seconds(0, 0).unwrap();
        relays.on(0).unwrap();
        advance(Duration::from_secs(30)).await;
        assert!(relays.is_on(0)); // no timer armed anymore
    }

    #[tokio::test]
    async fn new_autoff_while_on_rearms() {
        let (_gpio, relays) = setup(0);
        relays.on(0).unwrap();
        relays.set_autoff_seconds(0, 3).unwrap();
        tokio::time::pause();
        advance(Duration::from_secs(4)).await;
        assert!(!relays.is_on(0));
    }

    #[tokio::test]
    async fn deinit_parks_and_releases() {
        let (gpio, relays) = setup(0b10);
        relays.on(1).unwrap();
        relays.deinit();
        assert!(!gpio.is_configured(26));
        assert!(!gpio.is_configured(27));
        relays.deinit(); // idempotent
        assert!(matches!(relays.on(0), Err(DriverError::NotInitialized)));
    }

    #[tokio::test]
    async fn hook_reports_logical_state() {
        let (_gpio, relays) = setup(0b01);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        relays.set_state_hook(Arc::new(move |ch, on| sink.lock().unwrap().push((ch, on))));
        relays.on(0).unwrap();
        relays.toggle(0).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(0, true), (0, false)]);
    }
}
