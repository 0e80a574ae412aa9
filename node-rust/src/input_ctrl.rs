//! # input_ctrl
//!
//! N-channel edge-triggered input driver with per-channel debounce. The
//! edge source only restarts the channel's one-shot debounce timer; the
//! level decision happens in task context after the interval: the pin is
//! re-sampled and the hook fires only when the logical level (raw XOR
//! inverted bit) changed since the last report.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::info;

use crate::hal::GpioHal;
use crate::relay_ctrl::DriverError;

pub const INPUT_CH_MAX: usize = 16;

pub type InputHook = Arc<dyn Fn(usize, bool) + Send + Sync>;

struct Bank {
    pins: Vec<u8>,
    inverted_mask: u32,
    level: Vec<bool>,
    debounce_ms: Vec<u32>,
    db_tasks: Vec<Option<JoinHandle<()>>>,
}

impl Bank {
    fn is_inverted(&self, ch: usize) -> bool {
        (self.inverted_mask >> ch) & 1 != 0
    }
}

pub struct InputCtrl {
    gpio: Arc<dyn GpioHal>,
    bank: Mutex<Option<Bank>>,
    hook: Mutex<Option<InputHook>>,
    irq_enabled: AtomicBool,
    edge_task: Mutex<Option<JoinHandle<()>>>,
}

impl InputCtrl {
    pub fn new(gpio: Arc<dyn GpioHal>) -> Arc<Self> {
        Arc::new(Self {
            gpio,
            bank: Mutex::new(None),
            hook: Mutex::new(None),
            irq_enabled: AtomicBool::new(false),
            edge_task: Mutex::new(None),
        })
    }

    pub fn init(
        self: &Arc<Self>,
        pins: &[u8],
        pullup_mask: u32,
        pulldown_mask: u32,
        inverted_mask: u32,
        default_debounce_ms: u32,
    ) -> Result<(), DriverError> {
        if pins.len() > INPUT_CH_MAX {
            return Err(DriverError::TooManyChannels(pins.len()));
        }
        self.deinit();

        let debounce = if default_debounce_ms == 0 {
            20
        } else {
            default_debounce_ms
        };

        for (ch, &pin) in pins.iter().enumerate() {
            let pullup = (pullup_mask >> ch) & 1 != 0;
            let pulldown = (pulldown_mask >> ch) & 1 != 0;
            if let Err(e) = self.gpio.configure_input(pin, pullup, pulldown) {
                for &p in &pins[..ch] {
                    self.gpio.release(p);
                }
                return Err(e.into());
            }
        }

        let count = pins.len();
        let level = pins
            .iter()
            .enumerate()
            .map(|(ch, &pin)| self.gpio.read(pin) != ((inverted_mask >> ch) & 1 != 0))
            .collect();

        *self.bank.lock().unwrap() = Some(Bank {
            pins: pins.to_vec(),
            inverted_mask,
            level,
            debounce_ms: vec![debounce; count],
            db_tasks: (0..count).map(|_| None).collect(),
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.gpio.set_edge_sender(tx);
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(pin) = rx.recv().await {
                if !this.irq_enabled.load(Ordering::Relaxed) {
                    continue;
                }
                this.on_edge(pin);
            }
        });
        *self.edge_task.lock().unwrap() = Some(task);
        self.irq_enabled.store(true, Ordering::Relaxed);

        info!(count, default_debounce_ms = debounce, "input init ok");
        Ok(())
    }

    pub fn deinit(&self) {
        if let Some(task) = self.edge_task.lock().unwrap().take() {
            task.abort();
        }
        let mut guard = self.bank.lock().unwrap();
        let Some(bank) = guard.take() else { return };
        for (ch, &pin) in bank.pins.iter().enumerate() {
            if let Some(task) = &bank.db_tasks[ch] {
                task.abort();
            }
            self.gpio.release(pin);
        }
        self.irq_enabled.store(false, Ordering::Relaxed);
    }

    pub fn set_debounce_ms(&self, ch: usize, ms: u32) -> Result<(), DriverError> {
        let mut guard = self.bank.lock().unwrap();
        let bank = guard.as_mut().ok_or(DriverError::NotInitialized)?;
        if ch >= bank.pins.len() {
            return Err(DriverError::ChannelOutOfRange(ch));
        }
        bank.debounce_ms[ch] = ms;
        Ok(())
    }

    /// Last reported logical level; false for unknown channels.
    pub fn get_level(&self, ch: usize) -> bool {
        self.bank
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|b| b.level.get(ch).copied())
            .unwrap_or(false)
    }

    pub fn set_state_hook(&self, hook: InputHook) {
        *self.hook.lock().unwrap() = Some(hook);
    }

    pub fn enable_irq(&self, enable: bool) {
        self.irq_enabled.store(enable, Ordering::Relaxed);
    }

    // ── internals ─────────────────────────────────────────────────────────────

    /// Edge seen on a pin: (re)start that channel's debounce timer. The
    /// actual read/compare runs after the interval.
    fn on_edge(self: &Arc<Self>, pin: u8) {
        let (ch, ms) = {
            let guard = self.bank.lock().unwrap();
            let Some(bank) = guard.as_ref() else { return };
            let Some(ch) = bank.pins.iter().position(|&p| p == pin) else {
                return;
            };
            (ch, bank.debounce_ms[ch])
        };

        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            sleep(Duration::from_millis(u64::from(ms))).await;
            this.settle(ch);
        });

        let mut guard = self.bank.lock().unwrap();
        if let Some(bank) = guard.as_mut() {
            if let Some(old) = bank.db_tasks[ch].replace(task) {
                old.abort();
            }
        } else {
            task.abort();
        }
    }

    /// Debounce expired: re-sample and report on change.
    fn settle(&self, ch: usize) {
        let changed = {
            let mut guard = self.bank.lock().unwrap();
            let Some(bank) = guard.as_mut() else { return };
            let Some(&pin) = bank.pins.get(ch) else { return };
            let logical = self.gpio.read(pin) != bank.is_inverted(ch);
            if logical != bank.level[ch] {
                bank.level[ch] = logical;
                Some(logical)
            } else {
                None
            }
        };
        if let Some(level) = changed {
            if let Some(hook) = self.hook.lock().unwrap().clone() {
                hook(ch, level);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::SimGpio;
    use tokio::time::advance;

    fn setup(inverted: u32) -> (Arc<SimGpio>, Arc<InputCtrl>, Arc<Mutex<Vec<(usize, bool)>>>) {
        let gpio = Arc::new(SimGpio::new());
        let inputs = InputCtrl::new(gpio.clone());
        inputs.init(&[4, 5], 0, 0, inverted, 30).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        inputs.set_state_hook(Arc::new(move |ch, lvl| sink.lock().unwrap().push((ch, lvl))));
        (gpio, inputs, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn stable_edge_reports_once() {
        let (gpio, inputs, seen) = setup(0);
        gpio.inject_level(4, true);
        advance(Duration::from_millis(40)).await;
        assert_eq!(*seen.lock().unwrap(), vec![(0, true)]);
        assert!(inputs.get_level(0));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_shorter_than_debounce_reports_at_most_once() {
        let (gpio, _inputs, seen) = setup(0);
        for _ in 0..5 {
            gpio.inject_level(4, true);
            advance(Duration::from_millis(3)).await;
            gpio.inject_level(4, false);
            advance(Duration::from_millis(3)).await;
        }
        gpio.inject_level(4, true);
        advance(Duration::from_millis(60)).await;
        assert_eq!(*seen.lock().unwrap(), vec![(0, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn bounce_back_to_old_level_reports_nothing() {
        let (gpio, _inputs, seen) = setup(0);
        gpio.inject_level(4, true);
        advance(Duration::from_millis(10)).await;
        gpio.inject_level(4, false);
        advance(Duration::from_millis(60)).await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn inverted_channel_reports_logical_level() {
        let (gpio, inputs, seen) = setup(0b01);
        // raw low means logical high on an inverted channel
        assert!(inputs.get_level(0));
        gpio.inject_level(4, true);
        advance(Duration::from_millis(40)).await;
        assert_eq!(*seen.lock().unwrap(), vec![(0, false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn irq_disable_suppresses_reports() {
        let (gpio, inputs, seen) = setup(0);
        inputs.enable_irq(false);
        gpio.inject_level(4, true);
        advance(Duration::from_millis(60)).await;
        assert!(seen.lock().unwrap().is_empty());

        inputs.enable_irq(true);
        gpio.inject_level(4, false);
        gpio.inject_level(4, true);
        advance(Duration::from_millis(60)).await;
        assert_eq!(*seen.lock().unwrap(), vec![(0, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn per_channel_debounce_override() {
        let (gpio, inputs, seen) = setup(0);
        inputs.set_debounce_ms(1, 200).unwrap();
        gpio.inject_level(5, true);
        advance(Duration::from_millis(100)).await;
        assert!(seen.lock().unwrap().is_empty());
        advance(Duration::from_millis(150)).await;
        assert_eq!(*seen.lock().unwrap(), vec![(1, true)]);
    }
}
