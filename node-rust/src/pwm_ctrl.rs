//! # pwm_ctrl
//!
//! N-channel PWM driver over a 13-bit peripheral. Polarity inversion means
//! the hardware receives `DUTY_MAX - duty`; the last logical duty is cached
//! and reported upward. Ramping steps the hardware linearly toward the
//! target while the cache (and the state hook) carry the target
//! immediately.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::info;

use crate::hal::PwmHal;
use crate::relay_ctrl::DriverError;

pub const PWM_CH_MAX: usize = 16;
/// 13-bit duty resolution.
pub const DUTY_MAX: u32 = (1 << 13) - 1;

const RAMP_STEP_MS: u64 = 20;

pub type PwmHook = Arc<dyn Fn(usize, u32) + Send + Sync>;

struct Bank {
    count: usize,
    inverted_mask: u32,
    duty: Vec<u32>,
    fade_tasks: Vec<Option<JoinHandle<()>>>,
}

impl Bank {
    fn is_inverted(&self, ch: usize) -> bool {
        (self.inverted_mask >> ch) & 1 != 0
    }

    fn hw_duty(&self, ch: usize, duty: u32) -> u32 {
        if self.is_inverted(ch) {
            DUTY_MAX - duty
        } else {
            duty
        }
    }
}

pub struct PwmCtrl {
    pwm: Arc<dyn PwmHal>,
    bank: Mutex<Option<Bank>>,
    hook: Mutex<Option<PwmHook>>,
}

impl PwmCtrl {
    pub fn new(pwm: Arc<dyn PwmHal>) -> Arc<Self> {
        Arc::new(Self {
            pwm,
            bank: Mutex::new(None),
            hook: Mutex::new(None),
        })
    }

    pub fn init(&self, pins: &[u8], inverted_mask: u32, freq_hz: u32) -> Result<(), DriverError> {
        if pins.len() > PWM_CH_MAX {
            return Err(DriverError::TooManyChannels(pins.len()));
        }
        self.deinit();

        for (ch, &pin) in pins.iter().enumerate() {
            if let Err(e) = self.pwm.configure_channel(ch, pin, freq_hz) {
                for prev in 0..ch {
                    self.pwm.release_channel(prev);
                }
                return Err(e.into());
            }
        }

        let count = pins.len();
        *self.bank.lock().unwrap() = Some(Bank {
            count,
            inverted_mask,
            duty: vec![0; count],
            fade_tasks: (0..count).map(|_| None).collect(),
        });
        info!(
            count,
            freq_hz,
            inverted_mask = format_args!("{inverted_mask:#06x}"),
            "pwm init ok"
        );
        Ok(())
    }

    pub fn deinit(&self) {
        let mut guard = self.bank.lock().unwrap();
        let Some(bank) = guard.take() else { return };
        for ch in 0..bank.count {
            if let Some(task) = &bank.fade_tasks[ch] {
                task.abort();
            }
            self.pwm.apply_duty(ch, 0);
            self.pwm.release_channel(ch);
        }
    }

    pub fn set_duty(&self, ch: usize, duty: u32) -> Result<(), DriverError> {
        let duty = duty.min(DUTY_MAX);
        {
            let mut guard = self.bank.lock().unwrap();
            let bank = guard.as_mut().ok_or(DriverError::NotInitialized)?;
            if ch >= bank.count {
                return Err(DriverError::ChannelOutOfRange(ch));
            }
            if let Some(task) = bank.fade_tasks[ch].take() {
                task.abort();
            }
            let hw = bank.hw_duty(ch, duty);
            self.pwm.apply_duty(ch, hw);
            bank.duty[ch] = duty;
        }
        self.fire_hook(ch, duty);
        Ok(())
    }

    pub fn get_duty(&self, ch: usize) -> Result<u32, DriverError> {
        let guard = self.bank.lock().unwrap();
        let bank = guard.as_ref().ok_or(DriverError::NotInitialized)?;
        bank.duty
            .get(ch)
            .copied()
            .ok_or(DriverError::ChannelOutOfRange(ch))
    }

    /// Ramp the hardware toward `duty` over `fade_ms`. The cached duty (and
    /// the hook) carry the target right away; only the electrical output
    /// lags.
    pub fn fade_to(self: &Arc<Self>, ch: usize, duty: u32, fade_ms: u32) -> Result<(), DriverError> {
        let target = duty.min(DUTY_MAX);
        if fade_ms == 0 {
            return self.set_duty(ch, target);
        }

        let (start, inverted) = {
            let mut guard = self.bank.lock().unwrap();
            let bank = guard.as_mut().ok_or(DriverError::NotInitialized)?;
            if ch >= bank.count {
                return Err(DriverError::ChannelOutOfRange(ch));
            }
            if let Some(task) = bank.fade_tasks[ch].take() {
                task.abort();
            }
            let start = bank.duty[ch];
            bank.duty[ch] = target;
            (start, bank.is_inverted(ch))
        };

        let pwm = Arc::clone(&self.pwm);
        let steps = (u64::from(fade_ms) / RAMP_STEP_MS).max(1);
        let task = tokio::spawn(async move {
            for i in 1..=steps {
                sleep(Duration::from_millis(RAMP_STEP_MS.min(u64::from(fade_ms)))).await;
                let cur = (i64::from(start)
                    + (i64::from(target) - i64::from(start)) * i as i64 / steps as i64)
                    as u32;
                let hw = if inverted { DUTY_MAX - cur } else { cur };
                pwm.apply_duty(ch, hw);
            }
        });

        let mut guard = self.bank.lock().unwrap();
        if let Some(bank) = guard.as_mut() {
            if let Some(old) = bank.fade_tasks[ch].replace(task) {
                old.abort();
            }
        } else {
            task.abort();
        }
        self.fire_hook(ch, target);
        Ok(())
    }

    /// Re-apply the cached duty (after a `stop`).
    pub fn start(&self, ch: usize) -> Result<(), DriverError> {
        let duty = self.get_duty(ch)?;
        self.set_duty(ch, duty)
    }

    /// Drive the output to zero; the cache follows.
    pub fn stop(&self, ch: usize) -> Result<(), DriverError> {
        self.set_duty(ch, 0)
    }

    pub fn set_state_hook(&self, hook: PwmHook) {
        *self.hook.lock().unwrap() = Some(hook);
    }

    fn fire_hook(&self, ch: usize, duty: u32) {
        if let Some(hook) = self.hook.lock().unwrap().clone() {
            hook(ch, duty);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::SimPwm;
    use tokio::time::advance;

    fn setup(inverted: u32) -> (Arc<SimPwm>, Arc<PwmCtrl>) {
        let hal = Arc::new(SimPwm::new());
        let pwm = PwmCtrl::new(hal.clone());
        pwm.init(&[18, 19], inverted, 5000).unwrap();
        (hal, pwm)
    }

    #[tokio::test]
    async fn inversion_reaches_hardware() {
        let (hal, pwm) = setup(0b01);
        pwm.set_duty(0, 1000).unwrap();
        assert_eq!(hal.duty(0), Some(DUTY_MAX - 1000));
        assert_eq!(pwm.get_duty(0).unwrap(), 1000);

        pwm.set_duty(1, 1000).unwrap();
        assert_eq!(hal.duty(1), Some(1000));
    }

    #[tokio::test]
    async fn duty_clamped_to_resolution() {
        let (hal, pwm) = setup(0);
        pwm.set_duty(0, 1_000_000).unwrap();
        assert_eq!(hal.duty(0), Some(DUTY_MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn fade_lands_on_target() {
        let (hal, pwm) = setup(0);
        pwm.fade_to(0, 4096, 200).unwrap();
        // cache carries the target immediately
        assert_eq!(pwm.get_duty(0).unwrap(), 4096);
        advance(Duration::from_millis(300)).await;
        assert_eq!(hal.duty(0), Some(4096));
    }

    #[tokio::test(start_paused = true)]
    async fn set_duty_cancels_running_fade() {
        let (hal, pwm) = setup(0);
        pwm.fade_to(0, 8000, 10_000).unwrap();
        advance(Duration::from_millis(40)).await;
        pwm.set_duty(0, 100).unwrap();
        advance(Duration::from_millis(200)).await;
        assert_eq!(hal.duty(0), Some(100));
    }

    #[tokio::test]
    async fn stop_then_start_reapplies() {
        let (hal, pwm) = setup(0);
        pwm.set_duty(0, 2000).unwrap();
        pwm.stop(0).unwrap();
        assert_eq!(hal.duty(0), Some(0));
        // stop writes through the cache as well
        pwm.start(0).unwrap();
        assert_eq!(hal.duty(0), Some(0));
    }

    #[tokio::test]
    async fn freq_reaches_peripheral() {
        let (hal, _pwm) = setup(0);
        assert_eq!(hal.freq_hz(0), Some(5000));
    }
}
