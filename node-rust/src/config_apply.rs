//! # config_apply
//!
//! The configuration apply loop: overlay a (possibly partial) config
//! document onto the current record, range-check it, prove GPIO
//! exclusivity, re-initialize the drivers in order (relay, pwm, input),
//! persist atomically and announce the new mapping with a HELLO. A device
//! rename additionally schedules a reboot so broker and mesh identities
//! refresh.
//!
//! On a driver init failure the previous configuration is re-applied to
//! all three drivers; if that rollback fails too the node asks its
//! supervisor for a reboot. Either way the failure is reported as
//! `<BLOCK>_INIT_FAILED`.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::config_store::{ConfigStore, NodeConfig, DEV_NAME_MAX};
use crate::input_ctrl::InputCtrl;
use crate::mqtt_bridge::MqttBridge;
use crate::pwm_ctrl::PwmCtrl;
use crate::relay_ctrl::RelayCtrl;
use crate::router::Router;

const RENAME_REBOOT_DELAY_MS: u64 = 300;
const GPIO_COUNT: usize = 40;

// ── GPIO exclusivity ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PinRole {
    Relay,
    Pwm,
    Input,
}

impl PinRole {
    fn as_str(self) -> &'static str {
        match self {
            PinRole::Relay => "RELAY",
            PinRole::Pwm => "PWM",
            PinRole::Input => "INPUT",
        }
    }
}

fn is_flash_reserved(gpio: u8) -> bool {
    (6..=11).contains(&gpio)
}

fn is_input_only(gpio: u8) -> bool {
    (34..=39).contains(&gpio)
}

fn claim_pin(
    gpio: u8,
    role: PinRole,
    used: &mut [Option<PinRole>; GPIO_COUNT],
) -> Result<(), String> {
    if usize::from(gpio) >= GPIO_COUNT {
        return Err(format!("invalid gpio {gpio}"));
    }
    if is_flash_reserved(gpio) {
        return Err(format!("gpio {gpio} is reserved for SPI flash"));
    }
    if role != PinRole::Input && is_input_only(gpio) {
        return Err(format!(
            "gpio {gpio} is input-only; not allowed for {}",
            role.as_str()
        ));
    }
    match used[usize::from(gpio)] {
        Some(owner) if owner != role => Err(format!(
            "gpio {gpio} used by {} and {}",
            owner.as_str(),
            role.as_str()
        )),
        Some(_) => Err(format!(
            "gpio {gpio} is duplicated in {} list",
            role.as_str()
        )),
        None => {
            used[usize::from(gpio)] = Some(role);
            Ok(())
        }
    }
}

/// Walk relays, then PWMs, then inputs, claiming each pin for its role.
fn validate_gpio_exclusivity(cfg: &NodeConfig) -> Result<(), String> {
    let mut used: [Option<PinRole>; GPIO_COUNT] = [None; GPIO_COUNT];
    for &gpio in &cfg.relays.gpio {
        claim_pin(gpio, PinRole::Relay, &mut used)?;
    }
    for &gpio in &cfg.pwm.gpio {
        claim_pin(gpio, PinRole::Pwm, &mut used)?;
    }
    for &gpio in &cfg.inputs.gpio {
        claim_pin(gpio, PinRole::Input, &mut used)?;
    }
    Ok(())
}

// ── Overlay ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Overlay {
    cfg: NodeConfig,
    any_change: bool,
    name_changed: bool,
}

fn read_pin_array(v: &Value, field: &str) -> Result<Vec<u8>, String> {
    let arr = v.as_array().ok_or_else(|| format!("{field} invalid"))?;
    let mut pins = Vec::with_capacity(arr.len());
    for item in arr {
        let n = item.as_i64().ok_or_else(|| format!("{field} invalid"))?;
        if !(0..=39).contains(&n) {
            return Err(format!("{field} out of range"));
        }
        pins.push(n as u8);
    }
    Ok(pins)
}

fn read_u32_array(v: &Value, field: &str) -> Result<Vec<u32>, String> {
    let arr = v.as_array().ok_or_else(|| format!("{field} invalid"))?;
    arr.iter()
        .map(|item| {
            item.as_u64()
                .map(|n| n as u32)
                .ok_or_else(|| format!("{field} invalid"))
        })
        .collect()
}

fn read_opt_u32(obj: &Value, key: &str) -> Option<u32> {
    obj.get(key).and_then(Value::as_u64).map(|v| v as u32)
}

/// Overlay provided fields on a copy of the current record. Missing keys
/// keep their current values.
fn overlay(cur: &NodeConfig, root: &Value) -> Result<Overlay, String> {
    let mut cfg = cur.clone();
    let mut any_change = false;
    let mut name_changed = false;

    if let Some(device) = root.get("device").filter(|d| d.is_object()) {
        if let Some(name) = device.get("name").and_then(Value::as_str) {
            if name.is_empty() || name.len() > DEV_NAME_MAX {
                return Err("device.name out of range".into());
            }
            if cfg.dev_name != name {
                cfg.dev_name = name.to_string();
                name_changed = true;
            }
            any_change = true;
        }
    }

    if let Some(rel) = root.get("relays").filter(|r| r.is_object()) {
        if let Some(gpio) = rel.get("gpio") {
            cfg.relays.gpio = read_pin_array(gpio, "relays.gpio")?;
            cfg.relays.autoff_sec.resize(cfg.relays.gpio.len(), 0);
            any_change = true;
        }
        if let Some(mask) = read_opt_u32(rel, "active_low_mask") {
            cfg.relays.active_low_mask = mask;
            any_change = true;
        }
        if let Some(mask) = read_opt_u32(rel, "open_drain_mask") {
            cfg.relays.open_drain_mask = mask;
            any_change = true;
        }
        if let Some(aut) = rel.get("autoff_sec") {
            let secs = read_u32_array(aut, "relays.autoff_sec")?;
            let n = secs.len().min(cfg.relays.gpio.len());
            cfg.relays.autoff_sec[..n].copy_from_slice(&secs[..n]);
            any_change = true;
        }
    }

    if let Some(pwm) = root.get("pwm").filter(|p| p.is_object()) {
        if let Some(gpio) = pwm.get("gpio") {
            cfg.pwm.gpio = read_pin_array(gpio, "pwm.gpio")?;
            any_change = true;
        }
        if let Some(mask) = read_opt_u32(pwm, "inverted_mask") {
            cfg.pwm.inverted_mask = mask;
            any_change = true;
        }
        if let Some(freq) = read_opt_u32(pwm, "freq_hz") {
            if !(50..=40_000).contains(&freq) {
                return Err("pwm.freq_hz out of range".into());
            }
            cfg.pwm.freq_hz = freq;
            any_change = true;
        }
    }

    if let Some(inp) = root.get("inputs").filter(|i| i.is_object()) {
        if let Some(gpio) = inp.get("gpio") {
            cfg.inputs.gpio = read_pin_array(gpio, "inputs.gpio")?;
            cfg.inputs.debounce_ms.resize(cfg.inputs.gpio.len(), 30);
            any_change = true;
        }
        if let Some(mask) = read_opt_u32(inp, "pullup_mask") {
            cfg.inputs.pullup_mask = mask;
            any_change = true;
        }
        if let Some(mask) = read_opt_u32(inp, "pulldown_mask") {
            cfg.inputs.pulldown_mask = mask;
            any_change = true;
        }
        if let Some(mask) = read_opt_u32(inp, "inverted_mask") {
            cfg.inputs.inverted_mask = mask;
            any_change = true;
        }
        if let Some(db) = inp.get("debounce_ms") {
            let ms = read_u32_array(db, "inputs.debounce_ms")?;
            let n = ms.len().min(cfg.inputs.gpio.len());
            cfg.inputs.debounce_ms[..n].copy_from_slice(&ms[..n]);
            any_change = true;
        }
    }

    Ok(Overlay {
        cfg,
        any_change,
        name_changed,
    })
}

// ── Apply procedure ───────────────────────────────────────────────────────────

pub struct ConfigApply {
    local_dev: String,
    store: Arc<ConfigStore>,
    bridge: Arc<MqttBridge>,
    router: Arc<Router>,
    relays: Arc<RelayCtrl>,
    pwm: Arc<PwmCtrl>,
    inputs: Arc<InputCtrl>,
    reboot_tx: mpsc::Sender<String>,
}

impl ConfigApply {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_dev: &str,
        store: Arc<ConfigStore>,
        bridge: Arc<MqttBridge>,
        router: Arc<Router>,
        relays: Arc<RelayCtrl>,
        pwm: Arc<PwmCtrl>,
        inputs: Arc<InputCtrl>,
        reboot_tx: mpsc::Sender<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_dev: local_dev.to_string(),
            store,
            bridge,
            router,
            relays,
            pwm,
            inputs,
            reboot_tx,
        })
    }

    pub async fn handle(&self, json_text: &str) {
        let Ok(root) = serde_json::from_str::<Value>(json_text) else {
            self.publish_cfg_state("", "ERROR", Some("INVALID_JSON")).await;
            return;
        };

        let corr_id = root
            .get("corr_id")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        // the bridge already forwarded foreign configs; a mismatch here is
        // a routing error
        if let Some(target) = root.get("target_dev").and_then(Value::as_str) {
            if target != self.local_dev {
                self.publish_cfg_state(&corr_id, "ERROR", Some("WRONG_TARGET"))
                    .await;
                return;
            }
        }

        let cur = self.store.cached().await;
        let patch = match overlay(&cur, &root) {
            Ok(o) => o,
            Err(detail) => {
                self.publish_cfg_state(&corr_id, "ERROR", Some(&detail)).await;
                return;
            }
        };
        if !patch.any_change {
            self.publish_cfg_state(&corr_id, "ERROR", Some("NO_EFFECT"))
                .await;
            return;
        }
        let next = patch.cfg;

        if let Err(why) = validate_gpio_exclusivity(&next) {
            error!("config rejected: {why}");
            self.publish_cfg_state(&corr_id, "ERROR", Some(&why)).await;
            return;
        }

        // drivers restart against the new mapping, in order
        if let Err(e) = self.init_relays(&next) {
            warn!("relay init failed: {e}");
            self.rollback(&cur).await;
            self.publish_cfg_state(&corr_id, "ERROR", Some("RELAY_INIT_FAILED"))
                .await;
            return;
        }
        if let Err(e) = self.init_pwm(&next) {
            warn!("pwm init failed: {e}");
            self.rollback(&cur).await;
            self.publish_cfg_state(&corr_id, "ERROR", Some("PWM_INIT_FAILED"))
                .await;
            return;
        }
        if let Err(e) = self.init_inputs(&next) {
            warn!("input init failed: {e}");
            self.rollback(&cur).await;
            self.publish_cfg_state(&corr_id, "ERROR", Some("INPUT_INIT_FAILED"))
                .await;
            return;
        }

        // only now persist
        if let Err(e) = self.store.save(&next).await {
            error!("config save failed: {e}");
            self.publish_cfg_state(&corr_id, "ERROR", Some("CONFIG_SAVE_FAILED"))
                .await;
            return;
        }

        self.publish_cfg_state(&corr_id, "OK", None).await;
        info!(
            relays = next.relays.gpio.len(),
            pwm = next.pwm.gpio.len(),
            inputs = next.inputs.gpio.len(),
            "full config applied"
        );

        self.router.emit_hello(build_hello(&next)).await;

        if patch.name_changed {
            info!(
                "device renamed '{}' -> '{}', rebooting to refresh identities",
                cur.dev_name, next.dev_name
            );
            sleep(Duration::from_millis(RENAME_REBOOT_DELAY_MS)).await;
            let _ = self.reboot_tx.send("device renamed".to_string()).await;
        }
    }

    fn init_relays(&self, cfg: &NodeConfig) -> Result<(), crate::relay_ctrl::DriverError> {
        self.relays.init(
            &cfg.relays.gpio,
            cfg.relays.active_low_mask,
            cfg.relays.open_drain_mask,
        )?;
        for (ch, &sec) in cfg.relays.autoff_sec.iter().enumerate() {
            self.relays.set_autoff_seconds(ch, sec)?;
        }
        Ok(())
    }

    fn init_pwm(&self, cfg: &NodeConfig) -> Result<(), crate::relay_ctrl::DriverError> {
        self.pwm
            .init(&cfg.pwm.gpio, cfg.pwm.inverted_mask, cfg.pwm.freq_hz)
    }

    fn init_inputs(&self, cfg: &NodeConfig) -> Result<(), crate::relay_ctrl::DriverError> {
        self.inputs.init(
            &cfg.inputs.gpio,
            cfg.inputs.pullup_mask,
            cfg.inputs.pulldown_mask,
            cfg.inputs.inverted_mask,
            30,
        )?;
        for (ch, &ms) in cfg.inputs.debounce_ms.iter().enumerate() {
            self.inputs.set_debounce_ms(ch, ms)?;
        }
        Ok(())
    }

    /// Re-apply the previous configuration after a failed init. If even
    /// that fails the hardware state is unknown; hand it to the supervisor.
    async fn rollback(&self, prev: &NodeConfig) {
        let result = self
            .init_relays(prev)
            .and_then(|()| self.init_pwm(prev))
            .and_then(|()| self.init_inputs(prev));
        if let Err(e) = result {
            error!("driver rollback failed ({e}), requesting reboot");
            let _ = self.reboot_tx.send("driver rollback failed".to_string()).await;
        }
    }

    async fn publish_cfg_state(&self, corr_id: &str, status: &str, detail: Option<&str>) {
        let topic = format!("{}/{}/State", self.bridge.base_prefix(), self.local_dev);
        let mut doc = json!({
            "corr_id": corr_id,
            "dev": self.local_dev,
            "type": "CONFIG",
            "status": status,
        });
        if let Some(d) = detail {
            doc["detail"] = d.into();
        }
        self.bridge.publish(&topic, &doc.to_string(), 1, false).await;
    }
}

/// Summary of the active mapping, delivered as a retained `Info` document
/// by the root when it receives this HELLO.
pub fn build_hello(cfg: &NodeConfig) -> Value {
    json!({
        "type": "HELLO",
        "device": { "name": cfg.dev_name },
        "relay_count": cfg.relays.gpio.len(),
        "pwm_count": cfg.pwm.gpio.len(),
        "input_count": cfg.inputs.gpio.len(),
        "relays": {
            "count": cfg.relays.gpio.len(),
            "gpio": cfg.relays.gpio,
            "active_low_mask": cfg.relays.active_low_mask,
            "open_drain_mask": cfg.relays.open_drain_mask,
            "autoff_sec": cfg.relays.autoff_sec,
        },
        "pwm": {
            "count": cfg.pwm.gpio.len(),
            "gpio": cfg.pwm.gpio,
            "inverted_mask": cfg.pwm.inverted_mask,
            "freq_hz": cfg.pwm.freq_hz,
        },
        "inputs": {
            "count": cfg.inputs.gpio.len(),
            "gpio": cfg.inputs.gpio,
            "pullup_mask": cfg.inputs.pullup_mask,
            "pulldown_mask": cfg.inputs.pulldown_mask,
            "inverted_mask": cfg.inputs.inverted_mask,
            "debounce_ms": cfg.inputs.debounce_ms,
        },
    })
}
