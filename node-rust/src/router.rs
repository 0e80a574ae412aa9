//! # router
//!
//! Decides local versus remote for every canonical message. Local commands
//! invoke a driver and publish a State document; remote commands are
//! packaged into a mesh REQUEST and return as soon as delivery is
//! acknowledged, the final State arriving later as the destination's
//! EVENT. A command therefore yields exactly one State message: leaves
//! never publish for mesh requests they execute, and the root drops events
//! whose source is itself.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use meshio_types::{Envelope, EnvelopeKind, FrameType, ROOT_SENTINEL};

use crate::config_store::ConfigStore;
use crate::input_ctrl::InputCtrl;
use crate::mesh_link::{MeshLink, MeshStatus};
use crate::mqtt_bridge::MqttBridge;
use crate::parser::{Action, CanonicalMsg, IoKind, ParseError};
use crate::pwm_ctrl::{PwmCtrl, DUTY_MAX};
use crate::relay_ctrl::{DriverError, RelayCtrl};

const REQUEST_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterStatus {
    Ok,
    Invalid,
    OutOfRange,
    NoRoute,
    Timeout,
    Internal,
}

impl RouterStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RouterStatus::Ok => "OK",
            RouterStatus::Invalid => "INVALID",
            RouterStatus::OutOfRange => "OUT_OF_RANGE",
            RouterStatus::NoRoute => "NO_ROUTE",
            RouterStatus::Timeout => "TIMEOUT",
            RouterStatus::Internal => "ERROR",
        }
    }
}

/// 32-bit envelope correlation id derived from the string id (FNV-1a).
pub fn corr_id_u32(s: &str) -> u32 {
    let mut h: u32 = 2166136261;
    for b in s.bytes() {
        h ^= u32::from(b);
        h = h.wrapping_mul(16777619);
    }
    h
}

/// `<prefix>/Cmd/Set` becomes `<prefix>/State`; anything else passes
/// through; no origin falls back to the canonical device State topic.
fn derive_state_topic(origin: Option<&str>, base: &str, local_dev: &str) -> String {
    match origin {
        Some(topic) if !topic.is_empty() => match topic.find("/Cmd/Set") {
            Some(pos) => format!("{}/State", &topic[..pos]),
            None => topic.to_string(),
        },
        _ => format!("{base}/{local_dev}/State"),
    }
}

fn kind_for(io: IoKind) -> EnvelopeKind {
    match io {
        IoKind::Relay => EnvelopeKind::Relay,
        IoKind::Pwm => EnvelopeKind::Pwm,
        IoKind::Input => EnvelopeKind::Input,
    }
}

fn payload_is_hello(payload: Option<&Value>) -> bool {
    let Some(p) = payload else { return false };
    if let Some(t) = p.get("type").and_then(Value::as_str) {
        if t.eq_ignore_ascii_case("HELLO") {
            return true;
        }
    }
    p.get("hello").and_then(Value::as_bool) == Some(true)
}

pub struct Router {
    local_dev: String,
    bridge: Arc<MqttBridge>,
    mesh: Arc<MeshLink>,
    store: Arc<ConfigStore>,
    relays: Arc<RelayCtrl>,
    pwm: Arc<PwmCtrl>,
    inputs: Arc<InputCtrl>,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_dev: &str,
        bridge: Arc<MqttBridge>,
        mesh: Arc<MeshLink>,
        store: Arc<ConfigStore>,
        relays: Arc<RelayCtrl>,
        pwm: Arc<PwmCtrl>,
        inputs: Arc<InputCtrl>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_dev: local_dev.to_string(),
            bridge,
            mesh,
            store,
            relays,
            pwm,
            inputs,
        })
    }

    // ── Entry point ───────────────────────────────────────────────────────────

    pub async fn handle(&self, msg: &CanonicalMsg) -> RouterStatus {
        if msg.target_dev != self.local_dev {
            return self.forward_to_target(msg).await;
        }

        let (status, value, pct) = self.execute(msg).await;
        let detail = if status == RouterStatus::Ok {
            None
        } else {
            Some("exec failed")
        };
        self.publish_state(msg, status, detail, value, pct).await;
        status
    }

    /// Root side of a remote command: ship it into the mesh. Delivery
    /// failures surface here as State, since no EVENT will ever come back.
    async fn forward_to_target(&self, msg: &CanonicalMsg) -> RouterStatus {
        let mut env = Envelope::new(
            FrameType::Request,
            kind_for(msg.io_kind),
            &self.local_dev,
            &msg.target_dev,
        );
        env.corr_id = corr_id_u32(&msg.corr_id);
        env.origin_set_topic = msg.topic_hint.clone();
        env.payload = Some(mesh_payload(msg));

        match self.mesh.request(env, REQUEST_TIMEOUT_MS).await {
            MeshStatus::Ok => {
                debug!(target = %msg.target_dev, "request delivered, awaiting event");
                RouterStatus::Ok
            }
            failure => {
                let status = match failure {
                    MeshStatus::Timeout => RouterStatus::Timeout,
                    MeshStatus::NoRoute => RouterStatus::NoRoute,
                    _ => RouterStatus::Internal,
                };
                warn!(target = %msg.target_dev, "mesh request failed: {}", failure.as_str());
                self.publish_state(msg, status, Some(failure.as_str()), None, None)
                    .await;
                status
            }
        }
    }

    // ── Local execution ───────────────────────────────────────────────────────

    async fn execute(&self, msg: &CanonicalMsg) -> (RouterStatus, Option<i64>, Option<u8>) {
        match msg.io_kind {
            IoKind::Relay => (self.exec_relay(msg).await, None, None),
            IoKind::Pwm => {
                let (st, pct) = self.exec_pwm(msg).await;
                (st, None, pct)
            }
            IoKind::Input => {
                let (st, value) = self.exec_input(msg).await;
                (st, value, None)
            }
        }
    }

    async fn exec_relay(&self, msg: &CanonicalMsg) -> RouterStatus {
        let cfg = self.store.cached().await;
        let ch = usize::from(msg.io_id);
        if ch >= cfg.relays.gpio.len() {
            return RouterStatus::OutOfRange;
        }

        let result = match msg.action {
            Action::On => self.relays.on(ch),
            Action::Off => self.relays.off(ch),
            Action::Toggle => self.relays.toggle(ch),
            _ => return RouterStatus::Invalid,
        };
        if let Err(e) = result {
            return status_from_driver(e);
        }

        if let Some(ms) = msg.params.duration_ms {
            let sec = (ms + 999) / 1000;
            if let Err(e) = self.relays.set_autoff_seconds(ch, sec) {
                warn!(ch, "auto-off arm failed: {e}");
            }
        }
        info!(ch, action = msg.action.as_str(), "relay executed");
        RouterStatus::Ok
    }

    async fn exec_pwm(&self, msg: &CanonicalMsg) -> (RouterStatus, Option<u8>) {
        let cfg = self.store.cached().await;
        let ch = usize::from(msg.io_id);
        if ch >= cfg.pwm.gpio.len() {
            return (RouterStatus::OutOfRange, None);
        }
        let Some(pct) = msg.params.brightness_pct else {
            return (RouterStatus::Invalid, None);
        };

        let duty = (u32::from(pct) * DUTY_MAX + 50) / 100;
        let result = match msg.params.ramp_ms {
            Some(ramp) if ramp > 0 => self.pwm.fade_to(ch, duty, ramp),
            _ => self.pwm.set_duty(ch, duty),
        };
        match result {
            Ok(()) => {
                info!(ch, pct, "pwm executed");
                (RouterStatus::Ok, Some(pct))
            }
            Err(e) => (status_from_driver(e), None),
        }
    }

    async fn exec_input(&self, msg: &CanonicalMsg) -> (RouterStatus, Option<i64>) {
        if msg.action != Action::Read {
            return (RouterStatus::Invalid, None);
        }
        let cfg = self.store.cached().await;
        let ch = usize::from(msg.io_id);
        if ch >= cfg.inputs.gpio.len() {
            return (RouterStatus::OutOfRange, None);
        }
        if let Some(ms) = msg.params.debounce_ms {
            if let Err(e) = self.inputs.set_debounce_ms(ch, ms) {
                warn!(ch, "debounce override failed: {e}");
            }
        }
        let level = self.inputs.get_level(ch);
        (RouterStatus::Ok, Some(i64::from(level)))
    }

    // ── State publication ─────────────────────────────────────────────────────

    async fn publish_state(
        &self,
        msg: &CanonicalMsg,
        status: RouterStatus,
        detail: Option<&str>,
        value: Option<i64>,
        pct: Option<u8>,
    ) {
        let topic = derive_state_topic(
            msg.topic_hint.as_deref(),
            self.bridge.base_prefix(),
            &self.local_dev,
        );
        let doc = state_doc(
            &msg.corr_id,
            &msg.target_dev,
            status,
            msg.io_kind,
            msg.io_id,
            msg.action,
            value,
            pct,
            detail,
        );
        self.bridge.publish(&topic, &doc.to_string(), 1, false).await;
    }

    /// Parser failures become State documents too, so a malformed command
    /// still answers on the canonical topic.
    pub async fn publish_parse_error(&self, err: &ParseError, corr_id: Option<&str>) {
        let corr = corr_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let topic = format!("{}/{}/State", self.bridge.base_prefix(), self.local_dev);
        let doc = json!({
            "corr_id": corr,
            "dev": self.local_dev,
            "status": "ERROR",
            "code": err.code.as_str(),
            "path": err.path,
            "detail": err.detail,
        });
        self.bridge.publish(&topic, &doc.to_string(), 1, false).await;
    }

    // ── Mesh-received traffic ─────────────────────────────────────────────────

    /// A REQUEST delivered to this node: execute, then report the outcome
    /// upward as an EVENT. Never publishes locally.
    pub async fn handle_mesh_request(&self, env: &Envelope) {
        let msg = self.msg_from_payload(env);
        let (status, value, pct) = self.execute(&msg).await;

        let doc = state_doc(
            &msg.corr_id,
            &self.local_dev,
            status,
            msg.io_kind,
            msg.io_id,
            msg.action,
            value,
            pct,
            None,
        );
        let mut event = Envelope::new(
            FrameType::Event,
            env.kind,
            &self.local_dev,
            ROOT_SENTINEL,
        );
        event.corr_id = env.corr_id;
        event.origin_set_topic = env.origin_set_topic.clone();
        event.payload = Some(doc);
        let st = self.mesh.send_event(event).await;
        if st != MeshStatus::Ok {
            warn!("state event not sent: {}", st.as_str());
        }
    }

    /// An EVENT arriving at the root: HELLO becomes retained Status+Info,
    /// everything else republishes to the derived State topic. Events from
    /// this very node are dropped, the local path already published.
    pub async fn handle_mesh_event(&self, env: &Envelope) {
        let is_hello = env.kind == EnvelopeKind::Diag && payload_is_hello(env.payload.as_ref());
        if is_hello {
            info!(src = %env.src_dev, "hello received, publishing status/info");
            self.publish_status_for(&env.src_dev).await;
            let info_topic = format!("{}/{}/Info", self.bridge.base_prefix(), env.src_dev);
            let payload = env
                .payload
                .as_ref()
                .map(Value::to_string)
                .unwrap_or_else(|| "{}".to_string());
            self.bridge.publish(&info_topic, &payload, 1, true).await;
            return;
        }

        if env.src_dev == self.local_dev {
            debug!("own event dropped (local path already published)");
            return;
        }

        let topic = match env.origin_set_topic.as_deref() {
            Some(origin) if !origin.is_empty() => {
                derive_state_topic(Some(origin), self.bridge.base_prefix(), &self.local_dev)
            }
            _ => format!("{}/{}/State", self.bridge.base_prefix(), env.src_dev),
        };
        let payload = env
            .payload
            .as_ref()
            .map(Value::to_string)
            .unwrap_or_else(|| "{}".to_string());
        self.bridge.publish(&topic, &payload, 1, false).await;
    }

    async fn publish_status_for(&self, dev: &str) {
        let topic = format!("{}/{}/Status", self.bridge.base_prefix(), dev);
        let doc = json!({"status": "online", "dev": dev});
        self.bridge.publish(&topic, &doc.to_string(), 1, true).await;
    }

    // ── Driver-originated reports ─────────────────────────────────────────────

    /// Debounced input change: the root publishes directly, a leaf reports
    /// upward so the root publishes once.
    pub async fn report_input(&self, ch: usize, level: bool) {
        let corr = Uuid::new_v4().to_string();
        let doc = state_doc(
            &corr,
            &self.local_dev,
            RouterStatus::Ok,
            IoKind::Input,
            ch as u8,
            Action::Report,
            Some(i64::from(level)),
            None,
            None,
        );
        if self.mesh.is_root() {
            let topic = format!("{}/{}/State", self.bridge.base_prefix(), self.local_dev);
            self.bridge.publish(&topic, &doc.to_string(), 1, false).await;
        } else {
            let mut event = Envelope::new(
                FrameType::Event,
                EnvelopeKind::Input,
                &self.local_dev,
                ROOT_SENTINEL,
            );
            event.corr_id = corr_id_u32(&corr);
            event.payload = Some(doc);
            let st = self.mesh.send_event(event).await;
            if st != MeshStatus::Ok {
                debug!("input report not sent: {}", st.as_str());
            }
        }
    }

    /// Send a diagnostic HELLO so the root refreshes the retained Info for
    /// this node (also used right after a config apply).
    pub async fn emit_hello(&self, payload: Value) {
        let mut event = Envelope::new(
            FrameType::Event,
            EnvelopeKind::Diag,
            &self.local_dev,
            ROOT_SENTINEL,
        );
        event.payload = Some(payload);
        let st = self.mesh.send_event(event).await;
        if st != MeshStatus::Ok {
            debug!("hello event not sent: {}", st.as_str());
        }
    }

    // ── Payload mapping ───────────────────────────────────────────────────────

    fn msg_from_payload(&self, env: &Envelope) -> CanonicalMsg {
        let payload = env.payload.as_ref();
        let get = |key: &str| payload.and_then(|p| p.get(key));

        let io_kind = get("io")
            .and_then(Value::as_str)
            .and_then(IoKind::from_str_loose)
            .unwrap_or(IoKind::Relay);
        let io_id = get("io_id").and_then(Value::as_u64).unwrap_or(0).min(63) as u8;
        let action = get("action")
            .and_then(Value::as_str)
            .and_then(Action::from_str_loose)
            .unwrap_or(Action::Set);

        let params = get("params");
        let pget = |key: &str| params.and_then(|p| p.get(key)).and_then(Value::as_u64);

        CanonicalMsg {
            msg_type: crate::parser::MsgType::Command,
            target_dev: self.local_dev.clone(),
            io_kind,
            io_id,
            action,
            params: crate::parser::Params {
                duration_ms: pget("duration_ms").map(|v| v as u32),
                brightness_pct: pget("brightness_percent").map(|v| v.min(100) as u8),
                ramp_ms: pget("ramp_ms").map(|v| v as u32),
                debounce_ms: pget("debounce_ms").map(|v| v as u32),
            },
            corr_id: format!("{:08X}", env.corr_id),
            topic_hint: env.origin_set_topic.clone(),
            meta: crate::parser::MsgMeta {
                source: crate::parser::Source::Mesh,
                received_ts_ms: crate::now_ms(),
                corr_generated: false,
            },
        }
    }
}

fn status_from_driver(e: DriverError) -> RouterStatus {
    match e {
        DriverError::ChannelOutOfRange(_) => RouterStatus::OutOfRange,
        _ => RouterStatus::Internal,
    }
}

fn mesh_payload(msg: &CanonicalMsg) -> Value {
    let mut doc = json!({
        "io": msg.io_kind.as_str(),
        "io_id": msg.io_id,
        "action": msg.action.as_str(),
    });
    let mut params = Map::new();
    if let Some(v) = msg.params.duration_ms {
        params.insert("duration_ms".into(), v.into());
    }
    if let Some(v) = msg.params.brightness_pct {
        params.insert("brightness_percent".into(), v.into());
    }
    if let Some(v) = msg.params.ramp_ms {
        params.insert("ramp_ms".into(), v.into());
    }
    if let Some(v) = msg.params.debounce_ms {
        params.insert("debounce_ms".into(), v.into());
    }
    if !params.is_empty() {
        doc["params"] = Value::Object(params);
    }
    doc
}

#[allow(clippy::too_many_arguments)]
fn state_doc(
    corr_id: &str,
    dev: &str,
    status: RouterStatus,
    io: IoKind,
    io_id: u8,
    action: Action,
    value: Option<i64>,
    pct: Option<u8>,
    detail: Option<&str>,
) -> Value {
    let mut doc = json!({
        "corr_id": corr_id,
        "dev": dev,
        "status": status.as_str(),
        "io": io.as_str(),
        "io_id": io_id,
        "action": action.as_str(),
    });
    if let Some(v) = value {
        doc["value"] = v.into();
    }
    if let Some(p) = pct {
        doc["brightness_percent"] = p.into();
    }
    if let Some(d) = detail {
        doc["detail"] = d.into();
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corr_hash_is_stable_fnv() {
        assert_eq!(corr_id_u32(""), 2166136261);
        assert_eq!(corr_id_u32("a"), 0xe40c292c);
        assert_ne!(corr_id_u32("abc"), corr_id_u32("acb"));
    }

    #[test]
    fn state_topic_derivation() {
        assert_eq!(
            derive_state_topic(Some("Garden/LO/Switch/Cmd/Set"), "Devices", "N1"),
            "Garden/LO/Switch/State"
        );
        assert_eq!(
            derive_state_topic(Some("Devices/N2/Cmd/Set"), "Devices", "N1"),
            "Devices/N2/State"
        );
        // no recognizable suffix passes through
        assert_eq!(
            derive_state_topic(Some("Some/Other/Topic"), "Devices", "N1"),
            "Some/Other/Topic"
        );
        assert_eq!(derive_state_topic(None, "Devices", "N1"), "Devices/N1/State");
        assert_eq!(derive_state_topic(Some(""), "Devices", "N1"), "Devices/N1/State");
    }

    #[test]
    fn hello_detection_on_payload() {
        assert!(payload_is_hello(Some(&json!({"type": "HELLO"}))));
        assert!(payload_is_hello(Some(&json!({"type": "hello"}))));
        assert!(payload_is_hello(Some(&json!({"hello": true}))));
        assert!(!payload_is_hello(Some(&json!({"hello": false}))));
        assert!(!payload_is_hello(Some(&json!({"type": "DIAG"}))));
        assert!(!payload_is_hello(None));
    }

    #[test]
    fn mesh_payload_carries_params() {
        let out = crate::parser::parse(
            r#"{"target_dev":"N2","io":"pwm","channel":0,"action":"SET","brightness":"25%","ramp":300}"#,
            &crate::parser::RxMeta::default(),
        )
        .unwrap();
        let payload = mesh_payload(&out.msg);
        assert_eq!(payload["io"], "PWM");
        assert_eq!(payload["action"], "SET");
        assert_eq!(payload["params"]["brightness_percent"], 25);
        assert_eq!(payload["params"]["ramp_ms"], 300);

        let out = crate::parser::parse(
            r#"{"target_dev":"N2","io_kind":"RELAY","io_id":1,"action":"OFF"}"#,
            &crate::parser::RxMeta::default(),
        )
        .unwrap();
        assert!(mesh_payload(&out.msg).get("params").is_none());
    }

    #[test]
    fn state_doc_optional_fields() {
        let doc = state_doc(
            "c1",
            "N1",
            RouterStatus::Ok,
            IoKind::Pwm,
            0,
            Action::Set,
            None,
            Some(25),
            None,
        );
        assert_eq!(doc["status"], "OK");
        assert_eq!(doc["brightness_percent"], 25);
        assert!(doc.get("value").is_none());
        assert!(doc.get("detail").is_none());

        let doc = state_doc(
            "c2",
            "N1",
            RouterStatus::Internal,
            IoKind::Relay,
            1,
            Action::On,
            None,
            None,
            Some("exec failed"),
        );
        assert_eq!(doc["status"], "ERROR");
        assert_eq!(doc["detail"], "exec failed");
    }
}
