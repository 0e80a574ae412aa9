//! # parser
//!
//! JSON command ingestion: one UTF-8 JSON object plus out-of-band receive
//! context in, one canonical message (or one structured error) out.
//!
//! Field resolution is alias-tolerant: every canonical field accepts a
//! fixed set of synonymous keys, duration-like fields carry a unit
//! multiplier per alias, and values coerce across JSON numbers, numeric
//! strings and (for brightness) `"NN%"` strings. The same static tables
//! drive the unknown-top-level-key lint, which is reported alongside a
//! successful parse and is never fatal.

use serde_json::{Map, Value};
use uuid::Uuid;

// ── Canonical enums ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Command,
    Query,
    Event,
    Ack,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Relay,
    Pwm,
    Input,
}

impl IoKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IoKind::Relay => "RELAY",
            IoKind::Pwm => "PWM",
            IoKind::Input => "INPUT",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "relay" => Some(IoKind::Relay),
            "pwm" => Some(IoKind::Pwm),
            "input" => Some(IoKind::Input),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    On,
    Off,
    Toggle,
    Set,
    Read,
    Report,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::On => "ON",
            Action::Off => "OFF",
            Action::Toggle => "TOGGLE",
            Action::Set => "SET",
            Action::Read => "READ",
            Action::Report => "REPORT",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "on" => Some(Action::On),
            "off" => Some(Action::Off),
            "toggle" => Some(Action::Toggle),
            "set" => Some(Action::Set),
            "read" => Some(Action::Read),
            "report" => Some(Action::Report),
            _ => None,
        }
    }
}

/// Where a command physically arrived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Mqtt,
    Mesh,
    Local,
}

// ── Results ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrCode {
    InvalidJson,
    MissingField,
    TypeMismatch,
    OutOfRange,
    InvalidEnum,
    UnknownAlias,
    Conflict,
    Internal,
}

impl ErrCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrCode::InvalidJson => "INVALID_JSON",
            ErrCode::MissingField => "MISSING_FIELD",
            ErrCode::TypeMismatch => "TYPE_MISMATCH",
            ErrCode::OutOfRange => "OUT_OF_RANGE",
            ErrCode::InvalidEnum => "INVALID_ENUM",
            ErrCode::UnknownAlias => "UNKNOWN_ALIAS",
            ErrCode::Conflict => "CONFLICT",
            ErrCode::Internal => "INTERNAL",
        }
    }
}

/// Structured parse failure; `path` is dotted (`params.duration`).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{} at {path}: {detail}", .code.as_str())]
pub struct ParseError {
    pub code: ErrCode,
    pub path: String,
    pub detail: String,
}

impl ParseError {
    fn new(code: ErrCode, path: &str, detail: &str) -> Self {
        Self {
            code,
            path: path.to_string(),
            detail: detail.to_string(),
        }
    }
}

/// Normalized optional parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Params {
    pub duration_ms: Option<u32>,
    pub brightness_pct: Option<u8>,
    pub ramp_ms: Option<u32>,
    pub debounce_ms: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
pub struct MsgMeta {
    pub source: Source,
    pub received_ts_ms: u64,
    pub corr_generated: bool,
}

/// The canonical command message every downstream stage works with.
#[derive(Debug, Clone)]
pub struct CanonicalMsg {
    pub msg_type: MsgType,
    pub target_dev: String,
    pub io_kind: IoKind,
    pub io_id: u8,
    pub action: Action,
    pub params: Params,
    pub corr_id: String,
    pub topic_hint: Option<String>,
    pub meta: MsgMeta,
}

/// Receive context supplied by the transport.
#[derive(Debug, Clone, Default)]
pub struct RxMeta {
    pub source: Option<Source>,
    pub topic_hint: Option<String>,
    pub received_ts_ms: u64,
}

#[derive(Debug)]
pub struct ParseOutcome {
    pub msg: CanonicalMsg,
    /// Unrecognized top-level keys (lint, non-fatal).
    pub unknown_keys: Vec<String>,
}

// ── Alias tables ──────────────────────────────────────────────────────────────

const ACTION_KEYS: &[&str] = &["action", "command", "state", "relay_state", "cmd"];
const TARGET_KEYS: &[&str] = &["target_dev", "target", "device", "dev", "node"];
const IOKIND_KEYS: &[&str] = &["io_kind", "io", "type", "kind", "device_type"];
const IOID_KEYS: &[&str] = &["io_id", "relay", "pin", "gpio", "channel", "index"];
const BRIGHT_KEYS: &[&str] = &["brightness", "level", "duty", "value", "percent"];
const REPORT_KEYS: &[&str] = &["value", "val"];
const CORR_KEYS: &[&str] = &["corr_id", "correlation_id", "id"];
const TOPIC_KEYS: &[&str] = &["_topic", "topic_hint"];

/// Duration-like alias with its unit factor toward milliseconds.
struct MsAlias {
    name: &'static str,
    mult: i64,
    path: &'static str,
}

const DURATION_KEYS: &[MsAlias] = &[
    MsAlias { name: "duration_ms", mult: 1, path: "params.duration_ms" },
    MsAlias { name: "duration_s", mult: 1000, path: "params.duration_s" },
    MsAlias { name: "duration", mult: 1000, path: "params.duration" },
    MsAlias { name: "minutes", mult: 60_000, path: "params.minutes" },
];

const RAMP_KEYS: &[MsAlias] = &[
    MsAlias { name: "ramp_ms", mult: 1, path: "params.ramp_ms" },
    MsAlias { name: "ramp", mult: 1, path: "params.ramp_ms" },
    MsAlias { name: "fade", mult: 1, path: "params.ramp_ms" },
    MsAlias { name: "transition", mult: 1, path: "params.ramp_ms" },
];

const DEBOUNCE_KEYS: &[MsAlias] = &[
    MsAlias { name: "debounce_ms", mult: 1, path: "params.debounce_ms" },
    MsAlias { name: "debounce", mult: 1, path: "params.debounce_ms" },
];

// ── Value coercion ────────────────────────────────────────────────────────────

/// Integer-like: JSON number, fully-numeric string, or "NN%" where percent
/// is allowed. Returns `(value, was_percent)`.
fn parse_int_like(v: &Value, allow_percent: bool) -> Option<(i64, bool)> {
    match v {
        Value::Number(n) => Some((n.as_f64()? as i64, false)),
        Value::String(raw) => {
            let s = raw.trim();
            let (s, pct) = match s.strip_suffix('%') {
                Some(stripped) if allow_percent => (stripped.trim_end(), true),
                _ => (s, false),
            };
            if s.is_empty() {
                return None;
            }
            let d: f64 = s.parse().ok()?;
            Some((d as i64, pct))
        }
        _ => None,
    }
}

fn parse_bool_like(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_f64()? != 0.0),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "on" | "true" => Some(true),
            "off" | "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn get_any<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k))
}

fn get_any_entry<'a>(
    obj: &'a Map<String, Value>,
    keys: &[&'static str],
) -> Option<(&'static str, &'a Value)> {
    keys.iter().find_map(|&k| obj.get(k).map(|v| (k, v)))
}

fn read_string(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    match get_any(obj, keys) {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    }
}

/// Resolve one duration-like field across its aliases: every present alias
/// must agree after unit conversion, and the result must sit inside
/// `[min_ms, max_ms]`.
fn read_param_ms(
    obj: &Map<String, Value>,
    aliases: &[MsAlias],
    min_ms: i64,
    max_ms: i64,
    conflict_path: &str,
) -> Result<Option<u32>, ParseError> {
    let mut resolved: Option<i64> = None;

    for alias in aliases {
        let Some(item) = obj.get(alias.name) else {
            continue;
        };
        let (v, _) = parse_int_like(item, false)
            .ok_or_else(|| ParseError::new(ErrCode::TypeMismatch, alias.path, "int expected"))?;
        let ms = v * alias.mult;
        match resolved {
            Some(prev) if prev != ms => {
                return Err(ParseError::new(
                    ErrCode::Conflict,
                    conflict_path,
                    "conflicting values across aliases",
                ));
            }
            _ => resolved = Some(ms),
        }
    }

    match resolved {
        None => Ok(None),
        Some(ms) if ms < min_ms || ms > max_ms => Err(ParseError::new(
            ErrCode::OutOfRange,
            conflict_path,
            "out of range",
        )),
        Some(ms) => Ok(Some(ms as u32)),
    }
}

// ── Unknown-key lint ──────────────────────────────────────────────────────────

fn in_keys(k: &str, keys: &[&str]) -> bool {
    keys.iter().any(|c| c.eq_ignore_ascii_case(k))
}

fn in_aliases(k: &str, aliases: &[MsAlias]) -> bool {
    aliases.iter().any(|a| a.name.eq_ignore_ascii_case(k))
}

fn is_known_top_key(k: &str) -> bool {
    in_keys(k, ACTION_KEYS)
        || in_keys(k, TARGET_KEYS)
        || in_keys(k, IOKIND_KEYS)
        || in_keys(k, IOID_KEYS)
        || in_keys(k, BRIGHT_KEYS)
        || in_keys(k, REPORT_KEYS)
        || in_keys(k, CORR_KEYS)
        || in_keys(k, TOPIC_KEYS)
        || in_aliases(k, DURATION_KEYS)
        || in_aliases(k, RAMP_KEYS)
        || in_aliases(k, DEBOUNCE_KEYS)
}

fn collect_unknown_keys(obj: &Map<String, Value>) -> Vec<String> {
    obj.keys()
        .filter(|k| !k.starts_with('_') && !is_known_top_key(k))
        .cloned()
        .collect()
}

// ── Field parsers ─────────────────────────────────────────────────────────────

fn parse_action_any(obj: &Map<String, Value>) -> Option<Action> {
    let item = get_any(obj, ACTION_KEYS)?;
    if let Some(b) = parse_bool_like(item) {
        return Some(if b { Action::On } else { Action::Off });
    }
    match item {
        Value::String(s) => Action::from_str_loose(s),
        _ => None,
    }
}

fn parse_iokind_any(obj: &Map<String, Value>) -> Option<IoKind> {
    match get_any(obj, IOKIND_KEYS) {
        Some(Value::String(s)) => IoKind::from_str_loose(s),
        _ => None,
    }
}

fn derive_iokind(obj: &Map<String, Value>, action: Action) -> Option<IoKind> {
    // report-shaped traffic first, then brightness-shaped, then relay-shaped
    if action == Action::Read || action == Action::Report || get_any(obj, REPORT_KEYS).is_some() {
        return Some(IoKind::Input);
    }
    if get_any(obj, BRIGHT_KEYS).is_some() {
        return Some(IoKind::Pwm);
    }
    if get_any(obj, IOID_KEYS).is_some() {
        return Some(IoKind::Relay);
    }
    None
}

// ── API ───────────────────────────────────────────────────────────────────────

pub fn parse(json: &str, meta: &RxMeta) -> Result<ParseOutcome, ParseError> {
    let root: Value = serde_json::from_str(json)
        .map_err(|_| ParseError::new(ErrCode::InvalidJson, "root", "JSON parse failed"))?;
    let obj = root
        .as_object()
        .ok_or_else(|| ParseError::new(ErrCode::InvalidJson, "root", "object expected"))?;

    let unknown_keys = collect_unknown_keys(obj);

    let (corr_id, corr_generated) = match read_string(obj, CORR_KEYS) {
        Some(id) => (id, false),
        None => (Uuid::new_v4().to_string(), true),
    };

    // receive context wins over an in-payload hint
    let topic_hint = meta
        .topic_hint
        .clone()
        .or_else(|| read_string(obj, TOPIC_KEYS));

    let target_dev = read_string(obj, TARGET_KEYS).ok_or_else(|| {
        ParseError::new(ErrCode::MissingField, "target_dev", "expected non-empty string")
    })?;
    if target_dev.is_empty() {
        return Err(ParseError::new(ErrCode::OutOfRange, "target_dev", "empty"));
    }

    let action = parse_action_any(obj).ok_or_else(|| {
        ParseError::new(
            ErrCode::InvalidEnum,
            "action",
            "allowed: ON/OFF/TOGGLE/SET/READ/REPORT",
        )
    })?;
    let msg_type = match action {
        Action::Read => MsgType::Query,
        Action::Report => MsgType::Event,
        _ => MsgType::Command,
    };

    let io_kind = match parse_iokind_any(obj) {
        Some(kind) => kind,
        None => derive_iokind(obj, action).ok_or_else(|| {
            ParseError::new(ErrCode::InvalidEnum, "io_kind", "derive failed; provide io_kind")
        })?,
    };

    let io_id = get_any(obj, IOID_KEYS)
        .and_then(|v| parse_int_like(v, false))
        .map(|(v, _)| v)
        .ok_or_else(|| ParseError::new(ErrCode::MissingField, "io_id", "expected int 0..63"))?;
    if !(0..=63).contains(&io_id) {
        return Err(ParseError::new(ErrCode::OutOfRange, "io_id", "expected 0..63"));
    }

    let mut params = Params::default();

    match io_kind {
        IoKind::Relay => {
            params.duration_ms =
                read_param_ms(obj, DURATION_KEYS, 0, 86_400_000, "params.duration")?;
        }
        IoKind::Pwm => {
            if let Some((key, item)) = get_any_entry(obj, BRIGHT_KEYS) {
                let (mut v, is_pct) = parse_int_like(item, true).ok_or_else(|| {
                    ParseError::new(
                        ErrCode::TypeMismatch,
                        "params.brightness",
                        "int or \"NN%\" expected",
                    )
                })?;
                if !is_pct && key == "duty" {
                    // raw duty 0..255, mapped to percent with rounding
                    if !(0..=255).contains(&v) {
                        return Err(ParseError::new(ErrCode::OutOfRange, "params.duty", "0..255"));
                    }
                    v = (v * 100 + 127) / 255;
                }
                if !(0..=100).contains(&v) {
                    return Err(ParseError::new(
                        ErrCode::OutOfRange,
                        "params.brightness_pct",
                        "0..100",
                    ));
                }
                params.brightness_pct = Some(v as u8);
            }
            params.ramp_ms = read_param_ms(obj, RAMP_KEYS, 0, 60_000, "params.ramp_ms")?;
        }
        IoKind::Input => match action {
            Action::Report => {
                if get_any(obj, REPORT_KEYS).is_none() {
                    return Err(ParseError::new(
                        ErrCode::MissingField,
                        "params.value",
                        "required for REPORT",
                    ));
                }
            }
            Action::Read => {
                params.debounce_ms =
                    read_param_ms(obj, DEBOUNCE_KEYS, 0, 5000, "params.debounce_ms")?;
            }
            _ => {}
        },
    }

    Ok(ParseOutcome {
        msg: CanonicalMsg {
            msg_type,
            target_dev,
            io_kind,
            io_id: io_id as u8,
            action,
            params,
            corr_id,
            topic_hint,
            meta: MsgMeta {
                source: meta.source.unwrap_or(Source::Local),
                received_ts_ms: meta.received_ts_ms,
                corr_generated,
            },
        },
        unknown_keys,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(json: &str) -> ParseOutcome {
        parse(json, &RxMeta::default()).unwrap()
    }

    fn parse_err(json: &str) -> ParseError {
        parse(json, &RxMeta::default()).unwrap_err()
    }

    #[test]
    fn minimal_relay_command() {
        let out = parse_ok(r#"{"target_dev":"N1","io_kind":"RELAY","io_id":1,"action":"ON"}"#);
        assert_eq!(out.msg.target_dev, "N1");
        assert_eq!(out.msg.io_kind, IoKind::Relay);
        assert_eq!(out.msg.io_id, 1);
        assert_eq!(out.msg.action, Action::On);
        assert_eq!(out.msg.msg_type, MsgType::Command);
        assert!(out.msg.meta.corr_generated);
        assert!(out.unknown_keys.is_empty());
    }

    #[test]
    fn every_target_synonym_resolves_identically() {
        for key in TARGET_KEYS {
            let out = parse_ok(&format!(
                r#"{{"{key}":"N9","io_kind":"RELAY","io_id":0,"action":"OFF"}}"#
            ));
            assert_eq!(out.msg.target_dev, "N9", "alias {key}");
        }
    }

    #[test]
    fn every_action_synonym_resolves_identically() {
        for key in ACTION_KEYS {
            let out = parse_ok(&format!(
                r#"{{"target_dev":"N1","io_kind":"RELAY","io_id":0,"{key}":"toggle"}}"#
            ));
            assert_eq!(out.msg.action, Action::Toggle, "alias {key}");
        }
    }

    #[test]
    fn action_accepts_bool_like() {
        let out = parse_ok(r#"{"target_dev":"N1","io_kind":"RELAY","io_id":0,"action":true}"#);
        assert_eq!(out.msg.action, Action::On);
        let out = parse_ok(r#"{"target_dev":"N1","io_kind":"RELAY","io_id":0,"action":"false"}"#);
        assert_eq!(out.msg.action, Action::Off);
        let out = parse_ok(r#"{"target_dev":"N1","io_kind":"RELAY","io_id":0,"action":0}"#);
        assert_eq!(out.msg.action, Action::Off);
    }

    #[test]
    fn duration_aliases_convert_units() {
        let cases = [
            (r#""duration_ms":90000"#, 90_000),
            (r#""duration_s":90"#, 90_000),
            (r#""duration":90"#, 90_000),
            (r#""minutes":1"#, 60_000),
        ];
        for (frag, expect) in cases {
            let out = parse_ok(&format!(
                r#"{{"target_dev":"N1","io_kind":"RELAY","io_id":0,"action":"ON",{frag}}}"#
            ));
            assert_eq!(out.msg.params.duration_ms, Some(expect), "{frag}");
        }
    }

    #[test]
    fn agreeing_duration_aliases_pass_conflicting_fail() {
        let out = parse_ok(
            r#"{"target_dev":"N1","io_kind":"RELAY","io_id":0,"action":"ON",
                "minutes":1,"duration_s":60}"#,
        );
        assert_eq!(out.msg.params.duration_ms, Some(60_000));

        let err = parse_err(
            r#"{"target_dev":"N1","io_kind":"RELAY","io_id":0,"action":"ON",
                "minutes":1,"duration_ms":5}"#,
        );
        assert_eq!(err.code, ErrCode::Conflict);
        assert_eq!(err.path, "params.duration");
    }

    #[test]
    fn duration_out_of_range() {
        let err = parse_err(
            r#"{"target_dev":"N1","io_kind":"RELAY","io_id":0,"action":"ON","minutes":1441}"#,
        );
        assert_eq!(err.code, ErrCode::OutOfRange);
        assert_eq!(err.path, "params.duration");
    }

    #[test]
    fn brightness_percent_string() {
        let out = parse_ok(
            r#"{"target_dev":"N2","io":"pwm","channel":0,"action":"SET","brightness":"25%","ramp":300}"#,
        );
        assert_eq!(out.msg.io_kind, IoKind::Pwm);
        assert_eq!(out.msg.params.brightness_pct, Some(25));
        assert_eq!(out.msg.params.ramp_ms, Some(300));
    }

    #[test]
    fn duty_key_maps_to_percent_with_rounding() {
        let out =
            parse_ok(r#"{"target_dev":"N1","io":"pwm","io_id":0,"action":"SET","duty":255}"#);
        assert_eq!(out.msg.params.brightness_pct, Some(100));
        let out = parse_ok(r#"{"target_dev":"N1","io":"pwm","io_id":0,"action":"SET","duty":64}"#);
        assert_eq!(out.msg.params.brightness_pct, Some(25));

        let err =
            parse_err(r#"{"target_dev":"N1","io":"pwm","io_id":0,"action":"SET","duty":300}"#);
        assert_eq!(err.code, ErrCode::OutOfRange);
        assert_eq!(err.path, "params.duty");
    }

    #[test]
    fn brightness_over_100_rejected() {
        let err = parse_err(
            r#"{"target_dev":"N1","io":"pwm","io_id":0,"action":"SET","brightness":101}"#,
        );
        assert_eq!(err.code, ErrCode::OutOfRange);
        assert_eq!(err.path, "params.brightness_pct");
    }

    #[test]
    fn io_kind_inferred_from_shape() {
        // brightness present => PWM
        let out = parse_ok(r#"{"target_dev":"N1","io_id":0,"action":"SET","brightness":50}"#);
        assert_eq!(out.msg.io_kind, IoKind::Pwm);
        // READ => INPUT, and message type QUERY
        let out = parse_ok(r#"{"target_dev":"N1","pin":3,"action":"READ"}"#);
        assert_eq!(out.msg.io_kind, IoKind::Input);
        assert_eq!(out.msg.msg_type, MsgType::Query);
        // bare io id => RELAY
        let out = parse_ok(r#"{"target_dev":"N1","relay":2,"action":"ON"}"#);
        assert_eq!(out.msg.io_kind, IoKind::Relay);
        assert_eq!(out.msg.io_id, 2);
    }

    #[test]
    fn io_id_required_and_ranged() {
        let err = parse_err(r#"{"target_dev":"N1","io_kind":"RELAY","action":"ON"}"#);
        assert_eq!(err.code, ErrCode::MissingField);
        assert_eq!(err.path, "io_id");

        let err = parse_err(r#"{"target_dev":"N1","io_kind":"RELAY","io_id":64,"action":"ON"}"#);
        assert_eq!(err.code, ErrCode::OutOfRange);

        // numeric strings are accepted
        let out = parse_ok(r#"{"target_dev":"N1","io_kind":"RELAY","io_id":"10","action":"ON"}"#);
        assert_eq!(out.msg.io_id, 10);
    }

    #[test]
    fn report_requires_value() {
        let err = parse_err(r#"{"target_dev":"N1","io_kind":"INPUT","io_id":0,"action":"REPORT"}"#);
        assert_eq!(err.code, ErrCode::MissingField);
        assert_eq!(err.path, "params.value");

        let out = parse_ok(
            r#"{"target_dev":"N1","io_kind":"INPUT","io_id":0,"action":"REPORT","val":1}"#,
        );
        assert_eq!(out.msg.msg_type, MsgType::Event);
    }

    #[test]
    fn read_accepts_debounce_override() {
        let out = parse_ok(
            r#"{"target_dev":"N1","io_kind":"INPUT","io_id":0,"action":"READ","debounce":"200"}"#,
        );
        assert_eq!(out.msg.params.debounce_ms, Some(200));

        let err = parse_err(
            r#"{"target_dev":"N1","io_kind":"INPUT","io_id":0,"action":"READ","debounce_ms":5001}"#,
        );
        assert_eq!(err.code, ErrCode::OutOfRange);
    }

    #[test]
    fn provided_corr_id_survives() {
        let out = parse_ok(
            r#"{"corr_id":"abc-123","target_dev":"N1","io_kind":"RELAY","io_id":0,"action":"ON"}"#,
        );
        assert_eq!(out.msg.corr_id, "abc-123");
        assert!(!out.msg.meta.corr_generated);
    }

    #[test]
    fn generated_corr_id_is_hyphenated_hex() {
        let out = parse_ok(r#"{"target_dev":"N1","io_kind":"RELAY","io_id":0,"action":"ON"}"#);
        assert!(out.msg.meta.corr_generated);
        assert_eq!(out.msg.corr_id.split('-').count(), 5);
    }

    #[test]
    fn unknown_keys_are_linted_not_fatal() {
        let out = parse_ok(
            r#"{"target_dev":"N1","io_kind":"RELAY","io_id":0,"action":"ON",
                "relayy":900,"_private":1}"#,
        );
        assert_eq!(out.unknown_keys, vec!["relayy"]);
    }

    #[test]
    fn meta_topic_hint_wins_over_payload() {
        let meta = RxMeta {
            source: Some(Source::Mqtt),
            topic_hint: Some("Devices/N1/Cmd/Set".into()),
            received_ts_ms: 42,
        };
        let out = parse(
            r#"{"target_dev":"N1","io_kind":"RELAY","io_id":0,"action":"ON","_topic":"other"}"#,
            &meta,
        )
        .unwrap();
        assert_eq!(out.msg.topic_hint.as_deref(), Some("Devices/N1/Cmd/Set"));
        assert_eq!(out.msg.meta.received_ts_ms, 42);
    }

    #[test]
    fn invalid_json_and_wrong_shapes() {
        assert_eq!(parse_err("{oops").code, ErrCode::InvalidJson);
        assert_eq!(parse_err("[1,2]").code, ErrCode::InvalidJson);

        let err = parse_err(r#"{"io_kind":"RELAY","io_id":0,"action":"ON"}"#);
        assert_eq!(err.code, ErrCode::MissingField);
        assert_eq!(err.path, "target_dev");

        let err = parse_err(r#"{"target_dev":"N1","io_kind":"RELAY","io_id":0,"action":"blink"}"#);
        assert_eq!(err.code, ErrCode::InvalidEnum);
        assert_eq!(err.path, "action");
    }

    #[test]
    fn non_numeric_duration_is_type_mismatch() {
        let err = parse_err(
            r#"{"target_dev":"N1","io_kind":"RELAY","io_id":0,"action":"ON","minutes":"soon"}"#,
        );
        assert_eq!(err.code, ErrCode::TypeMismatch);
        assert_eq!(err.path, "params.minutes");
    }
}
