//! # meshio-types
//!
//! Shared mesh wire structures for the meshio node fleet.
//!
//! These types are used by:
//! - `node-rust`: encoding and decoding envelopes on the mesh transport
//! - the test harness: injecting frames through the in-process mesh hub
//!
//! ## Wire format
//!
//! Every mesh transmission is a single UTF-8 JSON object terminated with a
//! NUL byte. A frame longer than [`MESH_PAYLOAD_MAX`] bytes (NUL included)
//! is rejected on both the encode and the decode side.
//!
//! ## Addressing
//!
//! Nodes are addressed by 6-byte MAC. The destination *name* `*ROOT*`
//! ([`ROOT_SENTINEL`]) resolves to whichever node currently holds the root
//! role; resolution happens in the node's mesh link, not here.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ── Limits & constants ────────────────────────────────────────────────────────

/// Envelope schema tag carried in every frame.
pub const ENVELOPE_SCHEMA: &str = "v1";

/// Maximum frame length on the mesh, NUL terminator included.
pub const MESH_PAYLOAD_MAX: usize = 1024;

/// Destination name that resolves to the current root node.
pub const ROOT_SENTINEL: &str = "*ROOT*";

// ── Addresses ─────────────────────────────────────────────────────────────────

/// 6-byte node address, rendered as colon-separated lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Parse `"aa:bb:cc:dd:ee:ff"` (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for byte in out.iter_mut() {
            *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(Self(out))
    }

    /// 12 uppercase hex digits, no separators (device-name suffix form).
    pub fn to_flat_upper(self) -> String {
        hex::encode_upper(self.0)
    }
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        MacAddr::parse(&s).ok_or_else(|| D::Error::custom(format!("bad mac address: {s}")))
    }
}

/// 6-byte mesh network identifier, separating disjoint meshes on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MeshId(pub [u8; 6]);

impl MeshId {
    /// 12 lowercase hex digits, no separators (topic segment form).
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn parse_hex(s: &str) -> Option<Self> {
        if s.len() != 12 {
            return None;
        }
        let mut out = [0u8; 6];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(out))
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// Transmission class of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameType {
    /// Command toward a destination; answered with a delivery [`FrameType::Response`].
    Request,
    /// Delivery acknowledgement matching a request's `corr_id`.
    Response,
    /// Fire-and-forget notification (state reports, diagnostics).
    Event,
    /// Once-per-root greeting from a freshly attached node.
    Hello,
}

/// Functional kind of the envelope payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Relay,
    Pwm,
    Config,
    Input,
    Diag,
}

/// The mesh transport object wrapping a command or event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub schema: String,
    #[serde(rename = "type")]
    pub frame: FrameType,
    pub corr_id: u32,
    pub ts_ms: u64,
    pub src_dev: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_dev: Option<String>,
    pub kind: EnvelopeKind,
    pub ttl: i8,
    pub hop: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_set_topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame of {0} bytes exceeds MESH_PAYLOAD_MAX")]
    Oversize(usize),
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Envelope {
    pub fn new(frame: FrameType, kind: EnvelopeKind, src_dev: &str, dst_dev: &str) -> Self {
        Self {
            schema: ENVELOPE_SCHEMA.to_string(),
            frame,
            corr_id: 0,
            ts_ms: 0,
            src_dev: src_dev.to_string(),
            dst_dev: Some(dst_dev.to_string()),
            kind,
            ttl: 3,
            hop: 0,
            origin_set_topic: None,
            payload: None,
        }
    }

    /// Serialize to NUL-terminated JSON, enforcing the frame cap.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = serde_json::to_vec(self)?;
        buf.push(0);
        if buf.len() > MESH_PAYLOAD_MAX {
            return Err(WireError::Oversize(buf.len()));
        }
        Ok(buf)
    }

    /// Parse a received frame, tolerating a trailing NUL.
    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        if frame.len() > MESH_PAYLOAD_MAX {
            return Err(WireError::Oversize(frame.len()));
        }
        let body = match frame.last() {
            Some(0) => &frame[..frame.len() - 1],
            _ => frame,
        };
        Ok(serde_json::from_slice(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mac_roundtrip() {
        let mac = MacAddr([0xaa, 0xbb, 0xcc, 0x01, 0x02, 0x03]);
        assert_eq!(mac.to_string(), "aa:bb:cc:01:02:03");
        assert_eq!(MacAddr::parse("AA:bb:CC:01:02:03"), Some(mac));
        assert_eq!(MacAddr::parse("aa:bb:cc"), None);
        assert_eq!(MacAddr::parse("aa:bb:cc:01:02:03:04"), None);
    }

    #[test]
    fn mesh_id_hex() {
        let id = MeshId([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        assert_eq!(id.to_hex(), "112233445566");
        assert_eq!(MeshId::parse_hex("112233445566"), Some(id));
        assert_eq!(MeshId::parse_hex("11223344556"), None);
    }

    #[test]
    fn envelope_roundtrip() {
        let mut env = Envelope::new(FrameType::Request, EnvelopeKind::Pwm, "N1", "N2");
        env.corr_id = 0xdeadbeef;
        env.ts_ms = 12345;
        env.origin_set_topic = Some("Devices/N2/Cmd/Set".into());
        env.payload = Some(json!({"io": "PWM", "io_id": 0, "action": "SET"}));

        let frame = env.encode().unwrap();
        assert_eq!(*frame.last().unwrap(), 0);

        let back = Envelope::decode(&frame).unwrap();
        assert_eq!(back.frame, FrameType::Request);
        assert_eq!(back.kind, EnvelopeKind::Pwm);
        assert_eq!(back.corr_id, 0xdeadbeef);
        assert_eq!(back.dst_dev.as_deref(), Some("N2"));
    }

    #[test]
    fn wire_field_names() {
        let env = Envelope::new(FrameType::Event, EnvelopeKind::Diag, "N1", ROOT_SENTINEL);
        let frame = env.encode().unwrap();
        let v: serde_json::Value = serde_json::from_slice(&frame[..frame.len() - 1]).unwrap();
        assert_eq!(v["schema"], "v1");
        assert_eq!(v["type"], "EVENT");
        assert_eq!(v["kind"], "diag");
        assert_eq!(v["dst_dev"], "*ROOT*");
        assert!(v.get("origin_set_topic").is_none());
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut env = Envelope::new(FrameType::Event, EnvelopeKind::Diag, "N1", "N2");
        env.payload = Some(json!({ "blob": "x".repeat(MESH_PAYLOAD_MAX) }));
        assert!(matches!(env.encode(), Err(WireError::Oversize(_))));

        let big = vec![b'{'; MESH_PAYLOAD_MAX + 1];
        assert!(matches!(Envelope::decode(&big), Err(WireError::Oversize(_))));
    }
}
