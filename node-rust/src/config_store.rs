//! # config_store
//!
//! Typed I/O configuration with defaults, validation and atomic
//! persistence. The flash backend itself stays behind [`KvBackend`]; this
//! module owns the key layout, the schema-version discipline (the `v` key
//! is written last, and a missing or mismatched `v` loads defaults) and the
//! in-RAM cached record.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use meshio_types::MacAddr;

/// Channel ceiling per I/O block.
pub const CH_MAX: usize = 16;
pub const SCHEMA_VERSION: u32 = 1;
pub const DEV_NAME_MAX: usize = 31;

const DEFAULT_PWM_FREQ_HZ: u32 = 5000;
const DEFAULT_DEBOUNCE_MS: u32 = 30;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("config failed validation")]
    InvalidConfig,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

// ── Configuration record ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    pub gpio: Vec<u8>,
    pub active_low_mask: u32,
    pub open_drain_mask: u32,
    /// Per-channel auto-off seconds, same length as `gpio`; 0 = disabled.
    pub autoff_sec: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PwmConfig {
    pub gpio: Vec<u8>,
    pub inverted_mask: u32,
    pub freq_hz: u32,
}

impl Default for PwmConfig {
    fn default() -> Self {
        Self {
            gpio: Vec::new(),
            inverted_mask: 0,
            freq_hz: DEFAULT_PWM_FREQ_HZ,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InputConfig {
    pub gpio: Vec<u8>,
    pub pullup_mask: u32,
    pub pulldown_mask: u32,
    pub inverted_mask: u32,
    /// Per-channel debounce milliseconds, same length as `gpio`.
    pub debounce_ms: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub version: u32,
    pub dev_name: String,
    pub relays: RelayConfig,
    pub pwm: PwmConfig,
    pub inputs: InputConfig,
}

impl NodeConfig {
    /// Factory record: empty I/O blocks, device name derived from the MAC.
    pub fn defaults(mac: MacAddr) -> Self {
        Self {
            version: SCHEMA_VERSION,
            dev_name: format!("NODE_{}", mac.to_flat_upper()),
            relays: RelayConfig::default(),
            pwm: PwmConfig::default(),
            inputs: InputConfig::default(),
        }
    }

    pub fn validate(&self) -> bool {
        if self.dev_name.is_empty() || self.dev_name.len() > DEV_NAME_MAX {
            return false;
        }
        if self.relays.gpio.len() > CH_MAX
            || self.pwm.gpio.len() > CH_MAX
            || self.inputs.gpio.len() > CH_MAX
        {
            return false;
        }
        self.relays.autoff_sec.len() == self.relays.gpio.len()
            && self.inputs.debounce_ms.len() == self.inputs.gpio.len()
    }
}

// ── Key-value backend (flash abstraction) ─────────────────────────────────────

/// Flat key-value surface the store persists through. Writes are staged
/// until `commit`.
pub trait KvBackend: Send + Sync {
    fn get_u32(&self, key: &str) -> Option<u32>;
    fn get_str(&self, key: &str) -> Option<String>;
    fn get_blob(&self, key: &str) -> Option<Vec<u8>>;
    fn set_u32(&self, key: &str, v: u32);
    fn set_str(&self, key: &str, v: &str);
    fn set_blob(&self, key: &str, v: &[u8]);
    fn commit(&self) -> Result<(), StoreError>;
    fn erase_all(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum KvValue {
    U32(u32),
    Str(String),
    Blob(Vec<u8>),
}

/// In-memory backend for tests and diskless operation.
#[derive(Default)]
pub struct MemKv {
    map: Mutex<HashMap<String, KvValue>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemKv {
    fn get_u32(&self, key: &str) -> Option<u32> {
        match self.map.lock().unwrap().get(key) {
            Some(KvValue::U32(v)) => Some(*v),
            _ => None,
        }
    }
    fn get_str(&self, key: &str) -> Option<String> {
        match self.map.lock().unwrap().get(key) {
            Some(KvValue::Str(s)) => Some(s.clone()),
            _ => None,
        }
    }
    fn get_blob(&self, key: &str) -> Option<Vec<u8>> {
        match self.map.lock().unwrap().get(key) {
            Some(KvValue::Blob(b)) => Some(b.clone()),
            _ => None,
        }
    }
    fn set_u32(&self, key: &str, v: u32) {
        self.map.lock().unwrap().insert(key.into(), KvValue::U32(v));
    }
    fn set_str(&self, key: &str, v: &str) {
        self.map
            .lock()
            .unwrap()
            .insert(key.into(), KvValue::Str(v.into()));
    }
    fn set_blob(&self, key: &str, v: &[u8]) {
        self.map
            .lock()
            .unwrap()
            .insert(key.into(), KvValue::Blob(v.to_vec()));
    }
    fn commit(&self) -> Result<(), StoreError> {
        Ok(())
    }
    fn erase_all(&self) -> Result<(), StoreError> {
        self.map.lock().unwrap().clear();
        Ok(())
    }
}

/// File-backed backend: staged map, committed as a whole with a temp file
/// and an atomic rename.
pub struct FileKv {
    path: PathBuf,
    map: Mutex<HashMap<String, KvValue>>,
}

impl FileKv {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let map = match std::fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(map) => map,
                Err(e) => {
                    warn!("config file {path:?} unreadable ({e}), starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            map: Mutex::new(map),
        }
    }
}

impl KvBackend for FileKv {
    fn get_u32(&self, key: &str) -> Option<u32> {
        match self.map.lock().unwrap().get(key) {
            Some(KvValue::U32(v)) => Some(*v),
            _ => None,
        }
    }
    fn get_str(&self, key: &str) -> Option<String> {
        match self.map.lock().unwrap().get(key) {
            Some(KvValue::Str(s)) => Some(s.clone()),
            _ => None,
        }
    }
    fn get_blob(&self, key: &str) -> Option<Vec<u8>> {
        match self.map.lock().unwrap().get(key) {
            Some(KvValue::Blob(b)) => Some(b.clone()),
            _ => None,
        }
    }
    fn set_u32(&self, key: &str, v: u32) {
        self.map.lock().unwrap().insert(key.into(), KvValue::U32(v));
    }
    fn set_str(&self, key: &str, v: &str) {
        self.map
            .lock()
            .unwrap()
            .insert(key.into(), KvValue::Str(v.into()));
    }
    fn set_blob(&self, key: &str, v: &[u8]) {
        self.map
            .lock()
            .unwrap()
            .insert(key.into(), KvValue::Blob(v.to_vec()));
    }

    fn commit(&self) -> Result<(), StoreError> {
        let data = serde_json::to_string(&*self.map.lock().unwrap())?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn erase_all(&self) -> Result<(), StoreError> {
        self.map.lock().unwrap().clear();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ── Blob codecs ───────────────────────────────────────────────────────────────

fn blob_from_u32s(vals: &[u32]) -> Vec<u8> {
    vals.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn u32s_from_blob(blob: &[u8]) -> Vec<u32> {
    blob.chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

// ── Store ─────────────────────────────────────────────────────────────────────

/// Cached configuration record plus its persistence discipline. Readers
/// clone the snapshot; the config-apply path is the only writer.
pub struct ConfigStore {
    kv: Box<dyn KvBackend>,
    cached: RwLock<NodeConfig>,
}

impl ConfigStore {
    pub fn new(kv: Box<dyn KvBackend>, mac: MacAddr) -> Self {
        let cfg = Self::load_from(kv.as_ref(), mac);
        info!(dev = %cfg.dev_name, "config loaded");
        Self {
            kv,
            cached: RwLock::new(cfg),
        }
    }

    fn load_from(kv: &dyn KvBackend, mac: MacAddr) -> NodeConfig {
        if kv.get_u32("v") != Some(SCHEMA_VERSION) {
            return NodeConfig::defaults(mac);
        }

        let mut cfg = NodeConfig::defaults(mac);
        if let Some(dev) = kv.get_str("dev") {
            cfg.dev_name = dev;
        }

        let ry_n = kv.get_u32("ry_n").unwrap_or(0) as usize;
        cfg.relays.gpio = kv.get_blob("ry_p").unwrap_or_default();
        cfg.relays.gpio.truncate(ry_n);
        cfg.relays.active_low_mask = kv.get_u32("ry_al").unwrap_or(0);
        cfg.relays.open_drain_mask = kv.get_u32("ry_od").unwrap_or(0);
        cfg.relays.autoff_sec = u32s_from_blob(&kv.get_blob("ry_ao").unwrap_or_default());
        cfg.relays.autoff_sec.resize(cfg.relays.gpio.len(), 0);

        let pw_n = kv.get_u32("pw_n").unwrap_or(0) as usize;
        cfg.pwm.gpio = kv.get_blob("pw_p").unwrap_or_default();
        cfg.pwm.gpio.truncate(pw_n);
        cfg.pwm.inverted_mask = kv.get_u32("pw_inv").unwrap_or(0);
        cfg.pwm.freq_hz = kv.get_u32("pw_f").unwrap_or(DEFAULT_PWM_FREQ_HZ);

        let in_n = kv.get_u32("in_n").unwrap_or(0) as usize;
        cfg.inputs.gpio = kv.get_blob("in_p").unwrap_or_default();
        cfg.inputs.gpio.truncate(in_n);
        cfg.inputs.pullup_mask = kv.get_u32("in_pu").unwrap_or(0);
        cfg.inputs.pulldown_mask = kv.get_u32("in_pd").unwrap_or(0);
        cfg.inputs.inverted_mask = kv.get_u32("in_inv").unwrap_or(0);
        cfg.inputs.debounce_ms = u32s_from_blob(&kv.get_blob("in_db").unwrap_or_default());
        cfg.inputs
            .debounce_ms
            .resize(cfg.inputs.gpio.len(), DEFAULT_DEBOUNCE_MS);

        if !cfg.validate() {
            warn!("persisted config failed validation, falling back to defaults");
            return NodeConfig::defaults(mac);
        }
        cfg
    }

    /// Snapshot of the current record.
    pub async fn cached(&self) -> NodeConfig {
        self.cached.read().await.clone()
    }

    /// Replace the record and persist it: all fields first, the schema
    /// version last, then commit.
    pub async fn save(&self, cfg: &NodeConfig) -> Result<(), StoreError> {
        if !cfg.validate() {
            return Err(StoreError::InvalidConfig);
        }

        let mut cached = self.cached.write().await;

        self.kv.set_str("dev", &cfg.dev_name);

        self.kv.set_u32("ry_n", cfg.relays.gpio.len() as u32);
        self.kv.set_blob("ry_p", &cfg.relays.gpio);
        self.kv.set_u32("ry_al", cfg.relays.active_low_mask);
        self.kv.set_u32("ry_od", cfg.relays.open_drain_mask);
        self.kv.set_blob("ry_ao", &blob_from_u32s(&cfg.relays.autoff_sec));

        self.kv.set_u32("pw_n", cfg.pwm.gpio.len() as u32);
        self.kv.set_blob("pw_p", &cfg.pwm.gpio);
        self.kv.set_u32("pw_inv", cfg.pwm.inverted_mask);
        self.kv.set_u32("pw_f", cfg.pwm.freq_hz);

        self.kv.set_u32("in_n", cfg.inputs.gpio.len() as u32);
        self.kv.set_blob("in_p", &cfg.inputs.gpio);
        self.kv.set_u32("in_pu", cfg.inputs.pullup_mask);
        self.kv.set_u32("in_pd", cfg.inputs.pulldown_mask);
        self.kv.set_u32("in_inv", cfg.inputs.inverted_mask);
        self.kv.set_blob("in_db", &blob_from_u32s(&cfg.inputs.debounce_ms));

        self.kv.set_u32("v", SCHEMA_VERSION);
        self.kv.commit()?;

        *cached = cfg.clone();
        Ok(())
    }

    pub async fn erase_all(&self) -> Result<(), StoreError> {
        self.kv.erase_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac() -> MacAddr {
        MacAddr([0x02, 0, 0, 0xab, 0xcd, 0xef])
    }

    #[tokio::test]
    async fn empty_backend_yields_defaults() {
        let store = ConfigStore::new(Box::new(MemKv::new()), mac());
        let cfg = store.cached().await;
        assert_eq!(cfg.dev_name, "NODE_020000ABCDEF");
        assert!(cfg.relays.gpio.is_empty());
        assert_eq!(cfg.pwm.freq_hz, 5000);
    }

    #[tokio::test]
    async fn save_then_reload_roundtrips() {
        let kv = Box::new(MemKv::new());

        let mut cfg = NodeConfig::defaults(mac());
        cfg.dev_name = "N1".into();
        cfg.relays.gpio = vec![26, 27];
        cfg.relays.active_low_mask = 0b01;
        cfg.relays.autoff_sec = vec![0, 120];
        cfg.pwm.gpio = vec![18];
        cfg.pwm.freq_hz = 1000;
        cfg.inputs.gpio = vec![4];
        cfg.inputs.debounce_ms = vec![50];

        let store = ConfigStore::new(kv, mac());
        store.save(&cfg).await.unwrap();
        // same backend, fresh load
        let reloaded = ConfigStore::load_from(&*store.kv, mac());
        assert_eq!(reloaded, cfg);
    }

    #[tokio::test]
    async fn version_mismatch_loads_defaults() {
        let kv = MemKv::new();
        kv.set_str("dev", "STALE");
        kv.set_u32("v", SCHEMA_VERSION + 1);
        let store = ConfigStore::new(Box::new(kv), mac());
        assert_eq!(store.cached().await.dev_name, "NODE_020000ABCDEF");
    }

    #[tokio::test]
    async fn invalid_record_rejected_on_save() {
        let store = ConfigStore::new(Box::new(MemKv::new()), mac());
        let mut cfg = NodeConfig::defaults(mac());
        cfg.relays.gpio = vec![1; CH_MAX + 1];
        cfg.relays.autoff_sec = vec![0; CH_MAX + 1];
        assert!(matches!(
            store.save(&cfg).await,
            Err(StoreError::InvalidConfig)
        ));
    }

    #[tokio::test]
    async fn erase_returns_to_defaults_on_reload() {
        let store = ConfigStore::new(Box::new(MemKv::new()), mac());
        let mut cfg = NodeConfig::defaults(mac());
        cfg.relays.gpio = vec![26];
        cfg.relays.autoff_sec = vec![0];
        store.save(&cfg).await.unwrap();

        store.erase_all().await.unwrap();
        let reloaded = ConfigStore::load_from(&*store.kv, mac());
        assert_eq!(reloaded, NodeConfig::defaults(mac()));
    }

    #[tokio::test]
    async fn file_backend_survives_reopen() {
        let path = std::env::temp_dir().join(format!("meshio-cfg-{}.json", uuid::Uuid::new_v4()));

        let mut cfg = NodeConfig::defaults(mac());
        cfg.relays.gpio = vec![14];
        cfg.relays.autoff_sec = vec![5];
        {
            let store = ConfigStore::new(Box::new(FileKv::open(&path)), mac());
            store.save(&cfg).await.unwrap();
        }
        let store = ConfigStore::new(Box::new(FileKv::open(&path)), mac());
        assert_eq!(store.cached().await, cfg);
        let _ = std::fs::remove_file(&path);
    }
}
