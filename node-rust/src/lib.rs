//! # meshio-node
//!
//! Control-plane of a mesh-attached I/O node: relays, PWM outputs and
//! debounced inputs, commanded over MQTT and reachable through a
//! self-organizing mesh. One node holds the root role and bridges broker
//! traffic into the mesh; every other node is reached transparently through
//! it.
//!
//! ## Module map
//! - [`parser`] — JSON command → canonical message (alias-tolerant)
//! - [`router`] — local-vs-remote dispatch and State publication
//! - [`mesh_link`] — envelope transport, peer cache, root lifecycle
//! - [`mesh_radio`] — radio trait + in-process sim hub
//! - [`mqtt_bridge`] — broker subscriptions, inbound demux, offline queue
//! - [`config_store`] / [`config_apply`] — persisted I/O mapping and the
//!   validate / reinit / persist / announce loop
//! - [`relay_ctrl`] / [`pwm_ctrl`] / [`input_ctrl`] over [`hal`]

pub mod config_apply;
pub mod config_store;
pub mod hal;
pub mod input_ctrl;
pub mod mesh_link;
pub mod mesh_radio;
pub mod mqtt_bridge;
pub mod parser;
pub mod pwm_ctrl;
pub mod relay_ctrl;
pub mod router;

/// Wall-clock milliseconds, used for wire timestamps and TTL bookkeeping.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
