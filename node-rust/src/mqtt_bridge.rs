//! # mqtt_bridge
//!
//! The node's broker edge: subscription set, inbound demux, root-side
//! config forwarding, online/offline Status and the bounded offline
//! publish queue. The broker client itself stays behind [`BrokerClient`];
//! [`RumqttcBroker`] adapts `rumqttc::AsyncClient` for production and
//! [`RecordingBroker`] stands in for tests.
//!
//! Inbound traffic is demuxed into typed [`Inbound`] items on one mpsc
//! channel; the wiring layer decides what consumes them (parser/router,
//! config apply, mesh seen-root tracking).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, LastWill, MqttOptions, QoS};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::now_ms;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("not connected")]
    Disconnected,
    #[error("transport: {0}")]
    Transport(String),
}

// ── Broker client surface ─────────────────────────────────────────────────────

/// What the bridge needs from an MQTT client implementation.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: bool,
    ) -> Result<(), BrokerError>;
    async fn subscribe(&self, filter: &str, qos: u8) -> Result<(), BrokerError>;
}

// ── Inbound demux ─────────────────────────────────────────────────────────────

/// One routed inbound broker message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// `<prefix>/<dev>/Cmd/Set`
    Command { topic: String, payload: String },
    /// `<prefix>/<dev>/Config/Set`, already confirmed to be for this node
    Config { topic: String, payload: String },
    /// `Mesh/<mesh_id>/Root/Current/<mac>` (non-empty payload)
    RootCurrent { mac: String },
}

// ── Bridge ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub base_prefix: String,
    pub local_dev: String,
    pub is_root: bool,
    pub mesh_id_hex: String,
    pub offline_cap: usize,
    pub offline_ttl_ms: u64,
}

impl BridgeOptions {
    pub fn new(local_dev: &str, mesh_id_hex: &str) -> Self {
        Self {
            base_prefix: "Devices".to_string(),
            local_dev: local_dev.to_string(),
            is_root: false,
            mesh_id_hex: mesh_id_hex.to_string(),
            offline_cap: 16,
            offline_ttl_ms: 30_000,
        }
    }
}

struct QueuedMsg {
    topic: String,
    payload: Vec<u8>,
    qos: u8,
    retain: bool,
    expire_ts: u64,
}

pub struct MqttBridge {
    client: Arc<dyn BrokerClient>,
    opts: BridgeOptions,
    connected: AtomicBool,
    queue: Mutex<VecDeque<QueuedMsg>>,
    inbound_tx: mpsc::Sender<Inbound>,
}

impl MqttBridge {
    pub fn new(
        client: Arc<dyn BrokerClient>,
        opts: BridgeOptions,
        inbound_tx: mpsc::Sender<Inbound>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            opts,
            connected: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            inbound_tx,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn local_dev(&self) -> &str {
        &self.opts.local_dev
    }

    pub fn base_prefix(&self) -> &str {
        &self.opts.base_prefix
    }

    /// Publish, falling back to the offline queue when the transport is
    /// down. Returns false only when the message could not even be queued.
    pub async fn publish(&self, topic: &str, payload: &str, qos: u8, retain: bool) -> bool {
        if self.is_connected() {
            match self.client.publish(topic, payload.as_bytes(), qos, retain).await {
                Ok(()) => return true,
                Err(e) => warn!("publish to {topic} failed ({e}), queueing"),
            }
        }
        self.enqueue(topic, payload.as_bytes(), qos, retain);
        true
    }

    fn enqueue(&self, topic: &str, payload: &[u8], qos: u8, retain: bool) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() == self.opts.offline_cap {
            queue.pop_front();
            warn!("offline queue full, dropped oldest");
        }
        queue.push_back(QueuedMsg {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
            expire_ts: now_ms() + self.opts.offline_ttl_ms,
        });
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Transport came up: announce, subscribe, drain the queue.
    pub async fn on_connected(&self) {
        self.connected.store(true, Ordering::Relaxed);
        info!(dev = %self.opts.local_dev, root = self.opts.is_root, "broker connected");

        let status_topic = format!(
            "{}/{}/Status",
            self.opts.base_prefix, self.opts.local_dev
        );
        let online = json!({"status": "online", "dev": self.opts.local_dev}).to_string();
        if let Err(e) = self
            .client
            .publish(&status_topic, online.as_bytes(), 1, true)
            .await
        {
            warn!("online status publish failed: {e}");
        }

        self.do_subscriptions().await;
        self.flush_queue().await;
    }

    pub fn on_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
        warn!("broker disconnected");
    }

    async fn do_subscriptions(&self) {
        let base = &self.opts.base_prefix;
        let filters = if self.opts.is_root {
            [format!("{base}/+/Cmd/Set"), format!("{base}/+/Config/Set")]
        } else {
            let dev = &self.opts.local_dev;
            [
                format!("{base}/{dev}/Cmd/Set"),
                format!("{base}/{dev}/Config/Set"),
            ]
        };
        for filter in filters
            .iter()
            .chain(std::iter::once(&format!(
                "Mesh/{}/Root/Current/+",
                self.opts.mesh_id_hex
            )))
        {
            match self.client.subscribe(filter, 1).await {
                Ok(()) => info!("subscribed {filter}"),
                Err(e) => warn!("subscribe {filter} failed: {e}"),
            }
        }
    }

    async fn flush_queue(&self) {
        loop {
            let msg = match self.queue.lock().unwrap().pop_front() {
                Some(m) => m,
                None => return,
            };
            if now_ms() > msg.expire_ts {
                warn!("dropped expired queued message to {}", msg.topic);
                continue;
            }
            if let Err(e) = self
                .client
                .publish(&msg.topic, &msg.payload, msg.qos, msg.retain)
                .await
            {
                warn!("flush stopped at {} ({e}), keeping remainder", msg.topic);
                self.queue.lock().unwrap().push_front(msg);
                return;
            }
            debug!("flushed queued message to {}", msg.topic);
        }
    }

    /// Demux one received broker message.
    pub async fn handle_inbound(&self, topic: &str, payload: &[u8]) {
        let payload = String::from_utf8_lossy(payload).into_owned();

        if ends_with_ci(topic, "/Config/Set") {
            // root forwards configs addressed to someone else, verbatim
            if let Some(target) = read_target_dev(&payload) {
                if target != self.opts.local_dev {
                    if self.opts.is_root {
                        let fwd = format!("{}/{}/Config/Set", self.opts.base_prefix, target);
                        info!("forwarding config to {fwd}");
                        self.publish(&fwd, &payload, 1, false).await;
                    } else {
                        debug!("config for {target} ignored (not root)");
                    }
                    return;
                }
            }
            let _ = self
                .inbound_tx
                .send(Inbound::Config {
                    topic: topic.to_string(),
                    payload,
                })
                .await;
            return;
        }

        if ends_with_ci(topic, "/Cmd/Set") {
            let _ = self
                .inbound_tx
                .send(Inbound::Command {
                    topic: topic.to_string(),
                    payload,
                })
                .await;
            return;
        }

        let current_prefix = format!("Mesh/{}/Root/Current/", self.opts.mesh_id_hex);
        if let Some(mac) = topic.strip_prefix(&current_prefix) {
            // empty retained payloads are tombstones, not sightings
            if !mac.is_empty() && !mac.contains('/') && !payload.is_empty() {
                let _ = self
                    .inbound_tx
                    .send(Inbound::RootCurrent {
                        mac: mac.to_string(),
                    })
                    .await;
            }
            return;
        }

        debug!("ignored inbound topic {topic}");
    }
}

fn ends_with_ci(topic: &str, suffix: &str) -> bool {
    let (t, s) = (topic.as_bytes(), suffix.as_bytes());
    t.len() >= s.len() && t[t.len() - s.len()..].eq_ignore_ascii_case(s)
}

fn read_target_dev(payload: &str) -> Option<String> {
    let v: serde_json::Value = serde_json::from_str(payload).ok()?;
    let t = v.get("target_dev")?.as_str()?;
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

// ── rumqttc adapter ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub keepalive_s: u64,
    pub lwt_topic: String,
}

pub struct RumqttcBroker {
    client: AsyncClient,
}

fn qos_from(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

impl RumqttcBroker {
    /// Build the client with the retained offline LWT. The returned event
    /// loop must be driven with [`drive_event_loop`].
    pub fn connect(opts: &ConnectOptions) -> (Arc<Self>, EventLoop) {
        let mut mqtt = MqttOptions::new(opts.client_id.as_str(), opts.host.as_str(), opts.port);
        mqtt.set_keep_alive(std::time::Duration::from_secs(opts.keepalive_s));
        if !opts.username.is_empty() {
            mqtt.set_credentials(opts.username.as_str(), opts.password.as_str());
        }
        mqtt.set_last_will(LastWill::new(
            opts.lwt_topic.as_str(),
            json!({"status": "offline"}).to_string(),
            QoS::AtLeastOnce,
            true,
        ));
        let (client, eventloop) = AsyncClient::new(mqtt, 64);
        (Arc::new(Self { client }), eventloop)
    }
}

#[async_trait]
impl BrokerClient for RumqttcBroker {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: bool,
    ) -> Result<(), BrokerError> {
        self.client
            .publish(topic, qos_from(qos), retain, payload.to_vec())
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }

    async fn subscribe(&self, filter: &str, qos: u8) -> Result<(), BrokerError> {
        self.client
            .subscribe(filter, qos_from(qos))
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }
}

/// Drive the rumqttc event loop, feeding connection state and inbound
/// publishes into the bridge. Never returns; errors back off and retry.
pub async fn drive_event_loop(mut eventloop: EventLoop, bridge: Arc<MqttBridge>) {
    use rumqttc::{Event, Packet};
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => bridge.on_connected().await,
            Ok(Event::Incoming(Packet::Publish(p))) => {
                bridge.handle_inbound(&p.topic, &p.payload).await;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => bridge.on_disconnected(),
            Ok(_) => {}
            Err(e) => {
                bridge.on_disconnected();
                warn!("mqtt event loop error: {e}");
                sleep(Duration::from_millis(1000)).await;
            }
        }
    }
}

// ── Test support ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRecord {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

/// In-memory broker client recording everything it is asked to do. Used by
/// the unit tests and the end-to-end harness.
#[derive(Default)]
pub struct RecordingBroker {
    published: Mutex<Vec<PublishRecord>>,
    subscribed: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl RecordingBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every publish fail until re-enabled.
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::Relaxed);
    }

    pub fn published(&self) -> Vec<PublishRecord> {
        self.published.lock().unwrap().clone()
    }

    pub fn take_published(&self) -> Vec<PublishRecord> {
        std::mem::take(&mut self.published.lock().unwrap())
    }

    pub fn published_to(&self, topic: &str) -> Vec<PublishRecord> {
        self.published()
            .into_iter()
            .filter(|r| r.topic == topic)
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscribed.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrokerClient for RecordingBroker {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: bool,
    ) -> Result<(), BrokerError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(BrokerError::Disconnected);
        }
        self.published.lock().unwrap().push(PublishRecord {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            qos,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&self, filter: &str, _qos: u8) -> Result<(), BrokerError> {
        self.subscribed.lock().unwrap().push(filter.to_string());
        Ok(())
    }
}
