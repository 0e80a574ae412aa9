//! # mesh_link
//!
//! Topology-aware envelope transport on top of [`MeshRadio`]:
//!
//! - name → address resolution through a bounded, LRU-evicted peer cache
//!   fed by every received frame
//! - request/acknowledge correlation over a bounded pending table; a
//!   received REQUEST is acknowledged with a RESPONSE frame carrying the
//!   same correlation id
//! - the root lifecycle: epoch counter, topology CRC fingerprint, retained
//!   RouteTable + Current documents, janitor cleanup of merged-away roots
//!   and a TTL sweep of stale ones
//!
//! All lifecycle publishes funnel through one worker task, so the retained
//! `Mesh/...` namespace has a single writer per node. Inbound requests and
//! events leave this module as [`MeshInbound`] items on an mpsc channel;
//! the wiring layer connects them to the router.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

use meshio_types::{Envelope, EnvelopeKind, FrameType, MacAddr, ROOT_SENTINEL};

use crate::mesh_radio::{MeshRadio, RadioEvent};
use crate::mqtt_bridge::MqttBridge;
use crate::now_ms;

const MAX_PEERS: usize = 16;
const MAX_PENDING: usize = 16;
const MAX_SEEN_ROOTS: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshStatus {
    Ok,
    Timeout,
    NoRoute,
    Err,
}

impl MeshStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MeshStatus::Ok => "OK",
            MeshStatus::Timeout => "TIMEOUT",
            MeshStatus::NoRoute => "NO_ROUTE",
            MeshStatus::Err => "ERR",
        }
    }
}

/// Decoded traffic handed to the wiring layer.
#[derive(Debug)]
pub enum MeshInbound {
    Request(Envelope),
    Event(Envelope),
}

#[derive(Debug, Clone)]
pub struct MeshOptions {
    pub local_dev: String,
    pub default_ttl: i8,
    pub heartbeat_ms: u64,
    pub root_ttl_ms: u64,
}

impl MeshOptions {
    pub fn new(local_dev: &str) -> Self {
        Self {
            local_dev: local_dev.to_string(),
            default_ttl: 3,
            heartbeat_ms: 20_000,
            root_ttl_ms: 90_000,
        }
    }
}

// ── Peer cache ────────────────────────────────────────────────────────────────

struct Peer {
    name: String,
    mac: MacAddr,
    last_ms: u64,
}

#[derive(Default)]
struct PeerCache {
    peers: Vec<Peer>,
}

impl PeerCache {
    fn upsert(&mut self, name: &str, mac: MacAddr, now: u64) {
        if name.is_empty() {
            return;
        }
        if let Some(p) = self.peers.iter_mut().find(|p| p.name == name) {
            p.mac = mac;
            p.last_ms = now;
            return;
        }
        if self.peers.len() == MAX_PEERS {
            // evict the least recently seen
            if let Some(oldest) = self
                .peers
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| p.last_ms)
                .map(|(i, _)| i)
            {
                self.peers.remove(oldest);
            }
        }
        self.peers.push(Peer {
            name: name.to_string(),
            mac,
            last_ms: now,
        });
    }

    fn resolve(&mut self, name: &str, now: u64) -> Option<MacAddr> {
        let p = self.peers.iter_mut().find(|p| p.name == name)?;
        p.last_ms = now;
        Some(p.mac)
    }
}

// ── Root-side state ───────────────────────────────────────────────────────────

#[derive(Default)]
struct RootState {
    is_root: bool,
    root_mac: Option<MacAddr>,
    epoch: u32,
    last_topo_crc: u32,
    hello_sent_to: Option<MacAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Work {
    RtAdd,
    RtRemove,
    ChildAdd,
    ChildRemove,
    RootChange { now_root: bool },
    Heartbeat,
}

struct Pending {
    corr_id: u32,
    tx: oneshot::Sender<MeshStatus>,
}

pub type RoleHook = Arc<dyn Fn(bool) + Send + Sync>;

pub struct MeshLink {
    opts: MeshOptions,
    radio: Arc<dyn MeshRadio>,
    bridge: Arc<MqttBridge>,
    mesh_id_hex: String,
    peers: Mutex<PeerCache>,
    pending: Mutex<Vec<Option<Pending>>>,
    root: Mutex<RootState>,
    seen_roots: Mutex<HashMap<String, u64>>,
    work_tx: mpsc::Sender<Work>,
    inbound_tx: mpsc::Sender<MeshInbound>,
    role_hook: Mutex<Option<RoleHook>>,
}

impl MeshLink {
    /// Bring the link up: spawns the receive loop, the radio event pump and
    /// the lifecycle worker.
    pub fn start(
        opts: MeshOptions,
        radio: Arc<dyn MeshRadio>,
        bridge: Arc<MqttBridge>,
        inbound_tx: mpsc::Sender<MeshInbound>,
    ) -> Arc<Self> {
        let (work_tx, work_rx) = mpsc::channel(8);
        let mesh_id_hex = radio.mesh_id().to_hex();
        let link = Arc::new(Self {
            opts,
            radio,
            bridge,
            mesh_id_hex,
            peers: Mutex::new(PeerCache::default()),
            pending: Mutex::new((0..MAX_PENDING).map(|_| None).collect()),
            root: Mutex::new(RootState::default()),
            seen_roots: Mutex::new(HashMap::new()),
            work_tx,
            inbound_tx,
            role_hook: Mutex::new(None),
        });

        let rx_link = Arc::clone(&link);
        tokio::spawn(async move { rx_link.rx_loop().await });

        if let Some(events) = link.radio.take_events() {
            let ev_link = Arc::clone(&link);
            tokio::spawn(async move { ev_link.event_pump(events).await });
        }

        let worker_link = Arc::clone(&link);
        tokio::spawn(async move { worker_link.worker(work_rx).await });

        link
    }

    pub fn register_root(&self, hook: RoleHook) {
        *self.role_hook.lock().unwrap() = Some(hook);
    }

    pub fn is_root(&self) -> bool {
        self.root.lock().unwrap().is_root
    }

    pub fn mesh_id_hex(&self) -> &str {
        &self.mesh_id_hex
    }

    /// Current routing snapshot as MAC strings.
    pub fn snapshot(&self) -> Vec<String> {
        self.radio
            .routing_table()
            .iter()
            .map(|m| m.to_string())
            .collect()
    }

    /// Refresh the seen-root table (driven by the retained Current stream).
    pub fn touch_seen_root(&self, mac: &str) {
        if mac.is_empty() {
            return;
        }
        let mut seen = self.seen_roots.lock().unwrap();
        if let Some(ts) = seen.get_mut(mac) {
            *ts = now_ms();
        } else if seen.len() < MAX_SEEN_ROOTS {
            seen.insert(mac.to_string(), now_ms());
        }
    }

    // ── Request / event ───────────────────────────────────────────────────────

    /// Send a REQUEST and block until its RESPONSE, the timeout, or a
    /// transmit failure.
    pub async fn request(&self, mut env: Envelope, timeout_ms: u64) -> MeshStatus {
        let Some(dst) = self.resolve_dst(env.dst_dev.as_deref()) else {
            return MeshStatus::NoRoute;
        };

        self.finalize(&mut env, FrameType::Request);
        let Some((slot, rx)) = self.pending_alloc(env.corr_id) else {
            return MeshStatus::Err;
        };

        let frame = match env.encode() {
            Ok(f) => f,
            Err(e) => {
                warn!("request encode failed: {e}");
                self.pending_free(slot);
                return MeshStatus::Err;
            }
        };
        if let Err(e) = self.radio.send(dst, frame).await {
            debug!("request transmit failed: {e}");
            self.pending_free(slot);
            return MeshStatus::NoRoute;
        }

        match timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(st)) => st,
            Ok(Err(_)) => {
                self.pending_free(slot);
                MeshStatus::Err
            }
            Err(_) => {
                self.pending_free(slot);
                MeshStatus::Timeout
            }
        }
    }

    /// Fire-and-forget unicast.
    pub async fn send_event(&self, mut env: Envelope) -> MeshStatus {
        let Some(dst) = self.resolve_dst(env.dst_dev.as_deref()) else {
            return MeshStatus::NoRoute;
        };
        self.finalize(&mut env, FrameType::Event);
        let frame = match env.encode() {
            Ok(f) => f,
            Err(e) => {
                warn!("event encode failed: {e}");
                return MeshStatus::Err;
            }
        };
        match self.radio.send(dst, frame).await {
            Ok(()) => MeshStatus::Ok,
            Err(_) => MeshStatus::Err,
        }
    }

    fn finalize(&self, env: &mut Envelope, frame: FrameType) {
        env.schema = meshio_types::ENVELOPE_SCHEMA.to_string();
        env.frame = frame;
        if env.ts_ms == 0 {
            env.ts_ms = now_ms();
        }
        if env.src_dev.is_empty() {
            env.src_dev = self.opts.local_dev.clone();
        }
        if env.ttl == 0 {
            env.ttl = self.opts.default_ttl;
        }
    }

    fn resolve_dst(&self, dst_dev: Option<&str>) -> Option<MacAddr> {
        match dst_dev {
            None | Some("") | Some(ROOT_SENTINEL) => self.root.lock().unwrap().root_mac,
            Some(name) => self.peers.lock().unwrap().resolve(name, now_ms()),
        }
    }

    fn pending_alloc(&self, corr_id: u32) -> Option<(usize, oneshot::Receiver<MeshStatus>)> {
        let mut pending = self.pending.lock().unwrap();
        let slot = pending.iter().position(Option::is_none)?;
        let (tx, rx) = oneshot::channel();
        pending[slot] = Some(Pending { corr_id, tx });
        Some((slot, rx))
    }

    fn pending_free(&self, slot: usize) {
        self.pending.lock().unwrap()[slot] = None;
    }

    fn pending_signal(&self, corr_id: u32, st: MeshStatus) {
        let mut pending = self.pending.lock().unwrap();
        for slot in pending.iter_mut() {
            if slot.as_ref().is_some_and(|p| p.corr_id == corr_id) {
                if let Some(p) = slot.take() {
                    let _ = p.tx.send(st);
                }
                return;
            }
        }
    }

    // ── Receive path ──────────────────────────────────────────────────────────

    async fn rx_loop(self: Arc<Self>) {
        while let Some((from, frame)) = self.radio.recv().await {
            let env = match Envelope::decode(&frame) {
                Ok(e) => e,
                Err(e) => {
                    warn!("dropped malformed frame from {from}: {e}");
                    continue;
                }
            };
            self.peers
                .lock()
                .unwrap()
                .upsert(&env.src_dev, from, now_ms());

            match env.frame {
                FrameType::Response => self.pending_signal(env.corr_id, MeshStatus::Ok),
                FrameType::Request => {
                    self.ack_request(from, &env).await;
                    let _ = self.inbound_tx.send(MeshInbound::Request(env)).await;
                }
                FrameType::Event | FrameType::Hello => {
                    let _ = self.inbound_tx.send(MeshInbound::Event(env)).await;
                }
            }
        }
    }

    /// Delivery acknowledgement for a received request.
    async fn ack_request(&self, from: MacAddr, req: &Envelope) {
        let mut ack = Envelope::new(
            FrameType::Response,
            req.kind,
            &self.opts.local_dev,
            &req.src_dev,
        );
        ack.corr_id = req.corr_id;
        ack.ts_ms = now_ms();
        match ack.encode() {
            Ok(frame) => {
                if let Err(e) = self.radio.send(from, frame).await {
                    debug!("response ack transmit failed: {e}");
                }
            }
            Err(e) => warn!("response ack encode failed: {e}"),
        }
    }

    // ── Role events ───────────────────────────────────────────────────────────

    async fn event_pump(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<RadioEvent>) {
        while let Some(ev) = events.recv().await {
            let work = match ev {
                RadioEvent::RouteAdd => Work::RtAdd,
                RadioEvent::RouteRemove => Work::RtRemove,
                RadioEvent::ChildConnected => Work::ChildAdd,
                RadioEvent::ChildDisconnected => Work::ChildRemove,
                RadioEvent::RootAddress { mac, is_root } => {
                    let greet = {
                        let mut root = self.root.lock().unwrap();
                        root.root_mac = Some(mac);
                        let greet = !is_root && root.hello_sent_to != Some(mac);
                        if greet {
                            root.hello_sent_to = Some(mac);
                        }
                        greet
                    };
                    if greet {
                        self.send_hello(mac).await;
                    }
                    Work::RootChange { now_root: is_root }
                }
            };
            if self.work_tx.send(work).await.is_err() {
                return;
            }
        }
    }

    /// Greet a newly learned root, once per root address.
    async fn send_hello(&self, root_mac: MacAddr) {
        let mut hello = Envelope::new(
            FrameType::Hello,
            EnvelopeKind::Diag,
            &self.opts.local_dev,
            ROOT_SENTINEL,
        );
        hello.ts_ms = now_ms();
        hello.payload = Some(json!({"type": "HELLO", "dev": self.opts.local_dev}));
        match hello.encode() {
            Ok(frame) => {
                if let Err(e) = self.radio.send(root_mac, frame).await {
                    debug!("hello transmit failed: {e}");
                } else {
                    info!("hello sent to root {root_mac}");
                }
            }
            Err(e) => warn!("hello encode failed: {e}"),
        }
    }

    // ── Lifecycle worker (single writer of the retained namespace) ───────────

    async fn worker(self: Arc<Self>, mut work_rx: mpsc::Receiver<Work>) {
        let mut hb_task: Option<JoinHandle<()>> = None;

        while let Some(work) = work_rx.recv().await {
            match work {
                Work::RootChange { now_root } => {
                    {
                        let mut root = self.root.lock().unwrap();
                        root.is_root = now_root;
                        if now_root {
                            root.epoch += 1;
                            root.last_topo_crc = 0;
                        }
                    }
                    if let Some(hook) = self.role_hook.lock().unwrap().clone() {
                        hook(now_root);
                    }
                    if now_root {
                        info!("root role acquired (epoch {})", self.epoch());
                        self.publish_route_event("ROOT_ELECTED").await;
                        if hb_task.is_none() {
                            hb_task = Some(self.spawn_heartbeat());
                        }
                    } else if let Some(task) = hb_task.take() {
                        task.abort();
                    }
                }
                Work::RtAdd if self.is_root() => self.publish_route_event("ADD").await,
                Work::RtRemove if self.is_root() => self.publish_route_event("REMOVE").await,
                Work::ChildAdd | Work::ChildRemove if self.is_root() => {
                    self.publish_diff_if_changed().await;
                }
                Work::Heartbeat if self.is_root() => {
                    self.publish_route_event("HEARTBEAT").await;
                    self.sweep_stale_roots().await;
                }
                _ => {}
            }
        }
        if let Some(task) = hb_task {
            task.abort();
        }
    }

    fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let link = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_millis(link.opts.heartbeat_ms)).await;
                if link.work_tx.send(Work::Heartbeat).await.is_err() {
                    return;
                }
            }
        })
    }

    fn epoch(&self) -> u32 {
        self.root.lock().unwrap().epoch
    }

    fn sorted_snapshot(&self) -> Vec<MacAddr> {
        let mut snap = self.radio.routing_table();
        snap.sort();
        snap
    }

    /// CRC32 over `[is_root | root_mac | epoch | mesh_id]` followed by the
    /// sorted routing table, so a new root's first fingerprint can never
    /// collide with a previous root's last one.
    fn topology_crc(&self, sorted_snap: &[MacAddr]) -> u32 {
        let (is_root, root_mac, epoch) = {
            let root = self.root.lock().unwrap();
            (
                root.is_root,
                root.root_mac.unwrap_or(self.radio.local_mac()),
                root.epoch,
            )
        };
        let mut hasher = crc32fast::Hasher::new();
        let mut header = [0u8; 17];
        header[0] = u8::from(is_root);
        header[1..7].copy_from_slice(&root_mac.0);
        header[7..11].copy_from_slice(&epoch.to_le_bytes());
        header[11..17].copy_from_slice(&self.radio.mesh_id().0);
        hasher.update(&header);
        for mac in sorted_snap {
            hasher.update(&mac.0);
        }
        hasher.finalize()
    }

    async fn publish_route_event(&self, event: &str) {
        let snap = self.sorted_snapshot();
        let topo = self.topology_crc(&snap);
        let (root_mac, epoch, is_root) = {
            let mut root = self.root.lock().unwrap();
            root.last_topo_crc = topo;
            (
                root.root_mac.unwrap_or(self.radio.local_mac()),
                root.epoch,
                root.is_root,
            )
        };
        let root_mac_s = root_mac.to_string();
        let nodes: Vec<String> = snap.iter().map(|m| m.to_string()).collect();

        let doc = json!({
            "event": event,
            "mesh_id": self.mesh_id_hex,
            "root_mac": root_mac_s,
            "root_dev": self.opts.local_dev,
            "is_root": is_root,
            "root_epoch": epoch,
            "topology_hash": topo,
            "published_ms": now_ms(),
            "nodes": nodes,
        });
        let topic = format!("Mesh/{}/Root/{}/RouteTable", self.mesh_id_hex, root_mac_s);
        self.bridge.publish(&topic, &doc.to_string(), 1, true).await;

        self.publish_root_current(snap.len(), topo, root_mac_s.as_str(), epoch, is_root)
            .await;

        if event != "HEARTBEAT" {
            self.janitor(&snap, root_mac).await;
        }
    }

    async fn publish_root_current(
        &self,
        node_count: usize,
        topo: u32,
        root_mac: &str,
        epoch: u32,
        is_root: bool,
    ) {
        let doc = json!({
            "mesh_id": self.mesh_id_hex,
            "root_mac": root_mac,
            "root_dev": self.opts.local_dev,
            "root_epoch": epoch,
            "is_root": is_root,
            "published_ms": now_ms(),
            "node_count": node_count,
            "topology_hash": topo,
        });
        let topic = format!("Mesh/{}/Root/Current/{}", self.mesh_id_hex, root_mac);
        self.bridge.publish(&topic, &doc.to_string(), 1, true).await;
    }

    async fn publish_diff_if_changed(&self) {
        let snap = self.sorted_snapshot();
        let topo = self.topology_crc(&snap);
        let changed = self.root.lock().unwrap().last_topo_crc != topo;
        if changed {
            self.publish_route_event("ROUTE_DIFF").await;
        }
    }

    /// Retained-topic cleanup for former roots now living in our tree.
    async fn janitor(&self, snap: &[MacAddr], own_root_mac: MacAddr) {
        for mac in snap {
            if *mac == own_root_mac {
                continue;
            }
            self.clear_root_topics(&mac.to_string()).await;
        }
    }

    async fn clear_root_topics(&self, mac: &str) {
        let rt = format!("Mesh/{}/Root/{}/RouteTable", self.mesh_id_hex, mac);
        let cur = format!("Mesh/{}/Root/Current/{}", self.mesh_id_hex, mac);
        self.bridge.publish(&rt, "", 1, true).await;
        self.bridge.publish(&cur, "", 1, true).await;
    }

    /// Drop retained state of roots that went silent past the TTL and are
    /// not part of the current tree.
    async fn sweep_stale_roots(&self) {
        let my_mac = self
            .root
            .lock()
            .unwrap()
            .root_mac
            .unwrap_or(self.radio.local_mac())
            .to_string();
        let snap: Vec<String> = self.snapshot();
        let now = now_ms();

        let stale: Vec<String> = {
            let seen = self.seen_roots.lock().unwrap();
            seen.iter()
                .filter(|(mac, last)| {
                    **mac != my_mac
                        && !snap.contains(mac)
                        && now.saturating_sub(**last) > self.opts.root_ttl_ms
                })
                .map(|(mac, _)| mac.clone())
                .collect()
        };

        for mac in stale {
            info!("sweeping stale root {mac}");
            self.clear_root_topics(&mac).await;
            self.seen_roots.lock().unwrap().remove(&mac);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh_radio::SimHub;
    use crate::mqtt_bridge::{BridgeOptions, RecordingBroker};
    use meshio_types::MeshId;

    fn mac(last: u8) -> MacAddr {
        MacAddr([2, 0, 0, 0, 0, last])
    }

    struct Node {
        broker: Arc<RecordingBroker>,
        link: Arc<MeshLink>,
        inbound: mpsc::Receiver<MeshInbound>,
    }

    async fn spawn_node(hub: &Arc<SimHub>, name: &str, last: u8) -> Node {
        let radio = hub.join(mac(last));
        let broker = RecordingBroker::new();
        let (btx, _brx) = mpsc::channel(16);
        let bridge = MqttBridge::new(
            broker.clone(),
            BridgeOptions::new(name, "112233445566"),
            btx,
        );
        bridge.on_connected().await;
        broker.take_published();
        let (tx, inbound) = mpsc::channel(16);
        let link = MeshLink::start(MeshOptions::new(name), radio, bridge, tx);
        Node {
            broker,
            link,
            inbound,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn request_gets_acked_and_delivered() {
        let hub = SimHub::new(MeshId([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]));
        let mut n1 = spawn_node(&hub, "N1", 1).await;
        let mut n2 = spawn_node(&hub, "N2", 2).await;
        hub.elect_root(mac(1));
        settle().await;

        // N2 introduces itself so N1 can resolve it by name
        let mut intro = Envelope::new(FrameType::Event, EnvelopeKind::Diag, "N2", "N1");
        n2.link.peers.lock().unwrap().upsert("N1", mac(1), 1);
        intro.ts_ms = 1;
        assert_eq!(n2.link.send_event(intro).await, MeshStatus::Ok);
        settle().await;

        let mut req = Envelope::new(FrameType::Request, EnvelopeKind::Relay, "N1", "N2");
        req.corr_id = 77;
        let st = n1.link.request(req, 500).await;
        assert_eq!(st, MeshStatus::Ok);

        // N2 saw the request on its inbound channel
        match n2.inbound.try_recv() {
            Ok(MeshInbound::Request(env)) => assert_eq!(env.corr_id, 77),
            other => panic!("expected request, got {other:?}"),
        }
        // the intro event landed on N1's side
        assert!(matches!(
            n1.inbound.try_recv(),
            Ok(MeshInbound::Event(_))
        ));
    }

    #[tokio::test]
    async fn unknown_destination_is_no_route() {
        let hub = SimHub::new(MeshId([1; 6]));
        let n1 = spawn_node(&hub, "N1", 1).await;
        let req = Envelope::new(FrameType::Request, EnvelopeKind::Relay, "N1", "NOBODY");
        assert_eq!(n1.link.request(req, 100).await, MeshStatus::NoRoute);
        // root sentinel without a known root is NO_ROUTE as well
        let req = Envelope::new(FrameType::Request, EnvelopeKind::Diag, "N1", ROOT_SENTINEL);
        assert_eq!(n1.link.request(req, 100).await, MeshStatus::NoRoute);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let hub = SimHub::new(MeshId([1; 6]));
        let n1 = spawn_node(&hub, "N1", 1).await;
        // a peer that exists in the cache but never answers (no rx loop on
        // the raw radio side)
        let _silent = hub.join(mac(9));
        n1.link.peers.lock().unwrap().upsert("GHOST", mac(9), 1);

        let mut req = Envelope::new(FrameType::Request, EnvelopeKind::Relay, "N1", "GHOST");
        req.corr_id = 5;
        assert_eq!(n1.link.request(req, 250).await, MeshStatus::Timeout);
        // slot was released
        assert!(n1.link.pending.lock().unwrap().iter().all(Option::is_none));
    }

    #[tokio::test]
    async fn pending_table_overflow_is_err() {
        let hub = SimHub::new(MeshId([1; 6]));
        let n1 = spawn_node(&hub, "N1", 1).await;
        {
            let mut pending = n1.link.pending.lock().unwrap();
            for slot in pending.iter_mut() {
                let (tx, _rx) = oneshot::channel();
                *slot = Some(Pending { corr_id: 0, tx });
            }
        }
        n1.link.peers.lock().unwrap().upsert("N2", mac(2), 1);
        let req = Envelope::new(FrameType::Request, EnvelopeKind::Relay, "N1", "N2");
        assert_eq!(n1.link.request(req, 100).await, MeshStatus::Err);
    }

    #[test]
    fn peer_cache_lru_eviction() {
        let mut cache = PeerCache::default();
        for i in 0..MAX_PEERS as u8 {
            cache.upsert(&format!("N{i}"), mac(i), u64::from(i));
        }
        // refresh the oldest, then overflow
        cache.resolve("N0", 100);
        cache.upsert("NEW", mac(99), 101);
        assert_eq!(cache.peers.len(), MAX_PEERS);
        assert!(cache.resolve("N0", 102).is_some());
        assert!(cache.resolve("N1", 102).is_none()); // evicted
        assert!(cache.resolve("NEW", 102).is_some());
    }

    #[tokio::test]
    async fn topology_crc_ignores_join_order() {
        // same membership, different join order: identical fingerprint
        let hub_a = SimHub::new(MeshId([1; 6]));
        let a = spawn_node(&hub_a, "N1", 1).await;
        let _a2 = hub_a.join(mac(2));
        let _a3 = hub_a.join(mac(3));

        let hub_b = SimHub::new(MeshId([1; 6]));
        let b = spawn_node(&hub_b, "N1", 1).await;
        let _b3 = hub_b.join(mac(3));
        let _b2 = hub_b.join(mac(2));

        let crc_a = a.link.topology_crc(&a.link.sorted_snapshot());
        let crc_b = b.link.topology_crc(&b.link.sorted_snapshot());
        assert_eq!(crc_a, crc_b);

        // a different epoch changes the fingerprint under the same table
        a.link.root.lock().unwrap().epoch += 1;
        assert_ne!(a.link.topology_crc(&a.link.sorted_snapshot()), crc_a);
    }

    #[tokio::test]
    async fn election_publishes_route_table_and_current() {
        let hub = SimHub::new(MeshId([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]));
        let n1 = spawn_node(&hub, "N1", 1).await;
        let _n2 = spawn_node(&hub, "N2", 2).await;
        hub.elect_root(mac(1));
        settle().await;

        let rt_topic = format!("Mesh/112233445566/Root/{}/RouteTable", mac(1));
        let rt = n1.broker.published_to(&rt_topic);
        assert!(!rt.is_empty());
        let doc: serde_json::Value = serde_json::from_str(&rt[0].payload).unwrap();
        assert_eq!(doc["event"], "ROOT_ELECTED");
        assert_eq!(doc["root_epoch"], 1);
        assert_eq!(doc["nodes"].as_array().unwrap().len(), 2);
        assert!(rt[0].retain);

        let cur_topic = format!("Mesh/112233445566/Root/Current/{}", mac(1));
        let cur = n1.broker.published_to(&cur_topic);
        assert!(!cur.is_empty());
        let doc: serde_json::Value = serde_json::from_str(&cur[0].payload).unwrap();
        assert_eq!(doc["node_count"], 2);
        assert!(cur[0].retain);

        assert_eq!(n1.link.mesh_id_hex(), "112233445566");
        assert_eq!(n1.link.snapshot(), vec![mac(1).to_string(), mac(2).to_string()]);
    }

    #[tokio::test]
    async fn janitor_clears_merged_roots() {
        let hub = SimHub::new(MeshId([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]));
        let n1 = spawn_node(&hub, "N1", 1).await;
        let _n2 = spawn_node(&hub, "N2", 2).await;
        hub.elect_root(mac(1));
        settle().await;

        // node 2 is in the tree but is not the root: its retained root
        // topics were cleared by the janitor
        let cleared = n1
            .broker
            .published_to(&format!("Mesh/112233445566/Root/Current/{}", mac(2)));
        assert!(cleared.iter().any(|r| r.payload.is_empty() && r.retain));
    }

    #[tokio::test]
    async fn stale_root_swept_after_ttl() {
        let hub = SimHub::new(MeshId([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]));
        let n1 = spawn_node(&hub, "N1", 1).await;
        hub.elect_root(mac(1));
        settle().await;

        // a root sighting far in the past, absent from the snapshot
        n1.link
            .seen_roots
            .lock()
            .unwrap()
            .insert("aa:bb:cc:dd:ee:ff".into(), now_ms() - 120_000);
        n1.broker.take_published();

        n1.link.work_tx.send(Work::Heartbeat).await.unwrap();
        settle().await;

        let cur = n1
            .broker
            .published_to("Mesh/112233445566/Root/Current/aa:bb:cc:dd:ee:ff");
        assert!(cur.iter().any(|r| r.payload.is_empty() && r.retain));
        let rt = n1
            .broker
            .published_to("Mesh/112233445566/Root/aa:bb:cc:dd:ee:ff/RouteTable");
        assert!(rt.iter().any(|r| r.payload.is_empty() && r.retain));
        assert!(n1.link.seen_roots.lock().unwrap().is_empty());

        // heartbeat itself kept the live pair published
        let own = n1
            .broker
            .published_to(&format!("Mesh/112233445566/Root/{}/RouteTable", mac(1)));
        let doc: serde_json::Value = serde_json::from_str(&own[0].payload).unwrap();
        assert_eq!(doc["event"], "HEARTBEAT");
    }

    #[tokio::test]
    async fn fresh_root_not_swept() {
        let hub = SimHub::new(MeshId([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]));
        let n1 = spawn_node(&hub, "N1", 1).await;
        hub.elect_root(mac(1));
        settle().await;

        n1.link.touch_seen_root("aa:bb:cc:dd:ee:ff");
        n1.broker.take_published();
        n1.link.work_tx.send(Work::Heartbeat).await.unwrap();
        settle().await;

        let cur = n1
            .broker
            .published_to("Mesh/112233445566/Root/Current/aa:bb:cc:dd:ee:ff");
        assert!(cur.is_empty());
    }

    #[tokio::test]
    async fn leaf_greets_root_once() {
        let hub = SimHub::new(MeshId([1; 6]));
        let n1 = spawn_node(&hub, "N1", 1).await;
        let n2 = spawn_node(&hub, "N2", 2).await;
        hub.elect_root(mac(1));
        settle().await;
        // re-announcing the same root must not produce a second hello
        hub.elect_root(mac(1));
        settle().await;

        let mut inbound = n1.inbound;
        let mut hellos = 0;
        while let Ok(msg) = inbound.try_recv() {
            if let MeshInbound::Event(env) = msg {
                if env.payload.as_ref().is_some_and(|p| p["type"] == "HELLO") {
                    assert_eq!(env.src_dev, "N2");
                    hellos += 1;
                }
            }
        }
        assert_eq!(hellos, 1);
        let _ = n2;
    }
}
