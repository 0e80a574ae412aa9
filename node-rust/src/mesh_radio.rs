//! # mesh_radio
//!
//! The radio surface consumed by the mesh link. The self-organizing radio
//! stack itself (channel management, layering, parent selection) lives
//! outside this crate; [`MeshRadio`] is exactly what the link needs from
//! it: unicast frames, the routing snapshot, and the role/topology event
//! stream.
//!
//! [`SimHub`] + [`SimRadio`] implement the trait in-process: a hub holds
//! one frame channel per joined node and replays role events, which is
//! enough to run a whole multi-node mesh inside one test.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use meshio_types::{MacAddr, MeshId};

#[derive(Debug, thiserror::Error)]
pub enum RadioError {
    #[error("no link to {0}")]
    NoLink(MacAddr),
}

/// Topology/role notifications delivered by the radio stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioEvent {
    RouteAdd,
    RouteRemove,
    ChildConnected,
    ChildDisconnected,
    /// The mesh announced (or changed) its root.
    RootAddress { mac: MacAddr, is_root: bool },
}

#[async_trait]
pub trait MeshRadio: Send + Sync {
    fn local_mac(&self) -> MacAddr;
    fn mesh_id(&self) -> MeshId;
    /// Unicast one wire frame.
    async fn send(&self, to: MacAddr, frame: Vec<u8>) -> Result<(), RadioError>;
    /// Next received frame with its source address; `None` when the radio
    /// is gone.
    async fn recv(&self) -> Option<(MacAddr, Vec<u8>)>;
    /// Current routing snapshot (root view: every node in the tree).
    fn routing_table(&self) -> Vec<MacAddr>;
    /// The role/topology event stream; yields once, `None` afterwards.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RadioEvent>>;
}

// ── In-process hub ────────────────────────────────────────────────────────────

struct NodePorts {
    frame_tx: mpsc::UnboundedSender<(MacAddr, Vec<u8>)>,
    event_tx: mpsc::UnboundedSender<RadioEvent>,
}

struct HubInner {
    nodes: HashMap<MacAddr, NodePorts>,
    order: Vec<MacAddr>,
    root: Option<MacAddr>,
}

/// One simulated mesh network.
pub struct SimHub {
    mesh_id: MeshId,
    inner: Mutex<HubInner>,
}

impl SimHub {
    pub fn new(mesh_id: MeshId) -> Arc<Self> {
        Arc::new(Self {
            mesh_id,
            inner: Mutex::new(HubInner {
                nodes: HashMap::new(),
                order: Vec::new(),
                root: None,
            }),
        })
    }

    /// Attach a node and hand back its radio.
    pub fn join(self: &Arc<Self>, mac: MacAddr) -> Arc<SimRadio> {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.nodes.insert(mac, NodePorts { frame_tx, event_tx });
            inner.order.push(mac);
            if let Some(root) = inner.root {
                if let Some(ports) = inner.nodes.get(&root) {
                    let _ = ports.event_tx.send(RadioEvent::RouteAdd);
                }
            }
        }
        Arc::new(SimRadio {
            hub: Arc::clone(self),
            mac,
            frames: tokio::sync::Mutex::new(frame_rx),
            events: Mutex::new(Some(event_rx)),
        })
    }

    /// Declare the root; every node hears a `RootAddress` event.
    pub fn elect_root(&self, mac: MacAddr) {
        let mut inner = self.inner.lock().unwrap();
        inner.root = Some(mac);
        for (node, ports) in &inner.nodes {
            let _ = ports.event_tx.send(RadioEvent::RootAddress {
                mac,
                is_root: *node == mac,
            });
        }
    }

    /// Detach a node; the root hears a `RouteRemove`.
    pub fn drop_node(&self, mac: MacAddr) {
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.remove(&mac);
        inner.order.retain(|m| *m != mac);
        if let Some(root) = inner.root {
            if let Some(ports) = inner.nodes.get(&root) {
                let _ = ports.event_tx.send(RadioEvent::RouteRemove);
            }
        }
    }
}

/// One node's view of the simulated mesh.
pub struct SimRadio {
    hub: Arc<SimHub>,
    mac: MacAddr,
    frames: tokio::sync::Mutex<mpsc::UnboundedReceiver<(MacAddr, Vec<u8>)>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<RadioEvent>>>,
}

#[async_trait]
impl MeshRadio for SimRadio {
    fn local_mac(&self) -> MacAddr {
        self.mac
    }

    fn mesh_id(&self) -> MeshId {
        self.hub.mesh_id
    }

    async fn send(&self, to: MacAddr, frame: Vec<u8>) -> Result<(), RadioError> {
        let inner = self.hub.inner.lock().unwrap();
        let ports = inner.nodes.get(&to).ok_or(RadioError::NoLink(to))?;
        ports
            .frame_tx
            .send((self.mac, frame))
            .map_err(|_| RadioError::NoLink(to))
    }

    async fn recv(&self) -> Option<(MacAddr, Vec<u8>)> {
        self.frames.lock().await.recv().await
    }

    fn routing_table(&self) -> Vec<MacAddr> {
        self.hub.inner.lock().unwrap().order.clone()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RadioEvent>> {
        self.events.lock().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(last: u8) -> MacAddr {
        MacAddr([2, 0, 0, 0, 0, last])
    }

    #[tokio::test]
    async fn frames_route_between_nodes() {
        let hub = SimHub::new(MeshId([1; 6]));
        let a = hub.join(mac(1));
        let b = hub.join(mac(2));

        a.send(mac(2), b"hello\0".to_vec()).await.unwrap();
        let (from, frame) = b.recv().await.unwrap();
        assert_eq!(from, mac(1));
        assert_eq!(frame, b"hello\0");

        assert!(a.send(mac(9), vec![]).await.is_err());
    }

    #[tokio::test]
    async fn election_notifies_every_node() {
        let hub = SimHub::new(MeshId([1; 6]));
        let a = hub.join(mac(1));
        let b = hub.join(mac(2));
        hub.elect_root(mac(1));

        let mut ev_a = a.take_events().unwrap();
        let mut ev_b = b.take_events().unwrap();
        assert_eq!(
            ev_a.recv().await,
            Some(RadioEvent::RootAddress { mac: mac(1), is_root: true })
        );
        assert_eq!(
            ev_b.recv().await,
            Some(RadioEvent::RootAddress { mac: mac(1), is_root: false })
        );
        assert_eq!(a.routing_table(), vec![mac(1), mac(2)]);
    }
}
