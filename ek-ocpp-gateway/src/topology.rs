//! Identity & topology table
//!
//! Maps node identifiers to the channel that reaches them. Lookups are
//! read-only and happen on every dispatch; channel registration is driven by
//! the connection lifecycle and is comparatively rare.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::channel::TransportChannel;
use crate::identity::{Destination, NodeId};

/// How a destination was resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Uplink to the central system
    Uplink,
    /// Registered direct connection to the destination
    Direct,
    /// First relay of an explicit hop path
    FirstHop(NodeId),
    /// Relay learned from a routing announcement
    Via(NodeId),
}

impl Route {
    /// Relayed frames need a routing header so the relay can forward them
    pub fn is_relayed(&self) -> bool {
        matches!(self, Route::FirstHop(_) | Route::Via(_))
    }
}

/// Outcome of a successful lookup
#[derive(Clone)]
pub struct Resolved {
    pub channel: Arc<dyn TransportChannel>,
    pub route: Route,
}

impl std::fmt::Debug for Resolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolved")
            .field("peer", self.channel.peer())
            .field("route", &self.route)
            .finish()
    }
}

/// Channels reachable from this node
#[derive(Default)]
pub struct TopologyTable {
    uplink: RwLock<Option<Arc<dyn TransportChannel>>>,
    direct: RwLock<HashMap<NodeId, Arc<dyn TransportChannel>>>,
    routes: RwLock<HashMap<NodeId, NodeId>>,
}

impl TopologyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the uplink channel to the central system
    pub fn set_uplink(&self, channel: Arc<dyn TransportChannel>) {
        info!("Uplink to {} registered", channel.peer());
        *self.uplink.write() = Some(channel);
    }

    pub fn clear_uplink(&self) -> Option<Arc<dyn TransportChannel>> {
        let previous = self.uplink.write().take();
        if let Some(ref channel) = previous {
            info!("Uplink to {} removed", channel.peer());
        }
        previous
    }

    pub fn has_uplink(&self) -> bool {
        self.uplink
            .read()
            .as_ref()
            .map(|c| c.is_open())
            .unwrap_or(false)
    }

    /// Register a direct channel, keyed by its peer
    pub fn register(&self, channel: Arc<dyn TransportChannel>) {
        let peer = channel.peer().clone();
        info!("Direct channel to {} registered", peer);
        self.direct.write().insert(peer, channel);
    }

    pub fn deregister(&self, peer: &NodeId) -> Option<Arc<dyn TransportChannel>> {
        let removed = self.direct.write().remove(peer);
        if removed.is_some() {
            info!("Direct channel to {} removed", peer);
        }
        removed
    }

    /// Learn that `target` is reachable through the relay `via`
    pub fn add_route(&self, target: impl Into<NodeId>, via: impl Into<NodeId>) {
        let (target, via) = (target.into(), via.into());
        debug!("Route {} via {}", target, via);
        self.routes.write().insert(target, via);
    }

    pub fn remove_route(&self, target: &NodeId) -> Option<NodeId> {
        self.routes.write().remove(target)
    }

    /// Peers with a registered direct channel
    pub fn peers(&self) -> Vec<NodeId> {
        self.direct.read().keys().cloned().collect()
    }

    fn open_direct(&self, node: &NodeId) -> Option<Arc<dyn TransportChannel>> {
        self.direct
            .read()
            .get(node)
            .filter(|c| c.is_open())
            .cloned()
    }

    /// Find the channel a request to `destination` should leave on
    ///
    /// Order: uplink for the central system, direct channel, first hop of an
    /// explicit path, learned relay. Closed channels never match.
    pub fn resolve(&self, destination: &Destination) -> Option<Resolved> {
        let node = destination.node();

        if node.is_csms() {
            let uplink = self.uplink.read().as_ref().filter(|c| c.is_open()).cloned();
            if let Some(channel) = uplink {
                return Some(Resolved {
                    channel,
                    route: Route::Uplink,
                });
            }
        }

        if let Some(channel) = self.open_direct(node) {
            return Some(Resolved {
                channel,
                route: Route::Direct,
            });
        }

        if let Some(hop) = destination.first_hop() {
            return self.open_direct(hop).map(|channel| Resolved {
                channel,
                route: Route::FirstHop(hop.clone()),
            });
        }

        let via = self.routes.read().get(node).cloned()?;
        self.open_direct(&via).map(|channel| Resolved {
            channel,
            route: Route::Via(via),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::Correlator;
    use crate::transport::memory::MemoryChannel;

    fn channel(peer: &str) -> Arc<MemoryChannel> {
        MemoryChannel::pair(peer, Arc::new(Correlator::new())).0
    }

    #[test]
    fn test_csms_resolves_to_uplink() {
        let table = TopologyTable::new();
        assert!(table.resolve(&Destination::csms()).is_none());

        table.set_uplink(channel("CSMS"));
        let resolved = table.resolve(&Destination::csms()).unwrap();
        assert_eq!(resolved.route, Route::Uplink);
        assert_eq!(resolved.channel.peer(), &NodeId::csms());
        assert!(table.has_uplink());
    }

    #[test]
    fn test_direct_before_hop_path() {
        let table = TopologyTable::new();
        table.register(channel("CS001"));
        table.register(channel("NN1"));

        let dest = Destination::via("CS001", vec!["NN1".into(), "CS001".into()]).unwrap();
        let resolved = table.resolve(&dest).unwrap();
        assert_eq!(resolved.route, Route::Direct);
    }

    #[test]
    fn test_hop_path_uses_first_relay() {
        let table = TopologyTable::new();
        table.register(channel("NN1"));

        let dest = Destination::via("CS042", vec!["NN1".into(), "NN7".into(), "CS042".into()]).unwrap();
        let resolved = table.resolve(&dest).unwrap();
        assert_eq!(resolved.route, Route::FirstHop("NN1".into()));
        assert!(resolved.route.is_relayed());
    }

    #[test]
    fn test_learned_route() {
        let table = TopologyTable::new();
        table.register(channel("NN2"));
        table.add_route("CS100", "NN2");

        let resolved = table.resolve(&Destination::direct("CS100")).unwrap();
        assert_eq!(resolved.route, Route::Via("NN2".into()));

        table.remove_route(&"CS100".into());
        assert!(table.resolve(&Destination::direct("CS100")).is_none());
    }

    #[test]
    fn test_unknown_destination() {
        let table = TopologyTable::new();
        table.register(channel("CS001"));
        assert!(table.resolve(&Destination::direct("CS999")).is_none());
    }

    #[test]
    fn test_closed_channels_are_skipped() {
        let table = TopologyTable::new();
        let uplink = channel("CSMS");
        table.set_uplink(uplink.clone());
        uplink.close();

        assert!(!table.has_uplink());
        assert!(table.resolve(&Destination::csms()).is_none());
    }

    #[test]
    fn test_deregister() {
        let table = TopologyTable::new();
        table.register(channel("CS001"));
        assert_eq!(table.peers(), vec![NodeId::new("CS001")]);

        assert!(table.deregister(&"CS001".into()).is_some());
        assert!(table.resolve(&Destination::direct("CS001")).is_none());
    }
}
