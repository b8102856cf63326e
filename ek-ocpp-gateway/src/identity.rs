//! Node identities and message destinations
//!
//! Every participant (charging station, networking node, CSMS) is named by a
//! [`NodeId`]. The central system is a distinguished sentinel value. A
//! [`Destination`] adds an optional hop path through relaying nodes.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reserved identifier of the central system
const CSMS_NODE_ID: &str = "CSMS";

/// Identifier of a participant in the OCPP network
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The central system sentinel
    pub fn csms() -> Self {
        Self(CSMS_NODE_ID.to_string())
    }

    pub fn is_csms(&self) -> bool {
        self.0 == CSMS_NODE_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Errors building a destination
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DestinationError {
    #[error("hop path must end at {expected}, but ends at {actual}")]
    PathMismatch { expected: NodeId, actual: NodeId },

    #[error("hop path visits {0} more than once")]
    Loop(NodeId),
}

/// Where a request is headed: the final node plus an optional hop path
///
/// An empty hop path means "direct". When present, the last hop is always
/// the final node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    node: NodeId,
    hops: Vec<NodeId>,
}

impl Destination {
    /// Address a node directly
    pub fn direct(node: impl Into<NodeId>) -> Self {
        Self {
            node: node.into(),
            hops: Vec::new(),
        }
    }

    /// Address the central system
    pub fn csms() -> Self {
        Self::direct(NodeId::csms())
    }

    /// Address a node through an explicit path of relays
    pub fn via(node: impl Into<NodeId>, hops: Vec<NodeId>) -> Result<Self, DestinationError> {
        let node = node.into();

        if let Some(last) = hops.last() {
            if *last != node {
                return Err(DestinationError::PathMismatch {
                    expected: node,
                    actual: last.clone(),
                });
            }
        }

        for (i, hop) in hops.iter().enumerate() {
            if hops[..i].contains(hop) {
                return Err(DestinationError::Loop(hop.clone()));
            }
        }

        Ok(Self { node, hops })
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn hops(&self) -> &[NodeId] {
        &self.hops
    }

    pub fn is_direct(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn is_csms(&self) -> bool {
        self.node.is_csms()
    }

    /// Next relay on the path, if any
    pub fn first_hop(&self) -> Option<&NodeId> {
        self.hops.first()
    }

    /// The same destination as seen by the next relay (first hop consumed)
    pub fn advance(&self) -> Self {
        Self {
            node: self.node.clone(),
            hops: self.hops.iter().skip(1).cloned().collect(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hops.is_empty() {
            write!(f, "{}", self.node)
        } else {
            let path: Vec<&str> = self.hops.iter().map(NodeId::as_str).collect();
            write!(f, "{} via {}", self.node, path.join(" > "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csms_sentinel() {
        assert!(NodeId::csms().is_csms());
        assert!(!NodeId::new("CS001").is_csms());
        assert!(Destination::csms().is_csms());
    }

    #[test]
    fn test_hop_path_must_end_at_destination() {
        let err = Destination::via("CS001", vec!["NN1".into(), "CS002".into()]).unwrap_err();
        assert_eq!(
            err,
            DestinationError::PathMismatch {
                expected: "CS001".into(),
                actual: "CS002".into(),
            }
        );

        let dest = Destination::via("CS001", vec!["NN1".into(), "CS001".into()]).unwrap();
        assert_eq!(dest.first_hop(), Some(&NodeId::new("NN1")));
        assert!(!dest.is_direct());
    }

    #[test]
    fn test_hop_path_rejects_loops() {
        let err = Destination::via(
            "CS001",
            vec!["NN1".into(), "NN2".into(), "NN1".into(), "CS001".into()],
        )
        .unwrap_err();
        assert_eq!(err, DestinationError::Loop("NN1".into()));
    }

    #[test]
    fn test_empty_path_is_direct() {
        let dest = Destination::via("CS001", Vec::new()).unwrap();
        assert!(dest.is_direct());
        assert_eq!(dest, Destination::direct("CS001"));
    }

    #[test]
    fn test_advance_consumes_first_hop() {
        let dest = Destination::via("CS001", vec!["NN1".into(), "NN2".into(), "CS001".into()]).unwrap();
        let next = dest.advance();
        assert_eq!(next.first_hop(), Some(&NodeId::new("NN2")));
        assert_eq!(next.to_string(), "CS001 via NN2 > CS001");
    }
}
