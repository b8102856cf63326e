//! Transport channel abstraction
//!
//! A channel is bound to exactly one reachable peer. It only knows how to
//! push a serialized frame towards that peer; correlating the frames that
//! come back is the [`Correlator`](crate::correlator::Correlator)'s job; a
//! channel's receive path hands every CALLRESULT/CALLERROR to it, and
//! reports its own closure so in-flight requests fail instead of hanging.

use async_trait::async_trait;
use thiserror::Error;

use crate::identity::NodeId;

/// Transport-level failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel to {0} is closed")]
    Closed(NodeId),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Sendable unit for one destination peer
#[async_trait]
pub trait TransportChannel: Send + Sync {
    /// The peer at the other end
    fn peer(&self) -> &NodeId;

    /// Whether the channel can still carry frames
    fn is_open(&self) -> bool;

    /// Queue a serialized frame for delivery
    async fn send_frame(&self, frame: Vec<u8>) -> Result<(), ChannelError>;
}
