//! In-process channel
//!
//! Connects a node to a peer living in the same process: frames go into an
//! unbounded queue read by a [`MemoryPeer`], which answers by resolving the
//! node's correlator directly. Used to wire co-located nodes together and to
//! drive the engine in tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::channel::{ChannelError, TransportChannel};
use crate::correlator::{Correlator, ResponseFrame};
use crate::identity::NodeId;
use crate::ocpp::{Call, CallError, CallResult, CorrelationId, ErrorCode, OcppMessage};

/// Node-side half of an in-process link
pub struct MemoryChannel {
    peer: NodeId,
    open: AtomicBool,
    sent: AtomicUsize,
    frames: mpsc::UnboundedSender<Vec<u8>>,
    correlator: Arc<Correlator>,
}

/// Peer-side half: receives CALLs and answers them
pub struct MemoryPeer {
    id: NodeId,
    frames: mpsc::UnboundedReceiver<Vec<u8>>,
    correlator: Arc<Correlator>,
}

impl MemoryChannel {
    /// Create a linked channel/peer pair delivering responses to `correlator`
    pub fn pair(peer: impl Into<NodeId>, correlator: Arc<Correlator>) -> (Arc<Self>, MemoryPeer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = peer.into();
        let channel = Arc::new(Self {
            peer: peer.clone(),
            open: AtomicBool::new(true),
            sent: AtomicUsize::new(0),
            frames: tx,
            correlator: correlator.clone(),
        });
        (
            channel,
            MemoryPeer {
                id: peer,
                frames: rx,
                correlator,
            },
        )
    }

    /// Number of frames accepted for delivery
    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    /// Close the link, failing whatever is still in flight on it
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            debug!("Memory channel to {} closed", self.peer);
            self.correlator.fail_peer(&self.peer);
        }
    }
}

#[async_trait]
impl TransportChannel for MemoryChannel {
    fn peer(&self) -> &NodeId {
        &self.peer
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_frame(&self, frame: Vec<u8>) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed(self.peer.clone()));
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.frames
            .send(frame)
            .map_err(|_| ChannelError::Closed(self.peer.clone()))
    }
}

impl MemoryPeer {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Next CALL sent over the link; `None` once the channel is dropped
    pub async fn next_call(&mut self) -> Option<Call> {
        while let Some(bytes) = self.frames.recv().await {
            match OcppMessage::parse(&bytes) {
                Ok(OcppMessage::Call(call)) => return Some(call),
                Ok(other) => debug!("Memory peer ignoring {:?}", other.message_id()),
                Err(e) => debug!("Memory peer got unparseable frame: {}", e),
            }
        }
        None
    }

    /// Answer with a CALLRESULT; false if nobody is waiting for it
    pub fn reply(&self, id: &CorrelationId, payload: impl Serialize) -> bool {
        match CallResult::new(id.clone(), payload) {
            Ok(result) => self.deliver(ResponseFrame::Result(result)),
            Err(e) => {
                debug!("Memory peer cannot serialize reply: {}", e);
                false
            }
        }
    }

    /// Answer with a CALLERROR; false if nobody is waiting for it
    pub fn reply_error(&self, id: &CorrelationId, code: ErrorCode, description: &str) -> bool {
        self.deliver(ResponseFrame::Error(CallError::new(id.clone(), code, description)))
    }

    /// Hand back an arbitrary pre-built response frame
    pub fn deliver(&self, frame: ResponseFrame) -> bool {
        self.correlator.resolve(&self.id, frame)
    }
}
