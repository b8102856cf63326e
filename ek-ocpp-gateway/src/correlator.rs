//! Request/response correlation
//!
//! Every outbound CALL is registered as a pending request under its
//! correlation id *before* the frame leaves, so even an immediate response
//! finds its slot. A pending request ends in exactly one of:
//!
//! ```text
//! Created ──► Fulfilled   (matching CALLRESULT / CALLERROR delivered)
//!         ├─► TimedOut    (deadline elapsed)
//!         ├─► Failed      (channel closed or send failed)
//!         └─► Cancelled   (explicit cancel, treated as a timeout upstream)
//! ```
//!
//! Whoever removes the entry from the pending map owns the resolution;
//! every later attempt finds nothing and is discarded.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::channel::{ChannelError, TransportChannel};
use crate::identity::NodeId;
use crate::ocpp::{Action, CallError, CallResult, CorrelationId};

/// A response frame routed back to its request
#[derive(Debug, Clone)]
pub enum ResponseFrame {
    Result(CallResult),
    Error(CallError),
}

impl ResponseFrame {
    pub fn message_id(&self) -> &CorrelationId {
        match self {
            ResponseFrame::Result(r) => &r.message_id,
            ResponseFrame::Error(e) => &e.message_id,
        }
    }

    /// The same answer under another message id
    pub fn with_message_id(self, id: CorrelationId) -> Self {
        match self {
            ResponseFrame::Result(r) => ResponseFrame::Result(CallResult { message_id: id, ..r }),
            ResponseFrame::Error(e) => ResponseFrame::Error(CallError { message_id: id, ..e }),
        }
    }
}

/// Why a dispatch produced no response frame
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchFailure {
    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled")]
    Cancelled,

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Correlation id {0} is already outstanding")]
    DuplicateId(CorrelationId),
}

type Resolution = Result<ResponseFrame, DispatchFailure>;

/// Request awaiting its response
struct PendingRequest {
    peer: NodeId,
    action: Action,
    requested_at: DateTime<Utc>,
    slot: oneshot::Sender<Resolution>,
}

/// Unregisters a request whose dispatch was dropped before resolving
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<CorrelationId, PendingRequest>>,
    id: &'a CorrelationId,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.pending.lock().remove(self.id).is_some() {
            debug!("Dispatch of {} abandoned, request unregistered", self.id);
        }
    }
}

/// Node-wide table of in-flight requests
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<CorrelationId, PendingRequest>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests currently awaiting a response
    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, id: &CorrelationId) -> bool {
        self.pending.lock().contains_key(id)
    }

    /// Send a frame through `channel` and wait for the response carrying `id`
    ///
    /// Dropping the returned future before it completes unregisters `id`.
    pub async fn dispatch(
        &self,
        channel: &dyn TransportChannel,
        id: CorrelationId,
        action: Action,
        frame: Vec<u8>,
        timeout: Duration,
    ) -> Result<ResponseFrame, DispatchFailure> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.register(id.clone(), channel.peer().clone(), action)?;
        let mut guard = PendingGuard {
            pending: &self.pending,
            id: &id,
            armed: true,
        };

        let resolution = async {
            if let Err(e) = channel.send_frame(frame).await {
                warn!("{} {} not sent to {}: {}", action, id, channel.peer(), e);
                self.pending.lock().remove(&id);
                return Err(DispatchFailure::from(e));
            }

            debug!("{} {} sent to {}, awaiting response", action, id, channel.peer());

            match tokio::time::timeout_at(deadline, &mut slot).await {
                Ok(Ok(resolution)) => resolution,
                Ok(Err(_)) => Err(ChannelError::Closed(channel.peer().clone()).into()),
                Err(_) => {
                    let expired = self.pending.lock().remove(&id).is_some();
                    if expired {
                        warn!("{} {} timed out after {:?}", action, id, timeout);
                        Err(DispatchFailure::Timeout(timeout))
                    } else {
                        // A resolver removed the entry first; its value is already in the slot
                        (&mut slot)
                            .await
                            .unwrap_or_else(|_| Err(ChannelError::Closed(channel.peer().clone()).into()))
                    }
                }
            }
        }
        .await;

        guard.armed = false;
        resolution
    }

    fn register(
        &self,
        id: CorrelationId,
        peer: NodeId,
        action: Action,
    ) -> Result<oneshot::Receiver<Resolution>, DispatchFailure> {
        let mut pending = self.pending.lock();
        if pending.contains_key(&id) {
            return Err(DispatchFailure::DuplicateId(id));
        }

        let (slot, rx) = oneshot::channel();
        pending.insert(
            id,
            PendingRequest {
                peer,
                action,
                requested_at: Utc::now(),
                slot,
            },
        );
        Ok(rx)
    }

    /// Deliver a response frame that arrived from `from`
    ///
    /// Returns false when no request is waiting for it (late, duplicate or
    /// unknown) or when the request went to a different peer; such frames
    /// are dropped.
    pub fn resolve(&self, from: &NodeId, frame: ResponseFrame) -> bool {
        let id = frame.message_id().clone();
        let entry = {
            let mut pending = self.pending.lock();
            match pending.get(&id).map(|request| request.peer.clone()) {
                Some(peer) if peer != *from => {
                    warn!("Ignoring response {} from {}, the request went to {}", id, from, peer);
                    return false;
                }
                Some(_) => pending.remove(&id),
                None => None,
            }
        };

        match entry {
            Some(request) => {
                let elapsed = Utc::now().signed_duration_since(request.requested_at);
                debug!(
                    "{} {} answered by {} after {}ms",
                    request.action,
                    id,
                    request.peer,
                    elapsed.num_milliseconds()
                );
                let _ = request.slot.send(Ok(frame));
                true
            }
            None => {
                debug!("Discarding unmatched response {}", id);
                false
            }
        }
    }

    /// Resolve a request as cancelled; behaves like an immediate timeout
    pub fn cancel(&self, id: &CorrelationId) -> bool {
        match self.pending.lock().remove(id) {
            Some(request) => {
                let _ = request.slot.send(Err(DispatchFailure::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Fail every request in flight towards `peer`, e.g. when its channel closes
    pub fn fail_peer(&self, peer: &NodeId) -> usize {
        let failed: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            let ids: Vec<CorrelationId> = pending
                .iter()
                .filter(|(_, request)| request.peer == *peer)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        if !failed.is_empty() {
            warn!("Failing {} in-flight request(s) to {}", failed.len(), peer);
        }

        let count = failed.len();
        for request in failed {
            let _ = request
                .slot
                .send(Err(ChannelError::Closed(peer.clone()).into()));
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::{ErrorCode, OcppMessage};
    use crate::transport::memory::MemoryChannel;
    use std::sync::Arc;

    fn heartbeat_frame(id: &CorrelationId) -> Vec<u8> {
        let mut call = crate::ocpp::Call::new(Action::Heartbeat, serde_json::json!({})).unwrap();
        call.message_id = id.clone();
        call.to_bytes().unwrap()
    }

    #[tokio::test]
    async fn test_response_resolves_dispatch() {
        let correlator = Arc::new(Correlator::new());
        let (channel, mut peer) = MemoryChannel::pair("CSMS", correlator.clone());
        let id = CorrelationId::generate();

        let responder = tokio::spawn(async move {
            let call = peer.next_call().await.unwrap();
            peer.reply(&call.message_id, serde_json::json!({"currentTime": "2026-01-01T00:00:00Z"}))
        });

        let frame = correlator
            .dispatch(channel.as_ref(), id.clone(), Action::Heartbeat, heartbeat_frame(&id), Duration::from_secs(1))
            .await
            .unwrap();

        assert!(responder.await.unwrap());
        assert_eq!(frame.message_id(), &id);
        assert_eq!(correlator.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_call_error_is_a_response() {
        let correlator = Arc::new(Correlator::new());
        let (channel, mut peer) = MemoryChannel::pair("CSMS", correlator.clone());
        let id = CorrelationId::generate();

        tokio::spawn(async move {
            let call = peer.next_call().await.unwrap();
            peer.reply_error(&call.message_id, ErrorCode::NotSupported, "no")
        });

        let frame = correlator
            .dispatch(channel.as_ref(), id.clone(), Action::Heartbeat, heartbeat_frame(&id), Duration::from_secs(1))
            .await
            .unwrap();

        match frame {
            ResponseFrame::Error(e) => assert_eq!(e.error_code, ErrorCode::NotSupported),
            other => panic!("Expected CallError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_is_discarded() {
        let correlator = Arc::new(Correlator::new());
        let (channel, mut peer) = MemoryChannel::pair("CSMS", correlator.clone());
        let id = CorrelationId::generate();

        let result = correlator
            .dispatch(channel.as_ref(), id.clone(), Action::Heartbeat, heartbeat_frame(&id), Duration::from_millis(20))
            .await;
        assert_eq!(result.unwrap_err(), DispatchFailure::Timeout(Duration::from_millis(20)));
        assert!(!correlator.is_pending(&id));

        let call = peer.next_call().await.unwrap();
        assert!(!peer.reply(&call.message_id, serde_json::json!({})));
    }

    #[tokio::test]
    async fn test_duplicate_resolution_is_ignored() {
        let correlator = Arc::new(Correlator::new());
        let (channel, mut peer) = MemoryChannel::pair("CSMS", correlator.clone());
        let id = CorrelationId::generate();

        let replies = tokio::spawn(async move {
            let call = peer.next_call().await.unwrap();
            let first = peer.reply(&call.message_id, serde_json::json!({"n": 1}));
            let second = peer.reply(&call.message_id, serde_json::json!({"n": 2}));
            (first, second)
        });

        let frame = correlator
            .dispatch(channel.as_ref(), id.clone(), Action::DataTransfer, heartbeat_frame(&id), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(replies.await.unwrap(), (true, false));
        match frame {
            ResponseFrame::Result(r) => assert_eq!(r.payload["n"], 1),
            other => panic!("Expected CallResult, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_channel_close_fails_in_flight_requests() {
        let correlator = Arc::new(Correlator::new());
        let (channel, mut peer) = MemoryChannel::pair("NN1", correlator.clone());
        let id = CorrelationId::generate();

        let closer = channel.clone();
        tokio::spawn(async move {
            peer.next_call().await.unwrap();
            closer.close();
        });

        let result = correlator
            .dispatch(channel.as_ref(), id.clone(), Action::Heartbeat, heartbeat_frame(&id), Duration::from_secs(5))
            .await;

        assert_eq!(
            result.unwrap_err(),
            DispatchFailure::Channel(ChannelError::Closed("NN1".into()))
        );
        assert_eq!(correlator.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_send_on_closed_channel_unregisters() {
        let correlator = Arc::new(Correlator::new());
        let (channel, _peer) = MemoryChannel::pair("NN1", correlator.clone());
        channel.close();

        let id = CorrelationId::generate();
        let result = correlator
            .dispatch(channel.as_ref(), id.clone(), Action::Heartbeat, heartbeat_frame(&id), Duration::from_secs(1))
            .await;

        assert!(matches!(result, Err(DispatchFailure::Channel(ChannelError::Closed(_)))));
        assert!(!correlator.is_pending(&id));
    }

    #[tokio::test]
    async fn test_cancel_resolves_immediately() {
        let correlator = Arc::new(Correlator::new());
        let (channel, mut peer) = MemoryChannel::pair("CSMS", correlator.clone());
        let id = CorrelationId::generate();

        let canceller = correlator.clone();
        tokio::spawn(async move {
            let call = peer.next_call().await.unwrap();
            assert!(canceller.cancel(&call.message_id));
        });

        let result = correlator
            .dispatch(channel.as_ref(), id.clone(), Action::Heartbeat, heartbeat_frame(&id), Duration::from_secs(5))
            .await;
        assert_eq!(result.unwrap_err(), DispatchFailure::Cancelled);
    }

    #[test]
    fn test_unmatched_response_is_dropped() {
        let correlator = Correlator::new();
        let frame = match OcppMessage::parse(br#"[3, "nobody", {}]"#).unwrap() {
            OcppMessage::CallResult(r) => ResponseFrame::Result(r),
            _ => unreachable!(),
        };
        assert!(!correlator.resolve(&NodeId::csms(), frame));
    }

    #[tokio::test]
    async fn test_response_from_other_peer_is_ignored() {
        let correlator = Arc::new(Correlator::new());
        let (channel, mut csms) = MemoryChannel::pair(NodeId::csms(), correlator.clone());
        let (_other, cs002) = MemoryChannel::pair("CS002", correlator.clone());
        let id = CorrelationId::new("7");

        let replies = tokio::spawn(async move {
            let call = csms.next_call().await.unwrap();
            let spoofed = cs002.reply(&call.message_id, serde_json::json!({"from": "CS002"}));
            let genuine = csms.reply(&call.message_id, serde_json::json!({"from": "CSMS"}));
            (spoofed, genuine)
        });

        let frame = correlator
            .dispatch(channel.as_ref(), id.clone(), Action::DataTransfer, heartbeat_frame(&id), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(replies.await.unwrap(), (false, true));
        match frame {
            ResponseFrame::Result(r) => assert_eq!(r.payload["from"], "CSMS"),
            other => panic!("Expected CallResult, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropped_dispatch_unregisters() {
        let correlator = Arc::new(Correlator::new());
        let (channel, mut peer) = MemoryChannel::pair("CSMS", correlator.clone());

        for _ in 0..5 {
            let id = CorrelationId::generate();
            let abandoned = tokio::time::timeout(
                Duration::from_millis(10),
                correlator.dispatch(channel.as_ref(), id.clone(), Action::Heartbeat, heartbeat_frame(&id), Duration::from_secs(30)),
            )
            .await;
            assert!(abandoned.is_err());
            assert!(!correlator.is_pending(&id));
        }
        assert_eq!(correlator.outstanding(), 0);

        // The frames did go out; answers to them are now unmatched
        let call = peer.next_call().await.unwrap();
        assert!(!peer.reply(&call.message_id, serde_json::json!({})));
    }
}
