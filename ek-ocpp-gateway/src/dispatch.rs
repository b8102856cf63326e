//! Generic dispatch engine
//!
//! One `send::<O>()` serves every operation in the table. A dispatch runs
//! these steps strictly in order, and every step that can fail maps to a
//! single [`DispatchResult`] variant:
//!
//! ```text
//! notify RequestSending observers
//! serialize + overrides  ──► FormatError
//! sign                   ──► SignatureError        (nothing sent)
//! resolve destination    ──► UnknownOrUnreachable  (nothing sent)
//! send and await         ──► Timeout | TransportError
//! CALLERROR              ──► FormatError | TransportError
//! parse response         ──► FormatError
//! verify signatures      ──► warning, or SignatureError when strict
//! response hooks
//! notify ResponseReceived observers
//! ```
//!
//! A panic anywhere in between is caught at the `send` boundary and reported
//! as `TransportError`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::correlator::{Correlator, DispatchFailure, ResponseFrame};
use crate::events::{panic_message, DispatchEvent, EventHub, Phase};
use crate::identity::{Destination, NodeId};
use crate::ocpp::{Action, Call, CallError, CorrelationId, ErrorCode, RoutingHeader};
use crate::operations::Operation;
use crate::registry::OperationRegistry;
use crate::signature::{take_signatures, MessageSignature, Signable, SignatureError, SignatureGate, SIGNATURES_FIELD};
use crate::topology::{Route, TopologyTable};

/// Outbound request for one operation
#[derive(Debug, Clone)]
pub struct Request<T> {
    pub destination: Destination,
    /// Assigned once at creation and never reused
    pub correlation_id: CorrelationId,
    pub payload: T,
    pub signatures: Vec<MessageSignature>,
    pub created_at: DateTime<Utc>,
}

impl<T> Request<T> {
    pub fn new(destination: Destination, payload: T) -> Self {
        Self {
            destination,
            correlation_id: CorrelationId::generate(),
            payload,
            signatures: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Request addressed to the central system
    pub fn to_csms(payload: T) -> Self {
        Self::new(Destination::csms(), payload)
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}

impl<T> Signable for Request<T> {
    fn attach_signature(&mut self, signature: MessageSignature) {
        self.signatures.push(signature);
    }
}

/// Outcome of a dispatch; exactly one per request
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchResult<T> {
    Success(T),
    SignatureError(String),
    UnknownOrUnreachable(Destination),
    Timeout,
    TransportError(String),
    FormatError(String),
}

/// Payload-free tag of a [`DispatchResult`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultKind {
    Success,
    SignatureError,
    UnknownOrUnreachable,
    Timeout,
    TransportError,
    FormatError,
}

impl<T> DispatchResult<T> {
    pub fn kind(&self) -> ResultKind {
        match self {
            DispatchResult::Success(_) => ResultKind::Success,
            DispatchResult::SignatureError(_) => ResultKind::SignatureError,
            DispatchResult::UnknownOrUnreachable(_) => ResultKind::UnknownOrUnreachable,
            DispatchResult::Timeout => ResultKind::Timeout,
            DispatchResult::TransportError(_) => ResultKind::TransportError,
            DispatchResult::FormatError(_) => ResultKind::FormatError,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DispatchResult::Success(_))
    }

    pub fn success(self) -> Option<T> {
        match self {
            DispatchResult::Success(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn as_success(&self) -> Option<&T> {
        match self {
            DispatchResult::Success(payload) => Some(payload),
            _ => None,
        }
    }
}

/// Answer to a [`Request`], whatever the outcome
#[derive(Debug, Clone)]
pub struct Response<T> {
    pub correlation_id: CorrelationId,
    pub destination: Destination,
    pub result: DispatchResult<T>,
    /// Verification failure tolerated under permissive verification
    pub verification_warning: Option<SignatureError>,
    pub runtime: Duration,
    /// Signatures the responder attached
    pub signatures: Vec<MessageSignature>,
}

impl<T> Response<T> {
    pub fn kind(&self) -> ResultKind {
        self.result.kind()
    }
}

struct Outcome<T> {
    result: DispatchResult<T>,
    payload: Value,
    signatures: Vec<MessageSignature>,
    verification_warning: Option<SignatureError>,
}

impl<T> Outcome<T> {
    fn failed(result: DispatchResult<T>) -> Self {
        Self {
            result,
            payload: Value::Null,
            signatures: Vec::new(),
            verification_warning: None,
        }
    }
}

/// Routing header for a frame leaving on `route`
fn routing_for(route: &Route, destination: &Destination) -> Option<RoutingHeader> {
    if !route.is_relayed() {
        return None;
    }
    let remaining = match route {
        // The relay receiving the frame is the first hop; it sees the rest of the path
        Route::FirstHop(_) => destination.advance(),
        _ => Destination::direct(destination.node().clone()),
    };
    Some(RoutingHeader::for_destination(&remaining))
}

fn with_signatures(mut body: Value, signatures: &[MessageSignature]) -> Result<Value, serde_json::Error> {
    if signatures.is_empty() {
        return Ok(body);
    }
    if let Value::Object(map) = &mut body {
        map.insert(SIGNATURES_FIELD.to_string(), serde_json::to_value(signatures)?);
    }
    Ok(body)
}

fn classify_call_error<T>(error: &CallError) -> DispatchResult<T> {
    let detail = format!("{}: {}", error.error_code, error.error_description);
    if error.error_code.is_format_violation() {
        DispatchResult::FormatError(detail)
    } else {
        DispatchResult::TransportError(detail)
    }
}

/// Signs, routes, correlates and verifies requests for one node
pub struct Dispatcher {
    node_id: NodeId,
    topology: Arc<TopologyTable>,
    correlator: Arc<Correlator>,
    gate: SignatureGate,
    registry: Arc<OperationRegistry>,
    events: Arc<EventHub>,
    request_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        node_id: NodeId,
        topology: Arc<TopologyTable>,
        correlator: Arc<Correlator>,
        gate: SignatureGate,
        registry: Arc<OperationRegistry>,
        events: Arc<EventHub>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            topology,
            correlator,
            gate,
            registry,
            events,
            request_timeout,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn topology(&self) -> &Arc<TopologyTable> {
        &self.topology
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    /// Abandon an in-flight request; its dispatch ends as a timeout
    pub fn cancel(&self, correlation_id: &CorrelationId) -> bool {
        self.correlator.cancel(correlation_id)
    }

    fn event<P: Serialize>(
        &self,
        phase: Phase,
        action: Action,
        correlation_id: &CorrelationId,
        destination: &Destination,
        payload: &P,
    ) -> DispatchEvent {
        DispatchEvent {
            phase,
            timestamp: Utc::now(),
            sender: self.node_id.clone(),
            action,
            correlation_id: correlation_id.clone(),
            destination: destination.clone(),
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
            result: None,
            runtime: None,
        }
    }

    /// Dispatch one request and wait for its outcome
    pub async fn send<O: Operation>(&self, request: Request<O::Request>) -> Response<O::Response> {
        let started = Instant::now();
        let correlation_id = request.correlation_id.clone();
        let destination = request.destination.clone();

        self.events
            .notify(self.event(
                Phase::RequestSending,
                O::ACTION,
                &correlation_id,
                &destination,
                &request.payload,
            ))
            .await;

        let outcome = match AssertUnwindSafe(self.execute::<O>(request)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("{} {} panicked during dispatch: {}", O::ACTION, correlation_id, message);
                Outcome::failed(DispatchResult::TransportError(format!("dispatch panicked: {}", message)))
            }
        };

        let runtime = started.elapsed();
        let kind = outcome.result.kind();
        match kind {
            ResultKind::Success => info!("{} to {} completed in {:?}", O::ACTION, destination, runtime),
            _ => warn!("{} to {} ended as {:?} after {:?}", O::ACTION, destination, kind, runtime),
        }

        let mut event = self.event(
            Phase::ResponseReceived,
            O::ACTION,
            &correlation_id,
            &destination,
            &outcome.payload,
        );
        event.result = Some(kind);
        event.runtime = Some(runtime);
        self.events.notify(event).await;

        Response {
            correlation_id,
            destination,
            result: outcome.result,
            verification_warning: outcome.verification_warning,
            runtime,
            signatures: outcome.signatures,
        }
    }

    async fn execute<O: Operation>(&self, mut request: Request<O::Request>) -> Outcome<O::Response> {
        let descriptor = self.registry.descriptor(O::ACTION);

        let body = match serde_json::to_value(&request.payload) {
            Ok(value) => descriptor.serializers.apply(value),
            Err(e) => return Outcome::failed(DispatchResult::FormatError(e.to_string())),
        };

        if let Err(e) = self.gate.sign(&mut request, &body) {
            warn!("{} {} not signed: {}", O::ACTION, request.correlation_id, e);
            return Outcome::failed(DispatchResult::SignatureError(e.to_string()));
        }

        let destination = self.local_view(&request.destination);
        let resolved = match self.topology.resolve(&destination) {
            Some(resolved) => resolved,
            None => {
                warn!("No channel reaches {}", request.destination);
                return Outcome::failed(DispatchResult::UnknownOrUnreachable(request.destination));
            }
        };

        let payload = match with_signatures(body, &request.signatures) {
            Ok(payload) => payload,
            Err(e) => return Outcome::failed(DispatchResult::FormatError(e.to_string())),
        };
        let call = Call {
            message_id: request.correlation_id.clone(),
            action: O::ACTION,
            payload,
            routing: routing_for(&resolved.route, &destination),
        };
        let frame = match call.to_bytes() {
            Ok(frame) => frame,
            Err(e) => return Outcome::failed(DispatchResult::FormatError(e.to_string())),
        };

        debug!("{} {} leaves via {} ({:?})", O::ACTION, call.message_id, resolved.channel.peer(), resolved.route);

        let timeout = descriptor.timeout.unwrap_or(self.request_timeout);
        let answer = self
            .correlator
            .dispatch(resolved.channel.as_ref(), call.message_id, O::ACTION, frame, timeout)
            .await;

        let mut payload = match answer {
            Ok(ResponseFrame::Result(result)) => result.payload,
            Ok(ResponseFrame::Error(error)) => {
                warn!("{} rejected by {}: {} {}", O::ACTION, resolved.channel.peer(), error.error_code, error.error_description);
                return Outcome::failed(classify_call_error(&error));
            }
            Err(DispatchFailure::Timeout(_)) | Err(DispatchFailure::Cancelled) => {
                return Outcome::failed(DispatchResult::Timeout)
            }
            Err(e) => return Outcome::failed(DispatchResult::TransportError(e.to_string())),
        };

        let (signatures, mut verification) = match take_signatures(&mut payload) {
            Ok(signatures) => (signatures, Ok(())),
            Err(e) => (Vec::new(), Err(e)),
        };

        let typed: O::Response = match serde_json::from_value(payload.clone()) {
            Ok(typed) => typed,
            Err(e) => {
                return Outcome {
                    result: DispatchResult::FormatError(e.to_string()),
                    payload,
                    signatures,
                    verification_warning: None,
                }
            }
        };

        if verification.is_ok() {
            verification = self.gate.verify(&payload, &signatures);
        }
        let verification_warning = match verification {
            Ok(()) => None,
            Err(e) if self.gate.is_strict() => {
                warn!("{} response failed verification: {}", O::ACTION, e);
                return Outcome {
                    result: DispatchResult::SignatureError(e.to_string()),
                    payload,
                    signatures,
                    verification_warning: None,
                };
            }
            Err(e) => {
                warn!("{} response failed verification, accepting anyway: {}", O::ACTION, e);
                Some(e)
            }
        };

        for hook in &descriptor.hooks {
            hook.on_success(O::ACTION, &payload);
        }

        Outcome {
            result: DispatchResult::Success(typed),
            payload,
            signatures,
            verification_warning,
        }
    }

    /// `destination` with this node dropped from the front of its hop path
    fn local_view(&self, destination: &Destination) -> Destination {
        if destination.first_hop() == Some(&self.node_id) {
            destination.advance()
        } else {
            destination.clone()
        }
    }

    /// Relay an inbound CALL one step closer to `destination`
    ///
    /// The returned frame answers the original CALL: the downstream response,
    /// or a CALLERROR when the destination cannot be reached.
    pub async fn forward(&self, call: Call, destination: Destination) -> ResponseFrame {
        let message_id = call.message_id.clone();
        let reject = |code: ErrorCode, description: String| {
            ResponseFrame::Error(CallError::new(message_id.clone(), code, description))
        };

        let destination = self.local_view(&destination);

        let resolved = match self.topology.resolve(&destination) {
            Some(resolved) => resolved,
            None => {
                warn!("Cannot forward {} {}: no channel reaches {}", call.action, message_id, destination);
                return reject(ErrorCode::GenericError, format!("{} is unknown or unreachable", destination));
            }
        };

        // Downstream ids are only unique per link; the next leg gets one of ours
        let action = call.action;
        let outbound = Call {
            message_id: CorrelationId::generate(),
            routing: routing_for(&resolved.route, &destination),
            ..call
        };
        let frame = match outbound.to_bytes() {
            Ok(frame) => frame,
            Err(e) => return reject(ErrorCode::InternalError, e.to_string()),
        };

        info!(
            "Forwarding {} {} to {} via {} as {}",
            action,
            message_id,
            destination,
            resolved.channel.peer(),
            outbound.message_id
        );

        let timeout = self.registry.descriptor(action).timeout.unwrap_or(self.request_timeout);
        match self
            .correlator
            .dispatch(resolved.channel.as_ref(), outbound.message_id, action, frame, timeout)
            .await
        {
            Ok(response) => response.with_message_id(message_id.clone()),
            Err(DispatchFailure::Timeout(_)) | Err(DispatchFailure::Cancelled) => {
                reject(ErrorCode::GenericError, format!("{} did not answer in time", destination))
            }
            Err(e) => reject(ErrorCode::GenericError, e.to_string()),
        }
    }
}
