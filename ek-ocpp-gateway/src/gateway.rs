//! Gateway node
//!
//! Wires one node together: topology table, correlator, signature gate,
//! operation registry (with the boot and heartbeat hooks), observers and the
//! dispatch engine, plus the lifecycle loops a running node needs.
//!
//! ## Architecture
//!
//! ```text
//!                 OCPP CSMS
//!                     ▲ WebSocket (uplink)
//!                     │
//! ┌───────────────────┴─────────────────────┐
//! │  Gateway                                │
//! │  ┌──────────┐  ┌─────────┐  ┌─────────┐ │
//! │  │Dispatcher│─►│Topology │─►│Channels │ │
//! │  │ send::<O>│  │ table   │  │ WS / mem│ │
//! │  └────┬─────┘  └─────────┘  └────┬────┘ │
//! │       │ sign/verify    responses │      │
//! │  ┌────▼─────┐  ┌──────────┐ ┌────▼────┐ │
//! │  │Signature │  │ Observers│ │Correlat.│ │
//! │  │ gate     │  │ fan-out  │ │ pending │ │
//! │  └──────────┘  └──────────┘ └─────────┘ │
//! └───────────────────┬─────────────────────┘
//!                     │ WebSocket (downstream)
//!                     ▼
//!          Charging stations / child nodes
//! ```
//!
//! ## Inbound CALLs
//!
//! 1. Carries a routing header for another node → forwarded one hop on
//! 2. Comes from a downstream peer without a header → forwarded to the CSMS
//! 3. Addressed to this node → answered with `NotImplemented`

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::channel::TransportChannel;
use crate::config::GatewayConfig;
use crate::correlator::{Correlator, ResponseFrame};
use crate::dispatch::{DispatchResult, Dispatcher, Request, Response};
use crate::events::{ErrorSink, EventHub};
use crate::identity::{Destination, NodeId};
use crate::ocpp::types::{
    BootNotificationRequest, BootNotificationResponse, BootReason, HeartbeatRequest, HeartbeatResponse,
};
use crate::ocpp::{Action, CallError, ErrorCode};
use crate::operations::{self, Operation};
use crate::registry::OperationRegistry;
use crate::runtime::{BootNotificationHook, HeartbeatHook, NodeState, RegistrationState};
use crate::signature::{SignatureError, SignatureGate, SignaturePolicy};
use crate::topology::TopologyTable;
use crate::transport::{IncomingRequest, UplinkConnector, WebSocketChannel};

const INCOMING_QUEUE: usize = 64;

/// Errors assembling a gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Signing setup failed: {0}")]
    Signing(#[from] SignatureError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One networking node
pub struct Gateway {
    config: GatewayConfig,
    dispatcher: Arc<Dispatcher>,
    state: Arc<NodeState>,
    incoming_tx: mpsc::Sender<IncomingRequest>,
}

impl Gateway {
    /// Create a gateway; inbound CALLs from every channel arrive on the returned receiver
    pub fn new(config: GatewayConfig) -> Result<(Self, mpsc::Receiver<IncomingRequest>), GatewayError> {
        GatewayBuilder::from_config(config).build()
    }

    fn assemble(
        config: GatewayConfig,
        gate: SignatureGate,
        events: EventHub,
    ) -> (Self, mpsc::Receiver<IncomingRequest>) {
        let topology = Arc::new(TopologyTable::new());
        for (target, via) in &config.relay.routes {
            topology.add_route(target.clone(), via.clone());
        }

        let state = Arc::new(NodeState::with_min_heartbeat_interval(
            config.dispatch.min_heartbeat_interval,
        ));

        let registry = Arc::new(OperationRegistry::new());
        registry.add_hook(Action::BootNotification, Arc::new(BootNotificationHook::new(state.clone())));
        registry.add_hook(Action::Heartbeat, Arc::new(HeartbeatHook::new(state.clone())));

        let dispatcher = Arc::new(Dispatcher::new(
            config.node_id.clone(),
            topology,
            Arc::new(Correlator::new()),
            gate,
            registry,
            Arc::new(events),
            config.dispatch.request_timeout,
        ));

        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE);

        (
            Self {
                config,
                dispatcher,
                state,
                incoming_tx,
            },
            incoming_rx,
        )
    }

    pub fn node_id(&self) -> &NodeId {
        self.dispatcher.node_id()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn topology(&self) -> &Arc<TopologyTable> {
        self.dispatcher.topology()
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        self.dispatcher.correlator()
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        self.dispatcher.registry()
    }

    pub fn events(&self) -> &Arc<EventHub> {
        self.dispatcher.events()
    }

    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    /// Queue that channels owned by this gateway deliver inbound CALLs to
    pub fn incoming_sender(&self) -> mpsc::Sender<IncomingRequest> {
        self.incoming_tx.clone()
    }

    /// Dispatch any operation
    pub async fn send<O: Operation>(&self, request: Request<O::Request>) -> Response<O::Response> {
        self.dispatcher.send::<O>(request).await
    }

    /// Send BootNotification
    pub async fn boot_notification(&self, reason: BootReason) -> Response<BootNotificationResponse> {
        let request = Request::to_csms(BootNotificationRequest {
            charging_station: self.config.charging_station_info(),
            reason,
        });
        self.send::<operations::BootNotification>(request).await
    }

    /// Send Heartbeat
    pub async fn heartbeat(&self) -> Response<HeartbeatResponse> {
        self.send::<operations::Heartbeat>(Request::to_csms(HeartbeatRequest {}))
            .await
    }

    /// Boot until the CSMS accepts us or the uplink goes away
    pub async fn register(&self, reason: BootReason) -> RegistrationState {
        let retry_floor = self.config.uplink.reconnect_delay;

        loop {
            let response = self.boot_notification(reason).await;
            let state = self.state.snapshot();

            let retry_in = match response.result {
                DispatchResult::Success(_) if state.is_registered() => return state.registration,
                DispatchResult::Success(_) => state.retry_interval.unwrap_or(retry_floor).max(retry_floor),
                DispatchResult::UnknownOrUnreachable(_) => {
                    warn!("No uplink, giving up on BootNotification");
                    return state.registration;
                }
                other => {
                    warn!("BootNotification failed: {:?}", other.kind());
                    retry_floor
                }
            };

            info!("Retrying BootNotification in {:?}", retry_in);
            tokio::time::sleep(retry_in).await;
        }
    }

    /// Send heartbeats at the negotiated interval while they are enabled
    pub async fn run_heartbeats(&self) {
        let mut rx = self.state.subscribe();

        loop {
            let state = rx.borrow_and_update().clone();

            if !state.heartbeats_enabled {
                if rx.changed().await.is_err() {
                    break;
                }
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(state.heartbeat_interval) => {
                    let response = self.heartbeat().await;
                    if !response.result.is_success() {
                        warn!("Heartbeat failed: {:?}", response.kind());
                    }
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    debug!("Node state changed, rescheduling heartbeat");
                }
            }
        }
    }

    /// Connector keeping the CSMS uplink registered in the topology table
    pub fn uplink_connector(&self) -> UplinkConnector {
        UplinkConnector::new(
            self.node_id().clone(),
            self.config.uplink.clone(),
            self.topology().clone(),
            self.correlator().clone(),
            self.incoming_tx.clone(),
        )
    }

    /// Accept downstream WebSocket connections and register them as direct channels
    pub async fn serve_downstream(&self, listener: TcpListener) -> Result<(), GatewayError> {
        info!("Accepting downstream connections on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            let topology = self.topology().clone();
            let correlator = self.correlator().clone();
            let incoming = self.incoming_tx.clone();

            tokio::spawn(async move {
                let channel = match WebSocketChannel::accept(stream, correlator, incoming).await {
                    Ok(channel) => channel,
                    Err(e) => {
                        warn!("Handshake with {} failed: {}", addr, e);
                        return;
                    }
                };

                let peer = channel.peer().clone();
                topology.register(channel.clone());
                channel.closed().await;
                topology.deregister(&peer);
            });
        }
    }

    /// Answer one inbound CALL
    pub async fn handle_incoming(&self, request: IncomingRequest) {
        let IncomingRequest { peer, call, responder } = request;
        info!("OCPP request from {}: {} ({})", peer, call.action, call.message_id);

        let destination = match call.routing.as_ref().map(|r| r.destination()) {
            Some(Ok(destination)) if destination.node() != self.node_id() => Some(destination),
            Some(Ok(_)) => None,
            Some(Err(e)) => {
                let error = CallError::new(call.message_id.clone(), ErrorCode::FormatViolation, e.to_string());
                if let Err(e) = responder.respond(ResponseFrame::Error(error)).await {
                    warn!("Failed to answer {}: {}", peer, e);
                }
                return;
            }
            None if !peer.is_csms() => Some(Destination::csms()),
            None => None,
        };

        let frame = match destination {
            Some(destination) => self.dispatcher.forward(call, destination).await,
            None => ResponseFrame::Error(CallError::new(
                call.message_id.clone(),
                ErrorCode::NotImplemented,
                format!("{} is not handled by networking node {}", call.action, self.node_id()),
            )),
        };

        if let Err(e) = responder.respond(frame).await {
            error!("Failed to answer {}: {}", peer, e);
        }
    }
}

/// Builder for [`Gateway`]
pub struct GatewayBuilder {
    config: GatewayConfig,
    policy: Option<Arc<dyn SignaturePolicy>>,
    error_sink: Option<Arc<dyn ErrorSink>>,
}

impl GatewayBuilder {
    /// Create a new gateway builder
    pub fn new() -> Self {
        Self::from_config(GatewayConfig::default())
    }

    pub fn from_config(config: GatewayConfig) -> Self {
        Self {
            config,
            policy: None,
            error_sink: None,
        }
    }

    /// Set node ID
    pub fn node_id(mut self, id: impl Into<NodeId>) -> Self {
        self.config.node_id = id.into();
        self
    }

    /// Set CSMS URL
    pub fn csms_url(mut self, url: impl Into<String>) -> Self {
        self.config.uplink.csms_url = url.into();
        self
    }

    /// Set vendor info
    pub fn vendor(mut self, vendor: impl Into<String>, model: impl Into<String>) -> Self {
        self.config.uplink.vendor = vendor.into();
        self.config.uplink.model = model.into();
        self
    }

    /// Set default request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.dispatch.request_timeout = timeout;
        self
    }

    /// Use this policy instead of the one described by the signing config
    pub fn signature_policy(mut self, policy: Arc<dyn SignaturePolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Route observer failures to `sink`
    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// Build the gateway
    pub fn build(self) -> Result<(Gateway, mpsc::Receiver<IncomingRequest>), GatewayError> {
        let policy = match self.policy {
            Some(policy) => policy,
            None => self.config.signature_policy()?,
        };
        let gate = if self.config.dispatch.strict_verification {
            SignatureGate::strict(policy)
        } else {
            SignatureGate::permissive(policy)
        };

        let mut events = EventHub::new(self.config.node_id.to_string());
        if let Some(sink) = self.error_sink {
            events = events.with_error_sink(sink);
        }

        Ok(Gateway::assemble(self.config, gate, events))
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}
