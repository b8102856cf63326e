//! # EK OCPP Gateway
//!
//! OCPP 2.0.1 networking-node engine.
//!
//! A networking node sits between charging stations and a Central System
//! Management System (CSMS). This crate gives every operation one generic
//! dispatch path: sign the request, resolve which channel reaches the
//! destination, send it and wait for the correlated response, verify the
//! response, and tell interested observers before and after.
//!
//! ## Architecture
//!
//! ```text
//!   caller: gateway.send::<Heartbeat>(request)
//!       │
//!       ▼
//! ┌─────────────────────────────────────────────┐
//! │ Dispatcher                                  │
//! │  observers ─► sign ─► resolve ─► correlate  │
//! │  observers ◄─ hooks ◄─ verify ◄─ parse      │
//! └───────┬──────────────┬──────────────┬───────┘
//!         │              │              │
//!   SignatureGate   TopologyTable   Correlator
//!   (Ed25519 /      (uplink, direct,  (pending map,
//!    no-op)          hops, routes)     timeouts)
//!                        │
//!                        ▼
//!            TransportChannel: WebSocket / memory
//! ```
//!
//! ## Dispatch outcomes
//!
//! | Failure point | Result | Frame sent? |
//! |---------------|--------|-------------|
//! | Signing | `SignatureError` | No |
//! | No channel for destination | `UnknownOrUnreachable` | No |
//! | Deadline elapsed / cancelled | `Timeout` | Yes |
//! | Channel closed, remote error | `TransportError` | Yes |
//! | Bad response payload, remote format error | `FormatError` | Yes |
//!
//! ## Usage
//!
//! ```no_run
//! use ek_ocpp_gateway::{BootReason, Gateway, GatewayConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::new(
//!         "EK-NN-001",
//!         "ws://localhost:8180/steve/websocket/CentralSystemService",
//!     );
//!
//!     let (gateway, _incoming) = Gateway::new(config)?;
//!     let (events_tx, mut events) = tokio::sync::mpsc::channel(8);
//!     tokio::spawn(gateway.uplink_connector().run(events_tx));
//!
//!     events.recv().await;
//!     gateway.register(BootReason::PowerUp).await;
//!     gateway.run_heartbeats().await;
//!
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod correlator;
pub mod dispatch;
pub mod events;
pub mod gateway;
pub mod identity;
pub mod ocpp;
pub mod operations;
pub mod registry;
pub mod runtime;
pub mod signature;
pub mod topology;
pub mod transport;

pub use config::GatewayConfig;
pub use gateway::{Gateway, GatewayBuilder, GatewayError};

// Re-export key types
pub use channel::{ChannelError, TransportChannel};
pub use correlator::{Correlator, DispatchFailure, ResponseFrame};
pub use dispatch::{DispatchResult, Dispatcher, Request, Response, ResultKind};
pub use events::{DispatchEvent, ErrorSink, EventHub, FnObserver, Observer, ObserverError, Phase};
pub use identity::{Destination, NodeId};
pub use ocpp::{Action, BootReason, Call, CallResult, CorrelationId, RegistrationStatus};
pub use operations::Operation;
pub use registry::{OperationRegistry, ResponseHook, SerializerOverrides};
pub use runtime::{NodeState, OperationalState, RegistrationState};
pub use signature::{Ed25519Policy, NoSignaturePolicy, SignatureGate, SignaturePolicy};
pub use topology::TopologyTable;
