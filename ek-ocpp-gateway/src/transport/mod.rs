//! Transport channel realisations
//!
//! - `memory` - in-process link, for co-located nodes and tests
//! - `websocket` - OCPP-J over WebSocket, dialled or accepted
//! - `uplink` - reconnecting WebSocket uplink to the CSMS

pub mod memory;
pub mod uplink;
pub mod websocket;

pub use memory::{MemoryChannel, MemoryPeer};
pub use uplink::{UplinkConnector, UplinkEvent};
pub use websocket::{build_ocpp_url, IncomingRequest, Responder, WebSocketChannel, OCPP_SUBPROTOCOL};
