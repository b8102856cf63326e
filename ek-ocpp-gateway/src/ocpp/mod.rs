//! OCPP 2.0.1 protocol layer
//!
//! - `types`: OCPP message payloads and data structures
//! - `messages`: OCPP-J framing (CALL, CALLRESULT, CALLERROR) and routing headers

pub mod types;
pub mod messages;

pub use types::*;
pub use messages::*;
