//! OCPP-J message framing
//!
//! OCPP frames are JSON arrays sent over WebSocket:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! A CALL forwarded through relaying networking nodes carries a fifth element,
//! the routing header: `{"destinationId": ..., "networkPath": [...]}`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::identity::{Destination, DestinationError, NodeId};

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// OCPP error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
}

impl ErrorCode {
    /// Whether the peer rejected the shape of the payload rather than failing to process it
    pub fn is_format_violation(&self) -> bool {
        matches!(
            self,
            ErrorCode::FormatViolation
                | ErrorCode::OccurrenceConstraintViolation
                | ErrorCode::PropertyConstraintViolation
                | ErrorCode::TypeConstraintViolation
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// OCPP action names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    // CS -> CSMS
    BootNotification,
    Heartbeat,
    StatusNotification,
    MeterValues,
    Authorize,
    TransactionEvent,

    // CSMS -> CS
    SetChargingProfile,
    RequestStartTransaction,
    RequestStopTransaction,
    ReserveNow,
    CancelReservation,
    GetVariables,
    SetVariables,
    Reset,

    // Bidirectional
    DataTransfer,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::str::FromStr for Action {
    type Err = OcppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BootNotification" => Ok(Action::BootNotification),
            "Heartbeat" => Ok(Action::Heartbeat),
            "StatusNotification" => Ok(Action::StatusNotification),
            "MeterValues" => Ok(Action::MeterValues),
            "Authorize" => Ok(Action::Authorize),
            "TransactionEvent" => Ok(Action::TransactionEvent),
            "SetChargingProfile" => Ok(Action::SetChargingProfile),
            "RequestStartTransaction" => Ok(Action::RequestStartTransaction),
            "RequestStopTransaction" => Ok(Action::RequestStopTransaction),
            "ReserveNow" => Ok(Action::ReserveNow),
            "CancelReservation" => Ok(Action::CancelReservation),
            "GetVariables" => Ok(Action::GetVariables),
            "SetVariables" => Ok(Action::SetVariables),
            "Reset" => Ok(Action::Reset),
            "DataTransfer" => Ok(Action::DataTransfer),
            _ => Err(OcppError::UnknownAction(s.to_string())),
        }
    }
}

/// Errors in OCPP frame handling
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid message format")]
    InvalidFormat,

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),

    #[error("Invalid routing header: {0}")]
    InvalidRouting(#[from] DestinationError),
}

/// Correlation identifier of a request/response pair (the OCPP message id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Routing header of a CALL relayed through networking nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingHeader {
    pub destination_id: NodeId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_path: Vec<NodeId>,
}

impl RoutingHeader {
    pub fn for_destination(destination: &Destination) -> Self {
        Self {
            destination_id: destination.node().clone(),
            network_path: destination.hops().to_vec(),
        }
    }

    /// The destination this header describes
    pub fn destination(&self) -> Result<Destination, DestinationError> {
        Destination::via(self.destination_id.clone(), self.network_path.clone())
    }
}

/// OCPP CALL message (request)
#[derive(Debug, Clone)]
pub struct Call {
    pub message_id: CorrelationId,
    pub action: Action,
    pub payload: Value,
    pub routing: Option<RoutingHeader>,
}

impl Call {
    /// Create a new CALL message with a fresh message id
    pub fn new(action: Action, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: CorrelationId::generate(),
            action,
            payload: serde_json::to_value(payload)?,
            routing: None,
        })
    }

    /// Attach a routing header for relayed delivery
    pub fn routed(mut self, routing: RoutingHeader) -> Self {
        self.routing = Some(routing);
        self
    }

    /// Serialize to OCPP wire format: [2, messageId, action, payload(, routing)]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = match &self.routing {
            None => serde_json::json!([
                MessageType::Call as i32,
                &self.message_id,
                self.action.to_string(),
                &self.payload
            ]),
            Some(routing) => serde_json::json!([
                MessageType::Call as i32,
                &self.message_id,
                self.action.to_string(),
                &self.payload,
                routing
            ]),
        };
        Ok(serde_json::to_vec(&array)?)
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone)]
pub struct CallResult {
    pub message_id: CorrelationId,
    pub payload: Value,
}

impl CallResult {
    pub fn new(message_id: CorrelationId, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Serialize to OCPP wire format: [3, messageId, payload]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = serde_json::json!([
            MessageType::CallResult as i32,
            &self.message_id,
            &self.payload
        ]);
        Ok(serde_json::to_vec(&array)?)
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone)]
pub struct CallError {
    pub message_id: CorrelationId,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    pub fn new(
        message_id: CorrelationId,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    /// Serialize to OCPP wire format: [4, messageId, errorCode, errorDescription, errorDetails]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = serde_json::json!([
            MessageType::CallError as i32,
            &self.message_id,
            self.error_code.to_string(),
            &self.error_description,
            &self.error_details
        ]);
        Ok(serde_json::to_vec(&array)?)
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

fn message_id_at(array: &[Value], index: usize) -> Result<CorrelationId, OcppError> {
    array
        .get(index)
        .and_then(Value::as_str)
        .map(CorrelationId::new)
        .ok_or(OcppError::InvalidFormat)
}

impl OcppMessage {
    /// Parse an OCPP message from JSON bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, OcppError> {
        let array: Vec<Value> = serde_json::from_slice(bytes)?;

        let msg_type = array
            .first()
            .and_then(Value::as_i64)
            .ok_or(OcppError::InvalidFormat)?;

        match msg_type {
            2 => {
                // CALL: [2, messageId, action, payload(, routing)]
                if array.len() != 4 && array.len() != 5 {
                    return Err(OcppError::InvalidFormat);
                }

                let message_id = message_id_at(&array, 1)?;
                let action: Action = array[2]
                    .as_str()
                    .ok_or(OcppError::InvalidFormat)?
                    .parse()?;

                let routing = match array.get(4) {
                    Some(header) => {
                        let header: RoutingHeader = serde_json::from_value(header.clone())?;
                        header.destination()?;
                        Some(header)
                    }
                    None => None,
                };

                Ok(OcppMessage::Call(Call {
                    message_id,
                    action,
                    payload: array[3].clone(),
                    routing,
                }))
            }
            3 => {
                // CALLRESULT: [3, messageId, payload]
                if array.len() != 3 {
                    return Err(OcppError::InvalidFormat);
                }

                Ok(OcppMessage::CallResult(CallResult {
                    message_id: message_id_at(&array, 1)?,
                    payload: array[2].clone(),
                }))
            }
            4 => {
                // CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
                if array.len() != 5 {
                    return Err(OcppError::InvalidFormat);
                }

                let message_id = message_id_at(&array, 1)?;
                let error_code_str = array[2].as_str().ok_or(OcppError::InvalidFormat)?;
                let error_code: ErrorCode =
                    serde_json::from_value(Value::String(error_code_str.to_string()))
                        .unwrap_or(ErrorCode::GenericError);

                Ok(OcppMessage::CallError(CallError {
                    message_id,
                    error_code,
                    error_description: array[3].as_str().unwrap_or("").to_string(),
                    error_details: array[4].clone(),
                }))
            }
            _ => Err(OcppError::UnknownMessageType(msg_type)),
        }
    }

    pub fn message_id(&self) -> &CorrelationId {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        match self {
            OcppMessage::Call(c) => c.to_bytes(),
            OcppMessage::CallResult(r) => r.to_bytes(),
            OcppMessage::CallError(e) => e.to_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::types::SetChargingProfileRequest;

    #[test]
    fn test_call_serialization() {
        let call = Call::new(Action::Heartbeat, serde_json::json!({})).unwrap();
        let text = String::from_utf8(call.to_bytes().unwrap()).unwrap();

        assert!(text.starts_with("[2,"));
        assert!(text.contains("\"Heartbeat\""));
    }

    #[test]
    fn test_call_parsing() {
        let json = r#"[2, "msg-123", "Heartbeat", {}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        match msg {
            OcppMessage::Call(call) => {
                assert_eq!(call.message_id.as_str(), "msg-123");
                assert_eq!(call.action, Action::Heartbeat);
                assert!(call.routing.is_none());
            }
            _ => panic!("Expected Call"),
        }
    }

    #[test]
    fn test_routed_call() {
        let dest = Destination::via("CS001", vec!["NN1".into(), "CS001".into()]).unwrap();
        let call = Call::new(Action::Reset, serde_json::json!({"type": "Immediate"}))
            .unwrap()
            .routed(RoutingHeader::for_destination(&dest));

        let bytes = call.to_bytes().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"destinationId\":\"CS001\""));

        match OcppMessage::parse(&bytes).unwrap() {
            OcppMessage::Call(parsed) => {
                let routing = parsed.routing.unwrap();
                assert_eq!(routing.destination().unwrap(), dest);
            }
            _ => panic!("Expected Call"),
        }
    }

    #[test]
    fn test_routed_call_with_bad_path_is_rejected() {
        let json = r#"[2, "m1", "Reset", {}, {"destinationId": "CS001", "networkPath": ["NN1"]}]"#;
        assert!(matches!(
            OcppMessage::parse(json.as_bytes()),
            Err(OcppError::InvalidRouting(_))
        ));
    }

    #[test]
    fn test_call_result_parsing() {
        let json = r#"[3, "msg-123", {"currentTime": "2026-01-20T12:00:00Z"}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        match msg {
            OcppMessage::CallResult(result) => {
                assert_eq!(result.message_id.as_str(), "msg-123");
            }
            _ => panic!("Expected CallResult"),
        }
    }

    #[test]
    fn test_call_error_parsing() {
        let json = r#"[4, "msg-123", "NotImplemented", "Action not supported", {}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        match msg {
            OcppMessage::CallError(error) => {
                assert_eq!(error.message_id.as_str(), "msg-123");
                assert_eq!(error.error_code, ErrorCode::NotImplemented);
                assert!(!error.error_code.is_format_violation());
            }
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(
            OcppMessage::parse(b"[]"),
            Err(OcppError::InvalidFormat)
        ));
        assert!(matches!(
            OcppMessage::parse(br#"[9, "x", {}]"#),
            Err(OcppError::UnknownMessageType(9))
        ));
        assert!(matches!(
            OcppMessage::parse(br#"[2, "x", "Teleport", {}]"#),
            Err(OcppError::UnknownAction(_))
        ));
    }

    #[test]
    fn test_set_charging_profile_request() {
        let json = r#"[2, "uuid-456", "SetChargingProfile", {
            "evseId": 1,
            "chargingProfile": {
                "id": 1,
                "stackLevel": 0,
                "chargingProfilePurpose": "TxDefaultProfile",
                "chargingProfileKind": "Absolute",
                "chargingSchedule": [{
                    "id": 1,
                    "chargingRateUnit": "W",
                    "chargingSchedulePeriod": [
                        {"startPeriod": 0, "limit": 22000.0}
                    ]
                }]
            }
        }]"#;

        match OcppMessage::parse(json.as_bytes()).unwrap() {
            OcppMessage::Call(call) => {
                assert_eq!(call.action, Action::SetChargingProfile);
                let req: SetChargingProfileRequest = serde_json::from_value(call.payload).unwrap();
                assert_eq!(req.evse_id, 1);
                assert_eq!(req.charging_profile.id, 1);
            }
            _ => panic!("Expected Call"),
        }
    }
}
