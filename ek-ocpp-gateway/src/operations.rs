//! Operation table
//!
//! Each OCPP operation is a marker type binding an [`Action`] to its request
//! and response payloads. The dispatch engine is generic over [`Operation`],
//! so adding an operation means adding one line here, not another method.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::ocpp::types::*;
use crate::ocpp::Action;

/// A request/response pair carried by the gateway
pub trait Operation: Send + Sync + 'static {
    const ACTION: Action;
    type Request: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
    type Response: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
}

macro_rules! operations {
    ($( $(#[$meta:meta])* $name:ident: $request:ty => $response:ty; )+) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy)]
            pub struct $name;

            impl Operation for $name {
                const ACTION: Action = Action::$name;
                type Request = $request;
                type Response = $response;
            }
        )+
    };
}

operations! {
    /// Station registration; its response drives the heartbeat interval
    BootNotification: BootNotificationRequest => BootNotificationResponse;
    Heartbeat: HeartbeatRequest => HeartbeatResponse;
    StatusNotification: StatusNotificationRequest => StatusNotificationResponse;
    MeterValues: MeterValuesRequest => MeterValuesResponse;
    Authorize: AuthorizeRequest => AuthorizeResponse;
    TransactionEvent: TransactionEventRequest => TransactionEventResponse;
    DataTransfer: DataTransferRequest => DataTransferResponse;
    SetChargingProfile: SetChargingProfileRequest => SetChargingProfileResponse;
    RequestStartTransaction: RequestStartTransactionRequest => RequestStartTransactionResponse;
    RequestStopTransaction: RequestStopTransactionRequest => RequestStopTransactionResponse;
    ReserveNow: ReserveNowRequest => ReserveNowResponse;
    CancelReservation: CancelReservationRequest => CancelReservationResponse;
    GetVariables: GetVariablesRequest => GetVariablesResponse;
    SetVariables: SetVariablesRequest => SetVariablesResponse;
    Reset: ResetRequest => ResetResponse;
}
