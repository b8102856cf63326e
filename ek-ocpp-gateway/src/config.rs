//! Configuration for a gateway node
//!
//! Combines the node's identity, its uplink to the CSMS, dispatch tuning,
//! signing keys and relay settings.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::identity::NodeId;
use crate::ocpp::types::ChargingStationInfo;
use crate::runtime::MIN_HEARTBEAT_INTERVAL;
use crate::signature::{Ed25519Policy, NoSignaturePolicy, SignatureError, SignatureGate, SignaturePolicy};

/// Complete gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    // Node identity
    pub node_id: NodeId,

    // Uplink to the CSMS
    pub uplink: UplinkConfig,

    // Engine tuning
    pub dispatch: DispatchConfig,

    // Message signing
    pub signing: SigningConfig,

    // Downstream connections
    pub relay: RelayConfig,
}

/// CSMS connection and station identity
#[derive(Debug, Clone)]
pub struct UplinkConfig {
    /// CSMS WebSocket URL (without node ID)
    pub csms_url: String,

    /// Vendor name for BootNotification
    pub vendor: String,

    /// Model name for BootNotification
    pub model: String,

    /// Serial number (optional)
    pub serial_number: Option<String>,

    /// Firmware version (optional)
    pub firmware_version: Option<String>,

    /// Initial reconnect delay
    pub reconnect_delay: Duration,

    /// Maximum reconnect delay (exponential backoff cap)
    pub max_reconnect_delay: Duration,
}

/// Dispatch engine settings
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Default request timeout
    pub request_timeout: Duration,

    /// Fail dispatches whose response does not verify
    pub strict_verification: bool,

    /// Floor for the CSMS-assigned heartbeat interval
    pub min_heartbeat_interval: Duration,
}

/// Signing key material
#[derive(Debug, Clone, Default)]
pub struct SigningConfig {
    /// Hex-encoded Ed25519 seed; unsigned operation when absent
    pub seed_hex: Option<String>,

    /// Key id announced with our signatures (defaults to the node id)
    pub key_id: Option<String>,

    /// Trusted verifying keys: (key id, hex-encoded public key)
    pub trusted_keys: Vec<(String, String)>,

    /// Treat unsigned responses as verification failures
    pub require_signatures: bool,
}

/// Downstream stations and nodes
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    /// Address to accept downstream WebSocket connections on
    pub listen_addr: Option<SocketAddr>,

    /// Static routes: (target, relay)
    pub routes: Vec<(NodeId, NodeId)>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new("EK-NN-001"),
            uplink: UplinkConfig::default(),
            dispatch: DispatchConfig::default(),
            signing: SigningConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            csms_url: "ws://localhost:8180/steve/websocket/CentralSystemService".to_string(),
            vendor: "Elektrokombinacija".to_string(),
            model: "EK3-OCPP".to_string(),
            serial_number: None,
            firmware_version: Some("0.1.0".to_string()),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            strict_verification: false,
            min_heartbeat_interval: MIN_HEARTBEAT_INTERVAL,
        }
    }
}

impl GatewayConfig {
    /// Create config with basic parameters
    pub fn new(node_id: impl Into<NodeId>, csms_url: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            uplink: UplinkConfig {
                csms_url: csms_url.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Set vendor info
    pub fn with_vendor(mut self, vendor: impl Into<String>, model: impl Into<String>) -> Self {
        self.uplink.vendor = vendor.into();
        self.uplink.model = model.into();
        self
    }

    /// Set serial number
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.uplink.serial_number = Some(serial.into());
        self
    }

    /// Set firmware version
    pub fn with_firmware(mut self, version: impl Into<String>) -> Self {
        self.uplink.firmware_version = Some(version.into());
        self
    }

    /// Set reconnect backoff
    pub fn with_reconnect(mut self, initial: Duration, max: Duration) -> Self {
        self.uplink.reconnect_delay = initial;
        self.uplink.max_reconnect_delay = max;
        self
    }

    /// Set default request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch.request_timeout = timeout;
        self
    }

    /// Fail dispatches on response verification failure
    pub fn with_strict_verification(mut self) -> Self {
        self.dispatch.strict_verification = true;
        self
    }

    /// Sign with an Ed25519 key
    pub fn with_signing_seed(mut self, seed_hex: impl Into<String>) -> Self {
        self.signing.seed_hex = Some(seed_hex.into());
        self
    }

    /// Trust a peer's verifying key
    pub fn with_trusted_key(mut self, key_id: impl Into<String>, public_hex: impl Into<String>) -> Self {
        self.signing.trusted_keys.push((key_id.into(), public_hex.into()));
        self
    }

    /// Accept downstream connections
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.relay.listen_addr = Some(addr);
        self
    }

    /// Add static route
    pub fn with_route(mut self, target: impl Into<NodeId>, via: impl Into<NodeId>) -> Self {
        self.relay.routes.push((target.into(), via.into()));
        self
    }

    /// Station identity reported in BootNotification
    pub fn charging_station_info(&self) -> ChargingStationInfo {
        ChargingStationInfo {
            model: self.uplink.model.clone(),
            vendor_name: self.uplink.vendor.clone(),
            serial_number: self.uplink.serial_number.clone(),
            firmware_version: self.uplink.firmware_version.clone(),
        }
    }

    /// Build the signing policy described by [`SigningConfig`]
    pub fn signature_policy(&self) -> Result<Arc<dyn SignaturePolicy>, SignatureError> {
        let seed = match &self.signing.seed_hex {
            Some(seed) => seed,
            None => return Ok(Arc::new(NoSignaturePolicy)),
        };

        let key_id = self
            .signing
            .key_id
            .clone()
            .unwrap_or_else(|| self.node_id.to_string());

        let mut policy = Ed25519Policy::from_hex_seed(key_id, seed)?;
        for (key_id, public_hex) in &self.signing.trusted_keys {
            policy = policy.trust_hex(key_id.clone(), public_hex)?;
        }
        if self.signing.require_signatures {
            policy = policy.require_signatures();
        }
        Ok(Arc::new(policy))
    }

    /// Signature gate in the configured verification mode
    pub fn signature_gate(&self) -> Result<SignatureGate, SignatureError> {
        let policy = self.signature_policy()?;
        Ok(if self.dispatch.strict_verification {
            SignatureGate::strict(policy)
        } else {
            SignatureGate::permissive(policy)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = GatewayConfig::new("NN1", "ws://localhost:8180/ocpp")
            .with_vendor("EK", "EK3")
            .with_serial("SN001")
            .with_request_timeout(Duration::from_secs(5))
            .with_route("CS100", "NN2");

        assert_eq!(config.node_id, NodeId::new("NN1"));
        assert_eq!(config.uplink.csms_url, "ws://localhost:8180/ocpp");
        assert_eq!(config.uplink.vendor, "EK");
        assert_eq!(config.dispatch.request_timeout, Duration::from_secs(5));
        assert_eq!(config.relay.routes, vec![(NodeId::new("CS100"), NodeId::new("NN2"))]);

        let info = config.charging_station_info();
        assert_eq!(info.model, "EK3");
        assert_eq!(info.serial_number.as_deref(), Some("SN001"));
    }

    #[test]
    fn test_defaults_are_permissive_and_unsigned() {
        let config = GatewayConfig::default();
        assert!(!config.dispatch.strict_verification);
        assert_eq!(config.dispatch.min_heartbeat_interval, Duration::from_secs(5));

        let gate = config.signature_gate().unwrap();
        assert!(!gate.is_strict());
    }

    #[test]
    fn test_signing_policy_from_config() {
        let peer = Ed25519Policy::from_seed("csms", [3u8; 32]);
        let config = GatewayConfig::new("NN1", "ws://csms")
            .with_signing_seed(hex::encode([1u8; 32]))
            .with_trusted_key("csms", hex::encode(peer.verifying_key().to_bytes()))
            .with_strict_verification();

        let gate = config.signature_gate().unwrap();
        assert!(gate.is_strict());

        let body = serde_json::json!({"status": "Accepted"});
        let signature = peer
            .sign(&crate::signature::canonicalize(&body))
            .unwrap()
            .unwrap();
        assert!(gate.verify(&body, &[signature]).is_ok());
    }

    #[test]
    fn test_bad_seed_is_reported() {
        let config = GatewayConfig::new("NN1", "ws://csms").with_signing_seed("not-hex");
        assert!(matches!(config.signature_policy(), Err(SignatureError::Malformed(_))));
    }
}
