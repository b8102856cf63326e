//! Message signing and verification
//!
//! Signatures cover a canonical serialization of the payload: JSON with
//! object keys sorted, no insignificant whitespace, and the top-level
//! `signatures` member left out. Attached signatures travel inside the
//! payload under that member.

use std::collections::HashMap;
use std::sync::Arc;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

/// Payload member carrying attached signatures
pub const SIGNATURES_FIELD: &str = "signatures";

const ED25519_METHOD: &str = "Ed25519";

/// A signature block attached to a payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSignature {
    pub key_id: String,
    pub signing_method: String,
    /// Hex-encoded signature bytes
    pub value: String,
}

/// Signing and verification failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Unknown signing key: {0}")]
    UnknownKey(String),

    #[error("Unsupported signing method: {0}")]
    UnsupportedMethod(String),

    #[error("Malformed signature: {0}")]
    Malformed(String),

    #[error("Signature by {0} does not match the payload")]
    Mismatch(String),

    #[error("Payload is not signed")]
    Missing,
}

/// Signing capability consulted by the gateway, never mutated by it
pub trait SignaturePolicy: Send + Sync {
    /// Produce a signature over canonical bytes, or `None` to leave the message unsigned
    fn sign(&self, canonical: &[u8]) -> Result<Option<MessageSignature>, SignatureError>;

    /// Check the signatures attached to a payload
    fn verify(&self, canonical: &[u8], signatures: &[MessageSignature]) -> Result<(), SignatureError>;
}

/// Something a signature block can be attached to
pub trait Signable {
    fn attach_signature(&mut self, signature: MessageSignature);
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), sorted(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// Canonical bytes of a payload, excluding its signatures
pub fn canonicalize(payload: &Value) -> Vec<u8> {
    let mut canonical = sorted(payload);
    if let Value::Object(map) = &mut canonical {
        map.remove(SIGNATURES_FIELD);
    }
    // Serializing a Value cannot fail: keys are strings and numbers are finite
    serde_json::to_vec(&canonical).unwrap_or_default()
}

/// Remove and decode the signatures attached to a payload
pub fn take_signatures(payload: &mut Value) -> Result<Vec<MessageSignature>, SignatureError> {
    let attached = match payload {
        Value::Object(map) => map.remove(SIGNATURES_FIELD),
        _ => None,
    };

    match attached {
        None => Ok(Vec::new()),
        Some(value) => {
            serde_json::from_value(value).map_err(|e| SignatureError::Malformed(e.to_string()))
        }
    }
}

/// Wraps signing of outbound and verification of inbound payloads
#[derive(Clone)]
pub struct SignatureGate {
    policy: Arc<dyn SignaturePolicy>,
    strict: bool,
}

impl SignatureGate {
    /// Verification failures are reported but do not fail the dispatch
    pub fn permissive(policy: Arc<dyn SignaturePolicy>) -> Self {
        Self {
            policy,
            strict: false,
        }
    }

    /// Verification failures fail the dispatch
    pub fn strict(policy: Arc<dyn SignaturePolicy>) -> Self {
        Self {
            policy,
            strict: true,
        }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Sign `body` (the serialized form of `message`) and attach the result to `message`
    pub fn sign<S: Signable>(&self, message: &mut S, body: &Value) -> Result<(), SignatureError> {
        if let Some(signature) = self.policy.sign(&canonicalize(body))? {
            debug!("Attached {} signature by {}", signature.signing_method, signature.key_id);
            message.attach_signature(signature);
        }
        Ok(())
    }

    /// Verify the signatures that came with a payload
    pub fn verify(&self, body: &Value, signatures: &[MessageSignature]) -> Result<(), SignatureError> {
        self.policy.verify(&canonicalize(body), signatures)
    }
}

/// Signs nothing and accepts everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSignaturePolicy;

impl SignaturePolicy for NoSignaturePolicy {
    fn sign(&self, _canonical: &[u8]) -> Result<Option<MessageSignature>, SignatureError> {
        Ok(None)
    }

    fn verify(&self, _canonical: &[u8], _signatures: &[MessageSignature]) -> Result<(), SignatureError> {
        Ok(())
    }
}

/// Ed25519 signing with a keyring of trusted verifying keys
pub struct Ed25519Policy {
    key_id: String,
    signing_key: SigningKey,
    trusted: HashMap<String, VerifyingKey>,
    require_signed: bool,
}

impl Ed25519Policy {
    /// Policy signing with the key derived from a 32-byte seed
    pub fn from_seed(key_id: impl Into<String>, seed: [u8; 32]) -> Self {
        let key_id = key_id.into();
        let signing_key = SigningKey::from_bytes(&seed);
        let mut trusted = HashMap::new();
        trusted.insert(key_id.clone(), signing_key.verifying_key());

        Self {
            key_id,
            signing_key,
            trusted,
            require_signed: false,
        }
    }

    /// Policy with a hex-encoded seed
    pub fn from_hex_seed(key_id: impl Into<String>, seed_hex: &str) -> Result<Self, SignatureError> {
        let seed = decode_fixed::<32>(seed_hex)?;
        Ok(Self::from_seed(key_id, seed))
    }

    /// Policy with a freshly generated key
    pub fn generate(key_id: impl Into<String>) -> Self {
        let signing_key = SigningKey::generate(&mut rand::thread_rng());
        Self::from_seed(key_id, signing_key.to_bytes())
    }

    /// Trust signatures made by `key` under `key_id`
    pub fn trust(mut self, key_id: impl Into<String>, key: VerifyingKey) -> Self {
        self.trusted.insert(key_id.into(), key);
        self
    }

    /// Trust a hex-encoded verifying key
    pub fn trust_hex(self, key_id: impl Into<String>, key_hex: &str) -> Result<Self, SignatureError> {
        let bytes = decode_fixed::<32>(key_hex)?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| SignatureError::Malformed(e.to_string()))?;
        Ok(self.trust(key_id, key))
    }

    /// Reject payloads that carry no signature at all
    pub fn require_signatures(mut self) -> Self {
        self.require_signed = true;
        self
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

fn decode_fixed<const N: usize>(input: &str) -> Result<[u8; N], SignatureError> {
    let bytes = hex::decode(input).map_err(|e| SignatureError::Malformed(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| SignatureError::Malformed(format!("expected {} bytes, got {}", N, b.len())))
}

impl SignaturePolicy for Ed25519Policy {
    fn sign(&self, canonical: &[u8]) -> Result<Option<MessageSignature>, SignatureError> {
        let signature = self
            .signing_key
            .try_sign(canonical)
            .map_err(|e| SignatureError::SigningFailed(e.to_string()))?;

        Ok(Some(MessageSignature {
            key_id: self.key_id.clone(),
            signing_method: ED25519_METHOD.to_string(),
            value: hex::encode(signature.to_bytes()),
        }))
    }

    fn verify(&self, canonical: &[u8], signatures: &[MessageSignature]) -> Result<(), SignatureError> {
        if signatures.is_empty() {
            return if self.require_signed {
                Err(SignatureError::Missing)
            } else {
                Ok(())
            };
        }

        for attached in signatures {
            if attached.signing_method != ED25519_METHOD {
                return Err(SignatureError::UnsupportedMethod(attached.signing_method.clone()));
            }

            let key = self
                .trusted
                .get(&attached.key_id)
                .ok_or_else(|| SignatureError::UnknownKey(attached.key_id.clone()))?;

            let bytes = decode_fixed::<64>(&attached.value)?;
            key.verify(canonical, &Signature::from_bytes(&bytes))
                .map_err(|_| SignatureError::Mismatch(attached.key_id.clone()))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Envelope {
        signatures: Vec<MessageSignature>,
    }

    impl Signable for Envelope {
        fn attach_signature(&mut self, signature: MessageSignature) {
            self.signatures.push(signature);
        }
    }

    #[test]
    fn test_canonical_form_ignores_key_order_and_signatures() {
        let a = json!({"b": 1, "a": {"y": [1, 2], "x": "s"}});
        let b = json!({"a": {"x": "s", "y": [1, 2]}, "b": 1, "signatures": [{"keyId": "k"}]});

        assert_eq!(canonicalize(&a), canonicalize(&b));
        assert_eq!(canonicalize(&a), br#"{"a":{"x":"s","y":[1,2]},"b":1}"#.to_vec());
    }

    #[test]
    fn test_sign_then_verify() {
        let policy = Arc::new(Ed25519Policy::from_seed("node-1", [7u8; 32]));
        let gate = SignatureGate::permissive(policy);

        let body = json!({"reason": "PowerUp", "chargingStation": {"model": "EK3", "vendorName": "EK"}});
        let mut envelope = Envelope::default();
        gate.sign(&mut envelope, &body).unwrap();

        assert_eq!(envelope.signatures.len(), 1);
        assert_eq!(envelope.signatures[0].key_id, "node-1");
        assert!(gate.verify(&body, &envelope.signatures).is_ok());
    }

    #[test]
    fn test_tampered_payload_fails() {
        let policy = Ed25519Policy::from_seed("node-1", [7u8; 32]);
        let body = json!({"interval": 300});
        let signature = policy.sign(&canonicalize(&body)).unwrap().unwrap();

        let tampered = json!({"interval": 5});
        assert_eq!(
            policy.verify(&canonicalize(&tampered), &[signature]),
            Err(SignatureError::Mismatch("node-1".to_string()))
        );
    }

    #[test]
    fn test_trusted_remote_key() {
        let csms = Ed25519Policy::from_seed("csms", [1u8; 32]);
        let node = Ed25519Policy::from_seed("node", [2u8; 32]).trust("csms", csms.verifying_key());

        let body = json!({"status": "Accepted"});
        let signature = csms.sign(&canonicalize(&body)).unwrap().unwrap();
        assert!(node.verify(&canonicalize(&body), &[signature.clone()]).is_ok());

        let stranger = Ed25519Policy::from_seed("node", [3u8; 32]);
        assert_eq!(
            stranger.verify(&canonicalize(&body), &[signature]),
            Err(SignatureError::UnknownKey("csms".to_string()))
        );
    }

    #[test]
    fn test_missing_signatures() {
        let lenient = Ed25519Policy::from_seed("n", [4u8; 32]);
        assert!(lenient.verify(b"{}", &[]).is_ok());

        let strict = Ed25519Policy::from_seed("n", [4u8; 32]).require_signatures();
        assert_eq!(strict.verify(b"{}", &[]), Err(SignatureError::Missing));
    }

    #[test]
    fn test_take_signatures() {
        let mut payload = json!({
            "status": "Accepted",
            "signatures": [{"keyId": "k", "signingMethod": "Ed25519", "value": "00"}]
        });
        let signatures = take_signatures(&mut payload).unwrap();
        assert_eq!(signatures.len(), 1);
        assert_eq!(payload, json!({"status": "Accepted"}));

        let mut broken = json!({"signatures": "nope"});
        assert!(matches!(take_signatures(&mut broken), Err(SignatureError::Malformed(_))));
    }

    #[test]
    fn test_hex_keys() {
        let seed_hex = hex::encode([9u8; 32]);
        let policy = Ed25519Policy::from_hex_seed("k", &seed_hex).unwrap();
        let public_hex = hex::encode(policy.verifying_key().to_bytes());

        let other = Ed25519Policy::generate("o").trust_hex("k", &public_hex).unwrap();
        let signature = policy.sign(b"x").unwrap().unwrap();
        assert!(other.verify(b"x", &[signature]).is_ok());

        assert!(matches!(
            Ed25519Policy::from_hex_seed("k", "abcd"),
            Err(SignatureError::Malformed(_))
        ));
    }

    #[test]
    fn test_no_signature_policy() {
        let gate = SignatureGate::strict(Arc::new(NoSignaturePolicy));
        let mut envelope = Envelope::default();
        gate.sign(&mut envelope, &json!({})).unwrap();
        assert!(envelope.signatures.is_empty());
        assert!(gate.verify(&json!({}), &[]).is_ok());
    }
}
