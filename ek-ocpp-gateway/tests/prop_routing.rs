//! Property-based tests for canonical signing bytes and hop-path routing
//!
//! Tests:
//! - Canonical bytes ignore object key order and attached signatures
//! - Ed25519 signatures survive any key reordering of the payload
//! - Advancing a hop path strips exactly one relay
//! - A relayed frame tells the first hop the rest of the path

use std::time::Duration;

use ek_ocpp_gateway::ocpp::types::HeartbeatRequest;
use ek_ocpp_gateway::operations::Heartbeat;
use ek_ocpp_gateway::signature::{canonicalize, SignaturePolicy};
use ek_ocpp_gateway::transport::MemoryChannel;
use ek_ocpp_gateway::{Destination, Ed25519Policy, GatewayBuilder, NodeId, Request};
use proptest::prelude::*;
use serde_json::{json, Map, Value};

// ============================================================================
// Strategies
// ============================================================================

fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        "[a-zA-Z0-9 ]{0,12}".prop_map(Value::String),
    ]
}

/// Object members as an ordered list, so the same content can be built in any order
fn members() -> impl Strategy<Value = Vec<(String, Value)>> {
    prop::collection::btree_map("[a-z]{1,8}", leaf(), 0..10)
        .prop_map(|map| map.into_iter().collect())
}

fn object(members: &[(String, Value)]) -> Value {
    let mut map = Map::new();
    for (key, value) in members {
        map.insert(key.clone(), value.clone());
    }
    Value::Object(map)
}

/// Distinct relay ids, at least two so the first hop is not the final node
fn hop_path() -> impl Strategy<Value = Vec<NodeId>> {
    prop::collection::btree_set("NN[0-9]{1,3}", 2..6).prop_flat_map(|ids| {
        let ids: Vec<NodeId> = ids.into_iter().map(NodeId::from).collect();
        Just(ids).prop_shuffle()
    })
}

// ============================================================================
// Canonicalization
// ============================================================================

proptest! {
    /// Member order never changes the canonical bytes
    #[test]
    fn canonical_bytes_ignore_key_order(mut fields in members()) {
        let forward = object(&fields);
        fields.reverse();
        let backward = object(&fields);

        prop_assert_eq!(canonicalize(&forward), canonicalize(&backward));
    }

    /// Attached signatures are not part of what gets signed
    #[test]
    fn canonical_bytes_ignore_signatures(fields in members(), value in "[0-9a-f]{16}") {
        let plain = object(&fields);
        let mut signed = plain.clone();
        signed["signatures"] = json!([{"keyId": "csms", "signingMethod": "Ed25519", "value": value}]);

        prop_assert_eq!(canonicalize(&plain), canonicalize(&signed));
    }

    /// Nested objects are sorted too
    #[test]
    fn canonical_bytes_sort_nested_objects(mut fields in members()) {
        let inner = object(&fields);
        fields.reverse();
        let reordered = object(&fields);

        prop_assert_eq!(
            canonicalize(&json!({"outer": inner.clone(), "list": [inner]})),
            canonicalize(&json!({"list": [reordered.clone()], "outer": reordered}))
        );
    }

    /// A signature made over one member order verifies over any other
    #[test]
    fn ed25519_signature_survives_reordering(mut fields in members(), seed in any::<[u8; 32]>()) {
        let policy = Ed25519Policy::from_seed("nn1", seed);

        let original = object(&fields);
        let signature = policy.sign(&canonicalize(&original)).unwrap().unwrap();

        fields.reverse();
        let received = object(&fields);
        prop_assert!(policy.verify(&canonicalize(&received), &[signature]).is_ok());
    }
}

// ============================================================================
// Hop paths
// ============================================================================

proptest! {
    /// Advancing drops the first hop and keeps the final node
    #[test]
    fn advance_strips_one_relay(path in hop_path()) {
        let node = path[path.len() - 1].clone();
        let destination = Destination::via(node.clone(), path.clone()).unwrap();
        let next = destination.advance();

        prop_assert_eq!(next.node(), &node);
        prop_assert_eq!(next.hops(), &path[1..]);
        prop_assert_eq!(destination.first_hop(), Some(&path[0]));
    }

    /// Repeating a relay anywhere in the path is rejected
    #[test]
    fn looping_path_is_rejected(path in hop_path(), at in any::<prop::sample::Index>()) {
        let node = path[path.len() - 1].clone();
        let mut looping = path.clone();
        looping.insert(looping.len() - 1, path[at.index(path.len() - 1)].clone());

        prop_assert!(Destination::via(node, looping).is_err());
    }

    /// The frame sent to the first hop carries the remaining path
    #[test]
    fn first_hop_receives_remaining_path(path in hop_path()) {
        let (header, sent) = tokio_test::block_on(async {
            let (gateway, _incoming) = GatewayBuilder::new()
                .node_id("EK-NN-ROOT")
                .request_timeout(Duration::from_millis(20))
                .build()
                .unwrap();

            let (relay, mut peer) = MemoryChannel::pair(path[0].clone(), gateway.correlator().clone());
            gateway.topology().register(relay.clone());

            let node = path[path.len() - 1].clone();
            let destination = Destination::via(node, path.clone()).unwrap();
            let sending = gateway.send::<Heartbeat>(Request::new(destination, HeartbeatRequest {}));

            // Nobody answers; the request times out once the frame has been captured
            let (_, call) = tokio::join!(sending, peer.next_call());
            (call.and_then(|c| c.routing), relay.sent_count() == 1)
        });

        prop_assert!(sent);
        let header = header.unwrap();
        prop_assert_eq!(&header.destination_id, &path[path.len() - 1]);
        prop_assert_eq!(&header.network_path[..], &path[1..]);
    }
}
