// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Property coverage for the canonical codec and the delta transform.

use bytes::Bytes;
use proptest::prelude::*;
use tether_proto::{
    decode_payload, decode_value, encode_payload, encode_value, payload_digest, Payload,
    PayloadDelta, Value,
};

fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        any::<f64>().prop_map(Value::Float),
        "[a-z0-9_]{0,8}".prop_map(Value::Str),
        proptest::collection::vec(any::<u8>(), 0..16).prop_map(|b| Value::Bytes(Bytes::from(b))),
    ]
}

fn value() -> impl Strategy<Value = Value> {
    leaf().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::List),
            proptest::collection::btree_map("[a-z]{1,6}", inner, 0..4).prop_map(Value::Map),
        ]
    })
}

fn payload() -> impl Strategy<Value = Payload> {
    proptest::collection::btree_map("[a-z]{1,6}", value(), 0..6)
}

proptest! {
    #[test]
    fn decode_inverts_encode(v in value()) {
        let enc = encode_value(&v);
        let back = decode_value(&enc).expect("canonical bytes must decode");
        prop_assert_eq!(back, v);
    }

    #[test]
    fn byte_equality_matches_value_equality(a in value(), b in value()) {
        let ab = encode_value(&a);
        let bb = encode_value(&b);
        prop_assert_eq!(a == b, ab == bb);
    }

    #[test]
    fn payload_round_trip_and_digest_agree(p in payload()) {
        let enc = encode_payload(&p);
        let back = decode_payload(&enc).expect("payload bytes must decode");
        prop_assert_eq!(payload_digest(&back), payload_digest(&p));
        prop_assert_eq!(back, p);
    }

    #[test]
    fn delta_applied_to_baseline_reproduces_next(base in payload(), next in payload()) {
        let delta = PayloadDelta::diff(&base, &next);
        prop_assert_eq!(delta.apply(&base), next.clone());

        let decoded = PayloadDelta::decode(&delta.encode()).expect("delta bytes must decode");
        prop_assert_eq!(decoded.apply(&base), next);
    }
}
