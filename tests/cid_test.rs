use proptest::prelude::*;
use tickchain::cid::{self, ContentId, DAG_JSON};
use tickchain::canonicalize;

fn arb_payload() -> impl Strategy<Value = serde_json::Value> {
    (any::<i64>(), "[a-z ]{0,24}", prop::collection::vec(any::<u32>(), 0..8)).prop_map(|(n, s, list)| {
        serde_json::json!({"n": n, "label": s, "list": list})
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn property_identifier_round_trips(payload in arb_payload()) {
        let id = cid::encode(&payload).unwrap();
        let parsed = ContentId::parse(&id).unwrap();

        prop_assert_eq!(parsed.encode(), id.clone());
        prop_assert_eq!(parsed.codec(), DAG_JSON);
        prop_assert!(cid::verify(&id, &payload));
    }

    #[test]
    fn property_single_byte_flip_fails(
        payload in arb_payload(),
        position in any::<prop::sample::Index>(),
        bit in 0u8..8
    ) {
        let bytes = canonicalize(&payload).unwrap();
        let id = ContentId::for_bytes(&bytes).encode();

        let mut flipped = bytes.clone();
        let i = position.index(flipped.len());
        flipped[i] ^= 1 << bit;

        prop_assert!(cid::verify_bytes(&id, &bytes));
        prop_assert!(!cid::verify_bytes(&id, &flipped));
    }
}

#[test]
fn test_identifier_is_lowercase_base32() {
    let id = cid::encode(&serde_json::json!({"tick": 5})).unwrap();
    assert!(id.starts_with("baguqee"));
    assert!(id[1..].chars().all(|c| matches!(c, 'a'..='z' | '2'..='7')));
}

#[test]
fn test_key_order_does_not_change_identifier() {
    #[derive(serde::Serialize)]
    struct Forward {
        a: i64,
        b: i64,
    }
    #[derive(serde::Serialize)]
    struct Backward {
        b: i64,
        a: i64,
    }
    assert_eq!(
        cid::encode(&Forward { a: 1, b: 2 }).unwrap(),
        cid::encode(&Backward { b: 2, a: 1 }).unwrap()
    );
}

#[test]
fn test_garbage_never_verifies() {
    assert!(!cid::verify_bytes("", b"{}"));
    assert!(!cid::verify_bytes("zQmNotBase32", b"{}"));
    assert!(!cid::verify_bytes("b!!!!", b"{}"));
}
