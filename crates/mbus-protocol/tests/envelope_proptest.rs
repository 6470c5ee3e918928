use std::collections::HashSet;

use mbus_protocol::{CorrelationAllocator, Envelope, Handle, PendingTable, PROTOCOL_MARKER};
use proptest::prelude::*;
use serde_json::{Map, Value};

/// Strategy for arbitrary JSON trees, a few levels deep.
fn arb_json() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z0-9 _]{0,16}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 32, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::btree_map("[a-zA-Z_]{1,8}", inner, 0..6)
                .prop_map(|m| Value::Object(m.into_iter().collect::<Map<_, _>>())),
        ]
    })
}

proptest! {
    /// Nothing without the marker is ever taken for bus traffic.
    #[test]
    fn unmarked_values_are_never_envelopes(value in arb_json()) {
        let mut value = value;
        if let Value::Object(map) = &mut value {
            map.remove("_source");
        }
        prop_assert!(Envelope::from_value(value).unwrap().is_none());
    }

    /// A foreign marker is as good as none.
    #[test]
    fn foreign_marker_ignored(marker in "[a-zA-Z_]{1,20}", from in "[a-z]{1,8}") {
        prop_assume!(marker != PROTOCOL_MARKER);
        let value = serde_json::json!({"_source": marker, "from": from, "to": "A", "action": "ping"});
        prop_assert!(Envelope::from_value(value).unwrap().is_none());
    }

    /// Messages keep sender, recipient, action and payload across the wire.
    #[test]
    fn message_survives_encoding(
        from in "[a-zA-Z0-9-]{1,12}",
        to in "[a-zA-Z0-9-]{1,12}",
        action in "[a-z_]{1,16}",
        payload in arb_json(),
        ack in proptest::option::of(1u32..100_000),
    ) {
        let env = Envelope::message(&Handle::from(from), &Handle::from(to), &action, payload, ack);
        let back = Envelope::from_value(env.to_value().unwrap()).unwrap().unwrap();
        prop_assert_eq!(back, env);
    }

    /// Outstanding codes never collide, whatever the seed.
    #[test]
    fn outstanding_codes_unique(seed in any::<u64>(), count in 1usize..2_000) {
        let mut table = PendingTable::new(CorrelationAllocator::with_seed(seed));
        let peer = Handle::from("B");
        let mut seen = HashSet::new();
        for i in 0..count {
            let code = if i % 3 == 0 {
                table.expect_response(&peer, "ping").unwrap().0
            } else {
                table.expect_ack(&peer, "note").unwrap().0
            };
            prop_assert!((1..100_000).contains(&code));
            prop_assert!(seen.insert(code));
        }
    }
}
