// Round-trip law: decode(encode(m, F), F) == m for every valid message and
// every lossless format.  Messages are generated with arbitrary identity
// fields, priorities, and bounded JSON data trees.

use il_protocol::{Message, MessageHeader, MessagePayload, MessageType, Priority, WireFormat};
use proptest::prelude::*;
use serde_json::{Map, Value};

fn ident() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_-]{1,24}"
}

fn message_type() -> impl Strategy<Value = MessageType> {
    prop_oneof![
        Just(MessageType::Request),
        Just(MessageType::Response),
        Just(MessageType::Notification),
        Just(MessageType::Error),
        Just(MessageType::Heartbeat),
        Just(MessageType::Handshake),
    ]
}

fn priority() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Low),
        Just(Priority::Normal),
        Just(Priority::High),
        Just(Priority::Critical),
    ]
}

/// Bounded JSON trees: scalars at the leaves, maps/lists up to 3 deep.
///
/// Floats are restricted to integral values — JSON text has no canonical
/// float formatting, so fractional floats are not part of the round-trip law.
fn json_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i32>().prop_map(Value::from),
        "[ -~]{0,32}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,8}", inner, 0..4).prop_map(|m| {
                Value::Object(m.into_iter().collect())
            }),
        ]
    })
}

prop_compose! {
    fn message()(
        message_id in ident(),
        message_type in message_type(),
        sender_id in ident(),
        recipient_id in ident(),
        ts_millis in 0u64..=4_102_444_800_000,
        priority in priority(),
        session_id in ident(),
        command in "[a-z_]{1,32}",
        data in json_value(),
        with_metadata in any::<bool>(),
        signature in proptest::option::of("[a-f0-9]{16}"),
    ) -> Message {
        let metadata = with_metadata.then(|| {
            let mut m = Map::new();
            m.insert("auth_token".to_owned(), Value::String("t".repeat(43)));
            m
        });
        Message {
            header: MessageHeader {
                message_id,
                message_type,
                sender_id,
                recipient_id,
                // Millisecond-quantized so the f64 has an exact decimal form.
                timestamp: ts_millis as f64 / 1000.0,
                priority,
                session_id,
                protocol_version: "1.0".to_owned(),
            },
            payload: MessagePayload { command, data, metadata },
            signature,
        }
    }
}

proptest! {
    #[test]
    fn json_round_trip(msg in message()) {
        let bytes = il_protocol::encode(&msg, WireFormat::Json).unwrap();
        let decoded = il_protocol::decode(&bytes, WireFormat::Json).unwrap();
        prop_assert_eq!(decoded, msg);
    }

    #[test]
    fn msgpack_round_trip(msg in message()) {
        let bytes = il_protocol::encode(&msg, WireFormat::MessagePack).unwrap();
        let decoded = il_protocol::decode(&bytes, WireFormat::MessagePack).unwrap();
        prop_assert_eq!(decoded, msg);
    }

    #[test]
    fn json_and_msgpack_agree_on_shape(msg in message()) {
        let json_bytes = il_protocol::encode(&msg, WireFormat::Json).unwrap();
        let mp_bytes = il_protocol::encode(&msg, WireFormat::MessagePack).unwrap();
        let from_json = il_protocol::decode(&json_bytes, WireFormat::Json).unwrap();
        let from_mp = il_protocol::decode(&mp_bytes, WireFormat::MessagePack).unwrap();
        prop_assert_eq!(from_json, from_mp);
    }
}
