use proptest::prelude::*;
use simlink_core::codec::{HEADER_LEN, LENGTH_PREFIX_LEN};
use simlink_core::{
    AckPayload, Action, Command, DecodeError, Envelope, EnvelopeKind, ErrorPayload,
    HeartbeatPayload, ParamValue, decode, encode,
};

fn param_strategy() -> impl Strategy<Value = ParamValue> {
    prop_oneof![
        any::<bool>().prop_map(ParamValue::Bool),
        any::<i64>().prop_map(ParamValue::Int),
        (-1.0e9f64..1.0e9).prop_map(ParamValue::Float),
        "[a-z]{0,12}".prop_map(ParamValue::Text),
        any::<u64>().prop_map(ParamValue::Entity),
        (-1.0e6f64..1.0e6, -64.0f64..320.0, -1.0e6f64..1.0e6)
            .prop_map(|(x, y, z)| ParamValue::Vec3([x, y, z])),
    ]
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        Just(Action::MoveEntity),
        Just(Action::SetAttribute),
        Just(Action::RemoveEntity),
        Just(Action::SetWorldParameter),
        Just(Action::Noop),
    ]
}

fn command_strategy() -> impl Strategy<Value = Command> {
    (
        any::<u64>(),
        proptest::option::of(any::<u64>()),
        action_strategy(),
        prop::collection::btree_map("[A-Z][a-z]{0,8}", param_strategy(), 0..6),
    )
        .prop_map(|(correlation_id, target_tick, action, parameters)| Command {
            correlation_id,
            target_tick,
            action,
            parameters,
        })
}

fn envelope_strategy() -> impl Strategy<Value = Envelope> {
    let command = command_strategy().prop_map(|cmd| {
        Envelope::seal(EnvelopeKind::Command, cmd.correlation_id, &cmd).unwrap()
    });
    let heartbeat = ("[a-z]{1,10}", proptest::option::of(any::<u64>())).prop_map(|(agent, tick)| {
        let hb = HeartbeatPayload {
            agent,
            supported_versions: vec![1],
            tick,
        };
        Envelope::seal(EnvelopeKind::Heartbeat, 0, &hb).unwrap()
    });
    let error = (any::<u64>(), any::<i32>(), ".{0,40}").prop_map(|(id, code, message)| {
        let payload = ErrorPayload {
            code,
            message,
            tick: None,
        };
        Envelope::seal(EnvelopeKind::Error, id, &payload).unwrap()
    });
    let ack = (any::<u64>(), any::<u64>()).prop_map(|(id, applied_tick)| {
        Envelope::seal(EnvelopeKind::Ack, id, &AckPayload { applied_tick }).unwrap()
    });

    (prop_oneof![command, heartbeat, error, ack], any::<u64>())
        .prop_map(|(env, sequence)| env.with_sequence(sequence))
}

proptest! {
    #[test]
    fn prop_decode_inverts_encode(env in envelope_strategy()) {
        let frame = encode(&env).unwrap();
        prop_assert_eq!(decode(&frame), Ok(env));
    }

    #[test]
    fn prop_any_strict_prefix_is_truncated(env in envelope_strategy(), cut in 0usize..usize::MAX) {
        let frame = encode(&env).unwrap();
        let cut = cut % frame.len();
        let err = decode(&frame[..cut]).unwrap_err();
        let is_truncated = matches!(err, DecodeError::Truncated { .. });
        prop_assert!(is_truncated);
    }

    #[test]
    fn prop_header_fields_survive(env in envelope_strategy()) {
        let frame = encode(&env).unwrap();
        prop_assert_eq!(frame.len(), LENGTH_PREFIX_LEN + HEADER_LEN + env.payload.len());
        let decoded = decode(&frame).unwrap();
        prop_assert_eq!(decoded.sequence, env.sequence);
        prop_assert_eq!(decoded.correlation_id, env.correlation_id);
        prop_assert_eq!(decoded.kind, env.kind);
    }
}
