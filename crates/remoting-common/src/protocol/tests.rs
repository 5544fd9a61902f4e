//! Tests for the protocol module
//!
//! These tests verify packet construction, the kind-tagged wire shape, and
//! id generation.

#[cfg(test)]
mod tests {
    use super::super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_method_call_creation() {
        let call = MethodCall::new(7, "add", vec![json!(1), json!(2)]);
        assert_eq!(call.id, 7);
        assert_eq!(call.method_name, "add");
        assert_eq!(call.parameters, vec![json!(1), json!(2)]);
        assert!(call.return_value.is_none());
        assert!(!call.is_error());
        assert!(call.trace_id.is_none());
    }

    #[test]
    fn test_method_call_with_trace_id() {
        let call = MethodCall::new(1, "echo", vec![]).with_trace_id(Some("t-1".into()));
        assert_eq!(call.trace_id.as_deref(), Some("t-1"));
    }

    #[test]
    fn test_event_packet_constructors() {
        let sub = EventPacket::subscribe("price");
        assert_eq!(sub.flag, EventFlag::Subscribe);
        assert!(sub.compute_id.is_none());

        let compute = EventPacket::compute_args("price", 42, json!({"v": 10}));
        assert_eq!(compute.flag, EventFlag::ComputeArgs);
        assert_eq!(compute.compute_id, Some(42));
        assert_eq!(compute.payload, json!({"v": 10}));

        let broadcast = EventPacket::broadcast("price", json!(1));
        assert_eq!(broadcast.flag, EventFlag::Broadcast);
        assert!(broadcast.compute_id.is_none());
    }

    #[test]
    fn test_packet_is_kind_tagged() {
        let packet = Packet::from(HandshakeMetadata { event_version: 2 });
        let value = serde_json::to_value(&packet).unwrap();
        assert_eq!(value, json!({"kind": "handshake", "event_version": 2}));

        let packet = Packet::from(EventPacket::publish("price", json!({"v": 1})));
        let value = serde_json::to_value(&packet).unwrap();
        assert_eq!(value["kind"], "event");
        assert_eq!(value["flag"], "publish");
    }

    #[test]
    fn test_packet_kind_and_control() {
        assert_eq!(Packet::from(Ping::now()).kind(), "ping");
        assert!(Packet::from(Ping::now()).is_control());
        assert!(Packet::from(ErrorPacket { message: "x".into() }).is_control());
        assert!(!Packet::from(MethodCall::new(1, "m", vec![])).is_control());
    }

    #[test]
    fn test_ping_elapsed_is_non_negative() {
        let ping = Ping::now();
        assert!(ping.elapsed_millis() >= 0);
    }

    #[test]
    fn test_null_return_value_decodes_as_none() {
        let mut call = MethodCall::new(1, "noop", vec![]);
        call.return_value = Some(serde_json::Value::Null);
        let decoded: MethodCall = serde_json::from_value(serde_json::to_value(&call).unwrap()).unwrap();
        assert!(decoded.return_value.is_none());
    }

    // ========================================================================
    // Id Generation
    // ========================================================================

    #[test]
    fn test_call_ids_are_monotonic() {
        let generator = CallIdGenerator::new();
        let mut prev = generator.next_id();
        assert_eq!(prev, 1);
        for _ in 0..1000 {
            let id = generator.next_id();
            assert!(id > prev);
            prev = id;
        }
    }

    #[test]
    fn test_compute_id_uniqueness_under_stress() {
        use std::sync::{Arc, Mutex};
        use std::thread;

        let ids = Arc::new(Mutex::new(HashSet::new()));
        let mut handles = vec![];

        for _ in 0..10 {
            let ids_clone = Arc::clone(&ids);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let id = generate_compute_id();
                    let mut ids = ids_clone.lock().unwrap();
                    assert!(ids.insert(id), "Duplicate compute id: {}", id);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(ids.lock().unwrap().len(), 10_000);
    }
}
