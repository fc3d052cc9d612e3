// tests/unit_writer_group_test.rs

mod common;

use common::{ADDRESS, TestContext, connection_config, writer_config, writer_group_config};
use ferrobus::core::message::{JsonNetworkMessageCodec, NetworkMessageCodec};
use ferrobus::core::nodestore::{NodeId, NodeStore};
use ferrobus::core::topology::{RtLevel, WriterGroupConfig};
use ferrobus::core::value::{PublisherId, Variant};
use ferrobus::{PubSubError, PubSubState};

fn decode(frame: &bytes::Bytes) -> ferrobus::core::message::NetworkMessage {
    let codec = JsonNetworkMessageCodec;
    let mut pos = 0;
    let mut nm = codec.decode_headers(frame, &mut pos).unwrap();
    codec.decode_payload(frame, &mut pos, &mut nm).unwrap();
    codec.decode_footers(frame, &mut pos, &mut nm).unwrap();
    nm
}

#[test]
fn test_enable_publishes_immediately_and_promotes() {
    let ctx = TestContext::new();
    let conn = ctx.service.add_connection(connection_config("C")).unwrap();
    let group = ctx
        .service
        .add_writer_group(conn, writer_group_config("W"))
        .unwrap();
    let node = NodeId::new("ns=1;s=speed");
    ctx.node_store.register_internal(node.clone(), Variant::UInt32(88));
    let writer = ctx
        .service
        .add_data_set_writer(group, writer_config("DSW", &node))
        .unwrap();

    ctx.service.enable_writer_group(group).unwrap();

    // One synchronous publish ran at registration and promoted the group.
    let frames = ctx.transport.sent_frames(ADDRESS);
    assert_eq!(frames.len(), 1);
    assert_eq!(
        ctx.service.get_writer_group_state(group).unwrap(),
        PubSubState::Operational
    );
    assert_eq!(
        ctx.service.get_data_set_writer_state(writer).unwrap(),
        PubSubState::Operational
    );

    let nm = decode(&frames[0]);
    assert_eq!(nm.publisher_id, Some(PublisherId::UInt16(7)));
    assert_eq!(nm.writer_group_id, Some(1));
    assert_eq!(nm.messages.len(), 1);
    assert_eq!(nm.messages[0].data_set_writer_id, 1);
    assert_eq!(nm.messages[0].sequence_number, 1);
    assert_eq!(nm.messages[0].fields, vec![Variant::UInt32(88)]);
}

#[test]
fn test_cyclic_publish_increments_sequence_number() {
    let ctx = TestContext::new();
    let conn = ctx.service.add_connection(connection_config("C")).unwrap();
    let group = ctx
        .service
        .add_writer_group(conn, writer_group_config("W"))
        .unwrap();
    let node = NodeId::new("ns=1;s=speed");
    ctx.node_store.register_internal(node.clone(), Variant::UInt32(1));
    ctx.service
        .add_data_set_writer(group, writer_config("DSW", &node))
        .unwrap();
    ctx.service.enable_writer_group(group).unwrap();

    ctx.node_store.write_value(&node, Variant::UInt32(2)).unwrap();
    ctx.event_loop.run_cycle();

    let frames = ctx.transport.sent_frames(ADDRESS);
    assert_eq!(frames.len(), 2);
    let nm = decode(&frames[1]);
    assert_eq!(nm.messages[0].sequence_number, 2);
    assert_eq!(nm.messages[0].fields, vec![Variant::UInt32(2)]);
}

#[test]
fn test_publish_without_sources_stays_preoperational() {
    let ctx = TestContext::new();
    let conn = ctx.service.add_connection(connection_config("C")).unwrap();
    let group = ctx
        .service
        .add_writer_group(conn, writer_group_config("W"))
        .unwrap();
    // The writer's source node is never registered.
    let node = NodeId::new("ns=1;s=missing");
    ctx.service
        .add_data_set_writer(group, writer_config("DSW", &node))
        .unwrap();

    ctx.service.enable_writer_group(group).unwrap();

    assert!(ctx.transport.sent_frames(ADDRESS).is_empty());
    assert_eq!(
        ctx.service.get_writer_group_state(group).unwrap(),
        PubSubState::PreOperational
    );
}

#[test]
fn test_disable_cancels_publish_callback() {
    let ctx = TestContext::new();
    let conn = ctx.service.add_connection(connection_config("C")).unwrap();
    let group = ctx
        .service
        .add_writer_group(conn, writer_group_config("W"))
        .unwrap();
    let node = NodeId::new("ns=1;s=speed");
    ctx.node_store.register_internal(node.clone(), Variant::UInt32(1));
    ctx.service
        .add_data_set_writer(group, writer_config("DSW", &node))
        .unwrap();
    ctx.service.enable_writer_group(group).unwrap();
    assert_eq!(ctx.event_loop.cyclic_count(), 1);

    ctx.service.disable_writer_group(group).unwrap();

    assert_eq!(ctx.event_loop.cyclic_count(), 0);
    assert!(!ctx.service.writer_group_info(group).unwrap().scheduled);
    let sent_before = ctx.transport.sent_frames(ADDRESS).len();
    ctx.event_loop.run_cycle();
    assert_eq!(ctx.transport.sent_frames(ADDRESS).len(), sent_before);
}

#[test]
fn test_writer_freeze_round_trip() {
    let ctx = TestContext::new();
    let conn = ctx.service.add_connection(connection_config("C")).unwrap();
    let config = WriterGroupConfig {
        rt_level: RtLevel::FixedSize,
        ..writer_group_config("W")
    };
    let group = ctx.service.add_writer_group(conn, config).unwrap();
    let node = NodeId::new("ns=1;s=speed");
    let cell = ctx.node_store.register_external(node.clone(), Variant::UInt32(10));
    ctx.service
        .add_data_set_writer(group, writer_config("DSW", &node))
        .unwrap();

    ctx.service.freeze_writer_group_configuration(group).unwrap();
    assert_eq!(ctx.service.connection_info(conn).unwrap().freeze_counter, 1);
    assert!(ctx.service.writer_group_info(group).unwrap().configuration_frozen);

    // The first publish after the freeze records the buffered template,
    // reading through the cached external cell.
    ctx.service.enable_writer_group(group).unwrap();
    *cell.write() = Variant::UInt32(11);
    ctx.event_loop.run_cycle();
    assert_eq!(
        ctx.service.get_writer_group_state(group).unwrap(),
        PubSubState::Operational
    );
    let frames = ctx.transport.sent_frames(ADDRESS);
    let nm = decode(frames.last().unwrap());
    assert_eq!(nm.messages[0].fields, vec![Variant::UInt32(11)]);

    ctx.service.unfreeze_writer_group_configuration(group).unwrap();
    assert_eq!(ctx.service.connection_info(conn).unwrap().freeze_counter, 0);
    assert!(!ctx.service.writer_group_info(group).unwrap().configuration_frozen);
}

#[test]
fn test_writer_freeze_rejects_string_publisher_id() {
    let ctx = TestContext::new();
    let mut conn_config = connection_config("C");
    conn_config.publisher_id = PublisherId::String("pub".to_string());
    let conn = ctx.service.add_connection(conn_config).unwrap();
    let config = WriterGroupConfig {
        rt_level: RtLevel::FixedSize,
        ..writer_group_config("W")
    };
    let group = ctx.service.add_writer_group(conn, config).unwrap();
    let node = NodeId::new("ns=1;s=speed");
    ctx.node_store.register_external(node.clone(), Variant::UInt32(0));
    ctx.service
        .add_data_set_writer(group, writer_config("DSW", &node))
        .unwrap();

    let err = ctx
        .service
        .freeze_writer_group_configuration(group)
        .unwrap_err();
    assert!(matches!(err, PubSubError::NotSupported(_)));
    assert_eq!(ctx.service.connection_info(conn).unwrap().freeze_counter, 0);
}
