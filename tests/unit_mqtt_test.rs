// tests/unit_mqtt_test.rs

mod common;

use common::{TestContext, reader_group_config, writer_group_config};
use ferrobus::core::topology::{ConnectionConfig, MQTT_TRANSPORT_PROFILE, QUEUE_NAME_PROPERTY};
use ferrobus::core::value::{PublisherId, Variant};

fn mqtt_connection_config() -> ConnectionConfig {
    ConnectionConfig::new(
        "broker",
        PublisherId::UInt16(7),
        MQTT_TRANSPORT_PROFILE,
        "mqtt://broker.local:1883",
    )
}

#[test]
fn test_mqtt_group_registers_topic_assignment() {
    let ctx = TestContext::new();
    let conn = ctx.service.add_connection(mqtt_connection_config()).unwrap();

    let mut config = reader_group_config("G");
    config.transport_settings.insert(
        QUEUE_NAME_PROPERTY.to_string(),
        Variant::String("plant/line1/speed".to_string()),
    );
    let group = ctx.service.add_reader_group(conn, config).unwrap();

    let assignments = ctx.service.topic_assignments();
    assert_eq!(assignments.len(), 1);
    assert_eq!(assignments[0].group_id, group);
    assert_eq!(assignments[0].topic, "plant/line1/speed");
}

#[test]
fn test_mqtt_group_without_queue_name_has_no_assignment() {
    let ctx = TestContext::new();
    let conn = ctx.service.add_connection(mqtt_connection_config()).unwrap();

    ctx.service
        .add_reader_group(conn, reader_group_config("G"))
        .unwrap();
    assert!(ctx.service.topic_assignments().is_empty());
}

#[test]
fn test_removing_group_releases_topic_assignment() {
    let ctx = TestContext::new();
    let conn = ctx.service.add_connection(mqtt_connection_config()).unwrap();

    let mut config = writer_group_config("W");
    config.transport_settings.insert(
        QUEUE_NAME_PROPERTY.to_string(),
        Variant::String("plant/line1/out".to_string()),
    );
    let group = ctx.service.add_writer_group(conn, config).unwrap();
    assert_eq!(ctx.service.topic_assignments().len(), 1);

    ctx.service.remove_writer_group(group).unwrap();
    assert!(ctx.service.topic_assignments().is_empty());
}

#[test]
fn test_udp_connection_has_no_topic_assignment() {
    let ctx = TestContext::new();
    let conn = ctx
        .service
        .add_connection(common::connection_config("C"))
        .unwrap();
    ctx.service
        .add_reader_group(conn, reader_group_config("G"))
        .unwrap();
    assert!(ctx.service.topic_assignments().is_empty());
}
