// tests/property/invariants_test.rs

//! Drives random operation sequences against the control plane and checks
//! the structural invariants after every step: the freeze counter matches
//! the frozen groups, no group outlives its connection's operational state,
//! and key storage reference counts match the groups holding them.

use crate::common::{self, TestContext};
use ferrobus::core::nodestore::NodeId;
use ferrobus::core::security::Sha256SigningPolicy;
use ferrobus::core::value::Variant;
use ferrobus::{PubSubError, PubSubId, PubSubState};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct GroupEntry {
    id: PubSubId,
    conn: PubSubId,
    security_group_id: Option<String>,
}

#[derive(Debug, Default)]
struct Model {
    connections: Vec<PubSubId>,
    removed_connections: Vec<PubSubId>,
    reader_groups: Vec<GroupEntry>,
    writer_groups: Vec<GroupEntry>,
}

fn security_group_id(index: u8) -> String {
    format!("sg-{}", index % 2)
}

fn apply(ctx: &TestContext, model: &mut Model, node: &NodeId, code: u8, index: u8, flag: bool) {
    let idx = index as usize;
    match code {
        0 => {
            let id = ctx
                .service
                .add_connection(common::connection_config("C"))
                .expect("add connection");
            model.connections.push(id);
        }
        1 | 2 => {
            if model.connections.is_empty() {
                return;
            }
            let conn = model.connections[idx % model.connections.len()];
            let sgid = flag.then(|| security_group_id(index));
            if code == 1 {
                let config = match &sgid {
                    Some(sg) => common::secured_reader_group_config(
                        "G",
                        sg,
                        Arc::new(Sha256SigningPolicy),
                    ),
                    None => common::reader_group_config("G"),
                };
                if let Ok(id) = ctx.service.add_reader_group(conn, config) {
                    model.reader_groups.push(GroupEntry {
                        id,
                        conn,
                        security_group_id: sgid,
                    });
                }
            } else {
                let mut config = common::writer_group_config("W");
                if let Some(sg) = &sgid {
                    config.security_mode = ferrobus::core::topology::SecurityMode::Sign;
                    config.security_group_id = Some(sg.clone());
                    config.security_policy = Some(Arc::new(Sha256SigningPolicy));
                }
                if let Ok(id) = ctx.service.add_writer_group(conn, config) {
                    model.writer_groups.push(GroupEntry {
                        id,
                        conn,
                        security_group_id: sgid,
                    });
                }
            }
        }
        3 => {
            if model.reader_groups.is_empty() {
                return;
            }
            let group = model.reader_groups[idx % model.reader_groups.len()].id;
            let _ = ctx
                .service
                .add_data_set_reader(group, common::reader_config("R", node));
        }
        4 => {
            if model.reader_groups.is_empty() {
                return;
            }
            let group = model.reader_groups[idx % model.reader_groups.len()].id;
            let _ = ctx.service.enable_reader_group(group);
        }
        5 => {
            if model.reader_groups.is_empty() {
                return;
            }
            let group = model.reader_groups[idx % model.reader_groups.len()].id;
            let _ = ctx.service.disable_reader_group(group);
        }
        6 => {
            if model.reader_groups.is_empty() {
                return;
            }
            let group = model.reader_groups[idx % model.reader_groups.len()].id;
            let _ = ctx.service.freeze_reader_group_configuration(group);
        }
        7 => {
            if model.reader_groups.is_empty() {
                return;
            }
            let group = model.reader_groups[idx % model.reader_groups.len()].id;
            let _ = ctx.service.unfreeze_reader_group_configuration(group);
        }
        8 => {
            if model.reader_groups.is_empty() {
                return;
            }
            let slot = idx % model.reader_groups.len();
            let group = model.reader_groups[slot].id;
            if ctx.service.remove_reader_group(group).is_ok() {
                model.reader_groups.remove(slot);
            }
        }
        9 => {
            if model.connections.is_empty() {
                return;
            }
            let slot = idx % model.connections.len();
            let conn = model.connections[slot];
            if ctx.service.remove_connection(conn).is_ok() {
                model.connections.remove(slot);
                model.removed_connections.push(conn);
                model.reader_groups.retain(|g| g.conn != conn);
                model.writer_groups.retain(|g| g.conn != conn);
            }
        }
        10 => {
            ctx.inject_frame(common::frame(7, 1, 1, vec![Variant::UInt32(index as u32)]));
        }
        11 => ctx.event_loop.run_cycle(),
        _ => ctx.event_loop.run_delayed(),
    }
}

fn check_invariants(ctx: &TestContext, model: &Model) -> Result<(), TestCaseError> {
    // Every connection's freeze counter equals its number of frozen groups.
    for conn in &model.connections {
        let info = ctx.service.connection_info(*conn).expect("live connection");
        let frozen_readers = model
            .reader_groups
            .iter()
            .filter(|g| g.conn == *conn)
            .filter(|g| {
                ctx.service
                    .reader_group_info(g.id)
                    .map(|i| i.configuration_frozen)
                    .unwrap_or(false)
            })
            .count();
        let frozen_writers = model
            .writer_groups
            .iter()
            .filter(|g| g.conn == *conn)
            .filter(|g| {
                ctx.service
                    .writer_group_info(g.id)
                    .map(|i| i.configuration_frozen)
                    .unwrap_or(false)
            })
            .count();
        prop_assert_eq!(info.freeze_counter as usize, frozen_readers + frozen_writers);
    }

    // No group runs operational while its connection is disabled or errored.
    for group in model.reader_groups.iter().chain(model.writer_groups.iter()) {
        let state = ctx
            .service
            .get_reader_group_state(group.id)
            .or_else(|_| ctx.service.get_writer_group_state(group.id))
            .expect("live group");
        if state == PubSubState::Operational {
            let conn_state = ctx.service.get_connection_state(group.conn).expect("parent");
            prop_assert!(
                !matches!(conn_state, PubSubState::Disabled | PubSubState::Error),
                "operational group under {} connection",
                conn_state
            );
        }
    }

    // Key storage reference counts match the groups holding each storage.
    let mut expected: HashMap<String, usize> = HashMap::new();
    for group in model.reader_groups.iter().chain(model.writer_groups.iter()) {
        if let Some(sg) = &group.security_group_id {
            *expected.entry(sg.clone()).or_default() += 1;
        }
    }
    for index in 0..2u8 {
        let sg = security_group_id(index);
        let actual = ctx.service.key_storage_reference_count(&sg);
        match expected.get(&sg) {
            Some(count) => prop_assert_eq!(actual, Some(*count)),
            None => prop_assert_eq!(actual, None),
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 500,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_control_plane_invariants(
        ops in prop::collection::vec((0u8..13u8, any::<u8>(), any::<bool>()), 1..60)
    ) {
        let ctx = TestContext::new();
        let node = NodeId::new("ns=1;s=speed");
        ctx.node_store.register_internal(node.clone(), Variant::UInt32(0));
        let mut model = Model::default();

        for (code, index, flag) in ops {
            apply(&ctx, &mut model, &node, code, index, flag);
            check_invariants(&ctx, &model)?;
        }

        // Once the delayed callbacks have run, every removed connection is
        // unreachable and its memory has been reaped.
        ctx.event_loop.run_delayed();
        prop_assert_eq!(ctx.service.pending_delete_count(), 0);
        for conn in &model.removed_connections {
            prop_assert_eq!(
                ctx.service.get_connection_state(*conn).unwrap_err(),
                PubSubError::NotFound
            );
        }
    }
}
