// src/core/receive.rs

//! The subscribe-side receive path: drain the connection's transport
//! channels, decode each frame in stages, and dispatch the contained
//! DataSetMessages to matching readers.

use crate::core::message::NetworkMessage;
use crate::core::service::PubSubService;
use crate::core::state::PubSubState;
use crate::core::topology::{Connection, RtLevel, connection, data_set_reader, reader_group};
use bytes::Bytes;
use tracing::{debug, warn};

/// One subscribe tick for a reader group: reads all buffered frames from
/// the connection with the group's timeout and processes them in arrival
/// order. Decode and match failures are logged and dropped; the scheduler
/// keeps running.
pub(crate) fn receive_buffered_network_message(
    svc: &PubSubService,
    conn: &mut Connection,
    gi: usize,
) {
    let timeout = conn.reader_groups[gi].config.timeout;
    let mut channels = std::mem::take(&mut conn.channels);
    let result = svc.runtime.transport.receive(&mut channels, timeout);
    conn.channels = channels;

    let frames = match result {
        Ok(frames) => frames,
        Err(e) => {
            warn!(
                "PubSub receive failed on connection '{}': {}",
                conn.config.name, e
            );
            return;
        }
    };

    for buffer in frames {
        decode_and_dispatch(svc, conn, &buffer);
    }
}

fn decode_and_dispatch(svc: &PubSubService, conn: &mut Connection, buffer: &Bytes) {
    let mut pos = 0usize;
    let mut nm = match svc.runtime.codec.decode_headers(buffer, &mut pos) {
        Ok(nm) => nm,
        Err(e) => {
            warn!("PubSub receive. Decoding headers failed: {}", e);
            return;
        }
    };

    // Pick a reader group to verify and decrypt this message when any group
    // under the connection is secured. The first reader accepting the
    // header identifiers selects its group; one successful verification
    // ends the search.
    let any_secured = conn
        .reader_groups
        .iter()
        .any(|g| g.config.security_policy.is_some());
    if any_secured {
        match select_group_for_verification(conn, &nm) {
            Some(gi) => {
                let rg = &conn.reader_groups[gi];
                if rg.config.security_policy.is_some() {
                    let Some(ctx) = &rg.security_context else {
                        warn!(
                            "Reader group '{}' has no security keys installed. \
                             Dropping the frame.",
                            rg.config.name
                        );
                        return;
                    };
                    if let Err(e) = ctx.verify_and_decrypt(buffer, &mut nm) {
                        warn!(
                            "Subscribe failed. Verify and decrypt network message \
                             failed: {}",
                            e
                        );
                        return;
                    }
                }
            }
            // Multicast scenario: every connection in the group receives all
            // network messages, so a frame without a matching reader is not
            // an error. Continue decoding; it may still deliver to a
            // non-secured reader.
            None => debug!(
                "No dataset reader matched the received message. Check \
                 PublisherId, WriterGroupId and DataSetWriterId."
            ),
        }
    }

    if let Err(e) = svc.runtime.codec.decode_payload(buffer, &mut pos, &mut nm) {
        warn!("PubSub receive. Decoding payload failed: {}", e);
        return;
    }
    if let Err(e) = svc.runtime.codec.decode_footers(buffer, &mut pos, &mut nm) {
        warn!("PubSub receive. Decoding footers failed: {}", e);
        return;
    }

    dispatch(svc, conn, &nm);
}

fn select_group_for_verification(conn: &Connection, nm: &NetworkMessage) -> Option<usize> {
    conn.reader_groups.iter().position(|g| {
        g.readers
            .iter()
            .any(|reader| reader.matches_network_message(nm))
    })
}

/// Delivers every contained DataSetMessage to the reader matching its
/// `(publisher id, writer group id, dataset writer id)` triple. The first
/// delivery promotes a pre-operational group (building the buffered
/// template first when the configuration is frozen).
fn dispatch(svc: &PubSubService, conn: &mut Connection, nm: &NetworkMessage) {
    for dsm in &nm.messages {
        let mut matched = None;
        'groups: for (gi, group) in conn.reader_groups.iter().enumerate() {
            if !group.state.is_active() {
                continue;
            }
            for (ri, reader) in group.readers.iter().enumerate() {
                if reader.matches_network_message(nm) && reader.matches_data_set_message(dsm) {
                    matched = Some((gi, ri));
                    break 'groups;
                }
            }
        }
        let Some((gi, ri)) = matched else {
            continue;
        };

        let rt_fixed = conn.reader_groups[gi].config.rt_level == RtLevel::FixedSize;
        {
            let reader = &mut conn.reader_groups[gi].readers[ri];
            if rt_fixed && reader.configuration_frozen && !reader.buffered_message.is_ready() {
                reader.buffered_message.network_message = Some(nm.clone());
            }
        }

        data_set_reader::process_data_set_message(svc, &conn.reader_groups[gi].readers[ri], dsm);

        if conn.reader_groups[gi].state == PubSubState::PreOperational {
            if let Err(e) =
                reader_group::set_state(svc, conn, gi, PubSubState::Operational, None)
            {
                debug!("Reader group promotion failed: {}", e);
            }
        }
        if conn.state == PubSubState::PreOperational {
            let _ = connection::set_state(svc, conn, PubSubState::Operational, None);
        }
    }
}
