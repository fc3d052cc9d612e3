// src/core/topology/connection.rs

//! The PubSub connection: a transport-level association to a multicast
//! group, broker, or socket address, and the parent of all groups.

use crate::core::errors::PubSubError;
use crate::core::eventloop::EventLoop;
use crate::core::identifier::PubSubId;
use crate::core::service::PubSubService;
use crate::core::state::PubSubState;
use crate::core::topology::{reader_group, writer_group};
use crate::core::transport::ConnectionChannels;
use crate::core::value::{KeyValueMap, PublisherId};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Connection configuration. Deep-copyable; `clear` releases every owned
/// buffer and is idempotent.
#[derive(Clone, Default)]
pub struct ConnectionConfig {
    pub name: String,
    pub publisher_id: PublisherId,
    pub transport_profile_uri: String,
    pub address: String,
    pub transport_settings: KeyValueMap,
    pub connection_properties: KeyValueMap,
    /// Dedicated event loop for this connection's groups; falls back to the
    /// stack-wide loop when absent.
    pub event_loop: Option<Arc<dyn EventLoop>>,
}

impl ConnectionConfig {
    pub fn new(
        name: impl Into<String>,
        publisher_id: PublisherId,
        transport_profile_uri: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            publisher_id,
            transport_profile_uri: transport_profile_uri.into(),
            address: address.into(),
            ..Default::default()
        }
    }

    /// Releases all owned buffers.
    pub fn clear(&mut self) {
        if let PublisherId::String(s) = &mut self.publisher_id {
            s.clear();
        }
        self.name.clear();
        self.transport_profile_uri.clear();
        self.address.clear();
        self.transport_settings.clear();
        self.connection_properties.clear();
        self.event_loop = None;
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("name", &self.name)
            .field("publisher_id", &self.publisher_id)
            .field("transport_profile_uri", &self.transport_profile_uri)
            .field("address", &self.address)
            .field("transport_settings", &self.transport_settings)
            .field("connection_properties", &self.connection_properties)
            .field("dedicated_event_loop", &self.event_loop.is_some())
            .finish()
    }
}

/// A PubSub connection and its child groups.
#[derive(Debug)]
pub struct Connection {
    pub id: PubSubId,
    pub config: ConnectionConfig,
    pub state: PubSubState,
    /// Number of child groups with a frozen configuration. While non-zero,
    /// no groups may be added or removed.
    pub freeze_counter: u32,
    /// Set once the connection has been unlinked; deferred deletion is
    /// pending and no new children may be attached.
    pub delete_flag: bool,
    pub channels: ConnectionChannels,
    pub reader_groups: Vec<reader_group::ReaderGroup>,
    pub writer_groups: Vec<writer_group::WriterGroup>,
}

impl Connection {
    pub(crate) fn new(id: PubSubId, config: ConnectionConfig) -> Self {
        Self {
            id,
            config,
            state: PubSubState::Disabled,
            freeze_counter: 0,
            delete_flag: false,
            channels: ConnectionChannels::default(),
            reader_groups: Vec::new(),
            writer_groups: Vec::new(),
        }
    }

    /// The event loop serving this connection's groups.
    pub(crate) fn effective_event_loop(&self, svc: &PubSubService) -> Arc<dyn EventLoop> {
        self.config
            .event_loop
            .clone()
            .unwrap_or_else(|| svc.runtime.event_loop.clone())
    }
}

/// Drives the connection state machine.
///
/// Disabling (or erroring/pausing) closes the transport channels and pushes
/// the same state down to every child group with `ResourceUnavailable` as
/// the child cause. Enabling moves Disabled/Paused to PreOperational and
/// attempts to connect; a repeated enable promotes to Operational. The state
/// change is notified before children are touched, so child notifications
/// always follow their cause.
pub(crate) fn set_state(
    svc: &PubSubService,
    conn: &mut Connection,
    target: PubSubState,
    cause: Option<PubSubError>,
) -> Result<(), PubSubError> {
    let old = conn.state;
    match target {
        PubSubState::Disabled | PubSubState::Paused | PubSubState::Error => {
            if old == target {
                return Ok(());
            }
            conn.state = target;
            svc.runtime.transport.disconnect(&mut conn.channels);
            svc.notify_state_change(conn.id, conn.state, cause);

            let child_cause = Some(PubSubError::ResourceUnavailable);
            for gi in 0..conn.reader_groups.len() {
                if let Err(e) =
                    reader_group::set_state(svc, conn, gi, target, child_cause.clone())
                {
                    warn!(
                        "Reader group '{}' failed to follow connection state {}: {}",
                        conn.reader_groups[gi].config.name, target, e
                    );
                }
            }
            for gi in 0..conn.writer_groups.len() {
                if let Err(e) =
                    writer_group::set_state(svc, conn, gi, target, child_cause.clone())
                {
                    warn!(
                        "Writer group '{}' failed to follow connection state {}: {}",
                        conn.writer_groups[gi].config.name, target, e
                    );
                }
            }
            Ok(())
        }
        PubSubState::PreOperational | PubSubState::Operational => {
            // A second enable promotes; the first one only pre-operates
            // until traffic or the caller confirms the link.
            conn.state = if old.is_active() {
                PubSubState::Operational
            } else {
                PubSubState::PreOperational
            };

            if conn.channels.is_drained() {
                match svc.runtime.transport.connect(&conn.config) {
                    Ok(channels) => conn.channels = channels,
                    Err(e) => {
                        warn!(
                            "Connection '{}' failed to connect: {}",
                            conn.config.name, e
                        );
                        conn.state = old;
                        set_state(svc, conn, PubSubState::Error, Some(e.clone()))?;
                        return Err(e);
                    }
                }
            }

            if conn.state != old {
                svc.notify_state_change(conn.id, conn.state, cause);
            }
            Ok(())
        }
    }
}
