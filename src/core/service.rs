// src/core/service.rs

//! The PubSub service: the owning coordinator for the whole topology.
//!
//! Every mutation — creates, removals, state transitions, freezes, key
//! updates and the periodic receive/publish ticks — runs while holding the
//! service mutex. Internal mutators take `&mut PubSubManager`, so holding
//! the lock is a compile-time property rather than an assertion.

use crate::config::PubSubConfig;
use crate::core::errors::PubSubError;
use crate::core::eventloop::{DelayedWork, EventLoop};
use crate::core::identifier::PubSubId;
use crate::core::message::NetworkMessageCodec;
use crate::core::nodestore::NodeStore;
use crate::core::receive;
use crate::core::state::PubSubState;
use crate::core::topology::{
    ConnectionConfig, DataSetReaderConfig, DataSetWriterConfig, PubSubManager, ReaderGroupConfig,
    TopicAssignment, WriterGroupConfig, connection, reader_group, writer_group,
};
use crate::core::transport::PubSubTransport;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Invoked on every observable state change of a component, with the
/// component identifier, the new state and the cause (`None` = good). The
/// service mutex is held during the call: the application must not re-enter
/// the service synchronously and should post to its own queue instead.
pub type StateChangeCallback = Arc<dyn Fn(PubSubId, PubSubState, Option<PubSubError>) + Send + Sync>;

/// The collaborator bundle and tuning knobs supplied at construction.
pub struct PubSubRuntime {
    pub config: PubSubConfig,
    pub event_loop: Arc<dyn EventLoop>,
    pub transport: Arc<dyn PubSubTransport>,
    pub node_store: Arc<dyn NodeStore>,
    pub codec: Arc<dyn NetworkMessageCodec>,
    pub state_change_callback: Option<StateChangeCallback>,
}

impl fmt::Debug for PubSubRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubRuntime")
            .field("config", &self.config)
            .field("state_change_callback", &self.state_change_callback.is_some())
            .finish_non_exhaustive()
    }
}

/// Diagnostic snapshot of a connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: PubSubId,
    pub name: String,
    pub state: PubSubState,
    pub freeze_counter: u32,
    pub reader_group_count: usize,
    pub writer_group_count: usize,
}

/// Diagnostic snapshot of a reader or writer group.
#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub id: PubSubId,
    pub name: String,
    pub state: PubSubState,
    pub configuration_frozen: bool,
    /// Whether a cyclic callback is currently scheduled.
    pub scheduled: bool,
    pub key_storage: Option<String>,
    pub security_token_id: u32,
    pub nonce_sequence_number: u32,
}

/// Diagnostic snapshot of a dataset reader.
#[derive(Debug, Clone)]
pub struct ReaderInfo {
    pub id: PubSubId,
    pub name: String,
    pub state: PubSubState,
    pub configuration_frozen: bool,
    /// Whether the RT buffered template has been built.
    pub buffered: bool,
}

/// Diagnostic snapshot of a dataset writer.
#[derive(Debug, Clone)]
pub struct WriterInfo {
    pub id: PubSubId,
    pub name: String,
    pub state: PubSubState,
    pub configuration_frozen: bool,
    pub sequence_number: u16,
}

/// The PubSub coordinator. Owns the topology behind the service mutex and
/// exposes the identifier-keyed control-plane API.
#[derive(Debug)]
pub struct PubSubService {
    pub(crate) runtime: PubSubRuntime,
    weak_self: Weak<PubSubService>,
    inner: Mutex<PubSubManager>,
}

impl PubSubService {
    pub fn new(runtime: PubSubRuntime) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            runtime,
            weak_self: weak.clone(),
            inner: Mutex::new(PubSubManager::new()),
        })
    }

    pub(crate) fn weak_self(&self) -> Weak<PubSubService> {
        self.weak_self.clone()
    }

    pub(crate) fn notify_state_change(
        &self,
        id: PubSubId,
        state: PubSubState,
        cause: Option<PubSubError>,
    ) {
        debug!("PubSub component {} changed state to {}.", id, state);
        if let Some(callback) = &self.runtime.state_change_callback {
            callback(id, state, cause);
        }
    }

    // --- Connections ---

    /// Creates a connection from a copy of `config`. The connection starts
    /// disabled; enabling a group drives it up.
    pub fn add_connection(&self, config: ConnectionConfig) -> Result<PubSubId, PubSubError> {
        if config.address.is_empty() {
            return Err(PubSubError::InvalidArgument(
                "connection address must not be empty".to_string(),
            ));
        }
        let mut mgr = self.inner.lock();
        let id = mgr.next_id();
        mgr.connections.insert(0, connection::Connection::new(id, config));
        Ok(id)
    }

    /// Removes a connection: disables it (children observe
    /// `ResourceUnavailable`), unfreezes and removes its groups, closes the
    /// transport channels and frees the memory through a delayed callback on
    /// the connection's event loop, after all in-flight ticks have observed
    /// the removal.
    pub fn remove_connection(&self, id: PubSubId) -> Result<(), PubSubError> {
        let mut mgr = self.inner.lock();
        let Some(ci) = mgr.find_connection(id) else {
            return Err(PubSubError::NotFound);
        };

        {
            let conn = &mut mgr.connections[ci];
            if let Err(e) = connection::set_state(self, conn, PubSubState::Disabled, None) {
                warn!(
                    "Connection '{}' failed to disable during removal: {}",
                    conn.config.name, e
                );
            }
        }

        while let Some(group_id) = mgr.connections[ci].reader_groups.first().map(|g| g.id) {
            reader_group::unfreeze_configuration(&mut mgr.connections[ci], 0);
            if let Err(e) = reader_group::remove(self, &mut mgr, group_id) {
                warn!("Reader group removal failed during connection removal: {}", e);
                break;
            }
        }
        while let Some(group_id) = mgr.connections[ci].writer_groups.first().map(|g| g.id) {
            writer_group::unfreeze_configuration(&mut mgr.connections[ci], 0);
            if let Err(e) = writer_group::remove(self, &mut mgr, group_id) {
                warn!("Writer group removal failed during connection removal: {}", e);
                break;
            }
        }

        let mut conn = mgr.connections.remove(ci);
        conn.delete_flag = true;
        self.runtime.transport.disconnect(&mut conn.channels);
        if !conn.channels.is_drained() {
            debug!(
                "Connection '{}' still has open channels. Deletion is deferred.",
                conn.config.name
            );
        }

        let event_loop = conn
            .config
            .event_loop
            .clone()
            .unwrap_or_else(|| self.runtime.event_loop.clone());
        let conn_id = conn.id;
        mgr.graveyard.push(conn);
        drop(mgr);

        let weak = self.weak_self();
        event_loop.add_delayed_callback(DelayedWork::new(move || {
            if let Some(service) = weak.upgrade() {
                service.reap_connection(conn_id);
            }
        }));
        Ok(())
    }

    fn reap_connection(&self, id: PubSubId) {
        let mut mgr = self.inner.lock();
        let before = mgr.graveyard.len();
        mgr.graveyard.retain(|c| c.id != id);
        if mgr.graveyard.len() < before {
            debug!("Connection {} reaped.", id);
        }
    }

    pub fn get_connection_config(&self, id: PubSubId) -> Result<ConnectionConfig, PubSubError> {
        let mgr = self.inner.lock();
        let ci = mgr.find_connection(id).ok_or(PubSubError::NotFound)?;
        Ok(mgr.connections[ci].config.clone())
    }

    pub fn get_connection_state(&self, id: PubSubId) -> Result<PubSubState, PubSubError> {
        let mgr = self.inner.lock();
        let ci = mgr.find_connection(id).ok_or(PubSubError::NotFound)?;
        Ok(mgr.connections[ci].state)
    }

    pub fn connection_info(&self, id: PubSubId) -> Result<ConnectionInfo, PubSubError> {
        let mgr = self.inner.lock();
        let ci = mgr.find_connection(id).ok_or(PubSubError::NotFound)?;
        let conn = &mgr.connections[ci];
        Ok(ConnectionInfo {
            id: conn.id,
            name: conn.config.name.clone(),
            state: conn.state,
            freeze_counter: conn.freeze_counter,
            reader_group_count: conn.reader_groups.len(),
            writer_group_count: conn.writer_groups.len(),
        })
    }

    /// Number of connections removed but not yet reaped by their delayed
    /// callback.
    pub fn pending_delete_count(&self) -> usize {
        self.inner.lock().graveyard.len()
    }

    /// Broker topics bound to groups on MQTT connections.
    pub fn topic_assignments(&self) -> Vec<TopicAssignment> {
        self.inner.lock().topic_assignments.clone()
    }

    // --- Reader groups ---

    pub fn add_reader_group(
        &self,
        connection_id: PubSubId,
        config: ReaderGroupConfig,
    ) -> Result<PubSubId, PubSubError> {
        let mut mgr = self.inner.lock();
        reader_group::create(self, &mut mgr, connection_id, config)
    }

    pub fn remove_reader_group(&self, id: PubSubId) -> Result<(), PubSubError> {
        let mut mgr = self.inner.lock();
        reader_group::remove(self, &mut mgr, id)
    }

    pub fn get_reader_group_config(&self, id: PubSubId) -> Result<ReaderGroupConfig, PubSubError> {
        let mgr = self.inner.lock();
        let (ci, gi) = mgr.find_reader_group(id).ok_or(PubSubError::NotFound)?;
        Ok(mgr.connections[ci].reader_groups[gi].config.clone())
    }

    pub fn get_reader_group_state(&self, id: PubSubId) -> Result<PubSubState, PubSubError> {
        let mgr = self.inner.lock();
        let (ci, gi) = mgr.find_reader_group(id).ok_or(PubSubError::NotFound)?;
        Ok(mgr.connections[ci].reader_groups[gi].state)
    }

    pub fn reader_group_info(&self, id: PubSubId) -> Result<GroupInfo, PubSubError> {
        let mgr = self.inner.lock();
        let (ci, gi) = mgr.find_reader_group(id).ok_or(PubSubError::NotFound)?;
        let rg = &mgr.connections[ci].reader_groups[gi];
        Ok(GroupInfo {
            id: rg.id,
            name: rg.config.name.clone(),
            state: rg.state,
            configuration_frozen: rg.configuration_frozen,
            scheduled: rg.subscribe_callback_id.is_some(),
            key_storage: rg.key_storage.clone(),
            security_token_id: rg.security_token_id,
            nonce_sequence_number: rg.nonce_sequence_number,
        })
    }

    /// Enables a reader group. A disabled or paused connection is raised to
    /// pre-operational first; its connect attempt may fail, in which case
    /// the group is downgraded to the error state and the connect error is
    /// returned.
    pub fn enable_reader_group(&self, id: PubSubId) -> Result<(), PubSubError> {
        let mut mgr = self.inner.lock();
        let Some((ci, gi)) = mgr.find_reader_group(id) else {
            return Err(PubSubError::NotFound);
        };
        let conn = &mut mgr.connections[ci];
        if matches!(conn.state, PubSubState::Disabled | PubSubState::Paused) {
            connection::set_state(self, conn, PubSubState::PreOperational, None)?;
        }
        reader_group::set_state(self, conn, gi, PubSubState::PreOperational, None)
    }

    pub fn disable_reader_group(&self, id: PubSubId) -> Result<(), PubSubError> {
        let mut mgr = self.inner.lock();
        let Some((ci, gi)) = mgr.find_reader_group(id) else {
            return Err(PubSubError::NotFound);
        };
        reader_group::set_state(
            self,
            &mut mgr.connections[ci],
            gi,
            PubSubState::Disabled,
            Some(PubSubError::ResourceUnavailable),
        )
    }

    /// Commits the group configuration as immutable, enabling the RT
    /// fixed-size fast path when the group requests it.
    pub fn freeze_reader_group_configuration(&self, id: PubSubId) -> Result<(), PubSubError> {
        let mut mgr = self.inner.lock();
        let Some((ci, gi)) = mgr.find_reader_group(id) else {
            return Err(PubSubError::NotFound);
        };
        reader_group::freeze_configuration(self, &mut mgr.connections[ci], gi)
    }

    /// Releases a frozen configuration. An unfrozen group keeps running in
    /// non-RT mode.
    pub fn unfreeze_reader_group_configuration(&self, id: PubSubId) -> Result<(), PubSubError> {
        let mut mgr = self.inner.lock();
        let Some((ci, gi)) = mgr.find_reader_group(id) else {
            return Err(PubSubError::NotFound);
        };
        reader_group::unfreeze_configuration(&mut mgr.connections[ci], gi);
        Ok(())
    }

    pub fn set_reader_group_encryption_keys(
        &self,
        id: PubSubId,
        security_token_id: u32,
        signing_key: &[u8],
        encrypting_key: &[u8],
        key_nonce: &[u8],
    ) -> Result<(), PubSubError> {
        let mut mgr = self.inner.lock();
        let Some((ci, gi)) = mgr.find_reader_group(id) else {
            return Err(PubSubError::NotFound);
        };
        reader_group::set_encryption_keys(
            &mut mgr.connections[ci].reader_groups[gi],
            security_token_id,
            signing_key,
            encrypting_key,
            key_nonce,
        )
    }

    /// Applies the current key of the group's shared key storage.
    pub fn activate_reader_group_key(&self, id: PubSubId) -> Result<(), PubSubError> {
        let mut mgr = self.inner.lock();
        reader_group::activate_key(&mut mgr, id)
    }

    /// Reference count of the key storage for `security_group_id`, when it
    /// exists.
    pub fn key_storage_reference_count(&self, security_group_id: &str) -> Option<usize> {
        self.inner
            .lock()
            .key_storages
            .get(security_group_id)
            .map(|ks| ks.reference_count)
    }

    /// Stores one key generation in the shared storage for
    /// `security_group_id`, typically on behalf of a security key service.
    pub fn add_key_storage_material(
        &self,
        security_group_id: &str,
        material: crate::core::security::KeyMaterial,
    ) -> Result<(), PubSubError> {
        let mut mgr = self.inner.lock();
        let storage = mgr
            .key_storages
            .get_mut(security_group_id)
            .ok_or(PubSubError::NotFound)?;
        storage.push_key(material);
        Ok(())
    }

    /// Makes the key generation with `security_token_id` the current one in
    /// the storage for `security_group_id`.
    pub fn set_key_storage_current(
        &self,
        security_group_id: &str,
        security_token_id: u32,
    ) -> Result<(), PubSubError> {
        let mut mgr = self.inner.lock();
        let storage = mgr
            .key_storages
            .get_mut(security_group_id)
            .ok_or(PubSubError::NotFound)?;
        storage.set_current(security_token_id)
    }

    // --- Dataset readers ---

    pub fn add_data_set_reader(
        &self,
        group_id: PubSubId,
        config: DataSetReaderConfig,
    ) -> Result<PubSubId, PubSubError> {
        let mut mgr = self.inner.lock();
        reader_group::add_reader(self, &mut mgr, group_id, config)
    }

    pub fn remove_data_set_reader(&self, id: PubSubId) -> Result<(), PubSubError> {
        let mut mgr = self.inner.lock();
        reader_group::remove_reader(&mut mgr, id)
    }

    pub fn get_data_set_reader_config(
        &self,
        id: PubSubId,
    ) -> Result<DataSetReaderConfig, PubSubError> {
        let mgr = self.inner.lock();
        let (ci, gi, ri) = mgr.find_data_set_reader(id).ok_or(PubSubError::NotFound)?;
        Ok(mgr.connections[ci].reader_groups[gi].readers[ri].config.clone())
    }

    pub fn get_data_set_reader_state(&self, id: PubSubId) -> Result<PubSubState, PubSubError> {
        let mgr = self.inner.lock();
        let (ci, gi, ri) = mgr.find_data_set_reader(id).ok_or(PubSubError::NotFound)?;
        Ok(mgr.connections[ci].reader_groups[gi].readers[ri].state)
    }

    pub fn data_set_reader_info(&self, id: PubSubId) -> Result<ReaderInfo, PubSubError> {
        let mgr = self.inner.lock();
        let (ci, gi, ri) = mgr.find_data_set_reader(id).ok_or(PubSubError::NotFound)?;
        let reader = &mgr.connections[ci].reader_groups[gi].readers[ri];
        Ok(ReaderInfo {
            id: reader.id,
            name: reader.config.name.clone(),
            state: reader.state,
            configuration_frozen: reader.configuration_frozen,
            buffered: reader.buffered_message.is_ready(),
        })
    }

    // --- Writer groups ---

    pub fn add_writer_group(
        &self,
        connection_id: PubSubId,
        config: WriterGroupConfig,
    ) -> Result<PubSubId, PubSubError> {
        let mut mgr = self.inner.lock();
        writer_group::create(self, &mut mgr, connection_id, config)
    }

    pub fn remove_writer_group(&self, id: PubSubId) -> Result<(), PubSubError> {
        let mut mgr = self.inner.lock();
        writer_group::remove(self, &mut mgr, id)
    }

    pub fn get_writer_group_config(&self, id: PubSubId) -> Result<WriterGroupConfig, PubSubError> {
        let mgr = self.inner.lock();
        let (ci, gi) = mgr.find_writer_group(id).ok_or(PubSubError::NotFound)?;
        Ok(mgr.connections[ci].writer_groups[gi].config.clone())
    }

    pub fn get_writer_group_state(&self, id: PubSubId) -> Result<PubSubState, PubSubError> {
        let mgr = self.inner.lock();
        let (ci, gi) = mgr.find_writer_group(id).ok_or(PubSubError::NotFound)?;
        Ok(mgr.connections[ci].writer_groups[gi].state)
    }

    pub fn writer_group_info(&self, id: PubSubId) -> Result<GroupInfo, PubSubError> {
        let mgr = self.inner.lock();
        let (ci, gi) = mgr.find_writer_group(id).ok_or(PubSubError::NotFound)?;
        let wg = &mgr.connections[ci].writer_groups[gi];
        Ok(GroupInfo {
            id: wg.id,
            name: wg.config.name.clone(),
            state: wg.state,
            configuration_frozen: wg.configuration_frozen,
            scheduled: wg.publish_callback_id.is_some(),
            key_storage: wg.key_storage.clone(),
            security_token_id: wg.security_token_id,
            nonce_sequence_number: wg.nonce_sequence_number,
        })
    }

    /// Enables a writer group; the publisher-side mirror of
    /// [`enable_reader_group`](Self::enable_reader_group).
    pub fn enable_writer_group(&self, id: PubSubId) -> Result<(), PubSubError> {
        let mut mgr = self.inner.lock();
        let Some((ci, gi)) = mgr.find_writer_group(id) else {
            return Err(PubSubError::NotFound);
        };
        let conn = &mut mgr.connections[ci];
        if matches!(conn.state, PubSubState::Disabled | PubSubState::Paused) {
            connection::set_state(self, conn, PubSubState::PreOperational, None)?;
        }
        writer_group::set_state(self, conn, gi, PubSubState::PreOperational, None)
    }

    pub fn disable_writer_group(&self, id: PubSubId) -> Result<(), PubSubError> {
        let mut mgr = self.inner.lock();
        let Some((ci, gi)) = mgr.find_writer_group(id) else {
            return Err(PubSubError::NotFound);
        };
        writer_group::set_state(
            self,
            &mut mgr.connections[ci],
            gi,
            PubSubState::Disabled,
            Some(PubSubError::ResourceUnavailable),
        )
    }

    pub fn freeze_writer_group_configuration(&self, id: PubSubId) -> Result<(), PubSubError> {
        let mut mgr = self.inner.lock();
        let Some((ci, gi)) = mgr.find_writer_group(id) else {
            return Err(PubSubError::NotFound);
        };
        writer_group::freeze_configuration(self, &mut mgr.connections[ci], gi)
    }

    pub fn unfreeze_writer_group_configuration(&self, id: PubSubId) -> Result<(), PubSubError> {
        let mut mgr = self.inner.lock();
        let Some((ci, gi)) = mgr.find_writer_group(id) else {
            return Err(PubSubError::NotFound);
        };
        writer_group::unfreeze_configuration(&mut mgr.connections[ci], gi);
        Ok(())
    }

    pub fn set_writer_group_encryption_keys(
        &self,
        id: PubSubId,
        security_token_id: u32,
        signing_key: &[u8],
        encrypting_key: &[u8],
        key_nonce: &[u8],
    ) -> Result<(), PubSubError> {
        let mut mgr = self.inner.lock();
        let Some((ci, gi)) = mgr.find_writer_group(id) else {
            return Err(PubSubError::NotFound);
        };
        writer_group::set_encryption_keys(
            &mut mgr.connections[ci].writer_groups[gi],
            security_token_id,
            signing_key,
            encrypting_key,
            key_nonce,
        )
    }

    pub fn activate_writer_group_key(&self, id: PubSubId) -> Result<(), PubSubError> {
        let mut mgr = self.inner.lock();
        writer_group::activate_key(&mut mgr, id)
    }

    // --- Dataset writers ---

    pub fn add_data_set_writer(
        &self,
        group_id: PubSubId,
        config: DataSetWriterConfig,
    ) -> Result<PubSubId, PubSubError> {
        let mut mgr = self.inner.lock();
        writer_group::add_writer(self, &mut mgr, group_id, config)
    }

    pub fn remove_data_set_writer(&self, id: PubSubId) -> Result<(), PubSubError> {
        let mut mgr = self.inner.lock();
        writer_group::remove_writer(&mut mgr, id)
    }

    pub fn get_data_set_writer_config(
        &self,
        id: PubSubId,
    ) -> Result<DataSetWriterConfig, PubSubError> {
        let mgr = self.inner.lock();
        let (ci, gi, wi) = mgr.find_data_set_writer(id).ok_or(PubSubError::NotFound)?;
        Ok(mgr.connections[ci].writer_groups[gi].writers[wi].config.clone())
    }

    pub fn get_data_set_writer_state(&self, id: PubSubId) -> Result<PubSubState, PubSubError> {
        let mgr = self.inner.lock();
        let (ci, gi, wi) = mgr.find_data_set_writer(id).ok_or(PubSubError::NotFound)?;
        Ok(mgr.connections[ci].writer_groups[gi].writers[wi].state)
    }

    pub fn data_set_writer_info(&self, id: PubSubId) -> Result<WriterInfo, PubSubError> {
        let mgr = self.inner.lock();
        let (ci, gi, wi) = mgr.find_data_set_writer(id).ok_or(PubSubError::NotFound)?;
        let writer = &mgr.connections[ci].writer_groups[gi].writers[wi];
        Ok(WriterInfo {
            id: writer.id,
            name: writer.config.name.clone(),
            state: writer.state,
            configuration_frozen: writer.configuration_frozen,
            sequence_number: writer.sequence_number,
        })
    }

    // --- Scheduler ticks. Callbacks carry identifiers and re-resolve here
    // under the lock, short-circuiting when the component is gone. ---

    pub(crate) fn subscribe_tick(&self, connection_id: PubSubId, group_id: PubSubId) {
        let mut mgr = self.inner.lock();
        let Some(ci) = mgr.find_connection(connection_id) else {
            return;
        };
        let conn = &mut mgr.connections[ci];
        let Some(gi) = conn.reader_groups.iter().position(|g| g.id == group_id) else {
            return;
        };
        if !conn.reader_groups[gi].state.is_active() {
            return;
        }
        receive::receive_buffered_network_message(self, conn, gi);
    }

    pub(crate) fn publish_tick(&self, connection_id: PubSubId, group_id: PubSubId) {
        let mut mgr = self.inner.lock();
        let Some(ci) = mgr.find_connection(connection_id) else {
            return;
        };
        let conn = &mut mgr.connections[ci];
        let Some(gi) = conn.writer_groups.iter().position(|g| g.id == group_id) else {
            return;
        };
        if !conn.writer_groups[gi].state.is_active() {
            return;
        }
        writer_group::publish_network_message(self, conn, gi);
    }
}
