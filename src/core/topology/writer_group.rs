// src/core/topology/writer_group.rs

//! The WriterGroup: a set of DataSetWriters under one connection with a
//! common publish cadence, freeze state and security context. The mirror of
//! the reader group, with the subscribe callback replaced by a publish
//! callback.

use crate::core::errors::PubSubError;
use crate::core::eventloop::{CallbackId, CycleMissPolicy, CyclicCallback, SchedulerHook};
use crate::core::identifier::PubSubId;
use crate::core::message::{DataSetMessage, NetworkMessage, NetworkMessageContentFlags};
use crate::core::nodestore::ValueBackend;
use crate::core::security::{PolicyContext, SecurityPolicy};
use crate::core::service::PubSubService;
use crate::core::state::PubSubState;
use crate::core::topology::{
    BufferedMessage, Connection, EncodingMimeType, MessageSettings, PubSubManager, RtLevel,
    SecurityMode, connection, data_set_writer, reader_group, validate_rt_field,
};
use crate::core::topology::data_set_writer::{DataSetWriter, DataSetWriterConfig};
use crate::core::value::KeyValueMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// WriterGroup configuration. Deep-copyable; `clear` releases every owned
/// buffer and is idempotent.
#[derive(Clone, Default)]
pub struct WriterGroupConfig {
    pub name: String,
    pub writer_group_id: u16,
    /// Publish cadence. Values of zero are clamped to the stack default at
    /// creation time.
    pub publishing_interval: Duration,
    pub encoding_mime_type: EncodingMimeType,
    pub rt_level: RtLevel,
    pub security_mode: SecurityMode,
    pub security_group_id: Option<String>,
    pub security_policy: Option<Arc<dyn SecurityPolicy>>,
    pub group_properties: KeyValueMap,
    pub transport_settings: KeyValueMap,
    pub scheduler_hook: Option<Arc<dyn SchedulerHook>>,
}

impl WriterGroupConfig {
    /// Releases all owned buffers.
    pub fn clear(&mut self) {
        self.name.clear();
        self.group_properties.clear();
        self.transport_settings.clear();
        self.security_group_id = None;
    }
}

impl fmt::Debug for WriterGroupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterGroupConfig")
            .field("name", &self.name)
            .field("writer_group_id", &self.writer_group_id)
            .field("publishing_interval", &self.publishing_interval)
            .field("encoding_mime_type", &self.encoding_mime_type)
            .field("rt_level", &self.rt_level)
            .field("security_mode", &self.security_mode)
            .field("security_group_id", &self.security_group_id)
            .field("security_policy", &self.security_policy.as_ref().map(|p| p.uri()))
            .field("group_properties", &self.group_properties)
            .field("transport_settings", &self.transport_settings)
            .field("scheduler_hook", &self.scheduler_hook.is_some())
            .finish()
    }
}

/// A writer group and its child writers.
pub struct WriterGroup {
    pub id: PubSubId,
    pub config: WriterGroupConfig,
    pub state: PubSubState,
    pub configuration_frozen: bool,
    /// Present exactly while a cyclic publish callback is scheduled.
    pub publish_callback_id: Option<CallbackId>,
    pub security_token_id: u32,
    pub nonce_sequence_number: u32,
    pub security_context: Option<Box<dyn PolicyContext>>,
    /// Security group id of the attached shared key storage.
    pub key_storage: Option<String>,
    pub buffered_message: BufferedMessage,
    pub writers: Vec<DataSetWriter>,
}

impl WriterGroup {
    pub(crate) fn new(id: PubSubId, config: WriterGroupConfig) -> Self {
        Self {
            id,
            config,
            state: PubSubState::Disabled,
            configuration_frozen: false,
            publish_callback_id: None,
            security_token_id: 0,
            nonce_sequence_number: 0,
            security_context: None,
            key_storage: None,
            buffered_message: BufferedMessage::default(),
            writers: Vec::new(),
        }
    }
}

impl fmt::Debug for WriterGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterGroup")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("state", &self.state)
            .field("configuration_frozen", &self.configuration_frozen)
            .field("publish_callback_id", &self.publish_callback_id)
            .field("security_token_id", &self.security_token_id)
            .field("key_storage", &self.key_storage)
            .field("writers", &self.writers)
            .finish()
    }
}

/// Creates a writer group under `connection_id`.
pub(crate) fn create(
    svc: &PubSubService,
    mgr: &mut PubSubManager,
    connection_id: PubSubId,
    config: WriterGroupConfig,
) -> Result<PubSubId, PubSubError> {
    let Some(ci) = mgr.find_connection(connection_id) else {
        return Err(PubSubError::NotFound);
    };
    if mgr.connections[ci].freeze_counter > 0 {
        warn!("Adding writer group failed. Connection configuration is frozen.");
        return Err(PubSubError::ConfigurationError(
            "connection configuration is frozen".to_string(),
        ));
    }

    let mut config = config;
    if config.publishing_interval.is_zero() {
        config.publishing_interval = svc.runtime.config.default_publishing_interval;
    }

    let id = mgr.next_id();

    let mut key_storage = None;
    if config.security_mode.is_secured() {
        if let (Some(sgid), Some(policy)) = (&config.security_group_id, &config.security_policy) {
            if !sgid.is_empty() {
                let sgid = sgid.clone();
                let uri = policy.uri().to_string();
                mgr.attach_key_storage(&sgid, &uri);
                key_storage = Some(sgid);
            }
        }
    }

    reader_group::register_topic_assignment(mgr, ci, id, &config.transport_settings, &config.name);

    let mut group = WriterGroup::new(id, config);
    group.key_storage = key_storage;
    mgr.connections[ci].writer_groups.insert(0, group);
    Ok(id)
}

/// Removes a writer group: cancels its callback, releases the security
/// context and key storage reference, and unlinks it from the connection.
pub(crate) fn remove(
    svc: &PubSubService,
    mgr: &mut PubSubManager,
    group_id: PubSubId,
) -> Result<(), PubSubError> {
    let Some((ci, gi)) = mgr.find_writer_group(group_id) else {
        return Err(PubSubError::NotFound);
    };
    if mgr.connections[ci].writer_groups[gi].configuration_frozen {
        warn!("Remove writer group failed. Publisher configuration is frozen.");
        return Err(PubSubError::ConfigurationError(
            "writer group configuration is frozen".to_string(),
        ));
    }

    remove_publish_callback(svc, &mut mgr.connections[ci], gi);

    let detached = {
        let wg = &mut mgr.connections[ci].writer_groups[gi];
        wg.security_context = None;
        wg.key_storage.take()
    };
    if let Some(sgid) = detached {
        mgr.detach_key_storage(&sgid);
    }

    mgr.topic_assignments.retain(|t| t.group_id != group_id);
    mgr.connections[ci].writer_groups.remove(gi);
    Ok(())
}

/// Adds a writer to a group. Writers created under an active group start
/// pre-operational immediately.
pub(crate) fn add_writer(
    svc: &PubSubService,
    mgr: &mut PubSubManager,
    group_id: PubSubId,
    config: DataSetWriterConfig,
) -> Result<PubSubId, PubSubError> {
    let Some((ci, gi)) = mgr.find_writer_group(group_id) else {
        return Err(PubSubError::NotFound);
    };
    if mgr.connections[ci].writer_groups[gi].configuration_frozen {
        return Err(PubSubError::ConfigurationError(
            "writer group configuration is frozen".to_string(),
        ));
    }

    let id = mgr.next_id();
    let mut writer = DataSetWriter::new(id, config);
    if mgr.connections[ci].writer_groups[gi].state.is_active() {
        if let Err(e) =
            data_set_writer::set_state(svc, &mut writer, PubSubState::PreOperational, None)
        {
            warn!("New writer failed to enter pre-operational state: {}", e);
        }
    }
    mgr.connections[ci].writer_groups[gi].writers.insert(0, writer);
    Ok(id)
}

pub(crate) fn remove_writer(
    mgr: &mut PubSubManager,
    writer_id: PubSubId,
) -> Result<(), PubSubError> {
    let Some((ci, gi, wi)) = mgr.find_data_set_writer(writer_id) else {
        return Err(PubSubError::NotFound);
    };
    if mgr.connections[ci].writer_groups[gi].configuration_frozen {
        return Err(PubSubError::ConfigurationError(
            "writer group configuration is frozen".to_string(),
        ));
    }
    mgr.connections[ci].writer_groups[gi].writers.remove(wi);
    Ok(())
}

// --- State machine ---

/// Drives the writer group state machine; the mirror of the reader group's.
pub(crate) fn set_state(
    svc: &PubSubService,
    conn: &mut Connection,
    gi: usize,
    target: PubSubState,
    cause: Option<PubSubError>,
) -> Result<(), PubSubError> {
    match target {
        PubSubState::Disabled => to_disabled(svc, conn, gi, cause),
        PubSubState::Paused => to_paused(svc, conn, gi, cause),
        PubSubState::PreOperational => to_preoperational(svc, conn, gi, cause),
        PubSubState::Operational => to_operational(svc, conn, gi, cause),
        PubSubState::Error => to_error(svc, conn, gi, cause),
    }
}

fn propagate_to_writers(
    svc: &PubSubService,
    conn: &mut Connection,
    gi: usize,
    target: PubSubState,
    cause: Option<PubSubError>,
) {
    for wi in 0..conn.writer_groups[gi].writers.len() {
        if let Err(e) = data_set_writer::set_state(
            svc,
            &mut conn.writer_groups[gi].writers[wi],
            target,
            cause.clone(),
        ) {
            warn!(
                "Writer '{}' failed to follow group state {}: {}",
                conn.writer_groups[gi].writers[wi].config.name, target, e
            );
        }
    }
}

fn to_disabled(
    svc: &PubSubService,
    conn: &mut Connection,
    gi: usize,
    cause: Option<PubSubError>,
) -> Result<(), PubSubError> {
    let wg = &mut conn.writer_groups[gi];
    match wg.state {
        PubSubState::Disabled | PubSubState::Error => Ok(()),
        PubSubState::Paused => {
            wg.state = PubSubState::Disabled;
            let id = wg.id;
            svc.notify_state_change(id, PubSubState::Disabled, cause);
            Ok(())
        }
        PubSubState::PreOperational | PubSubState::Operational => {
            remove_publish_callback(svc, conn, gi);
            let wg = &mut conn.writer_groups[gi];
            wg.state = PubSubState::Disabled;
            let id = wg.id;
            svc.notify_state_change(id, PubSubState::Disabled, cause.clone());
            propagate_to_writers(svc, conn, gi, PubSubState::Disabled, cause);
            Ok(())
        }
    }
}

fn to_paused(
    svc: &PubSubService,
    conn: &mut Connection,
    gi: usize,
    cause: Option<PubSubError>,
) -> Result<(), PubSubError> {
    let wg = &mut conn.writer_groups[gi];
    debug!("Writer group '{}': the paused state is unsupported.", wg.config.name);
    match wg.state {
        PubSubState::Disabled => {
            wg.state = PubSubState::Paused;
            let id = wg.id;
            svc.notify_state_change(id, PubSubState::Paused, cause);
            Ok(())
        }
        PubSubState::Paused => Ok(()),
        _ => Err(PubSubError::NotSupported(
            "paused writer groups are not supported".to_string(),
        )),
    }
}

fn to_preoperational(
    svc: &PubSubService,
    conn: &mut Connection,
    gi: usize,
    cause: Option<PubSubError>,
) -> Result<(), PubSubError> {
    match conn.writer_groups[gi].state {
        PubSubState::Disabled | PubSubState::Paused => {
            let wg = &mut conn.writer_groups[gi];
            wg.state = PubSubState::PreOperational;
            let id = wg.id;
            svc.notify_state_change(id, PubSubState::PreOperational, cause.clone());
            propagate_to_writers(svc, conn, gi, PubSubState::PreOperational, cause);
            add_publish_callback(svc, conn, gi)
        }
        PubSubState::PreOperational | PubSubState::Operational => Ok(()),
        PubSubState::Error => Err(PubSubError::NotSupported(
            "writer group is in the error state".to_string(),
        )),
    }
}

fn to_operational(
    svc: &PubSubService,
    conn: &mut Connection,
    gi: usize,
    cause: Option<PubSubError>,
) -> Result<(), PubSubError> {
    let wg = &conn.writer_groups[gi];
    let next = if wg.writers.is_empty()
        || (wg.config.rt_level == RtLevel::FixedSize
            && wg.configuration_frozen
            && !wg.buffered_message.is_ready())
    {
        PubSubState::PreOperational
    } else {
        PubSubState::Operational
    };

    match wg.state {
        PubSubState::PreOperational | PubSubState::Operational => {
            let old = wg.state;
            let id = wg.id;
            conn.writer_groups[gi].state = next;
            if next != old {
                svc.notify_state_change(id, next, cause.clone());
            }
            propagate_to_writers(svc, conn, gi, next, cause);
            Ok(())
        }
        other => Err(PubSubError::NotSupported(format!(
            "cannot become operational from {other}"
        ))),
    }
}

fn to_error(
    svc: &PubSubService,
    conn: &mut Connection,
    gi: usize,
    cause: Option<PubSubError>,
) -> Result<(), PubSubError> {
    match conn.writer_groups[gi].state {
        PubSubState::Error => Ok(()),
        PubSubState::Disabled | PubSubState::Paused => {
            let wg = &mut conn.writer_groups[gi];
            wg.state = PubSubState::Error;
            let id = wg.id;
            svc.notify_state_change(id, PubSubState::Error, cause);
            Ok(())
        }
        PubSubState::PreOperational | PubSubState::Operational => {
            remove_publish_callback(svc, conn, gi);
            let wg = &mut conn.writer_groups[gi];
            wg.state = PubSubState::Error;
            let id = wg.id;
            svc.notify_state_change(id, PubSubState::Error, cause.clone());
            propagate_to_writers(svc, conn, gi, PubSubState::Error, cause);
            Ok(())
        }
    }
}

// --- Publish scheduler ---

/// Registers the cyclic publish callback and runs one publish immediately.
fn add_publish_callback(
    svc: &PubSubService,
    conn: &mut Connection,
    gi: usize,
) -> Result<(), PubSubError> {
    if conn.writer_groups[gi].publish_callback_id.is_some() {
        return Err(PubSubError::Internal(
            "publish callback already registered".to_string(),
        ));
    }

    let interval = conn.writer_groups[gi].config.publishing_interval;
    let weak = svc.weak_self();
    let connection_id = conn.id;
    let group_id = conn.writer_groups[gi].id;
    let callback: CyclicCallback = Arc::new(move || {
        if let Some(service) = weak.upgrade() {
            service.publish_tick(connection_id, group_id);
        }
    });

    let id = match &conn.writer_groups[gi].config.scheduler_hook {
        Some(hook) => hook.add_cyclic(callback, interval)?,
        None => conn.effective_event_loop(svc).add_cyclic_callback(
            callback,
            interval,
            None,
            CycleMissPolicy::CurrentTime,
        )?,
    };
    conn.writer_groups[gi].publish_callback_id = Some(id);

    publish_network_message(svc, conn, gi);
    Ok(())
}

pub(crate) fn remove_publish_callback(svc: &PubSubService, conn: &mut Connection, gi: usize) {
    if let Some(id) = conn.writer_groups[gi].publish_callback_id.take() {
        match &conn.writer_groups[gi].config.scheduler_hook {
            Some(hook) => hook.remove_cyclic(id),
            None => conn.effective_event_loop(svc).remove_cyclic_callback(id),
        }
    }
}

/// Gathers every writer's dataset, encodes one NetworkMessage and sends it
/// on the connection's send channel. The first successful publish promotes a
/// pre-operational group (and records the buffered template when frozen).
pub(crate) fn publish_network_message(svc: &PubSubService, conn: &mut Connection, gi: usize) {
    let writer_group_id = conn.writer_groups[gi].config.writer_group_id;

    let mut messages = Vec::new();
    for wi in 0..conn.writer_groups[gi].writers.len() {
        let writer = &mut conn.writer_groups[gi].writers[wi];
        if !writer.state.is_active() {
            continue;
        }

        let mut fields = Vec::with_capacity(writer.config.published_fields.len());
        let mut complete = true;
        for field in &writer.config.published_fields {
            let value = if let Some(cell) = &field.external_value {
                cell.read().clone()
            } else {
                match svc.runtime.node_store.read_value(&field.source_node) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(
                            "Writer '{}' failed to read source '{}': {}",
                            writer.config.name, field.source_node, e
                        );
                        complete = false;
                        break;
                    }
                }
            };
            fields.push(value);
        }
        if !complete {
            continue;
        }

        writer.sequence_number = writer.sequence_number.wrapping_add(1);
        messages.push(DataSetMessage {
            data_set_writer_id: writer.config.data_set_writer_id,
            sequence_number: writer.sequence_number,
            fields,
        });
    }

    if messages.is_empty() {
        return;
    }

    let nm = NetworkMessage {
        content: NetworkMessageContentFlags::PUBLISHER_ID
            | NetworkMessageContentFlags::WRITER_GROUP_ID
            | NetworkMessageContentFlags::PAYLOAD_HEADER,
        publisher_id: Some(conn.config.publisher_id.clone()),
        writer_group_id: Some(writer_group_id),
        security: None,
        messages,
    };

    let payload = match svc.runtime.codec.encode(&nm) {
        Ok(p) => p,
        Err(e) => {
            warn!(
                "Writer group '{}' failed to encode: {}",
                conn.writer_groups[gi].config.name, e
            );
            let _ = set_state(svc, conn, gi, PubSubState::Error, Some(e));
            return;
        }
    };
    if let Err(e) = svc.runtime.transport.send(&conn.channels, payload) {
        warn!(
            "Writer group '{}' failed to publish: {}",
            conn.writer_groups[gi].config.name, e
        );
        let _ = set_state(svc, conn, gi, PubSubState::Error, Some(e));
        return;
    }

    let wg = &mut conn.writer_groups[gi];
    if wg.config.rt_level == RtLevel::FixedSize
        && wg.configuration_frozen
        && !wg.buffered_message.is_ready()
    {
        wg.buffered_message.network_message = Some(nm);
    }
    if wg.state == PubSubState::PreOperational {
        let _ = set_state(svc, conn, gi, PubSubState::Operational, None);
    }
    if conn.state == PubSubState::PreOperational {
        let _ = connection::set_state(svc, conn, PubSubState::Operational, None);
    }
}

// --- Freezing of the configuration ---

/// Freezes the group configuration; the publisher-side mirror of the reader
/// group's freeze. On any validation failure the group is left exactly as
/// before the call.
pub(crate) fn freeze_configuration(
    svc: &PubSubService,
    conn: &mut Connection,
    gi: usize,
) -> Result<(), PubSubError> {
    if conn.writer_groups[gi].configuration_frozen {
        return Ok(());
    }

    conn.freeze_counter += 1;
    {
        let wg = &mut conn.writer_groups[gi];
        wg.configuration_frozen = true;
        for writer in &mut wg.writers {
            writer.configuration_frozen = true;
        }
    }

    if conn.writer_groups[gi].config.rt_level != RtLevel::FixedSize {
        return Ok(());
    }

    let publisher_fixed = conn.config.publisher_id.is_fixed_size();
    if let Err(e) = validate_rt_configuration(svc, &mut conn.writer_groups[gi], publisher_fixed) {
        let wg = &mut conn.writer_groups[gi];
        wg.configuration_frozen = false;
        for writer in &mut wg.writers {
            writer.configuration_frozen = false;
            for field in &mut writer.config.published_fields {
                field.external_value = None;
            }
        }
        conn.freeze_counter -= 1;
        return Err(e);
    }

    conn.writer_groups[gi].buffered_message.clear();
    let current = conn.writer_groups[gi].state;
    set_state(svc, conn, gi, current, None)
}

fn validate_rt_configuration(
    svc: &PubSubService,
    wg: &mut WriterGroup,
    publisher_fixed: bool,
) -> Result<(), PubSubError> {
    if wg.writers.len() > 1 {
        warn!(
            "Writer group '{}': multiple writers are not supported in an \
             RT fixed-size configuration.",
            wg.config.name
        );
        return Err(PubSubError::NotImplemented(
            "multiple writers in an RT fixed-size group".to_string(),
        ));
    }
    let Some(writer) = wg.writers.first_mut() else {
        return Err(PubSubError::NotSupported(
            "RT fixed-size requires a configured writer".to_string(),
        ));
    };

    if writer.config.message_settings != MessageSettings::Uadp {
        warn!("RT configuration failed: non-RT capable encoding.");
        return Err(PubSubError::NotSupported(
            "RT fixed-size requires UADP message settings".to_string(),
        ));
    }
    if !publisher_fixed {
        warn!("RT configuration failed: String publisher id.");
        return Err(PubSubError::NotSupported(
            "string publisher ids are not supported in RT mode".to_string(),
        ));
    }

    let field_count = writer.config.data_set_meta_data.fields.len();
    if writer.config.published_fields.len() != field_count {
        return Err(PubSubError::ConfigurationError(
            "published field count does not match the dataset fields".to_string(),
        ));
    }

    for i in 0..field_count {
        let source_node = writer.config.published_fields[i].source_node.clone();
        let backend = svc
            .runtime
            .node_store
            .get(&source_node)
            .map(|binding| binding.backend);
        let Some(ValueBackend::External(cell)) = backend else {
            warn!(
                "RT configuration failed: field {} has no external data source.",
                i
            );
            return Err(PubSubError::NotSupported(
                "dataset contains a field without an external data source".to_string(),
            ));
        };
        writer.config.published_fields[i].external_value = Some(cell);
        validate_rt_field(&writer.config.data_set_meta_data.fields[i])?;
    }
    Ok(())
}

/// Unfreezes the group configuration. A no-op when not frozen.
pub(crate) fn unfreeze_configuration(conn: &mut Connection, gi: usize) {
    {
        let wg = &mut conn.writer_groups[gi];
        if !wg.configuration_frozen {
            return;
        }
        wg.configuration_frozen = false;
        wg.buffered_message.clear();
        for writer in &mut wg.writers {
            writer.configuration_frozen = false;
        }
    }
    conn.freeze_counter -= 1;
}

// --- Security ---

/// Installs or rotates the group's encryption keys. A new security token id
/// resets the nonce sequence number.
pub(crate) fn set_encryption_keys(
    wg: &mut WriterGroup,
    security_token_id: u32,
    signing_key: &[u8],
    encrypting_key: &[u8],
    key_nonce: &[u8],
) -> Result<(), PubSubError> {
    if wg.config.encoding_mime_type == EncodingMimeType::Json {
        warn!(
            "Writer group '{}': JSON encoding is enabled. Message security \
             is only defined for the UADP message mapping.",
            wg.config.name
        );
        return Err(PubSubError::Internal(
            "message security requires the UADP mapping".to_string(),
        ));
    }
    let Some(policy) = wg.config.security_policy.clone() else {
        warn!(
            "Writer group '{}': no security policy configured.",
            wg.config.name
        );
        return Err(PubSubError::Internal(
            "no security policy configured for the group".to_string(),
        ));
    };

    if security_token_id != wg.security_token_id {
        wg.security_token_id = security_token_id;
        wg.nonce_sequence_number = 1;
    }

    match &mut wg.security_context {
        None => {
            wg.security_context =
                Some(policy.new_context(signing_key, encrypting_key, key_nonce)?);
            Ok(())
        }
        Some(ctx) => ctx.set_keys(signing_key, encrypting_key, key_nonce),
    }
}

/// Applies the current key of the attached key storage to the group's
/// security context.
pub(crate) fn activate_key(
    mgr: &mut PubSubManager,
    group_id: PubSubId,
) -> Result<(), PubSubError> {
    let Some((ci, gi)) = mgr.find_writer_group(group_id) else {
        return Err(PubSubError::NotFound);
    };
    let Some(sgid) = mgr.connections[ci].writer_groups[gi].key_storage.clone() else {
        return Err(PubSubError::NotFound);
    };
    let material = mgr
        .key_storages
        .get(&sgid)
        .and_then(|ks| ks.current_key().cloned())
        .ok_or(PubSubError::NotFound)?;

    set_encryption_keys(
        &mut mgr.connections[ci].writer_groups[gi],
        material.security_token_id,
        &material.signing_key,
        &material.encrypting_key,
        &material.key_nonce,
    )
}
