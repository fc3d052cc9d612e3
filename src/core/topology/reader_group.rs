// src/core/topology/reader_group.rs

//! The ReaderGroup: a set of DataSetReaders under one connection with a
//! common subscribe cadence, freeze state and security context.

use crate::core::errors::PubSubError;
use crate::core::eventloop::{CallbackId, CycleMissPolicy, CyclicCallback, SchedulerHook};
use crate::core::identifier::PubSubId;
use crate::core::nodestore::ValueBackend;
use crate::core::receive;
use crate::core::security::{PolicyContext, SecurityPolicy};
use crate::core::service::PubSubService;
use crate::core::state::PubSubState;
use crate::core::topology::{
    Connection, EncodingMimeType, MQTT_TRANSPORT_PROFILE, MessageSettings, PubSubManager,
    QUEUE_NAME_PROPERTY, RtLevel, SecurityMode, data_set_reader, validate_rt_field,
};
use crate::core::topology::data_set_reader::{DataSetReader, DataSetReaderConfig};
use crate::core::value::{KeyValueMap, Variant};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// ReaderGroup configuration. Deep-copyable; `clear` releases every owned
/// buffer and is idempotent.
#[derive(Clone, Default)]
pub struct ReaderGroupConfig {
    pub name: String,
    /// Subscribe cadence. Values of zero are clamped to the stack default
    /// at creation time.
    pub subscribing_interval: Duration,
    /// Transport read timeout per tick. Advisory; expiry is not an error.
    pub timeout: Duration,
    pub encoding_mime_type: EncodingMimeType,
    pub rt_level: RtLevel,
    pub security_mode: SecurityMode,
    pub security_group_id: Option<String>,
    pub security_policy: Option<Arc<dyn SecurityPolicy>>,
    /// Blocking sockets require a custom scheduler hook so the shared event
    /// loop is never stalled by a read.
    pub enable_blocking_socket: bool,
    pub group_properties: KeyValueMap,
    pub transport_settings: KeyValueMap,
    pub scheduler_hook: Option<Arc<dyn SchedulerHook>>,
}

impl ReaderGroupConfig {
    /// Releases all owned buffers.
    pub fn clear(&mut self) {
        self.name.clear();
        self.group_properties.clear();
        self.transport_settings.clear();
        self.security_group_id = None;
    }
}

impl fmt::Debug for ReaderGroupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderGroupConfig")
            .field("name", &self.name)
            .field("subscribing_interval", &self.subscribing_interval)
            .field("timeout", &self.timeout)
            .field("encoding_mime_type", &self.encoding_mime_type)
            .field("rt_level", &self.rt_level)
            .field("security_mode", &self.security_mode)
            .field("security_group_id", &self.security_group_id)
            .field("security_policy", &self.security_policy.as_ref().map(|p| p.uri()))
            .field("enable_blocking_socket", &self.enable_blocking_socket)
            .field("group_properties", &self.group_properties)
            .field("transport_settings", &self.transport_settings)
            .field("scheduler_hook", &self.scheduler_hook.is_some())
            .finish()
    }
}

/// A reader group and its child readers.
pub struct ReaderGroup {
    pub id: PubSubId,
    pub config: ReaderGroupConfig,
    pub state: PubSubState,
    pub configuration_frozen: bool,
    /// Present exactly while a cyclic subscribe callback is scheduled.
    pub subscribe_callback_id: Option<CallbackId>,
    pub security_token_id: u32,
    pub nonce_sequence_number: u32,
    pub security_context: Option<Box<dyn PolicyContext>>,
    /// Security group id of the attached shared key storage.
    pub key_storage: Option<String>,
    pub readers: Vec<DataSetReader>,
}

impl ReaderGroup {
    pub(crate) fn new(id: PubSubId, config: ReaderGroupConfig) -> Self {
        Self {
            id,
            config,
            state: PubSubState::Disabled,
            configuration_frozen: false,
            subscribe_callback_id: None,
            security_token_id: 0,
            nonce_sequence_number: 0,
            security_context: None,
            key_storage: None,
            readers: Vec::new(),
        }
    }
}

impl fmt::Debug for ReaderGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderGroup")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("state", &self.state)
            .field("configuration_frozen", &self.configuration_frozen)
            .field("subscribe_callback_id", &self.subscribe_callback_id)
            .field("security_token_id", &self.security_token_id)
            .field("key_storage", &self.key_storage)
            .field("readers", &self.readers)
            .finish()
    }
}

/// Creates a reader group under `connection_id`, copying the caller's
/// configuration and clamping the cadence and timeout defaults.
pub(crate) fn create(
    svc: &PubSubService,
    mgr: &mut PubSubManager,
    connection_id: PubSubId,
    config: ReaderGroupConfig,
) -> Result<PubSubId, PubSubError> {
    let Some(ci) = mgr.find_connection(connection_id) else {
        return Err(PubSubError::NotFound);
    };

    {
        let conn = &mgr.connections[ci];
        if config.enable_blocking_socket && config.scheduler_hook.is_none() {
            warn!(
                "Adding reader group failed. Blocking socket functionality \
                 is only supported with a custom scheduler hook."
            );
            return Err(PubSubError::NotSupported(
                "blocking sockets require a custom scheduler hook".to_string(),
            ));
        }
        if conn.freeze_counter > 0 {
            warn!("Adding reader group failed. Connection configuration is frozen.");
            return Err(PubSubError::ConfigurationError(
                "connection configuration is frozen".to_string(),
            ));
        }
    }

    let mut config = config;
    if config.subscribing_interval.is_zero() {
        config.subscribing_interval = svc.runtime.config.default_subscribing_interval;
    }
    if config.enable_blocking_socket {
        config.timeout = Duration::ZERO;
    } else if config.timeout.is_zero() {
        config.timeout = svc.runtime.config.default_receive_timeout;
    }

    let id = mgr.next_id();

    // Attach the shared key storage when the group is secured.
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

    register_topic_assignment(mgr, ci, id, &config.transport_settings, &config.name);

    let mut group = ReaderGroup::new(id, config);
    group.key_storage = key_storage;
    mgr.connections[ci].reader_groups.insert(0, group);
    Ok(id)
}

/// MQTT connections bind their groups to broker queues.
pub(crate) fn register_topic_assignment(
    mgr: &mut PubSubManager,
    ci: usize,
    group_id: PubSubId,
    transport_settings: &KeyValueMap,
    group_name: &str,
) {
    if mgr.connections[ci].config.transport_profile_uri != MQTT_TRANSPORT_PROFILE {
        return;
    }
    match transport_settings.get(QUEUE_NAME_PROPERTY) {
        Some(Variant::String(queue)) => {
            let topic = queue.clone();
            mgr.topic_assignments
                .push(crate::core::topology::TopicAssignment { group_id, topic });
        }
        _ => warn!(
            "Group '{}' on an MQTT connection has no '{}' transport setting.",
            group_name, QUEUE_NAME_PROPERTY
        ),
    }
}

/// Removes a reader group: cancels its callback, releases the security
/// context and key storage reference, and unlinks it from the connection.
pub(crate) fn remove(
    svc: &PubSubService,
    mgr: &mut PubSubManager,
    group_id: PubSubId,
) -> Result<(), PubSubError> {
    let Some((ci, gi)) = mgr.find_reader_group(group_id) else {
        return Err(PubSubError::NotFound);
    };
    if mgr.connections[ci].reader_groups[gi].configuration_frozen {
        warn!("Remove reader group failed. Subscriber configuration is frozen.");
        return Err(PubSubError::ConfigurationError(
            "reader group configuration is frozen".to_string(),
        ));
    }

    remove_subscribe_callback(svc, &mut mgr.connections[ci], gi);

    let detached = {
        let rg = &mut mgr.connections[ci].reader_groups[gi];
        rg.security_context = None;
        rg.key_storage.take()
    };
    if let Some(sgid) = detached {
        mgr.detach_key_storage(&sgid);
    }

    mgr.topic_assignments.retain(|t| t.group_id != group_id);
    mgr.connections[ci].reader_groups.remove(gi);
    Ok(())
}

/// Adds a reader to a group. Readers created under an active group start
/// pre-operational immediately.
pub(crate) fn add_reader(
    svc: &PubSubService,
    mgr: &mut PubSubManager,
    group_id: PubSubId,
    config: DataSetReaderConfig,
) -> Result<PubSubId, PubSubError> {
    let Some((ci, gi)) = mgr.find_reader_group(group_id) else {
        return Err(PubSubError::NotFound);
    };
    if mgr.connections[ci].reader_groups[gi].configuration_frozen {
        return Err(PubSubError::ConfigurationError(
            "reader group configuration is frozen".to_string(),
        ));
    }

    let id = mgr.next_id();
    let mut reader = DataSetReader::new(id, config);
    if mgr.connections[ci].reader_groups[gi].state.is_active() {
        if let Err(e) =
            data_set_reader::set_state(svc, &mut reader, PubSubState::PreOperational, None)
        {
            warn!("New reader failed to enter pre-operational state: {}", e);
        }
    }
    mgr.connections[ci].reader_groups[gi].readers.insert(0, reader);
    Ok(id)
}

pub(crate) fn remove_reader(
    mgr: &mut PubSubManager,
    reader_id: PubSubId,
) -> Result<(), PubSubError> {
    let Some((ci, gi, ri)) = mgr.find_data_set_reader(reader_id) else {
        return Err(PubSubError::NotFound);
    };
    if mgr.connections[ci].reader_groups[gi].configuration_frozen {
        return Err(PubSubError::ConfigurationError(
            "reader group configuration is frozen".to_string(),
        ));
    }
    mgr.connections[ci].reader_groups[gi].readers.remove(ri);
    Ok(())
}

// --- State machine ---

/// Drives the reader group state machine. Each handler mutates the group's
/// own state first, notifies, and only then propagates to the child
/// readers, so child notifications always follow the parent's.
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

fn propagate_to_readers(
    svc: &PubSubService,
    conn: &mut Connection,
    gi: usize,
    target: PubSubState,
    cause: Option<PubSubError>,
) {
    for ri in 0..conn.reader_groups[gi].readers.len() {
        if let Err(e) = data_set_reader::set_state(
            svc,
            &mut conn.reader_groups[gi].readers[ri],
            target,
            cause.clone(),
        ) {
            warn!(
                "Reader '{}' failed to follow group state {}: {}",
                conn.reader_groups[gi].readers[ri].config.name, target, e
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
    let rg = &mut conn.reader_groups[gi];
    match rg.state {
        PubSubState::Disabled | PubSubState::Error => Ok(()),
        PubSubState::Paused => {
            rg.state = PubSubState::Disabled;
            let id = rg.id;
            svc.notify_state_change(id, PubSubState::Disabled, cause);
            Ok(())
        }
        PubSubState::PreOperational | PubSubState::Operational => {
            remove_subscribe_callback(svc, conn, gi);
            let rg = &mut conn.reader_groups[gi];
            rg.state = PubSubState::Disabled;
            let id = rg.id;
            svc.notify_state_change(id, PubSubState::Disabled, cause.clone());
            propagate_to_readers(svc, conn, gi, PubSubState::Disabled, cause);
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
    let rg = &mut conn.reader_groups[gi];
    debug!("Reader group '{}': the paused state is unsupported.", rg.config.name);
    match rg.state {
        PubSubState::Disabled => {
            rg.state = PubSubState::Paused;
            let id = rg.id;
            svc.notify_state_change(id, PubSubState::Paused, cause);
            Ok(())
        }
        PubSubState::Paused => Ok(()),
        _ => Err(PubSubError::NotSupported(
            "paused reader groups are not supported".to_string(),
        )),
    }
}

fn to_preoperational(
    svc: &PubSubService,
    conn: &mut Connection,
    gi: usize,
    cause: Option<PubSubError>,
) -> Result<(), PubSubError> {
    match conn.reader_groups[gi].state {
        PubSubState::Disabled | PubSubState::Paused => {
            let rg = &mut conn.reader_groups[gi];
            rg.state = PubSubState::PreOperational;
            let id = rg.id;
            svc.notify_state_change(id, PubSubState::PreOperational, cause.clone());
            propagate_to_readers(svc, conn, gi, PubSubState::PreOperational, cause);
            add_subscribe_callback(svc, conn, gi)
        }
        PubSubState::PreOperational | PubSubState::Operational => Ok(()),
        PubSubState::Error => Err(PubSubError::NotSupported(
            "reader group is in the error state".to_string(),
        )),
    }
}

fn to_operational(
    svc: &PubSubService,
    conn: &mut Connection,
    gi: usize,
    cause: Option<PubSubError>,
) -> Result<(), PubSubError> {
    let rg = &conn.reader_groups[gi];
    // Promotion needs a reader; a frozen fixed-size group additionally
    // needs the buffered template built from the first received message.
    let next = if rg.readers.is_empty()
        || (rg.config.rt_level == RtLevel::FixedSize
            && rg.configuration_frozen
            && !rg.readers[0].buffered_message.is_ready())
    {
        PubSubState::PreOperational
    } else {
        PubSubState::Operational
    };

    match rg.state {
        PubSubState::PreOperational | PubSubState::Operational => {
            let old = rg.state;
            let id = rg.id;
            conn.reader_groups[gi].state = next;
            if next != old {
                svc.notify_state_change(id, next, cause.clone());
            }
            propagate_to_readers(svc, conn, gi, next, cause);
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
    match conn.reader_groups[gi].state {
        PubSubState::Error => Ok(()),
        PubSubState::Disabled | PubSubState::Paused => {
            let rg = &mut conn.reader_groups[gi];
            rg.state = PubSubState::Error;
            let id = rg.id;
            svc.notify_state_change(id, PubSubState::Error, cause);
            Ok(())
        }
        PubSubState::PreOperational | PubSubState::Operational => {
            remove_subscribe_callback(svc, conn, gi);
            let rg = &mut conn.reader_groups[gi];
            rg.state = PubSubState::Error;
            let id = rg.id;
            svc.notify_state_change(id, PubSubState::Error, cause.clone());
            propagate_to_readers(svc, conn, gi, PubSubState::Error, cause);
            Ok(())
        }
    }
}

// --- Subscribe scheduler ---

/// Registers the cyclic subscribe callback on the group's effective event
/// loop and runs it once synchronously. Blocking sockets skip the immediate
/// run; their custom hook drives the cadence.
fn add_subscribe_callback(
    svc: &PubSubService,
    conn: &mut Connection,
    gi: usize,
) -> Result<(), PubSubError> {
    if conn.reader_groups[gi].subscribe_callback_id.is_some() {
        return Err(PubSubError::Internal(
            "subscribe callback already registered".to_string(),
        ));
    }

    let interval = conn.reader_groups[gi].config.subscribing_interval;
    let weak = svc.weak_self();
    let connection_id = conn.id;
    let group_id = conn.reader_groups[gi].id;
    let callback: CyclicCallback = Arc::new(move || {
        if let Some(service) = weak.upgrade() {
            service.subscribe_tick(connection_id, group_id);
        }
    });

    let id = match &conn.reader_groups[gi].config.scheduler_hook {
        Some(hook) => hook.add_cyclic(callback, interval)?,
        None => conn.effective_event_loop(svc).add_cyclic_callback(
            callback,
            interval,
            None,
            CycleMissPolicy::CurrentTime,
        )?,
    };
    conn.reader_groups[gi].subscribe_callback_id = Some(id);

    if !conn.reader_groups[gi].config.enable_blocking_socket {
        receive::receive_buffered_network_message(svc, conn, gi);
    }
    Ok(())
}

pub(crate) fn remove_subscribe_callback(svc: &PubSubService, conn: &mut Connection, gi: usize) {
    if let Some(id) = conn.reader_groups[gi].subscribe_callback_id.take() {
        match &conn.reader_groups[gi].config.scheduler_hook {
            Some(hook) => hook.remove_cyclic(id),
            None => conn.effective_event_loop(svc).remove_cyclic_callback(id),
        }
    }
}

// --- Freezing of the configuration ---

/// Freezes the group configuration, enabling the RT fixed-size fast path
/// when the group requests it. On any validation failure the group is left
/// exactly as before the call.
pub(crate) fn freeze_configuration(
    svc: &PubSubService,
    conn: &mut Connection,
    gi: usize,
) -> Result<(), PubSubError> {
    if conn.reader_groups[gi].configuration_frozen {
        return Ok(());
    }

    conn.freeze_counter += 1;
    {
        let rg = &mut conn.reader_groups[gi];
        rg.configuration_frozen = true;
        for reader in &mut rg.readers {
            reader.configuration_frozen = true;
        }
    }

    if conn.reader_groups[gi].config.rt_level != RtLevel::FixedSize {
        return Ok(());
    }

    if let Err(e) = validate_rt_configuration(svc, &mut conn.reader_groups[gi]) {
        let rg = &mut conn.reader_groups[gi];
        rg.configuration_frozen = false;
        for reader in &mut rg.readers {
            reader.configuration_frozen = false;
            for target in &mut reader.config.target_variables {
                target.external_value = None;
            }
        }
        conn.freeze_counter -= 1;
        return Err(e);
    }

    // The buffered template for a frozen configuration is generated from
    // the first message received, once the exact header layout is known.
    // Until then the group is pre-operational.
    for reader in &mut conn.reader_groups[gi].readers {
        reader.buffered_message.clear();
    }
    let current = conn.reader_groups[gi].state;
    set_state(svc, conn, gi, current, None)
}

fn validate_rt_configuration(
    svc: &PubSubService,
    rg: &mut ReaderGroup,
) -> Result<(), PubSubError> {
    if rg.readers.len() > 1 {
        warn!(
            "Reader group '{}': multiple readers are not supported in an \
             RT fixed-size configuration.",
            rg.config.name
        );
        return Err(PubSubError::NotImplemented(
            "multiple readers in an RT fixed-size group".to_string(),
        ));
    }
    let Some(reader) = rg.readers.first_mut() else {
        return Err(PubSubError::NotSupported(
            "RT fixed-size requires a configured reader".to_string(),
        ));
    };

    if reader.config.message_settings != MessageSettings::Uadp {
        warn!("RT configuration failed: non-RT capable encoding.");
        return Err(PubSubError::NotSupported(
            "RT fixed-size requires UADP message settings".to_string(),
        ));
    }
    if !reader.config.publisher_id.is_fixed_size() {
        warn!("RT configuration failed: String publisher id.");
        return Err(PubSubError::NotSupported(
            "string publisher ids are not supported in RT mode".to_string(),
        ));
    }

    let field_count = reader.config.data_set_meta_data.fields.len();
    if reader.config.target_variables.len() != field_count {
        return Err(PubSubError::ConfigurationError(
            "target variable count does not match the dataset fields".to_string(),
        ));
    }

    for i in 0..field_count {
        let target_node = reader.config.target_variables[i].target_node.clone();
        let backend = svc
            .runtime
            .node_store
            .get(&target_node)
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
        reader.config.target_variables[i].external_value = Some(cell);
        validate_rt_field(&reader.config.data_set_meta_data.fields[i])?;
    }
    Ok(())
}

/// Unfreezes the group configuration. A no-op when not frozen, so the
/// connection's freeze counter always matches its frozen groups.
pub(crate) fn unfreeze_configuration(conn: &mut Connection, gi: usize) {
    {
        let rg = &mut conn.reader_groups[gi];
        if !rg.configuration_frozen {
            return;
        }
        rg.configuration_frozen = false;
        for reader in &mut rg.readers {
            reader.configuration_frozen = false;
            reader.buffered_message.clear();
        }
    }
    conn.freeze_counter -= 1;
}

// --- Security ---

/// Installs or rotates the group's encryption keys. A new security token id
/// resets the nonce sequence number.
pub(crate) fn set_encryption_keys(
    rg: &mut ReaderGroup,
    security_token_id: u32,
    signing_key: &[u8],
    encrypting_key: &[u8],
    key_nonce: &[u8],
) -> Result<(), PubSubError> {
    if rg.config.encoding_mime_type == EncodingMimeType::Json {
        warn!(
            "Reader group '{}': JSON encoding is enabled. Message security \
             is only defined for the UADP message mapping.",
            rg.config.name
        );
        return Err(PubSubError::Internal(
            "message security requires the UADP mapping".to_string(),
        ));
    }
    let Some(policy) = rg.config.security_policy.clone() else {
        warn!(
            "Reader group '{}': no security policy configured.",
            rg.config.name
        );
        return Err(PubSubError::Internal(
            "no security policy configured for the group".to_string(),
        ));
    };

    if security_token_id != rg.security_token_id {
        rg.security_token_id = security_token_id;
        rg.nonce_sequence_number = 1;
    }

    match &mut rg.security_context {
        None => {
            rg.security_context =
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
    let Some((ci, gi)) = mgr.find_reader_group(group_id) else {
        return Err(PubSubError::NotFound);
    };
    let Some(sgid) = mgr.connections[ci].reader_groups[gi].key_storage.clone() else {
        return Err(PubSubError::NotFound);
    };
    let material = mgr
        .key_storages
        .get(&sgid)
        .and_then(|ks| ks.current_key().cloned())
        .ok_or(PubSubError::NotFound)?;

    set_encryption_keys(
        &mut mgr.connections[ci].reader_groups[gi],
        material.security_token_id,
        &material.signing_key,
        &material.encrypting_key,
        &material.key_nonce,
    )
}
