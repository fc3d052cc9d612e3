// src/core/topology/mod.rs

//! The PubSub containment graph: Manager → Connection → {ReaderGroup,
//! WriterGroup} → {DataSetReader, DataSetWriter}, plus the shared key
//! storages and configuration vocabulary.

use crate::core::errors::PubSubError;
use crate::core::identifier::{IdGenerator, PubSubId};
use crate::core::security::KeyStorage;
use crate::core::value::{DataType, FieldMetaData};
use indexmap::IndexMap;
use tracing::debug;

pub mod connection;
pub mod data_set_reader;
pub mod data_set_writer;
pub mod reader_group;
pub mod writer_group;

pub use connection::{Connection, ConnectionConfig};
pub use data_set_reader::{DataSetReader, DataSetReaderConfig};
pub use data_set_writer::{DataSetWriter, DataSetWriterConfig};
pub use reader_group::{ReaderGroup, ReaderGroupConfig};
pub use writer_group::{WriterGroup, WriterGroupConfig};

/// Transport profile URI of the MQTT message mapping. Groups created on an
/// MQTT connection register their broker queue name as a topic assignment.
pub const MQTT_TRANSPORT_PROFILE: &str =
    "http://opcfoundation.org/UA-Profile/Transport/pubsub-mqtt";

/// Transport-settings key under which MQTT groups carry their queue name.
pub const QUEUE_NAME_PROPERTY: &str = "queueName";

/// Encoding of the NetworkMessages a group produces or consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodingMimeType {
    #[default]
    Uadp,
    Json,
}

/// Real-time level of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RtLevel {
    /// Fully dynamic configuration.
    #[default]
    None,
    /// Pre-allocated, offset-table-driven fast path. Requires every field
    /// to have a known maximum size.
    FixedSize,
}

/// Message security applied by a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityMode {
    #[default]
    None,
    Sign,
    SignAndEncrypt,
}

impl SecurityMode {
    pub fn is_secured(&self) -> bool {
        !matches!(self, SecurityMode::None)
    }
}

/// Message-mapping settings of a single reader or writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageSettings {
    #[default]
    Uadp,
    Json,
}

/// A broker topic bound to a group on an MQTT connection.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicAssignment {
    pub group_id: PubSubId,
    pub topic: String,
}

/// The pre-decoded message template of the RT fixed-size fast path. Built
/// from the first message seen after a hard freeze; while absent, a frozen
/// group stays PreOperational. The byte-level offset table belongs to the
/// codec; the control plane tracks only readiness.
#[derive(Debug, Clone, Default)]
pub struct BufferedMessage {
    pub network_message: Option<crate::core::message::NetworkMessage>,
}

impl BufferedMessage {
    pub fn is_ready(&self) -> bool {
        self.network_message.is_some()
    }

    pub fn clear(&mut self) {
        self.network_message = None;
    }
}

/// The process-scoped PubSub topology. Owns every component; all access goes
/// through the service mutex, so plain containers suffice.
#[derive(Debug, Default)]
pub struct PubSubManager {
    pub(crate) id_gen: IdGenerator,
    pub connections: Vec<Connection>,
    /// Connections unlinked by `remove` but not yet reaped by the delayed
    /// callback on their event loop.
    pub graveyard: Vec<Connection>,
    pub key_storages: IndexMap<String, KeyStorage>,
    pub topic_assignments: Vec<TopicAssignment>,
}

impl PubSubManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_id(&mut self) -> PubSubId {
        self.id_gen.next_id()
    }

    // --- Lookups. A linear walk over the topology, which is fine at
    // control-plane rates. Unlinked (graveyard) components are not found. ---

    pub fn find_connection(&self, id: PubSubId) -> Option<usize> {
        self.connections.iter().position(|c| c.id == id)
    }

    pub fn find_reader_group(&self, id: PubSubId) -> Option<(usize, usize)> {
        self.connections.iter().enumerate().find_map(|(ci, c)| {
            c.reader_groups
                .iter()
                .position(|g| g.id == id)
                .map(|gi| (ci, gi))
        })
    }

    pub fn find_data_set_reader(&self, id: PubSubId) -> Option<(usize, usize, usize)> {
        self.connections.iter().enumerate().find_map(|(ci, c)| {
            c.reader_groups.iter().enumerate().find_map(|(gi, g)| {
                g.readers
                    .iter()
                    .position(|r| r.id == id)
                    .map(|ri| (ci, gi, ri))
            })
        })
    }

    pub fn find_writer_group(&self, id: PubSubId) -> Option<(usize, usize)> {
        self.connections.iter().enumerate().find_map(|(ci, c)| {
            c.writer_groups
                .iter()
                .position(|g| g.id == id)
                .map(|gi| (ci, gi))
        })
    }

    pub fn find_data_set_writer(&self, id: PubSubId) -> Option<(usize, usize, usize)> {
        self.connections.iter().enumerate().find_map(|(ci, c)| {
            c.writer_groups.iter().enumerate().find_map(|(gi, g)| {
                g.writers
                    .iter()
                    .position(|w| w.id == id)
                    .map(|wi| (ci, gi, wi))
            })
        })
    }

    // --- Key storage bookkeeping. The reference count equals the number of
    // groups holding the storage's security group id. ---

    /// Finds or creates the storage for `security_group_id` and takes one
    /// reference on behalf of a group.
    pub(crate) fn attach_key_storage(&mut self, security_group_id: &str, policy_uri: &str) {
        let storage = self
            .key_storages
            .entry(security_group_id.to_string())
            .or_insert_with(|| KeyStorage::new(security_group_id, policy_uri));
        storage.reference_count += 1;
    }

    /// Releases one group reference; the storage is destroyed at zero.
    pub(crate) fn detach_key_storage(&mut self, security_group_id: &str) {
        let Some(storage) = self.key_storages.get_mut(security_group_id) else {
            return;
        };
        storage.reference_count = storage.reference_count.saturating_sub(1);
        if storage.reference_count == 0 {
            self.key_storages.shift_remove(security_group_id);
            debug!("Key storage '{}' destroyed.", security_group_id);
        }
    }
}

/// Checks one metadata field against the RT fixed-size requirements: numeric
/// or boolean, or a String/ByteString with a committed maximum length.
pub(crate) fn validate_rt_field(field: &FieldMetaData) -> Result<(), PubSubError> {
    match field.data_type {
        DataType::String | DataType::ByteString => {
            if field.max_string_length == 0 {
                return Err(PubSubError::NotSupported(format!(
                    "field '{}' is a String/ByteString with dynamic length",
                    field.name
                )));
            }
            Ok(())
        }
        DataType::Bool => Ok(()),
        other if other.is_numeric() => Ok(()),
        _ => Err(PubSubError::NotSupported(format!(
            "field '{}' has a dynamically sized type",
            field.name
        ))),
    }
}
