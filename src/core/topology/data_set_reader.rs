// src/core/topology/data_set_reader.rs

//! A DataSetReader binds a remote writer's dataset to local target
//! variables and carries the buffered message template of the RT fast path.

use crate::core::errors::PubSubError;
use crate::core::identifier::PubSubId;
use crate::core::message::{DataSetMessage, NetworkMessage};
use crate::core::nodestore::{ExternalValueCell, NodeId};
use crate::core::service::PubSubService;
use crate::core::state::PubSubState;
use crate::core::topology::{BufferedMessage, MessageSettings};
use crate::core::value::{FieldMetaData, PublisherId};
use tracing::{debug, warn};

/// Name and field layout of the dataset a reader subscribes to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataSetMetaData {
    pub name: String,
    pub fields: Vec<FieldMetaData>,
}

/// Maps one dataset field to a target node. The external cell is resolved
/// and cached during a hard freeze for zero-copy writes.
#[derive(Debug, Clone)]
pub struct FieldTarget {
    pub target_node: NodeId,
    pub external_value: Option<ExternalValueCell>,
}

impl FieldTarget {
    pub fn new(target_node: NodeId) -> Self {
        Self {
            target_node,
            external_value: None,
        }
    }
}

/// DataSetReader configuration. Deep-copyable; `clear` releases every owned
/// buffer and is idempotent.
#[derive(Debug, Clone, Default)]
pub struct DataSetReaderConfig {
    pub name: String,
    pub publisher_id: PublisherId,
    pub writer_group_id: u16,
    pub data_set_writer_id: u16,
    pub data_set_meta_data: DataSetMetaData,
    pub message_settings: MessageSettings,
    /// One entry per metadata field, in field order.
    pub target_variables: Vec<FieldTarget>,
}

impl DataSetReaderConfig {
    /// Releases all owned buffers.
    pub fn clear(&mut self) {
        if let PublisherId::String(s) = &mut self.publisher_id {
            s.clear();
        }
        self.name.clear();
        self.data_set_meta_data.name.clear();
        self.data_set_meta_data.fields.clear();
        self.target_variables.clear();
    }
}

#[derive(Debug)]
pub struct DataSetReader {
    pub id: PubSubId,
    pub config: DataSetReaderConfig,
    pub state: PubSubState,
    pub configuration_frozen: bool,
    pub buffered_message: BufferedMessage,
}

impl DataSetReader {
    pub(crate) fn new(id: PubSubId, config: DataSetReaderConfig) -> Self {
        Self {
            id,
            config,
            state: PubSubState::Disabled,
            configuration_frozen: false,
            buffered_message: BufferedMessage::default(),
        }
    }

    /// Header-level identifier check: does this reader accept messages from
    /// the publisher and writer group named in the NetworkMessage header?
    pub fn matches_network_message(&self, nm: &NetworkMessage) -> bool {
        nm.publisher_id.as_ref() == Some(&self.config.publisher_id)
            && nm.writer_group_id == Some(self.config.writer_group_id)
    }

    /// Payload-level check for one contained DataSetMessage.
    pub fn matches_data_set_message(&self, dsm: &DataSetMessage) -> bool {
        dsm.data_set_writer_id == self.config.data_set_writer_id
    }
}

/// Drives the reader state machine. Readers hold no scheduler resources of
/// their own; the machine exists so parent transitions propagate observably.
pub(crate) fn set_state(
    svc: &PubSubService,
    reader: &mut DataSetReader,
    target: PubSubState,
    cause: Option<PubSubError>,
) -> Result<(), PubSubError> {
    let old = reader.state;
    let result = match target {
        PubSubState::Disabled => {
            if old != PubSubState::Error {
                reader.state = PubSubState::Disabled;
            }
            Ok(())
        }
        PubSubState::Paused => match old {
            PubSubState::Disabled | PubSubState::Paused => {
                reader.state = PubSubState::Paused;
                Ok(())
            }
            _ => Err(PubSubError::NotSupported(
                "paused readers are not supported".to_string(),
            )),
        },
        PubSubState::PreOperational => match old {
            // Operational readers downgrade with their group when a freeze
            // invalidates the buffered template.
            PubSubState::Disabled | PubSubState::Paused | PubSubState::Operational => {
                reader.state = PubSubState::PreOperational;
                Ok(())
            }
            PubSubState::PreOperational => Ok(()),
            PubSubState::Error => Err(PubSubError::NotSupported(
                "reader is in the error state".to_string(),
            )),
        },
        PubSubState::Operational => match old {
            PubSubState::PreOperational | PubSubState::Operational => {
                reader.state = PubSubState::Operational;
                Ok(())
            }
            _ => Err(PubSubError::NotSupported(format!(
                "cannot become operational from {old}"
            ))),
        },
        PubSubState::Error => {
            reader.state = PubSubState::Error;
            Ok(())
        }
    };

    if reader.state != old {
        svc.notify_state_change(reader.id, reader.state, cause);
    }
    result
}

/// Delivers one DataSetMessage to the reader's target variables. Frozen
/// readers write through their cached external cells; otherwise values go
/// through the node store. Per-field failures are logged and skipped.
pub(crate) fn process_data_set_message(
    svc: &PubSubService,
    reader: &DataSetReader,
    dsm: &DataSetMessage,
) {
    for (i, value) in dsm.fields.iter().enumerate() {
        let Some(target) = reader.config.target_variables.get(i) else {
            debug!(
                "Reader '{}' received more fields than configured targets.",
                reader.config.name
            );
            break;
        };
        if let Some(cell) = &target.external_value {
            *cell.write() = value.clone();
        } else if let Err(e) = svc
            .runtime
            .node_store
            .write_value(&target.target_node, value.clone())
        {
            warn!(
                "Reader '{}' failed to write target '{}': {}",
                reader.config.name, target.target_node, e
            );
        }
    }
}
