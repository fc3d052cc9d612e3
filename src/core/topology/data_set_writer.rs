// src/core/topology/data_set_writer.rs

//! A DataSetWriter publishes a local dataset, reading its field values from
//! source nodes in the information model.

use crate::core::errors::PubSubError;
use crate::core::identifier::PubSubId;
use crate::core::nodestore::{ExternalValueCell, NodeId};
use crate::core::service::PubSubService;
use crate::core::state::PubSubState;
use crate::core::topology::MessageSettings;
use crate::core::topology::data_set_reader::DataSetMetaData;

/// One published field: where the value comes from. The external cell is
/// resolved and cached during a hard freeze for zero-copy reads.
#[derive(Debug, Clone)]
pub struct PublishedField {
    pub source_node: NodeId,
    pub external_value: Option<ExternalValueCell>,
}

impl PublishedField {
    pub fn new(source_node: NodeId) -> Self {
        Self {
            source_node,
            external_value: None,
        }
    }
}

/// DataSetWriter configuration. Deep-copyable; `clear` releases every owned
/// buffer and is idempotent.
#[derive(Debug, Clone, Default)]
pub struct DataSetWriterConfig {
    pub name: String,
    pub data_set_writer_id: u16,
    pub data_set_meta_data: DataSetMetaData,
    pub message_settings: MessageSettings,
    /// One entry per metadata field, in field order.
    pub published_fields: Vec<PublishedField>,
}

impl DataSetWriterConfig {
    /// Releases all owned buffers.
    pub fn clear(&mut self) {
        self.name.clear();
        self.data_set_meta_data.name.clear();
        self.data_set_meta_data.fields.clear();
        self.published_fields.clear();
    }
}

#[derive(Debug)]
pub struct DataSetWriter {
    pub id: PubSubId,
    pub config: DataSetWriterConfig,
    pub state: PubSubState,
    pub configuration_frozen: bool,
    pub sequence_number: u16,
}

impl DataSetWriter {
    pub(crate) fn new(id: PubSubId, config: DataSetWriterConfig) -> Self {
        Self {
            id,
            config,
            state: PubSubState::Disabled,
            configuration_frozen: false,
            sequence_number: 0,
        }
    }
}

/// Drives the writer state machine; the mirror of the reader's.
pub(crate) fn set_state(
    svc: &PubSubService,
    writer: &mut DataSetWriter,
    target: PubSubState,
    cause: Option<PubSubError>,
) -> Result<(), PubSubError> {
    let old = writer.state;
    let result = match target {
        PubSubState::Disabled => {
            if old != PubSubState::Error {
                writer.state = PubSubState::Disabled;
            }
            Ok(())
        }
        PubSubState::Paused => match old {
            PubSubState::Disabled | PubSubState::Paused => {
                writer.state = PubSubState::Paused;
                Ok(())
            }
            _ => Err(PubSubError::NotSupported(
                "paused writers are not supported".to_string(),
            )),
        },
        PubSubState::PreOperational => match old {
            PubSubState::Disabled | PubSubState::Paused | PubSubState::Operational => {
                writer.state = PubSubState::PreOperational;
                Ok(())
            }
            PubSubState::PreOperational => Ok(()),
            PubSubState::Error => Err(PubSubError::NotSupported(
                "writer is in the error state".to_string(),
            )),
        },
        PubSubState::Operational => match old {
            PubSubState::PreOperational | PubSubState::Operational => {
                writer.state = PubSubState::Operational;
                Ok(())
            }
            _ => Err(PubSubError::NotSupported(format!(
                "cannot become operational from {old}"
            ))),
        },
        PubSubState::Error => {
            writer.state = PubSubState::Error;
            Ok(())
        }
    };

    if writer.state != old {
        svc.notify_state_change(writer.id, writer.state, cause);
    }
    result
}
