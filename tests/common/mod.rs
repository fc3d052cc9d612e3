// tests/common/mod.rs

//! Shared test fixtures: a manually driven event loop, loopback transport
//! wiring, a state-change recorder and configuration builders.

#![allow(dead_code)]

use bytes::Bytes;
use ferrobus::config::PubSubConfig;
use ferrobus::core::eventloop::{
    CallbackId, CycleMissPolicy, CyclicCallback, DelayedWork, EventLoop,
};
use ferrobus::core::message::{
    DataSetMessage, JsonNetworkMessageCodec, NetworkMessage, NetworkMessageCodec,
    NetworkMessageContentFlags,
};
use ferrobus::core::nodestore::{MemoryNodeStore, NodeId};
use ferrobus::core::security::{PolicyContext, SecurityPolicy};
use ferrobus::core::service::{PubSubRuntime, PubSubService, StateChangeCallback};
use ferrobus::core::topology::data_set_reader::{DataSetMetaData, FieldTarget};
use ferrobus::core::topology::data_set_writer::PublishedField;
use ferrobus::core::topology::{
    ConnectionConfig, DataSetReaderConfig, DataSetWriterConfig, ReaderGroupConfig, SecurityMode,
    WriterGroupConfig,
};
use ferrobus::core::transport::{ConnectionChannels, MemoryTransport, PubSubTransport};
use ferrobus::core::value::{DataType, FieldMetaData, PublisherId, Variant};
use ferrobus::{PubSubError, PubSubId, PubSubState};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

pub const ADDRESS: &str = "opc.udp://224.0.0.22:4840";
pub const UDP_PROFILE: &str = "http://opcfoundation.org/UA-Profile/Transport/pubsub-udp-uadp";

/// An event loop driven explicitly by the test: `run_cycle` fires every
/// cyclic callback once, `run_delayed` drains the delayed queue.
#[derive(Default)]
pub struct ManualEventLoop {
    next_id: AtomicU64,
    cyclic: Mutex<Vec<(CallbackId, CyclicCallback)>>,
    delayed: Mutex<Vec<DelayedWork>>,
}

impl ManualEventLoop {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn run_cycle(&self) {
        let callbacks: Vec<CyclicCallback> =
            self.cyclic.lock().iter().map(|(_, cb)| cb.clone()).collect();
        for callback in callbacks {
            callback();
        }
    }

    pub fn run_delayed(&self) {
        let work: Vec<DelayedWork> = self.delayed.lock().drain(..).collect();
        for item in work {
            item.run();
        }
    }

    pub fn cyclic_count(&self) -> usize {
        self.cyclic.lock().len()
    }
}

impl EventLoop for ManualEventLoop {
    fn add_cyclic_callback(
        &self,
        callback: CyclicCallback,
        interval: Duration,
        _base_time: Option<Instant>,
        _miss_policy: CycleMissPolicy,
    ) -> Result<CallbackId, PubSubError> {
        if interval.is_zero() {
            return Err(PubSubError::InvalidArgument(
                "cyclic callback interval must be non-zero".to_string(),
            ));
        }
        let raw = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let id = CallbackId::from_raw(raw).expect("callback id overflow");
        self.cyclic.lock().push((id, callback));
        Ok(id)
    }

    fn remove_cyclic_callback(&self, id: CallbackId) {
        self.cyclic.lock().retain(|(cid, _)| *cid != id);
    }

    fn add_delayed_callback(&self, work: DelayedWork) {
        self.delayed.lock().push(work);
    }
}

/// Records every state-change notification delivered by the service.
#[derive(Default)]
pub struct StateChangeRecorder {
    pub events: Mutex<Vec<(PubSubId, PubSubState, Option<PubSubError>)>>,
}

impl StateChangeRecorder {
    pub fn callback(self: &Arc<Self>) -> StateChangeCallback {
        let recorder = self.clone();
        Arc::new(move |id, state, cause| {
            recorder.events.lock().push((id, state, cause));
        })
    }

    pub fn events_for(&self, id: PubSubId) -> Vec<(PubSubState, Option<PubSubError>)> {
        self.events
            .lock()
            .iter()
            .filter(|(eid, _, _)| *eid == id)
            .map(|(_, state, cause)| (*state, cause.clone()))
            .collect()
    }

    pub fn last_for(&self, id: PubSubId) -> Option<(PubSubState, Option<PubSubError>)> {
        self.events_for(id).last().cloned()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

/// A transport whose connect attempts always fail.
#[derive(Debug, Default)]
pub struct FailingTransport;

impl PubSubTransport for FailingTransport {
    fn connect(&self, _config: &ConnectionConfig) -> Result<ConnectionChannels, PubSubError> {
        Err(PubSubError::Transport("connect refused".to_string()))
    }

    fn disconnect(&self, _channels: &mut ConnectionChannels) {}

    fn receive(
        &self,
        _channels: &mut ConnectionChannels,
        _timeout: Duration,
    ) -> Result<Vec<Bytes>, PubSubError> {
        Ok(Vec::new())
    }

    fn send(&self, _channels: &ConnectionChannels, _payload: Bytes) -> Result<(), PubSubError> {
        Err(PubSubError::ConnectionClosed)
    }
}

/// A security policy that counts context creations and key updates, for
/// asserting the create-once/update-afterwards contract.
#[derive(Debug, Default)]
pub struct RecordingPolicy {
    pub contexts_created: AtomicUsize,
    pub keys_updated: Arc<AtomicUsize>,
}

impl SecurityPolicy for RecordingPolicy {
    fn uri(&self) -> &str {
        "https://ferrobus.dev/security/test-recording"
    }

    fn new_context(
        &self,
        _signing_key: &[u8],
        _encrypting_key: &[u8],
        _key_nonce: &[u8],
    ) -> Result<Box<dyn PolicyContext>, PubSubError> {
        self.contexts_created.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(RecordingContext {
            keys_updated: self.keys_updated.clone(),
        }))
    }
}

struct RecordingContext {
    keys_updated: Arc<AtomicUsize>,
}

impl PolicyContext for RecordingContext {
    fn set_keys(
        &mut self,
        _signing_key: &[u8],
        _encrypting_key: &[u8],
        _key_nonce: &[u8],
    ) -> Result<(), PubSubError> {
        self.keys_updated.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn verify_and_decrypt(
        &self,
        _buffer: &Bytes,
        _nm: &mut NetworkMessage,
    ) -> Result<(), PubSubError> {
        Ok(())
    }
}

/// The standard fixture: service wired to the manual event loop, the
/// loopback transport, an in-memory node store and the JSON codec.
pub struct TestContext {
    pub service: Arc<PubSubService>,
    pub event_loop: Arc<ManualEventLoop>,
    pub transport: Arc<MemoryTransport>,
    pub node_store: Arc<MemoryNodeStore>,
    pub recorder: Arc<StateChangeRecorder>,
}

impl TestContext {
    pub fn new() -> Self {
        let event_loop = ManualEventLoop::new();
        let transport = MemoryTransport::new();
        let node_store = MemoryNodeStore::new();
        let recorder = Arc::new(StateChangeRecorder::default());
        let runtime = PubSubRuntime {
            config: PubSubConfig::default(),
            event_loop: event_loop.clone(),
            transport: transport.clone(),
            node_store: node_store.clone(),
            codec: Arc::new(JsonNetworkMessageCodec),
            state_change_callback: Some(recorder.callback()),
        };
        Self {
            service: PubSubService::new(runtime),
            event_loop,
            transport,
            node_store,
            recorder,
        }
    }

    /// Fixture with a transport whose connect attempts fail.
    pub fn with_failing_transport() -> Self {
        let event_loop = ManualEventLoop::new();
        let transport = MemoryTransport::new();
        let node_store = MemoryNodeStore::new();
        let recorder = Arc::new(StateChangeRecorder::default());
        let runtime = PubSubRuntime {
            config: PubSubConfig::default(),
            event_loop: event_loop.clone(),
            transport: Arc::new(FailingTransport),
            node_store: node_store.clone(),
            codec: Arc::new(JsonNetworkMessageCodec),
            state_change_callback: Some(recorder.callback()),
        };
        Self {
            service: PubSubService::new(runtime),
            event_loop,
            transport,
            node_store,
            recorder,
        }
    }

    pub fn inject_frame(&self, frame: Bytes) {
        self.transport.inject(ADDRESS, frame);
    }
}

pub fn connection_config(name: &str) -> ConnectionConfig {
    ConnectionConfig::new(name, PublisherId::UInt16(7), UDP_PROFILE, ADDRESS)
}

pub fn reader_group_config(name: &str) -> ReaderGroupConfig {
    ReaderGroupConfig {
        name: name.to_string(),
        subscribing_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

pub fn secured_reader_group_config(
    name: &str,
    security_group_id: &str,
    policy: Arc<dyn SecurityPolicy>,
) -> ReaderGroupConfig {
    ReaderGroupConfig {
        security_mode: SecurityMode::Sign,
        security_group_id: Some(security_group_id.to_string()),
        security_policy: Some(policy),
        ..reader_group_config(name)
    }
}

/// A reader matching `(publisher=7, writer_group=1, data_set_writer=1)`
/// with a single UInt32 field targeting `node`.
pub fn reader_config(name: &str, node: &NodeId) -> DataSetReaderConfig {
    DataSetReaderConfig {
        name: name.to_string(),
        publisher_id: PublisherId::UInt16(7),
        writer_group_id: 1,
        data_set_writer_id: 1,
        data_set_meta_data: DataSetMetaData {
            name: "speed-set".to_string(),
            fields: vec![FieldMetaData::new("speed", DataType::UInt32)],
        },
        target_variables: vec![FieldTarget::new(node.clone())],
        ..Default::default()
    }
}

pub fn writer_group_config(name: &str) -> WriterGroupConfig {
    WriterGroupConfig {
        name: name.to_string(),
        writer_group_id: 1,
        publishing_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

/// A writer publishing one UInt32 field sourced from `node` as
/// `data_set_writer_id = 1`.
pub fn writer_config(name: &str, node: &NodeId) -> DataSetWriterConfig {
    DataSetWriterConfig {
        name: name.to_string(),
        data_set_writer_id: 1,
        data_set_meta_data: DataSetMetaData {
            name: "speed-set".to_string(),
            fields: vec![FieldMetaData::new("speed", DataType::UInt32)],
        },
        published_fields: vec![PublishedField::new(node.clone())],
        ..Default::default()
    }
}

/// Encodes a JSON NetworkMessage frame with one DataSetMessage.
pub fn frame(publisher: u16, writer_group: u16, data_set_writer: u16, fields: Vec<Variant>) -> Bytes {
    let nm = NetworkMessage {
        content: NetworkMessageContentFlags::PUBLISHER_ID
            | NetworkMessageContentFlags::WRITER_GROUP_ID
            | NetworkMessageContentFlags::PAYLOAD_HEADER,
        publisher_id: Some(PublisherId::UInt16(publisher)),
        writer_group_id: Some(writer_group),
        security: None,
        messages: vec![DataSetMessage {
            data_set_writer_id: data_set_writer,
            sequence_number: 1,
            fields,
        }],
    };
    JsonNetworkMessageCodec.encode(&nm).expect("encode frame")
}
