// src/core/transport.rs

//! The transport collaborator interface and an in-memory loopback
//! implementation used by tests and single-process deployments.

use crate::core::errors::PubSubError;
use crate::core::topology::connection::ConnectionConfig;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Transport channels opened for one connection. A connection whose channels
/// are drained can be freed; until then deferred deletion keeps it parked.
#[derive(Debug, Default, Clone)]
pub struct ConnectionChannels {
    pub send_channel: Option<u64>,
    pub recv_channels: Vec<u64>,
}

impl ConnectionChannels {
    pub fn is_drained(&self) -> bool {
        self.send_channel.is_none() && self.recv_channels.is_empty()
    }
}

/// The transport contract consumed by the control plane. All calls run under
/// the service mutex; `receive` uses `timeout` as an advisory upper bound and
/// an expired wait is not an error.
pub trait PubSubTransport: Send + Sync {
    fn connect(&self, config: &ConnectionConfig) -> Result<ConnectionChannels, PubSubError>;

    fn disconnect(&self, channels: &mut ConnectionChannels);

    fn receive(
        &self,
        channels: &mut ConnectionChannels,
        timeout: Duration,
    ) -> Result<Vec<Bytes>, PubSubError>;

    fn send(&self, channels: &ConnectionChannels, payload: Bytes) -> Result<(), PubSubError>;
}

type FrameQueue = Arc<Mutex<VecDeque<Bytes>>>;

/// Loopback transport keyed by connection address. Frames sent on an address
/// are looped back into its inbound queue, and `inject` lets a test or a
/// co-located publisher feed frames directly.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    next_channel: AtomicU64,
    inbound: DashMap<String, FrameQueue>,
    sent: DashMap<String, Arc<Mutex<Vec<Bytes>>>>,
    channel_addresses: DashMap<u64, String>,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues a frame for delivery to every connection bound to `address`.
    pub fn inject(&self, address: &str, frame: Bytes) {
        self.queue_for(address).lock().push_back(frame);
    }

    /// All frames sent on `address` so far, in order.
    pub fn sent_frames(&self, address: &str) -> Vec<Bytes> {
        self.sent
            .get(address)
            .map(|log| log.lock().clone())
            .unwrap_or_default()
    }

    fn queue_for(&self, address: &str) -> FrameQueue {
        self.inbound
            .entry(address.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn next_channel_id(&self) -> u64 {
        self.next_channel.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl PubSubTransport for MemoryTransport {
    fn connect(&self, config: &ConnectionConfig) -> Result<ConnectionChannels, PubSubError> {
        if config.address.is_empty() {
            return Err(PubSubError::Transport(
                "connection address must not be empty".to_string(),
            ));
        }
        // Make sure the inbound queue exists before any channel reads it.
        self.queue_for(&config.address);

        let send_channel = self.next_channel_id();
        let recv_channel = self.next_channel_id();
        self.channel_addresses
            .insert(send_channel, config.address.clone());
        self.channel_addresses
            .insert(recv_channel, config.address.clone());

        Ok(ConnectionChannels {
            send_channel: Some(send_channel),
            recv_channels: vec![recv_channel],
        })
    }

    fn disconnect(&self, channels: &mut ConnectionChannels) {
        if let Some(ch) = channels.send_channel.take() {
            self.channel_addresses.remove(&ch);
        }
        for ch in channels.recv_channels.drain(..) {
            self.channel_addresses.remove(&ch);
        }
    }

    fn receive(
        &self,
        channels: &mut ConnectionChannels,
        _timeout: Duration,
    ) -> Result<Vec<Bytes>, PubSubError> {
        let mut frames = Vec::new();
        for ch in &channels.recv_channels {
            let Some(address) = self.channel_addresses.get(ch).map(|a| a.value().clone()) else {
                continue;
            };
            if let Some(queue) = self.inbound.get(&address) {
                frames.extend(queue.lock().drain(..));
            }
        }
        Ok(frames)
    }

    fn send(&self, channels: &ConnectionChannels, payload: Bytes) -> Result<(), PubSubError> {
        let Some(ch) = channels.send_channel else {
            return Err(PubSubError::ConnectionClosed);
        };
        let address = self
            .channel_addresses
            .get(&ch)
            .map(|a| a.value().clone())
            .ok_or(PubSubError::ConnectionClosed)?;

        self.sent
            .entry(address.clone())
            .or_default()
            .lock()
            .push(payload.clone());
        // Loop the frame back so co-located subscribers see it.
        self.queue_for(&address).lock().push_back(payload);
        Ok(())
    }
}
