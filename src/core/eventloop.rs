// src/core/eventloop.rs

//! The event-loop collaborator interface and its Tokio-backed implementation.
//!
//! The control plane never owns timers or sockets directly: reader groups
//! register cyclic callbacks here, and deferred deletion goes through
//! delayed callbacks, so the loop implementation decides threading and
//! cadence policy.

use crate::core::errors::PubSubError;
use dashmap::DashMap;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handle for a registered cyclic callback. Non-zero by construction, so an
/// unscheduled component is simply `Option::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(NonZeroU64);

impl CallbackId {
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(CallbackId)
    }

    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }
}

/// What to do when a cyclic callback misses its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleMissPolicy {
    /// Fire immediately and realign the cadence to the current time.
    #[default]
    CurrentTime,
    /// Skip the missed cycles and wait for the next aligned deadline.
    SkipMissed,
}

/// A cyclic callback. Implementations re-enter the service under its mutex,
/// so the loop must invoke them from a context where blocking briefly is
/// acceptable.
pub type CyclicCallback = Arc<dyn Fn() + Send + Sync>;

/// A unit of work to run once, after all currently scheduled callbacks have
/// had a chance to observe the state that triggered it.
pub struct DelayedWork {
    run: Box<dyn FnOnce() + Send>,
}

impl DelayedWork {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self { run: Box::new(f) }
    }

    pub fn run(self) {
        (self.run)()
    }
}

impl std::fmt::Debug for DelayedWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedWork").finish_non_exhaustive()
    }
}

/// The event-loop contract consumed by the control plane. A connection may
/// carry a dedicated loop; otherwise the stack-wide one is used.
pub trait EventLoop: Send + Sync {
    fn add_cyclic_callback(
        &self,
        callback: CyclicCallback,
        interval: Duration,
        base_time: Option<Instant>,
        miss_policy: CycleMissPolicy,
    ) -> Result<CallbackId, PubSubError>;

    fn remove_cyclic_callback(&self, id: CallbackId);

    fn add_delayed_callback(&self, work: DelayedWork);
}

/// A custom callback channel supplied per reader/writer group. Groups with
/// blocking sockets must use one so the shared loop is never stalled.
pub trait SchedulerHook: Send + Sync {
    fn add_cyclic(
        &self,
        callback: CyclicCallback,
        interval: Duration,
    ) -> Result<CallbackId, PubSubError>;

    fn remove_cyclic(&self, id: CallbackId);
}

/// Production [`EventLoop`] running every cyclic callback on its own Tokio
/// task. Must be used from within a Tokio runtime.
#[derive(Debug)]
pub struct TokioEventLoop {
    next_id: AtomicU64,
    cyclic: DashMap<CallbackId, CancellationToken>,
    shutdown: CancellationToken,
}

impl TokioEventLoop {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            cyclic: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Cancels every cyclic callback; callbacks registered afterwards stop
    /// on their first poll.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.cyclic.clear();
    }
}

impl EventLoop for TokioEventLoop {
    fn add_cyclic_callback(
        &self,
        callback: CyclicCallback,
        interval: Duration,
        base_time: Option<Instant>,
        miss_policy: CycleMissPolicy,
    ) -> Result<CallbackId, PubSubError> {
        if interval.is_zero() {
            return Err(PubSubError::InvalidArgument(
                "cyclic callback interval must be non-zero".to_string(),
            ));
        }
        let raw = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = CallbackId::from_raw(raw)
            .ok_or_else(|| PubSubError::Internal("callback id overflow".to_string()))?;

        let token = self.shutdown.child_token();
        self.cyclic.insert(id, token.clone());

        tokio::spawn(async move {
            let start = match base_time {
                Some(at) => tokio::time::Instant::from_std(at),
                None => tokio::time::Instant::now() + interval,
            };
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(match miss_policy {
                CycleMissPolicy::CurrentTime => MissedTickBehavior::Delay,
                CycleMissPolicy::SkipMissed => MissedTickBehavior::Skip,
            });
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => callback(),
                }
            }
            debug!("Cyclic callback {} stopped.", id.as_u64());
        });

        Ok(id)
    }

    fn remove_cyclic_callback(&self, id: CallbackId) {
        if let Some((_, token)) = self.cyclic.remove(&id) {
            token.cancel();
        }
    }

    fn add_delayed_callback(&self, work: DelayedWork) {
        tokio::spawn(async move {
            // Give in-flight callbacks one scheduling round to complete.
            tokio::task::yield_now().await;
            work.run();
        });
    }
}
