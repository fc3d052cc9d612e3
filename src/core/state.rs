// src/core/state.rs

//! The component state shared by all PubSub entities.

use strum_macros::Display;

/// Lifecycle state of a PubSub component. The same machine governs
/// connections, reader/writer groups and the readers/writers they contain;
/// the transition handlers live with each component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum PubSubState {
    /// Initial state; no I/O takes place.
    #[default]
    Disabled,
    /// Configured, but the parent prevents operation.
    Paused,
    /// Resources acquired; waiting for the first message or warm-up.
    PreOperational,
    /// Steady state.
    Operational,
    /// Fault; resources have been released.
    Error,
}

impl PubSubState {
    /// A component in an active state holds scheduler and transport
    /// resources that must be released when it leaves.
    pub fn is_active(&self) -> bool {
        matches!(self, PubSubState::PreOperational | PubSubState::Operational)
    }
}
