// tests/property_test.rs

//! Property-based tests for Ferrobus.
//!
//! Random sequences of control-plane operations are applied to a live
//! service, and the structural invariants are checked after every step.

#[path = "common/mod.rs"]
mod common;

mod property {
    pub mod invariants_test;
}
