//! State machine module for protection management
//!
//! Provides an explicit state machine with two states:
//! - Inactive: Default state, no source is protected
//! - Active: Toggle, one source is protected and ducked while others play

mod machine;

pub use machine::{Effect, ProtectionState, State, StateMachine};
