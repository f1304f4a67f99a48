//! ducking-daemon: keep one protected audio source audible over the rest
//!
//! While a source is protected, the coordinator polls every other
//! connected source for audible playback, lowers the protected source
//! when something else starts, and restores its original volume once
//! everything else goes quiet.

pub mod agent;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod ipc;
pub mod lifecycle;
pub mod monitor;
pub mod state;
pub mod store;
