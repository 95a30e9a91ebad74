//! Scripted collaborators and fixtures for testing quorch executions.
//!
//! [`ScriptedBackend`] plays the job backend and emits quantum task events,
//! [`StaticDeviceOracle`] answers device checks and [`RecordingNotifier`]
//! keeps the notifications. [`TestHarness`] wires them into a started
//! orchestrator.

mod fixtures;
mod mock;

pub use fixtures::*;
pub use mock::*;
