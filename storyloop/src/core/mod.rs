//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! plans and strings and return deterministic outputs suitable for tests.

pub mod actionability;
pub mod invariants;
pub mod repair;
pub mod selector;
pub mod state_update;
pub mod verbosity;
pub mod version;
