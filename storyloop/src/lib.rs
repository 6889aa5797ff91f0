//! Iterative story runner for an external code-generation agent.
//!
//! A feature request becomes a persisted plan of small stories; the engine then
//! hands the stories to the agent one at a time, reading the agent's results
//! back out of the plan file, until every story passes or the run gives up.
//!
//! - **[`core`]**: Pure, deterministic logic (selection, repair, version and
//!   retry bookkeeping, actionability). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting collaborators (plan store, agent process, git,
//!   prompts, config). Each seam is a trait so tests can script it.
//! - **[`engine`]**: Orchestration of `generate`, `load` and `run`.
//! - **[`events`]**: The bounded progress stream front ends consume.

pub mod core;
pub mod engine;
pub mod error;
pub mod events;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod plan;
pub mod presenter;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
