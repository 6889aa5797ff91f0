//! Side-effecting collaborators: files, processes, git.

pub mod agent;
pub mod config;
pub mod git;
pub mod multiplex;
pub mod plan_store;
pub mod progress_log;
pub mod prompt;
