//! Error types callers match on.
//!
//! Plumbing below the engine uses `anyhow`; these enums are the boundary the
//! engine and the store report through.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::events::FailureReason;
use crate::exit_codes;
use crate::plan::Story;

/// An unfinished story reported in a terminal failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoryFailure {
    pub id: String,
    pub title: String,
    pub retry_count: u32,
}

impl From<&Story> for StoryFailure {
    fn from(story: &Story) -> Self {
        Self {
            id: story.id.clone(),
            title: story.title.clone(),
            retry_count: story.retry_count,
        }
    }
}

impl fmt::Display for StoryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} attempts)", self.id, self.retry_count)
    }
}

fn join_failures(stories: &[StoryFailure]) -> String {
    stories
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Failures of the plan store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("plan not found at {}", .path.display())]
    NotFound { path: PathBuf },
    #[error("plan at {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("timed out after {waited:?} waiting for lock {}", .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },
    #[error("{0:#}")]
    Io(anyhow::Error),
}

/// Failures of the execution engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("plan generation failed: {0}")]
    Generation(String),
    #[error("no usable plan at {}: {reason}", .path.display())]
    Load { path: PathBuf, reason: String },
    #[error("plan state corrupted at {}: {reason}", .path.display())]
    CorruptState { path: PathBuf, reason: String },
    #[error("timed out after {waited:?} waiting for lock {}", .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },
    #[error("story {story_id} invocation failed: {reason}")]
    StoryInvocation { story_id: String, reason: String },
    #[error("retries exhausted: {}", join_failures(.stories))]
    RetryExhausted { stories: Vec<StoryFailure> },
    #[error("iteration ceiling of {max_iterations} reached; unfinished: {}", join_failures(.pending))]
    IterationCeiling {
        max_iterations: u32,
        pending: Vec<StoryFailure>,
    },
    #[error("run cancelled")]
    Cancelled,
    #[error("branch setup failed: {0:#}")]
    Branch(anyhow::Error),
    #[error("plan store failed: {0:#}")]
    Io(anyhow::Error),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { path } => EngineError::Load {
                path,
                reason: "file does not exist".to_string(),
            },
            StoreError::Corrupt { path, reason } => EngineError::CorruptState { path, reason },
            StoreError::LockTimeout { path, waited } => EngineError::LockTimeout { path, waited },
            StoreError::Io(err) => EngineError::Io(err),
        }
    }
}

impl EngineError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Generation(_) | EngineError::Load { .. } | EngineError::Branch(_) => {
                exit_codes::INVALID
            }
            EngineError::Cancelled => exit_codes::CANCELLED,
            EngineError::CorruptState { .. }
            | EngineError::LockTimeout { .. }
            | EngineError::StoryInvocation { .. }
            | EngineError::RetryExhausted { .. }
            | EngineError::IterationCeiling { .. }
            | EngineError::Io(_) => exit_codes::FAILED,
        }
    }

    /// Reason carried by the `RunFailed` event for this failure.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            EngineError::RetryExhausted { stories } => FailureReason::RetryExhausted {
                stories: stories.clone(),
            },
            EngineError::IterationCeiling {
                max_iterations,
                pending,
            } => FailureReason::IterationCeiling {
                max_iterations: *max_iterations,
                pending: pending.clone(),
            },
            EngineError::Cancelled => FailureReason::Cancelled,
            EngineError::Generation(_) | EngineError::Load { .. } | EngineError::Branch(_) => {
                FailureReason::Invalid {
                    message: self.to_string(),
                }
            }
            EngineError::CorruptState { .. }
            | EngineError::LockTimeout { .. }
            | EngineError::StoryInvocation { .. }
            | EngineError::Io(_) => FailureReason::Fatal {
                message: self.to_string(),
            },
        }
    }
}
