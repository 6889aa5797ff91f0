//! Progress events published by the engine.
//!
//! The stream is a bounded multi-producer/single-consumer channel. Producers
//! wait for capacity instead of dropping events, so a presenter never misses a
//! `StoryFinished`. When the consumer goes away the run keeps going and events
//! are discarded.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::verbosity::is_verbose;
use crate::error::StoryFailure;
use crate::exit_codes;

/// Which subprocess stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LineOrigin {
    Stdout,
    Stderr,
}

/// One line of agent output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputLine {
    pub origin: LineOrigin,
    pub text: String,
    /// Framework chatter a presenter may hide.
    pub verbose: bool,
}

impl OutputLine {
    pub fn new(origin: LineOrigin, text: impl Into<String>) -> Self {
        let text = text.into();
        let verbose = is_verbose(&text);
        Self {
            origin,
            text,
            verbose,
        }
    }
}

/// How a single story invocation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoryOutcome {
    /// The agent exited cleanly and the story now passes.
    Passed,
    /// The agent exited cleanly but did not mark the story as passing.
    NotPassing,
    /// The agent could not be run or exited abnormally.
    InvocationFailed { reason: String },
    /// The run was cancelled while the agent was working.
    Cancelled,
}

/// Why a run stopped without completing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    RetryExhausted {
        stories: Vec<StoryFailure>,
    },
    IterationCeiling {
        max_iterations: u32,
        pending: Vec<StoryFailure>,
    },
    Cancelled,
    /// No usable plan could be generated or loaded, or the branch could not be set up.
    Invalid {
        message: String,
    },
    /// The store failed mid-run; the engine had no trustworthy state left.
    Fatal {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    PlanningStarted {
        prompt: String,
    },
    PlanReady {
        project: String,
        branch_name: String,
        version: u64,
        stories: usize,
        passed: usize,
    },
    StoryStarted {
        iteration: u32,
        story_id: String,
        title: String,
        /// 1-based attempt number for this story.
        attempt: u32,
    },
    OutputLine(OutputLine),
    StoryFinished {
        iteration: u32,
        story_id: String,
        outcome: StoryOutcome,
        retry_count: u32,
    },
    /// Non-fatal observation, e.g. a version conflict.
    Warning {
        message: String,
    },
    /// Non-fatal failure of a side task, e.g. a commit.
    Error {
        message: String,
    },
    RunCompleted {
        iterations: u32,
    },
    RunFailed {
        reason: FailureReason,
    },
}

impl Event {
    /// Terminal events end a run; the last one observed decides the final status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::RunCompleted { .. } | Event::RunFailed { .. })
    }
}

/// Final status a consumer derives from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Cancelled,
    Failed(FailureReason),
    /// The stream closed without a terminal event.
    Unknown,
}

impl RunStatus {
    fn from_terminal(event: &Event) -> Option<Self> {
        match event {
            Event::RunCompleted { .. } => Some(RunStatus::Completed),
            Event::RunFailed {
                reason: FailureReason::Cancelled,
            } => Some(RunStatus::Cancelled),
            Event::RunFailed { reason } => Some(RunStatus::Failed(reason.clone())),
            _ => None,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Completed => exit_codes::OK,
            RunStatus::Cancelled => exit_codes::CANCELLED,
            RunStatus::Failed(FailureReason::Invalid { .. }) | RunStatus::Unknown => {
                exit_codes::INVALID
            }
            RunStatus::Failed(_) => exit_codes::FAILED,
        }
    }
}

/// Create a bounded event stream.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender { tx }, EventReceiver { rx })
}

/// Producer half; cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
}

impl EventSender {
    /// Publish an event, waiting for capacity if the queue is full.
    pub async fn publish(&self, event: Event) {
        if self.tx.send(event).await.is_err() {
            debug!("event consumer closed, dropping event");
        }
    }

    pub async fn warn(&self, message: impl Into<String>) {
        self.publish(Event::Warning {
            message: message.into(),
        })
        .await;
    }

    pub async fn line(&self, origin: LineOrigin, text: impl Into<String>) {
        self.publish(Event::OutputLine(OutputLine::new(origin, text)))
            .await;
    }
}

/// Consumer half.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<Event>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Drain until every sender is gone, returning the final status.
    pub async fn drain<F: FnMut(&Event)>(mut self, mut on_event: F) -> RunStatus {
        let mut status = RunStatus::Unknown;
        while let Some(event) = self.rx.recv().await {
            if let Some(next) = RunStatus::from_terminal(&event) {
                status = next;
            }
            on_event(&event);
        }
        status
    }

    /// Drain into a vector (handy for tests and batch consumers).
    pub async fn collect(mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn preserves_order_and_reports_last_terminal() {
        let (tx, rx) = channel(4);
        let producer = tokio::spawn(async move {
            tx.publish(Event::Warning {
                message: "w".to_string(),
            })
            .await;
            tx.publish(Event::RunFailed {
                reason: FailureReason::Cancelled,
            })
            .await;
            tx.publish(Event::RunCompleted { iterations: 2 }).await;
        });

        let mut seen = Vec::new();
        let status = rx
            .drain(|event| seen.push(event.is_terminal()))
            .await;
        producer.await.expect("producer");

        assert_eq!(seen, vec![false, true, true]);
        assert_eq!(status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn full_queue_applies_backpressure() {
        let (tx, mut rx) = channel(1);
        tx.publish(Event::RunCompleted { iterations: 0 }).await;

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            tx.publish(Event::RunCompleted { iterations: 1 }),
        )
        .await;
        assert!(blocked.is_err(), "second publish should wait for capacity");

        assert_eq!(rx.recv().await, Some(Event::RunCompleted { iterations: 0 }));
        tx.publish(Event::RunCompleted { iterations: 2 }).await;
        assert_eq!(rx.recv().await, Some(Event::RunCompleted { iterations: 2 }));
    }

    #[tokio::test]
    async fn publishing_after_consumer_drop_is_harmless() {
        let (tx, rx) = channel(1);
        drop(rx);
        tx.warn("nobody listening").await;
    }

    #[tokio::test]
    async fn stream_without_terminal_event_is_unknown() {
        let (tx, rx) = channel(2);
        tx.line(LineOrigin::Stdout, "hello").await;
        drop(tx);
        let status = rx.drain(|_| {}).await;
        assert_eq!(status, RunStatus::Unknown);
        assert_eq!(status.exit_code(), exit_codes::INVALID);
    }

    #[test]
    fn cancelled_run_maps_to_cancelled_status() {
        let status = RunStatus::from_terminal(&Event::RunFailed {
            reason: FailureReason::Cancelled,
        });
        assert_eq!(status, Some(RunStatus::Cancelled));
        assert_eq!(RunStatus::Cancelled.exit_code(), exit_codes::CANCELLED);
    }
}
