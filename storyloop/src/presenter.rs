//! Line-oriented terminal presenter for the event stream.

use crate::events::{Event, EventReceiver, FailureReason, LineOrigin, RunStatus, StoryOutcome};

/// Where a rendered line goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Presenter {
    /// Show agent lines classified as verbose.
    pub show_verbose: bool,
    /// Emit one JSON object per event instead of text.
    pub json: bool,
}

impl Presenter {
    /// Drain the stream to the terminal, returning the final status.
    pub async fn drain(self, events: EventReceiver) -> RunStatus {
        events
            .drain(|event| {
                if let Some((stream, line)) = self.render(event) {
                    match stream {
                        Stream::Stdout => println!("{line}"),
                        Stream::Stderr => eprintln!("{line}"),
                    }
                }
            })
            .await
    }

    /// Text for one event, or `None` if it is hidden.
    pub fn render(&self, event: &Event) -> Option<(Stream, String)> {
        if self.json {
            return serde_json::to_string(event)
                .ok()
                .map(|line| (Stream::Stdout, line));
        }
        let out = |text: String| Some((Stream::Stdout, text));
        match event {
            Event::PlanningStarted { prompt } => {
                let first = prompt.lines().next().unwrap_or_default().trim();
                out(format!("planning: {first}"))
            }
            Event::PlanReady {
                project,
                branch_name,
                version,
                stories,
                passed,
            } => {
                let branch = if branch_name.is_empty() {
                    String::new()
                } else {
                    format!(" on {branch_name}")
                };
                out(format!(
                    "plan ready: {project}{branch} ({passed}/{stories} stories passing, version {version})"
                ))
            }
            Event::StoryStarted {
                iteration,
                story_id,
                title,
                attempt,
            } => out(format!(
                "[{iteration}] {story_id}: {title} (attempt {attempt})"
            )),
            Event::OutputLine(line) => {
                if line.verbose && !self.show_verbose {
                    return None;
                }
                let marker = match line.origin {
                    LineOrigin::Stdout => "|",
                    LineOrigin::Stderr => "!",
                };
                out(format!("    {marker} {}", line.text))
            }
            Event::StoryFinished {
                iteration,
                story_id,
                outcome,
                retry_count,
            } => {
                let result = match outcome {
                    StoryOutcome::Passed => "passed".to_string(),
                    StoryOutcome::NotPassing => format!("not passing (failed attempts: {retry_count})"),
                    StoryOutcome::InvocationFailed { reason } => {
                        format!("agent failed: {reason} (failed attempts: {retry_count})")
                    }
                    StoryOutcome::Cancelled => "cancelled".to_string(),
                };
                out(format!("[{iteration}] {story_id}: {result}"))
            }
            Event::Warning { message } => Some((Stream::Stderr, format!("warning: {message}"))),
            Event::Error { message } => Some((Stream::Stderr, format!("error: {message}"))),
            Event::RunCompleted { iterations } => {
                out(format!("all stories pass ({iterations} iterations)"))
            }
            Event::RunFailed { reason } => Some((Stream::Stderr, describe_failure(reason))),
        }
    }
}

fn describe_failure(reason: &FailureReason) -> String {
    let list = |stories: &[crate::error::StoryFailure]| {
        stories
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };
    match reason {
        FailureReason::RetryExhausted { stories } => {
            format!("run failed: retries exhausted for {}", list(stories))
        }
        FailureReason::IterationCeiling {
            max_iterations,
            pending,
        } => format!(
            "run failed: iteration ceiling of {max_iterations} reached; unfinished: {}",
            list(pending)
        ),
        FailureReason::Cancelled => "run cancelled; the plan is kept for `storyloop run`".to_string(),
        FailureReason::Invalid { message } | FailureReason::Fatal { message } => {
            format!("run failed: {message}")
        }
    }
}
