//! Line multiplexer: stdout and stderr of one subprocess into the event stream.
//!
//! Each stream gets its own reader task so a chatty stderr never stalls stdout.
//! Lines keep their order within a stream; interleaving across streams is
//! whatever the scheduler produces.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::events::{EventSender, LineOrigin};

/// Lines longer than this are published in consecutive chunks.
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// Reader tasks for one subprocess.
#[derive(Debug)]
pub struct OutputPumps {
    stdout: JoinHandle<io::Result<usize>>,
    stderr: JoinHandle<io::Result<usize>>,
}

impl OutputPumps {
    /// Start one reader per stream.
    pub fn spawn<O, E>(stdout: O, stderr: E, events: &EventSender) -> Self
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let out_events = events.clone();
        let err_events = events.clone();
        Self {
            stdout: tokio::spawn(async move {
                pump_lines(stdout, LineOrigin::Stdout, &out_events, MAX_LINE_BYTES).await
            }),
            stderr: tokio::spawn(async move {
                pump_lines(stderr, LineOrigin::Stderr, &err_events, MAX_LINE_BYTES).await
            }),
        }
    }

    /// Wait for both readers to hit end-of-stream; returns the number of lines published.
    ///
    /// Read errors end that stream early and are logged; they never fail the invocation.
    pub async fn finish(self) -> usize {
        let mut total = 0;
        for (origin, handle) in [
            (LineOrigin::Stdout, self.stdout),
            (LineOrigin::Stderr, self.stderr),
        ] {
            match handle.await {
                Ok(Ok(lines)) => total += lines,
                Ok(Err(err)) => warn!(?origin, %err, "output reader stopped early"),
                Err(err) => warn!(?origin, %err, "output reader task failed"),
            }
        }
        debug!(lines = total, "output drained");
        total
    }

    /// Like [`OutputPumps::finish`], but gives up after `grace`.
    ///
    /// Used after the process was killed: anything that inherited the pipes can
    /// keep them open indefinitely. Readers still running at the deadline are
    /// aborted and their remaining output is lost.
    pub async fn finish_within(self, grace: Duration) -> Option<usize> {
        let stdout = self.stdout.abort_handle();
        let stderr = self.stderr.abort_handle();
        match tokio::time::timeout(grace, self.finish()).await {
            Ok(total) => Some(total),
            Err(_) => {
                warn!(?grace, "output pipes still open, abandoning readers");
                stdout.abort();
                stderr.abort();
                None
            }
        }
    }
}

/// Publish every line of `reader` as an `OutputLine` event.
///
/// Lines longer than `max_line_bytes` are split into chunks; a multi-byte
/// character cut at a chunk boundary is carried into the next chunk.
pub async fn pump_lines<R>(
    reader: R,
    origin: LineOrigin,
    events: &EventSender,
    max_line_bytes: usize,
) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let limit = u64::try_from(max_line_bytes).unwrap_or(u64::MAX);
    let mut buf = Vec::new();
    let mut carry = Vec::new();
    let mut mid_line = false;
    let mut published = 0;

    loop {
        buf.clear();
        buf.append(&mut carry);
        let read = (&mut reader).take(limit).read_until(b'\n', &mut buf).await?;
        if read == 0 {
            if !buf.is_empty() {
                events.line(origin, decode(&buf)).await;
                published += 1;
            }
            break;
        }

        let complete = buf.last() == Some(&b'\n');
        if complete {
            // The newline that ends a chunked line is not a line of its own.
            if mid_line && strip_eol(&buf).is_empty() {
                mid_line = false;
                continue;
            }
            mid_line = false;
        } else {
            carry = split_incomplete_char(&mut buf);
            mid_line = true;
        }
        events.line(origin, decode(&buf)).await;
        published += 1;
    }
    Ok(published)
}

fn strip_eol(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    bytes.strip_suffix(b"\r").unwrap_or(bytes)
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(strip_eol(bytes)).into_owned()
}

/// Detach a truncated UTF-8 sequence from the end of `buf`.
fn split_incomplete_char(buf: &mut Vec<u8>) -> Vec<u8> {
    match std::str::from_utf8(buf) {
        Err(err) if err.error_len().is_none() => buf.split_off(err.valid_up_to()),
        _ => Vec::new(),
    }
}
