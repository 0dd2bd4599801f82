//! Output capture and buffering for command logs.
//!
//! This module provides the per-command log storage (`LogBuffer`) and the capture pipe
//! that turns a child's stdout/stderr byte stream into log lines. It also handles text
//! sanitization for display.

use std::collections::VecDeque;
use std::sync::Weak;

use strip_ansi_escapes::strip;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, warn};

use crate::process::ProcessHandle;

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

impl StreamKind {
    /// Prefix prepended to every captured line from this stream.
    pub fn prefix(self) -> &'static str {
        match self {
            StreamKind::Stdout => "",
            StreamKind::Stderr => "ERR: ",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// An ordered sequence of log lines, optionally capped.
///
/// With no cap the buffer grows without bound. With a cap the oldest lines are
/// evicted first.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_lines: Option<usize>,
    lines: VecDeque<String>,
}

impl LogBuffer {
    /// Creates a buffer holding a single initial line.
    pub fn new(max_lines: Option<usize>, first: impl Into<String>) -> Self {
        let mut buffer = Self {
            max_lines: max_lines.map(|max| max.max(1)),
            lines: VecDeque::new(),
        };
        buffer.push(first);
        buffer
    }

    /// Adds a line to the buffer, evicting the oldest lines beyond the cap.
    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push_back(line.into());
        if let Some(max) = self.max_lines {
            while self.lines.len() > max {
                self.lines.pop_front();
            }
        }
    }

    /// Discards every line and starts over with `first`.
    pub fn reset(&mut self, first: impl Into<String>) {
        self.lines.clear();
        self.push(first);
    }

    /// Returns an owned copy of the current lines.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// Returns the number of lines currently in the buffer.
    pub fn len(&self) -> usize {
        self.lines.len()
    }
}

/// Reads `reader` until end-of-stream and appends each line to the handle's log.
///
/// Stops early when the handle is gone or has moved on to a newer run. A read error
/// is recorded as a log line and ends the pipe. The reader is dropped (and the
/// stream closed) on every exit path.
pub async fn capture_stream<R>(handle: Weak<ProcessHandle>, run: u64, stream: StreamKind, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let (line, last) = match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => (format!("{}{}", stream.prefix(), decode_line(&buf)), false),
            Err(err) => {
                warn!(stream = stream.label(), error = %err, "capture pipe read failed");
                (format!("Error reading {}: {}", stream.label(), err), true)
            }
        };
        let Some(handle) = handle.upgrade() else {
            debug!(stream = stream.label(), "process handle dropped, closing pipe");
            break;
        };
        if !handle.append_line(run, line) || last {
            break;
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let trimmed = raw.strip_suffix(b"\n").unwrap_or(raw);
    let trimmed = trimmed.strip_suffix(b"\r").unwrap_or(trimmed);
    String::from_utf8_lossy(trimmed).into_owned()
}

/// Strips ANSI escape codes for display. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str) -> String {
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}
