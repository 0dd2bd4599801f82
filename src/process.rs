//! Data structures for command definitions and per-command run state.
//!
//! This module defines the immutable definition of a command (`CommandSpec`), its
//! stable identity (`CommandId`), and the lock-guarded run state (`ProcessHandle`)
//! that holds the running flag and captured log.

use std::fmt;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::output::LogBuffer;

/// Log content of a command that has never been started.
pub const NO_LOGS: &str = "No logs available...";
/// Final log line of a run that exited with status 0.
pub const SUCCESS_LINE: &str = "Process completed successfully";

/// Stable identity of a command, derived from its category and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(String);

impl CommandId {
    /// Builds the identity `<category>/<name>`, trimming both parts and collapsing
    /// internal whitespace runs.
    pub fn new(category: &str, name: &str) -> Self {
        Self(format!("{}/{}", collapse_whitespace(category), collapse_whitespace(name)))
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn collapse_whitespace(part: &str) -> String {
    part.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Specification for a command to be run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub id: CommandId,
    /// Category (tab) the command belongs to.
    pub category: String,
    /// Friendly name for the command.
    pub name: String,
    /// The command executable.
    pub exec: String,
    /// Arguments for the command.
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Human-readable command line, quoted the way a shell would need it.
    pub fn description(&self) -> String {
        shell_words::join(std::iter::once(&self.exec).chain(self.args.iter()))
    }

    /// First log line of every run.
    pub fn start_banner(&self) -> String {
        format!("Starting process: {} [{}]", self.exec, self.args.join(" "))
    }
}

/// The live OS process behind a running handle.
#[derive(Debug)]
pub struct OsProcess {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl OsProcess {
    pub fn new(pid: Option<u32>, kill_tx: oneshot::Sender<()>) -> Self {
        Self {
            pid,
            kill_tx: Some(kill_tx),
        }
    }

    #[cfg(test)]
    pub fn detached() -> Self {
        Self {
            pid: None,
            kill_tx: None,
        }
    }

    /// Forcefully kills the process without waiting for it to exit.
    pub fn kill(mut self) {
        if let Some(pid) = self.pid {
            kill_process_group(pid);
        }
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Sends SIGKILL to the process group led by `pid`.
#[cfg(unix)]
pub fn kill_process_group(pid: u32) {
    // Children are spawned as process group leaders.
    unsafe {
        let _ = libc::kill(-(pid as i32), libc::SIGKILL);
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(_pid: u32) {}

/// Result of [`ProcessHandle::mark_started`].
#[derive(Debug)]
pub enum Launch<T> {
    /// The run was stopped or superseded while its process was being spawned.
    Cancelled,
    /// The process could not be launched.
    Failed,
    /// The process is running as generation `run`.
    Started { run: u64, value: T },
}

#[cfg(test)]
impl<T> Launch<T> {
    pub fn started(self) -> Option<(u64, T)> {
        match self {
            Launch::Started { run, value } => Some((run, value)),
            _ => None,
        }
    }
}

/// Result of [`ProcessHandle::mark_exited`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The run was already closed or a newer run has started; nothing changed.
    Stale,
    /// The process exited while the handle was running.
    Exited,
    /// The process exited after the user stopped it.
    AfterStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stopped,
    Starting,
    Running,
}

#[derive(Debug)]
struct HandleState {
    phase: Phase,
    has_run: bool,
    generation: u64,
    /// Set once the current run has written its terminal line.
    closed: bool,
    log: LogBuffer,
    os: Option<OsProcess>,
}

/// Run state and captured output of one command.
///
/// Every field sits behind a single mutex. Writers from a previous run are told
/// apart by a generation number so they never touch a newer run.
#[derive(Debug)]
pub struct ProcessHandle {
    state: Mutex<HandleState>,
}

impl ProcessHandle {
    pub fn new(max_lines: Option<usize>) -> Self {
        Self {
            state: Mutex::new(HandleState {
                phase: Phase::Stopped,
                has_run: false,
                generation: 0,
                closed: true,
                log: LogBuffer::new(max_lines, NO_LOGS),
                os: None,
            }),
        }
    }

    /// Returns an owned copy of the log.
    pub fn snapshot_log(&self) -> Vec<String> {
        self.state.lock().log.snapshot()
    }

    /// `true` while a run is starting or running.
    pub fn is_running(&self) -> bool {
        self.state.lock().phase != Phase::Stopped
    }

    pub fn has_ever_run(&self) -> bool {
        self.state.lock().has_run
    }

    /// Reserves a new run, or returns `None` if one is already starting or running.
    ///
    /// The log is reset to `banner` and `has_run` is set. `has_run` stays set
    /// if the launch then fails, so the error can be read in the log viewer.
    pub fn mark_starting(&self, banner: String) -> Option<u64> {
        let mut state = self.state.lock();
        if state.phase != Phase::Stopped {
            return None;
        }
        state.generation += 1;
        state.phase = Phase::Starting;
        state.has_run = true;
        state.closed = false;
        state.log.reset(banner);
        Some(state.generation)
    }

    /// Completes run `run` with the outcome of spawning its process.
    ///
    /// On success the handle becomes running and owns the [`OsProcess`]. On
    /// failure the error text is appended and the handle is stopped. If the run
    /// was stopped in the meantime, a freshly spawned process is killed.
    pub fn mark_started<T, E>(&self, run: u64, launch: Result<(OsProcess, T), E>) -> Launch<T>
    where
        E: fmt::Display,
    {
        let mut state = self.state.lock();
        if state.generation != run || state.phase != Phase::Starting {
            if let Ok((os, _)) = launch {
                os.kill();
            }
            return Launch::Cancelled;
        }
        match launch {
            Ok((os, value)) => {
                state.phase = Phase::Running;
                state.os = Some(os);
                Launch::Started { run, value }
            }
            Err(err) => {
                state.phase = Phase::Stopped;
                state.closed = true;
                state.log.push(err.to_string());
                Launch::Failed
            }
        }
    }

    /// Appends a line for run `run`. Returns `false` once that run is closed or superseded.
    pub fn append_line(&self, run: u64, line: String) -> bool {
        let mut state = self.state.lock();
        if state.generation != run || state.closed {
            return false;
        }
        state.log.push(line);
        true
    }

    /// Writes the terminal line of run `run` and closes it to further output.
    pub fn mark_exited(&self, run: u64, line: String) -> Exit {
        let mut state = self.state.lock();
        if state.generation != run || state.closed {
            return Exit::Stale;
        }
        let was_running = state.phase == Phase::Running;
        state.phase = Phase::Stopped;
        state.closed = true;
        state.os = None;
        state.log.push(line);
        debug!(run, lines = state.log.len(), "run finished");
        if was_running {
            Exit::Exited
        } else {
            Exit::AfterStop
        }
    }

    /// Kills the live process, if any, and marks the handle stopped right away.
    ///
    /// Returns `false` when the handle was neither starting nor running.
    pub fn mark_stopped(&self) -> bool {
        let mut state = self.state.lock();
        match state.phase {
            Phase::Stopped => false,
            Phase::Starting => {
                state.phase = Phase::Stopped;
                true
            }
            Phase::Running => {
                if let Some(os) = state.os.take() {
                    os.kill();
                }
                state.phase = Phase::Stopped;
                true
            }
        }
    }
}
