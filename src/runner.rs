//! Process execution and management.
//!
//! This module contains the `ProcessController`, which is responsible for starting,
//! stopping, and observing child processes. It wires capture pipes to each child's
//! output streams and bridges process lifecycle transitions to the event channel.

use std::process::Stdio;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::Event;
use crate::output::{capture_stream, StreamKind};
use crate::process::{
    kill_process_group, CommandId, CommandSpec, Exit, Launch, OsProcess, ProcessHandle,
    SUCCESS_LINE,
};
use crate::registry::ProcessRegistry;

/// How long the waiter lets capture pipes drain after the child has exited.
const PIPE_DRAIN: Duration = Duration::from_secs(1);

/// Starts and stops commands and reports their state changes.
///
/// Cloning is cheap; every clone shares the same registry and event channel.
#[derive(Debug, Clone)]
pub struct ProcessController {
    registry: Arc<ProcessRegistry>,
    event_tx: mpsc::UnboundedSender<Event>,
}

struct Spawned {
    child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    kill_rx: oneshot::Receiver<()>,
}

impl ProcessController {
    pub fn new(registry: Arc<ProcessRegistry>, event_tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { registry, event_tx }
    }

    /// Makes sure a handle exists for `id`.
    pub fn track(&self, id: &CommandId) {
        self.registry.get_or_create(id);
    }

    /// Starts `spec` unless it is already starting or running.
    ///
    /// Returns `true` if a new run was reserved. The process itself is spawned on
    /// the blocking pool; the outcome is reported as [`Event::ProcessStarted`] or,
    /// with the error recorded in the command's own log, [`Event::ProcessFailed`].
    /// Must be called from within a tokio runtime.
    pub fn start(&self, spec: &CommandSpec) -> bool {
        let handle = self.registry.get_or_create(&spec.id);
        let Some(run) = handle.mark_starting(spec.start_banner()) else {
            debug!(id = %spec.id, "start ignored, already running");
            return false;
        };
        debug!(id = %spec.id, run, "launching process");

        let controller = self.clone();
        let spec = spec.clone();
        tokio::spawn(async move {
            let command = spec.clone();
            let launch = tokio::task::spawn_blocking(move || spawn_command(&command))
                .await
                .unwrap_or_else(|err| Err(format!("Error: {}", err)));
            controller.launched(&spec, &handle, run, launch);
        });
        true
    }

    fn launched(
        &self,
        spec: &CommandSpec,
        handle: &Arc<ProcessHandle>,
        run: u64,
        launch: Result<(OsProcess, Spawned), String>,
    ) {
        match handle.mark_started(run, launch) {
            Launch::Cancelled => {
                debug!(id = %spec.id, run, "launch cancelled by stop");
            }
            Launch::Failed => {
                warn!(id = %spec.id, exec = %spec.exec, "failed to launch command");
                self.publish(Event::ProcessFailed {
                    id: spec.id.clone(),
                });
            }
            Launch::Started { run, value } => {
                info!(id = %spec.id, pid = ?value.child.id(), run, "process started");
                self.publish(Event::ProcessStarted {
                    id: spec.id.clone(),
                });

                let weak = Arc::downgrade(handle);
                let pipes = vec![
                    tokio::spawn(capture_stream(
                        weak.clone(),
                        run,
                        StreamKind::Stdout,
                        value.stdout,
                    )),
                    tokio::spawn(capture_stream(
                        weak.clone(),
                        run,
                        StreamKind::Stderr,
                        value.stderr,
                    )),
                ];
                tokio::spawn(wait_for_exit(
                    spec.id.clone(),
                    weak,
                    run,
                    value.child,
                    value.kill_rx,
                    pipes,
                    self.event_tx.clone(),
                ));
            }
        }
    }

    /// Kills the process for `id` and marks it stopped without waiting for the OS.
    ///
    /// Returns `false`, with no log change and no event, if it was not running.
    pub fn stop(&self, id: &CommandId) -> bool {
        let Some(handle) = self.registry.get(id) else {
            return false;
        };
        if !handle.mark_stopped() {
            return false;
        }
        info!(%id, "process stopped");
        self.publish(Event::ProcessStopped { id: id.clone() });
        true
    }

    /// Stops every running process. Returns how many were stopped.
    pub fn stop_all(&self) -> usize {
        self.registry
            .running()
            .iter()
            .filter(|id| self.stop(id))
            .count()
    }

    /// Snapshot of the log for `id`.
    pub fn logs(&self, id: &CommandId) -> Vec<String> {
        self.registry.get_or_create(id).snapshot_log()
    }

    pub fn is_running(&self, id: &CommandId) -> bool {
        self.registry
            .get(id)
            .map(|handle| handle.is_running())
            .unwrap_or(false)
    }

    pub fn has_ever_run(&self, id: &CommandId) -> bool {
        self.registry
            .get(id)
            .map(|handle| handle.has_ever_run())
            .unwrap_or(false)
    }

    fn publish(&self, event: Event) {
        if self.event_tx.send(event).is_err() {
            debug!("event receiver closed");
        }
    }
}

fn spawn_command(spec: &CommandSpec) -> Result<(OsProcess, Spawned), String> {
    let mut command = Command::new(&spec.exec);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.kill_on_drop(true);

    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    let mut child = command.spawn().map_err(|err| format!("Error: {}", err))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "Error creating stdout pipe".to_string())?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| "Error creating stderr pipe".to_string())?;
    let (kill_tx, kill_rx) = oneshot::channel();
    let os = OsProcess::new(child.id(), kill_tx);
    Ok((
        os,
        Spawned {
            child,
            stdout,
            stderr,
            kill_rx,
        },
    ))
}

// Waits for the child to exit (or to be killed), lets its pipes drain, then
// writes the terminal log line and publishes the final event of the run.
async fn wait_for_exit(
    id: CommandId,
    handle: Weak<ProcessHandle>,
    run: u64,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    mut pipes: Vec<JoinHandle<()>>,
    event_tx: mpsc::UnboundedSender<Event>,
) {
    let pid = child.id();
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            let _ = child.start_kill();
            child.wait().await
        }
    };

    let deadline = Instant::now() + PIPE_DRAIN;
    for pipe in pipes.iter_mut() {
        if tokio::time::timeout_at(deadline, pipe).await.is_err() {
            debug!(%id, "output pipe still open after exit");
        }
    }
    // Whatever is left in the group outlived the child.
    if let Some(pid) = pid {
        kill_process_group(pid);
    }
    for pipe in &pipes {
        pipe.abort();
    }

    let (line, success) = match &status {
        Ok(status) if status.success() => (SUCCESS_LINE.to_string(), true),
        Ok(status) => (format!("Process exited with error: {}", status), false),
        Err(err) => (format!("Process exited with error: {}", err), false),
    };

    let Some(handle) = handle.upgrade() else {
        return;
    };
    let stopped = match handle.mark_exited(run, line) {
        Exit::Stale => {
            debug!(%id, run, "exit of a superseded run ignored");
            return;
        }
        Exit::Exited => false,
        Exit::AfterStop => true,
    };
    info!(%id, run, success, stopped, "process exited");
    let _ = event_tx.send(Event::ProcessExited {
        id,
        success,
        stopped,
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::process::NO_LOGS;
    use tokio::sync::mpsc::error::TryRecvError;

    fn controller() -> (ProcessController, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ProcessController::new(Arc::new(ProcessRegistry::new(None)), tx), rx)
    }

    fn spec(name: &str, exec: &str, args: &[&str]) -> CommandSpec {
        CommandSpec {
            id: CommandId::new("Test", name),
            category: "Test".to_string(),
            name: name.to_string(),
            exec: exec.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn sh(name: &str, script: &str) -> CommandSpec {
        spec(name, "sh", &["-c", script])
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn next_started(rx: &mut mpsc::UnboundedReceiver<Event>, id: &CommandId) {
        match next_event(rx).await {
            Event::ProcessStarted { id: got } => assert_eq!(&got, id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    /// Waits for the exit of `id`, returning `(success, stopped)`.
    async fn next_exit(rx: &mut mpsc::UnboundedReceiver<Event>, id: &CommandId) -> (bool, bool) {
        loop {
            match next_event(rx).await {
                Event::ProcessExited {
                    id: got,
                    success,
                    stopped,
                } if &got == id => return (success, stopped),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn never_started_command_has_only_sentinel() {
        let (controller, _rx) = controller();
        let id = CommandId::new("Test", "idle");
        controller.track(&id);
        assert!(!controller.has_ever_run(&id));
        assert!(!controller.is_running(&id));
        assert_eq!(controller.logs(&id), vec![NO_LOGS]);
    }

    #[tokio::test]
    async fn echo_runs_to_completion() {
        let (controller, mut rx) = controller();
        let echo = spec("echo", "echo", &["hello"]);
        assert!(controller.start(&echo));
        next_started(&mut rx, &echo.id).await;
        assert_eq!(next_exit(&mut rx, &echo.id).await, (true, false));
        assert_eq!(
            controller.logs(&echo.id),
            vec!["Starting process: echo [hello]", "hello", SUCCESS_LINE]
        );
        assert!(!controller.is_running(&echo.id));
        assert!(controller.has_ever_run(&echo.id));
    }

    #[tokio::test]
    async fn running_is_visible_before_any_output() {
        let (controller, mut rx) = controller();
        let cmd = sh("chatty", "echo first; echo second");
        assert!(controller.start(&cmd));
        assert!(controller.is_running(&cmd.id));
        assert_eq!(controller.logs(&cmd.id).len(), 1);
        next_started(&mut rx, &cmd.id).await;
        assert!(next_exit(&mut rx, &cmd.id).await.0);
        let log = controller.logs(&cmd.id);
        assert_eq!(&log[1..], &["first", "second", SUCCESS_LINE]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported() {
        let (controller, mut rx) = controller();
        let cmd = sh("fails", "echo oops >&2; exit 3");
        controller.start(&cmd);
        assert_eq!(next_exit(&mut rx, &cmd.id).await, (false, false));
        let log = controller.logs(&cmd.id);
        assert!(log.contains(&"ERR: oops".to_string()));
        let last = log.last().unwrap();
        assert!(last.starts_with("Process exited with error:"), "{}", last);
        assert!(last.contains('3'), "{}", last);
        assert!(!controller.is_running(&cmd.id));
    }

    #[tokio::test]
    async fn spawn_failure_stays_in_own_log() {
        let (controller, mut rx) = controller();
        let missing = spec("missing", "/nonexistent/cmdrack-test-binary", &[]);
        assert!(controller.start(&missing));
        assert!(matches!(next_event(&mut rx).await, Event::ProcessFailed { .. }));
        let log = controller.logs(&missing.id);
        assert_eq!(log.len(), 2);
        assert!(log[1].starts_with("Error: "), "{}", log[1]);
        assert!(!controller.is_running(&missing.id));
        assert!(controller.has_ever_run(&missing.id));
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_running() {
        let (controller, mut rx) = controller();
        let cmd = spec("sleeper", "sleep", &["30"]);
        assert!(controller.start(&cmd));
        assert!(!controller.start(&cmd));
        next_started(&mut rx, &cmd.id).await;
        let before = controller.logs(&cmd.id);
        assert!(!controller.start(&cmd));
        assert_eq!(controller.logs(&cmd.id), before);
        assert!(controller.stop(&cmd.id));
        assert!(!next_exit(&mut rx, &cmd.id).await.0);
    }

    #[tokio::test]
    async fn stop_when_not_running_is_a_noop() {
        let (controller, mut rx) = controller();
        let id = CommandId::new("Test", "idle");
        controller.track(&id);
        assert!(!controller.stop(&id));
        assert_eq!(controller.logs(&id), vec![NO_LOGS]);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn stop_marks_stopped_then_waiter_confirms_kill() {
        let (controller, mut rx) = controller();
        let cmd = spec("sleeper", "sleep", &["30"]);
        controller.start(&cmd);
        next_started(&mut rx, &cmd.id).await;
        assert!(controller.stop(&cmd.id));
        assert!(!controller.is_running(&cmd.id));
        assert!(matches!(next_event(&mut rx).await, Event::ProcessStopped { .. }));
        assert_eq!(next_exit(&mut rx, &cmd.id).await, (false, true));
        assert!(!controller.is_running(&cmd.id));
        let log = controller.logs(&cmd.id);
        assert_eq!(log.len(), 2);
        assert!(log[1].contains("signal"), "{}", log[1]);
    }

    #[tokio::test]
    async fn stop_while_starting_never_reports_a_start() {
        let (controller, mut rx) = controller();
        let cmd = spec("sleeper", "sleep", &["30"]);
        assert!(controller.start(&cmd));
        assert!(controller.stop(&cmd.id));
        assert!(matches!(next_event(&mut rx).await, Event::ProcessStopped { .. }));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!controller.is_running(&cmd.id));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(controller.logs(&cmd.id), vec!["Starting process: sleep [30]"]);
    }

    #[tokio::test]
    async fn restart_after_stop_is_not_clobbered_by_old_waiter() {
        let (controller, mut rx) = controller();
        let slow = spec("job", "sleep", &["30"]);
        controller.start(&slow);
        next_started(&mut rx, &slow.id).await;
        controller.stop(&slow.id);
        let quick = spec("job", "echo", &["again"]);
        assert!(controller.start(&quick));
        assert!(next_exit(&mut rx, &quick.id).await.0);
        assert_eq!(
            controller.logs(&quick.id),
            vec!["Starting process: echo [again]", "again", SUCCESS_LINE]
        );
        assert!(!controller.is_running(&quick.id));
    }

    #[tokio::test]
    async fn background_output_never_follows_the_terminal_line() {
        let (controller, mut rx) = controller();
        let cmd = sh("detached", "(sleep 2; echo late) & echo early");
        controller.start(&cmd);
        assert_eq!(next_exit(&mut rx, &cmd.id).await, (true, false));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let log = controller.logs(&cmd.id);
        assert_eq!(&log[1..], &["early", SUCCESS_LINE]);
        assert!(!controller.is_running(&cmd.id));
    }

    #[tokio::test]
    async fn concurrent_commands_keep_their_logs_apart() {
        let (controller, mut rx) = controller();
        let specs: Vec<_> = (0..6)
            .map(|i| {
                sh(
                    &format!("cmd{}", i),
                    &format!("for n in 1 2 3 4 5; do echo tag{}-$n; sleep 0.05; done", i),
                )
            })
            .collect();
        for spec in &specs {
            assert!(controller.start(spec));
        }

        let mut starting: HashSet<CommandId> = specs.iter().map(|s| s.id.clone()).collect();
        let mut exiting = starting.clone();
        while !starting.is_empty() {
            match next_event(&mut rx).await {
                Event::ProcessStarted { id } => {
                    starting.remove(&id);
                }
                Event::ProcessExited { id, .. } => {
                    exiting.remove(&id);
                }
                _ => {}
            }
        }
        for spec in specs.iter().step_by(2) {
            controller.stop(&spec.id);
        }
        while !exiting.is_empty() {
            if let Event::ProcessExited { id, .. } = next_event(&mut rx).await {
                exiting.remove(&id);
            }
        }

        for (i, spec) in specs.iter().enumerate() {
            let own = format!("tag{}-", i);
            for line in &controller.logs(&spec.id)[1..] {
                if line.starts_with("tag") {
                    assert!(line.starts_with(&own), "{} found in {}", line, spec.id);
                }
            }
            assert!(!controller.is_running(&spec.id));
        }
        assert_eq!(controller.stop_all(), 0);
    }
}
