//! Configuration file watching and hot reload.
//!
//! A background thread watches the configuration file's directory, debounces bursts
//! of write/create events, re-parses the file, and publishes either the new catalog
//! or the load error. Running processes are never touched from here.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::load_catalog;
use crate::events::Event;

/// Quiet period after the last relevant change before the file is re-read.
pub const DEBOUNCE: Duration = Duration::from_millis(100);

enum Signal {
    Fs(notify::Result<NotifyEvent>),
    Stop,
}

/// Handle to the watcher thread. Dropping it stops the thread.
pub struct ConfigWatcher {
    control: std_mpsc::Sender<Signal>,
    thread: Option<JoinHandle<()>>,
}

impl ConfigWatcher {
    /// Starts watching `path` and publishing reload results to `tx`.
    pub fn spawn(path: &Path, tx: mpsc::UnboundedSender<Event>) -> Result<Self> {
        let target = resolve_target(path)?;
        let dir = target
            .parent()
            .map(Path::to_path_buf)
            .context("config file has no parent directory")?;

        let (raw_tx, raw_rx) = std_mpsc::channel();
        let fs_tx = raw_tx.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = fs_tx.send(Signal::Fs(res));
            },
            notify::Config::default(),
        )
        .context("failed to create watcher")?;
        // Editors often replace the file, so watch the directory rather than the inode.
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", dir.display()))?;

        let thread = std::thread::Builder::new()
            .name("config-watch".to_string())
            .spawn(move || {
                let _watcher = watcher;
                watch_loop(&target, raw_rx, tx);
            })
            .context("failed to spawn watcher thread")?;
        info!(path = %path.display(), "watching configuration");

        Ok(Self {
            control: raw_tx,
            thread: Some(thread),
        })
    }

    /// Stops the watcher and waits for its thread to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.control.send(Signal::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn resolve_target(path: &Path) -> Result<PathBuf> {
    path.canonicalize()
        .with_context(|| format!("failed to resolve {}", path.display()))
}

fn watch_loop(target: &Path, rx: std_mpsc::Receiver<Signal>, tx: mpsc::UnboundedSender<Event>) {
    loop {
        match rx.recv() {
            Ok(Signal::Fs(event)) if is_relevant(&event, target) => {}
            Ok(Signal::Fs(_)) => continue,
            Ok(Signal::Stop) | Err(_) => break,
        }

        let mut last = Instant::now();
        loop {
            let elapsed = last.elapsed();
            if elapsed >= DEBOUNCE {
                break;
            }
            match rx.recv_timeout(DEBOUNCE - elapsed) {
                Ok(Signal::Fs(event)) => {
                    if is_relevant(&event, target) {
                        last = Instant::now();
                    }
                }
                Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => break,
            }
        }

        let event = match load_catalog(target) {
            Ok(catalog) => {
                info!(commands = catalog.commands().count(), "configuration reloaded");
                Event::ConfigReloaded(catalog)
            }
            Err(err) => {
                let message = format!("{:#}", anyhow::Error::new(err));
                warn!(error = %message, "configuration reload rejected");
                Event::ReloadFailed(message)
            }
        };
        if tx.send(event).is_err() {
            break;
        }
    }
    debug!("config watcher stopped");
}

fn is_relevant(event: &notify::Result<NotifyEvent>, target: &Path) -> bool {
    let event = match event {
        Ok(event) => event,
        Err(err) => {
            warn!(error = %err, "file watch error");
            return false;
        }
    };
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return false;
    }
    event
        .paths
        .iter()
        .any(|path| path == target || path.file_name() == target.file_name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, ModifyKind, RemoveKind};

    fn event(kind: EventKind, path: &Path) -> notify::Result<NotifyEvent> {
        Ok(NotifyEvent::new(kind).add_path(path.to_path_buf()))
    }

    #[test]
    fn only_writes_to_the_config_file_are_relevant() {
        let target = Path::new("/tmp/rack/config.yaml");
        let write = EventKind::Modify(ModifyKind::Data(DataChange::Content));
        assert!(is_relevant(&event(write, target), target));
        assert!(is_relevant(
            &event(EventKind::Create(CreateKind::File), target),
            target
        ));
        assert!(!is_relevant(
            &event(EventKind::Remove(RemoveKind::File), target),
            target
        ));
        assert!(!is_relevant(
            &event(write, Path::new("/tmp/rack/other.yaml")),
            target
        ));
        assert!(!is_relevant(
            &Err(notify::Error::generic("boom")),
            target
        ));
    }

    async fn next_reload(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for reload")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn publishes_reloads_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "tabs:\n  A:\n    one: { exec: echo }\n").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = ConfigWatcher::spawn(&path, tx).unwrap();

        std::fs::write(
            &path,
            "tabs:\n  A:\n    one: { exec: echo }\n    two: { exec: date }\n",
        )
        .unwrap();
        match next_reload(&mut rx).await {
            Event::ConfigReloaded(catalog) => assert_eq!(catalog.commands().count(), 2),
            other => panic!("unexpected event: {:?}", other),
        }

        std::fs::write(&path, "tabs: [broken").unwrap();
        match next_reload(&mut rx).await {
            Event::ReloadFailed(message) => assert!(message.contains("failed to parse")),
            other => panic!("unexpected event: {:?}", other),
        }

        watcher.stop();
    }

    #[tokio::test]
    async fn burst_of_writes_reloads_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "tabs:\n  A:\n    c0: { exec: echo }\n").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = ConfigWatcher::spawn(&path, tx).unwrap();

        let mut raw = String::from("tabs:\n  A:\n");
        for i in 1..=5 {
            raw.push_str(&format!("    c{}: {{ exec: echo }}\n", i));
            std::fs::write(&path, &raw).unwrap();
            tokio::time::sleep(DEBOUNCE / 5).await;
        }

        match next_reload(&mut rx).await {
            Event::ConfigReloaded(catalog) => assert_eq!(catalog.commands().count(), 5),
            other => panic!("unexpected event: {:?}", other),
        }
        let extra = tokio::time::timeout(DEBOUNCE * 5, rx.recv()).await;
        assert!(extra.is_err(), "unexpected second event: {:?}", extra);

        watcher.stop();
    }
}
