//! cmdrack: start, stop and inspect configured commands from a TUI.
//!
//! This is the entry point of the application. It parses the command line, loads
//! the configuration, and runs the event loop that connects the process controller,
//! the configuration watcher and the terminal front-end.

mod app;
mod clipboard;
mod config;
mod events;
mod output;
mod process;
mod registry;
mod runner;
mod tui;
mod watch;

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app::{App, AppAction};
use crate::events::Event;
use crate::registry::ProcessRegistry;
use crate::runner::ProcessController;
use crate::watch::ConfigWatcher;

/// Environment variable naming the file that receives diagnostic logs.
const LOG_ENV: &str = "CMDRACK_LOG";

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "cmdrack",
    version,
    about = "Start, stop and inspect configured commands"
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let catalog = config::load_catalog(&cli.config).context("Error loading config")?;
    info!(
        path = %cli.config.display(),
        commands = catalog.commands().count(),
        "configuration loaded"
    );

    if catalog.is_empty() {
        warn!(path = %cli.config.display(), "configuration defines no commands");
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let registry = Arc::new(ProcessRegistry::new(catalog.max_lines));
    let controller = ProcessController::new(registry.clone(), event_tx.clone());
    let mut app = App::new(catalog, &controller);

    let watcher = match ConfigWatcher::spawn(&cli.config, event_tx.clone()) {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            warn!(error = %format!("{:#}", err), "hot reload disabled");
            app.set_status_warning_persistent(format!("Hot reload disabled: {:#}", err));
            None
        }
    };

    let mut terminal = tui::init_terminal()?;
    spawn_input_listener(event_tx.clone());
    spawn_signal_listener(event_tx.clone());

    let mut ticker = tokio::time::interval(Duration::from_millis(150));
    let mut result = Ok(());

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    Event::ProcessStarted { id } => {
                        app.on_state_change(&id, &controller);
                        app.set_status_message(format!("{} running", display_name(&app, &id)));
                    }
                    Event::ProcessFailed { id } => {
                        app.on_state_change(&id, &controller);
                        app.set_status_warning_for(
                            format!("{} failed to start, see logs", display_name(&app, &id)),
                            Duration::from_secs(3),
                        );
                    }
                    Event::ProcessStopped { id } => {
                        app.on_state_change(&id, &controller);
                        app.set_status_message(format!("{} stopped", display_name(&app, &id)));
                    }
                    Event::ProcessExited { id, stopped: true, .. } => {
                        app.on_state_change(&id, &controller);
                    }
                    Event::ProcessExited { id, success, .. } => {
                        app.on_state_change(&id, &controller);
                        let name = display_name(&app, &id);
                        if success {
                            app.set_status_message(format!("{} completed", name));
                        } else {
                            app.set_status_warning_for(
                                format!("{} exited with an error", name),
                                Duration::from_secs(3),
                            );
                        }
                    }
                    Event::ConfigReloaded(catalog) => app.apply_reload(catalog, &controller),
                    Event::ReloadFailed(message) => app.reload_failed(&message),
                    Event::Key(key) => {
                        let action = app.handle_key(key);
                        handle_app_action(action, &mut app, &controller);
                    }
                    Event::Resize => {}
                    Event::Shutdown => app.should_quit = true,
                }
            }
            _ = ticker.tick() => app.refresh(&controller),
        }

        if let Err(err) = tui::draw(&mut app, &mut terminal) {
            result = Err(err.into());
            break;
        }
        if app.should_quit {
            break;
        }
    }

    let stopped = controller.stop_all();
    info!(stopped, handles = registry.len(), "shutting down");
    if let Some(watcher) = watcher {
        watcher.stop();
    }
    tui::restore_terminal(terminal)?;
    result
}

fn init_logging() {
    let Some(path) = std::env::var_os(LOG_ENV) else {
        return;
    };
    let file = match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {}: {}", PathBuf::from(&path).display(), err);
            return;
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init();
}

fn spawn_input_listener(tx: mpsc::UnboundedSender<Event>) {
    std::thread::spawn(move || loop {
        if crossterm::event::poll(Duration::from_millis(100)).unwrap_or(false) {
            let event = match crossterm::event::read() {
                Ok(crossterm::event::Event::Key(key))
                    if key.kind == crossterm::event::KeyEventKind::Press =>
                {
                    Event::Key(key)
                }
                Ok(crossterm::event::Event::Resize(..)) => Event::Resize,
                _ => continue,
            };
            if tx.send(event).is_err() {
                break;
            }
        }
    });
}

fn spawn_signal_listener(tx: mpsc::UnboundedSender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        let _ = tx.send(Event::Shutdown);
    });
}

fn display_name(app: &App, id: &process::CommandId) -> String {
    app.find(id)
        .map(|spec| spec.name.clone())
        .unwrap_or_else(|| id.to_string())
}

fn handle_app_action(action: AppAction, app: &mut App, controller: &ProcessController) {
    match action {
        AppAction::Quit => app.should_quit = true,
        AppAction::Toggle(spec) => {
            if controller.is_running(&spec.id) {
                controller.stop(&spec.id);
            } else {
                controller.start(&spec);
            }
            app.on_state_change(&spec.id, controller);
        }
        AppAction::ShowLogs(id) => {
            if controller.has_ever_run(&id) {
                app.open_logs(id, controller);
            }
        }
        AppAction::CopyLogs(id) => match clipboard::copy_lines(&controller.logs(&id)) {
            Ok(count) => app.set_status_warning_for(
                format!("copied {} lines to clipboard", count),
                Duration::from_secs(2),
            ),
            Err(err) => app.set_status_warning_for(
                format!("clipboard failed: {:#}", err),
                Duration::from_secs(3),
            ),
        },
        AppAction::None => {}
    }
}
