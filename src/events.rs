//! Event definitions for the application event loop.
//!
//! Background tasks (capture waiters, the config watcher, input and signal
//! listeners) only ever publish an `Event`; the event loop is the sole consumer
//! and the only place presentation state changes.

use crossterm::event::KeyEvent;

use crate::config::Catalog;
use crate::process::CommandId;

/// Represents an event in the application's main event loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// A command's process was spawned and is now running.
    ProcessStarted { id: CommandId },
    /// A command could not be launched; the reason is in its log.
    ProcessFailed { id: CommandId },
    /// A running command was stopped by the user.
    ProcessStopped { id: CommandId },
    /// A command's process exited. This is always the last event of a run.
    ///
    /// `stopped` is set when the exit follows a user stop that was already reported.
    ProcessExited {
        id: CommandId,
        success: bool,
        stopped: bool,
    },
    /// The configuration file changed and parsed successfully.
    ConfigReloaded(Catalog),
    /// The configuration file changed but could not be loaded.
    ReloadFailed(String),
    /// A keyboard event received from the user.
    Key(KeyEvent),
    /// The terminal window was resized.
    Resize,
    /// Ctrl-C, SIGTERM, or a quit request.
    Shutdown,
}
