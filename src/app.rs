//! Application state and UI logic.
//!
//! This module holds the `App` struct, the presentation layer's view of the catalog:
//! which category and command are selected, the per-command status shown in the list,
//! and the open log viewer. It also translates key presses into `AppAction`s. It never
//! starts or stops anything itself; the event loop carries out the actions.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use crate::config::{Catalog, Category};
use crate::process::{CommandId, CommandSpec};
use crate::runner::ProcessController;

/// Tab listing commands that a reload removed while they were still running.
pub const REMOVED_TAB: &str = "(removed)";

/// Status of one command as last observed by the UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowStatus {
    pub running: bool,
    pub has_run: bool,
}

/// An open log viewer for one command.
#[derive(Debug, Clone)]
pub struct LogView {
    pub id: CommandId,
    pub title: String,
    pub lines: Vec<String>,
    /// Top line when not following.
    pub scroll: usize,
    /// Whether the view sticks to the newest line.
    pub follow: bool,
}

/// Actions resulting from user interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppAction {
    /// No action required.
    None,
    /// Exit the application.
    Quit,
    /// Start the command if stopped, stop it if running.
    Toggle(CommandSpec),
    /// Open the log viewer for a command.
    ShowLogs(CommandId),
    /// Copy a command's log to the clipboard.
    CopyLogs(CommandId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warning,
}

#[derive(Debug, Clone)]
struct StatusMessage {
    text: String,
    at: Instant,
    ttl: Option<Duration>,
    level: StatusLevel,
}

/// The main application state container.
#[derive(Debug)]
pub struct App {
    /// Commands currently known from configuration.
    pub catalog: Catalog,
    /// Tabs on screen: the catalog's categories plus [`REMOVED_TAB`] when needed.
    pub tabs: Vec<Category>,
    /// Running commands that are no longer in the catalog.
    removed: Vec<CommandSpec>,
    /// Index of the selected category.
    pub selected_tab: usize,
    /// Index of the selected command within the category.
    pub selected_row: usize,
    /// The log viewer overlay, if open.
    pub log_view: Option<LogView>,
    /// Flag indicating if the application should exit.
    pub should_quit: bool,
    /// Height of the log viewer body (for scrolling calculations).
    pub log_view_height: usize,
    rows: HashMap<CommandId, RowStatus>,
    status_message: Option<StatusMessage>,
}

impl App {
    /// Creates the view and registers a handle for every known command.
    pub fn new(catalog: Catalog, controller: &ProcessController) -> Self {
        let mut app = Self {
            tabs: catalog.categories.clone(),
            removed: Vec::new(),
            catalog,
            selected_tab: 0,
            selected_row: 0,
            log_view: None,
            should_quit: false,
            log_view_height: 0,
            rows: HashMap::new(),
            status_message: None,
        };
        app.refresh(controller);
        app
    }

    pub fn selected_category(&self) -> Option<&Category> {
        self.tabs.get(self.selected_tab)
    }

    pub fn selected_command(&self) -> Option<&CommandSpec> {
        self.selected_category()
            .and_then(|category| category.commands.get(self.selected_row))
    }

    pub fn row_status(&self, id: &CommandId) -> RowStatus {
        self.rows.get(id).copied().unwrap_or_default()
    }

    /// Looks up a command shown in any tab, including removed ones.
    pub fn find(&self, id: &CommandId) -> Option<&CommandSpec> {
        self.tabs
            .iter()
            .flat_map(|category| category.commands.iter())
            .find(|spec| &spec.id == id)
    }

    /// Pulls fresh status for every command and re-snapshots the open log viewer.
    pub fn refresh(&mut self, controller: &ProcessController) {
        self.prune_removed(controller);
        self.rows.clear();
        for spec in self.tabs.iter().flat_map(|category| category.commands.iter()) {
            controller.track(&spec.id);
            self.rows.insert(
                spec.id.clone(),
                RowStatus {
                    running: controller.is_running(&spec.id),
                    has_run: controller.has_ever_run(&spec.id),
                },
            );
        }
        if let Some(view) = self.log_view.as_mut() {
            view.lines = controller.logs(&view.id);
        }
    }

    /// Updates the view after a state-change notification for `id`.
    pub fn on_state_change(&mut self, id: &CommandId, controller: &ProcessController) {
        self.prune_removed(controller);
        self.rows.insert(
            id.clone(),
            RowStatus {
                running: controller.is_running(id),
                has_run: controller.has_ever_run(id),
            },
        );
        if let Some(view) = self.log_view.as_mut() {
            if &view.id == id {
                view.lines = controller.logs(id);
            }
        }
    }

    /// Replaces the catalog after a successful reload.
    ///
    /// Selection is kept on the same category and command when they still exist.
    /// Process handles are left untouched; running commands that disappeared are
    /// listed under [`REMOVED_TAB`] until they stop.
    pub fn apply_reload(&mut self, catalog: Catalog, controller: &ProcessController) {
        let tab_name = self.selected_category().map(|c| c.name.clone());
        let command_id = self.selected_command().map(|c| c.id.clone());

        let mut removed: Vec<CommandSpec> = Vec::new();
        for spec in self.tabs.iter().flat_map(|category| category.commands.iter()) {
            if catalog.find(&spec.id).is_none()
                && controller.is_running(&spec.id)
                && !removed.iter().any(|r| r.id == spec.id)
            {
                removed.push(spec.clone());
            }
        }
        self.catalog = catalog;
        self.removed = removed;
        self.rebuild_tabs();

        self.selected_tab = tab_name
            .and_then(|name| self.tabs.iter().position(|category| category.name == name))
            .unwrap_or(0);
        self.selected_row = command_id
            .and_then(|id| {
                self.selected_category()
                    .and_then(|category| category.commands.iter().position(|c| c.id == id))
            })
            .unwrap_or(0);
        self.refresh(controller);
        self.set_status_message("Configuration reloaded");
    }

    /// Reports a rejected reload. The current catalog stays in effect.
    pub fn reload_failed(&mut self, message: &str) {
        self.set_status_warning_persistent(format!("Reload failed: {}", message));
    }

    fn prune_removed(&mut self, controller: &ProcessController) {
        let before = self.removed.len();
        self.removed.retain(|spec| controller.is_running(&spec.id));
        if self.removed.len() != before {
            self.rebuild_tabs();
        }
    }

    fn rebuild_tabs(&mut self) {
        self.tabs = self.catalog.categories.clone();
        if !self.removed.is_empty() {
            self.tabs.push(Category {
                name: REMOVED_TAB.to_string(),
                commands: self.removed.clone(),
            });
        }
        if self.selected_tab >= self.tabs.len() {
            self.selected_tab = 0;
            self.selected_row = 0;
        }
        let rows = self.selected_category().map(|c| c.commands.len()).unwrap_or(0);
        if self.selected_row >= rows {
            self.selected_row = rows.saturating_sub(1);
        }
    }

    pub fn open_logs(&mut self, id: CommandId, controller: &ProcessController) {
        let title = self
            .find(&id)
            .map(|spec| format!("{} › {}", spec.category, spec.name))
            .unwrap_or_else(|| id.to_string());
        self.log_view = Some(LogView {
            lines: controller.logs(&id),
            id,
            title,
            scroll: 0,
            follow: true,
        });
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> AppAction {
        if self.log_view.is_some() {
            return self.handle_log_view_key(key);
        }
        match key.code {
            KeyCode::Char('q') => {
                self.should_quit = true;
                AppAction::Quit
            }
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.should_quit = true;
                AppAction::Quit
            }
            KeyCode::Right | KeyCode::Tab => {
                self.select_tab(1);
                AppAction::None
            }
            KeyCode::Left | KeyCode::BackTab => {
                self.select_tab(-1);
                AppAction::None
            }
            KeyCode::Up => {
                self.selected_row = self.selected_row.saturating_sub(1);
                AppAction::None
            }
            KeyCode::Down => {
                let len = self.selected_category().map(|c| c.commands.len()).unwrap_or(0);
                if self.selected_row + 1 < len {
                    self.selected_row += 1;
                }
                AppAction::None
            }
            KeyCode::Enter | KeyCode::Char(' ') => match self.selected_command() {
                Some(spec) => AppAction::Toggle(spec.clone()),
                None => AppAction::None,
            },
            KeyCode::Char('l') => self.logs_action(AppAction::ShowLogs),
            KeyCode::Char('y') => self.logs_action(AppAction::CopyLogs),
            _ => AppAction::None,
        }
    }

    fn handle_log_view_key(&mut self, key: KeyEvent) -> AppAction {
        let height = self.log_view_height.max(1);
        let Some(view) = self.log_view.as_mut() else {
            return AppAction::None;
        };
        let max_scroll = view.lines.len().saturating_sub(height);
        let current = if view.follow { max_scroll } else { view.scroll.min(max_scroll) };
        match key.code {
            KeyCode::Esc | KeyCode::Char('q') | KeyCode::Char('l') => {
                self.log_view = None;
            }
            KeyCode::Char('y') => return AppAction::CopyLogs(view.id.clone()),
            KeyCode::Up => scroll_to(view, current.saturating_sub(1), max_scroll),
            KeyCode::Down => scroll_to(view, current + 1, max_scroll),
            KeyCode::PageUp => scroll_to(view, current.saturating_sub(height), max_scroll),
            KeyCode::PageDown => scroll_to(view, current + height, max_scroll),
            KeyCode::Home => scroll_to(view, 0, max_scroll),
            KeyCode::End => view.follow = true,
            _ => {}
        }
        AppAction::None
    }

    fn logs_action(&mut self, action: impl FnOnce(CommandId) -> AppAction) -> AppAction {
        let Some(spec) = self.selected_command() else {
            return AppAction::None;
        };
        let (id, name) = (spec.id.clone(), spec.name.clone());
        if !self.row_status(&id).has_run {
            self.set_status_warning_for(format!("{} has not run yet", name), Duration::from_secs(2));
            return AppAction::None;
        }
        action(id)
    }

    fn select_tab(&mut self, delta: isize) {
        let len = self.tabs.len();
        if len == 0 {
            return;
        }
        let next = (self.selected_tab as isize + delta).rem_euclid(len as isize) as usize;
        if next != self.selected_tab {
            self.selected_tab = next;
            self.selected_row = 0;
        }
    }

    /// Visible slice of the open log viewer for a body of `height` lines.
    pub fn visible_log_lines(&self, height: usize) -> &[String] {
        let Some(view) = self.log_view.as_ref() else {
            return &[];
        };
        let max_scroll = view.lines.len().saturating_sub(height);
        let start = if view.follow { max_scroll } else { view.scroll.min(max_scroll) };
        let end = (start + height).min(view.lines.len());
        &view.lines[start..end]
    }

    pub fn status_message(&self) -> Option<(&str, StatusLevel)> {
        let message = self.status_message.as_ref()?;
        if let Some(ttl) = message.ttl {
            if message.at.elapsed() > ttl {
                return None;
            }
        }
        Some((message.text.as_str(), message.level))
    }

    pub fn set_status_message(&mut self, message: impl Into<String>) {
        self.set_status_message_with_level(message, Some(Duration::from_secs(3)), StatusLevel::Info);
    }

    pub fn set_status_warning_for(&mut self, message: impl Into<String>, ttl: Duration) {
        self.set_status_message_with_level(message, Some(ttl), StatusLevel::Warning);
    }

    pub fn set_status_warning_persistent(&mut self, message: impl Into<String>) {
        self.set_status_message_with_level(message, None, StatusLevel::Warning);
    }

    fn set_status_message_with_level(
        &mut self,
        message: impl Into<String>,
        ttl: Option<Duration>,
        level: StatusLevel,
    ) {
        self.status_message = Some(StatusMessage {
            text: message.into(),
            at: Instant::now(),
            ttl,
            level,
        });
    }
}

fn scroll_to(view: &mut LogView, line: usize, max_scroll: usize) {
    let line = line.min(max_scroll);
    view.follow = line >= max_scroll;
    view.scroll = line;
}
