//! Terminal User Interface (TUI) rendering and management.
//!
//! This module handles initializing the terminal in raw mode, restoring it on exit,
//! and drawing the application state using `ratatui`.

use std::io::{self, Stdout};

use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen, SetTitle,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, BorderType, Borders, Clear, List, ListItem, ListState, Paragraph, Tabs};
use ratatui::Terminal;

use crate::app::{App, RowStatus, StatusLevel};
use crate::output::sanitize_text;

/// Type alias for the specific terminal backend used.
pub type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;

const HELP: &str = "←/→ category | ↑/↓ select | Enter start/stop | l logs | y copy logs | q quit";
const LOG_HELP: &str = "↑/↓ PgUp/PgDn scroll | Home/End top/follow | y copy | Esc close";

/// Initializes the terminal for TUI mode.
///
/// Enables raw mode, enters the alternate screen, and creates a `ratatui` Terminal instance.
pub fn init_terminal() -> io::Result<TuiTerminal> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, SetTitle("cmdrack"))?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

/// Restores the terminal to its original state.
///
/// Disables raw mode, leaves the alternate screen, and shows the cursor.
pub fn restore_terminal(mut terminal: TuiTerminal) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

/// Draws the current application state to the terminal.
pub fn draw(app: &mut App, terminal: &mut TuiTerminal) -> io::Result<()> {
    terminal.draw(|frame| {
        let area = frame.size();
        let vertical = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(3), Constraint::Min(1), Constraint::Length(3)])
            .split(area);
        let border_style = Style::default().fg(Color::DarkGray);

        let titles: Vec<Line> = app
            .tabs
            .iter()
            .map(|category| Line::from(category.name.clone()))
            .collect();
        let tabs = Tabs::new(titles)
            .select(app.selected_tab)
            .block(
                Block::default()
                    .title("Categories")
                    .borders(Borders::ALL)
                    .border_type(BorderType::Rounded)
                    .border_style(border_style),
            )
            .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD));
        frame.render_widget(tabs, vertical[0]);

        let width = vertical[1].width.saturating_sub(2) as usize;
        let items: Vec<ListItem> = app
            .selected_category()
            .map(|category| {
                category
                    .commands
                    .iter()
                    .map(|spec| {
                        let status = app.row_status(&spec.id);
                        let label = status_label(status);
                        let name_width = width.saturating_sub(label.chars().count() + 1);
                        let name = truncate(&spec.name, name_width);
                        let padding = width.saturating_sub(name.chars().count() + label.chars().count());
                        ListItem::new(Text::from(vec![
                            Line::from(vec![
                                Span::styled(name, Style::default().add_modifier(Modifier::BOLD)),
                                Span::raw(" ".repeat(padding)),
                                Span::styled(label, status_style(status)),
                            ]),
                            Line::from(Span::styled(
                                truncate(&spec.description(), width),
                                Style::default()
                                    .fg(Color::Gray)
                                    .add_modifier(Modifier::ITALIC),
                            )),
                        ]))
                    })
                    .collect()
            })
            .unwrap_or_default();
        let empty = items.is_empty();
        let list = List::new(items)
            .block(
                Block::default()
                    .title("Commands")
                    .borders(Borders::ALL)
                    .border_type(BorderType::Rounded)
                    .border_style(border_style),
            )
            .highlight_style(Style::default().bg(Color::Rgb(40, 40, 48)));
        let mut state = list_state(app.selected_row, empty);
        frame.render_stateful_widget(list, vertical[1], &mut state);

        let (help_line, help_style) = match app.status_message() {
            Some((text, StatusLevel::Warning)) => (text.to_string(), Style::default().fg(Color::Yellow)),
            Some((text, StatusLevel::Info)) => (text.to_string(), Style::default().fg(Color::Green)),
            None if app.log_view.is_some() => (LOG_HELP.to_string(), Style::default().fg(Color::DarkGray)),
            None => (HELP.to_string(), Style::default().fg(Color::DarkGray)),
        };
        let status = Paragraph::new(Line::from(Span::styled(help_line, help_style))).block(
            Block::default()
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded)
                .border_style(border_style),
        );
        frame.render_widget(status, vertical[2]);

        if app.log_view.is_some() {
            let popup_area = centered_rect(85, 80, area);
            let block = Block::default()
                .title(log_title(app))
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded);
            let inner = block.inner(popup_area);
            let height = inner.height as usize;
            app.log_view_height = height;
            let lines: Vec<Line> = app
                .visible_log_lines(height)
                .iter()
                .map(|line| {
                    let text = truncate(&strip_carriage(&sanitize_text(line)), inner.width as usize);
                    if line.starts_with("ERR: ") {
                        Line::from(Span::styled(text, Style::default().fg(Color::Red)))
                    } else {
                        Line::from(text)
                    }
                })
                .collect();
            frame.render_widget(Clear, popup_area);
            frame.render_widget(Paragraph::new(lines).block(block), popup_area);
        }
    })?;
    Ok(())
}

fn log_title(app: &App) -> String {
    let Some(view) = app.log_view.as_ref() else {
        return "Logs".to_string();
    };
    let follow = if view.follow { " · follow" } else { "" };
    format!("Logs · {} ({} lines){}", view.title, view.lines.len(), follow)
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

fn list_state(selected: usize, empty: bool) -> ListState {
    let mut state = ListState::default();
    if !empty {
        state.select(Some(selected));
    }
    state
}

fn status_label(status: RowStatus) -> &'static str {
    match (status.running, status.has_run) {
        (true, _) => "Running",
        (false, true) => "Stopped · logs",
        (false, false) => "Stopped",
    }
}

fn status_style(status: RowStatus) -> Style {
    if status.running {
        Style::default().fg(Color::Green)
    } else {
        Style::default().fg(Color::DarkGray)
    }
}

fn truncate(text: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out = text.chars().take(max.saturating_sub(1)).collect::<String>();
    out.push('~');
    out
}

fn strip_carriage(text: &str) -> String {
    text.rsplit('\r').next().unwrap_or("").to_string()
}
