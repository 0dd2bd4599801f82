//! System clipboard access for log snapshots.

use anyhow::{Context, Result};

/// Copies `lines` to the clipboard, one per line. Returns the number of lines copied.
pub fn copy_lines(lines: &[String]) -> Result<usize> {
    let mut clipboard = arboard::Clipboard::new().context("failed to access clipboard")?;
    clipboard
        .set_text(lines.join("\n"))
        .context("failed to set clipboard text")?;
    Ok(lines.len())
}
