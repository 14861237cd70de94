//! Terminal output helpers.

use owo_colors::OwoColorize;

/// Consistent formatting for command output.
#[derive(Debug, Default, Clone, Copy)]
pub struct Output;

impl Output {
    pub fn new() -> Self {
        Self
    }

    pub fn section(&self, title: &str) {
        println!("\n{}", title.bold().bright_cyan());
    }

    pub fn status(&self, message: &str) {
        println!("{}", message);
    }

    pub fn success(&self, message: &str) {
        println!("{} {}", "✓".bright_green(), message);
    }

    pub fn warning(&self, message: &str) {
        println!("{} {}", "!".bright_yellow(), message.yellow());
    }

    pub fn error(&self, message: &str) {
        eprintln!("{} {}", "✗".bright_red(), message.red());
    }

    /// A labelled value on one line.
    pub fn info(&self, label: &str, value: &str) {
        println!("  {} {}", label.dimmed(), value);
    }

    pub fn list_item(&self, item: &str) {
        println!("  • {}", item);
    }
}

/// Render an epoch timestamp relative to `now`, e.g. "in 2h 5m" or "3m ago".
pub fn format_relative_time(timestamp: i64, now: i64) -> String {
    let delta = timestamp - now;
    let magnitude = delta.unsigned_abs();
    let (hours, minutes) = (magnitude / 3600, (magnitude % 3600) / 60);
    let span = if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m", minutes)
    } else {
        format!("{}s", magnitude)
    };
    if delta >= 0 {
        format!("in {}", span)
    } else {
        format!("{} ago", span)
    }
}
