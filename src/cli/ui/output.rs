use console::style;

use crate::types::StageStatus;

/// Styled line output for commands
pub struct Output {
    quiet: bool,
}

impl Output {
    pub fn new() -> Self {
        Self { quiet: false }
    }

    /// Suppress everything except errors
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn success(&self, message: &str) {
        if !self.quiet {
            println!("{} {}", style("✓").green(), message);
        }
    }

    pub fn error(&self, message: &str) {
        eprintln!("{} {}", style("✗").red(), message);
    }

    pub fn warning(&self, message: &str) {
        if !self.quiet {
            println!("{} {}", style("⚠").yellow(), message);
        }
    }

    pub fn info(&self, message: &str) {
        if !self.quiet {
            println!("{} {}", style("ℹ").blue(), message);
        }
    }

    pub fn header(&self, message: &str) {
        if !self.quiet {
            println!("\n{}", style(message).bold().underlined());
        }
    }

    /// Aligned `label: value` row
    pub fn field(&self, label: &str, value: impl std::fmt::Display) {
        if !self.quiet {
            println!("  {:<16} {}", style(format!("{}:", label)).dim(), value);
        }
    }

    pub fn stage(&self, name: &str, status: StageStatus, detail: &str) {
        if !self.quiet {
            println!("  {} {:<10} {}", status_icon(status), name, style(detail).dim());
        }
    }
}

impl Default for Output {
    fn default() -> Self {
        Self::new()
    }
}

pub fn status_icon(status: StageStatus) -> console::StyledObject<&'static str> {
    match status {
        StageStatus::Completed => style("✓").green(),
        StageStatus::Degraded => style("◐").yellow(),
        StageStatus::Failed => style("✗").red(),
        StageStatus::Cancelled => style("⊘").dim(),
        StageStatus::Idle | StageStatus::Running => style("…").dim(),
    }
}
