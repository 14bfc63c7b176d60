//! Console Progress Rendering
//!
//! Prints one line per progress event from a [`ProgressTracker`] subscription.

use console::style;
use tokio::sync::broadcast::{self, error::RecvError};

use super::ui::status_icon;
use crate::constants::scoring::MAX_SCORE;
use crate::workflow::{MessageLevel, ProgressEvent, ProgressTracker};

pub struct ConsoleRenderer {
    receiver: broadcast::Receiver<ProgressEvent>,
    show_debug: bool,
}

impl ConsoleRenderer {
    /// Subscribe before the run starts so no event is missed
    pub fn new(tracker: &ProgressTracker) -> Self {
        Self {
            receiver: tracker.subscribe(),
            show_debug: false,
        }
    }

    pub fn with_debug(mut self, show: bool) -> Self {
        self.show_debug = show;
        self
    }

    /// Render events until the run finishes or the tracker is dropped
    pub fn start_render_loop(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.receiver.recv().await {
                    Ok(event) => {
                        let finished = matches!(event, ProgressEvent::Finished { .. });
                        if let Some(line) = render_event(&event, self.show_debug) {
                            println!("{}", line);
                        }
                        if finished {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        println!("  {}", style(format!("({} progress events skipped)", skipped)).dim());
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Format one event; `None` for events that are not shown
pub fn render_event(event: &ProgressEvent, show_debug: bool) -> Option<String> {
    match event {
        ProgressEvent::StageStarted { stage } => {
            Some(format!("  {} {}", style("▸").cyan(), style(stage).bold()))
        }
        ProgressEvent::StageCompleted {
            stage,
            status,
            succeeded,
            failed,
            running_confidence,
        } => Some(format!(
            "  {} {:<10} {} ok, {} failed  confidence {} {:.1}",
            status_icon(*status),
            stage,
            succeeded,
            failed,
            render_confidence_bar(*running_confidence, 10),
            running_confidence
        )),
        ProgressEvent::Message { level, message } => match level {
            MessageLevel::Debug if !show_debug => None,
            MessageLevel::Debug => Some(format!("    {}", style(message).dim())),
            MessageLevel::Info => Some(format!("    {}", message)),
            MessageLevel::Warning => Some(format!("    {} {}", style("⚠").yellow(), message)),
            MessageLevel::Error => Some(format!("    {} {}", style("✗").red(), message)),
        },
        ProgressEvent::Finished {
            success,
            total_duration_secs,
            summary,
        } => {
            let icon = if *success {
                style("✓").green()
            } else {
                style("✗").red()
            };
            Some(format!(
                "{} {} ({})",
                icon,
                summary,
                format_duration(*total_duration_secs)
            ))
        }
    }
}

/// Bar for a 0-10 confidence value
fn render_confidence_bar(confidence: f64, width: usize) -> String {
    let ratio = (confidence / MAX_SCORE).clamp(0.0, 1.0);
    let filled = (ratio * width as f64).round() as usize;
    let empty = width.saturating_sub(filled);

    format!("[{}{}]", "█".repeat(filled), "░".repeat(empty))
}

/// Format duration as human-readable string
fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
