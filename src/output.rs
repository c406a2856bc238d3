// ABOUTME: Output formatting for CLI feedback and streamed remote lines.
// ABOUTME: Supports normal, quiet (CI), and JSON output modes.

use crate::stream::{OutputChannel, TaggedLine};
use crossterm::style::Stylize;
use serde::Serialize;
use std::io::IsTerminal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Output mode for CLI feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Human-friendly output with host-prefixed lines
    Normal,
    /// Minimal output for CI (no progress messages)
    Quiet,
    /// JSON lines for scripting
    Json,
}

/// Handles CLI output based on the configured mode.
pub struct Output {
    mode: OutputMode,
}

impl Output {
    pub fn new(mode: OutputMode) -> Self {
        Self { mode }
    }

    /// Print a progress message (suppressed in quiet/json mode).
    pub fn progress(&self, message: &str) {
        if self.mode == OutputMode::Normal {
            println!("{message}");
        }
    }

    /// Print an error message.
    pub fn error(&self, message: &str) {
        match self.mode {
            OutputMode::Normal | OutputMode::Quiet => {
                eprintln!("Error: {message}");
            }
            OutputMode::Json => {
                let event = JsonEvent {
                    event: "error",
                    host: None,
                    message,
                };
                if let Ok(json) = serde_json::to_string(&event) {
                    eprintln!("{json}");
                }
            }
        }
    }
}

/// Prints tagged lines as they arrive, prefixed with the originating host
/// padded to the widest host name in the batch.
pub struct LinePrinter {
    mode: OutputMode,
    pad_width: usize,
    color: bool,
}

impl LinePrinter {
    pub fn new(mode: OutputMode, pad_width: usize) -> Self {
        Self {
            mode,
            pad_width,
            color: std::io::stdout().is_terminal(),
        }
    }

    pub fn print(&self, line: &TaggedLine) {
        match self.mode {
            OutputMode::Normal | OutputMode::Quiet => {
                let host = format!("{:<width$}", line.host, width = self.pad_width);
                let prefix = if self.color {
                    host.cyan().to_string()
                } else {
                    host
                };
                match line.channel {
                    OutputChannel::Stdout => println!("{prefix} {}", line.line),
                    OutputChannel::Stderr => eprintln!("{prefix} {}", line.line),
                }
            }
            OutputMode::Json => {
                let event = JsonEvent {
                    event: match line.channel {
                        OutputChannel::Stdout => "stdout",
                        OutputChannel::Stderr => "stderr",
                    },
                    host: Some(&line.host),
                    message: &line.line,
                };
                if let Ok(json) = serde_json::to_string(&event) {
                    println!("{json}");
                }
            }
        }
    }
}

/// Drain a line channel onto the terminal until every sender hangs up.
pub fn spawn_printer(
    mut rx: mpsc::Receiver<TaggedLine>,
    mode: OutputMode,
    pad_width: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let printer = LinePrinter::new(mode, pad_width);
        while let Some(line) = rx.recv().await {
            printer.print(&line);
        }
    })
}

#[derive(Serialize)]
struct JsonEvent<'a> {
    event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<&'a str>,
    message: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_event_omits_absent_host() {
        let event = JsonEvent {
            event: "error",
            host: None,
            message: "boom",
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"event":"error","message":"boom"}"#);
    }

    #[test]
    fn json_event_includes_host_for_lines() {
        let event = JsonEvent {
            event: "stdout",
            host: Some("web1"),
            message: "ok",
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""host":"web1""#));
    }
}
