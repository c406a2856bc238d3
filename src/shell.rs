// ABOUTME: Interactive shell running commands across all open sessions.
// ABOUTME: Small REPL grammar with subset targeting and explicit quit.

use crate::multiplex::{SessionMultiplexer, worst_exit_code};
use crate::output::{OutputMode, spawn_printer};
use std::io::{self, BufRead, Write};
use tokio::sync::mpsc;

const PROMPT: &str = "fanout> ";

/// One parsed line of shell input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    /// Run on every session.
    RunAll(String),
    /// Run on the named hosts only.
    RunOn { hosts: Vec<String>, command: String },
    Empty,
    Quit,
}

/// Parse one line of the interactive grammar.
///
/// `on HOST1 HOST2; COMMAND` targets a subset; `quit!` exits; anything else
/// runs verbatim on every session.
pub fn parse_line(line: &str) -> Result<ShellCommand, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(ShellCommand::Empty);
    }
    if trimmed == "quit!" {
        return Ok(ShellCommand::Quit);
    }
    if let Some(rest) = trimmed.strip_prefix("on ") {
        let Some((hosts, command)) = rest.split_once(';') else {
            return Err("syntax: on HOST1 HOST2 ...; COMMAND".to_string());
        };
        let hosts: Vec<String> = hosts.split_whitespace().map(str::to_string).collect();
        let command = command.trim();
        if hosts.is_empty() || command.is_empty() {
            return Err("syntax: on HOST1 HOST2 ...; COMMAND".to_string());
        }
        return Ok(ShellCommand::RunOn {
            hosts,
            command: command.to_string(),
        });
    }
    Ok(ShellCommand::RunAll(trimmed.to_string()))
}

/// Read-eval loop over an established session set.
///
/// Owns the multiplexer for its lifetime; sessions stay open between
/// commands and are closed when the loop exits.
pub struct InteractiveShell {
    multiplexer: SessionMultiplexer,
    mode: OutputMode,
}

impl InteractiveShell {
    pub fn new(multiplexer: SessionMultiplexer, mode: OutputMode) -> Self {
        Self { multiplexer, mode }
    }

    /// Run the loop until `quit!` or end of input. Returns the worst exit
    /// status of the last executed command.
    pub async fn run(mut self) -> io::Result<i32> {
        println!(
            "Connected to {} host(s): {}",
            self.multiplexer.len(),
            self.multiplexer.hosts().join(", ")
        );
        println!("Type commands to run them everywhere; `on HOST ...; CMD` for a subset; `quit!` to exit.");

        let mut last_status = 0;
        loop {
            let line = match read_line(PROMPT).await? {
                Some(line) => line,
                None => break,
            };

            match parse_line(&line) {
                Ok(ShellCommand::Empty) => continue,
                Ok(ShellCommand::Quit) => break,
                Ok(ShellCommand::RunAll(command)) => {
                    last_status = self.dispatch(None, &command).await;
                }
                Ok(ShellCommand::RunOn { hosts, command }) => {
                    let unknown: Vec<&String> = hosts
                        .iter()
                        .filter(|h| !self.multiplexer.hosts().contains(*h))
                        .collect();
                    if !unknown.is_empty() {
                        eprintln!(
                            "unknown host(s): {}",
                            unknown
                                .iter()
                                .map(|s| s.as_str())
                                .collect::<Vec<_>>()
                                .join(", ")
                        );
                        continue;
                    }
                    last_status = self.dispatch(Some(hosts), &command).await;
                }
                Err(message) => eprintln!("{message}"),
            }
        }

        self.multiplexer.close().await;
        Ok(last_status)
    }

    async fn dispatch(&mut self, hosts: Option<Vec<String>>, command: &str) -> i32 {
        let (tx, rx) = mpsc::channel(64);
        let printer = spawn_printer(rx, self.mode, self.multiplexer.longest_host());

        let report = match hosts {
            Some(hosts) => self.multiplexer.run_on(&hosts, command, tx).await,
            None => self.multiplexer.run(command, tx).await,
        };
        let _ = printer.await;

        worst_exit_code(&report.results)
    }
}

/// Read one line from stdin without blocking the runtime. `None` on EOF.
async fn read_line(prompt: &str) -> io::Result<Option<String>> {
    let prompt = prompt.to_string();
    tokio::task::spawn_blocking(move || {
        print!("{prompt}");
        io::stdout().flush()?;
        let mut line = String::new();
        let read = io::stdin().lock().read_line(&mut line)?;
        if read == 0 {
            Ok(None)
        } else {
            Ok(Some(line))
        }
    })
    .await
    .map_err(|e| io::Error::other(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_command_runs_everywhere() {
        assert_eq!(
            parse_line("uptime").unwrap(),
            ShellCommand::RunAll("uptime".to_string())
        );
    }

    #[test]
    fn on_clause_targets_a_subset() {
        assert_eq!(
            parse_line("on web1 web2; sudo systemctl restart nginx").unwrap(),
            ShellCommand::RunOn {
                hosts: vec!["web1".to_string(), "web2".to_string()],
                command: "sudo systemctl restart nginx".to_string(),
            }
        );
    }

    #[test]
    fn quit_bang_exits() {
        assert_eq!(parse_line("quit!").unwrap(), ShellCommand::Quit);
        assert_eq!(parse_line("  quit!  ").unwrap(), ShellCommand::Quit);
    }

    #[test]
    fn blank_line_is_a_noop() {
        assert_eq!(parse_line("   ").unwrap(), ShellCommand::Empty);
    }

    #[test]
    fn on_clause_requires_semicolon_and_command() {
        assert!(parse_line("on web1 uptime").is_err());
        assert!(parse_line("on ; uptime").is_err());
        assert!(parse_line("on web1;   ").is_err());
    }

    #[test]
    fn command_containing_quit_still_runs() {
        assert_eq!(
            parse_line("echo quit!").unwrap(),
            ShellCommand::RunAll("echo quit!".to_string())
        );
    }
}
