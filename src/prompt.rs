// ABOUTME: Terminal prompter for confirmations and masked secret entry.
// ABOUTME: Implements the negotiator's Prompter trait against stdin/stdout.

use crate::negotiate::Prompter;
use async_trait::async_trait;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal;
use std::io::{self, Write};

/// Prompts on the controlling terminal. Secrets are read with raw mode on
/// so the password never echoes.
#[derive(Debug, Default)]
pub struct TerminalPrompter;

impl TerminalPrompter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Prompter for TerminalPrompter {
    async fn confirm(&self, message: &str) -> io::Result<bool> {
        let message = message.to_string();
        tokio::task::spawn_blocking(move || {
            print!("{message} [y/N] ");
            io::stdout().flush()?;
            let mut answer = String::new();
            io::stdin().read_line(&mut answer)?;
            let answer = answer.trim().to_ascii_lowercase();
            Ok(answer == "y" || answer == "yes")
        })
        .await
        .map_err(|e| io::Error::other(e.to_string()))?
    }

    async fn secret(&self, prompt: &str) -> io::Result<String> {
        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || read_secret(&prompt))
            .await
            .map_err(|e| io::Error::other(e.to_string()))?
    }
}

/// Restores cooked mode even when secret entry errors out.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

fn read_secret(prompt: &str) -> io::Result<String> {
    print!("{prompt}");
    io::stdout().flush()?;

    let _guard = RawModeGuard::enable()?;
    let mut secret = String::new();
    loop {
        if let Event::Key(KeyEvent {
            code, modifiers, ..
        }) = event::read()?
        {
            match code {
                KeyCode::Enter => break,
                KeyCode::Backspace => {
                    secret.pop();
                }
                KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => {
                    return Err(io::Error::new(io::ErrorKind::Interrupted, "interrupted"));
                }
                KeyCode::Char(c) => secret.push(c),
                _ => {}
            }
        }
    }
    drop(_guard);
    println!();
    Ok(secret)
}

/// Non-interactive prompter for scripted runs: refuses every prompt so a
/// batch never hangs waiting for a terminal that is not there.
#[derive(Debug, Default)]
pub struct NonInteractivePrompter;

#[async_trait]
impl Prompter for NonInteractivePrompter {
    async fn confirm(&self, _message: &str) -> io::Result<bool> {
        Ok(false)
    }

    async fn secret(&self, prompt: &str) -> io::Result<String> {
        Err(io::Error::other(format!(
            "cannot prompt without a terminal: {prompt}"
        )))
    }
}
