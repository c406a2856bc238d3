// ABOUTME: Session multiplexer fanning one command out to many hosts.
// ABOUTME: Bounded parallel negotiation, streamed output, aggregated exit statuses.

use crate::diagnostics::{Diagnostics, Warning};
use crate::error::Error;
use crate::negotiate::{AuthNegotiator, NegotiationError};
use crate::stream::{OutputChannel, OutputFrame, OutputStreamer, TaggedLine};
use crate::target::{ConnectionDescriptor, Protocol};
use crate::transport::{ChannelEvent, FailureReason, Session};
use crate::types::SessionId;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Default cap on concurrent connection attempts and in-flight commands.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Prompt string installed by the sudo rewrite and watched for in output.
pub const SUDO_PROMPT_SIGNATURE: &str = "fanout sudo password: ";

/// What to do when two descriptors resolve to the same host name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Keep the first session, drop the rest silently.
    #[default]
    Ignore,
    /// Keep the first session, warn about the rest.
    Warn,
    /// Fail the whole batch.
    Fatal,
}

impl std::str::FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ignore" => Ok(DuplicatePolicy::Ignore),
            "warn" => Ok(DuplicatePolicy::Warn),
            "fatal" => Ok(DuplicatePolicy::Fatal),
            other => Err(format!("unknown duplicate policy: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MultiplexerOptions {
    pub concurrency: usize,
    pub on_duplicate: DuplicatePolicy,
    /// Cancel every in-flight session as soon as one fails.
    pub exit_on_error: bool,
    /// Password written into a session when the sudo prompt signature shows
    /// up in its output. Per-descriptor sudo passwords take precedence.
    pub sudo_password: Option<String>,
}

impl Default for MultiplexerOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            on_duplicate: DuplicatePolicy::default(),
            exit_on_error: false,
            sudo_password: None,
        }
    }
}

/// Identifies one registered session to callers.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub host: String,
}

/// How one session's command run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Exited(u32),
    Failed(FailureReason),
    /// The run was cancelled before this session finished. No exit code is
    /// fabricated for it.
    Cancelled,
}

/// Result of one command on one session; immutable after creation.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub session_id: SessionId,
    pub host: String,
    pub outcome: CommandOutcome,
    pub stdout: String,
    pub stderr: String,
}

/// A connect failure tolerated under the default failure policy.
#[derive(Debug)]
pub struct ConnectFailure {
    pub host: String,
    pub error: NegotiationError,
}

/// Outcome of one fan-out run: every per-session result collected, plus the
/// abort marker when exit-on-error tripped.
#[derive(Debug)]
pub struct RunReport {
    pub results: Vec<CommandResult>,
    pub aborted: Option<Abort>,
}

/// The first failure that cancelled the batch.
#[derive(Debug, Clone)]
pub struct Abort {
    pub host: String,
    pub reason: String,
}

struct SessionEntry {
    id: SessionId,
    host: String,
    descriptor: ConnectionDescriptor,
    /// Taken by the per-session task during a run, put back afterwards.
    session: Option<Box<dyn Session>>,
}

/// Owns a set of authenticated sessions and runs commands across all of
/// them concurrently. The multiplexer is the only synchronization point:
/// per-session tasks own their session and line buffers exclusively.
pub struct SessionMultiplexer {
    negotiator: Arc<AuthNegotiator>,
    options: MultiplexerOptions,
    entries: Vec<SessionEntry>,
    cancel: CancellationToken,
    diagnostics: Diagnostics,
}

impl SessionMultiplexer {
    pub fn new(negotiator: AuthNegotiator, options: MultiplexerOptions) -> Self {
        Self {
            negotiator: Arc::new(negotiator),
            options,
            entries: Vec::new(),
            cancel: CancellationToken::new(),
            diagnostics: Diagnostics::default(),
        }
    }

    /// Token that stops all in-flight work when cancelled. `close` cancels
    /// it as well; a caller holding a clone can interrupt a running batch.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn hosts(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.host.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Longest registered host name, for output prefix padding.
    pub fn longest_host(&self) -> usize {
        self.entries.iter().map(|e| e.host.len()).max().unwrap_or(0)
    }

    /// Negotiate one session and register it.
    ///
    /// `add` does not evaluate the duplicate policy; callers registering
    /// sessions one at a time call [`finalize`](Self::finalize) once after
    /// the last `add` and before the first run. `add_all` does both itself.
    pub async fn add(
        &mut self,
        descriptor: ConnectionDescriptor,
    ) -> Result<SessionHandle, NegotiationError> {
        let negotiated = self.negotiator.negotiate(&descriptor).await?;
        let handle = SessionHandle {
            id: SessionId::new(),
            host: descriptor.host.clone(),
        };
        self.entries.push(SessionEntry {
            id: handle.id,
            host: handle.host.clone(),
            descriptor: negotiated.descriptor,
            session: Some(negotiated.session),
        });
        Ok(handle)
    }

    /// Negotiate every descriptor with bounded parallelism, then apply the
    /// duplicate policy once, before any run.
    ///
    /// Per-host connect failures are tolerated (and returned) unless
    /// exit-on-error is set, in which case the first one fails the batch.
    pub async fn add_all(
        &mut self,
        descriptors: Vec<ConnectionDescriptor>,
    ) -> Result<Vec<ConnectFailure>, Error> {
        if descriptors.is_empty() {
            return Err(Error::NoTargets);
        }

        let negotiator = Arc::clone(&self.negotiator);
        let mut outcomes: Vec<(usize, ConnectionDescriptor, Result<_, NegotiationError>)> =
            stream::iter(descriptors.into_iter().enumerate().map(
                |(index, descriptor)| {
                    let negotiator = Arc::clone(&negotiator);
                    async move {
                        let result = negotiator.negotiate(&descriptor).await;
                        (index, descriptor, result)
                    }
                },
            ))
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;
        // Completion order is arbitrary; the duplicate policy keeps the
        // first *listed* host, so restore input order.
        outcomes.sort_by_key(|(index, _, _)| *index);

        let mut failures = Vec::new();
        for (_, descriptor, outcome) in outcomes {
            match outcome {
                Ok(negotiated) => {
                    self.entries.push(SessionEntry {
                        id: SessionId::new(),
                        host: descriptor.host.clone(),
                        descriptor: negotiated.descriptor,
                        session: Some(negotiated.session),
                    });
                }
                Err(error) => {
                    if self.options.exit_on_error {
                        return Err(Error::ExitOnError {
                            host: descriptor.host.clone(),
                            reason: error.to_string(),
                        });
                    }
                    tracing::warn!("failed to connect to {}: {}", descriptor.host, error);
                    self.diagnostics.warn(Warning::connect_failure(format!(
                        "{}: {}",
                        descriptor.host, error
                    )));
                    failures.push(ConnectFailure {
                        host: descriptor.host.clone(),
                        error,
                    });
                }
            }
        }

        self.finalize().await?;

        if self.entries.is_empty() {
            return Err(Error::NoSessions);
        }
        Ok(failures)
    }

    /// Evaluate the duplicate policy over everything registered so far.
    ///
    /// Idempotent; runs at most once per batch in practice.
    pub async fn finalize(&mut self) -> Result<(), Error> {
        self.resolve_duplicates().await
    }

    /// Apply the duplicate-host policy, closing any dropped sessions.
    async fn resolve_duplicates(&mut self) -> Result<(), Error> {
        let mut seen = std::collections::HashSet::new();
        let mut duplicates = Vec::new();
        for entry in &self.entries {
            if !seen.insert(entry.host.clone()) {
                duplicates.push(entry.host.clone());
            }
        }
        if duplicates.is_empty() {
            return Ok(());
        }

        match self.options.on_duplicate {
            DuplicatePolicy::Fatal => {
                duplicates.sort();
                duplicates.dedup();
                return Err(Error::DuplicateHosts(duplicates.join(", ")));
            }
            DuplicatePolicy::Warn => {
                tracing::warn!("duplicated hosts: {}", duplicates.join(", "));
            }
            DuplicatePolicy::Ignore => {}
        }

        let mut kept = std::collections::HashSet::new();
        let mut retained = Vec::with_capacity(self.entries.len());
        for mut entry in self.entries.drain(..) {
            if kept.insert(entry.host.clone()) {
                retained.push(entry);
            } else if let Some(mut session) = entry.session.take() {
                if let Err(e) = session.close().await {
                    self.diagnostics.warn(Warning::session_close(format!(
                        "{}: {}",
                        entry.host, e
                    )));
                }
            }
        }
        self.entries = retained;
        Ok(())
    }

    /// Run `command` on every open session concurrently. Lines are streamed
    /// through `lines` as they complete; the report carries one result per
    /// session that ran.
    pub async fn run(&mut self, command: &str, lines: mpsc::Sender<TaggedLine>) -> RunReport {
        self.run_filtered(None, command, lines).await
    }

    /// Run `command` on the named subset only, leaving other sessions idle.
    pub async fn run_on(
        &mut self,
        hosts: &[String],
        command: &str,
        lines: mpsc::Sender<TaggedLine>,
    ) -> RunReport {
        self.run_filtered(Some(hosts), command, lines).await
    }

    async fn run_filtered(
        &mut self,
        filter: Option<&[String]>,
        command: &str,
        lines: mpsc::Sender<TaggedLine>,
    ) -> RunReport {
        let run_token = self.cancel.child_token();
        // The concurrency cap bounds command execution the same way it
        // bounds the connect phase.
        let permits = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut tasks: JoinSet<(usize, Box<dyn Session>, CommandResult)> = JoinSet::new();

        for (index, entry) in self.entries.iter_mut().enumerate() {
            if let Some(hosts) = filter {
                if !hosts.iter().any(|h| h == &entry.host) {
                    continue;
                }
            }
            let Some(session) = entry.session.take() else {
                continue;
            };

            let command = if entry.descriptor.hints.elevation.sudo
                && !command.starts_with("sudo")
            {
                format!("sudo {command}")
            } else {
                command.to_string()
            };
            let command = match entry.descriptor.protocol {
                Protocol::Ssh => fixup_sudo(&command),
                Protocol::Winrm => command,
            };
            let sudo_password = entry
                .descriptor
                .hints
                .elevation
                .sudo_password
                .clone()
                .or_else(|| self.options.sudo_password.clone());

            let id = entry.id;
            let host = entry.host.clone();
            let lines = lines.clone();
            let token = run_token.clone();
            let permits = Arc::clone(&permits);

            tasks.spawn(async move {
                // Never errors: the semaphore is not closed for the run's
                // lifetime.
                let _permit = permits.acquire_owned().await.ok();
                let (session, result) =
                    run_one(session, id, host, &command, lines, token, sudo_password).await;
                (index, session, result)
            });
        }
        drop(lines);

        let mut results = Vec::new();
        let mut aborted = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, session, result)) => {
                    let failed = !matches!(result.outcome, CommandOutcome::Exited(0));
                    if failed && self.options.exit_on_error && aborted.is_none() {
                        let reason = match &result.outcome {
                            CommandOutcome::Exited(status) => format!("exit status {status}"),
                            CommandOutcome::Failed(reason) => reason.to_string(),
                            CommandOutcome::Cancelled => "cancelled".to_string(),
                        };
                        aborted = Some(Abort {
                            host: result.host.clone(),
                            reason,
                        });
                        run_token.cancel();
                    }
                    self.entries[index].session = Some(session);
                    results.push(result);
                }
                Err(join_error) => {
                    tracing::error!("session task failed: {join_error}");
                }
            }
        }

        RunReport { results, aborted }
    }

    /// Release every session. Close errors are collected as diagnostics so
    /// they never mask the error that triggered the shutdown.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        for mut entry in self.entries.drain(..) {
            if let Some(mut session) = entry.session.take() {
                if let Err(e) = session.close().await {
                    self.diagnostics
                        .warn(Warning::session_close(format!("{}: {}", entry.host, e)));
                }
            }
        }
    }
}

/// Rewrite a leading `sudo` so the remote side uses our recognizable prompt.
///
/// Best-effort: detection of the prompt in output depends on the remote
/// sudo honoring `-p`, exactly like the interactive feature it backs.
fn fixup_sudo(command: &str) -> String {
    if command == "sudo" || command.starts_with("sudo ") {
        command.replacen("sudo", &format!("sudo -p '{SUDO_PROMPT_SIGNATURE}'"), 1)
    } else {
        command.to_string()
    }
}

/// Drive one session's command to completion, streaming completed lines and
/// answering the sudo prompt signature at most once per occurrence.
async fn run_one(
    mut session: Box<dyn Session>,
    id: SessionId,
    host: String,
    command: &str,
    lines: mpsc::Sender<TaggedLine>,
    token: CancellationToken,
    sudo_password: Option<String>,
) -> (Box<dyn Session>, CommandResult) {
    let mut streamer = OutputStreamer::new(host.clone());
    let mut stdout = String::new();
    let mut stderr = String::new();

    let outcome = drive_command(
        session.as_mut(),
        id,
        command,
        &mut streamer,
        &mut stdout,
        &mut stderr,
        &lines,
        &token,
        sudo_password,
    )
    .await;

    for line in streamer.flush() {
        let _ = lines.send(line).await;
    }

    (
        session,
        CommandResult {
            session_id: id,
            host,
            outcome,
            stdout,
            stderr,
        },
    )
}

#[allow(clippy::too_many_arguments)]
async fn drive_command(
    session: &mut dyn Session,
    id: SessionId,
    command: &str,
    streamer: &mut OutputStreamer,
    stdout: &mut String,
    stderr: &mut String,
    lines: &mpsc::Sender<TaggedLine>,
    token: &CancellationToken,
    sudo_password: Option<String>,
) -> CommandOutcome {
    let mut channel = tokio::select! {
        opened = session.open_command(command) => match opened {
            Ok(channel) => channel,
            Err(reason) => return CommandOutcome::Failed(reason),
        },
        _ = token.cancelled() => return CommandOutcome::Cancelled,
    };

    let mut exit_status = None;
    loop {
        let event = tokio::select! {
            event = channel.next_event() => event,
            _ = token.cancelled() => return CommandOutcome::Cancelled,
        };

        match event {
            Ok(Some(ChannelEvent::Stdout(bytes))) => {
                stdout.push_str(&String::from_utf8_lossy(&bytes));
                if let Some(password) = &sudo_password {
                    if contains_sudo_prompt(&bytes) {
                        tracing::debug!("{}: answering sudo prompt", streamer.host());
                        if let Err(e) = channel.send_input(format!("{password}\n").as_bytes()).await
                        {
                            return CommandOutcome::Failed(e);
                        }
                    }
                }
                let frame = OutputFrame {
                    session_id: id,
                    channel: OutputChannel::Stdout,
                    bytes,
                };
                for line in streamer.feed_frame(&frame) {
                    let _ = lines.send(line).await;
                }
            }
            Ok(Some(ChannelEvent::Stderr(bytes))) => {
                stderr.push_str(&String::from_utf8_lossy(&bytes));
                let frame = OutputFrame {
                    session_id: id,
                    channel: OutputChannel::Stderr,
                    bytes,
                };
                for line in streamer.feed_frame(&frame) {
                    let _ = lines.send(line).await;
                }
            }
            Ok(Some(ChannelEvent::Exit(status))) => {
                exit_status = Some(status);
            }
            Ok(None) => break,
            Err(reason) => return CommandOutcome::Failed(reason),
        }
    }

    match exit_status {
        Some(status) => CommandOutcome::Exited(status),
        None => CommandOutcome::Failed(FailureReason::ChannelClosed),
    }
}

/// Best-effort detection of the sudo prompt signature in a raw chunk.
fn contains_sudo_prompt(bytes: &[u8]) -> bool {
    bytes
        .windows(SUDO_PROMPT_SIGNATURE.len())
        .any(|w| w == SUDO_PROMPT_SIGNATURE.as_bytes())
}

/// Worst exit status across a batch: the highest remote exit code, with
/// failed or cancelled sessions counting as 1.
pub fn worst_exit_status(results: &[CommandResult]) -> u32 {
    results
        .iter()
        .map(|r| match &r.outcome {
            CommandOutcome::Exited(status) => *status,
            CommandOutcome::Failed(_) | CommandOutcome::Cancelled => 1,
        })
        .max()
        .unwrap_or(0)
}

/// [`worst_exit_status`] clamped into the range a process exit code can
/// actually carry.
pub fn worst_exit_code(results: &[CommandResult]) -> i32 {
    i32::try_from(worst_exit_status(results)).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixup_sudo_rewrites_leading_sudo_only() {
        assert_eq!(
            fixup_sudo("sudo apt-get update"),
            format!("sudo -p '{SUDO_PROMPT_SIGNATURE}' apt-get update")
        );
        assert_eq!(fixup_sudo("echo sudo"), "echo sudo");
        assert_eq!(fixup_sudo("uptime"), "uptime");
    }

    #[test]
    fn sudo_prompt_detected_inside_chunk() {
        let chunk = format!("garbage{SUDO_PROMPT_SIGNATURE}");
        assert!(contains_sudo_prompt(chunk.as_bytes()));
        assert!(!contains_sudo_prompt(b"no prompt here"));
    }

    #[test]
    fn worst_exit_takes_the_maximum() {
        let result = |outcome| CommandResult {
            session_id: SessionId::new(),
            host: "h".into(),
            outcome,
            stdout: String::new(),
            stderr: String::new(),
        };
        let results = vec![
            result(CommandOutcome::Exited(0)),
            result(CommandOutcome::Exited(3)),
            result(CommandOutcome::Failed(FailureReason::ChannelClosed)),
        ];
        assert_eq!(worst_exit_status(&results), 3);
        assert_eq!(worst_exit_status(&[]), 0);
    }

    #[test]
    fn exit_codes_clamp_into_process_range() {
        let huge = CommandResult {
            session_id: SessionId::new(),
            host: "h".into(),
            outcome: CommandOutcome::Exited(u32::MAX),
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(worst_exit_code(std::slice::from_ref(&huge)), i32::MAX);
        assert_eq!(worst_exit_code(&[]), 0);
    }

    #[test]
    fn duplicate_policy_parses() {
        assert_eq!(
            "ignore".parse::<DuplicatePolicy>().unwrap(),
            DuplicatePolicy::Ignore
        );
        assert_eq!(
            "fatal".parse::<DuplicatePolicy>().unwrap(),
            DuplicatePolicy::Fatal
        );
        assert!("explode".parse::<DuplicatePolicy>().is_err());
    }
}
