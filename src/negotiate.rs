// ABOUTME: Authentication negotiator with a bounded escalation state machine.
// ABOUTME: Turns classified transport failures into retries with adjusted hints.

use crate::target::{ConnectionDescriptor, HostKeyPolicy, Protocol};
use crate::transport::{FailureReason, Session, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Consecutive wrong-sudo-password prompts tolerated before giving up.
pub const MAX_SUDO_PASSWORD_ATTEMPTS: u8 = 3;

/// Terminal outcome of a failed negotiation.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("host key for {host} was rejected")]
    HostKeyRejected { host: String },

    #[error("retries exhausted: {reason}")]
    RetriesExhausted { reason: FailureReason },

    #[error(transparent)]
    Transport(#[from] FailureReason),

    #[error("prompt failed: {0}")]
    Prompt(String),
}

/// Interactive confirmation and secret-entry capability injected by the
/// caller. Prompting blocks only the negotiation that needs it.
#[async_trait]
pub trait Prompter: Send + Sync {
    async fn confirm(&self, message: &str) -> std::io::Result<bool>;

    /// Ask for a secret with echo disabled.
    async fn secret(&self, prompt: &str) -> std::io::Result<String>;
}

/// A successfully negotiated session plus the descriptor posture that
/// finally worked (the caller-supplied descriptor is never mutated).
pub struct Negotiated {
    pub session: Box<dyn Session>,
    pub descriptor: ConnectionDescriptor,
}

impl std::fmt::Debug for Negotiated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiated")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// One in-flight negotiation: the current descriptor plus the escalations
/// already spent. Every transition is monotonic, so no posture can repeat.
struct NegotiationAttempt {
    descriptor: ConnectionDescriptor,
    attempt: u32,
    trust_escalated: bool,
    pty_forced: bool,
    password_switched: bool,
    password_prompted: bool,
    sudo_attempts: u8,
}

impl NegotiationAttempt {
    fn new(descriptor: ConnectionDescriptor) -> Self {
        Self {
            descriptor,
            attempt: 1,
            trust_escalated: false,
            pty_forced: false,
            password_switched: false,
            password_prompted: false,
            sudo_attempts: 0,
        }
    }
}

/// Passwords prompted once and reused for the rest of the batch, so a
/// 50-host fan-out asks a question 1 time instead of 50.
#[derive(Default)]
struct SecretCache {
    login: Mutex<Option<String>>,
    sudo: Mutex<Option<String>>,
}

/// Owns the retry and escalation policy for establishing one session.
///
/// Prompted passwords are cached for the negotiator's lifetime (one batch);
/// a password reported as wrong is dropped from the cache before re-prompting.
pub struct AuthNegotiator {
    transport: Arc<dyn Transport>,
    prompter: Arc<dyn Prompter>,
    secrets: SecretCache,
}

impl AuthNegotiator {
    pub fn new(transport: Arc<dyn Transport>, prompter: Arc<dyn Prompter>) -> Self {
        Self {
            transport,
            prompter,
            secrets: SecretCache::default(),
        }
    }

    async fn login_password(&self, prompt: &str) -> Result<String, NegotiationError> {
        if let Some(cached) = self.secrets.login.lock().clone() {
            return Ok(cached);
        }
        let password = self
            .prompter
            .secret(prompt)
            .await
            .map_err(|e| NegotiationError::Prompt(e.to_string()))?;
        *self.secrets.login.lock() = Some(password.clone());
        Ok(password)
    }

    async fn sudo_password(&self, prompt: &str, invalidate: bool) -> Result<String, NegotiationError> {
        if invalidate {
            *self.secrets.sudo.lock() = None;
        } else if let Some(cached) = self.secrets.sudo.lock().clone() {
            return Ok(cached);
        }
        let password = self
            .prompter
            .secret(prompt)
            .await
            .map_err(|e| NegotiationError::Prompt(e.to_string()))?;
        *self.secrets.sudo.lock() = Some(password.clone());
        Ok(password)
    }

    /// Establish an authenticated session for `descriptor`, escalating
    /// through the bounded transition table on classified auth failures.
    pub async fn negotiate(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Negotiated, NegotiationError> {
        let mut attempt = NegotiationAttempt::new(descriptor.clone());

        loop {
            tracing::debug!(
                remote = %attempt.descriptor,
                attempt = attempt.attempt,
                "connecting"
            );
            match self.transport.connect(&attempt.descriptor).await {
                Ok(session) => {
                    return Ok(Negotiated {
                        session,
                        descriptor: attempt.descriptor,
                    });
                }
                Err(reason) => attempt = self.escalate(attempt, reason).await?,
            }
        }
    }

    /// Apply exactly one transition for `reason`, or fail terminally.
    async fn escalate(
        &self,
        mut attempt: NegotiationAttempt,
        reason: FailureReason,
    ) -> Result<NegotiationAttempt, NegotiationError> {
        let host = attempt.descriptor.host.clone();
        let user = attempt
            .descriptor
            .user
            .clone()
            .unwrap_or_else(|| "root".to_string());

        match reason {
            FailureReason::UnknownHostKey {
                host: reported_host,
                fingerprint,
            } if !attempt.trust_escalated => {
                let message = format!(
                    "The authenticity of host '{reported_host}' can't be established.\n\
                     Key fingerprint is {fingerprint}.\n\
                     Are you sure you want to continue connecting?"
                );
                let confirmed = self
                    .prompter
                    .confirm(&message)
                    .await
                    .map_err(|e| NegotiationError::Prompt(e.to_string()))?;
                if !confirmed {
                    return Err(NegotiationError::HostKeyRejected { host });
                }
                attempt.trust_escalated = true;
                attempt.descriptor = attempt
                    .descriptor
                    .with_host_key_policy(HostKeyPolicy::AcceptNew);
            }
            reason @ FailureReason::UnknownHostKey { .. } => {
                return Err(NegotiationError::RetriesExhausted { reason });
            }

            FailureReason::SudoTtyRequired if !attempt.pty_forced => {
                tracing::warn!("{host}: sudo requires a tty, retrying with a pty request");
                attempt.pty_forced = true;
                attempt.descriptor = attempt.descriptor.with_pty();
            }
            FailureReason::SudoTtyRequired => {
                return Err(NegotiationError::RetriesExhausted {
                    reason: FailureReason::SudoTtyRequired,
                });
            }

            reason @ (FailureReason::SudoPasswordRequired | FailureReason::BadSudoPassword) => {
                if !attempt.descriptor.hints.elevation.use_sudo_password {
                    return Err(NegotiationError::Transport(reason));
                }
                if attempt.sudo_attempts >= MAX_SUDO_PASSWORD_ATTEMPTS {
                    return Err(NegotiationError::RetriesExhausted { reason });
                }
                attempt.sudo_attempts += 1;
                tracing::warn!(
                    "{host}: {reason} (sudo password attempt {} of {MAX_SUDO_PASSWORD_ATTEMPTS})",
                    attempt.sudo_attempts
                );
                let wrong = reason == FailureReason::BadSudoPassword;
                let password = self
                    .sudo_password(&format!("Enter sudo password for {user}@{host}: "), wrong)
                    .await?;
                attempt.descriptor = attempt.descriptor.with_sudo_password(password);
            }

            FailureReason::KeyAuthFailed
                if attempt.descriptor.protocol == Protocol::Ssh
                    && !attempt.descriptor.hints.key_only
                    && !attempt.password_switched =>
            {
                tracing::warn!("{host}: key authentication failed, trying password auth");
                let password = self
                    .login_password(&format!("Enter password for {user}@{host}: "))
                    .await?;
                attempt.password_switched = true;
                attempt.descriptor = attempt.descriptor.with_password_only(password);
            }
            FailureReason::KeyAuthFailed if attempt.password_switched => {
                return Err(NegotiationError::RetriesExhausted {
                    reason: FailureReason::KeyAuthFailed,
                });
            }

            FailureReason::PasswordRequired
                if attempt.descriptor.protocol == Protocol::Winrm
                    && !attempt.password_prompted =>
            {
                tracing::warn!("{host}: password required, prompting");
                let password = self
                    .login_password(&format!("Enter password for {user}@{host}: "))
                    .await?;
                attempt.password_prompted = true;
                attempt.descriptor = attempt.descriptor.with_password(password);
            }
            FailureReason::PasswordRequired if attempt.password_prompted => {
                return Err(NegotiationError::RetriesExhausted {
                    reason: FailureReason::PasswordRequired,
                });
            }

            // Network failures, timeouts, protocol rejections, and anything
            // outside the escalation table terminate immediately.
            reason => return Err(NegotiationError::Transport(reason)),
        }

        attempt.attempt += 1;
        Ok(attempt)
    }
}
