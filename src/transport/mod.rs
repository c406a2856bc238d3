// ABOUTME: Transport capability traits for opening authenticated sessions.
// ABOUTME: The SSH implementation lives in ssh.rs; WinRM is an external implementor.

mod error;
mod ssh;

pub use error::{FailureReason, Result};
pub use ssh::SshTransport;

use crate::target::ConnectionDescriptor;
use async_trait::async_trait;

/// One unit of data or status reported by a running command.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exit(u32),
}

/// A command in flight on one session.
///
/// Events arrive in the order the underlying channel delivers them; after the
/// remote side closes the channel, `next_event` returns `Ok(None)`.
#[async_trait]
pub trait CommandChannel: Send {
    async fn next_event(&mut self) -> Result<Option<ChannelEvent>>;

    /// Write raw bytes to the remote command's input.
    async fn send_input(&mut self, data: &[u8]) -> Result<()>;
}

/// One live authenticated channel to a single target.
///
/// A session has exactly one owner at a time: the negotiator that created it,
/// then the multiplexer task it is handed to.
#[async_trait]
pub trait Session: Send {
    async fn open_command(&mut self, command: &str) -> Result<Box<dyn CommandChannel>>;

    async fn close(&mut self) -> Result<()>;
}

/// Capability that turns a descriptor into an authenticated session.
///
/// Implementations map their protocol's errors onto [`FailureReason`] so the
/// negotiator can apply its escalation table without knowing the protocol.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Box<dyn Session>>;
}
