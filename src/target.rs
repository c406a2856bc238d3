// ABOUTME: Target descriptors for remote hosts.
// ABOUTME: Parses "[protocol://][user@]host[:port]" and carries auth hints.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_WINRM_PORT: u16 = 5985;

/// Default maximum wait for initial reachability.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(120);
/// Default per-operation acknowledgement timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Wire protocol used to reach a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ssh,
    Winrm,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Ssh => DEFAULT_SSH_PORT,
            Protocol::Winrm => DEFAULT_WINRM_PORT,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Ssh => write!(f, "ssh"),
            Protocol::Winrm => write!(f, "winrm"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ssh" => Ok(Protocol::Ssh),
            "winrm" => Ok(Protocol::Winrm),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

/// Host key verification policy for SSH targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Only hosts already present in known_hosts are accepted.
    Always,
    /// Unknown hosts are accepted and recorded in known_hosts.
    AcceptNew,
    /// No verification at all.
    Never,
}

/// Privilege-escalation settings for command execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Elevation {
    /// Run the remote command under sudo.
    pub sudo: bool,
    /// Prompt for and supply a sudo password when the remote side asks.
    pub use_sudo_password: bool,
    pub sudo_password: Option<String>,
}

/// Bastion host the SSH transport tunnels through.
#[derive(Debug, Clone, PartialEq)]
pub struct Gateway {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
}

impl Gateway {
    /// Parse "[user@]host[:port]".
    pub fn parse(s: &str) -> Result<Self> {
        let (user, host, port) = split_user_host_port(s)?;
        Ok(Gateway {
            host,
            port: port.unwrap_or(DEFAULT_SSH_PORT),
            user,
            identity_file: None,
        })
    }
}

/// Protocol-agnostic bag of credentials and policy flags.
///
/// Hints are never mutated in place once a connection attempt starts; the
/// negotiator derives adjusted copies through the `with_*` builders on
/// [`ConnectionDescriptor`].
#[derive(Debug, Clone, PartialEq)]
pub struct AuthHints {
    pub identity_files: Vec<PathBuf>,
    pub password: Option<String>,
    /// When set, key files and the agent are skipped entirely.
    pub password_only: bool,
    /// When set, password fallback is never attempted.
    pub key_only: bool,
    pub host_key_policy: HostKeyPolicy,
    pub known_hosts_path: Option<PathBuf>,
    pub elevation: Elevation,
    pub gateway: Option<Gateway>,
    pub pty_required: bool,
    pub forward_agent: bool,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for AuthHints {
    fn default() -> Self {
        Self {
            identity_files: Vec::new(),
            password: None,
            password_only: false,
            key_only: false,
            host_key_policy: HostKeyPolicy::Always,
            known_hosts_path: None,
            elevation: Elevation::default(),
            gateway: None,
            pty_required: false,
            forward_agent: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

/// Immutable value naming one remote target and its connection parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionDescriptor {
    pub host: String,
    pub protocol: Protocol,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub hints: AuthHints,
}

impl ConnectionDescriptor {
    pub fn new(host: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            host: host.into(),
            protocol,
            port: None,
            user: None,
            hints: AuthHints::default(),
        }
    }

    /// Parse a target specification of the form
    /// `[protocol://][user@]host[:port]`.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(Error::InvalidTarget("target cannot be empty".into()));
        }

        let (protocol, rest) = match spec.split_once("://") {
            Some((scheme, rest)) => {
                let protocol = scheme
                    .parse::<Protocol>()
                    .map_err(|e| Error::InvalidTarget(format!("{e} in {spec:?}")))?;
                (protocol, rest)
            }
            None => (Protocol::Ssh, spec),
        };

        let (user, host, port) = split_user_host_port(rest)?;

        Ok(Self {
            host,
            protocol,
            port,
            user,
            hints: AuthHints::default(),
        })
    }

    /// Port to connect to, falling back to the protocol default.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }

    pub fn with_hints(mut self, hints: AuthHints) -> Self {
        self.hints = hints;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.hints.host_key_policy = policy;
        self
    }

    pub fn with_pty(mut self) -> Self {
        self.hints.pty_required = true;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.hints.password = Some(password.into());
        self
    }

    /// Switch to password-only authentication: key files and the agent are
    /// disabled for every subsequent attempt.
    pub fn with_password_only(mut self, password: impl Into<String>) -> Self {
        self.hints.password = Some(password.into());
        self.hints.password_only = true;
        self.hints.key_only = false;
        self.hints.identity_files.clear();
        self
    }

    pub fn with_sudo_password(mut self, password: impl Into<String>) -> Self {
        self.hints.elevation.sudo_password = Some(password.into());
        self
    }
}

impl std::fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://", self.protocol)?;
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        write!(f, "{}:{}", self.host, self.effective_port())
    }
}

/// Split "[user@]host[:port]" into its parts.
fn split_user_host_port(s: &str) -> Result<(Option<String>, String, Option<u16>)> {
    let (user, rest) = match s.find('@') {
        Some(at) => (Some(s[..at].to_string()), &s[at + 1..]),
        None => (None, s),
    };

    if let Some(user) = &user {
        if user.is_empty() {
            return Err(Error::InvalidTarget(format!("empty user in {s:?}")));
        }
    }

    let (host, port) = match rest.rfind(':') {
        Some(colon) => {
            let port_str = &rest[colon + 1..];
            let port = port_str
                .parse::<u16>()
                .map_err(|_| Error::InvalidTarget(format!("invalid port: {port_str}")))?;
            (&rest[..colon], Some(port))
        }
        None => (rest, None),
    };

    if host.is_empty() {
        return Err(Error::InvalidTarget(format!("empty host in {s:?}")));
    }

    Ok((user, host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_host() {
        let d = ConnectionDescriptor::parse("web1.example.com").unwrap();
        assert_eq!(d.host, "web1.example.com");
        assert_eq!(d.protocol, Protocol::Ssh);
        assert_eq!(d.user, None);
        assert_eq!(d.effective_port(), 22);
    }

    #[test]
    fn parse_full_spec() {
        let d = ConnectionDescriptor::parse("ssh://deploy@10.0.0.5:2222").unwrap();
        assert_eq!(d.host, "10.0.0.5");
        assert_eq!(d.user.as_deref(), Some("deploy"));
        assert_eq!(d.port, Some(2222));
    }

    #[test]
    fn parse_winrm_default_port() {
        let d = ConnectionDescriptor::parse("winrm://10.0.0.9").unwrap();
        assert_eq!(d.protocol, Protocol::Winrm);
        assert_eq!(d.effective_port(), 5985);
    }

    #[test]
    fn parse_rejects_unknown_protocol() {
        assert!(ConnectionDescriptor::parse("telnet://host").is_err());
    }

    #[test]
    fn parse_rejects_empty_host_and_bad_port() {
        assert!(ConnectionDescriptor::parse("user@").is_err());
        assert!(ConnectionDescriptor::parse("host:notaport").is_err());
        assert!(ConnectionDescriptor::parse("  ").is_err());
    }

    #[test]
    fn builders_leave_the_original_untouched() {
        let original = ConnectionDescriptor::parse("deploy@web1").unwrap();
        let escalated = original
            .clone()
            .with_host_key_policy(HostKeyPolicy::AcceptNew)
            .with_pty();
        assert_eq!(original.hints.host_key_policy, HostKeyPolicy::Always);
        assert!(!original.hints.pty_required);
        assert_eq!(escalated.hints.host_key_policy, HostKeyPolicy::AcceptNew);
        assert!(escalated.hints.pty_required);
    }

    #[test]
    fn password_only_disables_keys() {
        let d = ConnectionDescriptor::parse("web1")
            .unwrap()
            .with_hints(AuthHints {
                identity_files: vec![PathBuf::from("/home/me/.ssh/id_ed25519")],
                key_only: true,
                ..AuthHints::default()
            })
            .with_password_only("hunter2");
        assert!(d.hints.identity_files.is_empty());
        assert!(d.hints.password_only);
        assert!(!d.hints.key_only);
        assert_eq!(d.hints.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn gateway_parse() {
        let gw = Gateway::parse("jump@bastion.example.com:2022").unwrap();
        assert_eq!(gw.host, "bastion.example.com");
        assert_eq!(gw.port, 2022);
        assert_eq!(gw.user.as_deref(), Some("jump"));
    }

    #[test]
    fn display_round_trips_the_spec() {
        let d = ConnectionDescriptor::parse("ssh://deploy@10.0.0.5").unwrap();
        assert_eq!(d.to_string(), "ssh://deploy@10.0.0.5:22");
    }
}
