// ABOUTME: SSH transport implementation using russh.
// ABOUTME: Handles host key policy, authentication, gateways, and sudo preflight.

use super::error::{FailureReason, Result};
use super::{ChannelEvent, CommandChannel, Session, Transport};
use crate::target::{ConnectionDescriptor, Gateway, HostKeyPolicy, Protocol};
use async_trait::async_trait;
use parking_lot::Mutex;
use russh::client::{self, Config, Handle};
use russh::keys::agent::client::AgentClient;
use russh::keys::known_hosts::{
    check_known_hosts, check_known_hosts_path, learn_known_hosts, learn_known_hosts_path,
};
use russh::keys::ssh_key::HashAlg;
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key, ssh_key};
use russh::{ChannelMsg, Disconnect};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;

/// Slot the handler writes a classified host key failure into, so the
/// connect path can surface it instead of the opaque protocol error.
type RejectionSlot = Arc<Mutex<Option<FailureReason>>>;

/// SSH implementation of the [`Transport`] capability.
pub struct SshTransport;

impl SshTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SshTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Box<dyn Session>> {
        if descriptor.protocol != Protocol::Ssh {
            return Err(FailureReason::Unsupported(format!(
                "SshTransport cannot open {} connections",
                descriptor.protocol
            )));
        }

        let timeout = descriptor.hints.connect_timeout;
        match tokio::time::timeout(timeout, connect_inner(descriptor)).await {
            Ok(result) => result.map(|s| Box::new(s) as Box<dyn Session>),
            Err(_) => Err(FailureReason::ConnectTimeout(timeout)),
        }
    }
}

/// Client handler enforcing the descriptor's host key policy.
struct HostKeyHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts_path: Option<PathBuf>,
    rejection: RejectionSlot,
}

impl client::Handler for HostKeyHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        if self.policy == HostKeyPolicy::Never {
            return Ok(true);
        }

        let check_result = match &self.known_hosts_path {
            Some(path) => check_known_hosts_path(&self.host, self.port, server_public_key, path),
            None => check_known_hosts(&self.host, self.port, server_public_key),
        };

        match check_result {
            Ok(true) => Ok(true),
            Ok(false) => match self.policy {
                HostKeyPolicy::AcceptNew => {
                    tracing::debug!("accepting new host key for {}:{}", self.host, self.port);
                    let learn_result = match &self.known_hosts_path {
                        Some(path) => {
                            learn_known_hosts_path(&self.host, self.port, server_public_key, path)
                        }
                        None => learn_known_hosts(&self.host, self.port, server_public_key),
                    };
                    if let Err(e) = learn_result {
                        tracing::warn!("failed to save host key to known_hosts: {}", e);
                    }
                    Ok(true)
                }
                _ => {
                    let fingerprint = server_public_key.fingerprint(HashAlg::Sha256);
                    *self.rejection.lock() = Some(FailureReason::UnknownHostKey {
                        host: self.host.clone(),
                        fingerprint: fingerprint.to_string(),
                    });
                    Ok(false)
                }
            },
            Err(russh::keys::Error::KeyChanged { .. }) => {
                *self.rejection.lock() = Some(FailureReason::HostKeyMismatch(self.host.clone()));
                Ok(false)
            }
            Err(_) => {
                // Unreadable known_hosts is treated like an unknown host.
                if self.policy == HostKeyPolicy::AcceptNew {
                    Ok(true)
                } else {
                    let fingerprint = server_public_key.fingerprint(HashAlg::Sha256);
                    *self.rejection.lock() = Some(FailureReason::UnknownHostKey {
                        host: self.host.clone(),
                        fingerprint: fingerprint.to_string(),
                    });
                    Ok(false)
                }
            }
        }
    }
}

/// Authentication methods tried in order against one target.
enum AuthMethod {
    KeyFile(Arc<ssh_key::PrivateKey>),
    Agent,
    Password(String),
}

async fn connect_inner(descriptor: &ConnectionDescriptor) -> Result<SshSession> {
    let hints = &descriptor.hints;
    let user = login_user(descriptor);
    let port = descriptor.effective_port();

    let config = Arc::new(Config {
        inactivity_timeout: Some(Duration::from_secs(30)),
        ..Default::default()
    });

    let rejection: RejectionSlot = Arc::new(Mutex::new(None));
    let handler = HostKeyHandler {
        host: descriptor.host.clone(),
        port,
        policy: hints.host_key_policy,
        known_hosts_path: hints.known_hosts_path.clone(),
        rejection: Arc::clone(&rejection),
    };

    let (mut handle, gateway) = match &hints.gateway {
        Some(gw) => {
            let gw_handle = connect_gateway(gw, descriptor, Arc::clone(&config)).await?;
            let channel = gw_handle
                .channel_open_direct_tcpip(descriptor.host.as_str(), u32::from(port), "127.0.0.1", 0)
                .await
                .map_err(|e| {
                    FailureReason::Network(format!(
                        "gateway channel to {}:{} failed: {}",
                        descriptor.host, port, e
                    ))
                })?;
            let stream = channel.into_stream();
            let handle = client::connect_stream(Arc::clone(&config), stream, handler)
                .await
                .map_err(|e| classify_connect_error(&rejection, &descriptor.host, e))?;
            (handle, Some(gw_handle))
        }
        None => {
            let handle = client::connect(
                Arc::clone(&config),
                (descriptor.host.as_str(), port),
                handler,
            )
            .await
            .map_err(|e| classify_connect_error(&rejection, &descriptor.host, e))?;
            (handle, None)
        }
    };

    authenticate(&mut handle, &user, hints).await?;

    let mut session = SshSession {
        handle,
        _gateway: gateway,
        host: descriptor.host.clone(),
        pty: hints.pty_required,
        forward_agent: hints.forward_agent,
        command_timeout: hints.command_timeout,
    };

    if hints.elevation.sudo {
        verify_elevation(&mut session, &descriptor.hints).await?;
    }

    Ok(session)
}

/// Connect and authenticate against the gateway (bastion) host.
///
/// Gateway auth rejection surfaces as `KeyAuthFailed` so the negotiator's
/// password escalation covers the gateway hop as well.
async fn connect_gateway(
    gateway: &Gateway,
    descriptor: &ConnectionDescriptor,
    config: Arc<Config>,
) -> Result<Handle<HostKeyHandler>> {
    let rejection: RejectionSlot = Arc::new(Mutex::new(None));
    let handler = HostKeyHandler {
        host: gateway.host.clone(),
        port: gateway.port,
        policy: descriptor.hints.host_key_policy,
        known_hosts_path: descriptor.hints.known_hosts_path.clone(),
        rejection: Arc::clone(&rejection),
    };

    let mut handle = client::connect(config, (gateway.host.as_str(), gateway.port), handler)
        .await
        .map_err(|e| classify_connect_error(&rejection, &gateway.host, e))?;

    let user = gateway
        .user
        .clone()
        .unwrap_or_else(|| login_user(descriptor));

    let mut methods = Vec::new();
    if let Some(path) = &gateway.identity_file {
        methods.push(AuthMethod::KeyFile(Arc::new(load_key(path)?)));
    } else {
        methods.push(AuthMethod::Agent);
    }
    if let Some(password) = &descriptor.hints.password {
        methods.push(AuthMethod::Password(password.clone()));
    }

    try_methods(&mut handle, &user, methods).await?;
    Ok(handle)
}

fn login_user(descriptor: &ConnectionDescriptor) -> String {
    descriptor
        .user
        .clone()
        .unwrap_or_else(|| std::env::var("USER").unwrap_or_else(|_| "root".to_string()))
}

fn classify_connect_error(
    rejection: &RejectionSlot,
    host: &str,
    error: russh::Error,
) -> FailureReason {
    if let Some(reason) = rejection.lock().take() {
        return reason;
    }
    match &error {
        russh::Error::IO(e) => FailureReason::Network(format!("{host}: {e}")),
        _ => {
            let text = error.to_string();
            if text.contains("refused") || text.contains("unreachable") {
                FailureReason::Network(format!("{host}: {text}"))
            } else {
                FailureReason::Protocol(text)
            }
        }
    }
}

fn load_key(path: &PathBuf) -> Result<ssh_key::PrivateKey> {
    load_secret_key(path, None).map_err(|e| FailureReason::KeyLoadFailed {
        path: path.clone(),
        reason: e.to_string(),
    })
}

/// Resolve the ordered list of authentication methods for a descriptor.
fn resolve_auth_methods(hints: &crate::target::AuthHints) -> Result<Vec<AuthMethod>> {
    let mut methods = Vec::new();

    if hints.password_only {
        if let Some(password) = &hints.password {
            methods.push(AuthMethod::Password(password.clone()));
        }
        return Ok(methods);
    }

    for path in &hints.identity_files {
        methods.push(AuthMethod::KeyFile(Arc::new(load_key(path)?)));
    }

    if !hints.key_only {
        if hints.identity_files.is_empty() {
            methods.push(AuthMethod::Agent);
            for path in default_key_paths() {
                if let Ok(key) = load_secret_key(&path, None) {
                    methods.push(AuthMethod::KeyFile(Arc::new(key)));
                }
            }
        }
        if let Some(password) = &hints.password {
            methods.push(AuthMethod::Password(password.clone()));
        }
    }

    Ok(methods)
}

fn default_key_paths() -> Vec<PathBuf> {
    let Ok(home) = std::env::var("HOME") else {
        return Vec::new();
    };
    ["id_ed25519", "id_rsa", "id_ecdsa"]
        .iter()
        .map(|name| PathBuf::from(format!("{home}/.ssh/{name}")))
        .collect()
}

async fn authenticate(
    handle: &mut Handle<HostKeyHandler>,
    user: &str,
    hints: &crate::target::AuthHints,
) -> Result<()> {
    let methods = resolve_auth_methods(hints)?;
    try_methods(handle, user, methods).await
}

/// Try each method in order; the first success wins.
///
/// A rejection of every public-key method maps to `KeyAuthFailed` so the
/// negotiator can escalate to password auth; a rejected password is terminal.
async fn try_methods(
    handle: &mut Handle<HostKeyHandler>,
    user: &str,
    methods: Vec<AuthMethod>,
) -> Result<()> {
    let mut tried_password = false;

    for method in methods {
        match method {
            AuthMethod::KeyFile(key) => {
                let hash_alg = handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(|e| FailureReason::Protocol(e.to_string()))?
                    .flatten();
                let result = handle
                    .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key, hash_alg))
                    .await
                    .map_err(|e| FailureReason::Protocol(e.to_string()))?;
                if result.success() {
                    return Ok(());
                }
            }
            AuthMethod::Agent => {
                let Ok(mut agent) = AgentClient::<UnixStream>::connect_env().await else {
                    continue;
                };
                let Ok(keys) = agent.request_identities().await else {
                    continue;
                };
                for key in keys {
                    match handle
                        .authenticate_publickey_with(user, key, None, &mut agent)
                        .await
                    {
                        Ok(result) if result.success() => return Ok(()),
                        _ => continue,
                    }
                }
            }
            AuthMethod::Password(password) => {
                tried_password = true;
                let result = handle
                    .authenticate_password(user, &password)
                    .await
                    .map_err(|e| FailureReason::Protocol(e.to_string()))?;
                if result.success() {
                    return Ok(());
                }
            }
        }
    }

    if tried_password {
        Err(FailureReason::AuthFailed)
    } else {
        Err(FailureReason::KeyAuthFailed)
    }
}

/// Verify that sudo works before handing the session out, classifying the
/// failure the way the negotiator expects.
async fn verify_elevation(
    session: &mut SshSession,
    hints: &crate::target::AuthHints,
) -> Result<()> {
    let password = hints.elevation.sudo_password.clone();
    let probe = if password.is_some() {
        "sudo -S -p '' true 2>&1"
    } else {
        "sudo -n true 2>&1"
    };

    let mut channel = session.open_command(probe).await?;
    if let Some(password) = &password {
        channel
            .send_input(format!("{password}\n").as_bytes())
            .await?;
    }

    let mut output = Vec::new();
    let mut exit_status = None;
    while let Some(event) = channel.next_event().await? {
        match event {
            ChannelEvent::Stdout(bytes) | ChannelEvent::Stderr(bytes) => {
                output.extend_from_slice(&bytes);
            }
            ChannelEvent::Exit(status) => exit_status = Some(status),
        }
    }

    match exit_status {
        Some(0) => Ok(()),
        Some(_) => {
            let text = String::from_utf8_lossy(&output).to_lowercase();
            if !session.pty && (text.contains("a terminal is required") || text.contains("no tty")) {
                Err(FailureReason::SudoTtyRequired)
            } else if text.contains("incorrect password") || text.contains("try again") {
                Err(FailureReason::BadSudoPassword)
            } else if password.is_some() {
                Err(FailureReason::BadSudoPassword)
            } else {
                Err(FailureReason::SudoPasswordRequired)
            }
        }
        None => Err(FailureReason::ChannelClosed),
    }
}

/// An established SSH session.
pub struct SshSession {
    handle: Handle<HostKeyHandler>,
    /// Keeps the bastion connection alive while this session is tunneled.
    _gateway: Option<Handle<HostKeyHandler>>,
    host: String,
    pty: bool,
    forward_agent: bool,
    command_timeout: Duration,
}

#[async_trait]
impl Session for SshSession {
    async fn open_command(&mut self, command: &str) -> Result<Box<dyn CommandChannel>> {
        let open = async {
            let channel = self
                .handle
                .channel_open_session()
                .await
                .map_err(|e| FailureReason::Protocol(format!("failed to open channel: {e}")))?;

            if self.forward_agent {
                channel
                    .agent_forward(false)
                    .await
                    .map_err(|e| {
                        FailureReason::Protocol(format!("agent forwarding request failed: {e}"))
                    })?;
            }

            if self.pty {
                channel
                    .request_pty(false, "xterm", 80, 24, 0, 0, &[])
                    .await
                    .map_err(|e| FailureReason::Protocol(format!("pty request failed: {e}")))?;
            }

            channel
                .exec(true, command)
                .await
                .map_err(|e| FailureReason::Protocol(format!("exec failed: {e}")))?;

            Ok(Box::new(SshCommandChannel { channel }) as Box<dyn CommandChannel>)
        };

        match tokio::time::timeout(self.command_timeout, open).await {
            Ok(result) => result,
            Err(_) => Err(FailureReason::OperationTimeout(self.command_timeout)),
        }
    }

    async fn close(&mut self) -> Result<()> {
        tracing::debug!("disconnecting from {}", self.host);
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| FailureReason::Protocol(e.to_string()))?;
        Ok(())
    }
}

struct SshCommandChannel {
    channel: russh::Channel<client::Msg>,
}

#[async_trait]
impl CommandChannel for SshCommandChannel {
    async fn next_event(&mut self) -> Result<Option<ChannelEvent>> {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    return Ok(Some(ChannelEvent::Stdout(data.to_vec())));
                }
                Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                    return Ok(Some(ChannelEvent::Stderr(data.to_vec())));
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    return Ok(Some(ChannelEvent::Exit(exit_status)));
                }
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }

    async fn send_input(&mut self, data: &[u8]) -> Result<()> {
        self.channel
            .data(data)
            .await
            .map_err(|e| FailureReason::Protocol(format!("failed to write to channel: {e}")))
    }
}
