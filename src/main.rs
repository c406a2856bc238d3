// ABOUTME: Entry point for the fanout CLI application.
// ABOUTME: Parses arguments, builds descriptors, and dispatches to exec or the shell.

mod cli;

use clap::Parser;
use cli::{Cli, Commands, ConnectionArgs};
use fanout::config::FileConfig;
use fanout::error::{Error, Result};
use fanout::multiplex::{DuplicatePolicy, MultiplexerOptions, SessionMultiplexer, worst_exit_code};
use fanout::negotiate::{AuthNegotiator, Prompter};
use fanout::output::{Output, OutputMode, spawn_printer};
use fanout::prompt::{NonInteractivePrompter, TerminalPrompter};
use fanout::shell::InteractiveShell;
use fanout::target::{AuthHints, ConnectionDescriptor, Gateway, HostKeyPolicy, Protocol};
use fanout::transport::SshTransport;
use std::env;
use std::io::IsTerminal;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing subscriber based on verbose flag
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let mode = if cli.json {
        OutputMode::Json
    } else if cli.quiet {
        OutputMode::Quiet
    } else {
        OutputMode::Normal
    };

    match run(cli, mode).await {
        Ok(status) => std::process::exit(status),
        Err(e) => {
            Output::new(mode).error(&e.to_string());
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli, mode: OutputMode) -> Result<i32> {
    let cwd = env::current_dir()?;
    let file_config = FileConfig::discover(&cwd)?;
    let prompter: Arc<dyn Prompter> = if std::io::stdin().is_terminal() {
        Arc::new(TerminalPrompter::new())
    } else {
        Arc::new(NonInteractivePrompter)
    };

    match cli.command {
        Commands::Exec {
            targets,
            command,
            connection,
        } => {
            let mut multiplexer =
                connect_all(&targets, &connection, &file_config, &prompter, mode).await?;

            let (tx, rx) = mpsc::channel(64);
            let printer = spawn_printer(rx, mode, multiplexer.longest_host());
            let report = multiplexer.run(&command, tx).await;
            let _ = printer.await;
            multiplexer.close().await;

            if let Some(abort) = &report.aborted {
                Output::new(mode).error(&format!("aborted: {} failed: {}", abort.host, abort.reason));
            }
            let mut status = worst_exit_code(&report.results);
            if multiplexer.diagnostics().has_warnings() {
                status = status.max(1);
            }
            Ok(status)
        }
        Commands::Interactive {
            targets,
            connection,
        } => {
            let multiplexer =
                connect_all(&targets, &connection, &file_config, &prompter, mode).await?;
            let shell = InteractiveShell::new(multiplexer, mode);
            Ok(shell.run().await?)
        }
    }
}

/// Build descriptors from target specs and connect to all of them.
async fn connect_all(
    targets: &[String],
    connection: &ConnectionArgs,
    file_config: &FileConfig,
    prompter: &Arc<dyn Prompter>,
    mode: OutputMode,
) -> Result<SessionMultiplexer> {
    let hints = build_hints(connection, file_config, prompter).await?;
    let default_user = connection.user.clone().or_else(|| file_config.user.clone());

    let mut descriptors = Vec::with_capacity(targets.len());
    for spec in targets {
        let mut descriptor = ConnectionDescriptor::parse(spec)?.with_hints(hints.clone());
        if descriptor.protocol == Protocol::Winrm {
            return Err(Error::UnsupportedProtocol(format!(
                "winrm targets are not supported yet: {spec}"
            )));
        }
        if descriptor.user.is_none() {
            if let Some(user) = &default_user {
                descriptor = descriptor.with_user(user.clone());
            }
        }
        if descriptor.port.is_none() {
            descriptor.port = file_config.port;
        }
        descriptors.push(descriptor);
    }

    let options = MultiplexerOptions {
        concurrency: connection
            .concurrency
            .or(file_config.concurrency)
            .unwrap_or(fanout::multiplex::DEFAULT_CONCURRENCY),
        on_duplicate: duplicate_policy(
            connection.duplicated_hosts.as_deref(),
            file_config.on_duplicate,
        )?,
        exit_on_error: connection.exit_on_error,
        sudo_password: hints.elevation.sudo_password.clone(),
    };

    let negotiator = AuthNegotiator::new(Arc::new(SshTransport::new()), Arc::clone(prompter));
    let mut multiplexer = SessionMultiplexer::new(negotiator, options);

    let output = Output::new(mode);
    output.progress(&format!("Connecting to {} target(s)...", descriptors.len()));
    let failures = multiplexer.add_all(descriptors).await?;
    for failure in &failures {
        output.error(&format!("{}: {}", failure.host, failure.error));
    }
    Ok(multiplexer)
}

/// The `--duplicated-hosts` flag wins over the config file key.
fn duplicate_policy(
    flag: Option<&str>,
    file: Option<DuplicatePolicy>,
) -> Result<DuplicatePolicy> {
    match flag {
        Some(value) => value.parse().map_err(Error::InvalidConfig),
        None => Ok(file.unwrap_or_default()),
    }
}

/// Merge command-line flags over file defaults into one hint set.
async fn build_hints(
    connection: &ConnectionArgs,
    file_config: &FileConfig,
    prompter: &Arc<dyn Prompter>,
) -> Result<AuthHints> {
    let mut hints = AuthHints::default();

    hints.identity_files = if connection.identity_files.is_empty() {
        file_config.identity_files.clone()
    } else {
        connection.identity_files.clone()
    };
    hints.known_hosts_path = connection
        .known_hosts
        .clone()
        .or_else(|| file_config.known_hosts.clone());
    hints.forward_agent = connection.forward_agent || file_config.forward_agent;
    hints.pty_required = connection.pty;
    hints.key_only = connection.key_only;

    hints.host_key_policy = match connection.host_key.as_deref() {
        Some("always") => HostKeyPolicy::Always,
        Some("accept-new") => HostKeyPolicy::AcceptNew,
        Some("never") => HostKeyPolicy::Never,
        Some(other) => {
            return Err(Error::InvalidConfig(format!(
                "unknown host key policy: {other}"
            )));
        }
        None => file_config.host_key.unwrap_or(HostKeyPolicy::Always),
    };

    if let Some(timeout) = connection.connect_timeout {
        hints.connect_timeout = timeout.into();
    } else if let Some(timeout) = file_config.connect_timeout {
        hints.connect_timeout = timeout;
    }
    if let Some(timeout) = connection.command_timeout {
        hints.command_timeout = timeout.into();
    } else if let Some(timeout) = file_config.command_timeout {
        hints.command_timeout = timeout;
    }

    let gateway_spec = connection
        .gateway
        .clone()
        .or_else(|| file_config.gateway.clone());
    if let Some(spec) = gateway_spec {
        hints.gateway = Some(Gateway::parse(&spec)?);
    }

    // An empty flag value means "ask now" rather than "empty password".
    if let Some(password) = &connection.password {
        let password = if password.is_empty() {
            prompter
                .secret("Enter login password: ")
                .await
                .map_err(|e| Error::InvalidConfig(e.to_string()))?
        } else {
            password.clone()
        };
        hints.password = Some(password);
        hints.password_only = connection.password_only;
    }

    hints.elevation.sudo = connection.sudo;
    if connection.sudo {
        hints.elevation.use_sudo_password = connection.sudo_password.is_some();
        if let Some(password) = &connection.sudo_password {
            if !password.is_empty() {
                hints.elevation.sudo_password = Some(password.clone());
            }
        }
    }

    Ok(hints)
}
