// ABOUTME: Command-line interface definition using clap derive macros.
// ABOUTME: Defines all subcommands and their arguments.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fanout")]
#[command(about = "Run commands across many hosts over SSH")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Minimal output for CI
    #[arg(short, long, global = true, conflicts_with = "json")]
    pub quiet: bool,

    /// Emit JSON lines instead of human output
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one command on every target and exit
    Exec {
        /// Targets as [protocol://][user@]host[:port]
        #[arg(required = true)]
        targets: Vec<String>,

        /// Command to run remotely
        #[arg(short, long)]
        command: String,

        #[command(flatten)]
        connection: ConnectionArgs,
    },

    /// Open sessions to every target and run commands interactively
    Interactive {
        /// Targets as [protocol://][user@]host[:port]
        #[arg(required = true)]
        targets: Vec<String>,

        #[command(flatten)]
        connection: ConnectionArgs,
    },
}

#[derive(Args, Debug)]
pub struct ConnectionArgs {
    /// Remote user when the target does not name one
    #[arg(short, long)]
    pub user: Option<String>,

    /// Private key file (repeatable)
    #[arg(short = 'i', long = "identity-file")]
    pub identity_files: Vec<PathBuf>,

    /// Password auth; prompts when given without a value
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    pub password: Option<String>,

    /// Skip key auth entirely and use the password only
    #[arg(long, requires = "password")]
    pub password_only: bool,

    /// Never fall back from key auth to a password prompt
    #[arg(long, conflicts_with = "password_only")]
    pub key_only: bool,

    /// Host key policy: always, accept-new, or never
    #[arg(long)]
    pub host_key: Option<String>,

    /// Alternate known_hosts file
    #[arg(long)]
    pub known_hosts: Option<PathBuf>,

    /// Run the command under sudo
    #[arg(long)]
    pub sudo: bool,

    /// Sudo password; prompts when given without a value
    #[arg(long, num_args = 0..=1, default_missing_value = "", requires = "sudo")]
    pub sudo_password: Option<String>,

    /// Request a pty for the remote command
    #[arg(long)]
    pub pty: bool,

    /// Forward the local SSH agent
    #[arg(long)]
    pub forward_agent: bool,

    /// Bastion as [user@]host[:port]
    #[arg(short = 'G', long)]
    pub gateway: Option<String>,

    /// Maximum concurrent connections
    #[arg(short = 'C', long)]
    pub concurrency: Option<usize>,

    /// Duplicate host policy: ignore, warn, or fatal
    #[arg(long)]
    pub duplicated_hosts: Option<String>,

    /// Abort the whole batch on the first failure
    #[arg(long)]
    pub exit_on_error: bool,

    /// Connection timeout, e.g. 30s
    #[arg(long)]
    pub connect_timeout: Option<humantime::Duration>,

    /// Per-command timeout, e.g. 5m
    #[arg(long)]
    pub command_timeout: Option<humantime::Duration>,
}
