//! CLI argument parsing with subcommand architecture.

use clap::{Args, Parser, Subcommand};
use warden_core::auth::Role;
use warden_core::lifecycle::logging::LogFormat;

#[derive(Parser)]
#[command(name = "warden", version, about = "Secure API gateway and job runner")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the server (default when no subcommand is given)
    Run(RunArgs),
    /// Load and validate a config file, then exit
    CheckConfig(ConfigArgs),
    /// Mint a signed bearer token for local testing
    IssueToken(IssueTokenArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Path to config file
    #[arg(short, long, default_value = "config.yaml", env = "WARDEN_CONFIG")]
    pub config: String,
}

impl Default for ConfigArgs {
    fn default() -> Self {
        Self {
            config: "config.yaml".to_string(),
        }
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Listen host
    #[arg(long, env = "WARDEN_HOST")]
    pub host: Option<String>,

    /// Listen port
    #[arg(long, env = "WARDEN_PORT")]
    pub port: Option<u16>,

    /// Log level
    #[arg(long, default_value = "info", env = "WARDEN_LOG_LEVEL")]
    pub log_level: String,

    /// Log format: text or json
    #[arg(long, default_value = "text", env = "WARDEN_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Seconds to let in-flight requests drain after a stop signal
    #[arg(long, default_value = "5")]
    pub shutdown_timeout: u64,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            config: ConfigArgs::default(),
            host: None,
            port: None,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            shutdown_timeout: 5,
        }
    }
}

#[derive(Args, Debug)]
pub struct IssueTokenArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Subject of the token
    #[arg(long)]
    pub user_id: String,

    #[arg(long)]
    pub email: Option<String>,

    /// user, moderator, admin or super_admin
    #[arg(long, default_value = "user")]
    pub role: Role,

    /// Extra permission on top of the role's defaults (repeatable)
    #[arg(long = "permission")]
    pub permissions: Vec<String>,

    /// Lifetime in seconds (defaults to auth.token-ttl-secs)
    #[arg(long)]
    pub ttl: Option<u64>,
}
