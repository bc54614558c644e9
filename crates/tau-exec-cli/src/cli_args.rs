use std::path::PathBuf;

use clap::{ArgAction, Parser};

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "tau-exec",
    about = "HTTP gateway that runs configured commands per request",
    version
)]
/// Public struct `Cli` used across Tau exec components.
pub struct Cli {
    #[arg(
        long,
        env = "TAU_EXEC_CONFIG",
        help = "Path to the exec gateway JSON config (schema_version 1)"
    )]
    pub config: PathBuf,

    #[arg(
        long,
        env = "TAU_EXEC_BIND",
        help = "Socket address to listen on; overrides the config file bind"
    )]
    pub bind: Option<String>,

    #[arg(
        long = "shutdown-grace-ms",
        env = "TAU_EXEC_SHUTDOWN_GRACE_MS",
        value_parser = parse_positive_u64,
        help = "Milliseconds to wait for cancelled runs to exit on shutdown; overrides the config file"
    )]
    pub shutdown_grace_ms: Option<u64>,

    #[arg(
        long = "log-level",
        env = "TAU_EXEC_LOG_LEVEL",
        default_value = "info",
        help = "Default tracing level when RUST_LOG is unset (error, warn, info, debug, trace)"
    )]
    pub log_level: String,

    #[arg(
        long = "validate-only",
        default_value_t = false,
        action = ArgAction::SetTrue,
        help = "Validate the config, print the provisioned routes, and exit"
    )]
    pub validate_only: bool,
}
