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
    name = "rift",
    about = "Mirrors Discord channels into each other through webhooks",
    version
)]
pub(crate) struct Cli {
    #[arg(
        long,
        env = "RIFT_CONFIG",
        default_value = "rift.toml",
        help = "TOML file with routes, retention window and file paths"
    )]
    pub config: PathBuf,

    #[arg(
        long = "discord-token",
        env = "RIFT_DISCORD_TOKEN",
        hide_env_values = true,
        help = "Bot token used for the gateway connection and REST calls"
    )]
    pub discord_token: Option<String>,

    #[arg(
        long = "retention-seconds",
        env = "RIFT_RETENTION_SECONDS",
        value_parser = parse_positive_u64,
        help = "Override how long originals and mirrors live before deletion"
    )]
    pub retention_seconds: Option<u64>,

    #[arg(
        long = "snapshot-path",
        env = "RIFT_SNAPSHOT_PATH",
        help = "Override where the registry snapshot is written on shutdown"
    )]
    pub snapshot_path: Option<PathBuf>,

    #[arg(
        long = "audit-log-path",
        env = "RIFT_AUDIT_LOG_PATH",
        help = "Override the append-only audit log of relayed messages"
    )]
    pub audit_log_path: Option<PathBuf>,

    #[arg(
        long = "validate-only",
        default_value_t = false,
        action = ArgAction::SetTrue,
        help = "Load config and snapshot, print a summary and exit"
    )]
    pub validate_only: bool,
}
