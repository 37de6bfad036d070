//! TOML relay configuration: routes, retention window and file paths.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rift_discord_runtime::DEFAULT_WEBHOOK_NAME;
use rift_mirror::{ChannelId, ChannelRoutes};
use serde::Deserialize;

use crate::cli_args::Cli;

pub(crate) const DEFAULT_RETENTION_SECONDS: u64 = 3600;
pub(crate) const DEFAULT_SNAPSHOT_PATH: &str = "rift-snapshot.json";
pub(crate) const DEFAULT_AUDIT_LOG_PATH: &str = "backup.txt";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RouteConfig {
    pub source: u64,
    #[serde(default)]
    pub destinations: Vec<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct RelayConfigFile {
    pub retention_seconds: u64,
    pub snapshot_path: PathBuf,
    pub audit_log_path: PathBuf,
    pub webhook_name: String,
    pub routes: Vec<RouteConfig>,
}

impl Default for RelayConfigFile {
    fn default() -> Self {
        Self {
            retention_seconds: DEFAULT_RETENTION_SECONDS,
            snapshot_path: PathBuf::from(DEFAULT_SNAPSHOT_PATH),
            audit_log_path: PathBuf::from(DEFAULT_AUDIT_LOG_PATH),
            webhook_name: DEFAULT_WEBHOOK_NAME.to_string(),
            routes: Vec::new(),
        }
    }
}

/// Validated configuration with CLI overrides applied.
#[derive(Debug, Clone)]
pub(crate) struct RelayConfig {
    pub retention: Duration,
    pub snapshot_path: PathBuf,
    pub audit_log_path: PathBuf,
    pub webhook_name: String,
    pub routes: ChannelRoutes,
}

pub(crate) fn parse_relay_config(raw: &str) -> Result<RelayConfigFile> {
    toml::from_str(raw).context("invalid relay config")
}

pub(crate) fn load_relay_config(path: &Path) -> Result<RelayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read relay config {}", path.display()))?;
    parse_relay_config(&raw).with_context(|| format!("in {}", path.display()))
}

pub(crate) fn apply_cli_overrides(mut file: RelayConfigFile, cli: &Cli) -> RelayConfigFile {
    if let Some(retention_seconds) = cli.retention_seconds {
        file.retention_seconds = retention_seconds;
    }
    if let Some(snapshot_path) = &cli.snapshot_path {
        file.snapshot_path = snapshot_path.clone();
    }
    if let Some(audit_log_path) = &cli.audit_log_path {
        file.audit_log_path = audit_log_path.clone();
    }
    file
}

pub(crate) fn validate_relay_config(file: RelayConfigFile) -> Result<RelayConfig> {
    if file.retention_seconds == 0 {
        bail!("retention_seconds must be greater than 0");
    }
    if file.webhook_name.trim().is_empty() {
        bail!("webhook_name must not be empty");
    }
    if file.routes.is_empty() {
        bail!("at least one [[routes]] entry is required");
    }

    let mut routes = Vec::with_capacity(file.routes.len());
    for route in &file.routes {
        if route.source == 0 {
            bail!("route source must be a non-zero channel id");
        }
        if route.destinations.is_empty() {
            bail!("route {} has no destinations", route.source);
        }
        let mut seen = BTreeSet::new();
        let mut destinations = Vec::with_capacity(route.destinations.len());
        for &destination in &route.destinations {
            if destination == 0 {
                bail!("route {} lists channel id 0 as a destination", route.source);
            }
            if destination == route.source {
                bail!("route {} lists its own source as a destination", route.source);
            }
            if seen.insert(destination) {
                destinations.push(ChannelId::new(destination));
            } else {
                tracing::warn!(
                    source = route.source,
                    destination,
                    "ignoring duplicate route destination"
                );
            }
        }
        routes.push((ChannelId::new(route.source), destinations));
    }

    Ok(RelayConfig {
        retention: Duration::from_secs(file.retention_seconds),
        snapshot_path: file.snapshot_path,
        audit_log_path: file.audit_log_path,
        webhook_name: file.webhook_name,
        routes: ChannelRoutes::new(routes),
    })
}

pub(crate) fn resolve_relay_config(cli: &Cli) -> Result<RelayConfig> {
    let file = load_relay_config(&cli.config)?;
    validate_relay_config(apply_cli_overrides(file, cli))
}
