use anyhow::{anyhow, Context, Result};
use rift_core::{AuditLog, AuditRotationPolicy};
use rift_discord_runtime::{run_discord_runtime, DiscordRuntimeConfig};
use rift_mirror::{MirrorEngineConfig, SnapshotStore};

use crate::bootstrap_helpers::shutdown_signal;
use crate::cli_args::Cli;
use crate::relay_config::{resolve_relay_config, RelayConfig};

pub(crate) async fn run_cli(cli: Cli) -> Result<()> {
    let config = resolve_relay_config(&cli)?;
    if cli.validate_only {
        let summary = render_validation_summary(&config)?;
        println!("{summary}");
        return Ok(());
    }

    let token = cli
        .discord_token
        .clone()
        .filter(|token| !token.trim().is_empty())
        .ok_or_else(|| anyhow!("--discord-token (or RIFT_DISCORD_TOKEN) is required"))?;

    tracing::info!(
        routes = config.routes.source_channels().count(),
        retention_secs = config.retention.as_secs(),
        snapshot = %config.snapshot_path.display(),
        "starting rift relay"
    );
    let runtime_config = build_runtime_config(config, token);
    run_discord_runtime(runtime_config, shutdown_signal()).await?;
    Ok(())
}

pub(crate) fn build_runtime_config(config: RelayConfig, token: String) -> DiscordRuntimeConfig {
    let audit_log = AuditLog::new(config.audit_log_path, AuditRotationPolicy::from_env());
    let engine = MirrorEngineConfig::new(config.routes, config.retention, config.snapshot_path)
        .with_audit_log(audit_log);
    DiscordRuntimeConfig {
        token,
        webhook_name: config.webhook_name,
        engine,
    }
}

/// Loads the snapshot the relay would start from and describes it.
pub(crate) fn render_validation_summary(config: &RelayConfig) -> Result<String> {
    let store = SnapshotStore::new(&config.snapshot_path);
    let snapshot = store
        .load()
        .with_context(|| format!("snapshot {} is unusable", store.path().display()))?;
    let (originals, mirrors) = snapshot
        .as_ref()
        .map(|snapshot| (snapshot.originals.len(), snapshot.mirror_count()))
        .unwrap_or((0, 0));

    let mut lines = vec![
        "rift config ok".to_string(),
        format!("retention_seconds={}", config.retention.as_secs()),
        format!("webhook_name={}", config.webhook_name),
        format!("audit_log={}", config.audit_log_path.display()),
    ];
    for source in config.routes.source_channels() {
        let destinations = config
            .routes
            .destinations_for(source)
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        lines.push(format!("route {source} -> {destinations}"));
    }
    lines.push(match snapshot {
        Some(_) => format!(
            "snapshot={} originals={originals} mirrors={mirrors}",
            config.snapshot_path.display()
        ),
        None => format!("snapshot={} absent", config.snapshot_path.display()),
    });
    Ok(lines.join("\n"))
}
