//! Discord transport loop: gateway client, engine task and shutdown.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use rift_mirror::{EngineEvent, MirrorEngine, MirrorEngineConfig, SnapshotWrite};
use serenity::all::{Client, GatewayIntents, Http};

mod discord_convert;
mod discord_events;
mod discord_gateway;
mod discord_webhooks;

pub use discord_events::RiftEventHandler;
pub use discord_gateway::DiscordGateway;
pub use discord_webhooks::WebhookIdentityProvider;

pub const DEFAULT_WEBHOOK_NAME: &str = "Rift";

#[derive(Clone)]
/// Runtime configuration for the Discord relay.
pub struct DiscordRuntimeConfig {
    pub token: String,
    pub webhook_name: String,
    pub engine: MirrorEngineConfig,
}

impl std::fmt::Debug for DiscordRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordRuntimeConfig")
            .field("token", &"<redacted>")
            .field("webhook_name", &self.webhook_name)
            .field("engine", &self.engine)
            .finish()
    }
}

/// Intents needed to see message content, edits, deletes and guild emoji.
pub fn discord_gateway_intents() -> GatewayIntents {
    GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_EMOJIS_AND_STICKERS
}

/// Runs the relay until `shutdown` resolves or the gateway client stops,
/// then drains the engine and writes the snapshot.
pub async fn run_discord_runtime(
    config: DiscordRuntimeConfig,
    shutdown: impl Future<Output = ()> + Send,
) -> Result<SnapshotWrite> {
    let http = Arc::new(Http::new(&config.token));
    let gateway = Arc::new(DiscordGateway::new(Arc::clone(&http)));
    let provider = Arc::new(WebhookIdentityProvider::new(
        Arc::clone(&http),
        config.webhook_name.clone(),
    ));
    let (engine, events) = MirrorEngine::new(config.engine, gateway.clone(), provider)
        .context("failed to start mirror engine")?;

    let handler = RiftEventHandler::new(engine.event_sender(), Arc::clone(&gateway));
    let mut client = Client::builder(&config.token, discord_gateway_intents())
        .event_handler(handler)
        .await
        .context("failed to build discord client")?;
    let shard_manager = Arc::clone(&client.shard_manager);

    let sender = engine.event_sender();
    let engine_task = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run(events).await }
    });

    tokio::select! {
        result = client.start() => {
            if let Err(error) = result {
                tracing::error!(%error, "discord gateway stopped");
            }
        }
        () = shutdown => {
            tracing::info!("shutdown signal received");
        }
    }
    shard_manager.shutdown_all().await;

    if sender.send(EngineEvent::Shutdown).await.is_err() {
        tracing::warn!("engine stopped before shutdown was requested");
    }
    let written = engine_task
        .await
        .context("engine task failed")?
        .context("failed to persist mirror snapshot")?;
    tracing::info!(?written, "rift relay stopped");
    Ok(written)
}
