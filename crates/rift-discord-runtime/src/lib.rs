//! Discord runtime for the Rift channel relay.
//!
//! Connects to the Discord gateway with `serenity`, forwards message events
//! into the mirror engine, and implements the engine's platform and outbound
//! collaborators on top of Discord's REST API and channel webhooks.

mod discord_runtime;

pub use discord_runtime::{
    discord_gateway_intents, run_discord_runtime, DiscordGateway, DiscordRuntimeConfig,
    RiftEventHandler, WebhookIdentityProvider, DEFAULT_WEBHOOK_NAME,
};
