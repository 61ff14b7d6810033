//! Bot layer - Discord-specific interface, the deployment gate and command handlers
//!
//! Both the blue and the green instance stay connected to Discord with the same
//! application identity. Every command and incoming message goes through [`gate`] first, so
//! only the active instance (or an exempt channel) does real work.

/// Discord command implementations (general, deployment control)
pub mod commands;
/// Consuming gate applied before any event is processed
pub mod gate;
/// Discord gateway event handlers
pub mod handlers;

use crate::{core::service::DeploymentService, errors::{Error, Result}};
use poise::serenity_prelude as serenity;
use std::sync::Arc;
use tracing::{error, info, instrument};

/// Shared data available to all bot commands.
pub struct BotData {
    /// This process's deployment coordinator
    pub deployment: Arc<DeploymentService>,
}

impl BotData {
    /// Creates a new `BotData` around an already started deployment service.
    #[must_use]
    pub const fn new(deployment: Arc<DeploymentService>) -> Self {
        Self { deployment }
    }
}

/// Poise context used by every command.
pub type Context<'a> = poise::Context<'a, BotData, Error>;

async fn on_error(error: poise::FrameworkError<'_, BotData, Error>) {
    match error {
        poise::FrameworkError::Setup { error, .. } => {
            error!("Failed to start bot: {error:?}");
        }
        // Gate refusals are silent by contract
        poise::FrameworkError::CommandCheckFailed { error: None, .. } => {}
        poise::FrameworkError::Command { error, ctx, .. } => {
            error!(
                process = %ctx.data().deployment.process_name(),
                "Error in command `{}`: {error:?}",
                ctx.command().qualified_name
            );
            if let Err(e) = ctx.say(format!("An error occurred: {error}")).await {
                error!("Failed to send error message: {e}");
            }
        }
        error => {
            if let Err(e) = poise::builtins::on_error(error).await {
                error!("Error while handling error: {e}");
            }
        }
    }
}

/// Connects to Discord and runs until the gateway client stops.
#[instrument(skip_all, fields(process = %data.deployment.process_name()))]
pub async fn run_bot(token: String, data: BotData) -> Result<()> {
    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![commands::ping(), commands::deployment()],
            prefix_options: poise::PrefixFrameworkOptions {
                prefix: Some("!".into()),
                ..Default::default()
            },
            command_check: Some(|ctx| Box::pin(gate::command_check(ctx))),
            event_handler: |ctx, event, framework, data| {
                Box::pin(handlers::events::event_handler(ctx, event, framework, data))
            },
            on_error: |error| Box::pin(on_error(error)),
            ..Default::default()
        })
        .setup(|ctx, ready, framework| {
            Box::pin(async move {
                info!("Logged in as {}", ready.user.name);
                info!("Registering commands globally...");
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                Ok(data)
            })
        })
        .build();

    let intents = serenity::GatewayIntents::GUILD_MESSAGES
        | serenity::GatewayIntents::DIRECT_MESSAGES
        | serenity::GatewayIntents::MESSAGE_CONTENT;

    info!("Setting up Serenity client for Poise framework...");
    let mut client = serenity::Client::builder(&token, intents)
        .framework(framework)
        .await
        .inspect_err(|e| error!("Error creating client: {e:?}"))?;

    info!("Starting bot client...");
    client
        .start()
        .await
        .inspect_err(|e| error!("Client error: {e:?}"))?;
    Ok(())
}
