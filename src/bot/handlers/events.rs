//! Gateway event handler.
//!
//! Feature handlers hang off this function. Anything reacting to a message must pass the
//! deployment gate first; the inactive instance stays connected but ignores the event.

use crate::{
    bot::{BotData, gate},
    errors::{Error, Result},
};
use poise::serenity_prelude as serenity;
use tracing::{info, trace};

/// Poise `event_handler` for non-command gateway events.
pub async fn event_handler(
    _ctx: &serenity::Context,
    event: &serenity::FullEvent,
    _framework: poise::FrameworkContext<'_, BotData, Error>,
    data: &BotData,
) -> Result<()> {
    match event {
        serenity::FullEvent::Ready { data_about_bot } => {
            let status = data.deployment.snapshot();
            info!(
                user = %data_about_bot.user.name,
                process = %status.process_name,
                is_active = status.is_active,
                "Connected to Discord"
            );
        }
        serenity::FullEvent::Message { new_message } if !new_message.author.bot => {
            if !gate::should_process(&data.deployment, new_message.channel_id) {
                return Ok(());
            }
            trace!(
                process = %data.deployment.process_name(),
                channel_id = %new_message.channel_id,
                message_id = %new_message.id,
                "Message accepted by deployment gate"
            );
        }
        _ => {}
    }
    Ok(())
}
