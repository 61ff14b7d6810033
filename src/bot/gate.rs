//! Consuming gate - decides whether this instance should act on a Discord event.
//!
//! Every handler that reacts to something observed on Discord asks
//! [`should_process`] first and silently does nothing when it says no. Commands get the
//! same treatment through [`command_check`], which poise runs before every invocation.
//!
//! The operator can still reach `deployment status` and `deployment set` on an inactive
//! instance. Otherwise switching to a slot with no running process would leave nothing
//! that accepts the command to switch back. `set` converges when several instances answer;
//! `toggle` does not, so it stays gated.

use crate::{
    bot::Context,
    core::service::DeploymentService,
    errors::Result,
};
use poise::serenity_prelude::{ChannelId, UserId};
use tracing::{debug, trace};

/// Commands the operator may run on any instance, by qualified name.
pub const OPERATOR_UNGATED_COMMANDS: [&str; 2] = ["deployment status", "deployment set"];

/// True when this instance is active, or `channel_id` is exempt.
#[must_use]
pub fn should_process(deployment: &DeploymentService, channel_id: ChannelId) -> bool {
    deployment.is_current_deployment_active(Some(&channel_id.to_string()))
}

/// Gate for a command invocation: [`should_process`], except that the operator reaches
/// [`OPERATOR_UNGATED_COMMANDS`] everywhere.
#[must_use]
pub fn should_process_command(
    deployment: &DeploymentService,
    command: &str,
    user_id: UserId,
    channel_id: ChannelId,
) -> bool {
    if OPERATOR_UNGATED_COMMANDS.contains(&command)
        && deployment
            .config()
            .is_operator(&user_id.to_string(), &channel_id.to_string())
    {
        debug!(
            process = %deployment.process_name(),
            command,
            "Operator command bypasses deployment gate"
        );
        return true;
    }
    should_process(deployment, channel_id)
}

/// Global poise check: commands are skipped on the inactive instance.
pub async fn command_check(ctx: Context<'_>) -> Result<bool> {
    let command = &ctx.command().qualified_name;
    let allowed = should_process_command(
        &ctx.data().deployment,
        command,
        ctx.author().id,
        ctx.channel_id(),
    );
    if !allowed {
        trace!(
            command = %command,
            channel_id = %ctx.channel_id(),
            "Command skipped by deployment gate"
        );
    }
    Ok(allowed)
}
