//! Deployment control commands - inspect and flip the active slot.
//!
//! Restricted to the configured owner user in the configured owner channel. If either ID
//! is missing, nobody can run them. `toggle` only runs on the active instance (or in an
//! exempt channel), so exactly one process answers. `status` and `set` also run on an
//! inactive instance, so the operator can recover when the active slot has no process.

use crate::core::{
    deployment::DeploymentName,
    service::{DeploymentStatus, SetActiveOutcome},
};
use std::fmt::Write;

/// Renders the `/deployment status` reply.
#[must_use]
pub fn format_status(status: &DeploymentStatus) -> String {
    let mut text = String::from("**Deployment status**\n");
    let _ = writeln!(text, "• This instance: `{}`", status.process_name);
    match status.current {
        Some(current) => {
            let _ = writeln!(
                text,
                "• Active slot: `{}` (as of {})",
                current.name(),
                current.updated_at().format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
        None => text.push_str("• Active slot: unknown\n"),
    }
    let _ = writeln!(
        text,
        "• Role: {}",
        if status.is_active { "🟢 active" } else { "⚪ standby" }
    );
    let _ = write!(
        text,
        "• Notifications: {}",
        if status.repository_connected {
            "connected"
        } else {
            "⚠️ disconnected (restart required)"
        }
    );
    text
}

/// Renders the reply after a toggle or set.
#[must_use]
pub fn format_outcome(outcome: &SetActiveOutcome, process: DeploymentName) -> String {
    if outcome.changed {
        format!(
            "🔀 Switched active deployment `{}` → `{}` (requested on `{process}`)",
            outcome.previous, outcome.current
        )
    } else {
        format!("✅ `{}` is already the active deployment", outcome.current)
    }
}

// Inner module to suppress missing_docs warnings for poise macro-generated code
mod inner {
    #![allow(missing_docs)]

    use super::{format_outcome, format_status};
    use crate::{bot::Context, core::deployment::DeploymentName, errors::Result};
    use tracing::{info, warn};

    /// Only the configured owner, in the configured channel, may control deployments.
    ///
    /// Attached to the parent only; poise runs parent checks for every subcommand.
    async fn operator_check(ctx: Context<'_>) -> Result<bool> {
        let user_id = ctx.author().id.to_string();
        let channel_id = ctx.channel_id().to_string();
        let allowed = ctx
            .data()
            .deployment
            .config()
            .is_operator(&user_id, &channel_id);

        if !allowed {
            warn!(
                process = %ctx.data().deployment.process_name(),
                user_id,
                channel_id,
                "Refused deployment command from non-operator"
            );
            ctx.send(
                poise::CreateReply::default()
                    .content("⛔ You are not allowed to control deployments here.")
                    .ephemeral(true),
            )
            .await?;
        }
        Ok(allowed)
    }

    /// Parent command for deployment control.
    #[poise::command(
        slash_command,
        prefix_command,
        check = "operator_check",
        subcommands("deployment_status", "deployment_toggle", "deployment_set")
    )]
    pub async fn deployment(ctx: Context<'_>) -> Result<()> {
        let response_text = "Deployment control:\n\
                             - `status`: show which slot is active\n\
                             - `toggle`: switch to the other slot\n\
                             - `set <blue|green>`: make a specific slot active";

        ctx.send(
            poise::CreateReply::default()
                .content(response_text)
                .ephemeral(true),
        )
        .await?;
        Ok(())
    }

    /// Shows this instance's slot, the active slot and the notification link state.
    #[poise::command(slash_command, prefix_command, rename = "status")]
    pub async fn deployment_status(ctx: Context<'_>) -> Result<()> {
        let status = ctx.data().deployment.snapshot();
        ctx.say(format_status(&status)).await?;
        Ok(())
    }

    /// Switches every instance to the other slot.
    #[poise::command(slash_command, prefix_command, rename = "toggle")]
    pub async fn deployment_toggle(ctx: Context<'_>) -> Result<()> {
        let deployment = &ctx.data().deployment;
        info!(
            process = %deployment.process_name(),
            user_id = %ctx.author().id,
            "Deployment toggle requested"
        );
        let outcome = deployment.toggle_active_deployment().await?;
        ctx.say(format_outcome(&outcome, deployment.process_name()))
            .await?;
        Ok(())
    }

    /// Makes a specific slot active for every instance.
    #[poise::command(slash_command, prefix_command, rename = "set")]
    pub async fn deployment_set(
        ctx: Context<'_>,
        #[description = "Slot to activate: blue or green"] target: String,
    ) -> Result<()> {
        let Ok(target) = target.trim().to_lowercase().parse::<DeploymentName>() else {
            ctx.say(format!("❌ Unknown deployment '{target}'. Use `blue` or `green`."))
                .await?;
            return Ok(());
        };

        let deployment = &ctx.data().deployment;
        info!(
            process = %deployment.process_name(),
            user_id = %ctx.author().id,
            target = %target,
            "Deployment switch requested"
        );
        let outcome = deployment.set_active_deployment(target).await?;
        ctx.say(format_outcome(&outcome, deployment.process_name()))
            .await?;
        Ok(())
    }
}

pub use inner::*;
