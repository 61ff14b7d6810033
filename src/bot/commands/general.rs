//! General Discord commands - liveness check.

// Inner module to suppress missing_docs warnings for poise macro-generated code
mod inner {
    #![allow(missing_docs)]

    use crate::{bot::Context, errors::Result};

    /// Responds with "Pong!" and the name of the instance that answered.
    ///
    /// Like every command this only runs on the active instance, so the reply also shows
    /// which slot is live.
    #[poise::command(slash_command, prefix_command)]
    pub async fn ping(ctx: Context<'_>) -> Result<()> {
        let process = ctx.data().deployment.process_name();
        ctx.say(format!("Pong! ({process} instance)")).await?;
        Ok(())
    }
}

// Re-export all commands
pub use inner::*;
