//! Unified error types for deployment coordination.
//!
//! Every fallible operation in the crate returns [`Result`]. Database, listener and
//! Discord framework errors are wrapped so callers can propagate them with `?`.

use thiserror::Error;

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration is missing or invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Human readable description of the problem
        message: String,
    },

    /// A query or transaction against the deployment table failed.
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// The dedicated LISTEN connection failed.
    #[error("Notification listener error: {0}")]
    Listener(#[from] sqlx::Error),

    /// The notification connection dropped after a successful start.
    #[error("Deployment notification connection lost; restart required")]
    ListenerDisconnected,

    /// A mutating operation was invoked before the service was started.
    #[error("Deployment service is not started; cannot {operation}")]
    NotStarted {
        /// The operation that was refused
        operation: &'static str,
    },

    /// A value outside the closed `blue`/`green` set was supplied.
    #[error("Invalid deployment name '{name}': expected 'blue' or 'green'")]
    InvalidDeploymentName {
        /// The rejected value
        name: String,
    },

    /// A required environment variable could not be read.
    #[error("Environment variable error: {0}")]
    EnvVar(#[from] std::env::VarError),

    /// Reading a file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serenity or poise reported an error.
    #[error("Serenity/Poise framework error: {0}")]
    Framework(Box<poise::serenity_prelude::Error>),
}

impl From<poise::serenity_prelude::Error> for Error {
    fn from(value: poise::serenity_prelude::Error) -> Self {
        Self::Framework(Box::new(value))
    }
}

/// Convenience `Result` type
pub type Result<T> = std::result::Result<T, Error>;
