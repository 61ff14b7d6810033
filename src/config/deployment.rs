//! Deployment configuration - this process's slot identity, the operator allowed to flip
//! slots, and channels that bypass the active/inactive gate.
//!
//! Values come from an optional `config.toml` `[deployment]` table, overridden by
//! environment variables (usually loaded from `.env`). Resolution is a pure function over
//! a key lookup so tests never have to touch the real process environment.
//!
//! ```toml
//! [deployment]
//! process_name = "blue"
//! owner_user_id = "123456789012345678"
//! owner_channel_id = "234567890123456789"
//! exempt_channel_ids = ["345678901234567890"]
//! ```

use crate::{
    core::deployment::DeploymentName,
    errors::{Error, Result},
};
use serde::Deserialize;
use std::{collections::HashSet, path::Path};

/// Environment variable naming this process's slot (`blue` or `green`).
pub const PROCESS_NAME_VAR: &str = "PROCESS_NAME";
/// Environment variable holding the Discord user allowed to flip slots.
pub const OWNER_USER_ID_VAR: &str = "DEPLOYMENT_OWNER_USER_ID";
/// Environment variable holding the Discord channel flips must be issued from.
pub const OWNER_CHANNEL_ID_VAR: &str = "DEPLOYMENT_OWNER_CHANNEL_ID";
/// Environment variable with comma-separated channel IDs that bypass the gate.
pub const EXEMPT_CHANNEL_IDS_VAR: &str = "DEPLOYMENT_EXEMPT_CHANNEL_IDS";

/// Structure of config.toml. Only the `[deployment]` table is read.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Deployment settings; every key is optional in the file
    #[serde(default)]
    pub deployment: DeploymentFileConfig,
}

/// The `[deployment]` table as written in config.toml.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct DeploymentFileConfig {
    /// `"blue"` or `"green"`
    pub process_name: Option<String>,
    /// Discord user ID allowed to run deployment commands
    pub owner_user_id: Option<String>,
    /// Discord channel ID deployment commands must come from
    pub owner_channel_id: Option<String>,
    /// Channel IDs that are always processed, whichever slot is active
    #[serde(default)]
    pub exempt_channel_ids: Vec<String>,
}

/// Resolved deployment settings handed to the service and the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentConfig {
    /// This process's fixed slot identity
    pub process_name: DeploymentName,
    /// Discord user allowed to flip slots, if manual control is enabled
    pub owner_user_id: Option<String>,
    /// Discord channel flips must be issued from, if manual control is enabled
    pub owner_channel_id: Option<String>,
    /// Channels processed regardless of which slot is active
    pub exempt_channel_ids: HashSet<String>,
}

impl DeploymentConfig {
    /// Config with no operator and no exempt channels.
    #[must_use]
    pub fn new(process_name: DeploymentName) -> Self {
        Self {
            process_name,
            owner_user_id: None,
            owner_channel_id: None,
            exempt_channel_ids: HashSet::new(),
        }
    }

    /// Replaces the exempt channel set.
    #[must_use]
    pub fn with_exempt_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exempt_channel_ids = channels.into_iter().map(Into::into).collect();
        self
    }

    /// Enables manual control for one user in one channel.
    #[must_use]
    pub fn with_owner(mut self, user_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        self.owner_user_id = Some(user_id.into());
        self.owner_channel_id = Some(channel_id.into());
        self
    }

    /// True only when both owner IDs are configured and both match.
    #[must_use]
    pub fn is_operator(&self, user_id: &str, channel_id: &str) -> bool {
        matches!(
            (&self.owner_user_id, &self.owner_channel_id),
            (Some(owner), Some(channel)) if owner == user_id && channel == channel_id
        )
    }

    /// Merges file settings with values from `lookup`, which take precedence.
    ///
    /// Fails when no process name is configured or it is not `blue`/`green`.
    pub fn resolve<F>(file: Option<&DeploymentFileConfig>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = file.cloned().unwrap_or_default();

        let raw_name = non_blank(lookup(PROCESS_NAME_VAR))
            .or_else(|| non_blank(file.process_name))
            .ok_or_else(|| Error::Config {
                message: format!(
                    "{PROCESS_NAME_VAR} is required and must be 'blue' or 'green'"
                ),
            })?;
        let process_name = raw_name
            .parse::<DeploymentName>()
            .map_err(|e| Error::Config {
                message: format!("{PROCESS_NAME_VAR}: {e}"),
            })?;

        let owner_user_id =
            non_blank(lookup(OWNER_USER_ID_VAR)).or_else(|| non_blank(file.owner_user_id));
        let owner_channel_id =
            non_blank(lookup(OWNER_CHANNEL_ID_VAR)).or_else(|| non_blank(file.owner_channel_id));

        let exempt_channel_ids = lookup(EXEMPT_CHANNEL_IDS_VAR).map_or_else(
            || split_channel_ids(file.exempt_channel_ids.iter().map(String::as_str)),
            |raw| split_channel_ids(raw.split(',')),
        );

        if owner_user_id.is_some() != owner_channel_id.is_some() {
            tracing::warn!(
                user_var = OWNER_USER_ID_VAR,
                channel_var = OWNER_CHANNEL_ID_VAR,
                "Only one owner setting is present; manual deployment control stays disabled"
            );
        }

        Ok(Self {
            process_name,
            owner_user_id,
            owner_channel_id,
            exempt_channel_ids,
        })
    }

    /// Loads `config.toml` from the working directory if present and overlays the
    /// process environment.
    pub fn from_env() -> Result<Self> {
        let file = load_optional_config("config.toml")?;
        Self::resolve(
            file.as_ref().map(|config| &config.deployment),
            |key| std::env::var(key).ok(),
        )
    }
}

/// Loads and parses a config.toml file.
///
/// # Errors
/// Returns an error if the file cannot be read or is not valid TOML for [`Config`].
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::Config {
        message: format!("Failed to read config file: {e}"),
    })?;

    parse_config(&contents)
}

/// Like [`load_config`], but a missing file is `Ok(None)` rather than an error.
pub fn load_optional_config<P: AsRef<Path>>(path: P) -> Result<Option<Config>> {
    let path = path.as_ref();
    if !path.exists() {
        tracing::debug!("No config file at {}; using environment only", path.display());
        return Ok(None);
    }
    load_config(path).map(Some)
}

fn parse_config(contents: &str) -> Result<Config> {
    toml::from_str(contents).map_err(|e| Error::Config {
        message: format!("Failed to parse config.toml: {e}"),
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn split_channel_ids<'a>(ids: impl Iterator<Item = &'a str>) -> HashSet<String> {
    ids.map(str::trim)
        .filter(|id| !id.is_empty())
        .map(ToString::to_string)
        .collect()
}
