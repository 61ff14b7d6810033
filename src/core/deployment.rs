//! Deployment value object - which slot is active and when that was last observed.
//!
//! A [`Deployment`] is never mutated in place. Every change produces a new instance via
//! [`Deployment::toggle`] or [`Deployment::set_to`], so a value handed to a caller can
//! never change underneath it.

use crate::errors::{Error, Result};
use chrono::{DateTime, Utc};
use sea_orm::{DeriveActiveEnum, EnumIter};
use std::{fmt, str::FromStr};

/// The two deployment slots. Anything else is rejected at the system boundary.
///
/// Stored as the `PostgreSQL` enum `app_private.deployment_name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "deployment_name")]
pub enum DeploymentName {
    /// The blue slot, used as the default when nothing has been persisted yet
    #[default]
    #[sea_orm(string_value = "blue")]
    Blue,
    /// The green slot
    #[sea_orm(string_value = "green")]
    Green,
}

impl DeploymentName {
    /// Both slots, in a stable order.
    pub const ALL: [Self; 2] = [Self::Blue, Self::Green];

    /// Wire and storage representation (`"blue"` or `"green"`).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Blue => "blue",
            Self::Green => "green",
        }
    }

    /// The other slot.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Blue => Self::Green,
            Self::Green => Self::Blue,
        }
    }
}

impl fmt::Display for DeploymentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentName {
    type Err = Error;

    /// Accepts exactly `"blue"` or `"green"`. No trimming, no case folding.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "blue" => Ok(Self::Blue),
            "green" => Ok(Self::Green),
            other => Err(Error::InvalidDeploymentName {
                name: other.to_string(),
            }),
        }
    }
}

/// Immutable snapshot of the active slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deployment {
    name: DeploymentName,
    updated_at: DateTime<Utc>,
}

impl Deployment {
    /// Creates a deployment for `name`, stamped with the current time.
    #[must_use]
    pub fn create(name: DeploymentName) -> Self {
        Self {
            name,
            updated_at: Utc::now(),
        }
    }

    /// Rebuilds a deployment read back from storage.
    #[must_use]
    pub const fn from_persistence(name: DeploymentName, updated_at: DateTime<Utc>) -> Self {
        Self { name, updated_at }
    }

    /// Name of the active slot.
    #[must_use]
    pub const fn name(&self) -> DeploymentName {
        self.name
    }

    /// When this value was created or last persisted.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// True when `process_name` is the active slot.
    #[must_use]
    pub fn is_active(&self, process_name: DeploymentName) -> bool {
        self.name == process_name
    }

    /// Returns a new deployment pointing at the opposite slot.
    #[must_use]
    pub fn toggle(&self) -> Self {
        Self::create(self.name.opposite())
    }

    /// Returns a new deployment pointing at `name` with a fresh timestamp.
    #[must_use]
    pub fn set_to(&self, name: DeploymentName) -> Self {
        Self::create(name)
    }
}
