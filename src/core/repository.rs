//! Persistence and cross-process propagation contract for the active deployment.

use crate::{core::deployment::Deployment, errors::Result};
use async_trait::async_trait;

/// Stores the active slot and tells every other process when it changes.
///
/// `start`/`stop` manage a connection lifecycle that is separate from query execution:
/// change notifications are bound to one physical connection, which must stay checked out
/// for as long as the repository is started. Implementations publish observed changes as
/// [`DeploymentChanged`](crate::core::events::DeploymentChanged) on the event bus they were
/// built with, including changes caused by this process's own writes.
#[async_trait]
pub trait DeploymentRepository: Send + Sync {
    /// Opens the notification connection and begins listening.
    async fn start(&self) -> Result<()>;

    /// Stops listening and releases the notification connection.
    async fn stop(&self) -> Result<()>;

    /// Reads the active deployment. Falls back to the default slot when nothing is stored,
    /// without writing anything.
    async fn get_active(&self) -> Result<Deployment>;

    /// Persists `deployment` and notifies every listening process in one atomic step.
    async fn set_active(&self, deployment: &Deployment) -> Result<()>;

    /// Whether the notification connection is currently up.
    fn is_connected(&self) -> bool;
}
