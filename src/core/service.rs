//! Deployment service - the per-process coordinator.
//!
//! Caches the active slot so that every incoming Discord event can ask "am I active?"
//! without touching the database, executes flips through the repository, and applies
//! changes delivered on the event bus, whether they came from this process's own write
//! or from a peer.
//!
//! Gating is fail-closed: until a deployment is known, [`is_current_deployment_active`]
//! answers `false`. Exempt channels bypass the slot check once a deployment is known.
//!
//! [`is_current_deployment_active`]: DeploymentService::is_current_deployment_active

use crate::{
    config::deployment::DeploymentConfig,
    core::{
        deployment::{Deployment, DeploymentName},
        events::{DeploymentChanged, EventBus, SubscriptionId},
        repository::DeploymentRepository,
    },
    errors::{Error, Result},
};
use parking_lot::RwLock;
use std::{
    fmt,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};

/// Minimum gap between "this instance is inactive" warnings.
pub const INACTIVE_WARNING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct ServiceState {
    current: Option<Deployment>,
    is_started: bool,
    last_inactive_warning: Option<Instant>,
}

/// Result of [`DeploymentService::set_active_deployment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetActiveOutcome {
    /// False when the requested slot was already active and nothing was written
    pub changed: bool,
    /// Slot cached before the call
    pub previous: DeploymentName,
    /// Slot cached after the call
    pub current: DeploymentName,
}

/// Point-in-time view of the service for status reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentStatus {
    /// This process's slot
    pub process_name: DeploymentName,
    /// Cached deployment, if one is known
    pub current: Option<Deployment>,
    /// Whether `start()` completed
    pub is_started: bool,
    /// Whether this process is the active slot
    pub is_active: bool,
    /// Whether the notification connection is up
    pub repository_connected: bool,
}

/// Coordinates this process's view of the active deployment.
pub struct DeploymentService {
    repository: Arc<dyn DeploymentRepository>,
    event_bus: Arc<EventBus>,
    config: DeploymentConfig,
    state: RwLock<ServiceState>,
    lifecycle: tokio::sync::Mutex<()>,
    subscription: SubscriptionId,
}

impl DeploymentService {
    /// Builds the service and subscribes it to [`DeploymentChanged`] on `event_bus`.
    ///
    /// The subscription holds a weak reference, so dropping the last `Arc` ends it.
    #[must_use]
    pub fn new(
        repository: Arc<dyn DeploymentRepository>,
        event_bus: Arc<EventBus>,
        config: DeploymentConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let subscription = event_bus.subscribe(move |event: &DeploymentChanged| {
                if let Some(service) = weak.upgrade() {
                    service.handle_deployment_changed(event);
                }
            });

            Self {
                repository,
                event_bus,
                config,
                state: RwLock::new(ServiceState::default()),
                lifecycle: tokio::sync::Mutex::new(()),
                subscription,
            }
        })
    }

    /// This process's fixed slot.
    #[must_use]
    pub const fn process_name(&self) -> DeploymentName {
        self.config.process_name
    }

    /// Configuration the service was built with.
    #[must_use]
    pub const fn config(&self) -> &DeploymentConfig {
        &self.config
    }

    /// Starts listening for changes and seeds the cache from storage.
    ///
    /// Calling it again while started only logs a warning. On failure the error is
    /// returned and the service stays un-started.
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let process = self.process_name();

        if self.state.read().is_started {
            warn!(process = %process, "Deployment service already started");
            return Ok(());
        }

        info!(process = %process, "Starting deployment service");
        self.repository.start().await.inspect_err(|e| {
            error!(process = %process, error = %e, "Failed to start deployment repository");
        })?;

        let deployment = match self.repository.get_active().await {
            Ok(deployment) => deployment,
            Err(e) => {
                error!(process = %process, error = %e, "Failed to read active deployment");
                if let Err(stop_err) = self.repository.stop().await {
                    warn!(
                        process = %process,
                        error = %stop_err,
                        "Failed to release deployment repository"
                    );
                }
                return Err(e);
            }
        };

        {
            let mut state = self.state.write();
            state.current = Some(deployment);
            state.is_started = true;
        }

        info!(
            process = %process,
            active = %deployment.name(),
            is_active = deployment.is_active(process),
            "Deployment service started"
        );
        Ok(())
    }

    /// Stops listening and clears cached state. Safe to call when not started.
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let process = self.process_name();

        if !self.state.read().is_started {
            debug!(process = %process, "Deployment service not started; nothing to stop");
            return Ok(());
        }

        let result = self.repository.stop().await;
        *self.state.write() = ServiceState::default();

        match &result {
            Ok(()) => info!(process = %process, "Deployment service stopped"),
            Err(e) => warn!(
                process = %process,
                error = %e,
                "Deployment repository stopped with an error"
            ),
        }
        result
    }

    /// Cached active slot. Before any deployment is known this warns and returns the default.
    #[must_use]
    pub fn get_current_deployment(&self) -> DeploymentName {
        if let Some(current) = self.state.read().current {
            return current.name();
        }

        warn!(
            process = %self.process_name(),
            "Active deployment requested before it is known; assuming {}",
            DeploymentName::default()
        );
        DeploymentName::default()
    }

    /// True when `channel_id` is configured to bypass the active/inactive gate.
    #[must_use]
    pub fn is_channel_exempt_from_deployment_check(&self, channel_id: Option<&str>) -> bool {
        match channel_id {
            Some(id) if !id.is_empty() && !self.config.exempt_channel_ids.is_empty() => {
                self.config.exempt_channel_ids.contains(id)
            }
            _ => false,
        }
    }

    /// The gate every feature handler consults before acting on an external event.
    ///
    /// Unknown state is `false`. Exempt channels are `true` whichever slot is active.
    /// Otherwise `true` only when this process is the active slot.
    #[must_use]
    pub fn is_current_deployment_active(&self, channel_id: Option<&str>) -> bool {
        let process = self.process_name();
        let Some(current) = self.state.read().current else {
            warn!(
                process = %process,
                channel_id = channel_id.unwrap_or_default(),
                "Deployment gate consulted before the active deployment is known; refusing"
            );
            return false;
        };

        if self.is_channel_exempt_from_deployment_check(channel_id) {
            debug!(
                process = %process,
                channel_id = channel_id.unwrap_or_default(),
                "Channel is exempt from the deployment check"
            );
            return true;
        }

        let active = current.is_active(process);
        if !active {
            self.warn_inactive(current.name(), channel_id);
        }
        active
    }

    fn warn_inactive(&self, active: DeploymentName, channel_id: Option<&str>) {
        let now = Instant::now();
        let due = |last: Option<Instant>| {
            last.is_none_or(|last| now.duration_since(last) >= INACTIVE_WARNING_INTERVAL)
        };
        if !due(self.state.read().last_inactive_warning) {
            return;
        }
        {
            // Another caller may have warned between the two locks.
            let mut state = self.state.write();
            if !due(state.last_inactive_warning) {
                return;
            }
            state.last_inactive_warning = Some(now);
        }

        warn!(
            process = %self.process_name(),
            active = %active,
            channel_id = channel_id.unwrap_or_default(),
            "This instance is inactive; skipping events (logged at most every {}s)",
            INACTIVE_WARNING_INTERVAL.as_secs()
        );
    }

    /// Makes `target` the active slot for every process.
    ///
    /// No-op when `target` is already cached as active. The local cache is only updated
    /// after the repository write succeeds; repository errors are returned unchanged.
    pub async fn set_active_deployment(
        &self,
        target: DeploymentName,
    ) -> Result<SetActiveOutcome> {
        let process = self.process_name();
        let current = self.started_deployment("set the active deployment")?;

        if current.name() == target {
            info!(
                process = %process,
                target = %target,
                "Deployment already active; nothing to do"
            );
            return Ok(SetActiveOutcome {
                changed: false,
                previous: target,
                current: target,
            });
        }

        let next = current.set_to(target);
        self.repository.set_active(&next).await.inspect_err(|e| {
            error!(
                process = %process,
                previous = %current.name(),
                new = %target,
                error = %e,
                "Failed to switch active deployment"
            );
        })?;

        self.state.write().current = Some(next);
        info!(
            process = %process,
            previous = %current.name(),
            new = %target,
            "Active deployment switched"
        );

        Ok(SetActiveOutcome {
            changed: true,
            previous: current.name(),
            current: target,
        })
    }

    /// Flips to the slot opposite the cached one.
    pub async fn toggle_active_deployment(&self) -> Result<SetActiveOutcome> {
        let current = self.started_deployment("toggle the active deployment")?;
        self.set_active_deployment(current.name().opposite()).await
    }

    /// Applies a change observed on the event bus. Last writer wins; there is no version
    /// check. Works whether or not `start()` has run.
    pub fn handle_deployment_changed(&self, event: &DeploymentChanged) {
        let process = self.process_name();
        let new = event.new_deployment;
        let cached = self.state.write().current.replace(new);

        let reported_previous = event.previous_deployment.name();
        let now_active = new.is_active(process);
        match cached.map(|previous| previous.is_active(process)) {
            Some(true) if !now_active => warn!(
                process = %process,
                previous = %reported_previous,
                new = %new.name(),
                "Deployment changed: this instance is now INACTIVE"
            ),
            Some(false) if now_active => info!(
                process = %process,
                previous = %reported_previous,
                new = %new.name(),
                "Deployment changed: this instance is now ACTIVE"
            ),
            None => info!(
                process = %process,
                previous = %reported_previous,
                new = %new.name(),
                is_active = now_active,
                "Deployment learned from notification before start"
            ),
            Some(_) => debug!(
                process = %process,
                previous = %reported_previous,
                new = %new.name(),
                is_active = now_active,
                "Deployment notification did not change this instance's role"
            ),
        }
    }

    /// Snapshot for status reporting.
    #[must_use]
    pub fn snapshot(&self) -> DeploymentStatus {
        let process_name = self.process_name();
        let state = self.state.read();
        DeploymentStatus {
            process_name,
            current: state.current,
            is_started: state.is_started,
            is_active: state.current.is_some_and(|d| d.is_active(process_name)),
            repository_connected: self.repository.is_connected(),
        }
    }

    fn started_deployment(&self, operation: &'static str) -> Result<Deployment> {
        let state = self.state.read();
        match state.current {
            Some(current) if state.is_started => Ok(current),
            _ => Err(Error::NotStarted { operation }),
        }
    }
}

impl Drop for DeploymentService {
    fn drop(&mut self) {
        self.event_bus.unsubscribe(self.subscription);
    }
}

impl fmt::Debug for DeploymentService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentService")
            .field("config", &self.config)
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}
