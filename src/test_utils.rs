//! Shared test utilities.
//!
//! [`MemoryDeploymentStore`] stands in for the database: it holds the singleton row and
//! fans notifications out to every connected [`MemoryDeploymentRepository`], each of which
//! belongs to one simulated process with its own event bus. Notification payloads go
//! through the same dispatch path as the `PostgreSQL` listener.

use crate::{
    config::deployment::DeploymentConfig,
    core::{
        deployment::{Deployment, DeploymentName},
        events::EventBus,
        postgres::dispatch_notification,
        repository::DeploymentRepository,
        service::DeploymentService,
    },
    errors::{Error, Result},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use tracing_subscriber::EnvFilter;

/// Installs a test-writer tracing subscriber once per test binary.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

struct ListenerEndpoint {
    bus: Arc<EventBus>,
    process: DeploymentName,
    last_known: Mutex<Option<DeploymentName>>,
    connected: AtomicBool,
}

/// In-memory replacement for the deployment table plus its notification channel.
#[derive(Default)]
pub struct MemoryDeploymentStore {
    row: Mutex<Option<DeploymentName>>,
    endpoints: Mutex<Vec<Weak<ListenerEndpoint>>>,
    writes: AtomicUsize,
    notifications: AtomicUsize,
}

impl MemoryDeploymentStore {
    /// Store with no row, as on a fresh database.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store whose singleton row already holds `name`.
    pub fn with_row(name: DeploymentName) -> Arc<Self> {
        let store = Self::default();
        *store.row.lock() = Some(name);
        Arc::new(store)
    }

    /// Current row value.
    pub fn row(&self) -> Option<DeploymentName> {
        *self.row.lock()
    }

    /// Committed writes so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Notifications sent so far (one per committed write).
    pub fn notifications_sent(&self) -> usize {
        self.notifications.load(Ordering::SeqCst)
    }

    /// Delivers an arbitrary payload to every connected listener.
    pub fn notify_raw(&self, payload: &str) {
        let endpoints: Vec<Arc<ListenerEndpoint>> = self
            .endpoints
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|endpoint| endpoint.connected.load(Ordering::SeqCst))
            .collect();

        for endpoint in endpoints {
            dispatch_notification(payload, &endpoint.last_known, &endpoint.bus, endpoint.process);
        }
    }

    fn commit(&self, name: DeploymentName) {
        *self.row.lock() = Some(name);
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

/// One simulated process's view of a [`MemoryDeploymentStore`].
pub struct MemoryDeploymentRepository {
    store: Arc<MemoryDeploymentStore>,
    endpoint: Arc<ListenerEndpoint>,
    registered: AtomicBool,
    fail_start: AtomicBool,
    fail_writes: AtomicBool,
    start_calls: AtomicUsize,
}

impl MemoryDeploymentRepository {
    /// Repository for `process` publishing onto `bus`.
    pub fn new(
        store: &Arc<MemoryDeploymentStore>,
        bus: Arc<EventBus>,
        process: DeploymentName,
    ) -> Self {
        Self {
            store: Arc::clone(store),
            endpoint: Arc::new(ListenerEndpoint {
                bus,
                process,
                last_known: Mutex::new(None),
                connected: AtomicBool::new(false),
            }),
            registered: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            start_calls: AtomicUsize::new(0),
        }
    }

    /// Makes the next `start()` calls fail like an unreachable server.
    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Makes `set_active()` fail like a rolled-back transaction.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Drops the notification connection without telling the service.
    pub fn disconnect(&self) {
        self.endpoint.connected.store(false, Ordering::SeqCst);
    }

    /// How many times `start()` actually connected.
    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeploymentRepository for MemoryDeploymentRepository {
    async fn start(&self) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::Listener(sqlx::Error::PoolTimedOut));
        }
        if self.endpoint.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if !self.registered.swap(true, Ordering::SeqCst) {
            self.store
                .endpoints
                .lock()
                .push(Arc::downgrade(&self.endpoint));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.endpoint.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn get_active(&self) -> Result<Deployment> {
        let name = self.store.row().unwrap_or_default();
        *self.endpoint.last_known.lock() = Some(name);
        Ok(Deployment::create(name))
    }

    async fn set_active(&self, deployment: &Deployment) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Database(sea_orm::DbErr::Custom(
                "simulated rollback".to_string(),
            )));
        }

        let name = deployment.name();
        self.store.commit(name);
        *self.endpoint.last_known.lock() = Some(name);

        self.store.notifications.fetch_add(1, Ordering::SeqCst);
        self.store.notify_raw(name.as_str());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.endpoint.connected.load(Ordering::SeqCst)
    }
}

/// Builds a service wired to `store` on its own bus, returning the repository too.
pub fn service_for(
    store: &Arc<MemoryDeploymentStore>,
    config: DeploymentConfig,
) -> (Arc<DeploymentService>, Arc<MemoryDeploymentRepository>) {
    let bus = Arc::new(EventBus::new());
    let repository = Arc::new(MemoryDeploymentRepository::new(
        store,
        Arc::clone(&bus),
        config.process_name,
    ));
    let service = DeploymentService::new(
        Arc::clone(&repository) as Arc<dyn DeploymentRepository>,
        bus,
        config,
    );
    (service, repository)
}

/// Builds a service on an existing bus.
pub fn service_on_bus(
    store: &Arc<MemoryDeploymentStore>,
    bus: &Arc<EventBus>,
    config: DeploymentConfig,
) -> Arc<DeploymentService> {
    let repository = Arc::new(MemoryDeploymentRepository::new(
        store,
        Arc::clone(bus),
        config.process_name,
    ));
    DeploymentService::new(repository, Arc::clone(bus), config)
}
