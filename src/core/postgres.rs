//! `PostgreSQL` implementation of [`DeploymentRepository`].
//!
//! State lives in the singleton row `app_private.active_deployment` (id pinned to 1),
//! modelled by [`ActiveDeployment`]. Writes upsert that row and `NOTIFY deployment_changed`
//! inside one transaction, so peers never hear about a write that was rolled back. Each
//! process holds one dedicated `LISTEN` connection, opened straight from the database URL
//! and never taken from the query pool. Incoming payloads become [`DeploymentChanged`]
//! events on the bus.
//!
//! The listener does not reconnect. If the connection drops after `start()` the repository
//! reports itself disconnected and the process relies on an external supervisor to
//! restart it, since changes made while disconnected would otherwise go unnoticed.

use crate::{
    core::{
        deployment::{Deployment, DeploymentName},
        events::{DeploymentChanged, EventBus},
        repository::DeploymentRepository,
    },
    entities::{ActiveDeployment, active_deployment},
    errors::Result,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sea_orm::{
    ActiveValue::{NotSet, Set},
    ConnectionTrait, DatabaseConnection, DbBackend, EntityTrait, Insert, Statement,
    TransactionTrait, Value,
    sea_query::OnConflict,
};
use sqlx::postgres::PgListener;
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, error, info, instrument, warn};

/// Notification channel shared by every instance.
pub const NOTIFICATION_CHANNEL: &str = "deployment_changed";

const NOTIFY_SQL: &str = "SELECT pg_notify($1, $2)";

/// Insert-or-replace of the singleton row. `id` is generated, so only `name` is sent.
fn upsert_active(name: DeploymentName) -> Insert<active_deployment::ActiveModel> {
    ActiveDeployment::insert(active_deployment::ActiveModel {
        id: NotSet,
        name: Set(name),
    })
    .on_conflict(
        OnConflict::column(active_deployment::Column::Id)
            .update_column(active_deployment::Column::Name)
            .to_owned(),
    )
}

/// `NOTIFY` through `pg_notify` so channel and payload are bound, not interpolated.
fn notify_active(name: DeploymentName) -> Statement {
    Statement::from_sql_and_values(
        DbBackend::Postgres,
        NOTIFY_SQL,
        [Value::from(NOTIFICATION_CHANNEL), Value::from(name.as_str())],
    )
}

struct ListenerHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Deployment repository backed by a singleton table and `LISTEN`/`NOTIFY`.
pub struct PostgresDeploymentRepository {
    db: DatabaseConnection,
    database_url: String,
    event_bus: Arc<EventBus>,
    process: DeploymentName,
    last_known: Arc<Mutex<Option<DeploymentName>>>,
    connected: Arc<AtomicBool>,
    listener: tokio::sync::Mutex<Option<ListenerHandle>>,
}

impl PostgresDeploymentRepository {
    /// Creates a repository. No connection is opened for notifications until `start()`.
    ///
    /// `process` is only used to tag log lines.
    #[must_use]
    pub fn new(
        db: DatabaseConnection,
        database_url: impl Into<String>,
        event_bus: Arc<EventBus>,
        process: DeploymentName,
    ) -> Self {
        Self {
            db,
            database_url: database_url.into(),
            event_bus,
            process,
            last_known: Arc::new(Mutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
            listener: tokio::sync::Mutex::new(None),
        }
    }

    /// The name this process last read, wrote or was notified about.
    #[must_use]
    pub fn last_known(&self) -> Option<DeploymentName> {
        *self.last_known.lock()
    }
}

impl fmt::Debug for PostgresDeploymentRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresDeploymentRepository")
            .field("process", &self.process)
            .field("last_known", &self.last_known())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DeploymentRepository for PostgresDeploymentRepository {
    #[instrument(skip(self))]
    async fn start(&self) -> Result<()> {
        let mut slot = self.listener.lock().await;
        if slot.is_some() {
            debug!(process = %self.process, "Deployment listener already running");
            return Ok(());
        }

        info!(process = %self.process, "Opening dedicated deployment notification connection");
        let mut listener = PgListener::connect(&self.database_url).await?;
        listener.listen(NOTIFICATION_CHANNEL).await?;
        self.connected.store(true, Ordering::SeqCst);

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_listener(
            listener,
            shutdown_rx,
            Arc::clone(&self.event_bus),
            Arc::clone(&self.last_known),
            Arc::clone(&self.connected),
            self.process,
        ));
        *slot = Some(ListenerHandle { shutdown, task });

        info!(
            process = %self.process,
            channel = NOTIFICATION_CHANNEL,
            "Listening for deployment changes"
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self) -> Result<()> {
        let Some(handle) = self.listener.lock().await.take() else {
            debug!(process = %self.process, "Deployment listener not running; nothing to stop");
            return Ok(());
        };

        if handle.shutdown.send(()).is_err() {
            debug!(process = %self.process, "Deployment listener task had already exited");
        }
        if let Err(e) = handle.task.await {
            warn!(process = %self.process, error = %e, "Deployment listener task ended abnormally");
        }
        self.connected.store(false, Ordering::SeqCst);

        info!(process = %self.process, "Deployment notification connection closed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_active(&self) -> Result<Deployment> {
        let row = ActiveDeployment::find_by_id(active_deployment::SINGLETON_ID)
            .one(&self.db)
            .await?;

        let name = match row {
            Some(row) => row.name,
            None => {
                debug!(
                    process = %self.process,
                    default = %DeploymentName::default(),
                    "No active deployment stored yet; using default"
                );
                DeploymentName::default()
            }
        };

        *self.last_known.lock() = Some(name);
        Ok(Deployment::from_persistence(name, Utc::now()))
    }

    #[instrument(skip(self, deployment), fields(new = %deployment.name()))]
    async fn set_active(&self, deployment: &Deployment) -> Result<()> {
        let name = deployment.name();

        // Dropping the transaction on an early return rolls it back.
        let txn = self.db.begin().await?;
        upsert_active(name).exec_without_returning(&txn).await?;
        txn.execute(notify_active(name)).await?;
        txn.commit().await?;

        // Only cache once the write is durable.
        *self.last_known.lock() = Some(name);
        info!(process = %self.process, "Persisted active deployment and notified peers");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn run_listener(
    mut listener: PgListener,
    mut shutdown: oneshot::Receiver<()>,
    event_bus: Arc<EventBus>,
    last_known: Arc<Mutex<Option<DeploymentName>>>,
    connected: Arc<AtomicBool>,
    process: DeploymentName,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                if let Err(e) = listener.unlisten(NOTIFICATION_CHANNEL).await {
                    warn!(process = %process, error = %e, "UNLISTEN failed during shutdown");
                }
                break;
            }
            received = listener.try_recv() => match received {
                Ok(Some(notification)) => {
                    dispatch_notification(notification.payload(), &last_known, &event_bus, process);
                }
                Ok(None) => {
                    error!(
                        process = %process,
                        last_known = ?*last_known.lock(),
                        "Deployment notification connection closed; not reconnecting"
                    );
                    break;
                }
                Err(e) => {
                    error!(
                        process = %process,
                        last_known = ?*last_known.lock(),
                        error = %e,
                        "Deployment notification connection failed; not reconnecting"
                    );
                    break;
                }
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
}

/// Turns one raw notification payload into a [`DeploymentChanged`] on `event_bus`.
///
/// Payloads outside `blue`/`green` are logged and dropped without touching the cache.
/// The event's previous slot is whatever this process last knew about, or the default
/// slot if it has seen nothing yet. The cache is updated after subscribers have run.
pub(crate) fn dispatch_notification(
    payload: &str,
    last_known: &Mutex<Option<DeploymentName>>,
    event_bus: &EventBus,
    process: DeploymentName,
) -> Option<DeploymentChanged> {
    let new = match payload.parse::<DeploymentName>() {
        Ok(name) => name,
        Err(e) => {
            warn!(
                process = %process,
                payload,
                error = %e,
                "Ignoring malformed deployment notification"
            );
            return None;
        }
    };

    let previous = last_known.lock().unwrap_or_default();
    debug!(
        process = %process,
        previous = %previous,
        new = %new,
        "Deployment notification received"
    );

    let event = DeploymentChanged::new(previous, new);
    event_bus.publish(&event);
    *last_known.lock() = Some(new);
    Some(event)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::{errors::Error, test_utils::init_test_tracing};
    use sea_orm::{DatabaseBackend, DbErr, MockDatabase, MockExecResult, QueryTrait, Transaction};
    use std::collections::BTreeMap;

    fn repository_with(db: DatabaseConnection) -> PostgresDeploymentRepository {
        PostgresDeploymentRepository::new(
            db,
            "postgres://localhost/unused",
            Arc::new(EventBus::new()),
            DeploymentName::Blue,
        )
    }

    fn name_row(name: &str) -> BTreeMap<&'static str, Value> {
        BTreeMap::from([
            ("id", Value::from(active_deployment::SINGLETON_ID)),
            ("name", Value::from(name)),
        ])
    }

    fn exec_ok() -> MockExecResult {
        MockExecResult {
            last_insert_id: 0,
            rows_affected: 1,
        }
    }

    #[tokio::test]
    async fn test_get_active_reads_stored_row() -> Result<()> {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![name_row("green")]])
            .into_connection();
        let repository = repository_with(db);

        let deployment = repository.get_active().await?;
        assert_eq!(deployment.name(), DeploymentName::Green);
        assert_eq!(repository.last_known(), Some(DeploymentName::Green));
        Ok(())
    }

    #[tokio::test]
    async fn test_get_active_defaults_to_blue_without_writing() -> Result<()> {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([Vec::<BTreeMap<&str, Value>>::new()])
            .into_connection();
        let repository = repository_with(db);

        let deployment = repository.get_active().await?;
        assert_eq!(deployment.name(), DeploymentName::Blue);

        // Only the SELECT ran; nothing was inserted
        let PostgresDeploymentRepository { db, .. } = repository;
        let log = db.into_transaction_log();
        assert_eq!(log.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_get_active_rejects_unknown_stored_value() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![name_row("red")]])
            .into_connection();
        let repository = repository_with(db);

        let result = repository.get_active().await;
        assert!(matches!(result, Err(Error::Database(_))));
        assert_eq!(repository.last_known(), None);
    }

    #[tokio::test]
    async fn test_set_active_upserts_and_notifies_in_one_transaction() -> Result<()> {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([exec_ok(), exec_ok()])
            .into_connection();
        let repository = repository_with(db);

        repository
            .set_active(&Deployment::create(DeploymentName::Green))
            .await?;
        assert_eq!(repository.last_known(), Some(DeploymentName::Green));

        let upsert = upsert_active(DeploymentName::Green).build(DbBackend::Postgres);
        assert!(upsert.sql.contains(r#""app_private"."active_deployment""#));
        assert!(upsert.sql.contains("ON CONFLICT"));

        let PostgresDeploymentRepository { db, .. } = repository;
        assert_eq!(
            db.into_transaction_log(),
            vec![Transaction::many([
                Statement::from_string(DbBackend::Postgres, "BEGIN"),
                upsert,
                Statement::from_sql_and_values(
                    DbBackend::Postgres,
                    "SELECT pg_notify($1, $2)",
                    [Value::from("deployment_changed"), Value::from("green")],
                ),
                Statement::from_string(DbBackend::Postgres, "COMMIT"),
            ])]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_set_active_leaves_cache_untouched() -> Result<()> {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![name_row("blue")]])
            .append_exec_errors([DbErr::Custom("upsert failed".to_string())])
            .into_connection();
        let repository = repository_with(db);
        repository.get_active().await?;

        let result = repository
            .set_active(&Deployment::create(DeploymentName::Green))
            .await;
        assert!(matches!(result, Err(Error::Database(_))));
        assert_eq!(repository.last_known(), Some(DeploymentName::Blue));
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() -> Result<()> {
        let db = MockDatabase::new(DatabaseBackend::Postgres).into_connection();
        let repository = repository_with(db);
        assert!(!repository.is_connected());
        repository.stop().await?;
        assert!(!repository.is_connected());
        Ok(())
    }

    #[test]
    fn test_notification_publishes_reconstructed_previous() {
        init_test_tracing();
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(move |event: &DeploymentChanged| {
            sink.lock().push((
                event.previous_deployment.name(),
                event.new_deployment.name(),
            ));
        });
        let last_known = Mutex::new(Some(DeploymentName::Blue));

        let event =
            dispatch_notification("green", &last_known, &bus, DeploymentName::Blue).unwrap();
        assert_eq!(event.previous_deployment.name(), DeploymentName::Blue);
        assert_eq!(event.new_deployment.name(), DeploymentName::Green);
        assert_eq!(*last_known.lock(), Some(DeploymentName::Green));

        dispatch_notification("blue", &last_known, &bus, DeploymentName::Blue).unwrap();
        assert_eq!(
            *seen.lock(),
            vec![
                (DeploymentName::Blue, DeploymentName::Green),
                (DeploymentName::Green, DeploymentName::Blue),
            ]
        );
    }

    #[test]
    fn test_previous_is_a_guess_before_first_read() {
        // Nothing observed yet: previous falls back to the default even though the
        // real prior value may have been green.
        let bus = EventBus::new();
        let last_known = Mutex::new(None);

        let event =
            dispatch_notification("green", &last_known, &bus, DeploymentName::Green).unwrap();
        assert_eq!(event.previous_deployment.name(), DeploymentName::Blue);

        // A repeated notification reports previous == new rather than the true history.
        let repeat =
            dispatch_notification("green", &last_known, &bus, DeploymentName::Green).unwrap();
        assert_eq!(repeat.previous_deployment.name(), DeploymentName::Green);
    }

    #[test]
    fn test_invalid_payload_is_dropped() {
        init_test_tracing();
        let bus = EventBus::new();
        let fired = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&fired);
        bus.subscribe(move |_: &DeploymentChanged| *flag.lock() = true);
        let last_known = Mutex::new(Some(DeploymentName::Blue));

        for payload in ["red", "", "GREEN", "{\"name\":\"green\"}"] {
            let event = dispatch_notification(payload, &last_known, &bus, DeploymentName::Blue);
            assert!(event.is_none());
        }
        assert!(!*fired.lock());
        assert_eq!(*last_known.lock(), Some(DeploymentName::Blue));
    }
}
