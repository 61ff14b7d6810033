//! Database configuration - `PostgreSQL` connection and schema bootstrap.
//!
//! The deployment coordinator needs a real `PostgreSQL` server: the singleton row lives in
//! `app_private.active_deployment` and changes travel over `LISTEN`/`NOTIFY`. The bootstrap
//! DDL is idempotent, so every instance can run it at boot without coordinating.
//!
//! The DDL is written out rather than generated with `Schema::create_table_from_entity`:
//! the entity cannot express a `GENERATED ALWAYS` column or an enum type created only if
//! it is missing.

use crate::errors::{Error, Result};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection};

/// Schema holding the deployment table and its enum type.
pub const SCHEMA_NAME: &str = "app_private";

/// Idempotent DDL for the schema, the enum type and the singleton table.
///
/// `id` is a generated constant with a unique constraint, which makes a second row
/// impossible and gives the upsert a conflict target.
pub const SCHEMA_SQL: &str = r"
CREATE SCHEMA IF NOT EXISTS app_private;

DO $$
BEGIN
    CREATE TYPE app_private.deployment_name AS ENUM ('blue', 'green');
EXCEPTION
    WHEN duplicate_object THEN NULL;
END
$$;

CREATE TABLE IF NOT EXISTS app_private.active_deployment (
    id integer GENERATED ALWAYS AS (1) STORED UNIQUE,
    name app_private.deployment_name NOT NULL
);
";

/// Reads `DATABASE_URL`, which must point at a `PostgreSQL` server.
pub fn get_database_url() -> Result<String> {
    database_url_from(std::env::var("DATABASE_URL").ok())
}

fn database_url_from(value: Option<String>) -> Result<String> {
    let url = value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::Config {
            message: "DATABASE_URL is required".to_string(),
        })?;

    if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
        return Err(Error::Config {
            message: "DATABASE_URL must be a postgres:// or postgresql:// URL".to_string(),
        });
    }
    Ok(url)
}

/// Opens the query connection pool. The notification listener opens its own connection.
///
/// `SeaORM` casts enum values to the unqualified type name, so the pool puts
/// [`SCHEMA_NAME`] on the search path.
pub async fn create_connection(database_url: &str) -> Result<DatabaseConnection> {
    let mut options = ConnectOptions::new(database_url);
    options.set_schema_search_path(format!("{SCHEMA_NAME},public"));
    Database::connect(options).await.map_err(Into::into)
}

/// Creates the deployment schema objects if they are missing. Never touches existing rows.
pub async fn ensure_schema(db: &DatabaseConnection) -> Result<()> {
    db.execute_unprepared(SCHEMA_SQL).await?;
    tracing::debug!("Deployment schema is in place");
    Ok(())
}
