//! SQLite connection pool and migrations for the durable pipeline store.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::DatabaseConfig;

pub type DbPool = Pool<Sqlite>;

/// Pages between automatic WAL checkpoints.
const WAL_AUTOCHECKPOINT_PAGES: i32 = 1000;

async fn configure_connection(conn: &mut sqlx::SqliteConnection) -> Result<(), sqlx::Error> {
    sqlx::query(&format!("PRAGMA wal_autocheckpoint = {}", WAL_AUTOCHECKPOINT_PAGES))
        .execute(&mut *conn)
        .await?;
    sqlx::query("PRAGMA temp_store = MEMORY")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Some filesystems refuse WAL silently; check and retry once.
async fn ensure_wal_mode(pool: &DbPool) -> Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    let mode: String = sqlx::query("PRAGMA journal_mode")
        .fetch_one(&mut *conn)
        .await?
        .get(0);
    if mode != "wal" && mode != "memory" {
        warn!(journal_mode = %mode, "Pipeline store is not in WAL mode, switching");
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Open the pipeline store database, creating the file if needed.
///
/// `url` is a SQLite url such as `sqlite:voxrelay.db?mode=rwc`.
pub async fn init_pool(url: &str, config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
    let options = SqliteConnectOptions::from_str(url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(busy_timeout)
        .create_if_missing(true);

    let max_connections = config.max_connections.max(1);
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(busy_timeout)
        .after_connect(|conn, _meta| Box::pin(async move { configure_connection(conn).await }))
        .connect_with(options)
        .await?;

    ensure_wal_mode(&pool).await?;
    info!(max_connections, "Pipeline store database opened");
    Ok(pool)
}

pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Pipeline store migrations applied");
    Ok(())
}
