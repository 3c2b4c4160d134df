use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::time::Duration;

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqliteConnection};
use tracing::warn;

pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn get_db_pool(db_url: &str) -> Result<Pool<Sqlite>, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(db_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
}

/// Private in-memory database on a single long-lived connection; every
/// extra connection would otherwise see its own empty database.
pub async fn get_memory_pool() -> Result<Pool<Sqlite>, sqlx::Error> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
}

/// A transaction started with `BEGIN IMMEDIATE`.
///
/// The write lock is taken up front, so a transaction that reads before it
/// writes waits on `busy_timeout` for other writers instead of failing with
/// `SQLITE_BUSY` when it upgrades. Dropping it without [`WriteTx::commit`]
/// rolls back before the connection goes back to the pool.
pub struct WriteTx {
    conn: Option<PoolConnection<Sqlite>>,
}

impl WriteTx {
    pub async fn begin(pool: &Pool<Sqlite>) -> Result<Self, sqlx::Error> {
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(Self { conn: Some(conn) })
    }

    pub async fn commit(mut self) -> Result<(), sqlx::Error> {
        if let Some(conn) = self.conn.as_mut() {
            sqlx::query("COMMIT").execute(&mut **conn).await?;
        }
        // committed; the connection is clean again
        self.conn = None;
        Ok(())
    }
}

impl Deref for WriteTx {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        self.conn.as_deref().expect("WriteTx used after commit")
    }
}

impl DerefMut for WriteTx {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        self.conn.as_deref_mut().expect("WriteTx used after commit")
    }
}

impl Drop for WriteTx {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                        warn!("rollback failed, closing connection: {}", err);
                        drop(conn.detach());
                    }
                });
            }
            // no runtime left to roll back on; closing the connection
            // discards the open transaction
            Err(_) => drop(conn.detach()),
        }
    }
}
