//! SQLite access for the job store.
//!
//! The job table, its claim queue, and the entity rows live in one
//! SQLite database. Connections are file-based and cheap to establish,
//! and a worker holds at most one at a time, so there is no pooled
//! state: every caller gets a fresh connection already configured with
//! the pragmas the job tables rely on. The SyncConnectionWrapper
//! internally uses spawn_blocking, so queries never block the async
//! worker thread.

use diesel::result::DatabaseErrorKind;
use diesel::sqlite::SqliteConnection;
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use diesel_async::{AsyncConnection, RunQueryDsl};

/// Diesel error type alias.
pub type DieselError = diesel::result::Error;

/// Async SQLite connection type.
pub type SqliteConn = SyncConnectionWrapper<SqliteConnection>;

/// Session pragmas applied to every connection.
///
/// Foreign keys make the phi_entities cascade fire; the busy timeout
/// lets a worker and a submitter hit the queue at the same moment and
/// back off instead of failing the claim.
const SESSION_PRAGMAS: &[&str] = &["PRAGMA foreign_keys = ON", "PRAGMA busy_timeout = 5000"];

/// Handle to the job database.
#[derive(Clone)]
pub struct Database {
    path: String,
}

impl Database {
    /// Accepts either a bare filesystem path or a `sqlite:`-prefixed
    /// URL (the prefix is stripped).
    pub fn new(database_url: &str) -> Self {
        let path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);
        Self {
            path: path.to_string(),
        }
    }

    /// Open a connection with the session pragmas applied.
    pub async fn connect(&self) -> Result<SqliteConn, DieselError> {
        let mut conn = SqliteConn::establish(&self.path).await.map_err(|e| {
            DieselError::DatabaseError(
                DatabaseErrorKind::UnableToSendCommand,
                Box::new(e.to_string()),
            )
        })?;
        for pragma in SESSION_PRAGMAS {
            diesel::sql_query(*pragma).execute(&mut conn).await?;
        }
        Ok(conn)
    }
}
