//! SQLite connection pooling for the subtitle corpus.

use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool};
use diesel::sqlite::SqliteConnection;

use crate::repository::errors::{RepositoryError, RepositoryResult};

pub type DbConnection = SqliteConnection;
pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;

/// Applies SQLite pragmas on every pooled connection.
///
/// WAL keeps concurrent backfill writers from starving readers; the busy
/// timeout covers the per-batch transactions overlapping on commit.
#[derive(Debug, Clone, Copy)]
struct ConnectionOptions;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(
            "PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;",
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Build an r2d2 pool over the given SQLite database.
pub fn establish_connection_pool(database_url: &str) -> RepositoryResult<DbPool> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    Pool::builder()
        .connection_customizer(Box::new(ConnectionOptions))
        .build(manager)
        .map_err(RepositoryError::Pool)
}
