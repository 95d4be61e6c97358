pub mod acl;
pub mod attachments;
pub mod error;
pub mod memories;
pub mod metadata;
pub mod models;
mod schema;
pub mod settings;
pub mod users;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

pub use acl::AclDecision;
pub use attachments::{AttachmentFilter, AttachmentListItem};
pub use error::StoreError;
pub use memories::MemoryFilter;
pub use metadata::MemoryMetadata;
pub use models::{
    AccessLogRecord, AccessRule, AccessType, AppRecord, AttachmentRecord, CategoryRecord,
    MemoryListItem, MemoryRecord, MemoryState, PageOf, RuleEffect, StatusHistoryRecord,
    UserRecord,
};

/// Gateway to the relational metadata store.
///
/// Cheap to clone: wraps a shared connection pool.  Every multi-row
/// ingestion write goes through an explicit transaction obtained from
/// [`MetadataStore::begin`].
#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Open (and create if missing) the database at `url`, e.g.
    /// `sqlite://engram.db`, and run schema migration.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(StoreError::Sqlx)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        schema::init_schema(&pool).await?;
        info!(%url, "metadata store ready");
        Ok(Self { pool })
    }

    /// In-memory database for tests.  A single connection keeps the
    /// `:memory:` database alive for the pool's lifetime.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StoreError::Sqlx)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        schema::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<sqlx::Transaction<'static, sqlx::Sqlite>, StoreError> {
        Ok(self.pool.begin().await?)
    }
}
