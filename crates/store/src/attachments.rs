use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{AttachmentRecord, PageOf};
use crate::schema::{fmt_ts, fmt_unix_seconds, fmt_unix_seconds_end, parse_ts};
use crate::users::parse_uuid;
use crate::MetadataStore;

/// Characters of content surfaced in list previews.
const PREVIEW_LEN: usize = 200;

const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct AttachmentFilter {
    pub page: u32,
    pub size: u32,
    /// Case-insensitive substring over content or the stringified UUID.
    pub search_query: Option<String>,
    /// Inclusive unix-second bounds on `created_at`.
    pub from_date: Option<i64>,
    pub to_date: Option<i64>,
    pub sort_column: Option<String>,
    pub sort_direction: Option<String>,
    /// Per-query statement-timeout hint, milliseconds.
    pub timeout_ms: Option<u64>,
}

impl Default for AttachmentFilter {
    fn default() -> Self {
        Self {
            page: 1,
            size: 10,
            search_query: None,
            from_date: None,
            to_date: None,
            sort_column: None,
            sort_direction: None,
            timeout_ms: None,
        }
    }
}

impl AttachmentFilter {
    fn order_clause(&self) -> Result<String, StoreError> {
        let direction = match self.sort_direction.as_deref() {
            None => "DESC",
            Some(d) if d.eq_ignore_ascii_case("asc") => "ASC",
            Some(d) if d.eq_ignore_ascii_case("desc") => "DESC",
            Some(other) => {
                return Err(StoreError::bad_request(format!("Invalid sort direction: {other}")));
            }
        };
        let column = match self.sort_column.as_deref() {
            None => "created_at",
            Some("created_at") => "created_at",
            Some("updated_at") => "updated_at",
            Some("size") => "LENGTH(content)",
            Some(other) => {
                return Err(StoreError::bad_request(format!("Invalid sort column: {other}")));
            }
        };
        Ok(format!("{column} {direction}"))
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.page == 0 {
            return Err(StoreError::bad_request("page must be >= 1"));
        }
        if self.size == 0 || self.size > 100 {
            return Err(StoreError::bad_request("size must be between 1 and 100"));
        }
        Ok(())
    }
}

/// A page entry: preview only, never the full blob.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AttachmentListItem {
    pub id: Uuid,
    pub preview: String,
    pub content_length: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

fn attachment_from_row(row: &SqliteRow) -> Result<AttachmentRecord, StoreError> {
    let id: String = row.try_get("id")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(AttachmentRecord {
        id: parse_uuid(&id)?,
        content: row.try_get("content")?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn validate_content_size(content: &str, max_bytes: usize) -> Result<(), StoreError> {
    let size = content.len();
    if size > max_bytes {
        return Err(StoreError::PayloadTooLarge { size, limit: max_bytes });
    }
    Ok(())
}

fn preview_of(content: &str) -> String {
    content.chars().take(PREVIEW_LEN).collect()
}

impl MetadataStore {
    /// Create an attachment, minting a UUID unless the caller supplies one.
    /// A caller-supplied ID that already exists is a conflict.
    pub async fn create_attachment(
        &self,
        id: Option<Uuid>,
        content: &str,
        max_bytes: usize,
    ) -> Result<AttachmentRecord, StoreError> {
        validate_content_size(content, max_bytes)?;
        let id = id.unwrap_or_else(Uuid::new_v4);
        let now = fmt_ts(Utc::now());

        let result = sqlx::query(
            "INSERT INTO attachments (id, content, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(content)
        .bind(&now)
        .bind(&now)
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => self.require_attachment(id).await,
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(
                StoreError::Conflict(format!("Attachment with ID {id} already exists")),
            ),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_attachment(&self, id: Uuid) -> Result<Option<AttachmentRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, content, created_at, updated_at FROM attachments WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(attachment_from_row).transpose()
    }

    pub async fn require_attachment(&self, id: Uuid) -> Result<AttachmentRecord, StoreError> {
        self.get_attachment(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Attachment with ID {id} not found")))
    }

    pub async fn update_attachment(
        &self,
        id: Uuid,
        content: &str,
        max_bytes: usize,
    ) -> Result<AttachmentRecord, StoreError> {
        validate_content_size(content, max_bytes)?;
        let affected = sqlx::query("UPDATE attachments SET content = ?, updated_at = ? WHERE id = ?")
            .bind(content)
            .bind(fmt_ts(Utc::now()))
            .bind(id.to_string())
            .execute(self.pool())
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(StoreError::NotFound(format!("Attachment with ID {id} not found")));
        }
        self.require_attachment(id).await
    }

    /// Idempotent: returns `true` when a row was removed, `false` when the
    /// attachment was already gone.  Both count as success.
    pub async fn delete_attachment(&self, id: Uuid) -> Result<bool, StoreError> {
        let affected = sqlx::query("DELETE FROM attachments WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    pub async fn filter_attachments(
        &self,
        filter: &AttachmentFilter,
    ) -> Result<PageOf<AttachmentListItem>, StoreError> {
        filter.validate()?;
        let order = filter.order_clause()?;
        let timeout = filter
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_QUERY_TIMEOUT);

        let run = async {
            let mut count_qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT COUNT(*) AS total FROM attachments");
            push_attachment_clauses(&mut count_qb, filter);
            let total: i64 = count_qb
                .build()
                .fetch_one(self.pool())
                .await?
                .try_get("total")?;

            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT id, content, LENGTH(content) AS content_length, created_at, updated_at
                 FROM attachments",
            );
            push_attachment_clauses(&mut qb, filter);
            qb.push(format!(" ORDER BY {order} LIMIT "));
            qb.push_bind(filter.size as i64);
            qb.push(" OFFSET ");
            qb.push_bind(((filter.page - 1) as i64) * filter.size as i64);

            let rows = qb.build().fetch_all(self.pool()).await?;
            let mut items = Vec::with_capacity(rows.len());
            for row in &rows {
                let record = attachment_from_row(row)?;
                let content_length: i64 = row.try_get("content_length")?;
                items.push(AttachmentListItem {
                    id: record.id,
                    preview: preview_of(&record.content),
                    content_length: content_length as u64,
                    created_at: record.created_at.timestamp(),
                    updated_at: record.updated_at.timestamp(),
                });
            }
            Ok::<_, StoreError>(PageOf::new(items, total as u64, filter.page, filter.size))
        };

        tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| StoreError::Timeout(timeout.as_millis() as u64))?
    }
}

fn push_attachment_clauses(qb: &mut QueryBuilder<Sqlite>, filter: &AttachmentFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(query) = filter.search_query.as_deref().filter(|q| !q.is_empty()) {
        qb.push(" AND (content LIKE ");
        qb.push_bind(format!("%{query}%"));
        qb.push(" OR id LIKE ");
        qb.push_bind(format!("%{}%", query.to_lowercase()));
        qb.push(")");
    }
    if let Some(from) = filter.from_date {
        qb.push(" AND created_at >= ");
        qb.push_bind(fmt_unix_seconds(from));
    }
    if let Some(to) = filter.to_date {
        qb.push(" AND created_at <= ");
        qb.push_bind(fmt_unix_seconds_end(to));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    const MAX: usize = 1024;

    #[tokio::test]
    async fn create_get_update_get_round_trip() -> Result<()> {
        let store = MetadataStore::in_memory().await?;
        let created = store.create_attachment(None, "first draft", MAX).await?;

        let fetched = store.require_attachment(created.id).await?;
        assert_eq!(fetched.content, "first draft");

        let updated = store.update_attachment(created.id, "second draft", MAX).await?;
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.content, "second draft");
        assert!(updated.updated_at > created.created_at);
        Ok(())
    }

    #[tokio::test]
    async fn caller_supplied_id_collision_is_a_conflict() -> Result<()> {
        let store = MetadataStore::in_memory().await?;
        let id = Uuid::new_v4();
        store.create_attachment(Some(id), "one", MAX).await?;
        let err = store.create_attachment(Some(id), "two", MAX).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        Ok(())
    }

    #[tokio::test]
    async fn delete_is_idempotent() -> Result<()> {
        let store = MetadataStore::in_memory().await?;
        let created = store.create_attachment(None, "bye", MAX).await?;
        assert!(store.delete_attachment(created.id).await?);
        assert!(!store.delete_attachment(created.id).await?);
        Ok(())
    }

    #[tokio::test]
    async fn ceiling_is_inclusive() -> Result<()> {
        let store = MetadataStore::in_memory().await?;
        let exactly = "x".repeat(MAX);
        store.create_attachment(None, &exactly, MAX).await?;

        let over = "x".repeat(MAX + 1);
        let err = store.create_attachment(None, &over, MAX).await.unwrap_err();
        assert!(matches!(err, StoreError::PayloadTooLarge { size, limit } if size == MAX + 1 && limit == MAX));
        Ok(())
    }

    #[tokio::test]
    async fn filter_previews_are_truncated_to_200_chars() -> Result<()> {
        let store = MetadataStore::in_memory().await?;
        let long = "a".repeat(500);
        store.create_attachment(None, &long, MAX).await?;

        let page = store.filter_attachments(&AttachmentFilter::default()).await?;
        assert_eq!(page.items[0].preview.chars().count(), 200);
        assert_eq!(page.items[0].content_length, 500);
        Ok(())
    }

    #[tokio::test]
    async fn filter_matches_uuid_substring() -> Result<()> {
        let store = MetadataStore::in_memory().await?;
        let id = Uuid::new_v4();
        store.create_attachment(Some(id), "payload", MAX).await?;
        store.create_attachment(None, "other", MAX).await?;

        let needle = id.to_string()[..8].to_string();
        let page = store
            .filter_attachments(&AttachmentFilter {
                search_query: Some(needle),
                ..Default::default()
            })
            .await?;
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, id);
        Ok(())
    }

    #[tokio::test]
    async fn filter_rejects_bad_sort_and_bounds() -> Result<()> {
        let store = MetadataStore::in_memory().await?;
        for filter in [
            AttachmentFilter { sort_column: Some("content".to_string()), ..Default::default() },
            AttachmentFilter { sort_direction: Some("sideways".to_string()), ..Default::default() },
            AttachmentFilter { page: 0, ..Default::default() },
            AttachmentFilter { size: 0, ..Default::default() },
            AttachmentFilter { size: 101, ..Default::default() },
        ] {
            let err = store.filter_attachments(&filter).await.unwrap_err();
            assert!(matches!(err, StoreError::BadRequest(_)));
        }
        Ok(())
    }

    #[tokio::test]
    async fn filter_sorts_by_size() -> Result<()> {
        let store = MetadataStore::in_memory().await?;
        store.create_attachment(None, "aaaa", MAX).await?;
        store.create_attachment(None, "aaaaaaaaaa", MAX).await?;

        let page = store
            .filter_attachments(&AttachmentFilter {
                sort_column: Some("size".to_string()),
                sort_direction: Some("desc".to_string()),
                ..Default::default()
            })
            .await?;
        assert_eq!(page.items[0].content_length, 10);
        assert_eq!(page.items[1].content_length, 4);
        Ok(())
    }
}
