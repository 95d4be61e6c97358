use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use uuid::Uuid;

use crate::error::StoreError;
use crate::metadata::MemoryMetadata;
use crate::models::{
    AccessLogRecord, AccessType, MemoryListItem, MemoryRecord, MemoryState, PageOf,
};
use crate::schema::{fmt_ts, fmt_unix_seconds, fmt_unix_seconds_end, parse_ts};
use crate::users::parse_uuid;
use crate::MetadataStore;

/// Filter request shared by the list and filter endpoints.
#[derive(Debug, Clone)]
pub struct MemoryFilter {
    pub page: u32,
    pub size: u32,
    pub search_query: Option<String>,
    pub app_ids: Vec<Uuid>,
    pub category_ids: Vec<Uuid>,
    pub category_names: Vec<String>,
    /// Inclusive unix-second bounds on `created_at`.
    pub from_date: Option<i64>,
    pub to_date: Option<i64>,
    pub sort_column: Option<String>,
    pub sort_direction: Option<String>,
    pub show_archived: bool,
}

impl Default for MemoryFilter {
    fn default() -> Self {
        Self {
            page: 1,
            size: 10,
            search_query: None,
            app_ids: Vec::new(),
            category_ids: Vec::new(),
            category_names: Vec::new(),
            from_date: None,
            to_date: None,
            sort_column: None,
            sort_direction: None,
            show_archived: false,
        }
    }
}

impl MemoryFilter {
    /// Resolve the ORDER BY clause against the column whitelist.
    fn order_clause(&self) -> Result<String, StoreError> {
        let direction = match self.sort_direction.as_deref() {
            None => "ASC",
            Some(d) if d.eq_ignore_ascii_case("asc") => "ASC",
            Some(d) if d.eq_ignore_ascii_case("desc") => "DESC",
            Some(other) => {
                return Err(StoreError::bad_request(format!("Invalid sort direction: {other}")));
            }
        };
        let column = match self.sort_column.as_deref() {
            None => return Ok("m.created_at DESC".to_string()),
            Some("memory") => "m.content",
            Some("app_name") => "a.name",
            Some("created_at") => "m.created_at",
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

fn memory_from_row(row: &SqliteRow) -> Result<MemoryRecord, StoreError> {
    let id: String = row.try_get("id")?;
    let user_id: String = row.try_get("user_id")?;
    let app_id: String = row.try_get("app_id")?;
    let metadata_raw: String = row.try_get("metadata")?;
    let state_raw: String = row.try_get("state")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: Option<String> = row.try_get("updated_at")?;
    let archived_at: Option<String> = row.try_get("archived_at")?;
    let deleted_at: Option<String> = row.try_get("deleted_at")?;
    Ok(MemoryRecord {
        id: parse_uuid(&id)?,
        user_id: parse_uuid(&user_id)?,
        app_id: parse_uuid(&app_id)?,
        content: row.try_get("content")?,
        metadata: serde_json::from_str(&metadata_raw)?,
        state: state_raw.parse()?,
        created_at: parse_ts(&created_at)?,
        updated_at: updated_at.as_deref().map(parse_ts).transpose()?,
        archived_at: archived_at.as_deref().map(parse_ts).transpose()?,
        deleted_at: deleted_at.as_deref().map(parse_ts).transpose()?,
    })
}

const MEMORY_COLUMNS: &str =
    "m.id, m.user_id, m.app_id, m.content, m.metadata, m.state, m.created_at, \
     m.updated_at, m.archived_at, m.deleted_at";

// ── transaction-scoped writers ────────────────────────────────────────────────
//
// The ingestion engine applies LLM event lists inside one transaction; these
// free functions take the borrowed connection so callers control commit.

pub async fn insert_memory(
    conn: &mut SqliteConnection,
    id: Uuid,
    user_id: Uuid,
    app_id: Uuid,
    content: &str,
    metadata: &MemoryMetadata,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO memories (id, user_id, app_id, content, metadata, state, created_at)
         VALUES (?, ?, ?, ?, ?, 'active', ?)",
    )
    .bind(id.to_string())
    .bind(user_id.to_string())
    .bind(app_id.to_string())
    .bind(content)
    .bind(serde_json::to_string(metadata)?)
    .bind(fmt_ts(Utc::now()))
    .execute(conn)
    .await?;
    Ok(())
}

/// Insert a memory under `id`, or re-activate an existing row with fresh
/// content and metadata.  Returns `true` when the row already existed.
pub async fn activate_memory(
    conn: &mut SqliteConnection,
    id: Uuid,
    user_id: Uuid,
    app_id: Uuid,
    content: &str,
    metadata: &MemoryMetadata,
) -> Result<bool, StoreError> {
    let affected = sqlx::query(
        "UPDATE memories SET content = ?, metadata = ?, state = 'active',
                updated_at = ?, deleted_at = NULL, archived_at = NULL
         WHERE id = ?",
    )
    .bind(content)
    .bind(serde_json::to_string(metadata)?)
    .bind(fmt_ts(Utc::now()))
    .bind(id.to_string())
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if affected > 0 {
        return Ok(true);
    }
    insert_memory(conn, id, user_id, app_id, content, metadata).await?;
    Ok(false)
}

/// Rewrite content and metadata in place (LLM UPDATE event).  Returns
/// `false` when no row carries `id`.
pub async fn update_memory_row(
    conn: &mut SqliteConnection,
    id: Uuid,
    content: &str,
    metadata: &MemoryMetadata,
) -> Result<bool, StoreError> {
    let affected = sqlx::query(
        "UPDATE memories SET content = ?, metadata = ?, updated_at = ? WHERE id = ?",
    )
    .bind(content)
    .bind(serde_json::to_string(metadata)?)
    .bind(fmt_ts(Utc::now()))
    .bind(id.to_string())
    .execute(conn)
    .await?
    .rows_affected();
    Ok(affected > 0)
}

pub async fn insert_history(
    conn: &mut SqliteConnection,
    memory_id: Uuid,
    changed_by: Uuid,
    old_state: MemoryState,
    new_state: MemoryState,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO memory_status_history (id, memory_id, changed_by, old_state, new_state, changed_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(memory_id.to_string())
    .bind(changed_by.to_string())
    .bind(old_state.as_str())
    .bind(new_state.as_str())
    .bind(fmt_ts(Utc::now()))
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn insert_access_log(
    conn: &mut SqliteConnection,
    memory_id: Uuid,
    app_id: Uuid,
    access_type: AccessType,
    metadata: &serde_json::Value,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO memory_access_logs (id, memory_id, app_id, access_type, metadata, accessed_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(memory_id.to_string())
    .bind(app_id.to_string())
    .bind(access_type.as_str())
    .bind(serde_json::to_string(metadata)?)
    .bind(fmt_ts(Utc::now()))
    .execute(conn)
    .await?;
    Ok(())
}

/// Transition a memory's state, stamping `archived_at`/`deleted_at` and
/// recording the transition in the status history.
pub async fn set_memory_state(
    conn: &mut SqliteConnection,
    memory_id: Uuid,
    new_state: MemoryState,
    changed_by: Uuid,
) -> Result<MemoryState, StoreError> {
    let row = sqlx::query("SELECT state FROM memories WHERE id = ?")
        .bind(memory_id.to_string())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StoreError::not_found("Memory not found"))?;
    let old_state: MemoryState = row.try_get::<String, _>("state")?.parse()?;

    let now = fmt_ts(Utc::now());
    let (archived_sql, deleted_sql) = match new_state {
        MemoryState::Archived => (Some(now.clone()), None),
        MemoryState::Deleted => (None, Some(now.clone())),
        _ => (None, None),
    };
    sqlx::query(
        "UPDATE memories SET state = ?, updated_at = ?,
                archived_at = COALESCE(?, archived_at),
                deleted_at = COALESCE(?, deleted_at)
         WHERE id = ?",
    )
    .bind(new_state.as_str())
    .bind(&now)
    .bind(archived_sql)
    .bind(deleted_sql)
    .bind(memory_id.to_string())
    .execute(&mut *conn)
    .await?;

    insert_history(conn, memory_id, changed_by, old_state, new_state).await?;
    Ok(old_state)
}

/// Attach category names to a memory, creating missing categories.
pub async fn link_categories(
    conn: &mut SqliteConnection,
    memory_id: Uuid,
    names: &[String],
) -> Result<(), StoreError> {
    for name in names {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        sqlx::query(
            "INSERT INTO categories (id, name, created_at) VALUES (?, ?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(name)
        .bind(fmt_ts(Utc::now()))
        .execute(&mut *conn)
        .await?;
        sqlx::query(
            "INSERT INTO memory_categories (memory_id, category_id)
             SELECT ?, id FROM categories WHERE name = ?
             ON CONFLICT DO NOTHING",
        )
        .bind(memory_id.to_string())
        .bind(name)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

// ── reads ─────────────────────────────────────────────────────────────────────

impl MetadataStore {
    pub async fn get_memory(&self, id: Uuid) -> Result<Option<MemoryRecord>, StoreError> {
        let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories m WHERE m.id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(memory_from_row).transpose()
    }

    pub async fn require_memory(&self, id: Uuid) -> Result<MemoryRecord, StoreError> {
        self.get_memory(id)
            .await?
            .ok_or_else(|| StoreError::not_found("Memory not found"))
    }

    /// Every memory owned by the user, regardless of state.  Used by the
    /// ACL bulk filter and the bulk delete path.
    pub async fn user_memories(&self, user_id: Uuid) -> Result<Vec<MemoryRecord>, StoreError> {
        let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories m WHERE m.user_id = ?");
        let rows = sqlx::query(&sql)
            .bind(user_id.to_string())
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(memory_from_row).collect()
    }

    /// One list item with app name and category names, as served by
    /// `GET /memories/{id}`.
    pub async fn get_memory_item(&self, id: Uuid) -> Result<MemoryListItem, StoreError> {
        let sql = format!(
            "SELECT {MEMORY_COLUMNS}, COALESCE(a.name, 'Unknown') AS app_name
             FROM memories m LEFT JOIN apps a ON a.id = m.app_id WHERE m.id = ?"
        );
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::not_found("Memory not found"))?;
        let record = memory_from_row(&row)?;
        let app_name: String = row.try_get("app_name")?;
        let categories = self.categories_of(&[record.id]).await?;
        Ok(MemoryListItem {
            id: record.id,
            content: record.content,
            created_at: record.created_at,
            state: record.state,
            app_id: record.app_id,
            app_name,
            categories: categories.into_iter().map(|(_, name)| name).collect(),
            metadata: record.metadata,
        })
    }

    pub async fn update_memory_content(
        &self,
        id: Uuid,
        content: &str,
    ) -> Result<MemoryRecord, StoreError> {
        let affected = sqlx::query("UPDATE memories SET content = ?, updated_at = ? WHERE id = ?")
            .bind(content)
            .bind(fmt_ts(Utc::now()))
            .bind(id.to_string())
            .execute(self.pool())
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(StoreError::not_found("Memory not found"));
        }
        self.require_memory(id).await
    }

    /// (memory_id, category_name) pairs for a set of memories.
    async fn categories_of(&self, ids: &[Uuid]) -> Result<Vec<(Uuid, String)>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT mc.memory_id AS memory_id, c.name AS name
             FROM memory_categories mc JOIN categories c ON c.id = mc.category_id
             WHERE mc.memory_id IN (",
        );
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id.to_string());
        }
        qb.push(") ORDER BY c.name");
        let rows = qb.build().fetch_all(self.pool()).await?;
        rows.iter()
            .map(|row| {
                let memory_id: String = row.try_get("memory_id")?;
                let name: String = row.try_get("name")?;
                Ok((parse_uuid(&memory_id)?, name))
            })
            .collect()
    }

    pub async fn filter_memories(
        &self,
        user_id: Uuid,
        filter: &MemoryFilter,
    ) -> Result<PageOf<MemoryListItem>, StoreError> {
        filter.validate()?;
        let order = filter.order_clause()?;

        let mut count_qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT COUNT(*) AS total FROM memories m LEFT JOIN apps a ON a.id = m.app_id",
        );
        push_filter_clauses(&mut count_qb, user_id, filter);
        let total: i64 = count_qb
            .build()
            .fetch_one(self.pool())
            .await?
            .try_get("total")?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {MEMORY_COLUMNS}, COALESCE(a.name, 'Unknown') AS app_name
             FROM memories m LEFT JOIN apps a ON a.id = m.app_id"
        ));
        push_filter_clauses(&mut qb, user_id, filter);
        qb.push(format!(" ORDER BY {order} LIMIT "));
        qb.push_bind(filter.size as i64);
        qb.push(" OFFSET ");
        qb.push_bind(((filter.page - 1) as i64) * filter.size as i64);

        let rows = qb.build().fetch_all(self.pool()).await?;
        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = memory_from_row(row)?;
            let app_name: String = row.try_get("app_name")?;
            items.push(MemoryListItem {
                id: record.id,
                content: record.content,
                created_at: record.created_at,
                state: record.state,
                app_id: record.app_id,
                app_name,
                categories: Vec::new(),
                metadata: record.metadata,
            });
        }

        let ids: Vec<Uuid> = items.iter().map(|item| item.id).collect();
        for (memory_id, name) in self.categories_of(&ids).await? {
            if let Some(item) = items.iter_mut().find(|item| item.id == memory_id) {
                item.categories.push(name);
            }
        }

        Ok(PageOf::new(items, total as u64, filter.page, filter.size))
    }

    /// Distinct category names over the user's live memories.
    pub async fn user_categories(&self, user_id: Uuid) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT c.name AS name
             FROM categories c
             JOIN memory_categories mc ON mc.category_id = c.id
             JOIN memories m ON m.id = mc.memory_id
             WHERE m.user_id = ? AND m.state NOT IN ('deleted', 'archived')
             ORDER BY c.name",
        )
        .bind(user_id.to_string())
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| Ok(row.try_get::<String, _>("name")?))
            .collect()
    }

    /// Memories sharing at least one category with the source memory,
    /// ordered by category overlap then recency.  Page size is fixed at 5.
    pub async fn related_memories(
        &self,
        user_id: Uuid,
        memory_id: Uuid,
        page: u32,
    ) -> Result<PageOf<MemoryListItem>, StoreError> {
        const RELATED_PAGE_SIZE: u32 = 5;
        let page = page.max(1);

        let source = self.require_memory(memory_id).await?;
        let source_categories = self.categories_of(&[source.id]).await?;
        if source_categories.is_empty() {
            return Ok(PageOf::new(Vec::new(), 0, page, RELATED_PAGE_SIZE));
        }
        let names: Vec<String> = source_categories.into_iter().map(|(_, n)| n).collect();

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {MEMORY_COLUMNS}, COALESCE(a.name, 'Unknown') AS app_name,
                    COUNT(c.id) AS overlap
             FROM memories m
             LEFT JOIN apps a ON a.id = m.app_id
             JOIN memory_categories mc ON mc.memory_id = m.id
             JOIN categories c ON c.id = mc.category_id
             WHERE m.user_id = "
        ));
        qb.push_bind(user_id.to_string());
        qb.push(" AND m.id != ");
        qb.push_bind(memory_id.to_string());
        qb.push(" AND m.state != 'deleted' AND c.name IN (");
        let mut separated = qb.separated(", ");
        for name in &names {
            separated.push_bind(name);
        }
        qb.push(") GROUP BY m.id ORDER BY overlap DESC, m.created_at DESC LIMIT ");
        qb.push_bind(RELATED_PAGE_SIZE as i64);
        qb.push(" OFFSET ");
        qb.push_bind(((page - 1) * RELATED_PAGE_SIZE) as i64);

        let rows = qb.build().fetch_all(self.pool()).await?;
        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = memory_from_row(row)?;
            let app_name: String = row.try_get("app_name")?;
            items.push(MemoryListItem {
                id: record.id,
                content: record.content,
                created_at: record.created_at,
                state: record.state,
                app_id: record.app_id,
                app_name,
                categories: Vec::new(),
                metadata: record.metadata,
            });
        }
        let ids: Vec<Uuid> = items.iter().map(|item| item.id).collect();
        for (mid, name) in self.categories_of(&ids).await? {
            if let Some(item) = items.iter_mut().find(|item| item.id == mid) {
                item.categories.push(name);
            }
        }

        let mut count_qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT COUNT(DISTINCT m.id) AS total
             FROM memories m
             JOIN memory_categories mc ON mc.memory_id = m.id
             JOIN categories c ON c.id = mc.category_id
             WHERE m.user_id = ",
        );
        count_qb.push_bind(user_id.to_string());
        count_qb.push(" AND m.id != ");
        count_qb.push_bind(memory_id.to_string());
        count_qb.push(" AND m.state != 'deleted' AND c.name IN (");
        let mut separated = count_qb.separated(", ");
        for name in &names {
            separated.push_bind(name);
        }
        count_qb.push(")");
        let total: i64 = count_qb
            .build()
            .fetch_one(self.pool())
            .await?
            .try_get("total")?;

        Ok(PageOf::new(items, total as u64, page, RELATED_PAGE_SIZE))
    }

    pub async fn access_logs(
        &self,
        memory_id: Uuid,
        page: u32,
        page_size: u32,
    ) -> Result<PageOf<AccessLogRecord>, StoreError> {
        if page == 0 {
            return Err(StoreError::bad_request("page must be >= 1"));
        }
        if page_size == 0 || page_size > 100 {
            return Err(StoreError::bad_request("page_size must be between 1 and 100"));
        }

        let total: i64 = sqlx::query("SELECT COUNT(*) AS total FROM memory_access_logs WHERE memory_id = ?")
            .bind(memory_id.to_string())
            .fetch_one(self.pool())
            .await?
            .try_get("total")?;

        let rows = sqlx::query(
            "SELECT l.id, l.memory_id, l.app_id, l.access_type, l.metadata, l.accessed_at,
                    a.name AS app_name
             FROM memory_access_logs l LEFT JOIN apps a ON a.id = l.app_id
             WHERE l.memory_id = ?
             ORDER BY l.accessed_at DESC LIMIT ? OFFSET ?",
        )
        .bind(memory_id.to_string())
        .bind(page_size as i64)
        .bind(((page - 1) * page_size) as i64)
        .fetch_all(self.pool())
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.try_get("id")?;
            let mid: String = row.try_get("memory_id")?;
            let app_id: String = row.try_get("app_id")?;
            let metadata_raw: String = row.try_get("metadata")?;
            let accessed_at: String = row.try_get("accessed_at")?;
            items.push(AccessLogRecord {
                id: parse_uuid(&id)?,
                memory_id: parse_uuid(&mid)?,
                app_id: parse_uuid(&app_id)?,
                app_name: row.try_get("app_name")?,
                access_type: row.try_get("access_type")?,
                metadata: serde_json::from_str(&metadata_raw)?,
                accessed_at: parse_ts(&accessed_at)?,
            });
        }
        Ok(PageOf::new(items, total as u64, page, page_size))
    }

    pub async fn history_of(&self, memory_id: Uuid) -> Result<Vec<(MemoryState, MemoryState)>, StoreError> {
        let rows = sqlx::query(
            "SELECT old_state, new_state FROM memory_status_history
             WHERE memory_id = ? ORDER BY changed_at ASC",
        )
        .bind(memory_id.to_string())
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                let old: String = row.try_get("old_state")?;
                let new: String = row.try_get("new_state")?;
                Ok((old.parse()?, new.parse()?))
            })
            .collect()
    }
}

fn push_filter_clauses(qb: &mut QueryBuilder<Sqlite>, user_id: Uuid, filter: &MemoryFilter) {
    qb.push(" WHERE m.user_id = ");
    qb.push_bind(user_id.to_string());
    qb.push(" AND m.state != 'deleted'");
    if !filter.show_archived {
        qb.push(" AND m.state != 'archived'");
    }
    if let Some(query) = filter.search_query.as_deref().filter(|q| !q.is_empty()) {
        qb.push(" AND m.content LIKE ");
        qb.push_bind(format!("%{query}%"));
    }
    if !filter.app_ids.is_empty() {
        qb.push(" AND m.app_id IN (");
        let mut separated = qb.separated(", ");
        for id in &filter.app_ids {
            separated.push_bind(id.to_string());
        }
        qb.push(")");
    }
    if !filter.category_ids.is_empty() || !filter.category_names.is_empty() {
        qb.push(
            " AND EXISTS (SELECT 1 FROM memory_categories mc
                          JOIN categories c ON c.id = mc.category_id
                          WHERE mc.memory_id = m.id AND (",
        );
        let mut first = true;
        if !filter.category_ids.is_empty() {
            qb.push("c.id IN (");
            let mut separated = qb.separated(", ");
            for id in &filter.category_ids {
                separated.push_bind(id.to_string());
            }
            qb.push(")");
            first = false;
        }
        if !filter.category_names.is_empty() {
            if !first {
                qb.push(" OR ");
            }
            qb.push("c.name IN (");
            let mut separated = qb.separated(", ");
            for name in &filter.category_names {
                separated.push_bind(name.clone());
            }
            qb.push(")");
        }
        qb.push("))");
    }
    if let Some(from) = filter.from_date {
        qb.push(" AND m.created_at >= ");
        qb.push_bind(fmt_unix_seconds(from));
    }
    if let Some(to) = filter.to_date {
        qb.push(" AND m.created_at <= ");
        qb.push_bind(fmt_unix_seconds_end(to));
    }
}
