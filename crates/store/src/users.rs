use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{AppRecord, UserRecord};
use crate::schema::{fmt_ts, parse_ts};
use crate::MetadataStore;

fn user_from_row(row: &SqliteRow) -> Result<UserRecord, StoreError> {
    let id: String = row.try_get("id")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(UserRecord {
        id: parse_uuid(&id)?,
        user_id: row.try_get("user_id")?,
        created_at: parse_ts(&created_at)?,
    })
}

fn app_from_row(row: &SqliteRow) -> Result<AppRecord, StoreError> {
    let id: String = row.try_get("id")?;
    let owner_id: String = row.try_get("owner_id")?;
    let created_at: String = row.try_get("created_at")?;
    let is_active: i64 = row.try_get("is_active")?;
    Ok(AppRecord {
        id: parse_uuid(&id)?,
        owner_id: parse_uuid(&owner_id)?,
        name: row.try_get("name")?,
        is_active: is_active != 0,
        created_at: parse_ts(&created_at)?,
    })
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|_| StoreError::bad_request(format!("invalid UUID: {raw}")))
}

impl MetadataStore {
    pub async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        let row = sqlx::query("SELECT id, user_id, created_at FROM users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    pub async fn require_user(&self, user_id: &str) -> Result<UserRecord, StoreError> {
        self.get_user(user_id)
            .await?
            .ok_or_else(|| StoreError::not_found("User not found"))
    }

    pub async fn get_app(&self, app_id: Uuid) -> Result<Option<AppRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, owner_id, name, is_active, created_at FROM apps WHERE id = ?",
        )
        .bind(app_id.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(app_from_row).transpose()
    }

    /// Idempotently upsert the (user, app) pair and return both records.
    /// Both inserts and the read-back run inside one transaction so two
    /// concurrent first-contact requests converge on the same rows.
    pub async fn get_or_create_user_and_app(
        &self,
        user_id: &str,
        app_name: &str,
    ) -> Result<(UserRecord, AppRecord), StoreError> {
        let mut tx = self.begin().await?;
        let now = fmt_ts(Utc::now());

        sqlx::query(
            "INSERT INTO users (id, user_id, created_at) VALUES (?, ?, ?)
             ON CONFLICT(user_id) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        let user_row = sqlx::query("SELECT id, user_id, created_at FROM users WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await?;
        let user = user_from_row(&user_row)?;

        sqlx::query(
            "INSERT INTO apps (id, owner_id, name, is_active, created_at) VALUES (?, ?, ?, 1, ?)
             ON CONFLICT(owner_id, name) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user.id.to_string())
        .bind(app_name)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        let app_row = sqlx::query(
            "SELECT id, owner_id, name, is_active, created_at FROM apps
             WHERE owner_id = ? AND name = ?",
        )
        .bind(user.id.to_string())
        .bind(app_name)
        .fetch_one(&mut *tx)
        .await?;
        let app = app_from_row(&app_row)?;

        tx.commit().await?;
        Ok((user, app))
    }

    pub async fn set_app_active(&self, app_id: Uuid, is_active: bool) -> Result<(), StoreError> {
        let affected = sqlx::query("UPDATE apps SET is_active = ? WHERE id = ?")
            .bind(is_active as i64)
            .bind(app_id.to_string())
            .execute(self.pool())
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(StoreError::not_found("App not found"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[tokio::test]
    async fn get_or_create_is_idempotent() -> Result<()> {
        let store = MetadataStore::in_memory().await?;
        let (user_a, app_a) = store.get_or_create_user_and_app("alice", "claude").await?;
        let (user_b, app_b) = store.get_or_create_user_and_app("alice", "claude").await?;
        assert_eq!(user_a.id, user_b.id);
        assert_eq!(app_a.id, app_b.id);
        assert!(app_a.is_active);
        Ok(())
    }

    #[tokio::test]
    async fn same_app_name_is_scoped_per_user() -> Result<()> {
        let store = MetadataStore::in_memory().await?;
        let (_, app_alice) = store.get_or_create_user_and_app("alice", "claude").await?;
        let (_, app_bob) = store.get_or_create_user_and_app("bob", "claude").await?;
        assert_ne!(app_alice.id, app_bob.id);
        Ok(())
    }

    #[tokio::test]
    async fn paused_app_round_trips() -> Result<()> {
        let store = MetadataStore::in_memory().await?;
        let (_, app) = store.get_or_create_user_and_app("alice", "cursor").await?;
        store.set_app_active(app.id, false).await?;
        let reloaded = store.get_app(app.id).await?.unwrap();
        assert!(!reloaded.is_active);
        Ok(())
    }
}
