use chrono::Utc;
use engram_config::Settings;
use sqlx::Row;

use crate::error::StoreError;
use crate::schema::fmt_ts;
use crate::MetadataStore;

const SETTINGS_KEY: &str = "settings";

impl MetadataStore {
    /// The persisted settings document, if one has been written.
    pub async fn load_settings(&self) -> Result<Option<Settings>, StoreError> {
        let row = sqlx::query("SELECT value FROM config WHERE key = ?")
            .bind(SETTINGS_KEY)
            .fetch_optional(self.pool())
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let raw: String = row.try_get("value")?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
        }
    }

    /// Persist the settings document.  The next operation observes the new
    /// values without a restart.
    pub async fn save_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO config (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(SETTINGS_KEY)
        .bind(serde_json::to_string(settings)?)
        .bind(fmt_ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
