use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::metadata::MemoryMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryState {
    Active,
    Paused,
    Archived,
    Deleted,
}

impl MemoryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Archived => "archived",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for MemoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "archived" => Ok(Self::Archived),
            "deleted" => Ok(Self::Deleted),
            other => Err(StoreError::bad_request(format!("unknown memory state: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Search,
    List,
    Update,
    Delete,
    DeleteAll,
}

impl AccessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::List => "list",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::DeleteAll => "delete_all",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: Uuid,
    /// External identity token supplied by clients.
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AppRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub app_id: Uuid,
    pub content: String,
    pub metadata: MemoryMetadata,
    pub state: MemoryState,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A memory row joined with its app name and category names, as served by
/// the list/filter/related endpoints.
#[derive(Debug, Clone)]
pub struct MemoryListItem {
    pub id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub state: MemoryState,
    pub app_id: Uuid,
    pub app_name: String,
    pub categories: Vec<String>,
    pub metadata: MemoryMetadata,
}

#[derive(Debug, Clone)]
pub struct AttachmentRecord {
    pub id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CategoryRecord {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct StatusHistoryRecord {
    pub id: Uuid,
    pub memory_id: Uuid,
    pub changed_by: Uuid,
    pub old_state: MemoryState,
    pub new_state: MemoryState,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AccessLogRecord {
    pub id: Uuid,
    pub memory_id: Uuid,
    pub app_id: Uuid,
    pub app_name: Option<String>,
    pub access_type: String,
    pub metadata: serde_json::Value,
    pub accessed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleEffect {
    Allow,
    Deny,
}

#[derive(Debug, Clone)]
pub struct AccessRule {
    pub id: Uuid,
    pub subject_type: String,
    pub subject_id: Uuid,
    pub object_type: String,
    /// `None` means "all objects".
    pub object_id: Option<Uuid>,
    pub effect: RuleEffect,
}

/// A paginated result page shared by the list/filter endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct PageOf<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub size: u32,
    pub pages: u32,
}

impl<T> PageOf<T> {
    pub fn new(items: Vec<T>, total: u64, page: u32, size: u32) -> Self {
        let pages = if size == 0 { 0 } else { ((total + size as u64 - 1) / size as u64) as u32 };
        Self { items, total, page, size, pages }
    }
}
