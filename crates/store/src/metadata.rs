use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Typed view over the schemaless memory metadata bag.
///
/// The recognized keys (`attachment_ids`, `source_app`, `mcp_client`) are
/// first-class fields; every other key round-trips untouched through
/// `extra`.  `attachment_ids` keeps first-seen ordering and is never
/// reordered during serialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachment_ids: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_app: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_client: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MemoryMetadata {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }

    /// Append an attachment UUID, keeping the list deduplicated in
    /// first-seen order.  Returns `false` when the ID was already present.
    pub fn push_attachment(&mut self, id: Uuid) -> bool {
        if self.attachment_ids.contains(&id) {
            return false;
        }
        self.attachment_ids.push(id);
        true
    }

    /// Replace the attachment list wholesale, deduplicating while keeping
    /// the caller's ordering.
    pub fn set_attachments(&mut self, ids: impl IntoIterator<Item = Uuid>) {
        let mut deduped = Vec::new();
        for id in ids {
            if !deduped.contains(&id) {
                deduped.push(id);
            }
        }
        self.attachment_ids = deduped;
    }

    /// Scalar `attachment_id` written by pre-array clients.
    pub fn legacy_attachment_id(&self) -> Option<Uuid> {
        self.extra
            .get("attachment_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    /// All attachment UUIDs subject to the delete cascade: the ordered list
    /// plus any legacy scalar, deduplicated.
    pub fn cascade_attachment_ids(&self) -> Vec<Uuid> {
        let mut ids = self.attachment_ids.clone();
        if let Some(legacy) = self.legacy_attachment_id() {
            if !ids.contains(&legacy) {
                ids.push(legacy);
            }
        }
        ids
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.extra.get("agent_id").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_keys_survive_a_round_trip() {
        let raw = json!({
            "attachment_ids": ["6f2a1c8e-3a70-4a3e-9c2f-6a5a3f2b1d00"],
            "source_app": "engram",
            "project": "atlas",
            "priority": 3
        });
        let meta = MemoryMetadata::from_value(raw.clone()).unwrap();
        assert_eq!(meta.extra.get("project"), Some(&json!("atlas")));
        assert_eq!(meta.extra.get("priority"), Some(&json!(3)));

        let back = meta.to_value();
        assert_eq!(back.get("project"), Some(&json!("atlas")));
        assert_eq!(
            back.get("attachment_ids").and_then(Value::as_array).map(Vec::len),
            Some(1)
        );
    }

    #[test]
    fn push_attachment_deduplicates_in_first_seen_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut meta = MemoryMetadata::default();
        assert!(meta.push_attachment(a));
        assert!(meta.push_attachment(b));
        assert!(!meta.push_attachment(a));
        assert_eq!(meta.attachment_ids, vec![a, b]);
    }

    #[test]
    fn set_attachments_preserves_order_while_deduplicating() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut meta = MemoryMetadata::default();
        meta.set_attachments(vec![b, a, b, a]);
        assert_eq!(meta.attachment_ids, vec![b, a]);
    }

    #[test]
    fn cascade_includes_the_legacy_scalar_id() {
        let a = Uuid::new_v4();
        let legacy = Uuid::new_v4();
        let mut meta = MemoryMetadata::default();
        meta.push_attachment(a);
        meta.extra
            .insert("attachment_id".to_string(), json!(legacy.to_string()));
        assert_eq!(meta.cascade_attachment_ids(), vec![a, legacy]);
    }

    #[test]
    fn empty_metadata_serializes_to_an_empty_object() {
        let meta = MemoryMetadata::default();
        assert_eq!(meta.to_value(), json!({}));
    }
}
