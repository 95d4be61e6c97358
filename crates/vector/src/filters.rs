use chrono::DateTime;
use serde_json::{json, Value};

use crate::error::VectorError;

/// Payload keys stored at the top level of every point; everything else
/// lives under the nested `metadata` object.
const TOP_LEVEL_KEYS: &[&str] = &["data", "hash", "user_id", "created_at", "updated_at"];

/// Keys whose range bounds are datetime-valued and get normalized to unix
/// seconds at the boundary.
const DATETIME_KEYS: &[&str] = &["created_at", "updated_at"];

#[derive(Debug, Clone, PartialEq)]
pub enum FilterCondition {
    Eq { key: String, value: Value },
    In { key: String, values: Vec<Value> },
    Range { key: String, gte: Option<i64>, lte: Option<i64> },
}

/// Conjunction of payload conditions applied to a vector search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilters {
    conditions: Vec<FilterCondition>,
}

impl SearchFilters {
    /// The baseline scope every search carries: the owning user.
    pub fn for_user(user_id: &str) -> Self {
        let mut filters = Self::default();
        filters.push_eq("user_id", json!(user_id));
        filters
    }

    pub fn push_eq(&mut self, key: &str, value: Value) {
        self.conditions.push(FilterCondition::Eq { key: key.to_string(), value });
    }

    pub fn push_in(&mut self, key: &str, values: Vec<Value>) {
        self.conditions.push(FilterCondition::In { key: key.to_string(), values });
    }

    pub fn push_range(&mut self, key: &str, gte: Option<i64>, lte: Option<i64>) {
        self.conditions.push(FilterCondition::Range { key: key.to_string(), gte, lte });
    }

    /// Fold caller-supplied filters into the conjunction.
    ///
    /// Accepted shapes per key: a scalar (equality), an array (`in`), or an
    /// object with `gte`/`lte` bounds.  Bounds on datetime keys accept unix
    /// seconds or ISO-8601 strings.
    pub fn extend_from_json(&mut self, raw: &Value) -> Result<(), VectorError> {
        let Some(object) = raw.as_object() else {
            return Err(VectorError::Filter("filters must be a JSON object".to_string()));
        };
        for (key, value) in object {
            match value {
                Value::Object(bounds) => {
                    let gte = bounds.get("gte").map(|b| parse_bound(key, b)).transpose()?;
                    let lte = bounds.get("lte").map(|b| parse_bound(key, b)).transpose()?;
                    if gte.is_none() && lte.is_none() {
                        return Err(VectorError::Filter(format!(
                            "range filter on {key:?} needs gte and/or lte"
                        )));
                    }
                    self.push_range(key, gte, lte);
                }
                Value::Array(values) => self.push_in(key, values.clone()),
                scalar => self.push_eq(key, scalar.clone()),
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn conditions(&self) -> &[FilterCondition] {
        &self.conditions
    }

    /// Render the conjunction as a Qdrant `filter` document.
    pub(crate) fn to_qdrant(&self) -> Value {
        let must: Vec<Value> = self
            .conditions
            .iter()
            .map(|condition| match condition {
                FilterCondition::Eq { key, value } => {
                    json!({"key": payload_key(key), "match": {"value": value}})
                }
                FilterCondition::In { key, values } => {
                    json!({"key": payload_key(key), "match": {"any": values}})
                }
                FilterCondition::Range { key, gte, lte } => {
                    let mut range = serde_json::Map::new();
                    if let Some(gte) = gte {
                        range.insert("gte".to_string(), json!(gte));
                    }
                    if let Some(lte) = lte {
                        range.insert("lte".to_string(), json!(lte));
                    }
                    json!({"key": payload_key(key), "range": Value::Object(range)})
                }
            })
            .collect();
        json!({ "must": must })
    }
}

/// Map a caller-facing key to its payload location.
fn payload_key(key: &str) -> String {
    if TOP_LEVEL_KEYS.contains(&key) {
        key.to_string()
    } else {
        format!("metadata.{key}")
    }
}

/// Normalize a range bound to unix seconds.  Datetime keys accept ISO-8601
/// strings; every range key accepts numbers.
fn parse_bound(key: &str, bound: &Value) -> Result<i64, VectorError> {
    if let Some(secs) = bound.as_i64() {
        return Ok(secs);
    }
    if let Some(secs) = bound.as_f64() {
        return Ok(secs as i64);
    }
    if let Some(raw) = bound.as_str() {
        if DATETIME_KEYS.contains(&key) || raw.contains('T') {
            return DateTime::parse_from_rfc3339(raw)
                .map(|ts| ts.timestamp())
                .map_err(|err| {
                    VectorError::Filter(format!("invalid datetime bound {raw:?} on {key:?}: {err}"))
                });
        }
        if let Ok(secs) = raw.parse::<i64>() {
            return Ok(secs);
        }
    }
    Err(VectorError::Filter(format!("unsupported range bound on {key:?}: {bound}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_scope_targets_the_top_level_key() {
        let filters = SearchFilters::for_user("alice");
        assert_eq!(
            filters.to_qdrant(),
            json!({"must": [{"key": "user_id", "match": {"value": "alice"}}]})
        );
    }

    #[test]
    fn metadata_keys_are_nested() {
        let mut filters = SearchFilters::default();
        filters.push_eq("agent_id", json!("coder"));
        assert_eq!(
            filters.to_qdrant(),
            json!({"must": [{"key": "metadata.agent_id", "match": {"value": "coder"}}]})
        );
    }

    #[test]
    fn iso_8601_bounds_normalize_to_unix_seconds() {
        let mut filters = SearchFilters::default();
        filters
            .extend_from_json(&json!({"created_at": {"gte": "2024-06-16T00:00:00Z"}}))
            .unwrap();
        assert_eq!(
            filters.to_qdrant(),
            json!({"must": [{"key": "created_at", "range": {"gte": 1718496000}}]})
        );
    }

    #[test]
    fn unix_second_bounds_pass_through() {
        let mut filters = SearchFilters::default();
        filters
            .extend_from_json(&json!({"updated_at": {"gte": 1718496000, "lte": 1718582400}}))
            .unwrap();
        assert_eq!(
            filters.to_qdrant(),
            json!({"must": [
                {"key": "updated_at", "range": {"gte": 1718496000, "lte": 1718582400}}
            ]})
        );
    }

    #[test]
    fn arrays_become_any_matches() {
        let mut filters = SearchFilters::default();
        filters.extend_from_json(&json!({"project": ["atlas", "zephyr"]})).unwrap();
        assert_eq!(
            filters.to_qdrant(),
            json!({"must": [{"key": "metadata.project", "match": {"any": ["atlas", "zephyr"]}}]})
        );
    }

    #[test]
    fn empty_range_object_is_rejected() {
        let mut filters = SearchFilters::default();
        assert!(filters.extend_from_json(&json!({"created_at": {}})).is_err());
    }

    #[test]
    fn non_object_filters_are_rejected() {
        let mut filters = SearchFilters::default();
        assert!(filters.extend_from_json(&json!(["not", "an", "object"])).is_err());
    }
}
