use std::collections::HashSet;

use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{AccessRule, RuleEffect};
use crate::schema::fmt_ts;
use crate::users::parse_uuid;
use crate::MetadataStore;

/// Result of evaluating an app's memory rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AclDecision {
    /// No effective restriction: every memory is visible.
    Unconstrained,
    /// Everything is visible except the listed memory IDs.
    AllButDenied(HashSet<Uuid>),
    /// Only the listed memory IDs are visible (possibly empty).
    Subset(HashSet<Uuid>),
}

impl AclDecision {
    pub fn allows(&self, memory_id: Uuid) -> bool {
        match self {
            Self::Unconstrained => true,
            Self::AllButDenied(denied) => !denied.contains(&memory_id),
            Self::Subset(allowed) => allowed.contains(&memory_id),
        }
    }
}

/// Evaluate app-level rules over memories.
///
/// Rule precedence, in order:
/// 1. no rules at all → unconstrained (permissive default)
/// 2. a deny rule with no object → nothing is visible
/// 3. an allow rule with no object → everything except specific denies
/// 4. specific allows → whitelist minus specific denies
/// 5. only specific denies → nothing is visible
pub fn evaluate(rules: &[AccessRule]) -> AclDecision {
    if rules.is_empty() {
        return AclDecision::Unconstrained;
    }

    let mut allow_all = false;
    let mut allowed: HashSet<Uuid> = HashSet::new();
    let mut denied: HashSet<Uuid> = HashSet::new();

    for rule in rules {
        match (rule.effect, rule.object_id) {
            (RuleEffect::Deny, None) => return AclDecision::Subset(HashSet::new()),
            (RuleEffect::Deny, Some(id)) => {
                denied.insert(id);
            }
            (RuleEffect::Allow, None) => allow_all = true,
            (RuleEffect::Allow, Some(id)) => {
                allowed.insert(id);
            }
        }
    }

    if allow_all {
        if denied.is_empty() {
            return AclDecision::Unconstrained;
        }
        return AclDecision::AllButDenied(denied);
    }

    allowed.retain(|id| !denied.contains(id));
    AclDecision::Subset(allowed)
}

impl MetadataStore {
    pub async fn app_memory_rules(&self, app_id: Uuid) -> Result<Vec<AccessRule>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, subject_type, subject_id, object_type, object_id, effect
             FROM access_controls
             WHERE subject_type = 'app' AND subject_id = ? AND object_type = 'memory'",
        )
        .bind(app_id.to_string())
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                let subject_id: String = row.try_get("subject_id")?;
                let object_id: Option<String> = row.try_get("object_id")?;
                let effect: String = row.try_get("effect")?;
                Ok(AccessRule {
                    id: parse_uuid(&id)?,
                    subject_type: row.try_get("subject_type")?,
                    subject_id: parse_uuid(&subject_id)?,
                    object_type: row.try_get("object_type")?,
                    object_id: object_id.as_deref().map(parse_uuid).transpose()?,
                    effect: match effect.as_str() {
                        "allow" => RuleEffect::Allow,
                        "deny" => RuleEffect::Deny,
                        other => {
                            return Err(StoreError::bad_request(format!(
                                "unknown rule effect: {other}"
                            )));
                        }
                    },
                })
            })
            .collect()
    }

    /// Bulk form of the evaluator: resolve the app's rules once and return
    /// the decision callers apply over candidate ID lists.
    pub async fn accessible_memory_ids(&self, app_id: Uuid) -> Result<AclDecision, StoreError> {
        Ok(evaluate(&self.app_memory_rules(app_id).await?))
    }

    pub async fn check_memory_access(
        &self,
        app_id: Uuid,
        memory_id: Uuid,
    ) -> Result<bool, StoreError> {
        Ok(self.accessible_memory_ids(app_id).await?.allows(memory_id))
    }

    pub async fn add_access_rule(
        &self,
        app_id: Uuid,
        object_id: Option<Uuid>,
        effect: RuleEffect,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO access_controls
                 (id, subject_type, subject_id, object_type, object_id, effect, created_at)
             VALUES (?, 'app', ?, 'memory', ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(app_id.to_string())
        .bind(object_id.map(|id| id.to_string()))
        .bind(match effect {
            RuleEffect::Allow => "allow",
            RuleEffect::Deny => "deny",
        })
        .bind(fmt_ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
