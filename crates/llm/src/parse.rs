use serde_json::Value;

use crate::{EventKind, ExtractedFact, LlmError, MemoryEvent};

/// Models regularly wrap JSON answers in markdown fences despite being told
/// not to.  Strip one fence layer if present.
pub(crate) fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop an optional language tag on the fence line.
    let rest = match rest.split_once('\n') {
        Some((_, body)) => body,
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

pub(crate) fn parse_facts(raw: &str) -> Result<Vec<ExtractedFact>, LlmError> {
    let value: Value = serde_json::from_str(strip_code_fences(raw))
        .map_err(|err| LlmError::Malformed(format!("extraction output is not JSON: {err}")))?;
    let items = value
        .get("facts")
        .and_then(Value::as_array)
        .ok_or_else(|| LlmError::Malformed("extraction output has no \"facts\" list".to_string()))?;

    let mut facts = Vec::with_capacity(items.len());
    for item in items {
        match item {
            // Bare strings are accepted for robustness with smaller models.
            Value::String(text) => {
                if !text.trim().is_empty() {
                    facts.push(ExtractedFact { text: text.trim().to_string(), categories: Vec::new() });
                }
            }
            Value::Object(_) => {
                let fact: ExtractedFact = serde_json::from_value(item.clone())
                    .map_err(|err| LlmError::Malformed(format!("bad fact entry: {err}")))?;
                if !fact.text.trim().is_empty() {
                    facts.push(fact);
                }
            }
            other => {
                return Err(LlmError::Malformed(format!("unexpected fact entry: {other}")));
            }
        }
    }
    Ok(facts)
}

pub(crate) fn parse_events(raw: &str) -> Result<Vec<MemoryEvent>, LlmError> {
    let value: Value = serde_json::from_str(strip_code_fences(raw))
        .map_err(|err| LlmError::Malformed(format!("merge output is not JSON: {err}")))?;
    let items = value
        .get("events")
        .and_then(Value::as_array)
        .ok_or_else(|| LlmError::Malformed("merge output has no \"events\" list".to_string()))?;

    let mut events = Vec::with_capacity(items.len());
    for item in items {
        let event: MemoryEvent = serde_json::from_value(item.clone())
            .map_err(|err| LlmError::Malformed(format!("bad event entry: {err}")))?;
        // UPDATE and DELETE must name their target; ADD and NONE never do.
        match event.event {
            EventKind::Update | EventKind::Delete if event.id.is_none() => {
                return Err(LlmError::Malformed(format!(
                    "{:?} event without a target id",
                    event.event
                )));
            }
            _ => {}
        }
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_json_is_unwrapped() {
        let raw = "```json\n{\"facts\": [\"Lives in Berlin\"]}\n```";
        let facts = parse_facts(raw).unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].text, "Lives in Berlin");
    }

    #[test]
    fn object_facts_carry_categories() {
        let raw = r#"{"facts": [{"text": "Prefers espresso", "categories": ["food"]}]}"#;
        let facts = parse_facts(raw).unwrap();
        assert_eq!(facts[0].categories, vec!["food".to_string()]);
    }

    #[test]
    fn empty_fact_list_is_legitimate() {
        assert!(parse_facts(r#"{"facts": []}"#).unwrap().is_empty());
    }

    #[test]
    fn blank_facts_are_dropped() {
        let facts = parse_facts(r#"{"facts": ["  ", "Lives in Berlin"]}"#).unwrap();
        assert_eq!(facts.len(), 1);
    }

    #[test]
    fn non_json_output_is_malformed() {
        assert!(matches!(parse_facts("I could not comply"), Err(LlmError::Malformed(_))));
    }

    #[test]
    fn events_preserve_model_order() {
        let raw = r#"{"events": [
            {"event": "DELETE", "id": "0b52e2c6-55ee-4d56-9336-3b55ad06dbcf"},
            {"event": "ADD", "text": "Moved to Munich"}
        ]}"#;
        let events = parse_events(raw).unwrap();
        assert_eq!(events[0].event, EventKind::Delete);
        assert_eq!(events[1].event, EventKind::Add);
    }

    #[test]
    fn update_without_id_is_malformed() {
        let raw = r#"{"events": [{"event": "UPDATE", "text": "x"}]}"#;
        assert!(matches!(parse_events(raw), Err(LlmError::Malformed(_))));
    }

    #[test]
    fn update_carries_merged_attachment_ids() {
        let raw = r#"{"events": [{
            "event": "UPDATE",
            "id": "0b52e2c6-55ee-4d56-9336-3b55ad06dbcf",
            "text": "Lives in Berlin",
            "attachment_ids": ["7c9e6679-7425-40de-944b-e07fc1f90ae7"]
        }]}"#;
        let events = parse_events(raw).unwrap();
        assert_eq!(events[0].attachment_ids.as_ref().map(Vec::len), Some(1));
    }
}
