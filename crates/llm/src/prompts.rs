use serde_json::json;
use uuid::Uuid;

use crate::NeighborMemory;

/// Built-in fact-extraction prompt.  Overridden per deployment through the
/// persisted `custom_instructions` setting.
pub const DEFAULT_FACT_EXTRACTION_PROMPT: &str = "\
You are a memory extraction system. Read the user's message and distill it \
into short, atomic, self-contained facts worth remembering long-term: \
preferences, biographical details, plans, relationships, and durable \
context. Ignore greetings, questions, and transient chatter.

Respond with JSON only, in this exact shape:
{\"facts\": [{\"text\": \"<one atomic fact>\", \"categories\": [\"<optional tag>\"]}]}

Return {\"facts\": []} when the message contains nothing worth remembering.";

/// Built-in merge-decision prompt.  Overridden per deployment through the
/// persisted `custom_update_memory_prompt` setting.
pub const DEFAULT_MERGE_PROMPT: &str = "\
You are a memory reconciliation system. You receive one candidate fact and \
a list of existing memories retrieved by semantic similarity. Decide, for \
the candidate, how the memory store should change. Emit an ordered list of \
events:

- ADD: the candidate is new information; no id.
- UPDATE: an existing memory should be rewritten to absorb the candidate. \
Carry that memory's id, the new text, and attachment_ids: the merged list \
of attachment UUIDs the surviving memory should reference. Always keep the \
candidate's own attachments in the merged list.
- DELETE: an existing memory is contradicted or obsoleted; carry its id.
- NONE: the candidate duplicates an existing memory; no change.

Respond with JSON only, in this exact shape:
{\"events\": [{\"event\": \"ADD|UPDATE|DELETE|NONE\", \"id\": \"<uuid or omit>\", \
\"text\": \"<memory text>\", \"attachment_ids\": [\"<uuid>\"]}]}";

/// Render the user-turn input document for a merge decision.
pub fn merge_decision_input(
    fact: &str,
    fact_attachment_ids: &[Uuid],
    neighbors: &[NeighborMemory],
) -> String {
    json!({
        "candidate": {
            "text": fact,
            "attachment_ids": fact_attachment_ids,
        },
        "existing_memories": neighbors,
    })
    .to_string()
}
