// Entity-extraction activity: low-priority background pass that pulls
// named entities out of captured text and upserts them into the
// knowledge graph. The model is asked for a strict JSON array; anything
// unparseable in the reply is tolerated and skipped.

use super::Activity;
use crate::atoms::error::DaemonResult;
use crate::atoms::types::TaskRecord;
use crate::engine::state::DaemonState;
use async_trait::async_trait;
use log::info;
use serde::Deserialize;
use std::sync::Arc;

pub struct EntityExtractionActivity;

#[derive(Debug, Deserialize)]
struct ExtractedEntity {
    name: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    summary: String,
}

/// Pull the first JSON array out of a model reply that may wrap it in
/// prose or code fences.
fn parse_entities(reply: &str) -> Vec<ExtractedEntity> {
    let start = match reply.find('[') {
        Some(i) => i,
        None => return vec![],
    };
    let end = match reply.rfind(']') {
        Some(i) if i > start => i,
        _ => return vec![],
    };
    serde_json::from_str::<Vec<ExtractedEntity>>(&reply[start..=end]).unwrap_or_default()
}

#[async_trait]
impl Activity for EntityExtractionActivity {
    fn task_type(&self) -> &'static str {
        "entity_extraction"
    }

    async fn execute(&self, state: &Arc<DaemonState>, task: &TaskRecord) -> DaemonResult<String> {
        let prompt = format!(
            "Extract the named entities (people, projects, libraries, concepts) from the text \
             below. Reply with ONLY a JSON array of objects with keys \"name\", \"kind\", \
             \"summary\".\n\nText:\n{}",
            task.description
        );
        let reply = state
            .llm
            .generate(&state.config.ambient_model, None, &prompt)
            .await?;

        let entities = parse_entities(&reply.text);
        let mut stored = 0usize;
        for entity in &entities {
            if entity.name.trim().is_empty() {
                continue;
            }
            let kind = if entity.kind.is_empty() { "concept" } else { &entity.kind };
            state
                .store
                .upsert_entity(entity.name.trim(), kind, entity.summary.trim(), None)?;
            stored += 1;
        }
        info!("[activity] Extracted {stored} entities from task {}", task.id);
        Ok(format!("extracted {stored} entities"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_json() {
        let reply = "Here you go:\n```json\n[{\"name\": \"tokio\", \"kind\": \"library\"}]\n```";
        let entities = parse_entities(reply);
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].name, "tokio");
        assert_eq!(entities[0].summary, "");
    }

    #[test]
    fn garbage_yields_empty() {
        assert!(parse_entities("no json here").is_empty());
        assert!(parse_entities("[not valid").is_empty());
    }
}
