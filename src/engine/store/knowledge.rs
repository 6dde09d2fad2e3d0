// Knowledge-graph entities: produced by the entity-extraction activity
// and by finding promotion; queried over HTTP. Upserts bump a mention
// counter rather than duplicating rows.

use super::{now_rfc3339, Store};
use crate::atoms::error::DaemonResult;
use crate::atoms::types::KnowledgeEntity;
use rusqlite::params;

impl KnowledgeEntity {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(KnowledgeEntity {
            id: row.get(0)?,
            name: row.get(1)?,
            kind: row.get(2)?,
            summary: row.get(3)?,
            source_finding_id: row.get(4)?,
            mention_count: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }
}

const ENTITY_COLS: &str =
    "id, name, kind, summary, source_finding_id, mention_count, created_at, updated_at";

impl Store {
    /// Insert a new entity or bump the mention count of an existing one.
    pub fn upsert_entity(
        &self,
        name: &str,
        kind: &str,
        summary: &str,
        source_finding_id: Option<i64>,
    ) -> DaemonResult<i64> {
        let conn = self.conn.lock();
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO knowledge_entities
                 (name, kind, summary, source_finding_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT (name, kind) DO UPDATE SET
                 mention_count = mention_count + 1,
                 summary = CASE WHEN excluded.summary != '' THEN excluded.summary ELSE summary END,
                 updated_at = excluded.updated_at",
            params![name, kind, summary, source_finding_id, now],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM knowledge_entities WHERE name = ?1 AND kind = ?2",
            params![name, kind],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    /// Substring search over entity names, most-mentioned first.
    pub fn query_entities(&self, query: &str, limit: usize) -> DaemonResult<Vec<KnowledgeEntity>> {
        let conn = self.conn.lock();
        let pattern = format!("%{}%", query.to_lowercase());
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTITY_COLS} FROM knowledge_entities
             WHERE LOWER(name) LIKE ?1
             ORDER BY mention_count DESC, updated_at DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![pattern, limit as i64], KnowledgeEntity::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_bumps_mentions() {
        let store = Store::open_in_memory().unwrap();
        let a = store.upsert_entity("tokio", "library", "async runtime", None).unwrap();
        let b = store.upsert_entity("tokio", "library", "", None).unwrap();
        assert_eq!(a, b);
        let found = store.query_entities("tokio", 10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].mention_count, 2);
        assert_eq!(found[0].summary, "async runtime");
    }

    #[test]
    fn query_is_case_insensitive() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_entity("Monad", "concept", "", None).unwrap();
        assert_eq!(store.query_entities("monad", 10).unwrap().len(), 1);
    }
}
