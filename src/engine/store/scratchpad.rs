// Swarm-scoped scratchpad: a key/value store with hierarchical paths and
// prefix scans. Agent mailboxes live under `messages/to-<name>/<uuid>`;
// operations under one prefix are linearizable because every mutation
// holds the connection lock.

use super::{now_rfc3339, Store};
use crate::atoms::error::DaemonResult;
use crate::atoms::types::ScratchpadEntry;
use rusqlite::params;

impl ScratchpadEntry {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let value: String = row.get(2)?;
        Ok(ScratchpadEntry {
            swarm_id: row.get(0)?,
            key: row.get(1)?,
            value: serde_json::from_str(&value).unwrap_or(serde_json::Value::Null),
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }
}

impl Store {
    pub fn scratchpad_put(
        &self,
        swarm_id: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> DaemonResult<()> {
        let conn = self.conn.lock();
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO swarm_scratchpad (swarm_id, key, value, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT (swarm_id, key) DO UPDATE SET
                 value = excluded.value, updated_at = excluded.updated_at",
            params![swarm_id, key, serde_json::to_string(value)?, now],
        )?;
        Ok(())
    }

    pub fn scratchpad_get(
        &self,
        swarm_id: &str,
        key: &str,
    ) -> DaemonResult<Option<ScratchpadEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT swarm_id, key, value, created_at, updated_at
             FROM swarm_scratchpad WHERE swarm_id = ?1 AND key = ?2",
        )?;
        let result = stmt
            .query_map(params![swarm_id, key], ScratchpadEntry::from_row)?
            .filter_map(|r| r.ok())
            .next();
        Ok(result)
    }

    /// All entries whose key starts with `prefix`, oldest first.
    pub fn scratchpad_scan(
        &self,
        swarm_id: &str,
        prefix: &str,
    ) -> DaemonResult<Vec<ScratchpadEntry>> {
        let conn = self.conn.lock();
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let mut stmt = conn.prepare(
            "SELECT swarm_id, key, value, created_at, updated_at
             FROM swarm_scratchpad
             WHERE swarm_id = ?1 AND key LIKE ?2 ESCAPE '\\'
             ORDER BY created_at, key",
        )?;
        let rows = stmt
            .query_map(params![swarm_id, pattern], ScratchpadEntry::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn scratchpad_delete(&self, swarm_id: &str, key: &str) -> DaemonResult<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM swarm_scratchpad WHERE swarm_id = ?1 AND key = ?2",
            params![swarm_id, key],
        )?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::fixtures::test_swarm;

    #[test]
    fn prefix_scan_and_delete() {
        let store = Store::open_in_memory().unwrap();
        store.create_swarm(&test_swarm("s1")).unwrap();
        store
            .scratchpad_put("s1", "messages/to-bob/m1", &serde_json::json!({"from": "alice"}))
            .unwrap();
        store
            .scratchpad_put("s1", "messages/to-bob/m2", &serde_json::json!({"from": "carol"}))
            .unwrap();
        store
            .scratchpad_put("s1", "notes/design", &serde_json::json!("keep it simple"))
            .unwrap();

        let mailbox = store.scratchpad_scan("s1", "messages/to-bob/").unwrap();
        assert_eq!(mailbox.len(), 2);

        assert!(store.scratchpad_delete("s1", "messages/to-bob/m1").unwrap());
        assert!(!store.scratchpad_delete("s1", "messages/to-bob/m1").unwrap());
        assert_eq!(store.scratchpad_scan("s1", "messages/to-bob/").unwrap().len(), 1);
        // Other prefixes untouched
        assert!(store.scratchpad_get("s1", "notes/design").unwrap().is_some());
    }

    #[test]
    fn put_overwrites() {
        let store = Store::open_in_memory().unwrap();
        store.create_swarm(&test_swarm("s2")).unwrap();
        store.scratchpad_put("s2", "notes/x", &serde_json::json!(1)).unwrap();
        store.scratchpad_put("s2", "notes/x", &serde_json::json!(2)).unwrap();
        let entry = store.scratchpad_get("s2", "notes/x").unwrap().unwrap();
        assert_eq!(entry.value, serde_json::json!(2));
    }
}
