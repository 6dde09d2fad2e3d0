// Session summaries: one per session, produced after the session ends or
// crosses a size threshold. The context builder pulls these by working
// directory and by shared tags.

use super::{now_rfc3339, Store};
use crate::atoms::error::DaemonResult;
use crate::atoms::types::SessionSummary;
use rusqlite::params;

impl SessionSummary {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let ids: String = row.get(3)?;
        Ok(SessionSummary {
            id: row.get(0)?,
            session_id: row.get(1)?,
            summary: row.get(2)?,
            source_conversation_ids: serde_json::from_str(&ids).unwrap_or_default(),
            created_at: row.get(4)?,
        })
    }
}

const SUMMARY_COLS: &str = "id, session_id, summary, source_conversation_ids, created_at";
const SUMMARY_COLS_QUALIFIED: &str =
    "ss.id, ss.session_id, ss.summary, ss.source_conversation_ids, ss.created_at";

impl Store {
    /// Store (or replace) the summary for a session.
    pub fn upsert_session_summary(
        &self,
        session_id: i64,
        summary: &str,
        source_conversation_ids: &[i64],
    ) -> DaemonResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM session_summaries WHERE session_id = ?1",
            params![session_id],
        )?;
        conn.execute(
            "INSERT INTO session_summaries (session_id, summary, source_conversation_ids, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                session_id,
                summary,
                serde_json::to_string(source_conversation_ids)?,
                now_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_session_summary(&self, session_id: i64) -> DaemonResult<Option<SessionSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SUMMARY_COLS} FROM session_summaries WHERE session_id = ?1"
        ))?;
        let result = stmt
            .query_map(params![session_id], SessionSummary::from_row)?
            .filter_map(|r| r.ok())
            .next();
        Ok(result)
    }

    /// Most recent summaries for sessions sharing `working_dir`, excluding
    /// the current session.
    pub fn recent_summaries_for_dir(
        &self,
        working_dir: &str,
        exclude_session: i64,
        limit: usize,
    ) -> DaemonResult<Vec<SessionSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SUMMARY_COLS_QUALIFIED} FROM session_summaries ss
             JOIN sessions s ON s.id = ss.session_id
             WHERE s.working_dir = ?1 AND ss.session_id != ?2
             ORDER BY ss.created_at DESC LIMIT ?3"
        ))?;
        let rows = stmt
            .query_map(
                params![working_dir, exclude_session, limit as i64],
                SessionSummary::from_row,
            )?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// One summary per session related to the current one: shares the
    /// personality tag or working directory, is not the session itself,
    /// and is not in `already_included`.
    pub fn related_session_summaries(
        &self,
        session_id: i64,
        working_dir: Option<&str>,
        personality: Option<&str>,
        already_included: &[i64],
        limit: usize,
    ) -> DaemonResult<Vec<SessionSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SUMMARY_COLS_QUALIFIED} FROM session_summaries ss
             JOIN sessions s ON s.id = ss.session_id
             WHERE ss.session_id != ?1
               AND ((?2 IS NOT NULL AND s.working_dir = ?2)
                 OR (?3 IS NOT NULL AND s.personality = ?3))
             ORDER BY ss.created_at DESC LIMIT ?4"
        ))?;
        let rows: Vec<SessionSummary> = stmt
            .query_map(
                params![session_id, working_dir, personality, (limit * 4) as i64],
                SessionSummary::from_row,
            )?
            .filter_map(|r| r.ok())
            .filter(|s| !already_included.contains(&s.session_id))
            .take(limit)
            .collect();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_summaries_scoped_to_dir() {
        let store = Store::open_in_memory().unwrap();
        let here = store
            .create_session(Some("/proj/a"), None, "cli", None, None)
            .unwrap();
        let sibling = store
            .create_session(Some("/proj/a"), None, "cli", None, None)
            .unwrap();
        let elsewhere = store
            .create_session(Some("/proj/b"), None, "cli", None, None)
            .unwrap();
        store.upsert_session_summary(sibling, "worked on parser", &[1]).unwrap();
        store.upsert_session_summary(elsewhere, "unrelated", &[2]).unwrap();

        let got = store.recent_summaries_for_dir("/proj/a", here, 3).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].session_id, sibling);
    }

    #[test]
    fn related_skips_already_included() {
        let store = Store::open_in_memory().unwrap();
        let current = store
            .create_session(Some("/p"), Some("tsun"), "cli", None, None)
            .unwrap();
        let a = store
            .create_session(Some("/p"), None, "cli", None, None)
            .unwrap();
        let b = store
            .create_session(None, Some("tsun"), "cli", None, None)
            .unwrap();
        store.upsert_session_summary(a, "a", &[]).unwrap();
        store.upsert_session_summary(b, "b", &[]).unwrap();

        let got = store
            .related_session_summaries(current, Some("/p"), Some("tsun"), &[a], 5)
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].session_id, b);
    }

    #[test]
    fn upsert_replaces() {
        let store = Store::open_in_memory().unwrap();
        let sid = store.create_session(None, None, "cli", None, None).unwrap();
        store.upsert_session_summary(sid, "first", &[]).unwrap();
        store.upsert_session_summary(sid, "second", &[]).unwrap();
        let got = store.get_session_summary(sid).unwrap().unwrap();
        assert_eq!(got.summary, "second");
    }
}
