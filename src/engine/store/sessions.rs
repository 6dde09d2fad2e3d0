// Sessions, conversations, and conversation blocks. Conversations are
// append-only; blocks are written in dense ordinal order inside one
// transaction so readers may assume {0..n-1} with no gaps.
//
// Text-block embeddings are stored as little-endian f32 BLOBs on the
// block row; the codec and the similarity scan live here so no other
// module ever touches the raw byte layout.

use super::{now_rfc3339, Store};
use crate::atoms::error::{DaemonError, DaemonResult};
use crate::atoms::types::{BlockType, Conversation, ConversationBlock, Session};
use rusqlite::params;
use std::str::FromStr;

/// Encode a block's embedding vector for BLOB storage.
fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode a stored BLOB back into the vector attached to a block.
fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity between a query vector and a stored BLOB, decoding
/// on the fly so the similarity scan never materializes candidate
/// vectors. Returns 0.0 on dimension mismatch or zero norm.
fn blob_cosine(query: &[f32], blob: &[u8]) -> f64 {
    if query.is_empty() || blob.len() != query.len() * 4 {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut query_norm = 0.0f64;
    let mut stored_norm = 0.0f64;
    for (q, chunk) in query.iter().zip(blob.chunks_exact(4)) {
        let s = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64;
        let q = *q as f64;
        dot += q * s;
        query_norm += q * q;
        stored_norm += s * s;
    }
    let denom = (query_norm * stored_norm).sqrt();
    if denom < 1e-12 {
        0.0
    } else {
        dot / denom
    }
}

impl Session {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Session {
            id: row.get(0)?,
            working_dir: row.get(1)?,
            personality: row.get(2)?,
            medium: row.get(3)?,
            created_at: row.get(4)?,
            last_activity: row.get(5)?,
            ended_at: row.get(6)?,
            mission_id: row.get(7)?,
            swarm_id: row.get(8)?,
        })
    }
}

const SESSION_COLS: &str = "id, working_dir, personality, medium, created_at, last_activity, \
                            ended_at, mission_id, swarm_id";

/// A conversation block matched by embedding similarity.
#[derive(Debug, Clone)]
pub struct SimilarBlock {
    pub session_id: i64,
    pub conversation_id: i64,
    pub content: String,
    pub similarity: f64,
}

impl Store {
    // ── Session CRUD ───────────────────────────────────────────────────

    /// Create a session; returns the new monotonic id.
    pub fn create_session(
        &self,
        working_dir: Option<&str>,
        personality: Option<&str>,
        medium: &str,
        mission_id: Option<i64>,
        swarm_id: Option<&str>,
    ) -> DaemonResult<i64> {
        let conn = self.conn.lock();
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO sessions (working_dir, personality, medium, created_at, last_activity,
                                   mission_id, swarm_id)
             VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6)",
            params![working_dir, personality, medium, now, mission_id, swarm_id],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_session(&self, id: i64) -> DaemonResult<Option<Session>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {SESSION_COLS} FROM sessions WHERE id = ?1"))?;
        let session = stmt
            .query_map(params![id], Session::from_row)?
            .filter_map(|r| r.ok())
            .next();
        Ok(session)
    }

    /// Bump `last_activity`; creates nothing.
    pub fn touch_session(&self, id: i64) -> DaemonResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sessions SET last_activity = ?2 WHERE id = ?1",
            params![id, now_rfc3339()],
        )?;
        Ok(())
    }

    /// Mark a session ended. Idempotent: an already-ended session keeps
    /// its original `ended_at`.
    pub fn end_session(&self, id: i64) -> DaemonResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sessions SET ended_at = COALESCE(ended_at, ?2) WHERE id = ?1",
            params![id, now_rfc3339()],
        )?;
        Ok(())
    }

    /// Garbage-collect sessions idle longer than `hours`. Returns how many
    /// were ended.
    pub fn gc_idle_sessions(&self, hours: i64) -> DaemonResult<usize> {
        let conn = self.conn.lock();
        let cutoff = (chrono::Utc::now() - chrono::Duration::hours(hours)).to_rfc3339();
        let count = conn.execute(
            "UPDATE sessions SET ended_at = ?1
             WHERE ended_at IS NULL AND last_activity < ?2",
            params![now_rfc3339(), cutoff],
        )?;
        Ok(count)
    }

    pub fn recent_sessions(&self, limit: usize) -> DaemonResult<Vec<Session>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLS} FROM sessions ORDER BY last_activity DESC LIMIT ?1"
        ))?;
        let sessions = stmt
            .query_map(params![limit as i64], Session::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(sessions)
    }

    // ── Conversations ──────────────────────────────────────────────────

    /// Append a conversation and its blocks in one transaction; block
    /// ordinals are assigned densely from 0 in input order.
    pub fn add_conversation(
        &self,
        conversation: &Conversation,
        blocks: &[ConversationBlock],
    ) -> DaemonResult<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO conversations (session_id, message_type, prompt, personality, medium,
                                        timestamp, first_token_ms, full_ms, thinking_ms,
                                        tool_uses, tool_names)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                conversation.session_id,
                conversation.message_type,
                conversation.prompt,
                conversation.personality,
                conversation.medium,
                conversation.timestamp,
                conversation.first_token_ms,
                conversation.full_ms,
                conversation.thinking_ms,
                conversation.tool_uses,
                serde_json::to_string(&conversation.tool_names)?,
            ],
        )?;
        let conversation_id = tx.last_insert_rowid();
        for (ordinal, block) in blocks.iter().enumerate() {
            tx.execute(
                "INSERT INTO conversation_blocks
                     (conversation_id, ordinal, block_type, content,
                      tool_use_id, tool_name, tool_input, is_error, content_embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    conversation_id,
                    ordinal as i64,
                    block.block_type.as_str(),
                    block.content,
                    block.tool_use_id,
                    block.tool_name,
                    block.tool_input,
                    block.is_error as i64,
                    block.content_embedding.as_deref().map(encode_embedding),
                ],
            )?;
        }
        tx.execute(
            "UPDATE sessions SET last_activity = ?2 WHERE id = ?1",
            params![conversation.session_id, conversation.timestamp],
        )?;
        tx.commit()?;
        Ok(conversation_id)
    }

    pub fn conversations_for_session(&self, session_id: i64) -> DaemonResult<Vec<Conversation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, message_type, prompt, personality, medium, timestamp,
                    first_token_ms, full_ms, thinking_ms, tool_uses, tool_names
             FROM conversations WHERE session_id = ?1 ORDER BY timestamp",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                let names: String = row.get(11)?;
                Ok(Conversation {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    message_type: row.get(2)?,
                    prompt: row.get(3)?,
                    personality: row.get(4)?,
                    medium: row.get(5)?,
                    timestamp: row.get(6)?,
                    first_token_ms: row.get(7)?,
                    full_ms: row.get(8)?,
                    thinking_ms: row.get(9)?,
                    tool_uses: row.get(10)?,
                    tool_names: serde_json::from_str(&names).unwrap_or_default(),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn conversation_blocks(&self, conversation_id: i64) -> DaemonResult<Vec<ConversationBlock>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, ordinal, block_type, content,
                    tool_use_id, tool_name, tool_input, is_error, content_embedding
             FROM conversation_blocks WHERE conversation_id = ?1 ORDER BY ordinal",
        )?;
        let rows = stmt
            .query_map(params![conversation_id], |row| {
                let kind: String = row.get(3)?;
                let blob: Option<Vec<u8>> = row.get(9)?;
                Ok(ConversationBlock {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    ordinal: row.get(2)?,
                    block_type: BlockType::from_str(&kind).unwrap_or(BlockType::Text),
                    content: row.get(4)?,
                    tool_use_id: row.get(5)?,
                    tool_name: row.get(6)?,
                    tool_input: row.get(7)?,
                    is_error: row.get::<_, i64>(8)? != 0,
                    content_embedding: blob.map(|b| decode_embedding(&b)),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Attach an embedding vector to a text block.
    pub fn set_block_embedding(&self, block_id: i64, embedding: &[f32]) -> DaemonResult<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE conversation_blocks SET content_embedding = ?2 WHERE id = ?1",
            params![block_id, encode_embedding(embedding)],
        )?;
        if updated == 0 {
            return Err(DaemonError::Validation(format!(
                "no conversation block with id {block_id}"
            )));
        }
        Ok(())
    }

    /// Text blocks of a conversation still lacking an embedding vector.
    pub fn text_block_ids_without_embedding(&self, conversation_id: i64) -> DaemonResult<Vec<(i64, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, content FROM conversation_blocks
             WHERE conversation_id = ?1 AND block_type = 'text' AND content_embedding IS NULL
             ORDER BY ordinal",
        )?;
        let rows = stmt
            .query_map(params![conversation_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Top-k text blocks by cosine similarity against `query`, excluding
    /// the given session and anything below `threshold`. Candidate set is
    /// the embedded text blocks (partial index); similarity runs in-process.
    pub fn search_similar_blocks(
        &self,
        query: &[f32],
        k: usize,
        threshold: f64,
        exclude_session: i64,
    ) -> DaemonResult<Vec<SimilarBlock>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT c.session_id, b.conversation_id, b.content, b.content_embedding
             FROM conversation_blocks b
             JOIN conversations c ON c.id = b.conversation_id
             WHERE b.block_type = 'text' AND b.content_embedding IS NOT NULL
               AND c.session_id != ?1",
        )?;
        let mut scored: Vec<SimilarBlock> = stmt
            .query_map(params![exclude_session], |row| {
                let blob: Vec<u8> = row.get(3)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    blob,
                ))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(session_id, conversation_id, content, blob)| {
                let similarity = blob_cosine(query, &blob);
                (similarity >= threshold).then_some(SimilarBlock {
                    session_id,
                    conversation_id,
                    content,
                    similarity,
                })
            })
            .collect();
        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);
        Ok(scored)
    }

    /// Timestamp of the most recent user prompt over interactive media.
    pub fn last_user_activity(&self) -> DaemonResult<Option<String>> {
        let conn = self.conn.lock();
        let ts: Option<String> = conn.query_row(
            "SELECT MAX(timestamp) FROM conversations
             WHERE message_type = 'user' AND medium IN ('cli', 'ui')",
            [],
            |r| r.get(0),
        )?;
        Ok(ts)
    }
}
