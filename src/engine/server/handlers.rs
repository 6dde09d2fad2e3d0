// The handler set shared by both transports. Hook-facing methods follow
// the contract exactly; UI/CLI methods (swarm and mission CRUD, emotion,
// knowledge graph, dashboard) are HTTP-first but dispatch identically.

use crate::atoms::constants::{PRIORITY_HIGH, PRIORITY_NORMAL, SESSION_GC_HOURS};
use crate::atoms::error::{DaemonError, DaemonResult};
use crate::atoms::types::{
    AgentDependency, AgentStatus, BlockType, ContextMode, Conversation, ConversationBlock,
    Mission, Swarm, SwarmAgent, SwarmStatus,
};
use crate::engine::context::ContextRequest;
use crate::engine::events::EngineEvent;
use crate::engine::queue;
use crate::engine::state::DaemonState;
use crate::engine::store::NewTask;
use crate::engine::{ambient, missions, swarm};
use log::info;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;

pub async fn handle(state: &Arc<DaemonState>, method: &str, params: &Value) -> DaemonResult<Value> {
    match method {
        // ── Hook contract ──────────────────────────────────────────────
        "get_context" => get_context(state, params).await,
        "build_session_start" => build_session_start(state, params).await,
        "enqueue_task" => enqueue_task(state, params),
        "end_session" => end_session(state, params),
        "log_subagent_start" => log_subagent_start(state, params),
        "capture_claude_response" => capture_claude_response(state, params),

        // ── Swarms ─────────────────────────────────────────────────────
        "swarm_create" => swarm_create(state, params),
        "swarm_start" => swarm_start(state, params),
        "swarm_get" => swarm_get(state, params),
        "swarm_list" => swarm_list(state),
        "swarm_cancel" => swarm_cancel(state, params),
        "swarm_merge" => swarm_merge(state, params).await,
        "swarm_post_message" => swarm_post_message(state, params),

        // ── Missions ───────────────────────────────────────────────────
        "mission_create" => mission_create(state, params),
        "mission_list" => mission_list(state),
        "mission_delete" => mission_delete(state, params),
        "mission_set_enabled" => mission_set_enabled(state, params),
        "mission_trigger" => mission_trigger(state, params),
        "mission_executions" => mission_executions(state, params),

        // ── Ambient / emotion / knowledge / dashboard ──────────────────
        "ambient_status" => ambient_status(state),
        "exploration_batch" => exploration_batch(state, params),
        "ambient_enable" => ambient_enable(state, params),
        "ambient_ack" => ambient_ack(state),
        "add_curiosity" => add_curiosity(state, params),
        "emotion_get" => emotion_get(state),
        "emotion_set" => emotion_set(state, params),
        "kg_query" => kg_query(state, params),
        "dashboard" => dashboard(state),
        "health" => Ok(json!({"ok": true, "version": env!("CARGO_PKG_VERSION")})),

        other => Err(DaemonError::Validation(format!("unknown method '{other}'"))),
    }
}

// ── Param helpers ──────────────────────────────────────────────────────────

fn require_i64(params: &Value, key: &str) -> DaemonResult<i64> {
    params[key]
        .as_i64()
        .ok_or_else(|| DaemonError::Validation(format!("'{key}' is required")))
}

fn require_str<'a>(params: &'a Value, key: &str) -> DaemonResult<&'a str> {
    params[key]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DaemonError::Validation(format!("'{key}' is required")))
}

fn opt_str(params: &Value, key: &str) -> Option<String> {
    params[key]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn str_vec(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

// ── Hook contract ──────────────────────────────────────────────────────────

/// The per-prompt hook: records the user conversation, queues its
/// embedding, and assembles the additional-context string.
async fn get_context(state: &Arc<DaemonState>, params: &Value) -> DaemonResult<Value> {
    let session_id = require_i64(params, "session_id")?;
    let prompt = require_str(params, "prompt")?.to_string();
    let mode = params["mode"]
        .as_str()
        .map(ContextMode::from_str)
        .transpose()
        .map_err(DaemonError::Validation)?
        .unwrap_or_default();
    let personality = opt_str(params, "personality");
    let project_path = opt_str(params, "project_path");

    if state.store.get_session(session_id)?.is_none() {
        return Err(DaemonError::Validation(format!("no session {session_id}")));
    }
    state.store.touch_session(session_id)?;

    // Record the prompt as a conversation unless a hook retry already did.
    let already_recorded = state
        .store
        .conversations_for_session(session_id)?
        .last()
        .map(|c| c.message_type == "user" && c.prompt == prompt)
        .unwrap_or(false);
    if !already_recorded {
        let conversation = Conversation {
            id: 0,
            session_id,
            message_type: "user".into(),
            prompt: prompt.clone(),
            personality: personality.clone(),
            medium: "cli".into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            first_token_ms: None,
            full_ms: None,
            thinking_ms: None,
            tool_uses: 0,
            tool_names: vec![],
        };
        let block = ConversationBlock {
            id: 0,
            conversation_id: 0,
            ordinal: 0,
            block_type: BlockType::Text,
            content: prompt.clone(),
            tool_use_id: None,
            tool_name: None,
            tool_input: None,
            is_error: false,
            content_embedding: None,
        };
        let conversation_id = state.store.add_conversation(&conversation, &[block])?;
        queue::enqueue(
            state,
            "embedding",
            Some(&state.config.embedding_model),
            &prompt,
            json!({"conversation_id": conversation_id}),
            PRIORITY_HIGH,
            Some(session_id),
        )?;
    }
    state.events.emit(EngineEvent::UserPrompt { session_id });

    let request = ContextRequest {
        session_id,
        prompt,
        mode,
        project_path,
        personality,
        max_tokens: params["max_tokens"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(crate::atoms::constants::CONTEXT_MAX_TOKENS),
    };
    let result = state.context.build(state, &request).await?;
    Ok(serde_json::to_value(&result)?)
}

/// Session-start hook: resolve (or create) the session and report
/// whether warm context is already cached for it.
async fn build_session_start(state: &Arc<DaemonState>, params: &Value) -> DaemonResult<Value> {
    let working_dir = opt_str(params, "working_dir");
    let medium = opt_str(params, "medium").unwrap_or_else(|| "cli".into());
    let personality = opt_str(params, "personality");

    let session_id = match params["session_id"].as_i64().filter(|id| *id > 0) {
        Some(id) if state.store.get_session(id)?.is_some() => {
            state.store.touch_session(id)?;
            id
        }
        _ => {
            state.store.gc_idle_sessions(SESSION_GC_HOURS)?;
            state.store.create_session(
                working_dir.as_deref(),
                personality.as_deref(),
                &medium,
                None,
                None,
            )?
        }
    };
    if let Some(cached) = state.context.peek_cache(session_id) {
        return Ok(json!({
            "status": "cached",
            "session_id": session_id,
            "context": cached.context,
        }));
    }
    Ok(json!({"status": "ready", "session_id": session_id}))
}

fn enqueue_task(state: &Arc<DaemonState>, params: &Value) -> DaemonResult<Value> {
    let task_type = require_str(params, "task_type")?;
    let content = params["content"].as_str().unwrap_or_default();
    let priority = queue::parse_priority(&params["priority"]);
    let task_id = queue::enqueue(
        state,
        task_type,
        params["model"].as_str(),
        content,
        params["metadata"].clone(),
        priority,
        params["session_id"].as_i64(),
    )?;
    Ok(json!({"task_id": task_id}))
}

fn end_session(state: &Arc<DaemonState>, params: &Value) -> DaemonResult<Value> {
    let session_id = require_i64(params, "session_id")?;
    let reason = params["reason"].as_str().unwrap_or("unspecified");
    info!("[server] Ending session {session_id} ({reason})");
    state.store.end_session(session_id)?;
    state.context.invalidate(session_id);

    if !state.config.disable_summary {
        state.store.enqueue_task(&NewTask {
            title: format!("Summarize session {session_id}"),
            description: String::new(),
            task_type: "summarization".into(),
            priority: PRIORITY_NORMAL,
            extra: json!({"session_id": session_id}),
            session_id: Some(session_id),
            ..Default::default()
        })?;
    }
    state.events.emit(EngineEvent::SessionEnded { session_id });
    Ok(json!({"ok": true}))
}

fn log_subagent_start(state: &Arc<DaemonState>, params: &Value) -> DaemonResult<Value> {
    let session_id = require_i64(params, "session_id")?;
    let subagent_type = params["subagent_type"].as_str().unwrap_or("unknown");
    let description = params["description"].as_str().unwrap_or_default();
    let conversation = Conversation {
        id: 0,
        session_id,
        message_type: "system".into(),
        prompt: format!("Subagent started: {subagent_type} — {description}"),
        personality: opt_str(params, "personality"),
        medium: "cli".into(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        first_token_ms: None,
        full_ms: None,
        thinking_ms: None,
        tool_uses: 0,
        tool_names: vec![],
    };
    state
        .store
        .add_conversation(&conversation, &[] as &[ConversationBlock])?;
    Ok(json!({"ok": true}))
}

/// Capture an assistant response: append the conversation, queue the
/// embedding, and queue entity extraction for longer responses.
fn capture_claude_response(state: &Arc<DaemonState>, params: &Value) -> DaemonResult<Value> {
    let session_id = require_i64(params, "session_id")?;
    let text = require_str(params, "response_text")?.to_string();

    let conversation = Conversation {
        id: 0,
        session_id,
        message_type: "assistant".into(),
        prompt: text.clone(),
        personality: opt_str(params, "personality"),
        medium: "cli".into(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        first_token_ms: params["first_token_ms"].as_i64(),
        full_ms: params["full_ms"].as_i64(),
        thinking_ms: params["thinking_ms"].as_i64(),
        tool_uses: params["tool_uses"].as_i64().unwrap_or(0),
        tool_names: str_vec(&params["tool_names"]),
    };
    let block = ConversationBlock {
        id: 0,
        conversation_id: 0,
        ordinal: 0,
        block_type: BlockType::Text,
        content: text.clone(),
        tool_use_id: None,
        tool_name: None,
        tool_input: None,
        is_error: false,
        content_embedding: None,
    };
    let conversation_id = state.store.add_conversation(&conversation, &[block])?;

    queue::enqueue(
        state,
        "embedding",
        Some(&state.config.embedding_model),
        &text,
        json!({"conversation_id": conversation_id}),
        PRIORITY_HIGH,
        Some(session_id),
    )?;
    if text.len() >= state.config.summarization_threshold {
        queue::enqueue(
            state,
            "entity_extraction",
            None,
            &text,
            json!({"conversation_id": conversation_id}),
            crate::atoms::constants::PRIORITY_LOW,
            Some(session_id),
        )?;
    }
    Ok(json!({"ok": true, "conversation_id": conversation_id}))
}

// ── Swarms ─────────────────────────────────────────────────────────────────

fn parse_agent(swarm_id: &str, value: &Value) -> DaemonResult<SwarmAgent> {
    let name = require_str(value, "name")?;
    let depends_on: Vec<AgentDependency> = value["depends_on"]
        .as_array()
        .map(|deps| serde_json::from_value(Value::Array(deps.clone())))
        .transpose()?
        .unwrap_or_default();
    Ok(SwarmAgent {
        id: format!("{swarm_id}-{name}"),
        swarm_id: swarm_id.to_string(),
        name: name.to_string(),
        role: value["role"].as_str().unwrap_or("worker").to_string(),
        is_synthesis_agent: value["is_synthesis_agent"].as_bool().unwrap_or(false),
        mode: opt_str(value, "mode"),
        prompt: value["prompt"].as_str().unwrap_or_default().to_string(),
        goal: opt_str(value, "goal"),
        capabilities: str_vec(&value["capabilities"]),
        task_types: str_vec(&value["task_types"]),
        max_tasks: value["max_tasks"].as_i64(),
        max_duration_seconds: value["max_duration_seconds"].as_i64(),
        idle_timeout_seconds: value["idle_timeout_seconds"].as_i64(),
        allowed_tools: str_vec(&value["allowed_tools"]),
        thinking_budget: value["thinking_budget"].as_i64(),
        model: opt_str(value, "model"),
        sandbox_mode: opt_str(value, "sandbox_mode"),
        depends_on,
        status: AgentStatus::Pending,
        output: None,
        output_summary: None,
        error: None,
        tool_count: 0,
        started_at: None,
        completed_at: None,
        session_id: None,
        git_branch: None,
    })
}

fn swarm_create(state: &Arc<DaemonState>, params: &Value) -> DaemonResult<Value> {
    let name = require_str(params, "name")?;
    let working_dir = require_str(params, "working_dir")?;
    let agent_values = params["agents"]
        .as_array()
        .ok_or_else(|| DaemonError::Validation("'agents' array is required".into()))?;
    if agent_values.is_empty() {
        return Err(DaemonError::Validation("swarm needs at least one agent".into()));
    }

    let swarm_id = uuid::Uuid::new_v4().to_string();
    let agents: Vec<SwarmAgent> = agent_values
        .iter()
        .map(|v| parse_agent(&swarm_id, v))
        .collect::<DaemonResult<_>>()?;
    // Rejected at validation time, before anything persists.
    swarm::validate_dependencies(&agents)?;

    let record = Swarm {
        id: swarm_id.clone(),
        name: name.to_string(),
        working_dir: working_dir.to_string(),
        base_branch: params["base_branch"].as_str().unwrap_or("main").to_string(),
        branch_prefix: opt_str(params, "branch_prefix"),
        status: SwarmStatus::Pending,
        auto_synthesize: params["auto_synthesize"].as_bool().unwrap_or(true),
        skip_synthesis_on_failure: params["skip_synthesis_on_failure"].as_bool().unwrap_or(true),
        synthesis_prompt: opt_str(params, "synthesis_prompt"),
        supervisor_warn_seconds: params["supervisor_warn_seconds"].as_i64(),
        supervisor_cancel_seconds: params["supervisor_cancel_seconds"].as_i64(),
        synthesis_output: None,
        synthesis_summary: None,
        created_at: chrono::Utc::now().to_rfc3339(),
        started_at: None,
        completed_at: None,
    };
    state.store.create_swarm(&record)?;
    for agent in &agents {
        state.store.add_swarm_agent(agent)?;
    }
    info!("[server] Created swarm '{name}' ({swarm_id}) with {} agents", agents.len());
    Ok(json!({"swarm_id": swarm_id}))
}

fn swarm_start(state: &Arc<DaemonState>, params: &Value) -> DaemonResult<Value> {
    let swarm_id = require_str(params, "swarm_id")?;
    swarm::start(state, swarm_id)?;
    Ok(json!({"ok": true, "swarm_id": swarm_id}))
}

fn swarm_get(state: &Arc<DaemonState>, params: &Value) -> DaemonResult<Value> {
    let swarm_id = require_str(params, "swarm_id")?;
    let swarm = state
        .store
        .get_swarm(swarm_id)?
        .ok_or_else(|| DaemonError::Validation(format!("no swarm {swarm_id}")))?;
    let agents = state.store.swarm_agents(swarm_id)?;
    Ok(json!({"swarm": swarm, "agents": agents}))
}

fn swarm_list(state: &Arc<DaemonState>) -> DaemonResult<Value> {
    Ok(json!({"swarms": state.store.list_swarms(50)?}))
}

fn swarm_cancel(state: &Arc<DaemonState>, params: &Value) -> DaemonResult<Value> {
    let swarm_id = require_str(params, "swarm_id")?;
    let cancelled = swarm::request_cancel(state, swarm_id);
    Ok(json!({"ok": cancelled}))
}

async fn swarm_merge(state: &Arc<DaemonState>, params: &Value) -> DaemonResult<Value> {
    let swarm_id = require_str(params, "swarm_id")?;
    let target = require_str(params, "target_branch")?;
    let (merged, conflict) = swarm::merge_branches(state, swarm_id, target).await?;
    Ok(json!({"merged": merged, "conflict": conflict}))
}

fn swarm_post_message(state: &Arc<DaemonState>, params: &Value) -> DaemonResult<Value> {
    let swarm_id = require_str(params, "swarm_id")?;
    let to = require_str(params, "to")?;
    let from = params["from"].as_str().unwrap_or("user");
    let text = require_str(params, "text")?;
    let priority = params["priority"].as_str().unwrap_or("normal");
    let key = swarm::agent::post_message(state, swarm_id, to, from, text, priority)?;
    Ok(json!({"key": key}))
}

// ── Missions ───────────────────────────────────────────────────────────────

fn mission_create(state: &Arc<DaemonState>, params: &Value) -> DaemonResult<Value> {
    let schedule = require_str(params, "schedule")?;
    let timezone = params["timezone"].as_str().unwrap_or("").to_string();
    missions::validate_schedule(schedule, &timezone)?;

    let mission = Mission {
        id: 0,
        name: require_str(params, "name")?.to_string(),
        schedule: schedule.to_string(),
        timezone,
        prompt: require_str(params, "prompt")?.to_string(),
        personality: opt_str(params, "personality"),
        allowed_tools: str_vec(&params["allowed_tools"]),
        model: opt_str(params, "model"),
        working_dir: opt_str(params, "working_dir"),
        sandbox_mode: opt_str(params, "sandbox_mode"),
        run_once: params["run_once"].as_bool().unwrap_or(false),
        enabled: params["enabled"].as_bool().unwrap_or(true),
        next_execution_at: missions::next_fire(
            schedule,
            params["timezone"].as_str().unwrap_or(""),
            chrono::Utc::now(),
        )
        .map(|d| d.to_rfc3339()),
        last_execution_at: None,
        created_at: String::new(),
    };
    let mission_id = state.store.create_mission(&mission)?;
    Ok(json!({"mission_id": mission_id}))
}

fn mission_list(state: &Arc<DaemonState>) -> DaemonResult<Value> {
    Ok(json!({"missions": state.store.list_missions()?}))
}

fn mission_delete(state: &Arc<DaemonState>, params: &Value) -> DaemonResult<Value> {
    state.store.delete_mission(require_i64(params, "mission_id")?)?;
    Ok(json!({"ok": true}))
}

fn mission_set_enabled(state: &Arc<DaemonState>, params: &Value) -> DaemonResult<Value> {
    let mission_id = require_i64(params, "mission_id")?;
    let enabled = params["enabled"].as_bool().unwrap_or(true);
    state.store.set_mission_enabled(mission_id, enabled)?;
    Ok(json!({"ok": true}))
}

fn mission_trigger(state: &Arc<DaemonState>, params: &Value) -> DaemonResult<Value> {
    let mission_id = require_i64(params, "mission_id")?;
    let execution_id = missions::trigger_now(state, mission_id)?;
    Ok(json!({"execution_id": execution_id}))
}

fn mission_executions(state: &Arc<DaemonState>, params: &Value) -> DaemonResult<Value> {
    let mission_id = require_i64(params, "mission_id")?;
    Ok(json!({"executions": state.store.mission_executions(mission_id, 20)?}))
}

// ── Ambient / emotion / knowledge / dashboard ──────────────────────────────

fn ambient_status(state: &Arc<DaemonState>) -> DaemonResult<Value> {
    Ok(serde_json::to_value(state.store.ambient_state()?)?)
}

/// Claim up to `count` backlog items and run them through the batch
/// exploration workflow in the background. The claim happens here, in
/// the starter, before the workflow begins.
fn exploration_batch(state: &Arc<DaemonState>, params: &Value) -> DaemonResult<Value> {
    let count = params["count"].as_u64().unwrap_or(3).min(10) as usize;
    let mut task_ids = Vec::new();
    for _ in 0..count {
        match state.store.claim_task(&["curiosity".to_string()])? {
            Some(task) => task_ids.push(task.id),
            None => break,
        }
    }
    if task_ids.is_empty() {
        return Ok(json!({"task_ids": [], "started": false}));
    }
    let state = state.clone();
    let ids = task_ids.clone();
    tokio::spawn(async move {
        if let Err(e) = crate::engine::workflow::exploration::explore_batch(&state, &ids).await {
            log::warn!("[server] Batch exploration failed: {e}");
        }
    });
    Ok(json!({"task_ids": task_ids, "started": true}))
}

fn ambient_enable(state: &Arc<DaemonState>, params: &Value) -> DaemonResult<Value> {
    let enabled = params["enabled"].as_bool().unwrap_or(true);
    let mut ambient = state.store.ambient_state()?;
    ambient.enabled = enabled;
    state.store.save_ambient_state(&ambient)?;
    Ok(json!({"ok": true, "enabled": enabled}))
}

fn ambient_ack(state: &Arc<DaemonState>) -> DaemonResult<Value> {
    state.events.emit(EngineEvent::NotificationAcknowledged);
    Ok(json!({"ok": true}))
}

fn add_curiosity(state: &Arc<DaemonState>, params: &Value) -> DaemonResult<Value> {
    let topic = require_str(params, "topic")?;
    let task_id = ambient::backlog::enqueue_curiosity(
        state,
        topic,
        params["description"].as_str().unwrap_or_default(),
        params["factors"].clone(),
        params["session_id"].as_i64(),
    )?;
    Ok(json!({"task_id": task_id}))
}

fn emotion_get(state: &Arc<DaemonState>) -> DaemonResult<Value> {
    let ambient = state.store.ambient_state()?;
    Ok(json!({"valence": ambient.valence, "arousal": ambient.arousal}))
}

fn emotion_set(state: &Arc<DaemonState>, params: &Value) -> DaemonResult<Value> {
    let mut ambient = state.store.ambient_state()?;
    if let Some(v) = params["valence"].as_f64() {
        ambient.valence = v.clamp(0.0, 1.0);
    }
    if let Some(a) = params["arousal"].as_f64() {
        ambient.arousal = a.clamp(0.0, 1.0);
    }
    state.store.save_ambient_state(&ambient)?;
    Ok(json!({"valence": ambient.valence, "arousal": ambient.arousal}))
}

fn kg_query(state: &Arc<DaemonState>, params: &Value) -> DaemonResult<Value> {
    let query = require_str(params, "query")?;
    let limit = params["limit"].as_u64().unwrap_or(20) as usize;
    Ok(json!({"entities": state.store.query_entities(query, limit)?}))
}

fn dashboard(state: &Arc<DaemonState>) -> DaemonResult<Value> {
    Ok(json!({
        "ambient": state.store.ambient_state()?,
        "task_counts": state.store.task_counts()?,
        "recent_sessions": state.store.recent_sessions(10)?,
        "swarms": state.store.list_swarms(10)?,
        "recent_findings": state.store.recent_findings(10)?,
    }))
}
