// Per-agent execution and the scratchpad mailbox. Each agent gets its own
// session, a prompt assembled from its own instructions, included
// upstream outputs, and any mail waiting at launch; mail arriving mid-run
// is observed by a poll loop and delivered in a follow-up round.

use crate::atoms::constants::{
    ACTIVITY_TIMEOUT_SECS, MAILBOX_POLL_SECS, MAX_OUTPUT_SIZE, SUMMARY_THRESHOLD,
};
use crate::atoms::error::{DaemonError, DaemonResult};
use crate::atoms::types::{AgentStatus, MailboxMessage, Swarm, SwarmAgent};
use crate::engine::cancel::CancelToken;
use crate::engine::events::EngineEvent;
use crate::engine::state::DaemonState;
use log::{info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

// ── Mailbox ────────────────────────────────────────────────────────────────

fn mailbox_prefix(agent_name: &str) -> String {
    format!("messages/to-{agent_name}/")
}

/// Post a message to another agent's mailbox. Returns the scratchpad key.
pub fn post_message(
    state: &DaemonState,
    swarm_id: &str,
    to_agent: &str,
    from: &str,
    text: &str,
    priority: &str,
) -> DaemonResult<String> {
    let key = format!("{}{}", mailbox_prefix(to_agent), uuid::Uuid::new_v4());
    let message = MailboxMessage {
        from: from.to_string(),
        text: text.to_string(),
        priority: priority.to_string(),
    };
    state
        .store
        .scratchpad_put(swarm_id, &key, &serde_json::to_value(&message)?)?;
    Ok(key)
}

/// Read and delete everything in an agent's mailbox. Urgent messages are
/// surfaced first; within a priority, arrival order is preserved.
pub fn drain_mailbox(
    state: &DaemonState,
    swarm_id: &str,
    agent_name: &str,
) -> DaemonResult<Vec<MailboxMessage>> {
    let entries = state
        .store
        .scratchpad_scan(swarm_id, &mailbox_prefix(agent_name))?;
    let mut messages: Vec<MailboxMessage> = Vec::with_capacity(entries.len());
    for entry in entries {
        if let Ok(message) = serde_json::from_value::<MailboxMessage>(entry.value.clone()) {
            messages.push(message);
        }
        // Delivered messages are deleted on successful read.
        state.store.scratchpad_delete(swarm_id, &entry.key)?;
    }
    messages.sort_by_key(|m| m.priority != "urgent");
    Ok(messages)
}

// ── Output handling ────────────────────────────────────────────────────────

/// Truncate oversized output, keeping the head and tail with a marker in
/// the middle.
pub fn truncate_output(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let marker = "\n\n[… middle elided …]\n\n";
    let keep = max.saturating_sub(marker.len()) / 2;
    let mut head_end = keep;
    while head_end > 0 && !text.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = text.len() - keep;
    while tail_start < text.len() && !text.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    format!("{}{}{}", &text[..head_end], marker, &text[tail_start..])
}

// ── Prompt assembly ────────────────────────────────────────────────────────

/// Base agent prompt + included upstream outputs + mailbox messages.
pub fn build_agent_prompt(
    agent: &SwarmAgent,
    upstream: &[(String, String)],
    mailbox: &[MailboxMessage],
) -> String {
    let mut parts = vec![agent.prompt.clone()];
    if let Some(goal) = agent.goal.as_deref() {
        parts.push(format!("## Goal\n{goal}"));
    }
    if !upstream.is_empty() {
        let mut section = String::from("## Upstream results\n");
        for (name, output) in upstream {
            section.push_str(&format!("### {name}\n{output}\n"));
        }
        parts.push(section);
    }
    if !mailbox.is_empty() {
        let mut section = String::from("## Messages from other agents\n");
        for message in mailbox {
            let tag = if message.priority == "urgent" { " [URGENT]" } else { "" };
            section.push_str(&format!("- from {}{}: {}\n", message.from, tag, message.text));
        }
        parts.push(section);
    }
    parts.join("\n\n")
}

fn upstream_outputs(state: &DaemonState, agent: &SwarmAgent) -> Vec<(String, String)> {
    let Ok(peers) = state.store.swarm_agents(&agent.swarm_id) else {
        return vec![];
    };
    agent
        .depends_on
        .iter()
        .filter(|d| d.include)
        .filter_map(|d| {
            peers.iter().find(|p| p.name == d.agent).map(|p| {
                let text = p
                    .output_summary
                    .clone()
                    .or_else(|| p.output.clone())
                    .unwrap_or_default();
                (p.name.clone(), text)
            })
        })
        .collect()
}

// ── Agent execution ────────────────────────────────────────────────────────

/// Run one worker agent to a terminal state. Errors never propagate: a
/// failed agent records its error and the scheduler decides what that
/// means for the rest of the swarm.
pub async fn run_agent(
    state: &Arc<DaemonState>,
    swarm: &Swarm,
    agent: &SwarmAgent,
    cancel: &CancelToken,
) {
    if let Err(e) = state.store.set_agent_status(&agent.id, AgentStatus::Running) {
        warn!("[swarm] Could not mark '{}' running: {e}", agent.name);
        return;
    }
    state.events.emit(EngineEvent::SwarmAgentStatus {
        swarm_id: swarm.id.clone(),
        agent: agent.name.clone(),
        status: "running".into(),
    });

    // Per-agent session so the agent's activity is tracked like any other
    // conversation thread.
    match state.store.create_session(
        Some(&swarm.working_dir),
        None,
        "swarm",
        None,
        Some(&swarm.id),
    ) {
        Ok(session_id) => {
            let _ = state.store.set_agent_session(&agent.id, session_id);
        }
        Err(e) => warn!("[swarm] Session creation for '{}' failed: {e}", agent.name),
    }

    let outcome = execute(state, swarm, agent, cancel).await;
    let status = match outcome {
        Ok(()) => AgentStatus::Completed,
        Err(DaemonError::Cancelled(_)) => AgentStatus::Cancelled,
        Err(DaemonError::Timeout(ref msg)) => {
            let _ = state.store.set_agent_error(&agent.id, msg);
            AgentStatus::TimedOut
        }
        Err(ref e) => {
            let _ = state.store.set_agent_error(&agent.id, &e.to_string());
            AgentStatus::Failed
        }
    };
    if let Err(e) = state.store.set_agent_status(&agent.id, status) {
        warn!("[swarm] Could not finalize '{}': {e}", agent.name);
    }
    state.events.emit(EngineEvent::SwarmAgentStatus {
        swarm_id: swarm.id.clone(),
        agent: agent.name.clone(),
        status: status.as_str().to_string(),
    });
    info!("[swarm] Agent '{}' → {}", agent.name, status.as_str());
}

async fn execute(
    state: &Arc<DaemonState>,
    swarm: &Swarm,
    agent: &SwarmAgent,
    cancel: &CancelToken,
) -> DaemonResult<()> {
    let model = agent
        .model
        .clone()
        .unwrap_or_else(|| state.config.ambient_model.clone());
    let upstream = upstream_outputs(state, agent);
    let launch_mail = drain_mailbox(state, &swarm.id, &agent.name)?;
    let prompt = build_agent_prompt(agent, &upstream, &launch_mail);

    let budget = agent
        .max_duration_seconds
        .map(|s| s.max(1) as u64)
        .unwrap_or(ACTIVITY_TIMEOUT_SECS);

    // Poll the mailbox while the main call runs; anything that arrives is
    // delivered in a follow-up round.
    let mid_run_mail: Arc<Mutex<Vec<MailboxMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let poller = {
        let state = state.clone();
        let swarm_id = swarm.id.clone();
        let name = agent.name.clone();
        let sink = mid_run_mail.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(MAILBOX_POLL_SECS)).await;
                match drain_mailbox(&state, &swarm_id, &name) {
                    Ok(mail) if !mail.is_empty() => {
                        for message in &mail {
                            if message.priority == "urgent" {
                                info!(
                                    "[swarm] '{name}' received urgent mail from {}",
                                    message.from
                                );
                            }
                        }
                        sink.lock().extend(mail);
                    }
                    _ => {}
                }
            }
        })
    };

    let result = tokio::select! {
        out = tokio::time::timeout(
            Duration::from_secs(budget),
            state.llm.generate(&model, None, &prompt),
        ) => out.unwrap_or_else(|_| Err(DaemonError::Timeout(format!(
            "agent '{}' exceeded its duration budget", agent.name
        )))),
        _ = cancel.cancelled() => Err(DaemonError::Cancelled(format!(
            "agent '{}' cancelled", agent.name
        ))),
    };
    poller.abort();

    let mut generated = result?;
    let mut tool_count = generated.tool_count;

    // Follow-up round for mail that arrived mid-run.
    let mut late_mail = mid_run_mail.lock().drain(..).collect::<Vec<_>>();
    late_mail.extend(drain_mailbox(state, &swarm.id, &agent.name)?);
    if !late_mail.is_empty() && !cancel.is_cancelled() {
        let mut follow_up = String::from(
            "While you were working, other agents sent you messages:\n",
        );
        for message in &late_mail {
            follow_up.push_str(&format!("- from {}: {}\n", message.from, message.text));
        }
        follow_up.push_str("\nRevise or extend your result if these change anything.");
        match state.llm.generate(&model, None, &follow_up).await {
            Ok(extra) => {
                tool_count += extra.tool_count;
                generated.text.push_str("\n\n");
                generated.text.push_str(&extra.text);
            }
            Err(e) => warn!("[swarm] Follow-up round for '{}' failed: {e}", agent.name),
        }
    }

    let output = truncate_output(&generated.text, MAX_OUTPUT_SIZE);
    let summary = if output.len() >= SUMMARY_THRESHOLD && !state.config.disable_summary {
        match state.llm.summarize(&state.config.summary_model, &output).await {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("[swarm] Summary for '{}' failed: {e}", agent.name);
                None
            }
        }
    } else {
        None
    };
    state
        .store
        .set_agent_result(&agent.id, &output, summary.as_deref(), tool_count)?;
    Ok(())
}

// ── Synthesis ──────────────────────────────────────────────────────────────

fn synthesis_input(agents: &[SwarmAgent]) -> String {
    let mut lines = String::new();
    for agent in agents.iter().filter(|a| !a.is_synthesis_agent) {
        let summary = agent
            .output_summary
            .as_deref()
            .or(agent.output.as_deref())
            .unwrap_or("(no output)");
        lines.push_str(&format!(
            "### {} — {}\n{}\n\n",
            agent.name,
            agent.status.as_str(),
            summary
        ));
    }
    lines
}

/// Run the dedicated synthesis agent after every worker is terminal. Its
/// prompt receives a structured summary of every agent's outcome.
pub async fn run_synthesis(
    state: &Arc<DaemonState>,
    swarm: &Swarm,
    synthesis: &SwarmAgent,
    agents: &[SwarmAgent],
    cancel: &CancelToken,
) {
    if cancel.is_cancelled() {
        let _ = state
            .store
            .set_agent_status(&synthesis.id, AgentStatus::Cancelled);
        return;
    }
    if let Err(e) = state
        .store
        .set_agent_status(&synthesis.id, AgentStatus::Running)
    {
        warn!("[swarm] Could not start synthesis agent: {e}");
        return;
    }

    let base = swarm
        .synthesis_prompt
        .clone()
        .or_else(|| Some(synthesis.prompt.clone()).filter(|p| !p.is_empty()))
        .unwrap_or_else(|| {
            "Synthesize the results below into one coherent report.".to_string()
        });
    let prompt = format!("{base}\n\n## Agent results\n\n{}", synthesis_input(agents));
    let model = synthesis
        .model
        .clone()
        .unwrap_or_else(|| state.config.ambient_model.clone());

    match state.llm.generate(&model, None, &prompt).await {
        Ok(result) => {
            let output = truncate_output(&result.text, MAX_OUTPUT_SIZE);
            let summary = if state.config.disable_summary {
                clip_summary(&output)
            } else {
                state
                    .llm
                    .summarize(&state.config.summary_model, &output)
                    .await
                    .unwrap_or_else(|_| clip_summary(&output))
            };
            let _ = state.store.set_swarm_synthesis(&swarm.id, &output, &summary);
            let _ = state
                .store
                .set_agent_result(&synthesis.id, &output, Some(&summary), result.tool_count);
            let _ = state
                .store
                .set_agent_status(&synthesis.id, AgentStatus::Completed);
        }
        Err(e) => {
            warn!("[swarm] Synthesis failed: {e}");
            let _ = state.store.set_agent_error(&synthesis.id, &e.to_string());
            let _ = state
                .store
                .set_agent_status(&synthesis.id, AgentStatus::Failed);
        }
    }
}

/// Synthesis for swarms configured with `auto_synthesize` but no
/// dedicated synthesis agent: one direct generation over the results.
pub async fn run_inline_synthesis(state: &Arc<DaemonState>, swarm: &Swarm, agents: &[SwarmAgent]) {
    let base = swarm
        .synthesis_prompt
        .clone()
        .unwrap_or_else(|| "Synthesize the results below into one coherent report.".to_string());
    let prompt = format!("{base}\n\n## Agent results\n\n{}", synthesis_input(agents));
    match state
        .llm
        .generate(&state.config.ambient_model, None, &prompt)
        .await
    {
        Ok(result) => {
            let output = truncate_output(&result.text, MAX_OUTPUT_SIZE);
            let summary = clip_summary(&output);
            let _ = state.store.set_swarm_synthesis(&swarm.id, &output, &summary);
        }
        Err(e) => warn!("[swarm] Inline synthesis failed: {e}"),
    }
}

fn clip_summary(text: &str) -> String {
    let mut end = text.len().min(280);
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{AgentDependency, DependencyCondition};
    use crate::engine::store::fixtures::{test_agent, test_swarm};

    #[test]
    fn truncation_elides_the_middle() {
        let text = "a".repeat(1000);
        let out = truncate_output(&text, 100);
        assert!(out.len() <= 100 + 8);
        assert!(out.contains("middle elided"));
        assert!(out.starts_with('a'));
        assert!(out.ends_with('a'));

        let short = truncate_output("fine", 100);
        assert_eq!(short, "fine");
    }

    #[test]
    fn prompt_includes_goal_upstream_and_mail() {
        let mut agent = test_agent("s", "reviewer");
        agent.goal = Some("review the changes".into());
        agent.depends_on = vec![AgentDependency {
            agent: "impl-a".into(),
            include: true,
            condition: DependencyCondition::OnSuccess,
        }];
        let upstream = vec![("impl-a".to_string(), "implemented the parser".to_string())];
        let mail = vec![MailboxMessage {
            from: "impl-b".into(),
            text: "watch out for the lexer".into(),
            priority: "urgent".into(),
        }];
        let prompt = build_agent_prompt(&agent, &upstream, &mail);
        assert!(prompt.contains("You are reviewer."));
        assert!(prompt.contains("review the changes"));
        assert!(prompt.contains("### impl-a"));
        assert!(prompt.contains("implemented the parser"));
        assert!(prompt.contains("[URGENT]"));
        assert!(prompt.contains("watch out for the lexer"));
    }

    #[tokio::test]
    async fn mailbox_round_trip_urgent_first() {
        let state = DaemonState::for_testing();
        state.store.create_swarm(&test_swarm("s1")).unwrap();

        post_message(&state, "s1", "impl-b", "impl-a", "normal note", "normal").unwrap();
        post_message(&state, "s1", "impl-b", "impl-a", "drop everything", "urgent").unwrap();
        post_message(&state, "s1", "impl-c", "impl-a", "not for b", "normal").unwrap();

        let mail = drain_mailbox(&state, "s1", "impl-b").unwrap();
        assert_eq!(mail.len(), 2);
        assert_eq!(mail[0].text, "drop everything");
        assert_eq!(mail[1].text, "normal note");

        // Delivered messages are gone on the next poll.
        assert!(drain_mailbox(&state, "s1", "impl-b").unwrap().is_empty());
        // Other mailboxes untouched
        assert_eq!(drain_mailbox(&state, "s1", "impl-c").unwrap().len(), 1);
    }

    #[test]
    fn synthesis_input_lists_every_worker() {
        let mut a = test_agent("s", "impl-a");
        a.status = AgentStatus::Completed;
        a.output_summary = Some("built the thing".into());
        let mut b = test_agent("s", "impl-b");
        b.status = AgentStatus::Failed;
        let mut synth = test_agent("s", "synth");
        synth.is_synthesis_agent = true;

        let input = synthesis_input(&[a, b, synth]);
        assert!(input.contains("impl-a — completed"));
        assert!(input.contains("built the thing"));
        assert!(input.contains("impl-b — failed"));
        assert!(!input.contains("synth —"));
    }
}
