//! Fixed system prompts per agent role and schema instructions.
//!
//! Prompts are intentionally terse: the rolling condensed context carries
//! the incident specifics, and the schema instruction pins the output shape.

use super::AgentRole;
use crate::gateway::ChatMessage;
use crate::state::{context_keys, DebateState};

/// Fixed system prompt for an agent role.
pub fn system_prompt(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Specialist => {
            "You are a site-reliability specialist in an incident debate. \
             Analyze the incident strictly within your assigned focus. Cite \
             every claim with a concrete source reference (log line, file \
             and line, metric name, change id). State what information you \
             are missing. Never speculate beyond your evidence."
        }
        AgentRole::Critic => {
            "You are the critic in an incident debate. Challenge the \
             specialists' claims: find unsupported conclusions, conflicting \
             evidence, and alternative explanations they ignored. For each \
             challenge, name the agent and the claim. Raise open questions \
             that must be answered before judgment."
        }
        AgentRole::Rebuttal => {
            "You are responding to the critic's challenges against your \
             earlier claims. Address every challenge directed at you: either \
             concede with a correction or defend with additional evidence. \
             Do not introduce unrelated new claims."
        }
        AgentRole::Judge => {
            "You are the judge in an incident debate. Weigh all specialist \
             findings, challenges, and rebuttals, then adjudicate a single \
             root cause. Cite at least two evidence items from at least two \
             different source kinds, by their evidence ids. State impact, a \
             fix recommendation, a verification plan, and a risk level. \
             Never conclude with a placeholder like 'needs further analysis'."
        }
        AgentRole::Verification => {
            "You verify an incident adjudication. Check that the cited \
             evidence actually supports the root cause, that the fix \
             addresses it, and that the verification plan would detect a \
             wrong conclusion. Report any gap you find."
        }
    }
}

/// System prompt for the LLM-dynamic supervisor decider.
pub fn supervisor_prompt() -> &'static str {
    "You coordinate an incident debate. Given the condensed debate state and \
     the list of eligible specialists, decide which agents act next and what \
     each should focus on. Respect the phase order: analysis before \
     critique, critique before rebuttal, judgment only once the open \
     questions are addressed. Issue at most one command per agent."
}

/// Output-schema instruction appended to every prompt. The ids are stable
/// contract names shared with the parsers.
pub fn schema_instruction(schema_id: &str) -> String {
    let body = match schema_id {
        "specialist_v1" => {
            r#"{"chat_message": str, "analysis": str, "conclusion": str, "confidence": float 0..1, "evidence_chain": [{"type": str, "source": str, "description": str, "strength": "weak|medium|strong"}], "missing_info": [str], "open_questions": [str]}"#
        }
        "critic_v1" => {
            r#"{"chat_message": str, "analysis": str, "conclusion": str, "confidence": float 0..1, "challenges": [{"agent": str, "claim": str, "reason": str}], "open_questions": [str], "evidence_chain": [], "missing_info": [str]}"#
        }
        "judge_v1" => {
            r#"{"chat_message": str, "confidence": float 0..1, "final_judgment": {"root_cause": {"summary": str, "category": str, "confidence": float}, "evidence_chain": [str evidence ids], "impact_analysis": {"business_impact": str}, "fix_recommendation": {"summary": str}, "verification_plan": str, "risk_assessment": {"risk_level": "low|medium|high|critical"}}}"#
        }
        "verification_v1" => {
            r#"{"chat_message": str, "analysis": str, "conclusion": str, "confidence": float 0..1, "gaps": [str], "verified": bool, "evidence_chain": [], "missing_info": []}"#
        }
        "supervisor_v1" => {
            r#"{"next_agents": [str], "commands": [{"target_agent": str, "task": str, "focus": str, "use_tool": "forbidden|optional|required"}], "rationale": str, "should_stop": bool}"#
        }
        other => {
            return format!(
                "Respond with a single JSON object conforming to schema '{other}'. \
                 No prose outside the JSON."
            );
        }
    };
    format!(
        "Respond with a single JSON object and nothing else, matching:\n{body}"
    )
}

/// Build the condensed-state messages for the LLM-dynamic supervisor.
/// The condensed view keeps per-agent feedback one-liners and the current
/// route; raw transcripts stay out of the supervisor's context.
pub fn supervisor_prompt_messages(
    state: &DebateState,
    eligible: &[String],
    max_prompt_tokens: usize,
) -> Vec<ChatMessage> {
    let mut condensed = String::new();
    condensed.push_str(&format!(
        "Phase: {} (loop round {})\n",
        state.route.current_phase, state.route.loop_round
    ));
    if let Some(summary) = state
        .context
        .get(context_keys::INCIDENT_SUMMARY)
        .and_then(serde_json::Value::as_str)
    {
        condensed.push_str(&format!("Incident: {summary}\n"));
    }
    condensed.push_str("Feedback so far:\n");
    for (agent, feedback) in &state.feedback {
        condensed.push_str(&format!(
            "- {agent} [{}] confidence={:.2} missing={} open={}: {}\n",
            feedback.status,
            feedback.confidence,
            feedback.missing_info.len(),
            feedback.open_questions.len(),
            feedback.summary,
        ));
    }
    condensed.push_str(&format!("Eligible specialists: {}\n", eligible.join(", ")));

    // Keep the condensed view within the prompt budget.
    let budget_chars = max_prompt_tokens.saturating_mul(4);
    if condensed.chars().count() > budget_chars {
        condensed = condensed.chars().take(budget_chars).collect();
    }

    let user = format!("{condensed}\n{}", schema_instruction("supervisor_v1"));
    vec![
        ChatMessage::system(supervisor_prompt()),
        ChatMessage::user(user),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_role_has_prompt() {
        for role in [
            AgentRole::Specialist,
            AgentRole::Critic,
            AgentRole::Rebuttal,
            AgentRole::Judge,
            AgentRole::Verification,
        ] {
            assert!(!system_prompt(role).is_empty());
        }
    }

    #[test]
    fn test_schema_instruction_known_and_unknown() {
        assert!(schema_instruction("specialist_v1").contains("evidence_chain"));
        assert!(schema_instruction("judge_v1").contains("final_judgment"));
        assert!(schema_instruction("custom_v9").contains("custom_v9"));
    }
}
