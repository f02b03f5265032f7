//! End-to-end debate scenarios against a deterministic LLM stub.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use incident_debate::{
    ControlAction, DebatePhase, EventKind, MemorySessionStore, SessionStatus,
    SharedSessionStore,
};

fn store() -> SharedSessionStore {
    Arc::new(MemorySessionStore::new())
}

async fn events_of(
    store: &SharedSessionStore,
    session_id: &str,
) -> Vec<incident_debate::DebateEvent> {
    store.load_events_since(session_id, None).await.unwrap()
}

#[tokio::test]
async fn test_full_debate_produces_final_result() {
    let stub = Arc::new(StubLlm::new());
    script_happy_path(&stub);
    let store = store();
    let service = service_over(stub, store.clone());

    let session_id = service.create_session(incident()).await;
    service.start_session(&session_id, fast_config()).await.unwrap();

    let status = wait_terminal(&service, &session_id).await;
    assert_eq!(status, SessionStatus::Completed);

    let result = service
        .get_final_result(&session_id, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert!(result.root_cause.contains("pool exhausted"));
    assert!(result.confidence > 0.8);
    assert!(result.evidence_chain.len() >= 2);

    // The adjudication spans at least two evidence source kinds (I4).
    let checkpoint = store.load_checkpoint(&session_id).await.unwrap().unwrap();
    let kinds = checkpoint
        .state
        .distinct_source_kinds(&result.evidence_chain);
    assert!(kinds.len() >= 2);
    assert_eq!(checkpoint.status, SessionStatus::Completed);

    let events = events_of(&store, &session_id).await;
    assert!(events.iter().any(|e| e.type_name() == "session_started"));
    assert!(events.iter().any(|e| e.type_name() == "result_ready"));
    assert!(events.iter().any(|e| e.type_name() == "session_completed"));
    assert!(!events.iter().any(|e| e.type_name() == "session_failed"));
}

#[tokio::test]
async fn test_phase_trace_is_valid_prefix() {
    let stub = Arc::new(StubLlm::new());
    script_happy_path(&stub);
    // Drive one critique/rebuttal loop.
    stub.set(
        "CodeAgent",
        &questioning_specialist_text("undersized pool", "was the deploy related?"),
    );
    stub.set("CriticAgent", &critic_text("CodeAgent"));
    let store = store();
    let service = service_over(stub, store.clone());

    let session_id = service.create_session(incident()).await;
    service.start_session(&session_id, fast_config()).await.unwrap();
    assert_eq!(wait_terminal(&service, &session_id).await, SessionStatus::Completed);

    let mut trace = vec![DebatePhase::Init];
    for event in events_of(&store, &session_id).await {
        if let EventKind::PhaseChanged { from, to, .. } = event.kind {
            assert_eq!(
                from,
                *trace.last().unwrap(),
                "phase trace must be contiguous"
            );
            assert!(
                from.can_advance_to(to),
                "invalid transition {from} → {to}"
            );
            trace.push(to);
        }
    }
    // The loop actually happened and the trace ends terminal.
    assert!(trace.contains(&DebatePhase::Critique));
    assert!(trace.contains(&DebatePhase::Rebuttal));
    assert_eq!(*trace.last().unwrap(), DebatePhase::Terminal);

    // Event ids are unique within the session.
    let events = events_of(&store, &session_id).await;
    let mut ids: Vec<&str> = events.iter().map(|e| e.event_id.as_str()).collect();
    let before = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), before);
}

#[tokio::test]
async fn test_timeout_degradation_round() {
    let stub = Arc::new(StubLlm::new());
    script_happy_path(&stub);
    // LogAgent stalls far past the analysis deadline.
    stub.set_with_delay(
        "LogAgent",
        &specialist_text("log", "app.log:1", "never arrives", "late", 0.9),
        5_000,
    );
    let store = store();
    let service = service_over(stub, store.clone());

    let session_id = service.create_session(incident()).await;
    service
        .start_session(&session_id, tight_analysis_config(50))
        .await
        .unwrap();
    assert_eq!(wait_terminal(&service, &session_id).await, SessionStatus::Completed);

    let events = events_of(&store, &session_id).await;
    let log_timeouts = events
        .iter()
        .filter(|e| {
            e.type_name() == "llm_request_timeout"
                && e.agent_name.as_deref() == Some("LogAgent")
        })
        .count();
    assert_eq!(log_timeouts, 1, "exactly one timeout event for the stalled agent");

    // Exactly one degraded feedback entry for LogAgent in round 1.
    let checkpoint = store.load_checkpoint(&session_id).await.unwrap().unwrap();
    let feedback = &checkpoint.state.feedback["LogAgent"];
    assert_eq!(feedback.round, 1);
    assert_eq!(feedback.status.to_string(), "degraded");
    assert!(feedback.summary.contains("timeout"));

    // The rest of the debate still adjudicated.
    assert!(checkpoint.state.final_result.is_some());
}

#[tokio::test]
async fn test_invalid_conclusion_fails_then_retry_succeeds() {
    let stub = Arc::new(StubLlm::new());
    script_happy_path(&stub);
    stub.set("JudgeAgent", &judge_text("需要进一步分析", 0.6));
    let store = store();
    let service = service_over(stub.clone(), store.clone());

    let session_id = service.create_session(incident()).await;
    service.start_session(&session_id, fast_config()).await.unwrap();
    assert_eq!(wait_terminal(&service, &session_id).await, SessionStatus::Failed);

    let events = events_of(&store, &session_id).await;
    let failures: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::SessionFailed {
                error_code,
                retry_hint,
                ..
            } => Some((error_code.clone(), retry_hint.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(failures.len(), 1, "exactly one session_failed event");
    assert_eq!(failures[0].0, "NO_VALID_CONCLUSION");
    assert!(failures[0].1.contains("retry_failed_only"));
    assert!(!events.iter().any(|e| e.type_name() == "result_ready"));

    // Restart the judge alone with a usable adjudication.
    stub.set(
        "JudgeAgent",
        &judge_text("connection pool exhausted under retry storm", 0.88),
    );
    service
        .send_control(&session_id, ControlAction::RetryFailedOnly)
        .await
        .unwrap();
    assert_eq!(wait_terminal(&service, &session_id).await, SessionStatus::Completed);

    let result = service
        .get_final_result(&session_id, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert!(result.root_cause.contains("pool exhausted"));

    // Specialist progress was preserved: the analysis feedback survived
    // the retry (only the judge re-ran).
    let checkpoint = store.load_checkpoint(&session_id).await.unwrap().unwrap();
    assert!(checkpoint.state.feedback.contains_key("MetricsAgent"));
}

#[tokio::test]
async fn test_evidence_deduplicated_across_specialists() {
    let stub = Arc::new(StubLlm::new());
    script_happy_path(&stub);
    // Two specialists cite the same log line.
    let shared = specialist_text(
        "log",
        "checkout/app.log:4412",
        "burst of pool-exhausted errors at 14:02",
        "connection pool exhausted",
        0.85,
    );
    stub.set("LogAgent", &shared);
    stub.set("CodeAgent", &shared);
    let store = store();
    let service = service_over(stub, store.clone());

    let session_id = service.create_session(incident()).await;
    service.start_session(&session_id, fast_config()).await.unwrap();
    assert_eq!(wait_terminal(&service, &session_id).await, SessionStatus::Completed);

    let state = store
        .load_checkpoint(&session_id)
        .await
        .unwrap()
        .unwrap()
        .state;
    let matching: Vec<_> = state
        .evidence
        .iter()
        .filter(|e| e.source_ref == "checkout/app.log:4412")
        .collect();
    assert_eq!(matching.len(), 1, "shared citation stored exactly once");

    let shared_id = &matching[0].evidence_id;
    assert!(state.feedback["LogAgent"].evidence_refs.contains(shared_id));
    assert!(state.feedback["CodeAgent"].evidence_refs.contains(shared_id));
}

#[tokio::test]
async fn test_cancellation_mid_fanout() {
    let stub = Arc::new(StubLlm::new());
    script_happy_path(&stub);
    // Everyone except LogAgent stalls.
    for agent in [
        "CodeAgent",
        "DomainAgent",
        "MetricsAgent",
        "ChangeAgent",
        "RunbookAgent",
    ] {
        stub.set_with_delay(
            agent,
            &specialist_text("code", "slow:1", "slow", "slow", 0.8),
            10_000,
        );
    }
    let store = store();
    let service = service_over(stub, store.clone());

    let session_id = service.create_session(incident()).await;
    let mut subscription = service.subscribe(&session_id, None).await.unwrap();
    service.start_session(&session_id, fast_config()).await.unwrap();

    // Wait until the fast specialist's LLM call completed, then cancel.
    loop {
        let event = subscription.next().await.expect("stream closed early");
        if event.type_name() == "llm_request_completed"
            && event.agent_name.as_deref() == Some("LogAgent")
        {
            break;
        }
    }
    service
        .send_control(&session_id, ControlAction::Cancel)
        .await
        .unwrap();
    assert_eq!(
        wait_terminal(&service, &session_id).await,
        SessionStatus::Cancelled
    );

    let events = events_of(&store, &session_id).await;
    assert!(events.iter().any(|e| e.type_name() == "session_cancelled"));

    // The settled specialist's round reached the log; nobody else's did.
    let rounds: Vec<_> = events
        .iter()
        .filter(|e| e.type_name() == "agent_round")
        .filter_map(|e| e.agent_name.clone())
        .collect();
    assert_eq!(rounds, vec!["LogAgent".to_string()]);

    // The checkpoint restored to the point before the aggregate merge: no
    // specialist feedback was committed.
    let checkpoint = store.load_checkpoint(&session_id).await.unwrap().unwrap();
    assert_eq!(checkpoint.status, SessionStatus::Cancelled);
    assert!(checkpoint.state.feedback.is_empty());

    // No further nodes executed after cancellation was observed: the last
    // events are the cancel closing pair.
    assert!(!events.iter().any(|e| e.type_name() == "session_completed"));
}
