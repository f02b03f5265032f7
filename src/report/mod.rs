//! Report guard: validity enforcement for the final adjudication, plus the
//! report rendering collaborator interface.
//!
//! A conclusion that is empty, placeholder-worded, zero-confidence, or
//! grounded in too narrow an evidence base never reaches the report stage;
//! the session fails with `NO_VALID_CONCLUSION` and a retry hint instead.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DebateConfig;
use crate::state::{DebateState, FinalResult};

/// Error type for report validation and rendering.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    /// The final result failed effective-conclusion rules.
    #[error("no valid conclusion: {reason}")]
    NoValidConclusion {
        reason: String,
        /// Caller-facing hint (e.g. "retry_failed_only restarts the judge").
        retry_hint: String,
    },

    /// The rendering collaborator failed.
    #[error("report rendering failed: {0}")]
    RenderFailed(String),
}

/// A rendered report document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportDocument {
    pub title: String,
    pub body_markdown: String,
    pub generated_at: DateTime<Utc>,
}

/// Rendering collaborator; consumed by the report node on success.
#[async_trait]
pub trait ReportRenderer: Send + Sync {
    async fn render(
        &self,
        final_result: &FinalResult,
        state: &DebateState,
    ) -> Result<ReportDocument, ReportError>;
}

/// Validates final results against effective-conclusion rules.
pub struct ReportGuard {
    blocked_phrases: Vec<String>,
    min_source_kinds: usize,
}

impl ReportGuard {
    pub fn new(config: &DebateConfig) -> Self {
        Self {
            blocked_phrases: config
                .blocked_conclusion_phrases
                .iter()
                .map(|phrase| phrase.to_lowercase())
                .collect(),
            min_source_kinds: config.evidence_source_kind_minimum,
        }
    }

    /// Validate the state's final result. `Ok` means the report may render.
    pub fn validate<'a>(&self, state: &'a DebateState) -> Result<&'a FinalResult, ReportError> {
        let Some(result) = state.final_result.as_ref() else {
            return Err(self.rejection("no adjudication was produced"));
        };

        let root_cause = result.root_cause.trim();
        if root_cause.is_empty() {
            return Err(self.rejection("root cause is empty"));
        }
        let lowered = root_cause.to_lowercase();
        if let Some(phrase) = self
            .blocked_phrases
            .iter()
            .find(|phrase| lowered.contains(phrase.as_str()))
        {
            return Err(self.rejection(&format!(
                "root cause matches blocked phrase \"{phrase}\""
            )));
        }

        if result.confidence <= 0.0 {
            return Err(self.rejection("confidence is not above zero"));
        }

        let kinds = state.distinct_source_kinds(&result.evidence_chain);
        if result.evidence_chain.len() < 2 || kinds.len() < self.min_source_kinds {
            return Err(self.rejection(&format!(
                "evidence chain has {} items across {} source kinds (need ≥2 items, ≥{} kinds)",
                result.evidence_chain.len(),
                kinds.len(),
                self.min_source_kinds
            )));
        }

        Ok(result)
    }

    fn rejection(&self, reason: &str) -> ReportError {
        ReportError::NoValidConclusion {
            reason: reason.to_string(),
            retry_hint:
                "send retry_failed_only to restart the degraded agents without losing confirmed progress"
                    .to_string(),
        }
    }
}

/// Renderer that formats the adjudication as a markdown summary. Serves
/// tests and single-process deployments; production backends implement
/// [`ReportRenderer`] externally.
pub struct MarkdownReportRenderer;

#[async_trait]
impl ReportRenderer for MarkdownReportRenderer {
    async fn render(
        &self,
        final_result: &FinalResult,
        state: &DebateState,
    ) -> Result<ReportDocument, ReportError> {
        let mut body = String::new();
        body.push_str(&format!("## Root cause\n{}\n\n", final_result.root_cause));
        body.push_str(&format!(
            "Confidence: {:.2} | Risk: {}\n\n",
            final_result.confidence, final_result.risk_level
        ));
        body.push_str("## Evidence\n");
        for id in &final_result.evidence_chain {
            if let Some(item) = state.evidence_by_id(id) {
                body.push_str(&format!(
                    "- [{}] {} ({}) — {}\n",
                    item.source_kind, item.source_ref, item.strength, item.description
                ));
            }
        }
        body.push_str(&format!("\n## Impact\n{}\n", final_result.impact));
        body.push_str(&format!(
            "\n## Fix recommendation\n{}\n",
            final_result.fix_recommendation
        ));
        body.push_str(&format!(
            "\n## Verification plan\n{}\n",
            final_result.verification_plan
        ));
        Ok(ReportDocument {
            title: "Incident root-cause adjudication".to_string(),
            body_markdown: body,
            generated_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{
        DebatePhase, Evidence, EvidenceStrength, RiskLevel, SourceKind, StateDelta,
    };

    fn state_with_result(root_cause: &str, confidence: f64, kinds: &[SourceKind]) -> DebateState {
        let mut state = DebateState::default();
        state.route.current_phase = DebatePhase::Judgment;
        let mut chain = Vec::new();
        let mut delta = StateDelta::default();
        for (index, kind) in kinds.iter().enumerate() {
            let item = Evidence::new(
                *kind,
                &format!("src-{index}"),
                &format!("fact {index}"),
                EvidenceStrength::Medium,
                "LogAgent",
            );
            chain.push(item.evidence_id.clone());
            delta = delta.with_evidence(item);
        }
        state.apply(delta).unwrap();
        state.final_result = Some(FinalResult {
            root_cause: root_cause.to_string(),
            confidence,
            evidence_chain: chain,
            impact: "checkout degraded".into(),
            fix_recommendation: "raise pool size".into(),
            verification_plan: "replay traffic".into(),
            risk_level: RiskLevel::Medium,
        });
        state
    }

    fn guard() -> ReportGuard {
        ReportGuard::new(&DebateConfig::default())
    }

    #[test]
    fn test_valid_result_passes() {
        let state = state_with_result(
            "connection pool exhausted under retry storm",
            0.84,
            &[SourceKind::Log, SourceKind::Metric],
        );
        assert!(guard().validate(&state).is_ok());
    }

    #[test]
    fn test_missing_result_rejected() {
        let state = DebateState::default();
        let err = guard().validate(&state).unwrap_err();
        assert!(matches!(err, ReportError::NoValidConclusion { .. }));
    }

    #[test]
    fn test_blocked_phrase_rejected() {
        for phrase in ["insufficient information", "Needs Further Analysis", "unknown", "需要进一步分析"] {
            let state = state_with_result(phrase, 0.9, &[SourceKind::Log, SourceKind::Code]);
            let err = guard().validate(&state).unwrap_err();
            match err {
                ReportError::NoValidConclusion { reason, retry_hint } => {
                    assert!(reason.contains("blocked phrase"), "{reason}");
                    assert!(retry_hint.contains("retry_failed_only"));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_zero_confidence_rejected() {
        let state = state_with_result("real cause", 0.0, &[SourceKind::Log, SourceKind::Code]);
        assert!(guard().validate(&state).is_err());
    }

    #[test]
    fn test_single_source_kind_rejected_regardless_of_count() {
        let state = state_with_result(
            "real cause",
            0.9,
            &[SourceKind::Log, SourceKind::Log, SourceKind::Log],
        );
        let err = guard().validate(&state).unwrap_err();
        match err {
            ReportError::NoValidConclusion { reason, .. } => {
                assert!(reason.contains("source kinds"), "{reason}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_markdown_renderer() {
        let state = state_with_result(
            "pool exhausted",
            0.8,
            &[SourceKind::Log, SourceKind::Metric],
        );
        let result = state.final_result.clone().unwrap();
        let document = MarkdownReportRenderer
            .render(&result, &state)
            .await
            .unwrap();
        assert!(document.body_markdown.contains("pool exhausted"));
        assert!(document.body_markdown.contains("[log]"));
    }
}
