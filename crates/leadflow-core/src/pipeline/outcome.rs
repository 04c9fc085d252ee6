//! Pure outcome rules applied when a step is finalized: critique score
//! parsing and threshold evaluation, critique text normalization, and the
//! lead stage projection.

use leadflow_types::agent::AgentName;
use leadflow_types::lead::{LeadStage, Quality};
use leadflow_types::run::{LeadRun, RunStep};
use serde_json::{Value, json};

use crate::pipeline::settings::int_setting;

/// Error code recorded when a critique payload has no usable score.
pub const SCORE_PARSE_FAILED: &str = "score_parse_failed";

/// Error code recorded when a critique fails with no rewrite budget left.
pub const MIN_SCORE_NOT_MET: &str = "min_score_not_met";

const MAX_SCORE: i64 = 10;

// ---------------------------------------------------------------------------
// Score parsing
// ---------------------------------------------------------------------------

/// Parse the `score` field of a critique payload, clamped to `0..=10`.
///
/// Accepts integers, floats (truncated toward zero), and strings of the
/// form `N`, `N/M`, or `N.M`. Anything else is unparseable.
pub fn parse_score(payload: &Value) -> Option<i64> {
    let raw = payload.get("score")?;
    let score = match raw {
        Value::Number(n) => match n.as_i64() {
            Some(i) => i,
            None => {
                let f = n.as_f64()?;
                if !f.is_finite() {
                    return None;
                }
                f.trunc() as i64
            }
        },
        Value::String(s) => parse_score_str(s.trim())?,
        _ => return None,
    };
    Some(score.clamp(0, MAX_SCORE))
}

fn parse_score_str(s: &str) -> Option<i64> {
    if let Some((num, denom)) = s.split_once('/') {
        let denom = denom.trim();
        if denom.is_empty() || !denom.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        return parse_signed_int(num.trim());
    }
    if let Some((whole, frac)) = s.split_once('.') {
        if frac.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        return parse_signed_int(whole);
    }
    parse_signed_int(s)
}

fn parse_signed_int(s: &str) -> Option<i64> {
    let digits = s.strip_prefix('-').unwrap_or(s);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // Saturate absurd lengths instead of failing; the result is clamped anyway.
    Some(s.parse::<i64>().unwrap_or(if s.starts_with('-') { i64::MIN } else { i64::MAX }))
}

// ---------------------------------------------------------------------------
// Threshold
// ---------------------------------------------------------------------------

/// Where the critique threshold came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdSource {
    /// `min_score_for_send` in the step's frozen settings snapshot.
    SettingsSnapshot,
    /// The run's stored `min_score`.
    RunMinScore,
}

impl ThresholdSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdSource::SettingsSnapshot => "settings_snapshot",
            ThresholdSource::RunMinScore => "run.min_score",
        }
    }

    pub fn pointer(&self) -> &'static str {
        match self {
            ThresholdSource::SettingsSnapshot => "run_steps.meta.settings_snapshot.min_score_for_send",
            ThresholdSource::RunMinScore => "lead_runs.min_score",
        }
    }
}

/// The threshold a critique step is judged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Threshold {
    pub value: i64,
    pub source: ThresholdSource,
    /// Neither source had a value and 0 was used.
    pub was_missing: bool,
}

/// Resolve the threshold from frozen state only: the step's snapshot first,
/// then the run's `min_score`, then 0. Live configuration is never consulted.
pub fn critique_threshold(run: &LeadRun, step: &RunStep) -> Threshold {
    let from_snapshot = step
        .meta
        .settings_snapshot
        .as_ref()
        .and_then(|snapshot| int_setting(snapshot, "min_score_for_send"));

    match from_snapshot {
        Some(value) => Threshold {
            value,
            source: ThresholdSource::SettingsSnapshot,
            was_missing: false,
        },
        None => Threshold {
            value: run.min_score.unwrap_or(0),
            source: ThresholdSource::RunMinScore,
            was_missing: run.min_score.is_none(),
        },
    }
}

/// Evaluation of a parsed critique score.
#[derive(Debug, Clone, PartialEq)]
pub struct CritiqueVerdict {
    pub score: i64,
    pub threshold: Threshold,
    pub meets_min_score: bool,
}

impl CritiqueVerdict {
    pub fn evaluate(score: i64, threshold: Threshold) -> Self {
        Self {
            score,
            threshold,
            meets_min_score: score >= threshold.value,
        }
    }

    /// Payload with the authoritative verdict fields merged in. The agent's
    /// own `meets_min_score` opinion is preserved as `raw_meets_min_score`.
    pub fn annotate(&self, payload: &Value, step: &RunStep) -> Value {
        let mut annotated = match payload {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        let raw_opinion = annotated.get("meets_min_score").cloned().unwrap_or(Value::Null);

        annotated.insert("score".into(), json!(self.score));
        annotated.insert("meets_min_score".into(), json!(self.meets_min_score));
        annotated.insert("threshold_used".into(), json!(self.threshold.value));
        annotated.insert("threshold_was_nil".into(), json!(self.threshold.was_missing));
        annotated.insert("raw_meets_min_score".into(), raw_opinion);
        annotated.insert("threshold_source".into(), json!(self.threshold.source.as_str()));
        annotated.insert(
            "threshold_source_pointer".into(),
            json!(self.threshold.source.pointer()),
        );
        if let Some(config_id) = step.meta.config_id {
            annotated.insert("agent_config_id".into(), json!(config_id));
        }
        if let Some(updated_at) = step.meta.config_updated_at {
            annotated.insert("agent_config_updated_at".into(), json!(updated_at));
        }
        Value::Object(annotated)
    }
}

// ---------------------------------------------------------------------------
// Critique text
// ---------------------------------------------------------------------------

/// Normalize critique feedback.
///
/// Blank text and exact matches of `none`, `n/a`, `na` (after trimming,
/// case-folding and stripping leading/trailing punctuation) mean "no
/// feedback". Anything else is returned trimmed but otherwise verbatim.
pub fn normalize_critique(text: Option<&str>) -> Option<String> {
    let trimmed = text?.trim();
    if trimmed.is_empty() {
        return None;
    }
    let candidate = trimmed
        .trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace())
        .to_lowercase();
    match candidate.as_str() {
        "none" | "n/a" | "na" => None,
        _ => Some(trimmed.to_string()),
    }
}

/// Quality label for a (normalized) critique.
pub fn quality_for(critique: Option<&str>) -> Quality {
    match critique {
        None => Quality::High,
        Some(_) => Quality::Medium,
    }
}

/// Rewrite the payload's `critique` to its normalized form and record
/// `critique_present`. Returns the quality label it implies.
pub fn apply_critique_normalization(payload: &mut Value) -> Quality {
    let normalized = normalize_critique(payload.get("critique").and_then(|v| v.as_str()));
    let quality = quality_for(normalized.as_deref());
    if let Some(map) = payload.as_object_mut() {
        map.insert("critique_present".into(), json!(normalized.is_some()));
        map.insert(
            "critique".into(),
            normalized.map(Value::String).unwrap_or(Value::Null),
        );
    }
    quality
}

// ---------------------------------------------------------------------------
// Stage projection
// ---------------------------------------------------------------------------

/// The milestone a completed step projects onto its lead.
///
/// SENDER never projects here; its stages belong to the delivery job.
pub fn stage_for_completed(step: &RunStep) -> Option<LeadStage> {
    match step.agent {
        AgentName::Search => Some(LeadStage::Searched),
        AgentName::Writer => match step.meta.revision {
            Some(n) if n > 0 => Some(LeadStage::Rewritten(n)),
            _ => Some(LeadStage::Written),
        },
        AgentName::Critique => Some(LeadStage::Critiqued),
        AgentName::Design => Some(LeadStage::Designed),
        AgentName::Sender => None,
    }
}
