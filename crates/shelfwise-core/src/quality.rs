//! Response quality gate.
//!
//! The gate assigns a score in `[0, 1]` to a produced reply. The dispatcher
//! compares it against its acceptance threshold and moves on to the next
//! candidate when the reply falls short.

use crate::models::Request;

/// Scores a reply for adequacy against the request that produced it.
///
/// Must be deterministic: the same `(request, reply)` pair always yields
/// the same score.
pub trait QualityGate: Send + Sync {
    fn evaluate(&self, request: &Request, reply: &str) -> f64;
}

/// Phrases that mark a reply as a refusal or a failed lookup.
pub const DEFAULT_FAILURE_PHRASES: &[&str] = &["i'm sorry", "couldn't", "cannot"];

/// Lightweight heuristic gate that needs no model call.
///
/// Empty replies and replies containing any failure phrase score `0.0`;
/// everything else scores `1.0`.
#[derive(Debug, Clone)]
pub struct HeuristicQualityGate {
    failure_phrases: Vec<String>,
}

impl HeuristicQualityGate {
    pub fn new(failure_phrases: Vec<String>) -> Self {
        Self {
            failure_phrases: failure_phrases
                .into_iter()
                .map(|p| p.to_lowercase())
                .filter(|p| !p.trim().is_empty())
                .collect(),
        }
    }
}

impl Default for HeuristicQualityGate {
    fn default() -> Self {
        Self::new(
            DEFAULT_FAILURE_PHRASES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }
}

impl QualityGate for HeuristicQualityGate {
    fn evaluate(&self, _request: &Request, reply: &str) -> f64 {
        if reply.trim().is_empty() {
            return 0.0;
        }
        // Curly apostrophes show up in model output.
        let text = reply.to_lowercase().replace('\u{2019}', "'");
        if self.failure_phrases.iter().any(|p| text.contains(p)) {
            0.0
        } else {
            1.0
        }
    }
}
