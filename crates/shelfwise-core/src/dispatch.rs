//! Score-based dispatch with quality-gated retry.
//!
//! # Algorithm
//!
//! 1. Ask every registered handler for a score, concurrently. A handler that
//!    errors (or returns a non-finite score) is logged and dropped for this
//!    request. Finite scores are clamped to `[0, 1]`.
//! 2. Keep candidates scoring strictly above `score_floor`; if none remain,
//!    fail with [`DispatchError::NoHandlerAvailable`].
//! 3. Sort by score (desc), then registration order (asc).
//! 4. Run `handle` on candidates in that order, at most `max_attempts`
//!    times. A failed `handle` counts as an attempt and moves on.
//! 5. Accept the first reply whose quality is `>= acceptance_threshold`.
//! 6. Otherwise apply the [`ExhaustionPolicy`] to the best reply seen. With
//!    no reply at all the result is [`DispatchError::AllHandlersExhausted`].
//!
//! All scoring completes before the first `handle` call. Dropping the
//! returned future cancels whatever handler I/O is in flight.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::DispatchError;
use crate::handler::{Handler, HandlerRegistry};
use crate::models::{Reply, Request};
use crate::quality::QualityGate;

/// What to do when the attempt bound is reached without an accepted reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustionPolicy {
    /// Return the best reply seen, flagged as degraded.
    Degrade,
    /// Fail with [`DispatchError::AllHandlersExhausted`].
    Fail,
}

/// Dispatch tuning, decoupled from application config.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Minimum quality for a reply to be accepted.
    pub acceptance_threshold: f64,
    /// Maximum number of `handle` invocations per request.
    pub max_attempts: usize,
    /// Handlers must score strictly above this to be considered.
    pub score_floor: f64,
    pub on_exhaustion: ExhaustionPolicy,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            acceptance_threshold: 0.5,
            max_attempts: 3,
            score_floor: 0.0,
            on_exhaustion: ExhaustionPolicy::Degrade,
        }
    }
}

/// A handler paired with the score it gave the current request.
#[derive(Clone)]
pub struct ScoredCandidate {
    pub handler: Arc<dyn Handler>,
    pub score: f64,
    /// Registration index, used to break ties.
    pub position: usize,
}

/// Score reported by one handler, or why it has none.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateScore {
    pub handler: String,
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Reply { quality: f64, accepted: bool },
    Failed { error: String },
}

/// One `handle` invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub handler: String,
    pub candidate_score: f64,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

/// Everything the dispatcher decided for one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchTrace {
    pub request: String,
    /// In registration order.
    pub scores: Vec<CandidateScore>,
    /// In the order they were attempted.
    pub attempts: Vec<AttemptRecord>,
    pub selected: Option<String>,
    pub degraded: bool,
}

impl DispatchTrace {
    fn new(request: &Request) -> Self {
        Self {
            request: request.text.clone(),
            ..Default::default()
        }
    }
}

/// Orchestrates handler scoring, reply generation and quality gating.
pub struct DispatchController {
    registry: HandlerRegistry,
    gate: Arc<dyn QualityGate>,
    settings: DispatchSettings,
}

impl DispatchController {
    pub fn new(
        registry: HandlerRegistry,
        gate: Arc<dyn QualityGate>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            registry,
            gate,
            settings,
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Resolve a request to a single reply.
    pub async fn resolve(&self, request: &Request) -> Result<Reply, DispatchError> {
        self.resolve_with_trace(request).await.0
    }

    /// Like [`resolve`](Self::resolve), also returning the decision trace.
    pub async fn resolve_with_trace(
        &self,
        request: &Request,
    ) -> (Result<Reply, DispatchError>, DispatchTrace) {
        let mut trace = DispatchTrace::new(request);
        let candidates = self.rank(request, &mut trace).await;

        if candidates.is_empty() {
            warn!(request = %request.text, "no handler scored above the floor");
            return (Err(DispatchError::NoHandlerAvailable), trace);
        }

        let threshold = self.settings.acceptance_threshold;
        let mut best: Option<Reply> = None;
        let mut attempts = 0;

        for candidate in candidates.iter().take(self.settings.max_attempts) {
            attempts += 1;
            let name = candidate.handler.name().to_string();
            debug!(handler = %name, score = candidate.score, "trying handler");

            let text = match candidate.handler.handle(request).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(handler = %name, error = %e, "handler failed; trying next candidate");
                    trace.attempts.push(AttemptRecord {
                        handler: name,
                        candidate_score: candidate.score,
                        outcome: AttemptOutcome::Failed {
                            error: e.to_string(),
                        },
                    });
                    continue;
                }
            };

            let quality = self.gate.evaluate(request, &text);
            let accepted = quality >= threshold;
            trace.attempts.push(AttemptRecord {
                handler: name.clone(),
                candidate_score: candidate.score,
                outcome: AttemptOutcome::Reply { quality, accepted },
            });

            if accepted {
                info!(handler = %name, quality, "reply accepted");
                trace.selected = Some(name.clone());
                let reply = Reply {
                    text,
                    handler: name,
                    quality,
                    degraded: false,
                };
                return (Ok(reply), trace);
            }

            debug!(handler = %name, quality, threshold, "reply rejected by quality gate");
            if best.as_ref().map_or(true, |b| quality > b.quality) {
                best = Some(Reply {
                    text,
                    handler: name,
                    quality,
                    degraded: true,
                });
            }
        }

        match (best, self.settings.on_exhaustion) {
            (Some(reply), ExhaustionPolicy::Degrade) => {
                warn!(
                    handler = %reply.handler,
                    quality = reply.quality,
                    attempts,
                    "no reply met the threshold; returning best effort"
                );
                trace.selected = Some(reply.handler.clone());
                trace.degraded = true;
                (Ok(reply), trace)
            }
            _ => {
                warn!(attempts, "all handlers exhausted");
                (Err(DispatchError::AllHandlersExhausted { attempts }), trace)
            }
        }
    }

    /// Score every handler and return the viable candidates, best first.
    async fn rank(&self, request: &Request, trace: &mut DispatchTrace) -> Vec<ScoredCandidate> {
        let handlers = self.registry.handlers();
        let results = join_all(handlers.iter().map(|h| h.score(request))).await;

        let mut candidates = Vec::with_capacity(handlers.len());
        for (position, (handler, result)) in handlers.iter().zip(results).enumerate() {
            let name = handler.name().to_string();
            match result {
                Ok(score) if score.is_finite() => {
                    let score = score.clamp(0.0, 1.0);
                    trace.scores.push(CandidateScore {
                        handler: name,
                        score: Some(score),
                        error: None,
                    });
                    if score > self.settings.score_floor {
                        candidates.push(ScoredCandidate {
                            handler: Arc::clone(handler),
                            score,
                            position,
                        });
                    }
                }
                Ok(score) => {
                    warn!(handler = %name, score, "handler returned a non-finite score");
                    trace.scores.push(CandidateScore {
                        handler: name,
                        score: None,
                        error: Some(format!("non-finite score {}", score)),
                    });
                }
                Err(e) => {
                    warn!(handler = %name, error = %e, "handler scoring failed");
                    trace.scores.push(CandidateScore {
                        handler: name,
                        score: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(a.position.cmp(&b.position))
        });
        debug!(
            scores = ?candidates.iter().map(|c| (c.handler.name().to_string(), c.score)).collect::<Vec<_>>(),
            "ranked handlers"
        );
        candidates
    }
}
