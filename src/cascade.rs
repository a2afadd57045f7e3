//! Cascade chain execution.
//!
//! Drives an ordered chain of (provider, model, threshold) steps: call the
//! step, score the response, accept on the first score that meets the
//! step's threshold, otherwise advance while tracking the best response so
//! far. Per-step failures are recorded and skipped; only a chain where
//! every step failed is an error.
//!
//! The executor is generic over how a step runs and how a response is
//! scored, so the orchestrator, tests, and any future replay tool drive it
//! with plain closures.

use crate::router::CascadeStep;
use crate::GatewayError;
use serde::Serialize;
use std::future::Future;
use tracing::{debug, warn};

/// What happened at one rung of the chain.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The call succeeded and was scored.
    Scored {
        /// Quality score the response achieved.
        score: f64,
        /// Whether it met the step threshold.
        met_threshold: bool,
    },
    /// The call failed; the chain advanced.
    Failed {
        /// Error text.
        error: String,
    },
}

/// Per-step trail entry, kept for artifacts.
#[derive(Debug, Clone, Serialize)]
pub struct CascadeAttempt {
    /// Provider of the step.
    pub provider: String,
    /// Model of the step.
    pub model: String,
    /// Position in the chain.
    pub step_index: usize,
    /// Result of the attempt.
    pub outcome: AttemptOutcome,
}

/// Result of a cascade run.
#[derive(Debug)]
pub struct CascadeOutcome<R> {
    /// The chosen response.
    pub response: R,
    /// Its score.
    pub score: f64,
    /// Index of the chosen step.
    pub step_index: usize,
    /// True when the chosen step met its threshold; false when the chain
    /// was exhausted and this is merely the best of the successes.
    pub met_threshold: bool,
    /// Trail of every attempt, in execution order.
    pub attempts: Vec<CascadeAttempt>,
}

/// Cascade-level failure.
#[derive(Debug, thiserror::Error)]
pub enum CascadeError {
    /// The chain had no steps.
    #[error("cascade chain is empty")]
    EmptyChain,
    /// Every step raised a provider failure.
    #[error("all {attempts} cascade steps failed: {last_error}")]
    AllStepsFailed {
        /// Steps attempted.
        attempts: usize,
        /// Error text from the final step.
        last_error: String,
    },
}

/// Execute a chain.
///
/// `run` performs the provider call for a step; `evaluate` scores a
/// successful response; `on_step` observes every scored step (use it for
/// escalation artifacts). Deterministic given deterministic closures: the
/// chosen index is the smallest that met its threshold, or the argmax
/// score over successful steps when none did.
pub async fn run_cascade<R, Run, RunFut, Eval, OnStep>(
    chain: &[CascadeStep],
    mut run: Run,
    mut evaluate: Eval,
    mut on_step: OnStep,
) -> Result<CascadeOutcome<R>, CascadeError>
where
    Run: FnMut(&CascadeStep, usize) -> RunFut,
    RunFut: Future<Output = Result<R, GatewayError>>,
    Eval: FnMut(&R) -> f64,
    OnStep: FnMut(&CascadeStep, usize, f64),
{
    if chain.is_empty() {
        return Err(CascadeError::EmptyChain);
    }

    let mut attempts: Vec<CascadeAttempt> = Vec::with_capacity(chain.len());
    let mut best: Option<(R, f64, usize)> = None;
    let mut last_error = String::new();

    for (index, step) in chain.iter().enumerate() {
        let response = match run(step, index).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    provider = step.provider.as_str(),
                    model = step.model.as_str(),
                    step = index,
                    error = %e,
                    "cascade step failed"
                );
                last_error = e.to_string();
                attempts.push(CascadeAttempt {
                    provider: step.provider.clone(),
                    model: step.model.clone(),
                    step_index: index,
                    outcome: AttemptOutcome::Failed { error: last_error.clone() },
                });
                continue;
            }
        };

        let score = evaluate(&response);
        let met = score >= step.quality_threshold;
        on_step(step, index, score);
        attempts.push(CascadeAttempt {
            provider: step.provider.clone(),
            model: step.model.clone(),
            step_index: index,
            outcome: AttemptOutcome::Scored { score, met_threshold: met },
        });
        debug!(
            provider = step.provider.as_str(),
            model = step.model.as_str(),
            step = index,
            score,
            threshold = step.quality_threshold,
            met,
            "cascade step scored"
        );

        if met {
            return Ok(CascadeOutcome {
                response,
                score,
                step_index: index,
                met_threshold: true,
                attempts,
            });
        }

        // Strict comparison keeps the earliest step on score ties.
        if best.as_ref().map_or(true, |(_, b, _)| score > *b) {
            best = Some((response, score, index));
        }
    }

    match best {
        Some((response, score, step_index)) => Ok(CascadeOutcome {
            response,
            score,
            step_index,
            met_threshold: false,
            attempts,
        }),
        None => Err(CascadeError::AllStepsFailed { attempts: attempts.len(), last_error }),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
