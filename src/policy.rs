//! Pure retry decisions.
//!
//! Nothing here sleeps, logs or touches counters; the orchestrator in
//! [`crate::QaClient`] acts on the decisions.

use std::time::Duration;

use crate::{AttemptOutcome, HttpResponse, QaError, RetryCause, RetryConfig};

/// What the orchestrator does after an attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then try again.
    Retry(Duration),
    /// The outcome is terminal.
    GiveUp,
}

/// Classifies the raw result of one invocation.
pub fn classify(result: Result<HttpResponse, QaError>, cfg: &RetryConfig) -> AttemptOutcome {
    match result {
        Ok(response) if cfg.is_retryable_status(response.status) => {
            AttemptOutcome::RetryableFailure(RetryCause::Status(response))
        }
        Ok(response) => AttemptOutcome::Success(response),
        Err(err) if err.is_network() => AttemptOutcome::RetryableFailure(RetryCause::Network(err)),
        Err(err) => AttemptOutcome::FatalFailure(err),
    }
}

/// Decides whether attempt `attempt` (1-based) is followed by another one.
pub fn evaluate(outcome: &AttemptOutcome, attempt: u32, cfg: &RetryConfig) -> RetryDecision {
    match outcome {
        AttemptOutcome::RetryableFailure(_) if attempt < cfg.attempts => {
            RetryDecision::Retry(cfg.backoff_after(attempt))
        }
        _ => RetryDecision::GiveUp,
    }
}
