use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, RecvTimeoutError};
use log::warn;
use rayon::prelude::*;

use crate::core::domain::{Configuration, Sample};
use crate::core::error::EvaluationError;
use crate::core::params::EvaluationPolicy;

/// A generic interface for the expensive, trusted physics engine.
/// Implementations must be Thread-Safe (Sync) and deterministic for a given configuration.
pub trait ReferenceEvaluator: Send + Sync {
    /// Single-point energy and forces of a configuration.
    fn evaluate(&self, configuration: &Configuration) -> Result<Sample, EvaluationError>;

    /// Returns the name of the engine (e.g., "GULP 6.1").
    fn name(&self) -> &str;
}

/// Runs one evaluation on a detached worker, giving up after `timeout`.
///
/// A timed-out worker is not cancelled; it finishes in the background and its
/// result is dropped.
fn evaluate_once(
    evaluator: &Arc<dyn ReferenceEvaluator>,
    configuration: &Configuration,
    policy: &EvaluationPolicy,
) -> Result<Sample, EvaluationError> {
    let (tx, rx) = bounded(1);
    let worker = Arc::clone(evaluator);
    let config = configuration.clone();

    thread::Builder::new()
        .name("Reference-Eval".to_string())
        .spawn(move || {
            let _ = tx.send(worker.evaluate(&config));
        })
        .map_err(|e| EvaluationError::Process(format!("failed to spawn evaluation thread: {}", e)))?;

    match rx.recv_timeout(policy.timeout()) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(EvaluationError::Timeout(policy.timeout_secs)),
        Err(RecvTimeoutError::Disconnected) => Err(EvaluationError::Solver(format!(
            "{} terminated without a result",
            evaluator.name()
        ))),
    }
}

/// Evaluates with retries and a per-attempt timeout.
/// Fails with `RetriesExhausted` once `policy.attempts()` attempts have failed.
pub fn evaluate_with_policy(
    evaluator: &Arc<dyn ReferenceEvaluator>,
    configuration: &Configuration,
    policy: &EvaluationPolicy,
) -> Result<Sample, EvaluationError> {
    let attempts = policy.attempts();
    let mut last = None;

    for attempt in 1..=attempts {
        match evaluate_once(evaluator, configuration, policy) {
            Ok(sample) => return Ok(sample),
            Err(e) => {
                warn!("{} attempt {}/{} failed: {}", evaluator.name(), attempt, attempts, e);
                last = Some(e);
            }
        }
    }

    Err(EvaluationError::RetriesExhausted {
        attempts,
        last: Box::new(last.unwrap_or_else(|| EvaluationError::Solver("no attempt made".to_string()))),
    })
}

/// Evaluates independent configurations in parallel. Results keep the input order.
pub fn evaluate_batch(
    evaluator: &Arc<dyn ReferenceEvaluator>,
    configurations: &[Configuration],
    policy: &EvaluationPolicy,
) -> Vec<Result<Sample, EvaluationError>> {
    configurations
        .par_iter()
        .map(|config| evaluate_with_policy(evaluator, config, policy))
        .collect()
}
