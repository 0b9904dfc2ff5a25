//! Retry and catch policy for state-level errors.
//!
//! Given a `StateError` and the state's `Retry`/`Catch` lists, decides
//! whether to run the state again after a delay, hand the error payload to a
//! catcher, or give up.

use std::time::Duration;

use serde_json::Value;
use stepwise_types::error::{StateError, names};
use stepwise_types::workflow::{Catcher, DataPath, Retrier};

// ---------------------------------------------------------------------------
// RecoveryDecision
// ---------------------------------------------------------------------------

/// What to do after a state-level error.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryDecision {
    /// Sleep for `delay`, then run the state again. `attempt` is the 1-based
    /// retry number for the matched retrier.
    Retry { delay: Duration, attempt: u32 },
    /// Continue at `next` with `payload` placed at `result_path` in the raw
    /// state input.
    Catch {
        next: String,
        result_path: DataPath,
        payload: Value,
    },
    /// No retrier or catcher handles the error.
    Fatal,
}

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Stateless retry/catch handler.
///
/// No internal state: the caller owns the per-retrier attempt counters and
/// passes them in on every decision.
pub struct RetryHandler;

impl RetryHandler {
    /// Decide how to recover from `error`.
    ///
    /// Only the first retrier whose `ErrorEquals` matches is considered. When
    /// it still has attempts left its counter in `attempts` (one slot per
    /// retrier) is incremented and a retry is returned. Once exhausted, the
    /// first matching catcher applies.
    pub fn decide(
        error: &StateError,
        retriers: &[Retrier],
        catchers: &[Catcher],
        attempts: &mut [u32],
    ) -> RecoveryDecision {
        let matched = retriers
            .iter()
            .enumerate()
            .find(|(_, r)| Self::matches(&r.error_equals, &error.error));

        if let Some((i, retrier)) = matched {
            if let Some(count) = attempts.get_mut(i) {
                if *count < retrier.max_attempts {
                    *count += 1;
                    return RecoveryDecision::Retry {
                        delay: Self::backoff(retrier, *count),
                        attempt: *count,
                    };
                }
            }
        }

        catchers
            .iter()
            .find(|c| Self::matches(&c.error_equals, &error.error))
            .map_or(RecoveryDecision::Fatal, |catcher| RecoveryDecision::Catch {
                next: catcher.next.clone(),
                result_path: catcher.result_path.clone(),
                payload: error.to_payload(),
            })
    }

    /// `ErrorEquals` matches on an exact name or the `States.ALL` wildcard.
    pub fn matches(error_equals: &[String], error: &str) -> bool {
        error_equals.iter().any(|e| e == names::ALL || e == error)
    }

    /// `IntervalSeconds * BackoffRate^(attempt-1)`, capped at
    /// `MaxDelaySeconds`.
    pub fn backoff(retrier: &Retrier, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let mut secs = retrier.interval_seconds as f64 * retrier.backoff_rate.powi(exponent);
        if let Some(max) = retrier.max_delay_seconds {
            secs = secs.min(max as f64);
        }
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
