//! Ordered fallback over interchangeable candidates (models, image providers).

use std::fmt::Display;
use std::future::Future;

use log::{debug, warn};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("no candidates to try")]
    Empty,

    #[error("all {attempts} candidates failed (last tried {last}: {reason})")]
    Exhausted {
        attempts: usize,
        last: String,
        reason: String,
    },
}

/// Try each candidate in order and return the first non-empty success.
///
/// An `Err` or an `Ok(None)` from `attempt` both move on to the next candidate.
/// Every candidate is tried at most once.
pub async fn first_success<C, T, E, F, Fut>(
    candidates: impl IntoIterator<Item = C>,
    mut attempt: F,
) -> Result<(C, T), ChainError>
where
    C: Display + Clone,
    E: Display,
    F: FnMut(C) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let mut attempts = 0;
    let mut last: Option<(String, String)> = None;

    for candidate in candidates {
        attempts += 1;
        let label = candidate.to_string();
        match attempt(candidate.clone()).await {
            Ok(Some(value)) => {
                debug!("Candidate {} succeeded after {} attempt(s)", label, attempts);
                return Ok((candidate, value));
            }
            Ok(None) => {
                debug!("Candidate {} returned nothing", label);
                last = Some((label, "empty result".to_string()));
            }
            Err(e) => {
                warn!("Candidate {} failed: {}", label, e);
                last = Some((label, e.to_string()));
            }
        }
    }

    match last {
        None => Err(ChainError::Empty),
        Some((last, reason)) => Err(ChainError::Exhausted {
            attempts,
            last,
            reason,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test]
    async fn test_exhaustion_after_exactly_n_attempts() {
        let calls = Cell::new(0);
        let result = first_success(["a", "b", "c"], |c| {
            calls.set(calls.get() + 1);
            async move {
                if c == "b" {
                    Ok::<Option<u8>, String>(None)
                } else {
                    Err(format!("{c} is down"))
                }
            }
        })
        .await;

        assert_eq!(calls.get(), 3);
        assert_eq!(
            result,
            Err(ChainError::Exhausted {
                attempts: 3,
                last: "c".to_string(),
                reason: "c is down".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_stops_at_first_success() {
        let calls = Cell::new(0);
        let result = first_success(vec![1, 2, 3, 4], |n| {
            calls.set(calls.get() + 1);
            async move {
                if n >= 2 {
                    Ok::<_, String>(Some(n * 10))
                } else {
                    Err("nope".to_string())
                }
            }
        })
        .await;

        assert_eq!(result, Ok((2, 20)));
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn test_empty_candidate_list() {
        let result = first_success(Vec::<String>::new(), |_| async {
            Ok::<Option<()>, String>(Some(()))
        })
        .await;
        assert_eq!(result, Err(ChainError::Empty));
    }
}
