//! Ordered strategy driver.
//!
//! Every fallback chain in shadowbox (clone strategies, ownership fixes,
//! package-manager installs, branch resets) is an ordered slice of strategy
//! values. [`first_success`] tries each in turn, stops at the first success and
//! keeps the reasons of earlier failures for diagnostics.

use std::fmt;
use std::future::Future;

use tracing::debug;

/// One strategy that did not work out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAttempt {
    pub strategy: String,
    pub reason: String,
}

/// Every strategy in a chain failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, thiserror::Error)]
pub struct ExhaustedError {
    pub attempts: Vec<FailedAttempt>,
}

impl fmt::Display for ExhaustedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attempts.is_empty() {
            return write!(f, "no strategies to try");
        }
        write!(f, "all strategies failed (")?;
        for (i, attempt) in self.attempts.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", attempt.strategy, attempt.reason)?;
        }
        write!(f, ")")
    }
}

/// Run `run` for each strategy in order until one succeeds.
///
/// Returns the winning strategy together with its value.
pub async fn first_success<S, T, F, Fut>(
    strategies: &[S],
    mut run: F,
) -> Result<(S, T), ExhaustedError>
where
    S: Copy + fmt::Display,
    F: FnMut(S) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempts = Vec::new();
    for &strategy in strategies {
        match run(strategy).await {
            Ok(value) => return Ok((strategy, value)),
            Err(e) => {
                debug!(strategy = %strategy, error = %format!("{e:#}"), "strategy failed");
                attempts.push(FailedAttempt {
                    strategy: strategy.to_string(),
                    reason: format!("{e:#}"),
                });
            }
        }
    }
    Err(ExhaustedError { attempts })
}
