//! Database retry logic
//!
//! Two kinds of transient failure are retried:
//! - SQLite lock contention, with exponential backoff until a deadline
//! - unique-constraint conflicts from concurrent find-or-create, exactly once
//!   (the second attempt finds the row the other writer inserted)

use crate::error::ArcResult;
use std::future::Future;
use std::time::{Duration, Instant};

/// Retry an operation with exponential backoff while the database is locked.
///
/// **Backoff:** starts at 10ms, doubles per attempt, capped at 1000ms.
/// Non-lock errors are returned immediately. Once `max_wait_ms` has elapsed
/// the last lock error is returned.
pub async fn retry_on_lock<F, Fut, T>(
    operation_name: &str,
    max_wait_ms: u64,
    mut operation: F,
) -> ArcResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ArcResult<T>>,
{
    let start_time = Instant::now();
    let max_duration = Duration::from_millis(max_wait_ms);
    let mut attempt = 0u32;
    let mut backoff_ms = 10u64;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    let elapsed_ms = start_time.elapsed().as_millis();
                    if elapsed_ms > 2000 {
                        tracing::warn!(
                            operation = operation_name,
                            attempt,
                            elapsed_ms,
                            "Database operation succeeded after significant retry period (>2s)"
                        );
                    } else {
                        tracing::debug!(
                            operation = operation_name,
                            attempt,
                            elapsed_ms,
                            "Database operation succeeded after retry"
                        );
                    }
                }
                return Ok(result);
            }
            Err(err) if err.is_database_locked() => {
                let elapsed = start_time.elapsed();
                if elapsed >= max_duration {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = elapsed.as_millis(),
                        max_wait_ms,
                        "Database operation failed: max retry time exceeded"
                    );
                    return Err(err);
                }

                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    elapsed_ms = elapsed.as_millis(),
                    backoff_ms,
                    "Database locked, will retry after backoff"
                );

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(1000);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Run an operation, repeating it once if a unique index rejected an insert
pub async fn retry_on_conflict<F, Fut, T>(operation_name: &str, mut operation: F) -> ArcResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ArcResult<T>>,
{
    match operation().await {
        Err(err) if err.is_unique_violation() => {
            tracing::debug!(
                operation = operation_name,
                error = %err,
                "Unique constraint conflict, retrying as lookup"
            );
            operation().await
        }
        other => other,
    }
}
