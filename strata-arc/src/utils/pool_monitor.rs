//! Connection pool monitoring
//!
//! Store and archiving transactions go through [`begin_monitored`] so that
//! long-held connections (pool saturation under ingest load) show up in logs.

use crate::error::{ArcError, ArcResult};
use sqlx::{Sqlite, SqliteConnection, Transaction};
use std::time::Instant;

/// Transaction wrapper that logs how long the connection was held
pub struct MonitoredTransaction<'c> {
    tx: Option<Transaction<'c, Sqlite>>,
    caller: &'static str,
    acquired_at: Instant,
}

fn consumed(caller: &'static str) -> ArcError {
    ArcError::Database(sqlx::Error::Protocol(format!(
        "transaction for {} already consumed",
        caller
    )))
}

fn log_release(caller: &'static str, held_ms: u128, how: &'static str) {
    if held_ms > 2000 {
        tracing::warn!(
            caller,
            held_ms,
            how,
            "LONG TRANSACTION - Connection held for extended period"
        );
    } else if held_ms > 1000 {
        tracing::info!(caller, held_ms, how, "Transaction held longer than expected (>1s)");
    } else {
        tracing::debug!(caller, held_ms, how, "Connection released");
    }
}

impl<'c> MonitoredTransaction<'c> {
    pub async fn commit(mut self) -> ArcResult<()> {
        let tx = self.tx.take().ok_or_else(|| consumed(self.caller))?;
        tx.commit().await?;
        log_release(self.caller, self.acquired_at.elapsed().as_millis(), "commit");
        Ok(())
    }

    pub async fn rollback(mut self) -> ArcResult<()> {
        let tx = self.tx.take().ok_or_else(|| consumed(self.caller))?;
        tx.rollback().await?;
        log_release(self.caller, self.acquired_at.elapsed().as_millis(), "rollback");
        Ok(())
    }

    /// Connection of the open transaction
    pub fn conn(&mut self) -> ArcResult<&mut SqliteConnection> {
        let caller = self.caller;
        match self.tx.as_mut() {
            Some(tx) => Ok(&mut **tx),
            None => Err(consumed(caller)),
        }
    }
}

impl<'c> Drop for MonitoredTransaction<'c> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            let held_ms = self.acquired_at.elapsed().as_millis();
            if held_ms > 2000 {
                tracing::warn!(
                    caller = self.caller,
                    held_ms,
                    "LONG TRANSACTION DROPPED - Connection held then released via Drop"
                );
            } else {
                tracing::debug!(caller = self.caller, held_ms, "Connection released (drop)");
            }
        }
    }
}

/// Begin a transaction with acquisition/hold timing logs
pub async fn begin_monitored<'c>(
    pool: &'c sqlx::SqlitePool,
    caller: &'static str,
) -> ArcResult<MonitoredTransaction<'c>> {
    let start = Instant::now();
    let tx = pool.begin().await?;

    let wait_ms = start.elapsed().as_millis();
    if wait_ms > 1000 {
        tracing::warn!(
            caller,
            wait_ms,
            "SLOW CONNECTION ACQUISITION - Pool may be saturated"
        );
    } else {
        tracing::debug!(caller, wait_ms, "Connection acquired");
    }

    Ok(MonitoredTransaction {
        tx: Some(tx),
        caller,
        acquired_at: Instant::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;

    #[tokio::test]
    async fn test_commit_persists_and_rollback_discards() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query("CREATE TABLE t (v INTEGER)").execute(&pool).await.unwrap();

        let mut tx = begin_monitored(&pool, "test::commit").await.unwrap();
        sqlx::query("INSERT INTO t (v) VALUES (1)")
            .execute(tx.conn().unwrap())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = begin_monitored(&pool, "test::rollback").await.unwrap();
        sqlx::query("INSERT INTO t (v) VALUES (2)")
            .execute(tx.conn().unwrap())
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM t")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
