//! Per-record transactions
//!
//! Every source record's writes run inside one short transaction. The wrapper logs how
//! long the connection was held so that a transaction accidentally spanning an external
//! call shows up in the logs.

use provdir_common::{Error, Result};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::time::Instant;

pub struct RecordTransaction<'c> {
    tx: Option<Transaction<'c, Sqlite>>,
    caller: &'static str,
    acquired_at: Instant,
}

impl<'c> RecordTransaction<'c> {
    /// Begin a transaction for one record
    pub async fn begin(pool: &'c SqlitePool, caller: &'static str) -> Result<Self> {
        let start = Instant::now();
        let tx = pool.begin().await?;

        let wait_ms = start.elapsed().as_millis() as u64;
        if wait_ms > 1000 {
            tracing::warn!(caller, wait_ms, "Slow connection acquisition, pool may be saturated");
        }

        Ok(Self {
            tx: Some(tx),
            caller,
            acquired_at: Instant::now(),
        })
    }

    /// Connection of the open transaction
    pub fn conn(&mut self) -> Result<&mut SqliteConnection> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| Error::Internal("transaction already finished".to_string()))
    }

    pub async fn commit(mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| Error::Internal("transaction already finished".to_string()))?;
        tx.commit().await?;
        self.log_release("commit");
        Ok(())
    }

    fn log_release(&self, how: &'static str) {
        let held_ms = self.acquired_at.elapsed().as_millis() as u64;
        if held_ms > 2000 {
            tracing::warn!(caller = self.caller, held_ms, how, "Long record transaction");
        } else {
            tracing::trace!(caller = self.caller, held_ms, how, "Record transaction released");
        }
    }
}

impl Drop for RecordTransaction<'_> {
    fn drop(&mut self) {
        // Dropping an open sqlx transaction rolls it back
        if self.tx.is_some() {
            self.log_release("drop");
        }
    }
}
