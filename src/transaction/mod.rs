//! Transaction coordination for engines that run transactions as callbacks.
//!
//! Levels nest strictly: `start` opens a new innermost level, `commit` and
//! `rollback` close the innermost one, and every operation issued while a
//! level is open runs on that level's thread.

pub mod worker;

use std::sync::Arc;

use tracing::info;

use crate::driver::status::{isc, ydb::MAX_TP};
use crate::driver::{Backend, TpOutcome};
use crate::error::{DbxError, DbxResult};
use crate::request::Reply;
pub use worker::{Job, Worker};

#[derive(Default)]
pub struct Transactions {
    workers: Vec<Worker>,
}

impl Transactions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.workers.len()
    }

    pub fn is_active(&self) -> bool {
        !self.workers.is_empty()
    }

    /// Open a new innermost level and return the new depth.
    pub fn start(&mut self, backend: &Arc<dyn Backend>) -> DbxResult<usize> {
        if self.workers.len() >= MAX_TP {
            return Err(DbxError::backend(
                isc::FAILURE,
                format!("Maximum transaction depth ({}) reached", MAX_TP),
            ));
        }
        let level = self.workers.len() + 1;
        let worker = Worker::spawn(backend.clone(), level)?;
        self.workers.push(worker);
        Ok(level)
    }

    /// Run `job` on the innermost level.
    pub fn execute(&self, job: Job) -> DbxResult<Reply> {
        let worker = self.workers.last().ok_or(DbxError::NoTransaction)?;
        worker.execute(job)
    }

    /// Commit the innermost level. A transaction the engine rolled back
    /// (for example after a restart) is reported as a failure.
    pub fn commit(&mut self) -> DbxResult<()> {
        let worker = self.workers.pop().ok_or(DbxError::NoTransaction)?;
        let level = worker.level();
        match worker.finish(true)? {
            TpOutcome::Commit => {
                info!("Transaction level {} committed", level);
                Ok(())
            }
            TpOutcome::Rollback => Err(DbxError::TransactionRolledBack),
        }
    }

    pub fn rollback(&mut self) -> DbxResult<()> {
        let worker = self.workers.pop().ok_or(DbxError::NoTransaction)?;
        let level = worker.level();
        worker.finish(false)?;
        info!("Transaction level {} rolled back", level);
        Ok(())
    }

    /// Roll back every open level, innermost first.
    pub fn abandon(&mut self) {
        while let Some(worker) = self.workers.pop() {
            drop(worker);
        }
    }
}

impl Drop for Transactions {
    fn drop(&mut self) {
        self.abandon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::MemoryBackend;
    use crate::driver::DbType;
    use dbx_protocol::Argument;

    fn ydb() -> (Arc<MemoryBackend>, Arc<dyn Backend>) {
        let memory = Arc::new(MemoryBackend::new(DbType::YottaDb));
        let backend: Arc<dyn Backend> = memory.clone();
        (memory, backend)
    }

    fn set_job(global: &'static str, value: &'static str) -> Job {
        Box::new(move |b: &dyn Backend| {
            b.set(global, &[], &Argument::new(value.as_bytes()))?;
            Ok(Reply::ok())
        })
    }

    #[test]
    fn test_commit_keeps_changes() {
        let (memory, backend) = ydb();
        let mut tx = Transactions::new();
        assert_eq!(tx.start(&backend).unwrap(), 1);
        tx.execute(set_job("^a", "1")).unwrap();
        tx.commit().unwrap();
        assert_eq!(tx.depth(), 0);
        assert_eq!(memory.get("^a", &[]).unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_rollback_discards_changes() {
        let (memory, backend) = ydb();
        let mut tx = Transactions::new();
        tx.start(&backend).unwrap();
        tx.execute(set_job("^a", "1")).unwrap();
        tx.rollback().unwrap();
        assert_eq!(memory.get("^a", &[]).unwrap(), None);
    }

    #[test]
    fn test_no_transaction() {
        let mut tx = Transactions::new();
        assert!(matches!(tx.commit(), Err(DbxError::NoTransaction)));
        assert!(matches!(tx.rollback(), Err(DbxError::NoTransaction)));
        assert!(matches!(
            tx.execute(set_job("^a", "1")),
            Err(DbxError::NoTransaction)
        ));
    }

    #[test]
    fn test_restart_reports_rollback() {
        let (memory, backend) = ydb();
        memory.restart_next_commits(1);
        let mut tx = Transactions::new();
        tx.start(&backend).unwrap();
        tx.execute(set_job("^a", "1")).unwrap();
        assert!(matches!(tx.commit(), Err(DbxError::TransactionRolledBack)));
        assert_eq!(memory.get("^a", &[]).unwrap(), None);
        assert!(!backend.restart_pending());
    }

    #[test]
    fn test_drop_rolls_back() {
        let (memory, backend) = ydb();
        {
            let mut tx = Transactions::new();
            tx.start(&backend).unwrap();
            tx.execute(set_job("^a", "1")).unwrap();
        }
        assert_eq!(memory.get("^a", &[]).unwrap(), None);
    }

    #[test]
    fn test_unsupported_backend_fails_to_start() {
        let memory = Arc::new(MemoryBackend::new(DbType::Gtm));
        let backend: Arc<dyn Backend> = memory;
        let mut tx = Transactions::new();
        let err = tx.start(&backend).unwrap_err();
        assert_eq!(err.error_code(), 2020);
        assert_eq!(tx.depth(), 0);
    }
}
