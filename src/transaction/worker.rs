//! One thread per open transaction level.
//!
//! The engine runs a transaction as a callback on the thread that started
//! it, so each level gets a thread that enters the callback and then waits
//! for work. Work, commit and rollback arrive over a rendezvous channel and
//! each one is answered before the caller continues.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::driver::{Backend, TpOutcome};
use crate::error::{DbxError, DbxResult};
use crate::request::Reply;

/// Stack size of a transaction thread
pub const STACK_SIZE: usize = 0xf0000;

/// Work executed on a transaction thread
pub type Job = Box<dyn FnOnce(&dyn Backend) -> DbxResult<Reply> + Send>;

enum Task {
    Run(Job),
    Commit,
    Rollback,
}

enum Event {
    Started,
    Reply(DbxResult<Reply>),
    Finished(DbxResult<TpOutcome>),
}

fn stopped(level: usize) -> DbxError {
    DbxError::backend(
        crate::driver::status::isc::FAILURE,
        format!("Transaction thread for level {} has stopped", level),
    )
}

pub struct Worker {
    level: usize,
    tasks: SyncSender<Task>,
    events: Receiver<Event>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Start the thread and wait until its transaction is open.
    pub fn spawn(backend: Arc<dyn Backend>, level: usize) -> DbxResult<Self> {
        let (task_tx, task_rx) = sync_channel(0);
        let (event_tx, event_rx) = sync_channel(0);

        let handle = thread::Builder::new()
            .name(format!("dbx-tp-{}", level))
            .stack_size(STACK_SIZE)
            .spawn(move || run(backend, level, task_rx, event_tx))?;

        let mut worker = Self {
            level,
            tasks: task_tx,
            events: event_rx,
            handle: Some(handle),
        };

        match worker.events.recv() {
            Ok(Event::Started) => {
                debug!("Transaction level {} started", level);
                Ok(worker)
            }
            Ok(Event::Finished(result)) => {
                worker.join();
                Err(result.err().unwrap_or_else(|| stopped(level)))
            }
            Ok(Event::Reply(_)) | Err(_) => {
                worker.join();
                Err(stopped(level))
            }
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    /// Run `job` inside this level's transaction.
    pub fn execute(&self, job: Job) -> DbxResult<Reply> {
        self.tasks
            .send(Task::Run(job))
            .map_err(|_| stopped(self.level))?;
        match self.events.recv() {
            Ok(Event::Reply(reply)) => reply,
            Ok(Event::Finished(Err(e))) => Err(e),
            Ok(_) | Err(_) => Err(stopped(self.level)),
        }
    }

    /// End the transaction and wait for the thread to exit.
    pub fn finish(mut self, commit: bool) -> DbxResult<TpOutcome> {
        let task = if commit { Task::Commit } else { Task::Rollback };
        self.tasks.send(task).map_err(|_| stopped(self.level))?;
        let result = loop {
            match self.events.recv() {
                Ok(Event::Finished(result)) => break result,
                Ok(_) => continue,
                Err(_) => break Err(stopped(self.level)),
            }
        };
        self.join();
        result
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Transaction thread for level {} panicked", self.level);
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.handle.is_none() {
            return;
        }
        debug!("Abandoning transaction level {}", self.level);
        let _ = self.tasks.send(Task::Rollback);
        while let Ok(event) = self.events.recv() {
            if matches!(event, Event::Finished(_)) {
                break;
            }
        }
        self.join();
    }
}

fn run(backend: Arc<dyn Backend>, level: usize, tasks: Receiver<Task>, events: SyncSender<Event>) {
    let mut started = false;
    let mut body = || {
        if started && backend.restart_pending() {
            debug!("Transaction level {} restarted, rolling back", level);
            return TpOutcome::Rollback;
        }
        if !started {
            started = true;
            if events.send(Event::Started).is_err() {
                return TpOutcome::Rollback;
            }
        }
        loop {
            match tasks.recv() {
                Ok(Task::Run(job)) => {
                    let reply = job(backend.as_ref());
                    if events.send(Event::Reply(reply)).is_err() {
                        return TpOutcome::Rollback;
                    }
                }
                Ok(Task::Commit) => return TpOutcome::Commit,
                Ok(Task::Rollback) | Err(_) => return TpOutcome::Rollback,
            }
        }
    };

    let result = backend.run_transaction(&mut body);
    debug!("Transaction level {} finished: {:?}", level, result.as_ref().ok());
    let _ = events.send(Event::Finished(result));
}
