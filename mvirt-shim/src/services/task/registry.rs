//! Task registry - the single owner of task records.
//!
//! All mutations take the exclusive lock, reads take the shared lock. No
//! method blocks on I/O or on a task's completion; blocking waits are built
//! on top of the [`Completion`] handed out by [`TaskRegistry::completion`].
//! Records never leave the lock: readers get copies.

use super::completion::Completion;
use crate::error::{Error, Result};
use crate::utils::fifo::StdioPaths;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Final outcome of a task's process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub status: u32,
    pub exited_at: DateTime<Utc>,
}

/// Registry entry for one task.
#[derive(Debug)]
pub struct TaskRecord {
    id: String,
    pid: u32,
    bundle: String,
    stdio: StdioPaths,
    completion: Completion,
    /// Written once by the reaper, under the exclusive lock.
    exit: Option<ExitInfo>,
}

impl TaskRecord {
    pub fn new(id: String, pid: u32, bundle: String, stdio: StdioPaths) -> Self {
        Self {
            id,
            pid,
            bundle,
            stdio,
            completion: Completion::new(),
            exit: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn completion(&self) -> &Completion {
        &self.completion
    }

    pub fn is_complete(&self) -> bool {
        self.completion.is_complete()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            pid: self.pid,
            bundle: self.bundle.clone(),
            stdio: self.stdio.clone(),
            exit: self.exit,
        }
    }
}

/// Point-in-time copy of a task record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub id: String,
    pub pid: u32,
    pub bundle: String,
    pub stdio: StdioPaths,
    /// Set once the process has been reaped.
    pub exit: Option<ExitInfo>,
}

impl TaskSnapshot {
    pub fn is_running(&self) -> bool {
        self.exit.is_none()
    }
}

/// Lock-guarded map of task id to record.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, TaskRecord>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, TaskRecord>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, TaskRecord>> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new task. Fails if the id is taken.
    pub fn insert(&self, record: TaskRecord) -> Result<()> {
        let mut tasks = self.write();
        if tasks.contains_key(&record.id) {
            return Err(Error::AlreadyExists(record.id));
        }
        tasks.insert(record.id.clone(), record);
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    /// Copy out the current state of a task.
    pub fn get(&self, id: &str) -> Result<TaskSnapshot> {
        self.with_task(id, TaskRecord::snapshot)
    }

    /// Run `f` against a record while holding the shared lock.
    ///
    /// The reaper cannot release a task's pid while `f` runs, so a record
    /// observed as not complete still owns its pid for the duration of `f`.
    pub fn with_task<R>(&self, id: &str, f: impl FnOnce(&TaskRecord) -> R) -> Result<R> {
        let tasks = self.read();
        let record = tasks
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        Ok(f(record))
    }

    /// Handle to a task's completion signal, for waiting outside the lock.
    pub fn completion(&self, id: &str) -> Result<Completion> {
        self.with_task(id, |record| record.completion.clone())
    }

    /// Remove a task whose process has been reaped.
    pub fn remove(&self, id: &str) -> Result<(u32, ExitInfo)> {
        let mut tasks = self.write();
        let record = tasks
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let Some(exit) = record.exit.filter(|_| record.is_complete()) else {
            return Err(Error::FailedPrecondition(format!(
                "init process {} is not done yet",
                record.pid
            )));
        };
        let pid = record.pid;

        tasks.remove(id);
        Ok((pid, exit))
    }

    /// True iff every registered task has completed.
    pub fn all_completed(&self) -> bool {
        all_completed(&self.read())
    }

    /// Record a task's exit.
    ///
    /// `reap` runs under the exclusive lock and returns the decoded exit
    /// status; it must release the pid only then. Returns whether every
    /// registered task has now completed.
    pub fn complete(&self, id: &str, reap: impl FnOnce() -> u32) -> Result<bool> {
        let mut tasks = self.write();
        let status = reap();

        let record = tasks
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if record.exit.is_none() {
            record.exit = Some(ExitInfo {
                status,
                exited_at: Utc::now(),
            });
        }
        record.completion.complete();

        Ok(all_completed(&tasks))
    }
}

fn all_completed(tasks: &HashMap<String, TaskRecord>) -> bool {
    tasks.values().all(TaskRecord::is_complete)
}
