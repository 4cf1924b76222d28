//! Asynchronous task submission.
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;

use log::{debug, error};
use serde_json::Value;

use super::CollabError;

/// Submits named units of work to run in the background.
pub trait TaskQueue {
    type Handle: TaskHandle;

    fn submit(&self, name: &str, args: Vec<Value>) -> Result<Self::Handle, CollabError>;
}

/// Completion handle of a submitted task.
pub trait TaskHandle {
    fn is_ready(&self) -> bool;
    /// Wait for the task and return its value.
    fn result(self) -> Result<Value, CollabError>;
}

pub type TaskFn = Arc<dyn Fn(Vec<Value>) -> Result<Value, String> + Send + Sync>;

type Outcome = Result<Value, String>;

#[derive(Default)]
struct Slot {
    outcome: Mutex<Option<Outcome>>,
    ready: Condvar,
}

/// Runs every submission on its own thread.
#[derive(Default, Clone)]
pub struct ThreadTaskQueue {
    tasks: Arc<RwLock<HashMap<String, TaskFn>>>,
}

impl ThreadTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: &str, task: F)
    where
        F: Fn(Vec<Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        tasks.insert(name.to_string(), Arc::new(task));
    }
}

impl TaskQueue for ThreadTaskQueue {
    type Handle = ThreadTaskHandle;

    fn submit(&self, name: &str, args: Vec<Value>) -> Result<ThreadTaskHandle, CollabError> {
        let task = {
            let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
            tasks
                .get(name)
                .cloned()
                .ok_or_else(|| CollabError::UnknownTask(name.to_string()))?
        };
        let slot = Arc::new(Slot::default());
        let worker_slot = Arc::clone(&slot);
        let task_name = name.to_string();
        debug!("submitting task {}", task_name);
        thread::spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| task(args)))
                .unwrap_or_else(|_| Err(format!("task {} panicked", task_name)));
            if let Err(err) = &outcome {
                error!("task {} failed: {}", task_name, err);
            }
            let mut guard = worker_slot.outcome.lock().unwrap_or_else(|e| e.into_inner());
            *guard = Some(outcome);
            worker_slot.ready.notify_all();
        });
        Ok(ThreadTaskHandle { slot })
    }
}

pub struct ThreadTaskHandle {
    slot: Arc<Slot>,
}

impl TaskHandle for ThreadTaskHandle {
    fn is_ready(&self) -> bool {
        self.slot
            .outcome
            .lock()
            .map_or(false, |outcome| outcome.is_some())
    }

    fn result(self) -> Result<Value, CollabError> {
        let mut guard = self.slot.outcome.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(outcome) = guard.take() {
                return outcome.map_err(CollabError::TaskFailed);
            }
            guard = self.slot.ready.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
    }
}
