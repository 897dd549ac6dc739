//! Executors and helpers shared by the scheduler tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::executor::{ExecutionOutput, ExecutorError, JobExecutor};
use super::job::Job;

type ExecuteFn = dyn Fn(&Job) -> Result<ExecutionOutput, ExecutorError> + Send + Sync;

/// Executor that answers every job from a closure.
pub struct FnExecutor {
    respond: Box<ExecuteFn>,
    seen: Mutex<Vec<Job>>,
}

impl FnExecutor {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&Job) -> Result<ExecutionOutput, ExecutorError> + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(respond),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Every job exits with `code` after writing `diagnostics`.
    pub fn exit(code: i32, diagnostics: &'static str) -> Self {
        Self::new(move |_| Ok(ExecutionOutput::new(Some(code), diagnostics, Duration::ZERO)))
    }

    pub fn calls(&self) -> usize {
        self.seen().len()
    }

    pub fn seen(&self) -> Vec<Job> {
        self.seen.lock().expect("seen lock").clone()
    }
}

#[async_trait]
impl JobExecutor for FnExecutor {
    async fn execute(&self, job: &Job) -> Result<ExecutionOutput, ExecutorError> {
        self.seen.lock().expect("seen lock").push(job.clone());
        (self.respond)(job)
    }
}

/// Executor whose jobs block until `release()` is called.
pub struct GatedExecutor {
    output: ExecutionOutput,
    gate: Semaphore,
    calls: AtomicUsize,
}

impl GatedExecutor {
    pub fn new(output: ExecutionOutput) -> Self {
        Self {
            output,
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Lets blocked and future jobs finish.
    pub fn release(&self) {
        self.gate.add_permits(1);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobExecutor for GatedExecutor {
    async fn execute(&self, _job: &Job) -> Result<ExecutionOutput, ExecutorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _permit = self.gate.acquire().await.expect("gate closed");
        Ok(self.output.clone())
    }
}

/// Polls `condition` every 10ms of (possibly paused) tokio time.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 10s");
}
