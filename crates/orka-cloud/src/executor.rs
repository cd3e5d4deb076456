//! A bounded pool for one-shot jobs plus fixed-delay timers for maintenance.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{CloudError, Result};

pub struct AsyncExecutor {
    name: String,
    handle: Handle,
    permits: Arc<Semaphore>,
    jobs: Mutex<JoinSet<()>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl AsyncExecutor {
    /// Creates a pool running at most `threads` jobs at once.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(name: impl Into<String>, threads: usize) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| CloudError::Internal(format!("executor needs a Tokio runtime: {e}")))?;
        Ok(Self {
            name: name.into(),
            handle,
            permits: Arc::new(Semaphore::new(threads.max(1))),
            jobs: Mutex::new(JoinSet::new()),
            timers: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Queues a job. It starts once a worker slot frees up.
    pub fn submit<F>(&self, job: &str, fut: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.submit_after(job, std::future::ready(()), fut)
    }

    /// Queues a job that claims a worker slot only after `turn` resolves.
    pub fn submit_after<W, F>(&self, job: &str, turn: W, fut: F) -> Result<()>
    where
        W: Future<Output = ()> + Send + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shut_down() {
            return Err(CloudError::Internal(format!(
                "executor {} is shut down",
                self.name
            )));
        }

        let permits = self.permits.clone();
        let span = info_span!("job", executor = %self.name, job = %job);
        let task = async move {
            turn.await;
            let Ok(_permit) = permits.acquire_owned().await else {
                debug!("Executor closed before job started");
                return;
            };
            fut.await;
        }
        .instrument(span);

        let mut jobs = self
            .jobs
            .lock()
            .map_err(|e| CloudError::LockPoisoned(e.to_string()))?;
        while jobs.try_join_next().is_some() {}
        jobs.spawn_on(task, &self.handle);
        Ok(())
    }

    /// Runs `task` after `initial_delay`, then again `delay` after each run completes.
    ///
    /// The timer ends once a run returns `false`.
    pub fn schedule_with_fixed_delay<F, Fut>(
        &self,
        job: &str,
        initial_delay: Duration,
        delay: Duration,
        task: F,
    ) -> Result<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        if self.is_shut_down() {
            return Err(CloudError::Internal(format!(
                "executor {} is shut down",
                self.name
            )));
        }

        let span = info_span!("timer", executor = %self.name, job = %job);
        let handle = self.handle.spawn(
            async move {
                tokio::time::sleep(initial_delay).await;
                while task().await {
                    tokio::time::sleep(delay).await;
                }
                debug!("Periodic job stopped");
            }
            .instrument(span),
        );

        self.timers
            .lock()
            .map_err(|e| CloudError::LockPoisoned(e.to_string()))?
            .push(handle);
        debug!(executor = %self.name, job, ?delay, "Scheduled periodic job");
        Ok(())
    }

    /// Number of submitted jobs not yet finished.
    pub fn pending_jobs(&self) -> usize {
        self.jobs.lock().map(|j| j.len()).unwrap_or(0)
    }

    /// Aborts queued and running jobs and timers, then waits up to `drain` for them to unwind.
    pub async fn shutdown(&self, drain: Duration) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(executor = %self.name, "Shutting down executor");
        self.permits.close();

        let timers = match self.timers.lock() {
            Ok(mut timers) => std::mem::take(&mut *timers),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for timer in &timers {
            timer.abort();
        }

        let mut jobs = match self.jobs.lock() {
            Ok(mut jobs) => std::mem::take(&mut *jobs),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        jobs.abort_all();

        let drained = tokio::time::timeout(drain, async {
            while jobs.join_next().await.is_some() {}
            for timer in timers {
                let _ = timer.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(executor = %self.name, "Executor did not drain in time");
        }
    }
}
