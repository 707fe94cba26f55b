use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{Arc, MutexGuard},
};

use futures_util::FutureExt;
use tokio::{
    sync::{Mutex, MutexGuard as AsyncMutexGuard, Notify, mpsc},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::types::{
    Dispatcher, DispatcherConfig, Executor, LockTable, QueuedJob, ServerLease,
};
use crate::{
    error::{Error, Result},
    store::Store,
    tasks::{
        lifecycle::{Lifecycle, Progress},
        types::{Job, JobError, JobPatch, JobPayload, JobStatus, JobType, Server},
    },
};

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<Mutex<()>>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait until no other job holds `server_id`, then hold it.
    pub async fn acquire(self: &Arc<Self>, server_id: Uuid) -> ServerLease {
        let slot = self.entries().entry(server_id).or_default().clone();
        let guard = slot.lock_owned().await;
        ServerLease {
            table: self.clone(),
            server_id,
            guard: Some(guard),
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ServerLease {
    fn drop(&mut self) {
        let mut entries = self.table.entries();
        drop(self.guard.take());
        // Waiters clone the slot under the table lock, so a count of one means idle.
        if entries
            .get(&self.server_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            entries.remove(&self.server_id);
        }
    }
}

impl Executor {
    async fn run(&self, queued: QueuedJob) {
        let _lease = self.locks.acquire(queued.server_id).await;

        let job = match self
            .store
            .update_job(queued.job_id, JobPatch::status(JobStatus::Running))
            .await
        {
            Ok(job) => job,
            Err(err) => {
                error!(job_id = %queued.job_id, error = %err, "Could not mark job running");
                self.finish(&queued).await;
                return;
            }
        };

        info!(
            job_id = %job.id,
            server_id = %job.server_id,
            op = %job.job_type,
            "Job started"
        );

        let mut progress = Progress::new(job.id, self.store.clone());
        let result = AssertUnwindSafe(self.lifecycle.execute(&job, &mut progress))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(Error::unknown("job execution", "worker panicked")));

        let patch = match result {
            Ok(outcome) => {
                info!(
                    job_id = %job.id,
                    server_id = %job.server_id,
                    container_errors = outcome.container_errors,
                    "Job succeeded"
                );
                JobPatch {
                    status: Some(JobStatus::Success),
                    progress: Some(100),
                    container_errors: Some(outcome.container_errors),
                    ..Default::default()
                }
            }
            Err(err) => {
                error!(
                    job_id = %job.id,
                    server_id = %job.server_id,
                    kind = ?err.kind(),
                    progress = progress.current(),
                    error = %err,
                    "Job failed"
                );
                JobPatch {
                    status: Some(JobStatus::Failed),
                    error: Some(JobError {
                        kind: err.kind(),
                        message: err.to_string(),
                        trace: err.trace(),
                        progress: progress.current(),
                    }),
                    ..Default::default()
                }
            }
        };

        if let Err(err) = self.store.update_job(job.id, patch).await {
            error!(job_id = %job.id, error = %err, "Could not record job result");
        }
        self.finish(&queued).await;
    }

    async fn finish(&self, queued: &QueuedJob) {
        let mut active = self.active.lock().await;
        if active.get(&queued.server_id) == Some(&queued.job_id) {
            active.remove(&queued.server_id);
            self.released.notify_waiters();
        }
    }
}

async fn run_worker(
    index: usize,
    executor: Arc<Executor>,
    queue: Arc<Mutex<mpsc::Receiver<QueuedJob>>>,
) {
    info!(worker = index, "Worker started");
    loop {
        let next = queue.lock().await.recv().await;
        match next {
            Some(queued) => executor.run(queued).await,
            None => break,
        }
    }
    info!(worker = index, "Worker stopped, queue closed");
}

impl Dispatcher {
    /// Spawn the worker pool. Workers exit once every `Dispatcher` clone is dropped.
    pub fn start(
        store: Arc<dyn Store>,
        lifecycle: Arc<Lifecycle>,
        config: DispatcherConfig,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let executor = Arc::new(Executor {
            store,
            lifecycle,
            active: Mutex::new(HashMap::new()),
            released: Notify::new(),
            locks: Arc::new(LockTable::new()),
        });

        let handles = (0..config.workers.max(1))
            .map(|index| tokio::spawn(run_worker(index, executor.clone(), rx.clone())))
            .collect();

        (
            Dispatcher {
                executor,
                queue: tx,
            },
            handles,
        )
    }

    /// Wait until `server_id` has no PENDING or RUNNING job, keeping the admission lock.
    async fn admit(&self, server_id: Uuid) -> AsyncMutexGuard<'_, HashMap<Uuid, Uuid>> {
        let executor = &self.executor;
        loop {
            let active = executor.active.lock().await;
            let Some(job_id) = active.get(&server_id).copied() else {
                return active;
            };
            // Registered before the lock is released so a concurrent finish is not missed.
            let released = executor.released.notified();
            drop(active);
            debug!(server_id = %server_id, job_id = %job_id, "Waiting for active job to finish");
            released.await;
        }
    }

    /// Accept a job for `server_id`. A job already in flight for the server is waited
    /// out first, so at most one job per server is ever PENDING or RUNNING.
    pub async fn enqueue_job(
        &self,
        server_id: Uuid,
        job_type: JobType,
        payload: JobPayload,
    ) -> Result<Uuid> {
        if let Some(spec) = &payload.server {
            spec.validate()?;
        }
        let executor = &self.executor;
        let mut active = self.admit(server_id).await;

        let existing = executor.store.load_server(server_id).await?;
        if job_type != JobType::Create && existing.is_none() {
            return Err(Error::ServerNotFound(server_id));
        }
        executor
            .lifecycle
            .check(server_id, existing.as_ref(), job_type)?;

        if job_type == JobType::Create {
            let spec = payload.server.ok_or_else(|| {
                Error::PreconditionFailed("CREATE requires a server spec".to_string())
            })?;
            let server =
                Server::from_spec(server_id, spec, executor.lifecycle.data_dir_for(server_id));
            executor.store.save_server(&server).await?;
        }

        let job = Job::new(server_id, job_type);
        executor.store.create_job(&job).await?;
        active.insert(server_id, job.id);
        drop(active);

        let queued = QueuedJob {
            job_id: job.id,
            server_id,
            job_type,
        };
        if self.queue.send(queued).await.is_err() {
            warn!(job_id = %job.id, "Worker pool is gone, failing job");
            let err = Error::unknown("enqueue", "dispatcher is shut down");
            let patch = JobPatch {
                status: Some(JobStatus::Failed),
                error: Some(JobError {
                    kind: err.kind(),
                    message: err.to_string(),
                    trace: Vec::new(),
                    progress: 0,
                }),
                ..Default::default()
            };
            executor.store.update_job(job.id, patch).await?;
            executor.finish(&queued).await;
            return Err(err);
        }

        info!(job_id = %job.id, server_id = %server_id, op = %job_type, "Job enqueued");
        Ok(job.id)
    }

    pub async fn get_job_status(&self, job_id: Uuid) -> Result<Job> {
        self.executor
            .store
            .get_job(job_id)
            .await?
            .ok_or(Error::JobNotFound(job_id))
    }

    pub async fn active_job(&self, server_id: Uuid) -> Option<Uuid> {
        self.executor.active.lock().await.get(&server_id).copied()
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.executor.store.clone()
    }
}
