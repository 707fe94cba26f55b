use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};

use tokio::sync::{Mutex, Notify, OwnedMutexGuard, mpsc};
use uuid::Uuid;

use crate::{
    store::Store,
    tasks::{lifecycle::Lifecycle, types::JobType},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub server_id: Uuid,
    pub job_type: JobType,
}

/// Per-server mutual exclusion tokens, created on demand and evicted when idle.
#[derive(Debug, Default)]
pub struct LockTable {
    pub(crate) entries: StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

/// Held for the whole duration of a job; dropping it releases the server.
#[derive(Debug)]
pub struct ServerLease {
    pub(crate) table: Arc<LockTable>,
    pub(crate) server_id: Uuid,
    pub(crate) guard: Option<OwnedMutexGuard<()>>,
}

/// State shared between the enqueue side and the worker pool.
pub struct Executor {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) lifecycle: Arc<Lifecycle>,
    /// server id -> the one PENDING/RUNNING job for it.
    pub(crate) active: Mutex<HashMap<Uuid, Uuid>>,
    /// Signalled whenever an entry leaves `active`.
    pub(crate) released: Notify,
    pub(crate) locks: Arc<LockTable>,
}

/// Caller-facing handle: enqueue jobs and read their status.
#[derive(Clone)]
pub struct Dispatcher {
    pub(crate) executor: Arc<Executor>,
    pub(crate) queue: mpsc::Sender<QueuedJob>,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub queue_depth: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            workers: 4,
            queue_depth: 256,
        }
    }
}
