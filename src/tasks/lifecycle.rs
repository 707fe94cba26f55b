use std::{panic::AssertUnwindSafe, path::PathBuf, sync::Arc, time::Duration};

use futures_util::{FutureExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    state::{target_status, valid_transition},
    types::{Job, JobPatch, JobType, Server, ServerStatus},
};
use crate::{
    error::{Error, Result},
    ports::types::PortAllocator,
    runtime::{
        benign::{Benign, Outcome, tolerate},
        types::{ContainerRuntime, ContainerSpec},
    },
    store::Store,
};

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub data_root: PathBuf,
    /// Grace period handed to the engine for STOP and RESTART.
    pub stop_grace: Duration,
    /// Extra wait past the grace period before escalating to a kill.
    pub kill_slack: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        LifecycleConfig {
            data_root: PathBuf::from("/var/lib/cubehost/servers"),
            stop_grace: Duration::from_secs(30),
            kill_slack: Duration::from_secs(5),
        }
    }
}

/// Strictly increasing progress checkpoints for one job.
pub struct Progress {
    job_id: Uuid,
    store: Arc<dyn Store>,
    current: u8,
}

impl Progress {
    pub fn new(job_id: Uuid, store: Arc<dyn Store>) -> Self {
        Progress {
            job_id,
            store,
            current: 0,
        }
    }

    pub fn current(&self) -> u8 {
        self.current
    }

    pub async fn advance(&mut self, pct: u8) -> Result<()> {
        let pct = pct.min(100);
        if pct <= self.current {
            return Ok(());
        }
        self.current = pct;
        self.store
            .update_job(self.job_id, JobPatch::progress(pct))
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobOutcome {
    pub container_errors: u32,
}

/// What a CREATE has done so far, so a failure can undo exactly that.
#[derive(Debug, Default)]
struct Staged {
    created_data_dir: bool,
    container: Option<String>,
}

/// Drives one server through CREATE/START/STOP/RESTART/DELETE.
pub struct Lifecycle {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn Store>,
    ports: Arc<PortAllocator>,
    config: LifecycleConfig,
}

impl Lifecycle {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn Store>,
        ports: Arc<PortAllocator>,
        config: LifecycleConfig,
    ) -> Self {
        Lifecycle {
            runtime,
            store,
            ports,
            config,
        }
    }

    pub fn data_dir_for(&self, server_id: Uuid) -> PathBuf {
        self.config.data_root.join(server_id.to_string())
    }

    /// Reject an operation the server's current status does not allow.
    pub fn check(&self, server_id: Uuid, server: Option<&Server>, op: JobType) -> Result<()> {
        let current = server.map(|s| s.status);
        // A CREATE retry is only safe once the previous container is gone.
        let stale_container =
            op == JobType::Create && server.is_some_and(|s| s.container_ref.is_some());
        if !valid_transition(current, op) || stale_container {
            return Err(Error::InvalidTransition {
                server_id,
                status: current.unwrap_or(ServerStatus::Deleted),
                op,
            });
        }
        if matches!(op, JobType::Start | JobType::Stop | JobType::Restart)
            && server.is_some_and(|s| s.container_ref.is_none())
        {
            return Err(Error::PreconditionFailed(format!(
                "server {server_id} has no container"
            )));
        }
        Ok(())
    }

    /// Re-register persisted port mappings with the allocator.
    pub async fn restore_ports(&self) -> Result<usize> {
        let mut restored = 0;
        for server in self.store.list_servers().await? {
            if server.status == ServerStatus::Deleted || server.ports.is_empty() {
                continue;
            }
            self.ports.restore(server.id, &server.ports);
            restored += server.ports.len();
        }
        info!(restored, "Restored host port allocations");
        Ok(restored)
    }

    pub async fn execute(&self, job: &Job, progress: &mut Progress) -> Result<JobOutcome> {
        let server = self
            .store
            .load_server(job.server_id)
            .await?
            .ok_or(Error::ServerNotFound(job.server_id))?;
        self.check(server.id, Some(&server), job.job_type)?;

        info!(
            server_id = %server.id,
            job_id = %job.id,
            op = %job.job_type,
            status = %server.status,
            "Executing lifecycle transition"
        );

        let server_id = server.id;
        let transition = async {
            match job.job_type {
                JobType::Create => self.create(server, progress).await,
                JobType::Start => self.start(server, progress).await,
                JobType::Stop => self.stop(server, progress).await,
                JobType::Restart => self.restart(server, progress).await,
                JobType::Delete => self.delete(server, progress).await,
            }
        };
        let result = AssertUnwindSafe(transition)
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(Error::unknown("job execution", "transition panicked")));

        match &result {
            Ok(_) => info!(
                server_id = %server_id,
                status = %target_status(job.job_type),
                "Lifecycle transition complete"
            ),
            // CREATE rolls back on its own and transient failures leave state as is.
            Err(err) if job.job_type != JobType::Create && !err.is_transient() => {
                self.mark_error(server_id).await;
            }
            Err(_) => {}
        }
        result
    }

    async fn mark_error(&self, server_id: Uuid) {
        let server = match self.store.load_server(server_id).await {
            Ok(Some(server)) => server,
            Ok(None) => return,
            Err(err) => {
                warn!(server_id = %server_id, error = %err, "Could not load server to mark it failed");
                return;
            }
        };
        let server = Server {
            status: ServerStatus::Error,
            ..server
        };
        if let Err(err) = self.store.save_server(&server).await {
            warn!(server_id = %server_id, error = %err, "Could not mark server failed");
        }
    }

    async fn create(&self, mut server: Server, progress: &mut Progress) -> Result<JobOutcome> {
        let mut staged = Staged::default();
        // A panic mid-provision still has to undo whatever was staged.
        let provisioned = AssertUnwindSafe(self.provision(&mut server, progress, &mut staged))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(Error::unknown("create", "provisioning panicked")));
        match provisioned {
            Ok(()) => Ok(JobOutcome::default()),
            Err(cause) => Err(self.rollback(server, staged, cause).await),
        }
    }

    async fn provision(
        &self,
        server: &mut Server,
        progress: &mut Progress,
        staged: &mut Staged,
    ) -> Result<()> {
        progress.advance(5).await?;

        let existed = tokio::fs::try_exists(&server.data_dir)
            .await
            .map_err(|e| Error::unknown("check data directory", e))?;
        tokio::fs::create_dir_all(&server.data_dir)
            .await
            .map_err(|e| Error::unknown("create data directory", e))?;
        staged.created_data_dir = !existed;
        progress.advance(10).await?;

        server.ports.clear();
        for request in server.requested_ports.clone() {
            let mapping = self.ports.allocate(
                server.id,
                request.container_port,
                request.protocol,
                request.preferred_base,
            )?;
            server.ports.push(mapping);
        }
        progress.advance(20).await?;

        self.pull(&server.image, progress).await?;

        let spec = ContainerSpec::for_server(server)?;
        let container = self.runtime.create_container(&spec).await?;
        staged.container = Some(container.clone());
        progress.advance(75).await?;

        server.container_ref = Some(container);
        server.status = ServerStatus::Stopped;
        self.store.save_server(server).await?;
        progress.advance(90).await?;
        Ok(())
    }

    async fn pull(&self, image: &str, progress: &mut Progress) -> Result<()> {
        progress.advance(30).await?;
        let mut stream = self.runtime.pull_image(image);
        let mut pct = 30;
        while let Some(status) = stream.next().await {
            let status = status?;
            debug!(image, status = %status, "Image pull");
            if pct < 55 {
                pct += 5;
                progress.advance(pct).await?;
            }
        }
        progress.advance(60).await
    }

    /// Undo a failed CREATE. Rollback failures are attached to the cause, never dropped.
    async fn rollback(&self, mut server: Server, staged: Staged, cause: Error) -> Error {
        warn!(server_id = %server.id, error = %cause, "CREATE failed, rolling back");
        let mut failures = Vec::new();

        if let Some(container) = &staged.container {
            if let Err(err) = tolerate(
                self.runtime.remove(container, true).await,
                &[Benign::NoSuchContainer],
            ) {
                failures.push(format!("remove container {container}: {err}"));
            }
        }

        self.ports.release(server.id);

        if staged.created_data_dir {
            match tokio::fs::remove_dir_all(&server.data_dir).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => failures.push(format!(
                    "remove data directory {}: {err}",
                    server.data_dir.display()
                )),
            }
        }

        server.ports.clear();
        server.container_ref = None;
        server.status = ServerStatus::Error;
        if let Err(err) = self.store.save_server(&server).await {
            failures.push(format!("save server: {err}"));
        }

        if failures.is_empty() {
            cause
        } else {
            Error::RollbackFailed {
                cause: Box::new(cause),
                failures,
            }
        }
    }

    fn container_of(server: &Server) -> Result<String> {
        server
            .container_ref
            .clone()
            .ok_or_else(|| Error::PreconditionFailed(format!("server {} has no container", server.id)))
    }

    async fn ensure_data_dir(&self, server: &Server) -> Result<()> {
        let present = tokio::fs::metadata(&server.data_dir)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if present {
            Ok(())
        } else {
            Err(Error::DirectoryNotFound(server.data_dir.display().to_string()))
        }
    }

    async fn start(&self, mut server: Server, progress: &mut Progress) -> Result<JobOutcome> {
        let container = Self::container_of(&server)?;
        progress.advance(10).await?;

        self.ensure_data_dir(&server).await?;
        progress.advance(30).await?;

        let outcome = tolerate(self.runtime.start(&container).await, &[Benign::AlreadyStarted])?;
        if let Outcome::Tolerated(_) = outcome {
            info!(server_id = %server.id, "Container was already running");
        }
        progress.advance(90).await?;

        server.status = ServerStatus::Running;
        self.store.save_server(&server).await?;
        Ok(JobOutcome::default())
    }

    /// Stop within the grace period, escalating to a kill if the engine does not return.
    async fn halt(&self, container: &str) -> Result<()> {
        let grace = self.config.stop_grace;
        match tokio::time::timeout(grace + self.config.kill_slack, self.runtime.stop(container, grace))
            .await
        {
            Ok(result) => {
                tolerate(result, &[Benign::AlreadyStopped])?;
                Ok(())
            }
            Err(_) => {
                warn!(container_id = container, ?grace, "Stop exceeded grace period, killing");
                tolerate(self.runtime.kill(container).await, &[Benign::NotRunning])?;
                Ok(())
            }
        }
    }

    async fn stop(&self, mut server: Server, progress: &mut Progress) -> Result<JobOutcome> {
        let container = Self::container_of(&server)?;
        progress.advance(10).await?;

        self.halt(&container).await?;
        progress.advance(90).await?;

        server.status = ServerStatus::Stopped;
        self.store.save_server(&server).await?;
        Ok(JobOutcome::default())
    }

    async fn restart(&self, mut server: Server, progress: &mut Progress) -> Result<JobOutcome> {
        let container = Self::container_of(&server)?;
        let state = self.runtime.inspect(&container).await?;
        if !state.running {
            debug!(server_id = %server.id, status = %state.status, "Container not running, restart becomes start");
            return self.start(server, progress).await;
        }
        progress.advance(10).await?;

        let grace = self.config.stop_grace;
        match tokio::time::timeout(
            grace + self.config.kill_slack,
            self.runtime.restart(&container, grace),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!(container_id = %container, ?grace, "Restart exceeded grace period, killing");
                tolerate(self.runtime.kill(&container).await, &[Benign::NotRunning])?;
                tolerate(self.runtime.start(&container).await, &[Benign::AlreadyStarted])?;
            }
        }
        progress.advance(90).await?;

        server.status = ServerStatus::Running;
        self.store.save_server(&server).await?;
        Ok(JobOutcome::default())
    }

    async fn delete(&self, mut server: Server, progress: &mut Progress) -> Result<JobOutcome> {
        server.status = ServerStatus::Deleting;
        self.store.save_server(&server).await?;
        progress.advance(10).await?;

        let mut container_errors = 0;
        if let Some(container) = server.container_ref.clone() {
            match self.runtime.inspect(&container).await {
                Ok(state) if state.running => {
                    if let Err(err) = self.halt(&container).await {
                        warn!(server_id = %server.id, error = %err, "Stop before delete failed");
                    }
                }
                Ok(_) => {}
                Err(err) => debug!(server_id = %server.id, error = %err, "Inspect before delete failed"),
            }
            progress.advance(30).await?;

            match tolerate(
                self.runtime.remove(&container, true).await,
                &[Benign::NoSuchContainer],
            ) {
                Ok(Outcome::Applied) => {
                    info!(server_id = %server.id, container_id = %container, "Container removed");
                }
                Ok(Outcome::Tolerated(_)) => {
                    container_errors += 1;
                    warn!(server_id = %server.id, container_id = %container, "Container was already gone");
                }
                Err(err) => {
                    container_errors += 1;
                    warn!(
                        server_id = %server.id,
                        container_id = %container,
                        error = %err,
                        "Container removal failed, deleting data anyway"
                    );
                }
            }
        }
        progress.advance(60).await?;

        self.ports.release(server.id);
        server.ports.clear();

        match tokio::fs::remove_dir_all(&server.data_dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(Error::unknown("remove data directory", err)),
        }
        progress.advance(90).await?;

        server.container_ref = None;
        server.status = ServerStatus::Deleted;
        self.store.save_server(&server).await?;
        Ok(JobOutcome { container_errors })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::TempDir;

    use super::*;
    use crate::{
        error::ErrorKind,
        ports::types::{PortRange, Protocol},
        runtime::{
            mock::{MockRuntime, Op},
            types::RuntimeError,
        },
        store::MemoryStore,
        tasks::types::{GameKind, PortRequest, ServerSpec},
    };

    struct Fixture {
        runtime: Arc<MockRuntime>,
        store: Arc<MemoryStore>,
        ports: Arc<PortAllocator>,
        lifecycle: Lifecycle,
        _root: TempDir,
    }

    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        let store = Arc::new(MemoryStore::new());
        let ports = Arc::new(PortAllocator::new(PortRange::default()));
        let lifecycle = Lifecycle::new(
            runtime.clone(),
            store.clone(),
            ports.clone(),
            LifecycleConfig {
                data_root: root.path().to_path_buf(),
                stop_grace: Duration::from_millis(50),
                kill_slack: Duration::from_millis(50),
            },
        );
        Fixture {
            runtime,
            store,
            ports,
            lifecycle,
            _root: root,
        }
    }

    fn spec() -> ServerSpec {
        ServerSpec {
            name: "lobby".to_string(),
            image: "itzg/minecraft-server".to_string(),
            game: GameKind::Minecraft,
            memory_cap_mb: 1024,
            cpu_shares: 512,
            ports: vec![PortRequest {
                container_port: 25565,
                protocol: Protocol::Tcp,
                preferred_base: None,
            }],
            env: BTreeMap::new(),
        }
    }

    async fn run(fx: &Fixture, server_id: Uuid, op: JobType) -> Result<JobOutcome> {
        let job = Job::new(server_id, op);
        fx.store.create_job(&job).await.unwrap();
        let mut progress = Progress::new(job.id, fx.store.clone());
        fx.lifecycle.execute(&job, &mut progress).await
    }

    async fn created(fx: &Fixture) -> Server {
        let id = Uuid::new_v4();
        let server = Server::from_spec(id, spec(), fx.lifecycle.data_dir_for(id));
        fx.store.save_server(&server).await.unwrap();
        run(fx, id, JobType::Create).await.unwrap();
        fx.store.load_server(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn create_then_start_then_stop() {
        let fx = fixture();
        let server = created(&fx).await;
        assert_eq!(server.status, ServerStatus::Stopped);
        assert!(server.data_dir.is_dir());

        run(&fx, server.id, JobType::Start).await.unwrap();
        let container = server.container_ref.clone().unwrap();
        assert_eq!(fx.runtime.is_running(&container), Some(true));

        run(&fx, server.id, JobType::Stop).await.unwrap();
        let server = fx.store.load_server(server.id).await.unwrap().unwrap();
        assert_eq!(server.status, ServerStatus::Stopped);
        assert_eq!(fx.runtime.is_running(&container), Some(false));
    }

    #[tokio::test]
    async fn start_fails_when_data_dir_vanished() {
        let fx = fixture();
        let server = created(&fx).await;
        std::fs::remove_dir_all(&server.data_dir).unwrap();

        let err = run(&fx, server.id, JobType::Start).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(fx.runtime.count(Op::Start), 0);
        let server = fx.store.load_server(server.id).await.unwrap().unwrap();
        assert_eq!(server.status, ServerStatus::Error);
    }

    #[tokio::test]
    async fn stalled_stop_escalates_to_kill() {
        let fx = fixture();
        let server = created(&fx).await;
        run(&fx, server.id, JobType::Start).await.unwrap();
        fx.runtime.hang(Op::Stop);

        run(&fx, server.id, JobType::Stop).await.unwrap();
        assert_eq!(fx.runtime.count(Op::Kill), 1);
        let container = server.container_ref.unwrap();
        assert_eq!(fx.runtime.is_running(&container), Some(false));
    }

    #[tokio::test]
    async fn restart_of_stopped_container_starts_it() {
        let fx = fixture();
        let server = created(&fx).await;

        run(&fx, server.id, JobType::Restart).await.unwrap();
        assert_eq!(fx.runtime.count(Op::Restart), 0);
        assert_eq!(fx.runtime.count(Op::Start), 1);
    }

    #[tokio::test]
    async fn restart_of_running_container_uses_restart() {
        let fx = fixture();
        let server = created(&fx).await;
        run(&fx, server.id, JobType::Start).await.unwrap();

        run(&fx, server.id, JobType::Restart).await.unwrap();
        assert_eq!(fx.runtime.count(Op::Restart), 1);
    }

    #[tokio::test]
    async fn transient_failure_keeps_status() {
        let fx = fixture();
        let server = created(&fx).await;
        fx.runtime
            .fail(Op::Start, RuntimeError::Unavailable("connection refused".into()));

        let err = run(&fx, server.id, JobType::Start).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RuntimeUnavailable);
        let server = fx.store.load_server(server.id).await.unwrap().unwrap();
        assert_eq!(server.status, ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn pull_failure_rolls_back_ports_and_directory() {
        let fx = fixture();
        let id = Uuid::new_v4();
        let server = Server::from_spec(id, spec(), fx.lifecycle.data_dir_for(id));
        fx.store.save_server(&server).await.unwrap();
        fx.runtime
            .fail(Op::Pull, RuntimeError::Server { status: 500, message: "manifest unknown".into() });

        let err = run(&fx, id, JobType::Create).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert!(fx.ports.allocations_for(id).is_empty());
        assert!(!server.data_dir.exists());
        assert_eq!(fx.runtime.count(Op::Create), 0);
    }

    #[tokio::test]
    async fn out_of_range_memory_cap_rolls_back_before_create() {
        let fx = fixture();
        let id = Uuid::new_v4();
        let spec = ServerSpec {
            memory_cap_mb: u64::MAX / 2,
            ..spec()
        };
        let server = Server::from_spec(id, spec, fx.lifecycle.data_dir_for(id));
        fx.store.save_server(&server).await.unwrap();

        let err = run(&fx, id, JobType::Create).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
        assert_eq!(fx.runtime.count(Op::Create), 0);
        assert!(fx.ports.allocations_for(id).is_empty());
        assert!(!server.data_dir.exists());
        let server = fx.store.load_server(id).await.unwrap().unwrap();
        assert_eq!(server.status, ServerStatus::Error);
    }

    #[tokio::test]
    async fn panicking_start_marks_server_error() {
        let fx = fixture();
        let server = created(&fx).await;
        fx.runtime.panic_on(Op::Start);

        let err = run(&fx, server.id, JobType::Start).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unknown);
        let server = fx.store.load_server(server.id).await.unwrap().unwrap();
        assert_eq!(server.status, ServerStatus::Error);
    }

    #[tokio::test]
    async fn unreadable_data_root_fails_create_without_touching_it() {
        let root = TempDir::new().unwrap();
        let blocker = root.path().join("servers");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let fx = fixture();
        let lifecycle = Lifecycle::new(
            fx.runtime.clone(),
            fx.store.clone(),
            fx.ports.clone(),
            LifecycleConfig {
                data_root: blocker.clone(),
                ..LifecycleConfig::default()
            },
        );
        let id = Uuid::new_v4();
        let server = Server::from_spec(id, spec(), lifecycle.data_dir_for(id));
        fx.store.save_server(&server).await.unwrap();
        let job = Job::new(id, JobType::Create);
        fx.store.create_job(&job).await.unwrap();

        let mut progress = Progress::new(job.id, fx.store.clone());
        let err = lifecycle.execute(&job, &mut progress).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert!(err.to_string().contains("data directory"));
        assert_eq!(std::fs::read(&blocker).unwrap(), b"not a directory");
        assert!(fx.ports.allocations_for(id).is_empty());
    }

    #[tokio::test]
    async fn delete_is_idempotent_against_missing_container() {
        let fx = fixture();
        let server = created(&fx).await;
        fx.runtime.forget_container(server.container_ref.as_deref().unwrap());

        let outcome = run(&fx, server.id, JobType::Delete).await.unwrap();
        assert_eq!(outcome.container_errors, 1);
        let server = fx.store.load_server(server.id).await.unwrap().unwrap();
        assert_eq!(server.status, ServerStatus::Deleted);
        assert!(server.container_ref.is_none());
        assert!(!server.data_dir.exists());
    }

    #[tokio::test]
    async fn restore_ports_skips_deleted_servers() {
        let fx = fixture();
        let live = created(&fx).await;
        let gone = created(&fx).await;
        run(&fx, gone.id, JobType::Delete).await.unwrap();

        let fresh = PortAllocator::new(PortRange::default());
        let lifecycle = Lifecycle::new(
            fx.runtime.clone(),
            fx.store.clone(),
            Arc::new(fresh),
            LifecycleConfig::default(),
        );
        assert_eq!(lifecycle.restore_ports().await.unwrap(), live.ports.len());
    }
}
