//! Persistence collaborator. Every call is an atomic single-row operation.

pub mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    error::Result,
    tasks::types::{Job, JobPatch, Server},
};

pub use memory::MemoryStore;

#[async_trait]
pub trait Store: Send + Sync {
    async fn load_server(&self, id: Uuid) -> Result<Option<Server>>;

    async fn save_server(&self, server: &Server) -> Result<()>;

    async fn list_servers(&self) -> Result<Vec<Server>>;

    async fn create_job(&self, job: &Job) -> Result<()>;

    /// Apply `patch` and return the job as stored afterwards.
    async fn update_job(&self, id: Uuid, patch: JobPatch) -> Result<Job>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;
}
