use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::Store;
use crate::{
    error::{Error, Result},
    tasks::types::{Job, JobPatch, Server},
};

#[derive(Debug, Default)]
pub struct MemoryStore {
    servers: RwLock<HashMap<Uuid, Server>>,
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn jobs_for(&self, server_id: Uuid) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.server_id == server_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_server(&self, id: Uuid) -> Result<Option<Server>> {
        Ok(self.servers.read().await.get(&id).cloned())
    }

    async fn save_server(&self, server: &Server) -> Result<()> {
        let mut server = server.clone();
        server.updated_at = Utc::now();
        self.servers.write().await.insert(server.id, server);
        Ok(())
    }

    async fn list_servers(&self) -> Result<Vec<Server>> {
        Ok(self.servers.read().await.values().cloned().collect())
    }

    async fn create_job(&self, job: &Job) -> Result<()> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job(&self, id: Uuid, patch: JobPatch) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(Error::JobNotFound(id))?;
        job.apply(patch);
        Ok(job.clone())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }
}
