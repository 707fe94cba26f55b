use std::{collections::BTreeMap, fmt, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{Error, ErrorKind, Result},
    ports::types::{PortMapping, Protocol},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    Creating,
    Stopped,
    Running,
    Deleting,
    Deleted,
    Error,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Creating => "CREATING",
            ServerStatus::Stopped => "STOPPED",
            ServerStatus::Running => "RUNNING",
            ServerStatus::Deleting => "DELETING",
            ServerStatus::Deleted => "DELETED",
            ServerStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    Create,
    Start,
    Stop,
    Restart,
    Delete,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Create => "CREATE",
            JobType::Start => "START",
            JobType::Stop => "STOP",
            JobType::Restart => "RESTART",
            JobType::Delete => "DELETE",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// Game presets contribute default environment variables to the container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameKind {
    Minecraft,
    #[default]
    Generic,
}

impl GameKind {
    pub fn default_env(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            GameKind::Minecraft => &[("EULA", "TRUE")],
            GameKind::Generic => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRequest {
    pub container_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    #[serde(default)]
    pub preferred_base: Option<u16>,
}

fn default_protocol() -> Protocol {
    Protocol::Tcp
}

/// What the caller asks for when enqueueing a CREATE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub game: GameKind,
    pub memory_cap_mb: u64,
    pub cpu_shares: u64,
    #[serde(default)]
    pub ports: Vec<PortRequest>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: Uuid,
    pub name: String,
    pub image: String,
    pub game: GameKind,
    pub status: ServerStatus,
    pub container_ref: Option<String>,
    pub requested_ports: Vec<PortRequest>,
    pub ports: Vec<PortMapping>,
    pub memory_cap_mb: u64,
    pub cpu_shares: u64,
    pub env: BTreeMap<String, String>,
    pub data_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Memory and CPU limits in engine units, bytes and shares.
pub fn engine_limits(memory_cap_mb: u64, cpu_shares: u64) -> Result<(i64, i64)> {
    let memory_bytes = memory_cap_mb
        .checked_mul(1024 * 1024)
        .and_then(|bytes| i64::try_from(bytes).ok())
        .ok_or_else(|| {
            Error::PreconditionFailed(format!("memory cap of {memory_cap_mb} MiB is out of range"))
        })?;
    let cpu_shares = i64::try_from(cpu_shares).map_err(|_| {
        Error::PreconditionFailed(format!("cpu shares of {cpu_shares} are out of range"))
    })?;
    Ok((memory_bytes, cpu_shares))
}

impl ServerSpec {
    pub fn validate(&self) -> Result<()> {
        engine_limits(self.memory_cap_mb, self.cpu_shares).map(|_| ())
    }
}

impl Server {
    pub fn from_spec(id: Uuid, spec: ServerSpec, data_dir: PathBuf) -> Self {
        let now = Utc::now();
        Server {
            id,
            name: spec.name,
            image: spec.image,
            game: spec.game,
            status: ServerStatus::Creating,
            container_ref: None,
            requested_ports: spec.ports,
            ports: Vec::new(),
            memory_cap_mb: spec.memory_cap_mb,
            cpu_shares: spec.cpu_shares,
            env: spec.env,
            data_dir,
            created_at: now,
            updated_at: now,
        }
    }

    /// Preset variables first, caller-supplied ones override them.
    pub fn environment(&self) -> Vec<String> {
        let mut merged: BTreeMap<String, String> = self
            .game
            .default_env()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        merged.extend(self.env.clone());
        merged.into_iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    pub fn container_name(&self) -> String {
        format!("cubehost-{}", self.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    #[serde(default)]
    pub server: Option<ServerSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    pub trace: Vec<String>,
    pub progress: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub server_id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: u8,
    pub error: Option<JobError>,
    pub container_errors: u32,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(server_id: Uuid, job_type: JobType) -> Self {
        Job {
            id: Uuid::new_v4(),
            server_id,
            job_type,
            status: JobStatus::Pending,
            progress: 0,
            error: None,
            container_errors: 0,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Terminal jobs never change again and progress never moves backwards.
    pub fn apply(&mut self, patch: JobPatch) {
        if self.status.is_terminal() {
            return;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(progress) = patch.progress {
            self.progress = self.progress.max(progress.min(100));
        }
        if let Some(error) = patch.error {
            self.error = Some(error);
        }
        if let Some(container_errors) = patch.container_errors {
            self.container_errors = container_errors;
        }
        if self.status.is_terminal() {
            self.finished_at = Some(patch.finished_at.unwrap_or_else(Utc::now));
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub error: Option<JobError>,
    pub container_errors: Option<u32>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobPatch {
    pub fn progress(progress: u8) -> Self {
        JobPatch {
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn status(status: JobStatus) -> Self {
        JobPatch {
            status: Some(status),
            ..Default::default()
        }
    }
}
