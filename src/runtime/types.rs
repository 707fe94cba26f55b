use std::{pin::Pin, time::Duration};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::Stream;

use crate::{
    error::Result,
    ports::types::PortMapping,
    tasks::types::{Server, engine_limits},
};

pub const RESTART_POLICY: &str = "unless-stopped";
pub const CONTAINER_DATA_DIR: &str = "/data";

/// Exec frames start with an 8-byte header: tag, three reserved bytes, big-endian length.
pub const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTag {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
}

impl StreamTag {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(StreamTag::Stdin),
            1 => Some(StreamTag::Stdout),
            2 => Some(StreamTag::Stderr),
            _ => None,
        }
    }
}

pub fn encode_frame(tag: StreamTag, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.put_u8(tag as u8);
    frame.put_bytes(0, 3);
    frame.put_u32(payload.len() as u32);
    frame.put_slice(payload);
    frame.freeze()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("daemon unreachable: {0}")]
    Unavailable(String),
    #[error("no such object: {0}")]
    NotFound(String),
    #[error("not modified: {0}")]
    NotModified(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("daemon returned {status}: {message}")]
    Server { status: u16, message: String },
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Other(String),
}

impl RuntimeError {
    pub fn message(&self) -> &str {
        match self {
            RuntimeError::Unavailable(m)
            | RuntimeError::NotFound(m)
            | RuntimeError::NotModified(m)
            | RuntimeError::Conflict(m)
            | RuntimeError::Other(m) => m,
            RuntimeError::Server { message, .. } => message,
            RuntimeError::Timeout(_) => "timeout",
        }
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

pub type PullStream = Pin<Box<dyn Stream<Item = RuntimeResult<String>> + Send>>;
pub type ByteStream = Pin<Box<dyn Stream<Item = RuntimeResult<Bytes>> + Send>>;

/// Everything the engine needs to create a game-server container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub memory_bytes: i64,
    pub cpu_shares: i64,
    pub restart_policy: String,
    pub binds: Vec<String>,
    pub ports: Vec<PortMapping>,
}

impl ContainerSpec {
    pub fn for_server(server: &Server) -> Result<Self> {
        let (memory_bytes, cpu_shares) = engine_limits(server.memory_cap_mb, server.cpu_shares)?;
        Ok(ContainerSpec {
            name: server.container_name(),
            image: server.image.clone(),
            env: server.environment(),
            memory_bytes,
            cpu_shares,
            restart_policy: RESTART_POLICY.to_string(),
            binds: vec![format!(
                "{}:{}",
                server.data_dir.display(),
                CONTAINER_DATA_DIR
            )],
            ports: server.ports.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub running: bool,
    pub status: String,
}

/// Capability surface over the installed container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull an image; each item is a status line from the engine.
    fn pull_image(&self, image: &str) -> PullStream;

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    async fn start(&self, container: &str) -> RuntimeResult<()>;

    async fn stop(&self, container: &str, grace: Duration) -> RuntimeResult<()>;

    async fn restart(&self, container: &str, grace: Duration) -> RuntimeResult<()>;

    async fn kill(&self, container: &str) -> RuntimeResult<()>;

    async fn remove(&self, container: &str, force: bool) -> RuntimeResult<()>;

    async fn inspect(&self, container: &str) -> RuntimeResult<ContainerState>;

    /// Run `cmd` as an argument vector; output is the multiplexed frame stream.
    async fn exec(&self, container: &str, cmd: Vec<String>) -> RuntimeResult<ByteStream>;

    /// Tar stream of `path` inside the container.
    async fn get_archive(&self, container: &str, path: &str) -> RuntimeResult<ByteStream>;

    /// Unpack the tar `archive` into directory `path` inside the container.
    async fn put_archive(&self, container: &str, path: &str, archive: Bytes)
    -> RuntimeResult<()>;
}
