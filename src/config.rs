//! Process configuration, read from `CUBEHOST_*` environment variables.

use std::{path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result, bail};

use crate::{
    files::{FilePolicy, types::DEFAULT_PROTECTED_NAMES},
    ports::PortRange,
    tasks::LifecycleConfig,
    worker::DispatcherConfig,
};

#[derive(Debug, Clone)]
pub struct Config {
    /// Host directory holding one data directory per server.
    pub data_root: PathBuf,
    pub port_range: PortRange,
    pub workers: usize,
    pub queue_depth: usize,
    pub stop_grace: Duration,
    pub max_write_bytes: u64,
    pub max_archive_bytes: u64,
    pub exec_timeout: Duration,
    pub protected_names: Vec<String>,
    /// Unix socket for the engine; the platform default when unset.
    pub docker_socket: Option<String>,
    pub listen_addr: String,
    pub log_level: String,
    pub log_json: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup, so tests need not touch the process env.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(&format!("CUBEHOST_{name}"));

        let data_root = var("DATA_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/cubehost/servers"));

        let floor: u16 = parse(&var, "PORT_FLOOR", 30000)?;
        let ceiling: u16 = parse(&var, "PORT_CEILING", 39999)?;
        if floor == 0 || floor > ceiling {
            bail!("CUBEHOST_PORT_FLOOR ({floor}) must be non-zero and not above CUBEHOST_PORT_CEILING ({ceiling}).");
        }

        let workers: usize = parse(&var, "WORKERS", 4)?;
        let queue_depth: usize = parse(&var, "QUEUE_DEPTH", 256)?;
        let stop_grace_secs: u64 = parse(&var, "STOP_GRACE_SECS", 30)?;
        let max_write_bytes: u64 = parse(&var, "MAX_WRITE_BYTES", 100 * 1024 * 1024)?;
        let max_archive_bytes: u64 = parse(&var, "MAX_ARCHIVE_BYTES", 1024 * 1024 * 1024)?;
        let exec_timeout_secs: u64 = parse(&var, "EXEC_TIMEOUT_SECS", 30)?;

        let protected_names = var("PROTECTED_NAMES")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_else(|| {
                DEFAULT_PROTECTED_NAMES
                    .iter()
                    .map(|name| name.to_string())
                    .collect()
            });

        let log_json = var("LOG_JSON")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            data_root,
            port_range: PortRange { floor, ceiling },
            workers: workers.max(1),
            queue_depth: queue_depth.max(1),
            stop_grace: Duration::from_secs(stop_grace_secs),
            max_write_bytes,
            max_archive_bytes,
            exec_timeout: Duration::from_secs(exec_timeout_secs.max(1)),
            protected_names,
            docker_socket: var("DOCKER_SOCKET").filter(|s| !s.is_empty()),
            listen_addr: var("LISTEN_ADDR").unwrap_or_else(|| "127.0.0.1:8080".to_string()),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_json,
        })
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            data_root: self.data_root.clone(),
            stop_grace: self.stop_grace,
            ..LifecycleConfig::default()
        }
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            workers: self.workers,
            queue_depth: self.queue_depth,
        }
    }

    pub fn file_policy(&self) -> FilePolicy {
        FilePolicy {
            max_write_bytes: self.max_write_bytes,
            max_archive_bytes: self.max_archive_bytes,
            exec_timeout: self.exec_timeout,
            protected_names: self.protected_names.clone(),
        }
    }
}

fn parse<T>(var: impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(name)
        .map(|v| v.trim().parse())
        .transpose()
        .with_context(|| format!("CUBEHOST_{name} must be a non-negative integer."))
        .map(|value| value.unwrap_or(default))
}
