use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use bollard::{
    API_DEFAULT_VERSION, Docker,
    container::{
        Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
        KillContainerOptions, LogOutput, RemoveContainerOptions, RestartContainerOptions,
        StartContainerOptions, StopContainerOptions, UploadToContainerOptions,
    },
    errors::Error as DockerError,
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    secret::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum},
};
use bytes::Bytes;
use futures_util::stream::StreamExt;
use tracing::{debug, info};

use super::types::{
    ByteStream, ContainerRuntime, ContainerSpec, ContainerState, PullStream, RuntimeError,
    RuntimeResult, StreamTag, encode_frame,
};

/// Runtime adapter backed by the local Docker engine.
#[derive(Debug, Clone)]
pub struct DockerClient {
    pub client: Docker,
}

impl DockerClient {
    pub fn connect(socket: Option<&str>) -> RuntimeResult<Self> {
        let client = match socket {
            Some(path) => Docker::connect_with_unix(path, 120, API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(classify)?;

        Ok(DockerClient { client })
    }

    fn container_config(spec: &ContainerSpec) -> Config<String> {
        let restart_policy = RestartPolicy {
            name: Some(
                spec.restart_policy
                    .parse()
                    .unwrap_or(RestartPolicyNameEnum::UNLESS_STOPPED),
            ),
            maximum_retry_count: None,
        };

        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .ports
            .iter()
            .map(|port| (port.container_key(), HashMap::new()))
            .collect();

        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
            .ports
            .iter()
            .map(|port| {
                (
                    port.container_key(),
                    Some(vec![PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: Some(port.host_port.to_string()),
                    }]),
                )
            })
            .collect();

        let host_config = HostConfig {
            restart_policy: Some(restart_policy),
            memory: Some(spec.memory_bytes),
            cpu_shares: Some(spec.cpu_shares),
            binds: Some(spec.binds.clone()),
            port_bindings: Some(port_bindings),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            tty: Some(false),
            open_stdin: Some(true),
            ..Default::default()
        }
    }
}

/// Sort engine errors into the adapter taxonomy by HTTP status.
fn classify(err: DockerError) -> RuntimeError {
    match err {
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            304 => RuntimeError::NotModified(message),
            404 => RuntimeError::NotFound(message),
            409 => RuntimeError::Conflict(message),
            status => RuntimeError::Server { status, message },
        },
        DockerError::IOError { .. }
        | DockerError::HyperResponseError { .. }
        | DockerError::RequestTimeoutError
        | DockerError::SocketNotFoundError(_) => RuntimeError::Unavailable(err.to_string()),
        other => RuntimeError::Other(other.to_string()),
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    fn pull_image(&self, image: &str) -> PullStream {
        info!(image, "Pulling image");
        let stream = self.client.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );

        Box::pin(stream.map(|msg| {
            msg.map(|info| info.status.unwrap_or_default())
                .map_err(classify)
        }))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let options = Some(CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        });

        let resp = self
            .client
            .create_container(options, Self::container_config(spec))
            .await
            .map_err(classify)?;

        info!(container_id = %resp.id, name = %spec.name, "Container created");
        Ok(resp.id)
    }

    async fn start(&self, container: &str) -> RuntimeResult<()> {
        debug!(container_id = container, "Starting container");
        self.client
            .start_container(container, None::<StartContainerOptions<String>>)
            .await
            .map_err(classify)
    }

    async fn stop(&self, container: &str, grace: Duration) -> RuntimeResult<()> {
        debug!(container_id = container, ?grace, "Stopping container");
        self.client
            .stop_container(
                container,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await
            .map_err(classify)
    }

    async fn restart(&self, container: &str, grace: Duration) -> RuntimeResult<()> {
        debug!(container_id = container, ?grace, "Restarting container");
        self.client
            .restart_container(
                container,
                Some(RestartContainerOptions {
                    t: grace.as_secs() as isize,
                }),
            )
            .await
            .map_err(classify)
    }

    async fn kill(&self, container: &str) -> RuntimeResult<()> {
        debug!(container_id = container, "Killing container");
        self.client
            .kill_container(
                container,
                Some(KillContainerOptions {
                    signal: "SIGKILL".to_string(),
                }),
            )
            .await
            .map_err(classify)
    }

    async fn remove(&self, container: &str, force: bool) -> RuntimeResult<()> {
        debug!(container_id = container, force, "Removing container");
        self.client
            .remove_container(
                container,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(classify)
    }

    async fn inspect(&self, container: &str) -> RuntimeResult<ContainerState> {
        let info = self
            .client
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
            .map_err(classify)?;

        let state = info.state.unwrap_or_default();
        Ok(ContainerState {
            running: state.running.unwrap_or(false),
            status: state
                .status
                .map(|status| status.to_string())
                .unwrap_or_default(),
        })
    }

    async fn exec(&self, container: &str, cmd: Vec<String>) -> RuntimeResult<ByteStream> {
        let exec = self
            .client
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(classify)?;

        match self.client.start_exec(&exec.id, None).await.map_err(classify)? {
            // Bollard hands back decoded chunks; re-frame them so every adapter
            // feeds the same wire format to the demultiplexer.
            StartExecResults::Attached { output, .. } => Ok(Box::pin(output.map(|chunk| {
                chunk.map_err(classify).map(|log| match log {
                    LogOutput::StdErr { message } => encode_frame(StreamTag::Stderr, &message),
                    LogOutput::StdIn { message } => encode_frame(StreamTag::Stdin, &message),
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        encode_frame(StreamTag::Stdout, &message)
                    }
                })
            }))),
            StartExecResults::Detached => Err(RuntimeError::Other(
                "exec started detached, no output attached".to_string(),
            )),
        }
    }

    async fn get_archive(&self, container: &str, path: &str) -> RuntimeResult<ByteStream> {
        let stream = self.client.download_from_container(
            container,
            Some(DownloadFromContainerOptions {
                path: path.to_string(),
            }),
        );
        Ok(Box::pin(stream.map(|chunk| chunk.map_err(classify))))
    }

    async fn put_archive(
        &self,
        container: &str,
        path: &str,
        archive: Bytes,
    ) -> RuntimeResult<()> {
        self.client
            .upload_to_container(
                container,
                Some(UploadToContainerOptions {
                    path: path.to_string(),
                    ..Default::default()
                }),
                archive,
            )
            .await
            .map_err(classify)
    }
}
