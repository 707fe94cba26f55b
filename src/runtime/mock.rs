//! In-memory runtime for tests and local development.
//!
//! Records every call, keeps a fake container table and a fake filesystem shared
//! by all containers, and can be told to fail or hang specific operations.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    io::Read,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use tokio::sync::Notify;

use super::types::{
    ByteStream, ContainerRuntime, ContainerSpec, ContainerState, PullStream, RuntimeError,
    RuntimeResult, StreamTag, encode_frame,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Pull,
    Create,
    Start,
    Stop,
    Restart,
    Kill,
    Remove,
    Inspect,
    Exec,
    GetArchive,
    PutArchive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Pull(String),
    Create(ContainerSpec),
    Start(String),
    Stop(String),
    Restart(String),
    Kill(String),
    Remove(String),
    Inspect(String),
    Exec(String, Vec<String>),
    GetArchive(String, String),
    PutArchive(String, String),
}

impl RuntimeCall {
    pub fn op(&self) -> Op {
        match self {
            RuntimeCall::Pull(_) => Op::Pull,
            RuntimeCall::Create(_) => Op::Create,
            RuntimeCall::Start(_) => Op::Start,
            RuntimeCall::Stop(_) => Op::Stop,
            RuntimeCall::Restart(_) => Op::Restart,
            RuntimeCall::Kill(_) => Op::Kill,
            RuntimeCall::Remove(_) => Op::Remove,
            RuntimeCall::Inspect(_) => Op::Inspect,
            RuntimeCall::Exec(..) => Op::Exec,
            RuntimeCall::GetArchive(..) => Op::GetArchive,
            RuntimeCall::PutArchive(..) => Op::PutArchive,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecReply {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecReply {
    pub fn stdout(text: &str) -> Self {
        ExecReply {
            stdout: text.as_bytes().to_vec(),
            stderr: Vec::new(),
        }
    }

    pub fn stderr(text: &str) -> Self {
        ExecReply {
            stdout: Vec::new(),
            stderr: text.as_bytes().to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    File(Vec<u8>),
    Dir,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: u64,
    containers: HashMap<String, bool>,
    calls: Vec<RuntimeCall>,
    failures: HashMap<Op, RuntimeError>,
    hangs: HashSet<Op>,
    panics: HashSet<Op>,
    exec_replies: HashMap<String, ExecReply>,
    files: BTreeMap<String, Node>,
}

#[derive(Debug, Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
    resumed: Notify,
}

/// Frames are cut into chunks of this many bytes to exercise reassembly.
const EXEC_CHUNK: usize = 5;

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every future call of `op` fail with `err`.
    pub fn fail(&self, op: Op, err: RuntimeError) {
        self.state().failures.insert(op, err);
    }

    pub fn clear_failure(&self, op: Op) {
        self.state().failures.remove(&op);
    }

    /// Make every future call of `op` block until [`MockRuntime::resume`].
    pub fn hang(&self, op: Op) {
        self.state().hangs.insert(op);
    }

    /// Let hung calls of `op`, current and future, proceed.
    pub fn resume(&self, op: Op) {
        self.state().hangs.remove(&op);
        self.resumed.notify_waiters();
    }

    /// Make every future call of `op` panic, as a buggy adapter would.
    pub fn panic_on(&self, op: Op) {
        self.state().panics.insert(op);
    }

    pub fn on_exec(&self, program: &str, reply: ExecReply) {
        self.state().exec_replies.insert(program.to_string(), reply);
    }

    pub fn add_container(&self, id: &str, running: bool) {
        self.state().containers.insert(id.to_string(), running);
    }

    /// Simulate a container removed behind the orchestrator's back.
    pub fn forget_container(&self, id: &str) {
        self.state().containers.remove(id);
    }

    pub fn is_running(&self, id: &str) -> Option<bool> {
        self.state().containers.get(id).copied()
    }

    pub fn with_dir(&self, path: &str) {
        let mut state = self.state();
        insert_dir_all(&mut state.files, path);
    }

    pub fn with_file(&self, path: &str, content: &[u8]) {
        let mut state = self.state();
        if let Some((parent, _)) = path.rsplit_once('/') {
            insert_dir_all(&mut state.files, parent);
        }
        state
            .files
            .insert(path.to_string(), Node::File(content.to_vec()));
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.state().files.get(path) {
            Some(Node::File(content)) => Some(content.clone()),
            _ => None,
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        path == "/" || matches!(self.state().files.get(path), Some(Node::Dir))
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.state().calls.clone()
    }

    pub fn count(&self, op: Op) -> usize {
        self.state().calls.iter().filter(|c| c.op() == op).count()
    }

    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                RuntimeCall::Create(spec) => Some(spec.clone()),
                _ => None,
            })
            .collect()
    }

    /// Record the call, then report whether it should hang or fail.
    fn enter(&self, call: RuntimeCall) -> (bool, Option<RuntimeError>) {
        let mut state = self.state();
        let op = call.op();
        state.calls.push(call);
        (state.hangs.contains(&op), state.failures.get(&op).cloned())
    }

    async fn gate(&self, call: RuntimeCall) -> RuntimeResult<()> {
        let op = call.op();
        let (hang, failure) = self.enter(call);
        if self.state().panics.contains(&op) {
            panic!("mock runtime told to panic on {op:?}");
        }
        if hang {
            loop {
                let resumed = self.resumed.notified();
                if !self.state().hangs.contains(&op) {
                    break;
                }
                resumed.await;
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn require(&self, container: &str) -> RuntimeResult<bool> {
        self.state()
            .containers
            .get(container)
            .copied()
            .ok_or_else(|| RuntimeError::NotFound(format!("No such container: {container}")))
    }

    fn run_builtin(&self, cmd: &[String]) -> ExecReply {
        let mut state = self.state();
        let program = cmd.first().map(String::as_str).unwrap_or_default();
        if let Some(reply) = state.exec_replies.get(program) {
            return reply.clone();
        }
        let target = cmd.last().cloned().unwrap_or_default();
        match program {
            "mkdir" => insert_dir_all(&mut state.files, &target),
            "rm" => {
                let prefix = format!("{}/", target.trim_end_matches('/'));
                state
                    .files
                    .retain(|path, _| path != &target && !path.starts_with(&prefix));
            }
            _ => {}
        }
        ExecReply::default()
    }

    fn archive_of(&self, path: &str) -> RuntimeResult<Vec<u8>> {
        let state = self.state();
        let name = match path.rsplit('/').next() {
            Some(name) if !name.is_empty() => name,
            _ => ".",
        };
        let mut builder = tar::Builder::new(Vec::new());
        let append = |builder: &mut tar::Builder<Vec<u8>>, name: &str, node: &Node| {
            let mut header = tar::Header::new_gnu();
            match node {
                Node::File(content) => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(content.len() as u64);
                    header.set_mode(0o644);
                    builder.append_data(&mut header, name, content.as_slice())
                }
                Node::Dir => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_size(0);
                    header.set_mode(0o755);
                    builder.append_data(&mut header, format!("{name}/"), std::io::empty())
                }
            }
        };
        let io = |e: std::io::Error| RuntimeError::Other(e.to_string());

        match state.files.get(path) {
            None if path != "/" => {
                return Err(RuntimeError::NotFound(format!(
                    "Could not find the file {path} in container"
                )));
            }
            Some(node @ Node::File(_)) => append(&mut builder, name, node).map_err(io)?,
            _ => {
                let prefix = format!("{}/", path.trim_end_matches('/'));
                append(&mut builder, name, &Node::Dir).map_err(io)?;
                for (child, node) in state.files.range(prefix.clone()..) {
                    let Some(rel) = child.strip_prefix(&prefix) else {
                        break;
                    };
                    append(&mut builder, &format!("{name}/{rel}"), node).map_err(io)?;
                }
            }
        }
        builder.into_inner().map_err(io)
    }

    fn unpack_into(&self, dir: &str, archive: &[u8]) -> RuntimeResult<()> {
        let io = |e: std::io::Error| RuntimeError::Other(e.to_string());
        let mut state = self.state();
        if dir != "/" && !matches!(state.files.get(dir), Some(Node::Dir)) {
            return Err(RuntimeError::NotFound(format!(
                "Could not find the file {dir} in container"
            )));
        }
        let mut tar = tar::Archive::new(archive);
        for entry in tar.entries().map_err(io)? {
            let mut entry = entry.map_err(io)?;
            let rel = entry.path().map_err(io)?.to_string_lossy().into_owned();
            let path = format!("{}/{}", dir.trim_end_matches('/'), rel.trim_end_matches('/'));
            if entry.header().entry_type().is_dir() {
                insert_dir_all(&mut state.files, &path);
            } else {
                let mut content = Vec::new();
                entry.read_to_end(&mut content).map_err(io)?;
                state.files.insert(path, Node::File(content));
            }
        }
        Ok(())
    }
}

fn insert_dir_all(files: &mut BTreeMap<String, Node>, path: &str) {
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        files.entry(current.clone()).or_insert(Node::Dir);
    }
}

fn framed(reply: ExecReply) -> ByteStream {
    let mut wire = Vec::new();
    if !reply.stdout.is_empty() {
        wire.extend_from_slice(&encode_frame(StreamTag::Stdout, &reply.stdout));
    }
    if !reply.stderr.is_empty() {
        wire.extend_from_slice(&encode_frame(StreamTag::Stderr, &reply.stderr));
    }
    let chunks: Vec<RuntimeResult<Bytes>> = wire
        .chunks(EXEC_CHUNK)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    Box::pin(stream::iter(chunks))
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn pull_image(&self, image: &str) -> PullStream {
        let (_, failure) = self.enter(RuntimeCall::Pull(image.to_string()));
        let items: Vec<RuntimeResult<String>> = match failure {
            Some(err) => vec![Ok("Pulling fs layer".to_string()), Err(err)],
            None => vec![
                Ok(format!("Pulling from {image}")),
                Ok("Pulling fs layer".to_string()),
                Ok("Download complete".to_string()),
                Ok(format!("Status: Downloaded newer image for {image}")),
            ],
        };
        Box::pin(stream::iter(items))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        self.gate(RuntimeCall::Create(spec.clone())).await?;
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("mock-{:04}", state.next_id);
        state.containers.insert(id.clone(), false);
        Ok(id)
    }

    async fn start(&self, container: &str) -> RuntimeResult<()> {
        self.gate(RuntimeCall::Start(container.to_string())).await?;
        if self.require(container)? {
            return Err(RuntimeError::NotModified("container already started".to_string()));
        }
        self.add_container(container, true);
        Ok(())
    }

    async fn stop(&self, container: &str, _grace: Duration) -> RuntimeResult<()> {
        self.gate(RuntimeCall::Stop(container.to_string())).await?;
        if !self.require(container)? {
            return Err(RuntimeError::NotModified("container already stopped".to_string()));
        }
        self.add_container(container, false);
        Ok(())
    }

    async fn restart(&self, container: &str, _grace: Duration) -> RuntimeResult<()> {
        self.gate(RuntimeCall::Restart(container.to_string())).await?;
        self.require(container)?;
        self.add_container(container, true);
        Ok(())
    }

    async fn kill(&self, container: &str) -> RuntimeResult<()> {
        self.gate(RuntimeCall::Kill(container.to_string())).await?;
        if !self.require(container)? {
            return Err(RuntimeError::Conflict(format!(
                "Container {container} is not running"
            )));
        }
        self.add_container(container, false);
        Ok(())
    }

    async fn remove(&self, container: &str, force: bool) -> RuntimeResult<()> {
        self.gate(RuntimeCall::Remove(container.to_string())).await?;
        if self.require(container)? && !force {
            return Err(RuntimeError::Conflict(format!(
                "cannot remove running container {container}"
            )));
        }
        self.forget_container(container);
        Ok(())
    }

    async fn inspect(&self, container: &str) -> RuntimeResult<ContainerState> {
        self.gate(RuntimeCall::Inspect(container.to_string())).await?;
        let running = self.require(container)?;
        Ok(ContainerState {
            running,
            status: if running { "running" } else { "exited" }.to_string(),
        })
    }

    async fn exec(&self, container: &str, cmd: Vec<String>) -> RuntimeResult<ByteStream> {
        let (hang, failure) = self.enter(RuntimeCall::Exec(container.to_string(), cmd.clone()));
        if let Some(err) = failure {
            return Err(err);
        }
        self.require(container)?;
        if hang {
            return Ok(Box::pin(stream::pending()));
        }
        Ok(framed(self.run_builtin(&cmd)))
    }

    async fn get_archive(&self, container: &str, path: &str) -> RuntimeResult<ByteStream> {
        self.gate(RuntimeCall::GetArchive(container.to_string(), path.to_string()))
            .await?;
        self.require(container)?;
        let item = self.archive_of(path).map(Bytes::from);
        Ok(Box::pin(stream::iter(vec![item])))
    }

    async fn put_archive(
        &self,
        container: &str,
        path: &str,
        archive: Bytes,
    ) -> RuntimeResult<()> {
        self.gate(RuntimeCall::PutArchive(container.to_string(), path.to_string()))
            .await?;
        self.require(container)?;
        self.unpack_into(path, &archive)
    }
}
