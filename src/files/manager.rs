use std::{collections::BTreeSet, sync::Arc};

use bytes::Bytes;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    archive::{self, ArchiveEntry, ArchiveFormat, Budget, EntryKind},
    listing::{list_command, parse_listing},
    path::{file_name, join, normalize, split_parent},
    safety,
    stream::{ExecOutput, read_bytes, read_exec},
    types::{Download, ExtractReport, FileInfo, FileManager, FilePolicy},
};
use crate::{
    error::{Error, Result},
    runtime::types::{ContainerRuntime, RuntimeError},
    store::Store,
    tasks::types::ServerStatus,
};

/// Headroom over the archive ceiling for tar headers around copied content.
const TAR_SLACK: u64 = 1 << 20;

/// Which not-found error a failing command should surface.
#[derive(Clone, Copy)]
enum Missing {
    File,
    Directory,
}

impl Missing {
    fn error(self, path: &str) -> Error {
        match self {
            Missing::File => Error::FileNotFound(path.to_string()),
            Missing::Directory => Error::DirectoryNotFound(path.to_string()),
        }
    }
}

fn classify_stderr(output: &ExecOutput, path: &str, missing: Missing) -> Result<()> {
    let stderr = output.stderr_text();
    let stderr = stderr.trim();
    if stderr.is_empty() {
        Ok(())
    } else if stderr.contains("No such file") {
        Err(missing.error(path))
    } else if stderr.contains("Permission denied") {
        Err(Error::PermissionDenied(format!("{path}: {stderr}")))
    } else {
        Err(Error::unknown(format!("exec on {path}"), stderr))
    }
}

impl FileManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, store: Arc<dyn Store>, policy: FilePolicy) -> Self {
        FileManager {
            runtime,
            store,
            policy,
        }
    }

    pub fn policy(&self) -> &FilePolicy {
        &self.policy
    }

    async fn container(&self, server_id: Uuid) -> Result<String> {
        let server = self
            .store
            .load_server(server_id)
            .await?
            .filter(|server| server.status != ServerStatus::Deleted)
            .ok_or(Error::ServerNotFound(server_id))?;
        server
            .container_ref
            .ok_or_else(|| Error::ContainerNotFound(format!("server {server_id} has no container")))
    }

    fn guard_protected(&self, path: &str) -> Result<()> {
        let name = file_name(path);
        if path == "/"
            || self
                .policy
                .protected_names
                .iter()
                .any(|protected| protected.eq_ignore_ascii_case(name))
        {
            return Err(Error::ProtectedFile(path.to_string()));
        }
        Ok(())
    }

    /// Local checks every write passes before any bytes leave the process.
    fn vet_write<'a>(&self, path: &'a str, content: &[u8]) -> Result<(&'a str, &'a str)> {
        let (parent, name) = split_parent(path)
            .ok_or_else(|| Error::PreconditionFailed(format!("{path} is not a file path")))?;
        self.guard_protected(path)?;
        let size = content.len() as u64;
        if size > self.policy.max_write_bytes {
            return Err(Error::PayloadTooLarge {
                size,
                limit: self.policy.max_write_bytes,
            });
        }
        safety::scan(content)?;
        Ok((parent, name))
    }

    async fn exec(&self, container: &str, cmd: Vec<String>) -> Result<ExecOutput> {
        let timeout = self.policy.exec_timeout;
        debug!(container, ?cmd, "Exec in container");
        let stream = tokio::time::timeout(timeout, self.runtime.exec(container, cmd))
            .await
            .map_err(|_| Error::Timeout(timeout))??;
        read_exec(stream, timeout).await
    }

    async fn fetch(&self, container: &str, path: &str, missing: Missing) -> Result<Vec<u8>> {
        let timeout = self.policy.exec_timeout;
        let classify = |err: RuntimeError| match err {
            RuntimeError::NotFound(_) => missing.error(path),
            other => Error::from(other),
        };
        let stream = tokio::time::timeout(timeout, self.runtime.get_archive(container, path))
            .await
            .map_err(|_| Error::Timeout(timeout))?
            .map_err(classify)?;
        let limit = self.policy.max_archive_bytes.saturating_add(TAR_SLACK);
        read_bytes(stream, timeout, limit, classify).await
    }

    async fn put(&self, container: &str, parent: &str, name: &str, content: &[u8]) -> Result<()> {
        let tar = archive::pack_file(name, content)?;
        let timeout = self.policy.exec_timeout;
        tokio::time::timeout(
            timeout,
            self.runtime.put_archive(container, parent, Bytes::from(tar)),
        )
        .await
        .map_err(|_| Error::Timeout(timeout))?
        .map_err(|err| match err {
            RuntimeError::NotFound(_) => Error::DirectoryNotFound(parent.to_string()),
            other => other.into(),
        })
    }

    async fn mkdir(&self, container: &str, path: &str) -> Result<()> {
        let output = self
            .exec(
                container,
                vec!["mkdir".to_string(), "-p".to_string(), path.to_string()],
            )
            .await?;
        classify_stderr(&output, path, Missing::Directory)
    }

    pub async fn list_files(&self, server_id: Uuid, dir: &str) -> Result<Vec<FileInfo>> {
        let dir = normalize(dir)?;
        let container = self.container(server_id).await?;
        let output = self.exec(&container, list_command(&dir)).await?;
        classify_stderr(&output, &dir, Missing::Directory)?;
        Ok(parse_listing(&dir, &output.stdout_text()))
    }

    pub async fn read_file(&self, server_id: Uuid, path: &str) -> Result<Vec<u8>> {
        let path = normalize(path)?;
        let container = self.container(server_id).await?;
        let tar = self.fetch(&container, &path, Missing::File).await?;
        archive::unpack_file(&tar, self.policy.max_archive_bytes)?
            .ok_or_else(|| Error::PreconditionFailed(format!("{path} is not a regular file")))
    }

    pub async fn write_file(&self, server_id: Uuid, path: &str, content: &[u8]) -> Result<()> {
        let path = normalize(path)?;
        let (parent, name) = self.vet_write(&path, content)?;
        let container = self.container(server_id).await?;
        self.put(&container, parent, name, content).await?;
        info!(server_id = %server_id, path = %path, bytes = content.len(), "File written");
        Ok(())
    }

    /// Removes a file or directory tree. Already absent counts as success.
    pub async fn delete_file(&self, server_id: Uuid, path: &str) -> Result<()> {
        let path = normalize(path)?;
        self.guard_protected(&path)?;
        let container = self.container(server_id).await?;
        let output = self
            .exec(
                &container,
                vec!["rm".to_string(), "-rf".to_string(), path.clone()],
            )
            .await?;
        match classify_stderr(&output, &path, Missing::File) {
            Err(Error::FileNotFound(_)) => {
                debug!(path = %path, "Delete target already absent");
                Ok(())
            }
            other => other,
        }?;
        info!(server_id = %server_id, path = %path, "File deleted");
        Ok(())
    }

    pub async fn create_directory(&self, server_id: Uuid, path: &str) -> Result<()> {
        let path = normalize(path)?;
        let container = self.container(server_id).await?;
        self.mkdir(&container, &path).await
    }

    /// File contents, or the raw tar stream when `path` is a directory.
    pub async fn download_file(&self, server_id: Uuid, path: &str) -> Result<Download> {
        let path = normalize(path)?;
        let container = self.container(server_id).await?;
        let tar = self.fetch(&container, &path, Missing::File).await?;
        let name = match file_name(&path) {
            "" => "root".to_string(),
            name => name.to_string(),
        };
        Ok(match archive::unpack_file(&tar, self.policy.max_archive_bytes)? {
            Some(content) => Download {
                name,
                content,
                archive: false,
            },
            None => Download {
                name: format!("{name}.tar"),
                content: tar,
                archive: true,
            },
        })
    }

    /// Store `content` as `file_name` inside `dir`. Returns the written path.
    pub async fn upload_file(
        &self,
        server_id: Uuid,
        dir: &str,
        file_name: &str,
        content: &[u8],
    ) -> Result<String> {
        if file_name.is_empty()
            || file_name == "."
            || file_name == ".."
            || file_name.contains(['/', '\\'])
        {
            return Err(Error::PathTraversal(format!("upload name {file_name}")));
        }
        let path = join(&normalize(dir)?, file_name);
        self.write_file(server_id, &path, content).await?;
        Ok(path)
    }

    /// Unpack an archive already inside the container into `destination`.
    ///
    /// Every member is vetted before the first write, so a rejected archive leaves
    /// the container untouched.
    pub async fn extract_archive(
        &self,
        server_id: Uuid,
        archive_path: &str,
        destination: &str,
    ) -> Result<ExtractReport> {
        let archive_path = normalize(archive_path)?;
        let destination = normalize(destination)?;
        let container = self.container(server_id).await?;

        let tar = self.fetch(&container, &archive_path, Missing::File).await?;
        let bytes = archive::unpack_file(&tar, self.policy.max_archive_bytes)?.ok_or_else(|| {
            Error::PreconditionFailed(format!("{archive_path} is not a regular file"))
        })?;
        drop(tar);

        let ceiling = self.policy.max_archive_bytes;
        let entries = tokio::task::spawn_blocking(move || {
            archive::decode(&bytes, &mut Budget::new(ceiling))
        })
        .await
        .map_err(|err| Error::unknown("archive decode task", err))??;

        let mut planned = Vec::with_capacity(entries.len());
        for entry in entries {
            let target = normalize(&join(&destination, &entry.path))?;
            match &entry.kind {
                EntryKind::Directory => self.guard_protected(&target)?,
                EntryKind::File(data) => {
                    self.vet_write(&target, data)?;
                }
            }
            planned.push((target, entry));
        }

        info!(
            server_id = %server_id,
            archive = %archive_path,
            destination = %destination,
            entries = planned.len(),
            "Extracting archive"
        );

        let mut report = ExtractReport::default();
        let mut ensured = BTreeSet::new();
        self.mkdir(&container, &destination).await?;
        ensured.insert(destination.clone());

        let total = planned.len();
        let mut last_logged = 0;
        for (done, (target, entry)) in planned.into_iter().enumerate() {
            match entry.kind {
                EntryKind::Directory => {
                    if ensured.insert(target.clone()) {
                        self.mkdir(&container, &target).await?;
                    }
                    report.directories += 1;
                }
                EntryKind::File(data) => {
                    let Some((parent, name)) = split_parent(&target) else {
                        continue;
                    };
                    if ensured.insert(parent.to_string()) {
                        self.mkdir(&container, parent).await?;
                    }
                    self.put(&container, parent, name, &data).await?;
                    report.files += 1;
                    report.bytes += data.len() as u64;
                }
            }

            let percent = (done + 1) * 100 / total;
            if percent >= last_logged + 10 {
                last_logged = percent - percent % 10;
                info!(server_id = %server_id, percent, "Extraction progress");
            }
        }

        info!(
            server_id = %server_id,
            files = report.files,
            directories = report.directories,
            bytes = report.bytes,
            "Archive extracted"
        );
        Ok(report)
    }

    /// Bundle `sources` into a new archive at `destination`, format taken from its
    /// extension. Returns the archive size.
    pub async fn compress_archive(
        &self,
        server_id: Uuid,
        sources: &[String],
        destination: &str,
    ) -> Result<u64> {
        let destination = normalize(destination)?;
        let format = ArchiveFormat::from_name(&destination).ok_or_else(|| {
            Error::PreconditionFailed(format!(
                "{destination} must end in .zip, .tar.gz, .tgz or .tar"
            ))
        })?;
        if sources.is_empty() {
            return Err(Error::PreconditionFailed("nothing to compress".to_string()));
        }
        let sources = sources
            .iter()
            .map(|source| normalize(source))
            .collect::<Result<Vec<_>>>()?;
        self.guard_protected(&destination)?;
        let container = self.container(server_id).await?;

        let mut budget = Budget::new(self.policy.max_archive_bytes);
        let mut entries: Vec<ArchiveEntry> = Vec::new();
        for source in &sources {
            let tar = self
                .fetch(&container, source, Missing::File)
                .await
                .map_err(|err| match err {
                    Error::PayloadTooLarge { .. } => Error::ArchiveTooLarge {
                        limit: self.policy.max_archive_bytes,
                    },
                    other => other,
                })?;
            let (decoded, used) = tokio::task::spawn_blocking(move || {
                archive::decode(&tar, &mut budget).map(|entries| (entries, budget))
            })
            .await
            .map_err(|err| Error::unknown("archive decode task", err))??;
            budget = used;
            entries.extend(decoded);
        }

        let bytes = tokio::task::spawn_blocking(move || archive::encode(format, &entries))
            .await
            .map_err(|err| Error::unknown("archive encode task", err))??;
        let size = bytes.len() as u64;
        self.write_file(server_id, &destination, &bytes).await?;
        info!(
            server_id = %server_id,
            destination = %destination,
            sources = sources.len(),
            size,
            "Archive created"
        );
        Ok(size)
    }
}
