//! In-memory archive codecs: tar for the container copy API, plus zip, tar.gz
//! and tar for operator archives.

use std::io::{self, Cursor, Read, Write};

use chrono::Utc;
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use tracing::debug;

use super::path::normalize;
use crate::error::{Error, Result};

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY_MAGIC: &[u8] = b"PK\x05\x06";
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    Zip,
}

impl ArchiveFormat {
    /// Detect by magic bytes; anything unrecognised is treated as plain tar.
    pub fn sniff(bytes: &[u8]) -> Self {
        if bytes.starts_with(ZIP_MAGIC) || bytes.starts_with(ZIP_EMPTY_MAGIC) {
            ArchiveFormat::Zip
        } else if bytes.starts_with(GZIP_MAGIC) {
            ArchiveFormat::TarGz
        } else {
            ArchiveFormat::Tar
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if lower.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File(Vec<u8>),
}

/// An archive member. `path` is relative and slash-separated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: String,
    pub kind: EntryKind,
}

impl ArchiveEntry {
    pub fn size(&self) -> u64 {
        match &self.kind {
            EntryKind::Directory => 0,
            EntryKind::File(data) => data.len() as u64,
        }
    }
}

/// Running total of decompressed bytes across one or more archive walks.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    used: u64,
    ceiling: u64,
}

impl Budget {
    pub fn new(ceiling: u64) -> Self {
        Budget { used: 0, ceiling }
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    fn exceeded(&self) -> Error {
        Error::ArchiveTooLarge {
            limit: self.ceiling,
        }
    }

    fn read(&mut self, declared: u64, reader: impl Read) -> Result<Vec<u8>> {
        if self.used.saturating_add(declared) > self.ceiling {
            return Err(self.exceeded());
        }
        let remaining = self.ceiling - self.used;
        let mut data = Vec::with_capacity(declared.min(remaining).min(1 << 20) as usize);
        // Declared sizes can lie, so read at most one byte past the ceiling.
        reader
            .take(remaining.saturating_add(1))
            .read_to_end(&mut data)
            .map_err(io_error)?;
        self.used += data.len() as u64;
        if self.used > self.ceiling {
            return Err(self.exceeded());
        }
        Ok(data)
    }
}

fn io_error(err: io::Error) -> Error {
    Error::unknown("archive", err)
}

fn zip_error(err: zip::result::ZipError) -> Error {
    Error::unknown("zip archive", err)
}

/// Validate a member name, returning it relative. `None` for the archive root.
fn member_path(raw: &str) -> Result<Option<String>> {
    let normalized = normalize(&format!("/{raw}"))
        .map_err(|_| Error::PathTraversal(format!("archive member {raw}")))?;
    let relative = normalized.trim_start_matches('/');
    Ok((!relative.is_empty()).then(|| relative.to_string()))
}

/// Decode any supported archive, sniffing its format.
pub fn decode(bytes: &[u8], budget: &mut Budget) -> Result<Vec<ArchiveEntry>> {
    match ArchiveFormat::sniff(bytes) {
        ArchiveFormat::Zip => decode_zip(bytes, budget),
        ArchiveFormat::TarGz => decode_tar(GzDecoder::new(bytes), budget),
        ArchiveFormat::Tar => decode_tar(bytes, budget),
    }
}

fn decode_tar(reader: impl Read, budget: &mut Budget) -> Result<Vec<ArchiveEntry>> {
    let mut archive = tar::Archive::new(reader);
    let mut entries = Vec::new();
    for entry in archive.entries().map_err(io_error)? {
        let mut entry = entry.map_err(io_error)?;
        let raw = entry.path().map_err(io_error)?.to_string_lossy().into_owned();
        let Some(path) = member_path(&raw)? else {
            continue;
        };
        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            entries.push(ArchiveEntry {
                path,
                kind: EntryKind::Directory,
            });
        } else if entry_type.is_file() {
            let declared = entry.size();
            let data = budget.read(declared, &mut entry)?;
            entries.push(ArchiveEntry {
                path,
                kind: EntryKind::File(data),
            });
        } else {
            debug!(member = %raw, ?entry_type, "Skipping non-regular archive member");
        }
    }
    Ok(entries)
}

fn decode_zip(bytes: &[u8], budget: &mut Budget) -> Result<Vec<ArchiveEntry>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(zip_error)?;
    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut file = archive.by_index(index).map_err(zip_error)?;
        let raw = file.name().to_string();
        let Some(path) = member_path(&raw)? else {
            continue;
        };
        if file
            .unix_mode()
            .is_some_and(|mode| mode & S_IFMT == S_IFLNK)
        {
            debug!(member = %raw, "Skipping symlink archive member");
            continue;
        }
        if file.is_dir() {
            entries.push(ArchiveEntry {
                path,
                kind: EntryKind::Directory,
            });
        } else {
            let declared = file.size();
            let data = budget.read(declared, &mut file)?;
            entries.push(ArchiveEntry {
                path,
                kind: EntryKind::File(data),
            });
        }
    }
    Ok(entries)
}

pub fn encode(format: ArchiveFormat, entries: &[ArchiveEntry]) -> Result<Vec<u8>> {
    match format {
        ArchiveFormat::Tar => {
            let mut builder = tar::Builder::new(Vec::new());
            append_all(&mut builder, entries).map_err(io_error)?;
            builder.into_inner().map_err(io_error)
        }
        ArchiveFormat::TarGz => {
            let mut builder =
                tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
            append_all(&mut builder, entries).map_err(io_error)?;
            builder
                .into_inner()
                .and_then(GzEncoder::finish)
                .map_err(io_error)
        }
        ArchiveFormat::Zip => encode_zip(entries),
    }
}

fn append_all<W: Write>(builder: &mut tar::Builder<W>, entries: &[ArchiveEntry]) -> io::Result<()> {
    let mtime = Utc::now().timestamp().max(0) as u64;
    for entry in entries {
        let mut header = tar::Header::new_gnu();
        header.set_mtime(mtime);
        match &entry.kind {
            EntryKind::Directory => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder.append_data(&mut header, &entry.path, io::empty())?;
            }
            EntryKind::File(data) => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(data.len() as u64);
                builder.append_data(&mut header, &entry.path, data.as_slice())?;
            }
        }
    }
    Ok(())
}

fn encode_zip(entries: &[ArchiveEntry]) -> Result<Vec<u8>> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for entry in entries {
        match &entry.kind {
            EntryKind::Directory => writer
                .add_directory(entry.path.as_str(), options)
                .map_err(zip_error)?,
            EntryKind::File(data) => {
                writer
                    .start_file(entry.path.as_str(), options)
                    .map_err(zip_error)?;
                writer.write_all(data).map_err(io_error)?;
            }
        }
    }
    Ok(writer.finish().map_err(zip_error)?.into_inner())
}

/// Wrap one file in a tar stream for the container copy API.
pub fn pack_file(name: &str, content: &[u8]) -> Result<Vec<u8>> {
    encode(
        ArchiveFormat::Tar,
        &[ArchiveEntry {
            path: name.to_string(),
            kind: EntryKind::File(content.to_vec()),
        }],
    )
}

/// Contents of the first member when it is a regular file, `None` otherwise.
pub fn unpack_file(tar_bytes: &[u8], limit: u64) -> Result<Option<Vec<u8>>> {
    let mut archive = tar::Archive::new(tar_bytes);
    let mut entries = archive.entries().map_err(io_error)?;
    let Some(entry) = entries.next() else {
        return Ok(None);
    };
    let mut entry = entry.map_err(io_error)?;
    if !entry.header().entry_type().is_file() {
        return Ok(None);
    }
    let declared = entry.size();
    if declared > limit {
        return Err(Error::PayloadTooLarge {
            size: declared,
            limit,
        });
    }
    let mut data = Vec::with_capacity(declared as usize);
    entry.read_to_end(&mut data).map_err(io_error)?;
    Ok(Some(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn file(path: &str, data: &[u8]) -> ArchiveEntry {
        ArchiveEntry {
            path: path.to_string(),
            kind: EntryKind::File(data.to_vec()),
        }
    }

    fn dir(path: &str) -> ArchiveEntry {
        ArchiveEntry {
            path: path.to_string(),
            kind: EntryKind::Directory,
        }
    }

    #[test]
    fn format_is_chosen_by_magic_then_by_extension() {
        let zip = encode(ArchiveFormat::Zip, &[file("a", b"1")]).unwrap();
        let tgz = encode(ArchiveFormat::TarGz, &[file("a", b"1")]).unwrap();
        assert_eq!(ArchiveFormat::sniff(&zip), ArchiveFormat::Zip);
        assert_eq!(ArchiveFormat::sniff(&tgz), ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::sniff(b"whatever"), ArchiveFormat::Tar);

        assert_eq!(ArchiveFormat::from_name("/b/World.ZIP"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::from_name("x.tgz"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::from_name("x.tar"), Some(ArchiveFormat::Tar));
        assert_eq!(ArchiveFormat::from_name("x.rar"), None);
    }

    #[test]
    fn zip_members_keep_structure() {
        let bytes = encode(
            ArchiveFormat::Zip,
            &[dir("plugins"), file("plugins/a.yml", b"enabled: true\n")],
        )
        .unwrap();
        let entries = decode(&bytes, &mut Budget::new(1024)).unwrap();
        assert_eq!(entries, vec![dir("plugins"), file("plugins/a.yml", b"enabled: true\n")]);
    }

    #[test]
    fn cumulative_ceiling_stops_the_walk() {
        let bytes = encode(
            ArchiveFormat::TarGz,
            &[file("a.bin", &[0u8; 600]), file("b.bin", &[0u8; 600])],
        )
        .unwrap();
        let mut budget = Budget::new(1000);
        let err = decode(&bytes, &mut budget).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArchiveTooLarge);
        assert!(budget.used() <= 1000);
    }

    #[test]
    fn budget_spans_multiple_archives() {
        let bytes = encode(ArchiveFormat::Tar, &[file("a", &[1u8; 60])]).unwrap();
        let mut budget = Budget::new(100);
        decode(&bytes, &mut budget).unwrap();
        assert_eq!(
            decode(&bytes, &mut budget).unwrap_err().kind(),
            ErrorKind::ArchiveTooLarge
        );
    }

    #[test]
    fn traversal_member_is_refused() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("../../etc/cron.d/evil", zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(b"* * * * * root sh").unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let err = decode(&bytes, &mut Budget::new(1024)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathTraversal);
    }

    #[test]
    fn symlinks_are_skipped() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        builder
            .append_link(&mut header, "escape", "/etc/passwd")
            .unwrap();
        let mut header = tar::Header::new_gnu();
        header.set_size(2);
        builder.append_data(&mut header, "ok.txt", &b"ok"[..]).unwrap();
        let bytes = builder.into_inner().unwrap();

        let entries = decode(&bytes, &mut Budget::new(1024)).unwrap();
        assert_eq!(entries, vec![file("ok.txt", b"ok")]);
    }

    #[test]
    fn single_file_tar_round_trip_and_directory_detection() {
        let packed = pack_file("server.properties", b"motd=hi\n").unwrap();
        assert_eq!(unpack_file(&packed, 1024).unwrap().unwrap(), b"motd=hi\n");

        let dir_tar = encode(ArchiveFormat::Tar, &[dir("plugins")]).unwrap();
        assert_eq!(unpack_file(&dir_tar, 1024).unwrap(), None);
    }
}
