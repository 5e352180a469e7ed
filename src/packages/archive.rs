// src/packages/archive.rs

//! Package archive access
//!
//! The transaction engine decides what happens to every entry of a package
//! archive; reading the archive itself goes through [`ArchiveReader`].
//! Entries are visited in archive order and each one may be extracted to a
//! chosen destination or read into memory. An entry that is neither is
//! skipped.
//!
//! [`TarArchive`] reads gzip, xz or zstd compressed tarballs.
//! [`MemoryArchive`] holds entries in memory and is used to build packages
//! without touching a package file.

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use xz2::read::XzDecoder;

/// Type of an archive entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// The entry currently being visited
pub trait ArchiveEntry {
    /// Path inside the archive, without a leading `./` and without the
    /// trailing `/` of directories
    fn name(&self) -> &str;

    fn kind(&self) -> EntryKind;

    /// Permission bits
    fn mode(&self) -> u32;

    fn size(&self) -> u64;

    /// Write the entry to `dest`, replacing a file that is already there
    fn extract_to(&mut self, dest: &Path) -> Result<()>;

    /// Read the entry's contents
    fn read_all(&mut self) -> Result<Vec<u8>>;
}

/// Sequential reader over the entries of one package archive
pub trait ArchiveReader {
    /// Call `visit` for every entry; an error from `visit` stops the walk
    fn for_each_entry(
        &mut self,
        visit: &mut dyn FnMut(&mut dyn ArchiveEntry) -> Result<()>,
    ) -> Result<()>;
}

/// Opens package files for reading
pub trait ArchiveOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn ArchiveReader>>;
}

/// Compression of a package tarball
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    Zstd,
    Xz,
    Gzip,
    None,
}

impl Compression {
    /// Detect from magic bytes, falling back to the file extension
    fn detect(path: &Path) -> Result<Self> {
        let mut magic = [0u8; 6];
        let mut file = File::open(path)?;
        let read = file.read(&mut magic)?;
        let magic = &magic[..read];

        if magic.starts_with(&[0x28, 0xB5, 0x2F, 0xFD]) {
            return Ok(Compression::Zstd);
        }
        if magic.starts_with(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00]) {
            return Ok(Compression::Xz);
        }
        if magic.starts_with(&[0x1F, 0x8B]) {
            return Ok(Compression::Gzip);
        }

        let name = path.to_string_lossy();
        if name.ends_with(".tar") {
            Ok(Compression::None)
        } else {
            Err(Error::PackageInvalid(format!(
                "unsupported package format: {}",
                path.display()
            )))
        }
    }
}

/// Largest buffer reserved up front by `read_all`
const READ_RESERVE: u64 = 1 << 20;

/// Does the entry name stay below the directory it is extracted into?
///
/// Absolute names and names with `..` components are refused.
pub fn is_contained(name: &str) -> bool {
    !name.is_empty()
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn check_contained(name: &str) -> Result<()> {
    if is_contained(name) {
        Ok(())
    } else {
        Err(Error::PackageInvalid(format!(
            "refusing to extract '{}' outside the root",
            name
        )))
    }
}

/// Compressed tarball package
pub struct TarArchive {
    archive: tar::Archive<Box<dyn Read>>,
}

impl TarArchive {
    pub fn open(path: &Path) -> Result<Self> {
        let compression = Compression::detect(path)?;
        let file = BufReader::new(File::open(path)?);

        let reader: Box<dyn Read> = match compression {
            Compression::Zstd => Box::new(zstd::Decoder::with_buffer(file).map_err(|e| {
                Error::PackageInvalid(format!("failed to create zstd decoder: {}", e))
            })?),
            Compression::Xz => Box::new(XzDecoder::new(file)),
            Compression::Gzip => Box::new(GzDecoder::new(file)),
            Compression::None => Box::new(file),
        };

        let mut archive = tar::Archive::new(reader);
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        archive.set_overwrite(true);
        Ok(Self { archive })
    }
}

struct TarEntry<'a, 'b> {
    entry: &'a mut tar::Entry<'b, Box<dyn Read>>,
    name: String,
    kind: EntryKind,
    mode: u32,
    size: u64,
}

impl ArchiveEntry for TarEntry<'_, '_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EntryKind {
        self.kind
    }

    fn mode(&self) -> u32 {
        self.mode
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn extract_to(&mut self, dest: &Path) -> Result<()> {
        check_contained(&self.name)?;
        if self.kind == EntryKind::Symlink && fs::symlink_metadata(dest).is_ok() {
            fs::remove_file(dest)?;
        }
        self.entry.unpack(dest)?;
        Ok(())
    }

    fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(self.size.min(READ_RESERVE) as usize);
        self.entry.read_to_end(&mut data)?;
        Ok(data)
    }
}

impl ArchiveReader for TarArchive {
    fn for_each_entry(
        &mut self,
        visit: &mut dyn FnMut(&mut dyn ArchiveEntry) -> Result<()>,
    ) -> Result<()> {
        for entry in self.archive.entries()? {
            let mut entry = entry?;
            let header = entry.header();
            let kind = match header.entry_type() {
                tar::EntryType::Regular | tar::EntryType::Continuous => EntryKind::File,
                tar::EntryType::Directory => EntryKind::Directory,
                tar::EntryType::Symlink => EntryKind::Symlink,
                _ => EntryKind::Other,
            };
            let mode = header.mode()?;
            let size = header.size()?;
            let name = entry.path()?.to_string_lossy().to_string();
            let name = name
                .trim_start_matches("./")
                .trim_end_matches('/')
                .to_string();
            if name.is_empty() {
                continue;
            }

            let mut handle = TarEntry {
                entry: &mut entry,
                name,
                kind,
                mode,
                size,
            };
            visit(&mut handle)?;
        }
        Ok(())
    }
}

/// Opens package files as [`TarArchive`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct TarArchiveOpener;

impl ArchiveOpener for TarArchiveOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn ArchiveReader>> {
        debug!("opening archive {}", path.display());
        Ok(Box::new(TarArchive::open(path)?))
    }
}

/// An entry of a [`MemoryArchive`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryEntry {
    pub name: String,
    pub kind: EntryKind,
    pub mode: u32,
    /// File contents, or the target of a symlink
    pub data: Vec<u8>,
}

impl MemoryEntry {
    pub fn file(name: &str, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.to_string(),
            kind: EntryKind::File,
            mode: 0o644,
            data: data.into(),
        }
    }

    pub fn dir(name: &str) -> Self {
        Self {
            name: name.trim_end_matches('/').to_string(),
            kind: EntryKind::Directory,
            mode: 0o755,
            data: Vec::new(),
        }
    }

    pub fn symlink(name: &str, target: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: EntryKind::Symlink,
            mode: 0o777,
            data: target.as_bytes().to_vec(),
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }
}

/// Archive held in memory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryArchive {
    pub entries: Vec<MemoryEntry>,
}

impl MemoryArchive {
    pub fn new(entries: Vec<MemoryEntry>) -> Self {
        Self { entries }
    }
}

struct MemoryHandle<'a> {
    entry: &'a MemoryEntry,
}

impl ArchiveEntry for MemoryHandle<'_> {
    fn name(&self) -> &str {
        &self.entry.name
    }

    fn kind(&self) -> EntryKind {
        self.entry.kind
    }

    fn mode(&self) -> u32 {
        self.entry.mode
    }

    fn size(&self) -> u64 {
        self.entry.data.len() as u64
    }

    fn extract_to(&mut self, dest: &Path) -> Result<()> {
        check_contained(&self.entry.name)?;
        match self.entry.kind {
            EntryKind::Directory => {
                fs::create_dir_all(dest)?;
                fs::set_permissions(dest, fs::Permissions::from_mode(self.entry.mode))?;
            }
            EntryKind::Symlink => {
                if fs::symlink_metadata(dest).is_ok() {
                    fs::remove_file(dest)?;
                }
                let target = String::from_utf8_lossy(&self.entry.data).to_string();
                symlink(target, dest)?;
            }
            EntryKind::File | EntryKind::Other => {
                if fs::symlink_metadata(dest).is_ok_and(|m| m.file_type().is_symlink()) {
                    fs::remove_file(dest)?;
                }
                fs::write(dest, &self.entry.data)?;
                fs::set_permissions(dest, fs::Permissions::from_mode(self.entry.mode))?;
            }
        }
        Ok(())
    }

    fn read_all(&mut self) -> Result<Vec<u8>> {
        Ok(self.entry.data.clone())
    }
}

impl ArchiveReader for MemoryArchive {
    fn for_each_entry(
        &mut self,
        visit: &mut dyn FnMut(&mut dyn ArchiveEntry) -> Result<()>,
    ) -> Result<()> {
        for entry in &self.entries {
            visit(&mut MemoryHandle { entry })?;
        }
        Ok(())
    }
}

/// Serves [`MemoryArchive`]s by path
#[derive(Debug, Clone, Default)]
pub struct MemoryArchiveOpener {
    archives: HashMap<PathBuf, MemoryArchive>,
}

impl MemoryArchiveOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, archive: MemoryArchive) {
        self.archives.insert(path.into(), archive);
    }
}

impl ArchiveOpener for MemoryArchiveOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn ArchiveReader>> {
        self.archives
            .get(path)
            .cloned()
            .map(|a| Box::new(a) as Box<dyn ArchiveReader>)
            .ok_or_else(|| Error::PackageNotFound(path.display().to_string()))
    }
}
