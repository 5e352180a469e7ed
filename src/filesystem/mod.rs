// src/filesystem/mod.rs

//! Filesystem helpers shared by the transaction code
//!
//! - content digests (md5, lower-case hex)
//! - package cache directory lookup
//! - small wrappers around `lstat`/`stat` that treat "missing" as `None`

use crate::delta::DeltaCache;
use crate::error::{Error, Result};
use md5::{Digest, Md5};
use std::fs::{self, File, Metadata};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// md5 of a file's contents as lower-case hex
pub fn digest(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// md5 of a file, or `None` if it cannot be read
pub fn try_digest(path: &Path) -> Option<String> {
    match digest(path) {
        Ok(hash) => Some(hash),
        Err(e) => {
            debug!("could not compute md5sum of {}: {}", path.display(), e);
            None
        }
    }
}

/// `lstat`, with a missing path as `None`
pub fn lstat(path: &Path) -> Option<Metadata> {
    fs::symlink_metadata(path).ok()
}

/// Does `path` exist as a directory, following symlinks?
pub fn is_dir_following_links(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| m.is_dir())
}

/// `path` with `suffix` appended to its last component (`foo.conf.pacnew`)
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Remove a path whatever its type, ignoring a missing one
pub fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Package cache directories, searched in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDirs {
    dirs: Vec<PathBuf>,
}

impl CacheDirs {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// First cache directory holding `filename`
    pub fn find(&self, filename: &str) -> Option<PathBuf> {
        self.dirs
            .iter()
            .map(|dir| dir.join(filename))
            .find(|path| path.is_file())
    }

    /// First usable cache directory, created if missing
    ///
    /// Falls back to the system temporary directory when none can be used.
    pub fn setup(&self) -> Result<PathBuf> {
        for dir in &self.dirs {
            if dir.is_dir() || fs::create_dir_all(dir).is_ok() {
                let writable = fs::metadata(dir).is_ok_and(|m| !m.permissions().readonly());
                if writable {
                    debug!("using cachedir: {}", dir.display());
                    return Ok(dir.clone());
                }
            }
            warn!("cache directory {} is not usable", dir.display());
        }

        let tmp = std::env::temp_dir().join("alam-cache");
        fs::create_dir_all(&tmp).map_err(|e| {
            Error::RetrievalFailed(format!("no usable package cache directory: {}", e))
        })?;
        warn!("couldn't create package cache, using {} instead", tmp.display());
        Ok(tmp)
    }
}

impl DeltaCache for CacheDirs {
    fn contains(&self, filename: &str) -> bool {
        self.find(filename).is_some()
    }

    fn contains_verified(&self, filename: &str, md5sum: &str) -> bool {
        self.find(filename)
            .and_then(|path| try_digest(&path))
            .is_some_and(|hash| hash == md5sum)
    }
}
