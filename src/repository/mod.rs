// src/repository/mod.rs

//! Package and delta retrieval
//!
//! A [`Fetcher`] downloads a batch of files from a list of mirrors into a
//! directory. [`HttpFetcher`] handles `http(s)://` servers with retries and
//! `file://` servers by copying.

use crate::error::{Error, Result};
use reqwest::blocking::Client;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Default timeout for HTTP requests (30 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum retry attempts per server
const MAX_RETRIES: u32 = 3;

/// Retry delay in milliseconds
const RETRY_DELAY_MS: u64 = 1000;

/// Called with the file name, bytes received so far and the total size
/// (0 when unknown)
pub type DownloadProgress<'a> = &'a mut dyn FnMut(&str, u64, u64);

/// Downloads files from a list of mirrors
pub trait Fetcher {
    /// Download every file in `files` into `dest_dir`
    ///
    /// Servers are tried in order for each file until one succeeds. Files
    /// already present in `dest_dir` are not fetched again.
    ///
    /// # Errors
    /// `RetrievalFailed` naming every file no server could provide.
    fn download(
        &self,
        files: &[String],
        servers: &[String],
        dest_dir: &Path,
        progress: DownloadProgress<'_>,
    ) -> Result<()>;
}

/// HTTP client wrapper with retry support
pub struct HttpFetcher {
    client: Client,
    max_retries: u32,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("alam/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::RetrievalFailed(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_retries: MAX_RETRIES,
        })
    }

    /// Fetch one URL into `dest`, staged through a temporary file
    fn fetch_url(&self, url: &str, dest: &Path, progress: &mut dyn FnMut(&str, u64, u64)) -> Result<()> {
        let filename = file_name(dest);
        let dir = dest.parent().unwrap_or(Path::new("."));

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(url).send() {
                Ok(mut response) => {
                    if !response.status().is_success() {
                        return Err(Error::RetrievalFailed(format!(
                            "HTTP {} from {}",
                            response.status(),
                            url
                        )));
                    }

                    let total = response.content_length().unwrap_or(0);
                    let mut temp = NamedTempFile::new_in(dir)?;
                    copy_with_progress(&mut response, temp.as_file_mut(), &filename, total, progress)?;
                    temp.persist(dest).map_err(|e| Error::Io(e.error))?;

                    info!("downloaded {}", url);
                    return Ok(());
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(Error::RetrievalFailed(format!(
                            "failed to download {} after {} attempts: {}",
                            url, attempt, e
                        )));
                    }
                    warn!("download attempt {} of {} failed: {}, retrying...", attempt, url, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }
}

impl Fetcher for HttpFetcher {
    fn download(
        &self,
        files: &[String],
        servers: &[String],
        dest_dir: &Path,
        progress: DownloadProgress<'_>,
    ) -> Result<()> {
        fs::create_dir_all(dest_dir)?;
        let mut failed = Vec::new();

        for file in files {
            let dest = dest_dir.join(file);
            if dest.is_file() {
                debug!("{} is already in the cache", file);
                continue;
            }

            let mut done = false;
            for server in servers {
                let result = match server.strip_prefix("file://") {
                    Some(dir) => copy_local(&PathBuf::from(dir).join(file), &dest, progress),
                    None => {
                        let url = format!("{}/{}", server.trim_end_matches('/'), file);
                        self.fetch_url(&url, &dest, progress)
                    }
                };
                match result {
                    Ok(()) => {
                        done = true;
                        break;
                    }
                    Err(e) => warn!("failed retrieving file '{}' from {}: {}", file, server, e),
                }
            }

            if !done {
                failed.push(file.clone());
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::RetrievalFailed(failed.join(", ")))
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn copy_with_progress(
    reader: &mut dyn Read,
    writer: &mut File,
    filename: &str,
    total: u64,
    progress: &mut dyn FnMut(&str, u64, u64),
) -> io::Result<u64> {
    let mut buffer = [0u8; 8192];
    let mut xfered = 0u64;
    progress(filename, 0, total);
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        writer.write_all(&buffer[..read])?;
        xfered += read as u64;
        progress(filename, xfered, total);
    }
    writer.flush()?;
    Ok(xfered)
}

/// Copy a file from a `file://` mirror
fn copy_local(src: &Path, dest: &Path, progress: &mut dyn FnMut(&str, u64, u64)) -> Result<()> {
    let mut input = File::open(src)?;
    let total = input.metadata()?.len();
    let dir = dest.parent().unwrap_or(Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    copy_with_progress(&mut input, temp.as_file_mut(), &file_name(dest), total, progress)?;
    temp.persist(dest).map_err(|e| Error::Io(e.error))?;
    debug!("copied {} to {}", src.display(), dest.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_server_download() {
        let mirror = tempdir().unwrap();
        let cache = tempdir().unwrap();
        fs::write(mirror.path().join("foo-1.0-1.pkg.tar.gz"), b"package").unwrap();

        let fetcher = HttpFetcher::new().unwrap();
        let servers = vec![
            format!("file://{}/missing", mirror.path().display()),
            format!("file://{}", mirror.path().display()),
        ];
        let mut last = (0, 0);
        fetcher
            .download(
                &["foo-1.0-1.pkg.tar.gz".to_string()],
                &servers,
                cache.path(),
                &mut |_, xfered, total| last = (xfered, total),
            )
            .unwrap();

        assert_eq!(fs::read(cache.path().join("foo-1.0-1.pkg.tar.gz")).unwrap(), b"package");
        assert_eq!(last, (7, 7));
    }

    #[test]
    fn test_missing_files_reported() {
        let mirror = tempdir().unwrap();
        let cache = tempdir().unwrap();
        let fetcher = HttpFetcher::new().unwrap();
        let servers = vec![format!("file://{}", mirror.path().display())];

        let err = fetcher
            .download(&["a.pkg.tar.gz".to_string(), "b.pkg.tar.gz".to_string()], &servers, cache.path(), &mut |_, _, _| {})
            .unwrap_err();
        match err {
            Error::RetrievalFailed(msg) => assert_eq!(msg, "a.pkg.tar.gz, b.pkg.tar.gz"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_cached_file_not_fetched() {
        let cache = tempdir().unwrap();
        fs::write(cache.path().join("a.pkg.tar.gz"), b"cached").unwrap();
        let fetcher = HttpFetcher::new().unwrap();
        fetcher
            .download(&["a.pkg.tar.gz".to_string()], &[], cache.path(), &mut |_, _, _| {})
            .unwrap();
    }
}
