//! Artifact fetching
//!
//! The download stage speaks to the outside world through the [`Downloader`]
//! trait: give it a url plus the catalog's declared digests and size, get
//! back a validated local file. [`HttpDownloader`] is the reqwest-backed
//! implementation with retry on transient failures; tests and embedders can
//! substitute their own transport.

use async_trait::async_trait;
use futures::StreamExt;
use md5::Context as Md5Context;
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::config::RetryConfig;
use crate::error::DownloadError;
use crate::model::DigestSet;
use crate::retry::fetch_with_retry;

/// A fetched, validated artifact file
#[derive(Debug)]
pub struct DownloadedFile {
    /// Where the bytes were written
    pub file: PathBuf,
    /// Number of bytes received
    pub size: u64,
    /// Digests computed over the received bytes, all algorithms filled in
    pub digests: DigestSet,
}

/// Fetches artifact bytes to local files
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Fetch `url` to a local file, validating against `expected_digests`
    /// (every declared algorithm must match) and `expected_size` if given.
    async fn fetch(
        &self,
        url: &str,
        expected_digests: &DigestSet,
        expected_size: Option<u64>,
    ) -> Result<DownloadedFile, DownloadError>;
}

/// HTTP downloader backed by reqwest
///
/// Streams response bodies to disk while hashing, so artifact size never
/// bounds memory. Transient failures (transport errors, 5xx, 429) are
/// retried with exponential backoff before surfacing.
pub struct HttpDownloader {
    client: reqwest::Client,
    dir: PathBuf,
    retry: RetryConfig,
}

impl HttpDownloader {
    /// Build a downloader writing fetched files into `dir`.
    pub fn new(dir: impl Into<PathBuf>, retry: RetryConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            dir: dir.into(),
            retry,
        }
    }

    /// Build with a caller-configured reqwest client (proxies, auth headers).
    pub fn with_client(client: reqwest::Client, dir: impl Into<PathBuf>, retry: RetryConfig) -> Self {
        Self {
            client,
            dir: dir.into(),
            retry,
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<DownloadedFile, DownloadError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport(url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                http_status: status.as_u16(),
            });
        }

        let path = self.dir.join(format!("artifact-{:016x}", rand::random::<u64>()));
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| io_failure(url, &e))?;

        // A failed stream must not leave a partial file behind; retries use a
        // fresh filename, so leaks would accumulate across attempts.
        match stream_body(url, response, &mut file).await {
            Ok((size, digests)) => Ok(DownloadedFile {
                file: path,
                size,
                digests,
            }),
            Err(e) => {
                drop(file);
                discard(&path);
                Err(e)
            }
        }
    }
}

async fn stream_body(
    url: &str,
    response: reqwest::Response,
    file: &mut tokio::fs::File,
) -> Result<(u64, DigestSet), DownloadError> {
    let mut hasher = MultiHasher::new();
    let mut size: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| transport(url, &e))?;
        hasher.update(&chunk);
        size += chunk.len() as u64;
        file.write_all(&chunk)
            .await
            .map_err(|e| io_failure(url, &e))?;
    }
    file.flush().await.map_err(|e| io_failure(url, &e))?;
    Ok((size, hasher.finish()))
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch(
        &self,
        url: &str,
        expected_digests: &DigestSet,
        expected_size: Option<u64>,
    ) -> Result<DownloadedFile, DownloadError> {
        let downloaded = fetch_with_retry(&self.retry, || self.fetch_once(url)).await?;
        validate(url, &downloaded, expected_digests, expected_size)?;
        tracing::debug!(url, size = downloaded.size, "artifact fetched");
        Ok(downloaded)
    }
}

/// Check the received bytes against the catalog's declared size and digests.
///
/// A failed validation removes the local file before returning; a run must
/// never leave unvalidated bytes behind for a later stage to pick up.
pub fn validate(
    url: &str,
    downloaded: &DownloadedFile,
    expected_digests: &DigestSet,
    expected_size: Option<u64>,
) -> Result<(), DownloadError> {
    let failure = validation_failure(url, downloaded, expected_digests, expected_size);
    if let Some(err) = failure {
        discard(&downloaded.file);
        return Err(err);
    }
    Ok(())
}

fn validation_failure(
    url: &str,
    downloaded: &DownloadedFile,
    expected_digests: &DigestSet,
    expected_size: Option<u64>,
) -> Option<DownloadError> {
    if let Some(expected) = expected_size
        && expected != downloaded.size
    {
        return Some(DownloadError::SizeMismatch {
            url: url.to_string(),
            expected,
            actual: downloaded.size,
        });
    }
    for algorithm in crate::model::DIGEST_ALGORITHMS {
        if let (Some(expected), Some(actual)) = (
            expected_digests.get(algorithm),
            downloaded.digests.get(algorithm),
        ) && expected != actual
        {
            return Some(DownloadError::DigestMismatch {
                url: url.to_string(),
                algorithm,
            });
        }
    }
    None
}

fn discard(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove invalid download");
    }
}

fn transport(url: &str, e: &dyn std::fmt::Display) -> DownloadError {
    DownloadError::Transport {
        url: url.to_string(),
        message: e.to_string(),
    }
}

fn io_failure(url: &str, e: &std::io::Error) -> DownloadError {
    DownloadError::Transport {
        url: url.to_string(),
        message: format!("write failed: {e}"),
    }
}

/// Runs all six digest algorithms over a byte stream in one pass.
struct MultiHasher {
    md5: Md5Context,
    sha1: Sha1,
    sha224: Sha224,
    sha256: Sha256,
    sha384: Sha384,
    sha512: Sha512,
}

impl MultiHasher {
    fn new() -> Self {
        Self {
            md5: Md5Context::new(),
            sha1: Sha1::new(),
            sha224: Sha224::new(),
            sha256: Sha256::new(),
            sha384: Sha384::new(),
            sha512: Sha512::new(),
        }
    }

    fn update(&mut self, chunk: &[u8]) {
        self.md5.consume(chunk);
        self.sha1.update(chunk);
        self.sha224.update(chunk);
        self.sha256.update(chunk);
        self.sha384.update(chunk);
        self.sha512.update(chunk);
    }

    fn finish(self) -> DigestSet {
        DigestSet {
            md5: Some(format!("{:x}", self.md5.compute())),
            sha1: Some(format!("{:x}", self.sha1.finalize())),
            sha224: Some(format!("{:x}", self.sha224.finalize())),
            sha256: Some(format!("{:x}", self.sha256.finalize())),
            sha384: Some(format!("{:x}", self.sha384.finalize())),
            sha512: Some(format!("{:x}", self.sha512.finalize())),
        }
    }
}
