//! Artifact-side stages: existence lookup, download, persistence
//!
//! Invariant held at the hand-off between these stages: every declared
//! artifact either already carries a persisted identity or carries a
//! downloaded local file. The lookup stage establishes the first case
//! wherever the store allows, the download stage establishes the second for
//! the rest, and the saver collapses both into persisted records.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use tokio::task::JoinSet;
use tracing::debug;

use crate::downloader::Downloader;
use crate::error::{Error, Result};
use crate::model::{Artifact, DeclarativeContent, DigestSet};
use crate::pipeline::{Item, Stage, StageIo};
use crate::storage::Storage;

/// Replaces declared artifacts with their persisted counterparts
///
/// Batches incoming units and resolves all their declared digests against
/// the store in one round trip per batch. Units whose artifacts are already
/// known skip the download stage entirely.
pub struct QueryExistingArtifacts {
    storage: Arc<dyn Storage>,
    minsize: usize,
}

impl QueryExistingArtifacts {
    /// Build the stage over the given store.
    pub fn new(storage: Arc<dyn Storage>, minsize: usize) -> Self {
        Self { storage, minsize }
    }
}

#[async_trait]
impl Stage for QueryExistingArtifacts {
    fn name(&self) -> &'static str {
        "query_existing_artifacts"
    }

    async fn run(&mut self, io: &mut StageIo) -> Result<()> {
        while let Some(mut batch) = io.next_batch(self.minsize).await? {
            let lookups: Vec<DigestSet> = batch
                .iter()
                .flat_map(|dc| dc.d_artifacts.iter())
                .filter(|da| da.artifact.needs_download() && !da.artifact.digests.is_empty())
                .map(|da| da.artifact.digests.clone())
                .collect();

            if !lookups.is_empty() {
                let existing = self.storage.find_artifacts(&lookups).await?;
                for dc in &mut batch {
                    for da in &mut dc.d_artifacts {
                        if da.artifact.needs_download()
                            && !da.artifact.digests.is_empty()
                            && let Some(found) =
                                existing.iter().find(|a| a.digests.matches(&da.artifact.digests))
                        {
                            da.artifact = found.clone();
                        }
                    }
                }
            }

            io.progress().report(self.name(), batch.len() as u64);
            for dc in batch {
                io.put_content(dc).await?;
            }
        }
        Ok(())
    }
}

/// Fetches the remaining artifact files
///
/// Each content unit with outstanding downloads becomes its own task; at
/// most `max_concurrent` units are in flight at once, which bounds open
/// connections and buffered files no matter how fast the upstream stages
/// produce. Units without outstanding downloads pass straight through.
/// Completion order is not arrival order.
pub struct ArtifactDownloader {
    downloader: Arc<dyn Downloader>,
    max_concurrent: usize,
}

impl ArtifactDownloader {
    /// Build the stage over the given downloader.
    pub fn new(downloader: Arc<dyn Downloader>, max_concurrent: usize) -> Self {
        Self {
            downloader,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Fetch every outstanding artifact of one unit, then forward it.
    /// Returns the number of files fetched, for progress accounting.
    async fn fetch_unit(
        downloader: Arc<dyn Downloader>,
        mut dc: Box<DeclarativeContent>,
        output: crate::pipeline::ItemSender,
    ) -> Result<u64> {
        let fetched = {
            let pending = dc
                .d_artifacts
                .iter()
                .enumerate()
                .filter(|(_, da)| da.artifact.needs_download());
            try_join_all(pending.map(|(idx, da)| {
                let downloader = Arc::clone(&downloader);
                async move {
                    let file = downloader
                        .fetch(&da.url, &da.artifact.digests, da.artifact.size)
                        .await?;
                    Ok::<_, crate::error::DownloadError>((idx, file))
                }
            }))
            .await?
        };

        let count = fetched.len() as u64;
        for (idx, file) in fetched {
            let artifact = &mut dc.d_artifacts[idx].artifact;
            artifact.file = Some(file.file);
            artifact.size = Some(file.size);
            artifact.digests = file.digests;
        }

        output.put(Item::Content(dc)).await?;
        Ok(count)
    }
}

#[async_trait]
impl Stage for ArtifactDownloader {
    fn name(&self) -> &'static str {
        "artifact_download"
    }

    async fn run(&mut self, io: &mut StageIo) -> Result<()> {
        let output = io.output_handle().ok_or_else(|| {
            Error::Task("download stage requires a downstream stage".into())
        })?;
        let progress = io.progress().clone();
        let mut tasks: JoinSet<Result<u64>> = JoinSet::new();

        let reap = |joined: std::result::Result<Result<u64>, tokio::task::JoinError>| -> Result<u64> {
            joined.map_err(|e| Error::Task(format!("download task failed: {e}")))?
        };

        loop {
            // Reap whatever already finished, then block for capacity.
            while let Some(joined) = tasks.try_join_next() {
                progress.report(self.name(), reap(joined)?);
            }
            while tasks.len() >= self.max_concurrent {
                if let Some(joined) = tasks.join_next().await {
                    progress.report(self.name(), reap(joined)?);
                }
            }

            let Some(dc) = io.next_content().await? else {
                break;
            };
            if dc.d_artifacts.iter().any(|da| da.artifact.needs_download()) {
                tasks.spawn(Self::fetch_unit(
                    Arc::clone(&self.downloader),
                    dc,
                    output.clone(),
                ));
            } else {
                output.put(Item::Content(dc)).await?;
            }
        }

        while let Some(joined) = tasks.join_next().await {
            progress.report(self.name(), reap(joined)?);
        }
        debug!("all downloads complete");
        Ok(())
    }
}

/// Persists downloaded artifacts
///
/// One get-or-create round trip per batch; a concurrent writer that stored
/// the same bytes first simply wins, and the persisted record replaces the
/// local one.
pub struct ArtifactSaver {
    storage: Arc<dyn Storage>,
    minsize: usize,
}

impl ArtifactSaver {
    /// Build the stage over the given store.
    pub fn new(storage: Arc<dyn Storage>, minsize: usize) -> Self {
        Self { storage, minsize }
    }
}

#[async_trait]
impl Stage for ArtifactSaver {
    fn name(&self) -> &'static str {
        "artifact_saver"
    }

    async fn run(&mut self, io: &mut StageIo) -> Result<()> {
        while let Some(mut batch) = io.next_batch(self.minsize).await? {
            let mut slots: Vec<(usize, usize)> = Vec::new();
            let mut unsaved: Vec<Artifact> = Vec::new();
            for (dc_idx, dc) in batch.iter().enumerate() {
                for (da_idx, da) in dc.d_artifacts.iter().enumerate() {
                    if da.artifact.id.is_none() {
                        slots.push((dc_idx, da_idx));
                        unsaved.push(da.artifact.clone());
                    }
                }
            }

            if !unsaved.is_empty() {
                let mut txn = self.storage.begin().await?;
                let saved = txn.bulk_get_or_create_artifacts(unsaved).await?;
                txn.commit().await?;
                for ((dc_idx, da_idx), artifact) in slots.into_iter().zip(saved) {
                    batch[dc_idx].d_artifacts[da_idx].artifact = artifact;
                }
            }

            io.progress().report(self.name(), batch.len() as u64);
            for dc in batch {
                io.put_content(dc).await?;
            }
        }
        Ok(())
    }
}

/// Records where each artifact was fetched from
///
/// Writes one provenance record per (remote, content, relative path), so the
/// bytes stay recoverable even if the local copy is later reclaimed.
/// Idempotent across re-syncs.
pub struct RemoteArtifactSaver {
    storage: Arc<dyn Storage>,
    minsize: usize,
}

impl RemoteArtifactSaver {
    /// Build the stage over the given store.
    pub fn new(storage: Arc<dyn Storage>, minsize: usize) -> Self {
        Self { storage, minsize }
    }
}

#[async_trait]
impl Stage for RemoteArtifactSaver {
    fn name(&self) -> &'static str {
        "remote_artifact_saver"
    }

    async fn run(&mut self, io: &mut StageIo) -> Result<()> {
        while let Some(batch) = io.next_batch(self.minsize).await? {
            let mut records = Vec::new();
            for dc in &batch {
                let content = dc.content.id.ok_or_else(|| {
                    Error::Validation(format!(
                        "content unit {} reached provenance recording unsaved",
                        dc.content.natural_key()
                    ))
                })?;
                for da in &dc.d_artifacts {
                    records.push(crate::model::RemoteArtifactRecord {
                        content,
                        relative_path: da.relative_path.clone(),
                        remote: da.remote.id,
                        url: da.url.clone(),
                        size: da.artifact.size,
                        digests: da.artifact.digests.clone(),
                    });
                }
            }

            if !records.is_empty() {
                let mut txn = self.storage.begin().await?;
                txn.bulk_get_or_create_remote_artifacts(records).await?;
                txn.commit().await?;
            }

            io.progress().report(self.name(), batch.len() as u64);
            for dc in batch {
                io.put_content(dc).await?;
            }
        }
        Ok(())
    }
}
