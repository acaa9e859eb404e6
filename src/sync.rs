//! Canonical sync pipeline assembly
//!
//! [`SyncPipeline`] wires the built-in stages in the order a full catalog
//! sync needs: artifact lookup, download, artifact persistence, content
//! lookup, content persistence, provenance, future resolution, optional
//! uniqueness guards, then version membership. The producer side is
//! supplied as the first stage; [`ContentFeed`] covers the common case of a
//! pre-built unit list.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::SyncConfig;
use crate::downloader::Downloader;
use crate::error::Result;
use crate::model::{DeclarativeContent, VersionId};
use crate::pipeline::{ChannelFactory, DrainStage, Pipeline, Stage, StageIo};
use crate::progress::ProgressReporter;
use crate::stages::{
    ArtifactDownloader, ArtifactSaver, ContentAssociation, ContentSaver, ContentSaverHooks,
    ContentUnassociation, QueryExistingArtifacts, QueryExistingContent, RemoteArtifactSaver,
    RemoveDuplicates, ResolveContentFutures,
};
use crate::storage::Storage;

/// How the target version treats members absent from the incoming stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    /// The version ends up exactly mirroring the stream: unseen members are
    /// removed
    Mirror,
    /// Unseen members are kept; the stream only adds
    Additive,
}

/// Builder assembling and running the canonical sync pipeline
pub struct SyncPipeline {
    storage: Arc<dyn Storage>,
    downloader: Arc<dyn Downloader>,
    version: VersionId,
    config: SyncConfig,
    mode: SyncMode,
    download_artifacts: bool,
    duplicate_guards: Vec<(String, Vec<String>)>,
    factory: Option<Arc<dyn ChannelFactory>>,
    progress: ProgressReporter,
    hooks: Option<Box<dyn ContentSaverHooks>>,
}

impl SyncPipeline {
    /// A mirror-mode sync of `version` with default configuration.
    pub fn new(
        storage: Arc<dyn Storage>,
        downloader: Arc<dyn Downloader>,
        version: VersionId,
    ) -> Self {
        Self {
            storage,
            downloader,
            version,
            config: SyncConfig::default(),
            mode: SyncMode::Mirror,
            download_artifacts: true,
            duplicate_guards: Vec::new(),
            factory: None,
            progress: ProgressReporter::default(),
            hooks: None,
        }
    }

    /// Override the tuning knobs (capacities, batch sizes, grace period).
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Select mirror or additive behavior.
    pub fn with_mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    /// Skip fetching artifact bytes (on-demand sync). Content, links and
    /// provenance records are still persisted; the provenance records carry
    /// everything needed to fetch the bytes later. Artifacts already in the
    /// store are still linked up via the existence lookup.
    pub fn on_demand(mut self) -> Self {
        self.download_artifacts = false;
        self
    }

    /// Add a repository-level uniqueness guard: within the version, no two
    /// members of `kind` may agree on all `field_names`. Existing members
    /// that clash with incoming units are evicted.
    pub fn with_duplicate_guard(
        mut self,
        kind: impl Into<String>,
        field_names: impl IntoIterator<Item = String>,
    ) -> Self {
        self.duplicate_guards
            .push((kind.into(), field_names.into_iter().collect()));
        self
    }

    /// Inject the channel implementation, e.g.
    /// [`crate::pipeline::ProfilingChannelFactory`].
    pub fn with_channel_factory(mut self, factory: Arc<dyn ChannelFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Route stage progress to the given reporter.
    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    /// Attach batch-level hooks around content persistence.
    pub fn with_saver_hooks(mut self, hooks: Box<dyn ContentSaverHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Run the pipeline with `first_stage` producing the content stream.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::error::Error::Pipeline`] wrapping whichever stage
    /// failed first.
    pub async fn run(self, first_stage: Box<dyn Stage>) -> Result<()> {
        let minsize = self.config.batch_minsize;
        let mirror = self.mode == SyncMode::Mirror;

        let mut saver = ContentSaver::new(Arc::clone(&self.storage), minsize);
        if let Some(hooks) = self.hooks {
            saver = saver.with_hooks(hooks);
        }

        let mut stages: Vec<Box<dyn Stage>> = vec![
            first_stage,
            Box::new(QueryExistingArtifacts::new(
                Arc::clone(&self.storage),
                minsize,
            )),
        ];
        if self.download_artifacts {
            stages.push(Box::new(ArtifactDownloader::new(
                self.downloader,
                self.config.max_concurrent_content,
            )));
            stages.push(Box::new(ArtifactSaver::new(
                Arc::clone(&self.storage),
                minsize,
            )));
        }
        stages.extend([
            Box::new(QueryExistingContent::new(
                Arc::clone(&self.storage),
                minsize,
            )) as Box<dyn Stage>,
            Box::new(saver),
            Box::new(RemoteArtifactSaver::new(
                Arc::clone(&self.storage),
                minsize,
            )),
            Box::new(ResolveContentFutures),
        ]);

        for (kind, field_names) in self.duplicate_guards {
            stages.push(Box::new(RemoveDuplicates::new(
                Arc::clone(&self.storage),
                self.version,
                kind,
                field_names,
            )));
        }

        stages.push(Box::new(ContentAssociation::new(
            Arc::clone(&self.storage),
            self.version,
            minsize,
            mirror,
        )));
        if mirror {
            stages.push(Box::new(ContentUnassociation::new(
                Arc::clone(&self.storage),
                self.version,
            )));
        }
        stages.push(Box::new(DrainStage));

        let mut pipeline = Pipeline::new(stages)
            .with_capacity(self.config.queue_capacity)
            .with_grace(self.config.shutdown_grace)
            .with_progress(self.progress);
        if let Some(factory) = self.factory {
            pipeline = pipeline.with_channel_factory(factory);
        }
        pipeline.run().await
    }
}

/// First stage feeding a pre-built list of declarative content units
///
/// Covers catalogs that are fully parsed before the sync starts. Producers
/// that discover content incrementally (or recursively, via content
/// futures) implement their own [`Stage`] instead.
pub struct ContentFeed {
    units: Vec<DeclarativeContent>,
}

impl ContentFeed {
    /// Wrap a unit list.
    pub fn new(units: Vec<DeclarativeContent>) -> Self {
        Self { units }
    }
}

#[async_trait]
impl Stage for ContentFeed {
    fn name(&self) -> &'static str {
        "content_feed"
    }

    async fn run(&mut self, io: &mut StageIo) -> Result<()> {
        for dc in self.units.drain(..) {
            io.put_content(dc).await?;
        }
        Ok(())
    }
}
