//! Content-side stages: existence lookup, persistence, future resolution

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{ContentArtifactLink, ContentKey, DeclarativeContent};
use crate::pipeline::{Stage, StageIo};
use crate::storage::{Storage, StorageTransaction};

/// Replaces declared content with its persisted counterpart
///
/// Batches incoming units and resolves their natural keys against the store
/// in one round trip per batch. For units that already exist, the persisted
/// record replaces the declared one and the unit's existing links fill in
/// the artifact identities, so already-known content costs no downloads and
/// no writes downstream.
pub struct QueryExistingContent {
    storage: Arc<dyn Storage>,
    minsize: usize,
}

impl QueryExistingContent {
    /// Build the stage over the given store.
    pub fn new(storage: Arc<dyn Storage>, minsize: usize) -> Self {
        Self { storage, minsize }
    }
}

#[async_trait]
impl Stage for QueryExistingContent {
    fn name(&self) -> &'static str {
        "query_existing_content"
    }

    async fn run(&mut self, io: &mut StageIo) -> Result<()> {
        while let Some(mut batch) = io.next_batch(self.minsize).await? {
            let keys: Vec<ContentKey> = batch
                .iter()
                .filter(|dc| dc.content.id.is_none())
                .map(|dc| dc.content.natural_key())
                .collect();

            if !keys.is_empty() {
                let existing = self.storage.find_content(&keys).await?;
                let by_key: HashMap<ContentKey, _> = existing
                    .into_iter()
                    .map(|unit| (unit.natural_key(), unit))
                    .collect();

                for dc in &mut batch {
                    if dc.content.id.is_some() {
                        continue;
                    }
                    let Some(found) = by_key.get(&dc.content.natural_key()) else {
                        continue;
                    };
                    dc.content = found.clone();

                    // The unit's persisted links tell us which of its
                    // artifacts are already stored.
                    let id = found.id.ok_or_else(|| {
                        Error::Validation("store returned an unsaved content unit".into())
                    })?;
                    let links = self.storage.content_links(id).await?;
                    let by_path: HashMap<&str, &ContentArtifactLink> = links
                        .iter()
                        .map(|l| (l.relative_path.as_str(), l))
                        .collect();
                    for da in &mut dc.d_artifacts {
                        if da.artifact.id.is_none()
                            && let Some(link) = by_path.get(da.relative_path.as_str())
                            && let Some(artifact_id) = link.artifact
                        {
                            da.artifact.id = Some(artifact_id);
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

/// Batch-level extension points around content persistence
///
/// Both hooks run inside the batch's transaction: `pre_save` before any unit
/// is written, `post_save` after units and links are. Default hooks do
/// nothing.
#[async_trait]
pub trait ContentSaverHooks: Send + Sync {
    /// Runs before the batch is written.
    async fn pre_save(
        &self,
        _batch: &mut [DeclarativeContent],
        _txn: &mut dyn StorageTransaction,
    ) -> Result<()> {
        Ok(())
    }

    /// Runs after the batch and its links are written.
    async fn post_save(
        &self,
        _batch: &mut [DeclarativeContent],
        _txn: &mut dyn StorageTransaction,
    ) -> Result<()> {
        Ok(())
    }
}

struct NoHooks;

impl ContentSaverHooks for NoHooks {}

/// Persists content units and their content↔artifact links
///
/// One transaction per batch. A natural-key conflict means a concurrent
/// writer saved the same unit first; the stage adopts that writer's record
/// by re-fetching it, then still submits the unit's links, because the
/// concurrent writer may not have gotten that far. Link creation is
/// get-or-create, so the race cannot duplicate anything.
pub struct ContentSaver {
    storage: Arc<dyn Storage>,
    minsize: usize,
    hooks: Box<dyn ContentSaverHooks>,
}

impl ContentSaver {
    /// Build the stage over the given store with no hooks.
    pub fn new(storage: Arc<dyn Storage>, minsize: usize) -> Self {
        Self {
            storage,
            minsize,
            hooks: Box::new(NoHooks),
        }
    }

    /// Attach batch-level hooks.
    pub fn with_hooks(mut self, hooks: Box<dyn ContentSaverHooks>) -> Self {
        self.hooks = hooks;
        self
    }
}

#[async_trait]
impl Stage for ContentSaver {
    fn name(&self) -> &'static str {
        "content_saver"
    }

    async fn run(&mut self, io: &mut StageIo) -> Result<()> {
        while let Some(mut batch) = io.next_batch(self.minsize).await? {
            let mut txn = self.storage.begin().await?;
            self.hooks.pre_save(&mut batch, txn.as_mut()).await?;

            for dc in &mut batch {
                if dc.content.id.is_some() {
                    continue;
                }
                match txn.save_content(&dc.content).await {
                    Ok(saved) => dc.content = saved,
                    Err(err) if err.is_conflict() => {
                        // A concurrent writer won the race; adopt its record.
                        let key = dc.content.natural_key();
                        debug!(%key, "save conflict, adopting the existing unit");
                        dc.content = txn.get_content_by_key(&key).await?;
                    }
                    Err(err) => return Err(err),
                }
            }

            let mut links = Vec::new();
            for dc in &batch {
                let content = dc.content.id.ok_or_else(|| {
                    Error::Validation(format!(
                        "content unit {} left the saver unsaved",
                        dc.content.natural_key()
                    ))
                })?;
                for da in &dc.d_artifacts {
                    links.push(ContentArtifactLink {
                        content,
                        artifact: da.artifact.id,
                        relative_path: da.relative_path.clone(),
                    });
                }
            }
            if !links.is_empty() {
                txn.bulk_get_or_create_links(links).await?;
            }

            self.hooks.post_save(&mut batch, txn.as_mut()).await?;
            txn.commit().await?;

            io.progress().report(self.name(), batch.len() as u64);
            for dc in batch {
                io.put_content(dc).await?;
            }
        }
        Ok(())
    }
}

/// Resolves the feedback future of every unit passing through
///
/// Placed after the save stages, so awaiting producers observe units that
/// already carry a persisted identity. Resolution is exactly-once per unit;
/// units without a future pass through untouched.
pub struct ResolveContentFutures;

#[async_trait]
impl Stage for ResolveContentFutures {
    fn name(&self) -> &'static str {
        "resolve_futures"
    }

    async fn run(&mut self, io: &mut StageIo) -> Result<()> {
        while let Some(mut dc) = io.next_content().await? {
            dc.resolve();
            io.put_content(*dc).await?;
        }
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Artifact, ArtifactId, ContentId, ContentUnit, DeclarativeArtifact, DigestSet, Remote,
        RemoteId,
    };
    use crate::pipeline::Pipeline;
    use crate::storage::InMemoryStorage;
    use std::sync::Mutex;

    fn remote() -> Arc<Remote> {
        Arc::new(Remote {
            id: RemoteId(1),
            name: "upstream".into(),
        })
    }

    fn unit(name: &str) -> ContentUnit {
        ContentUnit::new(
            "file",
            [("relative_path".to_string(), name.to_string())],
            ["relative_path".to_string()],
        )
    }

    struct Feed(Vec<DeclarativeContent>);

    #[async_trait]
    impl Stage for Feed {
        fn name(&self) -> &'static str {
            "feed"
        }

        async fn run(&mut self, io: &mut StageIo) -> Result<()> {
            for dc in self.0.drain(..) {
                io.put_content(dc).await?;
            }
            Ok(())
        }
    }

    struct Collect(Arc<Mutex<Vec<DeclarativeContent>>>);

    #[async_trait]
    impl Stage for Collect {
        fn name(&self) -> &'static str {
            "collect"
        }

        async fn run(&mut self, io: &mut StageIo) -> Result<()> {
            while let Some(dc) = io.next_content().await? {
                self.0.lock().unwrap().push(*dc);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn existing_content_is_adopted_with_its_links() {
        let storage = Arc::new(InMemoryStorage::new());
        let persisted = storage.insert_content(&unit("a.txt")).unwrap();
        let content_id = persisted.id.unwrap();

        let mut txn = storage.begin().await.unwrap();
        txn.bulk_get_or_create_links(vec![ContentArtifactLink {
            content: content_id,
            artifact: Some(ArtifactId(9)),
            relative_path: "a.txt".into(),
        }])
        .await
        .unwrap();
        txn.commit().await.unwrap();

        let da = DeclarativeArtifact::new(
            Artifact::declared(DigestSet::sha256("abc"), None),
            "https://example.com/a.txt",
            "a.txt",
            remote(),
        )
        .unwrap();
        let incoming = DeclarativeContent::new(unit("a.txt"), vec![da]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        Pipeline::new(vec![
            Box::new(Feed(vec![incoming])),
            Box::new(QueryExistingContent::new(
                Arc::clone(&storage) as Arc<dyn Storage>,
                1,
            )),
            Box::new(Collect(Arc::clone(&seen))),
        ])
        .run()
        .await
        .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].content.id, Some(content_id));
        assert_eq!(
            seen[0].d_artifacts[0].artifact.id,
            Some(ArtifactId(9)),
            "existing links must fill in artifact identities"
        );
    }

    #[tokio::test]
    async fn saver_persists_units_and_links() {
        let storage = Arc::new(InMemoryStorage::new());
        let da = DeclarativeArtifact::new(
            Artifact {
                id: Some(ArtifactId(3)),
                file: None,
                size: None,
                digests: DigestSet::sha256("abc"),
            },
            "https://example.com/a.txt",
            "a.txt",
            remote(),
        )
        .unwrap();
        let incoming = DeclarativeContent::new(unit("a.txt"), vec![da]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        Pipeline::new(vec![
            Box::new(Feed(vec![incoming])),
            Box::new(ContentSaver::new(
                Arc::clone(&storage) as Arc<dyn Storage>,
                1,
            )),
            Box::new(Collect(Arc::clone(&seen))),
        ])
        .run()
        .await
        .unwrap();

        assert_eq!(storage.content_count().unwrap(), 1);
        assert_eq!(storage.link_count().unwrap(), 1);
        assert!(seen.lock().unwrap()[0].content.id.is_some());
    }

    #[tokio::test]
    async fn saver_adopts_concurrent_writer_and_still_links() {
        let storage = Arc::new(InMemoryStorage::new());
        // Simulate a concurrent writer that saved the unit but not its links.
        let winner = storage.insert_content(&unit("a.txt")).unwrap();

        let da = DeclarativeArtifact::new(
            Artifact {
                id: Some(ArtifactId(3)),
                file: None,
                size: None,
                digests: DigestSet::sha256("abc"),
            },
            "https://example.com/a.txt",
            "a.txt",
            remote(),
        )
        .unwrap();
        let incoming = DeclarativeContent::new(unit("a.txt"), vec![da]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        Pipeline::new(vec![
            Box::new(Feed(vec![incoming])),
            Box::new(ContentSaver::new(
                Arc::clone(&storage) as Arc<dyn Storage>,
                1,
            )),
            Box::new(Collect(Arc::clone(&seen))),
        ])
        .run()
        .await
        .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].content.id, winner.id, "adopted the winner's record");
        assert_eq!(storage.content_count().unwrap(), 1);
        assert_eq!(
            storage.link_count().unwrap(),
            1,
            "links are created even when the unit itself already existed"
        );
    }

    #[tokio::test]
    async fn hooks_run_inside_the_batch_transaction() {
        struct TagHook;

        #[async_trait]
        impl ContentSaverHooks for TagHook {
            async fn post_save(
                &self,
                batch: &mut [DeclarativeContent],
                _txn: &mut dyn StorageTransaction,
            ) -> Result<()> {
                for dc in batch {
                    assert!(dc.content.id.is_some(), "post_save sees saved units");
                    dc.content
                        .fields
                        .insert("tagged".to_string(), "yes".to_string());
                }
                Ok(())
            }
        }

        let storage = Arc::new(InMemoryStorage::new());
        let incoming = DeclarativeContent::new(unit("a.txt"), Vec::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        Pipeline::new(vec![
            Box::new(Feed(vec![incoming])),
            Box::new(
                ContentSaver::new(Arc::clone(&storage) as Arc<dyn Storage>, 1)
                    .with_hooks(Box::new(TagHook)),
            ),
            Box::new(Collect(Arc::clone(&seen))),
        ])
        .run()
        .await
        .unwrap();

        assert_eq!(seen.lock().unwrap()[0].content.field("tagged"), Some("yes"));
    }

    #[tokio::test]
    async fn futures_resolve_with_the_persisted_record() {
        let mut persisted = unit("a.txt");
        persisted.id = Some(ContentId(5));
        let (dc, future) = DeclarativeContent::with_future(persisted, Vec::new());

        Pipeline::new(vec![
            Box::new(Feed(vec![dc])),
            Box::new(ResolveContentFutures),
            Box::new(crate::pipeline::DrainStage),
        ])
        .run()
        .await
        .unwrap();

        let resolved = future.resolved().await.unwrap();
        assert_eq!(resolved.id, Some(ContentId(5)));
    }
}
