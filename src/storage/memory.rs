//! In-memory storage backend
//!
//! Backs the test suite and gives embedders a zero-setup store to prototype
//! against. Operations apply eagerly under an interior mutex and `commit` is
//! a no-op; within a single process this still honors the contract the
//! stages rely on: natural-key uniqueness (`save_content` conflicts), and
//! get-or-create semantics that never duplicate on re-runs.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result, StorageError};
use crate::model::{
    Artifact, ArtifactId, ContentArtifactLink, ContentId, ContentKey, ContentUnit, DigestSet,
    RemoteArtifactRecord, RemoteId, VersionId,
};

use super::{DuplicatePredicate, Storage, StorageTransaction};

#[derive(Default)]
struct MemState {
    next_artifact_id: u64,
    next_content_id: u64,
    artifacts: HashMap<ArtifactId, Artifact>,
    content: HashMap<ContentId, ContentUnit>,
    content_by_key: HashMap<ContentKey, ContentId>,
    links: HashMap<(ContentId, String), ContentArtifactLink>,
    remote_artifacts: HashMap<(RemoteId, ContentId, String), RemoteArtifactRecord>,
    versions: HashMap<VersionId, HashSet<ContentId>>,
}

impl MemState {
    fn find_artifact_by_digests(&self, digests: &DigestSet) -> Option<&Artifact> {
        self.artifacts.values().find(|a| a.digests.matches(digests))
    }

    fn create_artifact(&mut self, mut artifact: Artifact) -> Artifact {
        self.next_artifact_id += 1;
        let id = ArtifactId(self.next_artifact_id);
        artifact.id = Some(id);
        self.artifacts.insert(id, artifact.clone());
        artifact
    }

    fn create_content(&mut self, unit: &ContentUnit) -> ContentUnit {
        self.next_content_id += 1;
        let id = ContentId(self.next_content_id);
        let mut persisted = unit.clone();
        persisted.id = Some(id);
        self.content_by_key.insert(persisted.natural_key(), id);
        self.content.insert(id, persisted.clone());
        persisted
    }
}

/// Thread-safe in-memory implementation of [`Storage`]
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    state: Arc<Mutex<MemState>>,
}

impl InMemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemState>> {
        self.state
            .lock()
            .map_err(|_| Error::Storage(StorageError::Backend("storage mutex poisoned".into())))
    }

    /// Insert a content unit directly, bypassing the pipeline. Test seam.
    pub fn insert_content(&self, unit: &ContentUnit) -> Result<ContentUnit> {
        let mut state = self.lock()?;
        if state.content_by_key.contains_key(&unit.natural_key()) {
            return Err(Error::Storage(StorageError::Conflict {
                key: unit.natural_key().to_string(),
            }));
        }
        Ok(state.create_content(unit))
    }

    /// Insert existing members into a version directly. Test seam.
    pub fn seed_members(&self, version: VersionId, content_ids: &[ContentId]) -> Result<()> {
        let mut state = self.lock()?;
        state
            .versions
            .entry(version)
            .or_default()
            .extend(content_ids.iter().copied());
        Ok(())
    }

    /// Total number of persisted content↔artifact links.
    pub fn link_count(&self) -> Result<usize> {
        Ok(self.lock()?.links.len())
    }

    /// Total number of persisted remote-provenance records.
    pub fn remote_artifact_count(&self) -> Result<usize> {
        Ok(self.lock()?.remote_artifacts.len())
    }

    /// Total number of persisted artifacts.
    pub fn artifact_count(&self) -> Result<usize> {
        Ok(self.lock()?.artifacts.len())
    }

    /// Total number of persisted content units.
    pub fn content_count(&self) -> Result<usize> {
        Ok(self.lock()?.content.len())
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn find_artifacts(&self, digests: &[DigestSet]) -> Result<Vec<Artifact>> {
        let state = self.lock()?;
        let mut found = Vec::new();
        let mut seen: HashSet<ArtifactId> = HashSet::new();
        for wanted in digests {
            if let Some(artifact) = state.find_artifact_by_digests(wanted)
                && let Some(id) = artifact.id
                && seen.insert(id)
            {
                found.push(artifact.clone());
            }
        }
        Ok(found)
    }

    async fn find_content(&self, keys: &[ContentKey]) -> Result<Vec<ContentUnit>> {
        let state = self.lock()?;
        let mut found = Vec::new();
        for key in keys {
            if let Some(id) = state.content_by_key.get(key)
                && let Some(unit) = state.content.get(id)
            {
                found.push(unit.clone());
            }
        }
        Ok(found)
    }

    async fn content_links(&self, content: ContentId) -> Result<Vec<ContentArtifactLink>> {
        let state = self.lock()?;
        Ok(state
            .links
            .values()
            .filter(|link| link.content == content)
            .cloned()
            .collect())
    }

    async fn begin(&self) -> Result<Box<dyn StorageTransaction>> {
        Ok(Box::new(MemTransaction {
            state: Arc::clone(&self.state),
        }))
    }

    async fn current_members(&self, version: VersionId) -> Result<HashSet<ContentId>> {
        let state = self.lock()?;
        Ok(state.versions.get(&version).cloned().unwrap_or_default())
    }

    async fn add_members(&self, version: VersionId, content_ids: &[ContentId]) -> Result<()> {
        let mut state = self.lock()?;
        state
            .versions
            .entry(version)
            .or_default()
            .extend(content_ids.iter().copied());
        Ok(())
    }

    async fn remove_members(&self, version: VersionId, content_ids: &[ContentId]) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(members) = state.versions.get_mut(&version) {
            for id in content_ids {
                members.remove(id);
            }
        }
        Ok(())
    }

    async fn find_member_duplicates(
        &self,
        version: VersionId,
        predicates: &[DuplicatePredicate],
    ) -> Result<Vec<ContentId>> {
        let state = self.lock()?;
        let Some(members) = state.versions.get(&version) else {
            return Ok(Vec::new());
        };
        let mut matched = Vec::new();
        for id in members {
            let Some(unit) = state.content.get(id) else {
                continue;
            };
            let is_dupe = predicates.iter().any(|p| {
                p.kind == unit.kind
                    && p.exclude != Some(*id)
                    && p.fields
                        .iter()
                        .all(|(name, value)| unit.field(name) == Some(value.as_str()))
            });
            if is_dupe {
                matched.push(*id);
            }
        }
        Ok(matched)
    }
}

struct MemTransaction {
    state: Arc<Mutex<MemState>>,
}

impl MemTransaction {
    fn lock(&self) -> Result<MutexGuard<'_, MemState>> {
        self.state
            .lock()
            .map_err(|_| Error::Storage(StorageError::Backend("storage mutex poisoned".into())))
    }
}

#[async_trait]
impl StorageTransaction for MemTransaction {
    async fn bulk_get_or_create_artifacts(
        &mut self,
        artifacts: Vec<Artifact>,
    ) -> Result<Vec<Artifact>> {
        let mut state = self.lock()?;
        let mut out = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            if let Some(existing) = state.find_artifact_by_digests(&artifact.digests) {
                out.push(existing.clone());
            } else {
                out.push(state.create_artifact(artifact));
            }
        }
        Ok(out)
    }

    async fn save_content(&mut self, unit: &ContentUnit) -> Result<ContentUnit> {
        let mut state = self.lock()?;
        if let Some(existing) = unit.id {
            // Already persisted; nothing to save.
            return state
                .content
                .get(&existing)
                .cloned()
                .ok_or_else(|| Error::Storage(StorageError::NotFound(existing.to_string())));
        }
        let key = unit.natural_key();
        if state.content_by_key.contains_key(&key) {
            return Err(Error::Storage(StorageError::Conflict {
                key: key.to_string(),
            }));
        }
        Ok(state.create_content(unit))
    }

    async fn get_content_by_key(&mut self, key: &ContentKey) -> Result<ContentUnit> {
        let state = self.lock()?;
        state
            .content_by_key
            .get(key)
            .and_then(|id| state.content.get(id))
            .cloned()
            .ok_or_else(|| Error::Storage(StorageError::NotFound(key.to_string())))
    }

    async fn bulk_get_or_create_links(
        &mut self,
        links: Vec<ContentArtifactLink>,
    ) -> Result<Vec<ContentArtifactLink>> {
        let mut state = self.lock()?;
        let mut out = Vec::with_capacity(links.len());
        for link in links {
            let key = (link.content, link.relative_path.clone());
            let stored = state.links.entry(key).or_insert(link);
            out.push(stored.clone());
        }
        Ok(out)
    }

    async fn bulk_get_or_create_remote_artifacts(
        &mut self,
        records: Vec<RemoteArtifactRecord>,
    ) -> Result<()> {
        let mut state = self.lock()?;
        for record in records {
            let key = (record.remote, record.content, record.relative_path.clone());
            state.remote_artifacts.entry(key).or_insert(record);
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        // Eager application; nothing to flush.
        Ok(())
    }
}
