//! Persistent store contract
//!
//! The pipeline never talks to a database directly; it consumes the
//! [`Storage`] and [`StorageTransaction`] traits. The store is expected to
//! provide its own transactional and uniqueness guarantees: stages recover
//! from concurrent writers via re-fetch-on-conflict, never by locking the
//! whole store.
//!
//! [`InMemoryStorage`] is a complete implementation used by the test suite
//! and useful for embedders prototyping a sync flow.

use async_trait::async_trait;
use std::collections::HashSet;

use crate::error::Result;
use crate::model::{
    Artifact, ContentArtifactLink, ContentId, ContentKey, ContentUnit, DigestSet,
    RemoteArtifactRecord, VersionId,
};

mod memory;

pub use memory::InMemoryStorage;

/// A repository-level uniqueness predicate used by the deduplication stage:
/// match members of `kind` whose named fields all equal the given values,
/// excluding the unit identified by `exclude`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DuplicatePredicate {
    /// Content kind the uniqueness constraint applies to
    pub kind: String,
    /// (field name, field value) pairs that must all match
    pub fields: Vec<(String, String)>,
    /// The unit that must NOT be matched (the incoming unit itself)
    pub exclude: Option<ContentId>,
}

/// Read side of the store plus repository-version membership operations
#[async_trait]
pub trait Storage: Send + Sync {
    /// Bulk existence lookup for artifacts: return every persisted artifact
    /// whose digests match any of the given digest sets, in one round trip.
    async fn find_artifacts(&self, digests: &[DigestSet]) -> Result<Vec<Artifact>>;

    /// Bulk existence lookup for content: return every persisted unit whose
    /// natural key equals any of the given keys, in one round trip.
    async fn find_content(&self, keys: &[ContentKey]) -> Result<Vec<ContentUnit>>;

    /// All content↔artifact links owned by `content`.
    async fn content_links(&self, content: ContentId) -> Result<Vec<ContentArtifactLink>>;

    /// Open a transaction. One batch's content-plus-links save happens
    /// inside one atomic unit.
    async fn begin(&self) -> Result<Box<dyn StorageTransaction>>;

    /// Current membership of a repository version.
    async fn current_members(&self, version: VersionId) -> Result<HashSet<ContentId>>;

    /// Add content units to a version's membership. Adding an existing
    /// member is a no-op.
    async fn add_members(&self, version: VersionId, content_ids: &[ContentId]) -> Result<()>;

    /// Remove content units from a version's membership.
    async fn remove_members(&self, version: VersionId, content_ids: &[ContentId]) -> Result<()>;

    /// Members of `version` matching any of the uniqueness predicates.
    async fn find_member_duplicates(
        &self,
        version: VersionId,
        predicates: &[DuplicatePredicate],
    ) -> Result<Vec<ContentId>>;
}

/// Write side of the store, scoped to one atomic unit
#[async_trait]
pub trait StorageTransaction: Send {
    /// For each input artifact, return the persisted artifact with matching
    /// digests, creating it if absent, without duplicating on races. Output
    /// order corresponds to input order.
    async fn bulk_get_or_create_artifacts(&mut self, artifacts: Vec<Artifact>)
    -> Result<Vec<Artifact>>;

    /// Save an unsaved content unit, returning its persisted form.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::error::StorageError::Conflict`] if a concurrent
    /// writer already created a unit with the same natural key.
    async fn save_content(&mut self, unit: &ContentUnit) -> Result<ContentUnit>;

    /// Fetch a persisted unit by natural key. Used to recover from a save
    /// conflict by adopting the record the concurrent writer created.
    async fn get_content_by_key(&mut self, key: &ContentKey) -> Result<ContentUnit>;

    /// Get-or-create content↔artifact links, keyed by (content,
    /// relative_path). Existing links are returned unchanged, so re-running
    /// a sync never duplicates them. Output order corresponds to input order.
    async fn bulk_get_or_create_links(
        &mut self,
        links: Vec<ContentArtifactLink>,
    ) -> Result<Vec<ContentArtifactLink>>;

    /// Get-or-create remote-provenance records, keyed by (remote, content,
    /// relative_path).
    async fn bulk_get_or_create_remote_artifacts(
        &mut self,
        records: Vec<RemoteArtifactRecord>,
    ) -> Result<()>;

    /// Commit the transaction.
    async fn commit(self: Box<Self>) -> Result<()>;
}
