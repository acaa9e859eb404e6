//! Version membership stages: association, diffing, deduplication
//!
//! These stages turn the incoming content stream into membership changes on
//! a repository version. Association computes the diff against the version's
//! current members; unassociation applies the removal half of that diff in
//! mirror syncs; deduplication evicts old members that clash with incoming
//! units on repository-level uniqueness constraints.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::VersionId;
use crate::pipeline::{Item, Stage, StageIo};
use crate::storage::{DuplicatePredicate, Storage};

/// Adds incoming units to a version and computes what disappeared upstream
///
/// Membership additions happen per batch while the stream flows. Units that
/// arrive already as members are skipped; only genuinely new members are
/// added (and counted as progress). After the stream ends, the members never seen in the stream form the
/// removal set, emitted downstream as a single item; the content units
/// themselves are not forwarded past this stage.
pub struct ContentAssociation {
    storage: Arc<dyn Storage>,
    version: VersionId,
    minsize: usize,
    emit_removals: bool,
}

impl ContentAssociation {
    /// Build the stage targeting the given version. `emit_removals` selects
    /// mirror behavior; additive syncs keep everything the version already
    /// had.
    pub fn new(
        storage: Arc<dyn Storage>,
        version: VersionId,
        minsize: usize,
        emit_removals: bool,
    ) -> Self {
        Self {
            storage,
            version,
            minsize,
            emit_removals,
        }
    }
}

#[async_trait]
impl Stage for ContentAssociation {
    fn name(&self) -> &'static str {
        "content_association"
    }

    async fn run(&mut self, io: &mut StageIo) -> Result<()> {
        let mut unseen = self.storage.current_members(self.version).await?;

        while let Some(batch) = io.next_batch(self.minsize).await? {
            let mut to_add = Vec::with_capacity(batch.len());
            for dc in &batch {
                let id = dc.content.id.ok_or_else(|| {
                    Error::Validation(format!(
                        "content unit {} reached association unsaved",
                        dc.content.natural_key()
                    ))
                })?;
                if !unseen.remove(&id) {
                    to_add.push(id);
                }
            }
            if !to_add.is_empty() {
                self.storage.add_members(self.version, &to_add).await?;
            }
            io.progress().report(self.name(), to_add.len() as u64);
        }

        if self.emit_removals {
            let mut removals: Vec<_> = unseen.into_iter().collect();
            removals.sort_unstable();
            debug!(
                version = %self.version,
                count = removals.len(),
                "members absent from the incoming stream"
            );
            io.put(Item::Removals(removals)).await?;
        }
        Ok(())
    }
}

/// Applies the removal set computed by association
///
/// Only runs in mirror syncs. Removal sets are forwarded after being
/// applied, so embedders can append stages that react to them.
pub struct ContentUnassociation {
    storage: Arc<dyn Storage>,
    version: VersionId,
}

impl ContentUnassociation {
    /// Build the stage targeting the given version.
    pub fn new(storage: Arc<dyn Storage>, version: VersionId) -> Self {
        Self { storage, version }
    }
}

#[async_trait]
impl Stage for ContentUnassociation {
    fn name(&self) -> &'static str {
        "content_unassociation"
    }

    async fn run(&mut self, io: &mut StageIo) -> Result<()> {
        while let Some(item) = io.next().await {
            match item {
                Item::Removals(ids) => {
                    self.storage.remove_members(self.version, &ids).await?;
                    io.progress().report(self.name(), ids.len() as u64);
                    info!(
                        version = %self.version,
                        removed = ids.len(),
                        "unassociated stale members"
                    );
                    io.put(Item::Removals(ids)).await?;
                }
                other => io.put(other).await?,
            }
        }
        Ok(())
    }
}

/// Evicts existing members that clash with incoming units
///
/// A repository-level uniqueness guard: for each incoming unit of the
/// guarded kind, any existing member agreeing on all guarded fields (but not
/// the unit itself) must leave the version. Predicates are accumulated while
/// the stream flows and applied in one store round trip after it ends.
pub struct RemoveDuplicates {
    storage: Arc<dyn Storage>,
    version: VersionId,
    kind: String,
    field_names: Vec<String>,
}

impl RemoveDuplicates {
    /// Build a guard for `kind`: no two members may agree on all
    /// `field_names`.
    pub fn new(
        storage: Arc<dyn Storage>,
        version: VersionId,
        kind: impl Into<String>,
        field_names: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            storage,
            version,
            kind: kind.into(),
            field_names: field_names.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Stage for RemoveDuplicates {
    fn name(&self) -> &'static str {
        "remove_duplicates"
    }

    async fn run(&mut self, io: &mut StageIo) -> Result<()> {
        let mut predicates = Vec::new();

        while let Some(dc) = io.next_content().await? {
            if dc.content.kind == self.kind {
                predicates.push(DuplicatePredicate {
                    kind: self.kind.clone(),
                    fields: self
                        .field_names
                        .iter()
                        .map(|name| {
                            (
                                name.clone(),
                                dc.content.field(name).unwrap_or_default().to_string(),
                            )
                        })
                        .collect(),
                    exclude: dc.content.id,
                });
            }
            io.put_content(*dc).await?;
        }

        if !predicates.is_empty() {
            let clashing = self
                .storage
                .find_member_duplicates(self.version, &predicates)
                .await?;
            if !clashing.is_empty() {
                // Dedupe: several incoming units can match the same member.
                let unique: HashSet<_> = clashing.into_iter().collect();
                let evict: Vec<_> = unique.into_iter().collect();
                info!(
                    version = %self.version,
                    kind = %self.kind,
                    evicted = evict.len(),
                    "removed members clashing with incoming content"
                );
                self.storage.remove_members(self.version, &evict).await?;
                io.progress().report(self.name(), evict.len() as u64);
            }
        }
        Ok(())
    }
}
