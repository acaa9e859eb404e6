//! The built-in pipeline stages
//!
//! Stages come in three groups. Artifact stages establish that every
//! declared file is either already stored or freshly downloaded and
//! persisted. Content stages do the same for the logical units and their
//! links, and resolve producer feedback futures. Membership stages turn the
//! finished stream into version membership changes.
//!
//! [`crate::sync::SyncPipeline`] wires them in the canonical order;
//! embedders with unusual flows can compose them directly via
//! [`crate::pipeline::Pipeline`].

mod artifact;
mod association;
mod content;

pub use artifact::{ArtifactDownloader, ArtifactSaver, QueryExistingArtifacts, RemoteArtifactSaver};
pub use association::{ContentAssociation, ContentUnassociation, RemoveDuplicates};
pub use content::{ContentSaver, ContentSaverHooks, QueryExistingContent, ResolveContentFutures};
