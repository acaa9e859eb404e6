//! Data model flowing through the ingestion pipeline
//!
//! A producer describes what the remote catalog contains as
//! [`DeclarativeContent`] units (one logical content unit, e.g. a package)
//! holding [`DeclarativeArtifact`]s (one remote file each). The pipeline
//! stages enrich these units in place: existence lookups swap in persisted
//! records, the download stage fills in files and digests, and save stages
//! give everything a persisted identity.
//!
//! Each unit is owned by exactly one stage at a time and handed off through
//! a channel, so no unit is ever mutated concurrently.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Unique identifier for a persisted artifact
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(pub u64);

/// Unique identifier for a persisted content unit
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(pub u64);

/// Unique identifier for an upstream remote
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(pub u64);

/// Unique identifier for a repository version
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(pub u64);

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The set of digest algorithms tracked per artifact
pub const DIGEST_ALGORITHMS: [&str; 6] = ["md5", "sha1", "sha224", "sha256", "sha384", "sha512"];

/// Hex-encoded digests of an artifact's bytes, one slot per supported algorithm
///
/// A catalog usually declares only one or two of these; the download stage
/// fills in all of them once the bytes are on disk.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestSet {
    /// MD5 digest, hex encoded
    pub md5: Option<String>,
    /// SHA-1 digest, hex encoded
    pub sha1: Option<String>,
    /// SHA-224 digest, hex encoded
    pub sha224: Option<String>,
    /// SHA-256 digest, hex encoded
    pub sha256: Option<String>,
    /// SHA-384 digest, hex encoded
    pub sha384: Option<String>,
    /// SHA-512 digest, hex encoded
    pub sha512: Option<String>,
}

impl DigestSet {
    /// A digest set with only a sha256 value, the most common catalog form.
    pub fn sha256(value: impl Into<String>) -> Self {
        Self {
            sha256: Some(value.into()),
            ..Default::default()
        }
    }

    /// Look up a digest by algorithm name.
    pub fn get(&self, algorithm: &str) -> Option<&str> {
        match algorithm {
            "md5" => self.md5.as_deref(),
            "sha1" => self.sha1.as_deref(),
            "sha224" => self.sha224.as_deref(),
            "sha256" => self.sha256.as_deref(),
            "sha384" => self.sha384.as_deref(),
            "sha512" => self.sha512.as_deref(),
            _ => None,
        }
    }

    /// True if no digest is set for any algorithm.
    pub fn is_empty(&self) -> bool {
        DIGEST_ALGORITHMS.iter().all(|a| self.get(a).is_none())
    }

    /// Whether two digest sets describe the same bytes: at least one
    /// algorithm is present on both sides, and every shared algorithm agrees.
    pub fn matches(&self, other: &DigestSet) -> bool {
        let mut shared = false;
        for algorithm in DIGEST_ALGORITHMS {
            if let (Some(a), Some(b)) = (self.get(algorithm), other.get(algorithm)) {
                if a != b {
                    return false;
                }
                shared = true;
            }
        }
        shared
    }
}

/// An artifact record: one file, identified by its digests
///
/// Unsaved until `id` is set. Invariant held at every stage boundary:
/// exactly one of {the artifact has a persisted identity, the artifact
/// requires download} is true.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Persisted identity, if the store already knows this artifact
    pub id: Option<ArtifactId>,
    /// Local file once downloaded
    pub file: Option<PathBuf>,
    /// Size in bytes, if known
    pub size: Option<u64>,
    /// Known digests of the file's bytes
    pub digests: DigestSet,
}

impl Artifact {
    /// An unsaved artifact declared only by its expected digests and size.
    pub fn declared(digests: DigestSet, size: Option<u64>) -> Self {
        Self {
            id: None,
            file: None,
            size,
            digests,
        }
    }

    /// True while the artifact has no persisted identity and must be fetched.
    pub fn needs_download(&self) -> bool {
        self.id.is_none()
    }
}

/// Natural key of a content unit: its kind plus the values of its key fields,
/// in key-field order. Two units with equal keys are the same logical unit.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentKey {
    /// Content kind label (e.g. "file", "package")
    pub kind: String,
    /// (field name, field value) pairs in natural-key order
    pub values: Vec<(String, String)>,
}

impl std::fmt::Display for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:", self.kind)?;
        for (i, (name, value)) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}

/// A content unit record
///
/// Content kinds are open-ended: a unit carries its kind label, a flat field
/// map, and the ordered list of field names that form its natural key. This
/// replaces subclass-per-type modeling with data, so existence lookups can
/// partition by kind and uniqueness guards can match on arbitrary fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentUnit {
    /// Persisted identity, if the store already knows this unit
    pub id: Option<ContentId>,
    /// Content kind label
    pub kind: String,
    /// All fields of the unit
    pub fields: BTreeMap<String, String>,
    /// Names of the fields forming the natural key, in order
    pub key_fields: Vec<String>,
}

impl ContentUnit {
    /// Build an unsaved content unit.
    pub fn new(
        kind: impl Into<String>,
        fields: impl IntoIterator<Item = (String, String)>,
        key_fields: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            id: None,
            kind: kind.into(),
            fields: fields.into_iter().collect(),
            key_fields: key_fields.into_iter().collect(),
        }
    }

    /// The unit's natural key: kind plus key-field values in order.
    /// Missing key fields contribute an empty value.
    pub fn natural_key(&self) -> ContentKey {
        ContentKey {
            kind: self.kind.clone(),
            values: self
                .key_fields
                .iter()
                .map(|name| {
                    (
                        name.clone(),
                        self.fields.get(name).cloned().unwrap_or_default(),
                    )
                })
                .collect(),
        }
    }

    /// Field value lookup.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// An upstream source of artifacts
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remote {
    /// Persisted identity of the remote
    pub id: RemoteId,
    /// Human-readable name
    pub name: String,
}

/// Describes one remote file referenced by a content unit
#[derive(Clone, Debug)]
pub struct DeclarativeArtifact {
    /// The in-memory, possibly-unsaved artifact record
    pub artifact: Artifact,
    /// Where to fetch the file
    pub url: String,
    /// Where the file belongs inside its content unit
    pub relative_path: String,
    /// Which upstream source (and credentials) to fetch with
    pub remote: Arc<Remote>,
}

impl DeclarativeArtifact {
    /// Build a declarative artifact, validating the url and relative path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `url` does not parse or
    /// `relative_path` is empty or absolute.
    pub fn new(
        artifact: Artifact,
        url: impl Into<String>,
        relative_path: impl Into<String>,
        remote: Arc<Remote>,
    ) -> Result<Self> {
        let url = url.into();
        if url::Url::parse(&url).is_err() {
            return Err(Error::Validation(format!("invalid artifact url: {url}")));
        }
        let relative_path = relative_path.into();
        if relative_path.is_empty() {
            return Err(Error::Validation("relative path must not be empty".into()));
        }
        if relative_path.starts_with('/') {
            return Err(Error::Validation(format!(
                "relative path must not be absolute: {relative_path}"
            )));
        }
        Ok(Self {
            artifact,
            url,
            relative_path,
            remote,
        })
    }
}

/// Awaitable handle to a content unit's persisted identity
///
/// Returned by [`DeclarativeContent::with_future`]; resolved by the
/// future-resolution stage once the unit's content has been persisted.
/// Awaiting it is how a producer obtains feedback for recursive expansion:
/// content discovered while parsing a parent unit can be injected at the
/// pipeline entry and awaited here.
pub struct ContentFuture {
    rx: oneshot::Receiver<ContentUnit>,
}

impl ContentFuture {
    /// Wait for the unit to obtain a persisted identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FutureDropped`] if the pipeline run failed before the
    /// unit reached the resolution stage.
    pub async fn resolved(self) -> Result<ContentUnit> {
        self.rx.await.map_err(|_| Error::FutureDropped)
    }
}

/// Describes one logical content unit flowing through the pipeline
pub struct DeclarativeContent {
    /// The in-memory content record; replaced by its persisted counterpart
    /// by the existence-lookup and save stages
    pub content: ContentUnit,
    /// The remote files belonging to this unit, in order
    pub d_artifacts: Vec<DeclarativeArtifact>,
    /// Whether this unit may be coalesced into large batches. False for units
    /// that need a single-unit low-latency round trip through their future.
    pub does_batch: bool,
    // Single-resolution promise; consumed by resolve().
    resolver: Option<oneshot::Sender<ContentUnit>>,
}

impl DeclarativeContent {
    /// Build a unit with no feedback future.
    pub fn new(content: ContentUnit, d_artifacts: Vec<DeclarativeArtifact>) -> Self {
        Self {
            content,
            d_artifacts,
            does_batch: true,
            resolver: None,
        }
    }

    /// Build a unit carrying a feedback future.
    ///
    /// The returned [`ContentFuture`] completes when the unit's content has a
    /// persisted identity. Such units opt out of batching so they round-trip
    /// through the pipeline without waiting for batch fill.
    pub fn with_future(
        content: ContentUnit,
        d_artifacts: Vec<DeclarativeArtifact>,
    ) -> (Self, ContentFuture) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                content,
                d_artifacts,
                does_batch: false,
                resolver: Some(tx),
            },
            ContentFuture { rx },
        )
    }

    /// Whether a future is still pending on this unit.
    pub fn has_pending_future(&self) -> bool {
        self.resolver.is_some()
    }

    /// Resolve the pending future, if any, with the current content record.
    ///
    /// The sender is consumed, so a unit can only ever be resolved once; a
    /// second call is a no-op. A dropped receiver (producer stopped waiting)
    /// is not an error.
    pub fn resolve(&mut self) {
        if let Some(tx) = self.resolver.take() {
            tx.send(self.content.clone()).ok();
        }
    }
}

impl std::fmt::Debug for DeclarativeContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeclarativeContent")
            .field("content", &self.content)
            .field("d_artifacts", &self.d_artifacts.len())
            .field("does_batch", &self.does_batch)
            .field("pending_future", &self.resolver.is_some())
            .finish()
    }
}

/// A content↔artifact association, keyed by (content, relative_path)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentArtifactLink {
    /// The owning content unit
    pub content: ContentId,
    /// The linked artifact, if its bytes are stored locally
    pub artifact: Option<ArtifactId>,
    /// Path of the artifact inside the content unit
    pub relative_path: String,
}

/// Remote-provenance record: where an artifact can be re-fetched from
///
/// One per (remote, content↔artifact link) pair, so the bytes can be
/// recovered later even if the local copy is removed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteArtifactRecord {
    /// The content unit the link belongs to
    pub content: ContentId,
    /// Path of the artifact inside the content unit
    pub relative_path: String,
    /// The remote the artifact came from
    pub remote: RemoteId,
    /// The url it was (or can be) fetched from
    pub url: String,
    /// Declared or measured size
    pub size: Option<u64>,
    /// Declared or measured digests
    pub digests: DigestSet,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> Arc<Remote> {
        Arc::new(Remote {
            id: RemoteId(1),
            name: "upstream".into(),
        })
    }

    #[test]
    fn digest_sets_match_on_any_shared_algorithm() {
        let declared = DigestSet::sha256("abc");
        let stored = DigestSet {
            sha256: Some("abc".into()),
            sha512: Some("def".into()),
            ..Default::default()
        };
        assert!(declared.matches(&stored));
    }

    #[test]
    fn digest_sets_with_no_shared_algorithm_do_not_match() {
        let declared = DigestSet {
            md5: Some("aaa".into()),
            ..Default::default()
        };
        let stored = DigestSet::sha256("abc");
        assert!(!declared.matches(&stored));
    }

    #[test]
    fn digest_sets_disagreeing_on_a_shared_algorithm_do_not_match() {
        let a = DigestSet::sha256("abc");
        let b = DigestSet::sha256("xyz");
        assert!(!a.matches(&b));
    }

    #[test]
    fn natural_key_follows_key_field_order() {
        let unit = ContentUnit::new(
            "file",
            [
                ("digest".to_string(), "abc".to_string()),
                ("relative_path".to_string(), "a/b.txt".to_string()),
            ],
            ["relative_path".to_string(), "digest".to_string()],
        );
        let key = unit.natural_key();
        assert_eq!(key.kind, "file");
        assert_eq!(
            key.values,
            vec![
                ("relative_path".to_string(), "a/b.txt".to_string()),
                ("digest".to_string(), "abc".to_string()),
            ]
        );
        assert_eq!(key.to_string(), "file:relative_path=a/b.txt,digest=abc");
    }

    #[test]
    fn declarative_artifact_rejects_absolute_relative_path() {
        let result = DeclarativeArtifact::new(
            Artifact::declared(DigestSet::default(), None),
            "https://example.com/f",
            "/etc/passwd",
            remote(),
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn declarative_artifact_rejects_unparseable_url() {
        let result = DeclarativeArtifact::new(
            Artifact::declared(DigestSet::default(), None),
            "not a url",
            "a.txt",
            remote(),
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn declarative_artifact_rejects_empty_relative_path() {
        let result = DeclarativeArtifact::new(
            Artifact::declared(DigestSet::default(), None),
            "https://example.com/f",
            "",
            remote(),
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn future_resolves_exactly_once() {
        let unit = ContentUnit::new("file", [], []);
        let (mut dc, future) = DeclarativeContent::with_future(unit, Vec::new());
        assert!(!dc.does_batch, "future-bearing units opt out of batching");
        assert!(dc.has_pending_future());

        dc.content.id = Some(ContentId(7));
        dc.resolve();
        assert!(!dc.has_pending_future());
        // Second resolve is a no-op, not a panic.
        dc.resolve();

        let resolved = future.resolved().await.unwrap();
        assert_eq!(resolved.id, Some(ContentId(7)));
    }

    #[tokio::test]
    async fn dropped_unit_fails_the_future() {
        let unit = ContentUnit::new("file", [], []);
        let (dc, future) = DeclarativeContent::with_future(unit, Vec::new());
        drop(dc);
        assert!(matches!(future.resolved().await, Err(Error::FutureDropped)));
    }
}
