//! End-to-end sync runs over the in-memory store.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use catalog_sync::{
    Artifact, ContentFeed, ContentUnit, DeclarativeArtifact, DeclarativeContent, DigestSet,
    DownloadError, DownloadedFile, Downloader, HttpDownloader, InMemoryStorage, Remote, RemoteId,
    RetryConfig, Storage, SyncConfig, SyncMode, SyncPipeline, VersionId,
};

const VERSION: VersionId = VersionId(1);

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

fn declared(name: &str, digest: &str) -> DeclarativeContent {
    let da = DeclarativeArtifact::new(
        Artifact::declared(DigestSet::sha256(digest), Some(5)),
        format!("https://example.com/{name}"),
        name,
        remote(),
    )
    .unwrap();
    DeclarativeContent::new(unit(name), vec![da])
}

fn small_batches() -> SyncConfig {
    SyncConfig {
        queue_capacity: 4,
        batch_minsize: 2,
        ..Default::default()
    }
}

/// Downloader that fabricates files matching the declared digests.
struct StubDownloader {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl StubDownloader {
    fn new() -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Downloader for StubDownloader {
    async fn fetch(
        &self,
        _url: &str,
        expected_digests: &DigestSet,
        expected_size: Option<u64>,
    ) -> Result<DownloadedFile, DownloadError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(DownloadedFile {
            file: PathBuf::from("/tmp/stub"),
            size: expected_size.unwrap_or(5),
            digests: expected_digests.clone(),
        })
    }
}

#[tokio::test]
async fn full_sync_populates_the_store() {
    let storage = Arc::new(InMemoryStorage::new());
    let catalog = vec![declared("a.txt", "da"), declared("b.txt", "db")];

    SyncPipeline::new(
        Arc::clone(&storage) as Arc<dyn Storage>,
        Arc::new(StubDownloader::new()),
        VERSION,
    )
    .with_config(small_batches())
    .run(Box::new(ContentFeed::new(catalog)))
    .await
    .unwrap();

    assert_eq!(storage.content_count().unwrap(), 2);
    assert_eq!(storage.artifact_count().unwrap(), 2);
    assert_eq!(storage.link_count().unwrap(), 2);
    assert_eq!(storage.remote_artifact_count().unwrap(), 2);
    assert_eq!(storage.current_members(VERSION).await.unwrap().len(), 2);
}

#[tokio::test]
async fn resyncing_the_same_catalog_duplicates_nothing() {
    let storage = Arc::new(InMemoryStorage::new());

    for _ in 0..2 {
        SyncPipeline::new(
            Arc::clone(&storage) as Arc<dyn Storage>,
            Arc::new(StubDownloader::new()),
            VERSION,
        )
        .with_config(small_batches())
        .run(Box::new(ContentFeed::new(vec![
            declared("a.txt", "da"),
            declared("b.txt", "db"),
        ])))
        .await
        .unwrap();
    }

    assert_eq!(storage.content_count().unwrap(), 2);
    assert_eq!(storage.artifact_count().unwrap(), 2);
    assert_eq!(storage.link_count().unwrap(), 2, "links never duplicate");
    assert_eq!(storage.remote_artifact_count().unwrap(), 2);
    assert_eq!(storage.current_members(VERSION).await.unwrap().len(), 2);
}

#[tokio::test]
async fn mirror_sync_applies_the_membership_diff() {
    let storage = Arc::new(InMemoryStorage::new());

    // Previous version state: a, b, c.
    let mut seeded = Vec::new();
    for name in ["a.txt", "b.txt", "c.txt"] {
        let persisted = storage.insert_content(&unit(name)).unwrap();
        seeded.push(persisted.id.unwrap());
    }
    storage.seed_members(VERSION, &seeded).unwrap();

    // Upstream now offers b, c, d.
    SyncPipeline::new(
        Arc::clone(&storage) as Arc<dyn Storage>,
        Arc::new(StubDownloader::new()),
        VERSION,
    )
    .with_config(small_batches())
    .run(Box::new(ContentFeed::new(vec![
        declared("b.txt", "db"),
        declared("c.txt", "dc"),
        declared("d.txt", "dd"),
    ])))
    .await
    .unwrap();

    let members = storage.current_members(VERSION).await.unwrap();
    assert!(!members.contains(&seeded[0]), "a.txt disappeared upstream");
    assert!(members.contains(&seeded[1]));
    assert!(members.contains(&seeded[2]));
    assert_eq!(members.len(), 3, "b, c and the new d");
}

#[tokio::test]
async fn additive_sync_never_removes() {
    let storage = Arc::new(InMemoryStorage::new());
    let persisted = storage.insert_content(&unit("old.txt")).unwrap();
    storage
        .seed_members(VERSION, &[persisted.id.unwrap()])
        .unwrap();

    SyncPipeline::new(
        Arc::clone(&storage) as Arc<dyn Storage>,
        Arc::new(StubDownloader::new()),
        VERSION,
    )
    .with_mode(SyncMode::Additive)
    .run(Box::new(ContentFeed::new(vec![declared("new.txt", "dn")])))
    .await
    .unwrap();

    let members = storage.current_members(VERSION).await.unwrap();
    assert!(members.contains(&persisted.id.unwrap()));
    assert_eq!(members.len(), 2);
}

#[tokio::test]
async fn downloads_respect_the_concurrency_bound() {
    let storage = Arc::new(InMemoryStorage::new());
    let downloader = Arc::new(StubDownloader::new());
    let peak = Arc::clone(&downloader.peak);

    let catalog: Vec<_> = (0..30)
        .map(|n| declared(&format!("f{n}.txt"), &format!("d{n}")))
        .collect();

    SyncPipeline::new(
        Arc::clone(&storage) as Arc<dyn Storage>,
        downloader,
        VERSION,
    )
    .with_config(SyncConfig {
        max_concurrent_content: 4,
        queue_capacity: 32,
        batch_minsize: 2,
        ..Default::default()
    })
    .run(Box::new(ContentFeed::new(catalog)))
    .await
    .unwrap();

    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 4, "peak download concurrency {peak} exceeds the bound");
    assert_eq!(storage.current_members(VERSION).await.unwrap().len(), 30);
}

#[tokio::test]
async fn content_futures_resolve_with_persisted_identities() {
    let storage = Arc::new(InMemoryStorage::new());
    let (dc, future) = DeclarativeContent::with_future(unit("a.txt"), Vec::new());

    let sync = SyncPipeline::new(
        Arc::clone(&storage) as Arc<dyn Storage>,
        Arc::new(StubDownloader::new()),
        VERSION,
    )
    .run(Box::new(ContentFeed::new(vec![dc])));

    let (result, resolved) = tokio::join!(sync, future.resolved());
    result.unwrap();
    assert!(resolved.unwrap().id.is_some());
}

#[tokio::test]
async fn duplicate_guard_applies_during_a_full_sync() {
    let storage = Arc::new(InMemoryStorage::new());

    // Old member at relative path "a.txt" with a different natural key.
    let old = storage
        .insert_content(&ContentUnit::new(
            "file",
            [
                ("relative_path".to_string(), "a.txt".to_string()),
                ("digest".to_string(), "old".to_string()),
            ],
            ["relative_path".to_string(), "digest".to_string()],
        ))
        .unwrap();
    let old_id = old.id.unwrap();
    storage.seed_members(VERSION, &[old_id]).unwrap();

    let incoming = DeclarativeContent::new(
        ContentUnit::new(
            "file",
            [
                ("relative_path".to_string(), "a.txt".to_string()),
                ("digest".to_string(), "new".to_string()),
            ],
            ["relative_path".to_string(), "digest".to_string()],
        ),
        Vec::new(),
    );

    SyncPipeline::new(
        Arc::clone(&storage) as Arc<dyn Storage>,
        Arc::new(StubDownloader::new()),
        VERSION,
    )
    .with_mode(SyncMode::Additive)
    .with_duplicate_guard("file", ["relative_path".to_string()])
    .run(Box::new(ContentFeed::new(vec![incoming])))
    .await
    .unwrap();

    let members = storage.current_members(VERSION).await.unwrap();
    assert!(
        !members.contains(&old_id),
        "member clashing on relative_path was evicted"
    );
    assert_eq!(members.len(), 1);
}

#[tokio::test]
async fn on_demand_sync_skips_downloads_but_keeps_provenance() {
    let storage = Arc::new(InMemoryStorage::new());
    let downloader = Arc::new(StubDownloader::new());
    let peak = Arc::clone(&downloader.peak);

    SyncPipeline::new(
        Arc::clone(&storage) as Arc<dyn Storage>,
        downloader,
        VERSION,
    )
    .on_demand()
    .run(Box::new(ContentFeed::new(vec![
        declared("a.txt", "da"),
        declared("b.txt", "db"),
    ])))
    .await
    .unwrap();

    assert_eq!(peak.load(Ordering::SeqCst), 0, "no bytes were fetched");
    assert_eq!(storage.artifact_count().unwrap(), 0);
    assert_eq!(storage.content_count().unwrap(), 2);
    assert_eq!(storage.link_count().unwrap(), 2, "links exist without artifacts");
    assert_eq!(
        storage.remote_artifact_count().unwrap(),
        2,
        "provenance allows fetching the bytes later"
    );
    assert_eq!(storage.current_members(VERSION).await.unwrap().len(), 2);
}

#[tokio::test]
async fn http_sync_fetches_real_bytes() {
    let server = MockServer::start().await;
    let body = b"hello";
    let digest = format!("{:x}", Sha256::digest(body));
    Mock::given(method("GET"))
        .and(path("/a.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.as_slice()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(InMemoryStorage::new());
    let downloader = Arc::new(HttpDownloader::new(dir.path(), RetryConfig::default()));

    let da = DeclarativeArtifact::new(
        Artifact::declared(DigestSet::sha256(&digest), Some(body.len() as u64)),
        format!("{}/a.txt", server.uri()),
        "a.txt",
        remote(),
    )
    .unwrap();
    let dc = DeclarativeContent::new(unit("a.txt"), vec![da]);

    SyncPipeline::new(
        Arc::clone(&storage) as Arc<dyn Storage>,
        downloader,
        VERSION,
    )
    .run(Box::new(ContentFeed::new(vec![dc])))
    .await
    .unwrap();

    assert_eq!(storage.artifact_count().unwrap(), 1);
    assert_eq!(storage.current_members(VERSION).await.unwrap().len(), 1);
    // The fetched file landed in the download directory.
    assert!(dir.path().read_dir().unwrap().next().is_some());
}
