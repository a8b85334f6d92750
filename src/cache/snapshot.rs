//! On-disk snapshot storage.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/html/<host>/<path segments>/index.html
//! <root>/html/<host>/<path segments>/index-mobile.html
//! <root>/css/<hash>.css
//! <root>/js/<hash>.js
//! ```
//!
//! Writes land in a temporary file next to the target and are renamed into
//! place, so readers see either the old file, the new file, or nothing.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::{fs, io::AsyncReadExt, task};
use tracing::debug;

use super::keys::CacheKey;

/// Extensions that have a static asset snapshot directory.
pub const ASSET_EXTENSIONS: [&str; 2] = ["css", "js"];

const PAGE_DIR: &str = "html";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("failed to move snapshot into place: {0}")]
    Persist(#[from] tempfile::PersistError),
    #[error("snapshot path `{0}` has no parent directory")]
    Orphan(PathBuf),
    #[error("unsupported asset extension `{0}`")]
    UnsupportedExtension(String),
    #[error("snapshot writer task failed: {0}")]
    Join(#[from] task::JoinError),
}

/// A snapshot read from disk.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub body: Bytes,
    pub modified: SystemTime,
    /// Quoted strong validator, ready for an `ETag` header.
    pub validator: String,
}

impl Snapshot {
    /// Wraps an in-memory body, computing its validator.
    pub fn from_body(body: Bytes, modified: SystemTime) -> Self {
        let validator = compute_validator(&body);
        Self {
            body,
            modified,
            validator,
        }
    }

    /// `(now - modified) < lifetime`. A modification time in the future counts
    /// as fresh.
    pub fn is_fresh(&self, lifetime: Duration, now: SystemTime) -> bool {
        match now.duration_since(self.modified) {
            Ok(age) => age < lifetime,
            Err(_) => true,
        }
    }
}

/// Quoted SHA-256 hex of the content.
pub fn compute_validator(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    format!("\"{}\"", hex::encode(digest.as_slice()))
}

/// Filesystem-backed snapshot store.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pages_root(&self) -> PathBuf {
        self.root.join(PAGE_DIR)
    }

    /// Absolute location of the snapshot for `key`.
    pub fn page_path(&self, key: &CacheKey) -> PathBuf {
        let mut path = self.pages_root().join(key.host());
        for segment in key.segments() {
            path.push(segment);
        }
        path.push(key.device().snapshot_file_name());
        path
    }

    pub fn asset_path(&self, extension: &str, hash: &str) -> Result<PathBuf, SnapshotError> {
        if !ASSET_EXTENSIONS.contains(&extension) {
            return Err(SnapshotError::UnsupportedExtension(extension.to_string()));
        }
        Ok(self
            .root
            .join(extension)
            .join(format!("{hash}.{extension}")))
    }

    /// Read the page snapshot for `key`. A missing file is `Ok(None)`.
    pub async fn read_page(&self, key: &CacheKey) -> Result<Option<Snapshot>, SnapshotError> {
        read_snapshot(&self.page_path(key)).await
    }

    pub async fn read_asset(
        &self,
        extension: &str,
        hash: &str,
    ) -> Result<Option<Snapshot>, SnapshotError> {
        read_snapshot(&self.asset_path(extension, hash)?).await
    }

    /// Atomically replace the page snapshot for `key`.
    pub async fn write_page(&self, key: &CacheKey, body: Bytes) -> Result<PathBuf, SnapshotError> {
        let target = self.page_path(key);
        write_atomic(target, body).await
    }

    pub async fn write_asset(
        &self,
        extension: &str,
        hash: &str,
        body: Bytes,
    ) -> Result<PathBuf, SnapshotError> {
        let target = self.asset_path(extension, hash)?;
        write_atomic(target, body).await
    }

    /// Remove one page variant. Missing files are treated as success.
    pub async fn delete_page(&self, key: &CacheKey) -> Result<(), SnapshotError> {
        remove_file_if_present(&self.page_path(key)).await
    }

    /// Delete every page snapshot and recreate the empty page directory.
    pub async fn wipe_pages(&self) -> Result<(), SnapshotError> {
        wipe_dir(&self.pages_root()).await
    }

    /// Delete every static asset snapshot and recreate the directories.
    pub async fn wipe_assets(&self) -> Result<(), SnapshotError> {
        for extension in ASSET_EXTENSIONS {
            wipe_dir(&self.root.join(extension)).await?;
        }
        Ok(())
    }
}

async fn read_snapshot(path: &Path) -> Result<Option<Snapshot>, SnapshotError> {
    let mut file = match fs::File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    // Metadata and content come from the same handle so a concurrent rename
    // cannot pair one file's mtime with another file's bytes.
    let modified = file.metadata().await?.modified()?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer).await?;

    Ok(Some(Snapshot::from_body(Bytes::from(buffer), modified)))
}

async fn write_atomic(target: PathBuf, body: Bytes) -> Result<PathBuf, SnapshotError> {
    task::spawn_blocking(move || -> Result<PathBuf, SnapshotError> {
        let parent = target
            .parent()
            .ok_or_else(|| SnapshotError::Orphan(target.clone()))?;
        std::fs::create_dir_all(parent)?;

        let mut staged = NamedTempFile::new_in(parent)?;
        staged.write_all(&body)?;
        make_world_readable(staged.as_file())?;
        staged.as_file().sync_all()?;
        staged.persist(&target)?;

        debug!(path = %target.display(), bytes = body.len(), "snapshot written");
        Ok(target)
    })
    .await?
}

/// Temporary files start out owner-only; the web server serving snapshots
/// directly usually runs as another user.
pub(crate) fn make_world_readable(file: &std::fs::File) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o644))?;
    }
    #[cfg(not(unix))]
    let _ = file;
    Ok(())
}

async fn remove_file_if_present(path: &Path) -> Result<(), SnapshotError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn wipe_dir(dir: &Path) -> Result<(), SnapshotError> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    fs::create_dir_all(dir).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::device::DeviceClass;

    fn key(path: &str, device: DeviceClass) -> CacheKey {
        CacheKey::new("example.com", path, device).expect("valid key")
    }

    #[test]
    fn page_paths_follow_layout() {
        let store = SnapshotStore::new("/srv/cache");
        assert_eq!(
            store.page_path(&key("/blog/post-1", DeviceClass::Desktop)),
            PathBuf::from("/srv/cache/html/example.com/blog/post-1/index.html")
        );
        assert_eq!(
            store.page_path(&key("/blog/post-1/", DeviceClass::Mobile)),
            PathBuf::from("/srv/cache/html/example.com/blog/post-1/index-mobile.html")
        );
        assert_eq!(
            store.page_path(&key("/", DeviceClass::Desktop)),
            PathBuf::from("/srv/cache/html/example.com/index.html")
        );
    }

    #[test]
    fn asset_paths_follow_layout() {
        let store = SnapshotStore::new("/srv/cache");
        assert_eq!(
            store.asset_path("css", "abc123").unwrap(),
            PathBuf::from("/srv/cache/css/abc123.css")
        );
        assert!(matches!(
            store.asset_path("png", "abc"),
            Err(SnapshotError::UnsupportedExtension(_))
        ));
    }

    #[test]
    fn validator_is_quoted_sha256() {
        let validator = compute_validator(b"hello");
        assert_eq!(
            validator,
            "\"2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824\""
        );
    }

    #[test]
    fn freshness_window() {
        let now = SystemTime::now();
        let snapshot = Snapshot {
            body: Bytes::new(),
            modified: now - Duration::from_secs(30),
            validator: String::new(),
        };
        assert!(snapshot.is_fresh(Duration::from_secs(60), now));
        assert!(!snapshot.is_fresh(Duration::from_secs(30), now));
        assert!(!snapshot.is_fresh(Duration::from_secs(10), now));
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let key = key("/blog/post-1", DeviceClass::Desktop);

        store
            .write_page(&key, Bytes::from_static(b"<html>one</html>"))
            .await
            .unwrap();
        let snapshot = store.read_page(&key).await.unwrap().expect("snapshot");

        assert_eq!(snapshot.body, Bytes::from_static(b"<html>one</html>"));
        assert_eq!(snapshot.validator, compute_validator(b"<html>one</html>"));
        assert!(snapshot.is_fresh(Duration::from_secs(60), SystemTime::now()));
    }

    #[tokio::test]
    async fn overwrite_replaces_content_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let key = key("/a", DeviceClass::Desktop);

        store.write_page(&key, Bytes::from_static(b"old")).await.unwrap();
        let path = store.write_page(&key, Bytes::from_static(b"new")).await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
        let snapshot = store.read_page(&key).await.unwrap().unwrap();
        assert_eq!(snapshot.body, Bytes::from_static(b"new"));
    }

    #[tokio::test]
    async fn missing_snapshot_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let result = store
            .read_page(&key("/nothing", DeviceClass::Desktop))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn wipe_removes_pages_and_recreates_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let desktop = key("/a/b", DeviceClass::Desktop);
        let mobile = key("/a/b", DeviceClass::Mobile);
        store.write_page(&desktop, Bytes::from_static(b"d")).await.unwrap();
        store.write_page(&mobile, Bytes::from_static(b"m")).await.unwrap();

        store.wipe_pages().await.unwrap();

        assert!(store.pages_root().is_dir());
        assert!(store.read_page(&desktop).await.unwrap().is_none());
        assert!(store.read_page(&mobile).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wipe_without_existing_directory_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("never-created"));
        store.wipe_pages().await.unwrap();
        store.wipe_assets().await.unwrap();
        assert!(store.pages_root().is_dir());
        assert!(store.root().join("css").is_dir());
    }

    #[tokio::test]
    async fn delete_page_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let key = key("/x", DeviceClass::Mobile);
        store.write_page(&key, Bytes::from_static(b"m")).await.unwrap();

        store.delete_page(&key).await.unwrap();
        store.delete_page(&key).await.unwrap();
        assert!(store.read_page(&key).await.unwrap().is_none());
    }
}
