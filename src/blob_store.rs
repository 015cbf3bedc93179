use std::path::{Path, PathBuf};

use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::error::Result;

/// Entry kind returned by [`BlobStore::list_top_level`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
}

/// Owns the `<upload_root>/<group_id>/<stored_name>` tree (spec §4.1).
///
/// The blob store is oblivious to the metadata store: it never decides
/// what is orphan, it only reads/writes/lists what it is told to. Mirrors
/// the teacher's `BlobStore` trait shape, filled out to the full contract
/// the teacher's version left as a one-method stub.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync + std::fmt::Debug + 'static {
    /// Writes a blob at `<upload_root>/<group_id>/<stored_name>`, creating
    /// the group directory on demand. Returns the durable byte count.
    async fn save(
        &self,
        group_id: Uuid,
        stored_name: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64>;

    /// Moves a file already on the local filesystem into the blob store,
    /// used by the upload assembler to commit a merged chunk file without
    /// a redundant copy.
    async fn adopt(&self, group_id: Uuid, stored_name: &str, from: &Path) -> Result<u64>;

    /// Opens a blob for streaming read. Fails with
    /// [`crate::error::GroupBinError::NotFound`] if absent.
    async fn open(&self, group_id: Uuid, stored_name: &str) -> Result<tokio::fs::File>;

    /// Idempotent removal of a single blob.
    async fn remove(&self, group_id: Uuid, stored_name: &str) -> Result<()>;

    /// Idempotent recursive removal of `<upload_root>/<group_id>`.
    async fn remove_group(&self, group_id: Uuid) -> Result<()>;

    /// Whether a blob exists, used by GC invariants and `fetch_version`.
    async fn exists(&self, group_id: Uuid, stored_name: &str) -> bool;

    /// Enumerates top-level entries of `<upload_root>` for the reclamation
    /// loop's orphan sweep.
    async fn list_top_level(&self) -> Result<Vec<(String, EntryKind)>>;

    /// Root path, exposed so the upload assembler can share the same
    /// filesystem tree for its `tmp/` staging area (spec §6's on-disk
    /// layout keeps `tmp/` as a sibling of the group directories).
    fn root(&self) -> &Path;
}

/// Filesystem-backed implementation of [`BlobStore`], rooted at
/// `upload_root`. New relative to the teacher (whose only implementation,
/// `RadosBlobStore` in `ceph_store.rs`, talks to a Ceph pool); grounded
/// directly on spec §4.1 and the on-disk layout of spec §6.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn group_dir(&self, group_id: Uuid) -> PathBuf {
        self.root.join(group_id.to_string())
    }

    fn blob_path(&self, group_id: Uuid, stored_name: &str) -> PathBuf {
        self.group_dir(group_id).join(stored_name)
    }
}

#[async_trait::async_trait]
impl BlobStore for FsBlobStore {
    #[tracing::instrument(level = "debug", skip(self, source))]
    async fn save(
        &self,
        group_id: Uuid,
        stored_name: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64> {
        use tokio::io::AsyncWriteExt;

        let dir = self.group_dir(group_id);
        tokio::fs::create_dir_all(&dir).await?;

        let path = self.blob_path(group_id, stored_name);
        let mut file = tokio::fs::File::create(&path).await?;
        let written = tokio::io::copy(source, &mut file).await?;
        file.flush().await?;
        Ok(written)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn adopt(&self, group_id: Uuid, stored_name: &str, from: &Path) -> Result<u64> {
        let dir = self.group_dir(group_id);
        tokio::fs::create_dir_all(&dir).await?;

        let dest = self.blob_path(group_id, stored_name);
        match tokio::fs::rename(from, &dest).await {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc_exdev()) => {
                tokio::fs::copy(from, &dest).await?;
                tokio::fs::remove_file(from).await?;
            }
            Err(e) => return Err(e.into()),
        }
        let metadata = tokio::fs::metadata(&dest).await?;
        Ok(metadata.len())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn open(&self, group_id: Uuid, stored_name: &str) -> Result<tokio::fs::File> {
        let path = self.blob_path(group_id, stored_name);
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(crate::error::GroupBinError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn remove(&self, group_id: Uuid, stored_name: &str) -> Result<()> {
        let path = self.blob_path(group_id, stored_name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn remove_group(&self, group_id: Uuid) -> Result<()> {
        let dir = self.group_dir(group_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, group_id: Uuid, stored_name: &str) -> bool {
        tokio::fs::metadata(self.blob_path(group_id, stored_name))
            .await
            .is_ok()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_top_level(&self) -> Result<Vec<(String, EntryKind)>> {
        let mut entries = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = read_dir.next_entry().await? {
            let file_type = entry.file_type().await?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let kind = if file_type.is_dir() { EntryKind::Dir } else { EntryKind::File };
            entries.push((name, kind));
        }
        Ok(entries)
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(unix)]
fn libc_exdev() -> i32 {
    18 // EXDEV
}

#[cfg(not(unix))]
fn libc_exdev() -> i32 {
    i32::MIN
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn save_creates_group_directory_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let group_id = Uuid::new_v4();

        let mut src = Cursor::new(b"hello".to_vec());
        let written = store.save(group_id, "greet.txt", &mut src).await.unwrap();
        assert_eq!(written, 5);
        assert!(store.exists(group_id, "greet.txt").await);
    }

    #[tokio::test]
    async fn open_missing_blob_fails_with_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let err = store.open(Uuid::new_v4(), "nope").await.unwrap_err();
        assert!(matches!(err, crate::error::GroupBinError::NotFound));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let group_id = Uuid::new_v4();
        store.remove(group_id, "nonexistent").await.unwrap();
        store.remove(group_id, "nonexistent").await.unwrap();
    }

    #[tokio::test]
    async fn remove_group_is_idempotent_and_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let group_id = Uuid::new_v4();

        let mut src = Cursor::new(b"data".to_vec());
        store.save(group_id, "a.bin", &mut src).await.unwrap();

        store.remove_group(group_id).await.unwrap();
        assert!(!store.exists(group_id, "a.bin").await);
        store.remove_group(group_id).await.unwrap();
    }

    #[tokio::test]
    async fn list_top_level_distinguishes_dirs_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let group_id = Uuid::new_v4();

        let mut src = Cursor::new(b"data".to_vec());
        store.save(group_id, "a.bin", &mut src).await.unwrap();
        tokio::fs::write(dir.path().join("ghost.bin"), b"x").await.unwrap();

        let mut entries = store.list_top_level().await.unwrap();
        entries.sort();
        assert_eq!(
            entries,
            vec![
                (group_id.to_string(), EntryKind::Dir),
                ("ghost.bin".to_string(), EntryKind::File),
            ]
        );
    }

    #[tokio::test]
    async fn adopt_moves_file_into_group_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let group_id = Uuid::new_v4();

        let staged = dir.path().join("staged.bin");
        tokio::fs::write(&staged, b"merged contents").await.unwrap();

        let size = store.adopt(group_id, "final.bin", &staged).await.unwrap();
        assert_eq!(size, 15);
        assert!(store.exists(group_id, "final.bin").await);
        assert!(!staged.exists());
    }
}
