use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWriteExt};
use uuid::Uuid;

use crate::blob_store::BlobStore;
use crate::error::{GroupBinError, Result};
use crate::meta_store::MetaStore;
use crate::models::{File, FileVersion};
use crate::time::Clock;

/// Everything the client supplies for one chunk request (spec §4.3). Fields
/// that only matter for the final chunk (`filename`, `group_id`, `file_id`,
/// `uploader`, `description`, `comment`) are still required on every call
/// since the client may send the final chunk first.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub identifier: String,
    pub chunk_number: u32,
    pub total_chunks: u32,
    pub total_size: u64,
    pub current_chunk_size: u64,
    pub filename: String,
    pub group_id: Uuid,
    pub file_id: Option<Uuid>,
    pub uploader: String,
    pub description: String,
    pub comment: String,
}

/// Result of [`UploadAssembler::ingest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Chunk accepted; not (yet) the trigger for a commit.
    ChunkAccepted,
    /// This call merged and committed the upload.
    Committed { file_id: Uuid },
}

const RENAME_POLL_TIMEOUT: Duration = Duration::from_secs(1);
const RENAME_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Receives chunked uploads keyed by a client-chosen `identifier`, persists
/// each chunk under `<upload_root>/tmp/<identifier>/<n>`, and elects one
/// worker to merge and commit once the final chunk lands (spec §4.3).
///
/// New relative to the teacher, which has no chunked-upload concept at all;
/// grounded on `original_source/app/routes/file.py`'s `handle_resumable_upload`
/// / `all_chunks_uploaded` / `merge_chunks` / `cleanup_chunks`, restructured
/// around the typed error taxonomy and explicit clock spec.md §4.4 requires.
#[derive(Debug)]
pub struct UploadAssembler {
    meta: Arc<dyn MetaStore>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    max_upload_size_bytes: u64,
    move_poll_timeout: Duration,
}

impl UploadAssembler {
    pub fn new(
        meta: Arc<dyn MetaStore>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        max_upload_size_bytes: u64,
        move_poll_timeout: Duration,
    ) -> Self {
        Self {
            meta,
            blobs,
            clock,
            max_upload_size_bytes,
            move_poll_timeout,
        }
    }

    fn tmp_root(&self) -> PathBuf {
        self.blobs.root().join("tmp")
    }

    fn chunk_dir(&self, identifier: &str) -> PathBuf {
        self.tmp_root().join(identifier)
    }

    fn lock_path(&self, merge_key: &str) -> PathBuf {
        self.tmp_root().join(format!("{merge_key}.lock"))
    }

    /// `FOUND` (`true`) if the chunk is already persisted, `MISSING`
    /// (`false`) otherwise. Does not size-check against `MaxUploadSize`:
    /// spec §6's 413-on-probe response requires `resumableTotalSize`, which
    /// this core has no query-string to read, so that check is the HTTP
    /// boundary's responsibility before it calls in here.
    pub async fn probe(&self, identifier: &str, chunk_number: u32) -> bool {
        tokio::fs::metadata(self.chunk_dir(identifier).join(chunk_number.to_string()))
            .await
            .is_ok()
    }

    #[tracing::instrument(level = "debug", skip(self, source, req), fields(identifier = %req.identifier, chunk = req.chunk_number))]
    pub async fn ingest(
        &self,
        req: &ChunkRequest,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<IngestOutcome> {
        let group = self.meta.get_group(req.group_id).await?.ok_or(GroupBinError::NotFound)?;
        if group.is_readonly {
            return Err(GroupBinError::ReadOnlyGroup { group_id: req.group_id });
        }
        if req.total_size > self.max_upload_size_bytes {
            return Err(GroupBinError::FileTooLarge {
                size: req.total_size,
                max_size: self.max_upload_size_bytes,
            });
        }

        let chunk_dir = self.chunk_dir(&req.identifier);
        tokio::fs::create_dir_all(&chunk_dir).await?;

        if req.current_chunk_size == 0 {
            return Err(GroupBinError::ChunkSizeMismatch {
                chunk_number: req.chunk_number,
                declared: 0,
                observed: 0,
            });
        }

        let final_path = chunk_dir.join(req.chunk_number.to_string());
        let temp_path = chunk_dir.join(format!("{}.un-complete", req.chunk_number));

        {
            let mut temp_file = tokio::fs::File::create(&temp_path).await?;
            let written = tokio::io::copy(source, &mut temp_file).await?;
            temp_file.flush().await?;

            if written != req.current_chunk_size {
                tokio::fs::remove_file(&temp_path).await.ok();
                return Err(GroupBinError::ChunkSizeMismatch {
                    chunk_number: req.chunk_number,
                    declared: req.current_chunk_size,
                    observed: written,
                });
            }
        }

        tokio::fs::rename(&temp_path, &final_path).await?;
        self.poll_rename_visible(&final_path, &temp_path).await;

        if !all_chunks_present(&chunk_dir, req.total_chunks).await {
            return Ok(IngestOutcome::ChunkAccepted);
        }

        self.try_merge_and_commit(req).await
    }

    /// Best-effort sanity poll: spec §4.3 step 4 says to warn, not fail, if
    /// the rename hasn't become visible within ~1s.
    async fn poll_rename_visible(&self, final_path: &Path, temp_path: &Path) {
        let deadline = self.clock.now() + time::Duration::try_from(RENAME_POLL_TIMEOUT).unwrap();
        loop {
            let final_exists = tokio::fs::metadata(final_path).await.is_ok();
            let temp_gone = tokio::fs::metadata(temp_path).await.is_err();
            if final_exists && temp_gone {
                return;
            }
            if self.clock.now() >= deadline {
                tracing::warn!(?final_path, ?temp_path, "chunk rename did not become visible in time");
                return;
            }
            tokio::time::sleep(RENAME_POLL_INTERVAL).await;
        }
    }

    async fn try_merge_and_commit(&self, req: &ChunkRequest) -> Result<IngestOutcome> {
        let merge_key = &req.identifier;
        let lock_path = self.lock_path(merge_key);

        let lock_file = match tokio::fs::OpenOptions::new().write(true).create_new(true).open(&lock_path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(IngestOutcome::ChunkAccepted),
            Err(e) => return Err(e.into()),
        };
        drop(lock_file);

        let result = self.merge_and_commit_locked(req).await;
        let release = tokio::fs::remove_file(&lock_path).await;
        if release.is_err() && tokio::fs::metadata(&lock_path).await.is_ok() {
            tracing::warn!(?lock_path, "merge lock file still present after release attempt");
        }
        result
    }

    async fn merge_and_commit_locked(&self, req: &ChunkRequest) -> Result<IngestOutcome> {
        let chunk_dir = self.chunk_dir(&req.identifier);
        if tokio::fs::metadata(&chunk_dir).await.is_err() {
            // another merger already finished and cleaned up
            return Ok(IngestOutcome::ChunkAccepted);
        }

        let merged_path = chunk_dir.join(&req.filename);
        merge_chunks(&chunk_dir, &merged_path, req.total_chunks).await?;

        if tokio::fs::metadata(&merged_path).await.is_err() {
            let err = GroupBinError::MergeFailed {
                identifier: req.identifier.clone(),
            };
            crate::error::log(&err);
            return Err(err);
        }

        let stored_name = format!("{}{}", Uuid::new_v4(), safe_extension(&req.filename));
        self.adopt_with_poll(req.group_id, &stored_name, &merged_path).await?;

        let now = self.clock.now();
        let size = tokio::fs::metadata(self.blobs.root().join(req.group_id.to_string()).join(&stored_name))
            .await
            .map(|m| m.len())
            .unwrap_or(req.total_size);

        let file_id = if let Some(file_id) = req.file_id {
            let version = FileVersion {
                id: Uuid::new_v4(),
                file_id,
                stored_filename: stored_name,
                uploaded_at: now,
                uploader: req.uploader.clone(),
                comment: req.comment.clone(),
                size: size as i64,
            };
            self.meta.insert_version(version).await?;
            file_id
        } else {
            let file_id = Uuid::new_v4();
            let file = File {
                id: file_id,
                group_id: req.group_id,
                original_filename: req.filename.clone(),
                stored_filename: stored_name.clone(),
                description: if req.description.is_empty() { None } else { Some(req.description.clone()) },
                size: size as i64,
                uploaded_at: now,
                content_type: "application/octet-stream".into(),
            };
            let version = FileVersion {
                id: Uuid::new_v4(),
                file_id,
                stored_filename: stored_name,
                uploaded_at: now,
                uploader: req.uploader.clone(),
                comment: req.comment.clone(),
                size: size as i64,
            };
            self.meta.insert_file_with_initial_version(file, version).await?;
            file_id
        };

        tokio::fs::remove_dir_all(&chunk_dir).await.ok();

        Ok(IngestOutcome::Committed { file_id })
    }

    async fn adopt_with_poll(&self, group_id: Uuid, stored_name: &str, from: &Path) -> Result<()> {
        self.blobs.adopt(group_id, stored_name, from).await?;

        let start = self.clock.now();
        let deadline = start + time::Duration::try_from(self.move_poll_timeout).unwrap();
        loop {
            if self.blobs.exists(group_id, stored_name).await {
                return Ok(());
            }
            if self.clock.now() >= deadline {
                return Err(GroupBinError::FileNotFoundError {
                    path: format!("{group_id}/{stored_name}"),
                });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

async fn all_chunks_present(chunk_dir: &Path, total_chunks: u32) -> bool {
    for n in 1..=total_chunks {
        if tokio::fs::metadata(chunk_dir.join(n.to_string())).await.is_err() {
            return false;
        }
    }
    true
}

async fn merge_chunks(chunk_dir: &Path, dest: &Path, total_chunks: u32) -> Result<()> {
    let mut out = tokio::fs::File::create(dest).await?;
    for n in 1..=total_chunks {
        let mut chunk = tokio::fs::File::open(chunk_dir.join(n.to_string())).await?;
        tokio::io::copy(&mut chunk, &mut out).await?;
    }
    out.flush().await?;
    Ok(())
}

/// Sanitizes a filename's extension for use in a server-chosen
/// `stored_name`: lowercased, no path separators or control characters. The
/// `original_filename` recorded in the DB is left untouched.
fn safe_extension(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() => {
            let cleaned: String = ext
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .map(|c| c.to_ascii_lowercase())
                .collect();
            if cleaned.is_empty() {
                String::new()
            } else {
                format!(".{cleaned}")
            }
        }
        _ => String::new(),
    }
}
