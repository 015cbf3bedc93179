use std::io::Cursor;

use uuid::Uuid;
use zip::write::FileOptions;
use zip::ZipWriter;

use crate::blob_store::BlobStore;
use crate::error::Result;
use crate::models::FileVersion;

/// Bundles every `(file, version)` pair of a group into a single
/// ZIP-DEFLATED archive, entry-named `v-<MM-dd-HH-mm-ss>_<original_filename>`
/// (spec §4.4 `bundle_group`).
///
/// New relative to the teacher, which has no archival need at all; grounded
/// on `original_source/app/routes/file.py`'s `zip_download` (same entry
/// naming, same `BytesIO`-into-memory pattern, translated to `zip`'s
/// `Cursor<Vec<u8>>` equivalent).
#[tracing::instrument(level = "debug", skip(blobs, entries))]
pub async fn bundle(blobs: &dyn BlobStore, group_id: Uuid, entries: &[(String, FileVersion)]) -> Result<Vec<u8>> {
    let mut bodies = Vec::with_capacity(entries.len());
    for (original_filename, version) in entries {
        let mut reader = blobs.open(group_id, &version.stored_filename).await?;
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buf).await?;
        bodies.push((entry_name(original_filename, version), buf));
    }

    // zip::ZipWriter is synchronous; bundling happens after every blob is
    // already read into memory, so no async I/O crosses the writer calls.
    let cursor = Cursor::new(Vec::new());
    let mut writer = ZipWriter::new(cursor);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (name, body) in bodies {
        writer.start_file(name, options)?;
        std::io::Write::write_all(&mut writer, &body)?;
    }

    let cursor = writer.finish()?;
    Ok(cursor.into_inner())
}

fn entry_name(original_filename: &str, version: &FileVersion) -> String {
    let timestamp = version
        .uploaded_at
        .format(time::macros::format_description!("[month]-[day]-[hour]-[minute]-[second]"))
        .expect("uploaded_at always formats");
    format!("v-{timestamp}_{original_filename}")
}

/// The archive's own filename, per spec §6: `group_<group_id>_files.zip`.
pub fn archive_name(group_id: Uuid) -> String {
    format!("group_{group_id}_files.zip")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::FsBlobStore;
    use std::io::Cursor as StdCursor;
    use time::macros::datetime;

    fn version(stored_filename: &str, at: time::OffsetDateTime) -> FileVersion {
        FileVersion {
            id: Uuid::new_v4(),
            file_id: Uuid::new_v4(),
            stored_filename: stored_filename.into(),
            uploaded_at: at,
            uploader: "alice".into(),
            comment: String::new(),
            size: 0,
        }
    }

    #[tokio::test]
    async fn bundle_contains_one_entry_per_file_version_pair() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = FsBlobStore::new(dir.path());
        let group_id = Uuid::new_v4();

        blobs.save(group_id, "blob-a", &mut StdCursor::new(b"AAA".to_vec())).await.unwrap();
        blobs.save(group_id, "blob-b", &mut StdCursor::new(b"BBB".to_vec())).await.unwrap();

        let entries = vec![
            ("a.txt".to_string(), version("blob-a", datetime!(2026-03-04 05:06:07 UTC))),
            ("b.txt".to_string(), version("blob-b", datetime!(2026-03-04 05:06:07 UTC))),
        ];

        let bytes = bundle(&blobs, group_id, &entries).await.unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);

        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names.contains(&"v-03-04-05-06-07_a.txt".to_string()));
        assert!(names.contains(&"v-03-04-05-06-07_b.txt".to_string()));
    }

    #[test]
    fn archive_name_includes_group_id() {
        let id = Uuid::nil();
        assert_eq!(archive_name(id), format!("group_{id}_files.zip"));
    }
}
