use std::collections::HashSet;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{GroupBinError, Result};
use crate::models::{File, FileVersion, Group, NewGroup};

/// Persistence boundary for [`Group`]/[`File`]/[`FileVersion`] rows.
///
/// Mirrors the teacher's `MetaStore` trait shape (one trait per storage
/// concern, `#[async_trait]`, plain structs crossing the boundary) and
/// `pg_database.rs`'s query style (raw `sqlx::query(...).bind(...)`,
/// `try_get`, explicit `tx.begin()/commit()`), switched from
/// `sqlx::Postgres` to `sqlx::Sqlite` since the system's database is a
/// single embedded file (spec §6, `SQLALCHEMY_DATABASE_URI`).
#[async_trait::async_trait]
pub trait MetaStore: Send + Sync + std::fmt::Debug + 'static {
    async fn create_group(&self, new_group: NewGroup, created_at: OffsetDateTime, expires_at: OffsetDateTime) -> Result<Group>;

    async fn get_group(&self, group_id: Uuid) -> Result<Option<Group>>;

    /// Unconditional expiry update, used by the "extend" operation. Spec
    /// §4.2 allows refreshing an expired-but-not-yet-reclaimed group.
    async fn set_group_expiry(&self, group_id: Uuid, expires_at: OffsetDateTime) -> Result<()>;

    /// Flips `is_readonly` only if `allow_convert_to_readonly` is set and
    /// the group is not already read-only. Returns whether the flip took
    /// effect, so the caller can distinguish "already read-only" from
    /// "not allowed" without a read-then-write race.
    async fn try_convert_to_readonly(&self, group_id: Uuid) -> Result<bool>;

    /// Inserts a `File` row and its first `FileVersion` in one transaction,
    /// per spec §4.3's "new filename -> new File + v1".
    async fn insert_file_with_initial_version(&self, file: File, version: FileVersion) -> Result<()>;

    /// Appends a version to an existing file without touching the `File`
    /// row itself, per spec §4.3's "existing filename -> append version".
    async fn insert_version(&self, version: FileVersion) -> Result<()>;

    async fn get_file(&self, file_id: Uuid) -> Result<Option<File>>;

    async fn list_files_for_group(&self, group_id: Uuid) -> Result<Vec<File>>;

    /// Newest first (by `uploaded_at`, ties broken by id) per spec §4.3's
    /// history listing.
    async fn list_versions(&self, file_id: Uuid) -> Result<Vec<FileVersion>>;

    async fn get_version(&self, version_id: Uuid) -> Result<Option<FileVersion>>;

    async fn latest_version(&self, file_id: Uuid) -> Result<Option<FileVersion>>;

    /// Deletes a `File` row (and, via `ON DELETE CASCADE`, its versions).
    async fn delete_file(&self, file_id: Uuid) -> Result<()>;

    /// Groups whose `expires_at` is strictly before `before`, for the
    /// reclamation loop's two-stage expiry (spec §4.5).
    async fn groups_expiring_before(&self, before: OffsetDateTime) -> Result<Vec<Group>>;

    /// Hard-deletes a group row, cascading to its files and versions.
    async fn hard_delete_group(&self, group_id: Uuid) -> Result<()>;

    async fn all_group_ids(&self) -> Result<HashSet<Uuid>>;

    /// Deletes `File` rows whose `group_id` is not in `keep`, used by the
    /// orphan-row sweep after a group's directory has already been GC'd
    /// out from under it. Returns the number of rows removed.
    async fn delete_files_with_group_not_in(&self, keep: &HashSet<Uuid>) -> Result<u64>;

    async fn all_file_ids(&self) -> Result<HashSet<Uuid>>;

    /// Deletes `FileVersion` rows whose `file_id` is not in `keep`.
    async fn delete_versions_with_file_not_in(&self, keep: &HashSet<Uuid>) -> Result<u64>;

    /// Every `stored_filename` referenced by a `File` or `FileVersion` row,
    /// for the orphan-blob sweep to diff against what is actually on disk.
    async fn all_stored_filenames(&self) -> Result<HashSet<String>>;
}

/// sqlite-backed implementation of [`MetaStore`], grounded on the teacher's
/// `pg_database.rs`.
#[derive(Debug, Clone)]
pub struct SqliteMetaStore {
    pool: SqlitePool,
}

impl SqliteMetaStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options: SqliteConnectOptions = database_url
            .parse::<SqliteConnectOptions>()
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = crate::error::logged!(SqlitePoolOptions::new().max_connections(8).connect_with(options).await);

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| GroupBinError::Conflict(e.to_string()))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_group(row: &sqlx::sqlite::SqliteRow) -> Result<Group> {
        Ok(Group {
            id: parse_uuid(row.try_get::<String, _>("id")?)?,
            name: row.try_get("name")?,
            created_at: parse_time(row.try_get::<String, _>("created_at")?)?,
            expires_at: parse_time(row.try_get::<String, _>("expires_at")?)?,
            created_duration_hours: row.try_get("created_duration_hours")?,
            password_hash: row.try_get("password_hash")?,
            is_readonly: row.try_get::<i64, _>("is_readonly")? != 0,
            allow_convert_to_readonly: row.try_get::<i64, _>("allow_convert_to_readonly")? != 0,
            creator: row.try_get("creator")?,
        })
    }

    fn row_to_file(row: &sqlx::sqlite::SqliteRow) -> Result<File> {
        Ok(File {
            id: parse_uuid(row.try_get::<String, _>("id")?)?,
            group_id: parse_uuid(row.try_get::<String, _>("group_id")?)?,
            original_filename: row.try_get("original_filename")?,
            stored_filename: row.try_get("stored_filename")?,
            description: row.try_get("description")?,
            size: row.try_get("size")?,
            uploaded_at: parse_time(row.try_get::<String, _>("uploaded_at")?)?,
            content_type: row.try_get("content_type")?,
        })
    }

    fn row_to_version(row: &sqlx::sqlite::SqliteRow) -> Result<FileVersion> {
        Ok(FileVersion {
            id: parse_uuid(row.try_get::<String, _>("id")?)?,
            file_id: parse_uuid(row.try_get::<String, _>("file_id")?)?,
            stored_filename: row.try_get("stored_filename")?,
            uploaded_at: parse_time(row.try_get::<String, _>("uploaded_at")?)?,
            uploader: row.try_get("uploader")?,
            comment: row.try_get("comment")?,
            size: row.try_get("size")?,
        })
    }
}

fn parse_uuid(s: String) -> Result<Uuid> {
    Uuid::parse_str(&s).map_err(|e| GroupBinError::Conflict(format!("corrupt uuid column: {e}")))
}

fn parse_time(s: String) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(&s, &time::format_description::well_known::Rfc3339)
        .map_err(|e| GroupBinError::Conflict(format!("corrupt timestamp column: {e}")))
}

fn fmt_time(t: OffsetDateTime) -> String {
    t.format(&time::format_description::well_known::Rfc3339)
        .expect("OffsetDateTime always formats as RFC3339")
}

#[async_trait::async_trait]
impl MetaStore for SqliteMetaStore {
    #[tracing::instrument(level = "debug", skip(self, new_group))]
    async fn create_group(&self, new_group: NewGroup, created_at: OffsetDateTime, expires_at: OffsetDateTime) -> Result<Group> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO groups (id, name, created_at, expires_at, created_duration_hours, password_hash, is_readonly, allow_convert_to_readonly, creator)
             VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&new_group.name)
        .bind(fmt_time(created_at))
        .bind(fmt_time(expires_at))
        .bind(new_group.duration_hours)
        .bind(&new_group.password_hash)
        .bind(new_group.allow_convert_to_readonly)
        .bind(&new_group.creator)
        .execute(&self.pool)
        .await?;

        Ok(Group {
            id,
            name: new_group.name,
            created_at,
            expires_at,
            created_duration_hours: new_group.duration_hours,
            password_hash: new_group.password_hash,
            is_readonly: false,
            allow_convert_to_readonly: new_group.allow_convert_to_readonly,
            creator: new_group.creator,
        })
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_group(&self, group_id: Uuid) -> Result<Option<Group>> {
        let row = sqlx::query("SELECT * FROM groups WHERE id = ?")
            .bind(group_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_group).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn set_group_expiry(&self, group_id: Uuid, expires_at: OffsetDateTime) -> Result<()> {
        let result = sqlx::query("UPDATE groups SET expires_at = ? WHERE id = ?")
            .bind(fmt_time(expires_at))
            .bind(group_id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(GroupBinError::NotFound);
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn try_convert_to_readonly(&self, group_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE groups SET is_readonly = 1
             WHERE id = ? AND allow_convert_to_readonly = 1 AND is_readonly = 0",
        )
        .bind(group_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(level = "debug", skip(self, file, version))]
    async fn insert_file_with_initial_version(&self, file: File, version: FileVersion) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO files (id, group_id, original_filename, stored_filename, description, size, uploaded_at, content_type)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(file.id.to_string())
        .bind(file.group_id.to_string())
        .bind(&file.original_filename)
        .bind(&file.stored_filename)
        .bind(&file.description)
        .bind(file.size)
        .bind(fmt_time(file.uploaded_at))
        .bind(&file.content_type)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO file_versions (id, file_id, stored_filename, uploaded_at, uploader, comment, size)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(version.id.to_string())
        .bind(version.file_id.to_string())
        .bind(&version.stored_filename)
        .bind(fmt_time(version.uploaded_at))
        .bind(&version.uploader)
        .bind(&version.comment)
        .bind(version.size)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, version))]
    async fn insert_version(&self, version: FileVersion) -> Result<()> {
        sqlx::query(
            "INSERT INTO file_versions (id, file_id, stored_filename, uploaded_at, uploader, comment, size)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(version.id.to_string())
        .bind(version.file_id.to_string())
        .bind(&version.stored_filename)
        .bind(fmt_time(version.uploaded_at))
        .bind(&version.uploader)
        .bind(&version.comment)
        .bind(version.size)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_file(&self, file_id: Uuid) -> Result<Option<File>> {
        let row = sqlx::query("SELECT * FROM files WHERE id = ?")
            .bind(file_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_file).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_files_for_group(&self, group_id: Uuid) -> Result<Vec<File>> {
        let rows = sqlx::query("SELECT * FROM files WHERE group_id = ? ORDER BY uploaded_at ASC")
            .bind(group_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_file).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_versions(&self, file_id: Uuid) -> Result<Vec<FileVersion>> {
        let rows = sqlx::query("SELECT * FROM file_versions WHERE file_id = ? ORDER BY uploaded_at DESC, id DESC")
            .bind(file_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_version).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_version(&self, version_id: Uuid) -> Result<Option<FileVersion>> {
        let row = sqlx::query("SELECT * FROM file_versions WHERE id = ?")
            .bind(version_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_version).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn latest_version(&self, file_id: Uuid) -> Result<Option<FileVersion>> {
        let row = sqlx::query("SELECT * FROM file_versions WHERE file_id = ? ORDER BY uploaded_at DESC, id DESC LIMIT 1")
            .bind(file_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_version).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_file(&self, file_id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(file_id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(GroupBinError::NotFound);
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn groups_expiring_before(&self, before: OffsetDateTime) -> Result<Vec<Group>> {
        let rows = sqlx::query("SELECT * FROM groups WHERE expires_at < ?")
            .bind(fmt_time(before))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_group).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn hard_delete_group(&self, group_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM groups WHERE id = ?")
            .bind(group_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn all_group_ids(&self) -> Result<HashSet<Uuid>> {
        let rows = sqlx::query("SELECT id FROM groups").fetch_all(&self.pool).await?;
        rows.iter().map(|r| parse_uuid(r.try_get::<String, _>("id")?)).collect()
    }

    #[tracing::instrument(level = "debug", skip(self, keep))]
    async fn delete_files_with_group_not_in(&self, keep: &HashSet<Uuid>) -> Result<u64> {
        let all_ids = sqlx::query("SELECT DISTINCT group_id FROM files").fetch_all(&self.pool).await?;
        let mut removed = 0u64;
        for row in all_ids {
            let group_id = parse_uuid(row.try_get::<String, _>("group_id")?)?;
            if keep.contains(&group_id) {
                continue;
            }
            let result = sqlx::query("DELETE FROM files WHERE group_id = ?")
                .bind(group_id.to_string())
                .execute(&self.pool)
                .await?;
            removed += result.rows_affected();
        }
        Ok(removed)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn all_file_ids(&self) -> Result<HashSet<Uuid>> {
        let rows = sqlx::query("SELECT id FROM files").fetch_all(&self.pool).await?;
        rows.iter().map(|r| parse_uuid(r.try_get::<String, _>("id")?)).collect()
    }

    #[tracing::instrument(level = "debug", skip(self, keep))]
    async fn delete_versions_with_file_not_in(&self, keep: &HashSet<Uuid>) -> Result<u64> {
        let all_ids = sqlx::query("SELECT DISTINCT file_id FROM file_versions").fetch_all(&self.pool).await?;
        let mut removed = 0u64;
        for row in all_ids {
            let file_id = parse_uuid(row.try_get::<String, _>("file_id")?)?;
            if keep.contains(&file_id) {
                continue;
            }
            let result = sqlx::query("DELETE FROM file_versions WHERE file_id = ?")
                .bind(file_id.to_string())
                .execute(&self.pool)
                .await?;
            removed += result.rows_affected();
        }
        Ok(removed)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn all_stored_filenames(&self) -> Result<HashSet<String>> {
        let mut names = HashSet::new();
        for row in sqlx::query("SELECT stored_filename FROM files").fetch_all(&self.pool).await? {
            names.insert(row.try_get::<String, _>("stored_filename")?);
        }
        for row in sqlx::query("SELECT stored_filename FROM file_versions").fetch_all(&self.pool).await? {
            names.insert(row.try_get::<String, _>("stored_filename")?);
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    async fn store() -> SqliteMetaStore {
        SqliteMetaStore::connect("sqlite::memory:").await.unwrap()
    }

    fn new_group() -> NewGroup {
        NewGroup {
            name: "demo".into(),
            duration_hours: 24,
            password_hash: None,
            allow_convert_to_readonly: true,
            creator: "alice".into(),
        }
    }

    fn sample_file_and_version(group_id: Uuid) -> (File, FileVersion) {
        let file_id = Uuid::new_v4();
        let file = File {
            id: file_id,
            group_id,
            original_filename: "a.txt".into(),
            stored_filename: "blob-1".into(),
            description: None,
            size: 10,
            uploaded_at: datetime!(2026-01-01 01:00:00 UTC),
            content_type: "text/plain".into(),
        };
        let version = FileVersion {
            id: Uuid::new_v4(),
            file_id,
            stored_filename: "blob-1".into(),
            uploaded_at: datetime!(2026-01-01 01:00:00 UTC),
            uploader: "alice".into(),
            comment: String::new(),
            size: 10,
        };
        (file, version)
    }

    #[tokio::test]
    async fn create_and_get_group_round_trips() {
        let store = store().await;
        let created = store
            .create_group(new_group(), datetime!(2026-01-01 00:00:00 UTC), datetime!(2026-01-02 00:00:00 UTC))
            .await
            .unwrap();

        let fetched = store.get_group(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "demo");
        assert!(!fetched.is_readonly);
        assert_eq!(fetched.creator, "alice");
    }

    #[tokio::test]
    async fn get_group_missing_returns_none() {
        let store = store().await;
        assert!(store.get_group(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn try_convert_to_readonly_is_a_one_way_gate() {
        let store = store().await;
        let group = store
            .create_group(new_group(), datetime!(2026-01-01 00:00:00 UTC), datetime!(2026-01-02 00:00:00 UTC))
            .await
            .unwrap();

        assert!(store.try_convert_to_readonly(group.id).await.unwrap());
        assert!(!store.try_convert_to_readonly(group.id).await.unwrap());

        let fetched = store.get_group(group.id).await.unwrap().unwrap();
        assert!(fetched.is_readonly);
    }

    #[tokio::test]
    async fn try_convert_to_readonly_respects_allow_flag() {
        let store = store().await;
        let mut ng = new_group();
        ng.allow_convert_to_readonly = false;
        let group = store
            .create_group(ng, datetime!(2026-01-01 00:00:00 UTC), datetime!(2026-01-02 00:00:00 UTC))
            .await
            .unwrap();

        assert!(!store.try_convert_to_readonly(group.id).await.unwrap());
    }

    #[tokio::test]
    async fn inserting_file_cascades_delete_to_versions() {
        let store = store().await;
        let group = store
            .create_group(new_group(), datetime!(2026-01-01 00:00:00 UTC), datetime!(2026-01-02 00:00:00 UTC))
            .await
            .unwrap();

        let (file, version) = sample_file_and_version(group.id);
        let file_id = file.id;
        store.insert_file_with_initial_version(file, version).await.unwrap();

        assert_eq!(store.list_versions(file_id).await.unwrap().len(), 1);
        store.delete_file(file_id).await.unwrap();
        assert!(store.list_versions(file_id).await.unwrap().is_empty());
        assert!(store.get_file(file_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hard_delete_group_cascades_to_files_and_versions() {
        let store = store().await;
        let group = store
            .create_group(new_group(), datetime!(2026-01-01 00:00:00 UTC), datetime!(2026-01-02 00:00:00 UTC))
            .await
            .unwrap();

        let (file, version) = sample_file_and_version(group.id);
        let file_id = file.id;
        store.insert_file_with_initial_version(file, version).await.unwrap();

        store.hard_delete_group(group.id).await.unwrap();
        assert!(store.get_group(group.id).await.unwrap().is_none());
        assert!(store.get_file(file_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn groups_expiring_before_filters_on_absolute_time() {
        let store = store().await;
        let expired = store
            .create_group(new_group(), datetime!(2026-01-01 00:00:00 UTC), datetime!(2026-01-02 00:00:00 UTC))
            .await
            .unwrap();
        let live = store
            .create_group(new_group(), datetime!(2026-01-01 00:00:00 UTC), datetime!(2026-02-01 00:00:00 UTC))
            .await
            .unwrap();

        let due = store.groups_expiring_before(datetime!(2026-01-15 00:00:00 UTC)).await.unwrap();
        let ids: HashSet<Uuid> = due.iter().map(|g| g.id).collect();
        assert!(ids.contains(&expired.id));
        assert!(!ids.contains(&live.id));
    }

    #[tokio::test]
    async fn delete_files_with_group_not_in_prunes_anything_outside_the_keep_set() {
        let store = store().await;
        let kept = store
            .create_group(new_group(), datetime!(2026-01-01 00:00:00 UTC), datetime!(2026-01-02 00:00:00 UTC))
            .await
            .unwrap();
        let to_drop = store
            .create_group(new_group(), datetime!(2026-01-01 00:00:00 UTC), datetime!(2026-01-02 00:00:00 UTC))
            .await
            .unwrap();

        let (file_a, version_a) = sample_file_and_version(kept.id);
        let (file_b, version_b) = sample_file_and_version(to_drop.id);
        store.insert_file_with_initial_version(file_a, version_a).await.unwrap();
        store.insert_file_with_initial_version(file_b.clone(), version_b).await.unwrap();

        let mut keep = HashSet::new();
        keep.insert(kept.id);
        let removed = store.delete_files_with_group_not_in(&keep).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_file(file_b.id).await.unwrap().is_none());
        assert_eq!(store.list_files_for_group(kept.id).await.unwrap().len(), 1);
    }
}
