use time::OffsetDateTime;
use uuid::Uuid;

/// A time-boxed share bucket (spec §3). Mirrors `original_source/app/
/// models.py`'s `Group` SQLAlchemy model, translated into a plain struct:
/// behavior that the Python model attached as instance methods
/// (`is_expired`, `refresh_expiration`, `check_password`) lives on
/// [`crate::service::FileService`] instead, since it needs an explicit
/// clock and password hasher rather than ambient globals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub created_duration_hours: i64,
    pub password_hash: Option<String>,
    pub is_readonly: bool,
    pub allow_convert_to_readonly: bool,
    pub creator: String,
}

impl Group {
    /// `now() > expires_at`. Timestamps read back from sqlite are always
    /// constructed as UTC by the metadata store, so there is no
    /// naive-vs-aware distinction to resolve here (see DESIGN.md).
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }
}

/// A named artifact within a group (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub id: Uuid,
    pub group_id: Uuid,
    pub original_filename: String,
    pub stored_filename: String,
    pub description: Option<String>,
    pub size: i64,
    pub uploaded_at: OffsetDateTime,
    pub content_type: String,
}

/// One immutable revision of a [`File`] (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileVersion {
    pub id: Uuid,
    pub file_id: Uuid,
    pub stored_filename: String,
    pub uploaded_at: OffsetDateTime,
    pub uploader: String,
    pub comment: String,
    pub size: i64,
}

/// Fields needed to create a group, ahead of the row getting its id/
/// timestamps assigned by the metadata store.
#[derive(Debug, Clone)]
pub struct NewGroup {
    pub name: String,
    pub duration_hours: i64,
    pub password_hash: Option<String>,
    pub allow_convert_to_readonly: bool,
    pub creator: String,
}
