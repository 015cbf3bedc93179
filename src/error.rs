use std::panic::Location;

use tracing::error;

/// Typed error taxonomy for the content-lifecycle core (spec §7).
///
/// Every variant maps to exactly one row of the propagation table: the
/// boundary layer (out of scope here) is responsible for turning these into
/// HTTP status codes and JSON bodies.
#[derive(Debug, thiserror::Error)]
pub enum GroupBinError {
    #[error("not found")]
    NotFound,

    #[error("group {group_id} is read-only")]
    ReadOnlyGroup { group_id: uuid::Uuid },

    #[error("upload of {size} bytes exceeds the configured limit of {max_size} bytes")]
    FileTooLarge { size: u64, max_size: u64 },

    #[error("chunk {chunk_number} size mismatch: declared {declared}, observed {observed}")]
    ChunkSizeMismatch {
        chunk_number: u32,
        declared: u64,
        observed: u64,
    },

    #[error("merge of upload {identifier} failed: merged file missing after merge")]
    MergeFailed { identifier: String },

    #[error("blob missing on disk at {path}")]
    BlobMissing { path: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("a move/rename operation did not become visible in time: {path}")]
    FileNotFoundError { path: String },
}

pub type Result<T> = std::result::Result<T, GroupBinError>;

/// Logs an error with its call-site location and a captured span trace,
/// mirroring how the teacher's error helper annotates every failure before
/// it is converted into a typed response.
#[inline]
#[track_caller]
pub fn log(source: &dyn std::error::Error) {
    let location = Location::caller();
    let span_trace = tracing_error::SpanTrace::capture();

    error!(
        target: "groupbin",
        %location,
        error = %source,
        "span trace:\n{span_trace}"
    );
}

/// Logs and passes through a `Result`'s error, the way the teacher's `try_!`
/// macro logs before converting to `S3Error`. Kept as a macro (not a
/// function) so `#[track_caller]` reports the call site, not this module.
macro_rules! logged {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(err) => {
                crate::error::log(&err);
                return Err(err.into());
            }
        }
    };
}

pub(crate) use logged;
