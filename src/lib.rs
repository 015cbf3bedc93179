//! Ephemeral, group-scoped file-sharing core: resumable chunked uploads, a
//! versioned file store bound to time-boxed groups, and the background
//! reclamation loop that expires groups and garbage-collects orphans.
//!
//! HTML rendering, the browser upload UI, authentication forms, CSRF,
//! session storage, CORS, and the thin HTTP handlers that forward to
//! [`FileService`] are out of scope here (spec §1) and live in a boundary
//! layer this crate does not provide.

pub mod error;

pub mod blob_store;
pub mod config;
pub mod meta_store;
pub mod models;
pub mod reclaim;
pub mod service;
pub mod time;
pub mod upload;
pub mod zip;

use std::sync::Arc;

pub use blob_store::{BlobStore, FsBlobStore};
pub use config::Settings;
pub use error::{GroupBinError, Result};
pub use meta_store::{MetaStore, SqliteMetaStore};
pub use reclaim::{ReclaimConfig, ReclaimLoop};
pub use service::FileService;
pub use time::{Clock, SystemClock};

/// Explicit application context: clock, configuration, metadata-store
/// handle, and blob-store handle, wired together the way the teacher's
/// `main.rs` builds a `RadosStore` from its `Settings`, generalized per
/// spec §9's "ambient framework globals → explicit context" guidance — no
/// global/ambient state lives anywhere in this crate.
#[derive(Debug, Clone)]
pub struct Context {
    pub settings: Settings,
    pub meta: Arc<dyn MetaStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub clock: Arc<dyn Clock>,
}

impl Context {
    pub async fn connect(settings: Settings) -> Result<Self> {
        let meta: Arc<dyn MetaStore> = Arc::new(SqliteMetaStore::connect(&settings.database_url).await?);
        let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(&settings.upload_folder));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Ok(Self { settings, meta, blobs, clock })
    }

    pub fn file_service(&self) -> FileService {
        FileService::new(
            self.meta.clone(),
            self.blobs.clone(),
            self.clock.clone(),
            self.settings.max_upload_size_bytes(),
            std::time::Duration::from_millis(self.settings.file_move_operation_max_wait_ms),
            self.settings.max_group_duration_hours,
        )
    }

    pub fn start_reclaim_loop(&self) -> ReclaimLoop {
        let config = ReclaimConfig {
            cycle_period: self.settings.clean_interval(),
            t_data: ::time::Duration::seconds_f64(self.settings.clean_interval_hour_delete_data * 3600.0),
            t_db: ::time::Duration::seconds_f64(self.settings.clean_interval_hour_delete_from_db * 3600.0),
            t_chunk_ttl: ::time::Duration::seconds_f64(self.settings.temp_file_expiration_hours * 3600.0),
            t_session_ttl: ::time::Duration::seconds_f64(self.settings.clean_interval_hour_delete_client_session * 3600.0),
            sessions_dir: std::path::PathBuf::from(&self.settings.data_dir).join("sessions"),
        };
        ReclaimLoop::start(self.meta.clone(), self.blobs.clone(), self.clock.clone(), config)
    }
}
