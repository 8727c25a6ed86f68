//! The caching engine: narinfo/nar/chunk retrieval and storage, wired
//! together from the database, storage, locking, and upstream seams.
//!
//! Everything here is a plain function over [`Engine`] rather than a
//! method on some God object; the pipeline modules (`narinfo`, `nar`,
//! `cdc`) each own one slice of the request path.

pub mod cdc;
pub mod nar;
pub mod narinfo;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sea_orm::DatabaseConnection;

use crate::coordinator::Coordinator;
use crate::error::ServerResult;
use crate::locking::{Locker, RWLocker};
use crate::storage::{ChunkStore, NarInfoStore, NarStore};
use crate::upstream::Upstream;
use common::signing::NixKeypair;

/// Tuning knobs the pipeline needs that don't belong to any single
/// operation, kept independent of the top-level `Config` file format so
/// pipeline code has no dependency on how the CLI loads it.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// TTL of a download job's distributed lock lease.
    pub download_lock_ttl: Duration,

    /// TTL of the shared read lease taken on the `"cache"` key around
    /// every public read/write entry point, and of the exclusive lease
    /// the LRU evictor takes on the same key.
    pub cache_lock_ttl: Duration,

    /// How long a caller polls for another instance's in-flight
    /// download before giving up with [`crate::error::ServerError::PollTimeout`].
    pub download_poll_timeout: Duration,

    /// Whether content-defined chunking runs at all.
    pub cdc_enabled: bool,
    pub cdc_min_size: usize,
    pub cdc_avg_size: usize,
    pub cdc_max_size: usize,

    /// Total on-disk budget across all stored nars. The LRU evictor
    /// runs whenever `total_size()` exceeds this.
    pub max_size: u64,

    /// How stale a `chunking_started_at` claim must be before another
    /// worker may re-claim an apparently-abandoned chunking job.
    pub cdc_claim_stale_after: Duration,

    /// Skip `touch_narinfo` within this long of the last touch, so a
    /// hot path doesn't write on every single request.
    pub record_age_ignore_touch: Duration,

    /// Whether narinfos we serve get (re-)signed with our keypair.
    pub should_sign_narinfo: bool,

    /// Scratch directory backing the temp files that in-flight
    /// downloads stream into while other callers tail them (spec
    /// §4.2/§4.4).
    pub temp_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            download_lock_ttl: Duration::from_secs(300),
            cache_lock_ttl: Duration::from_secs(30),
            download_poll_timeout: Duration::from_secs(120),
            cdc_enabled: true,
            cdc_min_size: 16 * 1024,
            cdc_avg_size: 64 * 1024,
            cdc_max_size: 256 * 1024,
            max_size: 100 * 1024 * 1024 * 1024,
            cdc_claim_stale_after: Duration::from_secs(600),
            record_age_ignore_touch: Duration::from_secs(300),
            should_sign_narinfo: true,
            temp_dir: std::env::temp_dir().join("ncpsd"),
        }
    }
}

/// Shared engine state threaded through every pipeline operation.
///
/// Constructed once at startup and handed around as `Arc<Engine>` so
/// pipeline functions can spawn detached background work (migrations,
/// chunking, touches) that outlives the request that triggered it.
pub struct Engine {
    pub config: PipelineConfig,
    pub db: DatabaseConnection,
    pub nar_store: Arc<dyn NarStore>,
    pub legacy_narinfo_store: Arc<dyn NarInfoStore>,
    pub chunk_store: Arc<dyn ChunkStore>,
    pub upstream: Arc<dyn Upstream>,
    pub coordinator: Coordinator<dyn Locker>,
    pub keypair: Option<NixKeypair>,

    /// The reader/writer lock guarding the whole cache: every public
    /// entry point takes a shared read lease for its duration; the LRU
    /// evictor takes the exclusive lease.
    pub cache_locker: Arc<dyn RWLocker>,
}

/// Runs `f` while holding a shared read lease on the `"cache"` key,
/// releasing it regardless of how `f` completes.
///
/// This is the "under shared read lock on cache" wrapper every public
/// `GetNar`/`PutNar`/`GetNarInfo`/`PutNarInfo` entry point needs.
pub(crate) async fn with_cache_read_lock<F, Fut, T>(engine: &Arc<Engine>, f: F) -> ServerResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ServerResult<T>>,
{
    let guard = engine
        .cache_locker
        .rlock("cache", engine.config.cache_lock_ttl)
        .await
        .map_err(|e| crate::error::ServerError::LockUnavailable {
            key: "cache".to_string(),
            reason: lock_error_reason(&e),
        })?;

    let result = f().await;
    let _ = engine.cache_locker.runlock(guard).await;
    result
}

fn lock_error_reason(e: &crate::locking::Error) -> &'static str {
    match e {
        crate::locking::Error::Timeout { .. } => "timed out",
        crate::locking::Error::Unavailable { .. } => "held by another holder",
    }
}

/// Maps a [`crate::download_state::DownloadState`] error name back to a
/// [`crate::error::ServerError`]. The state only retains the name (a
/// `'static str`), not the original error, since `ServerError` isn't
/// `Clone`; `NotFound` is the only variant a caller needs to act on
/// differently, everything else collapses to `InternalError`.
pub(crate) fn error_from_name(name: &'static str) -> crate::error::ServerError {
    match name {
        "NotFound" => crate::error::ServerError::NotFound,
        _ => crate::error::ServerError::InternalError,
    }
}
