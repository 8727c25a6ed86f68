//! Blob storage.
//!
//! The physical bytes behind a nar, a narinfo, or a chunk are owned
//! exclusively by these stores; the database owns only metadata. Three
//! narrow traits mirror the external contract: callers never see a
//! storage-specific path or key, only content-addressed handles.

mod local;

use tokio::io::AsyncRead;

pub use local::{LocalStorageConfig, LocalStore};

use crate::error::ServerResult;

/// Stores whole or chunked nar bytes, addressed by the nar's
/// `(hash, compression, query)` identity already resolved to a single
/// storage key by the caller.
#[async_trait::async_trait]
pub trait NarStore: Send + Sync + std::fmt::Debug {
    /// Whether a nar with this key exists as a whole file.
    async fn has_nar(&self, key: &str) -> ServerResult<bool>;

    /// Opens a whole-file nar for reading, returning its size.
    async fn get_nar(
        &self,
        key: &str,
    ) -> ServerResult<(u64, Box<dyn AsyncRead + Unpin + Send>)>;

    /// Writes a whole-file nar, returning the number of bytes written.
    ///
    /// Returns `Ok(None)` if a nar under this key already exists.
    async fn put_nar(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> ServerResult<Option<u64>>;

    /// Deletes a whole-file nar. Idempotent: a missing file is not an
    /// error.
    async fn delete_nar(&self, key: &str) -> ServerResult<()>;
}

/// Stores narinfo text records in the legacy (pre-database) format.
///
/// Retained purely as a migration source: `pipeline::narinfo` checks
/// this store on a DB miss and migrates any hit into the database in
/// the background.
#[async_trait::async_trait]
pub trait NarInfoStore: Send + Sync + std::fmt::Debug {
    async fn has_narinfo(&self, hash: &str) -> ServerResult<bool>;
    async fn get_narinfo(&self, hash: &str) -> ServerResult<Option<String>>;
    async fn put_narinfo(&self, hash: &str, text: &str) -> ServerResult<()>;
    async fn delete_narinfo(&self, hash: &str) -> ServerResult<()>;
}

/// Stores content-addressed chunks.
#[async_trait::async_trait]
pub trait ChunkStore: Send + Sync + std::fmt::Debug {
    /// Writes a chunk's raw bytes, returning `(existed, compressed_size)`.
    ///
    /// Idempotent by content hash: writing the same hash twice is a
    /// cheap no-op that still reports the on-disk size.
    async fn put_chunk(&self, hash: &str, bytes: &[u8]) -> ServerResult<(bool, u64)>;

    /// Opens a chunk for reading. `None` if absent.
    async fn get_chunk(
        &self,
        hash: &str,
    ) -> ServerResult<Option<Box<dyn AsyncRead + Unpin + Send>>>;

    /// Deletes a chunk. Idempotent.
    async fn delete_chunk(&self, hash: &str) -> ServerResult<()>;
}
