//! Local filesystem storage.
//!
//! Lays out nars, narinfos, and chunks under independent
//! subdirectories of a single root, each sharded two levels deep by
//! the first characters of the content key.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::fs::{self, File};
use tokio::io::{self, AsyncRead};

use super::{ChunkStore, NarInfoStore, NarStore};
use crate::error::{ServerError, ServerResult};

#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    /// The directory to store all files under.
    pub path: PathBuf,
}

#[derive(Debug)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub async fn new(config: LocalStorageConfig) -> ServerResult<Self> {
        for sub in ["nar", "narinfo", "chunk"] {
            fs::create_dir_all(config.path.join(sub))
                .await
                .map_err(ServerError::storage_error)?;
        }

        Ok(Self { root: config.path })
    }

    fn sharded_path(&self, namespace: &str, key: &str) -> PathBuf {
        let level1 = &key[0..1.min(key.len())];
        let level2 = &key[0..2.min(key.len())];
        self.root.join(namespace).join(level1).join(level2).join(key)
    }

    async fn ensure_parent(&self, path: &Path) -> ServerResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(ServerError::storage_error)?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl NarStore for LocalStore {
    async fn has_nar(&self, key: &str) -> ServerResult<bool> {
        Ok(fs::metadata(self.sharded_path("nar", key)).await.is_ok())
    }

    async fn get_nar(
        &self,
        key: &str,
    ) -> ServerResult<(u64, Box<dyn AsyncRead + Unpin + Send>)> {
        let path = self.sharded_path("nar", key);
        let file = File::open(&path).await.map_err(ServerError::storage_error)?;
        let size = file
            .metadata()
            .await
            .map_err(ServerError::storage_error)?
            .len();

        Ok((size, Box::new(file)))
    }

    async fn put_nar(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> ServerResult<Option<u64>> {
        let path = self.sharded_path("nar", key);
        if fs::metadata(&path).await.is_ok() {
            return Ok(None);
        }

        self.ensure_parent(&path).await?;

        let tmp_path = path.with_extension("tmp");
        let mut file = File::create(&tmp_path)
            .await
            .map_err(ServerError::storage_error)?;

        let written = io::copy(reader, &mut file)
            .await
            .map_err(ServerError::storage_error)?;

        fs::rename(&tmp_path, &path)
            .await
            .map_err(ServerError::storage_error)?;

        Ok(Some(written))
    }

    async fn delete_nar(&self, key: &str) -> ServerResult<()> {
        match fs::remove_file(self.sharded_path("nar", key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServerError::storage_error(e)),
        }
    }
}

#[async_trait::async_trait]
impl NarInfoStore for LocalStore {
    async fn has_narinfo(&self, hash: &str) -> ServerResult<bool> {
        Ok(fs::metadata(self.sharded_path("narinfo", hash))
            .await
            .is_ok())
    }

    async fn get_narinfo(&self, hash: &str) -> ServerResult<Option<String>> {
        match fs::read_to_string(self.sharded_path("narinfo", hash)).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ServerError::storage_error(e)),
        }
    }

    async fn put_narinfo(&self, hash: &str, text: &str) -> ServerResult<()> {
        let path = self.sharded_path("narinfo", hash);
        self.ensure_parent(&path).await?;
        fs::write(&path, text)
            .await
            .map_err(ServerError::storage_error)
    }

    async fn delete_narinfo(&self, hash: &str) -> ServerResult<()> {
        match fs::remove_file(self.sharded_path("narinfo", hash)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServerError::storage_error(e)),
        }
    }
}

#[async_trait::async_trait]
impl ChunkStore for LocalStore {
    async fn put_chunk(&self, hash: &str, bytes: &[u8]) -> ServerResult<(bool, u64)> {
        let path = self.sharded_path("chunk", hash);
        if let Ok(metadata) = fs::metadata(&path).await {
            return Ok((true, metadata.len()));
        }

        self.ensure_parent(&path).await?;

        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, bytes)
            .await
            .map_err(ServerError::storage_error)?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(ServerError::storage_error)?;

        Ok((false, bytes.len() as u64))
    }

    async fn get_chunk(
        &self,
        hash: &str,
    ) -> ServerResult<Option<Box<dyn AsyncRead + Unpin + Send>>> {
        match File::open(self.sharded_path("chunk", hash)).await {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ServerError::storage_error(e)),
        }
    }

    async fn delete_chunk(&self, hash: &str) -> ServerResult<()> {
        match fs::remove_file(self.sharded_path("chunk", hash)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServerError::storage_error(e)),
        }
    }
}
