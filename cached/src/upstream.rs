//! The upstream-cache seam.
//!
//! The upstream client itself (HTTP fetcher, health checks, priority
//! ordering across multiple base URLs) is an external collaborator: only
//! its interface to the core is specified here. `StaticUpstream` is a
//! fixture used by pipeline tests, playing the same role `LocalLocker`
//! plays for `Locker` and `LocalStore` plays for `NarStore`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::sync::Mutex;

use crate::error::ServerResult;

/// A remote cache queried on miss.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Fetches the raw `.narinfo` text for a hash, if any upstream has it.
    async fn fetch_narinfo(&self, hash: &str) -> ServerResult<Option<String>>;

    /// Fetches a nar's bytes as a stream, if any upstream has it.
    async fn fetch_nar(&self, url: &str) -> ServerResult<Option<BoxStream<'static, ServerResult<Bytes>>>>;
}

/// An in-memory `Upstream` fixture keyed by narinfo hash / nar URL.
///
/// Exists for pipeline unit tests; not wired into the production binary,
/// which has no upstream-client implementation of its own (out of scope).
#[derive(Default)]
pub struct StaticUpstream {
    narinfos: Mutex<HashMap<String, String>>,
    nars: Mutex<HashMap<String, Bytes>>,
}

impl StaticUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert_narinfo(&self, hash: &str, text: &str) {
        self.narinfos
            .lock()
            .await
            .insert(hash.to_string(), text.to_string());
    }

    pub async fn insert_nar(&self, url: &str, bytes: Bytes) {
        self.nars.lock().await.insert(url.to_string(), bytes);
    }
}

#[async_trait]
impl Upstream for StaticUpstream {
    async fn fetch_narinfo(&self, hash: &str) -> ServerResult<Option<String>> {
        Ok(self.narinfos.lock().await.get(hash).cloned())
    }

    async fn fetch_nar(
        &self,
        url: &str,
    ) -> ServerResult<Option<BoxStream<'static, ServerResult<Bytes>>>> {
        let bytes = self.nars.lock().await.get(url).cloned();
        Ok(bytes.map(|b| {
            Box::pin(futures::stream::once(async move { Ok(b) }))
                as BoxStream<'static, ServerResult<Bytes>>
        }))
    }
}

/// An `Upstream` that never has anything, for running the engine with
/// no configured upstream cache (a pure local store front-end).
#[derive(Default)]
pub struct NullUpstream;

impl NullUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl Upstream for NullUpstream {
    async fn fetch_narinfo(&self, _hash: &str) -> ServerResult<Option<String>> {
        Ok(None)
    }

    async fn fetch_nar(
        &self,
        _url: &str,
    ) -> ServerResult<Option<BoxStream<'static, ServerResult<Bytes>>>> {
        Ok(None)
    }
}
