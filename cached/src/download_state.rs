//! Per-download coordination state.
//!
//! One `DownloadState` is shared by every local task waiting on a
//! single in-flight object (narinfo or nar). It has no network
//! identity of its own; the Coordinator is what keys it by job and
//! makes it reachable across instances via the distributed lock plus
//! polling on `has_asset`.
//!
//! The one-shot signals and the byte-progress condition variable are
//! modeled with `tokio::sync::Notify` rather than a native condvar,
//! per the allowed substitution for languages without one: a `Notify`
//! broadcasts to every waiter currently parked on it, and a `fired`
//! flag makes each signal idempotent so a waiter that arrives after
//! the fact doesn't block forever.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_stream::try_stream;
use bytes::Bytes;
use futures::stream::Stream;
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, Notify};

use crate::error::ServerError;
use crate::narinfo::Compression;

/// Largest slice read from the temp file per iteration of
/// [`tail_read_stream`], bounding memory use while still draining
/// large already-written ranges in one go.
const TAIL_READ_CHUNK: usize = 64 * 1024;

/// A one-shot signal that can be waited on any number of times after
/// it fires.
#[derive(Debug, Default)]
struct OneShot {
    fired: std::sync::atomic::AtomicBool,
    notify: Notify,
}

impl OneShot {
    fn fire(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    async fn wait(&self) {
        loop {
            if self.fired.load(Ordering::SeqCst) {
                return;
            }

            let notified = self.notify.notified();
            if self.fired.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct Inner {
    error: Option<ServerError>,
}

/// Shared state for one in-flight narinfo or nar download.
#[derive(Debug)]
pub struct DownloadState {
    /// Temp file exists and reads may begin.
    pub start: OneShotHandle,

    /// Asset is committed to its final location.
    pub stored: OneShotHandle,

    /// All post-processing (DB writes, CDC chunking) is complete.
    pub done: OneShotHandle,

    bytes_written: AtomicI64,
    final_size: AtomicI64,
    cond: Notify,

    inner: Mutex<Inner>,

    /// Path of the temp file backing this download.
    pub asset_path: Mutex<Option<PathBuf>>,

    /// The compression the bytes are actually stored with on disk.
    ///
    /// May differ from what the client asked for, per the design note
    /// that the latest teacher revision always records the actual
    /// on-disk compression rather than assuming it matches the
    /// requested URL's compression.
    pub temp_file_compression: Mutex<Option<Compression>>,

    reader_wg: AtomicUsize,
    cleanup_wg: AtomicUsize,
    cdc_wg: AtomicUsize,

    closed: std::sync::atomic::AtomicBool,
}

/// Thin wrapper so call sites read `state.start.fire()` /
/// `state.start.wait().await` instead of reaching into a private field.
#[derive(Debug, Default)]
pub struct OneShotHandle(OneShot);

impl OneShotHandle {
    pub fn fire(&self) {
        self.0.fire();
    }

    pub async fn wait(&self) {
        self.0.wait().await;
    }

    pub fn is_fired(&self) -> bool {
        self.0.is_fired()
    }
}

/// RAII registration in one of the download-state's wait-group
/// counters; decrements on drop, mirroring `NarGuard`/`ChunkGuard`'s
/// drop-based refcounting.
pub struct WaitGroupGuard {
    counter: &'static str,
    state: Arc<DownloadState>,
}

impl Drop for WaitGroupGuard {
    fn drop(&mut self) {
        let counter = match self.counter {
            "reader" => &self.state.reader_wg,
            "cleanup" => &self.state.cleanup_wg,
            "cdc" => &self.state.cdc_wg,
            _ => unreachable!(),
        };
        counter.fetch_sub(1, Ordering::SeqCst);
        self.state.cond.notify_waiters();
    }
}

impl DownloadState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start: OneShotHandle::default(),
            stored: OneShotHandle::default(),
            done: OneShotHandle::default(),
            bytes_written: AtomicI64::new(0),
            final_size: AtomicI64::new(0),
            cond: Notify::new(),
            inner: Mutex::new(Inner { error: None }),
            asset_path: Mutex::new(None),
            temp_file_compression: Mutex::new(None),
            reader_wg: AtomicUsize::new(0),
            cleanup_wg: AtomicUsize::new(1),
            cdc_wg: AtomicUsize::new(0),
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn bytes_written(&self) -> i64 {
        self.bytes_written.load(Ordering::SeqCst)
    }

    /// Appends `n` bytes to the running total and wakes anyone parked
    /// on the condition variable.
    pub fn advance(self: &Arc<Self>, n: i64) {
        self.bytes_written.fetch_add(n, Ordering::SeqCst);
        self.cond.notify_waiters();
    }

    pub fn final_size(&self) -> i64 {
        self.final_size.load(Ordering::SeqCst)
    }

    pub fn set_final_size(self: &Arc<Self>, size: i64) {
        self.final_size.store(size, Ordering::SeqCst);
        self.cond.notify_waiters();
    }

    pub async fn set_error(self: &Arc<Self>, error: ServerError) {
        let mut inner = self.inner.lock().await;
        if inner.error.is_none() {
            inner.error = Some(error);
        }
        drop(inner);
        self.cond.notify_waiters();
        self.start.fire();
        self.stored.fire();
        self.done.fire();
    }

    pub async fn error_name(&self) -> Option<&'static str> {
        self.inner.lock().await.error.as_ref().map(|e| e.name())
    }

    pub async fn has_error(&self) -> bool {
        self.inner.lock().await.error.is_some()
    }

    /// Waits until either more bytes have arrived, the final size has
    /// been set, or an error has been recorded — whichever the reader
    /// asks for by rechecking its own condition after this returns.
    ///
    /// Bounded by a short timeout as a safety net: `Notify::notify_waiters`
    /// only wakes tasks already parked in `.await` on a `Notified` future,
    /// so a writer that advances between our condition check and this
    /// call's first poll would otherwise wake no one. A real condvar
    /// doesn't have this gap (the check and the wait are atomic under the
    /// mutex); bounding the wait lets a missed wakeup self-heal on the
    /// next tick instead of stalling the reader.
    pub async fn wait_for_progress(self: &Arc<Self>) {
        let notified = self.cond.notified();
        let _ = tokio::time::timeout(std::time::Duration::from_millis(50), notified).await;
    }

    pub fn register_reader(self: &Arc<Self>) -> WaitGroupGuard {
        self.reader_wg.fetch_add(1, Ordering::SeqCst);
        WaitGroupGuard {
            counter: "reader",
            state: self.clone(),
        }
    }

    pub fn register_cdc(self: &Arc<Self>) -> WaitGroupGuard {
        self.cdc_wg.fetch_add(1, Ordering::SeqCst);
        WaitGroupGuard {
            counter: "cdc",
            state: self.clone(),
        }
    }

    /// The initial writer registration; call its returned guard's
    /// `drop` when the downloader finishes writing.
    pub fn writer_guard(self: &Arc<Self>) -> WaitGroupGuard {
        WaitGroupGuard {
            counter: "cleanup",
            state: self.clone(),
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether it is safe to unlink the temp file: closed, and no
    /// readers or CDC chunkers still touching it.
    pub fn reclaimable(&self) -> bool {
        self.is_closed()
            && self.reader_wg.load(Ordering::SeqCst) == 0
            && self.cdc_wg.load(Ordering::SeqCst) == 0
            && self.cleanup_wg.load(Ordering::SeqCst) == 0
    }
}

/// Tails the temp file backing an in-flight download, yielding bytes as
/// the downloader writes them: waits on `state`'s condvar while caught
/// up with `bytes_written` and no terminal condition has been reached,
/// then copies the newly available range.
///
/// Registers itself in `reader_wg` for its whole lifetime so the temp
/// file outlives every reader tailing it; exits only once `stored` has
/// fired and every written byte has been sent, or on error.
pub fn tail_read_stream(
    state: Arc<DownloadState>,
    path: PathBuf,
) -> impl Stream<Item = io::Result<Bytes>> {
    try_stream! {
        let _reader_guard = state.register_reader();
        let mut file = tokio::fs::File::open(&path).await?;
        let mut sent: i64 = 0;

        loop {
            let written = state.bytes_written();

            if sent >= written {
                let final_size = state.final_size();
                if state.stored.is_fired() && final_size > 0 && sent >= final_size {
                    break;
                }

                if let Some(name) = state.error_name().await {
                    Err(io::Error::new(io::ErrorKind::Other, name))?;
                }

                state.wait_for_progress().await;
                continue;
            }

            let want = ((written - sent) as usize).min(TAIL_READ_CHUNK);
            let mut buf = vec![0u8; want];
            file.read_exact(&mut buf).await?;
            sent += want as i64;
            yield Bytes::from(buf);
        }
    }
}
