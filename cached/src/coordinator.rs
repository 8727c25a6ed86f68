//! Single-flight job coordination, local and cross-instance.
//!
//! The unit of coordination is a whole download rather than a row lock:
//! `Coordinator::run` either joins an in-flight local job, polls while
//! another instance holds the distributed lock, or becomes the job
//! itself and spawns its body in the background.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use crate::download_state::DownloadState;
use crate::error::{ServerError, ServerResult};
use crate::locking::Locker;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Cooperative cancellation signal. A caller's `CoordContext` firing
/// abandons the wait without touching the background job; a `JobContext`
/// is typically detached from the caller so the download survives it
/// disconnecting.
#[derive(Debug, Default, Clone)]
pub struct CancelToken(Arc<CancelInner>);

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves immediately if already cancelled, otherwise waits.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.0.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Which signal a caller should wait on before returning: narinfo jobs
/// wait for `stored` (matching the lock release policy below), nar jobs
/// only need `start` to begin streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitFor {
    Start,
    Stored,
}

type JobsTable = Arc<Mutex<HashMap<String, Arc<DownloadState>>>>;

/// Owns the local single-flight job table and the distributed locker used
/// to coordinate across instances.
pub struct Coordinator<L: Locker + ?Sized> {
    locker: Arc<L>,
    jobs: JobsTable,
}

impl<L: Locker + ?Sized> Clone for Coordinator<L> {
    fn clone(&self) -> Self {
        Self {
            locker: self.locker.clone(),
            jobs: self.jobs.clone(),
        }
    }
}

impl<L: Locker + ?Sized + 'static> Coordinator<L> {
    pub fn new(locker: Arc<L>) -> Self {
        Self {
            locker,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs the single-flight protocol for `job_key`.
    ///
    /// `has_asset` is re-checked after every lock-related wait, to avoid a
    /// redundant download when another instance just finished. `start_job`
    /// is spawned as the background body when this call becomes the job
    /// owner; it is responsible for firing `ds.start`/`ds.stored`/`ds.done`
    /// (or `ds.set_error`) as it progresses.
    pub async fn run<H, HFut, S, SFut>(
        &self,
        job_key: &str,
        download_ttl: Duration,
        poll_timeout: Duration,
        wait_for: WaitFor,
        coord_ctx: &CancelToken,
        has_asset: H,
        start_job: S,
    ) -> ServerResult<Arc<DownloadState>>
    where
        H: Fn() -> HFut,
        HFut: Future<Output = ServerResult<bool>>,
        S: FnOnce(Arc<DownloadState>) -> SFut + Send + 'static,
        SFut: Future<Output = ()> + Send + 'static,
    {
        // 1. Local fast path.
        let existing = {
            let jobs = self.jobs.lock().await;
            jobs.get(job_key).cloned()
        };
        if let Some(existing) = existing {
            Self::wait_for_signal(&existing, wait_for, coord_ctx).await;
            return Ok(existing);
        }

        // 2. Acquire the distributed lock, falling back to polling.
        let lock_key = format!("download:{}", job_key);
        let guard = match self.locker.try_lock(&lock_key, download_ttl).await {
            Ok(Some(guard)) => guard,
            Ok(None) | Err(_) => {
                return self
                    .poll_for_asset(job_key, poll_timeout, coord_ctx, &has_asset)
                    .await;
            }
        };

        // 3. Re-check under lock: another instance may have just finished.
        if has_asset().await? {
            let _ = self.locker.unlock(guard).await;
            return Ok(DownloadState::completed());
        }

        // 4. Become the job. Double-check the local map: another local
        // caller may have raced us between steps 1 and here.
        let ds = {
            let mut jobs = self.jobs.lock().await;
            if let Some(existing) = jobs.get(job_key) {
                let _ = self.locker.unlock(guard).await;
                return Ok(existing.clone());
            }
            let ds = DownloadState::new();
            jobs.insert(job_key.to_string(), ds.clone());
            ds
        };

        let jobs_table = self.jobs.clone();
        let job_key_owned = job_key.to_string();
        let ds_for_job = ds.clone();
        tokio::spawn(async move {
            start_job(ds_for_job).await;
            jobs_table.lock().await.remove(&job_key_owned);
        });

        match wait_for {
            WaitFor::Stored => {
                // Narinfo jobs: unlock only after storage completes.
                Self::wait_for_signal(&ds, WaitFor::Stored, coord_ctx).await;
                let _ = self.locker.unlock(guard).await;
            }
            WaitFor::Start => {
                // Nar jobs: release the lock in the background once
                // `stored` or `done` fires, so the caller can start
                // streaming as soon as `start` fires without waiting on
                // the distributed lock release.
                let locker = self.locker.clone();
                let stored = ds.clone();
                let done = ds.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = stored.stored.wait() => {}
                        _ = done.done.wait() => {}
                    }
                    let _ = locker.unlock(guard).await;
                });

                Self::wait_for_signal(&ds, WaitFor::Start, coord_ctx).await;
            }
        }

        Ok(ds)
    }

    /// Waits for the signal a caller of `wait_for`'s kind needs, also
    /// resolving early if the job finishes first (`done`) or the caller's
    /// own context is cancelled — so a joiner never blocks past the job's
    /// lifetime or past its own interest in the result.
    async fn wait_for_signal(ds: &Arc<DownloadState>, wait_for: WaitFor, coord_ctx: &CancelToken) {
        let primary = async {
            match wait_for {
                WaitFor::Start => ds.start.wait().await,
                WaitFor::Stored => ds.stored.wait().await,
            }
        };
        tokio::select! {
            _ = primary => {}
            _ = ds.done.wait() => {}
            _ = coord_ctx.cancelled() => {}
        }
    }

    async fn poll_for_asset<H, HFut>(
        &self,
        job_key: &str,
        poll_timeout: Duration,
        coord_ctx: &CancelToken,
        has_asset: &H,
    ) -> ServerResult<Arc<DownloadState>>
    where
        H: Fn() -> HFut,
        HFut: Future<Output = ServerResult<bool>>,
    {
        let deadline = tokio::time::Instant::now() + poll_timeout;

        loop {
            if has_asset().await? {
                return Ok(DownloadState::completed());
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ServerError::PollTimeout {
                    key: job_key.to_string(),
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = coord_ctx.cancelled() => {
                    return Err(ServerError::PollTimeout {
                        key: job_key.to_string(),
                    });
                }
            }
        }
    }
}

impl DownloadState {
    /// A state that is already fully resolved: used when the Coordinator
    /// discovers the asset is already present and no job needs to run.
    fn completed() -> Arc<Self> {
        let ds = DownloadState::new();
        ds.start.fire();
        ds.stored.fire();
        ds.done.fire();
        ds.close();
        ds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::LocalLocker;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_single_flight_locality() {
        let locker = LocalLocker::new();
        let coordinator = Arc::new(Coordinator::new(locker));
        let start_count = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            let start_count = start_count.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .run(
                        "nar:abc",
                        Duration::from_secs(5),
                        Duration::from_secs(5),
                        WaitFor::Start,
                        &CancelToken::new(),
                        || async { Ok(false) },
                        move |ds| {
                            let start_count = start_count.clone();
                            async move {
                                start_count.fetch_add(1, Ordering::SeqCst);
                                ds.start.fire();
                                ds.stored.fire();
                                ds.done.fire();
                            }
                        },
                    )
                    .await
                    .unwrap()
            }));
        }

        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(1, start_count.load(Ordering::SeqCst));
    }

    /// Cancelling one caller's `coord_ctx` mid-download must not affect
    /// the background job: a second caller joining the same job_key
    /// afterwards still observes the full run to completion.
    #[tokio::test]
    async fn test_cancelling_a_caller_does_not_kill_the_job() {
        let locker = LocalLocker::new();
        let coordinator = Arc::new(Coordinator::new(locker));
        let finished = Arc::new(AtomicUsize::new(0));

        let first_ctx = CancelToken::new();
        let coordinator1 = coordinator.clone();
        let finished1 = finished.clone();
        let first = tokio::spawn(async move {
            coordinator1
                .run(
                    "nar:cancel-me",
                    Duration::from_secs(5),
                    Duration::from_secs(5),
                    WaitFor::Start,
                    &first_ctx,
                    || async { Ok(false) },
                    move |ds| {
                        let finished1 = finished1.clone();
                        async move {
                            ds.start.fire();
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            finished1.fetch_add(1, Ordering::SeqCst);
                            ds.stored.fire();
                            ds.done.fire();
                        }
                    },
                )
                .await
                .unwrap()
        });

        // Give the job time to start, then simulate the first caller's
        // request context going away (e.g. a disconnected client). The job
        // itself is still running (it sleeps 100ms before finishing).
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second_ctx = CancelToken::new();
        second_ctx.cancel();

        // Joins the still in-flight job via the local fast path, even
        // though this caller's own context is already cancelled.
        let ds2 = coordinator
            .run(
                "nar:cancel-me",
                Duration::from_secs(5),
                Duration::from_secs(5),
                WaitFor::Start,
                &second_ctx,
                || async { Ok(false) },
                |_ds| async {},
            )
            .await
            .unwrap();

        let ds1 = first.await.unwrap();

        ds2.done.wait().await;
        assert_eq!(1, finished.load(Ordering::SeqCst));
        assert!(ds1.stored.is_fired());
        assert!(ds2.stored.is_fired());
        assert!(Arc::ptr_eq(&ds1, &ds2));
    }
}
