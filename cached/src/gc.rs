//! LRU eviction.
//!
//! Triggered by an external scheduler (the binary's `--mode gc-once`, or
//! a periodic internal timer); the core itself never schedules cron, it
//! only exposes "run LRU now". Guarded by a non-blocking `TryLock` on the
//! `"cache"` key so two instances never run eviction concurrently; a
//! losing instance simply skips this round.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::instrument;

use crate::database::entity::chunk::ChunkModel;
use crate::database::entity::nar_file::NarFileModel;
use crate::database::entity::narinfo::NarInfoModel;
use crate::database::{self, Querier};
use crate::error::ServerResult;
use crate::pipeline::Engine;

/// Upper bound on concurrent physical deletes during orphan reaping.
const DELETE_CONCURRENCY: usize = 20;

/// Runs LRU eviction once. A no-op if another instance already holds the
/// `"cache"` exclusive lock, or if total storage is within budget.
#[instrument(skip_all)]
pub async fn run_lru_eviction_once(engine: &Arc<Engine>) -> ServerResult<()> {
    let guard = match engine
        .cache_locker
        .try_lock("cache", engine.config.cache_lock_ttl)
        .await
    {
        Ok(Some(guard)) => guard,
        Ok(None) => {
            tracing::info!("LRU eviction already running on another instance, skipping");
            return Ok(());
        }
        Err(e) => {
            tracing::warn!("Failed to acquire the cache lock for LRU eviction: {}", e);
            return Ok(());
        }
    };

    let result = run_eviction_pass(engine).await;

    let _ = engine.cache_locker.unlock(guard).await;

    result
}

/// Runs LRU eviction on a fixed interval until the process exits. A
/// zero interval disables periodic eviction; callers still trigger a
/// manual pass via [`run_lru_eviction_once`].
pub async fn run_lru_eviction_periodically(engine: Arc<Engine>, interval: Duration) {
    if interval == Duration::ZERO {
        return;
    }

    loop {
        if let Err(e) = run_lru_eviction_once(&engine).await {
            tracing::warn!("LRU eviction failed: {}", e);
        }
        tokio::time::sleep(interval).await;
    }
}

#[instrument(skip_all)]
async fn run_eviction_pass(engine: &Arc<Engine>) -> ServerResult<()> {
    let max_size = engine.config.max_size as i64;
    let cdc_enabled = engine.config.cdc_enabled;

    // Victim selection, narinfo/nar_file/chunk deletion, and the
    // ref_count decrements that unblock the chunk cascade all happen in
    // one transaction, so a crash partway through never leaves a
    // narinfo gone but its nar_file's chunks still fully ref-counted.
    let outcome = database::with_retry(&engine.db, move |txn| async move {
        let total = database::total_size_conn(&txn).await?;
        if total <= max_size {
            tracing::debug!(total, max_size, "Storage within budget, nothing to evict");
            return Ok((txn, None));
        }

        tracing::info!(
            total,
            max_size,
            "Total storage exceeds budget, running eviction"
        );

        // 1+2. Select and delete narinfos whose cumulative nar_file size
        // covers the overflow, oldest last_accessed_at first.
        let victims: Vec<NarInfoModel> = database::get_least_used_narinfos_conn(&txn, max_size).await?;
        for narinfo in &victims {
            database::delete_narinfo_conn(&txn, narinfo.id).await?;
        }
        tracing::info!("Deleted {} narinfos", victims.len());

        // 3. Cascade to nar_files that are now orphaned (no referencing
        // narinfo left), decrementing their chunks' ref_count first so
        // the orphan-chunk scan below can see them.
        let orphan_nar_files: Vec<NarFileModel> = database::get_orphaned_nar_files_conn(&txn).await?;
        for nar_file in &orphan_nar_files {
            let chunk_ids = database::chunk_ids_for_nar_file_conn(&txn, nar_file.id).await?;
            database::decrement_chunk_refs_conn(&txn, &chunk_ids).await?;
            database::delete_nar_file_conn(&txn, nar_file.id).await?;
        }
        tracing::info!("Deleted {} orphan nar files", orphan_nar_files.len());

        // 4. Cascade further to chunks that are now orphaned, only if CDC
        // is in use at all (the chunk table is otherwise always empty).
        let orphan_chunks: Vec<ChunkModel> = if cdc_enabled {
            let chunks = database::get_orphaned_chunks_conn(&txn).await?;
            for chunk in &chunks {
                database::delete_chunk_conn(&txn, chunk.id).await?;
            }
            tracing::info!("Deleted {} orphan chunks", chunks.len());
            chunks
        } else {
            Vec::new()
        };

        Ok((txn, Some((orphan_nar_files, orphan_chunks))))
    })
    .await?;

    let Some((orphan_nar_files, orphan_chunks)) = outcome else {
        return Ok(());
    };

    // Physical deletes happen after the DB rows are committed, in
    // parallel, bounded by a semaphore. Failures here log but don't roll
    // back the DB: a stale DB-gone-but-file-present entry is reclaimed by
    // a later filesystem-level pass (out of scope for the core).
    delete_physical_nar_files(engine, &orphan_nar_files).await;
    delete_physical_chunks(engine, &orphan_chunks).await;

    Ok(())
}

async fn delete_physical_nar_files(engine: &Arc<Engine>, nar_files: &[NarFileModel]) {
    let permits = Arc::new(Semaphore::new(DELETE_CONCURRENCY));
    let futures = nar_files.iter().map(|nar_file| {
        let engine = engine.clone();
        let permits = permits.clone();
        let nar_file = nar_file.clone();
        async move {
            let Ok(permit) = permits.acquire_owned().await else {
                return;
            };

            // Whole-file nars are stored with their declared key; a
            // chunked (total_chunks > 0) row has no physical whole-file
            // blob of its own, only the chunk rows deleted separately.
            if nar_file.total_chunks == 0 {
                if let Err(e) = engine.nar_store.delete_nar(&nar_file.hash).await {
                    tracing::warn!("Failed to delete nar file {}: {}", nar_file.hash, e);
                }
            }
            drop(permit);
        }
    });
    join_all(futures).await;
}

async fn delete_physical_chunks(engine: &Arc<Engine>, chunks: &[ChunkModel]) {
    let permits = Arc::new(Semaphore::new(DELETE_CONCURRENCY));
    let futures = chunks.iter().map(|chunk| {
        let engine = engine.clone();
        let permits = permits.clone();
        let hash = chunk.hash.clone();
        async move {
            let Ok(permit) = permits.acquire_owned().await else {
                return;
            };
            if let Err(e) = engine.chunk_store.delete_chunk(&hash).await {
                tracing::warn!("Failed to delete chunk {}: {}", hash, e);
            }
            drop(permit);
        }
    });
    join_all(futures).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::migration::{Migrator, MigratorTrait};
    use crate::database::NewNarInfo;
    use sea_orm::{ActiveModelTrait, ActiveValue::Set, Database};

    async fn test_db() -> sea_orm::DatabaseConnection {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        db
    }

    async fn insert_narinfo(
        db: &sea_orm::DatabaseConnection,
        hash: &str,
        size: i64,
        last_accessed_secs_ago: i64,
    ) {
        let nar_file = db
            .upsert_nar_file(&format!("nar_{}", hash), "none", None, size)
            .await
            .unwrap();

        let model = db
            .upsert_narinfo(NewNarInfo {
                hash: hash.to_string(),
                store_path: format!("/nix/store/{}-test", hash),
                url: Some(format!("nar/nar_{}.nar", hash)),
                compression: "none".to_string(),
                file_hash: None,
                file_size: None,
                nar_hash: format!("sha256:nar_{}", hash),
                nar_size: size,
                references: Vec::new(),
                deriver: None,
                system: None,
                ca: None,
                signatures: Vec::new(),
            })
            .await
            .unwrap();

        db.link_narinfo_to_nar_file(model.id, nar_file.id)
            .await
            .unwrap();

        let touched_at = chrono::Utc::now() - chrono::Duration::seconds(last_accessed_secs_ago);
        crate::database::entity::narinfo::ActiveModel {
            id: Set(model.id),
            last_accessed_at: Set(Some(touched_at)),
            ..Default::default()
        }
        .update(db)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_least_used_narinfos_respects_lru_order() {
        let db = test_db().await;

        // a: 10 MiB, oldest. b: 40 MiB, next oldest. c: 150 MiB, newest.
        insert_narinfo(&db, "a", 10 * 1024 * 1024, 300).await;
        insert_narinfo(&db, "b", 40 * 1024 * 1024, 200).await;
        insert_narinfo(&db, "c", 150 * 1024 * 1024, 100).await;

        let total = db.total_size().await.unwrap();
        assert_eq!(total, 200 * 1024 * 1024);

        // A 150 MiB budget requires freeing 50 MiB, which only a and b
        // together cover.
        let victims = db
            .get_least_used_narinfos(150 * 1024 * 1024)
            .await
            .unwrap();
        assert_eq!(victims.len(), 2);
        assert_eq!(victims[0].hash, "a");
        assert_eq!(victims[1].hash, "b");
    }

    #[tokio::test]
    async fn test_deleting_narinfo_orphans_its_nar_file() {
        let db = test_db().await;

        insert_narinfo(&db, "solo", 1024, 0).await;
        let narinfo = db.get_narinfo("solo").await.unwrap().unwrap();
        let nar_file_id = narinfo.nar_file_id.unwrap();

        db.delete_narinfo(narinfo.id).await.unwrap();

        let orphans = db.get_orphaned_nar_files().await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, nar_file_id);
    }

    #[tokio::test]
    async fn test_eviction_decrements_chunk_refs_and_reaps_orphans() {
        let db = test_db().await;

        insert_narinfo(&db, "solo", 10 * 1024 * 1024, 0).await;
        let narinfo = db.get_narinfo("solo").await.unwrap().unwrap();
        let nar_file_id = narinfo.nar_file_id.unwrap();

        let chunk = db.upsert_chunk("chunk-a", 4096, 4096).await.unwrap();
        assert_eq!(chunk.ref_count, 1);
        db.link_chunks(nar_file_id, &[chunk.id], 0).await.unwrap();
        db.finalize_chunking(nar_file_id, 1, 10 * 1024 * 1024)
            .await
            .unwrap();

        db.delete_narinfo(narinfo.id).await.unwrap();

        let orphan_nar_files = db.get_orphaned_nar_files().await.unwrap();
        assert_eq!(orphan_nar_files.len(), 1);

        let chunk_ids = crate::database::chunk_ids_for_nar_file_conn(&db, nar_file_id)
            .await
            .unwrap();
        assert_eq!(chunk_ids, vec![chunk.id]);
        crate::database::decrement_chunk_refs_conn(&db, &chunk_ids)
            .await
            .unwrap();
        db.delete_nar_file(nar_file_id).await.unwrap();

        let orphan_chunks = db.get_orphaned_chunks().await.unwrap();
        assert_eq!(orphan_chunks.len(), 1);
        assert_eq!(orphan_chunks[0].id, chunk.id);
        assert_eq!(orphan_chunks[0].ref_count, 0);
    }
}
