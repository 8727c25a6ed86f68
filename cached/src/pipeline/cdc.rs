//! Content-defined chunking: splits a whole-file nar into
//! deduplicated, content-addressed chunks in the background (spec
//! §4.7).
//!
//! A `nar_file` row is claimed via `chunking_started_at` before work
//! starts, so two instances racing to chunk the same file don't both
//! do the work; a stale claim (the claimer crashed) is reclaimable
//! after [`super::PipelineConfig::cdc_claim_stale_after`].

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, BufReader};
use tokio::time::Instant;

use super::Engine;
use crate::database::entity::chunk::ChunkModel;
use crate::database::{self, ClaimOutcome, Querier};
use crate::decompression::StreamingDecompressor;
use crate::error::{ServerError, ServerResult};
use common::chunking::chunk_stream;
use common::hash::Hash;
use common::stream::StreamHasher;

/// First batch of chunks is flushed quickly so a progressive reader
/// doesn't wait long for the very first link; later batches trade a
/// little latency for fewer round trips.
const FIRST_BATCH_DEADLINE: Duration = Duration::from_millis(100);
const BATCH_DEADLINE: Duration = Duration::from_millis(500);
const BATCH_CAP: usize = 100;

/// Chunks `nar_file_id` if it isn't already chunked and no one else is
/// currently chunking it. A no-op if either is true.
pub async fn ensure_chunked(engine: &Arc<Engine>, nar_file_id: i64) -> ServerResult<()> {
    let nar_file = engine
        .db
        .get_nar_file(nar_file_id)
        .await?
        .ok_or(ServerError::NotFound)?;

    if nar_file.total_chunks > 0 {
        return Ok(());
    }

    let stale_chunks = match engine
        .db
        .claim_chunking(nar_file_id, engine.config.cdc_claim_stale_after)
        .await?
    {
        ClaimOutcome::NotClaimed => return Ok(()),
        ClaimOutcome::Fresh => Vec::new(),
        ClaimOutcome::Reclaimed(chunks) => chunks,
    };

    // A previous attempt at this file crashed mid-chunking; its partial
    // links are already gone and their chunks' ref_count already
    // decremented (both done atomically by `claim_chunking`). Anything
    // that dropped to zero here and isn't shared with a completed NAR
    // elsewhere is reaped now, before starting over from index 0.
    cleanup_stale_chunks(engine, stale_chunks).await;

    let (_, reader) = engine.nar_store.get_nar(&nar_file.hash).await?;
    let reader: Box<dyn AsyncRead + Unpin + Send> = if nar_file.compression == "none" {
        reader
    } else {
        Box::new(StreamingDecompressor::new_unbuffered(
            reader,
            &nar_file.compression,
        )?)
    };

    let (hashed, nar_hash_cell) = StreamHasher::new(reader, Sha256::new());
    let mut chunks = Box::pin(chunk_stream(
        hashed,
        engine.config.cdc_min_size,
        engine.config.cdc_avg_size,
        engine.config.cdc_max_size,
    ));

    // Chunks are linked under the original `nar_file_id` as each batch is
    // committed, so a reader tailing this nar sees one as soon as it's
    // written rather than only once chunking finishes. The physical write
    // happens immediately per chunk (content-addressed and idempotent, so
    // redoing it after a crash is harmless); the DB upsert is deferred into
    // the same transaction as the batch's links, so a crash never leaves a
    // chunk counted but unlinked.
    // The full id list is still kept around for the compression-mismatch
    // path below, where the final identity differs from `nar_file_id`.
    let mut chunk_ids = Vec::new();
    let mut pending: Vec<(String, i64, i64)> = Vec::new();
    let mut next_index: i32 = 0;
    let mut deadline = Instant::now() + FIRST_BATCH_DEADLINE;

    loop {
        tokio::select! {
            biased;

            next = chunks.next() => {
                let Some(chunk) = next else {
                    if !pending.is_empty() {
                        let ids = flush_batch(engine, nar_file_id, next_index, &mut pending).await?;
                        next_index += ids.len() as i32;
                        chunk_ids.extend(ids);
                    }
                    break;
                };

                let bytes = chunk.map_err(ServerError::storage_error)?;
                let hash = Hash::sha256_from_bytes(&bytes).to_typed_base16();

                let (_, compressed_size) = engine.chunk_store.put_chunk(&hash, &bytes).await?;
                pending.push((hash, bytes.len() as i64, compressed_size as i64));

                if pending.len() >= BATCH_CAP {
                    let ids = flush_batch(engine, nar_file_id, next_index, &mut pending).await?;
                    next_index += ids.len() as i32;
                    chunk_ids.extend(ids);
                    deadline = Instant::now() + BATCH_DEADLINE;
                }
            }

            _ = tokio::time::sleep_until(deadline), if !pending.is_empty() => {
                let ids = flush_batch(engine, nar_file_id, next_index, &mut pending).await?;
                next_index += ids.len() as i32;
                chunk_ids.extend(ids);
                deadline = Instant::now() + BATCH_DEADLINE;
            }
        }
    }

    let (nar_digest, total_size) = nar_hash_cell
        .get()
        .cloned()
        .ok_or(ServerError::InternalError)?;
    let nar_hash = Hash::Sha256(
        nar_digest
            .as_slice()
            .try_into()
            .map_err(|_| ServerError::InternalError)?,
    )
    .to_typed_base16();

    let canonical = engine
        .db
        .upsert_nar_file(&nar_hash, "none", None, total_size as i64)
        .await?;

    if canonical.id == nar_file_id {
        // Common case: no compression mismatch. Every chunk was already
        // linked progressively under this same id as it was produced,
        // so there's nothing left to link, only to finalize.
        engine
            .db
            .finalize_chunking(nar_file_id, chunk_ids.len() as i32, total_size as i64)
            .await?;
    } else {
        let claim = if canonical.total_chunks == 0 {
            Some(
                engine
                    .db
                    .claim_chunking(canonical.id, engine.config.cdc_claim_stale_after)
                    .await?,
            )
        } else {
            None
        };

        match claim {
            Some(ClaimOutcome::Fresh) => {
                // The canonical (post-normalization) identity differs
                // from the row we were chunking under. Re-link the whole
                // list under the canonical id; `normalize_compression`
                // then deletes the old `nar_file_id` row, cascading away
                // the partial progressive links we made under it above.
                link_and_finalize(engine, canonical.id, &chunk_ids, total_size as i64).await?;
                engine.db.normalize_compression(nar_file_id, canonical.id).await?;
            }
            Some(ClaimOutcome::Reclaimed(stale)) => {
                cleanup_stale_chunks(engine, stale).await;
                link_and_finalize(engine, canonical.id, &chunk_ids, total_size as i64).await?;
                engine.db.normalize_compression(nar_file_id, canonical.id).await?;
            }
            Some(ClaimOutcome::NotClaimed) | None => {
                // Another instance already chunked the canonical identity
                // first; our chunk writes were harmless (ref-counted,
                // content-addressed) but unused here.
                engine.db.normalize_compression(nar_file_id, canonical.id).await?;
            }
        }
    }

    Ok(())
}

/// Upserts and links one batch of chunks atomically, returning their ids
/// in production order. A crash partway through leaves neither the
/// upserts nor the links committed, so nothing is ever counted but
/// unlinked (spec §4.7 step 5).
async fn flush_batch(
    engine: &Arc<Engine>,
    nar_file_id: i64,
    start_index: i32,
    pending: &mut Vec<(String, i64, i64)>,
) -> ServerResult<Vec<i64>> {
    let batch = std::mem::take(pending);
    database::with_retry(&engine.db, move |txn| {
        let batch = batch.clone();
        async move {
            let mut ids = Vec::with_capacity(batch.len());
            for (hash, size, compressed_size) in &batch {
                let chunk = database::upsert_chunk_conn(&txn, hash, *size, *compressed_size).await?;
                ids.push(chunk.id);
            }
            database::link_chunks_conn(&txn, nar_file_id, &ids, start_index).await?;
            Ok((txn, ids))
        }
    })
    .await
}

/// Re-links the whole chunk list under a (new) canonical nar_file and
/// finalizes it, both in one transaction (spec §4.7 step 6).
async fn link_and_finalize(
    engine: &Arc<Engine>,
    nar_file_id: i64,
    chunk_ids: &[i64],
    total_size: i64,
) -> ServerResult<()> {
    let chunk_ids = chunk_ids.to_vec();
    let total_chunks = chunk_ids.len() as i32;
    database::with_retry(&engine.db, move |txn| {
        let chunk_ids = chunk_ids.clone();
        async move {
            database::link_chunks_conn(&txn, nar_file_id, &chunk_ids, 0).await?;
            database::finalize_chunking_conn(&txn, nar_file_id, total_chunks, total_size).await?;
            Ok((txn, ()))
        }
    })
    .await
}

/// Physically removes chunks left behind by a crashed chunking attempt
/// that are no longer referenced by anything; skips any whose ref_count
/// is still positive (shared with a NAR that finished elsewhere).
async fn cleanup_stale_chunks(engine: &Arc<Engine>, chunks: Vec<ChunkModel>) {
    for chunk in chunks {
        if chunk.ref_count > 0 {
            continue;
        }
        if let Err(e) = engine.chunk_store.delete_chunk(&chunk.hash).await {
            tracing::warn!("failed to delete stale chunk {}: {}", chunk.hash, e);
        }
        if let Err(e) = engine.db.delete_chunk(chunk.id).await {
            tracing::warn!("failed to delete stale chunk row {}: {}", chunk.id, e);
        }
    }
}

// `BufReader` is only named to keep `StreamingDecompressor::new_unbuffered`'s
// associated type readable in rustdoc; it's otherwise inferred.
#[allow(dead_code)]
type _KeepBufReaderImport<T> = BufReader<T>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::migration::{Migrator, MigratorTrait};
    use crate::database::NewNarInfo;
    use crate::locking::LocalLocker;
    use crate::pipeline::PipelineConfig;
    use crate::storage::{LocalStorageConfig, LocalStore};
    use crate::upstream::NullUpstream;
    use sea_orm::Database;
    use tokio::io::AsyncReadExt as _;

    async fn test_engine(min: usize, avg: usize, max: usize) -> (Arc<Engine>, tempfile::TempDir) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            LocalStore::new(LocalStorageConfig {
                path: dir.path().join("store"),
            })
            .await
            .unwrap(),
        );
        let locker = LocalLocker::new();

        let engine = Arc::new(Engine {
            config: PipelineConfig {
                cdc_min_size: min,
                cdc_avg_size: avg,
                cdc_max_size: max,
                ..Default::default()
            },
            db,
            nar_store: store.clone(),
            legacy_narinfo_store: store.clone(),
            chunk_store: store,
            upstream: NullUpstream::new(),
            coordinator: crate::coordinator::Coordinator::new(locker.clone() as Arc<dyn crate::locking::Locker>),
            keypair: None,
            cache_locker: locker,
        });

        (engine, dir)
    }

    fn pseudo_random_bytes(len: usize, seed: u32) -> Vec<u8> {
        let mut x = seed;
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            x = x.wrapping_mul(1103515245).wrapping_add(12345);
            out.push((x >> 16) as u8);
        }
        out
    }

    #[tokio::test]
    async fn test_ensure_chunked_splits_and_links_in_order() {
        let (engine, _dir) = test_engine(64, 256, 1024).await;

        let body = pseudo_random_bytes(20_000, 12345);
        // Stored uncompressed, so the content hash CDC computes while
        // chunking is the same identity the row was created under: this
        // exercises the common (no compression mismatch) path, where
        // chunking finalizes in place instead of moving to a new row.
        let hash = Hash::sha256_from_bytes(&body).to_typed_base16();

        let mut reader: &[u8] = &body;
        engine.nar_store.put_nar(&hash, &mut reader).await.unwrap().unwrap();

        let nar_file = engine
            .db
            .upsert_nar_file(&hash, "none", None, body.len() as i64)
            .await
            .unwrap();

        ensure_chunked(&engine, nar_file.id).await.unwrap();

        let refreshed = engine.db.get_nar_file(nar_file.id).await.unwrap().unwrap();
        assert!(refreshed.total_chunks > 1);
        assert_eq!(refreshed.file_size, body.len() as i64);

        let chunks = engine.db.get_chunk_list(nar_file.id).await.unwrap();
        assert_eq!(chunks.len() as i32, refreshed.total_chunks);

        let mut reassembled = Vec::new();
        for chunk in &chunks {
            let mut reader = engine.chunk_store.get_chunk(&chunk.hash).await.unwrap().unwrap();
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await.unwrap();
            reassembled.extend(buf);
        }
        assert_eq!(reassembled, body);

        let first = engine
            .db
            .get_chunk_at_index(nar_file.id, 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.hash, chunks[0].hash);
    }

    #[tokio::test]
    async fn test_ensure_chunked_reidentifies_a_mislabeled_nar_file_and_relinks_narinfo() {
        // A nar_file row claiming a hash that doesn't match its actual
        // content: chunking discovers the real identity, moves the
        // chunks under the canonical row, and narinfo rows pointing at
        // the stale row follow along.
        let (engine, _dir) = test_engine(64, 256, 1024).await;

        let body = pseudo_random_bytes(4_000, 999);
        let claimed_hash = "sha256:0000000000000000000000000000000000000000000000";

        let mut reader: &[u8] = &body;
        engine.nar_store.put_nar(claimed_hash, &mut reader).await.unwrap().unwrap();

        let stale_nar_file = engine
            .db
            .upsert_nar_file(claimed_hash, "none", None, body.len() as i64)
            .await
            .unwrap();

        let narinfo = engine
            .db
            .upsert_narinfo(NewNarInfo {
                hash: "h1".to_string(),
                store_path: "/nix/store/xxx-pkg".to_string(),
                url: Some("nar/xxx.nar".to_string()),
                compression: "none".to_string(),
                file_hash: None,
                file_size: None,
                nar_hash: claimed_hash.to_string(),
                nar_size: body.len() as i64,
                references: Vec::new(),
                deriver: None,
                system: None,
                ca: None,
                signatures: Vec::new(),
            })
            .await
            .unwrap();
        engine
            .db
            .link_narinfo_to_nar_file(narinfo.id, stale_nar_file.id)
            .await
            .unwrap();

        ensure_chunked(&engine, stale_nar_file.id).await.unwrap();

        // The stale row is gone; chunks now live under the content's real
        // identity.
        assert!(engine.db.get_nar_file(stale_nar_file.id).await.unwrap().is_none());

        let refreshed_narinfo = engine.db.get_narinfo("h1").await.unwrap().unwrap();
        let canonical_id = refreshed_narinfo
            .nar_file_id
            .expect("narinfo should still be linked to a nar_file");
        assert_ne!(canonical_id, stale_nar_file.id);

        let canonical = engine.db.get_nar_file(canonical_id).await.unwrap().unwrap();
        assert!(canonical.total_chunks > 0);

        let chunks = engine.db.get_chunk_list(canonical_id).await.unwrap();
        let mut reassembled = Vec::new();
        for chunk in &chunks {
            let mut reader = engine.chunk_store.get_chunk(&chunk.hash).await.unwrap().unwrap();
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await.unwrap();
            reassembled.extend(buf);
        }
        assert_eq!(reassembled, body);
    }

    #[tokio::test]
    async fn test_ensure_chunked_is_a_noop_on_second_call() {
        let (engine, _dir) = test_engine(64, 256, 1024).await;

        let body = pseudo_random_bytes(4_000, 777);
        let hash = Hash::sha256_from_bytes(&body).to_typed_base16();

        let mut reader: &[u8] = &body;
        engine.nar_store.put_nar(&hash, &mut reader).await.unwrap().unwrap();

        let nar_file = engine
            .db
            .upsert_nar_file(&hash, "none", None, body.len() as i64)
            .await
            .unwrap();

        ensure_chunked(&engine, nar_file.id).await.unwrap();
        let after_first = engine.db.get_nar_file(nar_file.id).await.unwrap().unwrap();

        ensure_chunked(&engine, nar_file.id).await.unwrap();
        let after_second = engine.db.get_nar_file(nar_file.id).await.unwrap().unwrap();

        assert_eq!(after_first.total_chunks, after_second.total_chunks);
    }
}
