//! The `Querier` interface: prepared operations over the narinfo / nar_file
//! / chunk / nar_file_chunk schema.
//!
//! Every operation that touches more than one row across more than one
//! statement — `normalize_compression`, the CDC batch flush (chunk upsert
//! + link), the stale-chunking reclaim, and LRU eviction — runs inside
//! [`with_retry`], which retries a deadlocked or busy transaction up to 5
//! times with exponential backoff starting at 50ms. Callers never see a
//! transient DB error from these: only `Fatal` failures (post-retry, or a
//! commit failure after a side effect already landed) propagate. Plain
//! single-statement operations elsewhere in this module don't need it; a
//! single UPDATE/INSERT is already atomic.

pub mod entity;
pub mod migration;

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use sea_orm::entity::prelude::*;
use sea_orm::sea_query::{Expr, LockBehavior, LockType, Query};
use sea_orm::{
    ActiveValue::{NotSet, Set},
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, QueryOrder, QuerySelect, TransactionTrait,
};

use crate::error::{ServerError, ServerResult};
use entity::chunk::{self, ChunkModel, Entity as Chunk};
use entity::nar_file::{self, Entity as NarFile, NarFileModel};
use entity::nar_file_chunk::{self, Entity as NarFileChunk};
use entity::narinfo::{self, Entity as NarInfo, NarInfoModel};
use entity::Json;

const MAX_RETRIES: u32 = 5;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// Runs `f` inside a transaction, retrying up to [`MAX_RETRIES`] times with
/// exponential backoff if sea-orm reports the transaction failed to
/// commit (the usual shape of a deadlock/serialization failure).
///
/// This is the one place callers need to reach for when an operation must
/// be atomic; everything else in this module is a single statement and
/// doesn't need it.
pub async fn with_retry<F, Fut, T>(db: &DatabaseConnection, f: F) -> ServerResult<T>
where
    F: Fn(DatabaseTransaction) -> Fut,
    Fut: Future<Output = Result<(DatabaseTransaction, T), ServerError>>,
{
    let mut attempt = 0;
    loop {
        let txn = db.begin().await.map_err(ServerError::database_error)?;

        match f(txn).await {
            Ok((txn, value)) => match txn.commit().await {
                Ok(()) => return Ok(value),
                Err(e) if attempt < MAX_RETRIES => {
                    attempt += 1;
                    tracing::warn!("Transaction commit failed (attempt {}): {}", attempt, e);
                    tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt - 1)).await;
                }
                Err(e) => return Err(ServerError::database_error(e)),
            },
            Err(_) if attempt < MAX_RETRIES => {
                attempt += 1;
                tracing::warn!("Transaction body failed (attempt {}), retrying", attempt);
                tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt - 1)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Outcome of [`Querier::claim_chunking`].
#[derive(Debug)]
pub enum ClaimOutcome {
    /// Already claimed (and not yet stale), or already fully chunked.
    NotClaimed,
    /// No prior attempt; chunking can proceed from index 0.
    Fresh,
    /// A crashed attempt's partial `nar_file_chunk` rows were deleted and
    /// their chunks' `ref_count` decremented; these are the affected chunks
    /// post-decrement, for the caller to delete anything now orphaned
    /// (`ref_count == 0`) before chunking the file again from index 0.
    Reclaimed(Vec<ChunkModel>),
}

/// Fields needed to create or touch a narinfo row.
#[derive(Debug, Clone)]
pub struct NewNarInfo {
    pub hash: String,
    pub store_path: String,
    pub url: Option<String>,
    pub compression: String,
    pub file_hash: Option<String>,
    pub file_size: Option<i64>,
    pub nar_hash: String,
    pub nar_size: i64,
    pub references: Vec<String>,
    pub deriver: Option<String>,
    pub system: Option<String>,
    pub ca: Option<String>,
    pub signatures: Vec<String>,
}

#[async_trait::async_trait]
pub trait Querier: Send + Sync {
    /// Creates a narinfo row if `hash` doesn't exist, or updates `url` only
    /// if it was previously NULL. Every other field is refreshed
    /// unconditionally so re-pulls pick up a corrected upstream manifest.
    async fn upsert_narinfo(&self, info: NewNarInfo) -> ServerResult<NarInfoModel>;

    async fn get_narinfo(&self, hash: &str) -> ServerResult<Option<NarInfoModel>>;

    /// Bumps `last_accessed_at` to now.
    async fn touch_narinfo(&self, id: i64) -> ServerResult<()>;

    async fn link_narinfo_to_nar_file(&self, narinfo_id: i64, nar_file_id: i64) -> ServerResult<()>;

    /// Points every narinfo whose `url` matches and whose `nar_file_id`
    /// is still unresolved at `nar_file_id` — the "fix up
    /// cross-referencing narinfo rows" step run after a nar is written
    /// or pulled from upstream, so a narinfo ingested before its nar
    /// existed gets linked up once it does (and vice versa).
    async fn link_narinfos_by_url(&self, url: &str, nar_file_id: i64) -> ServerResult<()>;

    /// Creates a nar_file row if `(hash, compression, query)` doesn't
    /// exist yet.
    async fn upsert_nar_file(
        &self,
        hash: &str,
        compression: &str,
        query: Option<&str>,
        file_size: i64,
    ) -> ServerResult<NarFileModel>;

    async fn get_nar_file(&self, id: i64) -> ServerResult<Option<NarFileModel>>;

    async fn find_nar_file(
        &self,
        hash: &str,
        compression: &str,
        query: Option<&str>,
    ) -> ServerResult<Option<NarFileModel>>;

    /// Marks `chunking_started_at = now()` on a nar_file, claiming it for
    /// CDC chunking. A no-op (`NotClaimed`) if another holder already
    /// claimed it within the stale-lock TTL, or if it's already chunked.
    /// Reclaiming a stale (crashed) claim also deletes that attempt's
    /// partial `nar_file_chunk` rows and decrements their chunks'
    /// `ref_count`, returning the affected chunks so the caller can clean
    /// up anything that's now orphaned.
    async fn claim_chunking(&self, nar_file_id: i64, stale_after: Duration) -> ServerResult<ClaimOutcome>;

    /// Sets `total_chunks` and the final (uncompressed) `file_size`.
    async fn finalize_chunking(
        &self,
        nar_file_id: i64,
        total_chunks: i32,
        file_size: i64,
    ) -> ServerResult<()>;

    /// Upserts a chunk by content hash, incrementing `ref_count` if it
    /// already exists.
    async fn upsert_chunk(
        &self,
        hash: &str,
        size: i64,
        compressed_size: i64,
    ) -> ServerResult<ChunkModel>;

    /// Bulk-inserts `(nar_file_id, chunk_id, chunk_index)` rows, indices
    /// assigned contiguously starting at `start_index`.
    async fn link_chunks(
        &self,
        nar_file_id: i64,
        chunk_ids: &[i64],
        start_index: i32,
    ) -> ServerResult<()>;

    /// Returns chunks of a nar_file in index order.
    async fn get_chunk_list(&self, nar_file_id: i64) -> ServerResult<Vec<ChunkModel>>;

    /// Returns the chunk linked at `chunk_index`, if it has been
    /// committed yet. Used by progressive streaming to poll for the
    /// next chunk of a nar that is still being chunked elsewhere,
    /// without pulling the whole (possibly still-growing) link list.
    async fn get_chunk_at_index(&self, nar_file_id: i64, chunk_index: i32) -> ServerResult<Option<ChunkModel>>;

    /// Deletes `old_nar_file_id`, re-pointing every narinfo that
    /// referenced it to `new_nar_file_id` instead, in one transaction.
    ///
    /// Used when CDC chunking discovers that a differently-compressed
    /// variant of a nar converges on content already chunked under
    /// another `nar_file` row.
    async fn normalize_compression(
        &self,
        old_nar_file_id: i64,
        new_nar_file_id: i64,
    ) -> ServerResult<()>;

    /// Narinfos to evict to bring total storage under `target_size`,
    /// oldest `last_accessed_at` first.
    async fn get_least_used_narinfos(&self, target_size: i64) -> ServerResult<Vec<NarInfoModel>>;

    async fn delete_narinfo(&self, id: i64) -> ServerResult<()>;

    /// `nar_file` rows with no referencing narinfo left.
    async fn get_orphaned_nar_files(&self) -> ServerResult<Vec<NarFileModel>>;

    async fn delete_nar_file(&self, id: i64) -> ServerResult<()>;

    /// `chunk` rows with `ref_count = 0`.
    async fn get_orphaned_chunks(&self) -> ServerResult<Vec<ChunkModel>>;

    async fn delete_chunk(&self, id: i64) -> ServerResult<()>;

    /// Sum of `nar_file.file_size` across all rows, used to decide whether
    /// LRU eviction needs to run.
    async fn total_size(&self) -> ServerResult<i64>;
}

#[async_trait::async_trait]
impl Querier for DatabaseConnection {
    async fn upsert_narinfo(&self, info: NewNarInfo) -> ServerResult<NarInfoModel> {
        let now = Utc::now();

        if let Some(existing) = NarInfo::find()
            .filter(narinfo::Column::Hash.eq(info.hash.as_str()))
            .one(self)
            .await
            .map_err(ServerError::database_error)?
        {
            let mut active: narinfo::ActiveModel = existing.clone().into();
            if existing.url.is_none() {
                active.url = Set(info.url);
            }
            active.compression = Set(info.compression);
            active.file_hash = Set(info.file_hash);
            active.file_size = Set(info.file_size);
            active.nar_hash = Set(info.nar_hash);
            active.nar_size = Set(info.nar_size);
            active.references = Set(Json(info.references));
            active.deriver = Set(info.deriver);
            active.system = Set(info.system);
            active.ca = Set(info.ca);
            active.signatures = Set(Json(info.signatures));

            let updated = active.update(self).await.map_err(ServerError::database_error)?;
            return Ok(updated);
        }

        let active = narinfo::ActiveModel {
            id: NotSet,
            hash: Set(info.hash),
            store_path: Set(info.store_path),
            url: Set(info.url),
            compression: Set(info.compression),
            file_hash: Set(info.file_hash),
            file_size: Set(info.file_size),
            nar_hash: Set(info.nar_hash),
            nar_size: Set(info.nar_size),
            references: Set(Json(info.references)),
            deriver: Set(info.deriver),
            system: Set(info.system),
            ca: Set(info.ca),
            signatures: Set(Json(info.signatures)),
            nar_file_id: NotSet,
            created_at: Set(now),
            last_accessed_at: NotSet,
        };

        active.insert(self).await.map_err(ServerError::database_error)
    }

    async fn get_narinfo(&self, hash: &str) -> ServerResult<Option<NarInfoModel>> {
        NarInfo::find()
            .filter(narinfo::Column::Hash.eq(hash))
            .one(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn touch_narinfo(&self, id: i64) -> ServerResult<()> {
        let active = narinfo::ActiveModel {
            id: Set(id),
            last_accessed_at: Set(Some(Utc::now())),
            ..Default::default()
        };

        NarInfo::update(active)
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn link_narinfo_to_nar_file(&self, narinfo_id: i64, nar_file_id: i64) -> ServerResult<()> {
        let active = narinfo::ActiveModel {
            id: Set(narinfo_id),
            nar_file_id: Set(Some(nar_file_id)),
            ..Default::default()
        };

        NarInfo::update(active)
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn link_narinfos_by_url(&self, url: &str, nar_file_id: i64) -> ServerResult<()> {
        NarInfo::update_many()
            .col_expr(narinfo::Column::NarFileId, Expr::value(nar_file_id))
            .filter(narinfo::Column::Url.eq(url))
            .filter(narinfo::Column::NarFileId.is_null())
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn upsert_nar_file(
        &self,
        hash: &str,
        compression: &str,
        query: Option<&str>,
        file_size: i64,
    ) -> ServerResult<NarFileModel> {
        if let Some(existing) = self.find_nar_file(hash, compression, query).await? {
            return Ok(existing);
        }

        let active = nar_file::ActiveModel {
            id: NotSet,
            hash: Set(hash.to_owned()),
            compression: Set(compression.to_owned()),
            query: Set(query.map(str::to_owned)),
            file_size: Set(file_size),
            total_chunks: Set(0),
            chunking_started_at: NotSet,
            created_at: Set(Utc::now()),
        };

        match active.insert(self).await {
            Ok(model) => Ok(model),
            // lost the unique-index race against another upserter
            Err(_) => self
                .find_nar_file(hash, compression, query)
                .await?
                .ok_or(ServerError::InternalError),
        }
    }

    async fn get_nar_file(&self, id: i64) -> ServerResult<Option<NarFileModel>> {
        NarFile::find_by_id(id)
            .one(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn find_nar_file(
        &self,
        hash: &str,
        compression: &str,
        query: Option<&str>,
    ) -> ServerResult<Option<NarFileModel>> {
        let mut select = NarFile::find()
            .filter(nar_file::Column::Hash.eq(hash))
            .filter(nar_file::Column::Compression.eq(compression));

        select = match query {
            Some(q) => select.filter(nar_file::Column::Query.eq(q)),
            None => select.filter(nar_file::Column::Query.is_null()),
        };

        select.one(self).await.map_err(ServerError::database_error)
    }

    async fn claim_chunking(&self, nar_file_id: i64, stale_after: Duration) -> ServerResult<ClaimOutcome> {
        let now = Utc::now();
        let stale_cutoff = now - chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::hours(1));

        // Fast path: nobody has ever claimed this nar_file. A single
        // conditional UPDATE is atomic by itself, no stale links to clean
        // up, so it doesn't need the transaction below.
        let fresh_claim = Query::update()
            .table(NarFile)
            .value(nar_file::Column::ChunkingStartedAt, now)
            .and_where(Expr::col(nar_file::Column::Id).eq(nar_file_id))
            .and_where(Expr::col(nar_file::Column::TotalChunks).eq(0))
            .and_where(Expr::col(nar_file::Column::ChunkingStartedAt).is_null())
            .to_owned();
        let stmt = self.get_database_backend().build(&fresh_claim);
        if self
            .execute(stmt)
            .await
            .map_err(ServerError::database_error)?
            .rows_affected()
            > 0
        {
            return Ok(ClaimOutcome::Fresh);
        }

        // Otherwise: live-claimed, already chunked, or stale. The stale
        // case needs a multi-statement cleanup (delete the crashed
        // attempt's partial links, decrement their chunks' ref_count,
        // then reclaim), so it runs under retry.
        with_retry(self, move |txn| async move {
            let Some(nar_file) = NarFile::find_by_id(nar_file_id)
                .one(&txn)
                .await
                .map_err(ServerError::database_error)?
            else {
                return Ok((txn, ClaimOutcome::NotClaimed));
            };

            if nar_file.total_chunks > 0 {
                return Ok((txn, ClaimOutcome::NotClaimed));
            }

            let is_stale = match nar_file.chunking_started_at {
                Some(started) => started < stale_cutoff,
                // Lost the race to the fresh-claim statement above.
                None => false,
            };
            if !is_stale {
                return Ok((txn, ClaimOutcome::NotClaimed));
            }

            let chunk_ids = chunk_ids_for_nar_file_conn(&txn, nar_file_id).await?;

            NarFileChunk::delete_many()
                .filter(nar_file_chunk::Column::NarFileId.eq(nar_file_id))
                .exec(&txn)
                .await
                .map_err(ServerError::database_error)?;

            decrement_chunk_refs_conn(&txn, &chunk_ids).await?;

            let reclaim = nar_file::ActiveModel {
                id: Set(nar_file_id),
                chunking_started_at: Set(Some(now)),
                ..Default::default()
            };
            NarFile::update(reclaim)
                .exec(&txn)
                .await
                .map_err(ServerError::database_error)?;

            let mut stale_chunks = Vec::with_capacity(chunk_ids.len());
            for id in chunk_ids {
                if let Some(chunk) = Chunk::find_by_id(id)
                    .one(&txn)
                    .await
                    .map_err(ServerError::database_error)?
                {
                    stale_chunks.push(chunk);
                }
            }

            Ok((txn, ClaimOutcome::Reclaimed(stale_chunks)))
        })
        .await
    }

    async fn finalize_chunking(
        &self,
        nar_file_id: i64,
        total_chunks: i32,
        file_size: i64,
    ) -> ServerResult<()> {
        finalize_chunking_conn(self, nar_file_id, total_chunks, file_size).await
    }

    async fn upsert_chunk(
        &self,
        hash: &str,
        size: i64,
        compressed_size: i64,
    ) -> ServerResult<ChunkModel> {
        upsert_chunk_conn(self, hash, size, compressed_size).await
    }

    async fn link_chunks(
        &self,
        nar_file_id: i64,
        chunk_ids: &[i64],
        start_index: i32,
    ) -> ServerResult<()> {
        link_chunks_conn(self, nar_file_id, chunk_ids, start_index).await
    }

    async fn get_chunk_list(&self, nar_file_id: i64) -> ServerResult<Vec<ChunkModel>> {
        let links = NarFileChunk::find()
            .filter(nar_file_chunk::Column::NarFileId.eq(nar_file_id))
            .order_by_asc(nar_file_chunk::Column::ChunkIndex)
            .all(self)
            .await
            .map_err(ServerError::database_error)?;

        let mut chunks = Vec::with_capacity(links.len());
        for link in links {
            let chunk = Chunk::find_by_id(link.chunk_id)
                .one(self)
                .await
                .map_err(ServerError::database_error)?
                .ok_or(ServerError::InternalError)?;
            chunks.push(chunk);
        }

        Ok(chunks)
    }

    async fn get_chunk_at_index(&self, nar_file_id: i64, chunk_index: i32) -> ServerResult<Option<ChunkModel>> {
        let Some(link) = NarFileChunk::find()
            .filter(nar_file_chunk::Column::NarFileId.eq(nar_file_id))
            .filter(nar_file_chunk::Column::ChunkIndex.eq(chunk_index))
            .one(self)
            .await
            .map_err(ServerError::database_error)?
        else {
            return Ok(None);
        };

        Chunk::find_by_id(link.chunk_id)
            .one(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn normalize_compression(
        &self,
        old_nar_file_id: i64,
        new_nar_file_id: i64,
    ) -> ServerResult<()> {
        with_retry(self, move |txn| async move {
            NarInfo::update_many()
                .col_expr(narinfo::Column::NarFileId, Expr::value(new_nar_file_id))
                .filter(narinfo::Column::NarFileId.eq(old_nar_file_id))
                .exec(&txn)
                .await
                .map_err(ServerError::database_error)?;

            NarFile::delete_by_id(old_nar_file_id)
                .exec(&txn)
                .await
                .map_err(ServerError::database_error)?;

            Ok((txn, ()))
        })
        .await
    }

    async fn get_least_used_narinfos(&self, target_size: i64) -> ServerResult<Vec<NarInfoModel>> {
        get_least_used_narinfos_conn(self, target_size).await
    }

    async fn delete_narinfo(&self, id: i64) -> ServerResult<()> {
        delete_narinfo_conn(self, id).await
    }

    async fn get_orphaned_nar_files(&self) -> ServerResult<Vec<NarFileModel>> {
        get_orphaned_nar_files_conn(self).await
    }

    async fn delete_nar_file(&self, id: i64) -> ServerResult<()> {
        delete_nar_file_conn(self, id).await
    }

    async fn get_orphaned_chunks(&self) -> ServerResult<Vec<ChunkModel>> {
        get_orphaned_chunks_conn(self).await
    }

    async fn delete_chunk(&self, id: i64) -> ServerResult<()> {
        delete_chunk_conn(self, id).await
    }

    async fn total_size(&self) -> ServerResult<i64> {
        total_size_conn(self).await
    }
}

/// Backend-generic core of [`Querier::upsert_chunk`], usable either
/// directly on a [`DatabaseConnection`] or inside a [`with_retry`]
/// transaction.
pub(crate) async fn upsert_chunk_conn<C: ConnectionTrait>(
    db: &C,
    hash: &str,
    size: i64,
    compressed_size: i64,
) -> ServerResult<ChunkModel> {
    if let Some(existing) = Chunk::find()
        .filter(chunk::Column::Hash.eq(hash))
        .one(db)
        .await
        .map_err(ServerError::database_error)?
    {
        let one = sea_orm::Value::Int(Some(1));
        let bump = Query::update()
            .table(chunk::Entity)
            .values([(
                chunk::Column::RefCount,
                Expr::col(chunk::Column::RefCount).add(one),
            )])
            .and_where(chunk::Column::Id.eq(existing.id))
            .to_owned();
        let stmt = db.get_database_backend().build(&bump);
        db.execute(stmt).await.map_err(ServerError::database_error)?;

        return Ok(ChunkModel {
            ref_count: existing.ref_count + 1,
            ..existing
        });
    }

    let active = chunk::ActiveModel {
        id: NotSet,
        hash: Set(hash.to_owned()),
        size: Set(size),
        compressed_size: Set(compressed_size),
        ref_count: Set(1),
        created_at: Set(Utc::now()),
    };

    match active.insert(db).await {
        Ok(model) => Ok(model),
        Err(_) => Chunk::find()
            .filter(chunk::Column::Hash.eq(hash))
            .one(db)
            .await
            .map_err(ServerError::database_error)?
            .ok_or(ServerError::InternalError),
    }
}

/// Backend-generic core of [`Querier::link_chunks`].
pub(crate) async fn link_chunks_conn<C: ConnectionTrait>(
    db: &C,
    nar_file_id: i64,
    chunk_ids: &[i64],
    start_index: i32,
) -> ServerResult<()> {
    if chunk_ids.is_empty() {
        return Ok(());
    }

    let models = chunk_ids
        .iter()
        .enumerate()
        .map(|(i, &chunk_id)| nar_file_chunk::ActiveModel {
            id: NotSet,
            nar_file_id: Set(nar_file_id),
            chunk_id: Set(chunk_id),
            chunk_index: Set(start_index + i as i32),
        });

    NarFileChunk::insert_many(models)
        .exec(db)
        .await
        .map_err(ServerError::database_error)?;

    Ok(())
}

/// Backend-generic core of [`Querier::finalize_chunking`].
pub(crate) async fn finalize_chunking_conn<C: ConnectionTrait>(
    db: &C,
    nar_file_id: i64,
    total_chunks: i32,
    file_size: i64,
) -> ServerResult<()> {
    let active = nar_file::ActiveModel {
        id: Set(nar_file_id),
        total_chunks: Set(total_chunks),
        file_size: Set(file_size),
        ..Default::default()
    };

    NarFile::update(active)
        .exec(db)
        .await
        .map_err(ServerError::database_error)?;

    Ok(())
}

/// The `chunk_id` of every `nar_file_chunk` row still linked to
/// `nar_file_id`, in no particular order (duplicates possible only if a
/// chunk repeats within the same file, which `chunk_index` disambiguates
/// at the row level but not here).
pub(crate) async fn chunk_ids_for_nar_file_conn<C: ConnectionTrait>(
    db: &C,
    nar_file_id: i64,
) -> ServerResult<Vec<i64>> {
    let links = NarFileChunk::find()
        .filter(nar_file_chunk::Column::NarFileId.eq(nar_file_id))
        .all(db)
        .await
        .map_err(ServerError::database_error)?;

    Ok(links.into_iter().map(|l| l.chunk_id).collect())
}

/// Decrements `ref_count` by the number of times each id occurs in
/// `chunk_ids`, floored at zero. Callers are expected to have already
/// removed (or be in the process of cascading away) the `nar_file_chunk`
/// rows these ids came from.
pub(crate) async fn decrement_chunk_refs_conn<C: ConnectionTrait>(
    db: &C,
    chunk_ids: &[i64],
) -> ServerResult<()> {
    let mut counts: std::collections::HashMap<i64, i64> = std::collections::HashMap::new();
    for &id in chunk_ids {
        *counts.entry(id).or_insert(0) += 1;
    }

    for (chunk_id, count) in counts {
        let Some(chunk) = Chunk::find_by_id(chunk_id)
            .one(db)
            .await
            .map_err(ServerError::database_error)?
        else {
            continue;
        };

        let active = chunk::ActiveModel {
            id: Set(chunk.id),
            ref_count: Set((chunk.ref_count - count as i32).max(0)),
            ..Default::default()
        };
        Chunk::update(active)
            .exec(db)
            .await
            .map_err(ServerError::database_error)?;
    }

    Ok(())
}

pub(crate) async fn total_size_conn<C: ConnectionTrait>(db: &C) -> ServerResult<i64> {
    let total: Option<Option<i64>> = NarFile::find()
        .select_only()
        .column_as(nar_file::Column::FileSize.sum(), "total")
        .into_tuple()
        .one(db)
        .await
        .map_err(ServerError::database_error)?;

    Ok(total.flatten().unwrap_or(0))
}

pub(crate) async fn get_least_used_narinfos_conn<C: ConnectionTrait>(
    db: &C,
    target_size: i64,
) -> ServerResult<Vec<NarInfoModel>> {
    let total = total_size_conn(db).await?;
    if total <= target_size {
        return Ok(Vec::new());
    }

    let mut to_free = total - target_size;
    let mut victims = Vec::new();

    let candidates = NarInfo::find()
        .order_by_asc(narinfo::Column::LastAccessedAt)
        .all(db)
        .await
        .map_err(ServerError::database_error)?;

    for candidate in candidates {
        if to_free <= 0 {
            break;
        }

        let size = match candidate.nar_file_id {
            Some(nar_file_id) => NarFile::find_by_id(nar_file_id)
                .one(db)
                .await
                .map_err(ServerError::database_error)?
                .map(|f| f.file_size)
                .unwrap_or(0),
            None => 0,
        };

        to_free -= size;
        victims.push(candidate);
    }

    Ok(victims)
}

pub(crate) async fn delete_narinfo_conn<C: ConnectionTrait>(db: &C, id: i64) -> ServerResult<()> {
    NarInfo::delete_by_id(id)
        .exec(db)
        .await
        .map_err(ServerError::database_error)?;
    Ok(())
}

pub(crate) async fn get_orphaned_nar_files_conn<C: ConnectionTrait>(
    db: &C,
) -> ServerResult<Vec<NarFileModel>> {
    let orphan_ids = Query::select()
        .from(NarFile)
        .expr(nar_file::Column::Id.into_expr())
        .left_join(
            NarInfo,
            narinfo::Column::NarFileId
                .into_expr()
                .eq(nar_file::Column::Id.into_expr()),
        )
        .and_where(narinfo::Column::Id.is_null())
        .lock_with_tables_behavior(LockType::Update, [NarFile], LockBehavior::SkipLocked)
        .to_owned();
    let stmt = db.get_database_backend().build(&orphan_ids);

    #[derive(Debug, sea_orm::FromQueryResult)]
    struct IdOnly {
        id: i64,
    }

    let ids: Vec<i64> = IdOnly::find_by_statement(stmt)
        .all(db)
        .await
        .map_err(ServerError::database_error)?
        .into_iter()
        .map(|r| r.id)
        .collect();

    if ids.is_empty() {
        return Ok(Vec::new());
    }

    NarFile::find()
        .filter(nar_file::Column::Id.is_in(ids))
        .all(db)
        .await
        .map_err(ServerError::database_error)
}

pub(crate) async fn delete_nar_file_conn<C: ConnectionTrait>(db: &C, id: i64) -> ServerResult<()> {
    NarFile::delete_by_id(id)
        .exec(db)
        .await
        .map_err(ServerError::database_error)?;
    Ok(())
}

pub(crate) async fn get_orphaned_chunks_conn<C: ConnectionTrait>(
    db: &C,
) -> ServerResult<Vec<ChunkModel>> {
    Chunk::find()
        .filter(chunk::Column::RefCount.eq(0))
        .all(db)
        .await
        .map_err(ServerError::database_error)
}

pub(crate) async fn delete_chunk_conn<C: ConnectionTrait>(db: &C, id: i64) -> ServerResult<()> {
    Chunk::delete_by_id(id)
        .exec(db)
        .await
        .map_err(ServerError::database_error)?;
    Ok(())
}
