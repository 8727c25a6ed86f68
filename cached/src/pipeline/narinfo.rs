//! Narinfo retrieval and ingestion (spec `GetNarInfo`/`PutNarInfo`).
//!
//! `get_narinfo` tries, in order: the database, the legacy blob-store
//! narinfo record (migrating it into the database on a hit), then the
//! upstream cache via [`Coordinator`] single-flight. `put_narinfo`
//! signs and upserts a client-supplied narinfo directly.

use std::sync::Arc;

use chrono::Utc;

use super::{error_from_name, with_cache_read_lock, Engine};
use crate::coordinator::{CancelToken, WaitFor};
use crate::database::{NewNarInfo, Querier};
use crate::database::entity::narinfo::NarInfoModel;
use crate::download_state::DownloadState;
use crate::error::{ServerError, ServerResult};
use crate::narinfo::NarInfo;
use crate::signing;

/// Resolves a narinfo by its opaque hash, pulling it from upstream and
/// migrating legacy records into the database as a side effect.
pub async fn get_narinfo(engine: &Arc<Engine>, hash: &str) -> ServerResult<NarInfoModel> {
    let hash = hash.to_string();
    with_cache_read_lock(engine, move || {
        let engine = engine.clone();
        async move {
            if let Some(model) = engine.db.get_narinfo(&hash).await? {
                maybe_touch(&engine, &model);
                maybe_schedule_chunking(&engine, &model);
                return Ok(model);
            }

            if let Some(text) = engine.legacy_narinfo_store.get_narinfo(&hash).await? {
                return migrate_legacy(&engine, &hash, &text).await;
            }

            fetch_from_upstream(&engine, &hash).await
        }
    })
    .await
}

/// Signs and stores a client-supplied narinfo, returning the resulting
/// row.
pub async fn put_narinfo(engine: &Arc<Engine>, hash: &str, text: &str) -> ServerResult<NarInfoModel> {
    let hash = hash.to_string();
    let text = text.to_string();
    with_cache_read_lock(engine, move || {
        let engine = engine.clone();
        async move {
            let info = parse_and_sign(&engine, &text)?;
            engine.db.upsert_narinfo(build_new_narinfo(&hash, &info)).await
        }
    })
    .await
}

async fn migrate_legacy(engine: &Arc<Engine>, hash: &str, text: &str) -> ServerResult<NarInfoModel> {
    let info = NarInfo::from_str(text)?;
    engine.db.upsert_narinfo(build_new_narinfo(hash, &info)).await
}

async fn fetch_from_upstream(engine: &Arc<Engine>, hash: &str) -> ServerResult<NarInfoModel> {
    let job_key = format!("narinfo:{}", hash);

    let engine_for_check = engine.clone();
    let hash_for_check = hash.to_string();

    let engine_for_job = engine.clone();
    let hash_for_job = hash.to_string();

    let ds = engine
        .coordinator
        .run(
            &job_key,
            engine.config.download_lock_ttl,
            engine.config.download_poll_timeout,
            WaitFor::Stored,
            &CancelToken::new(),
            move || {
                let engine = engine_for_check.clone();
                let hash = hash_for_check.clone();
                async move { Ok(engine.db.get_narinfo(&hash).await?.is_some()) }
            },
            move |ds| run_upstream_fetch(engine_for_job, hash_for_job, ds),
        )
        .await?;

    if let Some(name) = ds.error_name().await {
        return Err(error_from_name(name));
    }

    engine
        .db
        .get_narinfo(hash)
        .await?
        .ok_or(ServerError::InternalError)
}

async fn run_upstream_fetch(engine: Arc<Engine>, hash: String, ds: Arc<DownloadState>) {
    let result = run_upstream_fetch_inner(&engine, &hash).await;

    match result {
        Ok(()) => {
            ds.start.fire();
            ds.stored.fire();
        }
        Err(e) => {
            ds.set_error(e).await;
        }
    }
    ds.done.fire();
    ds.close();
}

async fn run_upstream_fetch_inner(engine: &Arc<Engine>, hash: &str) -> ServerResult<()> {
    let text = engine
        .upstream
        .fetch_narinfo(hash)
        .await?
        .ok_or(ServerError::NotFound)?;

    let info = parse_and_sign(engine, &text)?;
    engine.db.upsert_narinfo(build_new_narinfo(hash, &info)).await?;

    Ok(())
}

/// Parses a narinfo and, if we're configured to sign, replaces its
/// single wire-format signature slot with a fresh one of ours (see
/// [`crate::signing::sign`] for why this is idempotent rather than
/// additive).
fn parse_and_sign(engine: &Arc<Engine>, text: &str) -> ServerResult<NarInfo> {
    let mut info = NarInfo::from_str(text)?;

    if engine.config.should_sign_narinfo {
        if let Some(keypair) = &engine.keypair {
            let fingerprint = info.fingerprint();
            let mut signatures: Vec<String> = info.signature.iter().cloned().collect();
            signing::sign(&mut signatures, &fingerprint, keypair);
            info.signature = signatures.into_iter().next();
        }
    }

    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::database::migration::{Migrator, MigratorTrait};
    use crate::locking::LocalLocker;
    use crate::pipeline::nar::{get_nar, NarKey};
    use crate::pipeline::PipelineConfig;
    use crate::storage::{LocalStorageConfig, LocalStore};
    use crate::upstream::StaticUpstream;
    use sea_orm::Database;
    use std::time::Duration;

    async fn test_engine(upstream: Arc<StaticUpstream>) -> (Arc<Engine>, tempfile::TempDir) {
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
                temp_dir: dir.path().join("tmp"),
                download_poll_timeout: Duration::from_secs(5),
                ..Default::default()
            },
            db,
            nar_store: store.clone(),
            legacy_narinfo_store: store.clone(),
            chunk_store: store,
            upstream,
            coordinator: crate::coordinator::Coordinator::new(locker.clone() as Arc<dyn crate::locking::Locker>),
            keypair: None,
            cache_locker: locker,
        });

        (engine, dir)
    }

    const NARINFO_TEXT: &str = r#"
StorePath: /nix/store/xcp9cav49dmsjbwdjlmkjxj10gkpx553-hello-2.10
URL: nar/h1nar.nar
Compression: none
NarHash: sha256:16mvl7v0ylzcg2n3xzjn41qhzbmgcn5iyarx16nn5l2r36n2kqci
NarSize: 206104
References: xcp9cav49dmsjbwdjlmkjxj10gkpx553-hello-2.10
    "#;

    #[tokio::test]
    async fn test_get_narinfo_fetches_from_upstream_and_caches() {
        let upstream = StaticUpstream::new();
        upstream.insert_narinfo("h1", NARINFO_TEXT).await;
        let (engine, _dir) = test_engine(upstream).await;

        let model = get_narinfo(&engine, "h1").await.unwrap();
        assert_eq!(model.hash, "h1");
        assert_eq!(model.url.as_deref(), Some("nar/h1nar.nar"));
        assert!(model.nar_file_id.is_none());

        // Second call is a DB hit, not a second upstream fetch.
        let model2 = get_narinfo(&engine, "h1").await.unwrap();
        assert_eq!(model2.id, model.id);
    }

    #[tokio::test]
    async fn test_narinfo_and_nar_cascade_links_to_the_same_nar_file() {
        // A narinfo resolves first, pointing at a nar that hasn't been
        // fetched yet; a subsequent get_nar for that same URL must end
        // up linked back to this narinfo's row.
        let upstream = StaticUpstream::new();
        upstream.insert_narinfo("h1", NARINFO_TEXT).await;
        upstream
            .insert_nar("nar/h1nar.nar", Bytes::from_static(b"HELLO"))
            .await;
        let (engine, _dir) = test_engine(upstream).await;

        let narinfo = get_narinfo(&engine, "h1").await.unwrap();
        assert!(narinfo.nar_file_id.is_none());

        let key = NarKey {
            url: "nar/h1nar.nar".to_string(),
            hash: "h1nar".to_string(),
            compression: "none".to_string(),
            query: None,
        };
        let (_size, mut reader) = get_nar(&engine, &key).await.unwrap();
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buf).await.unwrap();
        assert_eq!(buf, b"HELLO");

        let refreshed = engine.db.get_narinfo("h1").await.unwrap().unwrap();
        let nar_file_id = refreshed.nar_file_id.expect("narinfo should now be linked to its nar_file");
        let nar_file = engine.db.get_nar_file(nar_file_id).await.unwrap().unwrap();
        assert_eq!(nar_file.file_size, 5);
    }
}

fn build_new_narinfo(hash: &str, info: &NarInfo) -> NewNarInfo {
    NewNarInfo {
        hash: hash.to_owned(),
        store_path: info.store_path.to_string_lossy().into_owned(),
        url: Some(info.url.clone()),
        compression: info.compression.as_str().to_owned(),
        file_hash: info.file_hash.as_ref().map(|h| h.to_typed_base16()),
        file_size: info.file_size.map(|s| s as i64),
        nar_hash: info.nar_hash.to_typed_base16(),
        nar_size: info.nar_size as i64,
        references: info.references.clone(),
        deriver: info.deriver.clone(),
        system: info.system.clone(),
        ca: info.ca.clone(),
        signatures: info.signature.iter().cloned().collect(),
    }
}

/// Bumps `last_accessed_at` in the background unless it was touched
/// recently, so a hot path doesn't serialize on a write every request.
fn maybe_touch(engine: &Arc<Engine>, model: &NarInfoModel) {
    let stale = match model.last_accessed_at {
        Some(last) => {
            let age = Utc::now().signed_duration_since(last);
            age.to_std().unwrap_or_default() >= engine.config.record_age_ignore_touch
        }
        None => true,
    };

    if !stale {
        return;
    }

    let engine = engine.clone();
    let id = model.id;
    tokio::spawn(async move {
        if let Err(e) = engine.db.touch_narinfo(id).await {
            tracing::warn!("failed to touch narinfo {}: {}", id, e);
        }
    });
}

/// Kicks off background CDC chunking for the backing nar file, if CDC
/// is enabled and the file hasn't been chunked yet.
fn maybe_schedule_chunking(engine: &Arc<Engine>, model: &NarInfoModel) {
    if !engine.config.cdc_enabled {
        return;
    }

    let Some(nar_file_id) = model.nar_file_id else {
        return;
    };

    let engine = engine.clone();
    tokio::spawn(async move {
        if let Err(e) = super::cdc::ensure_chunked(&engine, nar_file_id).await {
            tracing::warn!(
                "background chunking of nar_file {} failed: {}",
                nar_file_id,
                e
            );
        }
    });
}
