#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

pub mod config;
pub mod coordinator;
pub mod database;
pub mod decompression;
pub mod download_state;
mod error;
pub mod gc;
pub mod locking;
pub mod narinfo;
pub mod nix_manifest;
pub mod pipeline;
pub mod signing;
pub mod storage;
pub mod upstream;

use std::sync::Arc;

use anyhow::{Context, Result};
use sea_orm::Database;

use common::signing::NixKeypair;
use config::Config;
use coordinator::Coordinator;
use database::migration::{Migrator, MigratorTrait};
use error::ServerError;
use locking::{LocalLocker, Locker};
use pipeline::{Engine, PipelineConfig};
use storage::LocalStore;
use upstream::NullUpstream;

/// Builds the shared [`Engine`] from a loaded [`Config`]: connects to
/// the database, opens the local store, and loads (or generates) the
/// signing keypair. Does not run migrations; call [`run_migrations`]
/// first on a fresh database.
pub async fn build_engine(config: &Config) -> Result<Arc<Engine>> {
    let db = Database::connect(&config.database.url)
        .await
        .map_err(ServerError::database_error)?;

    let store = Arc::new(
        LocalStore::new(config.storage.clone())
            .await
            .context("failed to open local storage")?,
    );

    let locker = LocalLocker::new();

    let keypair = match &config.secret_key_path {
        Some(path) => Some(load_or_generate_keypair(path, &config.hostname).await?),
        None => None,
    };

    let pipeline_config = PipelineConfig {
        download_lock_ttl: config.locking.download_lock_ttl,
        cache_lock_ttl: config.locking.cache_lock_ttl,
        download_poll_timeout: config.locking.download_poll_timeout,
        cdc_enabled: config.chunking.cdc_enabled,
        cdc_min_size: config.chunking.min_size,
        cdc_avg_size: config.chunking.avg_size,
        cdc_max_size: config.chunking.max_size,
        max_size: config.max_size,
        cdc_claim_stale_after: config.chunking.claim_stale_after,
        record_age_ignore_touch: config.compat.record_age_ignore_touch,
        should_sign_narinfo: config.should_sign_narinfo,
        temp_dir: config.temp_dir.clone(),
    };

    tokio::fs::create_dir_all(&config.temp_dir)
        .await
        .with_context(|| format!("failed to create temp dir {:?}", config.temp_dir))?;

    Ok(Arc::new(Engine {
        config: pipeline_config,
        db,
        nar_store: store.clone(),
        legacy_narinfo_store: store.clone(),
        chunk_store: store,
        upstream: NullUpstream::new(),
        coordinator: Coordinator::new(locker.clone() as Arc<dyn Locker>),
        keypair,
        cache_locker: locker,
    }))
}

async fn load_or_generate_keypair(
    path: &std::path::Path,
    name: &str,
) -> Result<NixKeypair> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => NixKeypair::from_str(text.trim())
            .map_err(|e| anyhow::anyhow!("failed to parse keypair at {:?}: {}", path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let keypair = NixKeypair::generate(name)
                .map_err(|e| anyhow::anyhow!("failed to generate keypair: {}", e))?;

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.ok();
            }
            tokio::fs::write(path, keypair.export_keypair())
                .await
                .with_context(|| format!("failed to write new keypair to {:?}", path))?;

            Ok(keypair)
        }
        Err(e) => Err(e).with_context(|| format!("failed to read keypair at {:?}", path)),
    }
}

/// Runs pending database migrations.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let db = Database::connect(&config.database.url)
        .await
        .map_err(ServerError::database_error)?;
    Migrator::up(&db, None).await?;
    Ok(())
}
