//! Physical-blob metadata for one nar, keyed by `(hash, compression, query)`.
//!
//! A row with `total_chunks = 0` and `chunking_started_at = NULL` has
//! never been chunked and is stored as a whole file. A non-NULL
//! `chunking_started_at` with `total_chunks` still `0` means CDC
//! chunking is in progress (or abandoned, if older than the stale-lock
//! TTL — see `pipeline::cdc`).

use sea_orm::entity::prelude::*;

pub type NarFileModel = Model;

/// A physical nar blob, possibly chunked.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "nar_file")]
pub struct Model {
    /// Unique numeric ID.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Content hash of the nar (as physically stored, i.e. after
    /// normalization for CDC).
    #[sea_orm(indexed)]
    pub hash: String,

    /// Compression of the physically stored bytes. Always `none` once
    /// CDC-chunked.
    #[sea_orm(column_type = "String(StringLen::N(10))")]
    pub compression: String,

    /// The query string portion of the nar URL, if any.
    pub query: Option<String>,

    /// Size of the file as physically stored. For CDC files this is
    /// the uncompressed total.
    pub file_size: i64,

    /// Number of chunks. Zero means whole-file (not chunked, or
    /// chunking still in progress).
    pub total_chunks: i32,

    /// When CDC chunking for this row was claimed. NULL when not
    /// chunked and not in progress.
    pub chunking_started_at: Option<ChronoDateTimeUtc>,

    /// When this row was created.
    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::narinfo::Entity")]
    NarInfo,

    #[sea_orm(has_many = "super::nar_file_chunk::Entity")]
    NarFileChunk,
}

impl Related<super::narinfo::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::NarInfo.def()
    }
}

impl Related<super::nar_file_chunk::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::NarFileChunk.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
