//! A content-addressed chunk in the global chunk store.
//!
//! Deduplicated across all nar files: the same chunk hash is written
//! at most once via `PutChunk`, and subsequent references only bump
//! `ref_count`.

use sea_orm::entity::prelude::*;

pub type ChunkModel = Model;

/// A content-addressed chunk.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "chunk")]
pub struct Model {
    /// Unique numeric ID.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Hash of the uncompressed chunk bytes.
    #[sea_orm(unique, indexed)]
    pub hash: String,

    /// Size of the uncompressed chunk.
    pub size: i64,

    /// Size of the chunk as physically stored.
    pub compressed_size: i64,

    /// Number of nar files referencing this chunk.
    pub ref_count: i32,

    /// When this chunk was first written.
    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::nar_file_chunk::Entity")]
    NarFileChunk,
}

impl Related<super::nar_file_chunk::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::NarFileChunk.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
