//! Ordered link between a nar file and the chunks that make it up.
//!
//! Indices are assigned contiguously starting at 0 in the order the
//! chunker emitted them; `database::Querier::get_chunk_list` relies
//! on this to stream chunks in order.

use sea_orm::entity::prelude::*;

pub type NarFileChunkModel = Model;

/// One `(nar_file, chunk, position)` link.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "nar_file_chunk")]
pub struct Model {
    /// Unique numeric ID.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// The nar file this chunk belongs to.
    #[sea_orm(indexed)]
    pub nar_file_id: i64,

    /// The chunk.
    #[sea_orm(indexed)]
    pub chunk_id: i64,

    /// Zero-indexed position within the nar file.
    pub chunk_index: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::nar_file::Entity",
        from = "Column::NarFileId",
        to = "super::nar_file::Column::Id"
    )]
    NarFile,

    #[sea_orm(
        belongs_to = "super::chunk::Entity",
        from = "Column::ChunkId",
        to = "super::chunk::Column::Id"
    )]
    Chunk,
}

impl Related<super::nar_file::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::NarFile.def()
    }
}

impl Related<super::chunk::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Chunk.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
