//! A narinfo (metadata manifest) for one cached store path.
//!
//! The `hash` column is the opaque 32-char identifier embedded in the
//! `.narinfo` request path. `url` is NULL until the first successful
//! pull or PUT resolves which nar file backs this record; the upsert
//! used to create/touch a row only overwrites `url` while it is still
//! NULL (see `database::Querier::upsert_narinfo`).

use sea_orm::entity::prelude::*;

use super::Json;

pub type NarInfoModel = Model;

/// A narinfo row.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "narinfo")]
pub struct Model {
    /// Unique numeric ID.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// The opaque hash identifying this store path, as embedded in the
    /// `.narinfo` request path.
    #[sea_orm(unique, indexed)]
    pub hash: String,

    /// The full store path, e.g. `/nix/store/<hash>-foo-1.0`.
    pub store_path: String,

    /// The (possibly prefixed) URL pointing at the nar blob.
    ///
    /// NULL until the backing nar file is known.
    pub url: Option<String>,

    /// The compression declared in the narinfo (may differ from the
    /// physically stored nar file's compression once normalized).
    #[sea_orm(column_type = "String(StringLen::N(10))")]
    pub compression: String,

    /// Hash of the compressed file. NULL when chunked (CDC) or unknown.
    pub file_hash: Option<String>,

    /// Size of the compressed file. NULL when chunked (CDC) or unknown.
    pub file_size: Option<i64>,

    /// Hash of the uncompressed NAR archive.
    pub nar_hash: String,

    /// Size of the uncompressed NAR archive.
    pub nar_size: i64,

    /// Other store paths this object directly references.
    pub references: Json<Vec<String>>,

    /// The derivation that produced this object, if known.
    pub deriver: Option<String>,

    /// The system this derivation is built for.
    pub system: Option<String>,

    /// The content address of the object, if content-addressed.
    pub ca: Option<String>,

    /// Signatures over the fingerprint, in insertion order.
    pub signatures: Json<Vec<String>>,

    /// The nar file backing this narinfo, if resolved.
    #[sea_orm(indexed)]
    pub nar_file_id: Option<i64>,

    /// When this row was first created.
    pub created_at: ChronoDateTimeUtc,

    /// When this row was last served to a client.
    ///
    /// Drives LRU eviction ordering.
    pub last_accessed_at: Option<ChronoDateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::nar_file::Entity",
        from = "Column::NarFileId",
        to = "super::nar_file::Column::Id"
    )]
    NarFile,
}

impl Related<super::nar_file::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::NarFile.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
