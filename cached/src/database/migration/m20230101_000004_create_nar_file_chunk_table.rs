use sea_orm_migration::prelude::*;

use crate::database::entity::chunk;
use crate::database::entity::nar_file;
use crate::database::entity::nar_file_chunk::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20230101_000004_create_nar_file_chunk_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Entity)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Column::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Column::NarFileId).big_integer().not_null())
                    .col(ColumnDef::new(Column::ChunkId).big_integer().not_null())
                    .col(ColumnDef::new(Column::ChunkIndex).integer().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-nar_file_chunk-nar_file_id")
                            .from(Entity, Column::NarFileId)
                            .to(nar_file::Entity, nar_file::Column::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-nar_file_chunk-chunk_id")
                            .from(Entity, Column::ChunkId)
                            .to(chunk::Entity, chunk::Column::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-nar_file_chunk-nar_file_id-chunk_index")
                    .table(Entity)
                    .col(Column::NarFileId)
                    .col(Column::ChunkIndex)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-nar_file_chunk-chunk_id")
                    .table(Entity)
                    .col(Column::ChunkId)
                    .to_owned(),
            )
            .await
    }
}
