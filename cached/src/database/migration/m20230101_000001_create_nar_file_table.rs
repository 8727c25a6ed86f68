use sea_orm_migration::prelude::*;

use crate::database::entity::nar_file::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20230101_000001_create_nar_file_table"
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
                    .col(ColumnDef::new(Column::Hash).string().not_null())
                    .col(
                        ColumnDef::new(Column::Compression)
                            .string_len(10)
                            .not_null(),
                    )
                    .col(ColumnDef::new(Column::Query).string().null())
                    .col(ColumnDef::new(Column::FileSize).big_integer().not_null())
                    .col(
                        ColumnDef::new(Column::TotalChunks)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Column::ChunkingStartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Column::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-nar_file-hash-compression-query")
                    .table(Entity)
                    .col(Column::Hash)
                    .col(Column::Compression)
                    .col(Column::Query)
                    .unique()
                    .to_owned(),
            )
            .await
    }
}
