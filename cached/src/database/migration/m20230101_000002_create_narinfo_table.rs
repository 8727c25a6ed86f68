use sea_orm_migration::prelude::*;

use crate::database::entity::nar_file;
use crate::database::entity::narinfo::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20230101_000002_create_narinfo_table"
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
                    .col(
                        ColumnDef::new(Column::Hash)
                            .string_len(32)
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Column::StorePath).string().not_null())
                    .col(ColumnDef::new(Column::Url).string().null())
                    .col(
                        ColumnDef::new(Column::Compression)
                            .string_len(10)
                            .not_null(),
                    )
                    .col(ColumnDef::new(Column::FileHash).string().null())
                    .col(ColumnDef::new(Column::FileSize).big_integer().null())
                    .col(ColumnDef::new(Column::NarHash).string().not_null())
                    .col(ColumnDef::new(Column::NarSize).big_integer().not_null())
                    .col(ColumnDef::new(Column::References).string().not_null())
                    .col(ColumnDef::new(Column::Deriver).string().null())
                    .col(ColumnDef::new(Column::System).string().null())
                    .col(ColumnDef::new(Column::Ca).string().null())
                    .col(ColumnDef::new(Column::Signatures).string().not_null())
                    .col(ColumnDef::new(Column::NarFileId).big_integer().null())
                    .col(
                        ColumnDef::new(Column::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Column::LastAccessedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-narinfo-nar_file_id")
                            .from(Entity, Column::NarFileId)
                            .to(nar_file::Entity, nar_file::Column::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-narinfo-hash")
                    .table(Entity)
                    .col(Column::Hash)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-narinfo-nar_file_id")
                    .table(Entity)
                    .col(Column::NarFileId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-narinfo-last_accessed_at")
                    .table(Entity)
                    .col(Column::LastAccessedAt)
                    .to_owned(),
            )
            .await
    }
}
