use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Schema};
use std::path::Path;
use tokio::fs;

use crate::info;

pub mod entity;
pub mod kv;

pub use kv::{Bucket, KvStore, WriteTxn};

/// 连接 SQLite 数据库文件，目录不存在时自动创建
pub async fn connect(path: &str) -> Result<DatabaseConnection, DbErr> {
    if let Some(parent) = Path::new(path).parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| DbErr::Custom(format!("无法创建数据库目录 {}: {}", parent.display(), e)))?;
    }

    // mode=rwc 允许 读/写/创建
    let db_url = format!("sqlite:{}?mode=rwc", path);

    let db = Database::connect(&db_url).await?;

    info!(target: "Database", "连接成功: {}", db_url);

    Ok(db)
}

/// 内存数据库，仅保留一个连接 (每个连接都是独立的内存库)
pub async fn connect_memory() -> Result<DatabaseConnection, DbErr> {
    let mut opt = ConnectOptions::new("sqlite::memory:");
    opt.max_connections(1).min_connections(1).sqlx_logging(false);
    Database::connect(opt).await
}

/// 建表 (已存在则跳过)
pub async fn init_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);

    db.execute(
        builder.build(
            schema
                .create_table_from_entity(entity::forward::Entity)
                .if_not_exists(),
        ),
    )
    .await?;

    db.execute(
        builder.build(
            schema
                .create_table_from_entity(entity::reverse::Entity)
                .if_not_exists(),
        ),
    )
    .await?;

    db.execute(
        builder.build(
            schema
                .create_table_from_entity(entity::meta::Entity)
                .if_not_exists(),
        ),
    )
    .await?;

    db.execute(
        builder.build(
            schema
                .create_table_from_entity(entity::counter::Entity)
                .if_not_exists(),
        ),
    )
    .await?;

    Ok(())
}
