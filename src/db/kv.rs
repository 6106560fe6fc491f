use sea_orm::ActiveValue::Set;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbErr, EntityTrait,
    QueryFilter, QueryOrder, TransactionTrait,
};
use tokio::sync::{Mutex, MutexGuard};

use super::entity::{self, counter};
use crate::error::BridgeResult;

/// 键值表
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Forward,
    Reverse,
    Meta,
}

// 按 Bucket 选择对应的实体模块
macro_rules! with_bucket {
    ($bucket:expr, $m:ident => $body:expr) => {
        match $bucket {
            Bucket::Forward => {
                use entity::forward as $m;
                $body
            }
            Bucket::Reverse => {
                use entity::reverse as $m;
                $body
            }
            Bucket::Meta => {
                use entity::meta as $m;
                $body
            }
        }
    };
}

async fn get_in<C: ConnectionTrait>(
    conn: &C,
    bucket: Bucket,
    key: &str,
) -> Result<Option<String>, DbErr> {
    with_bucket!(bucket, m => {
        Ok(m::Entity::find_by_id(key.to_owned())
            .one(conn)
            .await?
            .map(|row| row.value))
    })
}

async fn put_in<C: ConnectionTrait>(
    conn: &C,
    bucket: Bucket,
    key: &str,
    value: &str,
) -> Result<(), DbErr> {
    with_bucket!(bucket, m => {
        m::Entity::insert(m::ActiveModel {
            key: Set(key.to_owned()),
            value: Set(value.to_owned()),
        })
        .on_conflict(
            OnConflict::column(m::Column::Key)
                .update_column(m::Column::Value)
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;
        Ok(())
    })
}

async fn delete_in<C: ConnectionTrait>(conn: &C, bucket: Bucket, key: &str) -> Result<bool, DbErr> {
    with_bucket!(bucket, m => {
        let res = m::Entity::delete_by_id(key.to_owned()).exec(conn).await?;
        Ok(res.rows_affected > 0)
    })
}

async fn scan_in<C: ConnectionTrait>(
    conn: &C,
    bucket: Bucket,
    prefix: &str,
) -> Result<Vec<(String, String)>, DbErr> {
    with_bucket!(bucket, m => {
        let rows = m::Entity::find()
            .filter(m::Column::Key.starts_with(prefix))
            .order_by_asc(m::Column::Key)
            .all(conn)
            .await?;
        // LIKE 在 SQLite 中不区分大小写，这里再精确过滤一次
        Ok(rows
            .into_iter()
            .filter(|row| row.key.starts_with(prefix))
            .map(|row| (row.key, row.value))
            .collect())
    })
}

async fn read_counter<C: ConnectionTrait>(conn: &C, name: &str) -> Result<i64, DbErr> {
    Ok(counter::Entity::find_by_id(name.to_owned())
        .one(conn)
        .await?
        .map(|row| row.value)
        .unwrap_or(0))
}

async fn write_counter<C: ConnectionTrait>(conn: &C, name: &str, value: i64) -> Result<(), DbErr> {
    counter::Entity::insert(counter::ActiveModel {
        name: Set(name.to_owned()),
        value: Set(value),
    })
    .on_conflict(
        OnConflict::column(counter::Column::Name)
            .update_column(counter::Column::Value)
            .to_owned(),
    )
    .exec_without_returning(conn)
    .await?;
    Ok(())
}

/// 持久化键值存储
///
/// 读操作直接走连接池；多键写入通过 [`KvStore::begin`] 获得的 [`WriteTxn`] 完成，
/// 写事务之间由内部互斥锁串行化，提交后才返回。
pub struct KvStore {
    db: DatabaseConnection,
    write_lock: Mutex<()>,
}

impl KvStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            write_lock: Mutex::new(()),
        }
    }

    /// 打开数据库文件并建表
    pub async fn open(path: &str) -> BridgeResult<Self> {
        let db = super::connect(path).await?;
        super::init_schema(&db).await?;
        Ok(Self::new(db))
    }

    /// 打开内存数据库并建表 (测试及临时运行)
    pub async fn open_in_memory() -> BridgeResult<Self> {
        let db = super::connect_memory().await?;
        super::init_schema(&db).await?;
        Ok(Self::new(db))
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn get(&self, bucket: Bucket, key: &str) -> BridgeResult<Option<String>> {
        Ok(get_in(&self.db, bucket, key).await?)
    }

    /// 单键写入 (覆盖)
    pub async fn put(&self, bucket: Bucket, key: &str, value: &str) -> BridgeResult<()> {
        let _guard = self.write_lock.lock().await;
        Ok(put_in(&self.db, bucket, key, value).await?)
    }

    pub async fn delete(&self, bucket: Bucket, key: &str) -> BridgeResult<bool> {
        let _guard = self.write_lock.lock().await;
        Ok(delete_in(&self.db, bucket, key).await?)
    }

    /// 按键前缀有序扫描
    pub async fn scan_prefix(&self, bucket: Bucket, prefix: &str) -> BridgeResult<Vec<(String, String)>> {
        Ok(scan_in(&self.db, bucket, prefix).await?)
    }

    /// 当前计数器值 (从未分配过时为 0)
    pub async fn counter(&self, name: &str) -> BridgeResult<i64> {
        Ok(read_counter(&self.db, name).await?)
    }

    /// 开启写事务
    pub async fn begin(&self) -> BridgeResult<WriteTxn<'_>> {
        let guard = self.write_lock.lock().await;
        let txn = self.db.begin().await?;
        Ok(WriteTxn {
            _guard: guard,
            txn,
        })
    }
}

/// 写事务，drop 时未提交则回滚
pub struct WriteTxn<'a> {
    _guard: MutexGuard<'a, ()>,
    txn: DatabaseTransaction,
}

impl WriteTxn<'_> {
    pub async fn get(&self, bucket: Bucket, key: &str) -> BridgeResult<Option<String>> {
        Ok(get_in(&self.txn, bucket, key).await?)
    }

    pub async fn exists(&self, bucket: Bucket, key: &str) -> BridgeResult<bool> {
        Ok(self.get(bucket, key).await?.is_some())
    }

    pub async fn put(&self, bucket: Bucket, key: &str, value: &str) -> BridgeResult<()> {
        Ok(put_in(&self.txn, bucket, key, value).await?)
    }

    pub async fn delete(&self, bucket: Bucket, key: &str) -> BridgeResult<bool> {
        Ok(delete_in(&self.txn, bucket, key).await?)
    }

    /// 分配下一个行号，从 1 开始，永不复用
    pub async fn next_row(&self, name: &str) -> BridgeResult<i64> {
        let next = read_counter(&self.txn, name).await? + 1;
        write_counter(&self.txn, name, next).await?;
        Ok(next)
    }

    /// 把计数器抬高到至少 `floor`
    pub async fn bump_row(&self, name: &str, floor: i64) -> BridgeResult<()> {
        if read_counter(&self.txn, name).await? < floor {
            write_counter(&self.txn, name, floor).await?;
        }
        Ok(())
    }

    pub async fn commit(self) -> BridgeResult<()> {
        self.txn.commit().await?;
        Ok(())
    }
}
