use dashmap::DashMap;
use std::sync::Arc;

use crate::db::{Bucket, KvStore, WriteTxn};
use crate::error::{BridgeError, BridgeResult};
use crate::warn;

const ROW_COUNTER: &str = "idmap";

// hash 模式下候选 ID 的位数范围
const HASH_MIN_DIGITS: usize = 9;
const HASH_MAX_DIGITS: usize = 18;

/// 复合键 `会话:成员`，成员的虚拟 ID 只在所属会话内有效
pub fn composite_key(conversation: &str, actor: &str) -> String {
    format!("{}:{}", conversation, actor)
}

fn meta_key(section: &str, name: &str) -> String {
    format!("{}:{}", section, name)
}

/// 取 md5 十六进制中的数字字符，截取前 `digits` 位，不足补 0
fn hash_candidate(raw: &str, digits: usize) -> Option<i64> {
    let hex = format!("{:x}", md5::compute(raw.as_bytes()));
    let mut s: String = hex.chars().filter(|c| c.is_ascii_digit()).take(digits).collect();
    while s.len() < digits {
        s.push('0');
    }
    s.parse::<i64>().ok().filter(|v| *v > 0)
}

/// 原始 ID 与虚拟 ID 的双向映射
///
/// 所有写入在返回前已经提交到 [`KvStore`]；内存缓存只加速读取。
pub struct IdVirtualizer {
    store: Arc<KvStore>,
    hash_mode: bool,
    forward_cache: DashMap<String, i64>,
    reverse_cache: DashMap<i64, String>,
}

impl IdVirtualizer {
    pub fn new(store: Arc<KvStore>, hash_mode: bool) -> Self {
        Self {
            store,
            hash_mode,
            forward_cache: DashMap::new(),
            reverse_cache: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    fn remember(&self, raw: &str, vid: i64) {
        self.forward_cache.insert(raw.to_string(), vid);
        self.reverse_cache.insert(vid, raw.to_string());
    }

    fn parse_vid(raw: &str, value: &str) -> BridgeResult<i64> {
        value
            .parse::<i64>()
            .map_err(|_| BridgeError::StoreUnavailable(format!("映射损坏: {} -> {}", raw, value)))
    }

    /// 在事务内取已有映射或分配新 ID
    async fn get_or_allocate(&self, txn: &WriteTxn<'_>, raw: &str) -> BridgeResult<(i64, bool)> {
        if let Some(value) = txn.get(Bucket::Forward, raw).await? {
            return Ok((Self::parse_vid(raw, &value)?, false));
        }

        let vid = if self.hash_mode {
            self.allocate_hashed(txn, raw).await?
        } else {
            self.allocate_row(txn).await?
        };

        let vid_key = vid.to_string();
        txn.put(Bucket::Forward, raw, &vid_key).await?;
        txn.put(Bucket::Reverse, &vid_key, raw).await?;
        Ok((vid, true))
    }

    async fn allocate_row(&self, txn: &WriteTxn<'_>) -> BridgeResult<i64> {
        // 行号可能已被 hash 模式或改绑占用，跳过即可
        loop {
            let row = txn.next_row(ROW_COUNTER).await?;
            if !txn.exists(Bucket::Reverse, &row.to_string()).await? {
                return Ok(row);
            }
        }
    }

    async fn allocate_hashed(&self, txn: &WriteTxn<'_>, raw: &str) -> BridgeResult<i64> {
        for digits in HASH_MIN_DIGITS..=HASH_MAX_DIGITS {
            let Some(candidate) = hash_candidate(raw, digits) else {
                continue;
            };
            if !txn.exists(Bucket::Reverse, &candidate.to_string()).await? {
                return Ok(candidate);
            }
        }
        Err(BridgeError::StoreUnavailable(format!(
            "无可用的 hash ID: {}",
            raw
        )))
    }

    /// 取得原始 ID 对应的虚拟 ID，首次出现时分配
    pub async fn store_id(&self, raw: &str) -> BridgeResult<i64> {
        if let Some(vid) = self.forward_cache.get(raw) {
            return Ok(*vid);
        }
        if let Some(vid) = self.lookup(raw).await? {
            return Ok(vid);
        }

        let txn = self.store.begin().await?;
        let (vid, _) = self.get_or_allocate(&txn, raw).await?;
        txn.commit().await?;

        self.remember(raw, vid);
        Ok(vid)
    }

    /// pro 模式：同时分配会话 ID 与会话内成员 ID，二者在同一事务中提交
    pub async fn store_id_pair(&self, conversation: &str, actor: &str) -> BridgeResult<(i64, i64)> {
        let composite = composite_key(conversation, actor);
        if let (Some(c), Some(a)) = (
            self.forward_cache.get(conversation).map(|v| *v),
            self.forward_cache.get(&composite).map(|v| *v),
        ) {
            return Ok((c, a));
        }

        let txn = self.store.begin().await?;
        let (conv_vid, _) = self.get_or_allocate(&txn, conversation).await?;
        let (actor_vid, _) = self.get_or_allocate(&txn, &composite).await?;
        txn.commit().await?;

        self.remember(conversation, conv_vid);
        self.remember(&composite, actor_vid);
        Ok((conv_vid, actor_vid))
    }

    /// 只查询，不分配
    pub async fn lookup(&self, raw: &str) -> BridgeResult<Option<i64>> {
        if let Some(vid) = self.forward_cache.get(raw) {
            return Ok(Some(*vid));
        }
        match self.store.get(Bucket::Forward, raw).await? {
            Some(value) => {
                let vid = Self::parse_vid(raw, &value)?;
                self.remember(raw, vid);
                Ok(Some(vid))
            }
            None => Ok(None),
        }
    }

    /// 虚拟 ID 还原为原始 ID
    pub async fn resolve(&self, vid: i64) -> BridgeResult<String> {
        if let Some(raw) = self.reverse_cache.get(&vid) {
            return Ok(raw.clone());
        }
        match self.store.get(Bucket::Reverse, &vid.to_string()).await? {
            Some(raw) => {
                self.remember(&raw, vid);
                Ok(raw)
            }
            None => Err(BridgeError::KeyNotFound(format!("虚拟 ID {}", vid))),
        }
    }

    /// pro 模式的反查，返回 (会话原始 ID, 成员原始 ID)
    pub async fn resolve_pair(&self, conv_vid: i64, actor_vid: i64) -> BridgeResult<(String, String)> {
        let conversation = self.resolve(conv_vid).await?;
        let actor_key = self.resolve(actor_vid).await?;

        let prefix = format!("{}:", conversation);
        if let Some(actor) = actor_key.strip_prefix(&prefix) {
            return Ok((conversation, actor.to_string()));
        }
        // 非复合键 (私聊等场景按普通 ID 存储)
        if !actor_key.contains(':') {
            return Ok((conversation, actor_key));
        }
        Err(BridgeError::KeyNotFound(format!(
            "成员 {} 不属于会话 {}",
            actor_vid, conv_vid
        )))
    }

    /// 原始 ID 与虚拟 ID 当前是否互相绑定
    pub async fn check_bound(&self, raw: &str, vid: i64) -> bool {
        match self.lookup(raw).await {
            Ok(found) => found == Some(vid),
            Err(e) => {
                warn!(target: "IdMap", "检查绑定失败 {}: {}", raw, e);
                false
            }
        }
    }

    /// 会话内出现过的全部成员原始 ID
    pub async fn actors_of(&self, conversation: &str) -> BridgeResult<Vec<String>> {
        let prefix = format!("{}:", conversation);
        let rows = self.store.scan_prefix(Bucket::Forward, &prefix).await?;
        Ok(rows
            .into_iter()
            .filter_map(|(key, _)| key.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    /// 把 `old_vid` 绑定的原始 ID 改绑到 `new_vid`
    pub async fn rebind(&self, old_vid: i64, new_vid: i64) -> BridgeResult<()> {
        let old_key = old_vid.to_string();
        let new_key = new_vid.to_string();

        let txn = self.store.begin().await?;
        let raw = txn
            .get(Bucket::Reverse, &old_key)
            .await?
            .ok_or_else(|| BridgeError::KeyNotFound(format!("虚拟 ID {}", old_vid)))?;
        if old_vid == new_vid {
            return Ok(());
        }
        if txn.exists(Bucket::Reverse, &new_key).await? {
            return Err(BridgeError::VirtualIdTaken(new_vid));
        }

        txn.put(Bucket::Forward, &raw, &new_key).await?;
        txn.delete(Bucket::Reverse, &old_key).await?;
        txn.put(Bucket::Reverse, &new_key, &raw).await?;
        txn.bump_row(ROW_COUNTER, new_vid).await?;
        txn.commit().await?;

        self.reverse_cache.remove(&old_vid);
        self.remember(&raw, new_vid);
        Ok(())
    }

    // ================= 会话附加信息 =================

    pub async fn write_meta(&self, section: &str, name: &str, value: &str) -> BridgeResult<()> {
        self.store
            .put(Bucket::Meta, &meta_key(section, name), value)
            .await
    }

    pub async fn read_meta(&self, section: &str, name: &str) -> BridgeResult<Option<String>> {
        self.store.get(Bucket::Meta, &meta_key(section, name)).await
    }

    pub async fn delete_meta(&self, section: &str, name: &str) -> BridgeResult<bool> {
        self.store.delete(Bucket::Meta, &meta_key(section, name)).await
    }

    /// 所有 `name` 字段等于 `value` 的会话，如某个 guild 下的全部子频道
    pub async fn sections_with(&self, name: &str, value: &str) -> BridgeResult<Vec<String>> {
        let rows = self.store.scan_prefix(Bucket::Meta, "").await?;
        Ok(rows
            .into_iter()
            .filter(|(_, v)| v == value)
            .filter_map(|(key, _)| {
                key.rsplit_once(':')
                    .filter(|(_, field)| *field == name)
                    .map(|(section, _)| section.to_string())
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn virtualizer(hash_mode: bool) -> IdVirtualizer {
        let store = Arc::new(KvStore::open_in_memory().await.unwrap());
        IdVirtualizer::new(store, hash_mode)
    }

    #[tokio::test]
    async fn store_is_idempotent_and_round_trips() {
        let ids = virtualizer(false).await;

        let a = ids.store_id("E3A7C1F09B2D4").await.unwrap();
        let b = ids.store_id("77F0AA12C9").await.unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(ids.store_id("E3A7C1F09B2D4").await.unwrap(), a);

        assert_eq!(ids.resolve(a).await.unwrap(), "E3A7C1F09B2D4");
        assert_eq!(ids.resolve(b).await.unwrap(), "77F0AA12C9");
    }

    #[tokio::test]
    async fn unknown_vid_is_recoverable_not_found() {
        let ids = virtualizer(false).await;
        let err = ids.resolve(999).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.is_recoverable());
        assert_eq!(ids.lookup("never-seen").await.unwrap(), None);
    }

    #[tokio::test]
    async fn mapping_survives_cold_cache() {
        let store = Arc::new(KvStore::open_in_memory().await.unwrap());
        let vid = IdVirtualizer::new(store.clone(), false)
            .store_id("raw-1")
            .await
            .unwrap();

        let fresh = IdVirtualizer::new(store, false);
        assert_eq!(fresh.resolve(vid).await.unwrap(), "raw-1");
        assert_eq!(fresh.store_id("raw-1").await.unwrap(), vid);
        assert_eq!(fresh.store_id("raw-2").await.unwrap(), vid + 1);
    }

    #[tokio::test]
    async fn hash_mode_is_deterministic_and_wide() {
        let ids = virtualizer(true).await;
        let vid = ids.store_id("C2C_OPENID_A").await.unwrap();
        assert_eq!(Some(vid), hash_candidate("C2C_OPENID_A", HASH_MIN_DIGITS));
        assert!(vid > 0);
        assert_eq!(ids.store_id("C2C_OPENID_A").await.unwrap(), vid);
        assert_eq!(ids.resolve(vid).await.unwrap(), "C2C_OPENID_A");
    }

    #[tokio::test]
    async fn hash_collision_steps_to_longer_candidate() {
        let ids = virtualizer(true).await;
        let taken = hash_candidate("victim", HASH_MIN_DIGITS).unwrap();
        ids.store()
            .put(Bucket::Reverse, &taken.to_string(), "squatter")
            .await
            .unwrap();

        let vid = ids.store_id("victim").await.unwrap();
        assert_ne!(vid, taken);
        assert_eq!(Some(vid), hash_candidate("victim", HASH_MIN_DIGITS + 1));
    }

    #[test]
    fn hash_candidate_pads_short_digit_runs() {
        let v = hash_candidate("anything", HASH_MAX_DIGITS).unwrap();
        assert!(v.to_string().len() <= HASH_MAX_DIGITS);
    }

    #[tokio::test]
    async fn pair_mode_scopes_actor_to_conversation() {
        let ids = virtualizer(false).await;

        let (g1, a1) = ids.store_id_pair("g1", "u1").await.unwrap();
        let (g2, a2) = ids.store_id_pair("g2", "u1").await.unwrap();
        assert_ne!(g1, g2);
        assert_ne!(a1, a2);

        assert_eq!(ids.store_id_pair("g1", "u1").await.unwrap(), (g1, a1));
        assert_eq!(ids.store_id("g1").await.unwrap(), g1);

        assert_eq!(
            ids.resolve_pair(g1, a1).await.unwrap(),
            ("g1".to_string(), "u1".to_string())
        );
        assert!(ids.resolve_pair(g1, a2).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn actors_are_listed_per_conversation() {
        let ids = virtualizer(false).await;
        ids.store_id_pair("g1", "u2").await.unwrap();
        ids.store_id_pair("g1", "u1").await.unwrap();
        ids.store_id_pair("g10", "u3").await.unwrap();

        assert_eq!(ids.actors_of("g1").await.unwrap(), vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn check_bound_follows_rebind() {
        let ids = virtualizer(false).await;
        let a = ids.store_id("raw-a").await.unwrap();
        let b = ids.store_id("raw-b").await.unwrap();
        assert!(ids.check_bound("raw-a", a).await);
        assert!(!ids.check_bound("raw-a", b).await);

        assert_eq!(
            ids.rebind(a, b).await.unwrap_err(),
            BridgeError::VirtualIdTaken(b)
        );
        assert!(ids.rebind(404, 500).await.unwrap_err().is_not_found());

        ids.rebind(a, 500).await.unwrap();
        assert!(ids.check_bound("raw-a", 500).await);
        assert!(!ids.check_bound("raw-a", a).await);
        assert!(ids.resolve(a).await.unwrap_err().is_not_found());
        assert_eq!(ids.resolve(500).await.unwrap(), "raw-a");

        // 改绑后的号段不会再被分配
        assert_eq!(ids.store_id("raw-c").await.unwrap(), 501);
    }

    #[tokio::test]
    async fn meta_sections_by_value() {
        let ids = virtualizer(false).await;
        ids.write_meta("chan-1", "guild_id", "G").await.unwrap();
        ids.write_meta("chan-2", "guild_id", "G").await.unwrap();
        ids.write_meta("chan-3", "guild_id", "H").await.unwrap();
        ids.write_meta("chan-1", "type", "guild").await.unwrap();

        assert_eq!(
            ids.sections_with("guild_id", "G").await.unwrap(),
            vec!["chan-1", "chan-2"]
        );
        assert_eq!(
            ids.read_meta("chan-1", "type").await.unwrap().as_deref(),
            Some("guild")
        );
        assert!(ids.delete_meta("chan-1", "type").await.unwrap());
        assert_eq!(ids.read_meta("chan-1", "type").await.unwrap(), None);
    }
}
