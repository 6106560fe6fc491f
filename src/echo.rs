use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, elapsed};
use crate::debug;
use crate::domain::Domain;

/// 关联令牌 (echo)
///
/// 由网关合成 (`appid_seq`、`appid_vVID`、`appid_g_u`)，或直接使用客户端回传的 echo。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token(String);

impl Token {
    /// 按入站事件序号
    pub fn sequence(app_id: &str, seq: u64) -> Self {
        Self(format!("{}_{}", app_id, seq))
    }

    /// 按虚拟 ID (群号或用户号)，仅网关内部使用，与事件序号分属不同前缀
    pub fn virtual_id(app_id: &str, vid: i64) -> Self {
        Self(format!("{}_v{}", app_id, vid))
    }

    /// 按 群 + 用户
    pub fn pair(app_id: &str, group_vid: i64, user_vid: i64) -> Self {
        Self(format!("{}_{}_{}", app_id, group_vid, user_vid))
    }

    pub fn explicit(echo: impl Into<String>) -> Self {
        Self(echo.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 回复一个入站事件所需的上下文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
    pub domain: Domain,
    pub message_id: String,
    pub event_id: Option<String>,
}

#[derive(Debug, Clone)]
struct Stamped<T> {
    value: T,
    at: DateTime<Utc>,
}

fn sweep_map<V>(map: &DashMap<String, Stamped<V>>, retention: Duration, now: DateTime<Utc>) -> usize {
    // 先收集再逐个删除，删除时重新判断时间，避免误删刚被覆盖的条目
    let expired: Vec<String> = map
        .iter()
        .filter(|e| elapsed(e.value().at, retention, now))
        .map(|e| e.key().clone())
        .collect();

    let mut removed = 0;
    for key in expired {
        if map.remove_if(&key, |_, v| elapsed(v.at, retention, now)).is_some() {
            removed += 1;
        }
    }
    removed
}

/// 事件关联存储
///
/// 所有写入都是覆盖式 upsert；超过保留时长的条目对读取不可见，
/// 并由后台清理任务定期删除。
pub struct CorrelationStore {
    clock: Arc<dyn Clock>,
    retention: Duration,
    random_seq: bool,
    domains: DashMap<String, Stamped<Domain>>,
    message_ids: DashMap<String, Stamped<String>>,
    event_ids: DashMap<String, Stamped<String>>,
    texts: DashMap<String, Stamped<String>>,
    msg_seqs: DashMap<String, Stamped<u32>>,
}

impl CorrelationStore {
    pub fn new(clock: Arc<dyn Clock>, retention: Duration, random_seq: bool) -> Self {
        Self {
            clock,
            retention,
            random_seq,
            domains: DashMap::new(),
            message_ids: DashMap::new(),
            event_ids: DashMap::new(),
            texts: DashMap::new(),
            msg_seqs: DashMap::new(),
        }
    }

    fn stamp<T>(&self, value: T) -> Stamped<T> {
        Stamped {
            value,
            at: self.clock.now(),
        }
    }

    fn fresh<V: Clone>(&self, map: &DashMap<String, Stamped<V>>, token: &Token) -> Option<V> {
        let entry = map.get(token.as_str())?;
        if elapsed(entry.at, self.retention, self.clock.now()) {
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn put_echo(&self, token: &Token, domain: Domain) {
        self.domains.insert(token.0.clone(), self.stamp(domain));
    }

    pub fn put_message_id(&self, token: &Token, message_id: &str) {
        self.message_ids
            .insert(token.0.clone(), self.stamp(message_id.to_string()));
    }

    pub fn put_event_id(&self, token: &Token, event_id: &str) {
        self.event_ids
            .insert(token.0.clone(), self.stamp(event_id.to_string()));
    }

    pub fn get_domain(&self, token: &Token) -> Option<Domain> {
        self.fresh(&self.domains, token)
    }

    pub fn get_message_id(&self, token: &Token) -> Option<String> {
        self.fresh(&self.message_ids, token)
    }

    pub fn get_event_id(&self, token: &Token) -> Option<String> {
        self.fresh(&self.event_ids, token)
    }

    /// 一次写入完整关联；`event_id` 为 None 时清除旧的事件 ID
    pub fn correlate(&self, token: &Token, domain: Domain, message_id: &str, event_id: Option<&str>) {
        self.put_echo(token, domain);
        self.put_message_id(token, message_id);
        match event_id.filter(|e| !e.is_empty()) {
            Some(event_id) => self.put_event_id(token, event_id),
            None => {
                self.event_ids.remove(token.as_str());
            }
        }
    }

    pub fn lookup(&self, token: &Token) -> Option<Correlation> {
        Some(Correlation {
            domain: self.get_domain(token)?,
            message_id: self.get_message_id(token)?,
            event_id: self.get_event_id(token),
        })
    }

    /// 双向 echo：记录触发消息原文
    pub fn put_echo_text(&self, token: &Token, text: &str) {
        self.texts.insert(token.0.clone(), self.stamp(text.to_string()));
    }

    pub fn echo_text(&self, token: &Token) -> Option<String> {
        self.fresh(&self.texts, token)
    }

    /// 对同一条平台消息的被动回复序号，严格递增
    pub fn next_msg_seq(&self, message_id: &str) -> u32 {
        let now = self.clock.now();
        let start = if self.random_seq {
            rand::rng().random_range(1..=10000u32)
        } else {
            1
        };

        let mut slot = self
            .msg_seqs
            .entry(message_id.to_string())
            .or_insert_with(|| Stamped {
                value: start - 1,
                at: now,
            });
        if elapsed(slot.at, self.retention, now) {
            slot.value = start - 1;
        }
        slot.value = slot.value.saturating_add(1);
        slot.at = now;
        slot.value
    }

    /// 删除过期条目，返回删除数量
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let removed = sweep_map(&self.domains, self.retention, now)
            + sweep_map(&self.message_ids, self.retention, now)
            + sweep_map(&self.event_ids, self.retention, now)
            + sweep_map(&self.texts, self.retention, now)
            + sweep_map(&self.msg_seqs, self.retention, now);
        debug!(target: "Echo", "清理过期关联 {} 条", removed);
        removed
    }

    /// 当前保存的关联条数 (含尚未清理的过期条目)
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store(random_seq: bool) -> (Arc<ManualClock>, CorrelationStore) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = CorrelationStore::new(clock.clone(), Duration::from_secs(300), random_seq);
        (clock, store)
    }

    #[test]
    fn token_shapes() {
        assert_eq!(Token::sequence("1", 42).as_str(), "1_42");
        assert_eq!(Token::virtual_id("1", 100).as_str(), "1_v100");
        assert_ne!(Token::virtual_id("1", 4), Token::sequence("1", 4));
        assert_eq!(Token::pair("1", 100, 200).as_str(), "1_100_200");
        assert_eq!(Token::explicit("abc").to_string(), "abc");
    }

    #[test]
    fn correlate_then_lookup_until_retention() {
        let (clock, store) = store(false);
        let token = Token::sequence("1", 42);

        store.correlate(&token, Domain::Group, "m1", Some("e1"));
        assert_eq!(
            store.lookup(&token),
            Some(Correlation {
                domain: Domain::Group,
                message_id: "m1".into(),
                event_id: Some("e1".into()),
            })
        );

        clock.advance(Duration::from_secs(299));
        assert!(store.lookup(&token).is_some());

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.lookup(&token), None);
        assert_eq!(store.get_domain(&token), None);
    }

    #[test]
    fn last_write_wins() {
        let (_, store) = store(false);
        let token = Token::virtual_id("1", 100);

        store.correlate(&token, Domain::Group, "m1", Some("e1"));
        store.correlate(&token, Domain::GuildChannel, "m2", None);

        let c = store.lookup(&token).unwrap();
        assert_eq!(c.domain, Domain::GuildChannel);
        assert_eq!(c.message_id, "m2");
        assert_eq!(c.event_id, None);
    }

    #[test]
    fn partial_entries_do_not_form_a_correlation() {
        let (_, store) = store(false);
        let token = Token::explicit("only-domain");
        store.put_echo(&token, Domain::GuildPrivate);

        assert_eq!(store.get_domain(&token), Some(Domain::GuildPrivate));
        assert_eq!(store.get_message_id(&token), None);
        assert_eq!(store.lookup(&token), None);
    }

    #[test]
    fn sweep_removes_only_expired() {
        let (clock, store) = store(false);
        store.correlate(&Token::explicit("old"), Domain::Group, "m1", Some("e"));
        store.put_echo_text(&Token::explicit("old"), "hello");
        clock.advance(Duration::from_secs(200));
        store.correlate(&Token::explicit("new"), Domain::Group, "m2", None);
        clock.advance(Duration::from_secs(150));

        // old: domain + message + event + text
        assert_eq!(store.sweep(), 4);
        assert_eq!(store.len(), 1);
        assert!(store.lookup(&Token::explicit("new")).is_some());
        assert_eq!(store.sweep(), 0);
    }

    #[test]
    fn echo_text_round_trips() {
        let (_, store) = store(false);
        let token = Token::sequence("1", 7);
        store.put_echo_text(&token, "签到");
        assert_eq!(store.echo_text(&token).as_deref(), Some("签到"));
        assert_eq!(store.echo_text(&Token::sequence("1", 8)), None);
    }

    #[test]
    fn msg_seq_increments_per_message() {
        let (clock, store) = store(false);
        assert_eq!(store.next_msg_seq("m1"), 1);
        assert_eq!(store.next_msg_seq("m1"), 2);
        assert_eq!(store.next_msg_seq("m2"), 1);

        clock.advance(Duration::from_secs(301));
        assert_eq!(store.next_msg_seq("m1"), 1);
    }

    #[test]
    fn random_msg_seq_starts_in_range_and_increments() {
        let (_, store) = store(true);
        let first = store.next_msg_seq("m1");
        assert!((1..=10000).contains(&first));
        assert_eq!(store.next_msg_seq("m1"), first + 1);
    }

    #[test]
    fn sweep_under_concurrent_traffic_hides_only_expired_entries() {
        let (clock, store) = store(false);
        let store = Arc::new(store);
        for seq in 0..200 {
            store.correlate(&Token::sequence("1", seq), Domain::Group, "old", None);
        }
        clock.advance(Duration::from_secs(301));

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for seq in 1000..1200 {
                    store.correlate(&Token::sequence("1", seq), Domain::GuildChannel, "new", None);
                }
            })
        };
        let reader = {
            let store = store.clone();
            std::thread::spawn(move || {
                (0..200)
                    .filter(|seq| store.lookup(&Token::sequence("1", *seq)).is_some())
                    .count()
            })
        };
        let swept = store.sweep();
        writer.join().unwrap();
        let visible_old = reader.join().unwrap();

        assert_eq!(visible_old, 0);
        assert!(swept <= 400);
        store.sweep();
        for seq in 0..200 {
            assert_eq!(store.lookup(&Token::sequence("1", seq)), None);
        }
        for seq in 1000..1200 {
            let c = store.lookup(&Token::sequence("1", seq)).unwrap();
            assert_eq!(c.message_id, "new");
        }
        assert_eq!(store.len(), 200);
    }
}
