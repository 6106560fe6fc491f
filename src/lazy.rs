use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;

#[derive(Debug, Clone)]
struct Window {
    message_id: String,
    expires_at: DateTime<Utc>,
    replies_used: u32,
    /// 入站事件序号，手动刷新时为 None
    sequence: Option<u64>,
}

/// 被动回复窗口
///
/// 每个会话只保留最近一条可回复的消息；过期或次数用尽后不再返回。
pub struct LazyReplyWindow {
    clock: Arc<dyn Clock>,
    window: Duration,
    max_replies: u32,
    entries: DashMap<String, Window>,
}

impl LazyReplyWindow {
    /// `max_replies` 为 0 表示不限次数
    pub fn new(clock: Arc<dyn Clock>, window: Duration, max_replies: u32) -> Self {
        Self {
            clock,
            window,
            max_replies,
            entries: DashMap::new(),
        }
    }

    fn expires_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.window)
            .ok()
            .and_then(|w| now.checked_add_signed(w))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn usable(&self, w: &Window, now: DateTime<Utc>) -> bool {
        now < w.expires_at && (self.max_replies == 0 || w.replies_used < self.max_replies)
    }

    fn fresh(&self, message_id: &str, now: DateTime<Utc>, sequence: Option<u64>) -> Window {
        Window {
            message_id: message_id.to_string(),
            expires_at: self.expires_from(now),
            replies_used: 0,
            sequence,
        }
    }

    /// 收到入站消息时刷新窗口 (后到的覆盖先到的)
    pub fn refresh(&self, key: &str, message_id: &str) {
        let now = self.clock.now();
        self.entries
            .insert(key.to_string(), self.fresh(message_id, now, None));
    }

    /// 按事件序号刷新：窗口未过期且已记录更新的事件时忽略，返回是否生效
    ///
    /// 同一会话的事件可能并发处理、乱序完成，序号保证最后到达的事件留在窗口里。
    pub fn refresh_at(&self, key: &str, message_id: &str, sequence: u64) -> bool {
        let now = self.clock.now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| self.fresh(message_id, now, Some(sequence)));
        let w = entry.value_mut();
        if now < w.expires_at && w.sequence.is_some_and(|s| s > sequence) {
            return false;
        }
        *w = self.fresh(message_id, now, Some(sequence));
        true
    }

    /// 一次占用最多 `want` 个回复次数，返回消息 ID 与实际占用的次数
    pub fn reserve(&self, key: &str, want: usize) -> Option<(String, usize)> {
        let now = self.clock.now();
        let mut w = self.entries.get_mut(key)?;
        if now >= w.expires_at || want == 0 {
            return None;
        }
        let granted = if self.max_replies == 0 {
            want
        } else {
            let left = self.max_replies.saturating_sub(w.replies_used) as usize;
            want.min(left)
        };
        if granted == 0 {
            return None;
        }
        w.replies_used = w.replies_used.saturating_add(granted as u32);
        Some((w.message_id.clone(), granted))
    }

    /// 取可回复的消息 ID 并占用一次回复次数
    pub fn try_reply(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        {
            let mut w = self.entries.get_mut(key)?;
            if now < w.expires_at {
                if self.max_replies != 0 && w.replies_used >= self.max_replies {
                    return None;
                }
                w.replies_used += 1;
                return Some(w.message_id.clone());
            }
        }
        // 已过期，顺手删除
        self.entries.remove_if(key, |_, w| now >= w.expires_at);
        None
    }

    /// 只读查询，不占用次数
    pub fn peek(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .filter(|w| self.usable(w, now))
            .map(|w| w.message_id.clone())
    }

    /// 删除已过期的窗口，返回删除数量
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, w| now < w.expires_at);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
