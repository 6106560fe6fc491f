use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::Duration;

/// 时间来源，所有过期判断都经由它取当前时间，便于测试中模拟时钟
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// 系统时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 手动推进的时钟
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// 以当前系统时间为起点
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// `at` 加上 `span` 之后是否已经不晚于 `now`
pub(crate) fn elapsed(at: DateTime<Utc>, span: Duration, now: DateTime<Utc>) -> bool {
    match chrono::Duration::from_std(span) {
        Ok(span) => at + span <= now,
        Err(_) => false,
    }
}
