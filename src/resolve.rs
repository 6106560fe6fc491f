use async_trait::async_trait;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::Domain;
use crate::echo::{CorrelationStore, Token};
use crate::error::{BridgeError, BridgeResult};
use crate::gateway::TransportError;
use crate::idmap::IdVirtualizer;
use crate::scheduler::Shutdown;
use crate::{debug, error, warn};

/// 猜测间隔的等待方式，测试中可替换为不真正休眠的实现
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// 每个虚拟 ID 的猜测状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// 剩余可猜测次数
    Remaining(u8),
    /// 已确认类型，不再猜测
    Latched(Domain),
}

/// 一次出站调用携带的类型线索
#[derive(Debug, Clone, Default)]
pub struct Signals {
    /// 猜测计数挂在这个虚拟 ID 上
    pub vid: Option<i64>,
    /// 调用中显式给出的 message_type
    pub explicit: Option<Domain>,
    /// 客户端回传的 echo
    pub echo: Option<Token>,
    /// `appid_vVID`
    pub vid_token: Option<Token>,
    /// 会话原始 ID，用于读取持久化的 `type`
    pub raw: Option<String>,
}

/// 类型从哪里得到
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Explicit,
    Echo,
    VirtualId,
    Persisted,
    Latched,
    Guessed,
}

/// 一次发送尝试的结果
#[derive(Debug)]
pub struct Attempted<R> {
    pub domain: Domain,
    pub source: Source,
    pub outcome: Result<R, TransportError>,
}

/// 消息类型判定
///
/// 判定顺序固定为：echo → `appid_vVID` → 持久化的 `type` → 调用中的 `message_type` → 已锁定类型 → 有限次猜测。
/// 猜测按 群 → 频道 → 频道私信 的顺序每种最多尝试一次，尝试之间等待 `delay`，
/// 等待过程中收到关闭信号则返回 [`BridgeError::Cancelled`]。
pub struct TypeResolver {
    echoes: Arc<CorrelationStore>,
    ids: Arc<IdVirtualizer>,
    counters: DashMap<i64, Counter>,
    delay: Duration,
    max_attempts: u8,
    sleeper: Arc<dyn Sleeper>,
    shutdown: Shutdown,
}

impl TypeResolver {
    pub fn new(
        echoes: Arc<CorrelationStore>,
        ids: Arc<IdVirtualizer>,
        delay: Duration,
        max_attempts: u8,
        sleeper: Arc<dyn Sleeper>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            echoes,
            ids,
            counters: DashMap::new(),
            delay,
            max_attempts,
            sleeper,
            shutdown,
        }
    }

    pub fn counter(&self, vid: i64) -> Option<Counter> {
        self.counters.get(&vid).map(|c| *c)
    }

    /// 不发送任何请求，仅凭已有线索判定
    ///
    /// 关联记录优先于客户端给出的 `message_type`：OneBot 的 `private`/`group`
    /// 无法区分单聊与频道私信、群与子频道，只作为提示使用。
    pub async fn known(&self, signals: &Signals) -> Option<(Domain, Source)> {
        if let Some(domain) = signals.echo.as_ref().and_then(|t| self.echoes.get_domain(t)) {
            return Some((domain, Source::Echo));
        }
        if let Some(domain) = signals
            .vid_token
            .as_ref()
            .and_then(|t| self.echoes.get_domain(t))
        {
            return Some((domain, Source::VirtualId));
        }
        if let Some(raw) = &signals.raw {
            match self.ids.read_meta(raw, "type").await {
                Ok(Some(stored)) => match stored.parse::<Domain>() {
                    Ok(domain) => return Some((domain, Source::Persisted)),
                    Err(e) => warn!(target: "Resolve", "{} 的 type 无效: {}", raw, e),
                },
                Ok(None) => {}
                Err(e) => warn!(target: "Resolve", "读取 {} 的 type 失败: {}", raw, e),
            }
        }
        if let Some(domain) = signals.explicit {
            return Some((domain, Source::Explicit));
        }
        if let Some(Counter::Latched(domain)) = signals.vid.and_then(|v| self.counter(v)) {
            return Some((domain, Source::Latched));
        }
        None
    }

    /// 判定类型并执行发送；类型未知时按顺序猜测
    pub async fn dispatch<R, F, Fut>(&self, signals: &Signals, mut attempt: F) -> BridgeResult<Attempted<R>>
    where
        F: FnMut(Domain) -> Fut,
        Fut: Future<Output = Result<R, TransportError>>,
    {
        if let Some((domain, source)) = self.known(signals).await {
            let outcome = attempt(domain).await;
            return Ok(Attempted {
                domain,
                source,
                outcome,
            });
        }

        let Some(vid) = signals.vid else {
            return Err(BridgeError::DomainUnresolvable {
                id: 0,
                tried: Vec::new(),
            });
        };
        self.guess(vid, signals, attempt).await
    }

    async fn guess<R, F, Fut>(&self, vid: i64, signals: &Signals, mut attempt: F) -> BridgeResult<Attempted<R>>
    where
        F: FnMut(Domain) -> Fut,
        Fut: Future<Output = Result<R, TransportError>>,
    {
        let mut tried = Vec::new();

        for domain in Domain::GUESS_ORDER {
            match self.take_attempt(vid) {
                Step::Go => {}
                Step::Exhausted => break,
                Step::Latched(other) => {
                    // 并发调用已经确认了类型
                    let outcome = attempt(other).await;
                    return Ok(Attempted {
                        domain: other,
                        source: Source::Latched,
                        outcome,
                    });
                }
            }

            if !tried.is_empty() {
                self.pause().await?;
            }

            tried.push(domain);
            debug!(target: "Resolve", "猜测 {} 的类型: {}", vid, domain);

            match attempt(domain).await {
                Ok(receipt) => {
                    self.confirm(vid, domain, signals).await;
                    return Ok(Attempted {
                        domain,
                        source: Source::Guessed,
                        outcome: Ok(receipt),
                    });
                }
                Err(TransportError::QuotaExceeded) => {
                    // 平台认出了目标，只是额度不足
                    self.confirm(vid, domain, signals).await;
                    return Ok(Attempted {
                        domain,
                        source: Source::Guessed,
                        outcome: Err(TransportError::QuotaExceeded),
                    });
                }
                Err(TransportError::Rejected(reason)) => {
                    debug!(target: "Resolve", "{} 不是 {}: {}", vid, domain, reason);
                }
            }
        }

        self.counters
            .remove_if(&vid, |_, c| matches!(c, Counter::Remaining(_)));
        error!(target: "Resolve", "无法确定 {} 的类型，已尝试 {:?}", vid, tried);
        Err(BridgeError::DomainUnresolvable { id: vid, tried })
    }

    fn take_attempt(&self, vid: i64) -> Step {
        let mut counter = self
            .counters
            .entry(vid)
            .or_insert(Counter::Remaining(self.max_attempts));
        match *counter {
            Counter::Latched(domain) => Step::Latched(domain),
            Counter::Remaining(0) => Step::Exhausted,
            Counter::Remaining(n) => {
                *counter = Counter::Remaining(n - 1);
                Step::Go
            }
        }
    }

    async fn confirm(&self, vid: i64, domain: Domain, signals: &Signals) {
        self.counters.insert(vid, Counter::Latched(domain));
        if let Some(token) = &signals.vid_token {
            self.echoes.put_echo(token, domain);
        }
        if let Some(raw) = &signals.raw
            && let Err(e) = self.ids.write_meta(raw, "type", domain.as_str()).await
        {
            warn!(target: "Resolve", "保存 {} 的 type 失败: {}", raw, e);
        }
    }

    async fn pause(&self) -> BridgeResult<()> {
        if self.shutdown.is_triggered() {
            return Err(BridgeError::Cancelled);
        }
        tokio::select! {
            _ = self.sleeper.sleep(self.delay) => Ok(()),
            _ = self.shutdown.wait() => Err(BridgeError::Cancelled),
        }
    }
}

enum Step {
    Go,
    Exhausted,
    Latched(Domain),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::KvStore;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    struct PendingSleeper;

    #[async_trait]
    impl Sleeper for PendingSleeper {
        async fn sleep(&self, _: Duration) {
            std::future::pending::<()>().await;
        }
    }

    struct Fixture {
        resolver: TypeResolver,
        echoes: Arc<CorrelationStore>,
        ids: Arc<IdVirtualizer>,
        sleeper: Arc<RecordingSleeper>,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let echoes = Arc::new(CorrelationStore::new(clock, Duration::from_secs(300), false));
        let ids = Arc::new(IdVirtualizer::new(
            Arc::new(KvStore::open_in_memory().await.unwrap()),
            false,
        ));
        let sleeper = Arc::new(RecordingSleeper::default());
        let resolver = TypeResolver::new(
            echoes.clone(),
            ids.clone(),
            Duration::from_millis(300),
            3,
            sleeper.clone(),
            Shutdown::new(),
        );
        Fixture {
            resolver,
            echoes,
            ids,
            sleeper,
        }
    }

    fn signals_for(vid: i64) -> Signals {
        Signals {
            vid: Some(vid),
            vid_token: Some(Token::virtual_id("1", vid)),
            raw: Some(format!("raw-{}", vid)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn correlation_beats_message_type_hint() {
        let f = fixture().await;
        let token = Token::explicit("e");
        f.echoes.put_echo(&token, Domain::GuildPrivate);

        // 客户端对频道私信回复时只能写 "private"
        let signals = Signals {
            explicit: Some(Domain::C2c),
            echo: Some(token),
            ..signals_for(5)
        };
        assert_eq!(
            f.resolver.known(&signals).await,
            Some((Domain::GuildPrivate, Source::Echo))
        );
    }

    #[tokio::test]
    async fn message_type_is_used_when_nothing_is_correlated() {
        let f = fixture().await;
        let signals = Signals {
            explicit: Some(Domain::C2c),
            ..signals_for(6)
        };
        assert_eq!(
            f.resolver.known(&signals).await,
            Some((Domain::C2c, Source::Explicit))
        );

        f.ids.write_meta("raw-6", "type", "guild_private").await.unwrap();
        assert_eq!(
            f.resolver.known(&signals).await,
            Some((Domain::GuildPrivate, Source::Persisted))
        );
    }

    #[tokio::test]
    async fn echo_is_consulted_before_virtual_id() {
        let f = fixture().await;
        let echo = Token::sequence("1", 42);
        f.echoes.put_echo(&echo, Domain::GuildPrivate);
        f.echoes.put_echo(&Token::virtual_id("1", 5), Domain::Group);

        let signals = Signals {
            echo: Some(echo),
            ..signals_for(5)
        };
        assert_eq!(
            f.resolver.known(&signals).await,
            Some((Domain::GuildPrivate, Source::Echo))
        );
        assert_eq!(
            f.resolver.known(&signals_for(5)).await,
            Some((Domain::Group, Source::VirtualId))
        );
    }

    #[tokio::test]
    async fn persisted_type_is_used_when_memory_is_cold() {
        let f = fixture().await;
        f.ids.write_meta("raw-9", "type", "guild").await.unwrap();
        assert_eq!(
            f.resolver.known(&signals_for(9)).await,
            Some((Domain::GuildChannel, Source::Persisted))
        );
    }

    #[tokio::test]
    async fn guesses_in_order_then_gives_up() {
        let f = fixture().await;
        let mut seen = Vec::new();

        let err = f
            .resolver
            .dispatch(&signals_for(7), |domain| {
                seen.push(domain);
                async move { Err::<(), _>(TransportError::Rejected("no such target".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(
            seen,
            vec![Domain::Group, Domain::GuildChannel, Domain::GuildPrivate]
        );
        assert_eq!(
            err,
            BridgeError::DomainUnresolvable {
                id: 7,
                tried: seen.clone(),
            }
        );
        assert_eq!(f.sleeper.slept.lock().unwrap().len(), 2);
        assert_eq!(f.resolver.counter(7), None);
    }

    #[tokio::test]
    async fn success_latches_and_skips_later_guessing() {
        let f = fixture().await;
        let mut calls = 0;

        let done = f
            .resolver
            .dispatch(&signals_for(8), |domain| {
                calls += 1;
                async move {
                    if domain == Domain::GuildChannel {
                        Ok("sent")
                    } else {
                        Err(TransportError::Rejected("wrong type".into()))
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(calls, 2);
        assert_eq!(done.domain, Domain::GuildChannel);
        assert_eq!(done.source, Source::Guessed);
        assert_eq!(
            f.resolver.counter(8),
            Some(Counter::Latched(Domain::GuildChannel))
        );

        // 锁定后只发一次，不再猜测
        let bare = Signals {
            vid: Some(8),
            ..Default::default()
        };
        let again = f
            .resolver
            .dispatch(&bare, |domain| async move { Ok::<_, TransportError>(domain) })
            .await
            .unwrap();
        assert_eq!(again.source, Source::Latched);
        assert_eq!(again.outcome.unwrap(), Domain::GuildChannel);
        assert_eq!(f.sleeper.slept.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn quota_during_guess_confirms_domain() {
        let f = fixture().await;
        let done = f
            .resolver
            .dispatch(&signals_for(3), |_| async {
                Err::<(), _>(TransportError::QuotaExceeded)
            })
            .await
            .unwrap();

        assert_eq!(done.domain, Domain::Group);
        assert_eq!(done.outcome.unwrap_err(), TransportError::QuotaExceeded);
        assert_eq!(
            f.echoes.get_domain(&Token::virtual_id("1", 3)),
            Some(Domain::Group)
        );
        assert_eq!(
            f.ids.read_meta("raw-3", "type").await.unwrap().as_deref(),
            Some("group")
        );
    }

    #[tokio::test]
    async fn attempt_budget_caps_guesses() {
        let f = fixture().await;
        let resolver = TypeResolver::new(
            f.echoes.clone(),
            f.ids.clone(),
            Duration::from_millis(1),
            1,
            f.sleeper.clone(),
            Shutdown::new(),
        );
        let mut calls = 0;
        let err = resolver
            .dispatch(&signals_for(4), |_| {
                calls += 1;
                async { Err::<(), _>(TransportError::Rejected("no".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls, 1);
        assert!(matches!(err, BridgeError::DomainUnresolvable { id: 4, .. }));
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_delay() {
        let f = fixture().await;
        let shutdown = Shutdown::new();
        let resolver = Arc::new(TypeResolver::new(
            f.echoes.clone(),
            f.ids.clone(),
            Duration::from_secs(3600),
            3,
            Arc::new(PendingSleeper),
            shutdown.clone(),
        ));

        let task = {
            let resolver = resolver.clone();
            tokio::spawn(async move {
                resolver
                    .dispatch(&signals_for(6), |_| async {
                        Err::<(), _>(TransportError::Rejected("no".into()))
                    })
                    .await
            })
        };

        tokio::task::yield_now().await;
        shutdown.trigger();
        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err(), BridgeError::Cancelled);
    }

    #[tokio::test]
    async fn no_identity_means_unresolvable() {
        let f = fixture().await;
        let err = f
            .resolver
            .dispatch(&Signals::default(), |_| async { Ok::<_, TransportError>(()) })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BridgeError::DomainUnresolvable {
                id: 0,
                tried: Vec::new()
            }
        );
    }
}
