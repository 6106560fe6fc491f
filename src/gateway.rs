use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

use crate::clock::{Clock, SystemClock};
use crate::config::BridgeConfig;
use crate::db::KvStore;
use crate::domain::Domain;
use crate::echo::{Correlation, CorrelationStore, Token};
use crate::error::{BridgeError, BridgeResult};
use crate::idmap::{IdVirtualizer, composite_key};
use crate::lazy::LazyReplyWindow;
use crate::params::{OutboundCall, TargetId};
use crate::resolve::{Attempted, Signals, Sleeper, TokioSleeper, TypeResolver};
use crate::retry::RetryStack;
use crate::scheduler::{Scheduler, Shutdown};
use crate::{debug, error, info, warn};

// ============================================================================
// 1. 发送端接口
// ============================================================================

/// 平台发送失败的原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// 主动消息额度不足，消息会进入重发队列
    #[error("主动消息额度已用尽")]
    QuotaExceeded,

    #[error("平台拒绝: {0}")]
    Rejected(String),
}

/// 平台返回的发送回执
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub message_id: String,
}

/// 已完成 ID 还原与上下文查找的请求
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest<P> {
    pub domain: Domain,
    pub conversation_id: String,
    /// 被动回复的目标消息，None 为主动消息
    pub reply_to: Option<String>,
    pub event_id: Option<String>,
    pub msg_seq: Option<u32>,
    /// 虚拟 ID 与原始 ID 的绑定是否仍然有效
    pub verified: bool,
    pub payload: P,
}

/// 平台发送端
#[async_trait]
pub trait OutboundTransport: Send + Sync + 'static {
    type Payload: Clone + Send + Sync + 'static;

    async fn send(&self, request: &OutboundRequest<Self::Payload>) -> Result<Receipt, TransportError>;
}

// ============================================================================
// 2. 入站 / 出站数据
// ============================================================================

/// 事件源解码后的入站事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub app_id: String,
    pub sequence: u64,
    pub domain: Domain,
    pub conversation_id: String,
    pub actor_id: String,
    pub message_id: String,
    pub event_id: Option<String>,
    /// 频道消息所属的 guild
    pub guild_id: Option<String>,
    pub content: String,
}

/// 入站事件在 OneBot 侧的身份
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundIdentity {
    pub conversation_vid: i64,
    pub actor_vid: i64,
    pub message_vid: i64,
    /// 下发给客户端的 echo
    pub echo: Token,
    /// 本次交给后台补发的积压消息数
    pub flushed: usize,
}

/// 一次发送的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { domain: Domain, receipt: Receipt },
    /// 额度不足，已进入重发队列
    Queued { domain: Domain },
    Rejected { domain: Domain, reason: String },
}

impl SendOutcome {
    pub fn domain(&self) -> Domain {
        match self {
            SendOutcome::Sent { domain, .. }
            | SendOutcome::Queued { domain }
            | SendOutcome::Rejected { domain, .. } => *domain,
        }
    }
}

#[derive(Debug, Clone)]
struct Pending<P> {
    domain: Domain,
    payload: P,
}

struct Target {
    vid: Option<i64>,
    raw: String,
    actor_raw: Option<String>,
    /// pro 模式下会话内的成员 ID
    scoped_actor: Option<i64>,
}

fn enqueue<P>(retry: &RetryStack<Pending<P>>, conversation: &str, domain: Domain, payload: P) {
    if let Some(lost) = retry.push(conversation, Pending { domain, payload }) {
        warn!(target: "Gateway", "重发队列已满，丢弃会话 {} 的最早一条消息", lost.conversation);
    }
}

// ============================================================================
// 3. 构建器
// ============================================================================

pub struct GatewayBuilder<T> {
    app_id: Option<String>,
    config: BridgeConfig,
    store: Option<Arc<KvStore>>,
    transport: Option<Arc<T>>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    shutdown: Shutdown,
}

impl<T: OutboundTransport> GatewayBuilder<T> {
    pub fn new() -> Self {
        Self {
            app_id: None,
            config: BridgeConfig::default(),
            store: None,
            transport: None,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            shutdown: Shutdown::new(),
        }
    }

    /// 覆盖配置中的 app_id
    pub fn app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    /// 使用已打开的存储；未设置时按配置的 db_path 打开
    pub fn store(mut self, store: Arc<KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<T>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub async fn build(self) -> BridgeResult<Gateway<T>> {
        let transport = self
            .transport
            .ok_or_else(|| BridgeError::Config("未设置发送端".to_string()))?;
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(KvStore::open(&self.config.idmap.db_path).await?),
        };
        let cfg = self.config;
        let app_id = self.app_id.unwrap_or_else(|| cfg.app_id.clone());

        let ids = Arc::new(IdVirtualizer::new(store, cfg.idmap.hash_id));
        let echoes = Arc::new(CorrelationStore::new(
            self.clock.clone(),
            cfg.echo.retention(),
            cfg.echo.random_seq,
        ));
        let lazy = Arc::new(LazyReplyWindow::new(
            self.clock.clone(),
            cfg.lazy.window(),
            cfg.lazy.max_replies,
        ));
        let resolver = TypeResolver::new(
            echoes.clone(),
            ids.clone(),
            cfg.resolve.send_delay(),
            cfg.resolve.max_attempts,
            self.sleeper,
            self.shutdown.clone(),
        );

        info!(target: "Gateway", "网关已就绪 (app_id={}, pro={}, hash_id={})", app_id, cfg.idmap.pro, cfg.idmap.hash_id);

        Ok(Gateway {
            app_id,
            retry: Arc::new(RetryStack::new(cfg.retry.capacity)),
            config: cfg,
            ids,
            echoes,
            lazy,
            resolver,
            transport,
            shutdown: self.shutdown,
        })
    }
}

impl<T: OutboundTransport> Default for GatewayBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// 4. 网关
// ============================================================================

/// ID 虚拟化与事件关联层的对外入口
pub struct Gateway<T: OutboundTransport> {
    app_id: String,
    config: BridgeConfig,
    ids: Arc<IdVirtualizer>,
    echoes: Arc<CorrelationStore>,
    lazy: Arc<LazyReplyWindow>,
    retry: Arc<RetryStack<Pending<T::Payload>>>,
    resolver: TypeResolver,
    transport: Arc<T>,
    shutdown: Shutdown,
}

impl<T: OutboundTransport> Gateway<T> {
    pub fn builder() -> GatewayBuilder<T> {
        GatewayBuilder::new()
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn ids(&self) -> &IdVirtualizer {
        &self.ids
    }

    pub fn echoes(&self) -> &CorrelationStore {
        &self.echoes
    }

    pub fn resolver(&self) -> &TypeResolver {
        &self.resolver
    }

    /// 某个会话在重发队列中的消息数
    pub fn pending_for(&self, conversation: &str) -> usize {
        self.retry.pending_for(conversation)
    }

    // ----- ID 转换 -----

    pub async fn virtualize(&self, raw: &str) -> BridgeResult<i64> {
        self.ids.store_id(raw).await
    }

    pub async fn virtualize_pair(&self, conversation: &str, actor: &str) -> BridgeResult<(i64, i64)> {
        self.ids.store_id_pair(conversation, actor).await
    }

    /// 反查失败只记录日志
    pub async fn devirtualize(&self, vid: i64) -> Option<String> {
        match self.ids.resolve(vid).await {
            Ok(raw) => Some(raw),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                error!(target: "Gateway", "反查 {} 失败: {}", vid, e);
                None
            }
        }
    }

    // ----- 关联 -----

    pub fn correlate(&self, token: &Token, domain: Domain, message_id: &str, event_id: Option<&str>) {
        self.echoes.correlate(token, domain, message_id, event_id);
    }

    pub fn lookup_correlation(&self, token: &Token) -> Option<Correlation> {
        self.echoes.lookup(token)
    }

    pub fn note_inbound(&self, conversation: &str, message_id: &str) {
        self.lazy.refresh(conversation, message_id);
    }

    pub fn try_reply_context(&self, conversation: &str) -> Option<String> {
        self.lazy.try_reply(conversation)
    }

    // ----- 类型判定 -----

    async fn signals(&self, vid: Option<i64>, echo: Option<Token>, explicit: Option<Domain>) -> Signals {
        let raw = match vid {
            Some(v) => self.devirtualize(v).await,
            None => None,
        };
        Signals {
            vid,
            explicit,
            echo,
            vid_token: vid.map(|v| Token::virtual_id(&self.app_id, v)),
            raw,
        }
    }

    /// 仅凭已有线索判定类型，不发送请求
    pub async fn known_domain(&self, vid: Option<i64>, echo: Option<Token>) -> Option<Domain> {
        let signals = self.signals(vid, echo, None).await;
        self.resolver.known(&signals).await.map(|(domain, _)| domain)
    }

    /// 判定类型，必要时通过 `attempt` 逐个类型试发
    pub async fn resolve_domain_or_guess<R, F, Fut>(
        &self,
        vid: Option<i64>,
        echo: Option<Token>,
        attempt: F,
    ) -> BridgeResult<Attempted<R>>
    where
        F: FnMut(Domain) -> Fut,
        Fut: Future<Output = Result<R, TransportError>>,
    {
        let signals = self.signals(vid, echo, None).await;
        self.resolver.dispatch(&signals, attempt).await
    }

    // ----- 入站 -----

    /// 处理一条入站事件：分配虚拟 ID、写入关联、刷新回复窗口并补发积压消息
    pub async fn on_inbound(&self, event: InboundEvent) -> BridgeResult<InboundIdentity> {
        if event.app_id != self.app_id {
            warn!(target: "Gateway", "事件来自其他 app_id: {} (当前 {})", event.app_id, self.app_id);
        }

        let domain = event.domain;
        let pair_mode = self.config.idmap.pro && !domain.is_private();
        let conv = event.conversation_id.as_str();
        let actor = event.actor_id.as_str();

        let minted = async {
            let (c, a) = if pair_mode {
                self.ids.store_id_pair(conv, actor).await?
            } else {
                (self.ids.store_id(conv).await?, self.ids.store_id(actor).await?)
            };
            let m = self.ids.store_id(&event.message_id).await?;
            Ok::<_, BridgeError>((c, a, m))
        };
        let (conversation_vid, actor_vid, message_vid) = match minted.await {
            Ok(v) => v,
            Err(e) => {
                error!(target: "Gateway", "事件 {} 虚拟化失败，已丢弃: {}", event.sequence, e);
                return Err(e);
            }
        };

        let app = event.app_id.as_str();
        let msg = event.message_id.as_str();
        let event_id = event.event_id.as_deref();

        let echo = Token::sequence(app, event.sequence);
        self.echoes.correlate(&echo, domain, msg, event_id);
        self.echoes
            .correlate(&Token::virtual_id(app, conversation_vid), domain, msg, event_id);
        if domain.is_private() && actor_vid != conversation_vid {
            self.echoes
                .correlate(&Token::virtual_id(app, actor_vid), domain, msg, event_id);
        }
        if pair_mode {
            self.echoes.correlate(
                &Token::pair(app, conversation_vid, actor_vid),
                domain,
                msg,
                event_id,
            );
        }
        if self.config.echo.two_way_echo {
            self.echoes.put_echo_text(&echo, &event.content);
        }

        self.persist_meta(&event).await;

        if !self.lazy.refresh_at(conv, msg, event.sequence) {
            debug!(target: "Gateway", "事件 {} 晚于更新的事件完成，不刷新 {} 的回复窗口", event.sequence, conv);
        }
        self.lazy
            .refresh_at(&composite_key(conv, actor), msg, event.sequence);

        let flushed = self.flush(conv, domain, event_id);

        debug!(target: "Gateway", "入站 {} -> 会话 {} 成员 {} 消息 {}", echo, conversation_vid, actor_vid, message_vid);

        Ok(InboundIdentity {
            conversation_vid,
            actor_vid,
            message_vid,
            echo,
            flushed,
        })
    }

    async fn persist_meta(&self, event: &InboundEvent) {
        let conv = event.conversation_id.as_str();
        if let Err(e) = self.ids.write_meta(conv, "type", event.domain.as_str()).await {
            error!(target: "Gateway", "保存 {} 的 type 失败: {}", conv, e);
        }
        if event.domain.is_guild()
            && let Some(guild) = event.guild_id.as_deref().filter(|g| !g.is_empty())
            && let Err(e) = self.ids.write_meta(conv, "guild_id", guild).await
        {
            error!(target: "Gateway", "保存 {} 的 guild_id 失败: {}", conv, e);
        }
    }

    /// 按回复窗口剩余次数取出积压消息，交给后台任务补发，每条只补发一次
    ///
    /// 入站流程不等待平台接口；超出次数的消息继续排队等下一条入站消息。
    fn flush(&self, conversation: &str, domain: Domain, event_id: Option<&str>) -> usize {
        let waiting = self.retry.pending_for(conversation);
        if waiting == 0 {
            return 0;
        }
        let Some((reply_to, budget)) = self.lazy.reserve(conversation, waiting) else {
            debug!(target: "Gateway", "会话 {} 没有可用的回复次数，{} 条消息继续排队", conversation, waiting);
            return 0;
        };

        let requests: Vec<_> = self
            .retry
            .drain_up_to(conversation, budget)
            .into_iter()
            .map(|item| {
                if item.domain != domain {
                    debug!(target: "Gateway", "补发 {} 的类型 {} 与入站 {} 不同", conversation, item.domain, domain);
                }
                OutboundRequest {
                    domain: item.domain,
                    conversation_id: conversation.to_string(),
                    reply_to: Some(reply_to.clone()),
                    event_id: event_id.map(str::to_string),
                    msg_seq: Some(self.echoes.next_msg_seq(&reply_to)),
                    verified: true,
                    payload: item.payload,
                }
            })
            .collect();
        let count = requests.len();
        if count == 0 {
            return 0;
        }

        let transport = self.transport.clone();
        let retry = self.retry.clone();
        let shutdown = self.shutdown.clone();
        let conversation = conversation.to_string();
        tokio::spawn(async move {
            let resend = async {
                let mut sent = 0;
                for request in requests {
                    match transport.send(&request).await {
                        Ok(_) => sent += 1,
                        Err(TransportError::QuotaExceeded) => {
                            warn!(target: "Gateway", "补发 {} 仍然超出额度，重新入队", conversation);
                            enqueue(&retry, &conversation, request.domain, request.payload);
                        }
                        Err(TransportError::Rejected(reason)) => {
                            warn!(target: "Gateway", "补发 {} 被拒绝，已丢弃: {}", conversation, reason);
                        }
                    }
                }
                if sent > 0 {
                    info!(target: "Gateway", "会话 {} 补发 {} 条消息", conversation, sent);
                }
            };
            tokio::select! {
                _ = resend => {}
                _ = shutdown.wait() => {
                    debug!(target: "Gateway", "正在关闭，停止补发 {}", conversation);
                }
            }
        });
        count
    }

    fn enqueue(&self, conversation: &str, domain: Domain, payload: T::Payload) {
        enqueue(&self.retry, conversation, domain, payload);
    }

    // ----- 出站 -----

    async fn target(&self, conversation: Option<TargetId>, user: Option<TargetId>) -> BridgeResult<Target> {
        let resolved = match (conversation, user) {
            (Some(TargetId::Virtual(c)), Some(TargetId::Virtual(u))) if self.config.idmap.pro => {
                let (raw, actor) = self.ids.resolve_pair(c, u).await?;
                Target {
                    vid: Some(c),
                    raw,
                    actor_raw: Some(actor),
                    scoped_actor: Some(u),
                }
            }
            (Some(TargetId::Virtual(c)), user) => {
                let raw = self.ids.resolve(c).await?;
                let actor_raw = match user {
                    Some(TargetId::Virtual(u)) => self.ids.resolve(u).await.ok(),
                    Some(TargetId::Raw(u)) => Some(u),
                    None => None,
                };
                Target {
                    vid: Some(c),
                    raw,
                    actor_raw,
                    scoped_actor: None,
                }
            }
            (Some(TargetId::Raw(raw)), user) => Target {
                vid: None,
                raw,
                actor_raw: match user {
                    Some(TargetId::Raw(u)) => Some(u),
                    _ => None,
                },
                scoped_actor: None,
            },
            (None, Some(TargetId::Virtual(u))) => Target {
                vid: Some(u),
                raw: self.ids.resolve(u).await?,
                actor_raw: None,
                scoped_actor: None,
            },
            (None, Some(TargetId::Raw(raw))) => Target {
                vid: None,
                raw,
                actor_raw: None,
                scoped_actor: None,
            },
            (None, None) => {
                return Err(BridgeError::InvalidParams("缺少发送目标".to_string()));
            }
        };
        Ok(resolved)
    }

    /// echo → `appid_g_u` → `appid_vid` → 回复窗口 (开启时)，都没有则为主动消息
    fn reply_context(&self, signals: &Signals, target: &Target) -> (Option<String>, Option<String>) {
        let pair = match (target.vid, target.scoped_actor) {
            (Some(c), Some(a)) => Some(Token::pair(&self.app_id, c, a)),
            _ => None,
        };
        let tokens = [signals.echo.as_ref(), pair.as_ref(), signals.vid_token.as_ref()];
        for token in tokens.into_iter().flatten() {
            if let Some(c) = self.echoes.lookup(token) {
                return (Some(c.message_id), c.event_id);
            }
        }

        if self.config.lazy.enabled {
            let mut keys = Vec::with_capacity(2);
            if let Some(actor) = &target.actor_raw {
                keys.push(composite_key(&target.raw, actor));
            }
            keys.push(target.raw.clone());
            for key in keys {
                if let Some(message_id) = self.lazy.try_reply(&key) {
                    return (Some(message_id), None);
                }
            }
        }
        (None, None)
    }

    /// 客户端给出的 ID 是否与当前映射一致
    ///
    /// 会话 ID 必须仍指向该会话；pro 模式下成员 ID 还必须是这个会话内的成员 ID。
    /// openid 直发不经过映射，视为一致。
    async fn verify(&self, target: &Target) -> bool {
        let Some(vid) = target.vid else {
            return true;
        };
        if !self.ids.check_bound(&target.raw, vid).await {
            return false;
        }
        match (&target.actor_raw, target.scoped_actor) {
            (Some(actor), Some(scoped)) => {
                self.ids
                    .check_bound(&composite_key(&target.raw, actor), scoped)
                    .await
            }
            _ => true,
        }
    }

    /// 处理一次 OneBot 发送调用
    pub async fn send(&self, call: OutboundCall<T::Payload>) -> BridgeResult<SendOutcome> {
        let OutboundCall {
            group,
            user,
            channel,
            echo,
            domain: explicit,
            message,
            ..
        } = call;

        let target = match self.target(channel.or(group), user).await {
            Ok(t) => t,
            Err(e) => {
                warn!(target: "Gateway", "无法还原发送目标: {}", e);
                return Err(e);
            }
        };

        let signals = Signals {
            vid: target.vid,
            explicit,
            echo: echo.as_ref().map(|e| Token::explicit(e.to_string())),
            vid_token: target.vid.map(|v| Token::virtual_id(&self.app_id, v)),
            raw: Some(target.raw.clone()),
        };

        let (reply_to, event_id) = self.reply_context(&signals, &target);
        let msg_seq = reply_to.as_deref().map(|m| self.echoes.next_msg_seq(m));
        let verified = self.verify(&target).await;

        let transport = self.transport.clone();
        let attempted = self
            .resolver
            .dispatch(&signals, |domain| {
                let request = OutboundRequest {
                    domain,
                    conversation_id: target.raw.clone(),
                    reply_to: reply_to.clone(),
                    event_id: event_id.clone(),
                    msg_seq,
                    verified,
                    payload: message.clone(),
                };
                let transport = transport.clone();
                async move { transport.send(&request).await }
            })
            .await;

        let attempted = match attempted {
            Ok(a) => a,
            Err(e) => {
                warn!(target: "Gateway", "发送到 {} 失败: {}", target.raw, e);
                return Err(e);
            }
        };

        let domain = attempted.domain;
        match attempted.outcome {
            Ok(receipt) => {
                debug!(target: "Gateway", "已发送到 {} ({}, {:?})", target.raw, domain, attempted.source);
                Ok(SendOutcome::Sent { domain, receipt })
            }
            Err(TransportError::QuotaExceeded) => {
                warn!(target: "Gateway", "{} 超出额度，消息进入重发队列", target.raw);
                self.enqueue(&target.raw, domain, message);
                Ok(SendOutcome::Queued { domain })
            }
            Err(TransportError::Rejected(reason)) => {
                warn!(target: "Gateway", "{} 拒绝了消息: {}", target.raw, reason);
                Ok(SendOutcome::Rejected { domain, reason })
            }
        }
    }

    // ----- 生命周期 -----

    /// 注册定时清理任务，返回任务 ID
    pub fn start_sweeper(&self, scheduler: &Scheduler) -> u64 {
        let echoes = self.echoes.clone();
        let lazy = self.lazy.clone();
        scheduler.add_interval(self.config.echo.sweep_interval(), move || {
            let echoes = echoes.clone();
            let lazy = lazy.clone();
            async move {
                let removed = echoes.sweep() + lazy.sweep();
                if removed > 0 {
                    debug!(target: "Gateway", "定时清理完成，共删除 {} 条", removed);
                }
            }
        })
    }

    pub fn shutdown(&self) {
        info!(target: "Gateway", "收到关闭信号");
        self.shutdown.trigger();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_triggered()
    }
}
