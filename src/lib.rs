// lib.rs
//
// ================================================================================
// onebot-bridge - OneBot v11 网关核心
//
// 身份虚拟化 | 事件关联 | 被动回复窗口 | 消息类型判定
// ================================================================================

pub mod log;

pub mod clock;
pub mod config;
pub mod db;
pub mod domain;
pub mod echo;
pub mod error;
pub mod gateway;
pub mod idmap;
pub mod lazy;
pub mod params;
pub mod resolve;
pub mod retry;
pub mod scheduler;

pub use error::{BridgeError, BridgeResult};
pub use gateway::{Gateway, GatewayBuilder};

/// 常用类型一次性导入
pub mod prelude {
    // 1. 网关与发送端
    pub use super::gateway::{
        Gateway, GatewayBuilder, InboundEvent, InboundIdentity, OutboundRequest,
        OutboundTransport, Receipt, SendOutcome, TransportError,
    };

    // 2. 组件
    pub use super::echo::{Correlation, CorrelationStore, Token};
    pub use super::idmap::IdVirtualizer;
    pub use super::lazy::LazyReplyWindow;
    pub use super::resolve::{Counter, Sleeper, Source, TokioSleeper, TypeResolver};
    pub use super::retry::RetryStack;

    // 3. 边界解析
    pub use super::params::{Echo, FlexId, OutboundCall, TargetId, decode_call};

    // 4. 基础设施
    pub use super::clock::{Clock, ManualClock, SystemClock};
    pub use super::config::{BridgeConfig, ConfigManager};
    pub use super::db::KvStore;
    pub use super::domain::Domain;
    pub use super::error::{BridgeError, BridgeResult};
    pub use super::scheduler::{Scheduler, Shutdown};

    // 5. 日志
    pub use crate::{debug, error, info, warn};

    // 6. 外部依赖
    pub use async_trait::async_trait;
}
