use thiserror::Error;

use crate::domain::Domain;

/// 桥接层统一错误类型
///
/// 除 `Config` 外的所有错误都只影响当前这一个事件/调用，
/// 调用方记录日志后丢弃或降级处理即可，不允许终止进程。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// 映射不存在 (缓存未命中、虚拟 ID 未知)
    #[error("映射不存在: {0}")]
    KeyNotFound(String),

    /// 持久化存储写入/读取失败
    #[error("存储不可用: {0}")]
    StoreUnavailable(String),

    /// 有限次数的类型猜测已耗尽
    #[error("无法确定消息类型 (id={id}, 已尝试 {tried:?})")]
    DomainUnresolvable { id: i64, tried: Vec<Domain> },

    /// 改绑目标虚拟 ID 已被占用
    #[error("虚拟 ID {0} 已被占用")]
    VirtualIdTaken(i64),

    /// OneBot 调用参数无法解析
    #[error("参数无效: {0}")]
    InvalidParams(String),

    /// 等待期间收到关闭信号
    #[error("操作已取消 (正在关闭)")]
    Cancelled,

    /// 配置加载/保存失败
    #[error("配置错误: {0}")]
    Config(String),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    /// 是否为可恢复错误 (仅影响单个事件/调用)
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Config(_))
    }

    /// 是否为缓存/映射未命中
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound(_))
    }
}

impl From<sea_orm::DbErr> for BridgeError {
    fn from(err: sea_orm::DbErr) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<toml::de::Error> for BridgeError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for BridgeError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<simd_json::Error> for BridgeError {
    fn from(err: simd_json::Error) -> Self {
        Self::InvalidParams(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_config_errors_are_fatal() {
        assert!(BridgeError::KeyNotFound("x".into()).is_recoverable());
        assert!(BridgeError::StoreUnavailable("disk".into()).is_recoverable());
        assert!(BridgeError::InvalidParams("x".into()).is_recoverable());
        assert!(BridgeError::Cancelled.is_recoverable());
        assert!(!BridgeError::Config("bad".into()).is_recoverable());
    }

    #[test]
    fn db_errors_map_to_store_unavailable() {
        let err: BridgeError = sea_orm::DbErr::Custom("locked".into()).into();
        assert!(matches!(err, BridgeError::StoreUnavailable(msg) if msg.contains("locked")));
    }
}
