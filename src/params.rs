use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::Domain;
use crate::error::{BridgeError, BridgeResult};

// 平台 openid 的长度
const OPENID_LEN: usize = 32;

/// `group_id` / `user_id` 等字段，客户端可能传数字也可能传字符串
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum FlexId {
    Int(i64),
    Str(String),
}

/// 客户端提供的 echo，响应时原样返回
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Echo {
    Str(String),
    Int(i64),
}

impl fmt::Display for Echo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Echo::Str(s) => f.write_str(s),
            Echo::Int(n) => write!(f, "{}", n),
        }
    }
}

/// 出站调用中的目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetId {
    /// 需要反查的虚拟 ID
    Virtual(i64),
    /// 直接给出的平台 openid
    Raw(String),
}

#[derive(Debug, Deserialize)]
struct RawAction<M> {
    action: String,
    params: RawParams<M>,
    #[serde(default)]
    echo: Option<Echo>,
}

#[derive(Debug, Deserialize)]
struct RawParams<M> {
    #[serde(default)]
    message_type: Option<String>,
    #[serde(default)]
    group_id: Option<FlexId>,
    #[serde(default)]
    user_id: Option<FlexId>,
    #[serde(default)]
    channel_id: Option<FlexId>,
    message: M,
}

/// 校验后的出站调用
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundCall<M> {
    pub action: String,
    pub group: Option<TargetId>,
    pub user: Option<TargetId>,
    pub channel: Option<TargetId>,
    pub echo: Option<Echo>,
    /// 可直接确定的类型，None 表示需要进一步判定
    pub domain: Option<Domain>,
    pub message: M,
}

impl<M> OutboundCall<M> {
    /// 不经 JSON 直接构造 (控制台等内部调用)
    pub fn new(action: impl Into<String>, message: M) -> Self {
        Self {
            action: action.into(),
            group: None,
            user: None,
            channel: None,
            echo: None,
            domain: None,
            message,
        }
    }

    /// 会话所在的目标：子频道优先，其次群，最后用户
    pub fn conversation(&self) -> Option<&TargetId> {
        self.channel
            .as_ref()
            .or(self.group.as_ref())
            .or(self.user.as_ref())
    }
}

fn target_of(field: &str, value: Option<FlexId>) -> BridgeResult<Option<TargetId>> {
    match value {
        None | Some(FlexId::Int(0)) => Ok(None),
        Some(FlexId::Int(n)) => Ok(Some(TargetId::Virtual(n))),
        Some(FlexId::Str(s)) => {
            let s = s.trim();
            if s.is_empty() || s == "0" {
                return Ok(None);
            }
            if s.bytes().all(|b| b.is_ascii_digit()) {
                return s
                    .parse::<i64>()
                    .map(|n| Some(TargetId::Virtual(n)))
                    .map_err(|_| BridgeError::InvalidParams(format!("{} 超出范围: {}", field, s)));
            }
            if s.len() == OPENID_LEN {
                return Ok(Some(TargetId::Raw(s.to_string())));
            }
            Err(BridgeError::InvalidParams(format!("{} 无法识别: {}", field, s)))
        }
    }
}

/// 解析一帧 OneBot 调用
///
/// 会原地修改 `frame` (simd-json 的要求)。
pub fn decode_call<M: DeserializeOwned>(frame: &mut [u8]) -> BridgeResult<OutboundCall<M>> {
    let raw: RawAction<M> = simd_json::serde::from_slice(frame)?;
    let params = raw.params;

    let group = target_of("group_id", params.group_id)?;
    let user = target_of("user_id", params.user_id)?;
    let channel = target_of("channel_id", params.channel_id)?;

    if group.is_none() && user.is_none() && channel.is_none() {
        return Err(BridgeError::InvalidParams(
            "group_id / user_id / channel_id 至少需要一个".to_string(),
        ));
    }

    let domain = params
        .message_type
        .as_deref()
        .and_then(Domain::from_onebot_message_type)
        .or_else(|| match (&group, &user) {
            // openid 不经过虚拟化，类型由字段决定
            (Some(TargetId::Raw(_)), _) => Some(Domain::Group),
            (None, Some(TargetId::Raw(_))) => Some(Domain::C2c),
            _ => None,
        })
        .or_else(|| channel.as_ref().map(|_| Domain::GuildChannel));

    Ok(OutboundCall {
        action: raw.action,
        group,
        user,
        channel,
        echo: raw.echo,
        domain,
        message: params.message,
    })
}
