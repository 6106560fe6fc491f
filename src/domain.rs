use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 会话所属的平台域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    /// 群聊
    Group,
    /// 频道 (子频道消息)
    GuildChannel,
    /// 频道私信
    GuildPrivate,
    /// 单聊 (群成员私聊)
    C2c,
    /// 帖子/论坛
    Forum,
    /// 交互回调 (按钮、内联搜索)
    Interaction,
}

impl Domain {
    /// 猜测类型时的固定优先级
    pub const GUESS_ORDER: [Domain; 3] = [Domain::Group, Domain::GuildChannel, Domain::GuildPrivate];

    /// 持久化 `type` 元数据及日志中使用的名称
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Group => "group",
            Domain::GuildChannel => "guild",
            Domain::GuildPrivate => "guild_private",
            Domain::C2c => "group_private",
            Domain::Forum => "forum",
            Domain::Interaction => "interaction",
        }
    }

    /// OneBot 调用中 `message_type` 字段的取值映射，无法确定时返回 None
    ///
    /// 结果只是提示，已有关联记录时以关联为准。
    pub fn from_onebot_message_type(s: &str) -> Option<Self> {
        match s {
            "group" => Some(Domain::Group),
            "private" => Some(Domain::C2c),
            "guild" => Some(Domain::GuildChannel),
            "guild_private" => Some(Domain::GuildPrivate),
            _ => None,
        }
    }

    /// 私聊类的域，会话即用户本身
    pub fn is_private(&self) -> bool {
        matches!(self, Domain::GuildPrivate | Domain::C2c)
    }

    /// 频道侧的域，需要额外记录 guild_id
    pub fn is_guild(&self) -> bool {
        matches!(self, Domain::GuildChannel | Domain::GuildPrivate | Domain::Forum)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "group" => Ok(Domain::Group),
            "guild" | "guild_channel" => Ok(Domain::GuildChannel),
            "guild_private" => Ok(Domain::GuildPrivate),
            "group_private" | "c2c" => Ok(Domain::C2c),
            "forum" => Ok(Domain::Forum),
            "interaction" => Ok(Domain::Interaction),
            other => Err(format!("未知的消息类型: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_names_parse_back() {
        for d in [
            Domain::Group,
            Domain::GuildChannel,
            Domain::GuildPrivate,
            Domain::C2c,
            Domain::Forum,
            Domain::Interaction,
        ] {
            assert_eq!(d.as_str().parse::<Domain>(), Ok(d));
        }
    }

    #[test]
    fn onebot_message_type_mapping() {
        assert_eq!(Domain::from_onebot_message_type("private"), Some(Domain::C2c));
        assert_eq!(Domain::from_onebot_message_type("guild"), Some(Domain::GuildChannel));
        assert_eq!(Domain::from_onebot_message_type("discuss"), None);
    }

    #[test]
    fn guess_order_is_group_first() {
        assert_eq!(Domain::GUESS_ORDER[0], Domain::Group);
        assert_eq!(Domain::GUESS_ORDER[2], Domain::GuildPrivate);
    }
}
