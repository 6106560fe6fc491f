use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::BridgeResult;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BridgeConfig {
    // 机器人 AppID，所有 echo 键都以它为前缀
    #[serde(default = "default_app_id")]
    pub app_id: String,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub idmap: IdMapConfig,

    #[serde(default)]
    pub echo: EchoConfig,

    #[serde(default)]
    pub lazy: LazyConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub resolve: ResolveConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IdMapConfig {
    // SQLite 数据库文件路径
    #[serde(default = "default_db_path")]
    pub db_path: String,

    // 使用 hash 生成虚拟 ID，避免 user_id 从 1 开始递增
    #[serde(default)]
    pub hash_id: bool,

    // 用户 ID 按所在群隔离
    #[serde(default)]
    pub pro: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EchoConfig {
    #[serde(default = "default_five_minutes")]
    pub retention_secs: u64,

    #[serde(default = "default_five_minutes")]
    pub sweep_interval_secs: u64,

    // 双向 echo：客户端回传 echo 时可取回触发消息的原文
    #[serde(default)]
    pub two_way_echo: bool,

    // msg_seq 起始值随机化
    #[serde(default)]
    pub random_seq: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LazyConfig {
    // 未指定 echo 时，使用会话最近一条消息作为被动回复对象
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_five_minutes")]
    pub window_secs: u64,

    // 每个窗口内最多被动回复次数，0 表示不限
    #[serde(default = "default_max_replies")]
    pub max_replies: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_retry_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResolveConfig {
    // 两次类型猜测之间的延迟 (毫秒)
    #[serde(default = "default_send_delay")]
    pub send_delay_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,
}

fn default_app_id() -> String {
    "0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_db_path() -> String {
    "data/idmap.db".to_string()
}

fn default_five_minutes() -> u64 {
    300
}

fn default_max_replies() -> u32 {
    5
}

fn default_retry_capacity() -> usize {
    100
}

fn default_send_delay() -> u64 {
    300
}

fn default_max_attempts() -> u8 {
    3
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for IdMapConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            hash_id: false,
            pro: false,
        }
    }
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_five_minutes(),
            sweep_interval_secs: default_five_minutes(),
            two_way_echo: false,
            random_seq: false,
        }
    }
}

impl Default for LazyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_secs: default_five_minutes(),
            max_replies: default_max_replies(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            capacity: default_retry_capacity(),
        }
    }
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            send_delay_ms: default_send_delay(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            app_id: default_app_id(),
            log: LogConfig::default(),
            idmap: IdMapConfig::default(),
            echo: EchoConfig::default(),
            lazy: LazyConfig::default(),
            retry: RetryConfig::default(),
            resolve: ResolveConfig::default(),
        }
    }
}

impl EchoConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl LazyConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl ResolveConfig {
    pub fn send_delay(&self) -> Duration {
        Duration::from_millis(self.send_delay_ms)
    }
}

/// 配置管理器
pub struct ConfigManager {
    path: PathBuf,
    config: RwLock<BridgeConfig>,
}

impl ConfigManager {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            config: RwLock::new(BridgeConfig::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 加载配置，如果文件不存在则写入默认配置
    pub async fn load(&self) -> BridgeResult<BridgeConfig> {
        if !self.path.exists() {
            let default_cfg = BridgeConfig::default();
            self.save_atomic(&default_cfg).await?;
            return Ok(default_cfg);
        }

        let content = tokio::fs::read_to_string(&self.path).await?;
        let cfg: BridgeConfig = toml::from_str(&content)?;

        let mut write_lock = self.config.write().await;
        *write_lock = cfg.clone();

        Ok(cfg)
    }

    /// 原子写入配置（写临时文件 -> Rename 覆盖）
    pub async fn save_atomic(&self, cfg: &BridgeConfig) -> BridgeResult<()> {
        let content = toml::to_string_pretty(cfg)?;
        let tmp_path = self.path.with_extension("tmp");
        let path_clone = self.path.clone();

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if let Some(parent) = path_clone.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }

            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?; // 确保落盘
            std::fs::rename(&tmp_path, &path_clone)?;
            Ok(())
        })
        .await
        .map_err(|e| crate::error::BridgeError::Config(e.to_string()))??;

        let mut write_lock = self.config.write().await;
        *write_lock = cfg.clone();

        Ok(())
    }

    /// 获取当前配置（只读副本）
    pub async fn get(&self) -> BridgeConfig {
        self.config.read().await.clone()
    }
}
