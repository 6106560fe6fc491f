mod adapter_console;

use onebot_bridge::log::{self, Level};
use onebot_bridge::prelude::*;
use std::sync::Arc;

use adapter_console::ConsoleTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let manager = ConfigManager::new(&config_path);
    let cfg = manager.load().await?;
    log::set_level(Level::parse(&cfg.log.level));
    info!(target: "Main", "配置已加载: {}", config_path);

    let shutdown = Shutdown::new();
    let scheduler = Scheduler::new(shutdown.clone());

    let gateway = Arc::new(
        Gateway::builder()
            .config(cfg)
            .transport(Arc::new(ConsoleTransport::default()))
            .shutdown(shutdown.clone())
            .build()
            .await?,
    );
    gateway.start_sweeper(&scheduler);

    tokio::select! {
        result = adapter_console::run(gateway.clone()) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!(target: "Main", "收到 Ctrl-C");
        }
    }

    gateway.shutdown();
    scheduler.shutdown();
    info!(target: "Main", "已退出");
    Ok(())
}
