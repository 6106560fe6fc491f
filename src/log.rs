use chrono::Local;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Level {
    /// 从配置字符串解析，未知值回退为 Info
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => Level::Debug,
            "warn" | "warning" => Level::Warn,
            "error" => Level::Error,
            _ => Level::Info,
        }
    }
}

static MIN_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

/// 设置全局最低输出级别
pub fn set_level(level: Level) {
    MIN_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn enabled(level: Level) -> bool {
    level as u8 >= MIN_LEVEL.load(Ordering::Relaxed)
}

/// 统一日志输出函数
/// 格式: [Time] [LEVEL] [Target] Message
pub fn print(level: Level, target: &str, args: std::fmt::Arguments) {
    if !enabled(level) {
        return;
    }

    let now = Local::now().format("%H:%M:%S");

    // ANSI 颜色代码
    let gray = "\x1b[90m";
    let reset = "\x1b[0m";
    let cyan = "\x1b[36m";

    let (color, level_str) = match level {
        Level::Info => ("\x1b[32m", "INFO"),
        Level::Warn => ("\x1b[33m", "WARN"),
        Level::Error => ("\x1b[31m", "ERRO"),
        Level::Debug => ("\x1b[34m", "DEBG"),
    };

    println!(
        "{}[{}] {}[{}] {} {}{}{} {}",
        gray,
        now,
        color,
        level_str,
        reset,
        cyan,
        format_args!("[{}]", target),
        reset,
        args
    );
}

#[macro_export]
macro_rules! info {
    (target: $target:expr, $($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Info, $target, format_args!($($arg)+))
    );
    ($($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Info, "Bridge", format_args!($($arg)+))
    );
}

#[macro_export]
macro_rules! warn {
    (target: $target:expr, $($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Warn, $target, format_args!($($arg)+))
    );
    ($($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Warn, "Bridge", format_args!($($arg)+))
    );
}

#[macro_export]
macro_rules! error {
    (target: $target:expr, $($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Error, $target, format_args!($($arg)+))
    );
    ($($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Error, "Bridge", format_args!($($arg)+))
    );
}

#[macro_export]
macro_rules! debug {
    (target: $target:expr, $($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Debug, $target, format_args!($($arg)+))
    );
    ($($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Debug, "Bridge", format_args!($($arg)+))
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels_leniently() {
        assert_eq!(Level::parse("DEBUG"), Level::Debug);
        assert_eq!(Level::parse(" warning "), Level::Warn);
        assert_eq!(Level::parse("error"), Level::Error);
        assert_eq!(Level::parse("verbose"), Level::Info);
    }

    #[test]
    fn levels_are_ordered() {
        assert!(Level::Error > Level::Warn);
        assert!(Level::Warn > Level::Info);
        assert!(Level::Info > Level::Debug);
    }
}
