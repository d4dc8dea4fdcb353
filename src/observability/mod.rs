//! 可观测性：tracing 日志初始化
//!
//! 默认 info 级别，可通过 RUST_LOG 覆盖（如 `RUST_LOG=nutri=debug`）。
//! 回合内的审计事件同时作为结构化字段写入日志。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化全局订阅者；重复初始化（如多个测试）时静默跳过
pub fn init() {
    init_with("info");
}

pub fn init_with(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}
