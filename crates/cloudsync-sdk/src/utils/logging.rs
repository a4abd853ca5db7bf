//! 日志初始化辅助
//!
//! SDK 本身不安装全局 subscriber，由宿主 App（或测试）按需调用。

use tracing::Level;

/// 初始化 fmt 日志输出；重复调用安全（已初始化时忽略）
pub fn init_logging(debug_mode: bool) {
    let level = if debug_mode { Level::DEBUG } else { Level::INFO };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init();
}
