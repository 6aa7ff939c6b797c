//! 日志追踪（tracing）宏模块
//!
//! 为整个 crate 提供统一的日志宏封装：当 `tracing` feature 启用时，
//! 宏转发到 `tracing` crate 的同名宏；未启用时展开为空操作，
//! 对不需要日志的用户零运行时开销。
//!
//! 本模块通过 `#[macro_use]` 在 `lib.rs` 中最先引入，
//! 使得 crate 内所有模块都可以直接使用 `trace!`、`debug!` 等宏。

#![allow(unused_macros)]

/// `trace!` —— 最详细级别的日志宏
///
/// 用于记录连接状态机的每一步推进（编码器/解码器的状态切换、任务调度等）。
macro_rules! trace {
    ($($arg:tt)+) => {
        #[cfg(feature = "tracing")]
        {
            tracing::trace!($($arg)+);
        }
    }
}

/// `debug!` —— 调试级别日志宏
macro_rules! debug {
    ($($arg:tt)+) => {
        #[cfg(feature = "tracing")]
        {
            tracing::debug!($($arg)+);
        }
    }
}

/// `warn!` —— 警告级别日志宏
macro_rules! warn {
    ($($arg:tt)+) => {
        #[cfg(feature = "tracing")]
        {
            tracing::warn!($($arg)+);
        }
    }
}

/// `error!` —— 错误级别日志宏
macro_rules! error {
    ($($arg:tt)+) => {
        #[cfg(feature = "tracing")]
        {
            tracing::error!($($arg)+);
        }
    }
}
