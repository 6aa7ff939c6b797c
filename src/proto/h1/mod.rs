//! HTTP/1.1 客户端协议栈的核心模块。
//!
//! 子模块分工：
//! - `conn`: 连接状态机，持有流队列并驱动读写两个方向
//! - `decode`: 响应解码器（状态行 / 头部 / 分块 / trailer / 1xx / 101）
//! - `encode`: 请求编码器（请求行 / 头部 / 定长与分块消息体）
//! - `stream`: 每条请求/响应交换的状态与用户句柄
//! - `chunks`: 分块编码请求体的出站分块队列

pub(crate) mod chunks;
pub(crate) mod conn;
pub(crate) mod decode;
pub(crate) mod encode;
pub(crate) mod stream;
