//! 出站消息体数据源模块
//!
//! 编码器通过 [`BodySource`] 这一能力接口从用户侧拉取消息体字节：
//! 读入缓冲区、查询是否到达流末尾、可选地报告总长度。
//! 接口是同步的——编码器只在 I/O 线程上调用它，数据源读不出字节时
//! 编码器让出并在下一个任务节拍重试。
//!
//! [`BytesBody`] 是最常用的实现：一段内存中的字节。

use std::fmt;
use std::io;

use bytes::Bytes;

pub(crate) use self::length::DecodedLength;

mod length;

/// 出站消息体的数据源。
///
/// 实现注意事项：
///
/// - `read` 返回 `Ok(0)` **不**代表流结束；编码器会在之后的节拍重试。
///   流是否结束只由 [`is_end_of_stream`](BodySource::is_end_of_stream) 决定。
/// - 所有调用都发生在连接的 I/O 线程上。
/// - 读取失败会使对应的流以错误完成，并关闭整个连接
///   （消息体写到一半时帧格式已不可恢复）。
pub trait BodySource: Send {
    /// 向 `dst` 写入尽可能多的字节，返回写入的字节数。
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize>;

    /// 数据源是否已经到达末尾。
    fn is_end_of_stream(&self) -> bool;

    /// 剩余字节数（如果已知）。
    fn length(&self) -> Option<u64> {
        None
    }
}

/// 一段内存中的字节作为消息体数据源。
pub struct BytesBody {
    data: Bytes,
}

impl BytesBody {
    /// 用一段字节创建数据源。
    pub fn new(data: impl Into<Bytes>) -> BytesBody {
        BytesBody { data: data.into() }
    }
}

impl BodySource for BytesBody {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let n = std::cmp::min(dst.len(), self.data.len());
        dst[..n].copy_from_slice(&self.data[..n]);
        self.data = self.data.slice(n..);
        Ok(n)
    }

    fn is_end_of_stream(&self) -> bool {
        self.data.is_empty()
    }

    fn length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

impl fmt::Debug for BytesBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BytesBody")
            .field("remaining", &self.data.len())
            .finish()
    }
}
