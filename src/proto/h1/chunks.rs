//! 分块传输编码的出站分块队列
//!
//! 使用 `Transfer-Encoding: chunked` 的请求，其消息体由用户随时通过
//! [`StreamHandle::write_chunk`](crate::StreamHandle::write_chunk) 投递的
//! [`Chunk`] 组成。队列是单生产者（用户，可能在任意线程，经任务封送）、
//! 单消费者（编码器，I/O 线程）的 FIFO。
//!
//! 每个分块携带自己的数据源、声明的大小、零个或多个扩展，以及一个
//! 完成回调。声明大小为 0 的分块是**终止分块**，写出后消息体结束。
//!
//! 完成回调恰好触发一次：分块字节全部写上线路之后，或者流被取消时
//! （此时回调收到 `Canceled`，用户借此释放分块底层的缓冲区）。

use std::fmt;

use bytes::Bytes;

use crate::body::BodySource;

/// 分块大小行上的一个 `;key=value` 扩展。
///
/// 序列化时不加引号、不加空白；本 crate 不做转义。
#[derive(Debug, Clone)]
pub struct ChunkExtension {
    /// 扩展名。
    pub key: Bytes,
    /// 扩展值。
    pub value: Bytes,
}

/// 完成回调的类型别名。
type OnComplete = Box<dyn FnOnce(crate::Result<()>) + Send>;

/// 一个出站分块。
pub struct Chunk {
    data: Box<dyn BodySource>,
    size: u64,
    written: u64,
    extensions: Vec<ChunkExtension>,
    on_complete: Option<OnComplete>,
}

impl Chunk {
    /// 创建一个分块。`size` 是声明的大小，会出现在分块大小行上；
    /// 实际从 `data` 读出的字节数必须与之相等，否则流以
    /// `OutgoingLengthIncorrect` 失败。
    pub fn new(data: Box<dyn BodySource>, size: u64) -> Chunk {
        Chunk {
            data,
            size,
            written: 0,
            extensions: Vec::new(),
            on_complete: None,
        }
    }

    /// 创建终止分块（大小为 0）。
    pub fn termination() -> Chunk {
        Chunk::new(Box::new(crate::body::BytesBody::new(Bytes::new())), 0)
    }

    /// 追加一个 `;key=value` 扩展。终止分块上同样允许扩展。
    pub fn add_extension(mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Chunk {
        self.extensions.push(ChunkExtension {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// 设置完成回调，在 I/O 线程上恰好触发一次。
    pub fn on_complete(mut self, cb: impl FnOnce(crate::Result<()>) + Send + 'static) -> Chunk {
        self.on_complete = Some(Box::new(cb));
        self
    }

    pub(crate) fn is_termination(&self) -> bool {
        self.size == 0
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn extensions(&self) -> &[ChunkExtension] {
        &self.extensions
    }

    pub(crate) fn remaining(&self) -> u64 {
        self.size - self.written
    }

    pub(crate) fn note_written(&mut self, n: u64) {
        self.written += n;
    }

    pub(crate) fn read(&mut self, dst: &mut [u8]) -> std::io::Result<usize> {
        self.data.read(dst)
    }

    pub(crate) fn is_end_of_stream(&self) -> bool {
        self.data.is_end_of_stream()
    }

    /// 取走完成回调，交给调用方在合适的时机（锁外）触发。
    pub(crate) fn take_completion(&mut self) -> Option<OnComplete> {
        self.on_complete.take()
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // A chunk dropped before its bytes hit the wire was cancelled;
        // the callback must still fire so the user can release buffers.
        if let Some(cb) = self.on_complete.take() {
            cb(Err(crate::Error::new_canceled()));
        }
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("size", &self.size)
            .field("written", &self.written)
            .field("extensions", &self.extensions.len())
            .finish()
    }
}

/// 出站分块的 FIFO 队列。
#[derive(Debug, Default)]
pub(crate) struct ChunkQueue {
    chunks: std::collections::VecDeque<Chunk>,
    terminated: bool,
}

impl ChunkQueue {
    /// 入队一个分块。终止分块之后的入队是用法错误，
    /// 分块原样退回给调用方处置。
    pub(crate) fn push(&mut self, chunk: Chunk) -> std::result::Result<(), Chunk> {
        if self.terminated {
            return Err(chunk);
        }
        if chunk.is_termination() {
            self.terminated = true;
        }
        self.chunks.push_back(chunk);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Option<Chunk> {
        self.chunks.pop_front()
    }

    /// 清空队列，未写出的分块通过 `Drop` 收到 `Canceled`。
    pub(crate) fn cancel(&mut self) {
        self.chunks.clear();
    }
}
