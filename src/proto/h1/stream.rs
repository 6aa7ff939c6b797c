//! 每条请求/响应交换的流状态
//!
//! 一条流由两个逻辑所有者共享：用户侧的 [`StreamHandle`]（可跨线程），
//! 和连接（直到流完成时从队列里摘除）。流的内部状态只在 I/O 线程上
//! 变动；句柄上的操作（激活、写分块、开窗口）都封送成管道任务。
//! 句柄对连接的引用是非拥有的（`Weak`），避免循环引用。
//!
//! 状态机单调推进：
//! `Unactivated → Pending → Writing → (WritingAndReading) → Reading → Complete`，
//! 任何状态都可以因取消而直接终结为 `Complete(err)`。
//! `on_complete` 对每条流恰好触发一次。

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use http::StatusCode;

use crate::message::{Header, HeaderBlock, Request};
use crate::proto::h1::chunks::{Chunk, ChunkQueue};
use crate::proto::h1::conn::Http1Connection;
use crate::proto::h1::decode::Decoder;
use crate::proto::h1::encode::Encoder;

/// 用户回调的返回类型。返回 `Err` 会取消这条流（以
/// `CallbackError` 完成）并关闭连接，因为线路上的帧已不可恢复。
pub type CallbackResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// 一条流的用户回调集合。全部在 I/O 线程上触发。
///
/// 跨流的顺序保证：流 N 的全部回调先于流 N+1 的任何回调。
/// 单条流内的顺序：`on_headers*`、`on_header_block_done`、`on_body*`、
/// 最后 `on_complete` 恰好一次。某个回调返回错误之后，
/// 除 `on_complete` 外不再有回调触发。
#[derive(Default)]
pub struct StreamCallbacks {
    /// 一个头部块解码完成（参数：块种类、状态码、头部列表）。
    pub on_headers:
        Option<Box<dyn FnMut(HeaderBlock, StatusCode, &[Header]) -> CallbackResult + Send>>,
    /// 一个头部块的结束标记。
    pub on_header_block_done:
        Option<Box<dyn FnMut(HeaderBlock, StatusCode) -> CallbackResult + Send>>,
    /// 一段响应消息体字节。
    pub on_body: Option<Box<dyn FnMut(&[u8]) -> CallbackResult + Send>>,
    /// 流终结，恰好触发一次。
    pub on_complete: Option<Box<dyn FnOnce(crate::Result<()>) + Send>>,
}

impl fmt::Debug for StreamCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCallbacks")
            .field("on_headers", &self.on_headers.is_some())
            .field("on_header_block_done", &self.on_header_block_done.is_some())
            .field("on_body", &self.on_body.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// 流状态机的状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamState {
    Unactivated,
    Pending,
    Writing,
    WritingAndReading,
    Reading,
    Complete,
}

/// 用户句柄可见的共享位：激活标记、完成标记、响应状态码。
/// 这是除连接 open 标记之外唯一允许跨线程读取的流状态。
pub(crate) struct StreamShared {
    pub(crate) activated: AtomicBool,
    pub(crate) complete: AtomicBool,
    pub(crate) status: Mutex<Option<StatusCode>>,
}

impl StreamShared {
    pub(crate) fn new() -> Arc<StreamShared> {
        Arc::new(StreamShared {
            activated: AtomicBool::new(false),
            complete: AtomicBool::new(false),
            status: Mutex::new(None),
        })
    }
}

/// 连接内部持有的流对象。
pub(crate) struct Stream {
    pub(crate) id: u64,
    pub(crate) shared: Arc<StreamShared>,
    /// 编码器创建之前暂存的请求。
    pub(crate) request: Option<Request>,
    pub(crate) is_head: bool,
    pub(crate) has_close_header: bool,
    pub(crate) encoder: Option<Encoder>,
    pub(crate) chunks: ChunkQueue,
    pub(crate) decoder: Option<Decoder>,
    pub(crate) state: StreamState,
    pub(crate) callbacks: StreamCallbacks,
    pub(crate) write_done: bool,
    pub(crate) read_done: bool,
}

impl Stream {
    pub(crate) fn new(
        id: u64,
        request: Request,
        callbacks: StreamCallbacks,
        shared: Arc<StreamShared>,
    ) -> Stream {
        let is_head = request.method() == http::Method::HEAD;
        let has_close_header = crate::headers::has_connection_close(request.headers());
        Stream {
            id,
            shared,
            request: Some(request),
            is_head,
            has_close_header,
            encoder: None,
            chunks: ChunkQueue::default(),
            decoder: None,
            state: StreamState::Unactivated,
            callbacks,
            write_done: false,
            read_done: false,
        }
    }

    /// 编码器选中本条流开始（继续）写。
    pub(crate) fn note_write_started(&mut self) {
        self.state = match self.state {
            StreamState::Pending => StreamState::Writing,
            other => other,
        };
    }

    /// 写方向结束。
    pub(crate) fn note_write_done(&mut self) {
        self.write_done = true;
        self.state = if self.read_done {
            StreamState::Complete
        } else {
            StreamState::Reading
        };
    }

    /// 解码器开始向本条流交付响应字节。
    /// 请求体还没写完时进入双向并行（1xx 流程需要）。
    pub(crate) fn note_read_started(&mut self) {
        self.state = match self.state {
            StreamState::Pending | StreamState::Writing => StreamState::WritingAndReading,
            other => other,
        };
    }

    pub(crate) fn note_read_done(&mut self) {
        self.read_done = true;
        if self.write_done {
            self.state = StreamState::Complete;
        }
    }

    pub(crate) fn set_status(&self, status: StatusCode) {
        *self.shared.status.lock().unwrap() = Some(status);
    }

    /// 终结这条流：标记完成、取消未写出的分块、触发 `on_complete`。
    ///
    /// 流此时已从连接的队列里摘除，本方法消耗所有权。
    pub(crate) fn complete(mut self, result: crate::Result<()>) {
        debug!(
            "stream {} complete, ok: {}",
            self.id,
            result.is_ok()
        );
        self.state = StreamState::Complete;
        self.shared.complete.store(true, Ordering::SeqCst);
        // Unwritten chunks observe Canceled through their Drop.
        self.chunks.cancel();
        if let Some(cb) = self.callbacks.on_complete.take() {
            cb(result);
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("write_done", &self.write_done)
            .field("read_done", &self.read_done)
            .finish()
    }
}

/// 用户持有的流句柄。
///
/// 所有改变连接状态的方法都封送到 I/O 线程执行，调用方看到的是
/// "发出即忘"的最终一致语义。
pub struct StreamHandle {
    pub(crate) id: u64,
    pub(crate) conn: Weak<Http1Connection>,
    pub(crate) shared: Arc<StreamShared>,
}

impl StreamHandle {
    /// 把流排入发送队列。对每条流只能调用一次；
    /// 第二次调用是用法错误，同步返回。
    pub fn activate(&self) -> crate::Result<()> {
        if self.shared.activated.swap(true, Ordering::SeqCst) {
            return Err(crate::Error::new_user_activated_twice());
        }
        match self.conn.upgrade() {
            Some(conn) => {
                conn.schedule_activate(self.id);
                Ok(())
            }
            None => Err(crate::Error::new_closed()),
        }
    }

    /// 向分块编码的请求体投递一个分块。任意线程可调用。
    ///
    /// 投递结果通过分块自己的完成回调观察：写上线路后收到 `Ok`，
    /// 流被取消或投递非法（终止分块之后再写）时收到对应错误。
    pub fn write_chunk(&self, chunk: Chunk) {
        match self.conn.upgrade() {
            Some(conn) => conn.schedule_write_chunk(self.id, chunk),
            None => {
                // Connection is gone; dropping the chunk cancels it.
                drop(chunk);
            }
        }
    }

    /// 给共享读窗口增加 `n` 字节额度。任意线程可调用。
    pub fn update_window(&self, n: usize) {
        if let Some(conn) = self.conn.upgrade() {
            conn.schedule_update_window(n);
        }
    }

    /// 目前已解码到的响应状态码（信息性响应期间是 1xx 的值）。
    pub fn response_status(&self) -> Option<StatusCode> {
        *self.shared.status.lock().unwrap()
    }

    /// `on_complete` 是否已经触发。
    pub fn is_complete(&self) -> bool {
        self.shared.complete.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("complete", &self.is_complete())
            .finish()
    }
}
