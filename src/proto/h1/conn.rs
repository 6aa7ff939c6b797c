//! HTTP/1.1 客户端连接状态机模块
//!
//! 本模块实现单条客户端 HTTP/1.1 连接的核心状态管理。`Http1Connection`
//! 作为处理器挂载在字节管道上，负责：
//!
//! - 持有按激活顺序排列的流队列，写方向严格按此顺序串行化请求
//! - 读方向把解码事件配对到最老的未完成流（流水线匹配）
//! - 读窗口记账：帧格式字节在消息完成时自动返还，消息体字节
//!   只凭用户增量返还
//! - `Connection: close` 语义（请求侧在激活时生效，响应侧在头部块
//!   解码时生效），close 点之后排队的流永不上线
//! - 101 协议升级：升级流成功完成后连接变成透明的双向透传
//! - 关闭与取消：优雅关闭、错误关闭、外部管道关闭的统一善后
//!
//! ## 线程模型
//!
//! 状态机的全部推进都发生在 I/O 线程上。用户 API（`make_request` 之外）
//! 经由管道任务队列封送；唯一跨线程可读的状态是 `shared` 小锁里的
//! open / allow 标记和各条流的共享位。`inner` 锁仅在 I/O 线程上竞争，
//! 用户回调在持有它的情况下触发——回调里允许调用流句柄操作和
//! `close`/`is_open`，它们都不会回到 `inner`。

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use bytes::{Bytes, BytesMut};
use http::StatusCode;

use crate::channel::{Channel, ChannelHandle, ChannelHandler, Direction, Task, MAX_MESSAGE_SIZE};
use crate::error::{Error, Kind, Parse};
use crate::message::{Header, HeaderBlock, Request};
use crate::proto::h1::chunks::Chunk;
use crate::proto::h1::decode::{Decoder, Event};
use crate::proto::h1::encode::{Completion, Encode, Encoder};
use crate::proto::h1::stream::{
    CallbackResult, Stream, StreamCallbacks, StreamHandle, StreamShared, StreamState,
};

/// 连接的配置选项。
#[derive(Debug, Clone)]
pub struct Http1Options {
    /// 连接创建时的读窗口（字节）。
    pub initial_read_window: usize,
    /// 手动窗口管理：开启后，用户接受的消息体字节不再自动返还
    /// 读窗口，只能通过 `update_window` 增加额度。
    /// 帧格式字节无论如何都在消息完成时自动返还。
    pub manual_window_management: bool,
}

impl Default for Http1Options {
    fn default() -> Http1Options {
        Http1Options {
            initial_read_window: 64 * 1024,
            manual_window_management: false,
        }
    }
}

/// 新请求是否被接受，以及不接受的原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Allow {
    Allowed,
    Closed,
    Switched,
}

/// 跨线程可读的小状态，由专门的小锁保护。
struct Shared {
    open: bool,
    allow: Allow,
}

/// I/O 线程独占的连接状态。
struct Inner {
    options: Http1Options,
    /// 所有未完成的流（含未激活的）。
    streams: Vec<Stream>,
    /// 激活顺序队列；队首是最老的未完成流。
    queue: VecDeque<u64>,
    /// 未解码的入站字节。
    read_buf: BytesMut,
    /// 当前读窗口余量。
    window: usize,
    /// 携带 `Connection: close` 的流；其后排队的流永不写出。
    close_point: Option<u64>,
    /// 101 的头部块已解码，等它的 Complete 事件完成切换。
    pending_switch: bool,
    /// 已切换协议：连接成为透明透传。
    switched: bool,
    read_closed: bool,
    write_closed: bool,
    shutting_down: bool,
    /// 是否已有流成功完成（区分多余数据与无请求时的响应）。
    any_completed: bool,
    /// 出站泵任务是否已入队（去重）。
    pump_scheduled: bool,
    /// 切换协议后等待下游窗口的透传字节。
    passthrough: BytesMut,
}

/// 必须在释放 `inner` 锁之后执行的外部副作用。
enum After {
    Shutdown(Option<Error>),
    FlushPassthrough,
}

/// 单条客户端 HTTP/1.1 连接。
///
/// 通过 [`bind`](Http1Connection::bind) 挂载到管道上获得；
/// 用户侧用 [`make_request`](Http1Connection::make_request) 提交请求，
/// 得到的 [`StreamHandle`] 激活后请求才会上线。
pub struct Http1Connection {
    channel: ChannelHandle,
    self_ref: OnceLock<Weak<Http1Connection>>,
    next_id: AtomicU64,
    shared: Mutex<Shared>,
    /// `make_request` 刚创建、还没被 I/O 线程收编的流。
    /// 独立于 `inner` 锁，让回调内部的 `make_request` 不会死锁。
    newborn: Mutex<Vec<Stream>>,
    inner: Mutex<Inner>,
}

impl Http1Connection {
    /// 创建连接并挂载到管道上。
    pub fn bind(channel: &Channel, options: Http1Options) -> Arc<Http1Connection> {
        let window = options.initial_read_window;
        let conn = Arc::new(Http1Connection {
            channel: channel.handle(),
            self_ref: OnceLock::new(),
            next_id: AtomicU64::new(1),
            shared: Mutex::new(Shared {
                open: true,
                allow: Allow::Allowed,
            }),
            newborn: Mutex::new(Vec::new()),
            inner: Mutex::new(Inner {
                options,
                streams: Vec::new(),
                queue: VecDeque::new(),
                read_buf: BytesMut::new(),
                window,
                close_point: None,
                pending_switch: false,
                switched: false,
                read_closed: false,
                write_closed: false,
                shutting_down: false,
                any_completed: false,
                pump_scheduled: false,
                passthrough: BytesMut::new(),
            }),
        });
        let _ = conn.self_ref.set(Arc::downgrade(&conn));
        channel.install_handler(conn.clone());
        conn
    }

    /// 创建一条新的流。任意线程可调用。
    ///
    /// 连接不再接受新请求时同步失败：关闭后是 `ConnectionClosed`，
    /// 协议切换后是 `SwitchedProtocols`。
    pub fn make_request(
        self: &Arc<Self>,
        request: Request,
        callbacks: StreamCallbacks,
    ) -> crate::Result<StreamHandle> {
        {
            let shared = self.shared.lock().unwrap();
            match shared.allow {
                Allow::Allowed => {}
                Allow::Closed => return Err(Error::new_closed()),
                Allow::Switched => return Err(Error::new_switched_protocols()),
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shared_bits = StreamShared::new();
        let stream = Stream::new(id, request, callbacks, shared_bits.clone());
        self.newborn.lock().unwrap().push(stream);
        trace!("created stream {}", id);
        Ok(StreamHandle {
            id,
            conn: Arc::downgrade(self),
            shared: shared_bits,
        })
    }

    /// 发起优雅关闭。任意线程可调用。
    ///
    /// 本方法返回后 [`is_open`](Http1Connection::is_open) 立即为 false，
    /// 即使关闭还没在 I/O 线程上传播开。
    pub fn close(&self) {
        {
            let mut shared = self.shared.lock().unwrap();
            shared.open = false;
            shared.allow = Allow::Closed;
        }
        if let Some(channel) = self.channel.channel() {
            let ch = channel.clone();
            channel.schedule(Task::new("connection-close", move || {
                ch.shutdown(None);
            }));
        }
    }

    /// 连接是否仍然开启。
    pub fn is_open(&self) -> bool {
        self.shared.lock().unwrap().open
    }

    /// 连接是否还接受新请求。
    pub fn new_requests_allowed(&self) -> bool {
        self.shared.lock().unwrap().allow == Allow::Allowed
    }

    fn upgrade_self(&self) -> Option<Arc<Http1Connection>> {
        self.self_ref.get().and_then(Weak::upgrade)
    }

    // ===== 流句柄的封送入口 =====

    pub(crate) fn schedule_activate(self: &Arc<Self>, id: u64) {
        if let Some(channel) = self.channel.channel() {
            let conn = self.clone();
            let ch = channel.clone();
            channel.schedule(Task::new("stream-activate", move || {
                conn.activate_on_thread(&ch, id);
            }));
        }
    }

    pub(crate) fn schedule_write_chunk(self: &Arc<Self>, id: u64, chunk: Chunk) {
        match self.channel.channel() {
            Some(channel) => {
                let conn = self.clone();
                let ch = channel.clone();
                channel.schedule(Task::new("stream-write-chunk", move || {
                    conn.write_chunk_on_thread(&ch, id, chunk);
                }));
            }
            None => drop(chunk),
        }
    }

    pub(crate) fn schedule_update_window(self: &Arc<Self>, n: usize) {
        if let Some(channel) = self.channel.channel() {
            let conn = self.clone();
            let ch = channel.clone();
            channel.schedule(Task::new("stream-update-window", move || {
                conn.update_window_on_thread(&ch, n);
            }));
        }
    }

    // ===== I/O 线程上的任务体 =====

    fn activate_on_thread(&self, channel: &Channel, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        self.merge_newborn(inner);

        let Some(pos) = position(&inner.streams, id) else {
            return;
        };

        if inner.switched {
            let stream = remove_stream(inner, id);
            stream.complete(Err(Error::new_switched_protocols()));
            return;
        }
        if inner.shutting_down {
            let stream = remove_stream(inner, id);
            stream.complete(Err(Error::new_closed()));
            return;
        }

        trace!("stream {} activated", id);
        inner.streams[pos].state = StreamState::Pending;
        inner.queue.push_back(id);

        if inner.streams[pos].has_close_header && inner.close_point.is_none() {
            // No stream queued after this one will ever reach the wire.
            debug!("request has Connection: close, no new requests allowed");
            inner.close_point = Some(id);
            let mut shared = self.shared.lock().unwrap();
            shared.open = false;
            shared.allow = Allow::Closed;
        }

        self.schedule_pump(inner, channel);
    }

    fn write_chunk_on_thread(&self, channel: &Channel, id: u64, chunk: Chunk) {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        self.merge_newborn(inner);

        let Some(pos) = position(&inner.streams, id) else {
            // Stream already completed or cancelled; dropping the chunk
            // delivers Canceled to its completion callback.
            drop(chunk);
            return;
        };

        match inner.streams[pos].chunks.push(chunk) {
            Ok(()) => self.schedule_pump(inner, channel),
            Err(mut chunk) => {
                if let Some(cb) = chunk.take_completion() {
                    cb(Err(Error::new_user_write_after_terminator()));
                }
            }
        }
    }

    fn update_window_on_thread(&self, channel: &Channel, n: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.window += n;
        channel.increment_read_window(n);
    }

    fn schedule_pump(&self, inner: &mut Inner, channel: &Channel) {
        if inner.pump_scheduled || inner.write_closed || inner.switched || inner.shutting_down {
            return;
        }
        let Some(conn) = self.upgrade_self() else {
            return;
        };
        inner.pump_scheduled = true;
        let ch = channel.clone();
        channel.schedule(Task::new("outgoing-stream", move || {
            conn.pump_on_thread(&ch);
        }));
    }

    /// 出站泵：按激活顺序推进编码器，写满一条消息就提交再申请下一条。
    ///
    /// 数据源本轮读不出字节（但还没到流末尾）时重新排队自己；
    /// 分块流等数据时挂起，由下一次 `write_chunk` 唤醒。
    fn pump_on_thread(&self, channel: &Channel) {
        let mut chunk_completions: Vec<Completion> = Vec::new();
        let mut shutdown_after: Option<Option<Error>> = None;
        {
            let mut inner = self.inner.lock().unwrap();
            let inner = &mut *inner;
            inner.pump_scheduled = false;
            if inner.write_closed || inner.switched || inner.shutting_down {
                return;
            }

            let mut msg = channel.acquire_message(MAX_MESSAGE_SIZE);
            let mut reschedule = false;

            'streams: loop {
                let Some(id) = next_write_stream(&inner.queue, &inner.streams, inner.close_point)
                else {
                    break;
                };
                let pos = position(&inner.streams, id).expect("queued stream exists");

                {
                    let stream = &mut inner.streams[pos];
                    if stream.encoder.is_none() {
                        let mut request =
                            stream.request.take().expect("unwritten stream has request");
                        stream.encoder = Some(Encoder::new(&mut request));
                    }
                    stream.note_write_started();
                }

                let result = {
                    let stream = &mut inner.streams[pos];
                    let Stream {
                        ref mut encoder,
                        ref mut chunks,
                        ..
                    } = *stream;
                    encoder.as_mut().expect("encoder just created").encode(
                        &mut msg.data,
                        MAX_MESSAGE_SIZE,
                        chunks,
                        &mut chunk_completions,
                    )
                };

                match result {
                    Ok(Encode::Done) => {
                        trace!("stream {} request fully written", id);
                        inner.streams[pos].note_write_done();
                        if inner.streams[pos].read_done {
                            let stream = remove_stream(inner, id);
                            inner.any_completed = true;
                            stream.complete(Ok(()));
                            if inner.close_point == Some(id) {
                                self.begin_graceful_close(inner);
                                shutdown_after = Some(None);
                                break 'streams;
                            }
                        }
                    }
                    Ok(Encode::AwaitingChunk) => {
                        // Writes are strictly ordered; nothing behind this
                        // stream may start until its body terminates.
                        trace!("stream {} waiting for chunk data", id);
                        break;
                    }
                    Ok(Encode::MoreToCome) => {
                        if msg.data.len() >= MAX_MESSAGE_SIZE {
                            let full = std::mem::replace(
                                &mut msg,
                                channel.acquire_message(MAX_MESSAGE_SIZE),
                            );
                            let _ = channel.send_message(full);
                            continue;
                        }
                        // Source starved; try again next tick.
                        reschedule = true;
                        break;
                    }
                    Err(e) => {
                        debug!("outgoing stream {} failed: {}", id, e);
                        let kind = e.kind();
                        let stream = remove_stream(inner, id);
                        stream.complete(Err(e));
                        inner.shutting_down = true;
                        inner.read_closed = true;
                        shutdown_after = Some(Some(Error::new(kind)));
                        break;
                    }
                }
            }

            if !msg.data.is_empty() {
                let _ = channel.send_message(msg);
            }
            if reschedule && shutdown_after.is_none() {
                self.schedule_pump(inner, channel);
            }
        }

        for cb in chunk_completions {
            cb(Ok(()));
        }
        if let Some(error) = shutdown_after {
            channel.shutdown(error);
        }
    }

    /// 读方向的解码循环：把读缓冲里的字节翻译成事件并派发回调。
    fn drive_decode(&self, channel: &Channel) {
        let mut after: Vec<After> = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let inner = &mut *inner;
            'outer: loop {
                if inner.read_closed || inner.shutting_down {
                    break;
                }
                if inner.switched {
                    if !inner.read_buf.is_empty() {
                        let rest = inner.read_buf.split_off(0);
                        inner.passthrough.extend_from_slice(&rest);
                    }
                    if !inner.passthrough.is_empty() {
                        after.push(After::FlushPassthrough);
                    }
                    break;
                }
                if inner.read_buf.is_empty() {
                    break;
                }

                // The decode target is always the oldest stream still
                // expecting response bytes.
                let id = inner
                    .queue
                    .iter()
                    .copied()
                    .find(|&id| stream_ref(&inner.streams, id).map_or(false, |s| !s.read_done));
                let Some(id) = id else {
                    debug!(
                        "received {} bytes with no stream to receive them",
                        inner.read_buf.len()
                    );
                    let err = if inner.any_completed {
                        Error::new_unexpected_data()
                    } else {
                        Error::new_parse(Parse::Unexpected)
                    };
                    inner.read_closed = true;
                    inner.shutting_down = true;
                    after.push(After::Shutdown(Some(err)));
                    break;
                };
                let pos = position(&inner.streams, id).expect("queued stream exists");

                {
                    let stream = &mut inner.streams[pos];
                    if stream.decoder.is_none() {
                        stream.decoder = Some(Decoder::new(stream.is_head));
                    }
                    stream.note_read_started();
                }

                let event = {
                    let Inner {
                        ref mut streams,
                        ref mut read_buf,
                        ..
                    } = *inner;
                    streams[pos]
                        .decoder
                        .as_mut()
                        .expect("decoder just created")
                        .decode(read_buf)
                };

                match event {
                    Err(e) => {
                        debug!("incoming stream {} failed: {}", id, e);
                        let kind = e.kind();
                        let stream = remove_stream(inner, id);
                        stream.complete(Err(e));
                        inner.read_closed = true;
                        inner.shutting_down = true;
                        after.push(After::Shutdown(Some(Error::new(kind))));
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(event)) => {
                        if !self.handle_event(inner, channel, id, event, &mut after) {
                            break 'outer;
                        }
                    }
                }
            }
        }

        for act in after {
            match act {
                After::Shutdown(error) => channel.shutdown(error),
                After::FlushPassthrough => self.flush_passthrough(channel),
            }
        }
    }

    /// 处理一个解码事件；返回是否继续解码循环。
    fn handle_event(
        &self,
        inner: &mut Inner,
        channel: &Channel,
        id: u64,
        event: Event,
        after: &mut Vec<After>,
    ) -> bool {
        let pos = position(&inner.streams, id).expect("stream exists while decoding");
        match event {
            Event::Informational { status, headers } => {
                let stream = &mut inner.streams[pos];
                stream.set_status(status);
                let fired = fire_headers(stream, HeaderBlock::Informational, status, &headers)
                    .and_then(|()| fire_block_done(stream, HeaderBlock::Informational, status));
                match fired {
                    Ok(()) => true,
                    Err(cause) => self.callback_failed(inner, id, cause, after),
                }
            }
            Event::Headers { status, headers } => {
                let close = crate::headers::has_connection_close(&headers);
                let stream = &mut inner.streams[pos];
                stream.set_status(status);
                let fired = fire_headers(stream, HeaderBlock::Main, status, &headers)
                    .and_then(|()| fire_block_done(stream, HeaderBlock::Main, status));
                if let Err(cause) = fired {
                    return self.callback_failed(inner, id, cause, after);
                }
                if status == StatusCode::SWITCHING_PROTOCOLS {
                    // The switch is carried out once the decoder delivers
                    // the Complete event for this head.
                    inner.pending_switch = true;
                } else if close {
                    debug!("response has Connection: close, no new requests allowed");
                    if inner.close_point.is_none() {
                        inner.close_point = Some(id);
                    }
                    let mut shared = self.shared.lock().unwrap();
                    shared.open = false;
                    shared.allow = Allow::Closed;
                }
                true
            }
            Event::Body(data) => {
                let stream = &mut inner.streams[pos];
                if let Err(cause) = fire_body(stream, &data) {
                    return self.callback_failed(inner, id, cause, after);
                }
                if !inner.options.manual_window_management {
                    inner.window += data.len();
                    channel.increment_read_window(data.len());
                }
                true
            }
            Event::Trailers(headers) => {
                let stream = &mut inner.streams[pos];
                let status = stream
                    .shared
                    .status
                    .lock()
                    .unwrap()
                    .expect("trailers follow a status");
                let fired = fire_headers(stream, HeaderBlock::Trailing, status, &headers)
                    .and_then(|()| fire_block_done(stream, HeaderBlock::Trailing, status));
                match fired {
                    Ok(()) => true,
                    Err(cause) => self.callback_failed(inner, id, cause, after),
                }
            }
            Event::Complete => self.message_complete(inner, channel, id, after),
        }
    }

    fn message_complete(
        &self,
        inner: &mut Inner,
        channel: &Channel,
        id: u64,
        after: &mut Vec<After>,
    ) -> bool {
        let pos = position(&inner.streams, id).expect("stream exists while decoding");

        // Framing bytes replenish the window on their own; body bytes
        // only through the user.
        let refund = inner.streams[pos]
            .decoder
            .as_mut()
            .map(Decoder::take_framing)
            .unwrap_or(0);
        if refund > 0 {
            inner.window += refund;
            channel.increment_read_window(refund);
        }

        if inner.pending_switch {
            inner.pending_switch = false;
            // The upgrade stream completes successfully; any write state
            // it still had is abandoned along with the protocol.
            let stream = remove_stream(inner, id);
            inner.any_completed = true;
            stream.complete(Ok(()));

            debug!("connection has switched protocols");
            inner.switched = true;
            {
                let mut shared = self.shared.lock().unwrap();
                shared.allow = Allow::Switched;
            }
            self.merge_newborn(inner);
            for stream in take_all_streams(inner) {
                stream.complete(Err(Error::new_switched_protocols()));
            }
            // Remaining delivery bytes (and everything after) flow through
            // untouched; the decode loop's switched arm forwards them.
            return true;
        }

        inner.streams[pos].note_read_done();
        if inner.streams[pos].write_done {
            let stream = remove_stream(inner, id);
            inner.any_completed = true;
            stream.complete(Ok(()));
            if inner.close_point == Some(id) {
                self.begin_graceful_close(inner);
                after.push(After::Shutdown(None));
                return false;
            }
        }
        // Response finished before the request body did: completion waits
        // for the write side (required for 1xx flows).
        true
    }

    /// close 点的流已完成：其后的流以 `ConnectionClosed` 完成，
    /// 然后干净地关闭管道。
    fn begin_graceful_close(&self, inner: &mut Inner) {
        self.merge_newborn(inner);
        for stream in take_all_streams(inner) {
            stream.complete(Err(Error::new_closed()));
        }
        inner.read_closed = true;
        inner.shutting_down = true;
    }

    fn callback_failed(
        &self,
        inner: &mut Inner,
        id: u64,
        cause: Box<dyn std::error::Error + Send + Sync>,
        after: &mut Vec<After>,
    ) -> bool {
        debug!("stream {} callback returned error, canceling", id);
        let stream = remove_stream(inner, id);
        stream.complete(Err(Error::new_user_callback(cause)));
        // The wire framing is no longer recoverable.
        inner.read_closed = true;
        inner.shutting_down = true;
        after.push(After::Shutdown(Some(Error::new(Kind::User(
            crate::error::User::Callback,
        )))));
        false
    }

    /// 把透传字节按下游窗口的余量推下去。
    fn flush_passthrough(&self, channel: &Channel) {
        let mut fatal = false;
        loop {
            let data = {
                let mut inner = self.inner.lock().unwrap();
                if inner.passthrough.is_empty() {
                    break;
                }
                match channel.downstream_window() {
                    None => {
                        // Post-upgrade data with nobody to receive it.
                        error!("protocol-switch data arrived with no downstream handler");
                        inner.passthrough.clear();
                        inner.read_closed = true;
                        inner.shutting_down = true;
                        fatal = true;
                        break;
                    }
                    Some(0) => break,
                    Some(window) => {
                        let n = std::cmp::min(window, inner.passthrough.len());
                        inner.passthrough.split_to(n).freeze()
                    }
                }
            };
            if channel.send_downstream(data).is_err() {
                break;
            }
        }
        if fatal {
            channel.shutdown(Some(Error::new_switched_protocols()));
        }
    }

    fn merge_newborn(&self, inner: &mut Inner) {
        let mut newborn = self.newborn.lock().unwrap();
        inner.streams.append(&mut *newborn);
    }
}

impl ChannelHandler for Http1Connection {
    fn on_read(&self, channel: &Channel, data: Bytes) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.read_closed || inner.shutting_down {
                debug!("discarding {} bytes read after close", data.len());
                return;
            }
            if inner.switched {
                inner.passthrough.extend_from_slice(&data);
            } else {
                if data.len() > inner.window {
                    debug!(
                        "channel delivered {} bytes against a window of {}",
                        data.len(),
                        inner.window
                    );
                }
                inner.window = inner.window.saturating_sub(data.len());
                inner.read_buf.extend_from_slice(&data);
            }
        }
        self.drive_decode(channel);
    }

    fn on_downstream_write(&self, channel: &Channel, data: Bytes) -> crate::Result<()> {
        {
            let inner = self.inner.lock().unwrap();
            if !inner.switched {
                return Err(Error::new_user_downstream_write());
            }
            if inner.write_closed {
                return Err(Error::new_closed());
            }
        }
        // Pass-through: bytes travel to the wire untouched.
        let mut msg = channel.acquire_message(data.len());
        msg.data.extend_from_slice(&data);
        channel.send_message(msg)
    }

    fn on_downstream_window_increment(&self, channel: &Channel, _n: usize) {
        self.flush_passthrough(channel);
    }

    fn on_shutdown(
        &self,
        _channel: &Channel,
        direction: Direction,
        error: Option<&Error>,
        free_resources_immediately: bool,
    ) {
        debug!("connection shutdown in {:?} direction", direction);
        match direction {
            Direction::Read => {
                let mut inner = self.inner.lock().unwrap();
                let inner = &mut *inner;
                inner.read_closed = true;
                inner.shutting_down = true;
                {
                    let mut shared = self.shared.lock().unwrap();
                    shared.open = false;
                    shared.allow = Allow::Closed;
                }

                // A clean read-shutdown is how a close-delimited response
                // ends; that stream completes successfully.
                if error.is_none() && !free_resources_immediately {
                    if let Some(id) = inner.queue.front().copied() {
                        let delimited = stream_ref(&inner.streams, id).map_or(false, |s| {
                            !s.read_done
                                && s.write_done
                                && s.decoder
                                    .as_ref()
                                    .map_or(false, Decoder::is_close_delimited)
                        });
                        if delimited {
                            let stream = remove_stream(inner, id);
                            inner.any_completed = true;
                            stream.complete(Ok(()));
                        }
                    }
                }

                // Everything else unwinds with a non-success code; a success
                // code from the pipeline is substituted with Canceled.
                self.merge_newborn(inner);
                let kind = error.map(Error::kind).unwrap_or(Kind::Canceled);
                for stream in take_all_streams(inner) {
                    stream.complete(Err(Error::new(kind)));
                }
            }
            Direction::Write => {
                let mut inner = self.inner.lock().unwrap();
                inner.write_closed = true;
            }
        }
    }
}

impl fmt::Debug for Http1Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.lock().unwrap();
        f.debug_struct("Http1Connection")
            .field("open", &shared.open)
            .field("allow", &shared.allow)
            .finish()
    }
}

// ===== 查找与队列工具 =====

fn position(streams: &[Stream], id: u64) -> Option<usize> {
    streams.iter().position(|s| s.id == id)
}

fn stream_ref(streams: &[Stream], id: u64) -> Option<&Stream> {
    streams.iter().find(|s| s.id == id)
}

fn remove_stream(inner: &mut Inner, id: u64) -> Stream {
    inner.queue.retain(|&queued| queued != id);
    let pos = position(&inner.streams, id).expect("removing unknown stream");
    inner.streams.remove(pos)
}

fn take_all_streams(inner: &mut Inner) -> Vec<Stream> {
    inner.queue.clear();
    std::mem::take(&mut inner.streams)
}

/// 下一条要写的流：激活顺序里第一条写未完成的，且不越过 close 点。
fn next_write_stream(
    queue: &VecDeque<u64>,
    streams: &[Stream],
    close_point: Option<u64>,
) -> Option<u64> {
    for &id in queue {
        if let Some(stream) = stream_ref(streams, id) {
            if !stream.write_done {
                return Some(id);
            }
        }
        if close_point == Some(id) {
            // The close-marked request is on the wire; nothing queued
            // behind it is ever written.
            return None;
        }
    }
    None
}

fn fire_headers(
    stream: &mut Stream,
    block: HeaderBlock,
    status: StatusCode,
    headers: &[Header],
) -> CallbackResult {
    match stream.callbacks.on_headers {
        Some(ref mut cb) => cb(block, status, headers),
        None => Ok(()),
    }
}

fn fire_block_done(stream: &mut Stream, block: HeaderBlock, status: StatusCode) -> CallbackResult {
    match stream.callbacks.on_header_block_done {
        Some(ref mut cb) => cb(block, status),
        None => Ok(()),
    }
}

fn fire_body(stream: &mut Stream, data: &[u8]) -> CallbackResult {
    match stream.callbacks.on_body {
        Some(ref mut cb) => cb(data),
        None => Ok(()),
    }
}
