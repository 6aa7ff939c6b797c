//! 请求编码器
//!
//! 把一个 [`Request`] 连同它的消息体序列化成出站字节段。编码器是增量的：
//! 每次调用向一个有容量上限的缓冲区里写，写满即返回，下一轮继续——
//! 请求行、头部、分块大小行（带任意长的扩展）、分块数据，任何字段都
//! 可以跨缓冲区边界切开。
//!
//! 每条流的阶段推进：`head → body → done`。分块编码的消息体又细分为
//! 等块、大小行、数据、数据后 CRLF、终止块几个内部状态；
//! 队列为空且终止块未到时编码器挂起，由用户的下一次
//! `write_chunk` 唤醒。
//!
//! 长度纪律：Content-Length 消息体从数据源读出的总字节数必须与声明
//! 相等；分块的声明大小同理。任一方向不符都是
//! `OutgoingLengthIncorrect`，且不会有超出截断点的字节被写上线路。

use std::cmp;
use std::mem;

use bytes::{Buf, Bytes, BytesMut};

use crate::body::BodySource;
use crate::headers;
use crate::message::Request;
use crate::proto::h1::chunks::{Chunk, ChunkQueue};

/// 一次 `encode` 调用之后编码器所处的进度。
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Encode {
    /// 还有字节要写：缓冲区已满，或数据源本轮暂时读不出字节。
    MoreToCome,
    /// 分块消息体在等待用户投递下一个分块，编码器挂起。
    AwaitingChunk,
    /// 请求已完整写出。
    Done,
}

/// 延迟到锁外触发的分块完成回调。
pub(crate) type Completion = Box<dyn FnOnce(crate::Result<()>) + Send>;

/// 请求消息体的成帧方式，由用户写入的头部决定。
#[derive(Debug, Clone, Copy)]
enum BodyKind {
    None,
    Fixed(u64),
    Chunked,
}

enum State {
    Head(Bytes),
    FixedBody { remaining: u64 },
    ChunkedAwaiting,
    ChunkSizeLine { line: Bytes, chunk: Chunk },
    ChunkData { chunk: Chunk },
    ChunkDataCrlf { line: Bytes, chunk: Chunk },
    /// 终止块的 `0[;ext]\r\n` 加收尾 `\r\n`，一次性渲染。
    ChunkTerminator { line: Bytes, chunk: Chunk },
    Done,
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            State::Head(..) => "Head",
            State::FixedBody { .. } => "FixedBody",
            State::ChunkedAwaiting => "ChunkedAwaiting",
            State::ChunkSizeLine { .. } => "ChunkSizeLine",
            State::ChunkData { .. } => "ChunkData",
            State::ChunkDataCrlf { .. } => "ChunkDataCrlf",
            State::ChunkTerminator { .. } => "ChunkTerminator",
            State::Done => "Done",
        };
        f.write_str(name)
    }
}

pub(crate) struct Encoder {
    state: State,
    body_kind: BodyKind,
    body: Option<Box<dyn BodySource>>,
}

impl Encoder {
    /// 渲染请求头并确定消息体成帧方式；消息体数据源的所有权转移给编码器。
    pub(crate) fn new(request: &mut Request) -> Encoder {
        let body_kind = if headers::transfer_encoding_is_chunked(request.headers()) {
            BodyKind::Chunked
        } else {
            // An unparseable Content-Length is the caller's mistake; the
            // encoder sends exactly what it was given and declares no body.
            match headers::content_length_parse(request.headers()).ok().flatten() {
                Some(n) => BodyKind::Fixed(n),
                None => BodyKind::None,
            }
        };

        let head = render_head(request);
        trace!(
            "encoder created, head is {} bytes, body: {:?}",
            head.len(),
            body_kind
        );

        Encoder {
            state: State::Head(head),
            body_kind,
            body: request.take_body(),
        }
    }

    /// 向 `dst` 写入尽可能多的字节，`max` 是 `dst` 的容量上限。
    ///
    /// 分块完成回调不在这里触发，而是推入 `completions`
    /// 由调用方在合适的时机（锁外）执行。
    pub(crate) fn encode(
        &mut self,
        dst: &mut BytesMut,
        max: usize,
        chunks: &mut ChunkQueue,
        completions: &mut Vec<Completion>,
    ) -> crate::Result<Encode> {
        loop {
            let state = mem::replace(&mut self.state, State::Done);
            let (state, ret) = self.step(state, dst, max, chunks, completions)?;
            self.state = state;
            if let Some(ret) = ret {
                return Ok(ret);
            }
        }
    }

    fn step(
        &mut self,
        state: State,
        dst: &mut BytesMut,
        max: usize,
        chunks: &mut ChunkQueue,
        completions: &mut Vec<Completion>,
    ) -> crate::Result<(State, Option<Encode>)> {
        match state {
            State::Head(mut buf) => {
                if !write_some(dst, max, &mut buf) {
                    return Ok((State::Head(buf), Some(Encode::MoreToCome)));
                }
                trace!("encoder head written, body: {:?}", self.body_kind);
                let next = match self.body_kind {
                    BodyKind::None => State::Done,
                    BodyKind::Fixed(n) => State::FixedBody { remaining: n },
                    BodyKind::Chunked => State::ChunkedAwaiting,
                };
                Ok((next, None))
            }

            State::FixedBody { mut remaining } => {
                let mut body = match self.body.take() {
                    Some(body) => body,
                    None => {
                        // No source at all: only valid if nothing was declared.
                        return if remaining == 0 {
                            Ok((State::Done, None))
                        } else {
                            Err(crate::Error::new_outgoing_length_incorrect())
                        };
                    }
                };
                match pull_body(dst, max, &mut *body, &mut remaining)? {
                    Pull::Finished => Ok((State::Done, None)),
                    Pull::Starved | Pull::BufferFull => {
                        self.body = Some(body);
                        Ok((State::FixedBody { remaining }, Some(Encode::MoreToCome)))
                    }
                }
            }

            State::ChunkedAwaiting => match chunks.pop() {
                None => Ok((State::ChunkedAwaiting, Some(Encode::AwaitingChunk))),
                Some(chunk) => {
                    let line = render_chunk_line(&chunk);
                    trace!(
                        "encoder starting chunk, size {} with {} extensions",
                        chunk.size(),
                        chunk.extensions().len()
                    );
                    if chunk.is_termination() {
                        Ok((State::ChunkTerminator { line, chunk }, None))
                    } else {
                        Ok((State::ChunkSizeLine { line, chunk }, None))
                    }
                }
            },

            State::ChunkSizeLine { mut line, chunk } => {
                if !write_some(dst, max, &mut line) {
                    return Ok((State::ChunkSizeLine { line, chunk }, Some(Encode::MoreToCome)));
                }
                Ok((State::ChunkData { chunk }, None))
            }

            State::ChunkData { mut chunk } => match pull_chunk(dst, max, &mut chunk)? {
                Pull::Finished => Ok((
                    State::ChunkDataCrlf {
                        line: Bytes::from_static(b"\r\n"),
                        chunk,
                    },
                    None,
                )),
                Pull::Starved | Pull::BufferFull => {
                    Ok((State::ChunkData { chunk }, Some(Encode::MoreToCome)))
                }
            },

            State::ChunkDataCrlf { mut line, mut chunk } => {
                if !write_some(dst, max, &mut line) {
                    return Ok((State::ChunkDataCrlf { line, chunk }, Some(Encode::MoreToCome)));
                }
                if let Some(cb) = chunk.take_completion() {
                    completions.push(cb);
                }
                Ok((State::ChunkedAwaiting, None))
            }

            State::ChunkTerminator { mut line, mut chunk } => {
                if !write_some(dst, max, &mut line) {
                    return Ok((State::ChunkTerminator { line, chunk }, Some(Encode::MoreToCome)));
                }
                if let Some(cb) = chunk.take_completion() {
                    completions.push(cb);
                }
                trace!("encoder chunked body terminated");
                Ok((State::Done, None))
            }

            State::Done => Ok((State::Done, Some(Encode::Done))),
        }
    }
}

impl std::fmt::Debug for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoder")
            .field("state", &self.state)
            .field("body_kind", &self.body_kind)
            .finish()
    }
}

enum Pull {
    /// 声明的字节数全部写出，数据源也到了末尾
    Finished,
    /// 数据源本轮读不出字节，之后重试
    Starved,
    /// 缓冲区已满
    BufferFull,
}

fn room(dst: &BytesMut, max: usize) -> usize {
    max.saturating_sub(dst.len())
}

/// 从 `src` 的队首向 `dst` 写入尽可能多的字节，返回 `src` 是否被写空。
fn write_some(dst: &mut BytesMut, max: usize, src: &mut Bytes) -> bool {
    let n = cmp::min(room(dst, max), src.len());
    dst.extend_from_slice(&src[..n]);
    src.advance(n);
    src.is_empty()
}

/// 从数据源向 `dst` 拉取至多 `remaining` 字节，执行长度纪律。
fn pull_body(
    dst: &mut BytesMut,
    max: usize,
    body: &mut dyn BodySource,
    remaining: &mut u64,
) -> crate::Result<Pull> {
    loop {
        if *remaining == 0 {
            if body.is_end_of_stream() {
                return Ok(Pull::Finished);
            }
            // The declared length is spent but the source claims more.
            // Probe one byte: anything real is an overrun, nothing may
            // just be a slow source that flips end-of-stream next tick.
            let mut probe = [0u8; 1];
            let n = body
                .read(&mut probe)
                .map_err(crate::Error::new_user_body)?;
            if n > 0 {
                return Err(crate::Error::new_outgoing_length_incorrect());
            }
            if body.is_end_of_stream() {
                return Ok(Pull::Finished);
            }
            return Ok(Pull::Starved);
        }

        let space = cmp::min(room(dst, max) as u64, *remaining) as usize;
        if space == 0 {
            return Ok(Pull::BufferFull);
        }

        let start = dst.len();
        dst.resize(start + space, 0);
        let n = match body.read(&mut dst[start..start + space]) {
            Ok(n) => n,
            Err(e) => {
                dst.truncate(start);
                return Err(crate::Error::new_user_body(e));
            }
        };
        dst.truncate(start + n);

        if n == 0 {
            if body.is_end_of_stream() {
                // Source dried up before the declared length was reached.
                return Err(crate::Error::new_outgoing_length_incorrect());
            }
            return Ok(Pull::Starved);
        }
        *remaining -= n as u64;
    }
}

/// `pull_body` 的分块版本：进度记录在分块自身的写入计数里。
fn pull_chunk(dst: &mut BytesMut, max: usize, chunk: &mut Chunk) -> crate::Result<Pull> {
    loop {
        if chunk.remaining() == 0 {
            if chunk.is_end_of_stream() {
                return Ok(Pull::Finished);
            }
            let mut probe = [0u8; 1];
            let n = chunk
                .read(&mut probe)
                .map_err(crate::Error::new_user_body)?;
            if n > 0 {
                return Err(crate::Error::new_outgoing_length_incorrect());
            }
            if chunk.is_end_of_stream() {
                return Ok(Pull::Finished);
            }
            return Ok(Pull::Starved);
        }

        let space = cmp::min(room(dst, max) as u64, chunk.remaining()) as usize;
        if space == 0 {
            return Ok(Pull::BufferFull);
        }

        let start = dst.len();
        dst.resize(start + space, 0);
        let n = match chunk.read(&mut dst[start..start + space]) {
            Ok(n) => n,
            Err(e) => {
                dst.truncate(start);
                return Err(crate::Error::new_user_body(e));
            }
        };
        dst.truncate(start + n);

        if n == 0 {
            if chunk.is_end_of_stream() {
                return Err(crate::Error::new_outgoing_length_incorrect());
            }
            return Ok(Pull::Starved);
        }
        chunk.note_written(n as u64);
    }
}

/// 把请求行和头部按原样渲染成一段连续字节。
fn render_head(request: &Request) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);
    buf.extend_from_slice(request.method().as_str().as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(request.target());
    buf.extend_from_slice(b" HTTP/1.1\r\n");
    for header in request.headers() {
        buf.extend_from_slice(&header.name);
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(&header.value);
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf.freeze()
}

/// 渲染分块大小行：小写十六进制大小、扩展、CRLF。
/// 终止块在同一段缓冲里再带上收尾的空行。
fn render_chunk_line(chunk: &Chunk) -> Bytes {
    let mut buf = BytesMut::with_capacity(16);
    let hex = format!("{:x}", chunk.size());
    buf.extend_from_slice(hex.as_bytes());
    for ext in chunk.extensions() {
        buf.extend_from_slice(b";");
        buf.extend_from_slice(&ext.key);
        buf.extend_from_slice(b"=");
        buf.extend_from_slice(&ext.value);
    }
    buf.extend_from_slice(b"\r\n");
    if chunk.is_termination() {
        buf.extend_from_slice(b"\r\n");
    }
    buf.freeze()
}
