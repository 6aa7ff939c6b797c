//! 响应解码器
//!
//! 把入站字节流增量地解析成响应事件：头部块、消息体数据、trailer、
//! 消息结束。解析对任意切分都健壮——每个字段都可以按一个字节一次的
//! 粒度送达。
//!
//! 消息头在连接的读缓冲里累积，用 `httparse` 解析，`Partial` 就等下一批
//! 字节；在此之上额外做一遍严格 CRLF 校验，孤立的 LF 在状态行、头部行
//! 和分块大小行里都不被接受。消息体成帧按顺序判定：HEAD 请求或
//! 1xx/204/304 无消息体；`Transfer-Encoding` 以 `chunked` 结尾则按分块；
//! 有 `Content-Length` 则按定长；否则按连接关闭分隔读取。
//!
//! 1xx（101 除外）作为完整的信息性响应事件交付，随后在同一条流上
//! 继续解析下一个状态行；101 结束当前流并把连接交给协议升级处理。
//!
//! 解码器分开统计帧格式字节（头部、分块框架、trailer）和消息体字节，
//! 供连接做读窗口记账：帧格式字节在消息完成时自动向上游返还，
//! 消息体字节只凭用户的窗口增量返还。

use std::cmp;
use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};
use http::StatusCode;

use crate::body::DecodedLength;
use crate::error::Parse;
use crate::headers;
use crate::message::Header;

/// 一个消息头里允许的最大头部条数。
const MAX_HEADERS: usize = 100;
/// 消息头的最大累积字节数，超过即 `TooLarge`。
const MAX_HEAD_SIZE: usize = 8192 + 4096 * 100;
/// trailer 区的最大累积字节数。
const MAX_TRAILER_SIZE: usize = 16 * 1024;

/// 解码器产出的事件，按产生顺序交付。
#[derive(Debug)]
pub(crate) enum Event {
    /// 一个完整的 1xx 信息性头部块（101 除外）
    Informational {
        status: StatusCode,
        headers: Vec<Header>,
    },
    /// 最终响应的主头部块
    Headers {
        status: StatusCode,
        headers: Vec<Header>,
    },
    /// 一段消息体字节
    Body(Bytes),
    /// 分块消息体之后的 trailer 头部
    Trailers(Vec<Header>),
    /// 消息结束
    Complete,
}

enum State {
    Head,
    Body(BodyDecode),
    Done,
}

enum BodyDecode {
    Fixed { remaining: u64 },
    Chunked(Chunked),
    CloseDelimited,
}

/// 分块消息体的逐字节状态机。
#[derive(Debug)]
enum Chunked {
    Size { size: u64, seen_digit: bool },
    Ext { size: u64 },
    SizeLf { size: u64 },
    Data { remaining: u64 },
    DataCr,
    DataLf,
    Trailer { buf: BytesMut },
}

pub(crate) struct Decoder {
    state: State,
    is_head_request: bool,
    /// 本消息到目前为止消耗的帧格式（非消息体）字节数。
    framing: usize,
    events: VecDeque<Event>,
}

impl Decoder {
    pub(crate) fn new(is_head_request: bool) -> Decoder {
        Decoder {
            state: State::Head,
            is_head_request,
            framing: 0,
            events: VecDeque::new(),
        }
    }

    /// 从 `buf` 的队首消费字节，产出下一个事件。
    ///
    /// `Ok(None)` 表示需要更多数据。消息结束（`Complete` 事件之后）
    /// 不再消费任何字节，剩余的属于流水线上的下一个响应。
    pub(crate) fn decode(&mut self, buf: &mut BytesMut) -> crate::Result<Option<Event>> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(Some(event));
            }
            match self.state {
                State::Head => {
                    if !self.parse_head(buf)? {
                        return Ok(None);
                    }
                }
                State::Body(_) => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let Decoder {
                        ref mut state,
                        ref mut framing,
                        ref mut events,
                        ..
                    } = *self;
                    let finished = match *state {
                        State::Body(ref mut body) => decode_body(body, buf, events, framing)?,
                        _ => unreachable!(),
                    };
                    if finished {
                        *state = State::Done;
                        events.push_back(Event::Complete);
                    }
                }
                State::Done => return Ok(None),
            }
        }
    }

    /// 当前消息体是否按连接关闭分隔。
    /// 这样的流由连接在读方向关闭时宣告完成。
    pub(crate) fn is_close_delimited(&self) -> bool {
        matches!(self.state, State::Body(BodyDecode::CloseDelimited))
    }

    /// 取走帧格式字节计数（取走后清零）。
    pub(crate) fn take_framing(&mut self) -> usize {
        std::mem::take(&mut self.framing)
    }

    /// 尝试从累积缓冲里解析一个完整的消息头。
    ///
    /// 返回 `true` 表示解析出了一个头部块（事件已入队），
    /// `false` 表示数据还不完整。
    fn parse_head(&mut self, buf: &mut BytesMut) -> crate::Result<bool> {
        let (head_len, status, headers) = {
            let mut parsed = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut resp = httparse::Response::new(&mut parsed);
            match resp.parse(&buf[..]) {
                Ok(httparse::Status::Complete(len)) => {
                    let status = StatusCode::from_u16(resp.code.expect("complete parse has code"))
                        .map_err(|_| crate::Error::new_parse(Parse::StatusLine))?;
                    let headers: Vec<Header> = resp.headers[..]
                        .iter()
                        .map(|h| {
                            Header::new(
                                Bytes::copy_from_slice(h.name.as_bytes()),
                                Bytes::copy_from_slice(h.value),
                            )
                        })
                        .collect();
                    (len, status, headers)
                }
                Ok(httparse::Status::Partial) => {
                    if buf.len() > MAX_HEAD_SIZE {
                        return Err(crate::Error::new_parse(Parse::TooLarge));
                    }
                    return Ok(false);
                }
                Err(e) => {
                    debug!("response head parse error: {:?}", e);
                    return Err(crate::Error::new_parse(match e {
                        httparse::Error::Version => Parse::Version,
                        httparse::Error::HeaderName
                        | httparse::Error::HeaderValue
                        | httparse::Error::Token => Parse::Header,
                        httparse::Error::TooManyHeaders => Parse::TooLarge,
                        _ => Parse::StatusLine,
                    }));
                }
            }
        };

        // httparse tolerates bare LF line endings; this protocol does not.
        if !crlf_strict(&buf[..head_len]) {
            return Err(crate::Error::new_parse(Parse::StatusLine));
        }

        buf.advance(head_len);
        self.framing += head_len;
        debug!("incoming head parsed, status {}", status.as_u16());

        if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
            // A complete info response; the final response for this stream
            // is still to come.
            self.events.push_back(Event::Informational { status, headers });
            return Ok(true);
        }

        let length = self.incoming_length(status, &headers)?;
        trace!("incoming body is {}", length);

        self.events.push_back(Event::Headers { status, headers });

        match length {
            DecodedLength::ZERO => {
                self.events.push_back(Event::Complete);
                self.state = State::Done;
            }
            DecodedLength::CHUNKED => {
                self.state = State::Body(BodyDecode::Chunked(Chunked::Size {
                    size: 0,
                    seen_digit: false,
                }));
            }
            DecodedLength::CLOSE_DELIMITED => {
                self.state = State::Body(BodyDecode::CloseDelimited);
            }
            exact => {
                self.state = State::Body(BodyDecode::Fixed {
                    remaining: exact.danger_len(),
                });
            }
        }
        Ok(true)
    }

    /// 按规则顺序判定消息体成帧方式。
    fn incoming_length(
        &self,
        status: StatusCode,
        headers: &[Header],
    ) -> crate::Result<DecodedLength> {
        if self.is_head_request
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return Ok(DecodedLength::ZERO);
        }

        if headers::transfer_encoding_is_chunked(headers) {
            return Ok(DecodedLength::CHUNKED);
        }

        match headers::content_length_parse(headers) {
            Ok(Some(len)) => DecodedLength::checked_new(len).map_err(crate::Error::new_parse),
            Ok(None) => Ok(DecodedLength::CLOSE_DELIMITED),
            Err(()) => Err(crate::Error::new_parse(Parse::Header)),
        }
    }
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            State::Head => "Head",
            State::Body(BodyDecode::Fixed { .. }) => "Body(Fixed)",
            State::Body(BodyDecode::Chunked(_)) => "Body(Chunked)",
            State::Body(BodyDecode::CloseDelimited) => "Body(CloseDelimited)",
            State::Done => "Done",
        };
        f.debug_struct("Decoder")
            .field("state", &state)
            .field("framing", &self.framing)
            .finish()
    }
}

/// 推进消息体解码，返回消息是否结束。
fn decode_body(
    body: &mut BodyDecode,
    buf: &mut BytesMut,
    events: &mut VecDeque<Event>,
    framing: &mut usize,
) -> crate::Result<bool> {
    match *body {
        BodyDecode::Fixed { ref mut remaining } => {
            let n = cmp::min(*remaining, buf.len() as u64) as usize;
            let data = buf.split_to(n).freeze();
            *remaining -= n as u64;
            if !data.is_empty() {
                events.push_back(Event::Body(data));
            }
            Ok(*remaining == 0)
        }
        BodyDecode::CloseDelimited => {
            let data = buf.split_to(buf.len()).freeze();
            if !data.is_empty() {
                events.push_back(Event::Body(data));
            }
            // Completion only comes from the connection observing EOF.
            Ok(false)
        }
        BodyDecode::Chunked(ref mut chunked) => decode_chunked(chunked, buf, events, framing),
    }
}

/// 分块消息体的逐字节推进，返回消息是否结束。
fn decode_chunked(
    chunked: &mut Chunked,
    buf: &mut BytesMut,
    events: &mut VecDeque<Event>,
    framing: &mut usize,
) -> crate::Result<bool> {
    while !buf.is_empty() {
        match *chunked {
            Chunked::Size { size, seen_digit } => {
                let b = take_byte(buf, framing);
                match b {
                    b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                        let digit = hex_digit(b);
                        let size = size
                            .checked_mul(16)
                            .and_then(|s| s.checked_add(digit as u64))
                            .ok_or_else(|| {
                                debug!("chunk size is too big");
                                crate::Error::new_parse(Parse::ChunkSize)
                            })?;
                        *chunked = Chunked::Size {
                            size,
                            seen_digit: true,
                        };
                    }
                    b';' if seen_digit => {
                        *chunked = Chunked::Ext { size };
                    }
                    b'\r' if seen_digit => {
                        *chunked = Chunked::SizeLf { size };
                    }
                    _ => return Err(crate::Error::new_parse(Parse::ChunkSize)),
                }
            }
            Chunked::Ext { size } => {
                // Extensions are framing-validated and skipped; no caller
                // wants them structurally.
                let b = take_byte(buf, framing);
                match b {
                    b'\r' => *chunked = Chunked::SizeLf { size },
                    b'\n' => return Err(crate::Error::new_parse(Parse::ChunkSize)),
                    _ => {}
                }
            }
            Chunked::SizeLf { size } => {
                let b = take_byte(buf, framing);
                if b != b'\n' {
                    return Err(crate::Error::new_parse(Parse::ChunkSize));
                }
                if size == 0 {
                    *chunked = Chunked::Trailer {
                        buf: BytesMut::new(),
                    };
                } else {
                    *chunked = Chunked::Data { remaining: size };
                }
            }
            Chunked::Data { remaining } => {
                let n = cmp::min(remaining, buf.len() as u64) as usize;
                let data = buf.split_to(n).freeze();
                let remaining = remaining - n as u64;
                *chunked = if remaining == 0 {
                    Chunked::DataCr
                } else {
                    Chunked::Data { remaining }
                };
                if !data.is_empty() {
                    events.push_back(Event::Body(data));
                }
            }
            Chunked::DataCr => {
                let b = take_byte(buf, framing);
                if b != b'\r' {
                    return Err(crate::Error::new_parse(Parse::ChunkSize));
                }
                *chunked = Chunked::DataLf;
            }
            Chunked::DataLf => {
                let b = take_byte(buf, framing);
                if b != b'\n' {
                    return Err(crate::Error::new_parse(Parse::ChunkSize));
                }
                *chunked = Chunked::Size {
                    size: 0,
                    seen_digit: false,
                };
            }
            Chunked::Trailer { buf: ref mut tbuf } => {
                let b = take_byte(buf, framing);
                tbuf.extend_from_slice(&[b]);
                if tbuf.len() > MAX_TRAILER_SIZE {
                    return Err(crate::Error::new_parse(Parse::TooLarge));
                }

                // No trailers at all: the zero chunk is followed directly
                // by the final CRLF.
                if tbuf.len() == 2 && &tbuf[..] == b"\r\n" {
                    return Ok(true);
                }
                if tbuf.len() >= 4 && &tbuf[tbuf.len() - 4..] == b"\r\n\r\n" {
                    let trailers = parse_trailers(tbuf)?;
                    if !trailers.is_empty() {
                        events.push_back(Event::Trailers(trailers));
                    }
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

fn take_byte(buf: &mut BytesMut, framing: &mut usize) -> u8 {
    let b = buf[0];
    buf.advance(1);
    *framing += 1;
    b
}

fn hex_digit(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        b'A'..=b'F' => b - b'A' + 10,
        _ => unreachable!("checked by caller"),
    }
}

/// 校验一段头部字节里每个 LF 前面都有 CR。
fn crlf_strict(head: &[u8]) -> bool {
    for (i, &b) in head.iter().enumerate() {
        if b == b'\n' && (i == 0 || head[i - 1] != b'\r') {
            return false;
        }
    }
    true
}

fn parse_trailers(raw: &[u8]) -> crate::Result<Vec<Header>> {
    if !crlf_strict(raw) {
        return Err(crate::Error::new_parse(Parse::Trailer));
    }
    let mut parsed = [httparse::EMPTY_HEADER; MAX_HEADERS];
    match httparse::parse_headers(raw, &mut parsed) {
        Ok(httparse::Status::Complete((_, headers))) => Ok(headers
            .iter()
            .map(|h| {
                Header::new(
                    Bytes::copy_from_slice(h.name.as_bytes()),
                    Bytes::copy_from_slice(h.value),
                )
            })
            .collect()),
        Ok(httparse::Status::Partial) => Err(crate::Error::new_parse(Parse::Trailer)),
        Err(_) => Err(crate::Error::new_parse(Parse::Trailer)),
    }
}
