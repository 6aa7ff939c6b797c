//! 错误与结果类型模块
//!
//! 本模块定义了 crate 的核心错误类型 [`Error`]。协议解析错误、对端多余
//! 数据、连接关闭、协议切换、出站长度不匹配、用户回调错误、取消——
//! 一切沿流（stream）的 `on_complete` 回调向上冒泡的错误都统一封装在
//! `Error` 中。
//!
//! ## 设计理念
//!
//! - **不透明错误**：`Error` 使用 `Box<ErrorImpl>` 包装内部实现，栈上仅占
//!   一个指针宽度，同时隐藏内部分类结构。
//! - **错误链**：用户回调返回的错误会作为 `source()` 链上的 cause 保留。
//! - 内部分类（`Kind`、`Parse`、`User`）是 `pub(crate)` 可见性，对外只暴露
//!   `is_*` 查询方法。

use std::error::Error as StdError;
use std::fmt;

/// 本 crate 方法常用的 Result 类型别名。
pub type Result<T> = std::result::Result<T, Error>;

/// 错误原因的类型别名：类型擦除、可跨线程传递的底层错误。
type Cause = Box<dyn StdError + Send + Sync>;

/// 处理 HTTP/1.1 连接时可能发生的错误。
///
/// `Display` 只打印当前层级的错误描述；要查看完整原因链，
/// 请沿 `Error::source()` 遍历。具体的错误消息措辞是未指定的，
/// 不要依赖它。
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

/// 错误分类枚举。
///
/// 每个变体对应一类会出现在流完成回调中的错误场景。
/// 变体不携带数据，因此可以整体 `Copy`——连接关闭时需要用同一个
/// 分类为多条流各铸造一个错误。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    /// 对端发来的数据违反 HTTP/1.1 帧格式
    Parse(Parse),
    /// 在没有流等待响应时收到了多余的字节
    UnexpectedData,
    /// 连接已关闭（或正在关闭），请求无法发出/完成
    ConnectionClosed,
    /// 连接已切换协议（101），不再承载 HTTP 流
    SwitchedProtocols,
    /// 出站消息体的实际长度与声明长度不符
    OutgoingLengthIncorrect,
    /// 流在完成之前被取消
    Canceled,
    /// 用户代码引起的错误
    User(User),
}

/// 解析错误的子分类。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Parse {
    /// 无效的状态行
    StatusLine,
    /// 不支持的 HTTP 版本
    Version,
    /// 无效的头部行
    Header,
    /// 无效的分块大小行
    ChunkSize,
    /// 无效的分块 trailer
    Trailer,
    /// 消息头超出解析器允许的大小
    TooLarge,
    /// 在没有未决请求时收到了响应
    Unexpected,
}

/// 用户代码引起的错误的子分类。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum User {
    /// 某个流回调返回了错误
    Callback,
    /// 用户的消息体数据源（`BodySource`）读取失败
    Body,
    /// 对同一条流调用了两次 `activate`
    ActivatedTwice,
    /// 在终止分块之后继续写入分块
    WriteAfterTerminator,
    /// 在协议切换之前就有下游处理器写入数据
    DownstreamWrite,
}

impl Error {
    /// 如果这是一个违反 HTTP/1.1 帧格式的协议错误，返回 `true`。
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// 如果这是"没有流等待响应时收到多余字节"错误，返回 `true`。
    pub fn is_unexpected_data(&self) -> bool {
        matches!(self.inner.kind, Kind::UnexpectedData)
    }

    /// 如果流因连接关闭而失败，返回 `true`。
    pub fn is_connection_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::ConnectionClosed)
    }

    /// 如果流因连接切换协议（101）而失败，返回 `true`。
    pub fn is_switched_protocols(&self) -> bool {
        matches!(self.inner.kind, Kind::SwitchedProtocols)
    }

    /// 如果出站消息体长度与声明不符，返回 `true`。
    pub fn is_outgoing_length_incorrect(&self) -> bool {
        matches!(self.inner.kind, Kind::OutgoingLengthIncorrect)
    }

    /// 如果流在完成之前被取消，返回 `true`。
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// 如果此错误由用户代码引起，返回 `true`。
    pub fn is_user(&self) -> bool {
        matches!(self.inner.kind, Kind::User(_))
    }

    /// 如果错误来自用户的流回调，返回 `true`。
    /// 用户回调返回的原始错误通过 `source()` 暴露。
    pub fn is_callback(&self) -> bool {
        matches!(self.inner.kind, Kind::User(User::Callback))
    }

    /// 如果错误来自用户的消息体数据源，返回 `true`。
    pub fn is_body_source(&self) -> bool {
        matches!(self.inner.kind, Kind::User(User::Body))
    }

    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    /// 为已有的 `Error` 附加一个错误原因，builder 风格链式调用。
    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn kind(&self) -> Kind {
        self.inner.kind
    }

    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    pub(crate) fn new_unexpected_data() -> Error {
        Error::new(Kind::UnexpectedData)
    }

    pub(crate) fn new_closed() -> Error {
        Error::new(Kind::ConnectionClosed)
    }

    pub(crate) fn new_switched_protocols() -> Error {
        Error::new(Kind::SwitchedProtocols)
    }

    pub(crate) fn new_outgoing_length_incorrect() -> Error {
        Error::new(Kind::OutgoingLengthIncorrect)
    }

    pub(crate) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    pub(crate) fn new_user_callback<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::User(User::Callback)).with(cause)
    }

    pub(crate) fn new_user_body<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::User(User::Body)).with(cause)
    }

    pub(crate) fn new_user_activated_twice() -> Error {
        Error::new(Kind::User(User::ActivatedTwice))
    }

    pub(crate) fn new_user_write_after_terminator() -> Error {
        Error::new(Kind::User(User::WriteAfterTerminator))
    }

    pub(crate) fn new_user_downstream_write() -> Error {
        Error::new(Kind::User(User::DownstreamWrite))
    }

    /// 当前错误分类的人类可读描述，`Display` 实现的核心。
    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::StatusLine) => "invalid HTTP status-line parsed",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::ChunkSize) => "invalid chunk size line parsed",
            Kind::Parse(Parse::Trailer) => "invalid chunked trailer parsed",
            Kind::Parse(Parse::TooLarge) => "message head is too large",
            Kind::Parse(Parse::Unexpected) => "received a response with no request outstanding",
            Kind::UnexpectedData => "received unexpected data from connection",
            Kind::ConnectionClosed => "connection closed",
            Kind::SwitchedProtocols => "connection has switched protocols",
            Kind::OutgoingLengthIncorrect => {
                "outgoing body length does not match declared length"
            }
            Kind::Canceled => "operation was canceled",
            Kind::User(User::Callback) => "error returned from user's stream callback",
            Kind::User(User::Body) => "error from user's body source",
            Kind::User(User::ActivatedTwice) => "stream was activated twice",
            Kind::User(User::WriteAfterTerminator) => {
                "chunk written after termination chunk"
            }
            Kind::User(User::DownstreamWrite) => {
                "downstream write without a protocol switch"
            }
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("skein::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}
