//! 请求与响应的词汇类型模块
//!
//! 定义用户提交给连接的 [`Request`]、有序头部列表的 [`Header`] 条目，
//! 以及解码回调使用的 [`HeaderBlock`] 区分标记。
//!
//! 头部名和头部值都以原始字节（`Bytes`）保存：名字查找是大小写不敏感的，
//! 但发送时必须保留用户书写的原始形式（`Host` 不能变成 `host`），
//! 顺序和重复项也一并保留——所以这里既不用 `HeaderMap`
//! 也不用会做大小写规一化的 `HeaderName`。

use std::fmt;

use bytes::Bytes;
use http::Method;

use crate::body::BodySource;

/// 一个头部名值对，名值均为原始字节。
#[derive(Clone, PartialEq, Eq)]
pub struct Header {
    /// 头部名，按用户书写的原始大小写保存和发送。
    pub name: Bytes,
    /// 头部值的原始字节。
    pub value: Bytes,
}

impl Header {
    /// 使用给定的名字和值构造一个新的头部条目。
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Header {
        Header {
            name: name.into(),
            value: value.into(),
        }
    }

    /// 名字的大小写不敏感比较。
    pub fn name_is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name.as_bytes())
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}: {:?}",
            String::from_utf8_lossy(&self.name),
            String::from_utf8_lossy(&self.value)
        )
    }
}

/// 解码回调所处的头部块种类。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderBlock {
    /// 1xx 信息性响应的头部块（101 除外）
    Informational,
    /// 最终响应的主头部块
    Main,
    /// 分块消息体之后的 trailer 头部块
    Trailing,
}

/// 一次 HTTP/1.1 请求。
///
/// 提交给 [`make_request`](crate::Http1Connection::make_request) 之后即视为
/// 不可变。编码器按原样输出：不会注入 `Host`、`Content-Length` 或
/// `Transfer-Encoding`，这些由调用方负责。
pub struct Request {
    method: Method,
    target: Bytes,
    headers: Vec<Header>,
    body: Option<Box<dyn BodySource>>,
}

impl Request {
    /// 创建一个新的请求。
    pub fn new(method: Method, target: impl Into<Bytes>) -> Request {
        Request {
            method,
            target: target.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// `GET` 请求的便捷构造。
    pub fn get(target: impl Into<Bytes>) -> Request {
        Request::new(Method::GET, target)
    }

    /// 追加一个头部。重复的头部名允许且保留，按添加顺序发送。
    pub fn add_header(&mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) -> &mut Request {
        self.headers.push(Header::new(name, value));
        self
    }

    /// 设置消息体数据源。
    ///
    /// 消息体如何成帧由头部决定：声明了 `Content-Length` 则按定长发送，
    /// 声明了 `Transfer-Encoding: chunked` 则消息体来自分块队列
    /// （此时这里设置的数据源不会被使用）。
    pub fn set_body(&mut self, body: Box<dyn BodySource>) -> &mut Request {
        self.body = Some(body);
        self
    }

    /// 请求方法。
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// 请求目标（request-target）的原始字节。
    pub fn target(&self) -> &Bytes {
        &self.target
    }

    /// 头部列表，按添加顺序。
    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// 按名字（大小写不敏感）查找第一个匹配的头部值。
    pub fn header(&self, name: &str) -> Option<&Bytes> {
        self.headers
            .iter()
            .find(|h| h.name_is(name))
            .map(|h| &h.value)
    }

    pub(crate) fn take_body(&mut self) -> Option<Box<dyn BodySource>> {
        self.body.take()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("target", &String::from_utf8_lossy(&self.target))
            .field("headers", &self.headers.len())
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_keep_user_order_case_and_duplicates() {
        let mut req = Request::get("/");
        req.add_header("Host", "example.com");
        req.add_header("X-Amz-Meta", "one");
        req.add_header("X-Amz-Meta", "two");

        let names: Vec<&[u8]> = req.headers().iter().map(|h| &h.name[..]).collect();
        assert_eq!(names, [&b"Host"[..], &b"X-Amz-Meta"[..], &b"X-Amz-Meta"[..]]);
        assert_eq!(req.header("host").unwrap(), "example.com");
        assert_eq!(req.header("x-amz-meta").unwrap(), "one");
    }
}
