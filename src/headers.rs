//! 帧格式关键头部的解析工具模块
//!
//! 本模块只关心决定消息边界的少数头部——`Connection`、`Content-Length`、
//! `Transfer-Encoding`。语义层面的头部校验不属于本 crate 的职责。
//! 这里的函数全部针对有序头部列表（`&[Header]`）工作，
//! 因为请求的字节镜像必须保持用户添加头部的顺序和原始大小写。

use crate::message::Header;

/// 检查 `Connection` 头部值是否包含 `close` 选项。
///
/// `Connection` 的值可以是逗号分隔的多个选项，逐一做
/// ASCII 大小写不敏感比较。
pub(crate) fn connection_close(value: &[u8]) -> bool {
    connection_has(value, "close")
}

fn connection_has(value: &[u8], needle: &str) -> bool {
    if let Ok(s) = std::str::from_utf8(value) {
        for val in s.split(',') {
            if val.trim().eq_ignore_ascii_case(needle) {
                return true;
            }
        }
    }
    false
}

/// 检查头部列表中是否有声明 `close` 的 `Connection` 头部。
pub(crate) fn has_connection_close(headers: &[Header]) -> bool {
    headers
        .iter()
        .filter(|h| h.name_is("connection"))
        .any(|h| connection_close(&h.value))
}

/// 从头部列表中解析 `Content-Length` 的值。
///
/// If multiple Content-Length headers were sent, everything can still
/// be alright if they all contain the same value, and all parse
/// correctly. If not, then it's an error.
///
/// 返回：
/// - `Ok(Some(n))`：存在且一致的 Content-Length
/// - `Ok(None)`：没有 Content-Length 头部
/// - `Err(())`：值无法解析或多个值不一致
pub(crate) fn content_length_parse(headers: &[Header]) -> std::result::Result<Option<u64>, ()> {
    let mut content_length: Option<u64> = None;
    for h in headers.iter().filter(|h| h.name_is("content-length")) {
        let line = std::str::from_utf8(&h.value).map_err(|_| ())?;
        for v in line.split(',') {
            match from_digits(v.trim().as_bytes()) {
                Some(n) => {
                    if content_length.is_none() {
                        content_length = Some(n);
                    } else if content_length != Some(n) {
                        return Err(());
                    }
                }
                None => return Err(()),
            }
        }
    }
    Ok(content_length)
}

/// 检查头部列表是否声明了 chunked 传输编码。
///
/// 按规范，`chunked` 必须是最后一个编码；只检查最后一个
/// `Transfer-Encoding` 头部值中最右侧的 token。
pub(crate) fn transfer_encoding_is_chunked(headers: &[Header]) -> bool {
    headers
        .iter()
        .filter(|h| h.name_is("transfer-encoding"))
        .last()
        .map_or(false, |h| is_chunked(&h.value))
}

/// `chunked` 必须始终是最后一个编码。
pub(crate) fn is_chunked(value: &[u8]) -> bool {
    // chunked must always be the last encoding, according to spec
    if let Ok(s) = std::str::from_utf8(value) {
        if let Some(encoding) = s.rsplit(',').next() {
            return encoding.trim().eq_ignore_ascii_case("chunked");
        }
    }
    false
}

/// 从字节切片中安全地解析无符号 64 位整数。
///
/// 不使用 `str::parse::<u64>()`，因为标准库实现允许前导符号，
/// 而 HTTP 的数字字段不允许；此外输入也未必是有效的 UTF-8。
pub(crate) fn from_digits(bytes: &[u8]) -> Option<u64> {
    // cannot use FromStr for u64, since it allows a signed prefix
    let mut result = 0u64;
    const RADIX: u64 = 10;

    if bytes.is_empty() {
        return None;
    }

    for &b in bytes {
        match b {
            b'0'..=b'9' => {
                result = result.checked_mul(RADIX)?;
                result = result.checked_add((b - b'0') as u64)?;
            }
            _ => {
                // not a DIGIT, get outta here!
                return None;
            }
        }
    }

    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Header;

    #[test]
    fn connection_close_tokens() {
        assert!(connection_close(b"close"));
        assert!(connection_close(b"Close"));
        assert!(connection_close(b"keep-alive, close"));
        assert!(!connection_close(b"keep-alive"));
        assert!(!connection_close(b"closed"));
    }

    #[test]
    fn close_header_is_found_case_insensitively() {
        let headers = vec![
            Header::new("Host", "example.com"),
            Header::new("Connection", "Close"),
        ];
        assert!(has_connection_close(&headers));
        assert!(!has_connection_close(&headers[..1]));
    }

    #[test]
    fn content_length_multiple_values() {
        let headers = vec![
            Header::new("Content-Length", "10"),
            Header::new("content-length", "10"),
        ];
        assert_eq!(content_length_parse(&headers), Ok(Some(10)));

        let headers = vec![
            Header::new("Content-Length", "10"),
            Header::new("Content-Length", "11"),
        ];
        assert!(content_length_parse(&headers).is_err());

        let headers = vec![Header::new("Content-Length", "ten")];
        assert!(content_length_parse(&headers).is_err());

        assert_eq!(content_length_parse(&[]), Ok(None));
    }

    #[test]
    fn chunked_must_be_last() {
        let headers = vec![Header::new("Transfer-Encoding", "gzip, chunked")];
        assert!(transfer_encoding_is_chunked(&headers));

        let headers = vec![Header::new("Transfer-Encoding", "chunked, gzip")];
        assert!(!transfer_encoding_is_chunked(&headers));

        let headers = vec![Header::new("transfer-encoding", "CHUNKED")];
        assert!(transfer_encoding_is_chunked(&headers));

        assert!(!transfer_encoding_is_chunked(&[]));
    }

    #[test]
    fn digits_reject_signs() {
        assert_eq!(from_digits(b"42"), Some(42));
        assert_eq!(from_digits(b"+42"), None);
        assert_eq!(from_digits(b""), None);
        assert_eq!(from_digits(b"99999999999999999999999"), None);
    }
}
