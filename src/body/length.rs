//! 响应消息体长度的紧凑表示
//!
//! `DecodedLength` 用一个 `u64` 加哨兵值统一表示响应消息体的三种成帧方式：
//!
//! - 精确已知：由 `Content-Length` 给定
//! - 分块传输编码：`Transfer-Encoding: chunked`
//! - 连接关闭分隔：既没有 Content-Length 也没有 chunked 时的回退
//!
//! 仅占 8 字节就能表示所有状态，避免了枚举带来的额外内存开销。

use std::fmt;

/// 解码后的响应消息体长度。
///
/// 内部值含义：
/// - `0..=(u64::MAX - 2)`：精确的字节长度
/// - `u64::MAX - 1`：分块传输编码（`CHUNKED`）
/// - `u64::MAX`：连接关闭分隔（`CLOSE_DELIMITED`）
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct DecodedLength(u64);

/// Content-Length 允许的最大值。
/// `u64::MAX` 和 `u64::MAX - 1` 被用作哨兵值。
const MAX_LEN: u64 = u64::MAX - 2;

impl DecodedLength {
    /// 消息体由连接关闭来分隔。
    pub(crate) const CLOSE_DELIMITED: DecodedLength = DecodedLength(u64::MAX);
    /// 消息体使用分块传输编码。
    pub(crate) const CHUNKED: DecodedLength = DecodedLength(u64::MAX - 1);
    /// 零长度消息体。
    pub(crate) const ZERO: DecodedLength = DecodedLength(0);

    /// 检查 `u64` 值是否在 Content-Length 允许的范围内。
    pub(crate) fn checked_new(len: u64) -> Result<Self, crate::error::Parse> {
        if len <= MAX_LEN {
            Ok(DecodedLength(len))
        } else {
            warn!("content-length bigger than maximum: {} > {}", len, MAX_LEN);
            Err(crate::error::Parse::Header)
        }
    }

    /// 将内部值直接作为 content-length 返回。
    ///
    /// 仅应在已确认不是 `CLOSE_DELIMITED` 或 `CHUNKED` 后调用。
    pub(crate) fn danger_len(self) -> u64 {
        debug_assert!(self.0 < Self::CHUNKED.0);
        self.0
    }
}

impl fmt::Debug for DecodedLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            DecodedLength::CLOSE_DELIMITED => f.write_str("CLOSE_DELIMITED"),
            DecodedLength::CHUNKED => f.write_str("CHUNKED"),
            DecodedLength(n) => f.debug_tuple("DecodedLength").field(&n).finish(),
        }
    }
}

impl fmt::Display for DecodedLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            DecodedLength::CLOSE_DELIMITED => f.write_str("close-delimited"),
            DecodedLength::CHUNKED => f.write_str("chunked encoding"),
            DecodedLength::ZERO => f.write_str("empty"),
            DecodedLength(n) => write!(f, "content-length ({} bytes)", n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_rejected_as_lengths() {
        assert!(DecodedLength::checked_new(MAX_LEN).is_ok());
        assert!(DecodedLength::checked_new(u64::MAX - 1).is_err());
        assert!(DecodedLength::checked_new(u64::MAX).is_err());
    }

    #[test]
    fn display_modes() {
        assert_eq!(DecodedLength::ZERO.to_string(), "empty");
        assert_eq!(DecodedLength::CHUNKED.to_string(), "chunked encoding");
        assert_eq!(
            DecodedLength::checked_new(9).unwrap().to_string(),
            "content-length (9 bytes)"
        );
    }
}
