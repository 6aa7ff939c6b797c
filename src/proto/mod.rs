//! 线路协议实现的组织模块。
//!
//! 目前只有 HTTP/1.1 客户端一种角色，但协议相关的代码都集中在
//! 这一层之下，与管道边界和用户可见的词汇类型分开。

pub(crate) mod h1;
