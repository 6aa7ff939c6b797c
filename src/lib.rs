// 以下 lint 属性控制编译器的警告行为：
#![deny(missing_docs)]                  // 所有公共 API 必须有文档注释
#![deny(missing_debug_implementations)] // 所有公共类型必须实现 Debug trait
#![cfg_attr(test, deny(rust_2018_idioms))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # skein
//!
//! skein is the client-side HTTP/1.1 connection core for byte-oriented
//! channel pipelines: the state machine, encoder and decoder that drive a
//! single connection mounted as a handler inside a channel.
//!
//! It is deliberately **not** a general HTTP client. There is no connection
//! pooling, no TLS, no DNS, and no request-dispatch convenience layer — just
//! the wire protocol: request serialisation (including chunked
//! transfer-encoding with extensions), incremental response parsing,
//! pipelining, credit-based read windows, `Connection: close` semantics and
//! graceful protocol switchover after a `101` response.
//!
//! ## Model
//!
//! All protocol work happens on the single **I/O thread** that drives the
//! [`channel::Channel`]. User API calls may originate anywhere; the ones
//! that mutate connection state are marshalled onto the I/O thread as
//! channel tasks. Responses are delivered through per-stream callbacks, in
//! strict stream order.
//!
//! ## Example
//!
//! ```
//! use skein::channel::Channel;
//! use skein::{Http1Connection, Http1Options, Request, StreamCallbacks};
//!
//! let channel = Channel::new();
//! let conn = Http1Connection::bind(&channel, Http1Options::default());
//!
//! let mut request = Request::get("/");
//! request.add_header("Host", "example.com");
//!
//! let stream = conn.make_request(request, StreamCallbacks::default())?;
//! stream.activate()?;
//! channel.drain_tasks();
//!
//! assert_eq!(
//!     channel.take_written(),
//!     "GET / HTTP/1.1\r\nHost: example.com\r\n\r\n",
//! );
//! # Ok::<(), skein::Error>(())
//! ```

#[macro_use]
mod trace;

pub mod body;
pub mod channel;

mod error;
mod headers;
mod message;
mod proto;

pub use crate::error::{Error, Result};
pub use crate::message::{Header, HeaderBlock, Request};
pub use crate::proto::h1::chunks::{Chunk, ChunkExtension};
pub use crate::proto::h1::conn::{Http1Connection, Http1Options};
pub use crate::proto::h1::stream::{CallbackResult, StreamCallbacks, StreamHandle};
