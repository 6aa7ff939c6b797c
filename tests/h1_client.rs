//! 客户端连接核心的端到端测试。
//!
//! 全部通过单线程管道驱动：投递任务、推入站字节、检查出站字节镜像
//! 和各条流的回调观测结果。

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::Method;

use skein::body::{BodySource, BytesBody};
use skein::channel::{Channel, Direction};
use skein::{
    Chunk, Header, HeaderBlock, Http1Connection, Http1Options, Request, StreamCallbacks,
    StreamHandle,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Tester {
    channel: Channel,
    conn: Arc<Http1Connection>,
}

impl Tester {
    /// 小窗口便于观察窗口增量；手动窗口管理让消息体字节的
    /// 返还完全由测试控制。
    fn new() -> Tester {
        init_logging();
        let channel = Channel::new();
        let conn = Http1Connection::bind(
            &channel,
            Http1Options {
                initial_read_window: 256,
                manual_window_management: true,
            },
        );
        Tester { channel, conn }
    }
}

#[derive(Default)]
struct Observed {
    info_blocks: Vec<(u16, Vec<(String, String)>)>,
    status: Option<u16>,
    headers: Vec<(String, String)>,
    trailers: Vec<(String, String)>,
    body: Vec<u8>,
    n_headers: usize,
    n_block_done: usize,
    n_body: usize,
    n_complete: usize,
    complete: bool,
    error: Option<skein::Error>,
    connection_open_at_completion: Option<bool>,
}

fn header_strings(headers: &[Header]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            (
                String::from_utf8_lossy(&h.name).into_owned(),
                String::from_utf8_lossy(&h.value).into_owned(),
            )
        })
        .collect()
}

struct StreamTester {
    stream: StreamHandle,
    observed: Arc<Mutex<Observed>>,
}

impl StreamTester {
    fn with(&self, f: impl FnOnce(&Observed)) {
        f(&self.observed.lock().unwrap());
    }

    fn assert_success(&self, status: u16) {
        self.with(|o| {
            assert!(o.complete, "stream has not completed");
            assert!(o.error.is_none(), "stream failed: {:?}", o.error);
            assert_eq!(o.status, Some(status));
            assert_eq!(o.n_complete, 1);
        });
    }
}

fn recording_callbacks(
    conn: &Arc<Http1Connection>,
    observed: &Arc<Mutex<Observed>>,
) -> StreamCallbacks {
    let mut callbacks = StreamCallbacks::default();

    let o = observed.clone();
    callbacks.on_headers = Some(Box::new(move |block, status, headers| {
        let mut o = o.lock().unwrap();
        o.n_headers += 1;
        match block {
            HeaderBlock::Informational => o
                .info_blocks
                .push((status.as_u16(), header_strings(headers))),
            HeaderBlock::Main => {
                o.status = Some(status.as_u16());
                o.headers = header_strings(headers);
            }
            HeaderBlock::Trailing => o.trailers = header_strings(headers),
        }
        Ok(())
    }));

    let o = observed.clone();
    callbacks.on_header_block_done = Some(Box::new(move |_block, _status| {
        o.lock().unwrap().n_block_done += 1;
        Ok(())
    }));

    let o = observed.clone();
    callbacks.on_body = Some(Box::new(move |data| {
        let mut o = o.lock().unwrap();
        o.n_body += 1;
        o.body.extend_from_slice(data);
        Ok(())
    }));

    let o = observed.clone();
    let conn = Arc::downgrade(conn);
    callbacks.on_complete = Some(Box::new(move |result| {
        let mut o = o.lock().unwrap();
        o.n_complete += 1;
        o.complete = true;
        o.error = result.err();
        o.connection_open_at_completion = conn.upgrade().map(|c| c.is_open());
    }));

    callbacks
}

/// 创建流、注册记录回调并激活。
fn spawn_stream(tester: &Tester, request: Request) -> StreamTester {
    let observed = Arc::new(Mutex::new(Observed::default()));
    let callbacks = recording_callbacks(&tester.conn, &observed);
    let stream = tester.conn.make_request(request, callbacks).unwrap();
    stream.activate().unwrap();
    StreamTester { stream, observed }
}

fn default_get() -> Request {
    Request::get("/")
}

fn chunked_put() -> Request {
    let mut request = Request::new(Method::PUT, "/plan.txt");
    request.add_header("Transfer-Encoding", "chunked");
    request
}

fn data_chunk(payload: &'static str) -> Chunk {
    Chunk::new(Box::new(BytesBody::new(payload)), payload.len() as u64)
}

/// 一个慢速数据源：前几个节拍不产出字节，之后每节拍最多产出几个字节。
struct SlowBody {
    state: Arc<Mutex<SlowBodyState>>,
}

struct SlowBodyState {
    data: Bytes,
    delay_ticks: usize,
    bytes_per_tick: usize,
    eos: bool,
}

impl SlowBody {
    fn new(data: &'static str, delay_ticks: usize, bytes_per_tick: usize) -> SlowBody {
        SlowBody {
            state: Arc::new(Mutex::new(SlowBodyState {
                data: Bytes::from_static(data.as_bytes()),
                delay_ticks,
                bytes_per_tick,
                eos: false,
            })),
        }
    }

    fn state(&self) -> Arc<Mutex<SlowBodyState>> {
        self.state.clone()
    }
}

impl BodySource for SlowBody {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.delay_ticks > 0 {
            state.delay_ticks -= 1;
            return Ok(0);
        }
        let n = state.data.len().min(dst.len()).min(state.bytes_per_tick);
        dst[..n].copy_from_slice(&state.data[..n]);
        state.data = state.data.slice(n..);
        if state.data.is_empty() {
            state.eos = true;
        }
        Ok(n)
    }

    fn is_end_of_stream(&self) -> bool {
        self.state.lock().unwrap().eos
    }
}

// ===== 请求发送 =====

#[test]
fn sanity_check() {
    let _tester = Tester::new();
}

#[test]
fn request_send_1liner() {
    let tester = Tester::new();
    let _stream = spawn_stream(&tester, default_get());
    tester.channel.drain_tasks();

    assert_eq!(tester.channel.take_written(), "GET / HTTP/1.1\r\n\r\n");
}

#[test]
fn request_send_headers() {
    let tester = Tester::new();
    let mut request = default_get();
    request.add_header("Host", "example.com");
    request.add_header("Accept", "*/*");
    let _stream = spawn_stream(&tester, request);
    tester.channel.drain_tasks();

    assert_eq!(
        tester.channel.take_written(),
        "GET / HTTP/1.1\r\n\
         Host: example.com\r\n\
         Accept: */*\r\n\
         \r\n"
    );
}

#[test]
fn request_send_body() {
    let tester = Tester::new();
    let mut request = Request::new(Method::PUT, "/plan.txt");
    request.add_header("Content-Length", "16");
    request.set_body(Box::new(BytesBody::new("write more tests")));
    let _stream = spawn_stream(&tester, request);
    tester.channel.drain_tasks();

    assert_eq!(
        tester.channel.take_written(),
        "PUT /plan.txt HTTP/1.1\r\n\
         Content-Length: 16\r\n\
         \r\n\
         write more tests"
    );
}

#[test]
fn request_send_body_transfer_encoding_chunked() {
    let tester = Tester::new();
    let observed = Arc::new(Mutex::new(Observed::default()));
    let callbacks = recording_callbacks(&tester.conn, &observed);
    let stream = tester.conn.make_request(chunked_put(), callbacks).unwrap();

    stream.write_chunk(data_chunk("write more tests"));
    stream.write_chunk(Chunk::termination());
    stream.activate().unwrap();
    tester.channel.drain_tasks();

    assert_eq!(
        tester.channel.take_written(),
        "PUT /plan.txt HTTP/1.1\r\n\
         Transfer-Encoding: chunked\r\n\
         \r\n\
         10\r\n\
         write more tests\r\n\
         0\r\n\
         \r\n"
    );
}

#[test]
fn request_send_body_chunked_extensions() {
    let tester = Tester::new();
    let observed = Arc::new(Mutex::new(Observed::default()));
    let callbacks = recording_callbacks(&tester.conn, &observed);
    let stream = tester.conn.make_request(chunked_put(), callbacks).unwrap();

    stream.write_chunk(data_chunk("write more tests").add_extension("foo", "bar"));
    stream.write_chunk(
        data_chunk("write more tests")
            .add_extension("foo", "bar")
            .add_extension("baz", "cux"),
    );
    stream.write_chunk(Chunk::termination());
    stream.activate().unwrap();
    tester.channel.drain_tasks();

    assert_eq!(
        tester.channel.take_written(),
        "PUT /plan.txt HTTP/1.1\r\n\
         Transfer-Encoding: chunked\r\n\
         \r\n\
         10;foo=bar\r\n\
         write more tests\r\n\
         10;foo=bar;baz=cux\r\n\
         write more tests\r\n\
         0\r\n\
         \r\n"
    );
}

#[test]
fn request_transfer_encoding_waits_for_data() {
    let tester = Tester::new();
    let stream_tester = spawn_stream(&tester, chunked_put());
    // 先激活，数据后到：编码器写完头部后挂起。
    tester.channel.drain_tasks();

    for payload in ["write more tests", "write more tests"] {
        stream_tester.stream.write_chunk(data_chunk(payload));
        tester.channel.drain_tasks();
    }
    stream_tester.stream.write_chunk(Chunk::termination());
    tester.channel.drain_tasks();

    assert_eq!(
        tester.channel.take_written(),
        "PUT /plan.txt HTTP/1.1\r\n\
         Transfer-Encoding: chunked\r\n\
         \r\n\
         10\r\n\
         write more tests\r\n\
         10\r\n\
         write more tests\r\n\
         0\r\n\
         \r\n"
    );
}

#[test]
fn request_content_length_0_ok() {
    let tester = Tester::new();
    let mut request = Request::new(Method::PUT, "/plan.txt");
    request.add_header("Content-Length", "0");
    let stream_tester = spawn_stream(&tester, request);
    tester.channel.drain_tasks();

    assert_eq!(
        tester.channel.take_written(),
        "PUT /plan.txt HTTP/1.1\r\n\
         Content-Length: 0\r\n\
         \r\n"
    );

    tester.channel.push_read("HTTP/1.1 204 No Content\r\n\r\n");
    tester.channel.drain_tasks();
    stream_tester.assert_success(204);
}

#[test]
fn request_transfer_encoding_terminator_only() {
    let tester = Tester::new();
    let observed = Arc::new(Mutex::new(Observed::default()));
    let callbacks = recording_callbacks(&tester.conn, &observed);
    let stream = tester.conn.make_request(chunked_put(), callbacks).unwrap();
    stream.write_chunk(Chunk::termination());
    stream.activate().unwrap();
    tester.channel.drain_tasks();

    assert_eq!(
        tester.channel.take_written(),
        "PUT /plan.txt HTTP/1.1\r\n\
         Transfer-Encoding: chunked\r\n\
         \r\n\
         0\r\n\
         \r\n"
    );
}

#[test]
fn request_transfer_encoding_terminator_extensions() {
    let tester = Tester::new();
    let observed = Arc::new(Mutex::new(Observed::default()));
    let callbacks = recording_callbacks(&tester.conn, &observed);
    let stream = tester.conn.make_request(chunked_put(), callbacks).unwrap();
    stream.write_chunk(Chunk::termination().add_extension("foo", "bar"));
    stream.activate().unwrap();
    tester.channel.drain_tasks();

    assert_eq!(
        tester.channel.take_written(),
        "PUT /plan.txt HTTP/1.1\r\n\
         Transfer-Encoding: chunked\r\n\
         \r\n\
         0;foo=bar\r\n\
         \r\n"
    );
}

#[test]
fn request_send_large_body() {
    let tester = Tester::new();
    // 明显大于单条出站消息的容量，必须切成多条消息。
    let body: String = "write more tests;"
        .chars()
        .cycle()
        .take(40 * 1024)
        .collect();
    let mut request = Request::new(Method::PUT, "/large.txt");
    request.add_header("Content-Length", body.len().to_string().into_bytes());
    request.set_body(Box::new(BytesBody::new(body.clone().into_bytes())));
    let _stream = spawn_stream(&tester, request);
    tester.channel.drain_tasks();

    let mut expected = format!(
        "PUT /large.txt HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    expected.push_str(&body);
    assert_eq!(tester.channel.take_written(), expected.as_bytes());
}

#[test]
fn request_send_multiple() {
    let tester = Tester::new();
    let _first = spawn_stream(&tester, default_get());
    let _second = spawn_stream(&tester, default_get());
    tester.channel.drain_tasks();

    assert_eq!(
        tester.channel.take_written(),
        "GET / HTTP/1.1\r\n\r\nGET / HTTP/1.1\r\n\r\n"
    );
}

#[test]
fn activate_twice_is_a_usage_error() {
    let tester = Tester::new();
    let stream_tester = spawn_stream(&tester, default_get());
    let err = stream_tester.stream.activate().unwrap_err();
    assert!(err.is_user());
}

// ===== 响应接收 =====

#[test]
fn response_get_1liner() {
    let tester = Tester::new();
    let stream_tester = spawn_stream(&tester, default_get());
    tester.channel.drain_tasks();

    tester.channel.push_read("HTTP/1.1 204 No Content\r\n\r\n");
    tester.channel.drain_tasks();

    stream_tester.assert_success(204);
    stream_tester.with(|o| {
        assert!(o.headers.is_empty());
        assert!(o.body.is_empty());
    });
}

#[test]
fn response_get_headers() {
    let tester = Tester::new();
    let stream_tester = spawn_stream(&tester, default_get());
    tester.channel.drain_tasks();

    tester.channel.push_read(
        "HTTP/1.1 308 Permanent Redirect\r\n\
         Date: Fri, 01 Mar 2019 17:18:55 GMT\r\n\
         Location: /index.html\r\n\
         Content-Length: 0\r\n\
         \r\n",
    );
    tester.channel.drain_tasks();

    stream_tester.assert_success(308);
    stream_tester.with(|o| {
        assert_eq!(
            o.headers,
            [
                ("Date".into(), "Fri, 01 Mar 2019 17:18:55 GMT".into()),
                ("Location".into(), "/index.html".into()),
                ("Content-Length".into(), "0".into()),
            ]
        );
        assert!(o.body.is_empty());
    });
}

#[test]
fn response_get_body() {
    let tester = Tester::new();
    let stream_tester = spawn_stream(&tester, default_get());
    tester.channel.drain_tasks();

    tester.channel.push_read(
        "HTTP/1.1 200 OK\r\n\
         Content-Length: 9\r\n\
         \r\n\
         Call Momo",
    );
    tester.channel.drain_tasks();

    stream_tester.assert_success(200);
    stream_tester.with(|o| {
        assert_eq!(o.headers, [("Content-Length".into(), "9".into())]);
        assert_eq!(o.body, b"Call Momo");
    });
}

#[test]
fn response_get_chunked_with_trailers() {
    let tester = Tester::new();
    let stream_tester = spawn_stream(&tester, default_get());
    tester.channel.drain_tasks();

    tester.channel.push_read(
        "HTTP/1.1 200 OK\r\n\
         Transfer-Encoding: chunked\r\n\
         \r\n\
         3\r\ntwo\r\n\
         6\r\nchunks\r\n\
         0\r\n\
         Checksum: abc123\r\n\
         \r\n",
    );
    tester.channel.drain_tasks();

    stream_tester.assert_success(200);
    stream_tester.with(|o| {
        assert_eq!(o.body, b"twochunks");
        assert_eq!(o.trailers, [("Checksum".into(), "abc123".into())]);
    });
}

#[test]
fn response_no_body_for_head_request() {
    let tester = Tester::new();
    let stream_tester = spawn_stream(&tester, Request::new(Method::HEAD, "/"));
    tester.channel.drain_tasks();

    tester
        .channel
        .push_read("HTTP/1.1 200 OK\r\nContent-Length: 9\r\n\r\n");
    tester.channel.drain_tasks();

    stream_tester.assert_success(200);
    stream_tester.with(|o| assert!(o.body.is_empty()));
}

#[test]
fn response_no_body_from_304() {
    let tester = Tester::new();
    let stream_tester = spawn_stream(&tester, default_get());
    tester.channel.drain_tasks();

    tester
        .channel
        .push_read("HTTP/1.1 304 Not Modified\r\nContent-Length: 9\r\n\r\n");
    tester.channel.drain_tasks();

    stream_tester.assert_success(304);
    stream_tester.with(|o| assert!(o.body.is_empty()));
}

#[test]
fn response_get_100() {
    let tester = Tester::new();
    let stream_tester = spawn_stream(&tester, default_get());
    tester.channel.drain_tasks();

    tester.channel.push_read(
        "HTTP/1.1 100 Continue\r\n\
         Date: Fri, 01 Mar 2019 17:18:55 GMT\r\n\
         \r\n\
         HTTP/1.1 200 OK\r\n\
         Content-Length: 9\r\n\
         \r\n\
         Call Momo",
    );
    tester.channel.drain_tasks();

    stream_tester.assert_success(200);
    stream_tester.with(|o| {
        assert_eq!(o.info_blocks.len(), 1);
        let (info_status, info_headers) = &o.info_blocks[0];
        assert_eq!(*info_status, 100);
        assert_eq!(
            info_headers[..],
            [("Date".into(), "Fri, 01 Mar 2019 17:18:55 GMT".into())]
        );
        assert_eq!(o.headers, [("Content-Length".into(), "9".into())]);
        assert_eq!(o.body, b"Call Momo");
    });
}

#[test]
fn response_get_1_from_multiple_io_messages() {
    let tester = Tester::new();
    let stream_tester = spawn_stream(&tester, default_get());
    tester.channel.drain_tasks();

    let response = b"HTTP/1.1 200 OK\r\nContent-Length: 9\r\n\r\nCall Momo";
    for i in 0..response.len() {
        tester.channel.push_read(&response[i..i + 1]);
    }
    tester.channel.drain_tasks();

    stream_tester.assert_success(200);
    stream_tester.with(|o| assert_eq!(o.body, b"Call Momo"));
}

#[test]
fn response_get_multiple_from_1_io_message() {
    let tester = Tester::new();
    let streams: Vec<StreamTester> = (0..3).map(|_| spawn_stream(&tester, default_get())).collect();
    tester.channel.drain_tasks();

    tester.channel.push_read(
        "HTTP/1.1 204 No Content\r\n\r\n\
         HTTP/1.1 204 No Content\r\n\r\n\
         HTTP/1.1 204 No Content\r\n\r\n",
    );
    tester.channel.drain_tasks();

    for stream_tester in &streams {
        stream_tester.assert_success(204);
    }
}

#[test]
fn response_with_bad_data_shuts_down_connection() {
    let tester = Tester::new();
    let stream_tester = spawn_stream(&tester, default_get());
    tester.channel.drain_tasks();

    tester.channel.push_read("Mmmm garbage data\r\n\r\n");
    tester.channel.drain_tasks();

    stream_tester.with(|o| {
        assert!(o.complete);
        assert!(o.error.as_ref().unwrap().is_protocol());
    });
    assert!(tester.channel.is_shutdown_complete());
    assert!(tester.channel.take_shutdown_error().is_some());
}

#[test]
fn response_with_too_much_data_shuts_down_connection() {
    let tester = Tester::new();
    let stream_tester = spawn_stream(&tester, default_get());
    tester.channel.drain_tasks();

    tester.channel.push_read(
        "HTTP/1.1 204 No Content\r\n\r\n\
         HTTP/1.1 204 No Content\r\n\r\n",
    );
    tester.channel.drain_tasks();

    // 第一个响应正常完成。
    stream_tester.assert_success(204);

    // 多余的数据触发带错误码的关闭。
    assert!(tester.channel.is_shutdown_complete());
    let err = tester.channel.take_shutdown_error().unwrap();
    assert!(err.is_unexpected_data());
}

#[test]
fn response_without_request_shuts_down_connection() {
    let tester = Tester::new();
    tester.channel.push_read("HTTP/1.1 200 OK\r\n\r\n");
    tester.channel.drain_tasks();

    assert!(tester.channel.is_shutdown_complete());
    let err = tester.channel.take_shutdown_error().unwrap();
    assert!(err.is_protocol());
}

#[test]
fn response_arrives_before_request_done_sending_is_ok() {
    let tester = Tester::new();

    let slow = SlowBody::new("write more tests", 5, 1);
    let progress = slow.state();
    let mut request = Request::new(Method::PUT, "/plan.txt");
    request.add_header("Content-Length", "16");
    request.set_body(Box::new(slow));
    let stream_tester = spawn_stream(&tester, request);

    // 让头部先写出去。
    tester.channel.run_queued_tasks_once();
    tester.channel.run_queued_tasks_once();

    // 响应先到，请求体还在慢慢写。
    tester
        .channel
        .push_read("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");

    while !progress.lock().unwrap().data.is_empty() {
        // on_complete 必须等到出站数据全部写完才触发。
        stream_tester.with(|o| assert!(!o.complete));
        tester.channel.run_queued_tasks_once();
    }
    tester.channel.drain_tasks();

    assert_eq!(
        tester.channel.take_written(),
        "PUT /plan.txt HTTP/1.1\r\n\
         Content-Length: 16\r\n\
         \r\n\
         write more tests"
    );
    stream_tester.assert_success(200);
}

#[test]
fn response_arrives_before_chunked_request_done_sending_is_ok() {
    let tester = Tester::new();
    let stream_tester = spawn_stream(&tester, chunked_put());

    tester.channel.run_queued_tasks_once();
    tester.channel.run_queued_tasks_once();

    tester
        .channel
        .push_read("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
    tester.channel.run_queued_tasks_once();

    let slow = SlowBody::new("write more tests", 5, 1);
    let progress = slow.state();
    stream_tester
        .stream
        .write_chunk(Chunk::new(Box::new(slow), 16));
    stream_tester.stream.write_chunk(Chunk::termination());

    while !progress.lock().unwrap().data.is_empty() {
        stream_tester.with(|o| assert!(!o.complete));
        tester.channel.run_queued_tasks_once();
    }
    tester.channel.drain_tasks();

    assert_eq!(
        tester.channel.take_written(),
        "PUT /plan.txt HTTP/1.1\r\n\
         Transfer-Encoding: chunked\r\n\
         \r\n\
         10\r\n\
         write more tests\r\n\
         0\r\n\
         \r\n"
    );
    stream_tester.assert_success(200);
}

#[test]
fn response_close_delimited_completes_on_read_shutdown() {
    let tester = Tester::new();
    let stream_tester = spawn_stream(&tester, default_get());
    tester.channel.drain_tasks();

    // 既没有 Content-Length 也没有 Transfer-Encoding：按连接关闭分隔。
    tester
        .channel
        .push_read("HTTP/1.1 200 OK\r\n\r\nsome body bytes");
    tester.channel.drain_tasks();
    stream_tester.with(|o| assert!(!o.complete));

    tester.channel.shutdown(None);
    tester.channel.drain_tasks();

    stream_tester.assert_success(200);
    stream_tester.with(|o| assert_eq!(o.body, b"some body bytes"));
}

#[test]
fn immediate_shutdown_skips_close_delimited_completion() {
    let tester = Tester::new();
    let stream_tester = spawn_stream(&tester, default_get());
    tester.channel.drain_tasks();

    tester.channel.push_read("HTTP/1.1 200 OK\r\n\r\npartial");
    tester.channel.drain_tasks();

    // 急迫关闭不做可选收尾，流以取消告终。
    tester.channel.shutdown_immediately(None);
    stream_tester.with(|o| {
        assert!(o.complete);
        assert!(o.error.as_ref().unwrap().is_canceled());
    });
}

// ===== Connection: close =====

#[test]
fn response_close_header_ends_connection() {
    let tester = Tester::new();
    let stream_tester = spawn_stream(&tester, default_get());
    tester.channel.drain_tasks();

    tester.channel.push_read(
        "HTTP/1.1 200 OK\r\n\
         Connection: close\r\n\
         Content-Length: 0\r\n\
         \r\n",
    );
    tester.channel.drain_tasks();

    stream_tester.assert_success(200);
    // 完成回调触发时连接已不再开启。
    stream_tester.with(|o| assert_eq!(o.connection_open_at_completion, Some(false)));

    assert!(tester.channel.is_shutdown_complete());
    assert!(tester.channel.take_shutdown_error().is_none());
}

#[test]
fn request_close_header_ends_connection() {
    let tester = Tester::new();
    let mut request = default_get();
    request.add_header("Host", "example.com");
    request.add_header("Connection", "close");
    let stream_tester = spawn_stream(&tester, request);
    tester.channel.drain_tasks();

    assert_eq!(
        tester.channel.take_written(),
        "GET / HTTP/1.1\r\n\
         Host: example.com\r\n\
         Connection: close\r\n\
         \r\n"
    );

    // 请求一激活连接就不再开启，但要等响应到达才真正关闭。
    assert!(!tester.conn.is_open());
    assert!(!tester.channel.is_shutdown_complete());

    tester
        .channel
        .push_read("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
    tester.channel.drain_tasks();

    stream_tester.assert_success(200);
    stream_tester.with(|o| assert_eq!(o.connection_open_at_completion, Some(false)));
    assert!(tester.channel.is_shutdown_complete());
    assert!(tester.channel.take_shutdown_error().is_none());
}

#[test]
fn response_close_header_with_pipelining() {
    let tester = Tester::new();
    let streams: Vec<StreamTester> = (0..3).map(|_| spawn_stream(&tester, default_get())).collect();
    tester.channel.drain_tasks();

    // 第二个响应带 close；第三个响应永远不会来。
    tester.channel.push_read(
        "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n\
         HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
    );
    tester.channel.drain_tasks();

    streams[0].assert_success(200);
    streams[0].with(|o| assert_eq!(o.connection_open_at_completion, Some(true)));

    streams[1].assert_success(200);
    streams[1].with(|o| assert_eq!(o.connection_open_at_completion, Some(false)));

    streams[2].with(|o| {
        assert!(o.complete);
        assert!(o.error.as_ref().unwrap().is_connection_closed());
        assert_eq!(o.connection_open_at_completion, Some(false));
    });

    assert!(tester.channel.is_shutdown_complete());
}

#[test]
fn request_close_header_with_pipelining() {
    let tester = Tester::new();
    let mut streams = Vec::new();
    for i in 0..3 {
        let mut request = default_get();
        if i == 1 {
            request.add_header("Connection", "close");
        }
        streams.push(spawn_stream(&tester, request));
    }
    tester.channel.drain_tasks();

    // 只有前两个请求上线。
    assert_eq!(
        tester.channel.take_written(),
        "GET / HTTP/1.1\r\n\r\n\
         GET / HTTP/1.1\r\nConnection: close\r\n\r\n"
    );

    tester.channel.push_read(
        "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n\
         HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
    );
    tester.channel.drain_tasks();

    streams[0].assert_success(200);
    streams[1].assert_success(200);
    streams[2].with(|o| {
        assert!(o.complete);
        assert!(o.error.as_ref().unwrap().is_connection_closed());
    });
    assert!(tester.channel.is_shutdown_complete());
}

#[test]
fn request_close_header_with_chunked_encoding_and_pipelining() {
    let tester = Tester::new();
    let mut streams = Vec::new();
    for i in 0..3 {
        let mut request = chunked_put();
        if i == 1 {
            request.add_header("Connection", "close");
        }
        streams.push(spawn_stream(&tester, request));
    }
    for stream_tester in &streams {
        stream_tester.stream.write_chunk(data_chunk("write more tests"));
        stream_tester.stream.write_chunk(Chunk::termination());
    }
    tester.channel.drain_tasks();

    assert_eq!(
        tester.channel.take_written(),
        "PUT /plan.txt HTTP/1.1\r\n\
         Transfer-Encoding: chunked\r\n\
         \r\n\
         10\r\n\
         write more tests\r\n\
         0\r\n\
         \r\n\
         PUT /plan.txt HTTP/1.1\r\n\
         Transfer-Encoding: chunked\r\n\
         Connection: close\r\n\
         \r\n\
         10\r\n\
         write more tests\r\n\
         0\r\n\
         \r\n"
    );

    tester.channel.push_read(
        "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n\
         HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
    );
    tester.channel.drain_tasks();

    streams[0].assert_success(200);
    streams[1].assert_success(200);
    streams[2].with(|o| {
        assert!(o.complete);
        assert!(o.error.as_ref().unwrap().is_connection_closed());
    });
    assert!(tester.channel.is_shutdown_complete());
}

// ===== 读窗口 =====

#[test]
fn window_shrinks_if_user_says_so() {
    let tester = Tester::new();
    let stream_tester = spawn_stream(&tester, default_get());
    tester.channel.drain_tasks();

    let response = "HTTP/1.1 200 OK\r\nContent-Length: 9\r\n\r\nCall Momo";
    tester.channel.push_read(response);
    tester.channel.drain_tasks();
    stream_tester.assert_success(200);

    // 自动返还的只有帧格式字节；9 字节消息体扣在用户账上。
    let framing = response.len() - 9;
    assert_eq!(tester.channel.last_window_update(), Some(framing));
}

#[test]
fn window_manual_update() {
    let tester = Tester::new();
    let stream_tester = spawn_stream(&tester, default_get());
    tester.channel.drain_tasks();

    tester
        .channel
        .push_read("HTTP/1.1 200 OK\r\nContent-Length: 9\r\n\r\nCall Momo");
    tester.channel.drain_tasks();
    stream_tester.assert_success(200);

    stream_tester.stream.update_window(9);
    tester.channel.drain_tasks();
    assert_eq!(tester.channel.last_window_update(), Some(9));
}

#[test]
fn window_manual_update_off_thread() {
    let tester = Tester::new();
    let stream_tester = spawn_stream(&tester, default_get());
    tester.channel.drain_tasks();

    tester
        .channel
        .push_read("HTTP/1.1 200 OK\r\nContent-Length: 9\r\n\r\nCall Momo");
    tester.channel.drain_tasks();
    stream_tester.assert_success(200);

    let stream = stream_tester.stream;
    std::thread::spawn(move || stream.update_window(9))
        .join()
        .unwrap();
    tester.channel.drain_tasks();
    assert_eq!(tester.channel.last_window_update(), Some(9));
}

// ===== 出站长度错误 =====

fn content_length_mismatch(body: &'static str, wrong_length: &'static str) {
    let tester = Tester::new();
    let mut request = Request::new(Method::PUT, "/plan.txt");
    request.add_header("Content-Length", wrong_length);
    request.set_body(Box::new(BytesBody::new(body)));
    let stream_tester = spawn_stream(&tester, request);
    tester.channel.drain_tasks();

    stream_tester.with(|o| {
        assert!(o.complete);
        assert!(o.error.as_ref().unwrap().is_outgoing_length_incorrect());
    });
    assert!(tester.channel.is_shutdown_complete());
}

#[test]
fn request_content_length_too_small_is_error() {
    content_length_mismatch("I am very long", "1");
}

#[test]
fn request_content_length_too_large_is_error() {
    content_length_mismatch("I am very short", "999");
}

fn chunk_length_mismatch(body: &'static str, wrong_length: u64) {
    let tester = Tester::new();
    let observed = Arc::new(Mutex::new(Observed::default()));
    let callbacks = recording_callbacks(&tester.conn, &observed);
    let stream = tester.conn.make_request(chunked_put(), callbacks).unwrap();

    stream.write_chunk(Chunk::new(Box::new(BytesBody::new(body)), wrong_length));
    stream.write_chunk(Chunk::termination());
    stream.activate().unwrap();
    tester.channel.drain_tasks();

    let o = observed.lock().unwrap();
    assert!(o.complete);
    assert!(o.error.as_ref().unwrap().is_outgoing_length_incorrect());
}

#[test]
fn request_chunked_encoding_too_small_is_error() {
    chunk_length_mismatch("I am very long", 1);
}

#[test]
fn request_chunked_encoding_too_large_is_error() {
    chunk_length_mismatch("I am very short", 999);
}

// ===== 取消与关闭 =====

#[test]
fn request_chunked_encoding_cancelled_by_channel_shutdown() {
    let tester = Tester::new();
    let stream_tester = spawn_stream(&tester, chunked_put());
    // 队列为空：连接写完头部后挂起。
    tester.channel.drain_tasks();

    let cancelled = Arc::new(AtomicUsize::new(0));
    let saw = cancelled.clone();
    stream_tester.stream.write_chunk(
        data_chunk("write more tests").on_complete(move |result| {
            assert!(result.unwrap_err().is_canceled());
            saw.fetch_add(1, Ordering::SeqCst);
        }),
    );
    stream_tester.stream.write_chunk(Chunk::termination());

    // 请求完成之前管道被关闭。
    tester.channel.shutdown(None);
    tester.channel.drain_tasks();

    // 管道用 0（成功）关闭，但流没有成功完成，不能收到成功码。
    stream_tester.with(|o| {
        assert!(o.complete);
        assert!(o.error.as_ref().unwrap().is_canceled());
    });
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);
}

#[test]
fn request_cancelled_by_channel_shutdown() {
    let tester = Tester::new();
    let stream_tester = spawn_stream(&tester, default_get());
    tester.channel.drain_tasks();

    tester.channel.shutdown(None);
    tester.channel.drain_tasks();

    stream_tester.with(|o| {
        assert!(o.complete);
        assert!(o.error.as_ref().unwrap().is_canceled());
    });
}

#[test]
fn multiple_requests_cancelled_by_channel_shutdown() {
    let tester = Tester::new();
    let mut streams = Vec::new();
    for _ in 0..2 {
        streams.push(spawn_stream(&tester, default_get()));
    }
    tester.channel.drain_tasks();

    // 第三条流的激活任务还锁在队列里。
    streams.push(spawn_stream(&tester, default_get()));

    tester.channel.shutdown(None);
    tester.channel.drain_tasks();

    for stream_tester in &streams {
        stream_tester.with(|o| {
            assert!(o.complete);
            assert!(o.error.is_some());
        });
    }
}

#[test]
fn new_request_fails_if_channel_shut_down() {
    let tester = Tester::new();
    tester.channel.shutdown(None);
    tester.channel.drain_tasks();

    let err = tester
        .conn
        .make_request(default_get(), StreamCallbacks::default())
        .unwrap_err();
    assert!(err.is_connection_closed());
}

#[test]
fn close_from_off_thread_makes_not_open() {
    let tester = Tester::new();
    assert!(tester.conn.is_open());

    let conn = tester.conn.clone();
    std::thread::spawn(move || conn.close()).join().unwrap();

    // 关闭还没在 I/O 线程上传播，但 is_open 立即为 false。
    assert!(!tester.conn.is_open());
    tester.channel.drain_tasks();
    assert!(tester.channel.is_shutdown_complete());
}

#[test]
fn unactivated_stream_cleans_up() {
    let tester = Tester::new();
    assert!(tester.conn.is_open());

    let stream = tester
        .conn
        .make_request(default_get(), StreamCallbacks::default())
        .unwrap();
    // 故意不激活。
    drop(stream);
    tester.conn.close();
    tester.channel.drain_tasks();
    assert!(tester.channel.is_shutdown_complete());
}

// ===== 回调错误 =====

#[derive(Clone, Copy, PartialEq, Debug)]
enum ErrorAt {
    OutgoingBody,
    Headers,
    HeaderBlockDone,
    Body,
}

/// 在指定的回调处返回错误的数据源。
struct FailingBody {
    fail: bool,
    data: Bytes,
}

impl BodySource for FailingBody {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if self.fail {
            return Err(io::Error::new(io::ErrorKind::Other, "0xBEEFCAFE"));
        }
        let n = self.data.len().min(dst.len());
        dst[..n].copy_from_slice(&self.data[..n]);
        self.data = self.data.slice(n..);
        Ok(n)
    }

    fn is_end_of_stream(&self) -> bool {
        self.data.is_empty()
    }
}

fn error_from_callback(error_at: ErrorAt) {
    let tester = Tester::new();
    let observed = Arc::new(Mutex::new(Observed::default()));

    let mut request = Request::new(Method::POST, "/");
    request.add_header("Content-Length", "4");
    request.set_body(Box::new(FailingBody {
        fail: error_at == ErrorAt::OutgoingBody,
        data: Bytes::from_static(b"abcd"),
    }));

    let mut callbacks = StreamCallbacks::default();
    let o = observed.clone();
    callbacks.on_headers = Some(Box::new(move |_block, _status, _headers| {
        let mut o = o.lock().unwrap();
        o.n_headers += 1;
        if error_at == ErrorAt::Headers {
            return Err(io::Error::new(io::ErrorKind::Other, "0xBEEFCAFE").into());
        }
        Ok(())
    }));
    let o = observed.clone();
    callbacks.on_header_block_done = Some(Box::new(move |_block, _status| {
        let mut o = o.lock().unwrap();
        o.n_block_done += 1;
        if error_at == ErrorAt::HeaderBlockDone {
            return Err(io::Error::new(io::ErrorKind::Other, "0xBEEFCAFE").into());
        }
        Ok(())
    }));
    let o = observed.clone();
    callbacks.on_body = Some(Box::new(move |data| {
        let mut o = o.lock().unwrap();
        o.n_body += 1;
        o.body.extend_from_slice(data);
        if error_at == ErrorAt::Body {
            return Err(io::Error::new(io::ErrorKind::Other, "0xBEEFCAFE").into());
        }
        Ok(())
    }));
    let o = observed.clone();
    callbacks.on_complete = Some(Box::new(move |result| {
        let mut o = o.lock().unwrap();
        o.n_complete += 1;
        o.complete = true;
        o.error = result.err();
    }));

    let stream = tester.conn.make_request(request, callbacks).unwrap();
    stream.activate().unwrap();
    tester.channel.drain_tasks();

    tester.channel.push_read(
        "HTTP/1.1 200 OK\r\n\
         Transfer-Encoding: chunked\r\n\
         Date: Fri, 01 Mar 2019 17:18:55 GMT\r\n\
         \r\n\
         3\r\ntwo\r\n\
         6\r\nchunks\r\n\
         0\r\n\
         \r\n",
    );
    tester.channel.drain_tasks();

    let o = observed.lock().unwrap();
    // 出错点之前的回调触发过，之后的不再触发。
    match error_at {
        ErrorAt::OutgoingBody => {
            assert_eq!(o.n_headers, 0);
            assert_eq!(o.n_block_done, 0);
            assert_eq!(o.n_body, 0);
        }
        ErrorAt::Headers => {
            assert!(o.n_headers > 0);
            assert_eq!(o.n_block_done, 0);
            assert_eq!(o.n_body, 0);
        }
        ErrorAt::HeaderBlockDone => {
            assert!(o.n_headers > 0);
            assert!(o.n_block_done > 0);
            assert_eq!(o.n_body, 0);
        }
        ErrorAt::Body => {
            assert!(o.n_headers > 0);
            assert!(o.n_block_done > 0);
            assert_eq!(o.n_body, 1);
        }
    }

    // on_complete 恰好一次，带着对应的错误。
    assert_eq!(o.n_complete, 1);
    let err = o.error.as_ref().unwrap();
    if error_at == ErrorAt::OutgoingBody {
        assert!(err.is_body_source());
    } else {
        assert!(err.is_callback());
    }
    // 用户的原始错误保留在原因链上。
    let source = std::error::Error::source(err).unwrap();
    assert!(source.to_string().contains("0xBEEFCAFE"));
}

#[test]
fn error_from_outgoing_body_callback_stops_decoder() {
    error_from_callback(ErrorAt::OutgoingBody);
}

#[test]
fn error_from_incoming_headers_callback_stops_decoder() {
    error_from_callback(ErrorAt::Headers);
}

#[test]
fn error_from_incoming_headers_done_callback_stops_decoder() {
    error_from_callback(ErrorAt::HeaderBlockDone);
}

#[test]
fn error_from_incoming_body_callback_stops_decoder() {
    error_from_callback(ErrorAt::Body);
}

// ===== 协议升级（101） =====

struct Switcher {
    upgrade: StreamTester,
}

/// 发送 `Connection: Upgrade` 请求并接收 101 响应；
/// 可选地在头部块完成回调里安装下游处理器。
fn switch_protocols(
    tester: &Tester,
    install_downstream: bool,
    downstream_window: usize,
    data_after_response: &str,
) -> Switcher {
    let mut request = default_get();
    request.add_header("Connection", "Upgrade");
    request.add_header("Upgrade", "MyProtocol");

    let observed = Arc::new(Mutex::new(Observed::default()));
    let mut callbacks = recording_callbacks(&tester.conn, &observed);
    let channel = tester.channel.clone();
    callbacks.on_header_block_done = Some(Box::new(move |_block, status| {
        if install_downstream && status.as_u16() == 101 {
            channel.install_downstream_handler(downstream_window);
        }
        Ok(())
    }));

    let stream = tester.conn.make_request(request, callbacks).unwrap();
    stream.activate().unwrap();
    tester.channel.drain_tasks();
    // 清掉升级请求占用的出站字节。
    let _ = tester.channel.take_written();

    let mut response = String::from(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: MyProtocol\r\n\
         \r\n",
    );
    response.push_str(data_after_response);
    tester.channel.push_read(response.into_bytes());
    tester.channel.drain_tasks();

    let upgrade = StreamTester { stream, observed };
    upgrade.assert_success(101);
    if install_downstream {
        assert!(tester.channel.has_downstream());
    }
    Switcher { upgrade }
}

#[test]
fn new_request_allowed() {
    let tester = Tester::new();
    assert!(tester.conn.new_requests_allowed());

    let _switcher = switch_protocols(&tester, true, usize::MAX, "");

    assert!(!tester.conn.new_requests_allowed());
    let err = tester
        .conn
        .make_request(default_get(), StreamCallbacks::default())
        .unwrap_err();
    assert!(err.is_switched_protocols());

    tester.conn.close();
    let err = tester
        .conn
        .make_request(default_get(), StreamCallbacks::default())
        .unwrap_err();
    assert!(err.is_connection_closed());
}

#[test]
fn midchannel_sanity_check() {
    let tester = Tester::new();
    let _switcher = switch_protocols(&tester, true, usize::MAX, "");
}

#[test]
fn midchannel_read() {
    let tester = Tester::new();
    let _switcher = switch_protocols(&tester, true, usize::MAX, "");

    let test_str = "inmyprotocolspacesarestrictlyforbidden";
    tester.channel.push_read(test_str);
    tester.channel.drain_tasks();
    assert_eq!(tester.channel.take_downstream_read(), test_str);
}

#[test]
fn midchannel_read_immediately() {
    let tester = Tester::new();
    // 新协议的数据和升级响应挤在同一次投递里。
    let test_str = "inmyprotocoleverythingwillbebetter";
    let _switcher = switch_protocols(&tester, true, usize::MAX, test_str);

    assert_eq!(tester.channel.take_downstream_read(), test_str);
}

#[test]
fn midchannel_read_with_small_downstream_window() {
    let tester = Tester::new();
    let _switcher = switch_protocols(&tester, true, 1, "");

    let test_str = "inmyprotocolcapitallettersarethedevil";
    tester.channel.push_read(test_str);

    for _ in 0..test_str.len() {
        tester.channel.increment_downstream_read_window(1);
        tester.channel.drain_tasks();
    }

    // 数据被窗口切成了多条消息。
    assert!(tester.channel.downstream_read_message_count() > 1);
    assert_eq!(tester.channel.take_downstream_read(), test_str);
}

#[test]
fn midchannel_write() {
    let tester = Tester::new();
    let _switcher = switch_protocols(&tester, true, usize::MAX, "");

    let test_str = "inmyprotocolthereisnomoney";
    tester.channel.push_downstream_write(test_str).unwrap();
    tester.channel.drain_tasks();
    assert_eq!(tester.channel.take_written(), test_str);
}

#[test]
fn midchannel_write_continues_after_shutdown_in_read_dir() {
    let tester = Tester::new();
    let _switcher = switch_protocols(&tester, true, usize::MAX, "");

    // 下游处理器在写方向关闭的窗口里还要塞一条消息进来。
    let late_str = "inmyprotocolfrowningisnotallowed";
    tester
        .channel
        .set_downstream_shutdown_hook(move |ch, direction| {
            if direction == Direction::Write {
                ch.push_downstream_write(late_str).unwrap();
            }
        });

    tester.channel.shutdown(None);
    tester.channel.drain_tasks();

    assert_eq!(tester.channel.take_written(), late_str);
}

#[test]
fn midchannel_requires_switching_protocols() {
    let tester = Tester::new();
    // 没有升级就装了下游处理器：写入必须失败。
    tester.channel.install_downstream_handler(usize::MAX);
    let err = tester
        .channel
        .push_downstream_write("this has nowhere to go")
        .unwrap_err();
    assert!(err.is_user());
}

#[test]
fn switching_protocols_fails_pending_requests() {
    let tester = Tester::new();

    let mut upgrade_request = default_get();
    upgrade_request.add_header("Connection", "Upgrade");
    upgrade_request.add_header("Upgrade", "MyProtocol");
    let upgrade = spawn_stream(&tester, upgrade_request);

    // 升级请求后面还排着一条普通请求。
    let next = spawn_stream(&tester, default_get());

    tester.channel.drain_tasks();
    tester.channel.push_read(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: MyProtocol\r\n\
         \r\n",
    );
    tester.channel.drain_tasks();

    upgrade.assert_success(101);
    next.with(|o| {
        assert!(o.complete);
        assert!(o.error.as_ref().unwrap().is_switched_protocols());
    });
}

#[test]
fn switching_protocols_fails_subsequent_requests() {
    let tester = Tester::new();
    let _switcher = switch_protocols(&tester, true, usize::MAX, "");

    let err = tester
        .conn
        .make_request(default_get(), StreamCallbacks::default())
        .unwrap_err();
    assert!(err.is_switched_protocols());
}

#[test]
fn switching_protocols_requires_downstream_handler() {
    let tester = Tester::new();
    let _switcher = switch_protocols(&tester, false, 0, "");

    // 新协议的数据到了，却没有下游处理器接手。
    tester.channel.push_read("herecomesnewprotocoldatachoochoo");
    tester.channel.drain_tasks();

    assert!(tester.channel.is_shutdown_complete());
    assert!(tester.channel.take_shutdown_error().is_some());
}
