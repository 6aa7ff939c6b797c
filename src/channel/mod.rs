//! 字节管道（channel）边界模块
//!
//! HTTP/1.1 连接核心并不直接拥有 socket——它作为处理器挂载在一条
//! 字节管道上：管道向上投递入站字节、接受出站消息、传递读窗口增量，
//! 并在协议升级后承载下游处理器。本模块定义这条管道的最小契约
//! （[`ChannelHandler`]）以及一个单线程驱动的具体实现 [`Channel`]，
//! 测试和嵌入方都用它来泵动连接。
//!
//! ## 线程模型
//!
//! 管道的驱动（投递读、跑任务、关闭）都发生在 I/O 线程上；
//! 唯一跨线程的入口是任务队列：任何线程都可以 [`Channel::schedule`]
//! 一个任务，它会在 I/O 线程下一次泵动时执行。这就是连接 API
//! "从任意线程调用、封送到 I/O 线程执行"的底层机制。

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use bytes::{Bytes, BytesMut};

use crate::error::Error;

/// 单条出站消息的最大容量。
///
/// 编码器一次最多填满这么多字节，然后提交并在下一轮申请新的消息。
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// 管道的方向。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// 入站（从对端到处理器）
    Read,
    /// 出站（从处理器到对端）
    Write,
}

/// 一个被封送到 I/O 线程执行的任务。
pub struct Task {
    name: &'static str,
    func: Box<dyn FnOnce() + Send>,
}

impl Task {
    /// 创建一个带名字的任务；名字用于日志。
    pub fn new(name: &'static str, func: impl FnOnce() + Send + 'static) -> Task {
        Task {
            name,
            func: Box::new(func),
        }
    }

    fn run(self) {
        trace!("channel task running: {}", self.name);
        (self.func)();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Task").field(&self.name).finish()
    }
}

/// 一条出站消息：处理器向管道申请、填充、再提交。
pub struct IoMessage {
    /// 待写出的字节。容量就是本条消息的上限。
    pub data: BytesMut,
    /// 消息写出（或失败）后在 I/O 线程上触发的完成回调。
    pub on_completion: Option<Box<dyn FnOnce(crate::Result<()>) + Send>>,
}

impl fmt::Debug for IoMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoMessage")
            .field("len", &self.data.len())
            .field("on_completion", &self.on_completion.is_some())
            .finish()
    }
}

impl IoMessage {
    fn complete(mut self, result: crate::Result<()>) {
        if let Some(cb) = self.on_completion.take() {
            cb(result);
        }
    }
}

/// 管道向其挂载的处理器回调的契约。连接核心实现它。
pub trait ChannelHandler: Send + Sync {
    /// 入站字节送达。
    fn on_read(&self, channel: &Channel, data: Bytes);

    /// 下游处理器推上来的出站字节（协议升级后的透传写方向）。
    fn on_downstream_write(&self, channel: &Channel, data: Bytes) -> crate::Result<()>;

    /// 下游处理器增加了它的读窗口。
    fn on_downstream_window_increment(&self, channel: &Channel, n: usize);

    /// 管道在某个方向上关闭。读方向先于写方向；
    /// 两者之间处理器仍须接受下游写入。
    ///
    /// `free_resources_immediately` 为 true 时跳过一切可选的收尾
    /// （比如干净地结束一个按连接关闭分隔的响应），直接释放资源。
    fn on_shutdown(
        &self,
        channel: &Channel,
        direction: Direction,
        error: Option<&Error>,
        free_resources_immediately: bool,
    );
}

struct DownstreamSlot {
    window: usize,
    read_messages: Vec<Bytes>,
}

#[derive(Default)]
struct ShutdownState {
    in_progress: bool,
    completed: bool,
    error: Option<Error>,
}

#[derive(Default)]
struct ChannelCore {
    tasks: Mutex<VecDeque<Task>>,
    handler: Mutex<Option<Arc<dyn ChannelHandler>>>,
    written: Mutex<Vec<Bytes>>,
    window_updates: Mutex<Vec<usize>>,
    downstream: Mutex<Option<DownstreamSlot>>,
    downstream_shutdown_hook: Mutex<Option<Box<dyn Fn(&Channel, Direction) + Send>>>,
    shutdown: Mutex<ShutdownState>,
}

/// 单线程驱动的字节管道。
///
/// 克隆得到的是同一条管道的另一个强引用。
#[derive(Clone, Default)]
pub struct Channel {
    core: Arc<ChannelCore>,
}

/// 处理器持有的非拥有（weak）管道句柄，避免处理器与管道互相强引用。
#[derive(Clone, Debug)]
pub struct ChannelHandle {
    core: Weak<ChannelCore>,
}

impl ChannelHandle {
    /// 升级为强句柄；管道已销毁时返回 `None`。
    pub fn channel(&self) -> Option<Channel> {
        self.core.upgrade().map(|core| Channel { core })
    }
}

impl Channel {
    /// 创建一条空管道。
    pub fn new() -> Channel {
        Channel::default()
    }

    /// 供处理器持有的非拥有句柄。
    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            core: Arc::downgrade(&self.core),
        }
    }

    /// 挂载处理器。管道持有处理器的强引用，直到关闭完成。
    pub fn install_handler(&self, handler: Arc<dyn ChannelHandler>) {
        let mut slot = self.core.handler.lock().unwrap();
        debug_assert!(slot.is_none(), "channel already has a handler");
        *slot = Some(handler);
    }

    /// 从任意线程投递一个任务，等待 I/O 线程泵动时执行。
    pub fn schedule(&self, task: Task) {
        trace!("channel task scheduled: {:?}", task);
        self.core.tasks.lock().unwrap().push_back(task);
    }

    /// 执行任务直到队列为空（任务再投递的任务也会被执行）。
    pub fn drain_tasks(&self) {
        loop {
            let task = self.core.tasks.lock().unwrap().pop_front();
            match task {
                Some(task) => task.run(),
                None => return,
            }
        }
    }

    /// 只执行当前已入队的任务一轮；执行期间新投递的任务留到下一轮。
    pub fn run_queued_tasks_once(&self) {
        let mut current = {
            let mut tasks = self.core.tasks.lock().unwrap();
            std::mem::take(&mut *tasks)
        };
        for task in current.drain(..) {
            task.run();
        }
    }

    /// 申请一条出站消息，容量受 [`MAX_MESSAGE_SIZE`] 限制。
    pub fn acquire_message(&self, size_hint: usize) -> IoMessage {
        IoMessage {
            data: BytesMut::with_capacity(std::cmp::min(size_hint, MAX_MESSAGE_SIZE)),
            on_completion: None,
        }
    }

    /// 提交一条出站消息。
    ///
    /// 关闭完成之后的提交会失败，消息的完成回调收到
    /// `ConnectionClosed`。
    pub fn send_message(&self, msg: IoMessage) -> crate::Result<()> {
        if self.core.shutdown.lock().unwrap().completed {
            msg.complete(Err(Error::new_closed()));
            return Err(Error::new_closed());
        }
        trace!("channel sending {} bytes", msg.data.len());
        let IoMessage {
            data,
            on_completion,
        } = msg;
        self.core.written.lock().unwrap().push(data.freeze());
        if let Some(cb) = on_completion {
            cb(Ok(()));
        }
        Ok(())
    }

    /// 处理器向上游返还读窗口额度。
    pub fn increment_read_window(&self, n: usize) {
        trace!("channel read window incremented by {}", n);
        self.core.window_updates.lock().unwrap().push(n);
    }

    /// 测试观察口：最近一次读窗口增量。
    pub fn last_window_update(&self) -> Option<usize> {
        self.core.window_updates.lock().unwrap().last().copied()
    }

    /// 向处理器投递入站字节（在 I/O 线程上调用）。
    pub fn push_read(&self, data: impl Into<Bytes>) {
        let handler = self.core.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler.on_read(self, data.into());
        } else {
            debug!("read bytes delivered to channel with no handler");
        }
    }

    /// 取走并拼接目前为止的全部出站字节。
    pub fn take_written(&self) -> Bytes {
        let mut queue = self.core.written.lock().unwrap();
        let total: usize = queue.iter().map(|b| b.len()).sum();
        let mut all = BytesMut::with_capacity(total);
        for msg in queue.drain(..) {
            all.extend_from_slice(&msg);
        }
        all.freeze()
    }

    /// 安装下游处理器（协议升级后的数据去向），带初始读窗口。
    pub fn install_downstream_handler(&self, initial_window: usize) {
        let mut slot = self.core.downstream.lock().unwrap();
        debug_assert!(slot.is_none(), "downstream handler already installed");
        *slot = Some(DownstreamSlot {
            window: initial_window,
            read_messages: Vec::new(),
        });
    }

    /// 注册下游处理器的关闭回调（测试用：在关闭的写方向窗口内仍可写入）。
    pub fn set_downstream_shutdown_hook(
        &self,
        hook: impl Fn(&Channel, Direction) + Send + 'static,
    ) {
        *self.core.downstream_shutdown_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// 是否已安装下游处理器。
    pub fn has_downstream(&self) -> bool {
        self.core.downstream.lock().unwrap().is_some()
    }

    /// 下游处理器当前的读窗口；未安装下游时返回 `None`。
    pub fn downstream_window(&self) -> Option<usize> {
        self.core.downstream.lock().unwrap().as_ref().map(|s| s.window)
    }

    /// 向下游转发入站字节。调用方必须遵守下游窗口。
    pub fn send_downstream(&self, data: Bytes) -> crate::Result<()> {
        let mut slot = self.core.downstream.lock().unwrap();
        match *slot {
            Some(ref mut slot) => {
                debug_assert!(
                    data.len() <= slot.window,
                    "downstream window violated: {} > {}",
                    data.len(),
                    slot.window
                );
                slot.window -= data.len();
                slot.read_messages.push(data);
                Ok(())
            }
            None => Err(Error::new_closed()),
        }
    }

    /// 增加下游处理器的读窗口，并通知处理器继续转发。
    pub fn increment_downstream_read_window(&self, n: usize) {
        {
            let mut slot = self.core.downstream.lock().unwrap();
            match *slot {
                Some(ref mut slot) => slot.window += n,
                None => return,
            }
        }
        let handler = self.core.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler.on_downstream_window_increment(self, n);
        }
    }

    /// 下游推上来的出站字节（升级后的写方向透传）。
    pub fn push_downstream_write(&self, data: impl Into<Bytes>) -> crate::Result<()> {
        let handler = self.core.handler.lock().unwrap().clone();
        match handler {
            Some(handler) => handler.on_downstream_write(self, data.into()),
            None => Err(Error::new_closed()),
        }
    }

    /// 测试观察口：下游收到的消息条数。
    pub fn downstream_read_message_count(&self) -> usize {
        self.core
            .downstream
            .lock()
            .unwrap()
            .as_ref()
            .map_or(0, |s| s.read_messages.len())
    }

    /// 取走并拼接下游收到的全部字节。
    pub fn take_downstream_read(&self) -> Bytes {
        let mut slot = self.core.downstream.lock().unwrap();
        let slot = match *slot {
            Some(ref mut slot) => slot,
            None => return Bytes::new(),
        };
        let total: usize = slot.read_messages.iter().map(|b| b.len()).sum();
        let mut all = BytesMut::with_capacity(total);
        for msg in slot.read_messages.drain(..) {
            all.extend_from_slice(&msg);
        }
        all.freeze()
    }

    /// 双方向关闭整条管道。
    ///
    /// 顺序固定：处理器读方向 → 下游读方向 → 下游写方向
    /// （期间下游仍可推写入）→ 处理器写方向 → 标记完成。
    /// 重复调用是空操作。
    pub fn shutdown(&self, error: Option<Error>) {
        self.shutdown_with(error, false);
    }

    /// [`shutdown`](Channel::shutdown) 的急迫版本：要求处理器立即
    /// 释放资源，跳过可选的收尾。
    pub fn shutdown_immediately(&self, error: Option<Error>) {
        self.shutdown_with(error, true);
    }

    fn shutdown_with(&self, error: Option<Error>, free_resources_immediately: bool) {
        {
            let mut state = self.core.shutdown.lock().unwrap();
            if state.in_progress || state.completed {
                return;
            }
            state.in_progress = true;
        }
        debug!("channel shutting down, error: {:?}", error);

        let handler = self.core.handler.lock().unwrap().clone();

        if let Some(ref handler) = handler {
            handler.on_shutdown(
                self,
                Direction::Read,
                error.as_ref(),
                free_resources_immediately,
            );
        }

        let hook = self.core.downstream_shutdown_hook.lock().unwrap().take();
        if let Some(ref hook) = hook {
            hook(self, Direction::Read);
            // The downstream handler may still push writes in the window
            // between read-shutdown and write-shutdown.
            hook(self, Direction::Write);
        }

        if let Some(ref handler) = handler {
            handler.on_shutdown(
                self,
                Direction::Write,
                error.as_ref(),
                free_resources_immediately,
            );
        }

        {
            let mut state = self.core.shutdown.lock().unwrap();
            state.completed = true;
            state.error = error;
        }
        // Release the handler so the connection can be dropped.
        self.core.handler.lock().unwrap().take();
    }

    /// 双方向的关闭是否已经完成。
    pub fn is_shutdown_complete(&self) -> bool {
        self.core.shutdown.lock().unwrap().completed
    }

    /// 取走关闭时记录的错误（`None` 表示干净关闭）。
    pub fn take_shutdown_error(&self) -> Option<Error> {
        self.core.shutdown.lock().unwrap().error.take()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("tasks", &self.core.tasks.lock().unwrap().len())
            .field("shutdown", &self.core.shutdown.lock().unwrap().completed)
            .finish()
    }
}
