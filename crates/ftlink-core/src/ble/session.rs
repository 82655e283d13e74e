//! BLE 文件传输会话
//!
//! 一个会话对应一条物理连接，持有数据通道、重组缓冲区和所有进行中的
//! 传输状态。
//!
//! # 流程
//!
//! 1. 连接外设
//! 2. 发现文件传输服务和特征
//! 3. 读取协议版本 (只在建立连接时读取一次)
//! 4. 启用数据特征通知，后台任务把通知交给重组队列
//!
//! 响应没有请求 ID，只能按顺序与请求对应，所以同一时间只允许一个
//! 命令在途。

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::SystemTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::ble::link::{BleLink, NotificationStream};
use crate::client::{FileTransferClient, SessionState, TransportKind};
use crate::config::Settings;
use crate::protocol::{ChunkQueue, ProtocolVersion, Request};
use crate::transfer::entry::now_nanos;
use crate::transfer::state::Pending;
use crate::transfer::{
    DirectoryEntry, FrameContext, OperationKind, ProgressFn, TransferError, TransferStates,
};

struct ProtocolState {
    /// 建立连接时读取的版本，断开后清除
    version: Option<ProtocolVersion>,
    queue: ChunkQueue,
    transfers: TransferStates,
}

struct Inner<L> {
    link: L,
    address: String,
    state: watch::Sender<SessionState>,
    protocol: Mutex<ProtocolState>,
    /// 保证同一时间只有一个命令在途 (tokio 的 Mutex 按 FIFO 顺序唤醒)
    commands: tokio::sync::Mutex<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
    max_file_size: u64,
}

/// BLE 文件传输会话
pub struct BleFileTransferSession<L: BleLink> {
    inner: Arc<Inner<L>>,
}

impl<L: BleLink> Clone for BleFileTransferSession<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// 建立过程中途被取消时在后台断开链路
struct SetupGuard<L: BleLink> {
    session: Option<BleFileTransferSession<L>>,
}

impl<L: BleLink> Drop for SetupGuard<L> {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        warn!("{}: setup cancelled, releasing link", session.inner.address);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    session.abandon_setup("setup cancelled".to_string()).await;
                });
            }
            Err(_) => debug!("{}: no runtime to release link", session.inner.address),
        }
    }
}

fn request_kind(request: &Request) -> OperationKind {
    match request {
        Request::Read { .. } | Request::ReadChunk { .. } => OperationKind::Read,
        Request::Write { .. } | Request::WriteChunk { .. } => OperationKind::Write,
        Request::Delete { .. } => OperationKind::Delete,
        Request::MakeDirectory { .. } => OperationKind::MakeDirectory,
        Request::ListDirectory { .. } => OperationKind::ListDirectory,
        Request::Move { .. } => OperationKind::Move,
    }
}

impl<L: BleLink> BleFileTransferSession<L> {
    pub fn new(link: L, settings: &Settings) -> Self {
        let address = link.address();
        let (state, _) = watch::channel(SessionState::Start);
        Self {
            inner: Arc::new(Inner {
                link,
                address,
                state,
                protocol: Mutex::new(ProtocolState {
                    version: None,
                    queue: ChunkQueue::new(settings.max_buffered_bytes),
                    transfers: TransferStates::new(),
                }),
                commands: tokio::sync::Mutex::new(()),
                pump: Mutex::new(None),
                max_file_size: settings.max_file_size,
            }),
        }
    }

    pub fn link(&self) -> &L {
        &self.inner.link
    }

    /// 建立连接时协商的协议版本
    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.protocol().version
    }

    fn protocol(&self) -> MutexGuard<'_, ProtocolState> {
        self.inner
            .protocol
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        debug!("{}: session state -> {}", self.inner.address, state);
        self.inner.state.send_replace(state);
    }

    fn frame_context(&self, version: ProtocolVersion) -> FrameContext {
        FrameContext::new(
            version,
            self.inner.link.max_write_len(),
            self.inner.max_file_size,
        )
    }

    /// 连接并完成会话初始化
    ///
    /// 连接失败进入 `Disconnected`，之后的步骤失败进入 `Error` 并断开链路。
    /// 建立过程被取消 (future 被丢弃) 时同样会断开链路。
    pub async fn setup(&self) -> Result<(), TransferError> {
        let mut guard = SetupGuard {
            session: Some(self.clone()),
        };
        let result = self.run_setup().await;
        guard.session = None;
        result
    }

    async fn run_setup(&self) -> Result<(), TransferError> {
        let link = &self.inner.link;

        self.set_state(SessionState::Connecting);
        if let Err(e) = link.connect().await {
            self.set_state(SessionState::Disconnected(Some(e.to_string())));
            return Err(e);
        }
        self.set_state(SessionState::Connected);

        match self.initialize().await {
            Ok(stream) => {
                self.spawn_pump(stream);
                self.set_state(SessionState::Enabled);
                info!(
                    "{}: file transfer ready (protocol {})",
                    self.inner.address,
                    self.protocol_version().unwrap_or_default()
                );
                Ok(())
            }
            Err(e) => {
                error!("{}: setup failed: {}", self.inner.address, e);
                self.abandon_setup(e.to_string()).await;
                Err(e)
            }
        }
    }

    /// 建立失败后释放已经连上的链路
    async fn abandon_setup(&self, reason: String) {
        self.protocol().version = None;
        if let Err(e) = self.inner.link.disconnect().await {
            warn!("{}: failed to release link after setup: {}", self.inner.address, e);
        }
        self.set_state(SessionState::Error(reason));
    }

    async fn initialize(&self) -> Result<NotificationStream, TransferError> {
        let link = &self.inner.link;

        self.set_state(SessionState::Discovering);
        link.discover().await?;

        self.set_state(SessionState::CheckingVersion);
        let version = link.read_version().await?.unwrap_or_default();
        debug!("{}: protocol version {}", self.inner.address, version);
        {
            let mut protocol = self.protocol();
            protocol.version = Some(version);
            protocol.queue.clear();
        }

        self.set_state(SessionState::EnablingNotifications);
        link.enable_notifications().await
    }

    fn spawn_pump(&self, mut stream: NotificationStream) {
        let weak: Weak<Inner<L>> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(value) = stream.next().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                BleFileTransferSession { inner }.on_notification(&value).await;
            }
            if let Some(inner) = weak.upgrade() {
                BleFileTransferSession { inner }
                    .handle_disconnect(Some("notification stream closed".to_string()));
            }
        });

        let previous = self
            .inner
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// 处理数据特征上收到的一段字节
    pub async fn on_notification(&self, bytes: &[u8]) {
        let outbox = {
            let mut protocol = self.protocol();
            let Some(version) = protocol.version else {
                warn!(
                    "{}: dropping {} bytes received before setup",
                    self.inner.address,
                    bytes.len()
                );
                return;
            };
            let ctx = self.frame_context(version);
            let ProtocolState {
                queue, transfers, ..
            } = &mut *protocol;

            let mut outbox = Vec::new();
            let drained = queue.process(bytes, |buf| transfers.handle_frame(buf, &ctx, &mut outbox));
            if drained.overflowed {
                transfers.fail_all(|| {
                    TransferError::InvalidData("reassembly buffer overflow".to_string())
                });
            }
            outbox
        };

        for request in outbox {
            let kind = request_kind(&request);
            let result = match request.encode() {
                Ok(frame) => self.inner.link.write(&frame).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                error!("{}: failed to send follow-up {} request: {}", self.inner.address, kind, e);
                self.protocol().transfers.fail(kind, e);
            }
        }
    }

    /// 传输层报告连接断开
    ///
    /// 所有进行中的操作以 `Disconnected` 结束，重组缓冲区和协议版本被清除。
    pub fn handle_disconnect(&self, reason: Option<String>) {
        {
            let mut protocol = self.protocol();
            if !protocol.transfers.is_idle() {
                warn!(
                    "{}: disconnected with {:?} outstanding",
                    self.inner.address,
                    protocol.transfers.outstanding()
                );
            }
            protocol.transfers.fail_all(|| TransferError::Disconnected);
            protocol.queue.clear();
            protocol.version = None;
        }
        if !self.state().is_disconnected() {
            info!("{}: disconnected", self.inner.address);
            self.set_state(SessionState::Disconnected(reason));
        }
    }

    /// 发送一个命令并等待对应的操作完成
    async fn execute<T, F>(&self, build: impl FnOnce(ProtocolVersion) -> Request, begin: F) -> Result<T, TransferError>
    where
        F: FnOnce(&mut TransferStates) -> Result<Pending<T>, TransferError>,
    {
        let _turn = self.inner.commands.lock().await;

        // 版本检查和登记状态在同一把锁内完成，断开处理不会插在两者之间
        let (kind, frame, pending) = {
            let mut protocol = self.protocol();
            let Some(version) = protocol.version else {
                return Err(TransferError::Disconnected);
            };
            if !self.state().is_ready() {
                return Err(TransferError::Disconnected);
            }
            let request = build(version);
            let frame = request.encode()?;
            let pending = begin(&mut protocol.transfers)?;
            (request_kind(&request), frame, pending)
        };

        if let Err(e) = self.inner.link.write(&frame).await {
            error!("{}: failed to send {} request: {}", self.inner.address, kind, e);
            self.protocol().transfers.fail(kind, e);
        }

        pending.await.unwrap_or(Err(TransferError::Disconnected))
    }
}

#[async_trait]
impl<L: BleLink> FileTransferClient for BleFileTransferSession<L> {
    fn address(&self) -> &str {
        &self.inner.address
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Ble
    }

    fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    async fn read_file(
        &self,
        path: &str,
        progress: Option<ProgressFn>,
    ) -> Result<Vec<u8>, TransferError> {
        debug!("{}: read {}", self.inner.address, path);
        let max_write_len = self.inner.link.max_write_len();
        let max_file_size = self.inner.max_file_size;
        self.execute(
            |version| Request::Read {
                path: path.to_string(),
                offset: 0,
                chunk_size: FrameContext::new(version, max_write_len, max_file_size)
                    .read_chunk_size,
            },
            |transfers| transfers.begin_read(progress),
        )
        .await
    }

    async fn write_file(
        &self,
        path: &str,
        data: Vec<u8>,
        progress: Option<ProgressFn>,
    ) -> Result<Option<SystemTime>, TransferError> {
        debug!("{}: write {} ({} bytes)", self.inner.address, path, data.len());
        let total = data.len() as u64;
        if total > self.inner.max_file_size || total > u64::from(u32::MAX) {
            return Err(TransferError::FileTooLarge(total));
        }
        self.execute(
            |version| Request::Write {
                path: path.to_string(),
                offset: 0,
                total_size: total as u32,
                timestamp_ns: version.has_timestamps().then(now_nanos),
            },
            |transfers| transfers.begin_write(data, progress),
        )
        .await
    }

    async fn list_directory(
        &self,
        path: &str,
    ) -> Result<Option<Vec<DirectoryEntry>>, TransferError> {
        debug!("{}: list {}", self.inner.address, path);
        self.execute(
            |_| Request::ListDirectory {
                path: path.to_string(),
            },
            TransferStates::begin_list,
        )
        .await
    }

    async fn delete_file(&self, path: &str) -> Result<(), TransferError> {
        debug!("{}: delete {}", self.inner.address, path);
        self.execute(
            |_| Request::Delete {
                path: path.to_string(),
            },
            TransferStates::begin_delete,
        )
        .await
    }

    async fn move_file(&self, from: &str, to: &str) -> Result<(), TransferError> {
        debug!("{}: move {} -> {}", self.inner.address, from, to);
        self.execute(
            |_| Request::Move {
                from: from.to_string(),
                to: to.to_string(),
            },
            TransferStates::begin_move,
        )
        .await
    }

    async fn make_directory(&self, path: &str) -> Result<Option<SystemTime>, TransferError> {
        debug!("{}: mkdir {}", self.inner.address, path);
        self.execute(
            |version| Request::MakeDirectory {
                path: path.to_string(),
                timestamp_ns: version.has_timestamps().then(now_nanos),
            },
            TransferStates::begin_make_directory,
        )
        .await
    }

    async fn disconnect(&self) -> Result<(), TransferError> {
        if self.state().is_disconnected() {
            return Ok(());
        }
        self.set_state(SessionState::Disconnecting(None));

        // 先停止通知任务，避免把主动断开当作意外断开
        let pump = self
            .inner
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            pump.abort();
        }

        let result = self.inner.link.disconnect().await;
        if let Err(e) = &result {
            warn!("{}: disconnect failed: {}", self.inner.address, e);
        }
        self.handle_disconnect(None);
        result
    }
}
