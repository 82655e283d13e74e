//! 每个外设的操作队列
//!
//! 命令按入队顺序逐个执行，上一个完成后才开始下一个。每个命令入队时
//! 附带一个 [`CancellationToken`]，开始执行前被取消的命令直接以
//! `Cancelled` 结束；已经开始的命令只能通过断开会话来中止。

use log::{debug, warn};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::FileTransferClient;
use crate::manager::ConnectionError;
use crate::transfer::{DirectoryEntry, ProgressFn, TransferError};

/// 队列中的文件操作
pub enum Command {
    ReadFile {
        path: String,
        progress: Option<ProgressFn>,
    },
    WriteFile {
        path: String,
        data: Vec<u8>,
        progress: Option<ProgressFn>,
    },
    ListDirectory {
        path: String,
    },
    DeleteFile {
        path: String,
    },
    MoveFile {
        from: String,
        to: String,
    },
    MakeDirectory {
        path: String,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::ReadFile { .. } => "read",
            Command::WriteFile { .. } => "write",
            Command::ListDirectory { .. } => "list",
            Command::DeleteFile { .. } => "delete",
            Command::MoveFile { .. } => "move",
            Command::MakeDirectory { .. } => "mkdir",
        }
    }

    async fn execute(self, client: &dyn FileTransferClient) -> Result<CommandOutput, TransferError> {
        match self {
            Command::ReadFile { path, progress } => {
                client.read_file(&path, progress).await.map(CommandOutput::Data)
            }
            Command::WriteFile {
                path,
                data,
                progress,
            } => client
                .write_file(&path, data, progress)
                .await
                .map(CommandOutput::Written),
            Command::ListDirectory { path } => client
                .list_directory(&path)
                .await
                .map(CommandOutput::Listing),
            Command::DeleteFile { path } => client.delete_file(&path).await.map(|_| CommandOutput::Done),
            Command::MoveFile { from, to } => {
                client.move_file(&from, &to).await.map(|_| CommandOutput::Done)
            }
            Command::MakeDirectory { path } => client
                .make_directory(&path)
                .await
                .map(CommandOutput::Written),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::ReadFile { path, .. }
            | Command::ListDirectory { path }
            | Command::DeleteFile { path }
            | Command::MakeDirectory { path } => write!(f, "{} {}", self.name(), path),
            Command::WriteFile { path, data, .. } => {
                write!(f, "write {} ({} bytes)", path, data.len())
            }
            Command::MoveFile { from, to } => write!(f, "move {} -> {}", from, to),
        }
    }
}

/// 命令执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutput {
    /// 读取到的文件内容
    Data(Vec<u8>),
    /// 写入或创建目录后设备记录的修改时间
    Written(Option<SystemTime>),
    /// 目录列表，目录不存在时为 `None`
    Listing(Option<Vec<DirectoryEntry>>),
    Done,
}

struct Queued {
    command: Command,
    cancel: CancellationToken,
    reply: oneshot::Sender<Result<CommandOutput, ConnectionError>>,
}

impl Queued {
    fn cancelled(self) {
        debug!("Command {:?} cancelled before start", self.command);
        let _ = self.reply.send(Err(ConnectionError::Cancelled));
    }
}

pub struct OperationQueue {
    address: String,
    tx: mpsc::UnboundedSender<Queued>,
    client: Arc<Mutex<Arc<dyn FileTransferClient>>>,
    paused: watch::Sender<bool>,
    shutdown: CancellationToken,
    worker: JoinHandle<()>,
}

impl OperationQueue {
    pub fn new(address: impl Into<String>, client: Arc<dyn FileTransferClient>) -> Self {
        let address = address.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Arc::new(Mutex::new(client));
        let (paused, paused_rx) = watch::channel(false);
        let shutdown = CancellationToken::new();

        let worker = tokio::spawn(run_worker(
            address.clone(),
            rx,
            client.clone(),
            paused_rx,
            shutdown.clone(),
        ));

        Self {
            address,
            tx,
            client,
            paused,
            shutdown,
            worker,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// 入队并等待命令完成
    pub async fn enqueue(
        &self,
        command: Command,
        cancel: CancellationToken,
    ) -> Result<CommandOutput, ConnectionError> {
        self.submit(command, cancel).await
    }

    /// 入队，返回的 future 在命令完成时就绪，不借用队列本身
    pub fn submit(
        &self,
        command: Command,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<CommandOutput, ConnectionError>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let queued = Queued {
            command,
            cancel,
            reply,
        };
        if let Err(mpsc::error::SendError(queued)) = self.tx.send(queued) {
            queued.cancelled();
        }
        async move { rx.await.unwrap_or(Err(ConnectionError::Cancelled)) }
    }

    /// 后续命令改用新的会话 (重连成功后)
    pub fn set_client(&self, client: Arc<dyn FileTransferClient>) {
        *self.client.lock().unwrap_or_else(PoisonError::into_inner) = client;
    }

    /// 暂停执行新的命令，已入队的命令继续等待
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// 关闭队列，尚未开始的命令以 `Cancelled` 结束
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// 工作任务已退出
    pub fn is_stopped(&self) -> bool {
        self.worker.is_finished()
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// 等待队列恢复；返回 `false` 表示命令已被取消或队列已关闭
async fn wait_resumed(
    paused: &mut watch::Receiver<bool>,
    shutdown: &CancellationToken,
    cancel: &CancellationToken,
) -> bool {
    loop {
        if shutdown.is_cancelled() || cancel.is_cancelled() {
            return false;
        }
        if !*paused.borrow_and_update() {
            return true;
        }
        tokio::select! {
            _ = shutdown.cancelled() => return false,
            _ = cancel.cancelled() => return false,
            changed = paused.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

async fn run_worker(
    address: String,
    mut rx: mpsc::UnboundedReceiver<Queued>,
    client: Arc<Mutex<Arc<dyn FileTransferClient>>>,
    mut paused: watch::Receiver<bool>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            queued = rx.recv() => queued,
        };
        let Some(queued) = next else {
            break;
        };

        if !wait_resumed(&mut paused, &shutdown, &queued.cancel).await {
            queued.cancelled();
            continue;
        }

        let Queued {
            command,
            cancel: _,
            reply,
        } = queued;
        let current = client.lock().unwrap_or_else(PoisonError::into_inner).clone();
        debug!("{}: executing {:?}", address, command);
        let result = command.execute(current.as_ref()).await;
        if let Err(e) = &result {
            warn!("{}: command failed: {}", address, e);
        }
        let _ = reply.send(result.map_err(ConnectionError::from));
    }

    rx.close();
    while let Ok(queued) = rx.try_recv() {
        queued.cancelled();
    }
    debug!("{}: operation queue stopped", address);
}
