//! 传输无关的文件操作接口
//!
//! BLE 和 Wifi 会话都实现 [`FileTransferClient`]，连接管理器只依赖
//! 这个 trait。

use async_trait::async_trait;
use std::fmt;
use std::time::SystemTime;
use tokio::sync::watch;

use crate::transfer::{DirectoryEntry, ProgressFn, TransferError};

/// 传输类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Ble,
    Wifi,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Ble => write!(f, "BLE"),
            TransportKind::Wifi => write!(f, "Wifi"),
        }
    }
}

/// 会话连接状态
///
/// `Start` 与 `Disconnected` 区分开，以便识别从未连接过的新会话。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Start,
    Connecting,
    Connected,
    Discovering,
    CheckingVersion,
    EnablingNotifications,
    Enabled,
    Disconnecting(Option<String>),
    Disconnected(Option<String>),
    /// 建立会话过程中失败
    Error(String),
}

impl SessionState {
    /// 可以执行文件操作
    pub fn is_ready(&self) -> bool {
        matches!(self, SessionState::Enabled)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(
            self,
            SessionState::Disconnected(_) | SessionState::Error(_)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Start => write!(f, "start"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Discovering => write!(f, "discovering"),
            SessionState::CheckingVersion => write!(f, "checking version"),
            SessionState::EnablingNotifications => write!(f, "enabling notifications"),
            SessionState::Enabled => write!(f, "enabled"),
            SessionState::Disconnecting(_) => write!(f, "disconnecting"),
            SessionState::Disconnected(None) => write!(f, "disconnected"),
            SessionState::Disconnected(Some(reason)) => write!(f, "disconnected: {}", reason),
            SessionState::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// 一个外设上的文件系统操作
///
/// 每个方法对应一次逻辑操作；失败不会自动重试。
#[async_trait]
pub trait FileTransferClient: Send + Sync {
    /// 外设地址 (BLE 地址或主机名)
    fn address(&self) -> &str;

    fn transport(&self) -> TransportKind;

    fn state(&self) -> SessionState;

    /// 订阅状态变化
    fn watch_state(&self) -> watch::Receiver<SessionState>;

    async fn read_file(
        &self,
        path: &str,
        progress: Option<ProgressFn>,
    ) -> Result<Vec<u8>, TransferError>;

    /// 写入整个文件，返回外设记录的修改时间 (如果提供)
    async fn write_file(
        &self,
        path: &str,
        data: Vec<u8>,
        progress: Option<ProgressFn>,
    ) -> Result<Option<SystemTime>, TransferError>;

    /// `Ok(None)` 表示目录不存在，`Ok(Some(vec![]))` 表示空目录
    async fn list_directory(
        &self,
        path: &str,
    ) -> Result<Option<Vec<DirectoryEntry>>, TransferError>;

    async fn delete_file(&self, path: &str) -> Result<(), TransferError>;

    async fn move_file(&self, from: &str, to: &str) -> Result<(), TransferError>;

    async fn make_directory(&self, path: &str) -> Result<Option<SystemTime>, TransferError>;

    async fn disconnect(&self) -> Result<(), TransferError>;
}
