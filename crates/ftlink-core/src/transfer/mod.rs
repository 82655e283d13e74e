//! 文件传输操作
//!
//! 包含:
//! - 目录条目
//! - 每种操作的状态机 (读/写/列目录/删除/移动/创建目录)
//! - 操作级错误

pub mod entry;
pub mod state;

pub use entry::{DirectoryEntry, EntryKind};
pub use state::{FrameContext, TransferStates};

use crate::protocol::{FrameError, status_message};
use crate::wifi::NetworkError;
use std::sync::Arc;
use uuid::Uuid;

/// 进度回调: (已传输字节, 总字节)
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// 操作种类，每个会话每种最多一个进行中的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Read,
    Write,
    ListDirectory,
    Delete,
    MakeDirectory,
    Move,
}

impl OperationKind {
    pub const ALL: [OperationKind; 6] = [
        OperationKind::Read,
        OperationKind::Write,
        OperationKind::ListDirectory,
        OperationKind::Delete,
        OperationKind::MakeDirectory,
        OperationKind::Move,
    ];

    /// 根据响应命令码找到对应的操作
    pub fn from_response(command: u8) -> Option<Self> {
        use crate::protocol::opcode;
        match command {
            opcode::READ_RESPONSE => Some(OperationKind::Read),
            opcode::WRITE_RESPONSE => Some(OperationKind::Write),
            opcode::LIST_DIRECTORY_RESPONSE => Some(OperationKind::ListDirectory),
            opcode::DELETE_RESPONSE => Some(OperationKind::Delete),
            opcode::MAKE_DIRECTORY_RESPONSE => Some(OperationKind::MakeDirectory),
            opcode::MOVE_RESPONSE => Some(OperationKind::Move),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::ListDirectory => "list",
            OperationKind::Delete => "delete",
            OperationKind::MakeDirectory => "mkdir",
            OperationKind::Move => "move",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

fn describe_status(code: &u8) -> &'static str {
    status_message(*code)
}

/// 文件操作错误
///
/// 除 `Disconnected` 外，所有错误只终止当前这一个操作。
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Unknown command: 0x{0:02x}")]
    UnknownCommand(u8),

    #[error("Response 0x{0:02x} has no matching request")]
    InvalidInternalState(u8),

    #[error("Peripheral returned status {0}: {}", describe_status(.0))]
    StatusFailed(u8),

    #[error("Peripheral disconnected")]
    Disconnected,

    #[error("Characteristic not found: {0}")]
    InvalidCharacteristic(Uuid),

    #[error("Failed to enable notifications: {0}")]
    EnableNotifyFailed(String),

    #[error("A {0} operation is already in progress")]
    Busy(OperationKind),

    #[error("Path too long: {0} bytes")]
    PathTooLong(usize),

    #[error("File too large: {0} bytes")]
    FileTooLarge(u64),

    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}

impl TransferError {
    /// 外设报告文件系统只读
    pub fn is_read_only(&self) -> bool {
        matches!(self, TransferError::StatusFailed(code) if *code == crate::protocol::STATUS_READ_ONLY)
    }
}

impl From<FrameError> for TransferError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::UnknownCommand(command) => TransferError::UnknownCommand(command),
            FrameError::PathTooLong(len) => TransferError::PathTooLong(len),
            FrameError::InvalidData { .. } => TransferError::InvalidData(err.to_string()),
        }
    }
}
