//! ftlink Core Library
//!
//! 通过 BLE 或 Wifi (HTTP) 访问设备文件系统：列目录、读写、删除、移动、
//! 创建目录。
//!
//! # 模块
//!
//! - **protocol**: 二进制命令帧编解码和分片重组
//! - **transfer**: 每种文件操作的状态机和错误类型
//! - **ble**: BLE 会话、btleplug 链路和连接器
//! - **wifi**: HTTP 文件接口会话和连接器
//! - **manager**: 连接管理、自动重连、操作队列
//! - **config**: 超时和传输上限设置
//!
//! # 使用示例
//!
//! ```ignore
//! use ftlink_core::{ConnectionManager, Settings, TransportKind};
//!
//! let manager = ConnectionManager::new(Settings::load());
//!
//! // 1. 选中外设 (必要时建立连接)
//! manager
//!     .set_selected_peripheral("AA:BB:CC:DD:EE:FF", TransportKind::Ble)
//!     .await?;
//!
//! // 2. 文件操作在该外设的队列中依次执行
//! let entries = manager.list_directory("/").await?;
//! let code = manager.read_file("/code.py", None).await?;
//! manager.write_file("/code.py", code, None).await?;
//! ```

pub mod ble;
pub mod client;
pub mod config;
pub mod manager;
pub mod protocol;
pub mod transfer;
pub mod wifi;

// Client re-exports
pub use client::{FileTransferClient, SessionState, TransportKind};

// Config re-exports
pub use config::Settings;

// BLE re-exports
pub use ble::{
    BleConnector, BleFileTransferSession, BleLink, BtleplugLink, DATA_CHAR_UUID,
    FILE_TRANSFER_SERVICE_UUID, VERSION_CHAR_UUID,
};

// Wifi re-exports
pub use wifi::{HostVersion, NetworkError, WifiConnector, WifiFileTransferSession};

// Manager re-exports
pub use manager::{
    Command, CommandOutput, ConnectionError, ConnectionEvent, ConnectionManager, Connector,
    OperationQueue, PeripheralInfo,
};

// Transfer re-exports
pub use protocol::ProtocolVersion;
pub use transfer::{DirectoryEntry, EntryKind, OperationKind, ProgressFn, TransferError};
