//! Wifi (HTTP) 文件访问
//!
//! 设备在局域网上提供与 BLE 协议等价的 HTTP 文件接口：
//!
//! - `GET /cp/version.json`: 设备信息 ([`HostVersion`])
//! - `GET /fs/{path}`: 读取文件，目录 (以 `/` 结尾) 返回 JSON 列表
//! - `PUT /fs/{path}`: 写入文件，目录路径表示创建目录
//! - `DELETE /fs/{path}`: 删除文件或目录
//!
//! 认证使用 HTTP Basic，用户名为空。

pub mod session;

pub use session::{WifiConnector, WifiFileTransferSession};

use serde::{Deserialize, Serialize};

use crate::transfer::DirectoryEntry;
use crate::transfer::entry::time_from_nanos;

/// 网络错误
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Unexpected HTTP status {0}")]
    InvalidStatus(u16),

    #[error("Response contained no data")]
    NoData,

    #[error("Operation is not available over Wifi")]
    NotAvailable,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// `/cp/version.json` 返回的设备信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostVersion {
    pub web_api_version: u32,
    pub version: String,
    pub build_date: String,
    pub board_name: String,
    pub mcu_name: String,
    pub board_id: String,
    pub creator_id: u32,
    pub creation_id: u32,
    pub hostname: String,
    pub port: u16,
    pub ip: String,
}

/// 目录列表中的一项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonEntry {
    pub name: String,
    #[serde(default)]
    pub directory: bool,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub modified_ns: Option<u64>,
}

impl From<JsonEntry> for DirectoryEntry {
    fn from(entry: JsonEntry) -> Self {
        let modified = entry.modified_ns.map(time_from_nanos);
        if entry.directory {
            DirectoryEntry::directory(entry.name, modified)
        } else {
            DirectoryEntry::file(entry.name, entry.file_size, modified)
        }
    }
}

/// 目录列表
///
/// 旧版接口直接返回数组，新版返回 `{"free": …, "files": […]}`。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Listing {
    Entries(Vec<JsonEntry>),
    Object {
        #[serde(default)]
        free: Option<u64>,
        files: Vec<JsonEntry>,
    },
}

impl Listing {
    pub fn parse(body: &[u8]) -> Result<Self, NetworkError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(NetworkError::NoData);
        }
        Ok(serde_json::from_slice(body)?)
    }

    /// 剩余空间 (只有新版接口提供)
    pub fn free(&self) -> Option<u64> {
        match self {
            Listing::Entries(_) => None,
            Listing::Object { free, .. } => *free,
        }
    }

    pub fn into_entries(self) -> Vec<DirectoryEntry> {
        let files = match self {
            Listing::Entries(files) | Listing::Object { files, .. } => files,
        };
        files.into_iter().map(DirectoryEntry::from).collect()
    }
}
