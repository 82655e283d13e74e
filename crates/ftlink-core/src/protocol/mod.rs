//! 文件传输二进制协议
//!
//! 包含:
//! - 帧编解码 (所有字段均为小端序)
//! - 分片重组队列 (BLE 通知可能拆分或合并帧)
//!
//! # 帧格式
//!
//! 请求的第一个字节是命令码，响应使用命令码 + 1。
//! 头部长度由命令码决定，因此无需额外的帧边界标记。

pub mod codec;
pub mod reassembly;

pub use codec::{Decoded, FrameError, Request, Response, decode_response};
pub use reassembly::{ChunkQueue, Consumed, Drained};

/// 命令码
pub mod opcode {
    pub const READ: u8 = 0x10;
    pub const READ_RESPONSE: u8 = 0x11;
    pub const READ_CHUNK: u8 = 0x12;
    pub const WRITE: u8 = 0x20;
    pub const WRITE_RESPONSE: u8 = 0x21;
    pub const WRITE_CHUNK: u8 = 0x22;
    pub const DELETE: u8 = 0x30;
    pub const DELETE_RESPONSE: u8 = 0x31;
    pub const MAKE_DIRECTORY: u8 = 0x40;
    pub const MAKE_DIRECTORY_RESPONSE: u8 = 0x41;
    pub const LIST_DIRECTORY: u8 = 0x50;
    pub const LIST_DIRECTORY_RESPONSE: u8 = 0x51;
    pub const MOVE: u8 = 0x60;
    pub const MOVE_RESPONSE: u8 = 0x61;
}

/// 状态码: 成功
pub const STATUS_OK: u8 = 0x01;
/// 状态码: 文件系统只读 (写入/创建目录时)
pub const STATUS_READ_ONLY: u8 = 0x05;

/// 单个读取分片允许的最大长度，超过视为数据损坏
pub const MAX_CHUNK_LEN: u32 = 64 * 1024;

/// 读取响应头部长度
pub const READ_RESPONSE_HEADER_LEN: usize = 16;
/// 写入分片请求头部长度
pub const WRITE_CHUNK_HEADER_LEN: usize = 12;

/// 外设报告的协议版本
///
/// 版本特征不存在时默认为 1。版本 >= 3 的固件在写入和创建目录
/// 帧中携带 64 位纳秒时间戳。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(pub u32);

impl ProtocolVersion {
    pub const DEFAULT: ProtocolVersion = ProtocolVersion(1);

    /// 写入/创建目录帧是否包含时间戳字段
    pub fn has_timestamps(self) -> bool {
        self.0 >= 3
    }

    /// 解析版本特征的值 (4 字节小端整数)
    pub fn from_characteristic(value: &[u8]) -> Option<Self> {
        let bytes: [u8; 4] = value.get(..4)?.try_into().ok()?;
        Some(Self(u32::from_le_bytes(bytes)))
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// 状态码对应的说明文字
pub fn status_message(code: u8) -> &'static str {
    match code {
        STATUS_OK => "ok",
        STATUS_READ_ONLY => "filesystem is read-only",
        _ => "operation failed on peripheral",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_gating() {
        assert!(!ProtocolVersion(1).has_timestamps());
        assert!(!ProtocolVersion(2).has_timestamps());
        assert!(ProtocolVersion(3).has_timestamps());
        assert!(ProtocolVersion(4).has_timestamps());
    }

    #[test]
    fn test_version_from_characteristic() {
        assert_eq!(
            ProtocolVersion::from_characteristic(&[3, 0, 0, 0]),
            Some(ProtocolVersion(3))
        );
        assert_eq!(ProtocolVersion::from_characteristic(&[3, 0]), None);
        assert_eq!(ProtocolVersion::default(), ProtocolVersion(1));
    }
}
