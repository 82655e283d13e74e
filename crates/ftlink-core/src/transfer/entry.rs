use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 目录条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File { size: u64 },
    Directory,
}

/// 目录条目，构造后不可变
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub kind: EntryKind,
    pub modified: Option<SystemTime>,
}

/// 列目录响应中 flags 的第 0 位表示目录
const FLAG_DIRECTORY: u32 = 0x01;

impl DirectoryEntry {
    pub fn file(name: impl Into<String>, size: u64, modified: Option<SystemTime>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File { size },
            modified,
        }
    }

    pub fn directory(name: impl Into<String>, modified: Option<SystemTime>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Directory,
            modified,
        }
    }

    /// 从列目录响应帧的字段构造
    pub fn from_wire(name: String, flags: u32, file_size: u32, timestamp_ns: Option<u64>) -> Self {
        let modified = timestamp_ns.map(time_from_nanos);
        if flags & FLAG_DIRECTORY != 0 {
            Self::directory(name, modified)
        } else {
            Self::file(name, u64::from(file_size), modified)
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, EntryKind::Directory)
    }

    /// 文件大小，目录返回 `None`
    pub fn size(&self) -> Option<u64> {
        match self.kind {
            EntryKind::File { size } => Some(size),
            EntryKind::Directory => None,
        }
    }
}

/// 纳秒时间戳转换为 `SystemTime`
pub fn time_from_nanos(nanos: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(nanos)
}

/// 当前时间的纳秒时间戳，用于写入和创建目录
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
