//! 帧编解码
//!
//! 纯函数，不涉及 I/O 或状态。解码器在缓冲区不足一个完整帧时返回
//! [`Decoded::NeedMoreBytes`]，从不部分解析。

use super::{MAX_CHUNK_LEN, ProtocolVersion, READ_RESPONSE_HEADER_LEN, STATUS_OK, opcode};

/// 帧编解码错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Unknown command: 0x{0:02x}")]
    UnknownCommand(u8),

    #[error("Invalid data for command 0x{command:02x}: {reason}")]
    InvalidData { command: u8, reason: &'static str },

    #[error("Path too long: {0} bytes")]
    PathTooLong(usize),
}

/// 解码结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<T> {
    /// 完整帧及其占用的字节数
    Frame(T, usize),
    /// 缓冲区中的字节还不够一个完整帧
    NeedMoreBytes,
}

/// 客户端发往外设的命令帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Read {
        path: String,
        offset: u32,
        chunk_size: u32,
    },
    /// 请求进行中的读取的下一个分片
    ReadChunk { offset: u32, chunk_size: u32 },
    /// `timestamp_ns` 仅在协议版本 >= 3 时存在
    Write {
        path: String,
        offset: u32,
        total_size: u32,
        timestamp_ns: Option<u64>,
    },
    WriteChunk { offset: u32, data: Vec<u8> },
    Delete { path: String },
    MakeDirectory {
        path: String,
        timestamp_ns: Option<u64>,
    },
    ListDirectory { path: String },
    Move { from: String, to: String },
}

/// 外设返回的响应帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Read {
        status: u8,
        offset: u32,
        total_length: u32,
        data: Vec<u8>,
    },
    Write {
        status: u8,
        offset: u32,
        timestamp_ns: Option<u64>,
        free_space: u32,
    },
    Delete { status: u8 },
    MakeDirectory {
        status: u8,
        timestamp_ns: Option<u64>,
    },
    /// 列目录时每个条目一帧；`status` 表示目录是否存在
    ListDirectory {
        status: u8,
        entry_index: u32,
        entry_count: u32,
        flags: u32,
        timestamp_ns: u64,
        file_size: u32,
        path: String,
    },
    Move { status: u8 },
}

fn path_len(path: &str) -> Result<u16, FrameError> {
    u16::try_from(path.len()).map_err(|_| FrameError::PathTooLong(path.len()))
}

fn u16_at(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn u64_at(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

fn string_at(bytes: &[u8], at: usize, len: usize, command: u8) -> Result<String, FrameError> {
    String::from_utf8(bytes[at..at + len].to_vec()).map_err(|_| FrameError::InvalidData {
        command,
        reason: "path is not valid UTF-8",
    })
}

impl Request {
    /// 命令码
    pub fn command(&self) -> u8 {
        match self {
            Request::Read { .. } => opcode::READ,
            Request::ReadChunk { .. } => opcode::READ_CHUNK,
            Request::Write { .. } => opcode::WRITE,
            Request::WriteChunk { .. } => opcode::WRITE_CHUNK,
            Request::Delete { .. } => opcode::DELETE,
            Request::MakeDirectory { .. } => opcode::MAKE_DIRECTORY,
            Request::ListDirectory { .. } => opcode::LIST_DIRECTORY,
            Request::Move { .. } => opcode::MOVE,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let command = self.command();
        let mut out = Vec::new();
        match self {
            Request::Read {
                path,
                offset,
                chunk_size,
            } => {
                out.extend_from_slice(&[command, 0x00]);
                out.extend_from_slice(&path_len(path)?.to_le_bytes());
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(&chunk_size.to_le_bytes());
                out.extend_from_slice(path.as_bytes());
            }
            Request::ReadChunk { offset, chunk_size } => {
                out.extend_from_slice(&[command, STATUS_OK, 0x00, 0x00]);
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(&chunk_size.to_le_bytes());
            }
            Request::Write {
                path,
                offset,
                total_size,
                timestamp_ns,
            } => {
                out.extend_from_slice(&[command, 0x00]);
                out.extend_from_slice(&path_len(path)?.to_le_bytes());
                out.extend_from_slice(&offset.to_le_bytes());
                if let Some(ts) = timestamp_ns {
                    out.extend_from_slice(&ts.to_le_bytes());
                }
                out.extend_from_slice(&total_size.to_le_bytes());
                out.extend_from_slice(path.as_bytes());
            }
            Request::WriteChunk { offset, data } => {
                out.extend_from_slice(&[command, STATUS_OK, 0x00, 0x00]);
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                out.extend_from_slice(data);
            }
            Request::Delete { path } | Request::ListDirectory { path } => {
                out.extend_from_slice(&[command, 0x00]);
                out.extend_from_slice(&path_len(path)?.to_le_bytes());
                out.extend_from_slice(path.as_bytes());
            }
            Request::MakeDirectory { path, timestamp_ns } => {
                out.extend_from_slice(&[command, 0x00]);
                out.extend_from_slice(&path_len(path)?.to_le_bytes());
                if let Some(ts) = timestamp_ns {
                    out.extend_from_slice(&[0x00; 4]);
                    out.extend_from_slice(&ts.to_le_bytes());
                }
                out.extend_from_slice(path.as_bytes());
            }
            Request::Move { from, to } => {
                out.extend_from_slice(&[command, 0x00]);
                out.extend_from_slice(&path_len(from)?.to_le_bytes());
                out.extend_from_slice(&path_len(to)?.to_le_bytes());
                out.extend_from_slice(from.as_bytes());
                out.push(0x00);
                out.extend_from_slice(to.as_bytes());
            }
        }
        Ok(out)
    }

    /// 解码命令帧 (供外设端或模拟器使用)
    pub fn decode(bytes: &[u8], version: ProtocolVersion) -> Result<Decoded<Request>, FrameError> {
        let Some(&command) = bytes.first() else {
            return Ok(Decoded::NeedMoreBytes);
        };

        // (头部长度, 尾部长度) 在头部到齐之前无法得知尾部长度
        let header_len = match command {
            opcode::READ | opcode::READ_CHUNK | opcode::WRITE_CHUNK => 12,
            opcode::WRITE if version.has_timestamps() => 20,
            opcode::WRITE => 12,
            opcode::MAKE_DIRECTORY if version.has_timestamps() => 16,
            opcode::MAKE_DIRECTORY | opcode::DELETE | opcode::LIST_DIRECTORY => 4,
            opcode::MOVE => 6,
            other => return Err(FrameError::UnknownCommand(other)),
        };
        if bytes.len() < header_len {
            return Ok(Decoded::NeedMoreBytes);
        }

        let trailing = match command {
            opcode::READ_CHUNK => 0,
            opcode::WRITE_CHUNK => u32_at(bytes, 8) as usize,
            opcode::MOVE => u16_at(bytes, 2) as usize + 1 + u16_at(bytes, 4) as usize,
            _ => u16_at(bytes, 2) as usize,
        };
        let total = header_len + trailing;
        if bytes.len() < total {
            return Ok(Decoded::NeedMoreBytes);
        }

        let request = match command {
            opcode::READ => Request::Read {
                offset: u32_at(bytes, 4),
                chunk_size: u32_at(bytes, 8),
                path: string_at(bytes, header_len, trailing, command)?,
            },
            opcode::READ_CHUNK => Request::ReadChunk {
                offset: u32_at(bytes, 4),
                chunk_size: u32_at(bytes, 8),
            },
            opcode::WRITE => {
                let (timestamp_ns, total_size) = if version.has_timestamps() {
                    (Some(u64_at(bytes, 8)), u32_at(bytes, 16))
                } else {
                    (None, u32_at(bytes, 8))
                };
                Request::Write {
                    offset: u32_at(bytes, 4),
                    total_size,
                    timestamp_ns,
                    path: string_at(bytes, header_len, trailing, command)?,
                }
            }
            opcode::WRITE_CHUNK => Request::WriteChunk {
                offset: u32_at(bytes, 4),
                data: bytes[header_len..total].to_vec(),
            },
            opcode::DELETE => Request::Delete {
                path: string_at(bytes, header_len, trailing, command)?,
            },
            opcode::MAKE_DIRECTORY => Request::MakeDirectory {
                timestamp_ns: version.has_timestamps().then(|| u64_at(bytes, 8)),
                path: string_at(bytes, header_len, trailing, command)?,
            },
            opcode::LIST_DIRECTORY => Request::ListDirectory {
                path: string_at(bytes, header_len, trailing, command)?,
            },
            _ => {
                let from_len = u16_at(bytes, 2) as usize;
                let to_len = u16_at(bytes, 4) as usize;
                Request::Move {
                    from: string_at(bytes, header_len, from_len, command)?,
                    to: string_at(bytes, header_len + from_len + 1, to_len, command)?,
                }
            }
        };
        Ok(Decoded::Frame(request, total))
    }
}

impl Response {
    /// 响应命令码
    pub fn command(&self) -> u8 {
        match self {
            Response::Read { .. } => opcode::READ_RESPONSE,
            Response::Write { .. } => opcode::WRITE_RESPONSE,
            Response::Delete { .. } => opcode::DELETE_RESPONSE,
            Response::MakeDirectory { .. } => opcode::MAKE_DIRECTORY_RESPONSE,
            Response::ListDirectory { .. } => opcode::LIST_DIRECTORY_RESPONSE,
            Response::Move { .. } => opcode::MOVE_RESPONSE,
        }
    }

    pub fn status(&self) -> u8 {
        match self {
            Response::Read { status, .. }
            | Response::Write { status, .. }
            | Response::Delete { status }
            | Response::MakeDirectory { status, .. }
            | Response::ListDirectory { status, .. }
            | Response::Move { status } => *status,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status() == STATUS_OK
    }

    /// 编码响应帧 (供外设端或模拟器使用)
    ///
    /// 时间戳为 `None` 时使用旧版 (< 3) 的短头部布局。
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut out = vec![self.command(), self.status()];
        match self {
            Response::Read {
                offset,
                total_length,
                data,
                ..
            } => {
                out.extend_from_slice(&[0x00; 2]);
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(&total_length.to_le_bytes());
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                out.extend_from_slice(data);
            }
            Response::Write {
                offset,
                timestamp_ns,
                free_space,
                ..
            } => {
                out.extend_from_slice(&[0x00; 2]);
                out.extend_from_slice(&offset.to_le_bytes());
                if let Some(ts) = timestamp_ns {
                    out.extend_from_slice(&ts.to_le_bytes());
                }
                out.extend_from_slice(&free_space.to_le_bytes());
            }
            Response::MakeDirectory { timestamp_ns, .. } => {
                if let Some(ts) = timestamp_ns {
                    out.extend_from_slice(&[0x00; 6]);
                    out.extend_from_slice(&ts.to_le_bytes());
                }
            }
            Response::ListDirectory {
                entry_index,
                entry_count,
                flags,
                timestamp_ns,
                file_size,
                path,
                ..
            } => {
                out.extend_from_slice(&path_len(path)?.to_le_bytes());
                out.extend_from_slice(&entry_index.to_le_bytes());
                out.extend_from_slice(&entry_count.to_le_bytes());
                out.extend_from_slice(&flags.to_le_bytes());
                out.extend_from_slice(&timestamp_ns.to_le_bytes());
                out.extend_from_slice(&file_size.to_le_bytes());
                out.extend_from_slice(path.as_bytes());
            }
            Response::Delete { .. } | Response::Move { .. } => {}
        }
        Ok(out)
    }
}

/// 响应头部的最小长度
pub fn response_header_len(command: u8, version: ProtocolVersion) -> Option<usize> {
    let len = match command {
        opcode::READ_RESPONSE => READ_RESPONSE_HEADER_LEN,
        opcode::WRITE_RESPONSE if version.has_timestamps() => 20,
        opcode::WRITE_RESPONSE => 12,
        opcode::DELETE_RESPONSE | opcode::MOVE_RESPONSE => 2,
        opcode::MAKE_DIRECTORY_RESPONSE if version.has_timestamps() => 16,
        opcode::MAKE_DIRECTORY_RESPONSE => 2,
        opcode::LIST_DIRECTORY_RESPONSE => 28,
        _ => return None,
    };
    Some(len)
}

/// 从缓冲区头部解码一个响应帧
///
/// 返回的字节数恰好是该帧的长度 (头部 + 分片数据或路径)，
/// 缓冲区中其后的字节不受影响。
pub fn decode_response(
    bytes: &[u8],
    version: ProtocolVersion,
) -> Result<Decoded<Response>, FrameError> {
    let Some(&command) = bytes.first() else {
        return Ok(Decoded::NeedMoreBytes);
    };
    let header_len =
        response_header_len(command, version).ok_or(FrameError::UnknownCommand(command))?;
    if bytes.len() < header_len {
        return Ok(Decoded::NeedMoreBytes);
    }
    let status = bytes[1];

    let decoded = match command {
        opcode::READ_RESPONSE => {
            let chunk_len = u32_at(bytes, 12);
            if chunk_len > MAX_CHUNK_LEN {
                return Err(FrameError::InvalidData {
                    command,
                    reason: "chunk length exceeds limit",
                });
            }
            let total = header_len + chunk_len as usize;
            if bytes.len() < total {
                return Ok(Decoded::NeedMoreBytes);
            }
            let response = Response::Read {
                status,
                offset: u32_at(bytes, 4),
                total_length: u32_at(bytes, 8),
                data: bytes[header_len..total].to_vec(),
            };
            Decoded::Frame(response, total)
        }
        opcode::WRITE_RESPONSE => {
            let (timestamp_ns, free_space) = if version.has_timestamps() {
                (Some(u64_at(bytes, 8)), u32_at(bytes, 16))
            } else {
                (None, u32_at(bytes, 8))
            };
            let response = Response::Write {
                status,
                offset: u32_at(bytes, 4),
                timestamp_ns,
                free_space,
            };
            Decoded::Frame(response, header_len)
        }
        opcode::DELETE_RESPONSE => Decoded::Frame(Response::Delete { status }, header_len),
        opcode::MOVE_RESPONSE => Decoded::Frame(Response::Move { status }, header_len),
        opcode::MAKE_DIRECTORY_RESPONSE => {
            let response = Response::MakeDirectory {
                status,
                timestamp_ns: version.has_timestamps().then(|| u64_at(bytes, 8)),
            };
            Decoded::Frame(response, header_len)
        }
        _ => {
            let path_len = u16_at(bytes, 2) as usize;
            let total = header_len + path_len;
            if bytes.len() < total {
                return Ok(Decoded::NeedMoreBytes);
            }
            let response = Response::ListDirectory {
                status,
                entry_index: u32_at(bytes, 4),
                entry_count: u32_at(bytes, 8),
                flags: u32_at(bytes, 12),
                timestamp_ns: u64_at(bytes, 16),
                file_size: u32_at(bytes, 24),
                path: string_at(bytes, header_len, path_len, command)?,
            };
            Decoded::Frame(response, total)
        }
    };
    Ok(decoded)
}
