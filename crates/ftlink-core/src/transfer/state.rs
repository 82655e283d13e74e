//! 传输操作状态机
//!
//! 协议是严格有序的请求/响应，没有请求 ID，因此每种操作在一个会话中
//! 最多只能有一个进行中的实例。每个解码出的响应帧推进对应的状态，
//! 需要发送的后续请求 (读取下一分片、写入下一分片) 放入 `outbox`，
//! 由会话在释放锁之后发出。

use log::{debug, error, warn};
use std::time::SystemTime;
use tokio::sync::oneshot;

use super::entry::time_from_nanos;
use super::{DirectoryEntry, OperationKind, ProgressFn, TransferError};
use crate::protocol::{
    Consumed, Decoded, FrameError, ProtocolVersion, READ_RESPONSE_HEADER_LEN, Request, Response,
    STATUS_OK, decode_response,
};

type Completion<T> = oneshot::Sender<Result<T, TransferError>>;
pub type Pending<T> = oneshot::Receiver<Result<T, TransferError>>;

/// 解码响应所需的会话参数
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    pub version: ProtocolVersion,
    /// 后续读取分片请求的大小
    pub read_chunk_size: u32,
    /// 外设声明的文件总长度上限
    pub max_file_size: u64,
}

impl FrameContext {
    pub fn new(version: ProtocolVersion, max_write_len: usize, max_file_size: u64) -> Self {
        let read_chunk_size = max_write_len.saturating_sub(READ_RESPONSE_HEADER_LEN).max(1);
        Self {
            version,
            read_chunk_size: read_chunk_size as u32,
            max_file_size,
        }
    }
}

struct ReadState {
    data: Vec<u8>,
    progress: Option<ProgressFn>,
    completion: Completion<Vec<u8>>,
}

struct WriteState {
    data: Vec<u8>,
    progress: Option<ProgressFn>,
    completion: Completion<Option<SystemTime>>,
}

struct ListState {
    entries: Vec<DirectoryEntry>,
    completion: Completion<Option<Vec<DirectoryEntry>>>,
}

/// 一个会话的全部进行中操作
#[derive(Default)]
pub struct TransferStates {
    read: Option<ReadState>,
    write: Option<WriteState>,
    list: Option<ListState>,
    delete: Option<Completion<()>>,
    make_directory: Option<Completion<Option<SystemTime>>>,
    move_: Option<Completion<()>>,
}

fn occupy<S>(slot: &mut Option<S>, kind: OperationKind, state: S) -> Result<(), TransferError> {
    if slot.is_some() {
        warn!("Rejecting {} request: one is already outstanding", kind);
        return Err(TransferError::Busy(kind));
    }
    *slot = Some(state);
    Ok(())
}

fn complete<T>(completion: Completion<T>, result: Result<T, TransferError>) {
    if completion.send(result).is_err() {
        debug!("Operation caller went away before completion");
    }
}

fn status_result(status: u8) -> Result<(), TransferError> {
    if status == STATUS_OK {
        Ok(())
    } else {
        Err(TransferError::StatusFailed(status))
    }
}

impl TransferStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_read(
        &mut self,
        progress: Option<ProgressFn>,
    ) -> Result<Pending<Vec<u8>>, TransferError> {
        let (tx, rx) = oneshot::channel();
        let state = ReadState {
            data: Vec::new(),
            progress,
            completion: tx,
        };
        occupy(&mut self.read, OperationKind::Read, state)?;
        Ok(rx)
    }

    pub fn begin_write(
        &mut self,
        data: Vec<u8>,
        progress: Option<ProgressFn>,
    ) -> Result<Pending<Option<SystemTime>>, TransferError> {
        let (tx, rx) = oneshot::channel();
        let state = WriteState {
            data,
            progress,
            completion: tx,
        };
        occupy(&mut self.write, OperationKind::Write, state)?;
        Ok(rx)
    }

    pub fn begin_list(&mut self) -> Result<Pending<Option<Vec<DirectoryEntry>>>, TransferError> {
        let (tx, rx) = oneshot::channel();
        let state = ListState {
            entries: Vec::new(),
            completion: tx,
        };
        occupy(&mut self.list, OperationKind::ListDirectory, state)?;
        Ok(rx)
    }

    pub fn begin_delete(&mut self) -> Result<Pending<()>, TransferError> {
        let (tx, rx) = oneshot::channel();
        occupy(&mut self.delete, OperationKind::Delete, tx)?;
        Ok(rx)
    }

    pub fn begin_make_directory(&mut self) -> Result<Pending<Option<SystemTime>>, TransferError> {
        let (tx, rx) = oneshot::channel();
        occupy(&mut self.make_directory, OperationKind::MakeDirectory, tx)?;
        Ok(rx)
    }

    pub fn begin_move(&mut self) -> Result<Pending<()>, TransferError> {
        let (tx, rx) = oneshot::channel();
        occupy(&mut self.move_, OperationKind::Move, tx)?;
        Ok(rx)
    }

    /// 是否存在该种类的进行中操作
    pub fn is_outstanding(&self, kind: OperationKind) -> bool {
        match kind {
            OperationKind::Read => self.read.is_some(),
            OperationKind::Write => self.write.is_some(),
            OperationKind::ListDirectory => self.list.is_some(),
            OperationKind::Delete => self.delete.is_some(),
            OperationKind::MakeDirectory => self.make_directory.is_some(),
            OperationKind::Move => self.move_.is_some(),
        }
    }

    pub fn outstanding(&self) -> Vec<OperationKind> {
        OperationKind::ALL
            .into_iter()
            .filter(|kind| self.is_outstanding(*kind))
            .collect()
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding().is_empty()
    }

    /// 以指定错误结束某个操作并清除其状态
    pub fn fail(&mut self, kind: OperationKind, err: TransferError) {
        match kind {
            OperationKind::Read => {
                if let Some(state) = self.read.take() {
                    complete(state.completion, Err(err));
                }
            }
            OperationKind::Write => {
                if let Some(state) = self.write.take() {
                    complete(state.completion, Err(err));
                }
            }
            OperationKind::ListDirectory => {
                if let Some(state) = self.list.take() {
                    complete(state.completion, Err(err));
                }
            }
            OperationKind::Delete => {
                if let Some(tx) = self.delete.take() {
                    complete(tx, Err(err));
                }
            }
            OperationKind::MakeDirectory => {
                if let Some(tx) = self.make_directory.take() {
                    complete(tx, Err(err));
                }
            }
            OperationKind::Move => {
                if let Some(tx) = self.move_.take() {
                    complete(tx, Err(err));
                }
            }
        }
    }

    /// 结束所有进行中的操作 (断开连接、缓冲区失步)
    pub fn fail_all<F>(&mut self, make_err: F)
    where
        F: Fn() -> TransferError,
    {
        for kind in self.outstanding() {
            debug!("Failing outstanding {} operation", kind);
            self.fail(kind, make_err());
        }
    }

    /// 处理重组缓冲区头部的字节
    ///
    /// 返回值交给 [`crate::protocol::ChunkQueue`] 决定如何推进缓冲区。
    pub fn handle_frame(
        &mut self,
        bytes: &[u8],
        ctx: &FrameContext,
        outbox: &mut Vec<Request>,
    ) -> Consumed {
        match decode_response(bytes, ctx.version) {
            Ok(Decoded::NeedMoreBytes) => Consumed::NeedMore,
            Ok(Decoded::Frame(response, len)) => self.apply(response, len, ctx, outbox),
            Err(FrameError::UnknownCommand(command)) => {
                error!("Unknown command 0x{:02x}, dropping buffered data", command);
                self.fail_all(|| TransferError::UnknownCommand(command));
                Consumed::InvalidateAll
            }
            Err(err) => {
                error!("Failed to decode response: {}", err);
                let command = bytes.first().copied().unwrap_or_default();
                match OperationKind::from_response(command) {
                    Some(kind) => self.fail(kind, err.into()),
                    None => self.fail_all(|| TransferError::InvalidData(err.to_string())),
                }
                Consumed::InvalidateAll
            }
        }
    }

    fn unmatched(&mut self, command: u8) -> Consumed {
        error!(
            "Received response 0x{:02x} with no matching request",
            command
        );
        self.fail_all(|| TransferError::InvalidInternalState(command));
        Consumed::InvalidateAll
    }

    fn apply(
        &mut self,
        response: Response,
        len: usize,
        ctx: &FrameContext,
        outbox: &mut Vec<Request>,
    ) -> Consumed {
        let command = response.command();
        match response {
            Response::Read {
                status,
                offset,
                total_length,
                data,
            } => {
                let Some(state) = self.read.take() else {
                    return self.unmatched(command);
                };
                self.on_read(state, status, offset, total_length, &data, ctx, outbox)
                    .map_or(Consumed::InvalidateAll, |()| Consumed::Bytes(len))
            }
            Response::Write {
                status,
                offset,
                timestamp_ns,
                free_space,
            } => {
                let Some(state) = self.write.take() else {
                    return self.unmatched(command);
                };
                self.on_write(state, status, offset, timestamp_ns, free_space, outbox);
                Consumed::Bytes(len)
            }
            Response::ListDirectory {
                status,
                entry_index,
                entry_count,
                flags,
                timestamp_ns,
                file_size,
                path,
            } => {
                let Some(mut state) = self.list.take() else {
                    return self.unmatched(command);
                };
                if status != STATUS_OK {
                    debug!("Directory does not exist");
                    complete(state.completion, Ok(None));
                } else if entry_count == 0 {
                    complete(state.completion, Ok(Some(Vec::new())));
                } else {
                    let timestamp = ctx.version.has_timestamps().then_some(timestamp_ns);
                    state
                        .entries
                        .push(DirectoryEntry::from_wire(path, flags, file_size, timestamp));
                    if entry_index.saturating_add(1) >= entry_count {
                        complete(state.completion, Ok(Some(state.entries)));
                    } else {
                        self.list = Some(state);
                    }
                }
                Consumed::Bytes(len)
            }
            Response::Delete { status } => {
                let Some(tx) = self.delete.take() else {
                    return self.unmatched(command);
                };
                complete(tx, status_result(status));
                Consumed::Bytes(len)
            }
            Response::Move { status } => {
                let Some(tx) = self.move_.take() else {
                    return self.unmatched(command);
                };
                complete(tx, status_result(status));
                Consumed::Bytes(len)
            }
            Response::MakeDirectory {
                status,
                timestamp_ns,
            } => {
                let Some(tx) = self.make_directory.take() else {
                    return self.unmatched(command);
                };
                complete(
                    tx,
                    status_result(status).map(|()| timestamp_ns.map(time_from_nanos)),
                );
                Consumed::Bytes(len)
            }
        }
    }

    /// 读取响应；返回 `Err(())` 表示剩余缓冲数据需要丢弃
    #[allow(clippy::too_many_arguments)]
    fn on_read(
        &mut self,
        mut state: ReadState,
        status: u8,
        offset: u32,
        total_length: u32,
        data: &[u8],
        ctx: &FrameContext,
        outbox: &mut Vec<Request>,
    ) -> Result<(), ()> {
        if status != STATUS_OK {
            complete(state.completion, Err(TransferError::StatusFailed(status)));
            return Err(());
        }
        let total = u64::from(total_length);
        if total > ctx.max_file_size {
            complete(state.completion, Err(TransferError::FileTooLarge(total)));
            return Err(());
        }
        if offset as usize != state.data.len() {
            complete(
                state.completion,
                Err(TransferError::InvalidData(format!(
                    "read chunk at offset {} but {} bytes received so far",
                    offset,
                    state.data.len()
                ))),
            );
            return Err(());
        }

        state.data.extend_from_slice(data);
        let received = state.data.len() as u64;
        if let Some(progress) = &state.progress {
            progress(received.min(total), total);
        }

        if received >= total {
            debug!("Read complete: {} bytes", received);
            complete(state.completion, Ok(state.data));
        } else if data.is_empty() {
            complete(
                state.completion,
                Err(TransferError::InvalidData(
                    "empty read chunk before end of file".to_string(),
                )),
            );
            return Err(());
        } else {
            outbox.push(Request::ReadChunk {
                offset: received as u32,
                chunk_size: ctx.read_chunk_size,
            });
            self.read = Some(state);
        }
        Ok(())
    }

    fn on_write(
        &mut self,
        state: WriteState,
        status: u8,
        offset: u32,
        timestamp_ns: Option<u64>,
        free_space: u32,
        outbox: &mut Vec<Request>,
    ) {
        if status != STATUS_OK {
            complete(state.completion, Err(TransferError::StatusFailed(status)));
            return;
        }

        let total = state.data.len();
        let offset = offset as usize;
        if let Some(progress) = &state.progress {
            progress(offset.min(total) as u64, total as u64);
        }

        if offset >= total {
            debug!("Write complete: {} bytes", total);
            complete(state.completion, Ok(timestamp_ns.map(time_from_nanos)));
        } else if free_space == 0 {
            complete(
                state.completion,
                Err(TransferError::InvalidData(
                    "peripheral reported no free space".to_string(),
                )),
            );
        } else {
            let end = offset.saturating_add(free_space as usize).min(total);
            outbox.push(Request::WriteChunk {
                offset: offset as u32,
                data: state.data[offset..end].to_vec(),
            });
            self.write = Some(state);
        }
    }
}
