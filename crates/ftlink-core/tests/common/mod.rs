//! 测试用的模拟外设
//!
//! 在内存中模拟设备文件系统，解析客户端写入的命令帧，把响应帧按
//! 20 字节切成多个通知发回。

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use ftlink_core::ble::NotificationStream;
use ftlink_core::protocol::{Decoded, ProtocolVersion, Request, Response, STATUS_OK, STATUS_READ_ONLY};
use ftlink_core::{BleLink, TransferError};

pub const NOTIFY_LEN: usize = 20;
const STATUS_ERROR: u8 = 0x02;
/// 模拟外设每次接收的最大写入长度
pub const WRITE_WINDOW: u32 = 64;

struct PendingWrite {
    path: String,
    total: usize,
    data: Vec<u8>,
    timestamp_ns: Option<u64>,
}

struct State {
    version: Option<u32>,
    files: BTreeMap<String, (Vec<u8>, u64)>,
    dirs: BTreeSet<String>,
    read_only: bool,
    /// 收到请求后不回复
    silent: bool,
    fail_connect: bool,
    fail_discover: bool,
    fail_notify: bool,
    discover_delay: Duration,
    connects: usize,
    disconnects: usize,
    connected: bool,
    incoming: Vec<u8>,
    reading: Option<String>,
    writing: Option<PendingWrite>,
    requests: Vec<Request>,
    notify: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

#[derive(Clone)]
pub struct FakePeripheral {
    address: String,
    state: Arc<Mutex<State>>,
}

fn parent(path: &str) -> String {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => path[..i].to_string(),
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

impl FakePeripheral {
    pub fn new(address: &str, version: Option<u32>) -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert("/".to_string());
        Self {
            address: address.to_string(),
            state: Arc::new(Mutex::new(State {
                version,
                files: BTreeMap::new(),
                dirs,
                read_only: false,
                silent: false,
                fail_connect: false,
                fail_discover: false,
                fail_notify: false,
                discover_delay: Duration::ZERO,
                connects: 0,
                disconnects: 0,
                connected: false,
                incoming: Vec::new(),
                reading: None,
                writing: None,
                requests: Vec::new(),
                notify: None,
            })),
        }
    }

    pub fn with_file(self, path: &str, data: &[u8]) -> Self {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), (data.to_vec(), 1_000_000_000));
        self
    }

    pub fn with_dir(self, path: &str) -> Self {
        self.state.lock().unwrap().dirs.insert(path.to_string());
        self
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.state.lock().unwrap().read_only = read_only;
    }

    pub fn set_silent(&self, silent: bool) {
        self.state.lock().unwrap().silent = silent;
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.state.lock().unwrap().fail_connect = fail;
    }

    pub fn set_fail_discover(&self, fail: bool) {
        self.state.lock().unwrap().fail_discover = fail;
    }

    pub fn set_fail_notify(&self, fail: bool) {
        self.state.lock().unwrap().fail_notify = fail;
    }

    /// 服务发现阶段的耗时
    pub fn set_discover_delay(&self, delay: Duration) {
        self.state.lock().unwrap().discover_delay = delay;
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state.lock().unwrap().disconnects
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).map(|(d, _)| d.clone())
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.state.lock().unwrap().dirs.contains(path)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.state.lock().unwrap().requests.clone()
    }

    /// 模拟链路断开：通知流结束
    pub fn drop_connection(&self) {
        self.state.lock().unwrap().notify = None;
    }

    /// 直接推送原始通知字节
    pub fn push_raw(&self, bytes: &[u8]) {
        if let Some(notify) = &self.state.lock().unwrap().notify {
            let _ = notify.send(bytes.to_vec());
        }
    }

    fn version(state: &State) -> ProtocolVersion {
        state.version.map(ProtocolVersion).unwrap_or_default()
    }

    fn respond(state: &mut State, request: Request) -> Vec<Response> {
        let version = Self::version(state);
        let timestamp = version.has_timestamps().then_some(2_000_000_000u64);
        let writable_status = if state.read_only { STATUS_READ_ONLY } else { STATUS_OK };

        match request {
            Request::Read {
                path,
                offset,
                chunk_size,
            } => {
                if state.files.contains_key(&path) {
                    state.reading = Some(path.clone());
                }
                vec![Self::read_chunk(state, &path, offset, chunk_size)]
            }
            Request::ReadChunk { offset, chunk_size } => {
                let path = state.reading.clone().unwrap_or_default();
                vec![Self::read_chunk(state, &path, offset, chunk_size)]
            }
            Request::Write {
                path,
                offset,
                total_size,
                timestamp_ns,
            } => {
                if state.read_only {
                    return vec![Response::Write {
                        status: STATUS_READ_ONLY,
                        offset,
                        timestamp_ns: timestamp,
                        free_space: 0,
                    }];
                }
                let pending = PendingWrite {
                    path,
                    total: total_size as usize,
                    data: Vec::new(),
                    timestamp_ns,
                };
                Self::write_progress(state, pending)
            }
            Request::WriteChunk { data, .. } => match state.writing.take() {
                Some(mut pending) => {
                    pending.data.extend_from_slice(&data);
                    Self::write_progress(state, pending)
                }
                None => vec![Response::Write {
                    status: STATUS_ERROR,
                    offset: 0,
                    timestamp_ns: timestamp,
                    free_space: 0,
                }],
            },
            Request::Delete { path } => {
                let status = if state.read_only {
                    STATUS_READ_ONLY
                } else if state.files.remove(&path).is_some() || state.dirs.remove(&normalize(&path)) {
                    STATUS_OK
                } else {
                    STATUS_ERROR
                };
                vec![Response::Delete { status }]
            }
            Request::MakeDirectory { path, timestamp_ns } => {
                let status = if writable_status == STATUS_OK {
                    state.dirs.insert(normalize(&path));
                    STATUS_OK
                } else {
                    writable_status
                };
                vec![Response::MakeDirectory {
                    status,
                    timestamp_ns: version.has_timestamps().then(|| timestamp_ns.unwrap_or(0)),
                }]
            }
            Request::ListDirectory { path } => Self::list(state, &normalize(&path), version),
            Request::Move { from, to } => {
                let status = if state.read_only {
                    STATUS_READ_ONLY
                } else if let Some(file) = state.files.remove(&from) {
                    state.files.insert(to, file);
                    STATUS_OK
                } else {
                    STATUS_ERROR
                };
                vec![Response::Move { status }]
            }
        }
    }

    fn read_chunk(state: &State, path: &str, offset: u32, chunk_size: u32) -> Response {
        match state.files.get(path) {
            Some((data, _)) => {
                let start = (offset as usize).min(data.len());
                let end = (start + chunk_size as usize).min(data.len());
                Response::Read {
                    status: STATUS_OK,
                    offset,
                    total_length: data.len() as u32,
                    data: data[start..end].to_vec(),
                }
            }
            None => Response::Read {
                status: STATUS_ERROR,
                offset,
                total_length: 0,
                data: Vec::new(),
            },
        }
    }

    fn write_progress(state: &mut State, pending: PendingWrite) -> Vec<Response> {
        let version = Self::version(state);
        let offset = pending.data.len();
        let timestamp = version
            .has_timestamps()
            .then(|| pending.timestamp_ns.unwrap_or(0));
        if offset >= pending.total {
            state
                .files
                .insert(pending.path.clone(), (pending.data, pending.timestamp_ns.unwrap_or(0)));
            return vec![Response::Write {
                status: STATUS_OK,
                offset: offset as u32,
                timestamp_ns: timestamp,
                free_space: 0,
            }];
        }
        let free_space = WRITE_WINDOW.min((pending.total - offset) as u32);
        state.writing = Some(pending);
        vec![Response::Write {
            status: STATUS_OK,
            offset: offset as u32,
            timestamp_ns: timestamp,
            free_space,
        }]
    }

    fn list(state: &State, dir: &str, version: ProtocolVersion) -> Vec<Response> {
        if !state.dirs.contains(dir) {
            return vec![Response::ListDirectory {
                status: STATUS_ERROR,
                entry_index: 0,
                entry_count: 0,
                flags: 0,
                timestamp_ns: 0,
                file_size: 0,
                path: String::new(),
            }];
        }

        let mut entries: Vec<(String, u32, u64, u32)> = Vec::new();
        for sub in state.dirs.iter().filter(|d| d.as_str() != "/" && parent(d) == dir) {
            let name = sub.rsplit('/').next().unwrap_or_default().to_string();
            entries.push((name, 1, 0, 0));
        }
        for (path, (data, ts)) in state.files.iter().filter(|(p, _)| parent(p) == dir) {
            let name = path.rsplit('/').next().unwrap_or_default().to_string();
            entries.push((name, 0, *ts, data.len() as u32));
        }

        if entries.is_empty() {
            return vec![Response::ListDirectory {
                status: STATUS_OK,
                entry_index: 0,
                entry_count: 0,
                flags: 0,
                timestamp_ns: 0,
                file_size: 0,
                path: String::new(),
            }];
        }

        let count = entries.len() as u32;
        entries
            .into_iter()
            .enumerate()
            .map(|(i, (name, flags, ts, size))| Response::ListDirectory {
                status: STATUS_OK,
                entry_index: i as u32,
                entry_count: count,
                flags,
                timestamp_ns: if version.has_timestamps() { ts } else { 0 },
                file_size: size,
                path: name,
            })
            .collect()
    }
}

#[async_trait]
impl BleLink for FakePeripheral {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn max_write_len(&self) -> usize {
        NOTIFY_LEN + 16
    }

    async fn connect(&self) -> Result<(), TransferError> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if state.fail_connect {
            return Err(TransferError::Disconnected);
        }
        state.connected = true;
        Ok(())
    }

    async fn discover(&self) -> Result<(), TransferError> {
        let (delay, fail) = {
            let state = self.state.lock().unwrap();
            (state.discover_delay, state.fail_discover)
        };
        tokio::time::sleep(delay).await;
        if fail {
            return Err(TransferError::InvalidCharacteristic(ftlink_core::DATA_CHAR_UUID));
        }
        Ok(())
    }

    async fn read_version(&self) -> Result<Option<ProtocolVersion>, TransferError> {
        Ok(self.state.lock().unwrap().version.map(ProtocolVersion))
    }

    async fn enable_notifications(&self) -> Result<NotificationStream, TransferError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_notify {
            return Err(TransferError::EnableNotifyFailed("subscribe rejected".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.notify = Some(tx);
        state.incoming.clear();
        state.reading = None;
        state.writing = None;
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn write(&self, frame: &[u8]) -> Result<(), TransferError> {
        let mut state = self.state.lock().unwrap();
        let Some(notify) = state.notify.clone() else {
            return Err(TransferError::Disconnected);
        };
        state.incoming.extend_from_slice(frame);

        loop {
            let version = Self::version(&state);
            let request = match Request::decode(&state.incoming, version) {
                Ok(Decoded::Frame(request, len)) => {
                    state.incoming.drain(..len);
                    request
                }
                Ok(Decoded::NeedMoreBytes) => break,
                Err(_) => {
                    state.incoming.clear();
                    break;
                }
            };
            state.requests.push(request.clone());
            if state.silent {
                continue;
            }

            let mut bytes = Vec::new();
            for response in Self::respond(&mut state, request) {
                bytes.extend(response.encode().unwrap());
            }
            for piece in bytes.chunks(NOTIFY_LEN) {
                let _ = notify.send(piece.to_vec());
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransferError> {
        let mut state = self.state.lock().unwrap();
        state.notify = None;
        state.connected = false;
        state.disconnects += 1;
        Ok(())
    }
}
