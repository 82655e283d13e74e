//! Wifi 文件传输会话
//!
//! HTTP 请求彼此独立，但仍然经过与 BLE 会话相同的命令锁，保证一个外设
//! 同时只有一个文件操作。

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use log::{debug, info, warn};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderValue};
use reqwest::{Response, StatusCode, Url};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;
use tokio::sync::watch;

use crate::client::{FileTransferClient, SessionState, TransportKind};
use crate::config::Settings;
use crate::manager::{ConnectionError, Connector};
use crate::protocol::STATUS_READ_ONLY;
use crate::transfer::entry::{now_nanos, time_from_nanos};
use crate::transfer::{DirectoryEntry, ProgressFn, TransferError};
use crate::wifi::{HostVersion, Listing, NetworkError};

/// 写入和创建目录时携带的修改时间 (毫秒)
const TIMESTAMP_HEADER: &str = "X-Timestamp";

struct Inner {
    client: reqwest::Client,
    base: Url,
    address: String,
    authorization: Option<HeaderValue>,
    state: watch::Sender<SessionState>,
    commands: tokio::sync::Mutex<()>,
    host_version: Mutex<Option<HostVersion>>,
    max_file_size: u64,
}

#[derive(Clone)]
pub struct WifiFileTransferSession {
    inner: Arc<Inner>,
}

/// `Authorization: Basic base64(":" + password)`
pub fn basic_authorization(password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!(":{}", password)))
}

fn http(e: reqwest::Error) -> TransferError {
    TransferError::Network(NetworkError::Http(e))
}

impl WifiFileTransferSession {
    /// `address` 为 `host` 或 `host:port`，未指定端口时使用设置中的端口
    pub fn new(address: &str, settings: &Settings) -> Result<Self, TransferError> {
        let authority = if address.contains(':') && !address.ends_with(']') {
            address.to_string()
        } else {
            format!("{}:{}", address, settings.wifi_port)
        };
        let base = Url::parse(&format!("http://{}/", authority))
            .map_err(|e| NetworkError::InvalidUrl(format!("{}: {}", address, e)))?;

        let authorization = match settings.wifi_password.as_deref() {
            Some(password) => Some(
                HeaderValue::from_str(&basic_authorization(password))
                    .map_err(|e| NetworkError::InvalidUrl(e.to_string()))?,
            ),
            None => None,
        };

        let client = reqwest::Client::builder()
            .connect_timeout(settings.connection_timeout())
            .build()
            .map_err(http)?;

        let (state, _) = watch::channel(SessionState::Start);
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                base,
                address: address.to_string(),
                authorization,
                state,
                commands: tokio::sync::Mutex::new(()),
                host_version: Mutex::new(None),
                max_file_size: settings.max_file_size,
            }),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base
    }

    /// 连接时读取的设备信息
    pub fn host_version(&self) -> Option<HostVersion> {
        self.inner
            .host_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, state: SessionState) {
        debug!("{}: session state -> {}", self.inner.address, state);
        self.inner.state.send_replace(state);
    }

    /// 读取 `/cp/version.json` 确认设备可用
    pub async fn connect(&self) -> Result<HostVersion, TransferError> {
        self.set_state(SessionState::Connecting);
        let url = self.url(&["cp", "version.json"], false)?;

        let response = match self.request(reqwest::Method::GET, url).send().await {
            Ok(response) => response,
            Err(e) => {
                self.set_state(SessionState::Disconnected(Some(e.to_string())));
                return Err(http(e));
            }
        };
        self.set_state(SessionState::Connected);
        self.set_state(SessionState::CheckingVersion);

        let version = match Self::decode_version(response).await {
            Ok(version) => version,
            Err(e) => {
                self.set_state(SessionState::Error(e.to_string()));
                return Err(e);
            }
        };
        info!(
            "{}: {} running {} (web api {})",
            self.inner.address, version.board_name, version.version, version.web_api_version
        );

        *self
            .inner
            .host_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(version.clone());
        self.set_state(SessionState::Enabled);
        Ok(version)
    }

    async fn decode_version(response: Response) -> Result<HostVersion, TransferError> {
        let response = check_status(response)?;
        let body = response.bytes().await.map_err(http)?;
        if body.is_empty() {
            return Err(NetworkError::NoData.into());
        }
        Ok(serde_json::from_slice(&body).map_err(NetworkError::from)?)
    }

    /// 拼接 `/fs/...` 形式的地址，各段单独转义
    fn fs_url(&self, path: &str, directory: bool) -> Result<Url, TransferError> {
        let mut segments = vec!["fs"];
        segments.extend(path.split('/').filter(|s| !s.is_empty()));
        self.url(&segments, directory || path.ends_with('/'))
    }

    fn url(&self, segments: &[&str], trailing_slash: bool) -> Result<Url, TransferError> {
        let mut url = self.inner.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| NetworkError::InvalidUrl(self.inner.base.to_string()))?;
            path.pop_if_empty().extend(segments);
            if trailing_slash {
                path.push("");
            }
        }
        Ok(url)
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.inner.client.request(method, url);
        match &self.inner.authorization {
            Some(auth) => builder.header(AUTHORIZATION, auth.clone()),
            None => builder,
        }
    }

    /// 连不上设备时会话进入 `Disconnected`，交给连接管理器处理
    fn request_failed(&self, e: reqwest::Error) -> TransferError {
        if e.is_connect() && !self.state().is_disconnected() {
            warn!("{}: host unreachable: {}", self.inner.address, e);
            self.set_state(SessionState::Disconnected(Some(e.to_string())));
        }
        http(e)
    }

    /// 获取命令锁并确认会话可用
    async fn begin(&self) -> Result<tokio::sync::MutexGuard<'_, ()>, TransferError> {
        let turn = self.inner.commands.lock().await;
        if !self.state().is_ready() {
            return Err(TransferError::Disconnected);
        }
        Ok(turn)
    }
}

/// 把 HTTP 状态映射为传输错误
///
/// 409 表示文件系统只读 (设备正被 USB 主机挂载)。
fn check_status(response: Response) -> Result<Response, TransferError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    warn!("{} returned {}", response.url().path(), status);
    match status {
        StatusCode::CONFLICT => Err(TransferError::StatusFailed(STATUS_READ_ONLY)),
        _ => Err(NetworkError::InvalidStatus(status.as_u16()).into()),
    }
}

fn timestamp_millis() -> u64 {
    now_nanos() / 1_000_000
}

#[async_trait]
impl FileTransferClient for WifiFileTransferSession {
    fn address(&self) -> &str {
        &self.inner.address
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Wifi
    }

    fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    async fn read_file(
        &self,
        path: &str,
        progress: Option<ProgressFn>,
    ) -> Result<Vec<u8>, TransferError> {
        let _turn = self.begin().await?;
        debug!("{}: GET {}", self.inner.address, path);

        let url = self.fs_url(path, false)?;
        let response = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .map_err(|e| self.request_failed(e))?;
        let mut response = check_status(response)?;

        let total = response.content_length().unwrap_or(0);
        if total > self.inner.max_file_size {
            return Err(TransferError::FileTooLarge(total));
        }

        let mut data = Vec::with_capacity(total as usize);
        while let Some(chunk) = response.chunk().await.map_err(http)? {
            data.extend_from_slice(&chunk);
            if data.len() as u64 > self.inner.max_file_size {
                return Err(TransferError::FileTooLarge(data.len() as u64));
            }
            if let Some(progress) = &progress {
                progress(data.len() as u64, total.max(data.len() as u64));
            }
        }
        Ok(data)
    }

    async fn write_file(
        &self,
        path: &str,
        data: Vec<u8>,
        progress: Option<ProgressFn>,
    ) -> Result<Option<SystemTime>, TransferError> {
        let total = data.len() as u64;
        if total > self.inner.max_file_size {
            return Err(TransferError::FileTooLarge(total));
        }
        let _turn = self.begin().await?;
        debug!("{}: PUT {} ({} bytes)", self.inner.address, path, total);

        let millis = timestamp_millis();
        let url = self.fs_url(path, false)?;
        let response = self
            .request(reqwest::Method::PUT, url)
            .header(TIMESTAMP_HEADER, millis.to_string())
            .body(data)
            .send()
            .await
            .map_err(|e| self.request_failed(e))?;
        check_status(response)?;

        if let Some(progress) = &progress {
            progress(total, total);
        }
        Ok(Some(time_from_nanos(millis * 1_000_000)))
    }

    async fn list_directory(
        &self,
        path: &str,
    ) -> Result<Option<Vec<DirectoryEntry>>, TransferError> {
        let _turn = self.begin().await?;
        debug!("{}: list {}", self.inner.address, path);

        let url = self.fs_url(path, true)?;
        let response = self
            .request(reqwest::Method::GET, url)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| self.request_failed(e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response)?;
        let body = response.bytes().await.map_err(http)?;
        let listing = Listing::parse(&body)?;
        Ok(Some(listing.into_entries()))
    }

    async fn delete_file(&self, path: &str) -> Result<(), TransferError> {
        let _turn = self.begin().await?;
        debug!("{}: DELETE {}", self.inner.address, path);

        let url = self.fs_url(path, false)?;
        let response = self
            .request(reqwest::Method::DELETE, url)
            .send()
            .await
            .map_err(|e| self.request_failed(e))?;
        check_status(response)?;
        Ok(())
    }

    async fn move_file(&self, from: &str, to: &str) -> Result<(), TransferError> {
        debug!("{}: move {} -> {} is not supported", self.inner.address, from, to);
        Err(NetworkError::NotAvailable.into())
    }

    async fn make_directory(&self, path: &str) -> Result<Option<SystemTime>, TransferError> {
        let _turn = self.begin().await?;
        debug!("{}: mkdir {}", self.inner.address, path);

        let millis = timestamp_millis();
        let url = self.fs_url(path, true)?;
        let response = self
            .request(reqwest::Method::PUT, url)
            .header(TIMESTAMP_HEADER, millis.to_string())
            .send()
            .await
            .map_err(|e| self.request_failed(e))?;
        check_status(response)?;
        Ok(Some(time_from_nanos(millis * 1_000_000)))
    }

    async fn disconnect(&self) -> Result<(), TransferError> {
        if !self.state().is_disconnected() {
            self.set_state(SessionState::Disconnecting(None));
            let _turn = self.inner.commands.lock().await;
            self.set_state(SessionState::Disconnected(None));
        }
        Ok(())
    }
}

pub struct WifiConnector {
    settings: Settings,
}

impl WifiConnector {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Connector for WifiConnector {
    fn transport(&self) -> TransportKind {
        TransportKind::Wifi
    }

    async fn connect(&self, address: &str) -> Result<Arc<dyn FileTransferClient>, ConnectionError> {
        let session = WifiFileTransferSession::new(address, &self.settings)?;
        session.connect().await?;
        Ok(Arc::new(session))
    }
}
