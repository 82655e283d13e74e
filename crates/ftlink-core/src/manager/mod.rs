//! 连接管理
//!
//! [`ConnectionManager`] 维护所有已连接的会话和当前选中的外设：
//!
//! - 同一地址的建立过程串行执行，期间可以通过 `is_setting_up` 观察
//! - 选中的外设意外断开时在 `reconnect_timeout` 内重连一次，失败后移除
//!   并自动选中另一个已连接的会话
//! - 未选中的外设断开时直接移除
//! - 每个外设有自己的 [`OperationQueue`]，文件操作按顺序执行
//!
//! 状态变化通过 [`ConnectionEvent`] 广播。

pub mod queue;

pub use queue::{Command, CommandOutput, OperationQueue};

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::SystemTime;
use tokio::sync::broadcast;
use tokio::time;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::ble::BleConnector;
use crate::client::{FileTransferClient, SessionState, TransportKind};
use crate::config::Settings;
use crate::transfer::{DirectoryEntry, ProgressFn, TransferError};
use crate::wifi::WifiConnector;

const EVENT_CAPACITY: usize = 64;

/// 连接错误
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Bluetooth is unavailable")]
    BluetoothUnavailable,

    #[error("Peripheral not found: {0}")]
    PeripheralNotFound(String),

    #[error("Cannot reconnect to bonded peripheral {0}")]
    CannotConnectToBondedPeripheral(String),

    #[error("Timed out connecting to {0}")]
    Timeout(String),

    #[error("No peripheral selected")]
    NoSelectedPeripheral,

    #[error("No connector for {0} transport")]
    UnsupportedTransport(TransportKind),

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// 连接管理器广播的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    SettingUp {
        address: String,
        transport: TransportKind,
    },
    Connected {
        address: String,
        transport: TransportKind,
    },
    SessionStateChanged {
        address: String,
        state: SessionState,
    },
    SelectionChanged {
        address: Option<String>,
    },
    Reconnecting {
        address: String,
    },
    Reconnected {
        address: String,
    },
    ReconnectFailed {
        address: String,
        reason: String,
    },
    Removed {
        address: String,
    },
}

/// 按传输类型建立会话
#[async_trait]
pub trait Connector: Send + Sync {
    fn transport(&self) -> TransportKind;

    /// 连接并完成会话初始化，返回可以执行文件操作的会话
    async fn connect(&self, address: &str)
    -> Result<Arc<dyn FileTransferClient>, ConnectionError>;
}

struct Entry {
    client: Arc<dyn FileTransferClient>,
    transport: TransportKind,
    queue: OperationQueue,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<String, Entry>,
    selected: Option<String>,
}

struct Inner {
    settings: Settings,
    connectors: HashMap<TransportKind, Arc<dyn Connector>>,
    registry: Mutex<Registry>,
    setup_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    setting_up: Mutex<HashSet<String>>,
    events: broadcast::Sender<ConnectionEvent>,
}

/// 已连接外设的快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralInfo {
    pub address: String,
    pub transport: TransportKind,
    pub state: SessionState,
    pub selected: bool,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

fn same_client(a: &Arc<dyn FileTransferClient>, b: &Arc<dyn FileTransferClient>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionManager {
    /// 使用 BLE 和 Wifi 连接器
    pub fn new(settings: Settings) -> Self {
        let connectors: Vec<Arc<dyn Connector>> = vec![
            Arc::new(BleConnector::new(settings.clone())),
            Arc::new(WifiConnector::new(settings.clone())),
        ];
        Self::with_connectors(settings, connectors)
    }

    pub fn with_connectors(settings: Settings, connectors: Vec<Arc<dyn Connector>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let connectors = connectors
            .into_iter()
            .map(|connector| (connector.transport(), connector))
            .collect();
        Self {
            inner: Arc::new(Inner {
                settings,
                connectors,
                registry: Mutex::new(Registry::default()),
                setup_locks: Mutex::new(HashMap::new()),
                setting_up: Mutex::new(HashSet::new()),
                events,
            }),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn event_stream(&self) -> BroadcastStream<ConnectionEvent> {
        BroadcastStream::new(self.events())
    }

    fn emit(&self, event: ConnectionEvent) {
        debug!("Connection event: {:?}", event);
        let _ = self.inner.events.send(event);
    }

    pub fn selected_address(&self) -> Option<String> {
        lock(&self.inner.registry).selected.clone()
    }

    pub fn selected(&self) -> Option<Arc<dyn FileTransferClient>> {
        let registry = lock(&self.inner.registry);
        let address = registry.selected.as_ref()?;
        registry.entries.get(address).map(|e| e.client.clone())
    }

    pub fn session(&self, address: &str) -> Option<Arc<dyn FileTransferClient>> {
        lock(&self.inner.registry)
            .entries
            .get(address)
            .map(|e| e.client.clone())
    }

    pub fn peripherals(&self) -> Vec<PeripheralInfo> {
        let registry = lock(&self.inner.registry);
        let mut peripherals: Vec<_> = registry
            .entries
            .iter()
            .map(|(address, entry)| PeripheralInfo {
                address: address.clone(),
                transport: entry.transport,
                state: entry.client.state(),
                selected: registry.selected.as_deref() == Some(address.as_str()),
            })
            .collect();
        peripherals.sort_by(|a, b| a.address.cmp(&b.address));
        peripherals
    }

    /// 该地址正在建立连接或重连
    pub fn is_setting_up(&self, address: &str) -> bool {
        lock(&self.inner.setting_up).contains(address)
    }

    fn setup_lock(&self, address: &str) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.inner.setup_locks)
            .entry(address.to_string())
            .or_default()
            .clone()
    }

    /// 没有任务持有时移除该地址的建立锁
    fn prune_setup_lock(&self, address: &str) {
        let mut locks = lock(&self.inner.setup_locks);
        if locks
            .get(address)
            .is_some_and(|setup| Arc::strong_count(setup) == 1)
        {
            locks.remove(address);
        }
    }

    fn set_setting_up(&self, address: &str, active: bool) {
        let mut setting_up = lock(&self.inner.setting_up);
        if active {
            setting_up.insert(address.to_string());
        } else {
            setting_up.remove(address);
        }
    }

    fn live_session(&self, address: &str) -> Option<Arc<dyn FileTransferClient>> {
        lock(&self.inner.registry)
            .entries
            .get(address)
            .filter(|e| !e.client.state().is_disconnected())
            .map(|e| e.client.clone())
    }

    fn connector(&self, transport: TransportKind) -> Result<Arc<dyn Connector>, ConnectionError> {
        self.inner
            .connectors
            .get(&transport)
            .cloned()
            .ok_or(ConnectionError::UnsupportedTransport(transport))
    }

    /// 连接外设；已有可用会话时直接复用
    pub async fn connect(
        &self,
        address: &str,
        transport: TransportKind,
    ) -> Result<Arc<dyn FileTransferClient>, ConnectionError> {
        if let Some(client) = self.live_session(address) {
            return Ok(client);
        }
        let connector = self.connector(transport)?;

        let setup = self.setup_lock(address);
        let guard = setup.lock().await;
        // 等待期间可能已经由另一个调用方建立完成
        if let Some(client) = self.live_session(address) {
            return Ok(client);
        }

        info!("Setting up {} peripheral {}", transport, address);
        self.set_setting_up(address, true);
        self.emit(ConnectionEvent::SettingUp {
            address: address.to_string(),
            transport,
        });
        let result = time::timeout(
            self.inner.settings.connection_timeout(),
            connector.connect(address),
        )
        .await;
        self.set_setting_up(address, false);

        let client = match result {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                warn!("Failed to connect to {}: {}", address, e);
                drop(guard);
                drop(setup);
                self.prune_setup_lock(address);
                return Err(e);
            }
            Err(_) => {
                warn!("Timed out connecting to {}", address);
                drop(guard);
                drop(setup);
                self.prune_setup_lock(address);
                return Err(ConnectionError::Timeout(address.to_string()));
            }
        };

        self.register(address, transport, client.clone());
        self.emit(ConnectionEvent::Connected {
            address: address.to_string(),
            transport,
        });
        Ok(client)
    }

    fn register(&self, address: &str, transport: TransportKind, client: Arc<dyn FileTransferClient>) {
        let entry = Entry {
            client: client.clone(),
            transport,
            queue: OperationQueue::new(address, client.clone()),
        };
        let previous = lock(&self.inner.registry)
            .entries
            .insert(address.to_string(), entry);
        if let Some(previous) = previous {
            previous.queue.shutdown();
        }
        self.spawn_watcher(address.to_string(), client);
    }

    /// 选中外设，必要时先建立连接
    pub async fn set_selected_peripheral(
        &self,
        address: &str,
        transport: TransportKind,
    ) -> Result<Arc<dyn FileTransferClient>, ConnectionError> {
        let client = self.connect(address, transport).await?;
        let changed = {
            let mut registry = lock(&self.inner.registry);
            let changed = registry.selected.as_deref() != Some(address);
            registry.selected = Some(address.to_string());
            changed
        };
        if changed {
            info!("Selected peripheral {}", address);
            self.emit(ConnectionEvent::SelectionChanged {
                address: Some(address.to_string()),
            });
        }
        Ok(client)
    }

    pub fn clear_selection(&self) {
        let previous = lock(&self.inner.registry).selected.take();
        if previous.is_some() {
            self.emit(ConnectionEvent::SelectionChanged { address: None });
        }
    }

    /// 主动断开并移除外设，队列中尚未开始的命令被取消
    pub async fn disconnect(&self, address: &str) -> Result<(), ConnectionError> {
        let Some(entry) = self.remove(address) else {
            return Ok(());
        };
        entry.client.disconnect().await?;
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        let addresses: Vec<String> = lock(&self.inner.registry).entries.keys().cloned().collect();
        for address in addresses {
            if let Err(e) = self.disconnect(&address).await {
                warn!("Failed to disconnect {}: {}", address, e);
            }
        }
    }

    /// 从注册表中移除，被移除的是选中外设时自动选择另一个
    fn remove(&self, address: &str) -> Option<Entry> {
        let (entry, fallback) = {
            let mut registry = lock(&self.inner.registry);
            let entry = registry.entries.remove(address)?;
            let fallback = if registry.selected.as_deref() == Some(address) {
                let next = registry
                    .entries
                    .iter()
                    .filter(|(_, e)| e.client.state().is_ready())
                    .map(|(address, _)| address.clone())
                    .min();
                registry.selected = next.clone();
                Some(next)
            } else {
                None
            };
            (entry, fallback)
        };

        entry.queue.shutdown();
        self.prune_setup_lock(address);
        info!("Removed peripheral {}", address);
        self.emit(ConnectionEvent::Removed {
            address: address.to_string(),
        });
        if let Some(next) = fallback {
            match &next {
                Some(next) => info!("Falling back to peripheral {}", next),
                None => info!("No other peripheral to select"),
            }
            self.emit(ConnectionEvent::SelectionChanged { address: next });
        }
        Some(entry)
    }

    /// 监听会话状态，处理意外断开
    fn spawn_watcher(&self, address: String, client: Arc<dyn FileTransferClient>) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let mut states = client.watch_state();

        tokio::spawn(async move {
            loop {
                let state = states.borrow_and_update().clone();
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let manager = ConnectionManager { inner };
                if state.is_disconnected() {
                    manager.handle_disconnect(address, client).await;
                    return;
                }
                drop(manager);

                if states.changed().await.is_err() {
                    return;
                }
                if let Some(inner) = weak.upgrade() {
                    ConnectionManager { inner }.emit(ConnectionEvent::SessionStateChanged {
                        address: address.clone(),
                        state: states.borrow().clone(),
                    });
                }
            }
        });
    }

    fn handle_disconnect(
        &self,
        address: String,
        client: Arc<dyn FileTransferClient>,
    ) -> BoxFuture<'static, ()> {
        let manager = self.clone();
        async move {
            let selected = {
                let registry = lock(&manager.inner.registry);
                match registry.entries.get(&address) {
                    Some(entry) if same_client(&entry.client, &client) => {
                        entry.queue.pause();
                        registry.selected.as_deref() == Some(address.as_str())
                    }
                    // 已被主动移除或替换
                    _ => return,
                }
            };

            if selected {
                manager.reconnect(&address, &client).await;
            } else {
                info!("Peripheral {} disconnected", address);
                manager.remove(&address);
            }
        }
        .boxed()
    }

    /// 选中的外设断开后重连一次
    async fn reconnect(&self, address: &str, old: &Arc<dyn FileTransferClient>) {
        let transport = match lock(&self.inner.registry).entries.get(address) {
            Some(entry) => entry.transport,
            None => return,
        };
        let setup = self.setup_lock(address);
        let guard = setup.lock().await;

        info!("Selected peripheral {} disconnected, reconnecting", address);
        self.set_setting_up(address, true);
        self.emit(ConnectionEvent::Reconnecting {
            address: address.to_string(),
        });

        let result = match self.connector(transport) {
            Ok(connector) => {
                match time::timeout(self.inner.settings.reconnect_timeout(), connector.connect(address)).await {
                    Ok(result) => result,
                    Err(_) => Err(ConnectionError::Timeout(address.to_string())),
                }
            }
            Err(e) => Err(e),
        };
        self.set_setting_up(address, false);

        match result {
            Ok(client) => {
                let replaced = {
                    let mut registry = lock(&self.inner.registry);
                    match registry.entries.get_mut(address) {
                        Some(entry) if same_client(&entry.client, old) => {
                            entry.client = client.clone();
                            entry.queue.set_client(client.clone());
                            entry.queue.resume();
                            true
                        }
                        _ => false,
                    }
                };
                if !replaced {
                    drop(guard);
                    drop(setup);
                    self.prune_setup_lock(address);
                    // 重连期间外设被主动移除
                    if let Err(e) = client.disconnect().await {
                        debug!("Failed to close stale session {}: {}", address, e);
                    }
                    return;
                }
                info!("Reconnected to {}", address);
                self.spawn_watcher(address.to_string(), client);
                self.emit(ConnectionEvent::Reconnected {
                    address: address.to_string(),
                });
            }
            Err(e) => {
                warn!("Reconnect to {} failed: {}", address, e);
                let still_registered = matches!(
                    lock(&self.inner.registry).entries.get(address),
                    Some(entry) if same_client(&entry.client, old)
                );
                if !still_registered {
                    return;
                }
                drop(guard);
                drop(setup);
                self.emit(ConnectionEvent::ReconnectFailed {
                    address: address.to_string(),
                    reason: ConnectionError::CannotConnectToBondedPeripheral(address.to_string())
                        .to_string(),
                });
                self.remove(address);
            }
        }
    }

    /// 在指定外设的队列中执行命令
    pub async fn enqueue(
        &self,
        address: &str,
        command: Command,
        cancel: CancellationToken,
    ) -> Result<CommandOutput, ConnectionError> {
        // 不能跨 await 持有注册表锁，这里只提交命令
        let completion = {
            let registry = lock(&self.inner.registry);
            let entry = registry
                .entries
                .get(address)
                .ok_or_else(|| ConnectionError::PeripheralNotFound(address.to_string()))?;
            entry.queue.submit(command, cancel)
        };
        completion.await
    }

    /// 在选中外设的队列中执行命令
    pub async fn enqueue_selected(
        &self,
        command: Command,
        cancel: CancellationToken,
    ) -> Result<CommandOutput, ConnectionError> {
        let address = self
            .selected_address()
            .ok_or(ConnectionError::NoSelectedPeripheral)?;
        self.enqueue(&address, command, cancel).await
    }

    pub async fn read_file(
        &self,
        path: &str,
        progress: Option<ProgressFn>,
    ) -> Result<Vec<u8>, ConnectionError> {
        let command = Command::ReadFile {
            path: path.to_string(),
            progress,
        };
        match self.enqueue_selected(command, CancellationToken::new()).await? {
            CommandOutput::Data(data) => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    pub async fn write_file(
        &self,
        path: &str,
        data: Vec<u8>,
        progress: Option<ProgressFn>,
    ) -> Result<Option<SystemTime>, ConnectionError> {
        let command = Command::WriteFile {
            path: path.to_string(),
            data,
            progress,
        };
        match self.enqueue_selected(command, CancellationToken::new()).await? {
            CommandOutput::Written(modified) => Ok(modified),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_directory(
        &self,
        path: &str,
    ) -> Result<Option<Vec<DirectoryEntry>>, ConnectionError> {
        let command = Command::ListDirectory {
            path: path.to_string(),
        };
        match self.enqueue_selected(command, CancellationToken::new()).await? {
            CommandOutput::Listing(entries) => Ok(entries),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_file(&self, path: &str) -> Result<(), ConnectionError> {
        let command = Command::DeleteFile {
            path: path.to_string(),
        };
        self.enqueue_selected(command, CancellationToken::new())
            .await
            .map(|_| ())
    }

    pub async fn move_file(&self, from: &str, to: &str) -> Result<(), ConnectionError> {
        let command = Command::MoveFile {
            from: from.to_string(),
            to: to.to_string(),
        };
        self.enqueue_selected(command, CancellationToken::new())
            .await
            .map(|_| ())
    }

    pub async fn make_directory(&self, path: &str) -> Result<Option<SystemTime>, ConnectionError> {
        let command = Command::MakeDirectory {
            path: path.to_string(),
        };
        match self.enqueue_selected(command, CancellationToken::new()).await? {
            CommandOutput::Written(modified) => Ok(modified),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(output: CommandOutput) -> ConnectionError {
    TransferError::InvalidData(format!("unexpected command output: {:?}", output)).into()
}
