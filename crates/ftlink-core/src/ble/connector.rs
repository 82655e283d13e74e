//! BLE 连接器
//!
//! 按地址查找外设 (先查适配器缓存，找不到再按文件传输服务扫描)，
//! 建立 [`BleFileTransferSession`] 并监听适配器的断开事件。

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time;

use crate::ble::link::BtleplugLink;
use crate::ble::session::BleFileTransferSession;
use crate::ble::FILE_TRANSFER_SERVICE_UUID;
use crate::client::{FileTransferClient, TransportKind};
use crate::config::Settings;
use crate::manager::{ConnectionError, Connector};
use crate::transfer::TransferError;

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub type BtleplugSession = BleFileTransferSession<BtleplugLink>;

pub struct BleConnector {
    settings: Settings,
    adapter: OnceCell<Adapter>,
}

impl BleConnector {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            adapter: OnceCell::new(),
        }
    }

    /// 获取第一个蓝牙适配器
    ///
    /// 在 `ble_ready_timeout` 内拿不到适配器视为蓝牙不可用。
    async fn adapter(&self) -> Result<&Adapter, ConnectionError> {
        self.adapter
            .get_or_try_init(|| async {
                let ready = time::timeout(self.settings.ble_ready_timeout(), async {
                    let manager = Manager::new().await?;
                    let adapters = manager.adapters().await?;
                    Ok::<_, btleplug::Error>(adapters.into_iter().next())
                })
                .await;

                match ready {
                    Ok(Ok(Some(adapter))) => Ok(adapter),
                    Ok(Ok(None)) => {
                        warn!("No Bluetooth adapters found");
                        Err(ConnectionError::BluetoothUnavailable)
                    }
                    Ok(Err(e)) => {
                        warn!("Bluetooth manager error: {}", e);
                        Err(ConnectionError::BluetoothUnavailable)
                    }
                    Err(_) => {
                        warn!("Bluetooth adapter not ready after {:?}", self.settings.ble_ready_timeout());
                        Err(ConnectionError::BluetoothUnavailable)
                    }
                }
            })
            .await
    }

    async fn cached_peripheral(
        adapter: &Adapter,
        address: &str,
    ) -> Result<Option<PlatformPeripheral>, btleplug::Error> {
        for peripheral in adapter.peripherals().await? {
            if peripheral.id().to_string().eq_ignore_ascii_case(address) {
                return Ok(Some(peripheral));
            }
            if let Some(props) = peripheral.properties().await? {
                if props.address.to_string().to_uppercase() == address.to_uppercase() {
                    return Ok(Some(peripheral));
                }
            }
        }
        Ok(None)
    }

    async fn find_peripheral(
        &self,
        adapter: &Adapter,
        address: &str,
    ) -> Result<PlatformPeripheral, ConnectionError> {
        if let Some(peripheral) = Self::cached_peripheral(adapter, address)
            .await
            .map_err(TransferError::from)?
        {
            return Ok(peripheral);
        }

        info!(
            "{} not cached, scanning for {} seconds",
            address,
            self.settings.scan_timeout().as_secs()
        );
        let filter = ScanFilter {
            services: vec![FILE_TRANSFER_SERVICE_UUID],
        };
        adapter.start_scan(filter).await.map_err(TransferError::from)?;

        let found = time::timeout(self.settings.scan_timeout(), async {
            loop {
                match Self::cached_peripheral(adapter, address).await {
                    Ok(Some(peripheral)) => return Some(peripheral),
                    Ok(None) => {}
                    Err(e) => debug!("Peripheral lookup failed during scan: {}", e),
                }
                time::sleep(SCAN_POLL_INTERVAL).await;
            }
        })
        .await
        .ok()
        .flatten();

        if let Err(e) = adapter.stop_scan().await {
            debug!("Failed to stop scan: {}", e);
        }

        found.ok_or_else(|| ConnectionError::PeripheralNotFound(address.to_string()))
    }

    /// 适配器报告外设断开时通知会话
    async fn watch_disconnect(&self, adapter: &Adapter, session: &BtleplugSession) {
        let mut events = match adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Cannot watch adapter events: {}", e);
                return;
            }
        };
        let id = session.link().peripheral().id();
        let session = session.clone();
        let mut state = session.watch_state();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(disconnected)) if disconnected == id => {
                            session.handle_disconnect(Some("peripheral disconnected".to_string()));
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    },
                    changed = state.changed() => {
                        if changed.is_err() || state.borrow().is_disconnected() {
                            break;
                        }
                    }
                }
            }
            debug!("Stopped watching {}", session.address());
        });
    }
}

#[async_trait]
impl Connector for BleConnector {
    fn transport(&self) -> TransportKind {
        TransportKind::Ble
    }

    async fn connect(&self, address: &str) -> Result<Arc<dyn FileTransferClient>, ConnectionError> {
        let adapter = self.adapter().await?;
        let peripheral = self.find_peripheral(adapter, address).await?;

        let link = BtleplugLink::new(peripheral, address.to_string(), self.settings.max_write_len);
        let session = BleFileTransferSession::new(link, &self.settings);
        // 超时丢弃 setup 时由会话自己断开链路
        match time::timeout(self.settings.connection_timeout(), session.setup()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("Setup of {} timed out", address);
                return Err(ConnectionError::Timeout(address.to_string()));
            }
        }
        self.watch_disconnect(adapter, &session).await;

        Ok(Arc::new(session))
    }
}
