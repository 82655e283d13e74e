//! BLE 链路
//!
//! [`BleLink`] 把会话与具体的 BLE 库隔开：会话只需要连接、发现特征、
//! 读取协议版本、启用通知和写入数据。[`BtleplugLink`] 是基于 btleplug
//! 的实现。

use async_trait::async_trait;
use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral as PlatformPeripheral;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, info};
use std::sync::Mutex;

use crate::ble::{DATA_CHAR_UUID, FILE_TRANSFER_SERVICE_UUID, VERSION_CHAR_UUID};
use crate::protocol::ProtocolVersion;
use crate::transfer::TransferError;

/// 数据特征上收到的通知值
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

#[async_trait]
pub trait BleLink: Send + Sync + 'static {
    /// 外设地址
    fn address(&self) -> String;

    /// 单次写入的最大长度
    fn max_write_len(&self) -> usize;

    async fn connect(&self) -> Result<(), TransferError>;

    /// 发现文件传输服务及其特征
    async fn discover(&self) -> Result<(), TransferError>;

    /// 读取版本特征；特征不存在时返回 `None`
    async fn read_version(&self) -> Result<Option<ProtocolVersion>, TransferError>;

    /// 订阅数据特征，返回通知流。流结束表示连接已断开。
    async fn enable_notifications(&self) -> Result<NotificationStream, TransferError>;

    /// 写入一个完整的命令帧
    async fn write(&self, frame: &[u8]) -> Result<(), TransferError>;

    async fn disconnect(&self) -> Result<(), TransferError>;
}

/// btleplug 外设链路
pub struct BtleplugLink {
    peripheral: PlatformPeripheral,
    address: String,
    max_write_len: usize,
    data_char: Mutex<Option<Characteristic>>,
    version_char: Mutex<Option<Characteristic>>,
}

impl BtleplugLink {
    pub fn new(peripheral: PlatformPeripheral, address: String, max_write_len: usize) -> Self {
        Self {
            peripheral,
            address,
            max_write_len: max_write_len.max(1),
            data_char: Mutex::new(None),
            version_char: Mutex::new(None),
        }
    }

    pub fn peripheral(&self) -> &PlatformPeripheral {
        &self.peripheral
    }

    fn data_characteristic(&self) -> Result<Characteristic, TransferError> {
        self.data_char
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .ok_or(TransferError::InvalidCharacteristic(DATA_CHAR_UUID))
    }

    fn find_characteristic(&self, uuid: uuid::Uuid) -> Option<Characteristic> {
        for service in self.peripheral.services() {
            if service.uuid == FILE_TRANSFER_SERVICE_UUID {
                for char in service.characteristics {
                    if char.uuid == uuid {
                        return Some(char);
                    }
                }
            }
        }
        None
    }
}

#[async_trait]
impl BleLink for BtleplugLink {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn max_write_len(&self) -> usize {
        self.max_write_len
    }

    async fn connect(&self) -> Result<(), TransferError> {
        if self.peripheral.is_connected().await? {
            debug!("{} already connected", self.address);
            return Ok(());
        }
        info!("Connecting to {}", self.address);
        self.peripheral.connect().await?;
        Ok(())
    }

    async fn discover(&self) -> Result<(), TransferError> {
        info!("Discovering services on {}", self.address);
        self.peripheral.discover_services().await?;

        let data = self
            .find_characteristic(DATA_CHAR_UUID)
            .ok_or(TransferError::InvalidCharacteristic(DATA_CHAR_UUID))?;
        let version = self.find_characteristic(VERSION_CHAR_UUID);
        debug!(
            "Found data characteristic, version characteristic present: {}",
            version.is_some()
        );

        *self
            .data_char
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(data);
        *self
            .version_char
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = version;
        Ok(())
    }

    async fn read_version(&self) -> Result<Option<ProtocolVersion>, TransferError> {
        let version_char = self
            .version_char
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let Some(version_char) = version_char else {
            return Ok(None);
        };

        let value = self.peripheral.read(&version_char).await?;
        Ok(ProtocolVersion::from_characteristic(&value))
    }

    async fn enable_notifications(&self) -> Result<NotificationStream, TransferError> {
        let data_char = self.data_characteristic()?;
        self.peripheral
            .subscribe(&data_char)
            .await
            .map_err(|e| TransferError::EnableNotifyFailed(e.to_string()))?;

        let notifications = self.peripheral.notifications().await?;
        let stream = notifications
            .filter_map(|n| async move { (n.uuid == DATA_CHAR_UUID).then_some(n.value) })
            .boxed();
        Ok(stream)
    }

    async fn write(&self, frame: &[u8]) -> Result<(), TransferError> {
        let data_char = self.data_characteristic()?;
        // 外设把特征当作字节流处理，超过 MTU 的帧按顺序分段写入
        for piece in frame.chunks(self.max_write_len) {
            self.peripheral
                .write(&data_char, piece, WriteType::WithoutResponse)
                .await?;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransferError> {
        info!("Disconnecting from {}", self.address);
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
