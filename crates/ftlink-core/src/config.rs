//! 连接配置和持久化
//!
//! 超时、BLE 写入长度、传输上限以及 Wifi 凭据。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 连接与传输设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// 建立连接 (连接 + 版本检查 + 启用通知) 的超时时间 (秒)
    pub connection_timeout_secs: u64,
    /// 已选外设意外断开后重连的超时时间 (秒)
    pub reconnect_timeout_secs: u64,
    /// 等待蓝牙适配器就绪的超时时间 (秒)
    pub ble_ready_timeout_secs: u64,
    /// 按地址查找外设时的扫描时间 (秒)
    pub scan_timeout_secs: u64,
    /// 单次 BLE 写入的最大长度
    ///
    /// btleplug 不提供协商后的 MTU，需要手动配置。
    pub max_write_len: usize,
    /// 允许传输的最大文件长度
    pub max_file_size: u64,
    /// 重组缓冲区上限
    pub max_buffered_bytes: usize,
    /// Wifi HTTP 端口
    pub wifi_port: u16,
    /// Wifi 访问密码
    pub wifi_password: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connection_timeout_secs: 10,
            reconnect_timeout_secs: 5,
            ble_ready_timeout_secs: 5,
            scan_timeout_secs: 5,
            max_write_len: 244,
            max_file_size: 32 * 1024 * 1024,
            max_buffered_bytes: 1024 * 1024,
            wifi_port: 80,
            wifi_password: None,
        }
    }
}

impl Settings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ftlink");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.reconnect_timeout_secs)
    }

    pub fn ble_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ble_ready_timeout_secs)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }
}
