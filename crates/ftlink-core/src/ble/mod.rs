pub mod connector;
pub mod link;
pub mod session;

pub use connector::BleConnector;
pub use link::{BleLink, BtleplugLink, NotificationStream};
pub use session::BleFileTransferSession;

use uuid::Uuid;

/// 文件传输服务 (16 位 UUID 0xFEBB)
pub const FILE_TRANSFER_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000febb_0000_1000_8000_00805f9b34fb);
/// 数据特征: 写入命令帧，通过通知接收响应帧
pub const DATA_CHAR_UUID: Uuid = Uuid::from_u128(0xadaf0200_4669_6c65_5472_616e73666572);
/// 版本特征: 4 字节小端整数，不存在时版本为 1
pub const VERSION_CHAR_UUID: Uuid = Uuid::from_u128(0xadaf0100_4669_6c65_5472_616e73666572);
