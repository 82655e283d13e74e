//! BLE 会话集成测试 (模拟外设)

mod common;

use common::{FakePeripheral, WRITE_WINDOW};
use ftlink_core::protocol::{Request, Response, STATUS_OK};
use ftlink_core::{
    BleFileTransferSession, FileTransferClient, SessionState, Settings, TransferError,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn connected(fake: &FakePeripheral) -> BleFileTransferSession<FakePeripheral> {
    let session = BleFileTransferSession::new(fake.clone(), &Settings::default());
    session.setup().await.unwrap();
    session
}

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_setup_enables_session() {
    let fake = FakePeripheral::new("AA:BB:CC:DD:EE:01", Some(3));
    let session = BleFileTransferSession::new(fake.clone(), &Settings::default());
    assert_eq!(session.state(), SessionState::Start);

    session.setup().await.unwrap();
    assert_eq!(session.state(), SessionState::Enabled);
    assert_eq!(session.protocol_version().map(|v| v.0), Some(3));
}

#[tokio::test]
async fn test_missing_version_defaults_to_one() {
    let fake = FakePeripheral::new("AA:BB:CC:DD:EE:02", None);
    let session = connected(&fake).await;
    assert_eq!(session.protocol_version().map(|v| v.0), Some(1));
}

#[tokio::test]
async fn test_connect_failure_is_disconnected() {
    let fake = FakePeripheral::new("AA:BB:CC:DD:EE:03", Some(3));
    fake.set_fail_connect(true);
    let session = BleFileTransferSession::new(fake.clone(), &Settings::default());

    assert!(session.setup().await.is_err());
    assert!(matches!(session.state(), SessionState::Disconnected(Some(_))));
}

#[tokio::test]
async fn test_notify_failure_is_error_and_releases_link() {
    let fake = FakePeripheral::new("AA:BB:CC:DD:EE:14", Some(3));
    fake.set_fail_notify(true);
    let session = BleFileTransferSession::new(fake.clone(), &Settings::default());

    let err = session.setup().await.unwrap_err();
    assert!(matches!(err, TransferError::EnableNotifyFailed(_)));
    assert!(matches!(session.state(), SessionState::Error(_)));
    assert_eq!(session.protocol_version(), None);
    assert_eq!(fake.disconnects(), 1);
    assert!(!fake.is_connected());
}

#[tokio::test]
async fn test_discover_failure_is_error_and_releases_link() {
    let fake = FakePeripheral::new("AA:BB:CC:DD:EE:15", Some(3));
    fake.set_fail_discover(true);
    let session = BleFileTransferSession::new(fake.clone(), &Settings::default());

    let err = session.setup().await.unwrap_err();
    assert!(matches!(err, TransferError::InvalidCharacteristic(_)));
    assert!(matches!(session.state(), SessionState::Error(_)));
    assert_eq!(session.protocol_version(), None);
    assert!(!fake.is_connected());

    // 失败后的会话不能执行命令
    let err = session.list_directory("/").await.unwrap_err();
    assert!(matches!(err, TransferError::Disconnected));
}

#[tokio::test]
async fn test_cancelled_setup_releases_link() {
    let fake = FakePeripheral::new("AA:BB:CC:DD:EE:16", Some(3));
    fake.set_discover_delay(Duration::from_secs(5));
    let session = BleFileTransferSession::new(fake.clone(), &Settings::default());

    let result = tokio::time::timeout(Duration::from_millis(50), session.setup()).await;
    assert!(result.is_err());

    // 断开在后台任务中完成
    tokio::time::timeout(Duration::from_secs(2), async {
        while fake.disconnects() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(!fake.is_connected());
    assert!(matches!(session.state(), SessionState::Error(_)));
}

#[tokio::test]
async fn test_read_file_across_many_chunks() {
    let data = sample(100);
    let fake = FakePeripheral::new("AA:BB:CC:DD:EE:04", Some(3)).with_file("/code.py", &data);
    let session = connected(&fake).await;

    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    let progress: ftlink_core::ProgressFn =
        Arc::new(move |done, total| sink.lock().unwrap().push((done, total)));

    let read = session.read_file("/code.py", Some(progress)).await.unwrap();
    assert_eq!(read, data);

    // 20 字节一片：0, 20, 40, 60, 80 五次请求
    let requests = fake.requests();
    assert!(matches!(requests[0], Request::Read { offset: 0, chunk_size: 20, .. }));
    let chunk_offsets: Vec<u32> = requests
        .iter()
        .filter_map(|r| match r {
            Request::ReadChunk { offset, .. } => Some(*offset),
            _ => None,
        })
        .collect();
    assert_eq!(chunk_offsets, vec![20, 40, 60, 80]);
    assert_eq!(reports.lock().unwrap().last(), Some(&(100, 100)));
}

#[tokio::test]
async fn test_read_missing_file_fails() {
    let fake = FakePeripheral::new("AA:BB:CC:DD:EE:05", Some(3));
    let session = connected(&fake).await;

    let err = session.read_file("/missing.txt", None).await.unwrap_err();
    assert!(matches!(err, TransferError::StatusFailed(_)));

    // 失败后会话仍然可用
    assert_eq!(session.list_directory("/").await.unwrap(), Some(Vec::new()));
}

#[tokio::test]
async fn test_write_file_follows_free_space() {
    let data = sample(150);
    let fake = FakePeripheral::new("AA:BB:CC:DD:EE:06", Some(3));
    let session = connected(&fake).await;

    let modified = session
        .write_file("/data.bin", data.clone(), None)
        .await
        .unwrap();
    assert!(modified.is_some());
    assert_eq!(fake.file("/data.bin"), Some(data));

    let chunk_offsets: Vec<u32> = fake
        .requests()
        .iter()
        .filter_map(|r| match r {
            Request::WriteChunk { offset, .. } => Some(*offset),
            _ => None,
        })
        .collect();
    assert_eq!(chunk_offsets, vec![0, WRITE_WINDOW, WRITE_WINDOW * 2]);
}

#[tokio::test]
async fn test_write_without_timestamps_on_old_firmware() {
    let fake = FakePeripheral::new("AA:BB:CC:DD:EE:07", Some(2));
    let session = connected(&fake).await;

    let modified = session.write_file("/a.txt", b"hello".to_vec(), None).await.unwrap();
    assert_eq!(modified, None);
    assert!(matches!(
        fake.requests()[0],
        Request::Write {
            timestamp_ns: None,
            ..
        }
    ));
    assert_eq!(fake.file("/a.txt"), Some(b"hello".to_vec()));
}

#[tokio::test]
async fn test_write_empty_file() {
    let fake = FakePeripheral::new("AA:BB:CC:DD:EE:08", Some(3));
    let session = connected(&fake).await;

    session.write_file("/empty", Vec::new(), None).await.unwrap();
    assert_eq!(fake.file("/empty"), Some(Vec::new()));
}

#[tokio::test]
async fn test_read_only_filesystem() {
    let fake = FakePeripheral::new("AA:BB:CC:DD:EE:09", Some(3));
    fake.set_read_only(true);
    let session = connected(&fake).await;

    let err = session.write_file("/a.txt", b"x".to_vec(), None).await.unwrap_err();
    assert!(err.is_read_only());
    assert!(err.to_string().contains("read-only"));

    let err = session.make_directory("/lib").await.unwrap_err();
    assert!(err.is_read_only());
}

#[tokio::test]
async fn test_list_directory() {
    let fake = FakePeripheral::new("AA:BB:CC:DD:EE:0A", Some(3))
        .with_dir("/lib")
        .with_file("/code.py", b"print('hi')")
        .with_file("/boot_out.txt", b"Adafruit CircuitPython")
        .with_file("/lib/neopixel.py", b"pixels");
    let session = connected(&fake).await;

    let entries = session.list_directory("/").await.unwrap().unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["lib", "boot_out.txt", "code.py"]);
    assert!(entries[0].is_directory());
    assert_eq!(entries[2].size(), Some(11));
    assert!(entries[2].modified.is_some());

    let lib = session.list_directory("/lib/").await.unwrap().unwrap();
    assert_eq!(lib.len(), 1);
    assert_eq!(lib[0].name, "neopixel.py");
}

#[tokio::test]
async fn test_list_missing_vs_empty_directory() {
    let fake = FakePeripheral::new("AA:BB:CC:DD:EE:0B", Some(3)).with_dir("/empty");
    let session = connected(&fake).await;

    assert_eq!(session.list_directory("/nope").await.unwrap(), None);
    assert_eq!(session.list_directory("/empty").await.unwrap(), Some(Vec::new()));
}

#[tokio::test]
async fn test_list_old_firmware_has_no_dates() {
    let fake = FakePeripheral::new("AA:BB:CC:DD:EE:0C", Some(2)).with_file("/a.txt", b"a");
    let session = connected(&fake).await;

    let entries = session.list_directory("/").await.unwrap().unwrap();
    assert_eq!(entries[0].modified, None);
}

#[tokio::test]
async fn test_mkdir_delete_move() {
    let fake = FakePeripheral::new("AA:BB:CC:DD:EE:0D", Some(3)).with_file("/old.txt", b"data");
    let session = connected(&fake).await;

    let created = session.make_directory("/lib").await.unwrap();
    assert!(created.is_some());
    assert!(fake.has_dir("/lib"));

    session.move_file("/old.txt", "/lib/new.txt").await.unwrap();
    assert_eq!(fake.file("/old.txt"), None);
    assert_eq!(fake.file("/lib/new.txt"), Some(b"data".to_vec()));

    session.delete_file("/lib/new.txt").await.unwrap();
    assert_eq!(fake.file("/lib/new.txt"), None);

    let err = session.delete_file("/lib/new.txt").await.unwrap_err();
    assert!(matches!(err, TransferError::StatusFailed(_)));
}

#[tokio::test]
async fn test_disconnect_fails_outstanding_read() {
    let fake = FakePeripheral::new("AA:BB:CC:DD:EE:0E", Some(3)).with_file("/a.txt", b"abc");
    let session = connected(&fake).await;
    fake.set_silent(true);

    let reader = {
        let session = session.clone();
        tokio::spawn(async move { session.read_file("/a.txt", None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    fake.drop_connection();

    let result = tokio::time::timeout(Duration::from_secs(2), reader)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(TransferError::Disconnected)));
    assert!(session.state().is_disconnected());
    assert_eq!(session.protocol_version(), None);

    // 断开后的操作立即失败
    let err = session.list_directory("/").await.unwrap_err();
    assert!(matches!(err, TransferError::Disconnected));
}

#[tokio::test]
async fn test_commands_are_serialized() {
    let fake = FakePeripheral::new("AA:BB:CC:DD:EE:0F", Some(3))
        .with_file("/a.txt", &sample(60))
        .with_file("/b.txt", &sample(45));
    let session = connected(&fake).await;

    let (a, b, list) = tokio::join!(
        session.read_file("/a.txt", None),
        session.read_file("/b.txt", None),
        session.list_directory("/"),
    );
    assert_eq!(a.unwrap(), sample(60));
    assert_eq!(b.unwrap(), sample(45));
    assert_eq!(list.unwrap().unwrap().len(), 2);
}

#[tokio::test]
async fn test_unknown_command_resyncs() {
    let fake = FakePeripheral::new("AA:BB:CC:DD:EE:10", Some(3)).with_file("/a.txt", b"abc");
    let session = connected(&fake).await;

    // 垃圾数据被整体丢弃，之后的命令正常完成
    fake.push_raw(&[0xee, 0x01, 0x02]);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(session.read_file("/a.txt", None).await.unwrap(), b"abc".to_vec());
}

#[tokio::test]
async fn test_unsolicited_response_is_dropped() {
    let fake = FakePeripheral::new("AA:BB:CC:DD:EE:11", Some(3));
    let session = connected(&fake).await;

    let stray = Response::Delete { status: STATUS_OK }.encode().unwrap();
    fake.push_raw(&stray);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(session.list_directory("/").await.unwrap(), Some(Vec::new()));
    assert_eq!(session.state(), SessionState::Enabled);
}

#[tokio::test]
async fn test_write_too_large_is_rejected_locally() {
    let fake = FakePeripheral::new("AA:BB:CC:DD:EE:12", Some(3));
    let settings = Settings {
        max_file_size: 16,
        ..Settings::default()
    };
    let session = BleFileTransferSession::new(fake.clone(), &settings);
    session.setup().await.unwrap();

    let err = session.write_file("/big", vec![0; 17], None).await.unwrap_err();
    assert!(matches!(err, TransferError::FileTooLarge(17)));
    assert!(fake.requests().is_empty());
}

#[tokio::test]
async fn test_explicit_disconnect() {
    let fake = FakePeripheral::new("AA:BB:CC:DD:EE:13", Some(3));
    let session = connected(&fake).await;
    let mut states = session.watch_state();

    session.disconnect().await.unwrap();
    assert_eq!(session.state(), SessionState::Disconnected(None));
    assert!(states.has_changed().unwrap());
    assert!(states.borrow_and_update().is_disconnected());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disconnect_racing_new_command_never_hangs() {
    for i in 0..20 {
        let fake = FakePeripheral::new(&format!("AA:BB:CC:DD:EF:{:02X}", i), Some(3))
            .with_file("/a.txt", b"abc");
        let session = connected(&fake).await;
        fake.set_silent(true);

        let reader = {
            let session = session.clone();
            tokio::spawn(async move { session.read_file("/a.txt", None).await })
        };
        let dropper = {
            let session = session.clone();
            tokio::spawn(async move { session.handle_disconnect(Some("link lost".to_string())) })
        };
        dropper.await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("read must finish once the session is disconnected")
            .unwrap();
        assert!(matches!(result, Err(TransferError::Disconnected)));
        assert!(session.state().is_disconnected());
    }
}
