use std::sync::{Arc, Mutex};
use std::time::Duration;

use enterble::characteristic::{
    BATTERY_LEVEL, FLOWTIME_EEG, FLOWTIME_SERVICE, MAC_ADDRESS, SERIAL_NUMBER,
};
use enterble::mock::MockTransport;
use enterble::{ConnectionState, DeviceDescriptor, DeviceScanner, DeviceSession, ScanFilter};

fn flowtime() -> DeviceDescriptor {
    DeviceDescriptor::new("FB:EC:25:DE:1A:92")
        .with_name("Flowtime")
        .with_service(FLOWTIME_SERVICE)
}

#[tokio::test]
async fn test_discover_then_read() {
    let transport = Arc::new(MockTransport::with_devices(vec![
        DeviceDescriptor::new("AA:AA:AA:AA:AA:AA").with_name("Flowtime-old"),
        flowtime(),
        DeviceDescriptor::new("BB:BB:BB:BB:BB:BB").with_service(FLOWTIME_SERVICE),
    ]));
    transport.set_value(MAC_ADDRESS, vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
    transport.set_value(BATTERY_LEVEL, vec![230]);

    let scanner = DeviceScanner::new(transport.clone());
    let devices = scanner.discover(&ScanFilter::new().name("Flowtime")).await.unwrap();
    assert_eq!(devices.len(), 1);

    let device = &devices[0];
    assert_eq!(device.state(), ConnectionState::Disconnected);
    assert_eq!(device.mac_address().await.unwrap(), Some("06:05:04:03:02:01".to_string()));
    assert_eq!(device.state(), ConnectionState::Connected);

    let soc = device.soc().await.unwrap().unwrap();
    assert_eq!(soc.source_value, Some(230));
    assert_eq!(soc.calibrated_percentage, 230.0);
    assert_eq!(transport.connect_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_spawned_callers_share_one_connect() {
    let transport = Arc::new(MockTransport::new());
    transport.set_connect_delay(Duration::from_millis(50));
    transport.set_value(SERIAL_NUMBER, b"SN-0001".to_vec());
    let session = Arc::new(DeviceSession::new(transport.clone(), flowtime()));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let session = session.clone();
            tokio::spawn(async move { session.serial_number().await })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), Some("SN-0001".to_string()));
    }

    assert_eq!(transport.connect_calls(), 1);
}

#[tokio::test]
async fn test_disconnect_during_use_then_reconnect() {
    let transport = Arc::new(MockTransport::new());
    transport.set_value(BATTERY_LEVEL, vec![50]);
    let session = DeviceSession::new(transport.clone(), flowtime());

    session.soc().await.unwrap();
    session.disconnect().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);

    session.soc().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(transport.connect_calls(), 2);
    assert_eq!(transport.disconnect_calls(), 1);
}

#[tokio::test]
async fn test_notification_callback_replacement() {
    let transport = Arc::new(MockTransport::new());
    let session = DeviceSession::new(transport.clone(), flowtime());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let first = seen.clone();
    session
        .subscribe(FLOWTIME_EEG, move |_: &[u8]| first.lock().unwrap().push("first"))
        .await
        .unwrap();
    let second = seen.clone();
    session
        .subscribe(FLOWTIME_EEG, move |_: &[u8]| second.lock().unwrap().push("second"))
        .await
        .unwrap();

    transport.notify(FLOWTIME_EEG, vec![0; 20]);
    session.router().dispatch(BATTERY_LEVEL, &[1]);

    assert_eq!(*seen.lock().unwrap(), vec!["second"]);
}
