use std::sync::Arc;
use std::time::Duration;

use enterble::characteristic::FLOWTIME_SERVICE;
use enterble::{BluestTransport, DeviceScanner, ScanFilter};

#[tokio::main]
pub async fn main() {
    tracing_subscriber::fmt::init();

    let transport = Arc::new(BluestTransport::new().await.unwrap());
    let scanner = DeviceScanner::new(transport);
    let filter = ScanFilter::new().name("Flowtime").service(FLOWTIME_SERVICE);

    // Keep scanning until the headband shows up.
    let device = loop {
        let mut devices = scanner.discover(&filter).await.unwrap();
        if !devices.is_empty() {
            break devices.remove(0);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    };

    // Map the raw 0-255 level onto 0-100%.
    device.set_calibration(|level: u8| f64::from(level) * 100.0 / 255.0);
    loop {
        let soc = device.soc().await.unwrap();
        println!("{soc:?}");
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}
