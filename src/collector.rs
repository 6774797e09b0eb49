//! Data collection for Flowtime headbands.
//!
//! The headband pushes battery level, wear status, raw EEG and heart rate as
//! notifications once it has been sent the start command. `FlowtimeCollector`
//! decodes each stream and forwards the results as `FlowtimeEvent`s on a
//! channel, so notification callbacks only ever do a decode and a send.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::characteristic::{
    BATTERY_LEVEL, EEG_FRAME_LEN, FLOWTIME_COMMAND, FLOWTIME_EEG, FLOWTIME_HEART_RATE, FLOWTIME_WEAR,
};
use crate::codec;
use crate::error::{Error, Result};
use crate::session::{ConnectionState, DeviceSession};
use crate::soc::SocReading;
use crate::transport::Transport;

/// Written to the command characteristic to start the notification streams.
pub const START_STREAMING: u8 = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum FlowtimeEvent {
    Soc(SocReading),
    /// The headband reports 0 while it sits on a head.
    Wear { worn: bool },
    Eeg(Vec<u8>),
    HeartRate(u8),
    Disconnected,
}

pub struct FlowtimeCollector<T: Transport> {
    session: Arc<DeviceSession<T>>,
    events: mpsc::UnboundedSender<FlowtimeEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport> FlowtimeCollector<T> {
    pub fn new(session: Arc<DeviceSession<T>>) -> (Self, mpsc::UnboundedReceiver<FlowtimeEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let collector = Self {
            session,
            events,
            tasks: Mutex::new(Vec::new()),
        };
        (collector, rx)
    }

    pub fn session(&self) -> &Arc<DeviceSession<T>> {
        &self.session
    }

    /// Subscribe to every stream and send the start command. From then on a
    /// dropped link shows up as `FlowtimeEvent::Disconnected`.
    pub async fn start(&self) -> Result<()> {
        self.collect_soc().await?;

        let events = self.events.clone();
        self.session
            .subscribe(FLOWTIME_WEAR, move |payload: &[u8]| match codec::decode_u8(payload) {
                Ok(status) => {
                    let _ = events.send(FlowtimeEvent::Wear { worn: status == 0 });
                }
                Err(err) => warn!("Bad wear frame 0x{}: {err}", hex::encode(payload)),
            })
            .await?;

        let events = self.events.clone();
        self.session
            .subscribe(FLOWTIME_EEG, move |payload: &[u8]| {
                match codec::decode_fixed(payload, EEG_FRAME_LEN) {
                    Ok(samples) => {
                        let _ = events.send(FlowtimeEvent::Eeg(samples.to_vec()));
                    }
                    Err(err) => warn!("Bad EEG frame 0x{}: {err}", hex::encode(payload)),
                }
            })
            .await?;

        let events = self.events.clone();
        self.session
            .subscribe(FLOWTIME_HEART_RATE, move |payload: &[u8]| match codec::decode_u8(payload) {
                Ok(rate) => {
                    let _ = events.send(FlowtimeEvent::HeartRate(rate));
                }
                Err(err) => warn!("Bad heart rate frame 0x{}: {err}", hex::encode(payload)),
            })
            .await?;

        info!("Sending start code {START_STREAMING}");
        self.session
            .write_characteristic(FLOWTIME_COMMAND, &[START_STREAMING], true)
            .await?;
        self.watch_disconnects();
        Ok(())
    }

    /// Stop every stream and disconnect.
    pub async fn stop(&self) {
        for uuid in [BATTERY_LEVEL, FLOWTIME_WEAR, FLOWTIME_EEG, FLOWTIME_HEART_RATE] {
            self.session.unsubscribe(uuid).await;
        }
        self.session.disconnect().await;
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
    }

    /// Battery level notifications go through the calibrator, which may
    /// await, so they are handled on a task fed by a queue. Firmware without
    /// battery notifications gets a single read instead.
    async fn collect_soc(&self) -> Result<()> {
        let mut frames = match self.session.notifications(BATTERY_LEVEL).await {
            Ok(frames) => frames,
            Err(Error::Subscribe { source, .. }) => {
                warn!("Battery level notifications unavailable ({source}), reading once");
                if let Some(reading) = self.session.soc().await? {
                    let _ = self.events.send(FlowtimeEvent::Soc(reading));
                }
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let calibrator = self.session.calibrator().clone();
        let events = self.events.clone();
        self.spawn(async move {
            while let Some(frame) = frames.recv().await {
                match codec::decode_u8(&frame.payload) {
                    Ok(level) => {
                        let reading = calibrator.record_source(level).await;
                        let _ = events.send(FlowtimeEvent::Soc(reading));
                    }
                    Err(err) => warn!("Bad battery level frame 0x{}: {err}", hex::encode(&frame.payload)),
                }
            }
        });
        Ok(())
    }

    fn watch_disconnects(&self) {
        let mut states: watch::Receiver<ConnectionState> = self.session.watch_state();
        let mut previous = *states.borrow_and_update();
        let events = self.events.clone();
        self.spawn(async move {
            while states.changed().await.is_ok() {
                let current = *states.borrow_and_update();
                if previous == ConnectionState::Connected && current == ConnectionState::Disconnected {
                    let _ = events.send(FlowtimeEvent::Disconnected);
                }
                previous = current;
            }
        });
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use crate::transport::DeviceDescriptor;

    fn collector(transport: &Arc<MockTransport>) -> (FlowtimeCollector<MockTransport>, mpsc::UnboundedReceiver<FlowtimeEvent>) {
        let session = DeviceSession::new(
            transport.clone(),
            DeviceDescriptor::new("FB:EC:25:DE:1A:92").with_name("Flowtime"),
        );
        FlowtimeCollector::new(Arc::new(session))
    }

    #[tokio::test]
    async fn test_start_subscribes_and_sends_start_code() {
        let transport = Arc::new(MockTransport::new());
        let (collector, _events) = collector(&transport);

        collector.start().await.unwrap();

        for uuid in [BATTERY_LEVEL, FLOWTIME_WEAR, FLOWTIME_EEG, FLOWTIME_HEART_RATE] {
            assert!(transport.is_subscribed(uuid));
        }
        let writes = transport.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].uuid, FLOWTIME_COMMAND);
        assert_eq!(writes[0].payload, vec![START_STREAMING]);
        assert!(writes[0].ack_requested);
    }

    #[tokio::test]
    async fn test_streams_are_decoded() {
        let transport = Arc::new(MockTransport::new());
        let (collector, mut events) = collector(&transport);
        collector.start().await.unwrap();

        transport.notify(FLOWTIME_WEAR, vec![0]);
        transport.notify(FLOWTIME_HEART_RATE, vec![68]);
        transport.notify(FLOWTIME_EEG, vec![7; EEG_FRAME_LEN]);
        // Malformed frames are dropped.
        transport.notify(FLOWTIME_EEG, vec![7; 3]);

        assert_eq!(events.recv().await, Some(FlowtimeEvent::Wear { worn: true }));
        assert_eq!(events.recv().await, Some(FlowtimeEvent::HeartRate(68)));
        assert_eq!(events.recv().await, Some(FlowtimeEvent::Eeg(vec![7; EEG_FRAME_LEN])));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_soc_notifications_are_calibrated() {
        let transport = Arc::new(MockTransport::new());
        let (collector, mut events) = collector(&transport);
        collector.session().set_calibration(|x: u8| f64::from(x) / 2.0);
        collector.start().await.unwrap();

        transport.notify(BATTERY_LEVEL, vec![230]);

        match events.recv().await {
            Some(FlowtimeEvent::Soc(reading)) => {
                assert_eq!(reading.source_value, Some(230));
                assert_eq!(reading.calibrated_percentage, 115.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_soc_falls_back_to_read() {
        let transport = Arc::new(MockTransport::new());
        transport.reject_notify(BATTERY_LEVEL);
        transport.set_value(BATTERY_LEVEL, vec![88]);
        let (collector, mut events) = collector(&transport);

        collector.start().await.unwrap();

        match events.recv().await {
            Some(FlowtimeEvent::Soc(reading)) => assert_eq!(reading.calibrated_percentage, 88.0),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_link_drop_is_reported_while_streaming() {
        let transport = Arc::new(MockTransport::new());
        let (collector, mut events) = collector(&transport);
        collector.start().await.unwrap();

        transport.drop_link();

        assert_eq!(events.recv().await, Some(FlowtimeEvent::Disconnected));
        assert_eq!(collector.session().state(), ConnectionState::Disconnected);
        assert!(collector.session().router().active_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_stop_disconnects() {
        let transport = Arc::new(MockTransport::new());
        let (collector, mut events) = collector(&transport);
        collector.start().await.unwrap();

        collector.stop().await;

        assert_eq!(collector.session().state(), ConnectionState::Disconnected);
        assert!(!transport.is_subscribed(FLOWTIME_WEAR));
        assert!(!transport.notify(FLOWTIME_HEART_RATE, vec![70]));
        while let Ok(event) = events.try_recv() {
            assert_ne!(event, FlowtimeEvent::HeartRate(70));
        }
    }
}
