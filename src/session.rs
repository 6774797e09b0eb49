//! A session with one peripheral.
//!
//! The session owns the connection state machine:
//!
//! ```text
//! Disconnected --ensure_connected--> Connecting --ok--> Connected
//!                                        |                  |
//!                                        +--err--+          | disconnect / link dropped
//!                                                v          v
//!                                           Disconnected <--+
//! ```
//!
//! Every characteristic operation goes through `ensure_connected` first, so
//! callers never have to connect explicitly. Concurrent callers share a single
//! connect attempt. Once connected, the transport reports a link the
//! peripheral dropped, so the state follows even when nobody is calling in.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::characteristic::{
    BATTERY_LEVEL, CONNECTION_PARAMETERS, DEVICE_NAME, FIRMWARE_VERSION, HARDWARE_VERSION,
    MAC_ADDRESS, MANUFACTURER_NAME, MODEL_NUMBER, SERIAL_NUMBER,
};
use crate::codec;
use crate::error::{Error, Result, TransportError};
use crate::router::NotificationRouter;
use crate::soc::{Calibration, SocCalibrator, SocReading};
use crate::transport::{DeviceDescriptor, LinkLostHandler, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What to do when the transport rejects a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteFailurePolicy {
    /// Log the failure and report success. A failed write cannot take down a
    /// long running session.
    #[default]
    Log,
    /// Return `Error::Write` to the caller.
    Surface,
}

/// Configuration for session behavior
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub write_failure_policy: WriteFailurePolicy,
}

/// One notification frame, as delivered by `DeviceSession::notifications`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub uuid: Uuid,
    pub received_at: SystemTime,
    pub payload: Vec<u8>,
}

struct LinkSlot<L> {
    handle: Option<L>,
    last_failure: Option<TransportError>,
}

/// Puts the state back to Disconnected if a connect attempt is abandoned
/// before it settles, e.g. the caller was cancelled by a timeout.
struct ConnectingGuard<'a> {
    state: &'a watch::Sender<ConnectionState>,
    armed: bool,
}

impl<'a> ConnectingGuard<'a> {
    fn arm(state: &'a watch::Sender<ConnectionState>) -> Self {
        state.send_replace(ConnectionState::Connecting);
        Self { state, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("Connect attempt abandoned");
            self.state.send_replace(ConnectionState::Disconnected);
        }
    }
}

pub struct DeviceSession<T: Transport> {
    transport: Arc<T>,
    descriptor: DeviceDescriptor,
    config: SessionConfig,
    link: Mutex<LinkSlot<T::Link>>,
    // Completed connect attempts, read without the lock to tell whether an
    // attempt finished while we were waiting for it.
    attempts: AtomicU64,
    // Bumped whenever a link is established or torn down; a drop report for
    // an older link is stale.
    link_generation: Arc<AtomicU64>,
    state: Arc<watch::Sender<ConnectionState>>,
    soc: Arc<SocCalibrator>,
    router: Arc<NotificationRouter>,
}

impl<T: Transport> std::fmt::Debug for DeviceSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("descriptor", &self.descriptor)
            .field("state", &self.state())
            .field("soc", &self.soc)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> DeviceSession<T> {
    pub fn new(transport: Arc<T>, descriptor: DeviceDescriptor) -> Self {
        Self::with_config(transport, descriptor, SessionConfig::default())
    }

    pub fn with_config(transport: Arc<T>, descriptor: DeviceDescriptor, config: SessionConfig) -> Self {
        info!("Device initialized: {descriptor}");
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            descriptor,
            config,
            link: Mutex::new(LinkSlot { handle: None, last_failure: None }),
            attempts: AtomicU64::new(0),
            link_generation: Arc::new(AtomicU64::new(0)),
            state: Arc::new(state),
            soc: Arc::new(SocCalibrator::new()),
            router: Arc::new(NotificationRouter::new()),
        }
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn identity(&self) -> &str {
        &self.descriptor.identity
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Follow state transitions, including drops the peripheral initiated.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn calibrator(&self) -> &Arc<SocCalibrator> {
        &self.soc
    }

    pub fn set_calibration(&self, calibration: impl Calibration + 'static) {
        self.soc.set_calibration(Arc::new(calibration));
    }

    pub fn router(&self) -> &Arc<NotificationRouter> {
        &self.router
    }

    /// Return the live link, connecting first if needed.
    ///
    /// Callers that arrive while an attempt is in flight wait for it and share
    /// its outcome, failures included.
    pub async fn ensure_connected(&self) -> Result<T::Link> {
        let seen = self.attempts.load(Ordering::Acquire);
        let mut slot = self.link.lock().await;

        if let Some(link) = slot.handle.take() {
            if self.state() == ConnectionState::Connected && self.transport.is_connected(&link).await {
                slot.handle = Some(link.clone());
                return Ok(link);
            }
            warn!("{}: discarding dead link", self.descriptor);
            self.link_generation.fetch_add(1, Ordering::AcqRel);
            self.transport.disconnect(&link).await;
            self.router.deactivate_all();
            self.set_state(ConnectionState::Disconnected);
        }

        if self.attempts.load(Ordering::Acquire) != seen {
            if let Some(source) = slot.last_failure.clone() {
                return Err(self.connection_error(source));
            }
        }

        info!("Connecting to {}", self.descriptor);
        let connecting = ConnectingGuard::arm(&self.state);
        let result = self.transport.connect(&self.descriptor.identity).await;
        self.attempts.fetch_add(1, Ordering::AcqRel);
        connecting.disarm();

        match result {
            Ok(link) => {
                slot.handle = Some(link.clone());
                slot.last_failure = None;
                let generation = self.link_generation.fetch_add(1, Ordering::AcqRel) + 1;
                self.set_state(ConnectionState::Connected);
                info!("Connected to {}", self.descriptor);
                self.watch_link(&link, generation).await;
                Ok(link)
            }
            Err(source) => {
                warn!("Failed to connect to {}: {source}", self.descriptor);
                slot.last_failure = Some(source.clone());
                self.set_state(ConnectionState::Disconnected);
                Err(self.connection_error(source))
            }
        }
    }

    /// Have the transport report a drop of `link`. Without it, a drop is only
    /// noticed by the next `ensure_connected`.
    async fn watch_link(&self, link: &T::Link, generation: u64) {
        let current = self.link_generation.clone();
        let state = self.state.clone();
        let router = Arc::downgrade(&self.router);
        let descriptor = self.descriptor.to_string();

        let on_lost: LinkLostHandler = Arc::new(move || {
            if current.load(Ordering::Acquire) != generation {
                return;
            }
            let dropped = state.send_if_modified(|state| {
                if *state == ConnectionState::Connected {
                    *state = ConnectionState::Disconnected;
                    true
                } else {
                    false
                }
            });
            if dropped {
                warn!("{descriptor}: link dropped by peripheral");
                if let Some(router) = router.upgrade() {
                    router.deactivate_all();
                }
            }
        });

        if let Err(err) = self.transport.watch_link(link, on_lost).await {
            warn!("{}: cannot watch link: {err}", self.descriptor);
        }
    }

    /// Disconnect if connected. The session always ends up Disconnected.
    pub async fn disconnect(&self) {
        let mut slot = self.link.lock().await;
        self.link_generation.fetch_add(1, Ordering::AcqRel);
        if let Some(link) = slot.handle.take() {
            info!("Disconnecting from {}", self.descriptor);
            self.transport.disconnect(&link).await;
            info!("Disconnected from {}", self.descriptor);
        }
        self.router.deactivate_all();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Every characteristic the peripheral exposes, connecting first if needed.
    pub async fn characteristics(&self) -> Result<Vec<Uuid>> {
        let link = self.ensure_connected().await?;
        self.transport
            .characteristics(&link)
            .await
            .map_err(Error::Discovery)
    }

    /// Read a characteristic, surfacing transport failures.
    pub async fn try_read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>> {
        let link = self.ensure_connected().await?;
        let data = self
            .transport
            .read_characteristic(&link, uuid)
            .await
            .map_err(|source| Error::Read { uuid, source })?;
        debug!("RX {uuid}: 0x{}", hex::encode(&data));
        Ok(data)
    }

    /// Read a characteristic. A characteristic the firmware does not have,
    /// or any other read failure, gives `None`.
    pub async fn read_characteristic(&self, uuid: Uuid) -> Result<Option<Vec<u8>>> {
        match self.try_read_characteristic(uuid).await {
            Ok(data) => Ok(Some(data)),
            Err(err @ Error::Read { .. }) => {
                error!("Error reading from {}: {err}", self.descriptor);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Write a characteristic. Transport failures are handled according to
    /// the configured `WriteFailurePolicy`.
    pub async fn write_characteristic(&self, uuid: Uuid, payload: &[u8], ack_requested: bool) -> Result<()> {
        let link = self.ensure_connected().await?;
        debug!("TX {uuid}: 0x{}", hex::encode(payload));
        let Err(source) = self
            .transport
            .write_characteristic(&link, uuid, payload, ack_requested)
            .await
        else {
            return Ok(());
        };

        let err = Error::Write { uuid, source };
        match self.config.write_failure_policy {
            WriteFailurePolicy::Log => {
                error!("Error writing to {}: {err}", self.descriptor);
                Ok(())
            }
            WriteFailurePolicy::Surface => Err(err),
        }
    }

    /// Route notifications on `uuid` to `callback`, replacing any previous
    /// subscription on it.
    pub async fn subscribe<F>(&self, uuid: Uuid, callback: F) -> Result<()>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let link = self.ensure_connected().await?;
        self.router
            .subscribe(self.transport.as_ref(), &link, uuid, Arc::new(callback))
            .await
    }

    /// Queue notifications on `uuid` instead of handling them in a callback.
    pub async fn notifications(&self, uuid: Uuid) -> Result<mpsc::UnboundedReceiver<Notification>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(uuid, move |payload: &[u8]| {
            let _ = tx.send(Notification {
                uuid,
                received_at: SystemTime::now(),
                payload: payload.to_vec(),
            });
        })
        .await?;
        Ok(rx)
    }

    /// Stop notifications on `uuid`. Does not connect just to unsubscribe.
    pub async fn unsubscribe(&self, uuid: Uuid) {
        let link = self.link.lock().await.handle.clone();
        self.router
            .unsubscribe(self.transport.as_ref(), link.as_ref(), uuid)
            .await;
    }

    pub async fn name(&self) -> Result<Option<String>> {
        self.read_text(DEVICE_NAME).await
    }

    pub async fn set_name(&self, name: &str, ack_requested: bool) -> Result<()> {
        self.write_characteristic(DEVICE_NAME, &codec::encode_utf8(name), ack_requested)
            .await
    }

    pub async fn model(&self) -> Result<Option<String>> {
        self.read_text(MODEL_NUMBER).await
    }

    pub async fn manufacturer(&self) -> Result<Option<String>> {
        self.read_text(MANUFACTURER_NAME).await
    }

    pub async fn firmware_version(&self) -> Result<Option<String>> {
        self.read_text(FIRMWARE_VERSION).await
    }

    pub async fn hardware_version(&self) -> Result<Option<String>> {
        self.read_text(HARDWARE_VERSION).await
    }

    pub async fn connection_parameters(&self) -> Result<Option<String>> {
        self.read_text(CONNECTION_PARAMETERS).await
    }

    /// Some units report serial numbers that are not valid UTF-8; those read
    /// as `None`.
    pub async fn serial_number(&self) -> Result<Option<String>> {
        let Some(data) = self.read_characteristic(SERIAL_NUMBER).await? else {
            return Ok(None);
        };
        match codec::decode_utf8(&data) {
            Ok(serial) => Ok(Some(serial)),
            Err(err) => {
                warn!("Ignoring malformed serial number 0x{}: {err}", hex::encode(&data));
                Ok(None)
            }
        }
    }

    pub async fn mac_address(&self) -> Result<Option<String>> {
        match self.read_characteristic(MAC_ADDRESS).await? {
            Some(data) => Ok(Some(codec::decode_mac_address(&data)?)),
            None => Ok(None),
        }
    }

    /// Read the battery level and feed it through the calibrator.
    pub async fn soc(&self) -> Result<Option<SocReading>> {
        match self.read_characteristic(BATTERY_LEVEL).await? {
            Some(data) => {
                let level = codec::decode_u8(&data)?;
                Ok(Some(self.soc.record_source(level).await))
            }
            None => Ok(None),
        }
    }

    async fn read_text(&self, uuid: Uuid) -> Result<Option<String>> {
        match self.read_characteristic(uuid).await? {
            Some(data) => Ok(Some(codec::decode_utf8(&data)?)),
            None => Ok(None),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn connection_error(&self, source: TransportError) -> Error {
        Error::Connection {
            identity: self.descriptor.identity.clone(),
            source,
        }
    }
}
