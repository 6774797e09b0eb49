//! `Transport` over the platform Bluetooth stack, via `bluest`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bluest::{Adapter, Characteristic, ConnectionEvent, Device};
use futures_util::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::TransportError;
use crate::transport::{DeviceDescriptor, FrameHandler, LinkLostHandler, Transport};

/// A connected device with its characteristics discovered.
#[derive(Clone)]
pub struct BluestLink {
    identity: String,
    device: Device,
    characteristics: Arc<HashMap<Uuid, Characteristic>>,
}

impl BluestLink {
    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic, TransportError> {
        self.characteristics
            .get(&uuid)
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }
}

pub struct BluestTransport {
    adapter: Adapter,
    // Devices seen while scanning, by identity. `connect` can only reach these.
    devices: Mutex<HashMap<String, Device>>,
    notifiers: Mutex<HashMap<(String, Uuid), JoinHandle<()>>>,
    watchers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl BluestTransport {
    const CONNECT_RETRIES: usize = 2;

    /// Open the default adapter and wait for it to be powered on.
    pub async fn new() -> Result<Self, TransportError> {
        let adapter = Adapter::default()
            .await
            .ok_or(TransportError::Backend("Default adapter not found".to_string()))?;
        adapter.wait_available().await?;
        Ok(Self {
            adapter,
            devices: Mutex::new(HashMap::new()),
            notifiers: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
        })
    }

    fn known_device(&self, identity: &str) -> Option<Device> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner()).get(identity).cloned()
    }

    fn stop_notifier(&self, identity: &str, uuid: Uuid) {
        let handle = self
            .notifiers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(identity.to_string(), uuid));
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    fn stop_watcher(&self, identity: &str) {
        let handle = self.watchers.lock().unwrap_or_else(|e| e.into_inner()).remove(identity);
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    async fn connect_with_retries(&self, device: &Device) -> Result<(), TransportError> {
        let mut retries = Self::CONNECT_RETRIES;
        loop {
            match self.adapter.connect_device(device).await {
                Ok(()) => return Ok(()),
                Err(err) if retries > 0 => {
                    warn!("Failed to connect: {err}, retrying");
                    retries -= 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn discover_characteristics(
        device: &Device,
    ) -> Result<HashMap<Uuid, Characteristic>, TransportError> {
        let mut characteristics = HashMap::new();
        for service in device.discover_services().await? {
            for characteristic in service.discover_characteristics().await? {
                debug!("  {} / {}", service.uuid(), characteristic.uuid());
                characteristics.insert(characteristic.uuid(), characteristic);
            }
        }
        Ok(characteristics)
    }
}

#[async_trait]
impl Transport for BluestTransport {
    type Link = BluestLink;

    async fn connect(&self, identity: &str) -> Result<BluestLink, TransportError> {
        let device = self
            .known_device(identity)
            .ok_or_else(|| TransportError::DeviceNotFound(identity.to_string()))?;

        if !device.is_connected().await {
            self.connect_with_retries(&device).await?;
        }
        let characteristics = Self::discover_characteristics(&device).await?;
        info!("{identity}: {} characteristics", characteristics.len());

        Ok(BluestLink {
            identity: identity.to_string(),
            device,
            characteristics: Arc::new(characteristics),
        })
    }

    async fn disconnect(&self, link: &BluestLink) {
        self.stop_watcher(&link.identity);
        let uuids: Vec<Uuid> = link.characteristics.keys().copied().collect();
        for uuid in uuids {
            self.stop_notifier(&link.identity, uuid);
        }
        if let Err(err) = self.adapter.disconnect_device(&link.device).await {
            warn!("{}: disconnect failed: {err}", link.identity);
        }
    }

    async fn is_connected(&self, link: &BluestLink) -> bool {
        link.device.is_connected().await
    }

    /// Connection events are read on a dedicated task, like notifications.
    async fn watch_link(&self, link: &BluestLink, on_lost: LinkLostHandler) -> Result<(), TransportError> {
        let adapter = self.adapter.clone();
        let device = link.device.clone();
        let identity = link.identity.clone();
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut events = match adapter.device_connection_events(&device).await {
                Ok(events) => {
                    let _ = ready_tx.send(Ok(()));
                    events
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(TransportError::from(err)));
                    return;
                }
            };
            while let Some(event) = events.next().await {
                if matches!(event, ConnectionEvent::Disconnected) {
                    info!("{identity}: link lost");
                    on_lost();
                    break;
                }
            }
        });

        self.stop_watcher(&link.identity);
        self.watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(link.identity.clone(), handle);

        ready_rx
            .await
            .map_err(|_| TransportError::Backend("link watch task ended".to_string()))?
    }

    async fn characteristics(&self, link: &BluestLink) -> Result<Vec<Uuid>, TransportError> {
        let mut uuids: Vec<Uuid> = link.characteristics.keys().copied().collect();
        uuids.sort();
        Ok(uuids)
    }

    async fn read_characteristic(
        &self,
        link: &BluestLink,
        uuid: Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        Ok(link.characteristic(uuid)?.read().await?)
    }

    async fn write_characteristic(
        &self,
        link: &BluestLink,
        uuid: Uuid,
        payload: &[u8],
        ack_requested: bool,
    ) -> Result<(), TransportError> {
        let characteristic = link.characteristic(uuid)?;
        if ack_requested {
            characteristic.write(payload).await?;
        } else {
            characteristic.write_without_response(payload).await?;
        }
        Ok(())
    }

    /// Notifications are read on a dedicated task; dropping the stream (on
    /// unsubscribe or disconnect) stops them.
    async fn subscribe_notify(
        &self,
        link: &BluestLink,
        uuid: Uuid,
        on_frame: FrameHandler,
    ) -> Result<(), TransportError> {
        let characteristic = link.characteristic(uuid)?.clone();
        let identity = link.identity.clone();
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut frames = match characteristic.notify().await {
                Ok(frames) => {
                    let _ = ready_tx.send(Ok(()));
                    frames
                }
                Err(err) => {
                    warn!("{identity}: notify on {uuid} refused: {err}");
                    let _ = ready_tx.send(Err(TransportError::NotifyUnsupported(uuid)));
                    return;
                }
            };
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(data) => on_frame(data),
                    Err(err) => {
                        warn!("{identity}: notification error on {uuid}: {err}");
                        break;
                    }
                }
            }
            debug!("{identity}: end of notification stream on {uuid}");
        });

        self.stop_notifier(&link.identity, uuid);
        self.notifiers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((link.identity.clone(), uuid), handle);

        ready_rx
            .await
            .map_err(|_| TransportError::Backend("notification task ended".to_string()))?
    }

    async fn unsubscribe_notify(&self, link: &BluestLink, uuid: Uuid) -> Result<(), TransportError> {
        self.stop_notifier(&link.identity, uuid);
        Ok(())
    }

    async fn scan(&self, window: Duration) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let mut adverts = self.adapter.scan(&[]).await?;
        let deadline = Instant::now() + window;
        let mut found = Vec::new();

        while let Ok(Some(advert)) = timeout_at(deadline, adverts.next()).await {
            let identity = advert.device.id().to_string();
            let name = match advert.adv_data.local_name.clone() {
                Some(name) => Some(name),
                None => advert.device.name_async().await.ok(),
            };
            let mut descriptor = DeviceDescriptor::new(identity.clone());
            descriptor.name = name;
            descriptor.services = advert.adv_data.services.iter().copied().collect();

            self.devices
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(identity, advert.device);
            found.push(descriptor);
        }

        Ok(found)
    }
}
