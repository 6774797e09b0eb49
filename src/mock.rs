//! An in-memory `Transport` for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::TransportError;
use crate::transport::{DeviceDescriptor, FrameHandler, LinkLostHandler, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockLink {
    pub identity: String,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub uuid: Uuid,
    pub payload: Vec<u8>,
    pub ack_requested: bool,
}

#[derive(Default)]
struct MockState {
    devices: Vec<DeviceDescriptor>,
    values: HashMap<Uuid, Vec<u8>>,
    failing_connects: usize,
    connect_delay: Option<Duration>,
    failing_writes: bool,
    rejected_notify: HashSet<Uuid>,
    handlers: HashMap<Uuid, FrameHandler>,
    watchers: Vec<(u64, LinkLostHandler)>,
    live_generation: Option<u64>,
    generation: u64,
    writes: Vec<RecordedWrite>,
}

/// Scriptable transport: canned characteristic values and scan results,
/// injectable failures, and counters for what the session asked of it.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: Vec<DeviceDescriptor>) -> Self {
        let transport = Self::new();
        transport.lock().devices = devices;
        transport
    }

    pub fn set_value(&self, uuid: Uuid, value: impl Into<Vec<u8>>) {
        self.lock().values.insert(uuid, value.into());
    }

    pub fn value(&self, uuid: Uuid) -> Option<Vec<u8>> {
        self.lock().values.get(&uuid).cloned()
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.lock().failing_connects = count;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = Some(delay);
    }

    pub fn fail_writes(&self, failing: bool) {
        self.lock().failing_writes = failing;
    }

    pub fn reject_notify(&self, uuid: Uuid) {
        self.lock().rejected_notify.insert(uuid);
    }

    /// Simulate the peripheral going away without a disconnect call. Anyone
    /// watching the live link hears about it.
    pub fn drop_link(&self) {
        let lost: Vec<LinkLostHandler> = {
            let mut state = self.lock();
            let live = state.live_generation.take();
            state.handlers.clear();
            std::mem::take(&mut state.watchers)
                .into_iter()
                .filter(|(generation, _)| Some(*generation) == live)
                .map(|(_, on_lost)| on_lost)
                .collect()
        };
        for on_lost in lost {
            on_lost();
        }
    }

    /// Push a notification frame. Returns whether anything was subscribed.
    pub fn notify(&self, uuid: Uuid, frame: impl Into<Vec<u8>>) -> bool {
        let handler = self.lock().handlers.get(&uuid).cloned();
        match handler {
            Some(handler) => {
                handler(frame.into());
                true
            }
            None => false,
        }
    }

    pub fn is_subscribed(&self, uuid: Uuid) -> bool {
        self.lock().handlers.contains_key(&uuid)
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.lock().writes.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_link(&self, link: &MockLink) -> Result<(), TransportError> {
        if self.lock().live_generation == Some(link.generation) {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Link = MockLink;

    async fn connect(&self, identity: &str) -> Result<MockLink, TransportError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.lock().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(TransportError::Backend("connection refused".to_string()));
        }
        state.generation += 1;
        state.live_generation = Some(state.generation);
        Ok(MockLink {
            identity: identity.to_string(),
            generation: state.generation,
        })
    }

    async fn disconnect(&self, link: &MockLink) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        if state.live_generation == Some(link.generation) {
            state.live_generation = None;
            state.handlers.clear();
        }
        state.watchers.retain(|(generation, _)| *generation != link.generation);
    }

    async fn is_connected(&self, link: &MockLink) -> bool {
        self.check_link(link).is_ok()
    }

    async fn watch_link(&self, link: &MockLink, on_lost: LinkLostHandler) -> Result<(), TransportError> {
        self.check_link(link)?;
        self.lock().watchers.push((link.generation, on_lost));
        Ok(())
    }

    async fn characteristics(&self, link: &MockLink) -> Result<Vec<Uuid>, TransportError> {
        self.check_link(link)?;
        let mut uuids: Vec<Uuid> = self.lock().values.keys().copied().collect();
        uuids.sort();
        Ok(uuids)
    }

    async fn read_characteristic(
        &self,
        link: &MockLink,
        uuid: Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        self.check_link(link)?;
        self.value(uuid).ok_or(TransportError::CharacteristicNotFound(uuid))
    }

    async fn write_characteristic(
        &self,
        link: &MockLink,
        uuid: Uuid,
        payload: &[u8],
        ack_requested: bool,
    ) -> Result<(), TransportError> {
        self.check_link(link)?;
        let mut state = self.lock();
        if state.failing_writes {
            return Err(TransportError::Backend("write not permitted".to_string()));
        }
        state.values.insert(uuid, payload.to_vec());
        state.writes.push(RecordedWrite {
            uuid,
            payload: payload.to_vec(),
            ack_requested,
        });
        Ok(())
    }

    async fn subscribe_notify(
        &self,
        link: &MockLink,
        uuid: Uuid,
        on_frame: FrameHandler,
    ) -> Result<(), TransportError> {
        self.check_link(link)?;
        let mut state = self.lock();
        if state.rejected_notify.contains(&uuid) {
            return Err(TransportError::NotifyUnsupported(uuid));
        }
        state.handlers.insert(uuid, on_frame);
        Ok(())
    }

    async fn unsubscribe_notify(&self, link: &MockLink, uuid: Uuid) -> Result<(), TransportError> {
        self.check_link(link)?;
        self.lock().handlers.remove(&uuid);
        Ok(())
    }

    async fn scan(&self, _window: Duration) -> Result<Vec<DeviceDescriptor>, TransportError> {
        Ok(self.lock().devices.clone())
    }
}
