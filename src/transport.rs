//! The seam between this crate and a Bluetooth stack.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::TransportError;

/// A snapshot of one advertisement seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Opaque address or platform handle, whatever `Transport::connect` accepts.
    pub identity: String,
    pub name: Option<String>,
    pub services: BTreeSet<Uuid>,
}

impl DeviceDescriptor {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            name: None,
            services: BTreeSet::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_service(mut self, service: Uuid) -> Self {
        self.services.insert(service);
        self
    }
}

impl std::fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}: {}", self.identity, name),
            None => write!(f, "{}", self.identity),
        }
    }
}

/// Called by the transport with each raw notification frame. It runs on the
/// transport's delivery context and must not block.
pub type FrameHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Called by the transport at most once when a link goes down without a
/// `disconnect` call, e.g. the peripheral walked out of range.
pub type LinkLostHandler = Arc<dyn Fn() + Send + Sync>;

/// The primitives a Bluetooth stack has to provide.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// An established connection to one peripheral.
    type Link: Clone + Send + Sync + 'static;

    async fn connect(&self, identity: &str) -> Result<Self::Link, TransportError>;

    /// Best effort. Never fails observably.
    async fn disconnect(&self, link: &Self::Link);

    /// Whether the link is still up. Used to detect drops the peripheral
    /// initiated.
    async fn is_connected(&self, link: &Self::Link) -> bool;

    /// Report a drop of `link` through `on_lost`. Watching ends when the link
    /// is disconnected.
    async fn watch_link(&self, link: &Self::Link, on_lost: LinkLostHandler)
        -> Result<(), TransportError>;

    /// Every characteristic the peripheral exposes on this link.
    async fn characteristics(&self, link: &Self::Link) -> Result<Vec<Uuid>, TransportError>;

    async fn read_characteristic(
        &self,
        link: &Self::Link,
        uuid: Uuid,
    ) -> Result<Vec<u8>, TransportError>;

    async fn write_characteristic(
        &self,
        link: &Self::Link,
        uuid: Uuid,
        payload: &[u8],
        ack_requested: bool,
    ) -> Result<(), TransportError>;

    async fn subscribe_notify(
        &self,
        link: &Self::Link,
        uuid: Uuid,
        on_frame: FrameHandler,
    ) -> Result<(), TransportError>;

    async fn unsubscribe_notify(&self, link: &Self::Link, uuid: Uuid)
        -> Result<(), TransportError>;

    /// Scan once for `window` and return everything seen.
    async fn scan(&self, window: Duration) -> Result<Vec<DeviceDescriptor>, TransportError>;
}
