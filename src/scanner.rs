use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::session::{DeviceSession, SessionConfig};
use crate::transport::{DeviceDescriptor, Transport};

/// Default length of one scan window.
pub const DEFAULT_SCAN_WINDOW: Duration = Duration::from_secs(10);

/// Which advertisements to keep. Every predicate that is set must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Address or platform handle, compared ignoring ASCII case.
    pub identity: Option<String>,
    /// Exact advertised name.
    pub name: Option<String>,
    /// A service UUID the device must advertise, e.g. the model service.
    pub service: Option<Uuid>,
}

impl ScanFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn service(mut self, service: Uuid) -> Self {
        self.service = Some(service);
        self
    }

    pub fn matches(&self, descriptor: &DeviceDescriptor) -> bool {
        let identity_matches = match &self.identity {
            Some(identity) => descriptor.identity.eq_ignore_ascii_case(identity),
            None => true,
        };
        let name_matches = match &self.name {
            Some(name) => descriptor.name.as_deref() == Some(name.as_str()),
            None => true,
        };
        let service_matches = match self.service {
            Some(service) => descriptor.services.contains(&service),
            None => true,
        };
        identity_matches && name_matches && service_matches
    }
}

pub struct DeviceScanner<T: Transport> {
    transport: Arc<T>,
    window: Duration,
    session_config: SessionConfig,
}

impl<T: Transport> DeviceScanner<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            window: DEFAULT_SCAN_WINDOW,
            session_config: SessionConfig::default(),
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Configuration handed to every session this scanner creates.
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Scan for one window and wrap each matching peripheral in a new
    /// session. Nothing matching is not an error.
    pub async fn discover(&self, filter: &ScanFilter) -> Result<Vec<DeviceSession<T>>> {
        info!("Scanning for {:?} with {filter:?}", self.window);
        let descriptors = self.transport.scan(self.window).await.map_err(Error::Scan)?;

        let mut seen = HashSet::new();
        let sessions: Vec<DeviceSession<T>> = descriptors
            .into_iter()
            .filter(|descriptor| {
                let keep = filter.matches(descriptor);
                debug!("Found {descriptor} (match: {keep})");
                keep
            })
            .filter(|descriptor| seen.insert(descriptor.identity.clone()))
            .map(|descriptor| {
                DeviceSession::with_config(self.transport.clone(), descriptor, self.session_config.clone())
            })
            .collect();

        info!("Found {} matching device(s)", sessions.len());
        Ok(sessions)
    }
}
