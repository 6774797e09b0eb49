use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::{FrameHandler, Transport};

/// Receives the raw payload of each notification. Decoding is up to the
/// subscriber since every stream has its own payload shape.
pub type NotificationCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

struct NotificationSubscription {
    callback: NotificationCallback,
    active: bool,
}

/// Routes notification frames to the callback registered for their
/// characteristic. One subscription per characteristic; subscribing again
/// replaces the previous callback.
#[derive(Default)]
pub struct NotificationRouter {
    subscriptions: RwLock<HashMap<Uuid, NotificationSubscription>>,
}

impl std::fmt::Debug for NotificationRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationRouter")
            .field("active", &self.active_subscriptions())
            .finish()
    }
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `uuid` and ask the transport to start
    /// notifying. If the transport refuses, whatever was registered for
    /// `uuid` before is put back.
    pub async fn subscribe<T: Transport>(
        self: &Arc<Self>,
        transport: &T,
        link: &T::Link,
        uuid: Uuid,
        callback: NotificationCallback,
    ) -> Result<()> {
        let previous = self.register(uuid, callback);

        let router = Arc::downgrade(self);
        let on_frame: FrameHandler = Arc::new(move |frame: Vec<u8>| {
            if let Some(router) = router.upgrade() {
                router.dispatch(uuid, &frame);
            }
        });

        if let Err(source) = transport.subscribe_notify(link, uuid, on_frame).await {
            warn!("Failed to start notifications on {uuid}: {source}");
            self.restore(uuid, previous);
            return Err(Error::Subscribe { uuid, source });
        }
        info!("Notifications started on {uuid}");
        Ok(())
    }

    /// Stop routing `uuid` and ask the transport to stop notifying. A
    /// transport that already lost the link counts as stopped.
    pub async fn unsubscribe<T: Transport>(&self, transport: &T, link: Option<&T::Link>, uuid: Uuid) {
        self.deactivate(uuid);
        let Some(link) = link else {
            return;
        };
        match transport.unsubscribe_notify(link, uuid).await {
            Ok(()) => info!("Notifications stopped on {uuid}"),
            Err(err) => debug!("Stopping notifications on {uuid}: {err}, treating as stopped"),
        }
    }

    /// Deliver one inbound frame. Frames for characteristics without an
    /// active subscription are dropped.
    pub fn dispatch(&self, uuid: Uuid, frame: &[u8]) {
        let callback = {
            let subscriptions = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
            match subscriptions.get(&uuid) {
                Some(sub) if sub.active => Some(sub.callback.clone()),
                _ => None,
            }
        };
        match callback {
            Some(callback) => callback(frame),
            None => debug!("Dropping notification on {uuid}: 0x{}", hex::encode(frame)),
        }
    }

    pub fn is_active(&self, uuid: Uuid) -> bool {
        self.subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&uuid)
            .is_some_and(|sub| sub.active)
    }

    pub fn active_subscriptions(&self) -> Vec<Uuid> {
        let subscriptions = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
        let mut active: Vec<Uuid> = subscriptions
            .iter()
            .filter(|(_, sub)| sub.active)
            .map(|(uuid, _)| *uuid)
            .collect();
        active.sort();
        active
    }

    /// Mark every subscription inactive, e.g. because the link went away.
    pub fn deactivate_all(&self) {
        let mut subscriptions = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        for sub in subscriptions.values_mut() {
            sub.active = false;
        }
    }

    fn register(&self, uuid: Uuid, callback: NotificationCallback) -> Option<NotificationSubscription> {
        let previous = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(uuid, NotificationSubscription { callback, active: true });
        if previous.is_some() {
            debug!("Replacing subscription on {uuid}");
        }
        previous
    }

    fn deactivate(&self, uuid: Uuid) {
        let mut subscriptions = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        if let Some(sub) = subscriptions.get_mut(&uuid) {
            sub.active = false;
        }
    }

    fn restore(&self, uuid: Uuid, previous: Option<NotificationSubscription>) {
        let mut subscriptions = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        match previous {
            Some(previous) => subscriptions.insert(uuid, previous),
            None => subscriptions.remove(&uuid),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::characteristic::{FLOWTIME_EEG, FLOWTIME_HEART_RATE, FLOWTIME_WEAR};
    use crate::error::TransportError;
    use crate::mock::MockTransport;
    use std::sync::Mutex;

    fn recorder() -> (NotificationCallback, Arc<Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: NotificationCallback =
            Arc::new(move |frame: &[u8]| sink.lock().unwrap().push(frame.to_vec()));
        (callback, seen)
    }

    #[test]
    fn test_dispatch_without_subscription_is_noop() {
        let router = NotificationRouter::new();
        router.dispatch(FLOWTIME_WEAR, &[0x00]);
        assert!(router.active_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_second_subscribe_replaces_first() {
        let transport = MockTransport::new();
        let link = transport.connect("dev").await.unwrap();
        let router = Arc::new(NotificationRouter::new());

        let (first, first_seen) = recorder();
        let (second, second_seen) = recorder();
        router.subscribe(&transport, &link, FLOWTIME_HEART_RATE, first).await.unwrap();
        router.subscribe(&transport, &link, FLOWTIME_HEART_RATE, second).await.unwrap();

        router.dispatch(FLOWTIME_HEART_RATE, &[72]);

        assert!(first_seen.lock().unwrap().is_empty());
        assert_eq!(*second_seen.lock().unwrap(), vec![vec![72]]);
    }

    #[tokio::test]
    async fn test_transport_frames_reach_callback() {
        let transport = MockTransport::new();
        let link = transport.connect("dev").await.unwrap();
        let router = Arc::new(NotificationRouter::new());

        let (callback, seen) = recorder();
        router.subscribe(&transport, &link, FLOWTIME_EEG, callback).await.unwrap();
        assert!(transport.notify(FLOWTIME_EEG, vec![1; 20]));

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_subscribe_is_not_registered() {
        let transport = MockTransport::new();
        transport.reject_notify(FLOWTIME_WEAR);
        let link = transport.connect("dev").await.unwrap();
        let router = Arc::new(NotificationRouter::new());

        let (callback, _) = recorder();
        let result = router.subscribe(&transport, &link, FLOWTIME_WEAR, callback).await;

        assert_eq!(
            result,
            Err(Error::Subscribe {
                uuid: FLOWTIME_WEAR,
                source: TransportError::NotifyUnsupported(FLOWTIME_WEAR),
            })
        );
        assert!(!router.is_active(FLOWTIME_WEAR));
    }

    #[tokio::test]
    async fn test_rejected_resubscribe_keeps_working_callback() {
        let transport = MockTransport::new();
        let link = transport.connect("dev").await.unwrap();
        let router = Arc::new(NotificationRouter::new());

        let (first, first_seen) = recorder();
        router.subscribe(&transport, &link, FLOWTIME_WEAR, first).await.unwrap();

        transport.reject_notify(FLOWTIME_WEAR);
        let (second, second_seen) = recorder();
        let result = router.subscribe(&transport, &link, FLOWTIME_WEAR, second).await;
        assert!(matches!(result, Err(Error::Subscribe { .. })));

        assert!(transport.notify(FLOWTIME_WEAR, vec![0x00]));
        assert_eq!(*first_seen.lock().unwrap(), vec![vec![0x00]]);
        assert!(second_seen.lock().unwrap().is_empty());
        assert!(router.is_active(FLOWTIME_WEAR));
    }

    #[tokio::test]
    async fn test_unsubscribe_tolerates_lost_link() {
        let transport = MockTransport::new();
        let link = transport.connect("dev").await.unwrap();
        let router = Arc::new(NotificationRouter::new());

        let (callback, seen) = recorder();
        router.subscribe(&transport, &link, FLOWTIME_WEAR, callback).await.unwrap();
        transport.drop_link();
        router.unsubscribe(&transport, Some(&link), FLOWTIME_WEAR).await;

        router.dispatch(FLOWTIME_WEAR, &[0x00]);
        assert!(seen.lock().unwrap().is_empty());
        assert!(!router.is_active(FLOWTIME_WEAR));
    }
}
