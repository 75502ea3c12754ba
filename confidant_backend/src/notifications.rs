use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use flume::Sender;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationContent {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationHandle(pub u64);

/// Published when a scheduled notification fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    Delivered {
        handle: NotificationHandle,
        content: NotificationContent,
    },
}

/// Platform local-notification service.
///
/// Delivery is best effort: the OS may defer or drop a trigger, and nothing
/// guarantees exactly-once delivery.
#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn schedule(
        &self,
        content: NotificationContent,
        delay: Duration,
    ) -> Result<NotificationHandle>;

    async fn cancel(&self, handle: NotificationHandle) -> Result<()>;
}

type PendingMap = Arc<Mutex<HashMap<NotificationHandle, JoinHandle<()>>>>;

/// In-process timers that publish `NotificationEvent::Delivered` on a channel
/// instead of invoking callbacks.
pub struct LocalNotificationService {
    events: Sender<NotificationEvent>,
    next_id: AtomicU64,
    pending: PendingMap,
}

impl LocalNotificationService {
    pub fn new(events: Sender<NotificationEvent>) -> Self {
        Self {
            events,
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending.lock().map(|pending| pending.len()).unwrap_or(0)
    }
}

#[async_trait]
impl NotificationService for LocalNotificationService {
    async fn schedule(
        &self,
        content: NotificationContent,
        delay: Duration,
    ) -> Result<NotificationHandle> {
        let handle = NotificationHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        // Triggers are registered in whole seconds.
        let delay = Duration::from_secs(delay.as_secs());
        let events = self.events.clone();
        let pending = self.pending.clone();

        tracing::info!(
            "Scheduling notification {:?} in {}s: {}",
            handle,
            delay.as_secs(),
            content.title
        );

        let mut pending_lock = self
            .pending
            .lock()
            .map_err(|e| anyhow::anyhow!("Notification registry lock poisoned: {}", e))?;

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Ok(mut pending) = pending.lock() {
                pending.remove(&handle);
            }
            if events
                .send_async(NotificationEvent::Delivered { handle, content })
                .await
                .is_err()
            {
                tracing::debug!("Notification {:?} fired with no subscriber", handle);
            }
        });
        pending_lock.insert(handle, task);

        Ok(handle)
    }

    async fn cancel(&self, handle: NotificationHandle) -> Result<()> {
        let task = self
            .pending
            .lock()
            .map_err(|e| anyhow::anyhow!("Notification registry lock poisoned: {}", e))?
            .remove(&handle);
        if let Some(task) = task {
            task.abort();
            tracing::debug!("Cancelled notification {:?}", handle);
        }
        Ok(())
    }
}

impl Drop for LocalNotificationService {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            for (_, task) in pending.drain() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content() -> NotificationContent {
        NotificationContent {
            title: "New message from Mia".to_string(),
            body: "Tap to read it".to_string(),
        }
    }

    #[tokio::test]
    async fn delivers_event_after_delay() {
        let (tx, rx) = flume::unbounded();
        let service = LocalNotificationService::new(tx);

        let handle = service
            .schedule(content(), Duration::from_millis(900))
            .await
            .expect("schedule");

        // Sub-second delays round down to an immediate trigger.
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv_async())
            .await
            .expect("delivered in time")
            .expect("channel open");
        assert_eq!(
            event,
            NotificationEvent::Delivered {
                handle,
                content: content()
            }
        );
        assert_eq!(service.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_notification_never_fires() {
        let (tx, rx) = flume::unbounded();
        let service = LocalNotificationService::new(tx);

        let handle = service
            .schedule(content(), Duration::from_secs(1))
            .await
            .expect("schedule");
        assert_eq!(service.pending_count(), 1);
        service.cancel(handle).await.expect("cancel");
        assert_eq!(service.pending_count(), 0);

        let outcome = tokio::time::timeout(Duration::from_millis(1500), rx.recv_async()).await;
        assert!(outcome.is_err(), "cancelled notification was delivered");
    }
}
