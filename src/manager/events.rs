//! Lifecycle event fan-out
//!
//! Backed by a bounded broadcast channel: publishing never waits on
//! subscribers, late subscribers see only what is published after they
//! attach, and a subscriber that falls behind loses its oldest events.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::TaskLifecycleState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: String,
    pub task_name: String,
    pub alloc_id: String,
    pub state: TaskLifecycleState,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<TaskEvent>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: TaskEvent) {
        log::debug!("Event {} [{}]: {}", event.task_id, event.state, event.message);
        // Err only means nobody is listening
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
        }
    }
}

pub struct EventSubscription {
    rx: broadcast::Receiver<TaskEvent>,
}

impl EventSubscription {
    /// Next event, skipping over any this subscriber was too slow to take.
    /// `None` once the driver is gone.
    pub async fn recv(&mut self) -> Option<TaskEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Event subscriber lagged, dropped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<TaskEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    log::warn!("Event subscriber lagged, dropped {} events", n);
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(message: &str) -> TaskEvent {
        TaskEvent {
            task_id: "t1".into(),
            task_name: "web".into(),
            alloc_id: "a1".into(),
            state: TaskLifecycleState::Running,
            timestamp: Utc::now(),
            message: message.into(),
            annotations: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_no_replay() {
        let events = EventBroadcaster::new(8);
        let mut early = events.subscribe();

        events.publish(event("e1"));
        let mut late = events.subscribe();
        events.publish(event("e2"));
        events.publish(event("e3"));

        assert_eq!(early.recv().await.unwrap().message, "e1");
        assert_eq!(early.recv().await.unwrap().message, "e2");
        assert_eq!(late.recv().await.unwrap().message, "e2");
        assert_eq!(late.recv().await.unwrap().message, "e3");
        assert!(late.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_stalled_subscriber_does_not_block_others() {
        let events = EventBroadcaster::new(4);
        let _stalled = events.subscribe();
        let mut active = events.subscribe();

        for i in 0..100 {
            events.publish(event(&format!("e{}", i)));
            assert_eq!(active.recv().await.unwrap().message, format!("e{}", i));
        }
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_oldest() {
        let events = EventBroadcaster::new(2);
        let mut slow = events.subscribe();
        for i in 0..5 {
            events.publish(event(&format!("e{}", i)));
        }
        assert_eq!(slow.recv().await.unwrap().message, "e3");
        assert_eq!(slow.recv().await.unwrap().message, "e4");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let events = EventBroadcaster::new(2);
        events.publish(event("nobody"));
        let mut later = events.subscribe();
        events.publish(event("seen"));
        assert_eq!(later.recv().await.unwrap().message, "seen");
    }
}
