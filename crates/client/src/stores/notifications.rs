//! Recent informational notifications.

use std::collections::VecDeque;
use std::sync::Arc;

use courselink_shared::Notification;
use tokio::sync::watch;

use crate::realtime::NotificationSink;

pub const DEFAULT_FEED_CAPACITY: usize = 50;

/// Bounded list of notifications, oldest first. Clones share the same feed.
#[derive(Debug, Clone)]
pub struct NotificationFeed {
    capacity: usize,
    items: Arc<watch::Sender<VecDeque<Notification>>>,
}

impl Default for NotificationFeed {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_FEED_CAPACITY)
    }
}

impl NotificationFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (items, _) = watch::channel(VecDeque::new());
        Self {
            capacity: capacity.max(1),
            items: Arc::new(items),
        }
    }

    /// Append, evicting the oldest entries past capacity.
    pub fn push(&self, notification: Notification) {
        let capacity = self.capacity;
        self.items.send_modify(|items| {
            items.push_back(notification);
            while items.len() > capacity {
                items.pop_front();
            }
        });
    }

    pub fn snapshot(&self) -> Vec<Notification> {
        self.items.borrow().iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<Notification> {
        self.items.borrow().back().cloned()
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.items.send_modify(VecDeque::clear);
    }

    pub fn watch(&self) -> watch::Receiver<VecDeque<Notification>> {
        self.items.subscribe()
    }
}

impl NotificationSink for NotificationFeed {
    fn notify(&self, notification: Notification) {
        self.push(notification);
    }
}
