//! Per-subscription mailbox
//!
//! Bounded queue with drop-oldest semantics: when a subscription's consumer
//! stalls and its mailbox fills, the oldest undelivered event is dropped
//! (and counted) so the newest events survive.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

pub struct Mailbox<T> {
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> Mailbox<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Push an item; returns `true` if the oldest item was dropped to make
    /// room
    pub fn push(&self, item: T) -> bool {
        let dropped = {
            let mut queue = self.queue.lock().expect("mailbox lock");
            let dropped = if queue.len() >= self.capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(item);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    /// Await the next item in arrival order
    pub async fn pop(&self) -> T {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.queue.lock().expect("mailbox lock").pop_front() {
                return item;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("mailbox lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
