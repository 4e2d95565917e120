// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide delivery table for inter-thread publish/subscribe.
//!
//! Each subscribing thread owns one [`Mailbox`]. The hub maps a (type, group)
//! key to the mailboxes of every thread holding at least one subscription for
//! it. Publishing pushes a shared payload into each mailbox and wakes the
//! owning thread's notifier; dispatch happens later in that thread's poll.

use crate::group::Group;
use crate::poller::PollNotifier;
use parking_lot::{Mutex, RwLock};
use std::any::{Any, TypeId};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Type-erased shared payload.
pub(crate) type Payload = Arc<dyn Any + Send + Sync>;

/// Routing key: payload type plus group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct LocalKey {
    type_id: TypeId,
    type_name: &'static str,
    group: Group,
}

impl LocalKey {
    pub(crate) fn of<D: Any>(group: &Group) -> Self {
        Self {
            type_id: TypeId::of::<D>(),
            type_name: std::any::type_name::<D>(),
            group: group.clone(),
        }
    }

    pub(crate) fn group(&self) -> &Group {
        &self.group
    }

    pub(crate) fn type_name(&self) -> &'static str {
        self.type_name
    }
}

pub(crate) struct Delivery {
    pub(crate) key: LocalKey,
    pub(crate) payload: Payload,
}

/// Per-thread inbound queue.
pub(crate) struct Mailbox {
    thread_id: u64,
    queue: Mutex<VecDeque<Delivery>>,
    notifier: Arc<PollNotifier>,
}

impl Mailbox {
    pub(crate) fn new(thread_id: u64, notifier: Arc<PollNotifier>) -> Arc<Self> {
        Arc::new(Self {
            thread_id,
            queue: Mutex::new(VecDeque::new()),
            notifier,
        })
    }

    fn push(&self, delivery: Delivery) {
        self.queue.lock().push_back(delivery);
        self.notifier.notify();
    }

    pub(crate) fn drain(&self) -> VecDeque<Delivery> {
        std::mem::take(&mut *self.queue.lock())
    }

    pub(crate) fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

/// Inter-thread delivery table owned by the [`TransportRuntime`](crate::TransportRuntime).
#[derive(Default)]
pub struct InterThreadHub {
    subscribers: RwLock<HashMap<LocalKey, Vec<Arc<Mailbox>>>>,
    published: AtomicU64,
    delivered: AtomicU64,
}

impl InterThreadHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `mailbox` for `key`; a thread is listed at most once per key.
    pub(crate) fn register(&self, key: &LocalKey, mailbox: &Arc<Mailbox>) {
        let mut subscribers = self.subscribers.write();
        let entry = subscribers.entry(key.clone()).or_default();
        if !entry.iter().any(|m| m.thread_id == mailbox.thread_id) {
            entry.push(Arc::clone(mailbox));
            log::debug!(
                "[interthread] thread {} subscribed to {} on '{}'",
                mailbox.thread_id,
                key.type_name,
                key.group
            );
        }
    }

    pub(crate) fn deregister(&self, key: &LocalKey, thread_id: u64) {
        let mut subscribers = self.subscribers.write();
        if let Some(entry) = subscribers.get_mut(key) {
            entry.retain(|m| m.thread_id != thread_id);
            if entry.is_empty() {
                subscribers.remove(key);
            }
        }
    }

    pub(crate) fn deregister_all(&self, thread_id: u64) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|_, entry| {
            entry.retain(|m| m.thread_id != thread_id);
            !entry.is_empty()
        });
    }

    /// Queues `payload` for every thread subscribed to `key`.
    /// Returns the number of threads reached.
    pub(crate) fn publish(&self, key: &LocalKey, payload: &Payload) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let subscribers = self.subscribers.read();
        let Some(mailboxes) = subscribers.get(key) else {
            return 0;
        };
        for mailbox in mailboxes {
            mailbox.push(Delivery {
                key: key.clone(),
                payload: Arc::clone(payload),
            });
        }
        self.delivered
            .fetch_add(mailboxes.len() as u64, Ordering::Relaxed);
        mailboxes.len()
    }

    /// Number of (key, thread) registrations.
    pub fn registration_count(&self) -> usize {
        self.subscribers.read().values().map(Vec::len).sum()
    }

    /// Number of threads subscribed to `D` on `group`.
    pub fn subscriber_count<D: Any>(&self, group: &Group) -> usize {
        self.subscribers
            .read()
            .get(&LocalKey::of::<D>(group))
            .map_or(0, Vec::len)
    }

    /// (publications, per-thread deliveries) since creation.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.published.load(Ordering::Relaxed),
            self.delivered.load(Ordering::Relaxed),
        )
    }
}

impl std::fmt::Debug for InterThreadHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterThreadHub")
            .field("registrations", &self.registration_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const G: Group = Group::new("g");

    #[test]
    fn test_register_once_per_thread() {
        let hub = InterThreadHub::new();
        let mailbox = Mailbox::new(1, PollNotifier::shared());
        let key = LocalKey::of::<u32>(&G);

        hub.register(&key, &mailbox);
        hub.register(&key, &mailbox);
        assert_eq!(hub.subscriber_count::<u32>(&G), 1);

        hub.deregister(&key, 1);
        assert_eq!(hub.registration_count(), 0);
    }

    #[test]
    fn test_publish_reaches_mailboxes() {
        let hub = InterThreadHub::new();
        let notifier = PollNotifier::shared();
        let mailbox = Mailbox::new(7, Arc::clone(&notifier));
        let key = LocalKey::of::<u32>(&G);
        hub.register(&key, &mailbox);

        let payload: Payload = Arc::new(5u32);
        assert_eq!(hub.publish(&key, &payload), 1);
        assert!(notifier.is_ready());
        assert_eq!(mailbox.pending(), 1);

        // Same group, other type: not delivered
        let other: Payload = Arc::new(5u64);
        assert_eq!(hub.publish(&LocalKey::of::<u64>(&G), &other), 0);

        let drained = mailbox.drain();
        let value = drained[0].payload.downcast_ref::<u32>().copied();
        assert_eq!(value, Some(5));
        assert_eq!(hub.counters(), (2, 1));
    }
}
