// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process transport between threads.
//!
//! # Architecture
//!
//! ```text
//!   thread A                      hub (TransportRuntime)            thread B
//!   publish(g, d) ──Arc<D>──▶  (TypeId, g) → [mailbox B, ...] ──▶ mailbox B
//!                                                                  │ notify
//!                                                                  ▼
//!                                                       poll() → handlers in
//!                                                       registration order
//! ```
//!
//! Payloads are never serialized: every subscriber receives the same
//! immutable `Arc<D>`. A transporter is bound to the thread that created it
//! (handlers are plain `FnMut` closures, not `Send`).

mod hub;

pub use hub::InterThreadHub;
pub(crate) use hub::{LocalKey, Mailbox, Payload};

use crate::group::Group;
use crate::poller::{PollNotifier, Pollable};
use crate::runtime::TransportRuntime;
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

type LocalHandler = Rc<dyn Fn(&Payload)>;

/// Inter-thread transporter owned by one thread.
pub struct InterThreadTransporter {
    runtime: Arc<TransportRuntime>,
    thread_id: u64,
    notifier: Arc<PollNotifier>,
    mailbox: Arc<Mailbox>,
    handlers: HashMap<LocalKey, Vec<LocalHandler>>,
}

impl InterThreadTransporter {
    pub fn new(runtime: Arc<TransportRuntime>) -> Self {
        Self::with_notifier(runtime, PollNotifier::shared())
    }

    /// Builds a transporter that wakes `notifier`, which the caller may keep
    /// to interrupt this thread's poll from elsewhere.
    pub fn with_notifier(runtime: Arc<TransportRuntime>, notifier: Arc<PollNotifier>) -> Self {
        let thread_id = runtime.next_thread_id();
        let mailbox = Mailbox::new(thread_id, Arc::clone(&notifier));
        Self {
            runtime,
            thread_id,
            notifier,
            mailbox,
            handlers: HashMap::new(),
        }
    }

    pub fn runtime(&self) -> &Arc<TransportRuntime> {
        &self.runtime
    }

    /// Index of this transporter within its runtime.
    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    pub fn publish<D: Any + Send + Sync>(&self, group: &Group, data: D) {
        self.publish_shared(group, Arc::new(data));
    }

    pub fn publish_shared<D: Any + Send + Sync>(&self, group: &Group, data: Arc<D>) {
        let payload: Payload = data;
        let key = LocalKey::of::<D>(group);
        let reached = self.runtime.hub().publish(&key, &payload);
        log::trace!(
            "[interthread] {} on '{}' queued for {} thread(s)",
            key.type_name(),
            group,
            reached
        );
    }

    /// Registers `handler` for `D` on `group`. Duplicates are independent.
    pub fn subscribe<D, F>(&mut self, group: &Group, handler: F)
    where
        D: Any + Send + Sync,
        F: FnMut(&D) + 'static,
    {
        let handler = RefCell::new(handler);
        self.register::<D>(
            group,
            Rc::new(move |payload: &Payload| {
                if let Some(data) = payload.downcast_ref::<D>() {
                    match handler.try_borrow_mut() {
                        Ok(mut f) => (*f)(data),
                        Err(_) => log::warn!("[interthread] re-entrant delivery dropped"),
                    }
                }
            }),
        );
    }

    /// Like [`subscribe`](Self::subscribe) but hands out the shared `Arc<D>`.
    pub fn subscribe_shared<D, F>(&mut self, group: &Group, handler: F)
    where
        D: Any + Send + Sync,
        F: FnMut(Arc<D>) + 'static,
    {
        let handler = RefCell::new(handler);
        self.register::<D>(
            group,
            Rc::new(move |payload: &Payload| {
                if let Ok(data) = Arc::clone(payload).downcast::<D>() {
                    match handler.try_borrow_mut() {
                        Ok(mut f) => (*f)(data),
                        Err(_) => log::warn!("[interthread] re-entrant delivery dropped"),
                    }
                }
            }),
        );
    }

    fn register<D: Any>(&mut self, group: &Group, handler: LocalHandler) {
        let key = LocalKey::of::<D>(group);
        self.runtime.hub().register(&key, &self.mailbox);
        self.handlers.entry(key).or_default().push(handler);
    }

    /// Removes the most recent registration for `D` on `group`.
    /// Returns false when none existed.
    pub fn unsubscribe<D: Any>(&mut self, group: &Group) -> bool {
        let key = LocalKey::of::<D>(group);
        let Some(list) = self.handlers.get_mut(&key) else {
            return false;
        };
        list.pop();
        if list.is_empty() {
            self.handlers.remove(&key);
            self.runtime.hub().deregister(&key, self.thread_id);
        }
        true
    }

    /// Removes every registration except those on reserved groups, which
    /// belong to the layers stacked on this transporter.
    pub fn unsubscribe_all(&mut self) {
        let hub = self.runtime.hub();
        let thread_id = self.thread_id;
        self.handlers.retain(|key, _| {
            if key.group().is_reserved() {
                return true;
            }
            hub.deregister(key, thread_id);
            false
        });
    }

    /// Total live registrations held by this transporter.
    pub fn subscription_count(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    /// Deliveries queued for this thread but not yet dispatched.
    pub fn pending(&self) -> usize {
        self.mailbox.pending()
    }
}

impl Pollable for InterThreadTransporter {
    fn notifier(&self) -> &Arc<PollNotifier> {
        &self.notifier
    }

    fn poll_all(&mut self) -> usize {
        let deliveries = self.mailbox.drain();
        let mut items = 0;
        for delivery in deliveries {
            // Snapshot: handlers may subscribe or unsubscribe while running
            let Some(handlers) = self.handlers.get(&delivery.key).cloned() else {
                continue;
            };
            for handler in handlers {
                handler(&delivery.payload);
            }
            items += 1;
        }
        items
    }
}

impl Drop for InterThreadTransporter {
    fn drop(&mut self) {
        self.runtime.hub().deregister_all(self.thread_id);
    }
}

impl std::fmt::Debug for InterThreadTransporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterThreadTransporter")
            .field("thread_id", &self.thread_id)
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::time::Duration;

    const COUNT: Group = Group::new("count");

    #[test]
    fn test_same_thread_delivery() {
        let runtime = TransportRuntime::with_process_id("test", 1);
        let mut transporter = InterThreadTransporter::new(runtime);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        transporter.subscribe::<u32, _>(&COUNT, move |v| s.borrow_mut().push(*v));

        for i in 0..5u32 {
            transporter.publish(&COUNT, i);
        }
        assert_eq!(transporter.poll(Some(Duration::ZERO)), 5);
        assert_eq!(*seen.borrow(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_registration_order_and_duplicates() {
        let runtime = TransportRuntime::with_process_id("test", 1);
        let mut transporter = InterThreadTransporter::new(runtime);
        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in ["first", "second"] {
            let o = Rc::clone(&order);
            transporter.subscribe::<u32, _>(&COUNT, move |_| o.borrow_mut().push(tag));
        }

        transporter.publish(&COUNT, 1u32);
        transporter.poll(Some(Duration::ZERO));
        assert_eq!(*order.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn test_unsubscribe_restores_store() {
        let runtime = TransportRuntime::with_process_id("test", 1);
        let mut transporter = InterThreadTransporter::new(Arc::clone(&runtime));
        assert_eq!(runtime.hub().registration_count(), 0);

        transporter.subscribe::<u32, _>(&COUNT, |_| {});
        transporter.subscribe::<u32, _>(&COUNT, |_| {});
        assert_eq!(transporter.subscription_count(), 2);

        assert!(transporter.unsubscribe::<u32>(&COUNT));
        assert_eq!(runtime.hub().registration_count(), 1);
        assert!(transporter.unsubscribe::<u32>(&COUNT));
        assert!(!transporter.unsubscribe::<u32>(&COUNT));
        assert_eq!(transporter.subscription_count(), 0);
        assert_eq!(runtime.hub().registration_count(), 0);
    }

    #[test]
    fn test_unsubscribe_all_keeps_reserved_groups() {
        let runtime = TransportRuntime::with_process_id("test", 1);
        let mut transporter = InterThreadTransporter::new(Arc::clone(&runtime));
        let stop = Group::new("strata::shutdown");
        let stops = Rc::new(Cell::new(0));
        let s = Rc::clone(&stops);
        transporter.subscribe::<bool, _>(&stop, move |_| s.set(s.get() + 1));
        transporter.subscribe::<u32, _>(&COUNT, |_| {});

        transporter.unsubscribe_all();
        assert_eq!(transporter.subscription_count(), 1);
        assert_eq!(runtime.hub().subscriber_count::<u32>(&COUNT), 0);

        transporter.publish(&COUNT, 1u32);
        transporter.publish(&stop, true);
        assert_eq!(transporter.pending(), 1);
        assert_eq!(transporter.poll(Some(Duration::ZERO)), 1);
        assert_eq!(stops.get(), 1);
    }

    #[test]
    fn test_shared_payload_is_not_copied() {
        let runtime = TransportRuntime::with_process_id("test", 1);
        let mut transporter = InterThreadTransporter::new(runtime);
        let seen = Rc::new(Cell::new(None));
        let s = Rc::clone(&seen);
        transporter.subscribe_shared::<Vec<u8>, _>(&COUNT, move |v| s.set(Some(Arc::as_ptr(&v))));

        let data = Arc::new(vec![1u8, 2, 3]);
        transporter.publish_shared(&COUNT, Arc::clone(&data));
        transporter.poll(Some(Duration::ZERO));
        assert_eq!(seen.get(), Some(Arc::as_ptr(&data)));
    }

    #[test]
    fn test_drop_deregisters() {
        let runtime = TransportRuntime::with_process_id("test", 1);
        {
            let mut transporter = InterThreadTransporter::new(Arc::clone(&runtime));
            transporter.subscribe::<u32, _>(&COUNT, |_| {});
            assert_eq!(runtime.hub().registration_count(), 1);
        }
        assert_eq!(runtime.hub().registration_count(), 0);
    }
}
