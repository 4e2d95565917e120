// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Forwarding shim used by worker threads.
//!
//! A forwarder performs no outer I/O. Publications are delivered locally and
//! re-published as [`SerializerTransporterMessage`] on [`FORWARD_GROUP`];
//! subscriptions are registered locally and announced with
//! [`SerializationSubscriptionRequest`]. The portal sends matching external
//! traffic back on this forwarder's delivery group.

use super::dto::{
    ForwardedDelivery, ForwardedRegexDelivery, RegexAction, RegexSubscriptionRequest,
    SerializationSubscriptionRequest, SerializerTransporterMessage, SubscriptionAction,
    TransporterConfig,
};
use super::{delivery_group, InnerTransporter, Publishes, Subscribes, FORWARD_GROUP};
use crate::codec::SerializerParser;
use crate::error::Result;
use crate::group::Group;
use crate::identifier::{check_component, make_identifier, IdentifierWildcard};
use crate::interthread::InterThreadTransporter;
use crate::poller::{PollNotifier, Pollable};
use crate::runtime::TransportRuntime;
use crate::scheme::Scheme;
use crate::subscription::{
    GroupFunc, RegexFilter, RegexSubscription, SerializationSubscription, StoreEntry,
    SubscriptionStore,
};
use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

/// Inter-process forwarder over inner transporter `I`.
pub struct InterProcessForwarder<I: InnerTransporter = InterThreadTransporter> {
    inner: I,
    delivery_group: Group,
    store: Rc<RefCell<SubscriptionStore>>,
    regex: Rc<RefCell<Vec<RegexSubscription>>>,
}

impl<I: InnerTransporter> InterProcessForwarder<I> {
    pub fn new(inner: I) -> Self {
        let delivery_group = delivery_group(inner.thread_id());
        let mut forwarder = Self {
            inner,
            delivery_group,
            store: Rc::new(RefCell::new(SubscriptionStore::new())),
            regex: Rc::new(RefCell::new(Vec::new())),
        };
        forwarder.attach_delivery();
        forwarder
    }

    fn attach_delivery(&mut self) {
        let store = Rc::clone(&self.store);
        self.inner.subscribe_local::<ForwardedDelivery, _>(
            &self.delivery_group,
            move |delivery: &ForwardedDelivery| {
                let entries = store.borrow().matching(delivery.identifier.as_bytes());
                for entry in entries {
                    if let StoreEntry::Local(handler) = entry {
                        if let Err(e) = handler.post(&delivery.data) {
                            log::warn!("[forwarder] dropping {}: {}", delivery.identifier, e);
                        }
                    }
                }
            },
        );

        let regex = Rc::clone(&self.regex);
        self.inner.subscribe_local::<ForwardedRegexDelivery, _>(
            &self.delivery_group,
            move |delivery: &ForwardedRegexDelivery| {
                let subscriptions = regex.borrow().clone();
                for subscription in &subscriptions {
                    subscription.post(
                        &delivery.data,
                        delivery.scheme,
                        &delivery.type_name,
                        &delivery.group,
                    );
                }
            },
        );
    }

    fn forward<D: Any + Send + Sync>(&self, dto: D) {
        self.inner.publish_local(&FORWARD_GROUP, Arc::new(dto));
    }

    fn request(&self, action: SubscriptionAction, scheme: i32, type_name: &str, group: &Group) {
        self.forward(SerializationSubscriptionRequest::new(
            action,
            scheme,
            type_name,
            &*group.wire_name(),
            self.inner.thread_id(),
            self.delivery_group.clone(),
        ));
    }

    pub fn inner(&self) -> &I {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut I {
        &mut self.inner
    }

    pub fn delivery_group(&self) -> &Group {
        &self.delivery_group
    }

    /// Typed subscriptions currently held.
    pub fn subscription_count(&self) -> usize {
        self.store.borrow().len()
    }

    pub fn regex_subscription_count(&self) -> usize {
        self.regex.borrow().len()
    }
}

impl<I: InnerTransporter> Publishes for InterProcessForwarder<I> {
    fn publish_with<S, D>(&mut self, group: &Group, data: D, cfg: &TransporterConfig) -> Result<()>
    where
        S: Scheme,
        D: SerializerParser<S> + Send + Sync,
    {
        let type_name = <D as SerializerParser<S>>::type_name();
        check_component("group", &group.wire_name())?;
        check_component("type name", &type_name)?;
        let bytes = <D as SerializerParser<S>>::serialize(&data)?;

        self.inner.publish_local(group, Arc::new(data));
        self.forward(SerializerTransporterMessage {
            scheme: S::ID,
            type_name: type_name.into_owned(),
            group: group.wire_name().into_owned(),
            data: bytes,
            cfg: cfg.clone(),
            thread_id: self.inner.thread_id(),
        });
        Ok(())
    }
}

impl<I: InnerTransporter> Subscribes for InterProcessForwarder<I> {
    fn subscribe_with_group_func<S, D, F>(
        &mut self,
        group: &Group,
        handler: F,
        group_func: Option<GroupFunc<D>>,
    ) -> Result<()>
    where
        S: Scheme,
        D: SerializerParser<S> + Send + Sync,
        F: FnMut(&D) + 'static,
    {
        let type_name = <D as SerializerParser<S>>::type_name();
        let identifier = make_identifier(
            &type_name,
            S::ID,
            &group.wire_name(),
            IdentifierWildcard::ProcessThreadWildcard,
            0,
            0,
        )?;

        let subscription = SerializationSubscription::<S, D>::new(group.clone(), handler, group_func);
        self.inner
            .subscribe_local::<D, _>(group, subscription.local_dispatcher());
        self.store
            .borrow_mut()
            .insert(identifier, StoreEntry::Local(Rc::new(subscription)));

        self.request(SubscriptionAction::Subscribe, S::ID, &type_name, group);
        Ok(())
    }

    fn unsubscribe_with<S, D>(&mut self, group: &Group) -> Result<()>
    where
        S: Scheme,
        D: SerializerParser<S> + Send + Sync,
    {
        let type_name = <D as SerializerParser<S>>::type_name();
        let identifier = make_identifier(
            &type_name,
            S::ID,
            &group.wire_name(),
            IdentifierWildcard::ProcessThreadWildcard,
            0,
            0,
        )?;

        let removed = self
            .store
            .borrow_mut()
            .remove_last(&identifier, StoreEntry::is_local);
        if removed.is_none() {
            return Ok(());
        }
        self.inner.unsubscribe_local::<D>(group);
        self.request(SubscriptionAction::Unsubscribe, S::ID, &type_name, group);
        Ok(())
    }

    fn unsubscribe_all(&mut self) -> Result<()> {
        self.store.borrow_mut().remove_all(StoreEntry::is_local);
        self.inner.unsubscribe_local_all();
        self.forward(SerializationSubscriptionRequest::unsubscribe_all(
            self.inner.thread_id(),
            self.delivery_group.clone(),
        ));
        Ok(())
    }

    fn subscribe_regex<F>(&mut self, filter: RegexFilter, handler: F) -> Result<()>
    where
        F: FnMut(&[u8], i32, &str, &str) + 'static,
    {
        self.regex
            .borrow_mut()
            .push(RegexSubscription::new(filter.clone(), handler));
        self.forward(RegexSubscriptionRequest {
            action: RegexAction::Subscribe,
            filter: Some(filter),
            thread_id: self.inner.thread_id(),
            delivery_group: self.delivery_group.clone(),
        });
        Ok(())
    }

    fn unsubscribe_regex_all(&mut self) -> Result<()> {
        self.regex.borrow_mut().clear();
        self.forward(RegexSubscriptionRequest {
            action: RegexAction::UnsubscribeAll,
            filter: None,
            thread_id: self.inner.thread_id(),
            delivery_group: self.delivery_group.clone(),
        });
        Ok(())
    }
}

impl<I: InnerTransporter> Pollable for InterProcessForwarder<I> {
    fn notifier(&self) -> &Arc<PollNotifier> {
        self.inner.notifier()
    }

    fn poll_all(&mut self) -> usize {
        self.inner.poll_all()
    }
}

impl<I: InnerTransporter> InnerTransporter for InterProcessForwarder<I> {
    fn runtime(&self) -> &Arc<TransportRuntime> {
        self.inner.runtime()
    }

    fn thread_id(&self) -> u64 {
        self.inner.thread_id()
    }

    fn publish_local<D: Any + Send + Sync>(&self, group: &Group, data: Arc<D>) {
        self.inner.publish_local(group, data);
    }

    fn subscribe_local<D, F>(&mut self, group: &Group, handler: F)
    where
        D: Any + Send + Sync,
        F: FnMut(&D) + 'static,
    {
        self.inner.subscribe_local::<D, F>(group, handler);
    }

    fn unsubscribe_local<D: Any + Send + Sync>(&mut self, group: &Group) -> bool {
        self.inner.unsubscribe_local::<D>(group)
    }

    fn unsubscribe_local_all(&mut self) {
        self.inner.unsubscribe_local_all();
    }
}

impl<I: InnerTransporter> Drop for InterProcessForwarder<I> {
    fn drop(&mut self) {
        // Let the portal release routes that point at this thread
        if !self.store.borrow().is_empty() {
            self.forward(SerializationSubscriptionRequest::unsubscribe_all(
                self.inner.thread_id(),
                self.delivery_group.clone(),
            ));
        }
        if !self.regex.borrow().is_empty() {
            self.forward(RegexSubscriptionRequest {
                action: RegexAction::UnsubscribeAll,
                filter: None,
                thread_id: self.inner.thread_id(),
                delivery_group: self.delivery_group.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::{Cstr, MarshallingScheme};
    use std::time::Duration;

    const CHAT: Group = Group::new("chat");

    #[test]
    fn test_publish_forwards_dto_and_delivers_locally() {
        let runtime = TransportRuntime::with_process_id("test", 1);
        let mut forwarder = InterProcessForwarder::new(InterThreadTransporter::new(Arc::clone(&runtime)));

        // Stands in for the portal thread
        let mut portal_side = InterThreadTransporter::new(Arc::clone(&runtime));
        let forwarded = Rc::new(RefCell::new(Vec::new()));
        let f = Rc::clone(&forwarded);
        portal_side.subscribe::<SerializerTransporterMessage, _>(&FORWARD_GROUP, move |m| {
            f.borrow_mut().push(m.clone())
        });

        let local = Rc::new(RefCell::new(Vec::new()));
        let l = Rc::clone(&local);
        forwarder
            .subscribe::<String, _>(&CHAT, move |s| l.borrow_mut().push(s.clone()))
            .expect("subscribe");

        forwarder.publish(&CHAT, String::from("hello")).expect("publish");
        forwarder.poll(Some(Duration::ZERO));
        portal_side.poll(Some(Duration::ZERO));

        assert_eq!(*local.borrow(), vec!["hello".to_string()]);
        let forwarded = forwarded.borrow();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].scheme, MarshallingScheme::CSTR);
        assert_eq!(forwarded[0].type_name, "CSTR");
        assert_eq!(forwarded[0].group, "chat");
        assert_eq!(forwarded[0].data, b"hello");
    }

    #[test]
    fn test_subscription_requests_and_return_path() {
        let runtime = TransportRuntime::with_process_id("test", 1);
        let mut forwarder = InterProcessForwarder::new(InterThreadTransporter::new(Arc::clone(&runtime)));
        let mut portal_side = InterThreadTransporter::new(Arc::clone(&runtime));
        let requests = Rc::new(RefCell::new(Vec::new()));
        let r = Rc::clone(&requests);
        portal_side.subscribe::<SerializationSubscriptionRequest, _>(&FORWARD_GROUP, move |req| {
            r.borrow_mut().push(req.clone())
        });

        let hits = Rc::new(RefCell::new(Vec::new()));
        let h = Rc::clone(&hits);
        forwarder
            .subscribe_with::<Cstr, String, _>(&CHAT, move |s| h.borrow_mut().push(s.clone()))
            .expect("subscribe");
        portal_side.poll(Some(Duration::ZERO));

        let request = requests.borrow()[0].clone();
        assert_eq!(request.action, SubscriptionAction::Subscribe);
        assert_eq!(&request.delivery_group, forwarder.delivery_group());

        // Portal routes an external message back
        portal_side.publish(
            &request.delivery_group,
            ForwardedDelivery {
                identifier: "/chat/0/CSTR/77/2/".into(),
                data: b"from afar".to_vec(),
            },
        );
        forwarder.poll(Some(Duration::ZERO));
        assert_eq!(*hits.borrow(), vec!["from afar".to_string()]);

        forwarder.unsubscribe_with::<Cstr, String>(&CHAT).expect("unsubscribe");
        assert_eq!(forwarder.subscription_count(), 0);
        portal_side.poll(Some(Duration::ZERO));
        assert_eq!(requests.borrow()[1].action, SubscriptionAction::Unsubscribe);
    }

    #[test]
    fn test_unsubscribe_all_keeps_return_path() {
        let runtime = TransportRuntime::with_process_id("test", 1);
        let mut forwarder = InterProcessForwarder::new(InterThreadTransporter::new(Arc::clone(&runtime)));
        forwarder.subscribe::<String, _>(&CHAT, |_| {}).expect("subscribe");
        forwarder.unsubscribe_all().expect("unsubscribe all");
        assert_eq!(forwarder.subscription_count(), 0);

        let hits = Rc::new(RefCell::new(0));
        let h = Rc::clone(&hits);
        forwarder
            .subscribe::<String, _>(&CHAT, move |_| *h.borrow_mut() += 1)
            .expect("subscribe");
        let other = InterThreadTransporter::new(Arc::clone(&runtime));
        other.publish(
            forwarder.delivery_group(),
            ForwardedDelivery {
                identifier: "/chat/0/CSTR/5/5/".into(),
                data: b"x".to_vec(),
            },
        );
        forwarder.poll(Some(Duration::ZERO));
        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn test_rejects_invalid_group() {
        let runtime = TransportRuntime::with_process_id("test", 1);
        let mut forwarder = InterProcessForwarder::new(InterThreadTransporter::new(runtime));
        let bad = Group::new("a/b");
        assert!(forwarder.publish(&bad, String::from("x")).is_err());
        assert!(forwarder.subscribe::<String, _>(&bad, |_| {}).is_err());
    }
}
