// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Inter-process portal: the layer that owns the bus connection.
//!
//! The portal keeps one [`SubscriptionStore`] holding both its own typed
//! subscriptions and routes registered by forwarders in other threads. A
//! topic prefix is subscribed on the bus when its identifier gains its first
//! entry and unsubscribed when the last entry goes away.
//!
//! Inbound messages from this process are dropped: same-process subscribers
//! were already served by the inter-thread hub when the message was
//! published.

use super::dto::{
    ForwardedDelivery, ForwardedRegexDelivery, RegexAction, RegexSubscriptionRequest,
    SerializationSubscriptionRequest, SerializerTransporterMessage, SubscriptionAction,
    TransporterConfig,
};
use super::io_thread::{PortalCommand, PortalEvent, PortalIoHandle, PortalIoThread};
use super::{InnerTransporter, Publishes, Subscribes, FORWARD_GROUP};
use crate::codec::SerializerParser;
use crate::config::InterProcessConfig;
use crate::error::{Error, Result};
use crate::group::Group;
use crate::identifier::{append_thread, check_component, make_identifier, Identifier, IdentifierWildcard};
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
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

/// Extra time granted to the I/O thread beyond the configured startup
/// timeout before the portal gives up waiting for its first event.
const STARTUP_GRACE: Duration = Duration::from_secs(1);

/// Prefix matching every bus message, used by regex subscriptions.
const ALL_TOPICS: &[u8] = b"/";

/// Cached `ThreadWildcard` bases; the cache is cleared when full.
const MAX_IDENTIFIER_BASES: usize = 1024;

/// Portal lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalState {
    /// `Constructed` and `Initializing` only exist inside `new`, which
    /// returns a `Ready` portal or an error.
    Constructed,
    Initializing,
    Ready,
    /// The bus connection failed after startup. Not recovered.
    Disconnected,
    ShuttingDown,
    Destroyed,
}

impl fmt::Display for PortalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PortalState::Constructed => "constructed",
            PortalState::Initializing => "initializing",
            PortalState::Ready => "ready",
            PortalState::Disconnected => "disconnected",
            PortalState::ShuttingDown => "shutting down",
            PortalState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Portal counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortalStats {
    /// Messages handed to the I/O thread.
    pub published: u64,
    /// Inbound bus messages.
    pub received: u64,
    /// Inbound messages that originated in this process.
    pub own_dropped: u64,
    /// Local handler invocations from inbound messages.
    pub dispatched: u64,
    /// Deliveries routed back to forwarding threads.
    pub forwarded: u64,
    /// Inbound messages dropped as unparseable.
    pub malformed: u64,
    pub decode_errors: u64,
    /// Outbound messages dropped at the send high-water mark.
    pub send_dropped: u64,
}

struct ForwardedRegex {
    thread_id: u64,
    delivery_group: Group,
    filter: RegexFilter,
}

/// State shared between the portal and its forward-group listeners.
struct PortalCore {
    io: PortalIoHandle,
    state: PortalState,
    process_id: u32,
    store: SubscriptionStore,
    regex: Vec<RegexSubscription>,
    forwarded_regex: Vec<ForwardedRegex>,
    /// Local plus forwarded regex subscriptions holding the `/` prefix.
    regex_refs: usize,
    /// `ThreadWildcard` identifiers keyed by (scheme, type, group).
    identifier_bases: HashMap<(i32, String, String), String>,
    stats: PortalStats,
}

impl PortalCore {
    fn command(&self, command: PortalCommand) {
        if let Err(e) = self.io.send(command) {
            log::warn!("[portal] dropping bus command: {}", e);
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state == PortalState::Ready && self.io.is_running() {
            Ok(())
        } else {
            Err(Error::NotReady("bus connection is not established"))
        }
    }

    fn add_entry(&mut self, identifier: String, entry: StoreEntry) {
        if self.store.insert(identifier.clone(), entry) {
            log::debug!("[portal] subscribing to {}", identifier);
            self.command(PortalCommand::Subscribe(identifier.into_bytes()));
        }
    }

    fn release(&self, unused: Vec<String>) {
        for identifier in unused {
            log::debug!("[portal] unsubscribing from {}", identifier);
            self.command(PortalCommand::Unsubscribe(identifier.into_bytes()));
        }
    }

    fn add_regex_ref(&mut self) {
        self.regex_refs += 1;
        if self.regex_refs == 1 {
            self.command(PortalCommand::Subscribe(ALL_TOPICS.to_vec()));
        }
    }

    fn drop_regex_refs(&mut self, count: usize) {
        if count == 0 || self.regex_refs == 0 {
            return;
        }
        self.regex_refs = self.regex_refs.saturating_sub(count);
        if self.regex_refs == 0 {
            self.command(PortalCommand::Unsubscribe(ALL_TOPICS.to_vec()));
        }
    }

    /// Queues one serialized message for the bus.
    fn publish_external(
        &mut self,
        scheme: i32,
        type_name: &str,
        group: &str,
        data: &[u8],
        thread_id: u64,
    ) -> Result<()> {
        self.ensure_ready()?;

        let key = (scheme, type_name.to_owned(), group.to_owned());
        if self.identifier_bases.len() >= MAX_IDENTIFIER_BASES
            && !self.identifier_bases.contains_key(&key)
        {
            log::debug!("[portal] identifier cache full, clearing");
            self.identifier_bases.clear();
        }
        let identifier = match self.identifier_bases.entry(key) {
            Entry::Occupied(base) => append_thread(base.get(), thread_id),
            Entry::Vacant(slot) => {
                let base = make_identifier(
                    type_name,
                    scheme,
                    group,
                    IdentifierWildcard::ThreadWildcard,
                    self.process_id,
                    0,
                )?;
                append_thread(slot.insert(base), thread_id)
            }
        };

        let mut body = Vec::with_capacity(identifier.len() + 1 + data.len());
        body.extend_from_slice(identifier.as_bytes());
        body.push(0);
        body.extend_from_slice(data);
        self.io.send(PortalCommand::Publish(body))?;
        self.stats.published += 1;
        Ok(())
    }

    fn on_forwarded_publication(&mut self, msg: &SerializerTransporterMessage) {
        if !msg.cfg.external {
            return;
        }
        if let Err(e) = self.publish_external(
            msg.scheme,
            &msg.type_name,
            &msg.group,
            &msg.data,
            msg.thread_id,
        ) {
            log::warn!(
                "[portal] dropping forwarded publication on '{}' from thread {}: {}",
                msg.group,
                msg.thread_id,
                e
            );
        }
    }

    fn on_subscription_request(&mut self, request: &SerializationSubscriptionRequest) {
        let thread_id = request.thread_id;
        if request.action == SubscriptionAction::UnsubscribeAll {
            let unused = self.store.remove_all(|e| e.is_forwarded_from(thread_id));
            self.release(unused);
            return;
        }

        let identifier = match make_identifier(
            &request.type_name,
            request.scheme,
            &request.group,
            IdentifierWildcard::ProcessThreadWildcard,
            0,
            0,
        ) {
            Ok(identifier) => identifier,
            Err(e) => {
                log::warn!("[portal] rejecting request from thread {}: {}", thread_id, e);
                return;
            }
        };

        match request.action {
            SubscriptionAction::Subscribe => self.add_entry(
                identifier,
                StoreEntry::Forwarded {
                    thread_id,
                    delivery_group: request.delivery_group.clone(),
                },
            ),
            SubscriptionAction::Unsubscribe => {
                if let Some(true) = self
                    .store
                    .remove_last(&identifier, |e| e.is_forwarded_from(thread_id))
                {
                    self.release(vec![identifier]);
                }
            }
            SubscriptionAction::UnsubscribeAll => {}
        }
    }

    fn on_regex_request(&mut self, request: &RegexSubscriptionRequest) {
        match (request.action, &request.filter) {
            (RegexAction::Subscribe, Some(filter)) => {
                self.forwarded_regex.push(ForwardedRegex {
                    thread_id: request.thread_id,
                    delivery_group: request.delivery_group.clone(),
                    filter: filter.clone(),
                });
                self.add_regex_ref();
            }
            (RegexAction::Subscribe, None) => {
                log::warn!(
                    "[portal] regex subscription from thread {} has no filter",
                    request.thread_id
                );
            }
            (RegexAction::UnsubscribeAll, _) => {
                let before = self.forwarded_regex.len();
                self.forwarded_regex
                    .retain(|r| r.thread_id != request.thread_id);
                let removed = before - self.forwarded_regex.len();
                self.drop_regex_refs(removed);
            }
        }
    }
}

/// What one inbound message should reach, captured before dispatch so
/// handlers may change subscriptions.
struct Routing {
    entries: Vec<StoreEntry>,
    regex: Vec<RegexSubscription>,
    regex_groups: Vec<Group>,
}

/// Inter-process portal over inner transporter `I`.
pub struct InterProcessPortal<I: InnerTransporter = InterThreadTransporter> {
    inner: I,
    core: Rc<RefCell<PortalCore>>,
}

impl<I: InnerTransporter> InterProcessPortal<I> {
    /// Connects to the bus described by `config`.
    ///
    /// Blocks until the manager has provided the router addresses and both
    /// router sockets are connected.
    pub fn new(inner: I, config: &InterProcessConfig) -> Result<Self> {
        config.validate_client()?;

        let process_id = inner.runtime().process_id();
        let client_name = format!("{}/{}/{}", config.platform, process_id, inner.thread_id());
        log::debug!(
            "[portal] {} initializing against manager {}",
            client_name,
            config.manager_addr()
        );

        let io = PortalIoThread::spawn(config, client_name, Arc::clone(inner.notifier()))?;
        match io.recv_timeout(config.startup_timeout() + STARTUP_GRACE) {
            Some(PortalEvent::PubConfiguration { publish, subscribe }) => {
                log::info!("[portal] ready (publish {}, subscribe {})", publish, subscribe);
            }
            Some(PortalEvent::StartupFailed { code, detail }) => {
                return Err(Error::from_status(code, detail));
            }
            Some(other) => {
                return Err(Error::ConnectionFailed(format!(
                    "unexpected event during startup: {other:?}"
                )));
            }
            None => {
                return Err(Error::StartupTimedOut(format!(
                    "no socket configuration from {} within {:?}",
                    config.manager_addr(),
                    config.startup_timeout()
                )));
            }
        }

        let core = PortalCore {
            io,
            state: PortalState::Ready,
            process_id,
            store: SubscriptionStore::new(),
            regex: Vec::new(),
            forwarded_regex: Vec::new(),
            regex_refs: 0,
            identifier_bases: HashMap::new(),
            stats: PortalStats::default(),
        };
        let mut portal = Self {
            inner,
            core: Rc::new(RefCell::new(core)),
        };
        portal.attach_forward_listeners();
        Ok(portal)
    }

    fn attach_forward_listeners(&mut self) {
        let core = Rc::clone(&self.core);
        self.inner.subscribe_local::<SerializerTransporterMessage, _>(
            &FORWARD_GROUP,
            move |msg: &SerializerTransporterMessage| core.borrow_mut().on_forwarded_publication(msg),
        );

        let core = Rc::clone(&self.core);
        self.inner.subscribe_local::<SerializationSubscriptionRequest, _>(
            &FORWARD_GROUP,
            move |request: &SerializationSubscriptionRequest| {
                core.borrow_mut().on_subscription_request(request)
            },
        );

        let core = Rc::clone(&self.core);
        self.inner.subscribe_local::<RegexSubscriptionRequest, _>(
            &FORWARD_GROUP,
            move |request: &RegexSubscriptionRequest| core.borrow_mut().on_regex_request(request),
        );
    }

    /// True while the bus connection is established.
    pub fn ready(&self) -> bool {
        self.core.borrow().ensure_ready().is_ok()
    }

    pub fn state(&self) -> PortalState {
        self.core.borrow().state
    }

    pub fn stats(&self) -> PortalStats {
        let core = self.core.borrow();
        PortalStats {
            send_dropped: core.io.dropped(),
            ..core.stats
        }
    }

    /// Typed store entries, local and forwarded.
    pub fn subscription_count(&self) -> usize {
        self.core.borrow().store.len()
    }

    /// Distinct topic prefixes currently subscribed on the bus for typed
    /// subscriptions.
    pub fn topic_count(&self) -> usize {
        self.core.borrow().store.identifier_count()
    }

    pub fn inner(&self) -> &I {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut I {
        &mut self.inner
    }

    fn route(&self, raw_id: &[u8], id: &Identifier) -> Routing {
        let core = self.core.borrow();
        let mut regex_groups: Vec<Group> = Vec::new();
        for r in &core.forwarded_regex {
            if r.filter.matches(id.scheme, &id.type_name, &id.group)
                && !regex_groups.contains(&r.delivery_group)
            {
                regex_groups.push(r.delivery_group.clone());
            }
        }
        Routing {
            entries: core.store.matching(raw_id),
            regex: core.regex.clone(),
            regex_groups,
        }
    }

    /// Handles one inbound bus message.
    fn receive(&mut self, body: &[u8]) {
        let parsed = body
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| "missing NUL separator".to_owned())
            .and_then(|nul| {
                let text = std::str::from_utf8(&body[..nul])
                    .map_err(|_| "identifier is not UTF-8".to_owned())?;
                let id = Identifier::parse(text).map_err(|e| e.to_string())?;
                if id.wildcard() != IdentifierWildcard::NoWildcards {
                    return Err(format!("{text:?} lacks process or thread"));
                }
                Ok((nul, text, id))
            });
        let (nul, text, id) = match parsed {
            Ok(parsed) => parsed,
            Err(why) => {
                log::warn!("[portal] dropping malformed message: {}", why);
                let mut core = self.core.borrow_mut();
                core.stats.received += 1;
                core.stats.malformed += 1;
                return;
            }
        };
        let data = &body[nul + 1..];

        {
            let mut core = self.core.borrow_mut();
            core.stats.received += 1;
            if id.process == Some(core.process_id) {
                core.stats.own_dropped += 1;
                return;
            }
        }

        let routing = self.route(&body[..nul], &id);
        let mut dispatched = 0;
        let mut decode_errors = 0;
        let mut forwarded_to: Vec<&Group> = Vec::new();

        for entry in &routing.entries {
            match entry {
                StoreEntry::Local(handler) => match handler.post(data) {
                    Ok(true) => dispatched += 1,
                    Ok(false) => {}
                    Err(e) => {
                        decode_errors += 1;
                        log::warn!("[portal] failed to decode {}: {}", text, e);
                    }
                },
                StoreEntry::Forwarded { delivery_group, .. } => {
                    if forwarded_to.contains(&delivery_group) {
                        continue;
                    }
                    forwarded_to.push(delivery_group);
                    self.inner.publish_local(
                        delivery_group,
                        Arc::new(ForwardedDelivery {
                            identifier: text.to_owned(),
                            data: data.to_vec(),
                        }),
                    );
                }
            }
        }

        for subscription in &routing.regex {
            if subscription.post(data, id.scheme, &id.type_name, &id.group) {
                dispatched += 1;
            }
        }
        for delivery_group in &routing.regex_groups {
            self.inner.publish_local(
                delivery_group,
                Arc::new(ForwardedRegexDelivery {
                    scheme: id.scheme,
                    type_name: id.type_name.clone(),
                    group: id.group.clone(),
                    data: data.to_vec(),
                }),
            );
        }

        let mut core = self.core.borrow_mut();
        core.stats.dispatched += dispatched;
        core.stats.decode_errors += decode_errors;
        core.stats.forwarded += (forwarded_to.len() + routing.regex_groups.len()) as u64;
    }

    fn handle_event(&mut self, event: PortalEvent) {
        match event {
            PortalEvent::Receive(body) => self.receive(&body),
            PortalEvent::Disconnected(reason) => {
                log::error!("[portal] disconnected from bus: {}", reason);
                self.core.borrow_mut().state = PortalState::Disconnected;
            }
            PortalEvent::PubConfiguration { .. } | PortalEvent::StartupFailed { .. } => {
                log::debug!("[portal] ignoring late startup event");
            }
        }
    }
}

impl<I: InnerTransporter> Publishes for InterProcessPortal<I> {
    fn publish_with<S, D>(&mut self, group: &Group, data: D, cfg: &TransporterConfig) -> Result<()>
    where
        S: Scheme,
        D: SerializerParser<S> + Send + Sync,
    {
        let type_name = <D as SerializerParser<S>>::type_name();
        check_component("group", &group.wire_name())?;
        check_component("type name", &type_name)?;

        if cfg.external {
            let bytes = <D as SerializerParser<S>>::serialize(&data)?;
            let thread_id = self.inner.thread_id();
            self.core.borrow_mut().publish_external(
                S::ID,
                &type_name,
                &group.wire_name(),
                &bytes,
                thread_id,
            )?;
        }
        self.inner.publish_local(group, Arc::new(data));
        Ok(())
    }
}

impl<I: InnerTransporter> Subscribes for InterProcessPortal<I> {
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
        let identifier = make_identifier(
            &<D as SerializerParser<S>>::type_name(),
            S::ID,
            &group.wire_name(),
            IdentifierWildcard::ProcessThreadWildcard,
            0,
            0,
        )?;

        let subscription = SerializationSubscription::<S, D>::new(group.clone(), handler, group_func);
        self.inner
            .subscribe_local::<D, _>(group, subscription.local_dispatcher());
        self.core
            .borrow_mut()
            .add_entry(identifier, StoreEntry::Local(Rc::new(subscription)));
        Ok(())
    }

    fn unsubscribe_with<S, D>(&mut self, group: &Group) -> Result<()>
    where
        S: Scheme,
        D: SerializerParser<S> + Send + Sync,
    {
        let identifier = make_identifier(
            &<D as SerializerParser<S>>::type_name(),
            S::ID,
            &group.wire_name(),
            IdentifierWildcard::ProcessThreadWildcard,
            0,
            0,
        )?;

        let removed = self
            .core
            .borrow_mut()
            .store
            .remove_last(&identifier, StoreEntry::is_local);
        if let Some(unused) = removed {
            self.inner.unsubscribe_local::<D>(group);
            if unused {
                self.core.borrow().release(vec![identifier]);
            }
        }
        Ok(())
    }

    fn unsubscribe_all(&mut self) -> Result<()> {
        {
            let mut core = self.core.borrow_mut();
            let unused = core.store.remove_all(StoreEntry::is_local);
            core.release(unused);
        }
        self.inner.unsubscribe_local_all();
        Ok(())
    }

    fn subscribe_regex<F>(&mut self, filter: RegexFilter, handler: F) -> Result<()>
    where
        F: FnMut(&[u8], i32, &str, &str) + 'static,
    {
        let mut core = self.core.borrow_mut();
        core.regex.push(RegexSubscription::new(filter, handler));
        core.add_regex_ref();
        Ok(())
    }

    fn unsubscribe_regex_all(&mut self) -> Result<()> {
        let mut core = self.core.borrow_mut();
        let count = core.regex.len();
        core.regex.clear();
        core.drop_regex_refs(count);
        Ok(())
    }
}

impl<I: InnerTransporter> Pollable for InterProcessPortal<I> {
    fn notifier(&self) -> &Arc<PollNotifier> {
        self.inner.notifier()
    }

    /// Applies forwarded DTOs through the inner transporter, then handles
    /// bus events.
    fn poll_all(&mut self) -> usize {
        let mut items = self.inner.poll_all();
        loop {
            let event = self.core.borrow().io.try_event();
            let Some(event) = event else {
                break;
            };
            self.handle_event(event);
            items += 1;
        }
        items
    }
}

impl<I: InnerTransporter> InnerTransporter for InterProcessPortal<I> {
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

impl<I: InnerTransporter> Drop for InterProcessPortal<I> {
    fn drop(&mut self) {
        let mut core = self.core.borrow_mut();
        core.state = PortalState::ShuttingDown;
        if let Err(e) = core.io.shutdown() {
            log::warn!("[portal] I/O thread shutdown failed: {}", e);
        }
        core.state = PortalState::Destroyed;
        log::debug!("[portal] destroyed");
    }
}

impl<I: InnerTransporter> fmt::Debug for InterProcessPortal<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.borrow();
        f.debug_struct("InterProcessPortal")
            .field("state", &core.state)
            .field("process_id", &core.process_id)
            .field("subscriptions", &core.store.len())
            .field("regex_refs", &core.regex_refs)
            .finish()
    }
}
