// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Inter-process layers.
//!
//! # Architecture
//!
//! ```text
//!   worker thread                                  portal thread
//!  +-------------------------+                   +----------------------------+
//!  | InterProcessForwarder   |   forward group   | InterProcessPortal         |
//!  |   publish ─────────────────── DTOs ────────▶|   store: id → handlers /   |
//!  |   subscribe             |                   |          forwarded routes  |
//!  |        ▲                |   delivery group  |   I/O thread ◀──▶ bus      |
//!  |        └──────────────────── Forwarded* ◀───|                            |
//!  | InterThreadTransporter  |                   | InterThreadTransporter     |
//!  +-------------------------+                   +----------------------------+
//! ```
//!
//! Both layers are generic over an [`InnerTransporter`], so stacks are
//! composed rather than inherited and further forwarders can be chained on
//! top of a portal.

pub mod dto;
mod forwarder;
mod io_thread;
mod portal;

pub use dto::{
    ForwardedDelivery, ForwardedRegexDelivery, RegexAction, RegexSubscriptionRequest,
    SerializationSubscriptionRequest, SerializerTransporterMessage, SubscriptionAction,
    TransporterConfig,
};
pub use forwarder::InterProcessForwarder;
pub use portal::{InterProcessPortal, PortalState, PortalStats};

use crate::codec::{Message, SerializerParser};
use crate::error::Result;
use crate::group::Group;
use crate::interthread::InterThreadTransporter;
use crate::poller::Pollable;
use crate::runtime::TransportRuntime;
use crate::scheme::Scheme;
use crate::subscription::{GroupFunc, RegexFilter};
use std::any::Any;
use std::sync::Arc;

/// Group carrying forwarder → portal control DTOs.
pub const FORWARD_GROUP: Group = Group::new("strata::interprocess::forward");

/// Group on which the portal returns external messages to one forwarder.
pub fn delivery_group(thread_id: u64) -> Group {
    Group::dynamic(format!("strata::interprocess::deliver::{thread_id}"))
}

/// Capability of a layer that can sit underneath a forwarder or portal.
pub trait InnerTransporter: Pollable {
    fn runtime(&self) -> &Arc<TransportRuntime>;

    fn thread_id(&self) -> u64;

    fn publish_local<D: Any + Send + Sync>(&self, group: &Group, data: Arc<D>);

    fn subscribe_local<D, F>(&mut self, group: &Group, handler: F)
    where
        D: Any + Send + Sync,
        F: FnMut(&D) + 'static;

    fn unsubscribe_local<D: Any + Send + Sync>(&mut self, group: &Group) -> bool;

    fn unsubscribe_local_all(&mut self);
}

impl InnerTransporter for InterThreadTransporter {
    fn runtime(&self) -> &Arc<TransportRuntime> {
        InterThreadTransporter::runtime(self)
    }

    fn thread_id(&self) -> u64 {
        InterThreadTransporter::thread_id(self)
    }

    fn publish_local<D: Any + Send + Sync>(&self, group: &Group, data: Arc<D>) {
        self.publish_shared(group, data);
    }

    fn subscribe_local<D, F>(&mut self, group: &Group, handler: F)
    where
        D: Any + Send + Sync,
        F: FnMut(&D) + 'static,
    {
        self.subscribe::<D, F>(group, handler);
    }

    fn unsubscribe_local<D: Any + Send + Sync>(&mut self, group: &Group) -> bool {
        self.unsubscribe::<D>(group)
    }

    fn unsubscribe_local_all(&mut self) {
        self.unsubscribe_all();
    }
}

/// Serializing publication.
pub trait Publishes {
    /// Publishes `data` under scheme `S`.
    fn publish_with<S, D>(&mut self, group: &Group, data: D, cfg: &TransporterConfig) -> Result<()>
    where
        S: Scheme,
        D: SerializerParser<S> + Send + Sync;

    /// Publishes `data` under its default scheme.
    fn publish<D>(&mut self, group: &Group, data: D) -> Result<()>
    where
        D: Message + SerializerParser<<D as Message>::Scheme> + Send + Sync,
    {
        self.publish_with::<<D as Message>::Scheme, D>(group, data, &TransporterConfig::default())
    }
}

/// Serializing subscription.
pub trait Subscribes {
    /// Subscribes to `D` under scheme `S`. When `group_func` is given, decoded
    /// instances whose derived group differs from `group` are not dispatched.
    fn subscribe_with_group_func<S, D, F>(
        &mut self,
        group: &Group,
        handler: F,
        group_func: Option<GroupFunc<D>>,
    ) -> Result<()>
    where
        S: Scheme,
        D: SerializerParser<S> + Send + Sync,
        F: FnMut(&D) + 'static;

    fn subscribe_with<S, D, F>(&mut self, group: &Group, handler: F) -> Result<()>
    where
        S: Scheme,
        D: SerializerParser<S> + Send + Sync,
        F: FnMut(&D) + 'static,
    {
        self.subscribe_with_group_func::<S, D, F>(group, handler, None)
    }

    fn subscribe<D, F>(&mut self, group: &Group, handler: F) -> Result<()>
    where
        D: Message + SerializerParser<<D as Message>::Scheme> + Send + Sync,
        F: FnMut(&D) + 'static,
    {
        self.subscribe_with_group_func::<<D as Message>::Scheme, D, F>(group, handler, None)
    }

    /// Removes the most recent subscription to `D` under `S` on `group`.
    fn unsubscribe_with<S, D>(&mut self, group: &Group) -> Result<()>
    where
        S: Scheme,
        D: SerializerParser<S> + Send + Sync;

    fn unsubscribe<D>(&mut self, group: &Group) -> Result<()>
    where
        D: Message + SerializerParser<<D as Message>::Scheme> + Send + Sync,
    {
        self.unsubscribe_with::<<D as Message>::Scheme, D>(group)
    }

    fn unsubscribe_all(&mut self) -> Result<()>;

    /// Receives every external message accepted by `filter` as raw bytes.
    fn subscribe_regex<F>(&mut self, filter: RegexFilter, handler: F) -> Result<()>
    where
        F: FnMut(&[u8], i32, &str, &str) + 'static;

    fn unsubscribe_regex_all(&mut self) -> Result<()>;
}
