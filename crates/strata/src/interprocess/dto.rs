// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control messages exchanged on the inter-thread forward and delivery
//! groups. They never leave the process.

use crate::group::Group;
use crate::subscription::RegexFilter;
use serde::{Deserialize, Serialize};

/// Per-publication transport options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransporterConfig {
    /// Publish beyond this process. When false only in-process
    /// subscribers receive the message.
    pub external: bool,
}

impl Default for TransporterConfig {
    fn default() -> Self {
        Self { external: true }
    }
}

impl TransporterConfig {
    pub fn local_only() -> Self {
        Self { external: false }
    }
}

/// A publication handed from a forwarder to the portal.
#[derive(Debug, Clone)]
pub struct SerializerTransporterMessage {
    pub scheme: i32,
    pub type_name: String,
    pub group: String,
    pub data: Vec<u8>,
    pub cfg: TransporterConfig,
    /// Publishing transporter.
    pub thread_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
    UnsubscribeAll,
}

/// Subscription change requested by a forwarder.
#[derive(Debug, Clone)]
pub struct SerializationSubscriptionRequest {
    pub action: SubscriptionAction,
    pub scheme: i32,
    pub type_name: String,
    pub group: String,
    pub thread_id: u64,
    /// Group on which the portal returns matching messages.
    pub delivery_group: Group,
}

impl SerializationSubscriptionRequest {
    pub fn new(
        action: SubscriptionAction,
        scheme: i32,
        type_name: impl Into<String>,
        group: impl Into<String>,
        thread_id: u64,
        delivery_group: Group,
    ) -> Self {
        Self {
            action,
            scheme,
            type_name: type_name.into(),
            group: group.into(),
            thread_id,
            delivery_group,
        }
    }

    pub fn unsubscribe_all(thread_id: u64, delivery_group: Group) -> Self {
        Self::new(
            SubscriptionAction::UnsubscribeAll,
            crate::scheme::MarshallingScheme::NULL_SCHEME,
            String::new(),
            String::new(),
            thread_id,
            delivery_group,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegexAction {
    Subscribe,
    UnsubscribeAll,
}

/// Regex subscription change requested by a forwarder.
#[derive(Debug, Clone)]
pub struct RegexSubscriptionRequest {
    pub action: RegexAction,
    /// Present for `Subscribe`.
    pub filter: Option<RegexFilter>,
    pub thread_id: u64,
    pub delivery_group: Group,
}

/// External message routed back to a forwarder's typed subscriptions.
#[derive(Debug, Clone)]
pub struct ForwardedDelivery {
    /// Full identifier of the inbound message.
    pub identifier: String,
    pub data: Vec<u8>,
}

/// External message routed back to a forwarder's regex subscriptions.
#[derive(Debug, Clone)]
pub struct ForwardedRegexDelivery {
    pub scheme: i32,
    pub type_name: String,
    pub group: String,
    pub data: Vec<u8>,
}
