// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # strata - layered typed publish/subscribe
//!
//! Typed messages are published under a [`Group`] and delivered to
//! subscribers in the same thread, in other threads of the same process,
//! and in other processes connected to the same bus.
//!
//! ## Quick Start
//!
//! ```rust
//! use strata::{Group, InterThreadTransporter, Pollable, TransportRuntime};
//! use std::time::Duration;
//!
//! const SPEED: Group = Group::new("speed");
//!
//! let runtime = TransportRuntime::new("demo");
//! let mut transporter = InterThreadTransporter::new(runtime);
//! transporter.subscribe::<f64, _>(&SPEED, |v| println!("speed {v}"));
//! transporter.publish(&SPEED, 1.5_f64);
//! assert_eq!(transporter.poll(Some(Duration::ZERO)), 1);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                      MultiThreadApplication                         |
//! |   main thread: InterProcessPortal<InterThreadTransporter>           |
//! |   workers:     InterProcessForwarder<InterThreadTransporter>        |
//! +---------------------------------------------------------------------+
//! |   Subscription store | identifiers | schemes and codecs             |
//! +---------------------------------------------------------------------+
//! |   InterThreadHub (TransportRuntime)  |  bus: Router + Manager (TCP) |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`InterThreadTransporter`] | In-process delivery of shared `Arc<D>` values |
//! | [`InterProcessForwarder`] | Worker-side shim that forwards to the portal |
//! | [`InterProcessPortal`] | Owner of the bus connection |
//! | [`Daemon`] | Router and manager |
//! | [`MultiThreadApplication`] | Worker threads and shutdown |
//!
//! ## Modules Overview
//!
//! - [`interthread`] - in-process transport
//! - [`interprocess`] - forwarder, portal and capability traits
//! - [`bus`] - framing, router and manager
//! - [`codec`] / [`scheme`] - marshalling schemes

/// Worker threads and shutdown.
pub mod application;
/// External bus: framing, router, manager.
pub mod bus;
/// Serializer/parser traits and built-in codecs.
pub mod codec;
/// TOML configuration.
pub mod config;
/// Error types.
pub mod error;
pub mod group;
/// Identifier construction and parsing.
pub mod identifier;
/// Forwarder, portal and the transporter capability traits.
pub mod interprocess;
/// In-process transport.
pub mod interthread;
pub mod poller;
pub mod runtime;
/// Marshalling scheme tags.
pub mod scheme;
pub mod subscription;

pub use application::{
    MultiThreadApplication, SimpleThread, ThreadContext, ThreadJoinable, ThreadKey,
    JOINABLE_GROUP, SHUTDOWN_GROUP,
};
pub use bus::Daemon;
pub use codec::{JsonType, Message, SerializerParser};
pub use config::{AppConfig, InterProcessConfig, ManagerConfig, RouterConfig};
pub use error::{CodecError, Error, Result, StatusCode};
pub use group::Group;
pub use identifier::{Identifier, IdentifierWildcard};
pub use interprocess::{
    InnerTransporter, InterProcessForwarder, InterProcessPortal, PortalState, PortalStats,
    Publishes, Subscribes, TransporterConfig,
};
pub use interthread::InterThreadTransporter;
pub use poller::{PollNotifier, Pollable};
pub use runtime::TransportRuntime;
pub use scheme::{Cstr, Json, MarshallingScheme, Protobuf, Scheme};
pub use subscription::RegexFilter;
