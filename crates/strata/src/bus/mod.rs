// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! External pub/sub bus: framing, relay (router) and control plane (manager).
//!
//! # Architecture
//!
//! ```text
//!  +-----------+   CONTROL    +-----------+
//!  |  portal   |─────────────▶|  manager  |  ProvideSockets → router addrs
//!  |  I/O thr  |              +-----------+
//!  |           |   MSG        +-----------+   MSG (prefix match)
//!  |  pub sock |─────────────▶|  router   |──────────────────▶ sub socks
//!  |  sub sock |◀─────────────|           |◀── SUB / UNSUB ─── sub socks
//!  +-----------+              +-----------+
//! ```
//!
//! Router and manager each run on their own OS thread driven by a `mio`
//! event loop and stop cooperatively through a waker.

pub(crate) mod connection;
/// Length-prefix frame codec
pub mod frame;
/// Socket-configuration authority
pub mod manager;
/// XSUB/XPUB-style relay
pub mod router;

pub use manager::{Manager, ManagerClient, ManagerHandle, ManagerReply, ManagerRequest};
pub use router::{Router, RouterHandle, RouterStats, RouterStatsSnapshot};

use crate::config::{connect_ip, InterProcessConfig};
use crate::error::Result;
use std::net::SocketAddr;

/// Address a client should dial for a socket bound at `bound`.
pub(crate) fn advertised(bound: SocketAddr) -> SocketAddr {
    SocketAddr::new(connect_ip(bound.ip()), bound.port())
}

/// Router plus manager, as run by `strata-daemon` or an application with
/// `spawn_daemon = true`.
pub struct Daemon {
    router: RouterHandle,
    manager: ManagerHandle,
}

impl Daemon {
    pub fn start(config: &InterProcessConfig) -> Result<Self> {
        config.validate()?;
        let router = router::Router::start(&config.router_config())?;
        let manager = manager::Manager::start(
            &config.manager_config(),
            router.publish_addr(),
            router.subscribe_addr(),
        )?;
        Ok(Self { router, manager })
    }

    pub fn manager_addr(&self) -> SocketAddr {
        self.manager.addr()
    }

    pub fn router(&self) -> &RouterHandle {
        &self.router
    }

    pub fn manager(&self) -> &ManagerHandle {
        &self.manager
    }

    /// Config for portals connecting to this daemon.
    pub fn client_config(&self, base: &InterProcessConfig) -> InterProcessConfig {
        let mut config = base.clone();
        config.bind_address = self.manager.addr().ip();
        config.manager_port = self.manager.addr().port();
        config
    }

    pub fn stop(&mut self) -> Result<()> {
        self.manager.stop()?;
        self.router.stop()
    }
}
