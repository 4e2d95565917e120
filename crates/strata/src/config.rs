// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Configuration.
//!
//! Supports both programmatic and TOML file-based configuration. Every field
//! has a default so a file only needs to name what it changes:
//!
//! ```toml
//! name = "vehicle"
//! spawn_daemon = true
//!
//! [interprocess]
//! platform = "auv1"
//! manager_port = 11144
//! ```

use crate::bus::frame::DEFAULT_MAX_FRAME_SIZE;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Inter-process transport configuration shared by portals and the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterProcessConfig {
    /// Platform (vehicle) name; portals and manager must agree.
    #[serde(default = "default_platform")]
    pub platform: String,

    /// Address the router and manager bind to and portals connect to.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    #[serde(default = "default_manager_port")]
    pub manager_port: u16,

    /// Router publisher-facing port (0 = dynamic).
    #[serde(default)]
    pub router_publish_port: u16,

    /// Router subscriber-facing port (0 = dynamic).
    #[serde(default)]
    pub router_subscribe_port: u16,

    /// Frames queued per connection before new messages are dropped.
    #[serde(default = "default_send_high_water_mark")]
    pub send_high_water_mark: usize,

    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
}

fn default_platform() -> String {
    "default".to_string()
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_manager_port() -> u16 {
    11144
}

fn default_send_high_water_mark() -> usize {
    1000
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_reconnect_interval_ms() -> u64 {
    100
}

fn default_startup_timeout_ms() -> u64 {
    5000
}

impl Default for InterProcessConfig {
    fn default() -> Self {
        Self {
            platform: default_platform(),
            bind_address: default_bind_address(),
            manager_port: default_manager_port(),
            router_publish_port: 0,
            router_subscribe_port: 0,
            send_high_water_mark: default_send_high_water_mark(),
            max_frame_size: default_max_frame_size(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
        }
    }
}

/// Address clients should dial for a socket bound to `ip`.
pub(crate) fn connect_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        other => other,
    }
}

impl InterProcessConfig {
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn with_manager_port(mut self, port: u16) -> Self {
        self.manager_port = port;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Address portals dial to reach the manager.
    pub fn manager_addr(&self) -> SocketAddr {
        SocketAddr::new(connect_ip(self.bind_address), self.manager_port)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            bind_address: self.bind_address,
            publish_port: self.router_publish_port,
            subscribe_port: self.router_subscribe_port,
            send_high_water_mark: self.send_high_water_mark,
            max_frame_size: self.max_frame_size,
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            bind_address: self.bind_address,
            port: self.manager_port,
            platform: self.platform.clone(),
            max_frame_size: self.max_frame_size,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.platform.is_empty() {
            return Err(Error::Config("platform name is empty".into()));
        }
        if self.platform.contains('/') || self.platform.contains('\0') {
            return Err(Error::Config(format!(
                "platform name {:?} contains '/' or NUL",
                self.platform
            )));
        }
        if self.reconnect_interval_ms == 0 {
            return Err(Error::Config("reconnect_interval_ms must be > 0".into()));
        }
        if self.startup_timeout_ms == 0 {
            return Err(Error::Config("startup_timeout_ms must be > 0".into()));
        }
        self.router_config().validate()
    }

    /// Validation for a portal, which must know a concrete manager port.
    pub fn validate_client(&self) -> Result<()> {
        self.validate()?;
        if self.manager_port == 0 {
            return Err(Error::Config(
                "manager_port 0 is only valid for the daemon".into(),
            ));
        }
        Ok(())
    }
}

/// Router (relay) configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    pub bind_address: IpAddr,
    pub publish_port: u16,
    pub subscribe_port: u16,
    pub send_high_water_mark: usize,
    pub max_frame_size: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        InterProcessConfig::default().router_config()
    }
}

impl RouterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.publish_port != 0 && self.publish_port == self.subscribe_port {
            return Err(Error::Config(format!(
                "router publish and subscribe ports are both {}",
                self.publish_port
            )));
        }
        if self.send_high_water_mark == 0 {
            return Err(Error::Config("send_high_water_mark must be > 0".into()));
        }
        if self.max_frame_size < 64 {
            return Err(Error::Config(format!(
                "max_frame_size {} is too small",
                self.max_frame_size
            )));
        }
        Ok(())
    }
}

/// Manager (socket configuration authority) configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    pub bind_address: IpAddr,
    /// Control port (0 = dynamic).
    pub port: u16,
    pub platform: String,
    pub max_frame_size: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        InterProcessConfig::default().manager_config()
    }
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,

    /// Filter directive for binaries (`info`, `strata=debug`, ...).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Main-thread loop frequency used by `MultiThreadApplication::run`.
    #[serde(default = "default_loop_frequency")]
    pub loop_frequency_hz: f64,

    /// Run the router and manager inside this process.
    #[serde(default)]
    pub spawn_daemon: bool,

    /// Inter-process settings; absent means inter-thread only.
    #[serde(default)]
    pub interprocess: Option<InterProcessConfig>,
}

fn default_app_name() -> String {
    "strata".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_loop_frequency() -> f64 {
    10.0
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            loop_frequency_hz: default_loop_frequency(),
            spawn_daemon: false,
            interprocess: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("application name is empty".into()));
        }
        if !(self.loop_frequency_hz.is_finite() && self.loop_frequency_hz > 0.0) {
            return Err(Error::Config(format!(
                "loop_frequency_hz {} must be positive",
                self.loop_frequency_hz
            )));
        }
        if self.spawn_daemon && self.interprocess.is_none() {
            return Err(Error::Config(
                "spawn_daemon requires an [interprocess] section".into(),
            ));
        }
        match &self.interprocess {
            Some(ipc) if self.spawn_daemon => ipc.validate(),
            Some(ipc) => ipc.validate_client(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = InterProcessConfig::default();
        config.validate_client().expect("defaults validate");
        assert_eq!(config.manager_addr().port(), 11144);
        AppConfig::default().validate().expect("defaults validate");
    }

    #[test]
    fn test_rejects_bad_values() {
        let empty = InterProcessConfig::default().with_platform("");
        assert!(matches!(empty.validate(), Err(Error::Config(_))));

        let slash = InterProcessConfig::default().with_platform("a/b");
        assert!(slash.validate().is_err());

        let dynamic = InterProcessConfig::default().with_manager_port(0);
        dynamic.validate().expect("fine for the daemon");
        assert!(dynamic.validate_client().is_err());

        let clash = InterProcessConfig {
            router_publish_port: 9000,
            router_subscribe_port: 9000,
            ..Default::default()
        };
        assert!(clash.validate().is_err());
    }

    #[test]
    fn test_unspecified_bind_dials_loopback() {
        let config = InterProcessConfig {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ..Default::default()
        };
        assert_eq!(config.manager_addr().ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn test_partial_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            "name = \"auv\"\nspawn_daemon = true\n\n[interprocess]\nplatform = \"auv1\"\nmanager_port = 0\n"
        )
        .expect("write");

        let config = AppConfig::from_file(file.path()).expect("load");
        assert_eq!(config.name, "auv");
        assert_eq!(config.log_level, "info");
        let ipc = config.interprocess.expect("section present");
        assert_eq!(ipc.platform, "auv1");
        assert_eq!(ipc.send_high_water_mark, 1000);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = AppConfig {
            interprocess: Some(InterProcessConfig::default().with_platform("usv")),
            ..Default::default()
        };
        let text = config.to_toml().expect("serialize");
        assert_eq!(AppConfig::from_toml(&text).expect("parse"), config);
    }

    #[test]
    fn test_spawn_daemon_needs_section() {
        let bad = AppConfig {
            spawn_daemon: true,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
