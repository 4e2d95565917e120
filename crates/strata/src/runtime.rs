// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-process transport context.
//!
//! Every transporter holds an `Arc<TransportRuntime>` instead of consulting
//! process-wide statics. Tests build several runtimes with distinct process
//! ids to simulate several processes inside one test binary.

use crate::interthread::InterThreadHub;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process id, platform name, thread-index counter and the inter-thread hub.
#[derive(Debug)]
pub struct TransportRuntime {
    process_id: u32,
    platform: String,
    next_thread: AtomicU64,
    hub: InterThreadHub,
}

impl TransportRuntime {
    /// Runtime for the current OS process.
    pub fn new(platform: impl Into<String>) -> Arc<Self> {
        Self::with_process_id(platform, std::process::id())
    }

    /// Runtime with an explicit process id.
    pub fn with_process_id(platform: impl Into<String>, process_id: u32) -> Arc<Self> {
        Arc::new(Self {
            process_id,
            platform: platform.into(),
            next_thread: AtomicU64::new(1),
            hub: InterThreadHub::new(),
        })
    }

    #[inline]
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn hub(&self) -> &InterThreadHub {
        &self.hub
    }

    /// Allocates the next transporter thread index (never 0).
    pub(crate) fn next_thread_id(&self) -> u64 {
        self.next_thread.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_ids_unique() {
        let runtime = TransportRuntime::with_process_id("test", 99);
        let a = runtime.next_thread_id();
        let b = runtime.next_thread_id();
        assert_ne!(a, b);
        assert_ne!(a, 0);
        assert_eq!(runtime.process_id(), 99);
        assert_eq!(runtime.platform(), "test");
    }
}
