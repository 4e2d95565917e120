// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message relay between portals.
//!
//! # Architecture
//!
//! ```text
//!   portal pub sockets ──MSG──▶ [publish listener]
//!                                     │ relay: prefix match, once per connection
//!                                     ▼
//!   portal sub sockets ◀──MSG── [subscribe listener] ◀──SUB/UNSUB── portal sub sockets
//! ```
//!
//! Each subscriber connection holds a multiset of byte prefixes. A message
//! is queued once to every subscriber connection holding at least one
//! prefix of it. Queues past the high-water mark drop new messages.

use super::connection::{Connection, Queued};
use super::frame::{Frame, FrameCodec, FrameKind};
use super::advertised;
use crate::config::RouterConfig;
use crate::error::Result;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

const PUBLISH_TOKEN: Token = Token(0);
const SUBSCRIBE_TOKEN: Token = Token(1);
const WAKER_TOKEN: Token = Token(2);
const CONNECTION_TOKEN_START: usize = 3;
const MAX_EVENTS: usize = 256;

/// Router counters, updated by the relay thread.
#[derive(Debug)]
pub struct RouterStats {
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    bytes_in: AtomicU64,
    dropped_hwm: AtomicU64,
    publishers: AtomicU64,
    subscribers: AtomicU64,
    subscriptions: AtomicU64,
    started: Instant,
}

impl RouterStats {
    fn new() -> Self {
        Self {
            messages_in: AtomicU64::new(0),
            messages_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            dropped_hwm: AtomicU64::new(0),
            publishers: AtomicU64::new(0),
            subscribers: AtomicU64::new(0),
            subscriptions: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            dropped_hwm: self.dropped_hwm.load(Ordering::Relaxed),
            publishers: self.publishers.load(Ordering::Relaxed),
            subscribers: self.subscribers.load(Ordering::Relaxed),
            subscriptions: self.subscriptions.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterStatsSnapshot {
    pub messages_in: u64,
    pub messages_out: u64,
    pub bytes_in: u64,
    pub dropped_hwm: u64,
    pub publishers: u64,
    pub subscribers: u64,
    pub subscriptions: u64,
    pub uptime_secs: u64,
}

impl RouterStatsSnapshot {
    pub fn messages_per_second(&self) -> f64 {
        if self.uptime_secs > 0 {
            self.messages_in as f64 / self.uptime_secs as f64
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Publisher,
    Subscriber,
}

struct Peer {
    conn: Connection,
    role: Role,
    prefixes: Vec<Vec<u8>>,
}

/// Relay event loop state.
pub struct Router {
    poll: Poll,
    publish_listener: TcpListener,
    subscribe_listener: TcpListener,
    peers: HashMap<Token, Peer>,
    next_token: usize,
    config: RouterConfig,
    stats: Arc<RouterStats>,
    running: Arc<AtomicBool>,
}

impl Router {
    /// Binds both listeners and spawns the relay thread.
    pub fn start(config: &RouterConfig) -> Result<RouterHandle> {
        config.validate()?;
        let poll = Poll::new()?;

        let mut publish_listener =
            TcpListener::bind(SocketAddr::new(config.bind_address, config.publish_port))?;
        let mut subscribe_listener =
            TcpListener::bind(SocketAddr::new(config.bind_address, config.subscribe_port))?;
        poll.registry()
            .register(&mut publish_listener, PUBLISH_TOKEN, Interest::READABLE)?;
        poll.registry()
            .register(&mut subscribe_listener, SUBSCRIBE_TOKEN, Interest::READABLE)?;

        let publish_addr = advertised(publish_listener.local_addr()?);
        let subscribe_addr = advertised(subscribe_listener.local_addr()?);

        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(RouterStats::new());

        let router = Router {
            poll,
            publish_listener,
            subscribe_listener,
            peers: HashMap::new(),
            next_token: CONNECTION_TOKEN_START,
            config: config.clone(),
            stats: Arc::clone(&stats),
            running: Arc::clone(&running),
        };

        let thread = thread::Builder::new()
            .name("strata-router".to_string())
            .spawn(move || router.run())?;

        log::info!(
            "[router] publishers connect to {}, subscribers to {}",
            publish_addr,
            subscribe_addr
        );

        Ok(RouterHandle {
            publish_addr,
            subscribe_addr,
            stats,
            waker,
            running,
            thread: Some(thread),
        })
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);

        while self.running.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("[router] poll failed: {}", e);
                break;
            }

            for event in events.iter() {
                match event.token() {
                    PUBLISH_TOKEN => self.accept(Role::Publisher),
                    SUBSCRIBE_TOKEN => self.accept(Role::Subscriber),
                    WAKER_TOKEN => {}
                    token => {
                        if event.is_readable() {
                            self.handle_readable(token);
                        }
                        if event.is_writable() {
                            self.handle_writable(token);
                        }
                    }
                }
            }
        }

        self.running.store(false, Ordering::Release);
        log::debug!("[router] stopped with {} connection(s)", self.peers.len());
    }

    fn accept(&mut self, role: Role) {
        loop {
            let listener = match role {
                Role::Publisher => &self.publish_listener,
                Role::Subscriber => &self.subscribe_listener,
            };
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;

                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        log::warn!("[router] failed to register {}: {}", peer, e);
                        continue;
                    }

                    let gauge = match role {
                        Role::Publisher => &self.stats.publishers,
                        Role::Subscriber => &self.stats.subscribers,
                    };
                    gauge.fetch_add(1, Ordering::Relaxed);
                    log::debug!("[router] {:?} connected from {}", role, peer);

                    self.peers.insert(
                        token,
                        Peer {
                            conn: Connection::new(
                                stream,
                                peer,
                                self.config.max_frame_size,
                                self.config.send_high_water_mark,
                            ),
                            role,
                            prefixes: Vec::new(),
                        },
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("[router] accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_readable(&mut self, token: Token) {
        let mut frames = Vec::new();
        let result = match self.peers.get_mut(&token) {
            Some(peer) => peer.conn.read_frames(&mut frames),
            None => return,
        };

        for frame in frames {
            self.handle_frame(token, frame);
        }

        if let Err(e) = result {
            let reason = if e.kind() == io::ErrorKind::UnexpectedEof {
                "closed by peer".to_string()
            } else {
                format!("read error: {e}")
            };
            self.close(token, &reason);
        }
    }

    fn handle_frame(&mut self, token: Token, frame: Frame) {
        let Some(peer) = self.peers.get_mut(&token) else {
            return;
        };

        match (peer.role, frame.kind) {
            (Role::Publisher, FrameKind::Message) => self.relay(&frame.body),
            (Role::Subscriber, FrameKind::Subscribe) => {
                log::debug!(
                    "[router] {} subscribed to {:?}",
                    peer.conn.peer(),
                    String::from_utf8_lossy(&frame.body)
                );
                peer.prefixes.push(frame.body);
                self.stats.subscriptions.fetch_add(1, Ordering::Relaxed);
            }
            (Role::Subscriber, FrameKind::Unsubscribe) => {
                if let Some(index) = peer.prefixes.iter().position(|p| *p == frame.body) {
                    peer.prefixes.swap_remove(index);
                    self.stats.subscriptions.fetch_sub(1, Ordering::Relaxed);
                }
            }
            (role, kind) => {
                log::warn!(
                    "[router] ignoring {:?} frame from {:?} {}",
                    kind,
                    role,
                    peer.conn.peer()
                );
            }
        }
    }

    fn relay(&mut self, body: &[u8]) {
        self.stats.messages_in.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_in
            .fetch_add(body.len() as u64, Ordering::Relaxed);

        let encoded = FrameCodec::encode(FrameKind::Message, body);
        let mut failed = Vec::new();

        for (token, peer) in &mut self.peers {
            if peer.role != Role::Subscriber || !peer.prefixes.iter().any(|p| body.starts_with(p))
            {
                continue;
            }
            match peer.conn.queue(encoded.clone()) {
                Queued::Accepted => {
                    self.stats.messages_out.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = peer.conn.flush() {
                        failed.push((*token, format!("write error: {e}")));
                    }
                }
                Queued::Dropped => {
                    self.stats.dropped_hwm.fetch_add(1, Ordering::Relaxed);
                    log::debug!("[router] {} over high-water mark, dropped", peer.conn.peer());
                }
            }
        }

        for (token, reason) in failed {
            self.close(token, &reason);
        }
    }

    fn handle_writable(&mut self, token: Token) {
        let result = match self.peers.get_mut(&token) {
            Some(peer) if peer.conn.has_pending_writes() => peer.conn.flush(),
            _ => return,
        };
        if let Err(e) = result {
            self.close(token, &format!("write error: {e}"));
        }
    }

    fn close(&mut self, token: Token, reason: &str) {
        if let Some(mut peer) = self.peers.remove(&token) {
            let _ = self.poll.registry().deregister(peer.conn.stream_mut());
            let gauge = match peer.role {
                Role::Publisher => &self.stats.publishers,
                Role::Subscriber => &self.stats.subscribers,
            };
            gauge.fetch_sub(1, Ordering::Relaxed);
            self.stats
                .subscriptions
                .fetch_sub(peer.prefixes.len() as u64, Ordering::Relaxed);
            log::debug!("[router] {} disconnected: {}", peer.conn.peer(), reason);
        }
    }
}

/// Owner handle for a running router.
pub struct RouterHandle {
    publish_addr: SocketAddr,
    subscribe_addr: SocketAddr,
    stats: Arc<RouterStats>,
    waker: Arc<Waker>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RouterHandle {
    /// Address publishers connect to.
    pub fn publish_addr(&self) -> SocketAddr {
        self.publish_addr
    }

    /// Address subscribers connect to.
    pub fn subscribe_addr(&self) -> SocketAddr {
        self.subscribe_addr
    }

    pub fn stats(&self) -> RouterStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stops the relay thread and waits for it.
    pub fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        let _ = self.waker.wake();
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| crate::error::Error::Thread("router thread panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for RouterHandle {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::frame::{read_frame, write_frame};
    use std::net::TcpStream;
    use std::time::Duration;

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");
        stream
    }

    #[test]
    fn test_prefix_relay_once_per_connection() {
        let mut router = Router::start(&RouterConfig::default()).expect("router");
        let mut sub = connect(router.subscribe_addr());
        write_frame(&mut sub, FrameKind::Subscribe, b"/nav/").expect("sub");
        write_frame(&mut sub, FrameKind::Subscribe, b"/nav/7/").expect("sub");
        assert!(wait_for(|| router.stats().subscriptions == 2));

        let mut publisher = connect(router.publish_addr());
        write_frame(&mut publisher, FrameKind::Message, b"/other/7/T/1/1/\0x").expect("pub");
        write_frame(&mut publisher, FrameKind::Message, b"/nav/7/T/1/1/\0y").expect("pub");

        let frame = read_frame(&mut sub, 1 << 20).expect("relayed");
        assert_eq!(frame.kind, FrameKind::Message);
        assert_eq!(frame.body, b"/nav/7/T/1/1/\0y");

        assert!(wait_for(|| router.stats().messages_in == 2));
        let stats = router.stats();
        assert_eq!(stats.messages_out, 1, "two matching prefixes, one delivery");
        router.stop().expect("stop");
        assert!(!router.is_running());
    }

    #[test]
    fn test_unsubscribe_is_multiset() {
        let router = Router::start(&RouterConfig::default()).expect("router");
        let mut sub = connect(router.subscribe_addr());
        write_frame(&mut sub, FrameKind::Subscribe, b"/a/").expect("sub");
        write_frame(&mut sub, FrameKind::Subscribe, b"/a/").expect("sub");
        write_frame(&mut sub, FrameKind::Unsubscribe, b"/a/").expect("unsub");
        assert!(wait_for(|| router.stats().subscriptions == 1));

        write_frame(&mut sub, FrameKind::Unsubscribe, b"/a/").expect("unsub");
        assert!(wait_for(|| router.stats().subscriptions == 0));

        let mut publisher = connect(router.publish_addr());
        write_frame(&mut publisher, FrameKind::Message, b"/a/0/CSTR/1/1/\0z").expect("pub");
        assert!(wait_for(|| router.stats().messages_in == 1));
        assert_eq!(router.stats().messages_out, 0);
    }

    #[test]
    fn test_disconnect_updates_gauges() {
        let router = Router::start(&RouterConfig::default()).expect("router");
        {
            let mut sub = connect(router.subscribe_addr());
            write_frame(&mut sub, FrameKind::Subscribe, b"/").expect("sub");
            assert!(wait_for(|| router.stats().subscribers == 1
                && router.stats().subscriptions == 1));
        }
        assert!(wait_for(|| router.stats().subscribers == 0));
        assert_eq!(router.stats().subscriptions, 0);
    }
}
