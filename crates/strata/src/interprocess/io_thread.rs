// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Portal I/O thread.
//!
//! ```text
//! +------------------------------------------------------------+
//! |                      PortalIoThread                        |
//! |  configure: manager ──ProvideSockets──▶ router addresses   |
//! |                                                            |
//! |  mio::Poll                                                 |
//! |   - publish socket   (MSG frames out)                      |
//! |   - subscribe socket (SUB/UNSUB out, MSG frames in)        |
//! |   - Waker            (commands from the portal)            |
//! |                             |                              |
//! |                             v                              |
//! |        event channel ──▶ portal, then PollNotifier::notify |
//! +------------------------------------------------------------+
//! ```
//!
//! Outbound messages beyond the send high-water mark are dropped and counted.

use crate::bus::connection::{Connection, Queued};
use crate::bus::frame::{FrameCodec, FrameKind};
use crate::bus::{ManagerClient, ManagerReply, ManagerRequest};
use crate::config::InterProcessConfig;
use crate::error::{Error, Result, StatusCode};
use crate::poller::PollNotifier;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const WAKER_TOKEN: Token = Token(0);
const PUBLISH_TOKEN: Token = Token(1);
const SUBSCRIBE_TOKEN: Token = Token(2);

const MAX_EVENTS: usize = 64;

/// Upper bound for a single connect attempt during startup.
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(500);

/// Commands sent from the portal to the I/O thread.
#[derive(Debug)]
pub(crate) enum PortalCommand {
    /// Bus message body (identifier, NUL, payload).
    Publish(Vec<u8>),
    Subscribe(Vec<u8>),
    Unsubscribe(Vec<u8>),
    Shutdown,
}

/// Events emitted by the I/O thread.
#[derive(Debug)]
pub(crate) enum PortalEvent {
    /// Both router sockets are connected.
    PubConfiguration {
        publish: SocketAddr,
        subscribe: SocketAddr,
    },
    /// Inbound bus message body.
    Receive(Vec<u8>),
    StartupFailed { code: StatusCode, detail: String },
    Disconnected(String),
}

/// Portal-side handle to the I/O thread.
pub(crate) struct PortalIoHandle {
    cmd_tx: Sender<PortalCommand>,
    event_rx: Receiver<PortalEvent>,
    waker: Arc<Waker>,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl PortalIoHandle {
    pub(crate) fn send(&self, command: PortalCommand) -> Result<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| Error::NotReady("portal I/O thread stopped"))?;
        self.waker.wake()?;
        Ok(())
    }

    /// Next pending event, if any.
    pub(crate) fn try_event(&self) -> Option<PortalEvent> {
        match self.event_rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub(crate) fn recv_timeout(&self, timeout: Duration) -> Option<PortalEvent> {
        match self.event_rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Outbound messages dropped at the high-water mark.
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn shutdown(&mut self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        let _ = self.cmd_tx.send(PortalCommand::Shutdown);
        let _ = self.waker.wake();
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| Error::Thread("portal I/O thread panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for PortalIoHandle {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

struct RouterLinks {
    publish: Connection,
    subscribe: Connection,
    /// Held open for the portal's lifetime; the manager lists this client
    /// until it closes.
    _manager: ManagerClient,
}

/// I/O thread state.
pub(crate) struct PortalIoThread {
    config: InterProcessConfig,
    client_name: String,
    poll: Poll,
    cmd_rx: Receiver<PortalCommand>,
    event_tx: Sender<PortalEvent>,
    notifier: Arc<PollNotifier>,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl PortalIoThread {
    /// Spawns the I/O thread. Configuration happens on the thread; its
    /// outcome arrives as the first event.
    pub(crate) fn spawn(
        config: &InterProcessConfig,
        client_name: String,
        notifier: Arc<PollNotifier>,
    ) -> Result<PortalIoHandle> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (cmd_tx, cmd_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let dropped = Arc::new(AtomicU64::new(0));

        let io = PortalIoThread {
            config: config.clone(),
            client_name,
            poll,
            cmd_rx,
            event_tx,
            notifier,
            running: Arc::clone(&running),
            dropped: Arc::clone(&dropped),
        };

        let thread = thread::Builder::new()
            .name("strata-portal-io".into())
            .spawn(move || io.run())?;

        Ok(PortalIoHandle {
            cmd_tx,
            event_rx,
            waker,
            running,
            dropped,
            thread: Some(thread),
        })
    }

    fn emit(&self, event: PortalEvent) {
        let _ = self.event_tx.send(event);
        self.notifier.notify();
    }

    fn run(mut self) {
        match self.configure() {
            Ok(mut links) => {
                let publish = links.publish.peer();
                let subscribe = links.subscribe.peer();
                log::info!(
                    "[portal] '{}' connected to router (pub {}, sub {})",
                    self.client_name,
                    publish,
                    subscribe
                );
                self.emit(PortalEvent::PubConfiguration { publish, subscribe });
                if let Err(reason) = self.event_loop(&mut links) {
                    log::warn!("[portal] bus connection lost: {}", reason);
                    self.emit(PortalEvent::Disconnected(reason));
                }
            }
            Err((code, detail)) => {
                log::warn!("[portal] startup failed ({}): {}", code, detail);
                self.emit(PortalEvent::StartupFailed { code, detail });
            }
        }
        self.running.store(false, Ordering::Release);
    }

    /// Asks the manager for the router addresses and connects to both.
    fn configure(&mut self) -> std::result::Result<RouterLinks, (StatusCode, String)> {
        let deadline = Instant::now() + self.config.startup_timeout();
        let manager = self.config.manager_addr();
        let remaining = || deadline.saturating_duration_since(Instant::now());

        let mut client = loop {
            if !self.running.load(Ordering::Acquire) {
                return Err((StatusCode::Disconnected, "shut down during startup".into()));
            }
            match ManagerClient::connect(manager, remaining().min(CONNECT_ATTEMPT_TIMEOUT)) {
                Ok(client) => break client,
                Err(e) => {
                    log::debug!("[portal] manager {} not reachable yet: {}", manager, e);
                    if remaining() <= self.config.reconnect_interval() {
                        return Err((
                            StatusCode::ConnectionFailed,
                            format!("manager {manager} unreachable: {e}"),
                        ));
                    }
                    thread::sleep(self.config.reconnect_interval());
                }
            }
        };

        let request = ManagerRequest::ProvideSockets {
            client: self.client_name.clone(),
            platform: self.config.platform.clone(),
        };
        let reply = client
            .set_timeout(remaining())
            .and_then(|()| client.request(&request))
            .map_err(|e| match e.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => (
                    StatusCode::StartupTimedOut,
                    format!("manager {manager} did not answer: {e}"),
                ),
                _ => (
                    StatusCode::ConnectionFailed,
                    format!("manager {manager} request failed: {e}"),
                ),
            })?;

        let (publish, subscribe) = match reply {
            ManagerReply::Sockets { publish, subscribe } => (publish, subscribe),
            ManagerReply::Error { message } => {
                return Err((StatusCode::ConnectionFailed, message));
            }
            other => {
                return Err((
                    StatusCode::ConnectionFailed,
                    format!("unexpected manager reply {other:?}"),
                ));
            }
        };

        let publish = self
            .connect_router(publish, PUBLISH_TOKEN, remaining())
            .map_err(|e| (StatusCode::ConnectionFailed, format!("router {publish}: {e}")))?;
        let subscribe = self
            .connect_router(subscribe, SUBSCRIBE_TOKEN, remaining())
            .map_err(|e| (StatusCode::ConnectionFailed, format!("router {subscribe}: {e}")))?;
        Ok(RouterLinks {
            publish,
            subscribe,
            _manager: client,
        })
    }

    fn connect_router(&self, addr: SocketAddr, token: Token, timeout: Duration) -> io::Result<Connection> {
        let timeout = timeout.clamp(Duration::from_millis(1), CONNECT_ATTEMPT_TIMEOUT);
        let stream = std::net::TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nonblocking(true)?;
        let mut stream = TcpStream::from_std(stream);
        self.poll
            .registry()
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;
        Ok(Connection::new(
            stream,
            addr,
            self.config.max_frame_size,
            self.config.send_high_water_mark,
        ))
    }

    /// Runs until shutdown (`Ok`) or a socket failure (`Err(reason)`).
    fn event_loop(&mut self, links: &mut RouterLinks) -> std::result::Result<(), String> {
        let mut events = Events::with_capacity(MAX_EVENTS);
        let mut frames = Vec::new();

        while self.running.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(format!("poll failed: {e}"));
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {
                        if !self.drain_commands(links)? {
                            return Ok(());
                        }
                    }
                    PUBLISH_TOKEN => {
                        if event.is_readable() {
                            // The router never writes here; this only surfaces a close
                            links
                                .publish
                                .read_frames(&mut frames)
                                .map_err(|e| format!("publish socket: {e}"))?;
                            frames.clear();
                        }
                        if event.is_writable() {
                            links
                                .publish
                                .flush()
                                .map_err(|e| format!("publish socket: {e}"))?;
                        }
                    }
                    SUBSCRIBE_TOKEN => {
                        if event.is_readable() {
                            let result = links.subscribe.read_frames(&mut frames);
                            for frame in frames.drain(..) {
                                if frame.kind == FrameKind::Message {
                                    self.emit(PortalEvent::Receive(frame.body));
                                } else {
                                    log::debug!("[portal] ignoring {:?} frame from router", frame.kind);
                                }
                            }
                            result.map_err(|e| format!("subscribe socket: {e}"))?;
                        }
                        if event.is_writable() {
                            links
                                .subscribe
                                .flush()
                                .map_err(|e| format!("subscribe socket: {e}"))?;
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Applies queued commands. Returns false on shutdown.
    fn drain_commands(&mut self, links: &mut RouterLinks) -> std::result::Result<bool, String> {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(PortalCommand::Publish(body)) => {
                    let frame = FrameCodec::encode(FrameKind::Message, &body);
                    if links.publish.queue(frame) == Queued::Dropped {
                        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        log::debug!("[portal] send queue full, dropped message ({} total)", dropped);
                    }
                }
                Ok(PortalCommand::Subscribe(prefix)) => {
                    links
                        .subscribe
                        .queue_control(FrameCodec::encode(FrameKind::Subscribe, &prefix));
                }
                Ok(PortalCommand::Unsubscribe(prefix)) => {
                    links
                        .subscribe
                        .queue_control(FrameCodec::encode(FrameKind::Unsubscribe, &prefix));
                }
                Ok(PortalCommand::Shutdown) | Err(TryRecvError::Disconnected) => return Ok(false),
                Err(TryRecvError::Empty) => break,
            }
        }
        links
            .publish
            .flush()
            .map_err(|e| format!("publish socket: {e}"))?;
        links
            .subscribe
            .flush()
            .map_err(|e| format!("subscribe socket: {e}"))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Daemon;

    fn daemon() -> Daemon {
        let config = InterProcessConfig::default().with_manager_port(0);
        Daemon::start(&config).expect("daemon")
    }

    #[test]
    fn test_configures_against_daemon() {
        let daemon = daemon();
        let config = daemon.client_config(&InterProcessConfig::default());
        let notifier = PollNotifier::shared();
        let handle = PortalIoThread::spawn(&config, "io-test".into(), Arc::clone(&notifier))
            .expect("spawn");

        match handle.recv_timeout(Duration::from_secs(5)) {
            Some(PortalEvent::PubConfiguration { publish, subscribe }) => {
                assert_eq!(publish, daemon.router().publish_addr());
                assert_eq!(subscribe, daemon.router().subscribe_addr());
            }
            other => panic!("expected PubConfiguration, got {other:?}"),
        }
        assert!(notifier.wait(Some(Duration::from_secs(5))));
        assert_eq!(daemon.manager().clients(), vec!["io-test".to_string()]);
    }

    #[test]
    fn test_loopback_through_router() {
        let daemon = daemon();
        let config = daemon.client_config(&InterProcessConfig::default());
        let handle =
            PortalIoThread::spawn(&config, "loop".into(), PollNotifier::shared()).expect("spawn");
        assert!(matches!(
            handle.recv_timeout(Duration::from_secs(5)),
            Some(PortalEvent::PubConfiguration { .. })
        ));

        handle
            .send(PortalCommand::Subscribe(b"/loop/".to_vec()))
            .expect("subscribe");
        let deadline = Instant::now() + Duration::from_secs(5);
        while daemon.router().stats().subscriptions == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        handle
            .send(PortalCommand::Publish(b"/loop/0/CSTR/1/1/\0hi".to_vec()))
            .expect("publish");
        match handle.recv_timeout(Duration::from_secs(5)) {
            Some(PortalEvent::Receive(body)) => assert_eq!(body, b"/loop/0/CSTR/1/1/\0hi"),
            other => panic!("expected Receive, got {other:?}"),
        }
    }

    #[test]
    fn test_unreachable_manager() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let config = InterProcessConfig::default()
            .with_manager_port(port)
            .with_startup_timeout(Duration::from_millis(300));
        let mut handle =
            PortalIoThread::spawn(&config, "nobody".into(), PollNotifier::shared()).expect("spawn");
        match handle.recv_timeout(Duration::from_secs(5)) {
            Some(PortalEvent::StartupFailed { code, .. }) => {
                assert_eq!(code, StatusCode::ConnectionFailed)
            }
            other => panic!("expected StartupFailed, got {other:?}"),
        }
        handle.shutdown().expect("shutdown");
        assert!(!handle.is_running());
    }
}
