// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket-configuration authority.
//!
//! Portals connect to the manager's control port at startup, send
//! `ProvideSockets` and receive the router's publish/subscribe addresses.
//! Requests and replies are JSON bodies in `Control` frames.
//!
//! A client stays listed while the connection it registered on is open.

use super::connection::Connection;
use super::frame::{read_frame, write_frame, FrameCodec, FrameKind, DEFAULT_MAX_FRAME_SIZE};
use super::advertised;
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const CONNECTION_TOKEN_START: usize = 2;
const MAX_EVENTS: usize = 64;

/// Control-plane request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum ManagerRequest {
    ProvideSockets { client: String, platform: String },
    Ping,
    ListClients,
}

/// Control-plane reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum ManagerReply {
    Sockets {
        publish: SocketAddr,
        subscribe: SocketAddr,
    },
    Pong {
        platform: String,
    },
    Clients {
        clients: Vec<String>,
    },
    Error {
        message: String,
    },
}

struct ManagerState {
    platform: String,
    publish: SocketAddr,
    subscribe: SocketAddr,
    clients: Arc<Mutex<Vec<String>>>,
    /// Client names registered per control connection.
    owners: HashMap<Token, Vec<String>>,
    requests: Arc<AtomicU64>,
}

impl ManagerState {
    fn answer(&mut self, token: Token, request: ManagerRequest) -> ManagerReply {
        self.requests.fetch_add(1, Ordering::Relaxed);
        match request {
            ManagerRequest::ProvideSockets { client, platform } => {
                if platform != self.platform {
                    log::warn!(
                        "[manager] client '{}' asked for platform '{}', serving '{}'",
                        client,
                        platform,
                        self.platform
                    );
                    return ManagerReply::Error {
                        message: format!(
                            "platform mismatch: manager serves '{}', client asked for '{}'",
                            self.platform, platform
                        ),
                    };
                }
                let mut clients = self.clients.lock();
                if !clients.contains(&client) {
                    log::info!("[manager] configured client '{}'", client);
                    clients.push(client.clone());
                    self.owners.entry(token).or_default().push(client);
                }
                ManagerReply::Sockets {
                    publish: self.publish,
                    subscribe: self.subscribe,
                }
            }
            ManagerRequest::Ping => ManagerReply::Pong {
                platform: self.platform.clone(),
            },
            ManagerRequest::ListClients => ManagerReply::Clients {
                clients: self.clients.lock().clone(),
            },
        }
    }

    /// Drops the clients registered on a closed connection.
    fn forget(&mut self, token: Token) {
        let Some(names) = self.owners.remove(&token) else {
            return;
        };
        self.clients.lock().retain(|c| !names.contains(c));
        for name in names {
            log::info!("[manager] client '{}' disconnected", name);
        }
    }
}

/// Manager event loop state.
pub struct Manager {
    poll: Poll,
    listener: TcpListener,
    conns: HashMap<Token, Connection>,
    next_token: usize,
    max_frame_size: usize,
    state: ManagerState,
    running: Arc<AtomicBool>,
}

impl Manager {
    /// Binds the control port and spawns the manager thread. `publish` and
    /// `subscribe` are the router addresses handed to clients.
    pub fn start(
        config: &ManagerConfig,
        publish: SocketAddr,
        subscribe: SocketAddr,
    ) -> Result<ManagerHandle> {
        if config.platform.is_empty() {
            return Err(Error::Config("manager platform name is empty".into()));
        }
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(SocketAddr::new(config.bind_address, config.port))?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let addr = advertised(listener.local_addr()?);

        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let running = Arc::new(AtomicBool::new(true));
        let clients = Arc::new(Mutex::new(Vec::new()));
        let requests = Arc::new(AtomicU64::new(0));

        let manager = Manager {
            poll,
            listener,
            conns: HashMap::new(),
            next_token: CONNECTION_TOKEN_START,
            max_frame_size: config.max_frame_size,
            state: ManagerState {
                platform: config.platform.clone(),
                publish,
                subscribe,
                clients: Arc::clone(&clients),
                owners: HashMap::new(),
                requests: Arc::clone(&requests),
            },
            running: Arc::clone(&running),
        };

        let thread = thread::Builder::new()
            .name("strata-manager".to_string())
            .spawn(move || manager.run())?;

        log::info!(
            "[manager] platform '{}' serving on {}",
            config.platform,
            addr
        );

        Ok(ManagerHandle {
            addr,
            clients,
            requests,
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
                log::error!("[manager] poll failed: {}", e);
                break;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept(),
                    WAKER_TOKEN => {}
                    token => {
                        if event.is_readable() {
                            self.handle_readable(token);
                        }
                        if event.is_writable() {
                            self.flush(token);
                        }
                    }
                }
            }
        }

        self.running.store(false, Ordering::Release);
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        log::warn!("[manager] failed to register {}: {}", peer, e);
                        continue;
                    }
                    self.conns.insert(
                        token,
                        Connection::new(stream, peer, self.max_frame_size, usize::MAX),
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("[manager] accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_readable(&mut self, token: Token) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };

        let mut frames = Vec::new();
        let result = conn.read_frames(&mut frames);

        for frame in frames {
            let reply = if frame.kind != FrameKind::Control {
                ManagerReply::Error {
                    message: format!("expected a control frame, got {:?}", frame.kind),
                }
            } else {
                match serde_json::from_slice::<ManagerRequest>(&frame.body) {
                    Ok(request) => self.state.answer(token, request),
                    Err(e) => ManagerReply::Error {
                        message: format!("malformed request: {e}"),
                    },
                }
            };
            match serde_json::to_vec(&reply) {
                Ok(body) => conn.queue_control(FrameCodec::encode(FrameKind::Control, &body)),
                Err(e) => log::error!("[manager] failed to encode reply: {}", e),
            }
        }

        let flushed = conn.flush();
        if result.is_err() || flushed.is_err() {
            self.close(token);
        }
    }

    fn flush(&mut self, token: Token) {
        let failed = match self.conns.get_mut(&token) {
            Some(conn) => conn.flush().is_err(),
            None => return,
        };
        if failed {
            self.close(token);
        }
    }

    fn close(&mut self, token: Token) {
        if let Some(mut conn) = self.conns.remove(&token) {
            let _ = self.poll.registry().deregister(conn.stream_mut());
        }
        self.state.forget(token);
    }
}

/// Owner handle for a running manager.
pub struct ManagerHandle {
    addr: SocketAddr,
    clients: Arc<Mutex<Vec<String>>>,
    requests: Arc<AtomicU64>,
    waker: Arc<Waker>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ManagerHandle {
    /// Control address portals dial.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connected clients that requested their socket configuration, in order.
    pub fn clients(&self) -> Vec<String> {
        self.clients.lock().clone()
    }

    pub fn requests_served(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        let _ = self.waker.wake();
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| Error::Thread("manager thread panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for ManagerHandle {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Blocking control-plane client.
pub struct ManagerClient {
    stream: TcpStream,
}

impl ManagerClient {
    pub fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        Ok(Self { stream })
    }

    /// Replaces the read/write timeout. Zero is clamped to 1ms.
    pub fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        let timeout = timeout.max(Duration::from_millis(1));
        self.stream.set_read_timeout(Some(timeout))?;
        self.stream.set_write_timeout(Some(timeout))
    }

    /// Sends `request` and waits for the reply. A reply that does not
    /// arrive within the read timeout fails with `TimedOut`.
    pub fn request(&mut self, request: &ManagerRequest) -> io::Result<ManagerReply> {
        let body = serde_json::to_vec(request).map_err(io::Error::other)?;
        write_frame(&mut self.stream, FrameKind::Control, &body)?;
        let frame = read_frame(&mut self.stream, DEFAULT_MAX_FRAME_SIZE).map_err(|e| {
            if e.kind() == io::ErrorKind::WouldBlock {
                io::Error::new(io::ErrorKind::TimedOut, "manager did not reply")
            } else {
                e
            }
        })?;
        if frame.kind != FrameKind::Control {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected control reply, got {:?}", frame.kind),
            ));
        }
        serde_json::from_slice(&frame.body)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// One-shot request helper.
pub fn query(addr: SocketAddr, request: &ManagerRequest, timeout: Duration) -> io::Result<ManagerReply> {
    ManagerClient::connect(addr, timeout)?.request(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start() -> ManagerHandle {
        let config = ManagerConfig {
            port: 0,
            platform: "auv1".into(),
            ..Default::default()
        };
        Manager::start(
            &config,
            "127.0.0.1:5001".parse().unwrap(),
            "127.0.0.1:5002".parse().unwrap(),
        )
        .expect("manager")
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_provide_sockets() {
        let manager = start();
        let mut client =
            ManagerClient::connect(manager.addr(), Duration::from_secs(2)).expect("connect");
        let reply = client
            .request(&ManagerRequest::ProvideSockets {
                client: "nav".into(),
                platform: "auv1".into(),
            })
            .expect("reply");
        assert_eq!(
            reply,
            ManagerReply::Sockets {
                publish: "127.0.0.1:5001".parse().unwrap(),
                subscribe: "127.0.0.1:5002".parse().unwrap(),
            }
        );
        assert_eq!(manager.clients(), vec!["nav".to_string()]);

        drop(client);
        assert!(wait_until(|| manager.clients().is_empty()));
    }

    #[test]
    fn test_ping_and_list_on_one_connection() {
        let manager = start();
        let mut client =
            ManagerClient::connect(manager.addr(), Duration::from_secs(2)).expect("connect");
        assert_eq!(
            client.request(&ManagerRequest::Ping).expect("pong"),
            ManagerReply::Pong {
                platform: "auv1".into()
            }
        );
        assert_eq!(
            client.request(&ManagerRequest::ListClients).expect("list"),
            ManagerReply::Clients { clients: vec![] }
        );
        assert_eq!(manager.requests_served(), 2);
    }

    #[test]
    fn test_platform_mismatch() {
        let manager = start();
        let reply = query(
            manager.addr(),
            &ManagerRequest::ProvideSockets {
                client: "nav".into(),
                platform: "usv".into(),
            },
            Duration::from_secs(2),
        )
        .expect("reply");
        assert!(matches!(reply, ManagerReply::Error { .. }));
        assert!(manager.clients().is_empty());
    }

    #[test]
    fn test_request_json_shape() {
        let json = serde_json::to_string(&ManagerRequest::Ping).expect("json");
        assert_eq!(json, r#"{"request":"ping"}"#);
    }
}
