// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multi-threaded application scaffolding.
//!
//! The main thread owns the outermost transporter: a portal when the
//! configuration has an `[interprocess]` section, a plain inter-thread
//! transporter otherwise. Each worker runs its own
//! `InterProcessForwarder<InterThreadTransporter>` stack.
//!
//! # Shutdown
//!
//! `true` published on [`SHUTDOWN_GROUP`] asks every worker to leave its
//! loop. Workers announce their exit with [`ThreadJoinable`] on
//! [`JOINABLE_GROUP`]; the main thread joins them while polling. Workers that
//! have not exited after the grace period have their `alive` flag cleared.

mod thread;

pub use thread::{SimpleThread, ThreadContext};

use crate::bus::Daemon;
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::group::Group;
use crate::interprocess::{InnerTransporter, InterProcessPortal};
use crate::interthread::InterThreadTransporter;
use crate::poller::{PollNotifier, Pollable};
use crate::runtime::TransportRuntime;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Reserved group carrying the stop signal (`true`).
pub const SHUTDOWN_GROUP: Group = Group::new("strata::shutdown");

/// Reserved group on which exiting workers announce themselves.
pub const JOINABLE_GROUP: Group = Group::new("strata::thread_joinable");

/// How long `shutdown` waits for workers to exit on their own.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Worker identity: thread name plus index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadKey {
    pub name: String,
    pub index: usize,
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.index)
    }
}

/// Published by a worker on [`JOINABLE_GROUP`] as it exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadJoinable {
    pub name: String,
    pub index: usize,
}

struct ThreadManagement {
    alive: Arc<AtomicBool>,
    /// Set before the shutdown signal is published.
    stop_requested: Arc<AtomicBool>,
    notifier: Arc<PollNotifier>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl ThreadManagement {
    fn stop(&self) {
        self.alive.store(false, Ordering::Release);
        self.notifier.notify();
    }

    fn join(&mut self, key: &ThreadKey) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| Error::Thread(format!("thread {key} panicked")))?,
            None => Ok(()),
        }
    }
}

enum MainTransport {
    Local(InterThreadTransporter),
    Portal(Box<InterProcessPortal>),
}

impl MainTransport {
    fn publish_local<D: std::any::Any + Send + Sync>(&self, group: &Group, data: D) {
        match self {
            MainTransport::Local(t) => t.publish(group, data),
            MainTransport::Portal(p) => p.publish_local(group, Arc::new(data)),
        }
    }

    fn poll(&mut self, timeout: Option<Duration>) -> usize {
        match self {
            MainTransport::Local(t) => t.poll(timeout),
            MainTransport::Portal(p) => p.poll(timeout),
        }
    }
}

/// Owner of the main-thread transporter stack and the worker threads.
pub struct MultiThreadApplication {
    config: AppConfig,
    runtime: Arc<TransportRuntime>,
    transport: MainTransport,
    // Dropped after the portal that connects to it
    daemon: Option<Daemon>,
    threads: BTreeMap<ThreadKey, ThreadManagement>,
    joinable: Rc<RefCell<Vec<ThreadKey>>>,
    quit: bool,
}

impl MultiThreadApplication {
    pub fn new(config: AppConfig) -> Result<Self> {
        let platform = config
            .interprocess
            .as_ref()
            .map(|ipc| ipc.platform.clone())
            .unwrap_or_else(|| "default".to_owned());
        Self::with_runtime(config, TransportRuntime::new(platform))
    }

    /// Builds the application on an existing runtime, which lets several
    /// simulated processes share one OS process in tests.
    pub fn with_runtime(config: AppConfig, runtime: Arc<TransportRuntime>) -> Result<Self> {
        config.validate()?;

        let mut daemon = None;
        let transporter = InterThreadTransporter::new(Arc::clone(&runtime));
        let transport = match &config.interprocess {
            Some(ipc) => {
                let client = if config.spawn_daemon {
                    let started = Daemon::start(ipc)?;
                    log::info!("[app] '{}' started bus at {}", config.name, started.manager_addr());
                    let client = started.client_config(ipc);
                    daemon = Some(started);
                    client
                } else {
                    ipc.clone()
                };
                MainTransport::Portal(Box::new(InterProcessPortal::new(transporter, &client)?))
            }
            None => MainTransport::Local(transporter),
        };

        let mut app = Self {
            config,
            runtime,
            transport,
            daemon,
            threads: BTreeMap::new(),
            joinable: Rc::new(RefCell::new(Vec::new())),
            quit: false,
        };

        let joinable = Rc::clone(&app.joinable);
        app.interthread()
            .subscribe::<ThreadJoinable, _>(&JOINABLE_GROUP, move |exited: &ThreadJoinable| {
                joinable.borrow_mut().push(ThreadKey {
                    name: exited.name.clone(),
                    index: exited.index,
                });
            });
        Ok(app)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<TransportRuntime> {
        &self.runtime
    }

    /// In-process router and manager, when `spawn_daemon` is set.
    pub fn daemon(&self) -> Option<&Daemon> {
        self.daemon.as_ref()
    }

    /// Inter-thread layer of the main-thread stack.
    pub fn interthread(&mut self) -> &mut InterThreadTransporter {
        match &mut self.transport {
            MainTransport::Local(t) => t,
            MainTransport::Portal(p) => p.inner_mut(),
        }
    }

    /// Inter-process portal, when configured.
    pub fn interprocess(&mut self) -> Option<&mut InterProcessPortal> {
        match &mut self.transport {
            MainTransport::Local(_) => None,
            MainTransport::Portal(p) => Some(&mut **p),
        }
    }

    /// Spawns worker `T` with index `index`.
    pub fn launch_thread<T: SimpleThread>(&mut self, index: usize, config: T::Config) -> Result<()> {
        let key = ThreadKey {
            name: T::NAME.to_owned(),
            index,
        };
        if let Some(existing) = self.threads.get_mut(&key) {
            if existing.alive.load(Ordering::Acquire) {
                return Err(Error::Config(format!("thread {key} is already running")));
            }
            existing.join(&key)?;
        }

        let alive = Arc::new(AtomicBool::new(true));
        let stop_requested = Arc::new(AtomicBool::new(false));
        let notifier = PollNotifier::shared();
        let runtime = Arc::clone(&self.runtime);
        let thread_alive = Arc::clone(&alive);
        let thread_stop = Arc::clone(&stop_requested);
        let thread_notifier = Arc::clone(&notifier);
        let handle = std::thread::Builder::new()
            .name(format!("{}-{}", T::NAME, index))
            .spawn(move || {
                thread::run_thread::<T>(
                    runtime,
                    index,
                    config,
                    thread_alive,
                    thread_stop,
                    thread_notifier,
                )
            })?;

        log::info!("[app] launched thread {}", key);
        self.threads.insert(
            key,
            ThreadManagement {
                alive,
                stop_requested,
                notifier,
                handle: Some(handle),
            },
        );
        Ok(())
    }

    /// Stops worker `name:index` and waits for it.
    pub fn join_thread(&mut self, name: &str, index: usize) -> Result<()> {
        let key = ThreadKey {
            name: name.to_owned(),
            index,
        };
        match self.threads.remove(&key) {
            Some(mut management) => {
                management.stop();
                management.join(&key)
            }
            None => Err(Error::Config(format!("no thread {key}"))),
        }
    }

    pub fn thread_alive(&self, name: &str, index: usize) -> bool {
        let key = ThreadKey {
            name: name.to_owned(),
            index,
        };
        self.threads
            .get(&key)
            .is_some_and(|t| t.alive.load(Ordering::Acquire))
    }

    pub fn running_threads(&self) -> usize {
        self.threads
            .values()
            .filter(|t| t.alive.load(Ordering::Acquire))
            .count()
    }

    /// Polls the main-thread stack and joins workers that announced exit.
    pub fn poll(&mut self, timeout: Option<Duration>) -> usize {
        let items = self.transport.poll(timeout);
        self.reap();
        items
    }

    fn reap(&mut self) {
        let exited: Vec<ThreadKey> = self.joinable.borrow_mut().drain(..).collect();
        for key in exited {
            if let Some(mut management) = self.threads.remove(&key) {
                if let Err(e) = management.join(&key) {
                    log::warn!("[app] {}", e);
                } else {
                    log::debug!("[app] joined thread {}", key);
                }
            }
        }
    }

    /// Makes `run` return after the current iteration.
    pub fn quit(&mut self) {
        self.quit = true;
    }

    /// Runs the main loop at `loop_frequency_hz` until [`quit`](Self::quit),
    /// then shuts the workers down.
    pub fn run(&mut self, mut on_loop: impl FnMut(&mut Self)) -> Result<()> {
        let period = Duration::from_secs_f64(1.0 / self.config.loop_frequency_hz);
        let mut next_tick = Instant::now() + period;
        while !self.quit {
            let timeout = next_tick.saturating_duration_since(Instant::now());
            self.poll(Some(timeout));
            let now = Instant::now();
            if now >= next_tick {
                on_loop(self);
                next_tick += period;
                if next_tick < now {
                    next_tick = now + period;
                }
            }
        }
        self.shutdown()
    }

    /// Signals every worker to stop and joins them.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.threads.is_empty() {
            return Ok(());
        }
        log::info!("[app] shutting down {} thread(s)", self.threads.len());
        for management in self.threads.values() {
            management.stop_requested.store(true, Ordering::Release);
        }
        self.transport.publish_local(&SHUTDOWN_GROUP, true);

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while self.running_threads() > 0 && Instant::now() < deadline {
            self.poll(Some(Duration::from_millis(10)));
        }

        let mut first_error = None;
        for (key, mut management) in std::mem::take(&mut self.threads) {
            if management.alive.load(Ordering::Acquire) {
                log::warn!("[app] thread {} ignored shutdown, forcing", key);
            }
            management.stop();
            if let Err(e) = management.join(&key) {
                log::warn!("[app] {}", e);
                first_error.get_or_insert(e);
            }
        }
        self.joinable.borrow_mut().clear();
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for MultiThreadApplication {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interprocess::Publishes;

    const TICKS: Group = Group::new("ticks");

    struct Ticker {
        count: u32,
    }

    impl SimpleThread for Ticker {
        type Config = u32;
        const NAME: &'static str = "ticker";

        fn create(_ctx: &mut ThreadContext, start: u32) -> Result<Self> {
            Ok(Self { count: start })
        }

        fn loop_frequency(&self) -> Option<f64> {
            Some(100.0)
        }

        fn on_loop(&mut self, ctx: &mut ThreadContext) {
            self.count += 1;
            let _ = ctx.interprocess().publish(&TICKS, self.count.to_string());
        }
    }

    struct Failing;

    impl SimpleThread for Failing {
        type Config = ();
        const NAME: &'static str = "failing";

        fn create(_ctx: &mut ThreadContext, _: ()) -> Result<Self> {
            Err(Error::Config("refusing to start".into()))
        }
    }

    #[test]
    fn test_worker_publishes_to_main() {
        let mut app = MultiThreadApplication::new(AppConfig::default()).expect("app");
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        app.interthread()
            .subscribe::<String, _>(&TICKS, move |v: &String| s.borrow_mut().push(v.clone()));

        app.launch_thread::<Ticker>(0, 0).expect("launch");
        assert!(app.launch_thread::<Ticker>(0, 0).is_err());

        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.borrow().len() < 3 && Instant::now() < deadline {
            app.poll(Some(Duration::from_millis(20)));
        }
        assert!(seen.borrow().len() >= 3);
        assert_eq!(seen.borrow()[0], "1");

        app.shutdown().expect("shutdown");
        assert_eq!(app.running_threads(), 0);
        assert!(!app.thread_alive("ticker", 0));
    }

    #[test]
    fn test_failed_create_is_reported_on_join() {
        let mut app = MultiThreadApplication::new(AppConfig::default()).expect("app");
        app.launch_thread::<Failing>(3, ()).expect("launch");
        assert!(matches!(app.join_thread("failing", 3), Err(Error::Config(_))));
        assert!(app.join_thread("failing", 3).is_err());
    }

    #[test]
    fn test_run_until_quit() {
        let config = AppConfig {
            loop_frequency_hz: 200.0,
            ..AppConfig::default()
        };
        let mut app = MultiThreadApplication::new(config).expect("app");
        let mut loops = 0;
        app.run(|app| {
            loops += 1;
            if loops == 5 {
                app.quit();
            }
        })
        .expect("run");
        assert_eq!(loops, 5);
    }
}
