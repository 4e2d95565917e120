// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Worker threads launched by [`MultiThreadApplication`](super::MultiThreadApplication).

use super::{ThreadJoinable, JOINABLE_GROUP, SHUTDOWN_GROUP};
use crate::error::Result;
use crate::interprocess::{InnerTransporter, InterProcessForwarder};
use crate::interthread::InterThreadTransporter;
use crate::poller::{PollNotifier, Pollable};
use crate::runtime::TransportRuntime;
use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest a worker sleeps before re-checking its `alive` flag.
pub(crate) const IDLE_POLL: Duration = Duration::from_millis(100);

/// Per-thread state handed to [`SimpleThread`] callbacks.
pub struct ThreadContext {
    transporter: InterProcessForwarder<InterThreadTransporter>,
    name: &'static str,
    index: usize,
    alive: Arc<AtomicBool>,
    quit: Rc<Cell<bool>>,
}

impl ThreadContext {
    /// Inter-process layer of this thread's stack.
    pub fn interprocess(&mut self) -> &mut InterProcessForwarder<InterThreadTransporter> {
        &mut self.transporter
    }

    /// Inter-thread layer of this thread's stack.
    pub fn interthread(&mut self) -> &mut InterThreadTransporter {
        self.transporter.inner_mut()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn thread_id(&self) -> u64 {
        self.transporter.thread_id()
    }

    /// Leaves the loop after the current iteration.
    pub fn quit(&self) {
        self.quit.set(true);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.quit.get()
    }
}

/// A worker thread body.
///
/// The value is created inside the spawned thread, so it does not need to be
/// `Send`; only its configuration crosses threads.
pub trait SimpleThread: Sized + 'static {
    type Config: Send + 'static;

    /// Thread name; also the first half of the thread key.
    const NAME: &'static str;

    fn create(ctx: &mut ThreadContext, config: Self::Config) -> Result<Self>;

    /// Loop frequency in Hz. `None` means `on_loop` is never called and the
    /// thread only reacts to subscriptions.
    fn loop_frequency(&self) -> Option<f64> {
        None
    }

    fn on_loop(&mut self, _ctx: &mut ThreadContext) {}

    fn on_shutdown(&mut self, _ctx: &mut ThreadContext) {}
}

/// Body of every spawned worker.
pub(crate) fn run_thread<T: SimpleThread>(
    runtime: Arc<TransportRuntime>,
    index: usize,
    config: T::Config,
    alive: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    notifier: Arc<PollNotifier>,
) -> Result<()> {
    let transporter = InterThreadTransporter::with_notifier(runtime, notifier);
    let mut ctx = ThreadContext {
        transporter: InterProcessForwarder::new(transporter),
        name: T::NAME,
        index,
        alive: Arc::clone(&alive),
        quit: Rc::new(Cell::new(false)),
    };

    let quit = Rc::clone(&ctx.quit);
    ctx.transporter
        .subscribe_local::<bool, _>(&SHUTDOWN_GROUP, move |stop: &bool| {
            if *stop {
                quit.set(true);
            }
        });
    // A shutdown published before the listener existed is not queued for us
    if stop_requested.load(Ordering::Acquire) {
        ctx.quit.set(true);
    }

    let result = T::create(&mut ctx, config).map(|mut thread| {
        log::debug!("[app] thread {}:{} running", T::NAME, index);
        drive(&mut thread, &mut ctx);
        thread.on_shutdown(&mut ctx);
    });
    if let Err(e) = &result {
        log::error!("[app] thread {}:{} failed to start: {}", T::NAME, index, e);
    }

    ctx.transporter.publish_local(
        &JOINABLE_GROUP,
        Arc::new(ThreadJoinable {
            name: T::NAME.to_owned(),
            index,
        }),
    );
    alive.store(false, Ordering::Release);
    log::debug!("[app] thread {}:{} exiting", T::NAME, index);
    result
}

fn drive<T: SimpleThread>(thread: &mut T, ctx: &mut ThreadContext) {
    let period = thread
        .loop_frequency()
        .filter(|hz| hz.is_finite() && *hz > 0.0)
        .map(|hz| Duration::from_secs_f64(1.0 / hz));
    let mut next_tick = period.map(|p| Instant::now() + p);

    while ctx.is_alive() {
        let timeout = match next_tick {
            Some(tick) => tick.saturating_duration_since(Instant::now()).min(IDLE_POLL),
            None => IDLE_POLL,
        };
        ctx.transporter.poll(Some(timeout));
        if !ctx.is_alive() {
            break;
        }

        if let (Some(period), Some(tick)) = (period, next_tick.as_mut()) {
            let now = Instant::now();
            if now >= *tick {
                thread.on_loop(ctx);
                *tick += period;
                // Skip missed ticks rather than bursting
                if *tick < now {
                    *tick = now + period;
                }
            }
        }
    }
}
