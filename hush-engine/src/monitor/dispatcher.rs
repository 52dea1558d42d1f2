//! Single-threaded task dispatcher
//!
//! Every monitor owns one dispatcher: a dedicated OS thread running a tokio
//! current-thread runtime. All mutation of the monitor's state happens in
//! tasks executed one at a time on that thread.
//!
//! Two ways in:
//! - [`Poster::post`] enqueues and returns immediately (audio subsystem callbacks)
//! - [`Dispatcher::call`] enqueues and blocks until the task ran, returning its
//!   result; when the caller already is the dispatcher thread the task runs inline
//!
//! Tasks also get a [`Poster`] so they can schedule follow-up work, e.g. from
//! timers spawned on the dispatcher runtime.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

/// A unit of work run against the dispatcher's state
pub(crate) type Task<S> = Box<dyn FnOnce(&mut S, &Poster<S>) + Send>;

enum Envelope<S> {
    Run(Task<S>),
    Shutdown,
}

// =============================================================================
// Poster
// =============================================================================

/// Fire-and-forget access to a dispatcher queue
pub(crate) struct Poster<S> {
    tx: mpsc::UnboundedSender<Envelope<S>>,
}

impl<S> Clone for Poster<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S> Poster<S> {
    /// Enqueue a task; returns false if the dispatcher is gone
    pub fn post(&self, task: impl FnOnce(&mut S, &Poster<S>) + Send + 'static) -> bool {
        self.tx.send(Envelope::Run(Box::new(task))).is_ok()
    }

    /// Whether the dispatcher loop has exited
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Owner of a dispatcher thread and the state its tasks operate on
pub(crate) struct Dispatcher<S: Send + 'static> {
    poster: Poster<S>,
    state: Arc<Mutex<S>>,
    thread_id: ThreadId,
    handle: Option<JoinHandle<()>>,
}

impl<S: Send + 'static> Dispatcher<S> {
    /// Start a dispatcher thread
    ///
    /// `build` creates the state on the calling thread and receives the
    /// dispatcher's poster so the state can hand it to notification sinks.
    /// `on_tick` runs every `tick_every` on the dispatcher.
    ///
    /// Returns an error if the thread or its runtime could not be started.
    pub fn spawn(
        name: String,
        tick_every: Duration,
        on_tick: fn(&mut S, &Poster<S>),
        build: impl FnOnce(&Poster<S>) -> S,
    ) -> Result<Self, String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let poster = Poster { tx };
        let state = Arc::new(Mutex::new(build(&poster)));

        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), String>>();
        let loop_state = state.clone();
        let loop_poster = poster.clone();

        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                rt.block_on(run_loop(rx, loop_state, loop_poster, tick_every, on_tick));
            })
            .map_err(|e| e.to_string())?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err("dispatcher thread exited during startup".to_string());
            }
        }

        Ok(Self {
            poster,
            thread_id: handle.thread().id(),
            state,
            handle: Some(handle),
        })
    }

    #[cfg(test)]
    pub fn poster(&self) -> &Poster<S> {
        &self.poster
    }

    /// Whether the current thread is this dispatcher's thread
    pub fn is_dispatcher_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Run a task on the dispatcher and wait for its result
    ///
    /// Runs inline when called from the dispatcher thread itself. If that
    /// thread is in the middle of another task the state is already borrowed,
    /// so the task is queued behind it and `None` is returned. Also returns
    /// `None` if the dispatcher is gone or the task panicked.
    pub fn call<R: Send + 'static>(
        &self,
        task: impl FnOnce(&mut S, &Poster<S>) -> R + Send + 'static,
    ) -> Option<R> {
        if self.is_dispatcher_thread() {
            return match self.state.try_lock() {
                Ok(mut guard) => Some(task(&mut guard, &self.poster)),
                Err(TryLockError::Poisoned(poisoned)) => {
                    Some(task(&mut poisoned.into_inner(), &self.poster))
                }
                Err(TryLockError::WouldBlock) => {
                    tracing::warn!("re-entrant dispatcher call from a running task, deferring");
                    self.poster.post(move |state, poster| {
                        task(state, poster);
                    });
                    None
                }
            };
        }

        let (reply_tx, reply_rx) = std_mpsc::sync_channel(1);
        let posted = self.poster.post(move |state, poster| {
            let _ = reply_tx.send(task(state, poster));
        });
        if !posted {
            return None;
        }
        reply_rx.recv().ok()
    }

    /// Stop the loop and join the thread
    ///
    /// Pending tasks queued after shutdown are dropped. Called from the
    /// dispatcher thread itself, the thread is detached instead of joined.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.poster.tx.send(Envelope::Shutdown);
        if self.is_dispatcher_thread() {
            return;
        }
        if handle.join().is_err() {
            tracing::error!("dispatcher thread panicked");
        }
    }
}

impl<S: Send + 'static> Drop for Dispatcher<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Loop
// =============================================================================

async fn run_loop<S>(
    mut rx: mpsc::UnboundedReceiver<Envelope<S>>,
    state: Arc<Mutex<S>>,
    poster: Poster<S>,
    tick_every: Duration,
    on_tick: fn(&mut S, &Poster<S>),
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + tick_every, tick_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            envelope = rx.recv() => match envelope {
                Some(Envelope::Run(task)) => run_task(&state, &poster, task),
                Some(Envelope::Shutdown) | None => break,
            },
            _ = ticker.tick() => run_task(&state, &poster, on_tick),
        }
    }
}

fn run_task<S>(state: &Mutex<S>, poster: &Poster<S>, task: impl FnOnce(&mut S, &Poster<S>)) {
    let mut guard = lock(state);
    let result = panic::catch_unwind(AssertUnwindSafe(|| task(&mut guard, poster)));
    if let Err(payload) = result {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_default();
        tracing::error!(%message, "monitor task panicked");
    }
}

fn lock<S>(state: &Mutex<S>) -> MutexGuard<'_, S> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
