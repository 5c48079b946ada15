//! Global and per-host fetch rate control
//!
//! Wraps any [`UrlFetcher`] with a global in-flight cap, a per-host
//! cap, and a bounded FIFO wait queue. A fetch that finds the queue
//! full terminates immediately with `ResourceExhausted` instead of
//! blocking. A completing fetch hands its slot to the oldest queued
//! fetch whose host still has capacity.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use pagecore_base::stats::{Statistics, StatisticsBuilder, Variable};

use crate::fetch::{FetchHandler, FetchOutcome, RequestContext, UrlFetcher};

/// Default global in-flight request cap.
pub const DEFAULT_MAX_GLOBAL_REQUESTS: usize = 100;
/// Default per-host in-flight request cap.
pub const DEFAULT_PER_HOST_REQUESTS: usize = 8;
/// Default bounded wait-queue length.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 500;

struct Waiter {
    host: String,
    admit: oneshot::Sender<bool>,
}

#[derive(Default)]
struct State {
    global_active: usize,
    host_active: HashMap<String, usize>,
    queue: VecDeque<Waiter>,
    shut_down: bool,
}

struct RateStats {
    queued: Variable,
    dropped: Variable,
    active: Variable,
}

/// Fetcher enforcing in-flight caps over an inner fetcher.
pub struct RateControllingFetcher {
    inner: Arc<dyn UrlFetcher>,
    state: Mutex<State>,
    stats: RateStats,
    max_global_requests: usize,
    per_host_requests: usize,
    max_queue_size: usize,
}

impl RateControllingFetcher {
    pub fn register_stats(builder: StatisticsBuilder) -> StatisticsBuilder {
        builder
            .add_variable("fetch_queued")
            .add_variable("fetch_queue_dropped")
            .add_variable("fetch_active")
    }

    pub fn new(
        inner: Arc<dyn UrlFetcher>,
        stats: &Statistics,
        max_global_requests: usize,
        per_host_requests: usize,
        max_queue_size: usize,
    ) -> Self {
        Self {
            inner,
            state: Mutex::new(State::default()),
            stats: RateStats {
                queued: stats.find_variable("fetch_queued"),
                dropped: stats.find_variable("fetch_queue_dropped"),
                active: stats.find_variable("fetch_active"),
            },
            max_global_requests,
            per_host_requests,
            max_queue_size,
        }
    }

    fn host_of(url: &str) -> String {
        url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| url.to_string())
    }

    /// Try to take a slot for `host`; on contention either enqueue a
    /// waiter or report queue exhaustion.
    fn admit(&self, host: &str) -> Admission {
        let mut state = self.state.lock();
        if state.shut_down {
            return Admission::Rejected(FetchOutcome::Canceled);
        }
        let host_active = state.host_active.get(host).copied().unwrap_or(0);
        if state.global_active < self.max_global_requests && host_active < self.per_host_requests {
            state.global_active += 1;
            *state.host_active.entry(host.to_string()).or_insert(0) += 1;
            self.stats.active.add(1);
            return Admission::Admitted;
        }
        if state.queue.len() >= self.max_queue_size {
            self.stats.dropped.add(1);
            return Admission::Rejected(FetchOutcome::ResourceExhausted);
        }
        let (tx, rx) = oneshot::channel();
        state.queue.push_back(Waiter {
            host: host.to_string(),
            admit: tx,
        });
        self.stats.queued.add(1);
        trace!("Queued fetch for {host} ({} waiting)", state.queue.len());
        Admission::Queued(rx)
    }

    /// Release a slot and wake the oldest eligible waiter. The waiter
    /// inherits the slot inside the lock, so the caps never overshoot.
    fn release(&self, host: &str) {
        let woken = {
            let mut state = self.state.lock();
            state.global_active -= 1;
            if let Some(active) = state.host_active.get_mut(host) {
                *active -= 1;
                if *active == 0 {
                    state.host_active.remove(host);
                }
            }
            self.next_waiter(&mut state)
        };
        self.stats.active.add(-1);
        if let Some(waiter) = woken {
            self.stats.active.add(1);
            // A dropped receiver means the waiter gave up; its slot
            // comes back through release_host below.
            if waiter.admit.send(true).is_err() {
                self.release(&waiter.host);
            }
        }
    }

    fn next_waiter(&self, state: &mut State) -> Option<Waiter> {
        let position = state.queue.iter().position(|w| {
            state.host_active.get(&w.host).copied().unwrap_or(0) < self.per_host_requests
        })?;
        let waiter = state.queue.remove(position)?;
        state.global_active += 1;
        *state.host_active.entry(waiter.host.clone()).or_insert(0) += 1;
        Some(waiter)
    }

    /// Cancel every queued fetch and reject all future ones.
    pub fn shut_down(&self) {
        let drained: Vec<Waiter> = {
            let mut state = self.state.lock();
            state.shut_down = true;
            state.queue.drain(..).collect()
        };
        debug!("Rate controller shutting down, canceling {} waiters", drained.len());
        for waiter in drained {
            let _ = waiter.admit.send(false);
        }
    }

    #[cfg(test)]
    fn active_counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.global_active, state.queue.len())
    }
}

enum Admission {
    Admitted,
    Queued(oneshot::Receiver<bool>),
    Rejected(FetchOutcome),
}

#[async_trait]
impl UrlFetcher for RateControllingFetcher {
    async fn fetch(
        &self,
        request: RequestContext,
        handler: &mut dyn FetchHandler,
    ) -> FetchOutcome {
        let host = Self::host_of(&request.url);
        match self.admit(&host) {
            Admission::Admitted => {}
            Admission::Rejected(outcome) => {
                handler.done(outcome).await;
                return outcome;
            }
            Admission::Queued(rx) => match rx.await {
                Ok(true) => {}
                // Shutdown, or the sender vanished with the controller.
                _ => {
                    handler.done(FetchOutcome::Canceled).await;
                    return FetchOutcome::Canceled;
                }
            },
        }
        let outcome = self.inner.fetch(request, handler).await;
        self.release(&host);
        outcome
    }
}
