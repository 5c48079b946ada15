//! Bounded admission for expensive rewrite work
//!
//! Heavy operations register an [`OpToken`] carrying their run and
//! cancel arms. The controller runs at most `max_in_progress` at once,
//! queueing the rest FIFO. Completion of one operation admits the head
//! of the queue. Tokens always execute outside the controller lock, so
//! a running token may itself schedule more work.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::debug;

use pagecore_base::OpToken;
use pagecore_base::stats::{Statistics, StatisticsBuilder, Variable};

#[derive(Default)]
struct State {
    in_progress: i64,
    queue: VecDeque<OpToken>,
    shut_down: bool,
}

struct AdmissionStats {
    in_progress: Variable,
    queued_ever: Variable,
    canceled: Variable,
}

/// Concurrency gate for expensive operations.
///
/// `max_in_progress` semantics: negative runs everything immediately,
/// zero cancels everything, positive bounds concurrency.
pub struct ExpensiveOperationController {
    max_in_progress: i64,
    state: Mutex<State>,
    stats: AdmissionStats,
}

impl ExpensiveOperationController {
    pub fn register_stats(builder: StatisticsBuilder) -> StatisticsBuilder {
        builder
            .add_variable("expensive_ops_in_progress")
            .add_variable("expensive_ops_queued_ever")
            .add_variable("expensive_ops_canceled")
    }

    pub fn new(max_in_progress: i64, stats: &Statistics) -> Self {
        Self {
            max_in_progress,
            state: Mutex::new(State::default()),
            stats: AdmissionStats {
                in_progress: stats.find_variable("expensive_ops_in_progress"),
                queued_ever: stats.find_variable("expensive_ops_queued_ever"),
                canceled: stats.find_variable("expensive_ops_canceled"),
            },
        }
    }

    /// Admit, queue, or cancel `token`. The token's run or cancel arm
    /// fires outside the lock; a queued token fires later from
    /// [`notify_complete`](Self::notify_complete) or shutdown.
    pub fn schedule(&self, token: OpToken) {
        if self.max_in_progress == 0 {
            self.stats.canceled.add(1);
            token.cancel();
            return;
        }
        let admitted = {
            let mut state = self.state.lock();
            if state.shut_down {
                None
            } else if self.max_in_progress < 0 || state.in_progress < self.max_in_progress {
                state.in_progress += 1;
                Some(token)
            } else {
                state.queue.push_back(token);
                self.stats.queued_ever.add(1);
                return;
            }
        };
        match admitted {
            Some(token) => {
                self.stats.in_progress.add(1);
                token.run();
            }
            None => {
                self.stats.canceled.add(1);
                // token.cancel() fires via Drop; shutdown already won.
            }
        }
    }

    /// Signal completion of an admitted operation, admitting the queue
    /// head if one is waiting.
    pub fn notify_complete(&self) {
        let next = {
            let mut state = self.state.lock();
            state.in_progress -= 1;
            match state.queue.pop_front() {
                Some(token) => {
                    state.in_progress += 1;
                    Some(token)
                }
                None => None,
            }
        };
        match next {
            Some(token) => token.run(),
            None => self.stats.in_progress.add(-1),
        }
    }

    /// Cancel every queued operation and refuse new ones. Operations
    /// already running finish on their own.
    pub fn shut_down(&self) {
        let drained: VecDeque<OpToken> = {
            let mut state = self.state.lock();
            state.shut_down = true;
            std::mem::take(&mut state.queue)
        };
        if !drained.is_empty() {
            debug!("Admission controller canceling {} queued operations", drained.len());
        }
        for token in drained {
            self.stats.canceled.add(1);
            token.cancel();
        }
    }

    pub fn num_in_progress(&self) -> i64 {
        self.state.lock().in_progress
    }

    pub fn num_queued(&self) -> usize {
        self.state.lock().queue.len()
    }
}
