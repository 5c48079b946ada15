//! One-shot operation tokens with run and cancel arms
//!
//! Work handed across component boundaries (admission control, shutdown
//! paths) travels as an [`OpToken`]: a pair of closures of which exactly
//! one executes. Consuming `self` makes double-execution unrepresentable;
//! dropping a token without executing either arm runs the cancel arm so
//! that abandoned work is still released.

/// A one-shot token with two exit paths.
///
/// Exactly one of [`run`](OpToken::run) or [`cancel`](OpToken::cancel)
/// executes. A token dropped without either call cancels itself.
pub struct OpToken {
    run: Option<Box<dyn FnOnce() + Send + 'static>>,
    cancel: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl OpToken {
    /// Create a token from a run arm and a cancel arm.
    ///
    /// Holders of nested tokens must propagate cancellation explicitly:
    /// the cancel arm of an outer token should cancel any inner token it
    /// owns.
    pub fn new(
        run: impl FnOnce() + Send + 'static,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            run: Some(Box::new(run)),
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Create a token whose cancel arm does nothing.
    pub fn from_run(run: impl FnOnce() + Send + 'static) -> Self {
        Self::new(run, || {})
    }

    /// Execute the success arm.
    pub fn run(mut self) {
        self.cancel.take();
        if let Some(run) = self.run.take() {
            run();
        }
    }

    /// Execute the abandonment arm.
    pub fn cancel(mut self) {
        self.run.take();
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for OpToken {
    fn drop(&mut self) {
        // A token abandoned without an explicit verdict counts as canceled.
        self.run.take();
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for OpToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpToken")
            .field("pending", &self.run.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_token(runs: &Arc<AtomicU32>, cancels: &Arc<AtomicU32>) -> OpToken {
        let r = Arc::clone(runs);
        let c = Arc::clone(cancels);
        OpToken::new(
            move || {
                r.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
        )
    }

    #[test]
    fn test_run_executes_once() {
        let runs = Arc::new(AtomicU32::new(0));
        let cancels = Arc::new(AtomicU32::new(0));
        counting_token(&runs, &cancels).run();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(cancels.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_executes_once() {
        let runs = Arc::new(AtomicU32::new(0));
        let cancels = Arc::new(AtomicU32::new(0));
        counting_token(&runs, &cancels).cancel();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_cancels() {
        let runs = Arc::new(AtomicU32::new(0));
        let cancels = Arc::new(AtomicU32::new(0));
        drop(counting_token(&runs, &cancels));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_nested_cancel_propagates() {
        let runs = Arc::new(AtomicU32::new(0));
        let cancels = Arc::new(AtomicU32::new(0));
        let inner = counting_token(&runs, &cancels);
        let outer = OpToken::new(move || inner.run(), || {});
        // Dropping the outer token drops the captured inner token, which
        // cancels it.
        drop(outer);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }
}
