use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag for cooperative cancellation of a batch.
///
/// Clone is cheap and shares state. Workers consult it between tasks only;
/// a task that is already running is allowed to finish.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}
