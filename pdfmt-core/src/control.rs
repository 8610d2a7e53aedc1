//! Cancellation and progress plumbing shared by the pipeline and the processor.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag. Clones share the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Callback invoked with `(completed, total, description)`.
pub type ProgressCallback = Box<dyn Fn(usize, usize, &str) + Send + Sync>;

/// Page counter shared across all chunks of one run.
pub struct Progress {
    completed: AtomicUsize,
    total: usize,
    callback: Option<ProgressCallback>,
}

impl Progress {
    pub fn new(total: usize, callback: Option<ProgressCallback>) -> Self {
        Self {
            completed: AtomicUsize::new(0),
            total,
            callback,
        }
    }

    /// Count one processed page and notify the callback.
    pub fn advance(&self, description: &str) {
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(callback) = &self.callback {
            callback(completed, self.total, description);
        }
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn clones_share_the_flag() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn progress_reports_running_count() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress = Progress::new(
            3,
            Some(Box::new(move |done: usize, total: usize, desc: &str| {
                sink.lock().unwrap().push((done, total, desc.to_string()));
            })),
        );
        progress.advance("page 1");
        progress.advance("page 4");

        assert_eq!(progress.completed(), 2);
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (1, 3, "page 1".to_string()));
        assert_eq!(seen[1], (2, 3, "page 4".to_string()));
    }
}
