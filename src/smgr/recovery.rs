//! Historical replay flag shared with the recovery subsystem

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Process-wide "replaying history" flag.
///
/// While set, no concurrent writer can change relation sizes, so cached
/// block counts may be returned without asking the backend.
#[derive(Debug, Clone, Default)]
pub struct ReplayMode {
    active: Arc<AtomicBool>,
}

impl ReplayMode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let mode = ReplayMode::new();
        let seen_by_worker = mode.clone();
        assert!(!seen_by_worker.is_active());
        mode.enter();
        assert!(seen_by_worker.is_active());
        mode.exit();
        assert!(!seen_by_worker.is_active());
    }
}
