//! Shared stop flag for plan-check runs, runner loops and requests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One-shot flag polled between units of work.
///
/// Every clone observes the same flag. Once fired it stays fired.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    fired: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Fires the flag. `true` only for the call that fired it.
    pub fn cancel(&self) -> bool {
        !self.fired.swap(true, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        assert!(token.cancel());
        assert!(clone.is_cancelled());
        assert!(!clone.cancel());
    }
}
