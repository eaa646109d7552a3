//! Shared cancellation flag.

use crate::error::{Result, TranscriptorError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cloneable cancellation flag. All clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Return `Err(Cancelled)` once the token has been triggered.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(TranscriptorError::Cancelled)
        } else {
            Ok(())
        }
    }
}
