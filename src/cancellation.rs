//! The Rust analogue of an AbortController/AbortSignal pair (spec.md §9
//! Design Notes): a token with `cancel(reason)`, a readable `is_cancelled`
//! flag, and listeners. Used both for the caller-supplied signal on an
//! outbound `request` and for the per-inbound-request cancellation handle
//! (spec.md §4.4).

use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct CancellationHandle {
    token: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    pub fn cancel(&self, reason: impl Into<String>) {
        let mut guard = self.reason.lock().expect("cancellation reason lock poisoned");
        if guard.is_none() {
            *guard = Some(reason.into());
        }
        drop(guard);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().expect("cancellation reason lock poisoned").clone()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}
