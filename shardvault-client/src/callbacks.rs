//! Status callbacks
//!
//! Long-running requests report `started → in_progress* → (completed |
//! error)`. Callers supply whichever capabilities they care about; every
//! method has a no-op default so small flows (registry files) can pass
//! `NoopCallback`.

use shardvault_core::ShardVaultError;

/// Operation tag passed to every callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Upload,
    Update,
    Repair,
    Download,
}

/// Terminal summary of a completed request.
#[derive(Debug, Clone)]
pub struct CompletedInfo {
    pub size: u64,
    pub mime_type: String,
    pub content_hash: String,
}

#[allow(unused_variables)]
pub trait StatusCallback: Send + Sync {
    fn started(&self, allocation_id: &str, path: &str, op: OpKind, total_bytes: u64) {}

    fn in_progress(&self, allocation_id: &str, path: &str, op: OpKind, completed_bytes: u64) {}

    fn completed(&self, allocation_id: &str, path: &str, op: OpKind, info: &CompletedInfo) {}

    fn error(&self, allocation_id: &str, path: &str, op: OpKind, err: &ShardVaultError) {}

    fn repair_completed(&self, files_repaired: usize) {}
}

/// Callback that ignores everything.
pub struct NoopCallback;

impl StatusCallback for NoopCallback {}

/// Callback that records the terminal outcome and wakes a waiter; the
/// bridge from enqueued transfers back to callers that want a result.
pub struct AwaitableCallback {
    outcome: parking_lot::Mutex<Option<std::result::Result<CompletedInfo, String>>>,
    notify: tokio::sync::Notify,
}

impl AwaitableCallback {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            outcome: parking_lot::Mutex::new(None),
            notify: tokio::sync::Notify::new(),
        })
    }

    /// Wait for the transfer to finish. Errors carry the display form of
    /// the failure.
    pub async fn wait(&self) -> std::result::Result<CompletedInfo, String> {
        loop {
            let waiting = self.notify.notified();
            if let Some(outcome) = self.outcome.lock().clone() {
                return outcome;
            }
            waiting.await;
        }
    }
}

impl StatusCallback for AwaitableCallback {
    fn completed(&self, _: &str, _: &str, _: OpKind, info: &CompletedInfo) {
        *self.outcome.lock() = Some(Ok(info.clone()));
        self.notify.notify_waiters();
    }

    fn error(&self, _: &str, _: &str, _: OpKind, err: &ShardVaultError) {
        *self.outcome.lock() = Some(Err(err.to_string()));
        self.notify.notify_waiters();
    }
}
