//! Single-assignment completion shared between tasks

use tokio::sync::watch;

/// A value set at most once and awaited by any number of tasks.
///
/// The first `complete` wins; later calls are no-ops and report `false`.
#[derive(Debug)]
pub struct Completion<T: Clone> {
    slot: watch::Sender<Option<T>>,
}

impl<T: Clone> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Completion<T> {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }

    /// Resolve with `value` unless already resolved.
    pub fn complete(&self, value: T) -> bool {
        let mut value = Some(value);
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = value.take();
            true
        })
    }

    pub fn is_done(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Current value, if resolved.
    pub fn peek(&self) -> Option<T> {
        self.slot.borrow().clone()
    }

    /// Wait for the value.
    pub async fn wait(&self) -> T {
        let mut rx = self.slot.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            // The sender lives in `self`, so the channel cannot close while we wait.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
