//! One-shot socket operations running on their own task.
//!
//! A [`SocketOperation`] is the handle to a connect, accept, read or write that
//! was started in the background. It moves from `Pending` to exactly one of
//! `Completed`, `Failed` or `Cancelled` and never leaves that state again.
//!
//! ```text
//!             ┌──────────► Completed(T)
//!  Pending ───┼──────────► Failed(QuorumError)
//!             └──cancel()─► Cancelled
//! ```

use quorum_types::{QuorumError, Result};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationState::Pending)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationState::Pending => write!(f, "PENDING"),
            OperationState::Completed => write!(f, "COMPLETED"),
            OperationState::Failed => write!(f, "FAILED"),
            OperationState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

enum Slot<T> {
    Pending,
    Completed(T),
    Failed(QuorumError),
    Cancelled,
    Taken,
}

type Callback = Box<dyn FnOnce(OperationState) + Send + 'static>;

#[derive(Default)]
struct Callbacks {
    fired: bool,
    waiting: Vec<Callback>,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    state_tx: watch::Sender<OperationState>,
    callbacks: Mutex<Callbacks>,
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T> Shared<T> {
    /// Move out of `Pending`. Returns false if another transition won.
    fn transition(&self, next: Slot<T>) -> bool {
        let state = match &next {
            Slot::Completed(_) => OperationState::Completed,
            Slot::Failed(_) => OperationState::Failed,
            _ => OperationState::Cancelled,
        };

        {
            let mut slot = lock(&self.slot);
            if !matches!(*slot, Slot::Pending) {
                return false;
            }
            *slot = next;
            self.state_tx.send_replace(state);
        }

        let waiting = {
            let mut callbacks = lock(&self.callbacks);
            callbacks.fired = true;
            std::mem::take(&mut callbacks.waiting)
        };
        for callback in waiting {
            callback(state);
        }
        true
    }

    fn state(&self) -> OperationState {
        *self.state_tx.borrow()
    }
}

/// Marks the operation cancelled if its task goes away without finishing,
/// e.g. on panic or runtime shutdown.
struct CompletionGuard<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Drop for CompletionGuard<T> {
    fn drop(&mut self) {
        self.shared.transition(Slot::Cancelled);
    }
}

/// Handle to a socket operation running on its own tokio task.
///
/// Dropping a pending handle cancels the operation.
pub struct SocketOperation<T> {
    shared: Arc<Shared<T>>,
    abort: AbortHandle,
    label: String,
}

impl<T: Send + 'static> SocketOperation<T> {
    /// Start `work` on a new task. Must be called within a tokio runtime.
    pub(crate) fn spawn<F>(label: impl Into<String>, work: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (state_tx, _) = watch::channel(OperationState::Pending);
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::Pending),
            state_tx,
            callbacks: Mutex::new(Callbacks::default()),
        });

        let guard = CompletionGuard {
            shared: Arc::clone(&shared),
        };
        let handle = tokio::spawn(async move {
            let result = work.await;
            guard.shared.transition(match result {
                Ok(value) => Slot::Completed(value),
                Err(e) => Slot::Failed(e),
            });
        });

        Self {
            shared,
            abort: handle.abort_handle(),
            label: label.into(),
        }
    }
}

impl<T> SocketOperation<T> {
    pub fn state(&self) -> OperationState {
        self.shared.state()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Take the result if the operation has finished. Returns `None` while
    /// pending and after the result has already been taken.
    pub fn try_take(&self) -> Option<Result<T>> {
        let mut slot = lock(&self.shared.slot);
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Pending => {
                *slot = Slot::Pending;
                None
            }
            Slot::Completed(value) => Some(Ok(value)),
            Slot::Failed(e) => Some(Err(e)),
            Slot::Cancelled => {
                *slot = Slot::Cancelled;
                Some(Err(QuorumError::Cancelled))
            }
            Slot::Taken => None,
        }
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<OperationState> {
        self.shared.state_tx.subscribe()
    }

    /// Run `callback` once the operation reaches a terminal state. If it already
    /// has, the callback runs immediately on the calling thread.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(OperationState) + Send + 'static,
    {
        let mut callbacks = lock(&self.shared.callbacks);
        if callbacks.fired {
            drop(callbacks);
            callback(self.state());
        } else {
            callbacks.waiting.push(Box::new(callback));
        }
    }

    /// Abort the operation if it is still pending. Returns `false` if it had
    /// already finished, in which case nothing changes.
    pub fn cancel(&self) -> bool {
        let cancelled = self.shared.transition(Slot::Cancelled);
        if cancelled {
            self.abort.abort();
            debug!("Cancelled {}", self.label);
        }
        cancelled
    }

    /// Wait for the terminal state and return the result.
    ///
    /// A cancelled operation, or one whose result was already taken with
    /// [`try_take`](Self::try_take), yields [`QuorumError::Cancelled`].
    pub async fn outcome(self) -> Result<T> {
        let mut state_rx = self.subscribe();
        state_rx
            .wait_for(OperationState::is_terminal)
            .await
            .map_err(|_| QuorumError::Cancelled)?;

        let mut slot = lock(&self.shared.slot);
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Completed(value) => Ok(value),
            Slot::Failed(e) => Err(e),
            Slot::Pending | Slot::Cancelled | Slot::Taken => Err(QuorumError::Cancelled),
        }
    }
}

impl<T> Drop for SocketOperation<T> {
    fn drop(&mut self) {
        if !self.is_done() {
            self.cancel();
        }
    }
}

impl<T> fmt::Debug for SocketOperation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketOperation")
            .field("label", &self.label)
            .field("state", &self.state())
            .finish()
    }
}
