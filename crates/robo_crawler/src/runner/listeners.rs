//! Result listeners.
//!
//! Listeners are notified on a dedicated dispatcher thread fed by an unbounded crossbeam
//! channel, so a slow listener never holds up the run loop or the next `start()`.
//! Whether a listener's scope is active is checked at delivery time: an inactive scope
//! misses the notification (it is not queued for later), and a destroyed scope is
//! unregistered.

use crate::model::{ListenerId, TestOutputDetails};
use crate::runner::{CrawlerError, CrawlerResult, ErrorCode};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Lifecycle of whatever owns a listener (a screen, a session, a test fixture).
pub trait ListenerScope: Send + Sync {
    /// Whether the owner can receive a notification right now.
    fn is_active(&self) -> bool;

    /// Whether the owner is gone for good.
    fn is_destroyed(&self) -> bool {
        false
    }
}

const SCOPE_INACTIVE: u8 = 0;
const SCOPE_ACTIVE: u8 = 1;
const SCOPE_DESTROYED: u8 = 2;

/// [`ListenerScope`] driven by the host through explicit state changes.
#[derive(Clone, Debug)]
pub struct ScopeHandle {
    state: Arc<AtomicU8>,
}

impl ScopeHandle {
    #[must_use]
    pub fn active() -> Self {
        Self::with_state(SCOPE_ACTIVE)
    }

    #[must_use]
    pub fn inactive() -> Self {
        Self::with_state(SCOPE_INACTIVE)
    }

    fn with_state(state: u8) -> Self {
        Self {
            state: Arc::new(AtomicU8::new(state)),
        }
    }

    pub fn activate(&self) {
        let _ = self.state.compare_exchange(
            SCOPE_INACTIVE,
            SCOPE_ACTIVE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn deactivate(&self) {
        let _ = self.state.compare_exchange(
            SCOPE_ACTIVE,
            SCOPE_INACTIVE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Terminal; a destroyed scope never becomes active again.
    pub fn destroy(&self) {
        self.state.store(SCOPE_DESTROYED, Ordering::SeqCst);
    }
}

impl ListenerScope for ScopeHandle {
    fn is_active(&self) -> bool {
        self.state.load(Ordering::SeqCst) == SCOPE_ACTIVE
    }

    fn is_destroyed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == SCOPE_DESTROYED
    }
}

pub type ResultCallback = Arc<dyn Fn(&TestOutputDetails) + Send + Sync>;

struct Registration {
    id: ListenerId,
    scope: Arc<dyn ListenerScope>,
    callback: ResultCallback,
}

enum Message {
    Deliver(Arc<TestOutputDetails>),
    Barrier(Sender<()>),
}

pub(crate) struct ListenerRegistry {
    entries: Arc<Mutex<Vec<Registration>>>,
    next_id: AtomicU64,
    tx: Sender<Message>,
}

impl ListenerRegistry {
    pub(crate) fn spawn() -> CrawlerResult<Self> {
        let (tx, rx) = unbounded();
        let entries: Arc<Mutex<Vec<Registration>>> = Arc::default();
        let thread_entries = Arc::clone(&entries);
        thread::Builder::new()
            .name("robo-listeners".to_string())
            .spawn(move || dispatch_loop(&rx, &thread_entries))
            .map_err(|err| {
                CrawlerError::io(ErrorCode::Internal, "failed to spawn listener thread", err)
            })?;
        Ok(Self {
            entries,
            next_id: AtomicU64::new(1),
            tx,
        })
    }

    pub(crate) fn register(
        &self,
        scope: Arc<dyn ListenerScope>,
        callback: ResultCallback,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push(Registration {
            id,
            scope,
            callback,
        });
        tracing::debug!(listener = %id, "result listener registered");
        id
    }

    pub(crate) fn unregister(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Queue a result for delivery. Never blocks.
    pub(crate) fn notify(&self, result: Arc<TestOutputDetails>) {
        if self.tx.send(Message::Deliver(result)).is_err() {
            tracing::error!("listener dispatcher is gone; result not delivered");
        }
    }

    /// Wait until every notification queued so far has been handled.
    pub(crate) fn flush(&self, timeout: Duration) -> bool {
        let (ack_tx, ack_rx) = bounded(1);
        if self.tx.send(Message::Barrier(ack_tx)).is_err() {
            return false;
        }
        ack_rx.recv_timeout(timeout).is_ok()
    }
}

fn dispatch_loop(rx: &Receiver<Message>, entries: &Mutex<Vec<Registration>>) {
    while let Ok(message) = rx.recv() {
        match message {
            Message::Deliver(result) => deliver(&result, entries),
            Message::Barrier(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

fn deliver(result: &TestOutputDetails, entries: &Mutex<Vec<Registration>>) {
    let targets: Vec<(ListenerId, Arc<dyn ListenerScope>, ResultCallback)> = {
        let mut entries = entries.lock();
        entries.retain(|entry| {
            let destroyed = entry.scope.is_destroyed();
            if destroyed {
                tracing::debug!(listener = %entry.id, "pruned listener with destroyed scope");
            }
            !destroyed
        });
        entries
            .iter()
            .map(|entry| (entry.id, Arc::clone(&entry.scope), Arc::clone(&entry.callback)))
            .collect()
    };

    for (id, scope, callback) in targets {
        if !scope.is_active() {
            tracing::debug!(listener = %id, run_id = %result.run_id, "listener scope inactive; notification dropped");
            continue;
        }
        if catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
            tracing::error!(listener = %id, run_id = %result.run_id, "result listener panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_handle_transitions() {
        let scope = ScopeHandle::inactive();
        assert!(!scope.is_active());
        scope.activate();
        assert!(scope.is_active());
        scope.destroy();
        scope.activate();
        assert!(!scope.is_active());
        assert!(scope.is_destroyed());
    }

    #[test]
    fn unregister_removes_only_that_listener() {
        let Ok(registry) = ListenerRegistry::spawn() else {
            return;
        };
        let a = registry.register(Arc::new(ScopeHandle::active()), Arc::new(|_: &TestOutputDetails| {}));
        let _b = registry.register(Arc::new(ScopeHandle::active()), Arc::new(|_: &TestOutputDetails| {}));
        assert!(registry.unregister(a));
        assert!(!registry.unregister(a));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn flush_returns_once_queue_is_drained() {
        let Ok(registry) = ListenerRegistry::spawn() else {
            return;
        };
        assert!(registry.flush(Duration::from_secs(5)));
    }
}
