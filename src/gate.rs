//! `EntryGate`: many-readers/one-writer admission control for a resource
//! that needs to drain in-flight work before it closes.
//!
//! A [`Connection`](crate::connection::Connection) and a
//! [`Channel`](crate::channel::Channel) each own one. Every operation that
//! touches the resource calls [`EntryGate::enter`] first and holds the
//! returned guard for the duration of the call; `close` waits for every
//! outstanding guard to drop before it returns.

use std::sync::Arc;

use tokio::sync::{Notify, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Many concurrent `enter()` calls are admitted while the gate is open.
/// `close()` blocks new entries and waits for the ones already in flight
/// to finish, then leaves the gate permanently closed.
pub struct EntryGate {
    lock: RwLock<()>,
    closed: Notify,
}

impl Default for EntryGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Held for the duration of one admitted operation.
pub struct Entered<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

impl EntryGate {
    pub fn new() -> Self {
        Self {
            lock: RwLock::new(()),
            closed: Notify::new(),
        }
    }

    /// Admit one reader. Blocks only while the gate is mid-close.
    pub async fn enter(&self) -> Entered<'_> {
        Entered {
            _guard: self.lock.read().await,
        }
    }

    /// Block until every entered operation has exited, then mark the gate
    /// closed. Safe to call more than once; later calls return immediately.
    pub async fn close(&self) {
        let _write: RwLockWriteGuard<'_, ()> = self.lock.write().await;
        self.closed.notify_waiters();
    }
}

/// A gate shared between the owning resource and the tasks that act on it.
pub type SharedGate = Arc<EntryGate>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn close_waits_for_outstanding_entries() {
        let gate = Arc::new(EntryGate::new());
        let entered = gate.enter().await;
        let counter = Arc::new(AtomicUsize::new(0));

        let gate2 = gate.clone();
        let counter2 = counter.clone();
        let closer = tokio::spawn(async move {
            gate2.close().await;
            counter2.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0, "close must not finish early");

        drop(entered);
        closer.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn multiple_readers_are_admitted_concurrently() {
        let gate = EntryGate::new();
        let a = gate.enter().await;
        let b = gate.enter().await;
        drop(a);
        drop(b);
    }
}
