//! Asynchronous fan-out of [`MapEvent`]s to registered
//! [`MapListener`](crate::listener::MapListener)s.
//!
//! Dispatch never runs on the [`Peer`](crate::peer::Peer)'s service task:
//! a slow or panicking listener must not stall frame decoding. Instead
//! every matched listener gets pushed onto an unbounded queue drained by a
//! dedicated background task.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::listener::MapListener;
use crate::message::{MapEvent, MapEventKind};

struct Job {
    listener: Arc<dyn MapListener>,
    event: MapEvent,
}

/// Owns the background drain task for one connection's worth of map
/// events. Dropping it stops accepting new events but lets already-queued
/// ones finish dispatching.
pub struct EventDispatcher {
    sender: mpsc::UnboundedSender<Job>,
    drain_task: JoinHandle<()>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let drain_task = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                dispatch_one(&job);
            }
        });
        Self { sender, drain_task }
    }

    /// Dispatch `event` to every listener in `listeners`. A listener whose
    /// [`MapListener::is_synchronous`] returns true runs right here, on the
    /// caller's task, before this call returns; every other listener is
    /// queued to the background drain task instead. A registration whose
    /// owning channel has already closed is not pruned here: rather than
    /// silently dropping its event, the job is still queued (or run) and
    /// the listener fires with whatever state it captured. Orphaned
    /// registrations leak until the process that created them exits,
    /// which is preferable to losing an event a caller was relying on.
    pub fn dispatch(&self, listeners: Vec<Arc<dyn MapListener>>, event: MapEvent) {
        for listener in listeners {
            if listener.is_synchronous() {
                let job = Job { listener, event: event.clone() };
                dispatch_one(&job);
                continue;
            }
            if self
                .sender
                .send(Job {
                    listener,
                    event: event.clone(),
                })
                .is_err()
            {
                warn!("event dispatcher queue is gone, dropping a map event");
            }
        }
    }

    pub async fn shutdown(self) {
        drop(self.sender);
        let _ = self.drain_task.await;
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn dispatch_one(job: &Job) {
    match job.event.event_id {
        MapEventKind::Inserted => job.listener.entry_inserted(&job.event),
        MapEventKind::Updated => job.listener.entry_updated(&job.event),
        MapEventKind::Deleted => job.listener.entry_deleted(&job.event),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TransformationState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Counting(Arc<AtomicUsize>);
    impl MapListener for Counting {
        fn entry_inserted(&self, _event: &MapEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn entry_updated(&self, _event: &MapEvent) {}
        fn entry_deleted(&self, _event: &MapEvent) {}
    }

    #[tokio::test]
    async fn dispatches_to_every_matched_listener() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let listeners: Vec<Arc<dyn MapListener>> = vec![
            Arc::new(Counting(count.clone())),
            Arc::new(Counting(count.clone())),
        ];

        let event = MapEvent {
            event_id: MapEventKind::Inserted,
            filter_ids: vec![],
            key: vec![1],
            old_value: None,
            new_value: Some(vec![2]),
            synthetic: false,
            transformation_state: TransformationState::NonTransformable,
            priming: false,
        };
        dispatcher.dispatch(listeners, event);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        dispatcher.shutdown().await;
    }

    struct Inline(Arc<AtomicUsize>);
    impl MapListener for Inline {
        fn entry_inserted(&self, _event: &MapEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn entry_updated(&self, _event: &MapEvent) {}
        fn entry_deleted(&self, _event: &MapEvent) {}
        fn is_synchronous(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn a_synchronous_listener_has_already_run_when_dispatch_returns() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let listeners: Vec<Arc<dyn MapListener>> = vec![Arc::new(Inline(count.clone()))];

        let event = MapEvent {
            event_id: MapEventKind::Inserted,
            filter_ids: vec![],
            key: vec![1],
            old_value: None,
            new_value: Some(vec![2]),
            synthetic: false,
            transformation_state: TransformationState::NonTransformable,
            priming: false,
        };
        dispatcher.dispatch(listeners, event);

        // No await, no sleep: a synchronous listener must have already run.
        assert_eq!(count.load(Ordering::SeqCst), 1);
        dispatcher.shutdown().await;
    }
}
