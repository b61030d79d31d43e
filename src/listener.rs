//! `ListenerSupport`: the key- and filter-indexed listener registries a
//! [`RemoteCache`](crate::cache::RemoteCache) consults to decide whether a
//! wire `ListenerKeyRequest`/`ListenerFilterRequest` is actually needed,
//! and to fan a [`MapEvent`] out to the right listeners once it arrives.
//!
//! The was-empty/was-lite bookkeeping here is grounded directly on the
//! original `addKeyListener`/`addMapListener` pair: a wire request is only
//! issued when the registration set changes in a way the server needs to
//! know about -- first registration, an upgrade from lite to full, or a
//! newly-required priming flag -- never on every `addMapListener` call.

use std::collections::HashMap;
use std::sync::Arc;

use crate::message::{Binary, MapEvent, Opaque};

/// Receives [`MapEvent`]s for the keys or filters it was registered
/// against.
pub trait MapListener: Send + Sync {
    fn entry_inserted(&self, event: &MapEvent);
    fn entry_updated(&self, event: &MapEvent);
    fn entry_deleted(&self, event: &MapEvent);

    /// Whether this listener must run inline, on the task that received
    /// the push, instead of being queued to the background dispatcher.
    /// A listener that needs to observe an event before whatever triggered
    /// it (e.g. a cache write on another task) can be seen to complete
    /// should override this to `true`; the default favors never stalling
    /// frame delivery over delivery ordering.
    fn is_synchronous(&self) -> bool {
        false
    }
}

#[derive(Clone)]
struct Entry {
    listener: Arc<dyn MapListener>,
    lite: bool,
}

struct Registration {
    entries: Vec<Entry>,
    all_lite: bool,
    priming: bool,
}

impl Registration {
    fn new(listener: Arc<dyn MapListener>, lite: bool, priming: bool) -> Self {
        Self {
            entries: vec![Entry { listener, lite }],
            all_lite: lite,
            priming,
        }
    }

    fn recompute_lite(&mut self) {
        self.all_lite = self.entries.iter().all(|e| e.lite);
    }
}

/// Whether adding or removing a listener changed the registration in a
/// way the server needs to be told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationChange {
    pub issue_wire_request: bool,
    /// Empty-set state after the change; an add that creates the first
    /// entry, or a remove that empties the set, both report `true` here
    /// for their respective "was empty" / "now empty" meaning.
    pub boundary_crossed: bool,
    pub effective_lite: bool,
    pub effective_priming: bool,
}

/// Key- and filter-indexed listener registrations for one cache proxy.
#[derive(Default)]
pub struct ListenerSupport {
    key_listeners: HashMap<Binary, Registration>,
    filter_listeners: HashMap<i64, (Opaque, Registration)>,
    filter_ids_by_bytes: HashMap<Opaque, i64>,
    next_filter_id: i64,
    freed_filter_ids: Vec<i64>,
}

impl ListenerSupport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` against `key`. Returns whether the caller must
    /// now send a `ListenerKeyRequest`.
    pub fn add_key_listener(
        &mut self,
        key: Binary,
        listener: Arc<dyn MapListener>,
        lite: bool,
        priming: bool,
    ) -> RegistrationChange {
        match self.key_listeners.get_mut(&key) {
            None => {
                self.key_listeners
                    .insert(key, Registration::new(listener, lite, priming));
                RegistrationChange {
                    issue_wire_request: true,
                    boundary_crossed: true,
                    effective_lite: lite,
                    effective_priming: priming,
                }
            }
            Some(reg) => {
                let was_lite = reg.all_lite;
                let was_priming = reg.priming;
                reg.entries.push(Entry { listener, lite });
                reg.recompute_lite();
                reg.priming |= priming;
                let needs_upgrade = (was_lite && !reg.all_lite) || (priming && !was_priming);
                RegistrationChange {
                    issue_wire_request: needs_upgrade,
                    boundary_crossed: false,
                    effective_lite: reg.all_lite,
                    effective_priming: reg.priming,
                }
            }
        }
    }

    /// Remove `listener` from `key`'s registration. Returns whether the
    /// set emptied out and the server should be told to drop it.
    pub fn remove_key_listener(
        &mut self,
        key: &Binary,
        listener: &Arc<dyn MapListener>,
    ) -> RegistrationChange {
        let Some(reg) = self.key_listeners.get_mut(key) else {
            return RegistrationChange {
                issue_wire_request: false,
                boundary_crossed: false,
                effective_lite: true,
                effective_priming: false,
            };
        };
        reg.entries.retain(|e| !Arc::ptr_eq(&e.listener, listener));
        if reg.entries.is_empty() {
            self.key_listeners.remove(key);
            return RegistrationChange {
                issue_wire_request: true,
                boundary_crossed: true,
                effective_lite: true,
                effective_priming: false,
            };
        }
        reg.recompute_lite();
        RegistrationChange {
            issue_wire_request: false,
            boundary_crossed: false,
            effective_lite: reg.all_lite,
            effective_priming: reg.priming,
        }
    }

    /// Register `listener` against `filter`, allocating a filter id on
    /// first use and reusing any previously-freed id.
    pub fn add_filter_listener(
        &mut self,
        filter: Opaque,
        listener: Arc<dyn MapListener>,
        lite: bool,
        priming: bool,
    ) -> (i64, RegistrationChange) {
        if let Some(&filter_id) = self.filter_ids_by_bytes.get(&filter) {
            let (_, reg) = self.filter_listeners.get_mut(&filter_id).unwrap();
            let was_lite = reg.all_lite;
            let was_priming = reg.priming;
            reg.entries.push(Entry { listener, lite });
            reg.recompute_lite();
            reg.priming |= priming;
            let needs_upgrade = (was_lite && !reg.all_lite) || (priming && !was_priming);
            return (
                filter_id,
                RegistrationChange {
                    issue_wire_request: needs_upgrade,
                    boundary_crossed: false,
                    effective_lite: reg.all_lite,
                    effective_priming: reg.priming,
                },
            );
        }

        let filter_id = self.freed_filter_ids.pop().unwrap_or_else(|| {
            self.next_filter_id += 1;
            self.next_filter_id
        });
        self.filter_ids_by_bytes.insert(filter.clone(), filter_id);
        self.filter_listeners
            .insert(filter_id, (filter, Registration::new(listener, lite, priming)));
        (
            filter_id,
            RegistrationChange {
                issue_wire_request: true,
                boundary_crossed: true,
                effective_lite: lite,
                effective_priming: priming,
            },
        )
    }

    /// Remove `listener` from the registration for `filter`. Returns the
    /// filter id (so the caller can send `ListenerFilterRequest{ add:
    /// false }`) and whether it emptied out and was freed for reuse.
    pub fn remove_filter_listener(
        &mut self,
        filter: &Opaque,
        listener: &Arc<dyn MapListener>,
    ) -> Option<(i64, RegistrationChange)> {
        let filter_id = *self.filter_ids_by_bytes.get(filter)?;
        let (_, reg) = self.filter_listeners.get_mut(&filter_id)?;
        reg.entries.retain(|e| !Arc::ptr_eq(&e.listener, listener));
        if reg.entries.is_empty() {
            self.filter_listeners.remove(&filter_id);
            self.filter_ids_by_bytes.remove(filter);
            self.freed_filter_ids.push(filter_id);
            return Some((
                filter_id,
                RegistrationChange {
                    issue_wire_request: true,
                    boundary_crossed: true,
                    effective_lite: true,
                    effective_priming: false,
                },
            ));
        }
        reg.recompute_lite();
        Some((
            filter_id,
            RegistrationChange {
                issue_wire_request: false,
                boundary_crossed: false,
                effective_lite: reg.all_lite,
                effective_priming: reg.priming,
            },
        ))
    }

    /// Every listener that should receive `event`: its key registration
    /// plus every filter registration named in `event.filter_ids`.
    ///
    /// `transformed` marks an event carrying a server-transformed view
    /// rather than the entry's real before/after values. A key-based
    /// listener registered as full (non-lite) asked for those real values,
    /// so it is skipped for a transformed event instead of being handed
    /// data it didn't ask for; a lite key listener or a filter listener
    /// (which never sees old/new values regardless) still receives it.
    pub fn listeners_for(
        &self,
        key: &Binary,
        filter_ids: &[i64],
        transformed: bool,
    ) -> Vec<Arc<dyn MapListener>> {
        let mut out = Vec::new();
        if let Some(reg) = self.key_listeners.get(key) {
            for entry in &reg.entries {
                if transformed && !entry.lite {
                    continue;
                }
                out.push(entry.listener.clone());
            }
        }
        for filter_id in filter_ids {
            if let Some((_, reg)) = self.filter_listeners.get(filter_id) {
                out.extend(reg.entries.iter().map(|e| e.listener.clone()));
            }
        }
        out
    }

    /// Undo a registration whose wire request failed. Used only for the
    /// "first listener for this key" case, where the local state change
    /// is exactly the insert that needs undoing; a failed upgrade of an
    /// already-registered key is left alone since the local listener list
    /// is still valid even though the server never heard about the
    /// stronger (non-lite/priming) requirement.
    pub fn add_key_listener_rollback(&mut self, key: &Binary) {
        if let Some(reg) = self.key_listeners.get(key) {
            if reg.entries.len() == 1 {
                self.key_listeners.remove(key);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.key_listeners.is_empty() && self.filter_listeners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MapEventKind, TransformationState};

    struct Noop;
    impl MapListener for Noop {
        fn entry_inserted(&self, _event: &MapEvent) {}
        fn entry_updated(&self, _event: &MapEvent) {}
        fn entry_deleted(&self, _event: &MapEvent) {}
    }

    fn listener() -> Arc<dyn MapListener> {
        Arc::new(Noop)
    }

    #[test]
    fn first_registration_always_issues_a_wire_request() {
        let mut support = ListenerSupport::new();
        let l = listener();
        let change = support.add_key_listener(vec![1], l, true, false);
        assert!(change.issue_wire_request);
        assert!(change.boundary_crossed);
    }

    #[test]
    fn a_second_lite_listener_does_not_need_a_wire_request() {
        let mut support = ListenerSupport::new();
        support.add_key_listener(vec![1], listener(), true, false);
        let change = support.add_key_listener(vec![1], listener(), true, false);
        assert!(!change.issue_wire_request);
    }

    #[test]
    fn upgrading_from_lite_to_full_issues_a_wire_request() {
        let mut support = ListenerSupport::new();
        support.add_key_listener(vec![1], listener(), true, false);
        let change = support.add_key_listener(vec![1], listener(), false, false);
        assert!(change.issue_wire_request);
        assert!(!change.effective_lite);
    }

    #[test]
    fn removing_the_last_listener_for_a_key_frees_it() {
        let mut support = ListenerSupport::new();
        let l = listener();
        support.add_key_listener(vec![1], l.clone(), true, false);
        let change = support.remove_key_listener(&vec![1], &l);
        assert!(change.issue_wire_request);
        assert!(change.boundary_crossed);
        assert!(support.is_empty());
    }

    #[test]
    fn filter_ids_are_reused_after_being_freed() {
        let mut support = ListenerSupport::new();
        let l = listener();
        let (first_id, _) = support.add_filter_listener(vec![9], l.clone(), true, false);
        support.remove_filter_listener(&vec![9], &l);
        let (second_id, change) = support.add_filter_listener(vec![9], l, true, false);
        assert_eq!(first_id, second_id);
        assert!(change.issue_wire_request);
    }

    #[test]
    fn dispatch_gathers_key_and_filter_listeners() {
        let mut support = ListenerSupport::new();
        let key_listener = listener();
        let filter_listener = listener();
        support.add_key_listener(vec![1], key_listener, true, false);
        let (filter_id, _) = support.add_filter_listener(vec![7], filter_listener, true, false);

        let targets = support.listeners_for(&vec![1], &[filter_id], false);
        assert_eq!(targets.len(), 2);

        let event = MapEvent {
            event_id: MapEventKind::Inserted,
            filter_ids: vec![filter_id],
            key: vec![1],
            old_value: None,
            new_value: Some(vec![2]),
            synthetic: false,
            transformation_state: TransformationState::NonTransformable,
            priming: false,
        };
        for target in &targets {
            target.entry_inserted(&event);
        }
    }

    #[test]
    fn a_transformed_event_skips_a_full_key_listener_but_keeps_a_lite_one() {
        let mut support = ListenerSupport::new();
        support.add_key_listener(vec![1], listener(), false, false);
        support.add_key_listener(vec![1], listener(), true, false);

        let untransformed = support.listeners_for(&vec![1], &[], false);
        assert_eq!(untransformed.len(), 2);

        let transformed = support.listeners_for(&vec![1], &[], true);
        assert_eq!(transformed.len(), 1);
    }
}
