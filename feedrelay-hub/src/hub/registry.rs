use std::collections::HashMap;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use feedrelay_core::models::{ResourceId, SessionId};
use tracing::{debug, info};

use super::session::Session;
use super::store::ResourceStore;
use crate::error::{RelayError, Result};

/// Sessions observing one resource, unique by session id
#[derive(Debug, Clone, Default)]
pub struct SubscriberSet {
    sessions: HashMap<SessionId, Session>,
}

impl SubscriberSet {
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    #[must_use]
    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }
}

/// Result of removing a session from the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribed {
    pub resource_id: ResourceId,
    /// The set became empty and the resource's snapshot was dropped
    pub evicted: bool,
}

/// Mutable view of one resource's subscribers, only reachable while the
/// registry guard for that resource is held
pub(crate) struct Subscribers<'a> {
    resource_id: &'a ResourceId,
    set: &'a mut SubscriberSet,
    bindings: &'a DashMap<SessionId, ResourceId>,
}

impl Subscribers<'_> {
    /// Add a session. Returns `false` if it was already subscribed here.
    pub(crate) fn add(&mut self, session: &Session) -> Result<bool> {
        let bound = self
            .bindings
            .get(session.id())
            .map(|resource| resource.value().clone());
        if let Some(bound) = bound {
            if &bound != self.resource_id {
                return Err(RelayError::SessionAlreadyBound {
                    session_id: session.id().clone(),
                    resource_id: bound,
                });
            }
        }

        let added = self
            .set
            .sessions
            .insert(session.id().clone(), session.clone())
            .is_none();
        self.bindings
            .insert(session.id().clone(), self.resource_id.clone());
        Ok(added)
    }

    pub(crate) fn remove(&mut self, session_id: &SessionId) -> Option<Session> {
        let removed = self.set.sessions.remove(session_id);
        if removed.is_some() {
            self.bindings.remove(session_id);
        }
        removed
    }

    pub(crate) fn is_bound_here(&self, session_id: &SessionId) -> bool {
        self.bindings
            .get(session_id)
            .is_some_and(|resource| resource.value() == self.resource_id)
    }

    pub(crate) fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.set.sessions.values()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// Resource -> subscriber set, plus session -> resource for cleanup
///
/// A resource is a key here iff its subscriber set is non-empty.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: DashMap<ResourceId, SubscriberSet>,
    bindings: DashMap<SessionId, ResourceId>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with exclusive access to the subscribers of `resource_id`.
    ///
    /// The guard is held for the whole call, so `f` may also read or write
    /// the store entry for the same resource. If `f` leaves a previously
    /// non-empty set empty, the registry entry and the stored snapshot are
    /// both removed before the guard is released. The returned flag reports
    /// that eviction.
    pub(crate) fn with_subscribers<R>(
        &self,
        resource_id: &ResourceId,
        store: &ResourceStore,
        f: impl FnOnce(&mut Subscribers<'_>) -> R,
    ) -> (R, bool) {
        match self.subscriptions.entry(resource_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let out = f(&mut Subscribers {
                    resource_id,
                    set: occupied.get_mut(),
                    bindings: &self.bindings,
                });
                if occupied.get().is_empty() {
                    store.evict(resource_id);
                    occupied.remove();
                    debug!(resource_id = %resource_id, "Last subscriber left, resource removed");
                    (out, true)
                } else {
                    (out, false)
                }
            }
            Entry::Vacant(vacant) => {
                let mut set = SubscriberSet::default();
                let out = f(&mut Subscribers {
                    resource_id,
                    set: &mut set,
                    bindings: &self.bindings,
                });
                if !set.is_empty() {
                    vacant.insert(set);
                }
                (out, false)
            }
        }
    }

    /// Remove a session from whichever resource it observes
    ///
    /// Evicts the resource's snapshot when this was its last subscriber.
    pub fn unsubscribe(
        &self,
        session_id: &SessionId,
        store: &ResourceStore,
    ) -> Option<Unsubscribed> {
        let Some(resource_id) = self.bound_resource(session_id) else {
            debug!(session_id = %session_id, "Session already unsubscribed");
            return None;
        };

        let (removed, evicted) = self.with_subscribers(&resource_id, store, |subs| {
            let removed = subs.remove(session_id);
            if removed.is_none() && subs.is_bound_here(session_id) {
                super::invariant_violation(&format!(
                    "session {session_id} bound to {resource_id} but missing from its subscriber set"
                ));
            }
            removed
        });

        // Pruned by a concurrent broadcast between the lookup and the guard
        let session = removed?;

        info!(
            resource_id = %resource_id,
            session_id = %session_id,
            duration = ?session.duration(),
            evicted = evicted,
            "Session unsubscribed"
        );

        Some(Unsubscribed {
            resource_id,
            evicted,
        })
    }

    /// Copy of the current subscriber set; empty if nobody observes the resource
    #[must_use]
    pub fn subscribers_of(&self, resource_id: &ResourceId) -> SubscriberSet {
        self.subscriptions
            .get(resource_id)
            .map(|set| set.value().clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_subscribed(&self, resource_id: &ResourceId) -> bool {
        self.subscriptions.contains_key(resource_id)
    }

    #[must_use]
    pub fn bound_resource(&self, session_id: &SessionId) -> Option<ResourceId> {
        self.bindings
            .get(session_id)
            .map(|resource| resource.value().clone())
    }

    /// Number of resources with at least one subscriber
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.subscriptions.len()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.bindings.len()
    }
}
