// Copyright 2025 The Arbor Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Per-node scheduling state.
//!
//! A node tracks its confirmed allocations next to the in-flight
//! (allocating) proposals and resources earmarked for preemption. The
//! available resource is cached and invalidated on every change to either
//! side of the ledger.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use arbor_common::resources::Resource;

use crate::error::{SchedulerError, SchedulerResult};
use crate::plugin::{PredicateArgs, PredicatePlugin};
use crate::reservation::{node_reservation_key, Reservation};

pub struct Node {
    pub node_id: String,
    inner: RwLock<NodeInner>,
}

struct NodeInner {
    /// Total capacity as reported by the RM.
    capacity: Resource,
    /// Usage outside the scheduler's control (system daemons).
    occupied: Resource,
    /// Confirmed allocations.
    allocated: Resource,
    /// In-flight proposals not yet confirmed by the cache.
    allocating: Resource,
    /// Resources earmarked by the preemption logic.
    preempting: Resource,
    /// capacity − occupied − allocated − allocating; None when stale.
    cached_available: Option<Resource>,
    schedulable: bool,
    /// Reservations keyed by `appID|askKey`.
    reservations: HashMap<String, Reservation>,
}

impl Node {
    pub fn new(node_id: impl Into<String>, capacity: Resource, occupied: Resource) -> Self {
        Self {
            node_id: node_id.into(),
            inner: RwLock::new(NodeInner {
                capacity,
                occupied,
                allocated: Resource::new(),
                allocating: Resource::new(),
                preempting: Resource::new(),
                cached_available: None,
                schedulable: true,
                reservations: HashMap::new(),
            }),
        }
    }

    pub fn capacity(&self) -> Resource {
        self.inner.read().capacity.clone()
    }

    pub fn occupied(&self) -> Resource {
        self.inner.read().occupied.clone()
    }

    pub fn allocated(&self) -> Resource {
        self.inner.read().allocated.clone()
    }

    pub fn allocating(&self) -> Resource {
        self.inner.read().allocating.clone()
    }

    pub fn preempting(&self) -> Resource {
        self.inner.read().preempting.clone()
    }

    pub fn is_schedulable(&self) -> bool {
        self.inner.read().schedulable
    }

    pub fn set_schedulable(&self, schedulable: bool) {
        self.inner.write().schedulable = schedulable;
    }

    /// Update capacity and occupied from an RM report.
    pub fn update_from_report(&self, capacity: Resource, occupied: Resource) {
        let mut inner = self.inner.write();
        inner.capacity = capacity;
        inner.occupied = occupied;
        inner.cached_available = None;
    }

    /// Available resource: capacity − occupied − allocated − allocating.
    /// Recomputed under the node lock when the cache is stale.
    pub fn available(&self) -> Resource {
        let mut inner = self.inner.write();
        if inner.cached_available.is_none() {
            inner.cached_available = Some(inner.confirmed_available().sub(&inner.allocating));
        }
        inner.cached_available.clone().expect("cache filled above")
    }

    /// Whether a single allocation of this size could ever fit on the node.
    pub fn fits_on_node(&self, resource: &Resource) -> bool {
        let inner = self.inner.read();
        inner.capacity.sub(&inner.occupied).fit_in(resource)
    }

    /// Fast pre-check before attempting an allocation. Lock free with
    /// respect to updates: no state is changed.
    pub fn pre_allocate_check(&self, resource: &Resource, preemption_phase: bool) -> bool {
        if !self.is_schedulable() {
            debug!(node_id = %self.node_id, "node is unschedulable");
            return false;
        }
        if !resource.strictly_greater_than_zero() {
            debug!(node_id = %self.node_id, "pre alloc check: requested resource is zero");
            return false;
        }
        let inner = self.inner.read();
        let mut available = inner.confirmed_available();
        if preemption_phase {
            available.add_to(&inner.preempting);
        }
        available.fit_in(&inner.allocating.add(resource))
    }

    /// Run the registered predicate plugin for this node. Lock free so
    /// that multiple predicate checks can run concurrently and the plugin
    /// can call back into the scheduler without deadlocking.
    pub fn pre_allocate_conditions(
        &self,
        plugin: Option<&Arc<dyn PredicatePlugin>>,
        allocation_key: &str,
    ) -> bool {
        if let Some(plugin) = plugin {
            let args = PredicateArgs {
                allocation_key,
                node_id: &self.node_id,
            };
            if let Err(reason) = plugin.predicates(&args) {
                debug!(
                    node_id = %self.node_id,
                    allocation_key,
                    reason,
                    "predicate check failed"
                );
                return false;
            }
        }
        true
    }

    /// Check-and-update of the allocating ledger. Returns true and bumps
    /// `allocating` when the proposal still fits, false without changes
    /// otherwise.
    pub fn try_allocating(&self, resource: &Resource, preemption_phase: bool) -> bool {
        let mut inner = self.inner.write();
        let mut available = inner.confirmed_available();
        if preemption_phase {
            available.add_to(&inner.preempting);
        }
        let new_allocating = inner.allocating.add(resource);
        // it might have changed since the pre check
        if available.fit_in(&new_allocating) {
            debug!(node_id = %self.node_id, unconfirmed = %new_allocating, "allocations in progress updated");
            inner.allocating = new_allocating;
            inner.cached_available = None;
            return true;
        }
        false
    }

    pub fn inc_allocating(&self, delta: &Resource) {
        let mut inner = self.inner.write();
        inner.allocating.add_to(delta);
        inner.cached_available = None;
    }

    /// Decrement the in-flight ledger; drift below zero is clamped and
    /// logged.
    pub fn dec_allocating(&self, delta: &Resource) {
        let mut inner = self.inner.write();
        inner.allocating = sub_clamped(&inner.allocating, delta, &self.node_id, "allocating");
        inner.cached_available = None;
    }

    pub fn inc_preempting(&self, delta: &Resource) {
        self.inner.write().preempting.add_to(delta);
    }

    pub fn dec_preempting(&self, delta: &Resource) {
        let mut inner = self.inner.write();
        inner.preempting = sub_clamped(&inner.preempting, delta, &self.node_id, "preempting");
    }

    /// Record a confirmed allocation.
    pub fn add_allocation(&self, resource: &Resource) {
        let mut inner = self.inner.write();
        inner.allocated.add_to(resource);
        inner.cached_available = None;
    }

    /// Release a confirmed allocation.
    pub fn remove_allocation(&self, resource: &Resource) {
        let mut inner = self.inner.write();
        inner.allocated = sub_clamped(&inner.allocated, resource, &self.node_id, "allocated");
        inner.cached_available = None;
    }

    // ─── reservations ───────────────────────────────────────────────────

    pub fn is_reserved(&self) -> bool {
        !self.inner.read().reservations.is_empty()
    }

    /// True iff this application holds a reservation on the node. False
    /// does not mean the node is unreserved: another app may hold one.
    pub fn is_reserved_for_app(&self, app_id: &str) -> bool {
        if app_id.is_empty() {
            return false;
        }
        let prefix = node_reservation_key(app_id, "");
        self.inner
            .read()
            .reservations
            .keys()
            .any(|key| key.starts_with(&prefix))
    }

    /// Reserve the node for an (app, ask) pair. The ask must fit the node's
    /// total capacity and the node must not already be reserved.
    pub fn reserve(&self, reservation: Reservation) -> SchedulerResult<()> {
        let mut inner = self.inner.write();
        if !inner.reservations.is_empty() {
            return Err(SchedulerError::ReservationConflict {
                node_id: self.node_id.clone(),
            });
        }
        if !inner.capacity.sub(&inner.occupied).fit_in(&reservation.resource) {
            debug!(
                node_id = %self.node_id,
                app_id = %reservation.app_id,
                ask = %reservation.ask_key,
                "reservation does not fit on the node"
            );
            return Err(SchedulerError::QuotaExceeded {
                queue: self.node_id.clone(),
                requested: reservation.resource.to_string(),
            });
        }
        inner.reservations.insert(reservation.node_key(), reservation);
        Ok(())
    }

    /// Remove the reservation for an (app, ask) pair. Returns true when a
    /// reservation was removed.
    pub fn unreserve(&self, app_id: &str, ask_key: &str) -> bool {
        let key = node_reservation_key(app_id, ask_key);
        let removed = self.inner.write().reservations.remove(&key).is_some();
        if !removed {
            debug!(
                node_id = %self.node_id,
                app_id,
                ask = ask_key,
                "reservation not found while removing from node"
            );
        }
        removed
    }

    pub fn reservations(&self) -> Vec<Reservation> {
        self.inner.read().reservations.values().cloned().collect()
    }

    /// Drop all reservations, returning the affected application IDs so the
    /// partition can adjust its counters. Used on node removal.
    pub fn remove_all_reservations(&self) -> Vec<String> {
        let mut inner = self.inner.write();
        let apps = inner
            .reservations
            .values()
            .map(|r| r.app_id.clone())
            .collect();
        inner.reservations.clear();
        apps
    }
}

impl NodeInner {
    fn confirmed_available(&self) -> Resource {
        self.capacity.sub(&self.occupied).sub(&self.allocated)
    }
}

/// Subtract with drift detection: on a negative component the result is
/// clamped at zero and a warning is logged.
fn sub_clamped(current: &Resource, delta: &Resource, node_id: &str, ledger: &str) -> Resource {
    match current.sub_error_negative(delta) {
        Ok(result) => result,
        Err(err) => {
            warn!(node_id, ledger, %err, "resource ledger went negative");
            let raw = current.sub(delta);
            let mut clamped = Resource::new();
            for (name, value) in raw.iter() {
                clamped.set(name.to_string(), value.max(0));
            }
            clamped
        }
    }
}
