// Copyright 2025 The Arbor Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! A scheduling application: lifecycle state, pending-ask ledger,
//! reservations, and the per-application allocation attempt.
//!
//! The ask ledger is a sorted linked map ordered priority-then-create-time
//! with a first-match cursor over asks that still have pending repeats.
//!
//! Lock order: an application may take a node lock while holding its own
//! lock; queue updates are made after the application lock is released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

use arbor_common::resources::Resource;
use arbor_common::security::UserGroup;
use arbor_util::sorted_linked_map::{CompareFn, MatchFn, SortedLinkedMap};
use arbor_util::time::current_time_ms;

use crate::allocation::{
    AllocationAsk, AllocationContext, AllocationResult, SchedulingAllocation,
};
use crate::error::{SchedulerError, SchedulerResult};
use crate::node::Node;
use crate::queue::Queue;
use crate::reservation::Reservation;
use crate::state::{transition, ApplicationEvent, ApplicationState};

/// How long a Completed application is retained before deletion.
pub const COMPLETED_RETENTION: Duration = Duration::from_secs(30);

/// A reservation as seen from the application side: the full reservation
/// plus the node it was made on.
#[derive(Clone)]
pub struct AppReservation {
    pub node: Arc<Node>,
    pub reservation: Reservation,
}

pub struct Application {
    pub app_id: String,
    user: UserGroup,
    tags: HashMap<String, String>,
    inner: RwLock<AppInner>,
}

struct AppInner {
    state: ApplicationState,
    /// Bumped on every transition and timer clear; a sleeping timer fires
    /// only when its generation is still current.
    timer_generation: u64,
    submission_time_ms: u64,
    queue_name: String,
    queue: Option<Arc<Queue>>,
    asks: SortedLinkedMap<String, AllocationAsk>,
    priority_ordering: bool,
    starting_timeout: Duration,
    waiting_timeout: Duration,
    pending: Resource,
    allocated: Resource,
    allocating: Resource,
    /// Reservations keyed by the canonical `appID|askKey|nodeID`.
    reservations: HashMap<String, AppReservation>,
}

fn new_ask_ledger(priority_ordering: bool) -> SortedLinkedMap<String, AllocationAsk> {
    let compare: CompareFn<AllocationAsk> = if priority_ordering {
        Box::new(|a, b| {
            if a.priority != b.priority {
                a.priority > b.priority
            } else {
                a.create_time_ms < b.create_time_ms
            }
        })
    } else {
        Box::new(|a, b| a.create_time_ms < b.create_time_ms)
    };
    let matches: MatchFn<AllocationAsk> = Box::new(|ask| ask.pending_repeat > 0);
    SortedLinkedMap::new(Some(compare), Some(matches))
}

impl Application {
    pub fn new(
        app_id: impl Into<String>,
        user: UserGroup,
        queue_name: impl Into<String>,
        tags: HashMap<String, String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            app_id: app_id.into(),
            user,
            tags,
            inner: RwLock::new(AppInner {
                state: ApplicationState::New,
                timer_generation: 0,
                submission_time_ms: current_time_ms(),
                queue_name: queue_name.into(),
                queue: None,
                asks: new_ask_ledger(true),
                priority_ordering: true,
                starting_timeout: crate::queue::DEFAULT_STARTING_TIMEOUT,
                waiting_timeout: crate::queue::DEFAULT_WAITING_TIMEOUT,
                pending: Resource::new(),
                allocated: Resource::new(),
                allocating: Resource::new(),
                reservations: HashMap::new(),
            }),
        })
    }

    pub fn user(&self) -> UserGroup {
        self.user.clone()
    }

    pub fn get_tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(|s| s.as_str())
    }

    pub fn state(&self) -> ApplicationState {
        self.inner.read().state
    }

    pub fn submission_time_ms(&self) -> u64 {
        self.inner.read().submission_time_ms
    }

    /// Override the submission time with the RM-reported creation time.
    pub fn set_submission_time_ms(&self, ms: u64) {
        self.inner.write().submission_time_ms = ms;
    }

    pub fn queue_name(&self) -> String {
        self.inner.read().queue_name.clone()
    }

    pub fn queue(&self) -> Option<Arc<Queue>> {
        self.inner.read().queue.clone()
    }

    /// Attach the application to its leaf queue after placement. Picks up
    /// the queue's ask ordering and state timeouts; the ledger is rebuilt
    /// when the ordering differs.
    pub fn set_queue(&self, queue: Arc<Queue>) {
        let priority_ordering = queue.priority_ordering();
        let mut inner = self.inner.write();
        inner.queue_name = queue.name().to_string();
        inner.starting_timeout = queue.starting_timeout();
        inner.waiting_timeout = queue.waiting_timeout();
        if inner.priority_ordering != priority_ordering {
            let mut ledger = new_ask_ledger(priority_ordering);
            for (key, ask) in inner.asks.iter() {
                ledger.put(key.clone(), ask.clone());
            }
            inner.asks = ledger;
            inner.priority_ordering = priority_ordering;
        }
        inner.queue = Some(queue);
    }

    pub fn pending(&self) -> Resource {
        self.inner.read().pending.clone()
    }

    pub fn has_pending(&self) -> bool {
        self.inner.read().pending.strictly_greater_than_zero()
    }

    pub fn allocated(&self) -> Resource {
        self.inner.read().allocated.clone()
    }

    pub fn allocating(&self) -> Resource {
        self.inner.read().allocating.clone()
    }

    pub fn inc_allocating(&self, delta: &Resource) {
        self.inner.write().allocating.add_to(delta);
    }

    pub fn dec_allocating(&self, delta: &Resource) {
        let mut inner = self.inner.write();
        match inner.allocating.sub_error_negative(delta) {
            Ok(result) => inner.allocating = result,
            Err(err) => {
                warn!(app_id = %self.app_id, %err, "allocating resources went negative");
                let raw = inner.allocating.sub(delta);
                let mut clamped = Resource::new();
                for (name, value) in raw.iter() {
                    clamped.set(name.to_string(), value.max(0));
                }
                inner.allocating = clamped;
            }
        }
    }

    // ─── state machine ──────────────────────────────────────────────────

    /// Drive the state machine. Entering Starting, Waiting, or Completed
    /// arms the state timer; leaving any timed state invalidates it.
    pub fn handle_event(
        self: &Arc<Self>,
        event: ApplicationEvent,
    ) -> SchedulerResult<ApplicationState> {
        let (from, to, timer) = {
            let mut inner = self.inner.write();
            let from = inner.state;
            let to = transition(from, event)?;
            inner.state = to;
            inner.timer_generation += 1;
            let timer = match to {
                ApplicationState::Starting => {
                    Some((inner.starting_timeout, to, ApplicationEvent::Run))
                }
                ApplicationState::Waiting => {
                    Some((inner.waiting_timeout, to, ApplicationEvent::Complete))
                }
                ApplicationState::Completed => {
                    Some((COMPLETED_RETENTION, to, ApplicationEvent::Delete))
                }
                _ => None,
            };
            (from, to, timer.map(|t| (inner.timer_generation, t)))
        };
        debug!(
            app_id = %self.app_id,
            source = from.as_str(),
            destination = to.as_str(),
            event = event.as_str(),
            "application state transition"
        );
        if let Some((generation, (timeout, expect, fire))) = timer {
            self.arm_state_timer(generation, timeout, expect, fire);
        }
        Ok(to)
    }

    /// Invalidate any armed state timer. Idempotent.
    pub fn clear_state_timer(&self) {
        self.inner.write().timer_generation += 1;
    }

    fn arm_state_timer(
        self: &Arc<Self>,
        generation: u64,
        timeout: Duration,
        expect: ApplicationState,
        fire: ApplicationEvent,
    ) {
        let weak = Arc::downgrade(self);
        let spawned = std::thread::Builder::new()
            .name("app-state-timer".to_string())
            .spawn(move || {
                std::thread::sleep(timeout);
                let Some(app) = weak.upgrade() else { return };
                let still_armed = {
                    let inner = app.inner.read();
                    inner.timer_generation == generation && inner.state == expect
                };
                if still_armed {
                    if let Err(err) = app.handle_event(fire) {
                        debug!(app_id = %app.app_id, %err, "state timer event not applied");
                    }
                }
            });
        if let Err(err) = spawned {
            warn!(app_id = %self.app_id, %err, "failed to spawn state timer");
        }
    }

    // ─── ask ledger ─────────────────────────────────────────────────────

    /// Insert or replace an ask. Updates the pending totals here and on the
    /// queue; an application still in New is accepted once it has pending
    /// work. Starting is only reached on the first confirmed allocation.
    pub fn add_ask(self: &Arc<Self>, mut ask: AllocationAsk) -> SchedulerResult<()> {
        if ask.allocation_key.is_empty() {
            return Err(SchedulerError::InvalidArgument(
                "ask has no allocation key".to_string(),
            ));
        }
        let (delta, queue, fire_run) = {
            let mut inner = self.inner.write();
            ask.app_id = self.app_id.clone();
            ask.queue_name = inner.queue_name.clone();
            let old_pending = inner
                .asks
                .get(&ask.allocation_key)
                .map(|old| old.pending_resource())
                .unwrap_or_default();
            let delta = ask.pending_resource().sub(&old_pending);
            inner.asks.put(ask.allocation_key.clone(), ask);
            inner.pending.add_to(&delta);
            let fire_run = inner.state == ApplicationState::New
                && inner.pending.strictly_greater_than_zero();
            (delta, inner.queue.clone(), fire_run)
        };
        if let Some(queue) = queue {
            queue.adjust_pending(&delta);
        }
        if fire_run {
            let _ = self.handle_event(ApplicationEvent::Run);
        }
        Ok(())
    }

    /// Adjust the pending repeat of an ask, e.g. +1 when a proposal is
    /// rejected so the ask is retried.
    pub fn update_ask_repeat(&self, ask_key: &str, delta: i64) -> SchedulerResult<()> {
        let (delta_res, queue) = {
            let mut inner = self.inner.write();
            let mut ask = inner
                .asks
                .get(ask_key)
                .cloned()
                .ok_or_else(|| SchedulerError::MissingEntity {
                    kind: "ask",
                    id: ask_key.to_string(),
                })?;
            if ask.pending_repeat + delta < 0 {
                return Err(SchedulerError::InvalidArgument(format!(
                    "ask {ask_key} repeat cannot go below zero"
                )));
            }
            ask.pending_repeat += delta;
            let delta_res = ask.resource.multiply(delta);
            inner.asks.put(ask_key.to_string(), ask);
            inner.pending.add_to(&delta_res);
            (delta_res, inner.queue.clone())
        };
        if let Some(queue) = queue {
            queue.adjust_pending(&delta_res);
        }
        Ok(())
    }

    pub fn get_ask(&self, ask_key: &str) -> Option<AllocationAsk> {
        self.inner.read().asks.get(ask_key).cloned()
    }

    /// Remove one ask, or all asks when the key is empty. Releases any
    /// reservations held for the removed asks and returns them so the
    /// partition can adjust its counters. Fires Wait when the last pending
    /// work disappears.
    pub fn remove_ask(self: &Arc<Self>, ask_key: &str) -> Vec<Reservation> {
        let (released, delta, queue, fire_wait) = {
            let mut inner = self.inner.write();
            let removed_keys: Vec<String> = if ask_key.is_empty() {
                inner.asks.keys().cloned().collect()
            } else if inner.asks.contains_key(&ask_key.to_string()) {
                vec![ask_key.to_string()]
            } else {
                Vec::new()
            };

            let mut delta = Resource::new();
            for key in &removed_keys {
                if let Some(ask) = inner.asks.remove(key) {
                    delta.sub_from(&ask.pending_resource());
                }
            }

            // release reservations tied to the removed asks
            let release_keys: Vec<String> = inner
                .reservations
                .iter()
                .filter(|(_, r)| removed_keys.contains(&r.reservation.ask_key))
                .map(|(k, _)| k.clone())
                .collect();
            let mut released = Vec::new();
            for key in release_keys {
                if let Some(app_resv) = inner.reservations.remove(&key) {
                    app_resv
                        .node
                        .unreserve(&app_resv.reservation.app_id, &app_resv.reservation.ask_key);
                    released.push(app_resv.reservation);
                }
            }

            inner.pending.add_to(&delta);
            let fire_wait = !removed_keys.is_empty()
                && !inner.pending.strictly_greater_than_zero()
                && matches!(
                    inner.state,
                    ApplicationState::Accepted
                        | ApplicationState::Starting
                        | ApplicationState::Running
                );
            (released, delta, inner.queue.clone(), fire_wait)
        };
        if let Some(queue) = queue {
            queue.adjust_pending(&delta);
        }
        if fire_wait {
            let _ = self.handle_event(ApplicationEvent::Wait);
        }
        released
    }

    /// Number of asks in the ledger (pending or not).
    pub fn ask_count(&self) -> usize {
        self.inner.read().asks.len()
    }

    // ─── reservations ───────────────────────────────────────────────────

    /// Reserve a node for an ask. The ask must exist with at least one
    /// pending repeat, and the application may hold at most one reservation
    /// per node and one per ask.
    pub fn reserve(&self, node: &Arc<Node>, ask_key: &str) -> SchedulerResult<()> {
        let mut inner = self.inner.write();
        let ask = inner
            .asks
            .get(ask_key)
            .cloned()
            .ok_or_else(|| SchedulerError::MissingEntity {
                kind: "ask",
                id: ask_key.to_string(),
            })?;
        if ask.pending_repeat < 1 {
            return Err(SchedulerError::InvalidArgument(format!(
                "ask {ask_key} has no pending repeats to reserve"
            )));
        }
        if inner
            .reservations
            .values()
            .any(|r| r.reservation.node_id == node.node_id)
        {
            return Err(SchedulerError::ReservationConflict {
                node_id: node.node_id.clone(),
            });
        }
        if inner
            .reservations
            .values()
            .any(|r| r.reservation.ask_key == ask_key)
        {
            return Err(SchedulerError::ReservationConflict {
                node_id: node.node_id.clone(),
            });
        }
        let reservation = Reservation::new(
            self.app_id.clone(),
            ask_key,
            node.node_id.clone(),
            ask.resource.clone(),
        );
        node.reserve(reservation.clone())?;
        inner.reservations.insert(
            reservation.full_key(),
            AppReservation {
                node: node.clone(),
                reservation,
            },
        );
        Ok(())
    }

    /// Drop the reservation for (ask, node). Returns true when one existed.
    pub fn unreserve(&self, node_id: &str, ask_key: &str) -> bool {
        let mut inner = self.inner.write();
        let key = Reservation::new(self.app_id.clone(), ask_key, node_id, Resource::new()).full_key();
        match inner.reservations.remove(&key) {
            Some(app_resv) => {
                app_resv.node.unreserve(&self.app_id, ask_key);
                true
            }
            None => {
                debug!(
                    app_id = %self.app_id,
                    node_id,
                    ask = ask_key,
                    "reservation not found while removing from application"
                );
                false
            }
        }
    }

    pub fn is_reserved_on_node(&self, node_id: &str) -> bool {
        self.inner
            .read()
            .reservations
            .values()
            .any(|r| r.reservation.node_id == node_id)
    }

    fn ask_has_reservation(&self, ask_key: &str) -> bool {
        self.inner
            .read()
            .reservations
            .values()
            .any(|r| r.reservation.ask_key == ask_key)
    }

    pub fn reservations(&self) -> Vec<AppReservation> {
        self.inner.read().reservations.values().cloned().collect()
    }

    pub fn reservation_count(&self) -> usize {
        self.inner.read().reservations.len()
    }

    // ─── confirmed allocations ──────────────────────────────────────────

    /// Record a confirmed allocation; drives the state machine forward.
    pub fn add_allocation(self: &Arc<Self>, resource: &Resource) {
        {
            let mut inner = self.inner.write();
            inner.allocated.add_to(resource);
        }
        // Accepted → Starting on the first allocation, otherwise → Running
        if let Err(err) = self.handle_event(ApplicationEvent::Run) {
            debug!(app_id = %self.app_id, %err, "allocation did not change state");
        }
    }

    /// Release a confirmed allocation. A Waiting application completes
    /// when its last allocation is released.
    pub fn remove_allocation(self: &Arc<Self>, resource: &Resource) {
        let fire_complete = {
            let mut inner = self.inner.write();
            match inner.allocated.sub_error_negative(resource) {
                Ok(result) => inner.allocated = result,
                Err(err) => {
                    warn!(app_id = %self.app_id, %err, "allocated resources went negative");
                    let raw = inner.allocated.sub(resource);
                    let mut clamped = Resource::new();
                    for (name, value) in raw.iter() {
                        clamped.set(name.to_string(), value.max(0));
                    }
                    inner.allocated = clamped;
                }
            }
            inner.state == ApplicationState::Waiting && inner.allocated.is_zero()
        };
        if fire_complete {
            let _ = self.handle_event(ApplicationEvent::Complete);
        }
    }

    // ─── allocation attempt ─────────────────────────────────────────────

    /// Try to place the pending asks in ledger order. Returns the first
    /// successful allocation or reservation, or None.
    pub fn try_allocate(
        self: &Arc<Self>,
        headroom: &Resource,
        ctx: &dyn AllocationContext,
    ) -> Option<SchedulingAllocation> {
        let (asks, queue) = {
            let inner = self.inner.read();
            let asks: Vec<AllocationAsk> =
                inner.asks.iter_matched().map(|(_, ask)| ask.clone()).collect();
            (asks, inner.queue.clone()?)
        };
        let plugin = ctx.predicate_plugin();
        let preemption = ctx.preemption_phase();

        for ask in asks {
            // over the queue headroom: the ask stays pending
            if !headroom.fit_in_max(&ask.resource) {
                continue;
            }
            if !queue.check_allocation_limits(&self.user, &ask.resource) {
                continue;
            }
            // reserved asks are driven by the reserved-allocation pass
            if self.ask_has_reservation(&ask.allocation_key) {
                continue;
            }

            if let Some(required) = ask.required_node.clone() {
                if let Some(node) = ctx.get_node(&required) {
                    if node.pre_allocate_check(&ask.resource, preemption)
                        && node.pre_allocate_conditions(plugin.as_ref(), &ask.allocation_key)
                        && node.try_allocating(&ask.resource, preemption)
                    {
                        self.post_allocate(&ask.allocation_key, &ask.resource, &queue);
                        return Some(SchedulingAllocation::new(
                            ask,
                            required,
                            AllocationResult::Allocated,
                        ));
                    }
                }
                continue;
            }

            let mut iter = ctx.node_iterator()?;
            let mut reserve_candidate: Option<Arc<Node>> = None;
            while let Some(node) = iter.next() {
                if node.pre_allocate_check(&ask.resource, preemption)
                    && node.pre_allocate_conditions(plugin.as_ref(), &ask.allocation_key)
                    && node.try_allocating(&ask.resource, preemption)
                {
                    self.post_allocate(&ask.allocation_key, &ask.resource, &queue);
                    let node_id = node.node_id.clone();
                    return Some(SchedulingAllocation::new(
                        ask,
                        node_id,
                        AllocationResult::Allocated,
                    ));
                }
                // remember the first node the ask could ever fit on
                if reserve_candidate.is_none()
                    && node.fits_on_node(&ask.resource)
                    && !self.is_reserved_on_node(&node.node_id)
                {
                    reserve_candidate = Some(node);
                }
            }

            if let Some(node) = reserve_candidate {
                let node_id = node.node_id.clone();
                return Some(SchedulingAllocation::new(
                    ask,
                    node_id,
                    AllocationResult::Reserved,
                ));
            }
        }
        None
    }

    /// Try to satisfy the reserved asks: the reserved node first, then any
    /// other schedulable node (which upgrades the reservation elsewhere).
    pub fn try_reserved_allocate(
        self: &Arc<Self>,
        headroom: &Resource,
        ctx: &dyn AllocationContext,
    ) -> Option<SchedulingAllocation> {
        let (reservations, queue) = {
            let inner = self.inner.read();
            (
                inner.reservations.values().cloned().collect::<Vec<_>>(),
                inner.queue.clone()?,
            )
        };
        let plugin = ctx.predicate_plugin();
        let preemption = ctx.preemption_phase();

        for app_resv in reservations {
            let resv = &app_resv.reservation;
            let ask = match self.get_ask(&resv.ask_key) {
                Some(ask) if ask.pending_repeat >= 1 => ask,
                _ => {
                    // the ask disappeared under the reservation: clean up
                    let stale = AllocationAsk::new(
                        resv.ask_key.clone(),
                        self.app_id.clone(),
                        resv.resource.clone(),
                        0,
                        0,
                    );
                    return Some(SchedulingAllocation::new(
                        stale,
                        resv.node_id.clone(),
                        AllocationResult::Unreserved,
                    ));
                }
            };
            if !headroom.fit_in_max(&ask.resource) {
                continue;
            }

            // the reserved node, if it has room again
            let node = &app_resv.node;
            if node.pre_allocate_check(&ask.resource, preemption)
                && node.pre_allocate_conditions(plugin.as_ref(), &ask.allocation_key)
                && node.try_allocating(&ask.resource, preemption)
            {
                self.post_allocate(&ask.allocation_key, &ask.resource, &queue);
                return Some(SchedulingAllocation::new(
                    ask,
                    resv.node_id.clone(),
                    AllocationResult::AllocatedReserved,
                ));
            }

            // any other schedulable node; the reservation moves out with it
            let Some(mut iter) = ctx.node_iterator() else {
                continue;
            };
            while let Some(other) = iter.next() {
                if other.node_id == resv.node_id {
                    continue;
                }
                if other.pre_allocate_check(&ask.resource, preemption)
                    && other.pre_allocate_conditions(plugin.as_ref(), &ask.allocation_key)
                    && other.try_allocating(&ask.resource, preemption)
                {
                    self.post_allocate(&ask.allocation_key, &ask.resource, &queue);
                    let mut alloc = SchedulingAllocation::new(
                        ask,
                        other.node_id.clone(),
                        AllocationResult::AllocatedReserved,
                    );
                    alloc.reserved_node_id = Some(resv.node_id.clone());
                    return Some(alloc);
                }
            }
        }
        None
    }

    /// Bookkeeping after a successful node placement: one repeat consumed,
    /// pending shrinks, allocating grows on the app and up the queue tree.
    fn post_allocate(&self, ask_key: &str, resource: &Resource, queue: &Arc<Queue>) {
        {
            let mut inner = self.inner.write();
            if let Some(mut ask) = inner.asks.get(ask_key).cloned() {
                ask.pending_repeat -= 1;
                inner.asks.put(ask_key.to_string(), ask);
            }
            inner.pending.sub_from(resource);
            inner.allocating.add_to(resource);
        }
        queue.dec_pending(resource);
        queue.inc_allocating(resource);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(memory: i64) -> Resource {
        let mut r = Resource::new();
        r.set("memory", memory);
        r
    }

    fn app() -> Arc<Application> {
        Application::new(
            "app-1",
            UserGroup::user_only("alice"),
            "root.default",
            HashMap::new(),
        )
    }

    #[test]
    fn test_ask_ledger_pending() {
        let app = app();
        app.add_ask(AllocationAsk::new("ask-1", "app-1", res(10), 2, 0))
            .unwrap();
        app.add_ask(AllocationAsk::new("ask-2", "app-1", res(5), 1, 0))
            .unwrap();
        assert_eq!(app.pending().get("memory"), 25);

        // replacing an ask adjusts pending by the delta
        app.add_ask(AllocationAsk::new("ask-1", "app-1", res(10), 1, 0))
            .unwrap();
        assert_eq!(app.pending().get("memory"), 15);

        app.update_ask_repeat("ask-2", 2).unwrap();
        assert_eq!(app.pending().get("memory"), 25);
        assert!(app.update_ask_repeat("ask-2", -10).is_err());
        assert!(app.update_ask_repeat("missing", 1).is_err());
    }

    #[test]
    fn test_ask_order_priority_then_create_time() {
        let app = app();
        let mut low = AllocationAsk::new("low", "app-1", res(1), 1, 1);
        let mut high = AllocationAsk::new("high", "app-1", res(1), 1, 5);
        let mut old_low = AllocationAsk::new("old-low", "app-1", res(1), 1, 1);
        low.create_time_ms = 100;
        high.create_time_ms = 200;
        old_low.create_time_ms = 50;
        app.add_ask(low).unwrap();
        app.add_ask(high).unwrap();
        app.add_ask(old_low).unwrap();

        let inner = app.inner.read();
        let order: Vec<&str> = inner.asks.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(order, vec!["high", "old-low", "low"]);
    }

    #[test]
    fn test_remove_ask_fires_wait() {
        let app = app();
        app.add_ask(AllocationAsk::new("ask-1", "app-1", res(10), 1, 0))
            .unwrap();
        // pending work accepted the application
        assert_eq!(app.state(), ApplicationState::Accepted);

        app.remove_ask("ask-1");
        assert!(app.pending().is_zero());
        assert_eq!(app.state(), ApplicationState::Waiting);
    }

    #[test]
    fn test_remove_all_asks() {
        let app = app();
        app.add_ask(AllocationAsk::new("a", "app-1", res(10), 1, 0))
            .unwrap();
        app.add_ask(AllocationAsk::new("b", "app-1", res(10), 2, 0))
            .unwrap();
        app.remove_ask("");
        assert_eq!(app.ask_count(), 0);
        assert!(app.pending().is_zero());
    }

    #[test]
    fn test_state_flow_with_allocations() {
        let app = app();
        app.add_ask(AllocationAsk::new("ask-1", "app-1", res(10), 2, 0))
            .unwrap();
        assert_eq!(app.state(), ApplicationState::Accepted);

        // first allocation starts the application, the second runs it
        app.add_allocation(&res(10));
        assert_eq!(app.state(), ApplicationState::Starting);
        app.add_allocation(&res(10));
        assert_eq!(app.state(), ApplicationState::Running);

        app.remove_ask("");
        assert_eq!(app.state(), ApplicationState::Waiting);

        app.remove_allocation(&res(10));
        assert_eq!(app.state(), ApplicationState::Waiting);
        app.remove_allocation(&res(10));
        assert_eq!(app.state(), ApplicationState::Completed);
    }

    #[test]
    fn test_reservation_indexes() {
        let app = app();
        app.add_ask(AllocationAsk::new("ask-1", "app-1", res(10), 1, 0))
            .unwrap();
        let node = Arc::new(Node::new("node-1", res(100), Resource::new()));

        app.reserve(&node, "ask-1").unwrap();
        assert!(app.is_reserved_on_node("node-1"));
        assert!(node.is_reserved_for_app("app-1"));
        assert_eq!(app.reservation_count(), 1);

        // one reservation per ask and per node
        assert!(app.reserve(&node, "ask-1").is_err());

        assert!(app.unreserve("node-1", "ask-1"));
        assert!(!app.is_reserved_on_node("node-1"));
        assert!(!node.is_reserved());
        assert!(!app.unreserve("node-1", "ask-1"));
    }

    #[test]
    fn test_remove_ask_releases_reservation() {
        let app = app();
        app.add_ask(AllocationAsk::new("ask-1", "app-1", res(10), 1, 0))
            .unwrap();
        let node = Arc::new(Node::new("node-1", res(100), Resource::new()));
        app.reserve(&node, "ask-1").unwrap();

        let released = app.remove_ask("ask-1");
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].ask_key, "ask-1");
        assert!(!node.is_reserved());
        assert_eq!(app.reservation_count(), 0);
    }

    #[test]
    fn test_starting_timer_fires_run() {
        let app = app();
        {
            let mut inner = app.inner.write();
            inner.starting_timeout = Duration::from_millis(20);
        }
        app.handle_event(ApplicationEvent::Run).unwrap(); // Accepted
        app.handle_event(ApplicationEvent::Run).unwrap(); // Starting, timer armed
        assert_eq!(app.state(), ApplicationState::Starting);

        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(app.state(), ApplicationState::Running);
    }

    #[test]
    fn test_cleared_timer_does_not_fire() {
        let app = app();
        {
            let mut inner = app.inner.write();
            inner.waiting_timeout = Duration::from_millis(20);
        }
        app.handle_event(ApplicationEvent::Run).unwrap(); // Accepted
        app.handle_event(ApplicationEvent::Wait).unwrap(); // Waiting, timer armed
        // Run leaves Waiting and invalidates the timer
        app.handle_event(ApplicationEvent::Run).unwrap();
        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(app.state(), ApplicationState::Running);
    }
}
