// Copyright 2025 The Arbor Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The partition context: one logical cluster.
//!
//! Owns the queue tree, the application and node maps, the reservation
//! counters, and the placement manager. Drives the allocation pass and
//! reconciles proposals with the external cache.
//!
//! Locking: one RwLock over the three maps; queue, application, and node
//! locks are taken below it, in that order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use arbor_common::config::{PartitionConfig, QueueConfig, QUEUE_DOT, ROOT_QUEUE};
use arbor_common::partition_name::normalized_partition_name;
use arbor_common::resources::Resource;
use arbor_common::security::UserGroup;

use crate::allocation::{
    AllocationContext, AllocationProposal, AllocationResult, SchedulingAllocation,
};
use crate::application::Application;
use crate::error::{SchedulerError, SchedulerResult};
use crate::node::Node;
use crate::node_iterator::{DefaultNodeIterator, NodeIterator, RoundRobinNodeIterator};
use crate::placement::{PlacementDecision, PlacementManager};
use crate::plugin::PredicatePlugin;
use crate::policy::{self, NodeSortPolicy};
use crate::queue::Queue;
use crate::state::ApplicationEvent;

pub struct PartitionContext {
    /// Qualified partition name, `[rmID]name`.
    pub name: String,
    pub rm_id: String,
    root: Arc<Queue>,
    placement: PlacementManager,
    node_sort_policy: RwLock<NodeSortPolicy>,
    preemption_enabled: AtomicBool,
    plugin: RwLock<Option<Arc<dyn PredicatePlugin>>>,
    inner: RwLock<PartitionInner>,
}

struct PartitionInner {
    applications: HashMap<String, Arc<Application>>,
    nodes: HashMap<String, Arc<Node>>,
    /// Reservation count per application.
    reserved_apps: HashMap<String, usize>,
}

impl PartitionContext {
    pub fn from_config(cfg: &PartitionConfig, rm_id: &str) -> SchedulerResult<Arc<Self>> {
        let root_cfg = cfg.queues.first().ok_or_else(|| {
            SchedulerError::InvalidArgument(format!(
                "partition {} has no queue hierarchy",
                cfg.name
            ))
        })?;
        let root = Queue::from_config(root_cfg, None)?;
        root.add_limits(&cfg.limits)?;
        let placement = PlacementManager::new(&cfg.placement_rules)?;
        Ok(Arc::new(Self {
            name: normalized_partition_name(&cfg.name, rm_id),
            rm_id: rm_id.to_string(),
            root,
            placement,
            node_sort_policy: RwLock::new(NodeSortPolicy::from_config(
                &cfg.node_sort_policy.policy_type,
            )),
            preemption_enabled: AtomicBool::new(cfg.preemption.enabled),
            plugin: RwLock::new(None),
            inner: RwLock::new(PartitionInner {
                applications: HashMap::new(),
                nodes: HashMap::new(),
                reserved_apps: HashMap::new(),
            }),
        }))
    }

    pub fn root(&self) -> Arc<Queue> {
        self.root.clone()
    }

    pub fn set_predicate_plugin(&self, plugin: Arc<dyn PredicatePlugin>) {
        *self.plugin.write() = Some(plugin);
    }

    pub fn preemption_enabled(&self) -> bool {
        self.preemption_enabled.load(Ordering::Relaxed)
    }

    // ─── queues ─────────────────────────────────────────────────────────

    /// Look up a queue by its fully qualified, dot separated name.
    pub fn get_queue(&self, name: &str) -> Option<Arc<Queue>> {
        let name = name.to_lowercase();
        let mut parts = name.split(QUEUE_DOT);
        if parts.next() != Some(ROOT_QUEUE) {
            return None;
        }
        let mut queue = self.root.clone();
        for part in parts {
            queue = queue.get_child(part)?;
        }
        Some(queue)
    }

    /// Create the missing queues on the path as unmanaged queues. The
    /// deepest existing ancestor must grant the user submit access.
    fn create_queue(&self, name: &str, user: &UserGroup) -> SchedulerResult<()> {
        let mut existing = name.to_lowercase();
        let mut to_create: Vec<String> = Vec::new();
        let mut parent = self.get_queue(&existing);
        while parent.is_none() {
            let idx = existing.rfind(QUEUE_DOT).ok_or_else(|| {
                SchedulerError::PlacementDenied(format!("queue path {name} is not under root"))
            })?;
            to_create.push(existing[idx + 1..].to_string());
            existing.truncate(idx);
            parent = self.get_queue(&existing);
        }
        let mut parent = parent.expect("loop ended on an existing queue");
        if to_create.is_empty() {
            return Ok(());
        }
        if parent.is_leaf() {
            return Err(SchedulerError::PlacementDenied(format!(
                "cannot create queues below leaf queue {existing}"
            )));
        }
        if !parent.check_submit_access(user) {
            debug!(queue = %existing, requested = name, "submit access denied on queue");
            return Err(SchedulerError::PlacementDenied(format!(
                "user {} has no submit access on queue {existing}",
                user.user
            )));
        }
        debug!(parent = %existing, full_path = name, "creating queues");
        while let Some(short_name) = to_create.pop() {
            let leaf = to_create.is_empty();
            parent = Queue::new_unmanaged(&parent, &short_name, leaf)?;
        }
        Ok(())
    }

    /// Remove empty draining and empty unmanaged queues.
    pub fn clean_queues(&self) {
        self.root.clean_subtree();
    }

    // ─── applications ───────────────────────────────────────────────────

    /// Place and admit a new application. On success the application is
    /// Accepted and attached to its leaf queue.
    pub fn add_application(&self, app: Arc<Application>) -> SchedulerResult<()> {
        {
            let inner = self.inner.read();
            if inner.applications.contains_key(&app.app_id) {
                return Err(SchedulerError::DuplicateEntity {
                    kind: "application",
                    id: app.app_id.clone(),
                });
            }
        }

        let decision = if self.placement.is_initialized() {
            self.placement.place_application(&app)?
        } else {
            PlacementDecision {
                queue_name: app.queue_name().to_lowercase(),
                create: false,
            }
        };
        if decision.queue_name.is_empty() {
            return Err(SchedulerError::PlacementDenied(format!(
                "no queue for application {}",
                app.app_id
            )));
        }

        let user = app.user();
        let queue = match self.get_queue(&decision.queue_name) {
            Some(queue) => {
                if !queue.is_leaf() {
                    return Err(SchedulerError::PlacementDenied(format!(
                        "queue {} is not a leaf queue",
                        decision.queue_name
                    )));
                }
                if !queue.check_submit_access(&user) {
                    return Err(SchedulerError::PlacementDenied(format!(
                        "user {} has no submit access on queue {}",
                        user.user, decision.queue_name
                    )));
                }
                queue
            }
            None => {
                if !decision.create {
                    return Err(SchedulerError::PlacementDenied(format!(
                        "queue {} does not exist",
                        decision.queue_name
                    )));
                }
                self.create_queue(&decision.queue_name, &user)?;
                self.get_queue(&decision.queue_name).ok_or_else(|| {
                    SchedulerError::PlacementDenied(format!(
                        "failed to create queue {}",
                        decision.queue_name
                    ))
                })?
            }
        };

        queue.add_application(app.clone())?;
        app.set_queue(queue);
        self.inner
            .write()
            .applications
            .insert(app.app_id.clone(), app.clone());

        // the application is accepted into the partition
        if let Err(err) = app.handle_event(ApplicationEvent::Run) {
            debug!(app_id = %app.app_id, %err, "acceptance event not applied");
        }
        Ok(())
    }

    /// Remove an application: all asks and reservations go with it.
    pub fn remove_application(&self, app_id: &str) -> SchedulerResult<Arc<Application>> {
        let app = {
            let mut inner = self.inner.write();
            let app = inner.applications.remove(app_id).ok_or_else(|| {
                SchedulerError::MissingEntity {
                    kind: "application",
                    id: app_id.to_string(),
                }
            })?;
            inner.reserved_apps.remove(app_id);
            app
        };
        let released = app.remove_ask("");
        if let Some(queue) = app.queue() {
            for _ in &released {
                queue.unreserve(app_id);
            }
            queue.remove_application(app_id);
        }
        debug!(app_id, queue = %app.queue_name(), "application removed from the scheduler");
        Ok(app)
    }

    pub fn get_application(&self, app_id: &str) -> Option<Arc<Application>> {
        self.inner.read().applications.get(app_id).cloned()
    }

    /// Remove one ask (or all asks for an empty key) from an application,
    /// keeping the reservation counters in step with any reservations the
    /// removal released.
    pub fn remove_ask(&self, app_id: &str, ask_key: &str) -> SchedulerResult<()> {
        let app = self.get_application(app_id).ok_or_else(|| {
            SchedulerError::MissingEntity {
                kind: "application",
                id: app_id.to_string(),
            }
        })?;
        let released = app.remove_ask(ask_key);
        if released.is_empty() {
            return Ok(());
        }
        if let Some(queue) = app.queue() {
            for _ in &released {
                queue.unreserve(app_id);
            }
        }
        Self::dec_reserved_count(
            &mut self.inner.write().reserved_apps,
            app_id,
            released.len(),
        );
        Ok(())
    }

    pub fn application_count(&self) -> usize {
        self.inner.read().applications.len()
    }

    // ─── nodes ──────────────────────────────────────────────────────────

    pub fn add_node(&self, node: Arc<Node>) -> SchedulerResult<()> {
        let mut inner = self.inner.write();
        if inner.nodes.contains_key(&node.node_id) {
            return Err(SchedulerError::DuplicateEntity {
                kind: "node",
                id: node.node_id.clone(),
            });
        }
        inner.nodes.insert(node.node_id.clone(), node);
        Ok(())
    }

    pub fn update_node(&self, node_id: &str, capacity: Resource, occupied: Resource) {
        match self.get_node(node_id) {
            Some(node) => node.update_from_report(capacity, occupied),
            None => {
                warn!(node_id, "node not found while attempting to update it");
            }
        }
    }

    /// Remove a node and release every reservation held on it, adjusting
    /// the reservation counters for the affected applications.
    pub fn remove_node(&self, node_id: &str) -> Option<Arc<Node>> {
        let (node, released) = {
            let mut inner = self.inner.write();
            let Some(node) = inner.nodes.remove(node_id) else {
                debug!(node_id, "node to be removed does not exist");
                return None;
            };
            let released: Vec<(crate::reservation::Reservation, Option<Arc<Application>>)> = node
                .reservations()
                .into_iter()
                .map(|r| {
                    let app = inner.applications.get(&r.app_id).cloned();
                    (r, app)
                })
                .collect();
            for (r, _) in &released {
                Self::dec_reserved_count(&mut inner.reserved_apps, &r.app_id, 1);
            }
            (node, released)
        };
        for (reservation, app) in released {
            // an application that is already gone drops with the node
            if let Some(app) = app {
                app.unreserve(node_id, &reservation.ask_key);
                if let Some(queue) = app.queue() {
                    queue.unreserve(&reservation.app_id);
                }
            }
        }
        node.remove_all_reservations();
        Some(node)
    }

    pub fn get_node(&self, node_id: &str) -> Option<Arc<Node>> {
        self.inner.read().nodes.get(node_id).cloned()
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().nodes.len()
    }

    /// Sum of all node capacities.
    pub fn total_partition_resource(&self) -> Resource {
        let inner = self.inner.read();
        let mut total = Resource::new();
        for node in inner.nodes.values() {
            total.add_to(&node.capacity());
        }
        total
    }

    /// Capacity not yet allocated or in flight anywhere in the partition.
    pub fn partition_available(&self) -> Resource {
        self.total_partition_resource()
            .sub(&self.root.allocated())
            .sub(&self.root.allocating())
    }

    // ─── allocation pass ────────────────────────────────────────────────

    /// Regular allocation descent. Lock free at this level; the queue walk
    /// takes the finer grained locks.
    pub fn try_allocate(&self) -> Option<SchedulingAllocation> {
        if !self.root.pending().strictly_greater_than_zero() {
            return None;
        }
        self.root.try_allocate(self)
    }

    /// Reserved allocation descent, attempted before the regular pass.
    pub fn try_reserved_allocate(&self) -> Option<SchedulingAllocation> {
        if self.inner.read().reserved_apps.is_empty() {
            return None;
        }
        self.root.try_reserved_allocate(self)
    }

    /// Apply an allocation decision to the partition. Returns true when
    /// the allocation must be handed to the cache as a proposal;
    /// reservation changes stay inside the scheduler and return false.
    pub fn allocate(&self, alloc: &SchedulingAllocation) -> bool {
        let inner = self.inner.read();
        let Some(app) = inner.applications.get(&alloc.ask.app_id).cloned() else {
            info!(app_id = %alloc.ask.app_id, "application was removed while allocating");
            return false;
        };
        // the reservation bookkeeping node may differ from the target
        let reservation_node_id = alloc.reservation_node_id().to_string();
        let Some(node) = inner.nodes.get(&reservation_node_id).cloned() else {
            info!(
                node_id = %reservation_node_id,
                app_id = %alloc.ask.app_id,
                "node was removed while allocating"
            );
            return false;
        };
        drop(inner);

        match alloc.result {
            AllocationResult::Reserved => {
                self.reserve(&app, &node, &alloc.ask.allocation_key);
                false
            }
            AllocationResult::Unreserved => {
                self.unreserve(&app, &node.node_id, &alloc.ask.allocation_key);
                false
            }
            AllocationResult::AllocatedReserved => {
                self.unreserve(&app, &node.node_id, &alloc.ask.allocation_key);
                info!(
                    app_id = %alloc.ask.app_id,
                    queue = %alloc.ask.queue_name,
                    allocation_key = %alloc.ask.allocation_key,
                    node_id = %alloc.node_id,
                    "scheduler allocation proposal"
                );
                true
            }
            AllocationResult::Allocated => {
                info!(
                    app_id = %alloc.ask.app_id,
                    queue = %alloc.ask.queue_name,
                    allocation_key = %alloc.ask.allocation_key,
                    node_id = %alloc.node_id,
                    "scheduler allocation proposal"
                );
                true
            }
        }
    }

    /// Cache verdict on a proposal. Unwinds the in-flight counters; a
    /// reject restores the ask repeat, a confirm applies the allocation.
    /// A confirm for an ask that no longer exists surfaces `stale-ask` so
    /// the cache can roll the allocation back.
    pub fn confirm_allocation(
        &self,
        proposal: &AllocationProposal,
        confirm: bool,
    ) -> SchedulerResult<()> {
        let (app, node) = {
            let inner = self.inner.read();
            let app = inner
                .applications
                .get(&proposal.app_id)
                .cloned()
                .ok_or_else(|| SchedulerError::MissingEntity {
                    kind: "application",
                    id: proposal.app_id.clone(),
                })?;
            let node = inner
                .nodes
                .get(&proposal.node_id)
                .cloned()
                .ok_or_else(|| SchedulerError::MissingEntity {
                    kind: "node",
                    id: proposal.node_id.clone(),
                })?;
            (app, node)
        };

        debug!(
            partition = %self.name,
            app_id = %proposal.app_id,
            node_id = %proposal.node_id,
            allocation_key = %proposal.allocation_key,
            confirm,
            "processing allocation proposal"
        );

        let delta = &proposal.resource;
        if !delta.is_zero() {
            app.dec_allocating(delta);
            if let Some(queue) = app.queue() {
                queue.dec_allocating(delta);
            }
            node.dec_allocating(delta);
        }

        if !confirm {
            // the repeat is added back so the ask is retried; a removed
            // ask needs no follow up
            match app.update_ask_repeat(&proposal.allocation_key, 1) {
                Ok(()) | Err(SchedulerError::MissingEntity { .. }) => {}
                Err(err) => return Err(err),
            }
            return Ok(());
        }

        if app.get_ask(&proposal.allocation_key).is_none() {
            // the ask was removed while the proposal was in flight: the
            // cache must remove the allocation it holds
            return Err(SchedulerError::StaleAsk {
                app_id: proposal.app_id.clone(),
                ask_key: proposal.allocation_key.clone(),
            });
        }

        node.add_allocation(delta);
        app.add_allocation(delta);
        if let Some(queue) = app.queue() {
            queue.inc_allocated(delta, true)?;
        }
        info!(
            app_id = %proposal.app_id,
            allocation_key = %proposal.allocation_key,
            node_id = %proposal.node_id,
            "allocation proposal confirmed"
        );
        Ok(())
    }

    /// Release a confirmed allocation, e.g. when the workload finished.
    pub fn release_allocation(
        &self,
        app_id: &str,
        node_id: &str,
        resource: &Resource,
    ) -> SchedulerResult<()> {
        let (app, node) = {
            let inner = self.inner.read();
            let app = inner.applications.get(app_id).cloned().ok_or_else(|| {
                SchedulerError::MissingEntity {
                    kind: "application",
                    id: app_id.to_string(),
                }
            })?;
            let node = inner.nodes.get(node_id).cloned().ok_or_else(|| {
                SchedulerError::MissingEntity {
                    kind: "node",
                    id: node_id.to_string(),
                }
            })?;
            (app, node)
        };
        node.remove_allocation(resource);
        app.remove_allocation(resource);
        if let Some(queue) = app.queue() {
            queue.dec_allocated(resource);
        }
        Ok(())
    }

    // ─── reservations ───────────────────────────────────────────────────

    fn reserve(&self, app: &Arc<Application>, node: &Arc<Node>, ask_key: &str) {
        if app.is_reserved_on_node(&node.node_id) {
            info!(
                app_id = %app.app_id,
                node_id = %node.node_id,
                "application is already reserved on node"
            );
            return;
        }
        if let Err(err) = app.reserve(node, ask_key) {
            debug!(%err, "failed to handle reservation");
            return;
        }
        if let Some(queue) = app.queue() {
            queue.reserve(&app.app_id);
        }
        *self
            .inner
            .write()
            .reserved_apps
            .entry(app.app_id.clone())
            .or_insert(0) += 1;
        info!(
            app_id = %app.app_id,
            allocation_key = ask_key,
            node_id = %node.node_id,
            "allocation ask is reserved"
        );
    }

    fn unreserve(&self, app: &Arc<Application>, node_id: &str, ask_key: &str) {
        {
            let inner = self.inner.read();
            if inner.reserved_apps.get(&app.app_id).copied().unwrap_or(0) == 0 {
                info!(app_id = %app.app_id, "application is not reserved in partition");
                return;
            }
        }
        if !app.unreserve(node_id, ask_key) {
            info!(
                app_id = %app.app_id,
                node_id,
                "failed to unreserve, reservation not found on application"
            );
            return;
        }
        if let Some(queue) = app.queue() {
            queue.unreserve(&app.app_id);
        }
        Self::dec_reserved_count(
            &mut self.inner.write().reserved_apps,
            &app.app_id,
            1,
        );
        info!(
            app_id = %app.app_id,
            allocation_key = ask_key,
            node_id,
            "allocation ask is unreserved"
        );
    }

    fn dec_reserved_count(reserved: &mut HashMap<String, usize>, app_id: &str, count: usize) {
        if let Some(current) = reserved.get_mut(app_id) {
            if *current <= count {
                reserved.remove(app_id);
            } else {
                *current -= count;
            }
        }
    }

    /// Copy of the reservation counters, for tests and inspection.
    pub fn reservations(&self) -> HashMap<String, usize> {
        self.inner.read().reserved_apps.clone()
    }

    // ─── configuration reload ───────────────────────────────────────────

    /// Apply a reloaded partition configuration: refresh placement rules,
    /// update managed queues in place, create new ones, and mark managed
    /// queues that disappeared for removal.
    pub fn update_config(&self, cfg: &PartitionConfig) -> SchedulerResult<()> {
        if let Err(err) = self.placement.update_rules(&cfg.placement_rules) {
            info!(%err, "new placement rules not activated, config reload failed");
            return Err(err);
        }
        *self.node_sort_policy.write() =
            NodeSortPolicy::from_config(&cfg.node_sort_policy.policy_type);
        self.preemption_enabled
            .store(cfg.preemption.enabled, Ordering::Relaxed);

        let root_cfg = cfg.queues.first().ok_or_else(|| {
            SchedulerError::InvalidArgument(format!(
                "partition {} has no queue hierarchy",
                cfg.name
            ))
        })?;
        Self::sync_queue(root_cfg, &self.root)?;
        self.root.add_limits(&cfg.limits)?;
        Ok(())
    }

    fn sync_queue(cfg: &QueueConfig, queue: &Arc<Queue>) -> SchedulerResult<()> {
        queue.apply_config(cfg)?;
        let configured: HashSet<String> =
            cfg.queues.iter().map(|c| c.name.to_lowercase()).collect();
        for child_cfg in &cfg.queues {
            match queue.get_child(&child_cfg.name.to_lowercase()) {
                Some(child) => Self::sync_queue(child_cfg, &child)?,
                None => {
                    Queue::from_config(child_cfg, Some(queue))?;
                }
            }
        }
        for child in queue.children() {
            if child.is_managed() && !configured.contains(child.short_name()) {
                info!(queue = %child.name(), "queue removed from configuration, draining");
                child.mark_for_removal();
            }
        }
        Ok(())
    }
}

impl AllocationContext for PartitionContext {
    fn node_iterator(&self) -> Option<Box<dyn NodeIterator>> {
        let mut nodes: Vec<Arc<Node>> = {
            let inner = self.inner.read();
            inner
                .nodes
                .values()
                .filter(|n| n.is_schedulable() && !n.is_reserved())
                .cloned()
                .collect()
        };
        if nodes.is_empty() {
            return None;
        }
        let policy = *self.node_sort_policy.read();
        match policy {
            NodeSortPolicy::Undefined => Some(Box::new(RoundRobinNodeIterator::new(nodes))),
            _ => {
                policy::sort_nodes(&mut nodes, policy);
                Some(Box::new(DefaultNodeIterator::new(nodes)))
            }
        }
    }

    fn get_node(&self, node_id: &str) -> Option<Arc<Node>> {
        self.inner.read().nodes.get(node_id).cloned()
    }

    fn predicate_plugin(&self) -> Option<Arc<dyn PredicatePlugin>> {
        self.plugin.read().clone()
    }

    fn preemption_phase(&self) -> bool {
        // preemption is bookkeeping only for now
        false
    }
}
