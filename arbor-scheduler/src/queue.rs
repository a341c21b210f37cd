// Copyright 2025 The Arbor Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The hierarchical queue tree.
//!
//! Each queue tracks guaranteed/max quotas next to the confirmed
//! (allocated), in-flight (allocating), and pending totals. Counters
//! propagate root-ward; quota checks walk the same chain. Queues are owned
//! by their parent's children map, the parent pointer is weak.
//!
//! Lock order: parent before child; queue walks to the root are made as a
//! sequence of independent lock acquisitions, never nested.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

use arbor_common::acl::Acl;
use arbor_common::config::{
    LimitConfig, QueueConfig, PROP_APPLICATION_SORT_POLICY, PROP_APPLICATION_SORT_PRIORITY,
    PROP_TIMEOUT_STARTING, PROP_TIMEOUT_WAITING, QUEUE_DOT, ROOT_QUEUE,
};
use arbor_common::resources::Resource;
use arbor_common::security::UserGroup;
use arbor_util::sorted_linked_map::SortedLinkedMap;

use crate::allocation::{AllocationContext, SchedulingAllocation};
use crate::application::Application;
use crate::error::{SchedulerError, SchedulerResult};
use crate::policy::{self, AppSortPolicy};

/// Default before a Starting application is forced to Running.
pub const DEFAULT_STARTING_TIMEOUT: Duration = Duration::from_secs(300);
/// Default before a Waiting application completes.
pub const DEFAULT_WAITING_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Active,
    Draining,
    Stopped,
}

/// A user or group limit applied at this queue level.
#[derive(Debug, Clone)]
pub struct QueueLimit {
    users: Vec<String>,
    groups: Vec<String>,
    max_resources: Resource,
    max_applications: u64,
}

impl QueueLimit {
    pub fn from_config(cfg: &LimitConfig) -> SchedulerResult<Self> {
        Ok(Self {
            users: cfg.users.clone(),
            groups: cfg.groups.clone(),
            max_resources: Resource::from_config_map(&cfg.max_resources)?,
            max_applications: cfg.max_applications,
        })
    }

    fn applies_to(&self, user: &UserGroup) -> bool {
        if self.users.iter().any(|u| u == "*" || *u == user.user) {
            return true;
        }
        self.groups
            .iter()
            .any(|g| g == "*" || user.is_member(g))
    }
}

pub struct Queue {
    /// Fully qualified lowercase name, `root.a.b`.
    qualified_name: String,
    short_name: String,
    managed: bool,
    leaf: bool,
    parent: Weak<Queue>,
    inner: RwLock<QueueInner>,
}

struct QueueInner {
    state: QueueState,
    children: SortedLinkedMap<String, Arc<Queue>>,
    applications: HashMap<String, Arc<Application>>,
    /// Reservation count per application in this queue.
    reservations: HashMap<String, usize>,
    guaranteed: Resource,
    /// Types absent from max are unbounded.
    max: Resource,
    allocated: Resource,
    allocating: Resource,
    pending: Resource,
    max_applications: u64,
    submit_acl: Acl,
    admin_acl: Acl,
    properties: HashMap<String, String>,
    sort_policy: AppSortPolicy,
    priority_ordering: bool,
    starting_timeout: Duration,
    waiting_timeout: Duration,
    limits: Vec<QueueLimit>,
}

impl Queue {
    /// Build a managed queue (and its subtree) from configuration.
    pub fn from_config(
        cfg: &QueueConfig,
        parent: Option<&Arc<Queue>>,
    ) -> SchedulerResult<Arc<Queue>> {
        let short_name = cfg.name.to_lowercase();
        let qualified_name = match parent {
            Some(p) => format!("{}{}{}", p.name(), QUEUE_DOT, short_name),
            None => short_name.clone(),
        };
        let is_root = parent.is_none();
        if is_root && short_name != ROOT_QUEUE {
            return Err(SchedulerError::InvalidArgument(format!(
                "hierarchy must start at '{ROOT_QUEUE}', got '{short_name}'"
            )));
        }
        let leaf = !cfg.parent && cfg.queues.is_empty();

        // children inherit the parent properties, own values win
        let mut properties = parent
            .map(|p| p.properties())
            .unwrap_or_default();
        properties.extend(cfg.properties.clone());

        // an unset ACL grants nothing here; the walk up decides
        let submit_acl = Acl::parse(&cfg.submit_acl)?;
        let admin_acl = Acl::parse(&cfg.admin_acl)?;

        let mut limits = Vec::with_capacity(cfg.limits.len());
        for limit in &cfg.limits {
            limits.push(QueueLimit::from_config(limit)?);
        }

        let queue = Arc::new(Queue {
            qualified_name,
            short_name,
            managed: true,
            leaf,
            parent: parent.map(Arc::downgrade).unwrap_or_default(),
            inner: RwLock::new(QueueInner {
                state: QueueState::Active,
                children: SortedLinkedMap::new(None, None),
                applications: HashMap::new(),
                reservations: HashMap::new(),
                guaranteed: Resource::from_config_map(&cfg.resources.guaranteed)?,
                max: Resource::from_config_map(&cfg.resources.max)?,
                allocated: Resource::new(),
                allocating: Resource::new(),
                pending: Resource::new(),
                max_applications: cfg.max_applications,
                submit_acl,
                admin_acl,
                sort_policy: sort_policy_from(&properties),
                priority_ordering: priority_ordering_from(&properties),
                starting_timeout: timeout_from(&properties, PROP_TIMEOUT_STARTING)
                    .unwrap_or(DEFAULT_STARTING_TIMEOUT),
                waiting_timeout: timeout_from(&properties, PROP_TIMEOUT_WAITING)
                    .unwrap_or(DEFAULT_WAITING_TIMEOUT),
                properties,
                limits,
            }),
        });
        if let Some(parent) = parent {
            parent.add_child(queue.clone())?;
        }
        for child in &cfg.queues {
            Self::from_config(child, Some(&queue))?;
        }
        Ok(queue)
    }

    /// Create an unmanaged queue under an existing parent. Placement rules
    /// use this; the queue inherits the parent's properties and carries no
    /// quotas or ACLs of its own.
    pub fn new_unmanaged(
        parent: &Arc<Queue>,
        short_name: &str,
        leaf: bool,
    ) -> SchedulerResult<Arc<Queue>> {
        let short_name = short_name.to_lowercase();
        let properties = parent.properties();
        let queue = Arc::new(Queue {
            qualified_name: format!("{}{}{}", parent.name(), QUEUE_DOT, short_name),
            short_name,
            managed: false,
            leaf,
            parent: Arc::downgrade(parent),
            inner: RwLock::new(QueueInner {
                state: QueueState::Active,
                children: SortedLinkedMap::new(None, None),
                applications: HashMap::new(),
                reservations: HashMap::new(),
                guaranteed: Resource::new(),
                max: Resource::new(),
                allocated: Resource::new(),
                allocating: Resource::new(),
                pending: Resource::new(),
                max_applications: 0,
                submit_acl: Acl::default(),
                admin_acl: Acl::default(),
                sort_policy: sort_policy_from(&properties),
                priority_ordering: priority_ordering_from(&properties),
                starting_timeout: timeout_from(&properties, PROP_TIMEOUT_STARTING)
                    .unwrap_or(DEFAULT_STARTING_TIMEOUT),
                waiting_timeout: timeout_from(&properties, PROP_TIMEOUT_WAITING)
                    .unwrap_or(DEFAULT_WAITING_TIMEOUT),
                properties,
                limits: Vec::new(),
            }),
        });
        parent.add_child(queue.clone())?;
        Ok(queue)
    }

    /// Refresh a managed queue from a reloaded configuration. Structure
    /// (children) is handled by the partition; this updates the local
    /// settings and reactivates a draining queue that reappeared.
    pub fn apply_config(&self, cfg: &QueueConfig) -> SchedulerResult<()> {
        let guaranteed = Resource::from_config_map(&cfg.resources.guaranteed)?;
        let max = Resource::from_config_map(&cfg.resources.max)?;
        let submit_acl = Acl::parse(&cfg.submit_acl)?;
        let admin_acl = Acl::parse(&cfg.admin_acl)?;
        let mut limits = Vec::with_capacity(cfg.limits.len());
        for limit in &cfg.limits {
            limits.push(QueueLimit::from_config(limit)?);
        }

        let mut inner = self.inner.write();
        inner.guaranteed = guaranteed;
        inner.max = max;
        inner.max_applications = cfg.max_applications;
        inner.submit_acl = submit_acl;
        inner.admin_acl = admin_acl;
        inner.limits = limits;
        inner.properties.extend(cfg.properties.clone());
        inner.sort_policy = sort_policy_from(&inner.properties);
        inner.priority_ordering = priority_ordering_from(&inner.properties);
        if let Some(t) = timeout_from(&inner.properties, PROP_TIMEOUT_STARTING) {
            inner.starting_timeout = t;
        }
        if let Some(t) = timeout_from(&inner.properties, PROP_TIMEOUT_WAITING) {
            inner.waiting_timeout = t;
        }
        inner.state = QueueState::Active;
        Ok(())
    }

    /// Append limits defined above the queue tree, e.g. partition-wide
    /// limits that land on the root.
    pub fn add_limits(&self, configs: &[LimitConfig]) -> SchedulerResult<()> {
        let mut parsed = Vec::with_capacity(configs.len());
        for cfg in configs {
            parsed.push(QueueLimit::from_config(cfg)?);
        }
        self.inner.write().limits.extend(parsed);
        Ok(())
    }

    // ─── identity & structure ───────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.qualified_name
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn is_leaf(&self) -> bool {
        self.leaf
    }

    pub fn is_managed(&self) -> bool {
        self.managed
    }

    pub fn parent(&self) -> Option<Arc<Queue>> {
        self.parent.upgrade()
    }

    pub fn state(&self) -> QueueState {
        self.inner.read().state
    }

    pub fn is_draining(&self) -> bool {
        self.inner.read().state == QueueState::Draining
    }

    /// A stopped queue takes no part in scheduling.
    pub fn is_schedulable(&self) -> bool {
        self.inner.read().state != QueueState::Stopped
    }

    pub fn stop(&self) {
        self.inner.write().state = QueueState::Stopped;
    }

    fn add_child(&self, child: Arc<Queue>) -> SchedulerResult<()> {
        if self.leaf {
            return Err(SchedulerError::InvalidArgument(format!(
                "leaf queue {} cannot have children",
                self.qualified_name
            )));
        }
        let mut inner = self.inner.write();
        if inner.children.contains_key(&child.short_name().to_string()) {
            return Err(SchedulerError::DuplicateEntity {
                kind: "queue",
                id: child.name().to_string(),
            });
        }
        inner.children.put(child.short_name().to_string(), child);
        Ok(())
    }

    pub fn get_child(&self, short_name: &str) -> Option<Arc<Queue>> {
        self.inner
            .read()
            .children
            .get(&short_name.to_lowercase())
            .cloned()
    }

    /// Children in configuration order.
    pub fn children(&self) -> Vec<Arc<Queue>> {
        self.inner.read().children.values().cloned().collect()
    }

    pub fn has_children(&self) -> bool {
        !self.inner.read().children.is_empty()
    }

    /// Mark this queue and all descendants for removal. Only meaningful
    /// for managed queues; unmanaged queues disappear when they empty out.
    pub fn mark_for_removal(&self) {
        let children = {
            let mut inner = self.inner.write();
            inner.state = QueueState::Draining;
            inner.children.values().cloned().collect::<Vec<_>>()
        };
        for child in children {
            child.mark_for_removal();
        }
    }

    /// True when the queue holds nothing that blocks removal.
    pub fn is_empty(&self) -> bool {
        let inner = self.inner.read();
        inner.children.is_empty() && inner.applications.is_empty() && inner.allocated.is_zero()
    }

    /// Detach from the parent iff empty and the state allows it: managed
    /// queues must be draining first, unmanaged queues go at any time.
    pub fn try_remove(&self) -> bool {
        if !self.is_empty() {
            return false;
        }
        if self.managed && !self.is_draining() {
            return false;
        }
        let Some(parent) = self.parent.upgrade() else {
            return false; // never remove the root
        };
        let removed = parent
            .inner
            .write()
            .children
            .remove(&self.short_name)
            .is_some();
        if removed {
            self.inner.write().state = QueueState::Stopped;
            debug!(queue = %self.qualified_name, "queue removed");
        }
        removed
    }

    /// Remove empty draining and empty unmanaged queues below this one.
    pub fn clean_subtree(&self) {
        for child in self.children() {
            child.clean_subtree();
            let removable = child.is_empty()
                && (!child.is_managed() || child.is_draining());
            if removable {
                child.try_remove();
            }
        }
    }

    // ─── settings ───────────────────────────────────────────────────────

    pub fn properties(&self) -> HashMap<String, String> {
        self.inner.read().properties.clone()
    }

    pub fn sort_policy(&self) -> AppSortPolicy {
        self.inner.read().sort_policy
    }

    pub fn priority_ordering(&self) -> bool {
        self.inner.read().priority_ordering
    }

    pub fn starting_timeout(&self) -> Duration {
        self.inner.read().starting_timeout
    }

    pub fn waiting_timeout(&self) -> Duration {
        self.inner.read().waiting_timeout
    }

    pub fn guaranteed(&self) -> Resource {
        self.inner.read().guaranteed.clone()
    }

    pub fn max_resource(&self) -> Resource {
        self.inner.read().max.clone()
    }

    pub fn pending(&self) -> Resource {
        self.inner.read().pending.clone()
    }

    pub fn allocated(&self) -> Resource {
        self.inner.read().allocated.clone()
    }

    pub fn allocating(&self) -> Resource {
        self.inner.read().allocating.clone()
    }

    // ─── ACLs ───────────────────────────────────────────────────────────

    /// Walk up the tree until an ACL grants the user submit access.
    pub fn check_submit_access(&self, user: &UserGroup) -> bool {
        if self.inner.read().submit_acl.allow_access(user) {
            return true;
        }
        match self.parent.upgrade() {
            Some(parent) => parent.check_submit_access(user),
            None => false,
        }
    }

    /// Walk up the tree until an ACL grants the user admin access.
    pub fn check_admin_access(&self, user: &UserGroup) -> bool {
        if self.inner.read().admin_acl.allow_access(user) {
            return true;
        }
        match self.parent.upgrade() {
            Some(parent) => parent.check_admin_access(user),
            None => false,
        }
    }

    // ─── applications ───────────────────────────────────────────────────

    /// Add an application to this leaf queue. Fails on a draining queue,
    /// a full queue, or a breached user application limit.
    pub fn add_application(&self, app: Arc<Application>) -> SchedulerResult<()> {
        if !self.leaf {
            return Err(SchedulerError::InvalidArgument(format!(
                "queue {} is not a leaf queue",
                self.qualified_name
            )));
        }
        if !self.check_submit_limits(&app.user()) {
            return Err(SchedulerError::PlacementDenied(format!(
                "user {} over application limit on queue {}",
                app.user().user,
                self.qualified_name
            )));
        }
        let pending = app.pending();
        {
            let mut inner = self.inner.write();
            if inner.state != QueueState::Active {
                return Err(SchedulerError::PlacementDenied(format!(
                    "queue {} does not accept new applications",
                    self.qualified_name
                )));
            }
            if inner.max_applications > 0
                && inner.applications.len() as u64 >= inner.max_applications
            {
                return Err(SchedulerError::QuotaExceeded {
                    queue: self.qualified_name.clone(),
                    requested: format!("application {}", app.app_id),
                });
            }
            if inner.applications.contains_key(&app.app_id) {
                return Err(SchedulerError::DuplicateEntity {
                    kind: "application",
                    id: app.app_id.clone(),
                });
            }
            inner.applications.insert(app.app_id.clone(), app.clone());
        }
        if pending.strictly_greater_than_zero() {
            self.adjust_pending(&pending);
        }
        Ok(())
    }

    /// Remove the application and drop its remaining pending share from
    /// the tree. Empty unmanaged queues remove themselves afterwards.
    pub fn remove_application(&self, app_id: &str) -> Option<Arc<Application>> {
        let app = self.inner.write().applications.remove(app_id);
        if let Some(app) = &app {
            let pending = app.pending();
            if pending.strictly_greater_than_zero() {
                self.dec_pending(&pending);
            }
            self.inner.write().reservations.remove(app_id);
            if !self.managed && self.is_empty() {
                self.try_remove();
            }
        }
        app
    }

    pub fn applications(&self) -> Vec<Arc<Application>> {
        self.inner.read().applications.values().cloned().collect()
    }

    pub fn application_count(&self) -> usize {
        self.inner.read().applications.len()
    }

    // ─── reservations ───────────────────────────────────────────────────

    pub fn reserve(&self, app_id: &str) {
        *self
            .inner
            .write()
            .reservations
            .entry(app_id.to_string())
            .or_insert(0) += 1;
    }

    pub fn unreserve(&self, app_id: &str) {
        let mut inner = self.inner.write();
        if let Some(count) = inner.reservations.get_mut(app_id) {
            *count -= 1;
            if *count == 0 {
                inner.reservations.remove(app_id);
            }
        }
    }

    pub fn reserved_apps(&self) -> Vec<String> {
        self.inner.read().reservations.keys().cloned().collect()
    }

    // ─── resource tracking ──────────────────────────────────────────────

    /// Apply a signed pending delta here and on every ancestor.
    pub fn adjust_pending(&self, delta: &Resource) {
        self.apply_pending_delta(delta);
        for q in self.ancestors() {
            q.apply_pending_delta(delta);
        }
    }

    /// Reduce pending here and on every ancestor; drift clamps at zero.
    pub fn dec_pending(&self, delta: &Resource) {
        self.adjust_pending(&delta.multiply(-1));
    }

    fn apply_pending_delta(&self, delta: &Resource) {
        let mut inner = self.inner.write();
        inner.pending.add_to(delta);
        clamp_negative(&mut inner.pending, &self.qualified_name, "pending");
    }

    /// Record in-flight resources here and on every ancestor.
    pub fn inc_allocating(&self, delta: &Resource) {
        self.inner.write().allocating.add_to(delta);
        for q in self.ancestors() {
            q.inner.write().allocating.add_to(delta);
        }
    }

    /// Release in-flight resources; drift clamps at zero and is logged.
    pub fn dec_allocating(&self, delta: &Resource) {
        self.apply_allocating_dec(delta);
        for q in self.ancestors() {
            q.apply_allocating_dec(delta);
        }
    }

    fn apply_allocating_dec(&self, delta: &Resource) {
        let mut inner = self.inner.write();
        inner.allocating.sub_from(delta);
        clamp_negative(&mut inner.allocating, &self.qualified_name, "allocating");
    }

    /// Record a confirmed allocation up the tree. Without `force` the
    /// increment fails when any ancestor's max would be breached and no
    /// counter is changed.
    pub fn inc_allocated(&self, delta: &Resource, force: bool) -> SchedulerResult<()> {
        let ancestors = self.ancestors();
        if !force {
            self.check_allocated_fits(delta)?;
            for q in &ancestors {
                q.check_allocated_fits(delta)?;
            }
        }
        self.inner.write().allocated.add_to(delta);
        for q in &ancestors {
            q.inner.write().allocated.add_to(delta);
        }
        Ok(())
    }

    fn check_allocated_fits(&self, delta: &Resource) -> SchedulerResult<()> {
        let inner = self.inner.read();
        if !inner.max.fit_in_max(&inner.allocated.add(delta)) {
            return Err(SchedulerError::QuotaExceeded {
                queue: self.qualified_name.clone(),
                requested: delta.to_string(),
            });
        }
        Ok(())
    }

    /// Release a confirmed allocation up the tree.
    pub fn dec_allocated(&self, delta: &Resource) {
        self.apply_allocated_dec(delta);
        for q in self.ancestors() {
            q.apply_allocated_dec(delta);
        }
    }

    fn apply_allocated_dec(&self, delta: &Resource) {
        let mut inner = self.inner.write();
        inner.allocated.sub_from(delta);
        clamp_negative(&mut inner.allocated, &self.qualified_name, "allocated");
    }

    /// The remaining room below every max on the path to the root. Types
    /// not bounded anywhere are absent, meaning unlimited.
    pub fn get_head_room(&self) -> Resource {
        let mut merged: HashMap<String, i64> = HashMap::new();
        self.merge_head_room(&mut merged);
        for q in self.ancestors() {
            q.merge_head_room(&mut merged);
        }
        Resource::from_map(merged)
    }

    fn merge_head_room(&self, merged: &mut HashMap<String, i64>) {
        let inner = self.inner.read();
        for (name, max_value) in inner.max.iter() {
            let room = max_value - inner.allocated.get(name) - inner.allocating.get(name);
            merged
                .entry(name.to_string())
                .and_modify(|v| *v = (*v).min(room))
                .or_insert(room);
        }
    }

    // ─── user and group limits ──────────────────────────────────────────

    /// Check the running-application limits for the user on this queue and
    /// every ancestor, counting the application about to be added.
    pub fn check_submit_limits(&self, user: &UserGroup) -> bool {
        if !self.check_submit_limit_level(user) {
            return false;
        }
        self.ancestors()
            .iter()
            .all(|q| q.check_submit_limit_level(user))
    }

    fn check_submit_limit_level(&self, user: &UserGroup) -> bool {
        let limits = self.inner.read().limits.clone();
        for limit in limits.iter().filter(|l| l.applies_to(user)) {
            if limit.max_applications > 0 {
                let count = self.count_user_apps(user);
                if count as u64 + 1 > limit.max_applications {
                    return false;
                }
            }
        }
        true
    }

    /// Check the resource limits for the user on this queue and every
    /// ancestor, as if `additional` were already allocated.
    pub fn check_allocation_limits(&self, user: &UserGroup, additional: &Resource) -> bool {
        if !self.check_allocation_limit_level(user, additional) {
            return false;
        }
        self.ancestors()
            .iter()
            .all(|q| q.check_allocation_limit_level(user, additional))
    }

    fn check_allocation_limit_level(&self, user: &UserGroup, additional: &Resource) -> bool {
        let limits = self.inner.read().limits.clone();
        for limit in limits.iter().filter(|l| l.applies_to(user)) {
            if !limit.max_resources.is_empty() {
                let usage = self.user_resource_usage(user).add(additional);
                if !limit.max_resources.fit_in_max(&usage) {
                    return false;
                }
            }
        }
        true
    }

    fn count_user_apps(&self, user: &UserGroup) -> usize {
        if self.leaf {
            let inner = self.inner.read();
            inner
                .applications
                .values()
                .filter(|app| {
                    app.user().user == user.user && !app.state().is_terminal()
                })
                .count()
        } else {
            self.children()
                .iter()
                .map(|child| child.count_user_apps(user))
                .sum()
        }
    }

    fn user_resource_usage(&self, user: &UserGroup) -> Resource {
        if self.leaf {
            let apps: Vec<Arc<Application>> = {
                let inner = self.inner.read();
                inner
                    .applications
                    .values()
                    .filter(|app| app.user().user == user.user)
                    .cloned()
                    .collect()
            };
            let mut usage = Resource::new();
            for app in apps {
                usage.add_to(&app.allocated());
                usage.add_to(&app.allocating());
            }
            usage
        } else {
            let mut usage = Resource::new();
            for child in self.children() {
                usage.add_to(&child.user_resource_usage(user));
            }
            usage
        }
    }

    // ─── allocation descent ─────────────────────────────────────────────

    /// Recursive allocation: parents recurse into their policy-sorted
    /// children, leaves walk their candidate applications.
    pub fn try_allocate(
        self: &Arc<Self>,
        ctx: &dyn AllocationContext,
    ) -> Option<SchedulingAllocation> {
        if !self.pending().strictly_greater_than_zero() {
            return None;
        }
        if self.leaf {
            let headroom = self.get_head_room();
            let (policy, guaranteed) = {
                let inner = self.inner.read();
                (inner.sort_policy, inner.guaranteed.clone())
            };
            let apps = policy::candidates(self.applications(), policy, &guaranteed);
            for app in apps {
                if let Some(alloc) = app.try_allocate(&headroom, ctx) {
                    return Some(alloc);
                }
            }
            None
        } else {
            for child in self.sorted_children() {
                if !child.is_schedulable() {
                    continue;
                }
                if let Some(alloc) = child.try_allocate(ctx) {
                    return Some(alloc);
                }
            }
            None
        }
    }

    /// Recursive reserved-allocation: only applications holding
    /// reservations are attempted.
    pub fn try_reserved_allocate(
        self: &Arc<Self>,
        ctx: &dyn AllocationContext,
    ) -> Option<SchedulingAllocation> {
        if self.leaf {
            let reserved_ids = self.reserved_apps();
            if reserved_ids.is_empty() {
                return None;
            }
            let headroom = self.get_head_room();
            let apps: Vec<Arc<Application>> = {
                let inner = self.inner.read();
                reserved_ids
                    .iter()
                    .filter_map(|id| inner.applications.get(id).cloned())
                    .collect()
            };
            for app in apps {
                if let Some(alloc) = app.try_reserved_allocate(&headroom, ctx) {
                    return Some(alloc);
                }
            }
            None
        } else {
            for child in self.sorted_children() {
                if !child.is_schedulable() {
                    continue;
                }
                if let Some(alloc) = child.try_reserved_allocate(ctx) {
                    return Some(alloc);
                }
            }
            None
        }
    }

    /// Children ordered for the descent: fair share ascending under the
    /// fair policy, configuration order otherwise. The sort is stable so
    /// equal shares keep the configured order.
    fn sorted_children(&self) -> Vec<Arc<Queue>> {
        let (policy, mut children) = {
            let inner = self.inner.read();
            (
                inner.sort_policy,
                inner.children.values().cloned().collect::<Vec<_>>(),
            )
        };
        if policy == AppSortPolicy::Fair {
            children.sort_by(|l, r| {
                arbor_common::resources::comp_usage_ratio_separately(
                    &l.allocated(),
                    &l.guaranteed(),
                    &r.allocated(),
                    &r.guaranteed(),
                )
            });
        }
        children
    }

    /// All ancestors bottom-up, excluding this queue itself.
    fn ancestors(&self) -> Vec<Arc<Queue>> {
        let mut out = Vec::new();
        let mut parent = self.parent.upgrade();
        while let Some(q) = parent {
            parent = q.parent.upgrade();
            out.push(q);
        }
        out
    }
}

/// Clamp negative components at zero and warn; drift must not propagate.
fn clamp_negative(resource: &mut Resource, queue: &str, ledger: &str) {
    let negatives: Vec<String> = resource
        .iter()
        .filter(|(_, v)| *v < 0)
        .map(|(n, _)| n.to_string())
        .collect();
    if !negatives.is_empty() {
        warn!(queue, ledger, types = ?negatives, "queue resource went negative");
        for name in negatives {
            resource.set(name, 0);
        }
    }
}

fn sort_policy_from(properties: &HashMap<String, String>) -> AppSortPolicy {
    properties
        .get(PROP_APPLICATION_SORT_POLICY)
        .map(|v| AppSortPolicy::from_property(v))
        .unwrap_or_default()
}

fn priority_ordering_from(properties: &HashMap<String, String>) -> bool {
    properties
        .get(PROP_APPLICATION_SORT_PRIORITY)
        .map(|v| !v.eq_ignore_ascii_case("disabled"))
        .unwrap_or(true)
}

fn timeout_from(properties: &HashMap<String, String>, key: &str) -> Option<Duration> {
    let value = properties.get(key)?;
    match value.parse::<u64>() {
        Ok(seconds) => Some(Duration::from_secs(seconds)),
        Err(_) => {
            warn!(key, value, "ignoring unparsable queue timeout property");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::AllocationAsk;
    use arbor_common::config::SchedulerConfig;

    fn res(pairs: &[(&str, i64)]) -> Resource {
        let mut r = Resource::new();
        for (name, value) in pairs {
            r.set(*name, *value);
        }
        r
    }

    fn build_tree(yaml: &str) -> Arc<Queue> {
        let conf = SchedulerConfig::load_from_str(yaml).unwrap();
        Queue::from_config(&conf.partitions[0].queues[0], None).unwrap()
    }

    const TREE: &str = r#"
partitions:
  - name: default
    queues:
      - name: root
        submitacl: "*"
        queues:
          - name: tenants
            parent: true
            resources:
              max:
                memory: "200"
            queues:
              - name: small
                resources:
                  guaranteed:
                    memory: "10"
                  max:
                    memory: "50"
              - name: large
                resources:
                  guaranteed:
                    memory: "100"
"#;

    #[test]
    fn test_tree_structure() {
        let root = build_tree(TREE);
        assert_eq!(root.name(), "root");
        assert!(!root.is_leaf());

        let tenants = root.get_child("tenants").unwrap();
        assert_eq!(tenants.name(), "root.tenants");
        assert!(!tenants.is_leaf());
        assert!(tenants.is_managed());

        let small = tenants.get_child("small").unwrap();
        assert!(small.is_leaf());
        assert_eq!(small.parent().unwrap().name(), "root.tenants");
        assert_eq!(small.guaranteed().get("memory"), 10);
    }

    #[test]
    fn test_pending_propagates_to_root() {
        let root = build_tree(TREE);
        let small = root.get_child("tenants").unwrap().get_child("small").unwrap();

        small.adjust_pending(&res(&[("memory", 30)]));
        assert_eq!(small.pending().get("memory"), 30);
        assert_eq!(root.pending().get("memory"), 30);

        small.dec_pending(&res(&[("memory", 10)]));
        assert_eq!(root.pending().get("memory"), 20);

        // drift clamps at zero
        small.dec_pending(&res(&[("memory", 100)]));
        assert_eq!(small.pending().get("memory"), 0);
        assert_eq!(root.pending().get("memory"), 0);
    }

    #[test]
    fn test_allocated_quota_enforcement() {
        let root = build_tree(TREE);
        let small = root.get_child("tenants").unwrap().get_child("small").unwrap();

        small.inc_allocated(&res(&[("memory", 40)]), false).unwrap();
        // 40 + 20 breaches small's max of 50
        let err = small.inc_allocated(&res(&[("memory", 20)]), false);
        assert!(matches!(err, Err(SchedulerError::QuotaExceeded { .. })));
        // nothing was applied on the failed increment
        assert_eq!(small.allocated().get("memory"), 40);
        assert_eq!(root.allocated().get("memory"), 40);

        // forced increments skip the check
        small.inc_allocated(&res(&[("memory", 20)]), true).unwrap();
        assert_eq!(small.allocated().get("memory"), 60);

        small.dec_allocated(&res(&[("memory", 60)]));
        assert_eq!(root.allocated().get("memory"), 0);
    }

    #[test]
    fn test_head_room_combines_ancestors() {
        let root = build_tree(TREE);
        let tenants = root.get_child("tenants").unwrap();
        let small = tenants.get_child("small").unwrap();
        let large = tenants.get_child("large").unwrap();

        // large has no own max: only the parent's 200 bounds it
        large.inc_allocated(&res(&[("memory", 120)]), false).unwrap();
        assert_eq!(large.get_head_room().get("memory"), 80);

        // small is bounded by its own max (50) and the parent remainder
        let headroom = small.get_head_room();
        assert_eq!(headroom.get("memory"), 50);
        assert!(headroom.fit_in_max(&res(&[("memory", 50), ("vcores", 4)])));
        assert!(!headroom.fit_in_max(&res(&[("memory", 51)])));
    }

    #[test]
    fn test_acl_walk() {
        let yaml = r#"
partitions:
  - name: default
    queues:
      - name: root
        submitacl: "admin"
        queues:
          - name: open
            submitacl: "*"
          - name: closed
"#;
        let root = build_tree(yaml);
        let open = root.get_child("open").unwrap();
        let closed = root.get_child("closed").unwrap();

        let alice = UserGroup::user_only("alice");
        let admin = UserGroup::user_only("admin");

        assert!(open.check_submit_access(&alice));
        // closed falls through to the root ACL
        assert!(!closed.check_submit_access(&alice));
        assert!(closed.check_submit_access(&admin));
    }

    #[test]
    fn test_add_remove_application() {
        let root = build_tree(TREE);
        let small = root.get_child("tenants").unwrap().get_child("small").unwrap();

        let app = Application::new(
            "app-1",
            UserGroup::user_only("alice"),
            "root.tenants.small",
            HashMap::new(),
        );
        app.add_ask(AllocationAsk::new("ask-1", "app-1", res(&[("memory", 5)]), 1, 0))
            .unwrap();
        small.add_application(app.clone()).unwrap();
        assert_eq!(small.application_count(), 1);
        // the app's existing pending moved into the tree
        assert_eq!(root.pending().get("memory"), 5);

        // duplicates are rejected
        assert!(small.add_application(app.clone()).is_err());

        small.remove_application("app-1").unwrap();
        assert_eq!(small.application_count(), 0);
        assert_eq!(root.pending().get("memory"), 0);
    }

    #[test]
    fn test_add_application_non_leaf() {
        let root = build_tree(TREE);
        let tenants = root.get_child("tenants").unwrap();
        let app = Application::new(
            "app-1",
            UserGroup::user_only("alice"),
            "root.tenants",
            HashMap::new(),
        );
        assert!(tenants.add_application(app).is_err());
    }

    #[test]
    fn test_max_applications() {
        let yaml = r#"
partitions:
  - name: default
    queues:
      - name: root
        queues:
          - name: capped
            maxapplications: 1
"#;
        let root = build_tree(yaml);
        let capped = root.get_child("capped").unwrap();
        let a = Application::new("a", UserGroup::user_only("u"), "root.capped", HashMap::new());
        let b = Application::new("b", UserGroup::user_only("u"), "root.capped", HashMap::new());
        capped.add_application(a).unwrap();
        assert!(matches!(
            capped.add_application(b),
            Err(SchedulerError::QuotaExceeded { .. })
        ));
    }

    #[test]
    fn test_draining_lifecycle() {
        let root = build_tree(TREE);
        let tenants = root.get_child("tenants").unwrap();
        let small = tenants.get_child("small").unwrap();

        tenants.mark_for_removal();
        assert!(tenants.is_draining());
        assert!(small.is_draining());

        // draining refuses new applications
        let app = Application::new("a", UserGroup::user_only("u"), "x", HashMap::new());
        assert!(small.add_application(app).is_err());

        // managed queues only go once empty and draining
        assert!(!tenants.try_remove()); // still has children
        assert!(small.try_remove());
        assert!(tenants.get_child("small").is_none());

        root.clean_subtree();
        assert!(root.get_child("tenants").is_none());
    }

    #[test]
    fn test_unmanaged_removed_when_empty() {
        let root = build_tree(TREE);
        let tenants = root.get_child("tenants").unwrap();
        let dynamic = Queue::new_unmanaged(&tenants, "alice", true).unwrap();
        assert!(!dynamic.is_managed());
        assert_eq!(dynamic.name(), "root.tenants.alice");

        let app = Application::new("a", UserGroup::user_only("alice"), "x", HashMap::new());
        dynamic.add_application(app).unwrap();
        assert!(tenants.get_child("alice").is_some());

        // removing the last application removes the queue, no draining step
        dynamic.remove_application("a");
        assert!(tenants.get_child("alice").is_none());
    }

    #[test]
    fn test_fair_child_ordering() {
        let yaml = r#"
partitions:
  - name: default
    queues:
      - name: root
        properties:
          application.sort.policy: fair
        queues:
          - name: a
            resources:
              guaranteed:
                memory: "10"
          - name: b
            resources:
              guaranteed:
                memory: "10"
"#;
        let root = build_tree(yaml);
        let a = root.get_child("a").unwrap();
        a.inc_allocated(&res(&[("memory", 5)]), true).unwrap();

        let order: Vec<String> = root
            .sorted_children()
            .iter()
            .map(|q| q.short_name().to_string())
            .collect();
        assert_eq!(order, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_user_limits() {
        let yaml = r#"
partitions:
  - name: default
    queues:
      - name: root
        queues:
          - name: limited
            limits:
              - limit: "alice cap"
                users:
                  - alice
                maxresources:
                  memory: "30"
                maxapplications: 2
"#;
        let root = build_tree(yaml);
        let limited = root.get_child("limited").unwrap();
        let alice = UserGroup::user_only("alice");
        let bob = UserGroup::user_only("bob");

        let a1 = Application::new("a1", alice.clone(), "root.limited", HashMap::new());
        let a2 = Application::new("a2", alice.clone(), "root.limited", HashMap::new());
        limited.add_application(a1.clone()).unwrap();
        limited.add_application(a2).unwrap();
        // third application for alice is over the limit
        let a3 = Application::new("a3", alice.clone(), "root.limited", HashMap::new());
        assert!(limited.add_application(a3).is_err());
        // other users are not affected
        assert!(limited.check_submit_limits(&bob));

        // resource limit counts current usage plus the new ask
        a1.add_allocation(&res(&[("memory", 20)]));
        assert!(limited.check_allocation_limits(&alice, &res(&[("memory", 10)])));
        assert!(!limited.check_allocation_limits(&alice, &res(&[("memory", 11)])));
        assert!(limited.check_allocation_limits(&bob, &res(&[("memory", 100)])));
    }
}
