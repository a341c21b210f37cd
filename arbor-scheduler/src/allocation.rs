// Copyright 2025 The Arbor Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Asks, allocation results, and the proposal handed to the cache.

use std::sync::Arc;

use arbor_common::resources::Resource;
use arbor_util::time::current_time_ms;

use crate::node::Node;
use crate::node_iterator::NodeIterator;
use crate::plugin::PredicatePlugin;

/// What the allocation descent needs from the partition: nodes to try and
/// the predicate gate. Keeps queue and application code independent of the
/// partition type.
pub trait AllocationContext {
    /// Iterator over schedulable, unreserved nodes in policy order; None
    /// when no node qualifies.
    fn node_iterator(&self) -> Option<Box<dyn NodeIterator>>;

    /// Look up a node by ID, reserved or not.
    fn get_node(&self, node_id: &str) -> Option<Arc<Node>>;

    /// The registered predicate plugin, if any.
    fn predicate_plugin(&self) -> Option<Arc<dyn PredicatePlugin>>;

    /// Whether the preemption phase is active for this pass.
    fn preemption_phase(&self) -> bool {
        false
    }
}

/// A request for one or more identical allocations from an application.
#[derive(Debug, Clone)]
pub struct AllocationAsk {
    /// Unique within the owning application.
    pub allocation_key: String,
    pub app_id: String,
    pub queue_name: String,
    /// Resource required per repeat.
    pub resource: Resource,
    /// Number of unfulfilled repeats.
    pub pending_repeat: i64,
    pub priority: i32,
    /// Creation time, milliseconds since the epoch.
    pub create_time_ms: u64,
    /// Gang scheduling hook; placeholders reserve capacity for the gang.
    pub placeholder: bool,
    /// Restrict placement to one node.
    pub required_node: Option<String>,
}

impl AllocationAsk {
    pub fn new(
        allocation_key: impl Into<String>,
        app_id: impl Into<String>,
        resource: Resource,
        pending_repeat: i64,
        priority: i32,
    ) -> Self {
        Self {
            allocation_key: allocation_key.into(),
            app_id: app_id.into(),
            queue_name: String::new(),
            resource,
            pending_repeat,
            priority,
            create_time_ms: current_time_ms(),
            placeholder: false,
            required_node: None,
        }
    }

    /// Total resource still pending for this ask.
    pub fn pending_resource(&self) -> Resource {
        self.resource.multiply(self.pending_repeat.max(0))
    }
}

/// What a scheduling pass decided for an ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationResult {
    /// A normal allocation; leaves the scheduler as a proposal.
    Allocated,
    /// An allocation that consumed a reservation; unreserve then propose.
    AllocatedReserved,
    /// A reservation was made; stays inside the scheduler.
    Reserved,
    /// A reservation was released; stays inside the scheduler.
    Unreserved,
}

/// The outcome of one successful allocation descent.
#[derive(Debug, Clone)]
pub struct SchedulingAllocation {
    pub ask: AllocationAsk,
    /// Node the allocation (or reservation) targets.
    pub node_id: String,
    /// Set when a reservation is satisfied on a different node than the
    /// one that was reserved.
    pub reserved_node_id: Option<String>,
    pub result: AllocationResult,
}

impl SchedulingAllocation {
    pub fn new(ask: AllocationAsk, node_id: impl Into<String>, result: AllocationResult) -> Self {
        Self {
            ask,
            node_id: node_id.into(),
            reserved_node_id: None,
            result,
        }
    }

    /// The node the reservation bookkeeping applies to: the reserved node
    /// when set, the target node otherwise.
    pub fn reservation_node_id(&self) -> &str {
        self.reserved_node_id.as_deref().unwrap_or(&self.node_id)
    }
}

/// The optimistic allocation handed to the external cache for confirmation.
#[derive(Debug, Clone)]
pub struct AllocationProposal {
    pub allocation_key: String,
    pub app_id: String,
    pub queue_name: String,
    pub node_id: String,
    pub resource: Resource,
    pub placeholder: bool,
}

impl AllocationProposal {
    pub fn from_allocation(alloc: &SchedulingAllocation) -> Self {
        Self {
            allocation_key: alloc.ask.allocation_key.clone(),
            app_id: alloc.ask.app_id.clone(),
            queue_name: alloc.ask.queue_name.clone(),
            node_id: alloc.node_id.clone(),
            resource: alloc.ask.resource.clone(),
            placeholder: alloc.ask.placeholder,
        }
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

    #[test]
    fn test_pending_resource() {
        let mut ask = AllocationAsk::new("ask-1", "app-1", res(20), 3, 0);
        assert_eq!(ask.pending_resource().get("memory"), 60);
        ask.pending_repeat = 0;
        assert!(ask.pending_resource().is_zero());
        ask.pending_repeat = -1;
        assert!(ask.pending_resource().is_zero());
    }

    #[test]
    fn test_reservation_node() {
        let ask = AllocationAsk::new("ask-1", "app-1", res(1), 1, 0);
        let mut alloc = SchedulingAllocation::new(ask, "node-2", AllocationResult::AllocatedReserved);
        assert_eq!(alloc.reservation_node_id(), "node-2");
        alloc.reserved_node_id = Some("node-1".to_string());
        assert_eq!(alloc.reservation_node_id(), "node-1");
    }
}
