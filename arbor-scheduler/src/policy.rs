// Copyright 2025 The Arbor Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Sort policies: application ordering within a queue, child-queue
//! ordering, and node ordering for the partition iterator.
//!
//! Policies are a closed set selected by configuration tag; ties always
//! break on submission time and then ID so that a pass is deterministic.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::warn;

use arbor_common::resources::{comp_usage_ratio, Resource};

use crate::application::Application;
use crate::node::Node;
use crate::state::ApplicationState;

/// How applications inside a leaf queue are ordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AppSortPolicy {
    #[default]
    Fifo,
    Fair,
    StateAware,
}

impl AppSortPolicy {
    /// Parse the `application.sort.policy` property; unknown values fall
    /// back to FIFO with a warning.
    pub fn from_property(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "" | "fifo" => Self::Fifo,
            "fair" => Self::Fair,
            "stateaware" => Self::StateAware,
            other => {
                warn!(policy = other, "unknown application sort policy, using fifo");
                Self::Fifo
            }
        }
    }
}

/// How the partition orders nodes for the allocation descent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NodeSortPolicy {
    /// No policy configured: round-robin from a random start.
    #[default]
    Undefined,
    /// Most utilized node first, filling nodes up.
    BinPacking,
    /// Least utilized node first, spreading the load.
    Fair,
}

impl NodeSortPolicy {
    pub fn from_config(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "" => Self::Undefined,
            "binpacking" => Self::BinPacking,
            "fair" => Self::Fair,
            other => {
                warn!(policy = other, "unknown node sort policy, using round robin");
                Self::Undefined
            }
        }
    }
}

/// Order applications by the queue policy. The guarantee is the queue's
/// guaranteed resource, used by the fair comparison.
pub fn sort_applications(
    apps: &mut [Arc<Application>],
    policy: AppSortPolicy,
    guaranteed: &Resource,
) {
    match policy {
        // state aware filters down to one non-running candidate and then
        // orders like FIFO
        AppSortPolicy::Fifo | AppSortPolicy::StateAware => {
            apps.sort_by(compare_submission);
        }
        AppSortPolicy::Fair => {
            apps.sort_by(|l, r| {
                comp_usage_ratio(&l.allocated(), &r.allocated(), guaranteed)
                    .then_with(|| compare_submission(l, r))
            });
        }
    }
}

fn compare_submission(l: &Arc<Application>, r: &Arc<Application>) -> Ordering {
    l.submission_time_ms()
        .cmp(&r.submission_time_ms())
        .then_with(|| l.app_id.cmp(&r.app_id))
}

/// Applications that are candidates for the allocation descent: those with
/// pending work.
pub fn filter_on_pending(apps: Vec<Arc<Application>>) -> Vec<Arc<Application>> {
    apps.into_iter().filter(|app| app.has_pending()).collect()
}

/// The state aware filter surfaces at most one not-yet-running candidate.
///
/// A Starting application blocks every Accepted one, even when the
/// Starting application has nothing pending. Without a Starting
/// application the oldest Accepted application is the single candidate.
pub fn state_aware_filter(apps: Vec<Arc<Application>>) -> Vec<Arc<Application>> {
    let mut filtered: Vec<Arc<Application>> = Vec::new();
    let mut accepted: Option<Arc<Application>> = None;
    let mut found_starting = false;
    for app in apps {
        if app.state() == ApplicationState::Starting {
            found_starting = true;
            accepted = None;
        }
        if !app.has_pending() {
            continue;
        }
        match app.state() {
            ApplicationState::Accepted => {
                if !found_starting {
                    let older = match &accepted {
                        None => true,
                        Some(current) => compare_submission(&app, current) == Ordering::Less,
                    };
                    if older {
                        accepted = Some(app);
                    }
                }
            }
            ApplicationState::Starting | ApplicationState::Running | ApplicationState::Waiting => {
                filtered.push(app);
            }
            _ => {}
        }
    }
    if let Some(app) = accepted {
        filtered.push(app);
    }
    filtered
}

/// Candidate list for a leaf queue: policy filter plus policy sort.
pub fn candidates(
    apps: Vec<Arc<Application>>,
    policy: AppSortPolicy,
    guaranteed: &Resource,
) -> Vec<Arc<Application>> {
    let mut filtered = match policy {
        AppSortPolicy::StateAware => state_aware_filter(apps),
        _ => filter_on_pending(apps),
    };
    sort_applications(&mut filtered, policy, guaranteed);
    filtered
}

/// Sort nodes for the partition iterator. Utilization is the largest
/// per-type share of used (confirmed plus in-flight) against capacity.
pub fn sort_nodes(nodes: &mut [Arc<Node>], policy: NodeSortPolicy) {
    match policy {
        NodeSortPolicy::Undefined => {}
        NodeSortPolicy::BinPacking => {
            nodes.sort_by(|l, r| {
                node_utilization(r)
                    .partial_cmp(&node_utilization(l))
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| l.node_id.cmp(&r.node_id))
            });
        }
        NodeSortPolicy::Fair => {
            nodes.sort_by(|l, r| {
                node_utilization(l)
                    .partial_cmp(&node_utilization(r))
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| l.node_id.cmp(&r.node_id))
            });
        }
    }
}

fn node_utilization(node: &Arc<Node>) -> f64 {
    let used = node.allocated().add(&node.allocating()).add(&node.occupied());
    used.fair_share(&node.capacity())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::AllocationAsk;
    use arbor_common::security::UserGroup;
    use std::collections::HashMap;

    fn res(memory: i64) -> Resource {
        let mut r = Resource::new();
        r.set("memory", memory);
        r
    }

    fn app_with(id: &str, submitted: u64, pending_memory: i64) -> Arc<Application> {
        let app = Application::new(id, UserGroup::user_only("u"), "root.q", HashMap::new());
        app.set_submission_time_ms(submitted);
        if pending_memory > 0 {
            app.add_ask(AllocationAsk::new("ask-1", id, res(pending_memory), 1, 0))
                .unwrap();
        }
        app
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(AppSortPolicy::from_property("fifo"), AppSortPolicy::Fifo);
        assert_eq!(AppSortPolicy::from_property("Fair"), AppSortPolicy::Fair);
        assert_eq!(
            AppSortPolicy::from_property("stateaware"),
            AppSortPolicy::StateAware
        );
        assert_eq!(AppSortPolicy::from_property("bogus"), AppSortPolicy::Fifo);

        assert_eq!(NodeSortPolicy::from_config(""), NodeSortPolicy::Undefined);
        assert_eq!(
            NodeSortPolicy::from_config("binpacking"),
            NodeSortPolicy::BinPacking
        );
        assert_eq!(NodeSortPolicy::from_config("fair"), NodeSortPolicy::Fair);
    }

    #[test]
    fn test_fifo_sort() {
        let a = app_with("app-a", 200, 1);
        let b = app_with("app-b", 100, 1);
        let mut apps = vec![a, b];
        sort_applications(&mut apps, AppSortPolicy::Fifo, &Resource::new());
        assert_eq!(apps[0].app_id, "app-b");
    }

    #[test]
    fn test_fair_sort_prefers_low_usage() {
        let a = app_with("app-a", 100, 1);
        let b = app_with("app-b", 200, 1);
        a.add_allocation(&res(50));
        let mut apps = vec![a, b];
        sort_applications(&mut apps, AppSortPolicy::Fair, &res(100));
        assert_eq!(apps[0].app_id, "app-b");
    }

    #[test]
    fn test_filter_on_pending() {
        let with = app_with("app-a", 100, 10);
        let without = app_with("app-b", 100, 0);
        let filtered = filter_on_pending(vec![with, without]);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].app_id, "app-a");
    }

    #[test]
    fn test_state_aware_prefers_starting() {
        use crate::state::ApplicationEvent;

        // adding an ask accepts the app; one more Run starts it
        let starting = app_with("app-a", 100, 10);
        starting.handle_event(ApplicationEvent::Run).unwrap();

        let b = app_with("app-b", 50, 10);
        let c = app_with("app-c", 60, 10);

        assert_eq!(starting.state(), ApplicationState::Starting);
        assert_eq!(b.state(), ApplicationState::Accepted);

        // with a Starting app present only it is surfaced
        let out = state_aware_filter(vec![starting.clone(), b.clone(), c.clone()]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].app_id, "app-a");

        // without it, only the oldest Accepted app
        let out = state_aware_filter(vec![b.clone(), c.clone()]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].app_id, "app-b");
    }

    #[test]
    fn test_node_sorting() {
        let empty = Arc::new(Node::new("node-empty", res(100), Resource::new()));
        let busy = Arc::new(Node::new("node-busy", res(100), Resource::new()));
        busy.add_allocation(&res(80));

        let mut nodes = vec![empty.clone(), busy.clone()];
        sort_nodes(&mut nodes, NodeSortPolicy::Fair);
        assert_eq!(nodes[0].node_id, "node-empty");

        sort_nodes(&mut nodes, NodeSortPolicy::BinPacking);
        assert_eq!(nodes[0].node_id, "node-busy");
    }
}
