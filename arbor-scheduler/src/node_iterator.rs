// Copyright 2025 The Arbor Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Node iterators used by the allocation descent.

use std::sync::Arc;

use rand::Rng;

use crate::node::Node;

/// Iterate over a fixed snapshot of nodes. `reset` starts a fresh epoch.
pub trait NodeIterator: Send {
    fn next(&mut self) -> Option<Arc<Node>>;
    fn reset(&mut self);
}

/// Walks the snapshot in the order it was sorted in.
pub struct DefaultNodeIterator {
    nodes: Vec<Arc<Node>>,
    count: usize,
}

impl DefaultNodeIterator {
    pub fn new(nodes: Vec<Arc<Node>>) -> Self {
        Self { nodes, count: 0 }
    }
}

impl NodeIterator for DefaultNodeIterator {
    fn next(&mut self) -> Option<Arc<Node>> {
        let node = self.nodes.get(self.count)?.clone();
        self.count += 1;
        Some(node)
    }

    fn reset(&mut self) {
        self.count = 0;
    }
}

/// Starts at a random index and wraps once around the snapshot. The start
/// is picked lazily on the first `next` so a reset re-randomizes.
pub struct RoundRobinNodeIterator {
    nodes: Vec<Arc<Node>>,
    start: Option<usize>,
    count: usize,
}

impl RoundRobinNodeIterator {
    pub fn new(nodes: Vec<Arc<Node>>) -> Self {
        Self {
            nodes,
            start: None,
            count: 0,
        }
    }
}

impl NodeIterator for RoundRobinNodeIterator {
    fn next(&mut self) -> Option<Arc<Node>> {
        if self.nodes.is_empty() || self.count >= self.nodes.len() {
            return None;
        }
        let start = *self
            .start
            .get_or_insert_with(|| rand::thread_rng().gen_range(0..self.nodes.len()));
        let idx = (start + self.count) % self.nodes.len();
        self.count += 1;
        Some(self.nodes[idx].clone())
    }

    fn reset(&mut self) {
        self.start = None;
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_common::resources::Resource;

    fn node_list(n: usize) -> Vec<Arc<Node>> {
        (0..n)
            .map(|i| Arc::new(Node::new(format!("node-{i}"), Resource::new(), Resource::new())))
            .collect()
    }

    #[test]
    fn test_default_empty() {
        let mut it = DefaultNodeIterator::new(Vec::new());
        assert!(it.next().is_none());
        it.reset();
        assert!(it.next().is_none());
    }

    #[test]
    fn test_default_iterates_in_order() {
        let mut it = DefaultNodeIterator::new(node_list(5));
        for i in 0..5 {
            assert_eq!(it.next().unwrap().node_id, format!("node-{i}"));
        }
        assert!(it.next().is_none());

        it.reset();
        assert_eq!(it.next().unwrap().node_id, "node-0");
    }

    #[test]
    fn test_round_robin_empty() {
        let mut it = RoundRobinNodeIterator::new(Vec::new());
        assert!(it.next().is_none());
        it.reset();
        assert!(it.next().is_none());
    }

    #[test]
    fn test_round_robin_wraps_once() {
        let length = 5;
        let mut it = RoundRobinNodeIterator::new(node_list(length));

        let first = it.next().unwrap();
        let start: usize = first.node_id.strip_prefix("node-").unwrap().parse().unwrap();

        // the rest of the epoch continues from the random start and wraps
        for i in 1..length {
            let expect = (start + i) % length;
            assert_eq!(it.next().unwrap().node_id, format!("node-{expect}"));
        }
        assert!(it.next().is_none(), "iterator must stop after one full wrap");

        // reset picks a fresh epoch and serves the full list again
        it.reset();
        let mut seen = 0;
        while it.next().is_some() {
            seen += 1;
        }
        assert_eq!(seen, length);
    }
}
