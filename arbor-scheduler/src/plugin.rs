// Copyright 2025 The Arbor Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Placement predicate plugins.
//!
//! Predicates live outside the core (the shim implements affinity,
//! taints/tolerations, volume constraints). The core only invokes the
//! registered plugin; with no plugin every node passes.

/// Arguments for a predicate check.
#[derive(Debug, Clone)]
pub struct PredicateArgs<'a> {
    pub allocation_key: &'a str,
    pub node_id: &'a str,
}

/// A predicate plugin gating placement on a node.
///
/// Implementations return the first failure; callers must not rely on all
/// checks running. Calls are made lock free and may run concurrently.
pub trait PredicatePlugin: Send + Sync {
    /// Ok means the node passes; Err carries the first failed predicate.
    fn predicates(&self, args: &PredicateArgs<'_>) -> Result<(), String>;
}

/// A plugin that rejects a fixed set of nodes. Useful in tests and as the
/// simplest possible shim-side behavior.
pub struct DenyListPlugin {
    denied_nodes: Vec<String>,
}

impl DenyListPlugin {
    pub fn new(denied_nodes: Vec<String>) -> Self {
        Self { denied_nodes }
    }
}

impl PredicatePlugin for DenyListPlugin {
    fn predicates(&self, args: &PredicateArgs<'_>) -> Result<(), String> {
        if self.denied_nodes.iter().any(|n| n == args.node_id) {
            return Err(format!("node {} rejected by deny list", args.node_id));
        }
        Ok(())
    }
}
