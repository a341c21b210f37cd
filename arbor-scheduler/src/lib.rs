// Copyright 2025 The Arbor Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The Arbor scheduling core.
//!
//! A partition owns a hierarchical queue tree, the applications placed in
//! it, and the cluster nodes it may allocate on. The scheduling pass
//! descends the queue tree by sort policy, picks candidate applications and
//! their pending asks, and places them on nodes through a two-phase
//! propose/confirm protocol against the external resource cache.

pub mod allocation;
pub mod application;
pub mod context;
pub mod error;
pub mod node;
pub mod node_iterator;
pub mod partition;
pub mod placement;
pub mod plugin;
pub mod policy;
pub mod queue;
pub mod reservation;
pub mod state;
