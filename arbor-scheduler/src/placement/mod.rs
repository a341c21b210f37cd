// Copyright 2025 The Arbor Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Placement: turn an incoming application into a fully qualified leaf
//! queue path.
//!
//! Rules are evaluated in declaration order; the first rule producing a
//! queue name wins. A rule with `create` set allows the partition to build
//! unmanaged queues below the deepest existing ancestor.

mod rule;

pub use rule::{build_rule, PlacementRule, RuleFilter};

use parking_lot::RwLock;
use tracing::debug;

use arbor_common::config::PlacementRuleConfig;

use crate::application::Application;
use crate::error::{SchedulerError, SchedulerResult};

/// The outcome of rule evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementDecision {
    /// Fully qualified leaf queue path.
    pub queue_name: String,
    /// Whether the winning rule may create missing queues.
    pub create: bool,
}

struct ActiveRule {
    rule: Box<dyn PlacementRule>,
    create: bool,
}

/// Evaluates the configured placement rules for a partition.
#[derive(Default)]
pub struct PlacementManager {
    rules: RwLock<Vec<ActiveRule>>,
}

impl PlacementManager {
    pub fn new(configs: &[PlacementRuleConfig]) -> SchedulerResult<Self> {
        let manager = Self::default();
        manager.update_rules(configs)?;
        Ok(manager)
    }

    /// True when any rules are configured; without rules the requested
    /// queue is used as-is by the partition.
    pub fn is_initialized(&self) -> bool {
        !self.rules.read().is_empty()
    }

    /// Replace the rule set, e.g. on configuration reload. The old rules
    /// stay active when the new set fails to build.
    pub fn update_rules(&self, configs: &[PlacementRuleConfig]) -> SchedulerResult<()> {
        let mut fresh = Vec::with_capacity(configs.len());
        for cfg in configs {
            fresh.push(ActiveRule {
                rule: build_rule(cfg)?,
                create: cfg.create,
            });
        }
        *self.rules.write() = fresh;
        Ok(())
    }

    /// Run the rules in order and return the first decision.
    pub fn place_application(&self, app: &Application) -> SchedulerResult<PlacementDecision> {
        let rules = self.rules.read();
        for active in rules.iter() {
            match active.rule.place(app)? {
                Some(queue_name) => {
                    debug!(
                        app_id = %app.app_id,
                        rule = active.rule.name(),
                        queue = %queue_name,
                        "application placed"
                    );
                    return Ok(PlacementDecision {
                        queue_name,
                        create: active.create,
                    });
                }
                None => continue,
            }
        }
        Err(SchedulerError::PlacementDenied(format!(
            "no placement rule matched application {}",
            app.app_id
        )))
    }
}
