// Copyright 2025 The Arbor Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Scheduler configuration model.
//!
//! The configuration is a YAML document with a list of partitions, each
//! carrying a queue tree, placement rules, limits, and partition-wide
//! policies. Loading validates the whole document and records a SHA-256
//! checksum over the raw bytes for change detection.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::acl::Acl;
use crate::error::CommonError;
use crate::resources::Resource;

/// Queue property key: application sort policy (`fifo`, `fair`, `stateaware`).
pub const PROP_APPLICATION_SORT_POLICY: &str = "application.sort.policy";
/// Queue property key: ask priority ordering (`enabled`, `disabled`).
pub const PROP_APPLICATION_SORT_PRIORITY: &str = "application.sort.priority";
/// Queue property key: seconds before a Starting application is forced to Running.
pub const PROP_TIMEOUT_STARTING: &str = "timeout.starting";
/// Queue property key: seconds before a Waiting application completes.
pub const PROP_TIMEOUT_WAITING: &str = "timeout.waiting";

/// The root queue name; every queue path starts here.
pub const ROOT_QUEUE: &str = "root";
/// Separator in fully qualified queue names.
pub const QUEUE_DOT: char = '.';

fn queue_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^[a-zA-Z0-9_-]{1,64}$").expect("static regex"))
}

/// Top level configuration: the partitions plus the checksum of the raw
/// document the partitions were parsed from.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub partitions: Vec<PartitionConfig>,
    #[serde(skip)]
    pub checksum: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PartitionConfig {
    pub name: String,
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
    #[serde(default, rename = "placementrules", skip_serializing_if = "Vec::is_empty")]
    pub placement_rules: Vec<PlacementRuleConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub limits: Vec<LimitConfig>,
    #[serde(default)]
    pub preemption: PreemptionConfig,
    #[serde(default, rename = "nodesortpolicy")]
    pub node_sort_policy: NodeSortPolicyConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreemptionConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// Global node sorting policy: `binpacking` or `fair` (the default).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeSortPolicyConfig {
    #[serde(default, rename = "type")]
    pub policy_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default)]
    pub parent: bool,
    #[serde(default, skip_serializing_if = "ResourcesConfig::is_empty")]
    pub resources: ResourcesConfig,
    #[serde(default, rename = "maxapplications")]
    pub max_applications: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, String>,
    #[serde(default, rename = "adminacl")]
    pub admin_acl: String,
    #[serde(default, rename = "submitacl")]
    pub submit_acl: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub queues: Vec<QueueConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub limits: Vec<LimitConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourcesConfig {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub guaranteed: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub max: HashMap<String, String>,
}

impl ResourcesConfig {
    pub fn is_empty(&self) -> bool {
        self.guaranteed.is_empty() && self.max.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlacementRuleConfig {
    pub name: String,
    #[serde(default)]
    pub create: bool,
    #[serde(default, skip_serializing_if = "FilterConfig::is_empty")]
    pub filter: FilterConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<PlacementRuleConfig>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterConfig {
    #[serde(default, rename = "type")]
    pub filter_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

impl FilterConfig {
    pub fn is_empty(&self) -> bool {
        self.filter_type.is_empty() && self.users.is_empty() && self.groups.is_empty()
    }
}

/// A user or group limit at partition or queue level.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LimitConfig {
    #[serde(default)]
    pub limit: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(default, rename = "maxresources", skip_serializing_if = "HashMap::is_empty")]
    pub max_resources: HashMap<String, String>,
    #[serde(default, rename = "maxapplications")]
    pub max_applications: u64,
}

impl SchedulerConfig {
    /// Parse and validate a configuration document.
    pub fn load_from_bytes(content: &[u8]) -> Result<Self, CommonError> {
        let mut conf: SchedulerConfig = serde_yaml::from_slice(content)
            .map_err(|e| CommonError::ConfigInvalid(format!("YAML parse failed: {e}")))?;
        conf.validate()?;
        conf.checksum = Sha256::digest(content).to_vec();
        debug!(partitions = conf.partitions.len(), "configuration loaded");
        Ok(conf)
    }

    pub fn load_from_str(content: &str) -> Result<Self, CommonError> {
        Self::load_from_bytes(content.as_bytes())
    }

    /// Serialize back to YAML (checksum excluded).
    pub fn to_yaml(&self) -> Result<String, CommonError> {
        serde_yaml::to_string(self)
            .map_err(|e| CommonError::ConfigInvalid(format!("YAML serialize failed: {e}")))
    }

    /// Validate the whole document and normalize each partition's queue
    /// list to a single `root` queue.
    pub fn validate(&mut self) -> Result<(), CommonError> {
        let mut names = HashSet::new();
        for partition in &mut self.partitions {
            if partition.name.is_empty() {
                return Err(CommonError::ConfigInvalid(
                    "partition name must be set".to_string(),
                ));
            }
            if !names.insert(partition.name.to_lowercase()) {
                return Err(CommonError::ConfigInvalid(format!(
                    "duplicate partition name: {}",
                    partition.name
                )));
            }
            partition.validate()?;
        }
        Ok(())
    }
}

impl PartitionConfig {
    fn validate(&mut self) -> Result<(), CommonError> {
        self.normalize_root();
        let root = &self.queues[0];
        validate_queue(root, true)?;
        for rule in &self.placement_rules {
            validate_rule(rule)?;
        }
        for limit in &self.limits {
            validate_limit(limit)?;
        }
        match self.node_sort_policy.policy_type.to_lowercase().as_str() {
            "" | "fair" | "binpacking" => Ok(()),
            other => Err(CommonError::ConfigInvalid(format!(
                "undefined node sort policy: {other}"
            ))),
        }
    }

    /// Make sure the partition has exactly one top level queue called
    /// `root`; wrap any other top level definition under a synthesized root.
    fn normalize_root(&mut self) {
        let has_root = self.queues.len() == 1
            && self.queues[0].name.eq_ignore_ascii_case(ROOT_QUEUE);
        if !has_root {
            let children = std::mem::take(&mut self.queues);
            self.queues = vec![QueueConfig {
                name: ROOT_QUEUE.to_string(),
                parent: true,
                queues: children,
                ..QueueConfig::default()
            }];
        }
    }
}

fn validate_queue(queue: &QueueConfig, is_root: bool) -> Result<(), CommonError> {
    if !queue_name_regex().is_match(&queue.name) {
        return Err(CommonError::ConfigInvalid(format!(
            "invalid queue name: '{}'",
            queue.name
        )));
    }
    if !is_root && queue.name.eq_ignore_ascii_case(ROOT_QUEUE) {
        return Err(CommonError::ConfigInvalid(
            "'root' is reserved for the top of the hierarchy".to_string(),
        ));
    }
    validate_queue_resources(queue)?;
    Acl::parse(&queue.submit_acl)?;
    Acl::parse(&queue.admin_acl)?;
    for limit in &queue.limits {
        validate_limit(limit)?;
    }
    let mut seen = HashSet::new();
    for child in &queue.queues {
        if !seen.insert(child.name.to_lowercase()) {
            return Err(CommonError::ConfigInvalid(format!(
                "duplicate queue name '{}' under '{}'",
                child.name, queue.name
            )));
        }
        validate_queue(child, false)?;
    }
    Ok(())
}

fn validate_queue_resources(queue: &QueueConfig) -> Result<(), CommonError> {
    let guaranteed = Resource::from_config_map(&queue.resources.guaranteed)?;
    let max = Resource::from_config_map(&queue.resources.max)?;
    for (name, value) in max.iter() {
        if value <= 0 {
            return Err(CommonError::ConfigInvalid(format!(
                "queue '{}': max resource {} must be positive",
                queue.name, name
            )));
        }
        // a type present in both must leave room for the guarantee
        if guaranteed.get(name) > value {
            return Err(CommonError::ConfigInvalid(format!(
                "queue '{}': guaranteed {} exceeds max",
                queue.name, name
            )));
        }
    }
    Ok(())
}

fn validate_rule(rule: &PlacementRuleConfig) -> Result<(), CommonError> {
    match rule.name.to_lowercase().as_str() {
        "provided" | "user" | "fixed" | "tag" | "recovery" => {}
        other => {
            return Err(CommonError::ConfigInvalid(format!(
                "unknown placement rule: {other}"
            )))
        }
    }
    match rule.name.to_lowercase().as_str() {
        "fixed" | "tag" if rule.value.is_empty() => {
            return Err(CommonError::ConfigInvalid(format!(
                "placement rule '{}' requires a value",
                rule.name
            )))
        }
        _ => {}
    }
    match rule.filter.filter_type.to_lowercase().as_str() {
        "" | "allow" | "deny" => {}
        other => {
            return Err(CommonError::ConfigInvalid(format!(
                "unknown filter type: {other}"
            )))
        }
    }
    if let Some(parent) = &rule.parent {
        validate_rule(parent)?;
    }
    Ok(())
}

fn validate_limit(limit: &LimitConfig) -> Result<(), CommonError> {
    if limit.users.is_empty() && limit.groups.is_empty() {
        return Err(CommonError::ConfigInvalid(
            "limit must name at least one user or group".to_string(),
        ));
    }
    if limit.max_resources.is_empty() && limit.max_applications == 0 {
        return Err(CommonError::ConfigInvalid(
            "limit must set max resources or max applications".to_string(),
        ));
    }
    let max = Resource::from_config_map(&limit.max_resources)?;
    for (name, value) in max.iter() {
        if value <= 0 {
            return Err(CommonError::ConfigInvalid(format!(
                "limit resource {name} must be positive"
            )));
        }
    }
    Ok(())
}

/// Check whether a fully qualified queue name is well formed.
pub fn is_valid_queue_path(name: &str) -> bool {
    let mut parts = name.split(QUEUE_DOT);
    match parts.next() {
        Some(first) if first.eq_ignore_ascii_case(ROOT_QUEUE) => {}
        _ => return false,
    }
    parts.all(|p| queue_name_regex().is_match(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE_CONF: &str = r#"
partitions:
  - name: default
    queues:
      - name: root
        parent: true
        submitacl: "*"
        queues:
          - name: batch
            resources:
              guaranteed:
                memory: "10"
              max:
                memory: "100"
            properties:
              application.sort.policy: fair
          - name: interactive
            maxapplications: 5
"#;

    #[test]
    fn test_load_simple() {
        let conf = SchedulerConfig::load_from_str(SIMPLE_CONF).unwrap();
        assert_eq!(conf.partitions.len(), 1);
        assert_eq!(conf.checksum.len(), 32);
        let root = &conf.partitions[0].queues[0];
        assert_eq!(root.name, "root");
        assert_eq!(root.queues.len(), 2);
        assert_eq!(root.queues[0].resources.max["memory"], "100");
        assert_eq!(
            root.queues[0].properties[PROP_APPLICATION_SORT_POLICY],
            "fair"
        );
    }

    #[test]
    fn test_checksum_changes_with_content() {
        let a = SchedulerConfig::load_from_str(SIMPLE_CONF).unwrap();
        let b =
            SchedulerConfig::load_from_str(&SIMPLE_CONF.replace("memory: \"100\"", "memory: \"200\""))
                .unwrap();
        assert_ne!(a.checksum, b.checksum);
    }

    #[test]
    fn test_missing_root_is_wrapped() {
        let conf = SchedulerConfig::load_from_str(
            r#"
partitions:
  - name: default
    queues:
      - name: batch
"#,
        )
        .unwrap();
        let root = &conf.partitions[0].queues[0];
        assert_eq!(root.name, "root");
        assert!(root.parent);
        assert_eq!(root.queues[0].name, "batch");
    }

    #[test]
    fn test_round_trip() {
        let conf = SchedulerConfig::load_from_str(SIMPLE_CONF).unwrap();
        let rendered = conf.to_yaml().unwrap();
        let reparsed = SchedulerConfig::load_from_str(&rendered).unwrap();
        assert_eq!(conf.partitions, reparsed.partitions);
    }

    #[test]
    fn test_invalid_queue_name() {
        let err = SchedulerConfig::load_from_str(
            r#"
partitions:
  - name: default
    queues:
      - name: root
        queues:
          - name: "has space"
"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_duplicate_sibling() {
        let err = SchedulerConfig::load_from_str(
            r#"
partitions:
  - name: default
    queues:
      - name: root
        queues:
          - name: a
          - name: A
"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_guaranteed_over_max() {
        let err = SchedulerConfig::load_from_str(
            r#"
partitions:
  - name: default
    queues:
      - name: root
        queues:
          - name: a
            resources:
              guaranteed:
                memory: "200"
              max:
                memory: "100"
"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_placement_rule_validation() {
        let ok = SchedulerConfig::load_from_str(
            r#"
partitions:
  - name: default
    queues:
      - name: root
    placementrules:
      - name: user
        create: true
        parent:
          name: fixed
          value: root.users
"#,
        );
        assert!(ok.is_ok());

        let bad = SchedulerConfig::load_from_str(
            r#"
partitions:
  - name: default
    queues:
      - name: root
    placementrules:
      - name: mystery
"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_limit_validation() {
        let bad = SchedulerConfig::load_from_str(
            r#"
partitions:
  - name: default
    queues:
      - name: root
    limits:
      - limit: "empty principals"
        maxapplications: 2
"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_queue_path_syntax() {
        assert!(is_valid_queue_path("root"));
        assert!(is_valid_queue_path("root.a.b-c_d"));
        assert!(!is_valid_queue_path("a.b"));
        assert!(!is_valid_queue_path("root..a"));
        assert!(!is_valid_queue_path("root.a b"));
    }
}
