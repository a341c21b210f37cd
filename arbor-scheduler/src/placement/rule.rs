// Copyright 2025 The Arbor Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The individual placement rules and their user/group filter.

use regex::Regex;
use tracing::debug;

use arbor_common::config::{FilterConfig, PlacementRuleConfig, QUEUE_DOT, ROOT_QUEUE};
use arbor_common::security::UserGroup;

use crate::application::Application;
use crate::error::{SchedulerError, SchedulerResult};

/// A placement rule maps an application to a fully qualified queue path.
/// `Ok(None)` means the rule does not apply and the next one is tried.
pub trait PlacementRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn place(&self, app: &Application) -> SchedulerResult<Option<String>>;
}

/// Build a rule (and its parent chain) from configuration.
pub fn build_rule(cfg: &PlacementRuleConfig) -> SchedulerResult<Box<dyn PlacementRule>> {
    let filter = RuleFilter::from_config(&cfg.filter)?;
    let parent = cfg
        .parent
        .as_ref()
        .map(|p| build_rule(p))
        .transpose()?;
    let rule: Box<dyn PlacementRule> = match cfg.name.to_lowercase().as_str() {
        "provided" => Box::new(ProvidedRule { filter, parent }),
        "user" => Box::new(UserRule { filter, parent }),
        "fixed" => Box::new(FixedRule {
            filter,
            parent,
            value: cfg.value.clone(),
        }),
        "tag" => Box::new(TagRule {
            filter,
            parent,
            tag_name: cfg.value.clone(),
        }),
        "recovery" => Box::new(RecoveryRule { filter }),
        other => {
            return Err(SchedulerError::InvalidArgument(format!(
                "unknown placement rule: {other}"
            )))
        }
    };
    Ok(rule)
}

// ─── filter ─────────────────────────────────────────────────────────────

enum NameMatcher {
    None,
    Exact(Vec<String>),
    Pattern(Regex),
}

impl NameMatcher {
    fn from_list(list: &[String]) -> SchedulerResult<Self> {
        match list {
            [] => Ok(Self::None),
            // a single entry is a regular expression
            [single] => {
                let re = Regex::new(&format!("^{single}$")).map_err(|e| {
                    SchedulerError::InvalidArgument(format!(
                        "invalid filter expression '{single}': {e}"
                    ))
                })?;
                Ok(Self::Pattern(re))
            }
            many => Ok(Self::Exact(many.to_vec())),
        }
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            Self::None => false,
            Self::Exact(names) => names.iter().any(|n| n == name),
            Self::Pattern(re) => re.is_match(name),
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// The user/group filter attached to a rule. An allow filter passes users
/// it matches, a deny filter passes users it does not match; an empty
/// filter passes everyone.
pub struct RuleFilter {
    allow: bool,
    users: NameMatcher,
    groups: NameMatcher,
}

impl RuleFilter {
    pub fn from_config(cfg: &FilterConfig) -> SchedulerResult<Self> {
        let allow = match cfg.filter_type.to_lowercase().as_str() {
            "" | "allow" => true,
            "deny" => false,
            other => {
                return Err(SchedulerError::InvalidArgument(format!(
                    "unknown filter type: {other}"
                )))
            }
        };
        Ok(Self {
            allow,
            users: NameMatcher::from_list(&cfg.users)?,
            groups: NameMatcher::from_list(&cfg.groups)?,
        })
    }

    pub fn allow_user(&self, user: &UserGroup) -> bool {
        if self.users.is_empty() && self.groups.is_empty() {
            return true;
        }
        let matched = self.users.matches(&user.user)
            || user.groups.iter().any(|g| self.groups.matches(g));
        matched == self.allow
    }
}

// ─── helpers ────────────────────────────────────────────────────────────

/// Fully qualify a queue name: an already rooted name passes unchanged,
/// anything else goes below the parent rule's result or directly below
/// the root.
fn qualify(parent: Option<String>, name: &str) -> String {
    let name = name.to_lowercase();
    if name == ROOT_QUEUE || name.starts_with(&format!("{ROOT_QUEUE}{QUEUE_DOT}")) {
        return name;
    }
    match parent {
        Some(parent) => format!("{parent}{QUEUE_DOT}{name}"),
        None => format!("{ROOT_QUEUE}{QUEUE_DOT}{name}"),
    }
}

/// Replace characters a queue name cannot hold.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn run_parent(
    parent: &Option<Box<dyn PlacementRule>>,
    app: &Application,
) -> SchedulerResult<Option<Option<String>>> {
    match parent {
        None => Ok(Some(None)),
        Some(rule) => match rule.place(app)? {
            // parent rule did not produce a queue: the whole rule fails
            None => Ok(None),
            Some(name) => Ok(Some(Some(name))),
        },
    }
}

// ─── rules ──────────────────────────────────────────────────────────────

/// Use the queue the application asked for.
struct ProvidedRule {
    filter: RuleFilter,
    parent: Option<Box<dyn PlacementRule>>,
}

impl PlacementRule for ProvidedRule {
    fn name(&self) -> &'static str {
        "provided"
    }

    fn place(&self, app: &Application) -> SchedulerResult<Option<String>> {
        if !self.filter.allow_user(&app.user()) {
            return Ok(None);
        }
        let requested = app.queue_name();
        if requested.is_empty() {
            return Ok(None);
        }
        let Some(parent) = run_parent(&self.parent, app)? else {
            return Ok(None);
        };
        Ok(Some(qualify(parent, &requested)))
    }
}

/// Queue named after the submitting user.
struct UserRule {
    filter: RuleFilter,
    parent: Option<Box<dyn PlacementRule>>,
}

impl PlacementRule for UserRule {
    fn name(&self) -> &'static str {
        "user"
    }

    fn place(&self, app: &Application) -> SchedulerResult<Option<String>> {
        let user = app.user();
        if !self.filter.allow_user(&user) {
            return Ok(None);
        }
        if user.user.is_empty() {
            return Ok(None);
        }
        let Some(parent) = run_parent(&self.parent, app)? else {
            return Ok(None);
        };
        Ok(Some(qualify(parent, &sanitize_name(&user.user))))
    }
}

/// A literal queue from the configuration.
struct FixedRule {
    filter: RuleFilter,
    parent: Option<Box<dyn PlacementRule>>,
    value: String,
}

impl PlacementRule for FixedRule {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn place(&self, app: &Application) -> SchedulerResult<Option<String>> {
        if !self.filter.allow_user(&app.user()) {
            return Ok(None);
        }
        if self.value.is_empty() {
            return Ok(None);
        }
        let Some(parent) = run_parent(&self.parent, app)? else {
            return Ok(None);
        };
        Ok(Some(qualify(parent, &self.value)))
    }
}

/// Queue derived from an application tag, e.g. the namespace label.
struct TagRule {
    filter: RuleFilter,
    parent: Option<Box<dyn PlacementRule>>,
    tag_name: String,
}

impl PlacementRule for TagRule {
    fn name(&self) -> &'static str {
        "tag"
    }

    fn place(&self, app: &Application) -> SchedulerResult<Option<String>> {
        if !self.filter.allow_user(&app.user()) {
            return Ok(None);
        }
        let Some(value) = app.get_tag(&self.tag_name) else {
            debug!(app_id = %app.app_id, tag = %self.tag_name, "tag not set on application");
            return Ok(None);
        };
        if value.is_empty() {
            return Ok(None);
        }
        let value = sanitize_name(value);
        let Some(parent) = run_parent(&self.parent, app)? else {
            return Ok(None);
        };
        Ok(Some(qualify(parent, &value)))
    }
}

/// Accept the queue path of a recovered application as-is. The path must
/// already be fully qualified; the partition checks it exists.
struct RecoveryRule {
    filter: RuleFilter,
}

impl PlacementRule for RecoveryRule {
    fn name(&self) -> &'static str {
        "recovery"
    }

    fn place(&self, app: &Application) -> SchedulerResult<Option<String>> {
        if !self.filter.allow_user(&app.user()) {
            return Ok(None);
        }
        let requested = app.queue_name().to_lowercase();
        if requested.is_empty()
            || !(requested == ROOT_QUEUE
                || requested.starts_with(&format!("{ROOT_QUEUE}{QUEUE_DOT}")))
        {
            return Ok(None);
        }
        Ok(Some(requested))
    }
}
