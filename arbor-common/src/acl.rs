// Copyright 2025 The Arbor Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Access control lists for queue submit and admin access.
//!
//! An ACL string is a comma-separated user list, a space, then a
//! comma-separated group list. A `*` in either list grants everyone;
//! the empty string denies everyone.

use crate::error::CommonError;
use crate::security::UserGroup;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acl {
    users: Vec<String>,
    groups: Vec<String>,
    all_allowed: bool,
}

impl Acl {
    /// Parse an ACL definition string.
    pub fn parse(acl: &str) -> Result<Self, CommonError> {
        let trimmed = acl.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }
        let fields: Vec<&str> = acl.split(' ').collect();
        if fields.len() > 2 {
            return Err(CommonError::ConfigInvalid(format!(
                "ACL has too many fields: '{acl}'"
            )));
        }
        let users = split_list(fields[0]);
        let groups = fields.get(1).map(|f| split_list(f)).unwrap_or_default();
        let all_allowed =
            users.iter().any(|u| u == "*") || groups.iter().any(|g| g == "*");
        Ok(Self {
            users,
            groups,
            all_allowed,
        })
    }

    /// An ACL that grants everyone. Used for the root queue defaults.
    pub fn allow_all() -> Self {
        Self {
            users: Vec::new(),
            groups: Vec::new(),
            all_allowed: true,
        }
    }

    /// Check whether the identity is granted by this ACL.
    pub fn allow_access(&self, user_group: &UserGroup) -> bool {
        if self.all_allowed {
            return true;
        }
        if !user_group.user.is_empty() && self.users.iter().any(|u| *u == user_group.user) {
            return true;
        }
        self.groups.iter().any(|g| user_group.is_member(g))
    }
}

fn split_list(field: &str) -> Vec<String> {
    field
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}
