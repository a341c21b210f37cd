// Copyright 2025 The Arbor Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Caller identity: a user with its resolved groups.

/// The identity an application is submitted with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserGroup {
    pub user: String,
    pub groups: Vec<String>,
}

impl UserGroup {
    pub fn new(user: impl Into<String>, groups: Vec<String>) -> Self {
        Self {
            user: user.into(),
            groups,
        }
    }

    /// An identity with just a user name and no group resolution.
    pub fn user_only(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            groups: Vec::new(),
        }
    }

    pub fn is_member(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}
