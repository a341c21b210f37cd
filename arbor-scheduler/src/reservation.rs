// Copyright 2025 The Arbor Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! A reservation holds a node for one (application, ask) pair.
//!
//! Reservations are indexed three ways: on the node (by `appID|askKey`),
//! on the application (by the full `appID|askKey|nodeID`), and counted per
//! application on the partition.

use arbor_common::resources::Resource;

pub const RESERVATION_SEPARATOR: char = '|';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub app_id: String,
    pub ask_key: String,
    pub node_id: String,
    pub resource: Resource,
}

impl Reservation {
    pub fn new(
        app_id: impl Into<String>,
        ask_key: impl Into<String>,
        node_id: impl Into<String>,
        resource: Resource,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            ask_key: ask_key.into(),
            node_id: node_id.into(),
            resource,
        }
    }

    /// The key used on the node index: `appID|askKey`.
    pub fn node_key(&self) -> String {
        node_reservation_key(&self.app_id, &self.ask_key)
    }

    /// The canonical key used on the application index:
    /// `appID|askKey|nodeID`.
    pub fn full_key(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            self.app_id,
            self.ask_key,
            self.node_id,
            sep = RESERVATION_SEPARATOR
        )
    }
}

pub fn node_reservation_key(app_id: &str, ask_key: &str) -> String {
    format!("{app_id}{RESERVATION_SEPARATOR}{ask_key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        let r = Reservation::new("app-1", "ask-1", "node-1", Resource::new());
        assert_eq!(r.node_key(), "app-1|ask-1");
        assert_eq!(r.full_key(), "app-1|ask-1|node-1");
    }
}
