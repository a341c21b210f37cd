// Copyright 2025 The Arbor Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Qualified partition names.
//!
//! A partition is qualified with the resource manager it belongs to as
//! `[rmID]name` so that one scheduler can serve several RMs.

pub const DEFAULT_PARTITION: &str = "default";

/// Qualify a partition name with its RM. An empty name maps to the default
/// partition; an already qualified name is returned unchanged.
pub fn normalized_partition_name(partition_name: &str, rm_id: &str) -> String {
    let name = if partition_name.is_empty() {
        DEFAULT_PARTITION
    } else {
        partition_name
    };
    if name.starts_with('[') {
        return name.to_string();
    }
    format!("[{rm_id}]{name}")
}

/// Extract the RM from a qualified partition name, empty when unqualified.
pub fn rm_id_from_partition_name(partition_name: &str) -> &str {
    match partition_name.find(']') {
        Some(idx) if idx > 0 => &partition_name[1..idx],
        _ => "",
    }
}

/// Strip the RM qualifier from a partition name.
pub fn partition_name_without_rm(partition_name: &str) -> &str {
    match partition_name.find(']') {
        Some(idx) if idx > 0 => &partition_name[idx + 1..],
        _ => partition_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalized_partition_name("", "rm-1"), "[rm-1]default");
        assert_eq!(normalized_partition_name("gpu", "rm-1"), "[rm-1]gpu");
        assert_eq!(normalized_partition_name("[rm-1]gpu", "rm-2"), "[rm-1]gpu");
    }

    #[test]
    fn test_split() {
        assert_eq!(rm_id_from_partition_name("[rm-1]gpu"), "rm-1");
        assert_eq!(rm_id_from_partition_name("gpu"), "");
        assert_eq!(partition_name_without_rm("[rm-1]gpu"), "gpu");
        assert_eq!(partition_name_without_rm("gpu"), "gpu");
    }
}
