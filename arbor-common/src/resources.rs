// Copyright 2025 The Arbor Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Resource algebra: multi-dimensional named quantities.
//!
//! A [`Resource`] maps a resource-type name (`memory`, `vcores`, `gpu`, ...)
//! to an integer quantity. The pure operations return fresh values; the
//! in-place mutators are only used where ownership is unambiguous.

use std::collections::HashMap;
use std::fmt;

use crate::error::CommonError;

/// A set of named resource quantities.
///
/// Quantities are signed internally so that subtraction can represent
/// transient drift; [`Resource::sub_error_negative`] is the guarded variant
/// used to detect bookkeeping errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resource {
    resources: HashMap<String, i64>,
}

impl Resource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from a map of resource name → quantity.
    pub fn from_map(map: HashMap<String, i64>) -> Self {
        Self { resources: map }
    }

    /// Parse a resource from the configuration form (name → quantity string).
    ///
    /// Quantities are plain integers with an optional binary suffix
    /// (`Ki`, `Mi`, `Gi`, `Ti`).
    pub fn from_config_map(map: &HashMap<String, String>) -> Result<Self, CommonError> {
        let mut resources = HashMap::with_capacity(map.len());
        for (name, value) in map {
            resources.insert(name.clone(), parse_quantity(value)?);
        }
        Ok(Self { resources })
    }

    /// Get the quantity of a resource type (0 if not present).
    pub fn get(&self, name: &str) -> i64 {
        self.resources.get(name).copied().unwrap_or(0)
    }

    /// Set the quantity of a resource type.
    pub fn set(&mut self, name: impl Into<String>, value: i64) {
        self.resources.insert(name.into(), value);
    }

    /// Iterate over (name, quantity) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.resources.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Whether the type is present. Absent types read as 0 for arithmetic
    /// but as unbounded in limit checks.
    pub fn has_type(&self, name: &str) -> bool {
        self.resources.contains_key(name)
    }

    /// Number of distinct resource types.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Component-wise sum, fresh value.
    pub fn add(&self, other: &Resource) -> Resource {
        let mut out = self.clone();
        out.add_to(other);
        out
    }

    /// Component-wise difference, fresh value. The result may contain
    /// negative quantities.
    pub fn sub(&self, other: &Resource) -> Resource {
        let mut out = self.clone();
        out.sub_from(other);
        out
    }

    /// Component-wise difference that fails when any component would go
    /// negative. Used to detect drift between the optimistic counters and
    /// the confirmed state.
    pub fn sub_error_negative(&self, other: &Resource) -> Result<Resource, CommonError> {
        let out = self.sub(other);
        for (name, value) in out.iter() {
            if value < 0 {
                return Err(CommonError::NegativeResult {
                    resource_type: name.to_string(),
                    value,
                });
            }
        }
        Ok(out)
    }

    /// Scale every quantity by a repeat count, fresh value.
    pub fn multiply(&self, times: i64) -> Resource {
        let resources = self
            .resources
            .iter()
            .map(|(k, v)| (k.clone(), v * times))
            .collect();
        Self { resources }
    }

    /// In-place component-wise add.
    pub fn add_to(&mut self, other: &Resource) {
        for (name, value) in &other.resources {
            *self.resources.entry(name.clone()).or_insert(0) += value;
        }
    }

    /// In-place component-wise subtract. May go negative.
    pub fn sub_from(&mut self, other: &Resource) {
        for (name, value) in &other.resources {
            *self.resources.entry(name.clone()).or_insert(0) -= value;
        }
    }

    /// Check that `smaller` fits in this resource: for every type present in
    /// `smaller`, this value (0 when absent) is at least as large.
    pub fn fit_in(&self, smaller: &Resource) -> bool {
        smaller.iter().all(|(name, value)| self.get(name) >= value)
    }

    /// Limit-style fit: types absent from this resource are unbounded.
    /// Used for max-quota and headroom checks where only configured types
    /// constrain the request.
    pub fn fit_in_max(&self, request: &Resource) -> bool {
        request
            .iter()
            .all(|(name, value)| !self.has_type(name) || self.get(name) >= value)
    }

    /// True when all quantities are zero (or no types are present).
    pub fn is_zero(&self) -> bool {
        self.resources.values().all(|v| *v == 0)
    }

    /// True when at least one quantity is positive and none is negative.
    pub fn strictly_greater_than_zero(&self) -> bool {
        let mut positive = false;
        for value in self.resources.values() {
            if *value < 0 {
                return false;
            }
            if *value > 0 {
                positive = true;
            }
        }
        positive
    }

    /// Component-wise minimum over the union of types, fresh value.
    pub fn component_wise_min(&self, other: &Resource) -> Resource {
        let mut out = Resource::new();
        for name in self.type_union(other) {
            out.set(name.clone(), self.get(&name).min(other.get(&name)));
        }
        out
    }

    /// Component-wise maximum over the union of types, fresh value.
    pub fn component_wise_max(&self, other: &Resource) -> Resource {
        let mut out = Resource::new();
        for name in self.type_union(other) {
            out.set(name.clone(), self.get(&name).max(other.get(&name)));
        }
        out
    }

    fn type_union(&self, other: &Resource) -> Vec<String> {
        let mut names: Vec<String> = self.resources.keys().cloned().collect();
        for name in other.resources.keys() {
            if !self.resources.contains_key(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// The largest per-type share of this usage against a guarantee.
    ///
    /// A type without a positive guarantee contributes its raw usage, so
    /// usage outside the guarantee still counts against fairness.
    pub fn fair_share(&self, guaranteed: &Resource) -> f64 {
        let mut share = 0.0_f64;
        for (name, value) in self.iter() {
            if value == 0 {
                continue;
            }
            let guar = guaranteed.get(name);
            let s = if guar > 0 {
                value as f64 / guar as f64
            } else {
                value as f64
            };
            share = share.max(s);
        }
        share
    }
}

/// Compare two usages against the same guarantee for fairness ordering.
///
/// `Less` means `left` has the smaller share and should be served first.
pub fn comp_usage_ratio(
    left: &Resource,
    right: &Resource,
    guaranteed: &Resource,
) -> std::cmp::Ordering {
    let l = left.fair_share(guaranteed);
    let r = right.fair_share(guaranteed);
    l.partial_cmp(&r).unwrap_or(std::cmp::Ordering::Equal)
}

/// Compare two usages, each against its own guarantee. Used for fairness
/// ordering between sibling queues.
pub fn comp_usage_ratio_separately(
    left: &Resource,
    left_guaranteed: &Resource,
    right: &Resource,
    right_guaranteed: &Resource,
) -> std::cmp::Ordering {
    let l = left.fair_share(left_guaranteed);
    let r = right.fair_share(right_guaranteed);
    l.partial_cmp(&r).unwrap_or(std::cmp::Ordering::Equal)
}

/// Parse a single quantity string: a plain integer with an optional binary
/// suffix.
pub fn parse_quantity(value: &str) -> Result<i64, CommonError> {
    let value = value.trim();
    let parse = |num: &str, scale: i64| -> Result<i64, CommonError> {
        num.parse::<i64>()
            .ok()
            .filter(|v| *v >= 0)
            .map(|v| v * scale)
            .ok_or_else(|| CommonError::InvalidQuantity(value.to_string()))
    };
    if let Some(num) = value.strip_suffix("Ki") {
        parse(num, 1 << 10)
    } else if let Some(num) = value.strip_suffix("Mi") {
        parse(num, 1 << 20)
    } else if let Some(num) = value.strip_suffix("Gi") {
        parse(num, 1 << 30)
    } else if let Some(num) = value.strip_suffix("Ti") {
        parse(num, 1 << 40)
    } else {
        parse(value, 1)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.resources.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        write!(f, "[")?;
        for (i, name) in names.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}:{}", name, self.get(name))?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    fn res(pairs: &[(&str, i64)]) -> Resource {
        let mut r = Resource::new();
        for (name, value) in pairs {
            r.set(*name, *value);
        }
        r
    }

    #[test]
    fn test_add_sub() {
        let a = res(&[("memory", 100), ("vcores", 10)]);
        let b = res(&[("memory", 25)]);

        let sum = a.add(&b);
        assert_eq!(sum.get("memory"), 125);
        assert_eq!(sum.get("vcores"), 10);

        let diff = a.sub(&b);
        assert_eq!(diff.get("memory"), 75);

        // missing types read as zero, so sub can go negative
        let neg = b.sub(&a);
        assert_eq!(neg.get("vcores"), -10);
    }

    #[test]
    fn test_sub_error_negative() {
        let a = res(&[("memory", 10)]);
        let b = res(&[("memory", 15)]);
        assert!(a.sub_error_negative(&b).is_err());
        assert_eq!(b.sub_error_negative(&a).unwrap().get("memory"), 5);
    }

    #[test]
    fn test_multiply() {
        let a = res(&[("memory", 20), ("vcores", 2)]);
        let tripled = a.multiply(3);
        assert_eq!(tripled.get("memory"), 60);
        assert_eq!(tripled.get("vcores"), 6);
        assert!(a.multiply(0).is_zero());
    }

    #[test]
    fn test_fit_in() {
        let node = res(&[("memory", 100), ("vcores", 10)]);
        assert!(node.fit_in(&res(&[("memory", 100)])));
        assert!(!node.fit_in(&res(&[("memory", 101)])));
        // type absent on the larger side counts as zero
        assert!(!node.fit_in(&res(&[("gpu", 1)])));
        // empty request always fits
        assert!(node.fit_in(&Resource::new()));
    }

    #[test]
    fn test_fit_in_max_unbounded_types() {
        let max = res(&[("memory", 50)]);
        assert!(max.fit_in_max(&res(&[("memory", 50), ("vcores", 99)])));
        assert!(!max.fit_in_max(&res(&[("memory", 51)])));
        // an empty limit bounds nothing
        assert!(Resource::new().fit_in_max(&res(&[("memory", 1000)])));
    }

    #[test]
    fn test_zero_predicates() {
        assert!(Resource::new().is_zero());
        assert!(res(&[("memory", 0)]).is_zero());
        assert!(!res(&[("memory", 1)]).is_zero());

        assert!(!Resource::new().strictly_greater_than_zero());
        assert!(res(&[("memory", 1)]).strictly_greater_than_zero());
        assert!(!res(&[("memory", 1), ("vcores", -1)]).strictly_greater_than_zero());
    }

    #[test]
    fn test_component_wise_min_max() {
        let a = res(&[("memory", 100), ("vcores", 1)]);
        let b = res(&[("memory", 50), ("gpu", 2)]);

        let min = a.component_wise_min(&b);
        assert_eq!(min.get("memory"), 50);
        assert_eq!(min.get("vcores"), 0);
        assert_eq!(min.get("gpu"), 0);

        let max = a.component_wise_max(&b);
        assert_eq!(max.get("memory"), 100);
        assert_eq!(max.get("vcores"), 1);
        assert_eq!(max.get("gpu"), 2);
    }

    #[test]
    fn test_comp_usage_ratio() {
        let guar = res(&[("memory", 10)]);
        let low = res(&[("memory", 2)]);
        let high = res(&[("memory", 5)]);
        assert_eq!(comp_usage_ratio(&low, &high, &guar), Ordering::Less);
        assert_eq!(comp_usage_ratio(&high, &low, &guar), Ordering::Greater);
        assert_eq!(comp_usage_ratio(&low, &low, &guar), Ordering::Equal);
    }

    #[test]
    fn test_comp_usage_ratio_missing_guarantee() {
        // usage on a type without a guarantee counts at its raw value
        let guar = res(&[("memory", 10)]);
        let in_guar = res(&[("memory", 5)]);
        let outside = res(&[("gpu", 2)]);
        assert_eq!(comp_usage_ratio(&in_guar, &outside, &guar), Ordering::Less);
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("1024").unwrap(), 1024);
        assert_eq!(parse_quantity("1Ki").unwrap(), 1024);
        assert_eq!(parse_quantity("128Mi").unwrap(), 128 << 20);
        assert_eq!(parse_quantity("2Gi").unwrap(), 2 << 30);
        assert!(parse_quantity("-5").is_err());
        assert!(parse_quantity("lots").is_err());
    }

    #[test]
    fn test_from_config_map() {
        let mut map = HashMap::new();
        map.insert("memory".to_string(), "1Gi".to_string());
        map.insert("vcores".to_string(), "4".to_string());
        let r = Resource::from_config_map(&map).unwrap();
        assert_eq!(r.get("memory"), 1 << 30);
        assert_eq!(r.get("vcores"), 4);
    }
}
