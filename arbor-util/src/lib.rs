// Copyright 2025 The Arbor Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Utility library for Arbor.
//!
//! Provides the sorted linked map, logging setup, and time helpers.

pub mod logging;
pub mod sorted_linked_map;
pub mod time;
