// Copyright 2025 The Arbor Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Common types for Arbor: resources, identity, ACLs, configuration, errors.

pub mod acl;
pub mod config;
pub mod error;
pub mod partition_name;
pub mod resources;
pub mod security;
