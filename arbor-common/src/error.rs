// Copyright 2025 The Arbor Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Shared error types.

/// Errors raised by the common types.
#[derive(Debug, thiserror::Error)]
pub enum CommonError {
    #[error("negative-result: resource type {resource_type} would be {value}")]
    NegativeResult { resource_type: String, value: i64 },

    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("config-invalid: {0}")]
    ConfigInvalid(String),
}

pub type CommonResult<T> = Result<T, CommonError>;
