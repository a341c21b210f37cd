// Copyright 2025 The Arbor Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Scheduler error types.

use arbor_common::error::CommonError;

/// Errors raised by the scheduling core.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("quota-exceeded: queue {queue} cannot fit {requested}")]
    QuotaExceeded { queue: String, requested: String },

    #[error("placement-denied: {0}")]
    PlacementDenied(String),

    #[error("stale-ask: ask {ask_key} removed while allocating for {app_id}")]
    StaleAsk { app_id: String, ask_key: String },

    #[error("duplicate-entity: {kind} {id} already exists")]
    DuplicateEntity { kind: &'static str, id: String },

    #[error("missing-entity: {kind} {id} does not exist")]
    MissingEntity { kind: &'static str, id: String },

    #[error("reservation-conflict: node {node_id} is already reserved")]
    ReservationConflict { node_id: String },

    #[error("invalid state transition: {event} in state {state}")]
    InvalidStateTransition { state: &'static str, event: &'static str },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Common(#[from] CommonError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
