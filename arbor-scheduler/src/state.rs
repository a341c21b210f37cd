// Copyright 2025 The Arbor Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Application lifecycle state machine.
//!
//! Only the listed (state, event) pairs transition; any other event leaves
//! the state untouched and returns an error.

use crate::error::SchedulerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationState {
    New,
    Accepted,
    Starting,
    Running,
    Waiting,
    Rejected,
    Completed,
    Killed,
    Deleting,
}

impl ApplicationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Accepted => "Accepted",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Waiting => "Waiting",
            Self::Rejected => "Rejected",
            Self::Completed => "Completed",
            Self::Killed => "Killed",
            Self::Deleting => "Deleting",
        }
    }

    /// Terminal states never leave the scheduler again via Run/Wait.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Killed | Self::Deleting)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationEvent {
    Run,
    Wait,
    Reject,
    Complete,
    Kill,
    Delete,
}

impl ApplicationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "Run",
            Self::Wait => "Wait",
            Self::Reject => "Reject",
            Self::Complete => "Complete",
            Self::Kill => "Kill",
            Self::Delete => "Delete",
        }
    }
}

/// Compute the state an event transitions to. Errors on any pair outside
/// the transition table.
pub fn transition(
    state: ApplicationState,
    event: ApplicationEvent,
) -> Result<ApplicationState, SchedulerError> {
    use ApplicationEvent as E;
    use ApplicationState as S;

    let next = match (state, event) {
        (S::New, E::Reject) => S::Rejected,
        (S::New, E::Run) => S::Accepted,
        (S::Accepted, E::Run) => S::Starting,
        (S::Starting | S::Running | S::Waiting, E::Run) => S::Running,
        (S::Starting | S::Running | S::Waiting, E::Complete) => S::Completed,
        (S::Accepted | S::Starting | S::Running, E::Wait) => S::Waiting,
        (
            S::New | S::Accepted | S::Starting | S::Running | S::Waiting | S::Killed,
            E::Kill,
        ) => S::Killed,
        (S::Completed, E::Delete) => S::Deleting,
        _ => {
            return Err(SchedulerError::InvalidStateTransition {
                state: state.as_str(),
                event: event.as_str(),
            })
        }
    };
    Ok(next)
}
