// Copyright 2025 The Arbor Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Logging setup using the `tracing` ecosystem.

use tracing_subscriber::EnvFilter;

/// Initialize logging for a scheduler component.
///
/// The filter comes from `ARBOR_LOG` or `RUST_LOG`, falling back to the
/// verbosity argument. Safe to call once per process; later calls are
/// ignored.
pub fn init_logging(component: &str, verbosity: i32) {
    let filter = EnvFilter::try_from_env("ARBOR_LOG")
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| {
            let level = match verbosity {
                0 => "info",
                1 => "debug",
                _ => "trace",
            };
            EnvFilter::new(level)
        });

    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    if result.is_ok() {
        tracing::info!(component, "logging initialized");
    }
}
