// Copyright 2025 The Arbor Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The cluster context and the event boundary.
//!
//! One scheduler process serves one or more partitions. RM-side requests
//! arrive as events; registration and configuration updates answer over a
//! oneshot reply channel, allocation proposals leave through the outbound
//! event stream toward the cache and the RM.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use arbor_common::config::SchedulerConfig;
use arbor_common::partition_name::normalized_partition_name;
use arbor_common::resources::Resource;
use arbor_common::security::UserGroup;

use crate::allocation::{AllocationAsk, AllocationProposal};
use crate::application::Application;
use crate::error::SchedulerResult;
use crate::node::Node;
use crate::partition::PartitionContext;
use crate::state::ApplicationEvent;

// ─── inbound events ─────────────────────────────────────────────────────

pub struct NodeSpec {
    pub node_id: String,
    pub partition: String,
    pub capacity: Resource,
    pub occupied: Resource,
}

pub struct AppSpec {
    pub app_id: String,
    pub partition: String,
    pub queue: String,
    pub user: UserGroup,
    pub tags: HashMap<String, String>,
}

pub struct EntityRef {
    pub partition: String,
    pub id: String,
}

pub struct AskSpec {
    pub partition: String,
    pub ask: AllocationAsk,
}

pub struct AskRemoval {
    pub partition: String,
    pub app_id: String,
    /// Empty removes all asks of the application.
    pub ask_key: String,
}

pub struct AllocationRelease {
    pub partition: String,
    pub app_id: String,
    pub node_id: String,
    pub resource: Resource,
}

/// A batched RM update.
#[derive(Default)]
pub struct UpdateRequest {
    pub new_nodes: Vec<NodeSpec>,
    pub removed_nodes: Vec<EntityRef>,
    pub new_applications: Vec<AppSpec>,
    pub removed_applications: Vec<EntityRef>,
    pub new_asks: Vec<AskSpec>,
    pub removed_asks: Vec<AskRemoval>,
    pub released_allocations: Vec<AllocationRelease>,
}

/// RM registration: replaces any previous state for that RM and answers
/// synchronously over the reply channel.
pub struct RegistrationRequest {
    pub rm_id: String,
    pub config: String,
    pub reply: oneshot::Sender<SchedulerResult<()>>,
}

/// Configuration reload, synchronous reply.
pub struct ConfigUpdateRequest {
    pub config: String,
    pub reply: oneshot::Sender<SchedulerResult<()>>,
}

/// Everything the scheduler consumes.
pub enum InboundEvent {
    Registration(RegistrationRequest),
    ConfigUpdate(ConfigUpdateRequest),
    Update(Box<UpdateRequest>),
    /// Cache verdict on a proposal.
    Confirmation {
        partition: String,
        proposal: AllocationProposal,
        confirmed: bool,
    },
}

// ─── outbound events ────────────────────────────────────────────────────

/// Everything the scheduler emits toward the cache and the RM.
#[derive(Debug)]
pub enum OutboundEvent {
    /// An optimistic allocation for the cache to confirm or reject.
    AllocationProposed(AllocationProposal),
    ApplicationAccepted {
        app_id: String,
    },
    ApplicationRejected {
        app_id: String,
        reason: String,
    },
    NodeAccepted {
        node_id: String,
    },
    NodeRejected {
        node_id: String,
        reason: String,
    },
    AskRejected {
        app_id: String,
        ask_key: String,
        reason: String,
    },
}

// ─── cluster context ────────────────────────────────────────────────────

pub struct ClusterContext {
    rm_id: RwLock<String>,
    partitions: RwLock<HashMap<String, Arc<PartitionContext>>>,
    events_tx: mpsc::UnboundedSender<OutboundEvent>,
    stop: AtomicBool,
    config_checksum: RwLock<Vec<u8>>,
}

impl ClusterContext {
    /// Create the context plus the outbound event stream the cache/RM
    /// boundary drains.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(Self {
            rm_id: RwLock::new(String::new()),
            partitions: RwLock::new(HashMap::new()),
            events_tx: tx,
            stop: AtomicBool::new(false),
            config_checksum: RwLock::new(Vec::new()),
        });
        (ctx, rx)
    }

    pub fn rm_id(&self) -> String {
        self.rm_id.read().clone()
    }

    pub fn get_partition(&self, name: &str) -> Option<Arc<PartitionContext>> {
        let qualified = normalized_partition_name(name, &self.rm_id());
        self.partitions.read().get(&qualified).cloned()
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.read().len()
    }

    pub fn config_checksum(&self) -> Vec<u8> {
        self.config_checksum.read().clone()
    }

    /// Register an RM: parse the configuration and build the partitions.
    pub fn register_rm(&self, rm_id: &str, config: &str) -> SchedulerResult<()> {
        let conf = SchedulerConfig::load_from_str(config)?;
        let mut partitions = HashMap::new();
        for partition_cfg in &conf.partitions {
            let partition = PartitionContext::from_config(partition_cfg, rm_id)?;
            partitions.insert(partition.name.clone(), partition);
        }
        *self.rm_id.write() = rm_id.to_string();
        *self.partitions.write() = partitions;
        *self.config_checksum.write() = conf.checksum.clone();
        info!(rm_id, partitions = conf.partitions.len(), "resource manager registered");
        Ok(())
    }

    /// Reload the configuration: update existing partitions in place,
    /// create new ones, mark the queue trees of removed partitions for
    /// draining. The checksum detects no-op reloads.
    pub fn update_config(&self, config: &str) -> SchedulerResult<()> {
        let conf = SchedulerConfig::load_from_str(config)?;
        if conf.checksum == *self.config_checksum.read() {
            debug!("configuration unchanged, skipping reload");
            return Ok(());
        }
        let rm_id = self.rm_id();
        let mut partitions = self.partitions.write();
        let mut seen: Vec<String> = Vec::new();
        for partition_cfg in &conf.partitions {
            let qualified = normalized_partition_name(&partition_cfg.name, &rm_id);
            seen.push(qualified.clone());
            match partitions.get(&qualified) {
                Some(partition) => partition.update_config(partition_cfg)?,
                None => {
                    let partition = PartitionContext::from_config(partition_cfg, &rm_id)?;
                    partitions.insert(qualified, partition);
                }
            }
        }
        for (name, partition) in partitions.iter() {
            if !seen.contains(name) {
                info!(partition = %name, "partition removed from configuration, draining");
                partition.root().mark_for_removal();
            }
        }
        *self.config_checksum.write() = conf.checksum;
        Ok(())
    }

    // ─── event handling ─────────────────────────────────────────────────

    /// Dispatch one inbound event. Registration and config updates answer
    /// over their reply channel; update batches emit outbound events.
    pub fn process_event(&self, event: InboundEvent) {
        match event {
            InboundEvent::Registration(request) => {
                let result = self.register_rm(&request.rm_id, &request.config);
                let _ = request.reply.send(result);
            }
            InboundEvent::ConfigUpdate(request) => {
                let result = self.update_config(&request.config);
                let _ = request.reply.send(result);
            }
            InboundEvent::Update(update) => self.handle_update(*update),
            InboundEvent::Confirmation {
                partition,
                proposal,
                confirmed,
            } => {
                if let Some(partition) = self.get_partition(&partition) {
                    if let Err(err) = partition.confirm_allocation(&proposal, confirmed) {
                        warn!(%err, "allocation confirmation failed");
                    }
                } else {
                    warn!(partition = %partition, "confirmation for unknown partition");
                }
            }
        }
    }

    /// Drain inbound events until the channel closes or the context is
    /// stopped. Runs on its own thread next to the scheduling driver.
    pub fn run_event_loop(&self, mut events: mpsc::UnboundedReceiver<InboundEvent>) {
        while !self.stop.load(Ordering::Relaxed) {
            match events.blocking_recv() {
                Some(event) => self.process_event(event),
                None => break,
            }
        }
    }

    fn handle_update(&self, update: UpdateRequest) {
        for spec in update.new_nodes {
            let Some(partition) = self.get_partition(&spec.partition) else {
                self.emit(OutboundEvent::NodeRejected {
                    node_id: spec.node_id,
                    reason: format!("unknown partition {}", spec.partition),
                });
                continue;
            };
            let node = Arc::new(Node::new(spec.node_id.clone(), spec.capacity, spec.occupied));
            match partition.add_node(node) {
                Ok(()) => self.emit(OutboundEvent::NodeAccepted {
                    node_id: spec.node_id,
                }),
                Err(err) => self.emit(OutboundEvent::NodeRejected {
                    node_id: spec.node_id,
                    reason: err.to_string(),
                }),
            }
        }
        for node_ref in update.removed_nodes {
            if let Some(partition) = self.get_partition(&node_ref.partition) {
                partition.remove_node(&node_ref.id);
            }
        }
        for spec in update.new_applications {
            let Some(partition) = self.get_partition(&spec.partition) else {
                self.emit(OutboundEvent::ApplicationRejected {
                    app_id: spec.app_id,
                    reason: format!("unknown partition {}", spec.partition),
                });
                continue;
            };
            let app = Application::new(spec.app_id.clone(), spec.user, spec.queue, spec.tags);
            match partition.add_application(app.clone()) {
                Ok(()) => self.emit(OutboundEvent::ApplicationAccepted {
                    app_id: spec.app_id,
                }),
                Err(err) => {
                    let _ = app.handle_event(ApplicationEvent::Reject);
                    self.emit(OutboundEvent::ApplicationRejected {
                        app_id: spec.app_id,
                        reason: err.to_string(),
                    });
                }
            }
        }
        for app_ref in update.removed_applications {
            if let Some(partition) = self.get_partition(&app_ref.partition) {
                if let Err(err) = partition.remove_application(&app_ref.id) {
                    debug!(app_id = %app_ref.id, %err, "application removal skipped");
                }
            }
        }
        for spec in update.new_asks {
            let Some(partition) = self.get_partition(&spec.partition) else {
                continue;
            };
            let app_id = spec.ask.app_id.clone();
            let ask_key = spec.ask.allocation_key.clone();
            match partition.get_application(&app_id) {
                Some(app) => {
                    if let Err(err) = app.add_ask(spec.ask) {
                        self.emit(OutboundEvent::AskRejected {
                            app_id,
                            ask_key,
                            reason: err.to_string(),
                        });
                    }
                }
                None => self.emit(OutboundEvent::AskRejected {
                    app_id,
                    ask_key,
                    reason: "application does not exist".to_string(),
                }),
            }
        }
        for removal in update.removed_asks {
            if let Some(partition) = self.get_partition(&removal.partition) {
                if let Err(err) = partition.remove_ask(&removal.app_id, &removal.ask_key) {
                    debug!(app_id = %removal.app_id, %err, "ask removal skipped");
                }
            }
        }
        for release in update.released_allocations {
            if let Some(partition) = self.get_partition(&release.partition) {
                if let Err(err) = partition.release_allocation(
                    &release.app_id,
                    &release.node_id,
                    &release.resource,
                ) {
                    debug!(app_id = %release.app_id, %err, "allocation release skipped");
                }
            }
        }
    }

    fn emit(&self, event: OutboundEvent) {
        if self.events_tx.send(event).is_err() {
            debug!("outbound event stream closed");
        }
    }

    // ─── scheduling driver ──────────────────────────────────────────────

    /// One scheduling pass over all partitions: reserved allocations
    /// first, then the regular descent. Returns the number of decisions
    /// made; proposals leave through the outbound stream.
    pub fn schedule_once(&self) -> usize {
        let partitions: Vec<Arc<PartitionContext>> =
            self.partitions.read().values().cloned().collect();
        let mut decisions = 0;
        for partition in partitions {
            let alloc = partition
                .try_reserved_allocate()
                .or_else(|| partition.try_allocate());
            if let Some(alloc) = alloc {
                decisions += 1;
                if partition.allocate(&alloc) {
                    self.emit(OutboundEvent::AllocationProposed(
                        AllocationProposal::from_allocation(&alloc),
                    ));
                }
            }
        }
        decisions
    }

    /// The scheduling loop: run passes until stopped, backing off when a
    /// pass makes no progress.
    pub fn run(&self, idle_interval: Duration) {
        info!("starting scheduling driver");
        while !self.stop.load(Ordering::Relaxed) {
            if self.schedule_once() == 0 {
                std::thread::sleep(idle_interval);
            }
        }
        info!("scheduling driver stopped");
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
