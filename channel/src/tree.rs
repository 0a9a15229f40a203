// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The scheduler-tree database collaborator.
//!
//! The channel does not own the tree: node/port/queue objects, the
//! logical-to-physical id mapping, and parent/child bookkeeping live in the
//! driver's node database. The channel only reads snapshots from it while
//! encoding commands, and writes back the quantized bandwidth each command
//! actually configured. Callers hold the database's configuration lock
//! across every channel operation, which is what serializes access to the
//! firmware ring.

use hqos_messages::node::Arbitration;
use hqos_messages::node::NodeType;
use hqos_messages::QueueMask;
use slog::Logger;

/// A node's user-visible identifier.
pub type LogicalId = u32;

/// A node's identifier in the scheduler hardware's namespace.
pub type PhyId = u16;

/// Port-only configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PortSettings {
    /// Host-physical base of the port's TX ring; FAT-translated when
    /// encoded for the firmware.
    pub ring_addr: u64,
    pub ring_size: u16,
    pub packet_credit: u16,
}

/// Queue-only configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct QueueSettings {
    pub rlm: u16,
    pub size: u16,
    pub wred_min: u16,
    pub wred_max: u16,
    pub wred_prob: u8,
    pub codel: bool,
}

/// The full desired (or applied) configuration of one node.
///
/// Fields that do not apply to a node's type are ignored when encoding:
/// ports have no child-role fields, queues no parent-role fields.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NodeSettings {
    /// Requested bandwidth limit in kbps; zero means unshaped.
    pub bandwidth_kbps: u32,
    pub burst: u32,
    pub shared_group: u16,
    pub arbitration: Arbitration,
    pub best_effort: bool,
    pub child_lo: u16,
    pub child_hi: u16,
    pub weight: u16,
    pub port: PortSettings,
    pub queue: QueueSettings,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            bandwidth_kbps: 0,
            burst: 0,
            shared_group: 0,
            arbitration: Arbitration::Wrr,
            best_effort: false,
            child_lo: 0,
            child_hi: 0,
            weight: 1,
            port: PortSettings::default(),
            queue: QueueSettings::default(),
        }
    }
}

/// A snapshot of one node as the tree database currently knows it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NodeView {
    pub phy: PhyId,
    pub node_type: NodeType,
    /// The node's parent, or its own phy for a port.
    pub parent: PhyId,
    pub settings: NodeSettings,
}

pub trait TreeDb {
    /// Look up a node snapshot by its physical id.
    fn node_by_phy(&self, phy: PhyId) -> Option<NodeView>;

    /// Resolve a user-visible id to the hardware's.
    fn phy_of_logical(&self, id: LogicalId) -> Option<PhyId>;

    /// The port owning the subtree `phy` belongs to.
    fn port_of(&self, phy: PhyId) -> Option<PhyId>;

    /// The node's WRR predecessor chain, nearest first. The database tracks
    /// at most [`hqos_messages::MAX_PREDECESSORS`]; the encoder rejects
    /// anything longer.
    fn predecessors_of(&self, phy: PhyId) -> Vec<PhyId>;

    /// Every queue currently active beneath a port.
    fn active_queues_of(&self, port: PhyId) -> QueueMask;

    /// Record the bandwidth the firmware will actually enforce for `phy`,
    /// after credit quantization.
    fn set_actual_bandwidth(&mut self, phy: PhyId, kbps: u32);

    /// Log the full tree state, for postmortem after a channel fault.
    fn dump(&self, log: &Logger);
}
