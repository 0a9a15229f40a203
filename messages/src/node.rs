// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Scheduler-tree node parameters as the firmware consumes them.
//!
//! Mutations of an existing node travel as a full [`NodeUpdate`] struct plus
//! one valid bitmap per parameter group; the firmware applies only the fields
//! whose bits are set. Node additions carry the full parameter set and need
//! no bitmaps.

use crate::QueueMask;
use crate::MAX_PREDECESSORS;
use hubpack::SerializedSize;
use serde::Deserialize;
use serde::Serialize;

/// The position of a node in the scheduling hierarchy.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub enum NodeType {
    /// An egress port, the root of one scheduling subtree.
    Port,
    /// An intermediate scheduler arbitrating among its children.
    Sched,
    /// A leaf queue holding packets.
    Queue,
}

/// How a parent node arbitrates among its children.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub enum Arbitration {
    /// Weighted strict priority.
    Wsp,
    /// Weighted round robin.
    Wrr,
}

bitflags::bitflags! {
    /// Fields of [`CommonParams`] a set-command actually changes.
    #[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
    pub struct CommonValid: u8 {
        const BW_LIMIT      = 0b0000_0001;
        const BURST         = 0b0000_0010;
        const SHARED_GROUP  = 0b0000_0100;
    }
}

bitflags::bitflags! {
    /// Fields of [`ParentParams`] a set-command actually changes.
    #[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
    pub struct ParentValid: u8 {
        const ARBITRATION   = 0b0000_0001;
        const BEST_EFFORT   = 0b0000_0010;
        const CHILD_RANGE   = 0b0000_0100;
    }
}

bitflags::bitflags! {
    /// Fields of [`ChildParams`] a set-command actually changes.
    #[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
    pub struct ChildValid: u8 {
        const WEIGHT        = 0b0000_0001;
        const PREDECESSORS  = 0b0000_0010;
    }
}

bitflags::bitflags! {
    /// Fields of [`PortParams`] a set-command actually changes.
    #[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
    pub struct PortValid: u8 {
        const RING_ADDR     = 0b0000_0001;
        const RING_SIZE     = 0b0000_0010;
        const PACKET_CREDIT = 0b0000_0100;
    }
}

bitflags::bitflags! {
    /// Fields of [`QueueParams`] a set-command actually changes.
    #[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
    pub struct QueueValid: u8 {
        const RLM           = 0b0000_0001;
        const SIZE          = 0b0000_0010;
        const WRED          = 0b0000_0100;
        const CODEL         = 0b0000_1000;
    }
}

/// Bandwidth-shaping parameters common to every node type.
///
/// The bandwidth limit is carried in the firmware's credit domain, already
/// quantized by [`crate::credit::to_credit`]. Zero means unshaped.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct CommonParams {
    /// Credits added per firmware update tick; zero disables the limiter.
    pub credit: u32,
    /// Maximum accumulated credit, in the same units.
    pub burst: u32,
    /// Shared bandwidth-limit group, zero for none.
    pub shared_group: u16,
}

/// Parameters of a node in its role as a parent.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct ParentParams {
    pub arbitration: Arbitration,
    /// Nonzero if a best-effort child slot is enabled below this node.
    pub best_effort: u8,
    /// First child input managed by this node.
    pub child_lo: u16,
    /// Last child input managed by this node, inclusive.
    pub child_hi: u16,
}

impl Default for ParentParams {
    fn default() -> Self {
        Self {
            arbitration: Arbitration::Wrr,
            best_effort: 0,
            child_lo: 0,
            child_hi: 0,
        }
    }
}

/// Parameters of a node in its role as a child of its parent.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct ChildParams {
    /// WRR weight, or priority level under WSP.
    pub weight: u16,
    /// Number of valid entries in `predecessors`.
    pub predecessor_count: u8,
    /// The WRR chain walked to compute effective scheduling, nearest first.
    pub predecessors: [u16; MAX_PREDECESSORS],
}

impl ChildParams {
    /// Build child parameters from a predecessor list of up to
    /// [`MAX_PREDECESSORS`] entries.
    pub fn new(weight: u16, predecessors: &[u16]) -> Result<Self, crate::Error> {
        if predecessors.len() > MAX_PREDECESSORS {
            return Err(crate::Error::TooManyPredecessors(predecessors.len()));
        }
        let mut out = Self {
            weight,
            predecessor_count: predecessors.len() as u8,
            predecessors: [0; MAX_PREDECESSORS],
        };
        out.predecessors[..predecessors.len()].copy_from_slice(predecessors);
        Ok(out)
    }
}

/// Port-only parameters.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct PortParams {
    /// Firmware-addressable (FAT-translated) base of the port's TX ring.
    pub ring_addr: u32,
    /// TX ring size in descriptors.
    pub ring_size: u16,
    /// Packets the port may have in flight toward the MAC.
    pub packet_credit: u16,
}

/// Queue-only parameters.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct QueueParams {
    /// The physical queue-manager identifier backing this queue.
    pub rlm: u16,
    /// Queue capacity, in queue-manager words.
    pub size: u16,
    /// WRED low threshold; dropping starts above it.
    pub wred_min: u16,
    /// WRED high threshold; everything above it drops.
    pub wred_max: u16,
    /// WRED maximum drop probability, in percent.
    pub wred_prob: u8,
    /// Nonzero if CoDel is active on this queue.
    pub codel: u8,
}

/// Payload of an add-port command. Everything is valid; no bitmaps.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct PortAdd {
    pub phy: u16,
    pub common: CommonParams,
    pub parent: ParentParams,
    pub port: PortParams,
}

/// Payload of an add-scheduler command.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct SchedAdd {
    pub phy: u16,
    pub common: CommonParams,
    pub parent: ParentParams,
    pub child: ChildParams,
}

/// Payload of an add-queue command.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct QueueAdd {
    pub phy: u16,
    pub common: CommonParams,
    pub child: ChildParams,
    pub queue: QueueParams,
}

/// Payload of a set-node command: the full parameter set plus one valid
/// bitmap per group. Groups with an empty bitmap are don't-care bytes.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct NodeUpdate {
    pub phy: u16,
    pub node_type: NodeType,
    pub common_valid: CommonValid,
    pub common: CommonParams,
    pub parent_valid: ParentValid,
    pub parent: ParentParams,
    pub child_valid: ChildValid,
    pub child: ChildParams,
    pub port_valid: PortValid,
    pub port: PortParams,
    pub queue_valid: QueueValid,
    pub queue: QueueParams,
}

impl NodeUpdate {
    /// An update whose bitmaps are all empty changes nothing and must not be
    /// transmitted.
    pub fn is_noop(&self) -> bool {
        self.common_valid.is_empty()
            && self.parent_valid.is_empty()
            && self.child_valid.is_empty()
            && self.port_valid.is_empty()
            && self.queue_valid.is_empty()
    }
}

/// Payload of a remove-node command.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct NodeRef {
    pub phy: u16,
    pub node_type: NodeType,
}

/// Payload of a move command, re-homing a queue or scheduler under a new
/// parent.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct NodeMove {
    /// The node being moved.
    pub phy: u16,
    /// The destination parent node.
    pub dst_parent: u16,
    /// The port owning the destination subtree.
    pub dst_port: u16,
    /// The node's weight at its new position.
    pub weight: u16,
}

/// Payload of an update-port-tree command, re-applying a port's subtree after
/// a structural change.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct PortTreeUpdate {
    pub port: u16,
    /// Every queue currently active beneath the port.
    pub active_queues: QueueMask,
}

/// Payload of a suspend-port-tree command, pausing scheduling of a port's
/// subtree ahead of a structural edit.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct PortTreeSuspend {
    pub port: u16,
}

/// Payload of a flush-queue command, draining a queue's packets.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct QueueFlush {
    /// The physical queue-manager identifier to drain.
    pub rlm: u16,
}

#[cfg(test)]
mod tests {
    use super::ChildParams;
    use super::NodeUpdate;
    use super::NodeType;
    use super::CommonValid;
    use super::CommonParams;
    use super::ParentValid;
    use super::ParentParams;
    use super::ChildValid;
    use super::PortValid;
    use super::PortParams;
    use super::QueueValid;
    use super::QueueParams;
    use crate::Error;
    use crate::MAX_PREDECESSORS;

    fn empty_update() -> NodeUpdate {
        NodeUpdate {
            phy: 7,
            node_type: NodeType::Queue,
            common_valid: CommonValid::empty(),
            common: CommonParams::default(),
            parent_valid: ParentValid::empty(),
            parent: ParentParams::default(),
            child_valid: ChildValid::empty(),
            child: ChildParams::default(),
            port_valid: PortValid::empty(),
            port: PortParams::default(),
            queue_valid: QueueValid::empty(),
            queue: QueueParams::default(),
        }
    }

    #[test]
    fn test_empty_bitmaps_are_noop() {
        assert!(empty_update().is_noop());
        let mut update = empty_update();
        update.queue_valid = QueueValid::RLM;
        assert!(!update.is_noop());
    }

    #[test]
    fn test_child_params_predecessor_limit() {
        let preds = [1u16, 2, 3, 4, 5, 6, 7];
        assert_eq!(
            ChildParams::new(10, &preds),
            Err(Error::TooManyPredecessors(7))
        );

        let child = ChildParams::new(10, &preds[..3]).unwrap();
        assert_eq!(child.predecessor_count, 3);
        assert_eq!(child.predecessors[..3], preds[..3]);
        assert_eq!(child.predecessors[3..], [0; MAX_PREDECESSORS - 3]);
    }
}
