// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Turning tree mutations into wire commands.
//!
//! Additions always carry a node's full parameter set. Mutations of an
//! existing node are diffed against the tree database's snapshot per
//! parameter group, and only groups with an actual change get their valid
//! bits set; an update whose bitmaps all come out empty is suppressed by
//! the caller rather than transmitted. Bandwidth comparisons happen in the
//! credit domain, so a kbps change too small to alter the quantized credit
//! is itself a no-op.

use crate::fat::FatTable;
use crate::tree::NodeSettings;
use crate::tree::NodeView;
use crate::tree::PhyId;
use crate::Error;
use hqos_messages::command::CmdBody;
use hqos_messages::credit;
use hqos_messages::node::ChildParams;
use hqos_messages::node::ChildValid;
use hqos_messages::node::CommonParams;
use hqos_messages::node::CommonValid;
use hqos_messages::node::NodeType;
use hqos_messages::node::NodeUpdate;
use hqos_messages::node::ParentParams;
use hqos_messages::node::ParentValid;
use hqos_messages::node::PortAdd;
use hqos_messages::node::PortParams;
use hqos_messages::node::PortValid;
use hqos_messages::node::QueueAdd;
use hqos_messages::node::QueueParams;
use hqos_messages::node::QueueValid;
use hqos_messages::node::SchedAdd;

fn common_wire(settings: &NodeSettings, updates_per_sec: u32) -> CommonParams {
    CommonParams {
        credit: credit::to_credit(settings.bandwidth_kbps, updates_per_sec),
        burst: settings.burst,
        shared_group: settings.shared_group,
    }
}

fn parent_wire(settings: &NodeSettings) -> ParentParams {
    ParentParams {
        arbitration: settings.arbitration,
        best_effort: settings.best_effort as u8,
        child_lo: settings.child_lo,
        child_hi: settings.child_hi,
    }
}

fn child_wire(settings: &NodeSettings, predecessors: &[PhyId]) -> Result<ChildParams, Error> {
    ChildParams::new(settings.weight, predecessors).map_err(Error::from)
}

fn port_wire(settings: &NodeSettings, fat: &FatTable) -> Result<PortParams, Error> {
    let translated = fat.translate(settings.port.ring_addr);
    let ring_addr = u32::try_from(translated).map_err(|_| Error::Unmappable {
        addr: settings.port.ring_addr,
    })?;
    Ok(PortParams {
        ring_addr,
        ring_size: settings.port.ring_size,
        packet_credit: settings.port.packet_credit,
    })
}

fn queue_wire(settings: &NodeSettings) -> QueueParams {
    QueueParams {
        rlm: settings.queue.rlm,
        size: settings.queue.size,
        wred_min: settings.queue.wred_min,
        wred_max: settings.queue.wred_max,
        wred_prob: settings.queue.wred_prob,
        codel: settings.queue.codel as u8,
    }
}

/// Build the payload configuring a new port.
pub(crate) fn port_add(
    view: &NodeView,
    updates_per_sec: u32,
    fat: &FatTable,
) -> Result<CmdBody, Error> {
    Ok(CmdBody::AddPort(PortAdd {
        phy: view.phy,
        common: common_wire(&view.settings, updates_per_sec),
        parent: parent_wire(&view.settings),
        port: port_wire(&view.settings, fat)?,
    }))
}

/// Build the payload configuring a new scheduler.
pub(crate) fn sched_add(
    view: &NodeView,
    predecessors: &[PhyId],
    updates_per_sec: u32,
) -> Result<CmdBody, Error> {
    Ok(CmdBody::AddSched(SchedAdd {
        phy: view.phy,
        common: common_wire(&view.settings, updates_per_sec),
        parent: parent_wire(&view.settings),
        child: child_wire(&view.settings, predecessors)?,
    }))
}

/// Build the payload configuring a new queue.
pub(crate) fn queue_add(
    view: &NodeView,
    predecessors: &[PhyId],
    updates_per_sec: u32,
) -> Result<CmdBody, Error> {
    Ok(CmdBody::AddQueue(QueueAdd {
        phy: view.phy,
        common: common_wire(&view.settings, updates_per_sec),
        child: child_wire(&view.settings, predecessors)?,
        queue: queue_wire(&view.settings),
    }))
}

/// Diff a node's current snapshot against a requested configuration,
/// producing the update payload with per-group valid bitmaps.
///
/// Predecessor chains never appear here: they only change through move
/// commands, after which the firmware recomputes them during the port-tree
/// update.
pub(crate) fn diff_node(
    phy: PhyId,
    node_type: NodeType,
    old: &NodeSettings,
    new: &NodeSettings,
    updates_per_sec: u32,
    fat: &FatTable,
) -> Result<NodeUpdate, Error> {
    let mut update = NodeUpdate {
        phy,
        node_type,
        common_valid: CommonValid::empty(),
        common: common_wire(new, updates_per_sec),
        parent_valid: ParentValid::empty(),
        parent: parent_wire(new),
        child_valid: ChildValid::empty(),
        child: child_wire(new, &[])?,
        port_valid: PortValid::empty(),
        port: PortParams::default(),
        queue_valid: QueueValid::empty(),
        queue: queue_wire(new),
    };

    let old_credit = credit::to_credit(old.bandwidth_kbps, updates_per_sec);
    if update.common.credit != old_credit {
        update.common_valid |= CommonValid::BW_LIMIT;
    }
    if new.burst != old.burst {
        update.common_valid |= CommonValid::BURST;
    }
    if new.shared_group != old.shared_group {
        update.common_valid |= CommonValid::SHARED_GROUP;
    }

    if node_type != NodeType::Queue {
        if new.arbitration != old.arbitration {
            update.parent_valid |= ParentValid::ARBITRATION;
        }
        if new.best_effort != old.best_effort {
            update.parent_valid |= ParentValid::BEST_EFFORT;
        }
        if (new.child_lo, new.child_hi) != (old.child_lo, old.child_hi) {
            update.parent_valid |= ParentValid::CHILD_RANGE;
        }
    }

    if node_type != NodeType::Port && new.weight != old.weight {
        update.child_valid |= ChildValid::WEIGHT;
    }

    if node_type == NodeType::Port {
        update.port = port_wire(new, fat)?;
        let old_port = port_wire(old, fat)?;
        if update.port.ring_addr != old_port.ring_addr {
            update.port_valid |= PortValid::RING_ADDR;
        }
        if update.port.ring_size != old_port.ring_size {
            update.port_valid |= PortValid::RING_SIZE;
        }
        if update.port.packet_credit != old_port.packet_credit {
            update.port_valid |= PortValid::PACKET_CREDIT;
        }
    }

    if node_type == NodeType::Queue {
        let old_queue = queue_wire(old);
        if update.queue.rlm != old_queue.rlm {
            update.queue_valid |= QueueValid::RLM;
        }
        if update.queue.size != old_queue.size {
            update.queue_valid |= QueueValid::SIZE;
        }
        let wred_changed = (update.queue.wred_min, update.queue.wred_max, update.queue.wred_prob)
            != (old_queue.wred_min, old_queue.wred_max, old_queue.wred_prob);
        if wred_changed {
            update.queue_valid |= QueueValid::WRED;
        }
        if update.queue.codel != old_queue.codel {
            update.queue_valid |= QueueValid::CODEL;
        }
    }

    Ok(update)
}

/// Whether an update rearranges the shape of the scheduling subtree, as
/// opposed to retuning parameters in place. Structural edits require the
/// owning port's tree to be paused and reapplied by the firmware.
pub(crate) fn is_structural(update: &NodeUpdate) -> bool {
    update
        .parent_valid
        .intersects(ParentValid::ARBITRATION | ParentValid::CHILD_RANGE)
}
