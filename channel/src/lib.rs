// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Host-side command channel to the hierarchical-QoS scheduler firmware.
//!
//! The driver never programs the scheduling hardware directly. Every
//! configuration change is a fixed-layout command (see [`hqos_messages`])
//! batched into a shared-memory ring, signaled by doorbell, and confirmed by
//! polling per-command completion flags the firmware writes in place. The
//! [`Channel`] type owns that whole exchange: the command/pending queue
//! pair, the firmware address-translation table, the suspend-port set, and
//! the poisoned state the channel enters on any protocol desync.

mod channel;
mod config;
mod encode;
mod fat;
mod hardware;
mod queues;
mod ring;
mod tree;

#[cfg(test)]
pub(crate) mod test_utils;

pub use crate::channel::Channel;
pub use crate::channel::ChannelStats;
pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::fat::FatRegions;
pub use crate::fat::FatTable;
pub use crate::fat::MemRegion;
pub use crate::hardware::Hardware;
pub use crate::tree::LogicalId;
pub use crate::tree::NodeSettings;
pub use crate::tree::NodeView;
pub use crate::tree::PhyId;
pub use crate::tree::PortSettings;
pub use crate::tree::QueueSettings;
pub use crate::tree::TreeDb;
pub use hqos_messages::node::NodeType;

use hqos_messages::MAX_PORTS;

/// Why a channel declared itself desynchronized from the firmware.
///
/// Any of these means the driver can no longer trust its view of the
/// scheduler state; the channel poisons itself and only a firmware-link
/// restart by the embedding layer can recover.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum DesyncReason {
    #[error("no completion for command {seq} after {polls} polls")]
    PollTimeout { seq: u16, polls: u32 },

    #[error("firmware reported failure {flags:#x} for command {seq}")]
    FirmwareFault { seq: u16, flags: u32 },

    #[error("guard word reads {found:#010x}, expected {expected:#010x}")]
    GuardCorrupted { found: u32, expected: u32 },

    #[error("batch accounting mismatch: pushed {pushed}, popped {popped}")]
    BatchAccounting { pushed: usize, popped: usize },

    #[error("pending queue was not empty at batch transmit")]
    PendingResidue,

    #[error("pending queue entry is unparseable")]
    PendingCorrupt,

    #[error("write cursor {cursor:#x} ran past the command ring")]
    RingOverrun { cursor: usize },

    #[error("response for command {seq} overruns its {size}-byte window")]
    ResponseOverrun { seq: u16, size: u16 },

    #[error("no response collected for completed command {seq}")]
    MissingResponse { seq: u16 },
}

/// Errors surfaced by the command channel.
///
/// Everything except [`Error::Desynced`] is recoverable: the offending
/// request was not transmitted (or was cleanly discarded) and the channel
/// remains usable. `Desynced` is sticky; see [`DesyncReason`].
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("no node with logical id {0}")]
    UnknownLogicalId(LogicalId),

    #[error("no node with phy id {0}")]
    UnknownPhy(PhyId),

    #[error("node {phy} is a {actual:?}, not a {expected:?}")]
    WrongNodeType {
        phy: PhyId,
        expected: NodeType,
        actual: NodeType,
    },

    #[error("node {phy} has no owning port")]
    NoOwningPort { phy: PhyId },

    #[error("command of {size} bytes exceeds the {limit}-byte ceiling")]
    CommandTooLarge { size: usize, limit: usize },

    #[error("command queue cannot accept {needed} more bytes")]
    QueueFull { needed: usize },

    #[error("suspend set cannot track more than {MAX_PORTS} ports")]
    SuspendSetFull,

    #[error("response buffer cannot fit another {needed}-byte response")]
    ResponseBufferFull { needed: usize },

    /// The firmware address table is full; see [`FatTable::add_entry`].
    #[error("no free address-translation entry for {addr:#x}")]
    NoSpace { addr: u64 },

    /// A region handed to [`FatTable::configure`] crosses an alias-window
    /// boundary.
    #[error("region at {base:#x} does not fit one {window:#x}-byte alias window")]
    TooBig { base: u64, window: u64 },

    #[error("address {addr:#x} is not reachable through the firmware address table")]
    Unmappable { addr: u64 },

    #[error("shared-memory access out of bounds: offset {offset:#x}, len {len}")]
    OutOfBounds { offset: usize, len: usize },

    #[error("firmware did not signal ready within {polls} polls")]
    FirmwareNotReady { polls: u32 },

    #[error("invalid channel configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("channel is desynchronized: {0}")]
    Desynced(DesyncReason),

    #[error(transparent)]
    Wire(#[from] hqos_messages::Error),
}
