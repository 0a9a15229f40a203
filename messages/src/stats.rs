// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Statistics and configuration queries, and the response payloads the
//! firmware writes into the shared response buffer.
//!
//! Responses are fixed-layout except for the active-queue report, which
//! starts with an [`ActiveQueueHeader`] carrying the true entry count; the
//! completion poller sizes the copy-out from that header.

use crate::node::CommonParams;
use crate::node::ChildParams;
use crate::node::ParentParams;
use crate::node::PortParams;
use crate::node::QueueParams;
use hubpack::SerializedSize;
use serde::Deserialize;
use serde::Serialize;

/// Query for one node's counters (queue, port, or intermediate node).
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct StatsQuery {
    pub phy: u16,
    /// Nonzero to zero the counters once they have been reported.
    pub clear_on_read: u8,
}

/// Query for scheduler-global counters.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct SystemQuery {
    /// Nonzero to zero the counters once they have been reported.
    pub clear_on_read: u8,
}

/// Query for a queue's latency histogram.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct HistogramQuery {
    pub phy: u16,
    pub clear_on_read: u8,
}

/// Configure the bin edges of a queue's latency histogram.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct HistogramConfig {
    pub phy: u16,
    /// Upper edge of each bin, in microseconds, ascending.
    pub bin_edges: [u32; 8],
}

/// Query for the set of non-empty queues beneath a port.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct ActiveQueueQuery {
    pub port: u16,
}

/// Query for a node's currently applied configuration.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct ConfigQuery {
    pub phy: u16,
}

/// Query for the firmware version. Carries no parameters.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct VersionQuery {
    pub rsvd: u8,
}

/// Per-queue counters.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped: u64,
    pub wred_dropped: u64,
    pub codel_dropped: u64,
    /// Current occupancy, in queue-manager words.
    pub occupancy: u32,
    pub rsvd: u32,
}

/// Per-port counters.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct PortStats {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub dropped: u64,
    /// Times the port stalled waiting on packet credit.
    pub credit_stalls: u64,
}

/// Scheduler-global counters.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct SystemStats {
    pub scheduler_loops: u64,
    pub commands_processed: u64,
    pub enqueues: u64,
    pub dequeues: u64,
    pub bwl_update_ticks: u64,
}

/// Counters of an intermediate scheduler node.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct NodeStats {
    pub enqueued: u64,
    pub dequeued: u64,
    /// Signed credit balance of the node's bandwidth limiter.
    pub credit_balance: i32,
    pub rsvd: u32,
}

/// CoDel state of one queue.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct CodelStats {
    pub drops: u64,
    pub marks: u64,
    pub max_sojourn_us: u32,
    /// Nonzero while the queue is in the dropping state.
    pub dropping: u8,
    pub rsvd: u8,
}

/// A queue latency histogram.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct Histogram {
    pub bins: [u32; 8],
    pub total_samples: u64,
}

/// Leading word of the variable-length active-queue report. The firmware
/// writes `count` [`ActiveQueueEntry`] records immediately after it.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct ActiveQueueHeader {
    pub count: u32,
}

/// One non-empty queue in an active-queue report.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct ActiveQueueEntry {
    pub phy: u16,
    pub rlm: u16,
    pub occupancy: u32,
}

/// A node's applied configuration, as reported by the firmware.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct NodeConfigReport {
    pub phy: u16,
    pub common: CommonParams,
    pub parent: ParentParams,
    pub child: ChildParams,
}

/// A port's applied configuration.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct PortConfigReport {
    pub phy: u16,
    pub common: CommonParams,
    pub parent: ParentParams,
    pub port: PortParams,
}

/// A queue's applied configuration.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct QueueConfigReport {
    pub phy: u16,
    pub common: CommonParams,
    pub child: ChildParams,
    pub queue: QueueParams,
}

/// The firmware build version.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct FwVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub build: u32,
}

/// One raw entry read back from a firmware-internal table.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct TableEntry {
    pub words: [u32; 4],
}

/// Payload of a raw table read.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct TableRead {
    /// Which firmware table to read.
    pub table: u8,
    pub index: u32,
}

/// Payload of a push-debug-descriptor command, injecting one descriptor into
/// a queue from the host.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct DebugDescriptor {
    pub rlm: u16,
    pub descriptor: [u32; 4],
}

/// Payload of a pop-debug-descriptor command; the popped descriptor comes
/// back as a [`TableEntry`]-shaped response.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct DebugPop {
    pub rlm: u16,
}

/// Payload of a set-CoDel-configuration command.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct CodelConfig {
    pub target_delay_us: u32,
    pub interval_us: u32,
}

/// Payload of a WSP-helper configuration command, bounding the helper's work
/// per scheduling pass.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct WspHelperConfig {
    pub port: u16,
    pub max_iterations: u16,
}

/// Payload of an AQM service-flow configuration command.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct AqmServiceFlow {
    pub sf_id: u16,
    pub latency_target_us: u32,
    pub peak_rate_kbps: u32,
    pub sustained_rate_kbps: u32,
    pub buffer_size_bytes: u32,
}

/// Payload of a module-log-bitmap command, selecting which firmware modules
/// log and at what level.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct LogBitmap {
    pub module_bitmap: u32,
    pub level: u8,
}

#[cfg(test)]
mod tests {
    use super::ActiveQueueEntry;
    use super::ActiveQueueHeader;
    use super::QueueStats;
    use hubpack::SerializedSize;

    #[test]
    fn test_active_queue_report_framing() {
        // The poller computes the copy-out size as header + count * entry;
        // both sizes are load-bearing.
        assert_eq!(ActiveQueueHeader::MAX_SIZE, 4);
        assert_eq!(ActiveQueueEntry::MAX_SIZE, 8);
    }

    #[test]
    fn test_queue_stats_round_trip() {
        let stats = QueueStats {
            enqueued: 100,
            dequeued: 90,
            dropped: 4,
            wred_dropped: 3,
            codel_dropped: 1,
            occupancy: 6,
            rsvd: 0,
        };
        let mut buf = [0u8; QueueStats::MAX_SIZE];
        let n = hubpack::serialize(&mut buf, &stats).unwrap();
        assert_eq!(n, QueueStats::MAX_SIZE);
        let (back, rest) = hubpack::deserialize::<QueueStats>(&buf).unwrap();
        assert_eq!(back, stats);
        assert!(rest.is_empty());
    }
}
