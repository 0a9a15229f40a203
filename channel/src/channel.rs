// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The command channel proper: batching, transmission, and completion.
//!
//! A mutation request becomes one or more commands in `cmdq`. Transmission
//! drains `cmdq` into the firmware's shared ring (prefixed by any pending
//! port-tree updates), mirrors each transmitted command into `pendq`, and
//! rings the doorbell once. The poller then walks `pendq` in order, waiting
//! on each command's in-place completion flags, copying responses out of
//! the shared response buffer, and cross-checking the accounting and the
//! ring guard word. Exactly one batch is ever in flight; callers serialize
//! under the tree database's configuration lock.
//!
//! Any protocol desync poisons the channel: every later operation returns
//! the original [`DesyncReason`] until the embedding layer tears the link
//! down and restarts the firmware.

use crate::config::Config;
use crate::encode;
use crate::fat::FatTable;
use crate::hardware::Hardware;
use crate::queues::CmdFifo;
use crate::ring::CommandRing;
use crate::ring::ResponseBuffer;
use crate::tree::LogicalId;
use crate::tree::NodeSettings;
use crate::tree::NodeView;
use crate::tree::PhyId;
use crate::tree::TreeDb;
use crate::DesyncReason;
use crate::Error;
use hqos_messages::command::restamp_header;
use hqos_messages::command::ChannelInit;
use hqos_messages::command::CmdBody;
use hqos_messages::command::CmdFlags;
use hqos_messages::command::CmdHeader;
use hqos_messages::command::CmdKind;
use hqos_messages::command::Command;
use hqos_messages::command::LoggerInit;
use hqos_messages::command::FLAG_WORD_OFFSET;
use hqos_messages::credit;
use hqos_messages::node::CommonValid;
use hqos_messages::node::NodeMove;
use hqos_messages::node::NodeRef;
use hqos_messages::node::NodeType;
use hqos_messages::node::PortTreeSuspend;
use hqos_messages::node::PortTreeUpdate;
use hqos_messages::node::QueueFlush;
use hqos_messages::stats::ActiveQueueEntry;
use hqos_messages::stats::ActiveQueueHeader;
use hqos_messages::stats::ActiveQueueQuery;
use hqos_messages::stats::AqmServiceFlow;
use hqos_messages::stats::CodelConfig;
use hqos_messages::stats::CodelStats;
use hqos_messages::stats::ConfigQuery;
use hqos_messages::stats::DebugDescriptor;
use hqos_messages::stats::DebugPop;
use hqos_messages::stats::FwVersion;
use hqos_messages::stats::Histogram;
use hqos_messages::stats::HistogramConfig;
use hqos_messages::stats::HistogramQuery;
use hqos_messages::stats::LogBitmap;
use hqos_messages::stats::NodeConfigReport;
use hqos_messages::stats::NodeStats;
use hqos_messages::stats::PortConfigReport;
use hqos_messages::stats::PortStats;
use hqos_messages::stats::QueueConfigReport;
use hqos_messages::stats::QueueStats;
use hqos_messages::stats::StatsQuery;
use hqos_messages::stats::SystemQuery;
use hqos_messages::stats::SystemStats;
use hqos_messages::stats::TableEntry;
use hqos_messages::stats::TableRead;
use hqos_messages::stats::VersionQuery;
use hqos_messages::stats::WspHelperConfig;
use hqos_messages::version;
use hqos_messages::QueueMask;
use hqos_messages::BATCH_MARKER;
use hqos_messages::GUARD_MAGIC;
use hqos_messages::MAX_COMMAND_SIZE;
use hqos_messages::MAX_PORTS;
use hubpack::SerializedSize;
use serde::de::DeserializeOwned;
use slog::crit;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::thread;

/// Counters describing the channel's lifetime traffic.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChannelStats {
    pub batches_sent: u64,
    pub commands_sent: u64,
    pub completions: u64,
    /// Set-commands suppressed because nothing actually changed.
    pub suppressed_noops: u64,
    /// The deepest fill ever reached in the firmware command ring.
    pub ring_high_water: usize,
}

// Ports whose subtree has a pending structural change. Deduplicated; the
// transmitter drains it into trailing update-port-tree commands.
#[derive(Debug)]
struct SuspendSet {
    ports: [PhyId; MAX_PORTS],
    len: usize,
}

impl SuspendSet {
    fn new() -> Self {
        Self {
            ports: [0; MAX_PORTS],
            len: 0,
        }
    }

    fn insert(&mut self, port: PhyId) -> Result<(), Error> {
        if self.ports[..self.len].contains(&port) {
            return Ok(());
        }
        if self.len == MAX_PORTS {
            return Err(Error::SuspendSetFull);
        }
        self.ports[self.len] = port;
        self.len += 1;
        Ok(())
    }

    fn take(&mut self) -> Vec<PhyId> {
        let out = self.ports[..self.len].to_vec();
        self.len = 0;
        out
    }
}

#[derive(Clone, Copy, Debug)]
enum ChannelState {
    Ready,
    Poisoned(DesyncReason),
}

/// The command channel to one QoS device's firmware.
///
/// One instance exists per physical device; there is no process-wide state.
/// All methods take the tree database explicitly because the caller already
/// holds its configuration lock, which is the channel's serialization
/// domain.
pub struct Channel<H: Hardware> {
    log: Logger,
    config: Config,
    hw: H,
    fat: FatTable,
    ring: CommandRing,
    responses: ResponseBuffer,
    cmdq: CmdFifo,
    pendq: CmdFifo,
    suspend: SuspendSet,
    seq: u16,
    updates_per_sec: u32,
    batch_pushed: usize,
    clear_bwl_pending: bool,
    response_cursor: usize,
    collected: Vec<(u16, Vec<u8>)>,
    stats: ChannelStats,
    state: ChannelState,
}

impl<H: Hardware> Channel<H> {
    /// Bring up the command channel.
    ///
    /// Waits for the firmware's ready handshake (the guard word turning to
    /// its magic value after image load), programs the address-translation
    /// table, reads the firmware's credit tick rate, and issues the channel
    /// and logger init commands as the first batch.
    pub fn connect(
        hw: H,
        config: Config,
        log: Logger,
        tree: &mut dyn TreeDb,
    ) -> Result<Self, Error> {
        let mut channel = Self {
            fat: FatTable::new(log.new(o!("unit" => "fat"))),
            ring: CommandRing::new(config.ring_offset, config.ring_size),
            responses: ResponseBuffer::new(config.response_offset, config.response_size),
            cmdq: CmdFifo::with_capacity(config.cmdq_capacity),
            pendq: CmdFifo::with_capacity(config.cmdq_capacity),
            suspend: SuspendSet::new(),
            seq: 0,
            updates_per_sec: 0,
            batch_pushed: 0,
            clear_bwl_pending: false,
            response_cursor: 0,
            collected: Vec::new(),
            stats: ChannelStats::default(),
            state: ChannelState::Ready,
            hw,
            config,
            log,
        };

        channel.wait_firmware_ready()?;
        let regions = channel.config.fat;
        channel.fat.configure(&mut channel.hw, &regions)?;

        channel.updates_per_sec = channel.hw.updates_per_sec();
        if channel.updates_per_sec == 0 {
            warn!(
                channel.log,
                "firmware has not reported its credit tick rate; \
                 bandwidth shadows will read zero until it does"
            );
        }

        let response_addr = channel.translated_shared(channel.config.response_offset)?;
        let log_addr = channel.translated_shared(channel.config.fw_log_offset)?;
        let init = Command::new(
            channel.next_seq(),
            CmdBody::InitChannel(ChannelInit {
                version: version::CURRENT,
                response_addr,
                response_size: channel.config.response_size as u16,
            }),
        );
        channel.push_command(init)?;
        let logger = Command::new(
            channel.next_seq(),
            CmdBody::InitLogger(LoggerInit {
                ring_addr: log_addr,
                ring_size: channel.config.fw_log_size as u16,
                level: channel.config.fw_log_level,
            }),
        );
        channel.push_command(logger)?;
        channel.transact(tree)?;

        info!(
            channel.log,
            "command channel up";
            "updates_per_sec" => channel.updates_per_sec,
        );
        Ok(channel)
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    pub fn updates_per_sec(&self) -> u32 {
        self.updates_per_sec
    }

    /// If the channel has desynchronized from the firmware, the reason.
    pub fn poisoned(&self) -> Option<DesyncReason> {
        match self.state {
            ChannelState::Ready => None,
            ChannelState::Poisoned(reason) => Some(reason),
        }
    }

    // ---- public operations -------------------------------------------

    /// Configure a newly created port node in the firmware.
    pub fn add_port(&mut self, tree: &mut dyn TreeDb, id: LogicalId) -> Result<(), Error> {
        self.ensure_ready()?;
        let view = self.resolve(tree, id)?;
        self.expect_type(&view, NodeType::Port)?;
        let body = encode::port_add(&view, self.updates_per_sec, &self.fat)?;
        self.push_command(Command::new(self.next_seq(), body))?;
        tree.set_actual_bandwidth(
            view.phy,
            credit::normalize(view.settings.bandwidth_kbps, self.updates_per_sec),
        );
        self.transact(tree)
    }

    /// Configure a newly created scheduler node in the firmware.
    pub fn add_sched(&mut self, tree: &mut dyn TreeDb, id: LogicalId) -> Result<(), Error> {
        self.ensure_ready()?;
        let view = self.resolve(tree, id)?;
        self.expect_type(&view, NodeType::Sched)?;
        let predecessors = tree.predecessors_of(view.phy);
        let body = encode::sched_add(&view, &predecessors, self.updates_per_sec)?;
        self.push_command(Command::new(self.next_seq(), body))?;
        tree.set_actual_bandwidth(
            view.phy,
            credit::normalize(view.settings.bandwidth_kbps, self.updates_per_sec),
        );
        self.transact(tree)
    }

    /// Configure a newly created queue node in the firmware.
    pub fn add_queue(&mut self, tree: &mut dyn TreeDb, id: LogicalId) -> Result<(), Error> {
        self.ensure_ready()?;
        let view = self.resolve(tree, id)?;
        self.expect_type(&view, NodeType::Queue)?;
        let predecessors = tree.predecessors_of(view.phy);
        let body = encode::queue_add(&view, &predecessors, self.updates_per_sec)?;
        self.push_command(Command::new(self.next_seq(), body))?;
        tree.set_actual_bandwidth(
            view.phy,
            credit::normalize(view.settings.bandwidth_kbps, self.updates_per_sec),
        );
        self.transact(tree)
    }

    /// Reconfigure an existing node, sending only the parameter groups that
    /// actually changed. An update that changes nothing is suppressed
    /// entirely.
    pub fn set_node(
        &mut self,
        tree: &mut dyn TreeDb,
        id: LogicalId,
        settings: NodeSettings,
    ) -> Result<(), Error> {
        self.ensure_ready()?;
        if self.enqueue_set(tree, id, settings)? {
            self.transact(tree)
        } else {
            Ok(())
        }
    }

    /// Reconfigure several nodes in one batch.
    pub fn set_nodes(
        &mut self,
        tree: &mut dyn TreeDb,
        updates: &[(LogicalId, NodeSettings)],
    ) -> Result<(), Error> {
        self.ensure_ready()?;
        let mut queued = false;
        for (id, settings) in updates {
            queued |= self.enqueue_set(tree, *id, *settings)?;
        }
        if queued {
            self.transact(tree)
        } else {
            Ok(())
        }
    }

    /// Remove a node from the firmware's tree. The node must already be
    /// unlinked in the tree database.
    pub fn remove_node(&mut self, tree: &mut dyn TreeDb, id: LogicalId) -> Result<(), Error> {
        self.ensure_ready()?;
        let view = self.resolve(tree, id)?;
        let node = NodeRef {
            phy: view.phy,
            node_type: view.node_type,
        };
        let cmd = match view.node_type {
            // Dropping a whole port invalidates its bandwidth shadows.
            NodeType::Port => Command::new(self.next_seq(), CmdBody::RemovePort(node))
                .with_flags(CmdFlags::CLEAR_BWL_SHADOW),
            NodeType::Sched => Command::new(self.next_seq(), CmdBody::RemoveSched(node)),
            NodeType::Queue => Command::new(self.next_seq(), CmdBody::RemoveQueue(node)),
        };
        if view.node_type != NodeType::Port {
            let port = self.owning_port(tree, &view)?;
            self.suspend.insert(port)?;
        }
        self.push_command(cmd)?;
        self.transact(tree)
    }

    /// Move a queue beneath a new parent.
    pub fn move_queue(
        &mut self,
        tree: &mut dyn TreeDb,
        id: LogicalId,
        dst_parent: LogicalId,
    ) -> Result<(), Error> {
        self.ensure_ready()?;
        let view = self.resolve(tree, id)?;
        self.expect_type(&view, NodeType::Queue)?;
        self.enqueue_move(tree, &view, dst_parent, CmdKind::MoveQueue)?;
        self.transact(tree)
    }

    /// Move a scheduler (and its subtree) beneath a new parent.
    pub fn move_sched(
        &mut self,
        tree: &mut dyn TreeDb,
        id: LogicalId,
        dst_parent: LogicalId,
    ) -> Result<(), Error> {
        self.ensure_ready()?;
        let view = self.resolve(tree, id)?;
        self.expect_type(&view, NodeType::Sched)?;
        self.enqueue_move(tree, &view, dst_parent, CmdKind::MoveSched)?;
        self.transact(tree)
    }

    /// Explicitly pause scheduling of a port's subtree.
    pub fn suspend_port(&mut self, tree: &mut dyn TreeDb, id: LogicalId) -> Result<(), Error> {
        self.ensure_ready()?;
        let view = self.resolve(tree, id)?;
        self.expect_type(&view, NodeType::Port)?;
        self.execute(
            tree,
            CmdBody::SuspendPortTree(PortTreeSuspend { port: view.phy }),
        )
    }

    /// Drain a queue's packets.
    pub fn flush_queue(&mut self, tree: &mut dyn TreeDb, id: LogicalId) -> Result<(), Error> {
        self.ensure_ready()?;
        let view = self.resolve(tree, id)?;
        self.expect_type(&view, NodeType::Queue)?;
        self.execute(
            tree,
            CmdBody::FlushQueue(QueueFlush {
                rlm: view.settings.queue.rlm,
            }),
        )
    }

    /// Read one queue's counters.
    pub fn queue_stats(
        &mut self,
        tree: &mut dyn TreeDb,
        id: LogicalId,
        clear: bool,
    ) -> Result<QueueStats, Error> {
        let view = self.resolve(tree, id)?;
        self.expect_type(&view, NodeType::Queue)?;
        self.query(
            tree,
            CmdBody::GetQueueStats(StatsQuery {
                phy: view.phy,
                clear_on_read: clear as u8,
            }),
        )
    }

    /// Zero one queue's counters.
    pub fn clear_queue_stats(&mut self, tree: &mut dyn TreeDb, id: LogicalId) -> Result<(), Error> {
        self.ensure_ready()?;
        let view = self.resolve(tree, id)?;
        self.expect_type(&view, NodeType::Queue)?;
        self.execute(
            tree,
            CmdBody::ClearQueueStats(StatsQuery {
                phy: view.phy,
                clear_on_read: 1,
            }),
        )
    }

    /// Read one port's counters.
    pub fn port_stats(
        &mut self,
        tree: &mut dyn TreeDb,
        id: LogicalId,
        clear: bool,
    ) -> Result<PortStats, Error> {
        let view = self.resolve(tree, id)?;
        self.expect_type(&view, NodeType::Port)?;
        self.query(
            tree,
            CmdBody::GetPortStats(StatsQuery {
                phy: view.phy,
                clear_on_read: clear as u8,
            }),
        )
    }

    /// Zero one port's counters.
    pub fn clear_port_stats(&mut self, tree: &mut dyn TreeDb, id: LogicalId) -> Result<(), Error> {
        self.ensure_ready()?;
        let view = self.resolve(tree, id)?;
        self.expect_type(&view, NodeType::Port)?;
        self.execute(
            tree,
            CmdBody::ClearPortStats(StatsQuery {
                phy: view.phy,
                clear_on_read: 1,
            }),
        )
    }

    /// Read an intermediate node's counters.
    pub fn node_stats(&mut self, tree: &mut dyn TreeDb, id: LogicalId) -> Result<NodeStats, Error> {
        let view = self.resolve(tree, id)?;
        self.query(
            tree,
            CmdBody::GetNodeStats(StatsQuery {
                phy: view.phy,
                clear_on_read: 0,
            }),
        )
    }

    /// Read the scheduler-global counters.
    pub fn system_stats(&mut self, tree: &mut dyn TreeDb, clear: bool) -> Result<SystemStats, Error> {
        self.query(
            tree,
            CmdBody::GetSystemStats(SystemQuery {
                clear_on_read: clear as u8,
            }),
        )
    }

    /// Read a queue's CoDel state.
    pub fn codel_stats(&mut self, tree: &mut dyn TreeDb, id: LogicalId) -> Result<CodelStats, Error> {
        let view = self.resolve(tree, id)?;
        self.expect_type(&view, NodeType::Queue)?;
        self.query(
            tree,
            CmdBody::GetCodelStats(StatsQuery {
                phy: view.phy,
                clear_on_read: 0,
            }),
        )
    }

    /// Read a queue's latency histogram.
    pub fn histogram(
        &mut self,
        tree: &mut dyn TreeDb,
        id: LogicalId,
        clear: bool,
    ) -> Result<Histogram, Error> {
        let view = self.resolve(tree, id)?;
        self.expect_type(&view, NodeType::Queue)?;
        self.query(
            tree,
            CmdBody::GetHistogram(HistogramQuery {
                phy: view.phy,
                clear_on_read: clear as u8,
            }),
        )
    }

    /// Configure the bin edges of a queue's latency histogram.
    pub fn set_histogram_config(
        &mut self,
        tree: &mut dyn TreeDb,
        id: LogicalId,
        bin_edges: [u32; 8],
    ) -> Result<(), Error> {
        self.ensure_ready()?;
        let view = self.resolve(tree, id)?;
        self.expect_type(&view, NodeType::Queue)?;
        self.execute(
            tree,
            CmdBody::SetHistogramConfig(HistogramConfig {
                phy: view.phy,
                bin_edges,
            }),
        )
    }

    /// Report every non-empty queue beneath a port.
    pub fn active_queue_stats(
        &mut self,
        tree: &mut dyn TreeDb,
        id: LogicalId,
    ) -> Result<Vec<ActiveQueueEntry>, Error> {
        self.ensure_ready()?;
        let view = self.resolve(tree, id)?;
        self.expect_type(&view, NodeType::Port)?;
        let response_len = ActiveQueueHeader::MAX_SIZE
            + usize::from(QueueMask::MAX_INDEX) * ActiveQueueEntry::MAX_SIZE;
        let data = self.query_raw(
            tree,
            CmdBody::GetActiveQueueStats(ActiveQueueQuery { port: view.phy }),
            response_len,
        )?;
        let (header, mut rest) =
            hubpack::deserialize::<ActiveQueueHeader>(&data).map_err(hqos_messages::Error::from)?;
        let mut entries = Vec::with_capacity(header.count as usize);
        for _ in 0..header.count {
            let (entry, remainder) = hubpack::deserialize::<ActiveQueueEntry>(rest)
                .map_err(hqos_messages::Error::from)?;
            entries.push(entry);
            rest = remainder;
        }
        Ok(entries)
    }

    /// Read back a node's applied configuration.
    pub fn node_config(
        &mut self,
        tree: &mut dyn TreeDb,
        id: LogicalId,
    ) -> Result<NodeConfigReport, Error> {
        let view = self.resolve(tree, id)?;
        self.expect_type(&view, NodeType::Sched)?;
        self.query(tree, CmdBody::GetNodeConfig(ConfigQuery { phy: view.phy }))
    }

    /// Read back a port's applied configuration.
    pub fn port_config(
        &mut self,
        tree: &mut dyn TreeDb,
        id: LogicalId,
    ) -> Result<PortConfigReport, Error> {
        let view = self.resolve(tree, id)?;
        self.expect_type(&view, NodeType::Port)?;
        self.query(tree, CmdBody::GetPortConfig(ConfigQuery { phy: view.phy }))
    }

    /// Read back a queue's applied configuration.
    pub fn queue_config(
        &mut self,
        tree: &mut dyn TreeDb,
        id: LogicalId,
    ) -> Result<QueueConfigReport, Error> {
        let view = self.resolve(tree, id)?;
        self.expect_type(&view, NodeType::Queue)?;
        self.query(tree, CmdBody::GetQueueConfig(ConfigQuery { phy: view.phy }))
    }

    /// Configure an AQM service flow.
    pub fn set_aqm_service_flow(
        &mut self,
        tree: &mut dyn TreeDb,
        flow: AqmServiceFlow,
    ) -> Result<(), Error> {
        self.ensure_ready()?;
        self.execute(tree, CmdBody::SetAqmServiceFlow(flow))
    }

    /// Set the global CoDel parameters.
    pub fn set_codel_config(
        &mut self,
        tree: &mut dyn TreeDb,
        target_delay_us: u32,
        interval_us: u32,
    ) -> Result<(), Error> {
        self.ensure_ready()?;
        self.execute(
            tree,
            CmdBody::SetCodelConfig(CodelConfig {
                target_delay_us,
                interval_us,
            }),
        )
    }

    /// Bound the WSP helper's per-pass work on one port.
    pub fn set_wsp_config(
        &mut self,
        tree: &mut dyn TreeDb,
        id: LogicalId,
        max_iterations: u16,
    ) -> Result<(), Error> {
        self.ensure_ready()?;
        let view = self.resolve(tree, id)?;
        self.expect_type(&view, NodeType::Port)?;
        self.execute(
            tree,
            CmdBody::SetWspConfig(WspHelperConfig {
                port: view.phy,
                max_iterations,
            }),
        )
    }

    /// Select which firmware modules log, and at what level.
    pub fn set_log_bitmap(
        &mut self,
        tree: &mut dyn TreeDb,
        module_bitmap: u32,
        level: u8,
    ) -> Result<(), Error> {
        self.ensure_ready()?;
        self.execute(
            tree,
            CmdBody::SetLogBitmap(LogBitmap {
                module_bitmap,
                level,
            }),
        )
    }

    /// Read one raw entry from a firmware-internal table.
    pub fn read_table_entry(
        &mut self,
        tree: &mut dyn TreeDb,
        table: u8,
        index: u32,
    ) -> Result<TableEntry, Error> {
        self.query(tree, CmdBody::ReadTableEntry(TableRead { table, index }))
    }

    /// Inject one descriptor into a queue from the host.
    pub fn push_debug_descriptor(
        &mut self,
        tree: &mut dyn TreeDb,
        id: LogicalId,
        descriptor: [u32; 4],
    ) -> Result<(), Error> {
        self.ensure_ready()?;
        let view = self.resolve(tree, id)?;
        self.expect_type(&view, NodeType::Queue)?;
        self.execute(
            tree,
            CmdBody::PushDebugDescriptor(DebugDescriptor {
                rlm: view.settings.queue.rlm,
                descriptor,
            }),
        )
    }

    /// Pop one descriptor from a queue for inspection.
    pub fn pop_debug_descriptor(
        &mut self,
        tree: &mut dyn TreeDb,
        id: LogicalId,
    ) -> Result<TableEntry, Error> {
        let view = self.resolve(tree, id)?;
        self.expect_type(&view, NodeType::Queue)?;
        self.query(
            tree,
            CmdBody::PopDebugDescriptor(DebugPop {
                rlm: view.settings.queue.rlm,
            }),
        )
    }

    /// Query the firmware build version.
    pub fn firmware_version(&mut self, tree: &mut dyn TreeDb) -> Result<FwVersion, Error> {
        self.query(
            tree,
            CmdBody::GetFirmwareVersion(VersionQuery::default()),
        )
    }

    // ---- encoding helpers --------------------------------------------

    fn resolve(&self, tree: &dyn TreeDb, id: LogicalId) -> Result<NodeView, Error> {
        let phy = tree
            .phy_of_logical(id)
            .ok_or(Error::UnknownLogicalId(id))?;
        tree.node_by_phy(phy).ok_or(Error::UnknownPhy(phy))
    }

    fn expect_type(&self, view: &NodeView, expected: NodeType) -> Result<(), Error> {
        if view.node_type != expected {
            return Err(Error::WrongNodeType {
                phy: view.phy,
                expected,
                actual: view.node_type,
            });
        }
        Ok(())
    }

    fn owning_port(&self, tree: &dyn TreeDb, view: &NodeView) -> Result<PhyId, Error> {
        if view.node_type == NodeType::Port {
            Ok(view.phy)
        } else {
            tree.port_of(view.phy)
                .ok_or(Error::NoOwningPort { phy: view.phy })
        }
    }

    // Encode one set-command; returns false if it was suppressed as a no-op.
    fn enqueue_set(
        &mut self,
        tree: &mut dyn TreeDb,
        id: LogicalId,
        settings: NodeSettings,
    ) -> Result<bool, Error> {
        let view = self.resolve(tree, id)?;
        let update = encode::diff_node(
            view.phy,
            view.node_type,
            &view.settings,
            &settings,
            self.updates_per_sec,
            &self.fat,
        )?;
        if update.is_noop() {
            self.stats.suppressed_noops += 1;
            debug!(self.log, "suppressing no-op update"; "phy" => view.phy);
            return Ok(false);
        }
        if encode::is_structural(&update) {
            let port = self.owning_port(tree, &view)?;
            self.suspend.insert(port)?;
        }
        let bandwidth_changed = update.common_valid.contains(CommonValid::BW_LIMIT);
        let body = match view.node_type {
            NodeType::Port => CmdBody::SetPort(update),
            NodeType::Sched => CmdBody::SetSched(update),
            NodeType::Queue => CmdBody::SetQueue(update),
        };
        self.push_command(Command::new(self.next_seq(), body))?;
        if bandwidth_changed {
            tree.set_actual_bandwidth(
                view.phy,
                credit::normalize(settings.bandwidth_kbps, self.updates_per_sec),
            );
        }
        Ok(true)
    }

    fn enqueue_move(
        &mut self,
        tree: &mut dyn TreeDb,
        view: &NodeView,
        dst_parent: LogicalId,
        kind: CmdKind,
    ) -> Result<(), Error> {
        let dst = self.resolve(tree, dst_parent)?;
        let dst_port = self.owning_port(tree, &dst)?;
        let node_move = NodeMove {
            phy: view.phy,
            dst_parent: dst.phy,
            dst_port,
            weight: view.settings.weight,
        };
        let body = match kind {
            CmdKind::MoveSched => CmdBody::MoveSched(node_move),
            _ => CmdBody::MoveQueue(node_move),
        };
        self.push_command(Command::new(self.next_seq(), body))?;
        self.suspend.insert(dst_port)?;
        Ok(())
    }

    fn next_seq(&mut self) -> u16 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    fn push_command(&mut self, cmd: Command) -> Result<(), Error> {
        cmd.validate()?;
        let size = cmd.wire_size();
        if size > MAX_COMMAND_SIZE {
            return Err(Error::CommandTooLarge {
                size,
                limit: MAX_COMMAND_SIZE,
            });
        }
        let mut buf = [0u8; MAX_COMMAND_SIZE];
        let n = cmd.encode(&mut buf)?;
        self.cmdq.push(&buf[..n])?;
        debug!(
            self.log,
            "queued command";
            "seq" => cmd.header.seq,
            "kind" => ?cmd.header.kind,
            "len" => n,
        );
        Ok(())
    }

    fn translated_shared(&self, offset: usize) -> Result<u32, Error> {
        let host = self.config.shared_base + offset as u64;
        let mapped = self.fat.translate(host);
        u32::try_from(mapped).map_err(|_| Error::Unmappable { addr: host })
    }

    // Reserve a window in the shared response buffer for one command.
    fn alloc_response(&mut self, len: usize) -> Result<(u32, u16), Error> {
        let aligned = (len + 7) & !7;
        if self.response_cursor + aligned > self.responses.capacity() {
            return Err(Error::ResponseBufferFull { needed: aligned });
        }
        let offset = self.response_cursor;
        self.response_cursor += aligned;
        let addr = self.translated_shared(self.config.response_offset + offset)?;
        Ok((addr, offset as u16))
    }

    // ---- transaction machinery ---------------------------------------

    // Spin on the guard word until the loaded firmware image writes its
    // ready magic there. This is the completion handshake of firmware
    // loading; image transfer itself happens elsewhere.
    fn wait_firmware_ready(&mut self) -> Result<(), Error> {
        for _ in 0..self.config.ready_polls {
            if self.hw.read_u32(self.config.guard_offset)? == GUARD_MAGIC {
                return Ok(());
            }
            thread::sleep(self.config.ready_interval);
        }
        Err(Error::FirmwareNotReady {
            polls: self.config.ready_polls,
        })
    }

    fn ensure_ready(&self) -> Result<(), Error> {
        match self.state {
            ChannelState::Ready => Ok(()),
            ChannelState::Poisoned(reason) => Err(Error::Desynced(reason)),
        }
    }

    fn poison(&mut self, reason: DesyncReason) -> Error {
        crit!(
            self.log,
            "channel desynchronized, refusing further commands";
            "reason" => %reason,
        );
        self.state = ChannelState::Poisoned(reason);
        Error::Desynced(reason)
    }

    // Push everything queued through the firmware and wait for it all to
    // complete. Multiple batches are used when the ring cannot hold the
    // whole backlog at once.
    fn transact(&mut self, tree: &mut dyn TreeDb) -> Result<(), Error> {
        let result = self.transact_inner(tree);
        self.response_cursor = 0;
        result
    }

    fn transact_inner(&mut self, tree: &mut dyn TreeDb) -> Result<(), Error> {
        self.ensure_ready()?;
        self.collected.clear();
        loop {
            let sent = self.transmit_batch(tree)?;
            if sent == 0 {
                return Ok(());
            }
            self.poll_batch(tree)?;
        }
    }

    // Drain cmdq into the firmware ring and ring the doorbell once.
    // Returns the number of commands transmitted; zero means there was
    // nothing to send, and the firmware was not signaled.
    fn transmit_batch(&mut self, tree: &mut dyn TreeDb) -> Result<usize, Error> {
        self.flush_suspended(tree)?;
        if self.cmdq.is_empty() {
            return Ok(0);
        }
        if !self.pendq.is_empty() {
            return Err(self.poison(DesyncReason::PendingResidue));
        }

        self.ring.reset();
        self.ring
            .append(&mut self.hw, &BATCH_MARKER.to_le_bytes())?;

        let mut sent = 0;
        let mut last_position = 0;
        while let Some(header) = self.cmdq.peek_header()? {
            if self.ring.remaining() < MAX_COMMAND_SIZE {
                break;
            }
            let len = usize::from(header.len);
            if len > MAX_COMMAND_SIZE {
                // The encoder refuses oversized commands, so one here means
                // encoder and transmitter disagree about the wire format.
                crit!(
                    self.log,
                    "oversized command in cmdq, discarding";
                    "seq" => header.seq,
                    "kind" => ?header.kind,
                    "len" => len,
                );
                match self.cmdq.pop(len) {
                    Ok(_) => {
                        return Err(Error::CommandTooLarge {
                            size: len,
                            limit: MAX_COMMAND_SIZE,
                        })
                    }
                    Err(_) => return Err(self.poison(DesyncReason::PendingCorrupt)),
                }
            }

            let mut bytes = self.cmdq.pop(len)?;
            let position = self.ring.cursor() as u32;
            let stamped = restamp_header(&mut bytes, |h| h.buf_position = position)?;
            if stamped.flags.contains(CmdFlags::CLEAR_BWL_SHADOW) {
                self.clear_bwl_pending = true;
            }
            match self.ring.append(&mut self.hw, &bytes) {
                Ok(_) => {}
                Err(_) => {
                    let cursor = self.ring.cursor() + bytes.len();
                    return Err(self.poison(DesyncReason::RingOverrun { cursor }));
                }
            }
            self.pendq.push(&bytes)?;
            last_position = position;
            sent += 1;
        }

        if sent == 0 {
            // Config validation guarantees the ring holds at least one
            // command past the marker.
            return Ok(0);
        }

        // Stamp the tail command so the firmware stops parsing after it.
        let flags_offset = last_position as usize + FLAG_WORD_OFFSET;
        let flags = self.ring.read_u32_at(&self.hw, flags_offset)?;
        self.ring.write_u32_at(
            &mut self.hw,
            flags_offset,
            flags | CmdFlags::LAST_IN_BATCH.bits(),
        )?;

        // The doorbell write may be observed before the ring writes; reading
        // back both ends of the ring forces ordering.
        let _ = self.ring.read_u32_at(&self.hw, 0)?;
        let _ = self.ring.read_u32_at(&self.hw, self.config.ring_size - 4)?;

        self.stats.ring_high_water = self.stats.ring_high_water.max(self.ring.high_water());
        self.stats.batches_sent += 1;
        self.stats.commands_sent += sent as u64;
        self.batch_pushed = sent;
        debug!(
            self.log,
            "transmitted batch";
            "commands" => sent,
            "bytes" => self.ring.cursor(),
        );
        self.hw.ring_doorbell(1);
        Ok(sent)
    }

    // Emit one update-port-tree command for every port with a pending
    // structural change, then clear the set. These ride at the tail of the
    // batch, after the mutations that made them necessary.
    fn flush_suspended(&mut self, tree: &mut dyn TreeDb) -> Result<(), Error> {
        for port in self.suspend.take() {
            let active_queues = tree.active_queues_of(port);
            let cmd = Command::new(
                self.next_seq(),
                CmdBody::UpdatePortTree(PortTreeUpdate {
                    port,
                    active_queues,
                }),
            );
            self.push_command(cmd)?;
            debug!(
                self.log,
                "queued port-tree update";
                "port" => port,
                "active_queues" => ?active_queues,
            );
        }
        Ok(())
    }

    // Wait for every command of the in-flight batch, in order.
    fn poll_batch(&mut self, tree: &mut dyn TreeDb) -> Result<(), Error> {
        // A batch that scribbled past the ring corrupts the guard before any
        // completion could arrive; check before waiting and again after the
        // drain.
        self.check_guard()?;

        if self.pendq.entries() != self.batch_pushed {
            return Err(self.poison(DesyncReason::BatchAccounting {
                pushed: self.batch_pushed,
                popped: self.pendq.entries(),
            }));
        }

        let mut popped = 0;
        while !self.pendq.is_empty() {
            let header = match self.pendq.peek_header() {
                Ok(Some(header)) => header,
                _ => return Err(self.poison(DesyncReason::PendingCorrupt)),
            };

            let flags = match self.wait_completion(&header)? {
                Some(flags) => flags,
                None => {
                    error!(
                        self.log,
                        "timed out waiting for command completion";
                        "seq" => header.seq,
                        "kind" => ?header.kind,
                        "position" => header.buf_position,
                    );
                    self.dump_diagnostics(tree);
                    return Err(self.poison(DesyncReason::PollTimeout {
                        seq: header.seq,
                        polls: self.config.n_polls,
                    }));
                }
            };

            if flags.failed() {
                error!(
                    self.log,
                    "firmware reported command failure";
                    "seq" => header.seq,
                    "kind" => ?header.kind,
                    "flags" => format!("{:#x}", flags.bits()),
                );
                self.dump_diagnostics(tree);
                return Err(self.poison(DesyncReason::FirmwareFault {
                    seq: header.seq,
                    flags: flags.bits(),
                }));
            }

            self.pendq.pop(usize::from(header.len))?;
            popped += 1;
            self.stats.completions += 1;

            if header.flags.contains(CmdFlags::POST_PROCESS) && header.response_size > 0 {
                let data = self.copy_response(&header)?;
                self.collected.push((header.seq, data));
            }
        }

        if popped != self.batch_pushed {
            return Err(self.poison(DesyncReason::BatchAccounting {
                pushed: self.batch_pushed,
                popped,
            }));
        }

        if self.clear_bwl_pending {
            self.hw.clear_bwl_shadow();
            self.clear_bwl_pending = false;
        }

        self.check_guard()
    }

    fn check_guard(&mut self) -> Result<(), Error> {
        let found = self.hw.read_u32(self.config.guard_offset)?;
        if found != GUARD_MAGIC {
            error!(
                self.log,
                "command buffer overflow: guard word corrupted";
                "found" => format!("{found:#010x}"),
            );
            return Err(self.poison(DesyncReason::GuardCorrupted {
                found,
                expected: GUARD_MAGIC,
            }));
        }
        Ok(())
    }

    // Poll one command's flag word with bounded retries. `Ok(None)` is a
    // timeout.
    fn wait_completion(&self, header: &CmdHeader) -> Result<Option<CmdFlags>, Error> {
        let offset = header.buf_position as usize + FLAG_WORD_OFFSET;
        for _ in 0..self.config.n_polls {
            let word = self.ring.read_u32_at(&self.hw, offset)?;
            let flags = CmdFlags::from_bits_retain(word);
            if flags.completed() {
                return Ok(Some(flags));
            }
            thread::sleep(self.config.poll_interval);
        }
        Ok(None)
    }

    // Copy one command's response out of the shared response buffer. The
    // active-queue report sizes itself from its own leading count.
    fn copy_response(&mut self, header: &CmdHeader) -> Result<Vec<u8>, Error> {
        let offset = usize::from(header.response_offset);
        let max = usize::from(header.response_size);
        let len = if header.kind == CmdKind::GetActiveQueueStats {
            let mut scratch = [0u8; ActiveQueueHeader::MAX_SIZE];
            self.responses.read_at(&self.hw, offset, &mut scratch)?;
            let (report, _) = hubpack::deserialize::<ActiveQueueHeader>(&scratch)
                .map_err(hqos_messages::Error::from)?;
            let total = ActiveQueueHeader::MAX_SIZE
                + report.count as usize * ActiveQueueEntry::MAX_SIZE;
            if total > max {
                return Err(self.poison(DesyncReason::ResponseOverrun {
                    seq: header.seq,
                    size: header.response_size,
                }));
            }
            total
        } else {
            max
        };
        let mut data = vec![0u8; len];
        self.responses.read_at(&self.hw, offset, &mut data)?;
        Ok(data)
    }

    fn take_response(&mut self, seq: u16) -> Option<Vec<u8>> {
        let index = self.collected.iter().position(|(s, _)| *s == seq)?;
        Some(self.collected.swap_remove(index).1)
    }

    // Push one response-less command and run it to completion.
    fn execute(&mut self, tree: &mut dyn TreeDb, body: CmdBody) -> Result<(), Error> {
        self.push_command(Command::new(self.next_seq(), body))?;
        self.transact(tree)
    }

    // Push one query command and deserialize its fixed-size response.
    fn query<T>(&mut self, tree: &mut dyn TreeDb, body: CmdBody) -> Result<T, Error>
    where
        T: SerializedSize + DeserializeOwned,
    {
        let data = self.query_raw(tree, body, T::MAX_SIZE)?;
        let (value, _) = hubpack::deserialize::<T>(&data).map_err(hqos_messages::Error::from)?;
        Ok(value)
    }

    fn query_raw(
        &mut self,
        tree: &mut dyn TreeDb,
        body: CmdBody,
        response_len: usize,
    ) -> Result<Vec<u8>, Error> {
        self.ensure_ready()?;
        let (addr, offset) = self.alloc_response(response_len)?;
        let seq = self.next_seq();
        let cmd = Command::new(seq, body).with_response(addr, offset, response_len as u16);
        if let Err(e) = self.push_command(cmd) {
            self.response_cursor = 0;
            return Err(e);
        }
        self.transact(tree)?;
        self.take_response(seq)
            .ok_or_else(|| self.poison(DesyncReason::MissingResponse { seq }))
    }

    // Dump everything useful for a postmortem: the driver's view of the
    // tree, and the firmware's own log ring.
    fn dump_diagnostics(&self, tree: &dyn TreeDb) {
        error!(self.log, "dumping scheduler state for postmortem");
        tree.dump(&self.log);

        let mut buf = vec![0u8; self.config.fw_log_size];
        if self.hw.read_at(self.config.fw_log_offset, &mut buf).is_err() {
            error!(self.log, "firmware log ring is unreadable");
            return;
        }
        for line in buf.split(|b| *b == 0 || *b == b'\n') {
            if line.is_empty() {
                continue;
            }
            error!(
                self.log,
                "firmware log";
                "line" => String::from_utf8_lossy(line).into_owned(),
            );
        }
    }
}
