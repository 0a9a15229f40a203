// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Test doubles: an in-memory shared window with a mock firmware behind the
//! doorbell, and a hash-map tree database.
//!
//! The mock firmware walks a transmitted batch exactly the way the real one
//! does: marker, then header-framed commands until the last-in-batch bit,
//! completing each by rewriting its flag word in place and writing canned
//! responses into the response buffer.

use crate::config::Config;
use crate::config::ConfigBuilder;
use crate::fat::FatRegions;
use crate::fat::MemRegion;
use crate::fat::NUM_REGISTERS;
use crate::tree::LogicalId;
use crate::tree::NodeSettings;
use crate::tree::NodeView;
use crate::tree::PhyId;
use crate::tree::PortSettings;
use crate::tree::QueueSettings;
use crate::tree::TreeDb;
use crate::Error;
use crate::Hardware;
use hqos_messages::command::CmdFlags;
use hqos_messages::command::CmdHeader;
use hqos_messages::command::CmdKind;
use hqos_messages::command::FLAG_WORD_OFFSET;
use hqos_messages::node::NodeType;
use hqos_messages::node::PortTreeUpdate;
use hqos_messages::stats::ActiveQueueEntry;
use hqos_messages::stats::ActiveQueueHeader;
use hqos_messages::stats::FwVersion;
use hqos_messages::stats::QueueStats;
use hqos_messages::QueueMask;
use hqos_messages::BATCH_MARKER;
use hqos_messages::GUARD_MAGIC;
use hubpack::SerializedSize;
use slog::debug;
use slog::o;
use slog::Drain;
use slog::Logger;
use std::cell::Cell;
use std::collections::HashMap;
use std::time::Duration;

pub(crate) fn test_logger() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!())
}

pub(crate) const TEST_SHARED_BASE: u64 = 0x2_3000_0000;

pub(crate) fn test_fat_regions() -> FatRegions {
    FatRegions {
        buffer_manager: MemRegion {
            base: 0x2_3000_0000,
            len: 0x0100_0000,
        },
        fw_text: MemRegion {
            base: 0x1_0000_0000,
            len: 0x0010_0000,
        },
        fw_ddr: MemRegion {
            base: 0x1_2000_0000,
            len: 0x0040_0000,
        },
    }
}

pub(crate) fn test_config() -> Config {
    ConfigBuilder::new(TEST_SHARED_BASE, test_fat_regions())
        .polling(64, Duration::ZERO)
        .ready_polling(4, Duration::ZERO)
        .build()
        .unwrap()
}

pub(crate) fn canned_queue_stats() -> QueueStats {
    QueueStats {
        enqueued: 1111,
        dequeued: 1000,
        dropped: 7,
        wred_dropped: 4,
        codel_dropped: 3,
        occupancy: 22,
        rsvd: 0,
    }
}

pub(crate) fn canned_fw_version() -> FwVersion {
    FwVersion {
        major: 2,
        minor: 1,
        patch: 0,
        build: 4242,
    }
}

pub(crate) fn canned_active_queues() -> [ActiveQueueEntry; 2] {
    [
        ActiveQueueEntry {
            phy: 7,
            rlm: 70,
            occupancy: 5,
        },
        ActiveQueueEntry {
            phy: 9,
            rlm: 90,
            occupancy: 9,
        },
    ]
}

/// How the mock firmware reacts to a doorbell.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum FwBehavior {
    /// Complete every command with DONE and write canned responses.
    Normal,
    /// Ignore the doorbell entirely; nothing ever completes.
    Silent,
    /// Fail the `index`-th command of the batch with the given flags.
    FailAt { index: usize, flags: CmdFlags },
    /// Scribble over the guard word and complete nothing.
    CorruptGuard,
}

#[derive(Clone, Copy, Debug)]
struct Layout {
    ring_offset: usize,
    guard_offset: usize,
    response_offset: usize,
    response_size: usize,
}

pub(crate) struct MockHardware {
    pub mem: Vec<u8>,
    pub fat_regs: [u32; NUM_REGISTERS],
    pub doorbells: Vec<u32>,
    pub updates_per_sec: u32,
    pub bwl_clears: usize,
    pub behavior: FwBehavior,
    /// Every command the mock firmware completed, in order.
    pub processed: Vec<(u16, CmdKind)>,
    /// Every port-tree update the mock firmware saw, in order.
    pub port_tree_updates: Vec<PortTreeUpdate>,
    layout: Option<Layout>,
}

impl MockHardware {
    /// A bare shared window with no firmware behind it, for ring and FAT
    /// tests.
    pub(crate) fn with_memory(len: usize) -> Self {
        Self {
            mem: vec![0; len],
            fat_regs: [0; NUM_REGISTERS],
            doorbells: Vec::new(),
            updates_per_sec: 50_000,
            bwl_clears: 0,
            behavior: FwBehavior::Silent,
            processed: Vec::new(),
            port_tree_updates: Vec::new(),
            layout: None,
        }
    }

    /// A full mock device laid out per `config`, with the firmware already
    /// signaling ready through the guard word.
    pub(crate) fn new(config: &Config) -> Self {
        let needed = [
            config.ring_offset + config.ring_size,
            config.guard_offset + 4,
            config.response_offset + config.response_size,
            config.fw_log_offset + config.fw_log_size,
        ]
        .into_iter()
        .max()
        .unwrap();
        let mut hw = Self::with_memory(needed);
        hw.behavior = FwBehavior::Normal;
        hw.layout = Some(Layout {
            ring_offset: config.ring_offset,
            guard_offset: config.guard_offset,
            response_offset: config.response_offset,
            response_size: config.response_size,
        });
        hw.mem[config.guard_offset..config.guard_offset + 4]
            .copy_from_slice(&GUARD_MAGIC.to_le_bytes());
        hw
    }

    fn process_batch(&mut self) {
        let Some(layout) = self.layout else {
            return;
        };
        let mut pos = layout.ring_offset;
        let marker = u32::from_le_bytes(self.mem[pos..pos + 4].try_into().unwrap());
        if marker != BATCH_MARKER {
            return;
        }
        pos += 4;

        if self.behavior == FwBehavior::CorruptGuard {
            self.mem[layout.guard_offset..layout.guard_offset + 4]
                .copy_from_slice(&0xDEAD_C0DEu32.to_le_bytes());
            return;
        }

        let mut index = 0;
        loop {
            let Ok(header) = CmdHeader::read(&self.mem[pos..]) else {
                return;
            };

            let mut flags = header.flags;
            match self.behavior {
                FwBehavior::FailAt { index: failed, flags: fault } if failed == index => {
                    flags |= fault;
                }
                _ => flags |= CmdFlags::DONE,
            }

            if header.kind == CmdKind::UpdatePortTree {
                let payload = &self.mem[pos + CmdHeader::MAX_SIZE..];
                if let Ok((update, _)) = hubpack::deserialize::<PortTreeUpdate>(payload) {
                    self.port_tree_updates.push(update);
                }
            }

            if flags.contains(CmdFlags::POST_PROCESS)
                && header.response_size > 0
                && !flags.failed()
            {
                self.write_response(&layout, &header);
            }

            let flag_word = pos + FLAG_WORD_OFFSET;
            self.mem[flag_word..flag_word + 4].copy_from_slice(&flags.bits().to_le_bytes());
            self.processed.push((header.seq, header.kind));

            if header.flags.contains(CmdFlags::LAST_IN_BATCH) {
                return;
            }
            pos += usize::from(header.len);
            index += 1;
        }
    }

    fn write_response(&mut self, layout: &Layout, header: &CmdHeader) {
        let base = layout.response_offset + usize::from(header.response_offset);
        let len = usize::from(header.response_size).min(layout.response_size);
        self.mem[base..base + len].fill(0);

        match header.kind {
            CmdKind::GetQueueStats => {
                hubpack::serialize(&mut self.mem[base..], &canned_queue_stats()).unwrap();
            }
            CmdKind::GetFirmwareVersion => {
                hubpack::serialize(&mut self.mem[base..], &canned_fw_version()).unwrap();
            }
            CmdKind::GetActiveQueueStats => {
                let entries = canned_active_queues();
                let mut offset = base;
                offset += hubpack::serialize(
                    &mut self.mem[offset..],
                    &ActiveQueueHeader {
                        count: entries.len() as u32,
                    },
                )
                .unwrap();
                for entry in entries {
                    offset += hubpack::serialize(&mut self.mem[offset..], &entry).unwrap();
                }
            }
            // Everything else reads back as zeroes, which deserialize to
            // valid (if boring) reports.
            _ => {}
        }
    }
}

impl Hardware for MockHardware {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<(), Error> {
        if offset + buf.len() > self.mem.len() {
            return Err(Error::OutOfBounds {
                offset,
                len: buf.len(),
            });
        }
        buf.copy_from_slice(&self.mem[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: usize, buf: &[u8]) -> Result<(), Error> {
        if offset + buf.len() > self.mem.len() {
            return Err(Error::OutOfBounds {
                offset,
                len: buf.len(),
            });
        }
        self.mem[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn ring_doorbell(&mut self, value: u32) {
        self.doorbells.push(value);
        if self.behavior != FwBehavior::Silent {
            self.process_batch();
        }
    }

    fn write_fat_register(&mut self, register: usize, value: u32) {
        self.fat_regs[register] = value;
    }

    fn updates_per_sec(&self) -> u32 {
        self.updates_per_sec
    }

    fn clear_bwl_shadow(&mut self) {
        self.bwl_clears += 1;
    }
}

/// A hash-map stand-in for the driver's scheduler-tree database.
#[derive(Default)]
pub(crate) struct MockTree {
    nodes: HashMap<PhyId, NodeView>,
    logical: HashMap<LogicalId, PhyId>,
    owner: HashMap<PhyId, PhyId>,
    preds: HashMap<PhyId, Vec<PhyId>>,
    active: HashMap<PhyId, QueueMask>,
    /// Bandwidth shadow writes, by phy.
    pub shadow: HashMap<PhyId, u32>,
    /// How many times the channel asked for a postmortem dump.
    pub dumps: Cell<usize>,
}

impl MockTree {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_node(
        &mut self,
        id: LogicalId,
        view: NodeView,
        owner: PhyId,
        preds: Vec<PhyId>,
    ) {
        self.logical.insert(id, view.phy);
        self.owner.insert(view.phy, owner);
        self.preds.insert(view.phy, preds);
        self.nodes.insert(view.phy, view);
    }

    pub(crate) fn set_active_queues(&mut self, port: PhyId, mask: QueueMask) {
        self.active.insert(port, mask);
    }
}

impl TreeDb for MockTree {
    fn node_by_phy(&self, phy: PhyId) -> Option<NodeView> {
        self.nodes.get(&phy).copied()
    }

    fn phy_of_logical(&self, id: LogicalId) -> Option<PhyId> {
        self.logical.get(&id).copied()
    }

    fn port_of(&self, phy: PhyId) -> Option<PhyId> {
        self.owner.get(&phy).copied()
    }

    fn predecessors_of(&self, phy: PhyId) -> Vec<PhyId> {
        self.preds.get(&phy).cloned().unwrap_or_default()
    }

    fn active_queues_of(&self, port: PhyId) -> QueueMask {
        self.active.get(&port).copied().unwrap_or_default()
    }

    fn set_actual_bandwidth(&mut self, phy: PhyId, kbps: u32) {
        self.shadow.insert(phy, kbps);
    }

    fn dump(&self, log: &Logger) {
        self.dumps.set(self.dumps.get() + 1);
        debug!(log, "tree dump"; "nodes" => self.nodes.len());
    }
}

/// A small two-port tree: ports 2 and 3, a scheduler under each, and a
/// queue under each scheduler. Logical ids are `100 + phy`.
pub(crate) fn standard_tree() -> MockTree {
    let mut tree = MockTree::new();

    tree.add_node(
        103,
        NodeView {
            phy: 3,
            node_type: NodeType::Port,
            parent: 3,
            settings: NodeSettings {
                bandwidth_kbps: 999,
                child_hi: 7,
                port: PortSettings {
                    ring_addr: 0x2_3000_4000,
                    ring_size: 256,
                    packet_credit: 32,
                },
                ..NodeSettings::default()
            },
        },
        3,
        vec![],
    );
    tree.add_node(
        102,
        NodeView {
            phy: 2,
            node_type: NodeType::Port,
            parent: 2,
            settings: NodeSettings {
                child_hi: 7,
                port: PortSettings {
                    ring_addr: 0x2_3000_8000,
                    ring_size: 128,
                    packet_credit: 16,
                },
                ..NodeSettings::default()
            },
        },
        2,
        vec![],
    );

    tree.add_node(
        105,
        NodeView {
            phy: 5,
            node_type: NodeType::Sched,
            parent: 3,
            settings: NodeSettings {
                weight: 2,
                child_hi: 3,
                ..NodeSettings::default()
            },
        },
        3,
        vec![3],
    );
    tree.add_node(
        112,
        NodeView {
            phy: 12,
            node_type: NodeType::Sched,
            parent: 2,
            settings: NodeSettings {
                weight: 1,
                child_hi: 3,
                ..NodeSettings::default()
            },
        },
        2,
        vec![2],
    );

    tree.add_node(
        107,
        NodeView {
            phy: 7,
            node_type: NodeType::Queue,
            parent: 5,
            settings: NodeSettings {
                bandwidth_kbps: 10_000,
                weight: 4,
                queue: QueueSettings {
                    rlm: 70,
                    size: 256,
                    wred_min: 64,
                    wred_max: 192,
                    wred_prob: 5,
                    codel: false,
                },
                ..NodeSettings::default()
            },
        },
        3,
        vec![5, 3],
    );
    tree.add_node(
        109,
        NodeView {
            phy: 9,
            node_type: NodeType::Queue,
            parent: 12,
            settings: NodeSettings {
                weight: 1,
                queue: QueueSettings {
                    rlm: 90,
                    size: 128,
                    ..QueueSettings::default()
                },
                ..NodeSettings::default()
            },
        },
        2,
        vec![12, 2],
    );

    tree.set_active_queues(3, QueueMask::from_indices(&[0, 1]).unwrap());
    tree.set_active_queues(2, QueueMask::from_indices(&[4, 5]).unwrap());
    tree
}
