// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The command header, the closed command-kind space, and serialization of
//! whole commands.
//!
//! A serialized command is the hubpack encoding of [`CmdHeader`] followed
//! immediately by the hubpack encoding of its kind-specific payload. The
//! firmware reports completion by rewriting the 32-bit flag word in place,
//! which therefore sits at a pinned offset ([`FLAG_WORD_OFFSET`]) inside
//! every command.

use crate::node::NodeMove;
use crate::node::NodeRef;
use crate::node::NodeUpdate;
use crate::node::PortAdd;
use crate::node::PortTreeSuspend;
use crate::node::PortTreeUpdate;
use crate::node::QueueAdd;
use crate::node::QueueFlush;
use crate::node::SchedAdd;
use crate::stats::ActiveQueueQuery;
use crate::stats::AqmServiceFlow;
use crate::stats::CodelConfig;
use crate::stats::ConfigQuery;
use crate::stats::DebugDescriptor;
use crate::stats::DebugPop;
use crate::stats::HistogramConfig;
use crate::stats::HistogramQuery;
use crate::stats::LogBitmap;
use crate::stats::StatsQuery;
use crate::stats::SystemQuery;
use crate::stats::TableRead;
use crate::stats::VersionQuery;
use crate::stats::WspHelperConfig;
use crate::Error;
use hubpack::SerializedSize;
use serde::Deserialize;
use serde::Serialize;

/// Byte offset of the flag word within a serialized command.
///
/// The completion poller reads the word at `position_in_fw_buffer +
/// FLAG_WORD_OFFSET`; the firmware writes its completion status there.
pub const FLAG_WORD_OFFSET: usize = 4;

/// Byte offset of the ring-position field within a serialized command.
pub const BUF_POSITION_OFFSET: usize = 20;

bitflags::bitflags! {
    /// Control bits stamped by the host and completion bits written back by
    /// the firmware, sharing one 32-bit word.
    #[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
    pub struct CmdFlags: u32 {
        /// The poller must copy this command's response out of the shared
        /// response buffer once it completes.
        const POST_PROCESS      = 1 << 0;

        /// Final command of its batch; the firmware stops parsing after it.
        const LAST_IN_BATCH     = 1 << 1;

        /// After the batch drains, zero and flush the shared bandwidth-limit
        /// shadow regions.
        const CLEAR_BWL_SHADOW  = 1 << 2;

        /// The firmware executed the command successfully.
        const DONE              = 1 << 8;

        /// The firmware rejected the command.
        const ERROR             = 1 << 9;

        /// The firmware hit an internal fault executing the command.
        const FATAL             = 1 << 10;
    }
}

impl CmdFlags {
    /// All bits the firmware may report as a completion status.
    pub const COMPLETION: Self = Self::DONE.union(Self::ERROR).union(Self::FATAL);

    /// Return true once the firmware has written any completion status.
    pub fn completed(&self) -> bool {
        self.intersects(Self::COMPLETION)
    }

    /// Return true if the firmware reported a failure.
    pub fn failed(&self) -> bool {
        self.intersects(Self::ERROR.union(Self::FATAL))
    }
}

/// The fixed header leading every command.
///
/// Field order is the wire layout. `response_addr` is a firmware-addressable
/// (FAT-translated) pointer, or zero when the command produces no response;
/// `response_size` must be zero exactly when it is.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct CmdHeader {
    /// Host-assigned sequence number, for log correlation.
    pub seq: u16,
    pub kind: CmdKind,
    pub rsvd: u8,
    /// Control and completion bits; see [`FLAG_WORD_OFFSET`].
    pub flags: CmdFlags,
    /// Total serialized length, header plus payload.
    pub len: u16,
    /// Sub-offset within the response buffer where this command's response
    /// lands.
    pub response_offset: u16,
    pub response_addr: u32,
    pub response_size: u16,
    pub rsvd2: u16,
    /// Byte offset of this command within the firmware command ring,
    /// stamped at transmit time.
    pub buf_position: u32,
}

impl CmdHeader {
    /// Deserialize a header from the front of a serialized command.
    pub fn read(bytes: &[u8]) -> Result<Self, Error> {
        let (header, _rest) = hubpack::deserialize::<Self>(bytes)?;
        Ok(header)
    }
}

/// Rewrite the header at the front of a serialized command in place,
/// returning the updated header.
///
/// The header is fixed-size, so re-serialization never disturbs the payload
/// bytes that follow it.
pub fn restamp_header(
    bytes: &mut [u8],
    f: impl FnOnce(&mut CmdHeader),
) -> Result<CmdHeader, Error> {
    let (mut header, _rest) = hubpack::deserialize::<CmdHeader>(bytes)?;
    f(&mut header);
    hubpack::serialize(bytes, &header)?;
    Ok(header)
}

/// Initialize the command channel. First command of every session.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct ChannelInit {
    /// Protocol version; see [`crate::version`].
    pub version: u8,
    /// FAT-translated base of the shared response buffer.
    pub response_addr: u32,
    pub response_size: u16,
}

/// Point the firmware logger at its shared log ring.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
pub struct LoggerInit {
    /// FAT-translated base of the firmware's log ring.
    pub ring_addr: u32,
    pub ring_size: u16,
    pub level: u8,
}

macro_rules! define_commands {
    ($($variant:ident => $payload:ty,)+) => {
        /// Every command the firmware understands.
        ///
        /// Declaration order is the on-wire type tag and must match the
        /// firmware build exactly.
        #[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
        pub enum CmdKind {
            $($variant,)+
        }

        /// A command payload, one variant per [`CmdKind`].
        #[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize, SerializedSize)]
        pub enum CmdBody {
            $($variant($payload),)+
        }

        impl CmdBody {
            /// The kind tag matching this payload.
            pub fn kind(&self) -> CmdKind {
                match self {
                    $(Self::$variant(_) => CmdKind::$variant,)+
                }
            }

            /// The exact number of bytes this payload serializes to.
            ///
            /// Every payload struct is fixed-layout, so this equals the
            /// payload type's `MAX_SIZE`.
            pub fn wire_size(&self) -> usize {
                match self {
                    $(Self::$variant(_) => <$payload as SerializedSize>::MAX_SIZE,)+
                }
            }

            fn serialize_into(&self, buf: &mut [u8]) -> Result<usize, Error> {
                match self {
                    $(Self::$variant(p) => hubpack::serialize(buf, p).map_err(Error::from),)+
                }
            }
        }

        /// The largest payload of any command kind.
        pub const MAX_BODY_SIZE: usize = {
            let mut max = 0;
            $(
                if <$payload as SerializedSize>::MAX_SIZE > max {
                    max = <$payload as SerializedSize>::MAX_SIZE;
                }
            )+
            max
        };
    };
}

define_commands! {
    InitChannel => ChannelInit,
    InitLogger => LoggerInit,
    AddPort => PortAdd,
    SetPort => NodeUpdate,
    RemovePort => NodeRef,
    AddSched => SchedAdd,
    SetSched => NodeUpdate,
    RemoveSched => NodeRef,
    AddQueue => QueueAdd,
    SetQueue => NodeUpdate,
    RemoveQueue => NodeRef,
    MoveSched => NodeMove,
    MoveQueue => NodeMove,
    FlushQueue => QueueFlush,
    UpdatePortTree => PortTreeUpdate,
    SuspendPortTree => PortTreeSuspend,
    GetQueueStats => StatsQuery,
    ClearQueueStats => StatsQuery,
    GetPortStats => StatsQuery,
    ClearPortStats => StatsQuery,
    GetSystemStats => SystemQuery,
    GetNodeStats => StatsQuery,
    GetCodelStats => StatsQuery,
    GetHistogram => HistogramQuery,
    SetHistogramConfig => HistogramConfig,
    GetActiveQueueStats => ActiveQueueQuery,
    GetNodeConfig => ConfigQuery,
    GetPortConfig => ConfigQuery,
    GetQueueConfig => ConfigQuery,
    SetAqmServiceFlow => AqmServiceFlow,
    SetCodelConfig => CodelConfig,
    SetWspConfig => WspHelperConfig,
    SetLogBitmap => LogBitmap,
    ReadTableEntry => TableRead,
    PushDebugDescriptor => DebugDescriptor,
    PopDebugDescriptor => DebugPop,
    GetFirmwareVersion => VersionQuery,
}

/// One complete command: header plus typed payload.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Command {
    pub header: CmdHeader,
    pub body: CmdBody,
}

impl Command {
    /// Build a command around a payload, filling in the kind and length and
    /// leaving the response bookkeeping null.
    pub fn new(seq: u16, body: CmdBody) -> Self {
        let header = CmdHeader {
            seq,
            kind: body.kind(),
            rsvd: 0,
            flags: CmdFlags::empty(),
            len: (CmdHeader::MAX_SIZE + body.wire_size()) as u16,
            response_offset: 0,
            response_addr: 0,
            response_size: 0,
            rsvd2: 0,
            buf_position: 0,
        };
        Self { header, body }
    }

    /// Attach response bookkeeping and mark the command for post-processing.
    pub fn with_response(mut self, addr: u32, offset: u16, size: u16) -> Self {
        self.header.flags |= CmdFlags::POST_PROCESS;
        self.header.response_addr = addr;
        self.header.response_offset = offset;
        self.header.response_size = size;
        self
    }

    /// Set additional control flags.
    pub fn with_flags(mut self, flags: CmdFlags) -> Self {
        self.header.flags |= flags;
        self
    }

    /// Total serialized size of this command, in bytes.
    pub fn wire_size(&self) -> usize {
        usize::from(self.header.len)
    }

    /// Check the header's structural invariants.
    pub fn validate(&self) -> Result<(), Error> {
        let expected = (CmdHeader::MAX_SIZE + self.body.wire_size()) as u16;
        if self.header.len != expected {
            return Err(Error::LengthMismatch {
                expected,
                actual: self.header.len,
            });
        }
        if (self.header.response_size == 0) != (self.header.response_addr == 0) {
            return Err(Error::InvalidResponse);
        }
        Ok(())
    }

    /// Serialize the command into `buf`, returning the number of bytes
    /// written.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, Error> {
        self.validate()?;
        let n = hubpack::serialize(buf, &self.header)?;
        let m = self.body.serialize_into(&mut buf[n..])?;
        let total = n + m;
        if total != usize::from(self.header.len) {
            return Err(Error::LengthMismatch {
                expected: self.header.len,
                actual: total as u16,
            });
        }
        Ok(total)
    }
}
