// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

#![cfg_attr(all(not(test), not(feature = "std")), no_std)]

//! Wire formats for the command channel between the host driver and the
//! hierarchical-QoS scheduler firmware.
//!
//! Everything in this crate is a fixed-layout contract with the firmware
//! build: the hubpack field order and integer widths of each struct are the
//! bytes that cross the shared-memory ring. Unit tests pin the offsets the
//! protocol engine depends on.

pub mod command;
pub mod credit;
pub mod node;
pub mod stats;

use hubpack::SerializedSize;
use serde::Deserialize;
use serde::Serialize;

/// The per-command size ceiling in the firmware command ring, in bytes.
///
/// The firmware sizes its parse scratch to this value; no serialized command
/// (header plus payload) may exceed it.
pub const MAX_COMMAND_SIZE: usize = 128;

/// Magic value the firmware keeps at a fixed offset past the command ring.
///
/// The firmware writes it once when the command channel comes up; any other
/// value observed afterwards means the ring has been overrun.
pub const GUARD_MAGIC: u32 = 0x5AFE_C0DE;

/// Marker written at the head of every transmitted batch.
pub const BATCH_MARKER: u32 = 0xBA7C_4EAD;

/// The maximum number of WRR predecessors tracked per node.
pub const MAX_PREDECESSORS: usize = 6;

/// The maximum number of egress ports a single scheduler instance serves.
pub const MAX_PORTS: usize = 16;

pub mod version {
    /// Protocol version carried by the channel-init command.
    pub const CURRENT: u8 = 1;
}

/// An error constructing or serializing wire-format data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(any(test, feature = "std"), derive(thiserror::Error))]
pub enum Error {
    /// Hubpack (de)serialization failed, e.g. a truncated buffer.
    Serialization,

    /// A serialized command's length field disagrees with its actual size.
    LengthMismatch { expected: u16, actual: u16 },

    /// A command's response bookkeeping is inconsistent: the response size
    /// must be zero exactly when the response address is null.
    InvalidResponse,

    /// An attempt to reference an invalid per-port queue index.
    InvalidQueue(u8),

    /// A node reports more WRR predecessors than the wire format carries.
    TooManyPredecessors(usize),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Error::Serialization => write!(f, "wire serialization failed"),
            Error::LengthMismatch { expected, actual } => {
                write!(
                    f,
                    "command length field is {expected} but {actual} bytes were produced",
                )
            }
            Error::InvalidResponse => {
                write!(f, "response size and response address must be null together")
            }
            Error::InvalidQueue(index) => write!(f, "invalid queue index: {index}"),
            Error::TooManyPredecessors(n) => {
                write!(f, "{n} predecessors exceeds the limit of {MAX_PREDECESSORS}")
            }
        }
    }
}

impl From<hubpack::Error> for Error {
    fn from(_: hubpack::Error) -> Self {
        Self::Serialization
    }
}

// Queues are indexed per-port. The scheduler hardware fans a port out into at
// most 64 physical queues, so the active-queue bitmap fits one machine word.
type MaskType = u64;

/// A bitmask identifying the set of active queues beneath a single port.
#[derive(Clone, Copy, Default, Deserialize, Eq, PartialEq, Serialize, SerializedSize)]
#[repr(transparent)]
pub struct QueueMask(pub MaskType);

impl core::fmt::Debug for QueueMask {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "QueueMask(0x{:0x})", self.0)
    }
}

impl QueueMask {
    pub const MAX_INDEX: u8 = (core::mem::size_of::<MaskType>() * 8) as _;

    /// Return true if the provided index is set, or false otherwise. If the
    /// index is out of range, an error is returned.
    pub fn is_set(&self, index: u8) -> Result<bool, Error> {
        if index >= Self::MAX_INDEX {
            Err(Error::InvalidQueue(index))
        } else {
            Ok((self.0 & (1 << index)) != 0)
        }
    }

    /// Set the bit at the provided index. If it is out of range, an error is
    /// returned.
    pub fn set(&mut self, index: u8) -> Result<(), Error> {
        if index >= Self::MAX_INDEX {
            Err(Error::InvalidQueue(index))
        } else {
            self.0 |= 1 << index;
            Ok(())
        }
    }

    /// Clear the bit at the provided index. If it is out of range, an error
    /// is returned.
    pub fn clear(&mut self, index: u8) -> Result<(), Error> {
        if index >= Self::MAX_INDEX {
            Err(Error::InvalidQueue(index))
        } else {
            self.0 &= !(1 << index);
            Ok(())
        }
    }

    /// Construct a queue bitmask from a slice of indices.
    ///
    /// If any index is out of bounds, an error is returned.
    pub fn from_indices(indices: &[u8]) -> Result<Self, Error> {
        let mut out = 0;
        for index in indices.iter().copied() {
            if index >= Self::MAX_INDEX {
                return Err(Error::InvalidQueue(index));
            }
            out |= 1 << index;
        }
        Ok(Self(out))
    }

    /// Return the indices of the queues identified by the bitmask.
    pub fn to_indices(&self) -> impl Iterator<Item = u8> + '_ {
        (0..Self::MAX_INDEX).filter(|i| self.is_set(*i).unwrap())
    }

    /// Return the number of queues addressed by `self`.
    pub const fn selected_count(&self) -> usize {
        self.0.count_ones() as _
    }

    /// Return true if no queue is addressed.
    pub const fn is_empty(&self) -> bool {
        self.selected_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::Error;
    use super::QueueMask;

    #[test]
    fn test_queue_mask_from_indices() {
        let ix = vec![0, 1, 2];
        let mask = QueueMask::from_indices(&ix).unwrap();
        assert_eq!(mask.0, 0b111);
        assert_eq!(mask.to_indices().collect::<Vec<_>>(), ix);
    }

    #[test]
    fn test_queue_mask_from_indices_out_of_range() {
        let queue = QueueMask::MAX_INDEX;
        assert_eq!(
            QueueMask::from_indices(&[queue]),
            Err(Error::InvalidQueue(queue))
        );
    }

    #[test]
    fn test_queue_mask_set_clear() {
        let mut mask = QueueMask(0b101);
        assert!(mask.is_set(0).unwrap());
        assert!(!mask.is_set(1).unwrap());
        assert!(mask.is_set(2).unwrap());

        mask.set(1).unwrap();
        assert!(mask.is_set(1).unwrap());

        mask.clear(1).unwrap();
        assert!(!mask.is_set(1).unwrap());

        assert!(mask.set(200).is_err());
        assert!(mask.clear(200).is_err());
        assert!(mask.is_set(200).is_err());
    }
}
