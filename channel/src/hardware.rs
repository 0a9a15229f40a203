// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The seam between the channel and the physical device.
//!
//! Everything the protocol engine needs from the hardware goes through this
//! trait: byte access to the window shared with the firmware, the doorbell,
//! the FAT window-control registers, and the firmware's DCCM-published tick
//! rate. The test suite substitutes an in-memory implementation with a mock
//! firmware behind the doorbell.

use crate::Error;

pub trait Hardware {
    /// Read `buf.len()` bytes from the shared window at `offset`.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<(), Error>;

    /// Write `buf` into the shared window at `offset`.
    fn write_at(&mut self, offset: usize, buf: &[u8]) -> Result<(), Error>;

    /// Ring the firmware doorbell. Any nonzero value is a valid wake-up.
    fn ring_doorbell(&mut self, value: u32);

    /// Program one of the four FAT window-control registers. Each register
    /// carries four 8-bit alias sub-fields.
    fn write_fat_register(&mut self, register: usize, value: u32);

    /// The credit-update tick rate the firmware publishes in its DCCM
    /// mirror, or zero before the firmware has reported it.
    fn updates_per_sec(&self) -> u32;

    /// Zero and cache-flush the shared bandwidth-limit shadow regions.
    fn clear_bwl_shadow(&mut self);

    /// Read a little-endian `u32` from the shared window.
    fn read_u32(&self, offset: usize) -> Result<u32, Error> {
        let mut buf = [0u8; 4];
        self.read_at(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Write a little-endian `u32` into the shared window.
    fn write_u32(&mut self, offset: usize, value: u32) -> Result<(), Error> {
        self.write_at(offset, &value.to_le_bytes())
    }
}
