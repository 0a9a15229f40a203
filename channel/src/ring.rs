// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Length-checked views over the two firmware-shared byte regions.
//!
//! All traffic into the command ring and out of the response buffer funnels
//! through these two types; nothing else in the crate computes shared-memory
//! offsets. Offsets here are region-relative, matching the
//! `position_in_fw_buffer` values stamped into transmitted commands.

use crate::Error;
use crate::Hardware;

/// The firmware's command ring: a `(base, capacity, cursor)` window that
/// only ever appends within bounds.
#[derive(Clone, Debug)]
pub(crate) struct CommandRing {
    base: usize,
    capacity: usize,
    cursor: usize,
    high_water: usize,
}

impl CommandRing {
    pub(crate) fn new(base: usize, capacity: usize) -> Self {
        Self {
            base,
            capacity,
            cursor: 0,
            high_water: 0,
        }
    }

    /// Rewind the write cursor for a new batch. The previous batch must have
    /// fully drained before this is called.
    pub(crate) fn reset(&mut self) {
        self.cursor = 0;
    }

    pub(crate) fn cursor(&self) -> usize {
        self.cursor
    }

    pub(crate) fn remaining(&self) -> usize {
        self.capacity - self.cursor
    }

    /// The deepest the cursor has ever advanced, across all batches.
    pub(crate) fn high_water(&self) -> usize {
        self.high_water
    }

    /// Append `bytes` at the cursor, returning the ring-relative offset they
    /// were written at.
    pub(crate) fn append<H: Hardware>(
        &mut self,
        hw: &mut H,
        bytes: &[u8],
    ) -> Result<u32, Error> {
        let offset = self.cursor;
        if bytes.len() > self.capacity - offset {
            return Err(Error::OutOfBounds {
                offset,
                len: bytes.len(),
            });
        }
        hw.write_at(self.base + offset, bytes)?;
        self.cursor += bytes.len();
        if self.cursor > self.high_water {
            self.high_water = self.cursor;
        }
        Ok(offset as u32)
    }

    /// Read a `u32` at a ring-relative offset, without moving the cursor.
    pub(crate) fn read_u32_at<H: Hardware>(
        &self,
        hw: &H,
        offset: usize,
    ) -> Result<u32, Error> {
        self.check(offset, 4)?;
        hw.read_u32(self.base + offset)
    }

    /// Rewrite a `u32` at a ring-relative offset, without moving the cursor.
    /// Used to stamp the last-in-batch bit after the drain loop.
    pub(crate) fn write_u32_at<H: Hardware>(
        &self,
        hw: &mut H,
        offset: usize,
        value: u32,
    ) -> Result<(), Error> {
        self.check(offset, 4)?;
        hw.write_u32(self.base + offset, value)
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), Error> {
        if offset.checked_add(len).map_or(true, |end| end > self.capacity) {
            return Err(Error::OutOfBounds { offset, len });
        }
        Ok(())
    }
}

/// The shared response buffer the firmware writes query results into.
#[derive(Clone, Debug)]
pub(crate) struct ResponseBuffer {
    base: usize,
    capacity: usize,
}

impl ResponseBuffer {
    pub(crate) fn new(base: usize, capacity: usize) -> Self {
        Self { base, capacity }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Read `buf.len()` bytes at a buffer-relative offset.
    pub(crate) fn read_at<H: Hardware>(
        &self,
        hw: &H,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        if offset.checked_add(buf.len()).map_or(true, |end| end > self.capacity) {
            return Err(Error::OutOfBounds {
                offset,
                len: buf.len(),
            });
        }
        hw.read_at(self.base + offset, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::CommandRing;
    use super::ResponseBuffer;
    use crate::test_utils::MockHardware;
    use crate::Error;
    use crate::Hardware;

    #[test]
    fn test_ring_append_and_cursor() {
        let mut hw = MockHardware::with_memory(256);
        let mut ring = CommandRing::new(16, 64);

        let pos = ring.append(&mut hw, &[1, 2, 3, 4]).unwrap();
        assert_eq!(pos, 0);
        assert_eq!(ring.cursor(), 4);
        assert_eq!(ring.remaining(), 60);

        let pos = ring.append(&mut hw, &[5, 6]).unwrap();
        assert_eq!(pos, 4);
        assert_eq!(ring.high_water(), 6);

        // Data landed at base + offset in the shared window.
        let mut buf = [0u8; 6];
        hw.read_at(16, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5, 6]);

        ring.reset();
        assert_eq!(ring.cursor(), 0);
        assert_eq!(ring.high_water(), 6);
    }

    #[test]
    fn test_ring_append_bounds() {
        let mut hw = MockHardware::with_memory(256);
        let mut ring = CommandRing::new(0, 8);
        ring.append(&mut hw, &[0; 6]).unwrap();
        assert!(matches!(
            ring.append(&mut hw, &[0; 3]),
            Err(Error::OutOfBounds { .. })
        ));
        // A failed append must not move the cursor.
        assert_eq!(ring.cursor(), 6);
    }

    #[test]
    fn test_ring_word_access_bounds() {
        let mut hw = MockHardware::with_memory(256);
        let ring = CommandRing::new(0, 16);
        ring.write_u32_at(&mut hw, 8, 0xAABB_CCDD).unwrap();
        assert_eq!(ring.read_u32_at(&hw, 8).unwrap(), 0xAABB_CCDD);
        assert!(ring.read_u32_at(&hw, 13).is_err());
        assert!(ring.write_u32_at(&mut hw, 14, 0).is_err());
    }

    #[test]
    fn test_response_buffer_bounds() {
        let hw = MockHardware::with_memory(256);
        let responses = ResponseBuffer::new(128, 32);
        let mut buf = [0u8; 32];
        responses.read_at(&hw, 0, &mut buf).unwrap();
        assert!(responses.read_at(&hw, 1, &mut buf).is_err());
    }
}
