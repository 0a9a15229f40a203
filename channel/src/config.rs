// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Configuration of the firmware command channel.
//!
//! The layout values describe the memory window the platform shares with
//! the firmware: where the command ring, guard word, response buffer, and
//! firmware log ring sit inside it. They come from platform configuration
//! and must match the firmware build.

use crate::fat::FatRegions;
use crate::Error;
use hqos_messages::MAX_COMMAND_SIZE;
use std::time::Duration;

/// Return the default interval between completion polls.
pub const fn default_poll_interval() -> Duration {
    Duration::from_micros(50)
}

/// Return the default bound on completion polls per command.
pub const fn default_n_polls() -> u32 {
    20_000
}

/// Return the default bound on firmware-ready polls at bring-up.
pub const fn default_ready_polls() -> u32 {
    1_000
}

/// Return the default interval between firmware-ready polls.
pub const fn default_ready_interval() -> Duration {
    Duration::from_millis(1)
}

/// Configuration for a [`crate::Channel`].
///
/// The [`ConfigBuilder`] fills in defaults that match the reference
/// firmware's shared-window layout.
#[derive(Clone, Debug)]
pub struct Config {
    /// Host-physical base of the window shared with the firmware. Offsets
    /// below are relative to it.
    pub shared_base: u64,

    /// Byte offset and size of the firmware command ring.
    pub ring_offset: usize,
    pub ring_size: usize,

    /// Byte offset of the guard word. The firmware writes
    /// [`hqos_messages::GUARD_MAGIC`] there when the channel comes up.
    pub guard_offset: usize,

    /// Byte offset and size of the shared response buffer.
    pub response_offset: usize,
    pub response_size: usize,

    /// Byte offset and size of the firmware's log ring, dumped on fatal
    /// channel errors.
    pub fw_log_offset: usize,
    pub fw_log_size: usize,

    /// Initial firmware log level, carried by the logger-init command.
    pub fw_log_level: u8,

    /// Capacity of each host-side command FIFO, in bytes.
    pub cmdq_capacity: usize,

    /// The bound on completion polls for a single command, and the interval
    /// between them.
    pub n_polls: u32,
    pub poll_interval: Duration,

    /// The bound on firmware-ready polls at bring-up, and the interval
    /// between them.
    pub ready_polls: u32,
    pub ready_interval: Duration,

    /// The host regions aliased into the firmware's address space.
    pub fat: FatRegions,
}

/// A builder interface for generating channel configuration.
#[derive(Debug)]
pub struct ConfigBuilder {
    shared_base: u64,
    fat: FatRegions,
    ring_offset: usize,
    ring_size: usize,
    guard_offset: Option<usize>,
    response_offset: usize,
    response_size: usize,
    fw_log_offset: usize,
    fw_log_size: usize,
    fw_log_level: u8,
    cmdq_capacity: usize,
    n_polls: u32,
    poll_interval: Duration,
    ready_polls: u32,
    ready_interval: Duration,
}

impl ConfigBuilder {
    /// Create a builder for a shared window at `shared_base`, aliasing the
    /// provided host regions at bring-up.
    pub fn new(shared_base: u64, fat: FatRegions) -> Self {
        Self {
            shared_base,
            fat,
            ring_offset: 0x0,
            ring_size: 0x1000,
            guard_offset: None,
            response_offset: 0x1010,
            response_size: 0x800,
            fw_log_offset: 0x2000,
            fw_log_size: 0x400,
            fw_log_level: 3,
            cmdq_capacity: 0x2000,
            n_polls: default_n_polls(),
            poll_interval: default_poll_interval(),
            ready_polls: default_ready_polls(),
            ready_interval: default_ready_interval(),
        }
    }

    /// Place the command ring within the shared window.
    pub fn ring(mut self, offset: usize, size: usize) -> Self {
        self.ring_offset = offset;
        self.ring_size = size;
        self
    }

    /// Place the guard word. The default is the first word past the ring.
    pub fn guard_offset(mut self, offset: usize) -> Self {
        self.guard_offset = Some(offset);
        self
    }

    /// Place the response buffer within the shared window.
    pub fn responses(mut self, offset: usize, size: usize) -> Self {
        self.response_offset = offset;
        self.response_size = size;
        self
    }

    /// Place the firmware log ring within the shared window.
    pub fn fw_log(mut self, offset: usize, size: usize) -> Self {
        self.fw_log_offset = offset;
        self.fw_log_size = size;
        self
    }

    /// Set the initial firmware log level.
    pub fn fw_log_level(mut self, level: u8) -> Self {
        self.fw_log_level = level;
        self
    }

    /// Set the capacity of the host-side command FIFOs.
    pub fn cmdq_capacity(mut self, capacity: usize) -> Self {
        self.cmdq_capacity = capacity;
        self
    }

    /// Set the completion-poll bound and interval.
    pub fn polling(mut self, n_polls: u32, interval: Duration) -> Self {
        self.n_polls = n_polls;
        self.poll_interval = interval;
        self
    }

    /// Set the firmware-ready poll bound and interval.
    pub fn ready_polling(mut self, n_polls: u32, interval: Duration) -> Self {
        self.ready_polls = n_polls;
        self.ready_interval = interval;
        self
    }

    /// Build a `Config` from `self`, validating the layout.
    pub fn build(self) -> Result<Config, Error> {
        let guard_offset = self
            .guard_offset
            .unwrap_or(self.ring_offset + self.ring_size);

        // The transmitter needs room for the batch marker plus at least one
        // full-sized command, or it could never make progress.
        if self.ring_size < 4 + MAX_COMMAND_SIZE || self.ring_size % 4 != 0 {
            return Err(Error::InvalidConfig("command ring too small or unaligned"));
        }
        if self.response_size < 8 {
            return Err(Error::InvalidConfig("response buffer too small"));
        }
        if self.cmdq_capacity < MAX_COMMAND_SIZE {
            return Err(Error::InvalidConfig("command FIFO smaller than one command"));
        }
        if self.n_polls == 0 || self.ready_polls == 0 {
            return Err(Error::InvalidConfig("poll bounds must be nonzero"));
        }

        // The four shared regions must not overlap one another.
        let mut regions = [
            (self.ring_offset, self.ring_size),
            (guard_offset, 4),
            (self.response_offset, self.response_size),
            (self.fw_log_offset, self.fw_log_size),
        ];
        regions.sort_unstable();
        for pair in regions.windows(2) {
            if pair[0].0 + pair[0].1 > pair[1].0 {
                return Err(Error::InvalidConfig("shared regions overlap"));
            }
        }

        Ok(Config {
            shared_base: self.shared_base,
            ring_offset: self.ring_offset,
            ring_size: self.ring_size,
            guard_offset,
            response_offset: self.response_offset,
            response_size: self.response_size,
            fw_log_offset: self.fw_log_offset,
            fw_log_size: self.fw_log_size,
            fw_log_level: self.fw_log_level,
            cmdq_capacity: self.cmdq_capacity,
            n_polls: self.n_polls,
            poll_interval: self.poll_interval,
            ready_polls: self.ready_polls,
            ready_interval: self.ready_interval,
            fat: self.fat,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::ConfigBuilder;
    use crate::test_utils::test_fat_regions;
    use crate::Error;

    #[test]
    fn test_builder_defaults() {
        let config = ConfigBuilder::new(0x2_3000_0000, test_fat_regions())
            .build()
            .unwrap();
        assert_eq!(config.guard_offset, config.ring_offset + config.ring_size);
        assert!(config.response_offset >= config.guard_offset + 4);
    }

    #[test]
    fn test_builder_rejects_tiny_ring() {
        let result = ConfigBuilder::new(0x2_3000_0000, test_fat_regions())
            .ring(0, 64)
            .build();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_builder_rejects_overlap() {
        let result = ConfigBuilder::new(0x2_3000_0000, test_fat_regions())
            .responses(0x800, 0x1000)
            .build();
        assert!(matches!(
            result,
            Err(Error::InvalidConfig("shared regions overlap"))
        ));
    }
}
