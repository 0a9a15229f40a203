// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The cmdq/pendq byte FIFOs.
//!
//! Serialized commands live in these queues byte-for-byte; the queue is not
//! a typed container. Each entry frames itself through the `len` field of
//! its own header, so the access pattern is always `peek_header` followed by
//! a `pop` of exactly the reported length. A full queue fails the push
//! loudly; silently dropping a configuration command would desynchronize
//! the driver's view of the scheduler.

use crate::Error;
use hqos_messages::command::CmdHeader;
use hubpack::SerializedSize;

/// A fixed-capacity FIFO of serialized commands.
#[derive(Clone, Debug)]
pub(crate) struct CmdFifo {
    buf: Box<[u8]>,
    head: usize,
    used: usize,
    entries: usize,
}

impl CmdFifo {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity].into_boxed_slice(),
            head: 0,
            used: 0,
            entries: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub(crate) fn entries(&self) -> usize {
        self.entries
    }

    pub(crate) fn free(&self) -> usize {
        self.buf.len() - self.used
    }

    /// Append one serialized command.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if bytes.len() > self.free() {
            return Err(Error::QueueFull { needed: bytes.len() });
        }
        let tail = (self.head + self.used) % self.buf.len();
        let first = bytes.len().min(self.buf.len() - tail);
        self.buf[tail..tail + first].copy_from_slice(&bytes[..first]);
        self.buf[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        self.used += bytes.len();
        self.entries += 1;
        Ok(())
    }

    /// Decode the header of the oldest entry without consuming anything.
    ///
    /// Returns `Ok(None)` on an empty queue. The `len` reported by the
    /// header is the exact number of bytes the matching [`CmdFifo::pop`]
    /// must consume.
    pub(crate) fn peek_header(&self) -> Result<Option<CmdHeader>, Error> {
        if self.is_empty() {
            return Ok(None);
        }
        let mut scratch = [0u8; CmdHeader::MAX_SIZE];
        let n = self.used.min(scratch.len());
        self.copy_from_front(&mut scratch[..n]);
        let header = CmdHeader::read(&scratch[..n])?;
        Ok(Some(header))
    }

    /// Consume and return the oldest `len` bytes, which must be exactly one
    /// entry as reported by [`CmdFifo::peek_header`].
    pub(crate) fn pop(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        if len > self.used || self.entries == 0 {
            return Err(Error::OutOfBounds {
                offset: self.head,
                len,
            });
        }
        let mut out = vec![0; len];
        self.copy_from_front(&mut out);
        self.head = (self.head + len) % self.buf.len();
        self.used -= len;
        self.entries -= 1;
        Ok(out)
    }

    fn copy_from_front(&self, out: &mut [u8]) {
        let first = out.len().min(self.buf.len() - self.head);
        out[..first].copy_from_slice(&self.buf[self.head..self.head + first]);
        out[first..].copy_from_slice(&self.buf[..out.len() - first]);
    }
}

#[cfg(test)]
mod tests {
    use super::CmdFifo;
    use crate::Error;
    use hqos_messages::command::CmdBody;
    use hqos_messages::command::Command;
    use hqos_messages::stats::StatsQuery;
    use hqos_messages::MAX_COMMAND_SIZE;

    fn encoded(seq: u16) -> Vec<u8> {
        let cmd = Command::new(
            seq,
            CmdBody::GetQueueStats(StatsQuery {
                phy: seq,
                clear_on_read: 0,
            }),
        );
        let mut buf = vec![0u8; cmd.wire_size()];
        cmd.encode(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_fifo_order_and_framing() {
        let mut fifo = CmdFifo::with_capacity(1024);
        assert!(fifo.peek_header().unwrap().is_none());

        let first = encoded(1);
        let second = encoded(2);
        fifo.push(&first).unwrap();
        fifo.push(&second).unwrap();
        assert_eq!(fifo.entries(), 2);

        let header = fifo.peek_header().unwrap().unwrap();
        assert_eq!(header.seq, 1);
        assert_eq!(usize::from(header.len), first.len());

        assert_eq!(fifo.pop(first.len()).unwrap(), first);
        let header = fifo.peek_header().unwrap().unwrap();
        assert_eq!(header.seq, 2);
        assert_eq!(fifo.pop(second.len()).unwrap(), second);
        assert!(fifo.is_empty());
    }

    #[test]
    fn test_fifo_wraparound() {
        // Capacity fits two entries; cycling through many forces the head
        // and tail to wrap several times.
        let entry_len = encoded(0).len();
        let mut fifo = CmdFifo::with_capacity(entry_len * 2 + 3);
        for seq in 0..20u16 {
            fifo.push(&encoded(seq)).unwrap();
            if seq > 0 {
                let header = fifo.peek_header().unwrap().unwrap();
                assert_eq!(header.seq, seq - 1);
                assert_eq!(fifo.pop(usize::from(header.len)).unwrap(), encoded(seq - 1));
            }
        }
    }

    #[test]
    fn test_fifo_full_fails_loudly() {
        let entry = encoded(0);
        let mut fifo = CmdFifo::with_capacity(entry.len() + 1);
        fifo.push(&entry).unwrap();
        assert_eq!(
            fifo.push(&entry),
            Err(Error::QueueFull { needed: entry.len() })
        );
        // The queue is untouched by the failed push.
        assert_eq!(fifo.entries(), 1);
        assert_eq!(fifo.pop(entry.len()).unwrap(), entry);
    }

    #[test]
    fn test_pop_more_than_queued_is_an_error() {
        let mut fifo = CmdFifo::with_capacity(MAX_COMMAND_SIZE);
        let entry = encoded(0);
        fifo.push(&entry).unwrap();
        assert!(fifo.pop(entry.len() + 1).is_err());
    }
}
