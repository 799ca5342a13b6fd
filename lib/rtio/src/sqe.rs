// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Submission queue entries.

use crate::Handle;

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct SqeFlags: u8 {
        /// This entry continues into the next one in the chain; the two must
        /// execute back to back with nothing from another chain between them.
        const TRANSACTION = 1 << 0;
    }
}

/// A primitive unit of bus work.
///
/// Lengths are in bytes and never exceed the staging size of the slot that
/// carries the operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Op {
    /// Does nothing. Executors that don't understand it must refuse the whole
    /// chain.
    Nop,
    Read { len: usize },
    Write { len: usize },
    Transceive { len: usize },
}

impl Op {
    pub fn len(self) -> usize {
        match self {
            Op::Nop => 0,
            Op::Read { len } | Op::Write { len } | Op::Transceive { len } => {
                len
            }
        }
    }

    pub fn is_read(self) -> bool {
        matches!(self, Op::Read { .. } | Op::Transceive { .. })
    }

    pub fn is_write(self) -> bool {
        matches!(self, Op::Write { .. } | Op::Transceive { .. })
    }
}

/// Life-cycle of a slot. Each state has exactly one party allowed to touch
/// the slot: the free list, the producer, the dispatcher, the consumer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Free,
    Acquired,
    Submitted,
    Completed,
}

/// One submission queue entry, with its own transmit and receive staging
/// areas of `B` bytes.
#[derive(Debug)]
pub struct Sqe<const B: usize> {
    pub(crate) state: State,
    pub(crate) op: Op,
    pub(crate) flags: SqeFlags,
    pub(crate) next: Option<Handle>,
    pub(crate) userdata: u32,
    pub(crate) result: u32,
    tx: [u8; B],
    rx: [u8; B],
}

impl<const B: usize> Sqe<B> {
    pub(crate) const EMPTY: Self = Self {
        state: State::Free,
        op: Op::Nop,
        flags: SqeFlags::empty(),
        next: None,
        userdata: 0,
        result: 0,
        tx: [0; B],
        rx: [0; B],
    };

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn flags(&self) -> SqeFlags {
        self.flags
    }

    /// Next entry of the chain, if this one continues.
    pub fn next(&self) -> Option<Handle> {
        if self.flags.contains(SqeFlags::TRANSACTION) {
            self.next
        } else {
            None
        }
    }

    pub fn userdata(&self) -> u32 {
        self.userdata
    }

    /// Bytes to be clocked out for this operation. Empty for reads.
    pub fn tx(&self) -> &[u8] {
        if self.op.is_write() {
            &self.tx[..self.op.len()]
        } else {
            &[]
        }
    }

    /// Receive staging for this operation. Empty for writes.
    pub fn rx_mut(&mut self) -> &mut [u8] {
        if self.op.is_read() {
            &mut self.rx[..self.op.len()]
        } else {
            &mut []
        }
    }

    /// Both staging areas at once, for executors that hand them to a bus
    /// together.
    pub fn split_mut(&mut self) -> (Op, &[u8], &mut [u8]) {
        let len = self.op.len();
        (self.op, &self.tx[..len], &mut self.rx[..len])
    }

    pub(crate) fn rx(&self) -> &[u8] {
        if self.op.is_read() {
            &self.rx[..self.op.len()]
        } else {
            &[]
        }
    }

    pub(crate) fn prepare(&mut self, op: Op, tx: &[u8], userdata: u32) {
        self.op = op;
        self.flags = SqeFlags::empty();
        self.next = None;
        self.userdata = userdata;
        self.result = 0;
        self.tx[..tx.len()].copy_from_slice(tx);
    }
}
