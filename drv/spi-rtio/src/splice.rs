// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Turns a pair of transmit/receive chunk lists into primitive operations.
//!
//! The two lists describe the same stretch of wire time but are cut up
//! independently: `tx = [10 bytes]`, `rx = [4 bytes]` means "clock out ten
//! bytes, keeping the first four that come back". A [`SpliceCursor`] walks
//! both lists at once and emits the fewest [`Segment`]s that each sit inside
//! a single transmit chunk and a single receive chunk:
//!
//! ```text
//!   tx  |AAAAAAAAAA|          Transceive(A[0..4], B[0..4])
//!   rx  |BBBB|                Write(A[4..10])
//! ```
//!
//! Dummy transmit chunks and exhausted transmit lists become reads; discarded
//! receive chunks and exhausted receive lists become writes. Empty chunks are
//! skipped. A cursor built [`with_limit`](SpliceCursor::with_limit) also cuts
//! any segment that would run past the limit, carrying on with the rest of
//! the same chunks in the next one.

use drv_spi_api::{RxBuf, SpiError, TxBuf};
use heapless::Vec;
use ringbuf::*;
use rtio::{Handle, Rtio};

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Spliced(u16),
    Exhausted(u16),
    Empty,
}

ringbuf!(Trace, 16, Trace::None);

/// A byte position inside one chunk of a list.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Pos {
    pub chunk: usize,
    pub offset: usize,
}

/// One primitive operation, in terms of positions in the caller's lists.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    /// Clock out filler while clocking in to `rx`, or into nowhere if `rx` is
    /// `None`.
    Read { rx: Option<Pos>, len: usize },
    Write { tx: Pos, len: usize },
    Transceive { tx: Pos, rx: Pos, len: usize },
}

impl Segment {
    pub fn len(&self) -> usize {
        match *self {
            Segment::Read { len, .. }
            | Segment::Write { len, .. }
            | Segment::Transceive { len, .. } => len,
        }
    }

    pub fn tx(&self) -> Option<Pos> {
        match *self {
            Segment::Write { tx, .. } | Segment::Transceive { tx, .. } => {
                Some(tx)
            }
            Segment::Read { .. } => None,
        }
    }

    pub fn rx(&self) -> Option<Pos> {
        match *self {
            Segment::Read { rx, .. } => rx,
            Segment::Transceive { rx, .. } => Some(rx),
            Segment::Write { .. } => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Default)]
struct Side {
    chunk: usize,
    offset: usize,
}

/// What is left of the current chunk on one side.
#[derive(Copy, Clone)]
enum Avail {
    Data(Pos, usize),
    Filler(usize),
}

impl Avail {
    fn left(self) -> usize {
        match self {
            Avail::Data(_, n) | Avail::Filler(n) => n,
        }
    }
}

impl Side {
    /// Moves past exhausted and empty chunks. `chunk(i)` gives the length of
    /// chunk `i` and whether it carries data.
    fn settle(
        &mut self,
        chunk: impl Fn(usize) -> Option<(usize, bool)>,
    ) -> Option<Avail> {
        loop {
            let (len, data) = chunk(self.chunk)?;
            if self.offset < len {
                let left = len - self.offset;
                return Some(if data {
                    let pos = Pos {
                        chunk: self.chunk,
                        offset: self.offset,
                    };
                    Avail::Data(pos, left)
                } else {
                    Avail::Filler(left)
                });
            }
            self.chunk += 1;
            self.offset = 0;
        }
    }
}

/// Walks a transmit list and a receive list in step.
///
/// The cursor holds no borrow of the lists, so a caller can interleave
/// [`next_segment`](Self::next_segment) with writes into the receive chunks;
/// the lists must not otherwise change between calls.
#[derive(Clone, Debug)]
pub struct SpliceCursor {
    tx: Side,
    rx: Side,
    limit: usize,
}

impl Default for SpliceCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl SpliceCursor {
    /// A cursor whose segments end only at chunk boundaries.
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// A cursor whose segments are also never longer than `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        assert!(limit > 0);
        Self {
            tx: Side::default(),
            rx: Side::default(),
            limit,
        }
    }

    pub fn next_segment(
        &mut self,
        tx: &[TxBuf<'_>],
        rx: &[RxBuf<'_>],
    ) -> Option<Segment> {
        let t = self.tx.settle(|i| {
            tx.get(i).map(|c| (c.len(), matches!(c, TxBuf::Data(_))))
        });
        let r = self.rx.settle(|i| {
            rx.get(i).map(|c| (c.len(), matches!(c, RxBuf::Data(_))))
        });

        let len = match (t, r) {
            (None, None) => return None,
            (Some(a), None) | (None, Some(a)) => a.left(),
            (Some(a), Some(b)) => a.left().min(b.left()),
        }
        .min(self.limit);

        let segment = match (t, r) {
            (Some(Avail::Data(tx, _)), Some(Avail::Data(rx, _))) => {
                Segment::Transceive { tx, rx, len }
            }
            (Some(Avail::Data(tx, _)), _) => Segment::Write { tx, len },
            (_, Some(Avail::Data(rx, _))) => Segment::Read { rx: Some(rx), len },
            _ => Segment::Read { rx: None, len },
        };

        if t.is_some() {
            self.tx.offset += len;
        }
        if r.is_some() {
            self.rx.offset += len;
        }
        Some(segment)
    }
}

/// The SQEs built for one transfer, in chain order.
#[derive(Debug)]
pub struct Chain<const N: usize> {
    handles: Vec<Handle, N>,
}

impl<const N: usize> Chain<N> {
    pub fn head(&self) -> Handle {
        self.handles[0]
    }

    pub fn handles(&self) -> &[Handle] {
        &self.handles
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }
}

/// Builds the chain of SQEs in `rtio` that performs the transfer described
/// by `tx` and `rx`. Every SQE but the last continues into the next.
///
/// Chunks longer than an SQE can stage are spread over as many SQEs as they
/// need; replay with a cursor from [`SpliceCursor::with_limit`]`(B)` to map
/// the chain back onto the lists.
///
/// Fails with [`SpiError::BadTransferSize`] if the transfer moves no bytes,
/// and with [`SpiError::ResourceExhausted`] if `rtio` runs out of SQEs.
/// Either way no SQE is left acquired.
pub fn copy<const N: usize, const B: usize>(
    rtio: &Rtio<N, B>,
    tx: &[TxBuf<'_>],
    rx: &[RxBuf<'_>],
    userdata: u32,
) -> Result<Chain<N>, SpiError> {
    let empty = tx.iter().all(|c| c.len() == 0)
        && rx.iter().all(|c| c.len() == 0);
    if empty {
        ringbuf_entry!(Trace::Empty);
        return Err(SpiError::BadTransferSize);
    }

    let mut handles: Vec<Handle, N> = Vec::new();
    let mut cursor = SpliceCursor::with_limit(B);
    while let Some(segment) = cursor.next_segment(tx, rx) {
        let Some(handle) = rtio.acquire() else {
            ringbuf_entry!(Trace::Exhausted(handles.len() as u16));
            rtio.drop_all(&handles);
            return Err(SpiError::ResourceExhausted);
        };
        if handles.push(handle).is_err() {
            // More handles than the arena holds; acquire() can't allow this.
            panic!();
        }

        let prepared = match segment {
            Segment::Read { len, .. } => rtio.prep_read(handle, len, userdata),
            Segment::Write { tx: pos, len } => {
                rtio.prep_write(handle, tx_bytes(tx, pos, len), userdata)
            }
            Segment::Transceive { tx: pos, len, .. } => {
                rtio.prep_transceive(handle, tx_bytes(tx, pos, len), userdata)
            }
        };
        if prepared.is_err() {
            // The cursor never hands out more than B bytes.
            panic!();
        }

        if let &[.., prev, _] = handles.as_slice() {
            rtio.link(prev, handle);
        }
    }

    ringbuf_entry!(Trace::Spliced(handles.len() as u16));
    Ok(Chain { handles })
}

fn tx_bytes<'a>(tx: &[TxBuf<'a>], pos: Pos, len: usize) -> &'a [u8] {
    match tx[pos.chunk] {
        TxBuf::Data(d) => &d[pos.offset..][..len],
        // The cursor only hands out transmit positions inside data chunks.
        TxBuf::Dummy(_) => unreachable!(),
    }
}
