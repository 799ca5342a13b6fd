// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-bus transaction queue.
//!
//! A bus runs one transaction at a time. [`SpiRtio`] holds the transaction
//! that currently owns the bus and a FIFO of those waiting behind it, and
//! decides when the next one gets to start. It never touches hardware: the
//! driver that owns the queue is told to start a transaction whenever one
//! becomes current, and reports back through [`SpiRtio::complete`].

use crate::config::PENDING_DEPTH;
use core::sync::atomic::{AtomicU32, Ordering};
use drv_spi_api::{SpiConfig, SpiError};
use heapless::mpmc::MpMcQueue;
use ringbuf::*;
use rtio::{Handle, Handles, Rtio, Txn};
use spin::Mutex;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Queued(u16),
    QueueFull(u16),
    Busy,
    Promoted(u16),
    Idle,
    Completed(u16, u32),
    Spurious,
}

ringbuf!(Trace, 64, Trace::None);

/// A submitted chain, together with the settings of the device that
/// submitted it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SpiTxn<'r, const N: usize, const B: usize> {
    txn: Txn<'r, N, B>,
    config: SpiConfig,
}

impl<'r, const N: usize, const B: usize> SpiTxn<'r, N, B> {
    pub fn new(txn: Txn<'r, N, B>, config: SpiConfig) -> Self {
        Self { txn, config }
    }

    pub fn txn(&self) -> Txn<'r, N, B> {
        self.txn
    }

    pub fn config(&self) -> &SpiConfig {
        &self.config
    }

    pub fn rtio(&self) -> &'r Rtio<N, B> {
        self.txn.rtio()
    }

    pub fn head(&self) -> Handle {
        self.txn.head()
    }

    pub fn handles(&self) -> Handles<'r, N, B> {
        self.txn.handles()
    }

    fn id(&self) -> u16 {
        self.head().index() as u16
    }
}

/// Running totals for one bus.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Transactions accepted into the queue.
    pub submitted: u32,
    /// Transactions completed successfully.
    pub completed: u32,
    /// Transactions completed with an error.
    pub failed: u32,
    /// Transactions turned away because the queue was full.
    pub rejected: u32,
}

pub struct SpiRtio<'r, const N: usize, const B: usize> {
    current: Mutex<Option<SpiTxn<'r, N, B>>>,
    pending: MpMcQueue<SpiTxn<'r, N, B>, PENDING_DEPTH>,
    submitted: AtomicU32,
    completed: AtomicU32,
    failed: AtomicU32,
    rejected: AtomicU32,
}

impl<const N: usize, const B: usize> Default for SpiRtio<'_, N, B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'r, const N: usize, const B: usize> SpiRtio<'r, N, B> {
    pub const fn new() -> Self {
        Self {
            current: Mutex::new(None),
            pending: MpMcQueue::new(),
            submitted: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            failed: AtomicU32::new(0),
            rejected: AtomicU32::new(0),
        }
    }

    /// Queues `txn` behind everything submitted before it.
    ///
    /// Returns the transaction that became current if the bus was idle; the
    /// caller must start it. `None` means `txn` has to wait and will be
    /// handed out by a later [`complete`](Self::complete).
    pub fn submit(
        &self,
        txn: SpiTxn<'r, N, B>,
    ) -> Result<Option<SpiTxn<'r, N, B>>, SpiError> {
        let id = txn.id();
        if self.pending.enqueue(txn).is_err() {
            ringbuf_entry!(Trace::QueueFull(id));
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(SpiError::ResourceExhausted);
        }
        ringbuf_entry!(Trace::Queued(id));
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(self.promote_idle())
    }

    /// Installs the oldest pending transaction if nothing is current, and
    /// returns it.
    fn promote_idle(&self) -> Option<SpiTxn<'r, N, B>> {
        let mut current = self.current.lock();
        if current.is_some() {
            ringbuf_entry!(Trace::Busy);
            return None;
        }
        *current = self.pending.dequeue();
        Self::trace_promotion(*current)
    }

    /// Replaces the current transaction with the oldest pending one. Returns
    /// the one that finished and the one that took its place; `None` if
    /// nothing was current.
    fn promote_after_completion(
        &self,
    ) -> Option<(SpiTxn<'r, N, B>, Option<SpiTxn<'r, N, B>>)> {
        let mut current = self.current.lock();
        let finished = current.take()?;
        *current = self.pending.dequeue();
        Some((finished, Self::trace_promotion(*current)))
    }

    fn trace_promotion(
        promoted: Option<SpiTxn<'r, N, B>>,
    ) -> Option<SpiTxn<'r, N, B>> {
        match &promoted {
            Some(txn) => {
                ringbuf_entry!(Trace::Promoted(txn.id()));
            }
            None => {
                ringbuf_entry!(Trace::Idle);
            }
        }
        promoted
    }

    /// Ends the current transaction with `status`.
    ///
    /// The next pending transaction, if any, is made current first, and then
    /// `status` is delivered to every operation of the finished one. Returns
    /// the transaction that became current, which the caller must start.
    ///
    /// Calling this with nothing current does nothing and returns `None`.
    pub fn complete(
        &self,
        status: Result<(), SpiError>,
    ) -> Option<SpiTxn<'r, N, B>> {
        let Some((finished, started)) = self.promote_after_completion() else {
            ringbuf_entry!(Trace::Spurious);
            return None;
        };

        let code = status.map_err(u32::from);
        ringbuf_entry!(Trace::Completed(
            finished.id(),
            code.err().unwrap_or(0)
        ));
        match status {
            Ok(()) => self.completed.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };

        finished.txn.complete(code);
        started
    }

    /// The transaction that owns the bus right now.
    pub fn current(&self) -> Option<SpiTxn<'r, N, B>> {
        *self.current.lock()
    }

    pub fn is_idle(&self) -> bool {
        self.current.lock().is_none()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}
