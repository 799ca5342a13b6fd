// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Submission/completion queues for asynchronous device I/O.
//!
//! An [`Rtio`] context owns a fixed arena of `N` submission queue entries
//! (SQEs), each with `B` bytes of transmit and receive staging, and a
//! completion queue with room for one completion (CQE) per SQE. A producer:
//!
//! 1. [`acquire`](Rtio::acquire)s SQEs and prepares them with
//!    `prep_read`/`prep_write`/`prep_transceive`/`prep_nop`,
//! 2. [`link`](Rtio::link)s them into a chain that must run as one unit,
//! 3. [`submit`](Rtio::submit)s the head of the chain to an [`Iodev`],
//! 4. [`consume`](Rtio::consume)s one CQE per SQE, copies out any received
//!    bytes with [`read_rx`](Rtio::read_rx), and [`release`](Rtio::release)s
//!    the CQE, which returns the SQE to the arena.
//!
//! SQEs are referred to by [`Handle`], never by pointer. Transmit data is
//! copied into the SQE when it is prepared and received data is copied out
//! when the completion is consumed, so nothing outside the arena is ever
//! borrowed by an in-flight operation.
//!
//! Each slot moves through `Free → Acquired → Submitted → Completed → Free`,
//! and in each state exactly one party may touch it (free list, producer,
//! device, consumer). Violations of that protocol are logic errors and panic.

#![cfg_attr(not(test), no_std)]

mod sqe;

pub use sqe::{Op, Sqe, SqeFlags};

use core::fmt;
use heapless::{Deque, Vec};
use spin::{Mutex, MutexGuard};
use sqe::State;

/// Index of an SQE within its [`Rtio`] arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Handle(u16);

impl Handle {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Error returned when an operation doesn't fit in the SQE staging area.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Overflow;

/// The target of a submission: something that will run a chain of SQEs and
/// eventually [`complete`](Txn::complete) it.
pub trait Iodev<'r, const N: usize, const B: usize> {
    type Error: Copy + Into<u32>;

    /// Accepts `txn` for execution.
    ///
    /// Returning `Ok` is a promise to complete the chain exactly once, now or
    /// later. Returning `Err` means the chain was refused without being
    /// queued; the submitting [`Rtio`] fails it on the device's behalf.
    fn submit(&self, txn: Txn<'r, N, B>) -> Result<(), Self::Error>;
}

/// Completion of one SQE.
///
/// Deliberately neither `Copy` nor `Clone`: [`Rtio::release`] consumes it, so
/// a completion can only be released once.
#[derive(Debug)]
pub struct Cqe {
    handle: Handle,
    result: u32,
    userdata: u32,
}

impl Cqe {
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Status of the transaction this SQE belonged to. Error codes are
    /// nonzero and owned by the device.
    pub fn result(&self) -> Result<(), u32> {
        match self.result {
            0 => Ok(()),
            code => Err(code),
        }
    }

    pub fn userdata(&self) -> u32 {
        self.userdata
    }
}

pub struct Rtio<const N: usize, const B: usize> {
    slots: [Mutex<Sqe<B>>; N],
    free: Mutex<Vec<Handle, N>>,
    cq: Mutex<Deque<Cqe, N>>,
    consumer: Mutex<()>,
}

impl<const N: usize, const B: usize> Default for Rtio<N, B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize, const B: usize> Rtio<N, B> {
    pub fn new() -> Self {
        assert!(N > 0 && N <= usize::from(u16::MAX));

        // Lowest handles come off the free list first.
        let mut free = Vec::new();
        for i in (0..N as u16).rev() {
            if free.push(Handle(i)).is_err() {
                panic!();
            }
        }

        Self {
            slots: core::array::from_fn(|_| Mutex::new(Sqe::EMPTY)),
            free: Mutex::new(free),
            cq: Mutex::new(Deque::new()),
            consumer: Mutex::new(()),
        }
    }

    /// Number of SQEs currently free.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Number of completions waiting to be consumed.
    pub fn pending_completions(&self) -> usize {
        self.cq.lock().len()
    }

    pub fn acquire(&self) -> Option<Handle> {
        let handle = self.free.lock().pop()?;
        let mut sqe = self.sqe(handle);
        assert_eq!(sqe.state, State::Free);
        sqe.state = State::Acquired;
        sqe.prepare(Op::Nop, &[], 0);
        Some(handle)
    }

    pub fn prep_read(
        &self,
        handle: Handle,
        len: usize,
        userdata: u32,
    ) -> Result<(), Overflow> {
        self.prep(handle, Op::Read { len }, &[], userdata)
    }

    pub fn prep_write(
        &self,
        handle: Handle,
        data: &[u8],
        userdata: u32,
    ) -> Result<(), Overflow> {
        self.prep(handle, Op::Write { len: data.len() }, data, userdata)
    }

    /// Prepares a full-duplex transfer of `tx.len()` bytes.
    pub fn prep_transceive(
        &self,
        handle: Handle,
        tx: &[u8],
        userdata: u32,
    ) -> Result<(), Overflow> {
        self.prep(handle, Op::Transceive { len: tx.len() }, tx, userdata)
    }

    pub fn prep_nop(&self, handle: Handle, userdata: u32) {
        // A nop has no payload, so it always fits.
        let _ = self.prep(handle, Op::Nop, &[], userdata);
    }

    fn prep(
        &self,
        handle: Handle,
        op: Op,
        tx: &[u8],
        userdata: u32,
    ) -> Result<(), Overflow> {
        if op.len() > B {
            return Err(Overflow);
        }
        let mut sqe = self.sqe(handle);
        assert_eq!(sqe.state, State::Acquired);
        sqe.prepare(op, tx, userdata);
        Ok(())
    }

    /// Marks `prev` as continuing into `next`.
    pub fn link(&self, prev: Handle, next: Handle) {
        let mut sqe = self.sqe(prev);
        assert_eq!(sqe.state, State::Acquired);
        sqe.flags |= SqeFlags::TRANSACTION;
        sqe.next = Some(next);
    }

    /// Returns acquired but unsubmitted SQEs to the arena.
    pub fn drop_all(&self, handles: &[Handle]) {
        for &handle in handles {
            let mut sqe = self.sqe(handle);
            assert_eq!(sqe.state, State::Acquired);
            sqe.state = State::Free;
            drop(sqe);
            self.put_free(handle);
        }
    }

    /// Submits the chain starting at `head` to `iodev`.
    ///
    /// If the device refuses the chain, every SQE in it is completed with the
    /// device's error before this returns, and the error is also returned.
    pub fn submit<'r, D>(
        &'r self,
        iodev: &D,
        head: Handle,
    ) -> Result<(), D::Error>
    where
        D: Iodev<'r, N, B>,
    {
        let txn = Txn { rtio: self, head };
        for handle in txn.handles() {
            let mut sqe = self.sqe(handle);
            assert_eq!(sqe.state, State::Acquired);
            sqe.state = State::Submitted;
        }

        iodev.submit(txn).map_err(|e| {
            txn.complete(Err(e.into()));
            e
        })
    }

    pub fn consume(&self) -> Option<Cqe> {
        self.cq.lock().pop_front()
    }

    /// Waits for the next completion.
    pub fn consume_blocking(&self) -> Cqe {
        loop {
            if let Some(cqe) = self.consume() {
                return cqe;
            }
            core::hint::spin_loop();
        }
    }

    /// Copies the bytes received by the operation behind `cqe` into `dst`,
    /// returning how many were copied.
    pub fn read_rx(&self, cqe: &Cqe, dst: &mut [u8]) -> usize {
        let sqe = self.sqe(cqe.handle);
        assert_eq!(sqe.state, State::Completed);
        let rx = sqe.rx();
        let n = rx.len().min(dst.len());
        dst[..n].copy_from_slice(&rx[..n]);
        n
    }

    pub fn release(&self, cqe: Cqe) {
        let mut sqe = self.sqe(cqe.handle);
        assert_eq!(sqe.state, State::Completed);
        sqe.state = State::Free;
        drop(sqe);
        self.put_free(cqe.handle);
    }

    /// Claims the completion queue for a consumer that expects to see only
    /// its own completions, such as a blocking transfer.
    ///
    /// The lock only excludes other holders. A producer that submits without
    /// it and collects its completions with [`consume`](Self::consume) can
    /// still have them land in front of the holder's, so a context shared
    /// with such a producer must have no chains of theirs in flight while
    /// the lock is held.
    pub fn lock_consumer(&self) -> MutexGuard<'_, ()> {
        self.consumer.lock()
    }

    /// Locks one SQE.
    ///
    /// Devices use this to read the operations of a chain they were handed;
    /// the slot protocol guarantees nobody else is touching those entries.
    pub fn sqe(&self, handle: Handle) -> MutexGuard<'_, Sqe<B>> {
        self.slots[handle.index()].lock()
    }

    fn put_free(&self, handle: Handle) {
        if self.free.lock().push(handle).is_err() {
            panic!();
        }
    }
}

/// A submitted chain of SQEs, as seen by the device running it.
pub struct Txn<'r, const N: usize, const B: usize> {
    rtio: &'r Rtio<N, B>,
    head: Handle,
}

// Derives would demand `Rtio: Clone` and friends.
impl<const N: usize, const B: usize> Clone for Txn<'_, N, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<const N: usize, const B: usize> Copy for Txn<'_, N, B> {}

impl<const N: usize, const B: usize> PartialEq for Txn<'_, N, B> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.rtio, other.rtio) && self.head == other.head
    }
}

impl<const N: usize, const B: usize> Eq for Txn<'_, N, B> {}

impl<const N: usize, const B: usize> fmt::Debug for Txn<'_, N, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Txn")
            .field("rtio", &(self.rtio as *const Rtio<N, B>))
            .field("head", &self.head)
            .finish()
    }
}

impl<'r, const N: usize, const B: usize> Txn<'r, N, B> {
    pub fn rtio(&self) -> &'r Rtio<N, B> {
        self.rtio
    }

    pub fn head(&self) -> Handle {
        self.head
    }

    /// Walks the chain in execution order.
    pub fn handles(&self) -> Handles<'r, N, B> {
        Handles {
            rtio: self.rtio,
            next: Some(self.head),
        }
    }

    /// Number of operations in the chain.
    pub fn len(&self) -> usize {
        self.handles().count()
    }

    /// Delivers `result` for every SQE of the chain, in chain order.
    ///
    /// # Panics
    ///
    /// Panics if any SQE of the chain is not in the submitted state, which
    /// would mean the chain is being completed twice.
    pub fn complete(&self, result: Result<(), u32>) {
        let code = match result {
            Ok(()) => 0,
            Err(code) => code,
        };

        let mut next = Some(self.head);
        while let Some(handle) = next {
            let mut sqe = self.rtio.sqe(handle);
            assert_eq!(sqe.state, State::Submitted);
            // Read the link before the CQE is visible: once it is, the
            // consumer may release the slot.
            next = sqe.next();
            sqe.state = State::Completed;
            sqe.result = code;
            let cqe = Cqe {
                handle,
                result: code,
                userdata: sqe.userdata,
            };
            drop(sqe);

            if self.rtio.cq.lock().push_back(cqe).is_err() {
                panic!();
            }
        }
    }
}

/// Iterator over the handles of a chain; see [`Txn::handles`].
pub struct Handles<'r, const N: usize, const B: usize> {
    rtio: &'r Rtio<N, B>,
    next: Option<Handle>,
}

impl<const N: usize, const B: usize> Iterator for Handles<'_, N, B> {
    type Item = Handle;

    fn next(&mut self) -> Option<Handle> {
        let handle = self.next?;
        self.next = self.rtio.sqe(handle).next();
        Some(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    type TestRtio = Rtio<4, 8>;

    /// Holds on to whatever it is given until told to finish it.
    struct Parked<'r> {
        txn: RefCell<Option<Txn<'r, 4, 8>>>,
        refuse: Option<u32>,
    }

    impl<'r> Parked<'r> {
        fn new(refuse: Option<u32>) -> Self {
            Self {
                txn: RefCell::new(None),
                refuse,
            }
        }

        fn finish(&self, result: Result<(), u32>) {
            self.txn.borrow_mut().take().unwrap().complete(result);
        }
    }

    impl<'r> Iodev<'r, 4, 8> for Parked<'r> {
        type Error = u32;

        fn submit(&self, txn: Txn<'r, 4, 8>) -> Result<(), u32> {
            if let Some(code) = self.refuse {
                return Err(code);
            }
            *self.txn.borrow_mut() = Some(txn);
            Ok(())
        }
    }

    fn chain(rtio: &TestRtio, n: usize) -> std::vec::Vec<Handle> {
        let handles: std::vec::Vec<_> =
            (0..n).map(|_| rtio.acquire().unwrap()).collect();
        for (i, &h) in handles.iter().enumerate() {
            rtio.prep_transceive(h, &[i as u8; 2], i as u32).unwrap();
        }
        for pair in handles.windows(2) {
            rtio.link(pair[0], pair[1]);
        }
        handles
    }

    #[test]
    fn acquire_until_empty() {
        let rtio = TestRtio::new();
        let all: std::vec::Vec<_> =
            std::iter::from_fn(|| rtio.acquire()).collect();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].index(), 0);
        assert_eq!(rtio.available(), 0);

        rtio.drop_all(&all);
        assert_eq!(rtio.available(), 4);
    }

    #[test]
    fn staging_overflow() {
        let rtio = TestRtio::new();
        let h = rtio.acquire().unwrap();
        assert_eq!(rtio.prep_write(h, &[0; 9], 0), Err(Overflow));
        assert_eq!(rtio.prep_read(h, 9, 0), Err(Overflow));
        assert_eq!(rtio.prep_read(h, 8, 0), Ok(()));
    }

    #[test]
    fn chain_walk() {
        let rtio = TestRtio::new();
        let handles = chain(&rtio, 3);
        let txn = Txn {
            rtio: &rtio,
            head: handles[0],
        };
        assert_eq!(txn.handles().collect::<std::vec::Vec<_>>(), handles);
        assert_eq!(txn.len(), 3);
        assert!(rtio.sqe(handles[1]).flags().contains(SqeFlags::TRANSACTION));
        assert!(rtio.sqe(handles[2]).flags().is_empty());
    }

    #[test]
    fn completions_in_chain_order() {
        let rtio = TestRtio::new();
        let dev = Parked::new(None);
        let handles = chain(&rtio, 3);

        rtio.submit(&dev, handles[0]).unwrap();
        assert!(rtio.consume().is_none());

        // Pretend the device looped the transmit bytes back.
        for &h in &handles {
            let mut sqe = rtio.sqe(h);
            let (_, tx, rx) = sqe.split_mut();
            let tx: [u8; 2] = tx.try_into().unwrap();
            rx.copy_from_slice(&tx);
        }
        dev.finish(Ok(()));

        for (i, &h) in handles.iter().enumerate() {
            let cqe = rtio.consume().unwrap();
            assert_eq!(cqe.handle(), h);
            assert_eq!(cqe.userdata(), i as u32);
            assert_eq!(cqe.result(), Ok(()));
            let mut buf = [0; 4];
            assert_eq!(rtio.read_rx(&cqe, &mut buf), 2);
            assert_eq!(buf, [i as u8, i as u8, 0, 0]);
            rtio.release(cqe);
        }
        assert_eq!(rtio.available(), 4);
    }

    #[test]
    fn refused_chain_fails_every_entry() {
        let rtio = TestRtio::new();
        let dev = Parked::new(Some(7));
        let handles = chain(&rtio, 2);

        assert_eq!(rtio.submit(&dev, handles[0]), Err(7));
        assert_eq!(rtio.pending_completions(), 2);
        while let Some(cqe) = rtio.consume() {
            assert_eq!(cqe.result(), Err(7));
            rtio.release(cqe);
        }
        assert_eq!(rtio.available(), 4);
    }

    #[test]
    #[should_panic]
    fn double_completion() {
        let rtio = TestRtio::new();
        let dev = Parked::new(None);
        let handles = chain(&rtio, 1);
        rtio.submit(&dev, handles[0]).unwrap();
        let txn = dev.txn.borrow_mut().take().unwrap();
        txn.complete(Ok(()));
        txn.complete(Ok(()));
    }
}
