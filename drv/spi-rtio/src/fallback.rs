// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Asynchronous transactions on top of a blocking bus driver.
//!
//! A [`FallbackExecutor`] wraps anything that implements [`SpiTransport`].
//! Starting a transaction claims a work item from a [`WorkPool`] shared by
//! every fallback executor in the system and parks the transaction in the
//! executor's job slot. A worker context then calls
//! [`poll`](FallbackExecutor::poll) (or sits in
//! [`serve`](FallbackExecutor::serve)), which flattens the chain into a
//! single `transceive` call so chip select stays asserted across all of it.

use crate::config::FALLBACK_MSGS;
use crate::dispatch::SpiDriver;
use crate::queue::{SpiRtio, SpiTxn};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use drv_spi_api::{RxBuf, SpiError, SpiTransport, TxBuf};
use heapless::Vec;
use ringbuf::*;
use rtio::{Op, Sqe};
use spin::{Mutex, MutexGuard};

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    TooLong(u16),
    BadOp(u16),
    NoWorker(u16),
    Execute(u16, u8),
    TransportError(SpiError),
}

ringbuf!(Trace, 32, Trace::None);

/// A fixed number of work items, shared by the executors that run blocking
/// transfers on behalf of asynchronous callers.
#[derive(Debug)]
pub struct WorkPool {
    free: AtomicUsize,
}

impl WorkPool {
    pub const fn new(items: usize) -> Self {
        Self {
            free: AtomicUsize::new(items),
        }
    }

    pub fn available(&self) -> usize {
        self.free.load(Ordering::Acquire)
    }

    /// Claims a work item, which goes back to the pool when dropped.
    pub fn try_alloc(&self) -> Option<Work<'_>> {
        self.free
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                n.checked_sub(1)
            })
            .ok()
            .map(|_| Work { pool: self })
    }
}

/// A claimed work item.
#[derive(Debug)]
pub struct Work<'p> {
    pool: &'p WorkPool,
}

impl Drop for Work<'_> {
    fn drop(&mut self) {
        self.pool.free.fetch_add(1, Ordering::Release);
    }
}

struct Job<'r, 'p, const N: usize, const B: usize> {
    txn: SpiTxn<'r, N, B>,
    _work: Work<'p>,
}

/// Runs each transaction on `T` as one blocking transfer of at most `MSGS`
/// operations.
pub struct FallbackExecutor<
    'r,
    'p,
    T,
    const N: usize,
    const B: usize,
    const MSGS: usize = { FALLBACK_MSGS },
> {
    bus: SpiRtio<'r, N, B>,
    transport: T,
    pool: &'p WorkPool,
    job: Mutex<Option<Job<'r, 'p, N, B>>>,
}

impl<'r, 'p, T, const N: usize, const B: usize, const MSGS: usize>
    FallbackExecutor<'r, 'p, T, N, B, MSGS>
where
    T: SpiTransport,
{
    pub const fn new(transport: T, pool: &'p WorkPool) -> Self {
        Self {
            bus: SpiRtio::new(),
            transport,
            pool,
            job: Mutex::new(None),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Runs the parked transaction, if there is one, on the calling context.
    /// Returns whether there was anything to do.
    pub fn poll(&self) -> bool {
        let Some(job) = self.job.lock().take() else {
            return false;
        };
        let status = self.execute(&job.txn);
        // The work item goes back before the next transaction can ask for
        // one.
        drop(job);
        self.finish(status);
        true
    }

    /// Polls until `shutdown` is set.
    pub fn serve(&self, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::Acquire) {
            if !self.poll() {
                core::hint::spin_loop();
            }
        }
    }

    fn execute(&self, txn: &SpiTxn<'r, N, B>) -> Result<(), SpiError> {
        let rtio = txn.rtio();

        // Every slot of the chain belongs to us until we finish it, so
        // holding all of the locks at once can't deadlock.
        let mut sqes: Vec<MutexGuard<'_, Sqe<B>>, MSGS> = Vec::new();
        let mut next = Some(txn.head());
        while let Some(handle) = next {
            let sqe = rtio.sqe(handle);
            next = sqe.next();
            if sqes.push(sqe).is_err() {
                ringbuf_entry!(Trace::TooLong(txn.head().index() as u16));
                return Err(SpiError::ResourceExhausted);
            }
        }

        let msgs = sqes.len() as u8;
        let mut tx: Vec<TxBuf<'_>, MSGS> = Vec::new();
        let mut rx: Vec<RxBuf<'_>, MSGS> = Vec::new();
        for sqe in sqes.iter_mut() {
            let (op, out, inc) = sqe.split_mut();
            let (t, r) = match op {
                Op::Read { len } => (TxBuf::Dummy(len), RxBuf::Data(inc)),
                Op::Write { len } => (TxBuf::Data(out), RxBuf::Discard(len)),
                Op::Transceive { .. } => (TxBuf::Data(out), RxBuf::Data(inc)),
                Op::Nop => {
                    ringbuf_entry!(Trace::BadOp(txn.head().index() as u16));
                    return Err(SpiError::InvalidOperation);
                }
            };
            // Both are exactly as long as `sqes`.
            if tx.push(t).is_err() || rx.push(r).is_err() {
                panic!();
            }
        }

        ringbuf_entry!(Trace::Execute(txn.head().index() as u16, msgs));
        self.transport
            .transceive(txn.config(), &tx, &mut rx)
            .map_err(|e| {
                ringbuf_entry!(Trace::TransportError(e));
                e
            })
    }
}

impl<'r, 'p, T, const N: usize, const B: usize, const MSGS: usize>
    SpiDriver<'r, N, B> for FallbackExecutor<'r, 'p, T, N, B, MSGS>
where
    T: SpiTransport,
{
    fn bus(&self) -> &SpiRtio<'r, N, B> {
        &self.bus
    }

    /// Refuses chains that can't be flattened into one transfer: too many
    /// operations, or any operation other than read, write or transceive.
    fn validate(&self, txn: &SpiTxn<'r, N, B>) -> Result<(), SpiError> {
        let id = txn.head().index() as u16;
        for (i, handle) in txn.handles().enumerate() {
            if i == MSGS {
                ringbuf_entry!(Trace::TooLong(id));
                return Err(SpiError::ResourceExhausted);
            }
            if txn.rtio().sqe(handle).op() == Op::Nop {
                ringbuf_entry!(Trace::BadOp(id));
                return Err(SpiError::InvalidOperation);
            }
        }
        Ok(())
    }

    fn start(&self, txn: SpiTxn<'r, N, B>) {
        let Some(work) = self.pool.try_alloc() else {
            ringbuf_entry!(Trace::NoWorker(txn.head().index() as u16));
            self.finish(Err(SpiError::ResourceExhausted));
            return;
        };

        let mut job = self.job.lock();
        // Only the current transaction is ever started.
        assert!(job.is_none());
        *job = Some(Job { txn, _work: work });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::SpiIodev;
    use drv_spi_api::SpiConfig;
    use rtio::{Handle, Rtio};
    use std::cell::{Cell, RefCell};

    const CONFIG: SpiConfig = SpiConfig::new(2_000_000);

    /// What one `transceive` call looked like.
    #[derive(Debug, PartialEq)]
    struct Call {
        tx: std::vec::Vec<Option<std::vec::Vec<u8>>>,
        rx: std::vec::Vec<(bool, usize)>,
    }

    /// Records every call, fills received data with `0xa5` and fails when
    /// told to.
    #[derive(Default)]
    struct Recorder {
        calls: RefCell<std::vec::Vec<Call>>,
        fail: Cell<bool>,
    }

    impl SpiTransport for Recorder {
        fn transceive(
            &self,
            config: &SpiConfig,
            tx: &[TxBuf<'_>],
            rx: &mut [RxBuf<'_>],
        ) -> Result<(), SpiError> {
            assert_eq!(config, &CONFIG);
            self.calls.borrow_mut().push(Call {
                tx: tx
                    .iter()
                    .map(|t| match t {
                        TxBuf::Data(d) => Some(d.to_vec()),
                        TxBuf::Dummy(_) => None,
                    })
                    .collect(),
                rx: rx
                    .iter()
                    .map(|r| (matches!(r, RxBuf::Data(_)), r.len()))
                    .collect(),
            });
            for r in rx.iter_mut() {
                if let RxBuf::Data(d) = r {
                    d.fill(0xa5);
                }
            }
            if self.fail.get() {
                Err(SpiError::Transport)
            } else {
                Ok(())
            }
        }
    }

    type TestRtio = Rtio<16, 8>;

    fn chain(rtio: &TestRtio, ops: &[Op]) -> Handle {
        let handles: std::vec::Vec<Handle> =
            ops.iter().map(|_| rtio.acquire().unwrap()).collect();
        for (i, (&h, op)) in handles.iter().zip(ops).enumerate() {
            match *op {
                Op::Read { len } => rtio.prep_read(h, len, i as u32).unwrap(),
                Op::Write { len } => {
                    rtio.prep_write(h, &vec![i as u8; len], i as u32).unwrap()
                }
                Op::Transceive { len } => rtio
                    .prep_transceive(h, &vec![i as u8; len], i as u32)
                    .unwrap(),
                Op::Nop => rtio.prep_nop(h, i as u32),
            }
        }
        for pair in handles.windows(2) {
            rtio.link(pair[0], pair[1]);
        }
        handles[0]
    }

    fn drain(rtio: &TestRtio) -> std::vec::Vec<Result<(), u32>> {
        std::iter::from_fn(|| rtio.consume())
            .map(|cqe| {
                let result = cqe.result();
                rtio.release(cqe);
                result
            })
            .collect()
    }

    #[test]
    fn chain_becomes_one_transfer() {
        let rtio = TestRtio::new();
        let pool = WorkPool::new(1);
        let exec: FallbackExecutor<'_, '_, Recorder, 16, 8> =
            FallbackExecutor::new(Recorder::default(), &pool);

        let head = chain(
            &rtio,
            &[
                Op::Read { len: 3 },
                Op::Write { len: 2 },
                Op::Transceive { len: 2 },
            ],
        );
        rtio.submit(&SpiIodev::new(&exec, CONFIG), head).unwrap();

        // Parked until a worker gets to it.
        assert!(exec.transport().calls.borrow().is_empty());
        assert_eq!(pool.available(), 0);
        assert!(exec.poll());
        assert!(!exec.poll());
        assert_eq!(pool.available(), 1);

        assert_eq!(
            *exec.transport().calls.borrow(),
            [Call {
                tx: vec![None, Some(vec![1, 1]), Some(vec![2, 2])],
                rx: vec![(true, 3), (false, 2), (true, 2)],
            }]
        );

        let mut got = vec![];
        while let Some(cqe) = rtio.consume() {
            assert_eq!(cqe.result(), Ok(()));
            let mut buf = [0; 8];
            let n = rtio.read_rx(&cqe, &mut buf);
            got.push(buf[..n].to_vec());
            rtio.release(cqe);
        }
        assert_eq!(got, [vec![0xa5; 3], vec![], vec![0xa5; 2]]);
        assert!(exec.bus().is_idle());
    }

    #[test]
    fn too_many_operations() {
        let rtio = TestRtio::new();
        let pool = WorkPool::new(1);
        let exec: FallbackExecutor<'_, '_, Recorder, 16, 8, 2> =
            FallbackExecutor::new(Recorder::default(), &pool);
        let dev = SpiIodev::new(&exec, CONFIG);

        // Refusing twice in a row leaves nothing behind either time.
        for _ in 0..2 {
            let head = chain(&rtio, &[Op::Read { len: 1 }; 3]);
            assert_eq!(
                rtio.submit(&dev, head),
                Err(SpiError::ResourceExhausted)
            );
            assert_eq!(
                drain(&rtio),
                [Err(SpiError::ResourceExhausted as u32); 3]
            );
            assert_eq!(rtio.available(), 16);
            assert!(exec.bus().current().is_none());
            assert_eq!(pool.available(), 1);
        }
        assert!(!exec.poll());
        assert!(exec.transport().calls.borrow().is_empty());

        // Exactly the limit is fine.
        let head = chain(&rtio, &[Op::Read { len: 1 }; 2]);
        rtio.submit(&dev, head).unwrap();
        assert!(exec.poll());
        assert_eq!(drain(&rtio), [Ok(()); 2]);
    }

    #[test]
    fn nop_is_refused() {
        let rtio = TestRtio::new();
        let pool = WorkPool::new(1);
        let exec: FallbackExecutor<'_, '_, Recorder, 16, 8> =
            FallbackExecutor::new(Recorder::default(), &pool);

        let head = chain(&rtio, &[Op::Write { len: 1 }, Op::Nop]);
        assert_eq!(
            rtio.submit(&SpiIodev::new(&exec, CONFIG), head),
            Err(SpiError::InvalidOperation)
        );
        assert_eq!(drain(&rtio), [Err(SpiError::InvalidOperation as u32); 2]);
        assert!(exec.transport().calls.borrow().is_empty());
    }

    #[test]
    fn transport_failure_fails_whole_chain() {
        let rtio = TestRtio::new();
        let pool = WorkPool::new(1);
        let exec: FallbackExecutor<'_, '_, Recorder, 16, 8> =
            FallbackExecutor::new(Recorder::default(), &pool);
        let dev = SpiIodev::new(&exec, CONFIG);

        let first = chain(&rtio, &[Op::Write { len: 1 }; 3]);
        let second = chain(&rtio, &[Op::Read { len: 1 }]);
        rtio.submit(&dev, first).unwrap();
        rtio.submit(&dev, second).unwrap();

        exec.transport().fail.set(true);
        assert!(exec.poll());
        assert_eq!(drain(&rtio), [Err(SpiError::Transport as u32); 3]);

        // The next transaction was started by the failed one's completion.
        exec.transport().fail.set(false);
        assert!(exec.poll());
        assert_eq!(drain(&rtio), [Ok(())]);
        assert_eq!(exec.bus().stats().failed, 1);
        assert_eq!(exec.bus().stats().completed, 1);
    }

    #[test]
    fn shared_pool_runs_dry() {
        let rtio = TestRtio::new();
        let pool = WorkPool::new(1);
        let busy: FallbackExecutor<'_, '_, Recorder, 16, 8> =
            FallbackExecutor::new(Recorder::default(), &pool);
        let starved: FallbackExecutor<'_, '_, Recorder, 16, 8> =
            FallbackExecutor::new(Recorder::default(), &pool);

        let head = chain(&rtio, &[Op::Write { len: 4 }]);
        rtio.submit(&SpiIodev::new(&busy, CONFIG), head).unwrap();
        assert_eq!(pool.available(), 0);

        // Accepted, became current, then failed for want of a worker.
        let head = chain(&rtio, &[Op::Write { len: 4 }, Op::Read { len: 4 }]);
        rtio.submit(&SpiIodev::new(&starved, CONFIG), head).unwrap();
        assert_eq!(drain(&rtio), [Err(SpiError::ResourceExhausted as u32); 2]);
        assert!(starved.bus().is_idle());
        assert!(!starved.poll());

        assert!(busy.poll());
        assert_eq!(drain(&rtio), [Ok(())]);
        assert_eq!(pool.available(), 1);

        // Nothing was left wedged.
        let head = chain(&rtio, &[Op::Read { len: 4 }]);
        rtio.submit(&SpiIodev::new(&starved, CONFIG), head).unwrap();
        assert!(starved.poll());
        assert_eq!(drain(&rtio), [Ok(())]);
    }

    #[test]
    fn work_items_return() {
        let pool = WorkPool::new(2);
        let a = pool.try_alloc().unwrap();
        let b = pool.try_alloc().unwrap();
        assert!(pool.try_alloc().is_none());
        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
    }
}
