// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronous transfers for callers that just want to wait.

use crate::dispatch::{SpiDriver, SpiIodev};
use crate::splice::{self, Segment, SpliceCursor};
use drv_spi_api::{RxBuf, SpiConfig, SpiError, TxBuf};
use ringbuf::*;
use rtio::{Cqe, Rtio};

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Occupied(usize),
    Stray { expected: u16, got: u16 },
}

ringbuf!(Trace, 8, Trace::None);

/// Performs one transfer on `driver`'s bus and waits for it to finish.
///
/// The transfer is split into operations in `rtio`, submitted as a single
/// transaction, and then every one of its completions is consumed, whatever
/// the outcome, so `rtio` ends up exactly as it started. Received bytes are
/// copied into `rx` only if the transaction succeeded.
///
/// Concurrent blocking transfers on the same `rtio` take turns. Completions
/// left in `rtio` by other submitters make this fail with
/// [`SpiError::ResourceExhausted`] before anything is queued; a chain of
/// theirs that is still in flight must not finish while this runs (see
/// [`Rtio::lock_consumer`]). If `driver` completes from another context (a
/// worker or an interrupt), that context has to be running or this never
/// returns.
pub fn transceive<'r, D, const N: usize, const B: usize>(
    driver: &D,
    rtio: &'r Rtio<N, B>,
    config: &SpiConfig,
    tx: &[TxBuf<'_>],
    rx: &mut [RxBuf<'_>],
) -> Result<(), SpiError>
where
    D: SpiDriver<'r, N, B> + ?Sized,
{
    config.validate()?;

    let _consumer = rtio.lock_consumer();
    let pending = rtio.pending_completions();
    if pending != 0 {
        ringbuf_entry!(Trace::Occupied(pending));
        return Err(SpiError::ResourceExhausted);
    }
    let chain = splice::copy(rtio, tx, rx, 0)?;

    // A refused chain has already been completed with the reason, so it is
    // drained like any other.
    let _ = rtio.submit(&SpiIodev::new(driver, *config), chain.head());

    let mut status = Ok(());
    let mut cursor = SpliceCursor::with_limit(B);
    for &expected in chain.handles() {
        let cqe = rtio.consume_blocking();
        if cqe.handle() != expected {
            ringbuf_entry!(Trace::Stray {
                expected: expected.index() as u16,
                got: cqe.handle().index() as u16,
            });
            panic!();
        }

        // The cursor replays the split so each completion lines up with the
        // part of `rx` it was built from.
        let segment = cursor.next_segment(tx, rx);
        match cqe.result() {
            Err(code) => {
                if status.is_ok() {
                    status = Err(SpiError::from_code(code));
                }
            }
            Ok(()) => {
                if let (Ok(()), Some(segment)) = (status, segment) {
                    scatter(rtio, &cqe, segment, rx);
                }
            }
        }
        rtio.release(cqe);
    }
    status
}

fn scatter<const N: usize, const B: usize>(
    rtio: &Rtio<N, B>,
    cqe: &Cqe,
    segment: Segment,
    rx: &mut [RxBuf<'_>],
) {
    let Some(pos) = segment.rx() else {
        return;
    };
    if let RxBuf::Data(buf) = &mut rx[pos.chunk] {
        rtio.read_rx(cqe, &mut buf[pos.offset..][..segment.len()]);
    }
}
