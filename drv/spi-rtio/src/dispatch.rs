// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The contract between the transaction queue and a bus driver.

use crate::queue::{SpiRtio, SpiTxn};
use drv_spi_api::{SpiConfig, SpiError};
use rtio::{Iodev, Txn};

/// A bus driver that executes transactions asynchronously.
///
/// The driver owns a [`SpiRtio`] and is told to [`start`](Self::start) a
/// transaction each time one becomes current. It must eventually call
/// [`finish`](Self::finish) exactly once for every transaction it starts,
/// from whatever context notices the transfer is over. `finish` may start the
/// next transaction from inside itself, so drivers must not hold locks across
/// it.
pub trait SpiDriver<'r, const N: usize, const B: usize> {
    fn bus(&self) -> &SpiRtio<'r, N, B>;

    /// Admission check, run before `txn` is queued. An error fails the whole
    /// chain on the spot; the bus never sees it.
    fn validate(&self, _txn: &SpiTxn<'r, N, B>) -> Result<(), SpiError> {
        Ok(())
    }

    /// Begins executing `txn`, which has just become current.
    fn start(&self, txn: SpiTxn<'r, N, B>);

    /// Reports the end of the current transaction.
    fn finish(&self, status: Result<(), SpiError>) {
        if let Some(next) = self.bus().complete(status) {
            self.start(next);
        }
    }
}

/// One device on a bus: the driver to submit to and the settings every
/// transaction from this device runs with.
pub struct SpiIodev<'d, D: ?Sized> {
    driver: &'d D,
    config: SpiConfig,
}

impl<'d, D: ?Sized> SpiIodev<'d, D> {
    pub fn new(driver: &'d D, config: SpiConfig) -> Self {
        Self { driver, config }
    }

    pub fn config(&self) -> &SpiConfig {
        &self.config
    }
}

impl<'r, D, const N: usize, const B: usize> Iodev<'r, N, B>
    for SpiIodev<'_, D>
where
    D: SpiDriver<'r, N, B> + ?Sized,
{
    type Error = SpiError;

    fn submit(&self, txn: Txn<'r, N, B>) -> Result<(), SpiError> {
        let txn = SpiTxn::new(txn, self.config);
        self.driver.validate(&txn)?;

        if let Some(current) = self.driver.bus().submit(txn)? {
            self.driver.start(current);
        }
        Ok(())
    }
}
