// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common vocabulary for SPI clients, the transaction queue and bus drivers.
//!
//! A transfer is described by two ordered lists of chunks: what to clock out
//! ([`TxBuf`]) and where to put what is clocked in ([`RxBuf`]). The lists
//! don't need to line up; the bus runs for the longer of the two and pads the
//! shorter one with dummy bytes on the way out or discards on the way in.

#![cfg_attr(not(test), no_std)]

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

#[derive(Copy, Clone, Debug, FromPrimitive, Eq, PartialEq)]
#[repr(u32)]
pub enum SpiError {
    /// Malformed response, or a status code we don't know
    BadResponse = 1,

    /// Bad argument, such as an unsupported bus configuration
    BadArg = 2,

    /// Transfer size is 0
    BadTransferSize = 3,

    /// Ran out of operation slots, queue space, work items, or exceeded the
    /// number of operations a transfer can be flattened into. Also returned
    /// for a blocking transfer on a context whose completion queue holds
    /// someone else's completions
    ResourceExhausted = 4,

    /// The transaction contains an operation this bus can't execute
    InvalidOperation = 5,

    /// The bus reported a failure while moving the data
    Transport = 6,
}

impl From<SpiError> for u32 {
    fn from(rc: SpiError) -> Self {
        rc as u32
    }
}

impl SpiError {
    /// Decodes a nonzero status code carried by a completion.
    pub fn from_code(code: u32) -> Self {
        Self::from_u32(code).unwrap_or(SpiError::BadResponse)
    }
}

bitflags::bitflags! {
    /// Clock and framing options for a device.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct SpiMode: u16 {
        /// Clock idles high.
        const CPOL = 1 << 0;
        /// Data is sampled on the second clock edge.
        const CPHA = 1 << 1;
        /// Least significant bit goes out first.
        const LSB_FIRST = 1 << 2;
    }
}

/// Per-device bus settings. Every transaction carries the configuration of
/// the device that submitted it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SpiConfig {
    /// SCK frequency in Hz.
    pub frequency: u32,
    pub mode: SpiMode,
    /// Bits per frame.
    pub word_size: u8,
    pub chip_select: u8,
}

impl SpiConfig {
    pub const fn new(frequency: u32) -> Self {
        Self {
            frequency,
            mode: SpiMode::empty(),
            word_size: 8,
            chip_select: 0,
        }
    }

    pub const fn with_mode(self, mode: SpiMode) -> Self {
        Self { mode, ..self }
    }

    pub const fn with_chip_select(self, chip_select: u8) -> Self {
        Self {
            chip_select,
            ..self
        }
    }

    /// The conventional SPI mode number, 0 through 3.
    pub fn mode_number(&self) -> u8 {
        u8::from(self.mode.contains(SpiMode::CPOL)) << 1
            | u8::from(self.mode.contains(SpiMode::CPHA))
    }

    /// Checks that the configuration is one the queue can carry.
    ///
    /// Operations are staged a byte at a time, so only 8-bit frames are
    /// accepted.
    pub fn validate(&self) -> Result<(), SpiError> {
        if self.frequency == 0 || self.word_size != 8 {
            return Err(SpiError::BadArg);
        }
        Ok(())
    }
}

/// One chunk of outgoing data.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TxBuf<'a> {
    Data(&'a [u8]),
    /// Clock out this many filler bytes.
    Dummy(usize),
}

impl TxBuf<'_> {
    pub fn len(&self) -> usize {
        match self {
            TxBuf::Data(d) => d.len(),
            TxBuf::Dummy(n) => *n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<'a> From<&'a [u8]> for TxBuf<'a> {
    fn from(d: &'a [u8]) -> Self {
        TxBuf::Data(d)
    }
}

/// One chunk of incoming data.
#[derive(Debug, PartialEq, Eq)]
pub enum RxBuf<'a> {
    Data(&'a mut [u8]),
    /// Clock in this many bytes and throw them away.
    Discard(usize),
}

impl RxBuf<'_> {
    pub fn len(&self) -> usize {
        match self {
            RxBuf::Data(d) => d.len(),
            RxBuf::Discard(n) => *n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<'a> From<&'a mut [u8]> for RxBuf<'a> {
    fn from(d: &'a mut [u8]) -> Self {
        RxBuf::Data(d)
    }
}

/// The blocking transfer primitive of a bus driver.
///
/// `transceive` performs the whole transfer with chip select held for its
/// duration, walking `tx` and `rx` in parallel, and returns only once every
/// byte has moved or the transfer has failed.
pub trait SpiTransport {
    fn transceive(
        &self,
        config: &SpiConfig,
        tx: &[TxBuf<'_>],
        rx: &mut [RxBuf<'_>],
    ) -> Result<(), SpiError>;
}

impl<T: SpiTransport + ?Sized> SpiTransport for &T {
    fn transceive(
        &self,
        config: &SpiConfig,
        tx: &[TxBuf<'_>],
        rx: &mut [RxBuf<'_>],
    ) -> Result<(), SpiError> {
        (**self).transceive(config, tx, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(u32::from(SpiError::Transport), 6);
        assert_eq!(SpiError::from_code(4), SpiError::ResourceExhausted);
        assert_eq!(SpiError::from_code(0xdead), SpiError::BadResponse);
    }

    #[test]
    fn config_validation() {
        let ok = SpiConfig::new(1_000_000);
        assert_eq!(ok.validate(), Ok(()));
        assert_eq!(SpiConfig::new(0).validate(), Err(SpiError::BadArg));
        let wide = SpiConfig {
            word_size: 16,
            ..ok
        };
        assert_eq!(wide.validate(), Err(SpiError::BadArg));
    }

    #[test]
    fn mode_numbers() {
        let c = SpiConfig::new(1);
        assert_eq!(c.mode_number(), 0);
        assert_eq!(c.with_mode(SpiMode::CPHA).mode_number(), 1);
        assert_eq!(c.with_mode(SpiMode::CPOL).mode_number(), 2);
        assert_eq!(
            c.with_mode(SpiMode::CPOL | SpiMode::CPHA | SpiMode::LSB_FIRST)
                .mode_number(),
            3
        );
        assert_eq!(SpiMode::all().bits(), 0b111);
        assert_eq!(SpiMode::from_bits(1 << 3), None);
    }

    #[test]
    fn chunk_lengths() {
        let data = [1, 2, 3];
        let mut sink = [0; 5];
        assert_eq!(TxBuf::from(&data[..]).len(), 3);
        assert!(TxBuf::Dummy(0).is_empty());
        assert_eq!(RxBuf::from(&mut sink[..]).len(), 5);
        assert_eq!(RxBuf::Discard(2).len(), 2);
    }
}
