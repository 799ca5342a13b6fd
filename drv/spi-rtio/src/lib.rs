// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Asynchronous SPI transactions over [`rtio`] submission queues.
//!
//! Clients describe a transfer as lists of transmit and receive chunks. The
//! [`splice`] module breaks that into a chain of primitive operations which
//! is submitted to a bus through an [`SpiIodev`]. Each bus runs one chain at
//! a time, in submission order, under the control of the [`SpiRtio`] queue
//! embedded in its driver:
//!
//! ```text
//!   producer ──submit──▶ SpiIodev ──▶ SpiRtio ──start──▶ SpiDriver
//!       ▲                                ▲                   │
//!       └────── CQEs ◀── complete ───────┴────── finish ─────┘
//! ```
//!
//! Drivers for controllers that can run a transaction on their own implement
//! [`SpiDriver`] directly. Drivers that only offer a blocking `transceive`
//! get the same interface by wrapping themselves in a [`FallbackExecutor`].
//! Callers that would rather wait than poll for completions use
//! [`transceive`].

#![cfg_attr(not(test), no_std)]

pub mod blocking;
pub mod config;
pub mod dispatch;
pub mod fallback;
pub mod queue;
pub mod splice;

pub use blocking::transceive;
pub use dispatch::{SpiDriver, SpiIodev};
pub use fallback::{FallbackExecutor, Work, WorkPool};
pub use queue::{SpiRtio, SpiTxn, Stats};
