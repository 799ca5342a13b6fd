// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compile-time capacities.

use static_assertions::const_assert;

/// Most operations the fallback executor will flatten into one bus transfer.
/// Longer chains are refused rather than split.
pub const FALLBACK_MSGS: usize = 8;

/// Work items available to fallback executors sharing one [`WorkPool`].
///
/// [`WorkPool`]: crate::fallback::WorkPool
pub const WORKQ_POOL_ITEMS: usize = 4;

/// Transactions that can wait behind the current one on a single bus.
pub const PENDING_DEPTH: usize = 32;

// The pending queue is a `heapless::mpmc` queue, which wants a power of two
// that fits its 8-bit indices.
const_assert!(PENDING_DEPTH.is_power_of_two());
const_assert!(PENDING_DEPTH > 1 && PENDING_DEPTH < 255);
const_assert!(FALLBACK_MSGS > 0);
