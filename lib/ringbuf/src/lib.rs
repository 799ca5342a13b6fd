// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trace ring buffers for code that runs in more than one context at once.
//!
//! A ring buffer records the last `N` events of some piece of code, along with
//! the source line that recorded each one. Repeated identical events (same
//! line, same payload) collapse into a single entry with a count, so a tight
//! polling loop doesn't wipe out the interesting history.
//!
//! Unlike a ring that is owned by a single task, these rings are written from
//! producer threads, worker contexts and completion callbacks concurrently.
//! Each ring is guarded by a spin lock. Recording never waits for that lock:
//! if the ring is held by someone else (for example, because an interrupt
//! preempted a writer on the same core), the entry is dropped and counted in
//! [`Ringbuf::dropped`].
//!
//! ## Creating a ring buffer
//!
//! ```ignore
//! #[derive(Copy, Clone, PartialEq)]
//! enum Trace {
//!     None,
//!     Start(u16),
//!     Done(u16),
//! }
//!
//! ringbuf!(Trace, 32, Trace::None);
//!
//! fn start(id: u16) {
//!     ringbuf_entry!(Trace::Start(id));
//! }
//! ```
//!
//! A name can be given to have more than one ring per module:
//!
//! ```ignore
//! ringbuf!(QUEUE_RINGBUF, Trace, 32, Trace::None);
//! ringbuf_entry!(QUEUE_RINGBUF, Trace::Done(3));
//! ```
//!
//! Enabling the `disabled` feature keeps the declarations type-checked but
//! compiles all recording out.

#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

/// Declares a ring buffer in the current module.
///
/// `ringbuf!(NAME, Type, N, expr)` makes a static ring buffer named `NAME`
/// holding `N` entries of `Type`, all initialized to `expr`. If the name is
/// omitted it defaults to `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        static $name: $crate::Ringbuf<$t, $n> = $crate::Ringbuf::new($init);
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
    ($t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
}

/// Records `payload` in a ring buffer declared with [`ringbuf!`].
///
/// `ringbuf_entry!(NAME, expr)` records into `NAME`; without a name the
/// module's `__RINGBUF` is used.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate both in one tuple so neither can see the other's binding.
        let (p, buf) = ($payload, &$buf);
        $crate::Ringbuf::entry(buf, line!() as u16, p);
    }};
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let _ = &$payload;
    }};
    ($payload:expr) => {{
        let _ = &$payload;
    }};
}

/// One slot of a [`Ringbuf`].
#[derive(Debug, Copy, Clone)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

#[derive(Debug)]
struct Inner<T: Copy + PartialEq, const N: usize> {
    last: Option<usize>,
    buffer: [RingbufEntry<T>; N],
}

/// A ring buffer of `N` entries of `T`. Normally declared through
/// [`ringbuf!`].
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    inner: Mutex<Inner<T, N>>,
    dropped: AtomicU32,
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    pub const fn new(init: T) -> Self {
        Self {
            inner: Mutex::new(Inner {
                last: None,
                buffer: [RingbufEntry {
                    line: 0,
                    generation: 0,
                    count: 0,
                    payload: init,
                }; N],
            }),
            dropped: AtomicU32::new(0),
        }
    }

    /// Records `payload` as coming from `line`.
    pub fn entry(&self, line: u16, payload: T) {
        let Some(mut inner) = self.inner.try_lock() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        // `None` is treated as an out-of-range index so the first entry lands
        // in slot 0 and never bumps the count of a stale slot.
        let last = inner.last.unwrap_or(usize::MAX);

        if let Some(ent) = inner.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                if let Some(count) = ent.count.checked_add(1) {
                    ent.count = count;
                    return;
                }
            }
        }

        let ndx = match last.wrapping_add(1) {
            n if n >= N => 0,
            n => n,
        };

        let ent = &mut inner.buffer[ndx];
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };
        inner.last = Some(ndx);
    }

    /// Number of entries dropped because the ring was busy.
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Most recently recorded entry, if any.
    pub fn last(&self) -> Option<RingbufEntry<T>> {
        let inner = self.inner.lock();
        inner.last.map(|i| inner.buffer[i])
    }

    /// Calls `f` on every recorded entry, oldest first.
    pub fn for_each(&self, mut f: impl FnMut(&RingbufEntry<T>)) {
        let inner = self.inner.lock();
        let Some(last) = inner.last else {
            return;
        };
        let (newer, older) = inner.buffer.split_at(last + 1);
        older
            .iter()
            .chain(newer.iter())
            .filter(|e| e.count != 0)
            .for_each(&mut f);
    }
}
