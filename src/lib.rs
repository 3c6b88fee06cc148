// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
//! # Eddy - a single-threaded callback reactor.
//!
//! Eddy multiplexes three kinds of asynchronous work on one thread of
//! execution: wall-clock timers (one-shot and periodic), level-triggered
//! I/O readiness on byte streams, and immediate callbacks deferred to the
//! next loop iteration. Callers register interest, receive an opaque
//! [`WatcherId`], and later either get their callback invoked or use the id
//! to cancel, disable or re-enable the watcher - including from inside
//! another callback, or the watcher's own.
//!
//! The reactor is cooperative: callbacks run inline on the owning thread and
//! must return before the loop can make progress. The only points at which
//! the loop blocks are the readiness poll and the timer sleep; both are
//! bounded by the next pending deadline, so timers stay accurate without
//! busy-waiting. A reactor that runs out of work - no armed timers, no
//! stream interest - stops on its own, because nothing could ever wake it.
//!
//! ## Usage
//!
//! ```
//! use eddy::Reactor;
//! use std::time::Duration;
//!
//! let reactor = Reactor::new();
//!
//! reactor.immediately(|_reactor, _id| {
//!     println!("runs first, on the next iteration");
//!     Ok(())
//! });
//! reactor.once(
//!     |_reactor, _id| {
//!         println!("runs 20ms later");
//!         Ok(())
//!     },
//!     Duration::from_millis(20),
//! );
//!
//! // Returns once both callbacks have fired and no watchers remain.
//! reactor.run().unwrap();
//! ```
//!
//! Stream readiness uses the same registry. Watch any `AsRawFd` type with
//! [`Reactor::on_readable`] / [`Reactor::on_writable`], or both directions
//! at once with [`Reactor::watch_stream`] and the [`Watch`] flags.
//!
//! ## Collaborators
//!
//! The reactor talks to the operating system through two small seams,
//! [`Clock`] and [`Multiplexer`], bound by default to the system clock and
//! `select(2)`. [`Reactor::with_parts`] accepts substitutes, which is how
//! the crate's own tests drive the loop deterministically.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

mod error;
mod reactor;
mod sys;

pub use crate::error::{EddyError, Result};
pub use crate::reactor::{Reactor, WatcherId};
pub use crate::sys::{Clock, Multiplexer, SelectMultiplexer, WallClock};

bitflags::bitflags! {
    /// Interest flags for [`Reactor::watch_stream`].
    ///
    /// At least one of [`READ`](Watch::READ) and [`WRITE`](Watch::WRITE)
    /// must be set; [`NOW`](Watch::NOW) controls whether the watchers are
    /// enabled at registration or start out parked.
    pub struct Watch: u8 {
        /// Watch the stream for read readiness.
        const READ = 0b0001;
        /// Watch the stream for write readiness.
        const WRITE = 0b0010;
        /// Enable the watchers immediately instead of parking them.
        const NOW = 0b0100;
    }
}
