// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
//! OS-facing collaborators.
//!
//! The reactor never talks to the operating system directly; it goes through
//! two seams defined here. [`Clock`] supplies wall-clock readings and the
//! sleep primitive, [`Multiplexer`] supplies level-triggered readiness
//! polling. The default implementations ([`WallClock`],
//! [`SelectMultiplexer`]) bind those seams to `SystemTime` and `select(2)`;
//! tests substitute deterministic fakes.

use std::{
    io,
    os::unix::io::RawFd,
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use log::debug;
use nix::{
    errno::Errno,
    sys::{
        select::{select, FdSet},
        time::{TimeVal, TimeValLike},
    },
};

/// A wall-clock time source with at least microsecond resolution.
///
/// `now` is expressed in seconds since the UNIX epoch so that absolute
/// deadlines (see [`Reactor::at_timestamp`]) can be compared against it
/// directly.
///
/// [`Reactor::at_timestamp`]: crate::Reactor::at_timestamp
pub trait Clock {
    /// Seconds since the UNIX epoch.
    fn now(&self) -> f64;

    /// Blocks the calling thread for approximately `dur`.
    fn sleep(&self, dur: Duration);
}

/// The process clock: `SystemTime` for readings, `thread::sleep` to block.
#[derive(Debug, Default, Clone, Copy)]
pub struct WallClock;

impl Clock for WallClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or_default()
    }

    fn sleep(&self, dur: Duration) {
        thread::sleep(dur);
    }
}

/// A level-triggered readiness multiplexer.
///
/// Given the current read and write interest sets and a timeout in seconds,
/// an implementation blocks until at least one stream is ready or the
/// timeout elapses, and returns the ready subsets (both empty on timeout).
pub trait Multiplexer {
    /// Waits up to `timeout` seconds for readiness on the given descriptors.
    fn select(
        &mut self,
        read: &[RawFd],
        write: &[RawFd],
        timeout: f64,
    ) -> io::Result<(Vec<RawFd>, Vec<RawFd>)>;
}

/// [`Multiplexer`] over `select(2)`, with microsecond timeout resolution.
#[derive(Debug, Default)]
pub struct SelectMultiplexer;

impl Multiplexer for SelectMultiplexer {
    fn select(
        &mut self,
        read: &[RawFd],
        write: &[RawFd],
        timeout: f64,
    ) -> io::Result<(Vec<RawFd>, Vec<RawFd>)> {
        let mut readfds = FdSet::new();
        for &fd in read {
            readfds.insert(fd);
        }
        let mut writefds = FdSet::new();
        for &fd in write {
            writefds.insert(fd);
        }
        let mut tv = TimeVal::microseconds((timeout * 1e6).round() as i64);

        match select(
            None,
            Some(&mut readfds),
            Some(&mut writefds),
            None,
            Some(&mut tv),
        ) {
            Ok(0) => Ok((Vec::new(), Vec::new())),
            Ok(_) => Ok((
                read.iter().copied().filter(|&fd| readfds.contains(fd)).collect(),
                write
                    .iter()
                    .copied()
                    .filter(|&fd| writefds.contains(fd))
                    .collect(),
            )),
            // A signal interrupted the wait; report it as a timeout and let
            // the loop driver recompute its blocking budget.
            Err(Errno::EINTR) => {
                debug!("select interrupted by signal");
                Ok((Vec::new(), Vec::new()))
            }
            Err(errno) => Err(io::Error::from_raw_os_error(errno as i32)),
        }
    }
}
