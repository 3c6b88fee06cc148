// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
use crate::Watch;
use std::{error::Error, io};
use thiserror::Error;

/// Result type alias that all eddy public API functions can use.
pub type Result<T> = std::result::Result<T, EddyError>;

/// Composite error type to encompass all error types eddy produces.
#[derive(Error, Debug)]
pub enum EddyError {
    /// A target passed to [`at`] or [`at_timestamp`] that is not strictly in
    /// the future relative to the whole-second clock reading.
    ///
    /// [`at`]: crate::Reactor::at
    /// [`at_timestamp`]: crate::Reactor::at_timestamp
    #[error("target time {target} is not in the future (now: {now})")]
    InvalidTime {
        /// The resolved absolute target, in seconds since the epoch
        target: f64,
        /// The clock reading at validation time
        now: f64,
    },

    /// Watch flags that select neither read nor write interest, passed to
    /// [`watch_stream`].
    ///
    /// [`watch_stream`]: crate::Reactor::watch_stream
    #[error("watch flags {flags:?} select neither read nor write")]
    NoInterest {
        /// The offending flags
        flags: Watch,
    },

    /// IO error from the readiness multiplexer
    #[error("IO error occurred: {0}")]
    Io(#[from] io::Error),

    /// A failure raised by a user callback. The reactor does not catch, log
    /// or retry these; they propagate out of `tick` and `run` unchanged.
    #[error("callback error: {0}")]
    Callback(Box<dyn Error + 'static>),
}

impl EddyError {
    /// Wraps an arbitrary error raised inside a user callback so it can be
    /// returned through the reactor with `?`.
    pub fn callback(err: impl Error + 'static) -> EddyError {
        EddyError::Callback(Box::new(err))
    }
}

impl From<Box<dyn Error + 'static>> for EddyError {
    fn from(err: Box<dyn Error + 'static>) -> EddyError {
        EddyError::Callback(err)
    }
}
