//! Input sources delivering raw datagrams.
//!
//! A source yields one delimited datagram per call and signals the end of
//! the stream (or a shot that aged out of a live buffer) as a result kind,
//! never by unwinding.

pub mod file;
pub mod generator;

use thiserror::Error;

/// Errors of the input layer.
#[derive(Error, Debug)]
pub enum InputError {
    /// Reading the source failed.
    #[error("input error: {0}")]
    Io(#[from] std::io::Error),

    /// A datagram does not fit the event buffer.
    #[error("datagram of {size} bytes exceeds the buffer of {capacity} bytes")]
    DatagramTooLarge {
        /// Size announced by the datagram header.
        size: usize,
        /// Capacity of the event buffer.
        capacity: usize,
    },
}

/// Outcome of one pull from a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    /// A datagram of the given length was written into the buffer.
    Datagram(
        /// Number of valid bytes in the buffer.
        usize,
    ),
    /// The requested shot aged out of the live buffer; skip to the next.
    Outdated,
    /// The source is exhausted.
    EndOfStream,
}

/// A source of raw datagrams.
pub trait InputSource: Send {
    /// Writes the next datagram into `buffer`.
    fn next(&mut self, buffer: &mut [u8]) -> Result<InputState, InputError>;

    /// Origin tag for events from this source, if any.
    fn filename(&self) -> Option<&str> {
        None
    }
}
