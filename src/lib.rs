#![warn(missing_docs)]

//! # cass
//!
//! An event-driven acquisition and analysis pipeline for free-electron-laser
//! experiments.
//!
//! Shot-by-shot detector data arrives in a self-describing binary container
//! ("XTC"). Each datagram is decoded into a typed [`CassEvent`], offered to
//! live shared-memory monitor clients and pushed through a worker pool that
//! runs a user-configured graph of analysis processors. Processor results
//! (scalars, histograms, tables) are cached per event id and exposed over a
//! control socket or persisted to disk.
//!
//! The main building blocks:
//! * [`event`] — the typed event and its device payloads
//! * [`xtc`] — the wire format and the recursive container walker
//! * [`conversion`] — converters that populate events from XTC payloads
//! * [`shm`] — the live-monitor shared-memory server
//! * [`ring`] — the bounded event ring buffer feeding the workers
//! * [`processing`] — the processor graph and its primitives
//! * [`pipeline`] — thread wiring from input to shutdown
//!
//! [`CassEvent`]: event::CassEvent

pub mod control;
pub mod conversion;
pub mod event;
pub mod input;
pub mod output;
pub mod pipeline;
pub mod processing;
pub mod ring;
pub mod settings;
pub mod shm;
pub mod xtc;

/// Unique token of one shot. The upper 32 bit hold the wall-clock seconds
/// assigned at the origin, the lower 32 bit the fiducial counter.
pub type EventId = u64;

/// Number of analysis workers pulling events off the ring buffer.
pub const NBR_OF_WORKERS: usize = 4;

/// Capacity of the event ring buffer.
pub const RING_BUFFER_SIZE: usize = 8;

/// Maximum size of one datagram. Event buffers are allocated once with this
/// size and never reallocated, so converters can keep views into them.
pub const MAX_DATAGRAM_SIZE: usize = 0x0100_0000;

/// The fiducial counter rolls over within 21 bit.
pub const FIDUCIAL_MODULO: u32 = 1 << 21;

/// Compose an event id from wall-clock seconds and the fiducial count.
#[must_use]
pub fn event_id(seconds: u32, fiducials: u32) -> EventId {
    (u64::from(seconds) << 32) | u64::from(fiducials & (FIDUCIAL_MODULO - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_packs_seconds_and_fiducials() {
        let id = event_id(0x5eed_1234, 0x1f_ffff);
        assert_eq!(id >> 32, 0x5eed_1234);
        assert_eq!(id & 0xffff_ffff, 0x1f_ffff);
        // the fiducial window is 21 bit wide
        assert_eq!(event_id(0, FIDUCIAL_MODULO) & 0xffff_ffff, 0);
    }
}
