//! Binary encoding shared by the device payloads.
//!
//! Devices serialize as a 16 bit version tag followed by their bincode-encoded
//! body, using fixed-width little-endian integers so the on-disk form matches
//! the wire convention of the rest of the system.

use std::io::{Read, Write};

use bincode::config::{
    FixintEncoding, LittleEndian, WithOtherEndian, WithOtherIntEncoding,
};
use bincode::{DefaultOptions, Options};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::EventError;

/// The bincode options every serialized device uses.
pub type WireOptions =
    WithOtherEndian<WithOtherIntEncoding<DefaultOptions, FixintEncoding>, LittleEndian>;

/// Fixed-int little-endian bincode options.
#[must_use]
pub fn wire() -> WireOptions {
    DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

/// A device payload with a versioned binary form.
pub trait Serializable: Serialize + DeserializeOwned {
    /// The version tag this build writes and accepts.
    const VERSION: u16;

    /// Name used in version-mismatch errors.
    const NAME: &'static str;

    /// Writes the version tag and the payload body.
    fn serialize<W: Write>(&self, sink: &mut W) -> Result<(), EventError> {
        wire().serialize_into(&mut *sink, &Self::VERSION)?;
        wire().serialize_into(sink, self)?;
        Ok(())
    }

    /// Reads a payload written by [`Serializable::serialize`], failing on a
    /// version mismatch.
    fn deserialize<R: Read>(source: &mut R) -> Result<Self, EventError> {
        let version: u16 = wire().deserialize_from(&mut *source)?;
        if version != Self::VERSION {
            return Err(EventError::VersionMismatch {
                device: Self::NAME,
                expected: Self::VERSION,
                found: version,
            });
        }
        Ok(wire().deserialize_from(source)?)
    }
}
