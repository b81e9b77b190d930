//! The typed per-shot event.
//!
//! A [`CassEvent`] owns the raw datagram bytes of one shot plus the typed
//! device payloads the converters extracted from it. Devices are kept in a
//! slot per [`DeviceKind`]; exactly the kinds the converter registry
//! populated during decode are present.

pub mod acqiris;
pub mod acqiristdc;
pub mod machine;
pub mod pixeldetector;
pub mod serializer;

use std::collections::BTreeMap;
use std::io::{Read, Write};

use bincode::Options;
use thiserror::Error;

use crate::EventId;
use acqiris::AcqirisDevice;
use acqiristdc::AcqirisTdcDevice;
use machine::MachineDataDevice;
use pixeldetector::PixelDetectorDevice;
use serializer::{wire, Serializable};

/// Errors raised by event access and (de)serialization.
#[derive(Error, Debug)]
pub enum EventError {
    /// The requested device was not installed by the converters.
    #[error("device {0:?} is not present in the event")]
    MissingDevice(DeviceKind),

    /// A serialized device carries an unknown version tag.
    #[error("version mismatch in {device}: expected {expected}, found {found}")]
    VersionMismatch {
        /// Name of the device that failed to deserialize.
        device: &'static str,
        /// The version this build writes and reads.
        expected: u16,
        /// The version found in the stream.
        found: u16,
    },

    /// An unknown device tag was found in a serialized event.
    #[error("unknown device tag {0} in serialized event")]
    UnknownDeviceTag(u8),

    /// The underlying encoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// The closed set of devices an event can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceKind {
    /// Wave digitizer channels.
    Acqiris,
    /// Time-to-digital converter hits.
    AcqirisTdc,
    /// Commercial camera frames.
    Ccd,
    /// Beamline and EPICS machine values.
    MachineData,
    /// Pixel detector frames (pnCCD, CsPad and friends).
    PixelDetectors,
}

impl DeviceKind {
    fn tag(self) -> u8 {
        match self {
            DeviceKind::Acqiris => 0,
            DeviceKind::AcqirisTdc => 1,
            DeviceKind::Ccd => 2,
            DeviceKind::MachineData => 3,
            DeviceKind::PixelDetectors => 4,
        }
    }

    fn from_tag(tag: u8) -> Result<DeviceKind, EventError> {
        Ok(match tag {
            0 => DeviceKind::Acqiris,
            1 => DeviceKind::AcqirisTdc,
            2 => DeviceKind::Ccd,
            3 => DeviceKind::MachineData,
            4 => DeviceKind::PixelDetectors,
            other => return Err(EventError::UnknownDeviceTag(other)),
        })
    }
}

/// A typed device payload.
#[derive(Debug, Clone)]
pub enum Device {
    /// Wave digitizer channels, grouped by instrument.
    Acqiris(AcqirisDevice),
    /// TDC hit times, grouped by instrument.
    AcqirisTdc(AcqirisTdcDevice),
    /// Commercial camera frames.
    Ccd(PixelDetectorDevice),
    /// Machine values.
    MachineData(MachineDataDevice),
    /// Pixel detector frames.
    PixelDetectors(PixelDetectorDevice),
}

impl Device {
    /// The slot this payload belongs into.
    #[must_use]
    pub fn kind(&self) -> DeviceKind {
        match self {
            Device::Acqiris(_) => DeviceKind::Acqiris,
            Device::AcqirisTdc(_) => DeviceKind::AcqirisTdc,
            Device::Ccd(_) => DeviceKind::Ccd,
            Device::MachineData(_) => DeviceKind::MachineData,
            Device::PixelDetectors(_) => DeviceKind::PixelDetectors,
        }
    }

    fn serialize<W: Write>(&self, sink: &mut W) -> Result<(), EventError> {
        match self {
            Device::Acqiris(dev) => dev.serialize(sink),
            Device::AcqirisTdc(dev) => dev.serialize(sink),
            Device::Ccd(dev) | Device::PixelDetectors(dev) => dev.serialize(sink),
            Device::MachineData(dev) => dev.serialize(sink),
        }
    }

    fn deserialize<R: Read>(kind: DeviceKind, source: &mut R) -> Result<Device, EventError> {
        Ok(match kind {
            DeviceKind::Acqiris => Device::Acqiris(AcqirisDevice::deserialize(source)?),
            DeviceKind::AcqirisTdc => Device::AcqirisTdc(AcqirisTdcDevice::deserialize(source)?),
            DeviceKind::Ccd => Device::Ccd(PixelDetectorDevice::deserialize(source)?),
            DeviceKind::MachineData => Device::MachineData(MachineDataDevice::deserialize(source)?),
            DeviceKind::PixelDetectors => {
                Device::PixelDetectors(PixelDetectorDevice::deserialize(source)?)
            }
        })
    }
}

/// One decoded shot.
#[derive(Debug)]
pub struct CassEvent {
    id: EventId,
    datagram: Vec<u8>,
    datagram_len: usize,
    devices: BTreeMap<DeviceKind, Device>,
    filename: Option<String>,
}

/// Version tag written in front of a serialized event.
const EVENT_VERSION: u16 = 2;

impl CassEvent {
    /// Creates an event with id 0, no devices, and a datagram buffer
    /// pre-sized to `capacity` so it is never reallocated later.
    #[must_use]
    pub fn allocate(capacity: usize) -> CassEvent {
        CassEvent {
            id: 0,
            datagram: vec![0; capacity],
            datagram_len: 0,
            devices: BTreeMap::new(),
            filename: None,
        }
    }

    /// The event id.
    #[must_use]
    pub fn id(&self) -> EventId {
        self.id
    }

    /// Sets the event id.
    pub fn set_id(&mut self, id: EventId) {
        self.id = id;
    }

    /// The origin tag, if this event came from a file.
    #[must_use]
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// Tags the event with its origin.
    pub fn set_filename(&mut self, filename: Option<String>) {
        self.filename = filename;
    }

    /// The full pre-sized datagram buffer, for the input to fill.
    pub fn datagram_mut(&mut self) -> &mut [u8] {
        &mut self.datagram
    }

    /// Records how many bytes of the buffer the current datagram occupies.
    pub fn set_datagram_len(&mut self, len: usize) {
        debug_assert!(len <= self.datagram.len());
        self.datagram_len = len;
    }

    /// The bytes of the current datagram.
    #[must_use]
    pub fn datagram(&self) -> &[u8] {
        &self.datagram[..self.datagram_len]
    }

    /// Clears the id, devices and datagram length, keeping the allocation.
    pub fn reset(&mut self) {
        self.id = 0;
        self.datagram_len = 0;
        self.devices.clear();
        self.filename = None;
    }

    /// Installs a device payload, replacing any previous payload of the
    /// same kind.
    pub fn put_device(&mut self, device: Device) {
        self.devices.insert(device.kind(), device);
    }

    /// The device payload of `kind`.
    pub fn device(&self, kind: DeviceKind) -> Result<&Device, EventError> {
        self.devices.get(&kind).ok_or(EventError::MissingDevice(kind))
    }

    /// Mutable access to the device payload of `kind`, installing a default
    /// payload when the slot is still empty.
    pub fn device_mut(&mut self, kind: DeviceKind) -> &mut Device {
        self.devices.entry(kind).or_insert_with(|| match kind {
            DeviceKind::Acqiris => Device::Acqiris(AcqirisDevice::default()),
            DeviceKind::AcqirisTdc => Device::AcqirisTdc(AcqirisTdcDevice::default()),
            DeviceKind::Ccd => Device::Ccd(PixelDetectorDevice::default()),
            DeviceKind::MachineData => Device::MachineData(MachineDataDevice::default()),
            DeviceKind::PixelDetectors => Device::PixelDetectors(PixelDetectorDevice::default()),
        })
    }

    /// The kinds currently present.
    #[must_use]
    pub fn device_kinds(&self) -> Vec<DeviceKind> {
        self.devices.keys().copied().collect()
    }

    /// Convenience accessor for the wave digitizer payload.
    pub fn acqiris(&self) -> Result<&AcqirisDevice, EventError> {
        match self.device(DeviceKind::Acqiris)? {
            Device::Acqiris(dev) => Ok(dev),
            _ => unreachable!("slot holds the payload of its kind"),
        }
    }

    /// Convenience accessor for the TDC payload.
    pub fn acqiris_tdc(&self) -> Result<&AcqirisTdcDevice, EventError> {
        match self.device(DeviceKind::AcqirisTdc)? {
            Device::AcqirisTdc(dev) => Ok(dev),
            _ => unreachable!("slot holds the payload of its kind"),
        }
    }

    /// Convenience accessor for the machine data payload.
    pub fn machine_data(&self) -> Result<&MachineDataDevice, EventError> {
        match self.device(DeviceKind::MachineData)? {
            Device::MachineData(dev) => Ok(dev),
            _ => unreachable!("slot holds the payload of its kind"),
        }
    }

    /// Convenience accessor for a pixel detector style payload.
    pub fn pixel_detectors(&self, kind: DeviceKind) -> Result<&PixelDetectorDevice, EventError> {
        match self.device(kind)? {
            Device::Ccd(dev) | Device::PixelDetectors(dev) => Ok(dev),
            _ => Err(EventError::MissingDevice(kind)),
        }
    }

    /// Writes the event (version, device count, tagged devices) to `sink`.
    ///
    /// The datagram buffer is scratch space for decoding and is not part of
    /// the serialized form.
    pub fn serialize<W: Write>(&self, sink: &mut W) -> Result<(), EventError> {
        wire().serialize_into(&mut *sink, &EVENT_VERSION)?;
        wire().serialize_into(&mut *sink, &self.id)?;
        wire().serialize_into(&mut *sink, &(self.devices.len() as u8))?;
        for (kind, device) in &self.devices {
            wire().serialize_into(&mut *sink, &kind.tag())?;
            device.serialize(sink)?;
        }
        Ok(())
    }

    /// Reads an event written by [`CassEvent::serialize`].
    pub fn deserialize<R: Read>(&mut self, source: &mut R) -> Result<(), EventError> {
        let version: u16 = wire().deserialize_from(&mut *source)?;
        if version != EVENT_VERSION {
            return Err(EventError::VersionMismatch {
                device: "CassEvent",
                expected: EVENT_VERSION,
                found: version,
            });
        }
        self.reset();
        self.id = wire().deserialize_from(&mut *source)?;
        let count: u8 = wire().deserialize_from(&mut *source)?;
        for _ in 0..count {
            let tag: u8 = wire().deserialize_from(&mut *source)?;
            let kind = DeviceKind::from_tag(tag)?;
            let device = Device::deserialize(kind, source)?;
            self.devices.insert(kind, device);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::acqiris::{AcqirisDevice, Channel, Instrument};
    use crate::event::machine::MachineDataDevice;

    #[test]
    fn missing_device_is_an_error() {
        let evt = CassEvent::allocate(16);
        assert!(matches!(
            evt.device(DeviceKind::Acqiris),
            Err(EventError::MissingDevice(DeviceKind::Acqiris))
        ));
    }

    #[test]
    fn serialize_roundtrip_preserves_devices() {
        let mut evt = CassEvent::allocate(16);
        evt.set_id(crate::event_id(1000, 42));

        let mut acq = AcqirisDevice::default();
        acq.instruments.insert(
            7,
            Instrument {
                channels: vec![Channel {
                    channel_nbr: 0,
                    horpos: 0.25,
                    offset: 0.1,
                    gain: 0.001,
                    sample_interval: 1e-9,
                    waveform: vec![-3, 0, 3, 1200],
                }],
            },
        );
        evt.put_device(Device::Acqiris(acq));

        let mut md = MachineDataDevice::default();
        md.beamline.insert("EbeamL3Energy".to_string(), 13600.0);
        md.epics.insert("CAMP:VOLT".to_string(), 3.14);
        evt.put_device(Device::MachineData(md));

        let mut buffer = Vec::new();
        evt.serialize(&mut buffer).unwrap();

        let mut copy = CassEvent::allocate(16);
        copy.deserialize(&mut buffer.as_slice()).unwrap();

        assert_eq!(copy.id(), evt.id());
        let acq = copy.acqiris().unwrap();
        assert_eq!(acq.instruments[&7].channels[0].waveform, vec![-3, 0, 3, 1200]);
        let md = copy.machine_data().unwrap();
        assert!((md.beamline["EbeamL3Energy"] - 13600.0).abs() < f64::EPSILON);
    }

    #[test]
    fn version_mismatch_is_detected() {
        let mut buffer = Vec::new();
        wire().serialize_into(&mut buffer, &999u16).unwrap();
        let mut evt = CassEvent::allocate(16);
        assert!(matches!(
            evt.deserialize(&mut buffer.as_slice()),
            Err(EventError::VersionMismatch { found: 999, .. })
        ));
    }
}
