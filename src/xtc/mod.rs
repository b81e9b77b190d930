//! The XTC wire format.
//!
//! A datagram is a fixed-size header followed by one root container node.
//! Each node is a header (type id, damage mask, source), a payload size and
//! the payload; container nodes nest further nodes. All multi-byte fields are
//! little-endian.

pub mod walker;

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

/// Errors raised while parsing XTC structures.
#[derive(Error, Debug)]
pub enum XtcError {
    /// The buffer ended inside a header or payload.
    #[error("truncated datagram: need {need} bytes at offset {offset}, have {have}")]
    Truncated {
        /// Byte offset of the element that did not fit.
        offset: usize,
        /// Bytes required.
        need: usize,
        /// Bytes available.
        have: usize,
    },

    /// A node's payload size points beyond its parent.
    #[error("node at offset {0} extends beyond its container")]
    Overrun(usize),

    /// A compressed payload could not be inflated.
    #[error("cannot inflate compressed payload: {0}")]
    Inflate(#[from] std::io::Error),
}

/// The closed set of payload types.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum TypeKind {
    Any = 0,
    Xtc = 1,
    Frame = 2,
    AcqWaveform = 3,
    AcqConfig = 4,
    TwoDGaussian = 5,
    Opal1kConfig = 6,
    FrameFexConfig = 7,
    EvrConfig = 8,
    TM6740Config = 9,
    ControlConfig = 10,
    PnccdFrame = 11,
    PnccdConfig = 12,
    Epics = 13,
    FeeGasDetEnergy = 14,
    EBeam = 15,
    PhaseCavity = 16,
    PrincetonFrame = 17,
    PrincetonConfig = 18,
    EvrData = 19,
    FrameFccdConfig = 20,
    FccdConfig = 21,
    IpimbData = 22,
    IpimbConfig = 23,
    EncoderData = 24,
    EncoderConfig = 25,
    EvrIOConfig = 26,
    PrincetonInfo = 27,
    CspadElement = 28,
    CspadConfig = 29,
    IpmFexConfig = 30,
    IpmFex = 31,
    DiodeFexConfig = 32,
    DiodeFex = 33,
    PimImageConfig = 34,
    SharedIpimb = 35,
    AcqTdcConfig = 36,
    AcqTdcData = 37,
    Index = 38,
    XampsConfig = 39,
    XampsElement = 40,
}

/// Number of known payload types.
pub const NUMBER_OF_TYPES: u16 = 41;

impl TypeKind {
    /// Maps a wire value to a type kind; `None` for out-of-range values.
    #[must_use]
    pub fn from_wire(value: u16) -> Option<TypeKind> {
        if value < NUMBER_OF_TYPES {
            // values are dense from 0, the enum mirrors the wire numbering
            Some(unsafe { std::mem::transmute::<u16, TypeKind>(value) })
        } else {
            None
        }
    }
}

/// The packed type-id word: type and version plus the compressed marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeId(pub u32);

impl TypeId {
    /// Builds an uncompressed type id.
    #[must_use]
    pub fn new(kind: TypeKind, version: u16) -> TypeId {
        TypeId((u32::from(version) << 16) | kind as u32)
    }

    /// Builds a compressed type id.
    #[must_use]
    pub fn new_compressed(kind: TypeKind, version: u16) -> TypeId {
        TypeId(TypeId::new(kind, version).0 | 0x8000_0000)
    }

    /// The raw wire value of the type field.
    #[must_use]
    pub fn kind_value(self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    /// The type kind; `None` for values outside the closed set.
    #[must_use]
    pub fn kind(self) -> Option<TypeKind> {
        TypeKind::from_wire(self.kind_value())
    }

    /// The payload version (with the compressed marker masked off).
    #[must_use]
    pub fn version(self) -> u16 {
        ((self.0 >> 16) & 0x7fff) as u16
    }

    /// True when the payload is compressed.
    #[must_use]
    pub fn compressed(self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    /// The version of the compression container itself.
    #[must_use]
    pub fn compressed_version(self) -> u16 {
        self.version()
    }
}

/// Damage bits a node can carry.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DamageBit {
    DroppedContribution = 1,
    OutOfOrder = 12,
    OutOfSynch = 13,
    UserDefined = 14,
    IncompleteContribution = 15,
}

/// The damage mask of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Damage(pub u32);

impl Damage {
    /// True when no damage bit is set.
    #[must_use]
    pub fn is_clean(self) -> bool {
        self.0 == 0
    }

    /// True when `bit` is set.
    #[must_use]
    pub fn has(self, bit: DamageBit) -> bool {
        self.0 & (1 << bit as u32) != 0
    }

    /// True when only the user-defined bit is set.
    #[must_use]
    pub fn user_defined_only(self) -> bool {
        self.0 == 1 << DamageBit::UserDefined as u32
    }
}

/// Hierarchy level of a node's source.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Level {
    Control = 0,
    Segment = 1,
    Source = 2,
    Event = 3,
    Recorder = 4,
    Observer = 5,
    Reporter = 6,
}

impl Level {
    /// Maps a wire value to a level, defaulting unknown values to `Event`.
    #[must_use]
    pub fn from_wire(value: u32) -> Level {
        match value {
            0 => Level::Control,
            1 => Level::Segment,
            2 => Level::Source,
            4 => Level::Recorder,
            5 => Level::Observer,
            6 => Level::Reporter,
            3 => Level::Event,
            _ => Level::Event,
        }
    }
}

/// Source of a node: hierarchy level plus packed physical id.
///
/// The physical id packs detector enum, detector instance, device enum and
/// device instance into one byte each, high to low.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Src {
    /// Hierarchy level.
    pub level: Level,
    /// Packed physical id.
    pub phy: u32,
}

impl Src {
    /// Builds a source-level id from detector/device enums and instances.
    #[must_use]
    pub fn detector(det: u8, det_id: u8, dev: u8, dev_id: u8) -> Src {
        Src {
            level: Level::Source,
            phy: (u32::from(det) << 24)
                | (u32::from(det_id) << 16)
                | (u32::from(dev) << 8)
                | u32::from(dev_id),
        }
    }
}

/// Size in bytes of a node header on the wire.
pub const XTC_HEADER_SIZE: usize = 20;

/// Size in bytes of the datagram header preceding the root node.
pub const DATAGRAM_HEADER_SIZE: usize = 24;

/// Raw node header as laid out on the wire.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct RawXtcHeader {
    /// Packed type id.
    pub type_id: u32,
    /// Damage mask.
    pub damage: u32,
    /// Source level.
    pub src_level: u32,
    /// Source physical id.
    pub src_phy: u32,
    /// Payload size, excluding this header.
    pub payload_size: u32,
}

impl RawXtcHeader {
    /// Reads a header from the first [`XTC_HEADER_SIZE`] bytes of `buf`.
    #[must_use]
    pub fn parse(buf: &[u8]) -> RawXtcHeader {
        let raw: RawXtcHeader = bytemuck::pod_read_unaligned(&buf[..XTC_HEADER_SIZE]);
        RawXtcHeader {
            type_id: u32::from_le(raw.type_id),
            damage: u32::from_le(raw.damage),
            src_level: u32::from_le(raw.src_level),
            src_phy: u32::from_le(raw.src_phy),
            payload_size: u32::from_le(raw.payload_size),
        }
    }

    /// Serializes the header to its wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; XTC_HEADER_SIZE] {
        let le = RawXtcHeader {
            type_id: self.type_id.to_le(),
            damage: self.damage.to_le(),
            src_level: self.src_level.to_le(),
            src_phy: self.src_phy.to_le(),
            payload_size: self.payload_size.to_le(),
        };
        let mut out = [0u8; XTC_HEADER_SIZE];
        out.copy_from_slice(bytemuck::bytes_of(&le));
        out
    }
}

/// A parsed node: header fields plus a view of the payload bytes.
#[derive(Debug, Clone, Copy)]
pub struct XtcNode<'a> {
    /// Packed type id.
    pub type_id: TypeId,
    /// Damage mask.
    pub damage: Damage,
    /// Source of the node.
    pub src: Src,
    /// Payload bytes, excluding the header.
    pub payload: &'a [u8],
}

impl<'a> XtcNode<'a> {
    /// Parses the node starting at `offset` within `buf`.
    pub fn parse_at(buf: &'a [u8], offset: usize) -> Result<XtcNode<'a>, XtcError> {
        if buf.len() < offset + XTC_HEADER_SIZE {
            return Err(XtcError::Truncated {
                offset,
                need: XTC_HEADER_SIZE,
                have: buf.len().saturating_sub(offset),
            });
        }
        let raw = RawXtcHeader::parse(&buf[offset..]);
        let payload_begin = offset + XTC_HEADER_SIZE;
        let payload_end = payload_begin + raw.payload_size as usize;
        if payload_end > buf.len() {
            return Err(XtcError::Truncated {
                offset: payload_begin,
                need: raw.payload_size as usize,
                have: buf.len() - payload_begin,
            });
        }
        Ok(XtcNode {
            type_id: TypeId(raw.type_id),
            damage: Damage(raw.damage),
            src: Src {
                level: Level::from_wire(raw.src_level),
                phy: raw.src_phy,
            },
            payload: &buf[payload_begin..payload_end],
        })
    }

    /// Total wire size of the node, header included.
    #[must_use]
    pub fn extent(&self) -> usize {
        XTC_HEADER_SIZE + self.payload.len()
    }
}

/// Control transitions and the per-shot trigger.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TransitionId {
    Unknown = 0,
    Reset = 1,
    Map = 2,
    Unmap = 3,
    Configure = 4,
    Unconfigure = 5,
    BeginRun = 6,
    EndRun = 7,
    BeginCalibCycle = 8,
    EndCalibCycle = 9,
    Enable = 10,
    Disable = 11,
    L1Accept = 12,
}

impl TransitionId {
    /// Maps a wire value to a transition id.
    #[must_use]
    pub fn from_wire(value: u32) -> TransitionId {
        match value {
            1 => TransitionId::Reset,
            2 => TransitionId::Map,
            3 => TransitionId::Unmap,
            4 => TransitionId::Configure,
            5 => TransitionId::Unconfigure,
            6 => TransitionId::BeginRun,
            7 => TransitionId::EndRun,
            8 => TransitionId::BeginCalibCycle,
            9 => TransitionId::EndCalibCycle,
            10 => TransitionId::Enable,
            11 => TransitionId::Disable,
            12 => TransitionId::L1Accept,
            _ => TransitionId::Unknown,
        }
    }

    /// Transitions that end a configuration epoch have odd service ids.
    #[must_use]
    pub fn is_closing(self) -> bool {
        (self as u32) % 2 == 1
    }
}

/// Raw datagram header as laid out on the wire, in front of the root node.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct RawDatagramHeader {
    /// Wall clock seconds of the shot.
    pub seconds: u32,
    /// Wall clock nanoseconds of the shot.
    pub nanoseconds: u32,
    /// Rolling fiducial counter of the shot.
    pub fiducials: u32,
    /// Service id, a [`TransitionId`] wire value.
    pub service: u32,
    /// Environment word.
    pub env: u32,
    /// Reserved, keeps the root node 8-byte aligned.
    pub reserved: u32,
}

/// A parsed datagram: header fields plus the root node.
#[derive(Debug, Clone, Copy)]
pub struct Datagram<'a> {
    /// Wall clock seconds of the shot.
    pub seconds: u32,
    /// Wall clock nanoseconds of the shot.
    pub nanoseconds: u32,
    /// Rolling fiducial counter of the shot.
    pub fiducials: u32,
    /// The transition kind of the datagram.
    pub service: TransitionId,
    /// The root node.
    pub root: XtcNode<'a>,
}

impl<'a> Datagram<'a> {
    /// Parses the datagram header and its root node.
    pub fn parse(buf: &'a [u8]) -> Result<Datagram<'a>, XtcError> {
        if buf.len() < DATAGRAM_HEADER_SIZE {
            return Err(XtcError::Truncated {
                offset: 0,
                need: DATAGRAM_HEADER_SIZE,
                have: buf.len(),
            });
        }
        let raw: RawDatagramHeader =
            bytemuck::pod_read_unaligned(&buf[..DATAGRAM_HEADER_SIZE]);
        let root = XtcNode::parse_at(buf, DATAGRAM_HEADER_SIZE)?;
        Ok(Datagram {
            seconds: u32::from_le(raw.seconds),
            nanoseconds: u32::from_le(raw.nanoseconds),
            fiducials: u32::from_le(raw.fiducials),
            service: TransitionId::from_wire(u32::from_le(raw.service)),
            root,
        })
    }

    /// The event id this datagram maps to.
    #[must_use]
    pub fn event_id(&self) -> crate::EventId {
        crate::event_id(self.seconds, self.fiducials)
    }

    /// True for a per-shot trigger, false for a control transition.
    #[must_use]
    pub fn is_l1_accept(&self) -> bool {
        self.service == TransitionId::L1Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_id_packs_and_unpacks() {
        let id = TypeId::new(TypeKind::PnccdFrame, 1);
        assert_eq!(id.kind(), Some(TypeKind::PnccdFrame));
        assert_eq!(id.version(), 1);
        assert!(!id.compressed());

        let zipped = TypeId::new_compressed(TypeKind::Frame, 2);
        assert!(zipped.compressed());
        assert_eq!(zipped.kind(), Some(TypeKind::Frame));
        assert_eq!(zipped.compressed_version(), 2);

        assert_eq!(TypeKind::from_wire(NUMBER_OF_TYPES), None);
    }

    #[test]
    fn damage_bit_checks() {
        let d = Damage(1 << DamageBit::UserDefined as u32);
        assert!(d.has(DamageBit::UserDefined));
        assert!(d.user_defined_only());
        let d = Damage((1 << DamageBit::UserDefined as u32) | (1 << DamageBit::OutOfOrder as u32));
        assert!(!d.user_defined_only());
        assert!(Damage(0).is_clean());
    }

    #[test]
    fn closing_transitions_are_odd() {
        assert!(TransitionId::Unconfigure.is_closing());
        assert!(TransitionId::Unmap.is_closing());
        assert!(!TransitionId::Configure.is_closing());
        assert!(!TransitionId::L1Accept.is_closing());
    }

    #[test]
    fn node_parse_checks_bounds() {
        let header = RawXtcHeader {
            type_id: TypeId::new(TypeKind::Frame, 1).0,
            damage: 0,
            src_level: Level::Source as u32,
            src_phy: 0,
            payload_size: 8,
        };
        let mut buf = header.to_bytes().to_vec();
        buf.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let node = XtcNode::parse_at(&buf, 0).unwrap();
        assert_eq!(node.payload, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(node.extent(), XTC_HEADER_SIZE + 8);

        // truncated payload
        buf.truncate(XTC_HEADER_SIZE + 4);
        assert!(matches!(
            XtcNode::parse_at(&buf, 0),
            Err(XtcError::Truncated { .. })
        ));
    }
}
