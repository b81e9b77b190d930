//! Recursive iteration over the nodes of a datagram.
//!
//! The walker never propagates a panic or error upward; every outcome is a
//! [`WalkResult`]. The caller decides whether a [`WalkResult::Stop`] marks
//! the event as bad (slot discarded) or invalid (slot released without
//! queueing downstream).

use std::io::Read;

use flate2::read::ZlibDecoder;
use log::{error, warn};

use crate::conversion::ConverterRegistry;
use crate::event::CassEvent;
use crate::xtc::{DamageBit, RawXtcHeader, TypeKind, XtcNode, XTC_HEADER_SIZE};

/// Outcome of walking a (sub)tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkResult {
    /// The subtree was handled; continue with the next sibling.
    Continue,
    /// The event must be skipped.
    Stop,
}

/// Walks the tree below `root` depth-first and dispatches every leaf payload
/// to the converter registered for its (type, version).
pub fn walk(root: &XtcNode, registry: &ConverterRegistry, event: &mut CassEvent) -> WalkResult {
    process(root, registry, event)
}

fn process(node: &XtcNode, registry: &ConverterRegistry, event: &mut CassEvent) -> WalkResult {
    let kind = match node.type_id.kind() {
        Some(kind) => kind,
        None => {
            error!(
                "{} is an unknown xtc id, skipping event",
                node.type_id.kind_value()
            );
            return WalkResult::Stop;
        }
    };

    if kind == TypeKind::Xtc {
        return iterate(node.payload, registry, event);
    }

    // Inflate a compressed payload into a buffer owned by this call; the
    // inner header describes the uncompressed type.
    let inflated;
    let node = if node.type_id.compressed() {
        match uncompress(node) {
            Ok(buf) => {
                inflated = buf;
                match XtcNode::parse_at(&inflated, 0) {
                    Ok(inner) => inner,
                    Err(err) => {
                        error!("bad inner node in compressed payload: {err}, skipping event");
                        return WalkResult::Stop;
                    }
                }
            }
            Err(err) => {
                error!("cannot uncompress payload: {err}, skipping event");
                return WalkResult::Stop;
            }
        }
    } else {
        *node
    };

    if !node.damage.is_clean() {
        warn!("{kind:?} is damaged: {:#x}", node.damage.0);
        if node.damage.has(DamageBit::DroppedContribution) {
            error!("damage {:#x} is a dropped contribution, skipping event", node.damage.0);
            return WalkResult::Stop;
        }
        if node.damage.has(DamageBit::IncompleteContribution) {
            error!(
                "damage {:#x} is an incomplete contribution, skipping event",
                node.damage.0
            );
            return WalkResult::Stop;
        }
        if !node.damage.user_defined_only() {
            error!("damage {:#x} is unknown damage, skipping event", node.damage.0);
            return WalkResult::Stop;
        }
        // user-defined damage alone is left to the converter
    }

    registry.dispatch(&node, event);
    WalkResult::Continue
}

fn iterate(payload: &[u8], registry: &ConverterRegistry, event: &mut CassEvent) -> WalkResult {
    let mut offset = 0;
    while offset + XTC_HEADER_SIZE <= payload.len() {
        let child = match XtcNode::parse_at(payload, offset) {
            Ok(child) => child,
            Err(err) => {
                error!("bad child node: {err}, skipping event");
                return WalkResult::Stop;
            }
        };
        if process(&child, registry, event) == WalkResult::Stop {
            return WalkResult::Stop;
        }
        offset += child.extent();
    }
    if offset != payload.len() {
        warn!(
            "container payload has {} trailing bytes",
            payload.len() - offset
        );
    }
    WalkResult::Continue
}

/// Inflates a compressed node payload: the inner node header is stored
/// verbatim, the inner payload follows as a zlib stream.
fn uncompress(node: &XtcNode) -> Result<Vec<u8>, crate::xtc::XtcError> {
    if node.payload.len() < XTC_HEADER_SIZE {
        return Err(crate::xtc::XtcError::Truncated {
            offset: 0,
            need: XTC_HEADER_SIZE,
            have: node.payload.len(),
        });
    }
    let inner = RawXtcHeader::parse(node.payload);
    let mut out = Vec::with_capacity(XTC_HEADER_SIZE + inner.payload_size as usize);
    out.extend_from_slice(&node.payload[..XTC_HEADER_SIZE]);
    let mut decoder = ZlibDecoder::new(&node.payload[XTC_HEADER_SIZE..]);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::ConverterRegistry;
    use crate::xtc::{Level, TypeId};

    fn leaf(kind: TypeKind, damage: u32, payload: &[u8]) -> Vec<u8> {
        let header = RawXtcHeader {
            type_id: TypeId::new(kind, 1).0,
            damage,
            src_level: Level::Source as u32,
            src_phy: 0,
            payload_size: payload.len() as u32,
        };
        let mut out = header.to_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    fn container(children: &[Vec<u8>]) -> Vec<u8> {
        let payload: Vec<u8> = children.iter().flatten().copied().collect();
        let header = RawXtcHeader {
            type_id: TypeId::new(TypeKind::Xtc, 1).0,
            damage: 0,
            src_level: Level::Control as u32,
            src_phy: 0,
            payload_size: payload.len() as u32,
        };
        let mut out = header.to_bytes().to_vec();
        out.extend_from_slice(&payload);
        out
    }

    fn parse(buf: &[u8]) -> XtcNode<'_> {
        XtcNode::parse_at(buf, 0).unwrap()
    }

    #[test]
    fn dropped_contribution_stops_the_walk() {
        let registry = ConverterRegistry::new();
        let mut event = CassEvent::allocate(64);
        let buf = container(&[leaf(
            TypeKind::Frame,
            1 << DamageBit::DroppedContribution as u32,
            &[0; 4],
        )]);
        assert_eq!(
            walk(&parse(&buf), &registry, &mut event),
            WalkResult::Stop
        );
    }

    #[test]
    fn user_defined_damage_alone_continues() {
        let registry = ConverterRegistry::new();
        let mut event = CassEvent::allocate(64);
        let buf = container(&[leaf(
            TypeKind::Frame,
            1 << DamageBit::UserDefined as u32,
            &[0; 4],
        )]);
        assert_eq!(
            walk(&parse(&buf), &registry, &mut event),
            WalkResult::Continue
        );
    }

    #[test]
    fn unknown_type_without_converter_is_skipped_not_fatal() {
        let registry = ConverterRegistry::new();
        let mut event = CassEvent::allocate(64);
        let buf = container(&[
            leaf(TypeKind::PhaseCavity, 0, &[0; 8]),
            leaf(TypeKind::Frame, 0, &[0; 4]),
        ]);
        assert_eq!(
            walk(&parse(&buf), &registry, &mut event),
            WalkResult::Continue
        );
    }

    #[test]
    fn nested_containers_are_traversed() {
        let registry = ConverterRegistry::new();
        let mut event = CassEvent::allocate(64);
        let inner = container(&[leaf(TypeKind::Frame, 0, &[0; 4])]);
        let outer = container(&[inner]);
        assert_eq!(
            walk(&parse(&outer), &registry, &mut event),
            WalkResult::Continue
        );
    }
}
