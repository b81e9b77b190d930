//! Wave digitizer converter.
//!
//! Handles the digitizer configuration (channel count, samples per waveform,
//! sample interval) and the per-shot waveform payload. Samples travel
//! big-endian on the wire and are swapped while copying.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::event::acqiris::{Channel, Instrument};
use crate::event::{CassEvent, Device, DeviceKind};
use crate::xtc::{TypeKind, XtcNode};

use super::store::{AcqirisConfig, ConfigStore};
use super::{CassIdMap, ConversionError, Converter};

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RawConfig {
    nbr_channels: u32,
    nbr_samples: u32,
    sample_interval: f64,
}

const RAW_CONFIG_SIZE: usize = std::mem::size_of::<RawConfig>();

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RawChannelHeader {
    horpos: f64,
    offset: f64,
    gain: f64,
    nbr_samples: u32,
    index_first_point: u32,
}

const RAW_CHANNEL_HEADER_SIZE: usize = std::mem::size_of::<RawChannelHeader>();

/// Converter for digitizer configuration and waveform payloads.
pub struct AcqirisConverter {
    store: Arc<ConfigStore>,
    ids: Arc<CassIdMap>,
}

impl AcqirisConverter {
    /// Creates the converter over the shared configuration store.
    #[must_use]
    pub fn new(store: Arc<ConfigStore>, ids: Arc<CassIdMap>) -> AcqirisConverter {
        AcqirisConverter { store, ids }
    }

    fn convert_config(&self, node: &XtcNode) -> Result<(), ConversionError> {
        if node.payload.len() < RAW_CONFIG_SIZE {
            return Err(ConversionError::PayloadTooSmall {
                converter: "AcqirisConverter",
                need: RAW_CONFIG_SIZE,
                have: node.payload.len(),
            });
        }
        let raw: RawConfig = bytemuck::pod_read_unaligned(&node.payload[..RAW_CONFIG_SIZE]);
        self.store.put_acqiris(
            node.src.phy,
            AcqirisConfig {
                nbr_channels: raw.nbr_channels as usize,
                nbr_samples: raw.nbr_samples as usize,
                sample_interval: raw.sample_interval,
            },
        );
        Ok(())
    }

    fn convert_waveforms(
        &self,
        node: &XtcNode,
        event: &mut CassEvent,
    ) -> Result<(), ConversionError> {
        let config = self.store.acqiris(node.src.phy).ok_or(
            ConversionError::MissingConfig {
                converter: "AcqirisConverter",
                src: node.src.phy,
            },
        )?;

        let mut channels = Vec::with_capacity(config.nbr_channels);
        let mut offset = 0;
        for channel_nbr in 0..config.nbr_channels {
            if node.payload.len() < offset + RAW_CHANNEL_HEADER_SIZE {
                return Err(ConversionError::PayloadTooSmall {
                    converter: "AcqirisConverter",
                    need: offset + RAW_CHANNEL_HEADER_SIZE,
                    have: node.payload.len(),
                });
            }
            let header: RawChannelHeader = bytemuck::pod_read_unaligned(
                &node.payload[offset..offset + RAW_CHANNEL_HEADER_SIZE],
            );
            offset += RAW_CHANNEL_HEADER_SIZE;

            if header.nbr_samples as usize != config.nbr_samples {
                return Err(ConversionError::Inconsistent {
                    converter: "AcqirisConverter",
                    reason: format!(
                        "channel {channel_nbr} has {} samples, configuration says {}",
                        header.nbr_samples, config.nbr_samples
                    ),
                });
            }

            let total = header.index_first_point as usize + header.nbr_samples as usize;
            let bytes = total * 2;
            if node.payload.len() < offset + bytes {
                return Err(ConversionError::PayloadTooSmall {
                    converter: "AcqirisConverter",
                    need: offset + bytes,
                    have: node.payload.len(),
                });
            }

            // skip the leading garbage points, swap the rest to host order
            let first = offset + header.index_first_point as usize * 2;
            let waveform: Vec<i16> = node.payload[first..offset + bytes]
                .chunks_exact(2)
                .map(|pair| i16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            offset += bytes;

            channels.push(Channel {
                channel_nbr: channel_nbr as u16,
                horpos: header.horpos,
                offset: header.offset,
                gain: header.gain,
                sample_interval: config.sample_interval,
                waveform,
            });
        }

        let instrument = self.ids.resolve(TypeKind::AcqWaveform, node.src.phy);
        if let Device::Acqiris(dev) = event.device_mut(DeviceKind::Acqiris) {
            dev.instruments.insert(instrument, Instrument { channels });
        }
        Ok(())
    }
}

impl Converter for AcqirisConverter {
    fn type_list(&self) -> Vec<(TypeKind, u16)> {
        vec![(TypeKind::AcqConfig, 1), (TypeKind::AcqWaveform, 1)]
    }

    fn convert(&self, node: &XtcNode, event: &mut CassEvent) -> Result<(), ConversionError> {
        match node.type_id.kind() {
            Some(TypeKind::AcqConfig) => self.convert_config(node),
            Some(TypeKind::AcqWaveform) => self.convert_waveforms(node, event),
            _ => Ok(()),
        }
    }
}

/// Serializes a digitizer configuration payload (used by the generator and
/// the tests).
#[must_use]
pub fn encode_config(nbr_channels: u32, nbr_samples: u32, sample_interval: f64) -> Vec<u8> {
    let raw = RawConfig {
        nbr_channels,
        nbr_samples,
        sample_interval,
    };
    bytemuck::bytes_of(&raw).to_vec()
}

/// Serializes one waveform channel (used by the generator and the tests).
pub fn encode_channel(out: &mut Vec<u8>, gain: f64, offset: f64, horpos: f64, samples: &[i16]) {
    let header = RawChannelHeader {
        horpos,
        offset,
        gain,
        nbr_samples: samples.len() as u32,
        index_first_point: 0,
    };
    out.extend_from_slice(bytemuck::bytes_of(&header));
    for sample in samples {
        out.extend_from_slice(&sample.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xtc::{Damage, Level, Src, TypeId};

    fn node<'a>(kind: TypeKind, payload: &'a [u8], phy: u32) -> XtcNode<'a> {
        XtcNode {
            type_id: TypeId::new(kind, 1),
            damage: Damage(0),
            src: Src {
                level: Level::Source,
                phy,
            },
            payload,
        }
    }

    #[test]
    fn data_before_config_is_an_error() {
        let converter = AcqirisConverter::new(
            Arc::new(ConfigStore::new()),
            Arc::new(CassIdMap::new()),
        );
        let mut event = CassEvent::allocate(64);
        let payload = [0u8; 64];
        let err = converter
            .convert(&node(TypeKind::AcqWaveform, &payload, 0x100), &mut event)
            .unwrap_err();
        assert!(matches!(err, ConversionError::MissingConfig { .. }));
    }

    #[test]
    fn waveform_roundtrip_applies_config() {
        let store = Arc::new(ConfigStore::new());
        let ids = Arc::new(CassIdMap::new());
        let converter = AcqirisConverter::new(Arc::clone(&store), ids);
        let mut event = CassEvent::allocate(64);

        let config = encode_config(1, 4, 1e-9);
        converter
            .convert(&node(TypeKind::AcqConfig, &config, 0x100), &mut event)
            .unwrap();

        let mut data = Vec::new();
        encode_channel(&mut data, 0.5, 0.25, 0.0, &[-2, -1, 1, 2]);
        converter
            .convert(&node(TypeKind::AcqWaveform, &data, 0x100), &mut event)
            .unwrap();

        let dev = event.acqiris().unwrap();
        let chan = &dev.instruments[&0].channels[0];
        assert_eq!(chan.waveform, vec![-2, -1, 1, 2]);
        assert!((chan.gain - 0.5).abs() < f64::EPSILON);
        assert!((chan.sample_interval - 1e-9).abs() < f64::EPSILON);
    }
}
