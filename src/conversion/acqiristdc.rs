//! Time-to-digital converter payloads.
//!
//! The data payload is a flat list of hit records; each record names its
//! channel and carries the hit time in seconds. Records are grouped into the
//! channel layout the configuration announced.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::event::acqiristdc::{TdcChannel, TdcInstrument};
use crate::event::{CassEvent, Device, DeviceKind};
use crate::xtc::{TypeKind, XtcNode};

use super::store::{ConfigStore, TdcConfig};
use super::{CassIdMap, ConversionError, Converter};

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RawTdcConfig {
    nbr_channels: u32,
    reserved: u32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RawHit {
    channel: u32,
    reserved: u32,
    time: f64,
}

const RAW_TDC_CONFIG_SIZE: usize = std::mem::size_of::<RawTdcConfig>();
const RAW_HIT_SIZE: usize = std::mem::size_of::<RawHit>();

/// Converter for TDC configuration and hit payloads.
pub struct AcqirisTdcConverter {
    store: Arc<ConfigStore>,
    ids: Arc<CassIdMap>,
}

impl AcqirisTdcConverter {
    /// Creates the converter over the shared configuration store.
    #[must_use]
    pub fn new(store: Arc<ConfigStore>, ids: Arc<CassIdMap>) -> AcqirisTdcConverter {
        AcqirisTdcConverter { store, ids }
    }
}

impl Converter for AcqirisTdcConverter {
    fn type_list(&self) -> Vec<(TypeKind, u16)> {
        vec![(TypeKind::AcqTdcConfig, 1), (TypeKind::AcqTdcData, 1)]
    }

    fn convert(&self, node: &XtcNode, event: &mut CassEvent) -> Result<(), ConversionError> {
        match node.type_id.kind() {
            Some(TypeKind::AcqTdcConfig) => {
                if node.payload.len() < RAW_TDC_CONFIG_SIZE {
                    return Err(ConversionError::PayloadTooSmall {
                        converter: "AcqirisTdcConverter",
                        need: RAW_TDC_CONFIG_SIZE,
                        have: node.payload.len(),
                    });
                }
                let raw: RawTdcConfig =
                    bytemuck::pod_read_unaligned(&node.payload[..RAW_TDC_CONFIG_SIZE]);
                self.store.put_tdc(
                    node.src.phy,
                    TdcConfig {
                        nbr_channels: raw.nbr_channels as usize,
                    },
                );
                Ok(())
            }
            Some(TypeKind::AcqTdcData) => {
                let config =
                    self.store
                        .tdc(node.src.phy)
                        .ok_or(ConversionError::MissingConfig {
                            converter: "AcqirisTdcConverter",
                            src: node.src.phy,
                        })?;

                let mut channels = vec![TdcChannel::default(); config.nbr_channels];
                for record in node.payload.chunks_exact(RAW_HIT_SIZE) {
                    let hit: RawHit = bytemuck::pod_read_unaligned(record);
                    let channel = hit.channel as usize;
                    if channel >= channels.len() {
                        return Err(ConversionError::Inconsistent {
                            converter: "AcqirisTdcConverter",
                            reason: format!(
                                "hit names channel {channel}, configuration has {}",
                                channels.len()
                            ),
                        });
                    }
                    channels[channel].hits.push(hit.time);
                }

                let instrument = self.ids.resolve(TypeKind::AcqTdcData, node.src.phy);
                if let Device::AcqirisTdc(dev) = event.device_mut(DeviceKind::AcqirisTdc) {
                    dev.instruments.insert(instrument, TdcInstrument { channels });
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Serializes a TDC configuration payload.
#[must_use]
pub fn encode_config(nbr_channels: u32) -> Vec<u8> {
    bytemuck::bytes_of(&RawTdcConfig {
        nbr_channels,
        reserved: 0,
    })
    .to_vec()
}

/// Appends one hit record to a TDC data payload.
pub fn encode_hit(out: &mut Vec<u8>, channel: u32, time: f64) {
    out.extend_from_slice(bytemuck::bytes_of(&RawHit {
        channel,
        reserved: 0,
        time,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xtc::{Damage, Level, Src, TypeId};

    #[test]
    fn hits_are_grouped_by_channel() {
        let store = Arc::new(ConfigStore::new());
        let converter = AcqirisTdcConverter::new(Arc::clone(&store), Arc::new(CassIdMap::new()));
        let mut event = CassEvent::allocate(64);

        let config = encode_config(2);
        let config_node = XtcNode {
            type_id: TypeId::new(TypeKind::AcqTdcConfig, 1),
            damage: Damage(0),
            src: Src { level: Level::Source, phy: 0x42 },
            payload: &config,
        };
        converter.convert(&config_node, &mut event).unwrap();

        let mut data = Vec::new();
        encode_hit(&mut data, 0, 1.5e-6);
        encode_hit(&mut data, 1, 2.5e-6);
        encode_hit(&mut data, 0, 3.5e-6);
        let data_node = XtcNode {
            type_id: TypeId::new(TypeKind::AcqTdcData, 1),
            damage: Damage(0),
            src: Src { level: Level::Source, phy: 0x42 },
            payload: &data,
        };
        converter.convert(&data_node, &mut event).unwrap();

        let dev = event.acqiris_tdc().unwrap();
        let instrument = dev.instruments.values().next().unwrap();
        assert_eq!(instrument.channels[0].hits, vec![1.5e-6, 3.5e-6]);
        assert_eq!(instrument.channels[1].hits, vec![2.5e-6]);
    }
}
