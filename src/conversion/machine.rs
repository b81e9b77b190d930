//! Machine data converter.
//!
//! Beamline payloads (electron beam, gas detector, phase cavity) write into
//! the beamline map; EPICS payloads arrive either as an index-to-name
//! announcement, buffered in the configuration store, or as a typed value
//! for a known index. The derived photon energy and wavelength are
//! recomputed whenever new electron beam values arrive.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::event::{CassEvent, Device, DeviceKind};
use crate::xtc::{TypeKind, XtcNode};

use super::store::ConfigStore;
use super::{ConversionError, Converter};

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RawEBeam {
    charge: f64,
    l3_energy: f64,
    ltu_pos_x: f64,
    ltu_pos_y: f64,
    ltu_ang_x: f64,
    ltu_ang_y: f64,
    pk_curr_bc2: f64,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RawGasDet {
    f_11: f64,
    f_12: f64,
    f_21: f64,
    f_22: f64,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RawPhaseCavity {
    fit_time_1: f64,
    fit_time_2: f64,
    charge_1: f64,
    charge_2: f64,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RawEpicsHeader {
    record_kind: u8,
    value_type: u8,
    index: u16,
}

const RAW_EPICS_HEADER_SIZE: usize = std::mem::size_of::<RawEpicsHeader>();

/// EPICS record announcing the name of an index.
pub const EPICS_RECORD_NAME: u8 = 0;
/// EPICS record carrying a value for a known index.
pub const EPICS_RECORD_VALUE: u8 = 1;

/// Typed decode selector of an EPICS value record.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EpicsValueType {
    I8 = 0,
    U8 = 1,
    I16 = 2,
    U16 = 3,
    I32 = 4,
    U32 = 5,
    F32 = 6,
    F64 = 7,
    StringAsDouble = 8,
}

/// Converter for the machine data payload family.
pub struct MachineConverter {
    store: Arc<ConfigStore>,
}

impl MachineConverter {
    /// Creates the converter over the shared configuration store.
    #[must_use]
    pub fn new(store: Arc<ConfigStore>) -> MachineConverter {
        MachineConverter { store }
    }

    fn read_pod<T: Pod>(node: &XtcNode, name: &'static str) -> Result<T, ConversionError> {
        let size = std::mem::size_of::<T>();
        if node.payload.len() < size {
            return Err(ConversionError::PayloadTooSmall {
                converter: name,
                need: size,
                have: node.payload.len(),
            });
        }
        Ok(bytemuck::pod_read_unaligned(&node.payload[..size]))
    }

    fn convert_epics(&self, node: &XtcNode, event: &mut CassEvent) -> Result<(), ConversionError> {
        let header: RawEpicsHeader = Self::read_pod(node, "MachineConverter")?;
        let body = &node.payload[RAW_EPICS_HEADER_SIZE..];
        match header.record_kind {
            EPICS_RECORD_NAME => {
                let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
                let name = String::from_utf8_lossy(&body[..end]).into_owned();
                self.store.put_epics_name(header.index, name);
                Ok(())
            }
            EPICS_RECORD_VALUE => {
                let name = self.store.epics_name(header.index).ok_or(
                    ConversionError::MissingConfig {
                        converter: "MachineConverter",
                        src: u32::from(header.index),
                    },
                )?;
                let value = decode_epics_value(header.value_type, body)?;
                if let Device::MachineData(md) = event.device_mut(DeviceKind::MachineData) {
                    md.epics.insert(name, value);
                }
                Ok(())
            }
            other => Err(ConversionError::Inconsistent {
                converter: "MachineConverter",
                reason: format!("unknown epics record kind {other}"),
            }),
        }
    }
}

fn decode_epics_value(value_type: u8, body: &[u8]) -> Result<f64, ConversionError> {
    let need = |n: usize| -> Result<(), ConversionError> {
        if body.len() < n {
            Err(ConversionError::PayloadTooSmall {
                converter: "MachineConverter",
                need: n,
                have: body.len(),
            })
        } else {
            Ok(())
        }
    };
    Ok(match value_type {
        0 => {
            need(1)?;
            f64::from(body[0] as i8)
        }
        1 => {
            need(1)?;
            f64::from(body[0])
        }
        2 => {
            need(2)?;
            f64::from(i16::from_le_bytes([body[0], body[1]]))
        }
        3 => {
            need(2)?;
            f64::from(u16::from_le_bytes([body[0], body[1]]))
        }
        4 => {
            need(4)?;
            f64::from(i32::from_le_bytes([body[0], body[1], body[2], body[3]]))
        }
        5 => {
            need(4)?;
            f64::from(u32::from_le_bytes([body[0], body[1], body[2], body[3]]))
        }
        6 => {
            need(4)?;
            f64::from(f32::from_le_bytes([body[0], body[1], body[2], body[3]]))
        }
        7 => {
            need(8)?;
            f64::from_le_bytes(body[..8].try_into().expect("checked length"))
        }
        8 => {
            let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
            let text = String::from_utf8_lossy(&body[..end]);
            text.trim().parse().unwrap_or(f64::NAN)
        }
        other => {
            return Err(ConversionError::Inconsistent {
                converter: "MachineConverter",
                reason: format!("unknown epics value type {other}"),
            })
        }
    })
}

impl Converter for MachineConverter {
    fn type_list(&self) -> Vec<(TypeKind, u16)> {
        vec![
            (TypeKind::EBeam, 1),
            (TypeKind::FeeGasDetEnergy, 1),
            (TypeKind::PhaseCavity, 1),
            (TypeKind::Epics, 1),
        ]
    }

    fn convert(&self, node: &XtcNode, event: &mut CassEvent) -> Result<(), ConversionError> {
        match node.type_id.kind() {
            Some(TypeKind::EBeam) => {
                let raw: RawEBeam = Self::read_pod(node, "MachineConverter")?;
                if let Device::MachineData(md) = event.device_mut(DeviceKind::MachineData) {
                    md.beamline.insert("EbeamCharge".to_string(), raw.charge);
                    md.beamline.insert("EbeamL3Energy".to_string(), raw.l3_energy);
                    md.beamline.insert("EbeamLTUPosX".to_string(), raw.ltu_pos_x);
                    md.beamline.insert("EbeamLTUPosY".to_string(), raw.ltu_pos_y);
                    md.beamline.insert("EbeamLTUAngX".to_string(), raw.ltu_ang_x);
                    md.beamline.insert("EbeamLTUAngY".to_string(), raw.ltu_ang_y);
                    md.beamline.insert("EbeamPkCurrBC2".to_string(), raw.pk_curr_bc2);
                    md.compute_derived();
                }
                Ok(())
            }
            Some(TypeKind::FeeGasDetEnergy) => {
                let raw: RawGasDet = Self::read_pod(node, "MachineConverter")?;
                if let Device::MachineData(md) = event.device_mut(DeviceKind::MachineData) {
                    md.beamline.insert("f_11_ENRC".to_string(), raw.f_11);
                    md.beamline.insert("f_12_ENRC".to_string(), raw.f_12);
                    md.beamline.insert("f_21_ENRC".to_string(), raw.f_21);
                    md.beamline.insert("f_22_ENRC".to_string(), raw.f_22);
                }
                Ok(())
            }
            Some(TypeKind::PhaseCavity) => {
                let raw: RawPhaseCavity = Self::read_pod(node, "MachineConverter")?;
                if let Device::MachineData(md) = event.device_mut(DeviceKind::MachineData) {
                    md.beamline.insert("FitTime1".to_string(), raw.fit_time_1);
                    md.beamline.insert("FitTime2".to_string(), raw.fit_time_2);
                    md.beamline.insert("Charge1".to_string(), raw.charge_1);
                    md.beamline.insert("Charge2".to_string(), raw.charge_2);
                }
                Ok(())
            }
            Some(TypeKind::Epics) => self.convert_epics(node, event),
            _ => Ok(()),
        }
    }
}

/// Serializes an electron beam payload.
#[must_use]
pub fn encode_ebeam(l3_energy: f64, pk_curr_bc2: f64) -> Vec<u8> {
    bytemuck::bytes_of(&RawEBeam {
        charge: 0.0,
        l3_energy,
        ltu_pos_x: 0.0,
        ltu_pos_y: 0.0,
        ltu_ang_x: 0.0,
        ltu_ang_y: 0.0,
        pk_curr_bc2,
    })
    .to_vec()
}

/// Serializes an EPICS name announcement.
#[must_use]
pub fn encode_epics_name(index: u16, name: &str) -> Vec<u8> {
    let mut out = bytemuck::bytes_of(&RawEpicsHeader {
        record_kind: EPICS_RECORD_NAME,
        value_type: 0,
        index,
    })
    .to_vec();
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    out
}

/// Serializes an EPICS double value record.
#[must_use]
pub fn encode_epics_f64(index: u16, value: f64) -> Vec<u8> {
    let mut out = bytemuck::bytes_of(&RawEpicsHeader {
        record_kind: EPICS_RECORD_VALUE,
        value_type: EpicsValueType::F64 as u8,
        index,
    })
    .to_vec();
    out.extend_from_slice(&value.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xtc::{Damage, Level, Src, TypeId};

    fn node<'a>(kind: TypeKind, payload: &'a [u8]) -> XtcNode<'a> {
        XtcNode {
            type_id: TypeId::new(kind, 1),
            damage: Damage(0),
            src: Src { level: Level::Reporter, phy: 0 },
            payload,
        }
    }

    #[test]
    fn ebeam_updates_derived_values() {
        let converter = MachineConverter::new(Arc::new(ConfigStore::new()));
        let mut event = CassEvent::allocate(64);
        let payload = encode_ebeam(13600.0, 500.0);
        converter.convert(&node(TypeKind::EBeam, &payload), &mut event).unwrap();

        let md = event.machine_data().unwrap();
        assert!((md.beamline["EbeamL3Energy"] - 13600.0).abs() < f64::EPSILON);
        assert!(md.photon_energy_ev > 0.0);
    }

    #[test]
    fn epics_value_before_name_is_an_error() {
        let converter = MachineConverter::new(Arc::new(ConfigStore::new()));
        let mut event = CassEvent::allocate(64);
        let payload = encode_epics_f64(3, 1.25);
        let err = converter
            .convert(&node(TypeKind::Epics, &payload), &mut event)
            .unwrap_err();
        assert!(matches!(err, ConversionError::MissingConfig { .. }));
    }

    #[test]
    fn epics_name_then_value_fills_the_map() {
        let converter = MachineConverter::new(Arc::new(ConfigStore::new()));
        let mut event = CassEvent::allocate(64);

        let name = encode_epics_name(3, "CAMP:HV:SET");
        converter.convert(&node(TypeKind::Epics, &name), &mut event).unwrap();
        let value = encode_epics_f64(3, 1.25);
        converter.convert(&node(TypeKind::Epics, &value), &mut event).unwrap();

        let md = event.machine_data().unwrap();
        assert!((md.epics["CAMP:HV:SET"] - 1.25).abs() < f64::EPSILON);
    }

    #[test]
    fn typed_epics_decodes() {
        assert_eq!(decode_epics_value(0, &[0xff]).unwrap(), -1.0);
        assert_eq!(decode_epics_value(1, &[0xff]).unwrap(), 255.0);
        assert_eq!(decode_epics_value(2, &(-5i16).to_le_bytes()).unwrap(), -5.0);
        assert_eq!(decode_epics_value(5, &70000u32.to_le_bytes()).unwrap(), 70000.0);
        assert_eq!(decode_epics_value(6, &2.5f32.to_le_bytes()).unwrap(), 2.5);
        assert_eq!(decode_epics_value(8, b"3.75\0junk").unwrap(), 3.75);
        assert!(decode_epics_value(9, &[]).is_err());
    }
}
