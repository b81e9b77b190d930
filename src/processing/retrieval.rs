//! Leaf processors that source the graph from the event's devices.
//!
//! The output shape of each leaf is fixed at load time from its settings;
//! a payload that does not match is an invalid-data error for that event.

use crate::event::{CassEvent, DeviceKind};
use crate::settings::Settings;

use super::result::ResultData;
use super::{Operation, ProcessorError, Wiring};

/// Waveform of one digitizer channel, converted to volts.
pub struct Waveform {
    instrument: u32,
    channel: usize,
    template: ResultData,
}

impl Waveform {
    /// Parses `InstrumentId`, `ChannelNbr` and the output axis keys.
    #[must_use]
    pub fn from_settings(s: &Settings) -> Waveform {
        Waveform {
            instrument: s.value_usize("InstrumentId", 0) as u32,
            channel: s.value_usize("ChannelNbr", 0),
            template: super::hist_1d_from_settings(s, ""),
        }
    }
}

impl Operation for Waveform {
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn wire(&mut self, _wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        Ok(self.template.clone())
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let device = event.acqiris().map_err(|err| ProcessorError::InvalidData {
            name: result.name().to_string(),
            reason: err.to_string(),
        })?;
        let instrument =
            device
                .instruments
                .get(&self.instrument)
                .ok_or_else(|| ProcessorError::InvalidData {
                    name: result.name().to_string(),
                    reason: format!("instrument {} not in event", self.instrument),
                })?;
        let channel =
            instrument
                .channels
                .get(self.channel)
                .ok_or_else(|| ProcessorError::InvalidData {
                    name: result.name().to_string(),
                    reason: format!("channel {} not in instrument", self.channel),
                })?;
        let nbins = result.bins().len();
        if channel.waveform.len() != nbins {
            return Err(ProcessorError::InvalidData {
                name: result.name().to_string(),
                reason: format!(
                    "waveform has {} samples, output is sized for {nbins}",
                    channel.waveform.len()
                ),
            });
        }
        let gain = channel.gain;
        let offset = channel.offset;
        for (bin, &raw) in result.bins_mut().iter_mut().zip(&channel.waveform) {
            *bin = f64::from(raw) * gain - offset;
        }
        result.add_fill();
        Ok(())
    }
}

/// Histogram of the hit times of one TDC channel.
pub struct TdcHits {
    instrument: u32,
    channel: usize,
    template: ResultData,
}

impl TdcHits {
    /// Parses `InstrumentId`, `ChannelNbr` and the output axis keys.
    #[must_use]
    pub fn from_settings(s: &Settings) -> TdcHits {
        TdcHits {
            instrument: s.value_usize("InstrumentId", 0) as u32,
            channel: s.value_usize("ChannelNbr", 0),
            template: super::hist_1d_from_settings(s, ""),
        }
    }
}

impl Operation for TdcHits {
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn wire(&mut self, _wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        Ok(self.template.clone())
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let device = event
            .acqiris_tdc()
            .map_err(|err| ProcessorError::InvalidData {
                name: result.name().to_string(),
                reason: err.to_string(),
            })?;
        let instrument =
            device
                .instruments
                .get(&self.instrument)
                .ok_or_else(|| ProcessorError::InvalidData {
                    name: result.name().to_string(),
                    reason: format!("instrument {} not in event", self.instrument),
                })?;
        let channel =
            instrument
                .channels
                .get(self.channel)
                .ok_or_else(|| ProcessorError::InvalidData {
                    name: result.name().to_string(),
                    reason: format!("channel {} not in instrument", self.channel),
                })?;
        for &hit in &channel.hits {
            result.fill_1d(hit, 1.0);
        }
        result.add_fill();
        Ok(())
    }
}

/// A named machine value (or a derived quantity) as a scalar.
pub struct MachineValue {
    var_name: String,
}

impl MachineValue {
    /// Parses `VarName`. The names `PhotonEnergy` and `Wavelength` select
    /// the derived quantities.
    #[must_use]
    pub fn from_settings(s: &Settings) -> MachineValue {
        MachineValue {
            var_name: s.value_str("VarName", ""),
        }
    }
}

impl Operation for MachineValue {
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn wire(&mut self, _wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        Ok(ResultData::new_scalar(""))
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let md = event
            .machine_data()
            .map_err(|err| ProcessorError::InvalidData {
                name: result.name().to_string(),
                reason: err.to_string(),
            })?;
        let value = match self.var_name.as_str() {
            "PhotonEnergy" => Some(md.photon_energy_ev),
            "Wavelength" => Some(md.wavelength_nm),
            name => md.beamline.get(name).or_else(|| md.epics.get(name)).copied(),
        };
        match value {
            Some(value) => {
                result.set_scalar(value);
                Ok(())
            }
            None => Err(ProcessorError::InvalidData {
                name: result.name().to_string(),
                reason: format!("machine value '{}' not in event", self.var_name),
            }),
        }
    }
}

/// The frame of one pixel detector as a 2-D result.
pub struct Image {
    device: DeviceKind,
    detector: u32,
    template: ResultData,
}

impl Image {
    /// Parses `Device` (`CCD` or `PixelDetectors`) and `DetectorId`.
    pub fn from_settings(name: &str, s: &Settings) -> Result<Image, ProcessorError> {
        let device = match s.value_str("Device", "PixelDetectors").as_str() {
            "CCD" => DeviceKind::Ccd,
            "PixelDetectors" => DeviceKind::PixelDetectors,
            other => {
                return Err(ProcessorError::ShapeMismatch {
                    name: name.to_string(),
                    reason: format!("unknown device '{other}'"),
                })
            }
        };
        Ok(Image {
            device,
            detector: s.value_usize("DetectorId", 0) as u32,
            template: super::hist_2d_from_settings(s, ""),
        })
    }
}

impl Operation for Image {
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn wire(&mut self, _wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        Ok(self.template.clone())
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let device = event
            .pixel_detectors(self.device)
            .map_err(|err| ProcessorError::InvalidData {
                name: result.name().to_string(),
                reason: err.to_string(),
            })?;
        let detector =
            device
                .dets
                .get(&self.detector)
                .ok_or_else(|| ProcessorError::InvalidData {
                    name: result.name().to_string(),
                    reason: format!("detector {} not in event", self.detector),
                })?;
        let nbins = result.bins().len();
        if detector.frame.len() != nbins {
            return Err(ProcessorError::InvalidData {
                name: result.name().to_string(),
                reason: format!(
                    "frame is {}x{}, output is sized for {nbins} pixels",
                    detector.columns, detector.rows
                ),
            });
        }
        for (bin, &pixel) in result.bins_mut().iter_mut().zip(&detector.frame) {
            *bin = f64::from(pixel);
        }
        result.add_fill();
        Ok(())
    }
}
