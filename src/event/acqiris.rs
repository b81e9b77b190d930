//! Wave digitizer payload.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::serializer::Serializable;

/// One digitizer channel of one shot.
///
/// The waveform holds raw ADC counts; `volts = raw * gain - offset` converts
/// a sample to volts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Channel {
    /// Index of the channel within its instrument.
    pub channel_nbr: u16,

    /// Horizontal position of the first sample with respect to the trigger,
    /// in seconds.
    pub horpos: f64,

    /// Vertical offset in volts.
    pub offset: f64,

    /// Vertical gain in volts per count.
    pub gain: f64,

    /// Time between two samples in seconds.
    pub sample_interval: f64,

    /// The raw 16 bit samples.
    pub waveform: Vec<i16>,
}

impl Channel {
    /// The sample at `idx` converted to volts.
    #[must_use]
    pub fn volts(&self, idx: usize) -> f64 {
        f64::from(self.waveform[idx]) * self.gain - self.offset
    }
}

/// The channel set of one digitizer instrument.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Instrument {
    /// Channels in wire order.
    pub channels: Vec<Channel>,
}

/// All wave digitizer instruments of one shot, keyed by instrument id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcqirisDevice {
    /// Instruments keyed by their dense id.
    pub instruments: BTreeMap<u32, Instrument>,
}

impl Serializable for AcqirisDevice {
    const VERSION: u16 = 4;
    const NAME: &'static str = "AcqirisDevice";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volts_applies_gain_and_offset() {
        let chan = Channel {
            gain: 0.5,
            offset: 1.0,
            waveform: vec![10],
            ..Channel::default()
        };
        assert!((chan.volts(0) - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn roundtrip() {
        let mut dev = AcqirisDevice::default();
        dev.instruments.insert(
            0,
            Instrument {
                channels: vec![Channel {
                    channel_nbr: 3,
                    waveform: vec![1, -1],
                    ..Channel::default()
                }],
            },
        );
        let mut buf = Vec::new();
        Serializable::serialize(&dev, &mut buf).unwrap();
        let copy = <AcqirisDevice as Serializable>::deserialize(&mut buf.as_slice()).unwrap();
        assert_eq!(copy.instruments[&0].channels[0].channel_nbr, 3);
        assert_eq!(copy.instruments[&0].channels[0].waveform, vec![1, -1]);
    }
}
