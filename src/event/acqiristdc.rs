//! Time-to-digital converter payload.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::serializer::Serializable;

/// The hits of one TDC channel, in seconds, in no particular order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TdcChannel {
    /// Hit times in seconds.
    pub hits: Vec<f64>,
}

/// The channel set of one TDC instrument.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TdcInstrument {
    /// Channels in wire order.
    pub channels: Vec<TdcChannel>,
}

/// All TDC instruments of one shot, keyed by instrument id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcqirisTdcDevice {
    /// Instruments keyed by their dense id.
    pub instruments: BTreeMap<u32, TdcInstrument>,
}

impl Serializable for AcqirisTdcDevice {
    const VERSION: u16 = 1;
    const NAME: &'static str = "AcqirisTdcDevice";
}
