//! Process-wide store of instrument configurations.
//!
//! Configuration transitions are rare and decoded serially; each converter
//! publishes its instrument configuration here under a short write lock.
//! Data converters take read locks. Keys are the XTC physical ids of the
//! sources.

use std::collections::HashMap;
use std::sync::RwLock;

/// Buffered configuration of one wave digitizer instrument.
#[derive(Debug, Clone, Copy)]
pub struct AcqirisConfig {
    /// Number of channels the instrument delivers.
    pub nbr_channels: usize,
    /// Number of samples in each waveform.
    pub nbr_samples: usize,
    /// Time between two samples in seconds.
    pub sample_interval: f64,
}

/// Buffered configuration of one TDC instrument.
#[derive(Debug, Clone, Copy)]
pub struct TdcConfig {
    /// Number of channels the instrument delivers.
    pub nbr_channels: usize,
}

/// Buffered configuration of one pnCCD camera.
#[derive(Debug, Clone)]
pub struct PnccdConfig {
    /// Rows of the assembled frame.
    pub rows: usize,
    /// Columns of the assembled frame.
    pub columns: usize,
    /// Rows of one quarter-frame segment.
    pub rows_of_segment: usize,
    /// Columns of one quarter-frame segment.
    pub columns_of_segment: usize,
    /// Number of links (segments) the camera sends.
    pub nbr_links: usize,
    /// Magic camex value.
    pub camex_magic: u32,
    /// Free-form info string.
    pub info: String,
    /// Name of the timing file.
    pub timing_filename: String,
}

impl Default for PnccdConfig {
    fn default() -> Self {
        PnccdConfig {
            rows: 1024,
            columns: 1024,
            rows_of_segment: 512,
            columns_of_segment: 512,
            nbr_links: 4,
            camex_magic: 0,
            info: String::new(),
            timing_filename: String::new(),
        }
    }
}

/// Buffered configuration of one CsPad detector.
#[derive(Debug, Clone, Copy)]
pub struct CspadConfig {
    /// Bit mask of the quadrants present in the data.
    pub quad_mask: u32,
}

/// The store itself. One table per instrument family plus the EPICS
/// index-to-name mapping.
#[derive(Default)]
pub struct ConfigStore {
    acqiris: RwLock<HashMap<u32, AcqirisConfig>>,
    tdc: RwLock<HashMap<u32, TdcConfig>>,
    pnccd: RwLock<HashMap<u32, PnccdConfig>>,
    cspad: RwLock<HashMap<u32, CspadConfig>>,
    epics_names: RwLock<HashMap<u16, String>>,
}

impl ConfigStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> ConfigStore {
        ConfigStore::default()
    }

    /// Publishes the digitizer configuration of `src`.
    pub fn put_acqiris(&self, src: u32, config: AcqirisConfig) {
        self.acqiris.write().expect("config store poisoned").insert(src, config);
    }

    /// The digitizer configuration of `src`, if seen.
    pub fn acqiris(&self, src: u32) -> Option<AcqirisConfig> {
        self.acqiris.read().expect("config store poisoned").get(&src).copied()
    }

    /// Publishes the TDC configuration of `src`.
    pub fn put_tdc(&self, src: u32, config: TdcConfig) {
        self.tdc.write().expect("config store poisoned").insert(src, config);
    }

    /// The TDC configuration of `src`, if seen.
    pub fn tdc(&self, src: u32) -> Option<TdcConfig> {
        self.tdc.read().expect("config store poisoned").get(&src).copied()
    }

    /// Publishes the pnCCD configuration of `src`.
    pub fn put_pnccd(&self, src: u32, config: PnccdConfig) {
        self.pnccd.write().expect("config store poisoned").insert(src, config);
    }

    /// The pnCCD configuration of `src`, if seen.
    pub fn pnccd(&self, src: u32) -> Option<PnccdConfig> {
        self.pnccd.read().expect("config store poisoned").get(&src).cloned()
    }

    /// Publishes the CsPad configuration of `src`.
    pub fn put_cspad(&self, src: u32, config: CspadConfig) {
        self.cspad.write().expect("config store poisoned").insert(src, config);
    }

    /// The CsPad configuration of `src`, if seen.
    pub fn cspad(&self, src: u32) -> Option<CspadConfig> {
        self.cspad.read().expect("config store poisoned").get(&src).copied()
    }

    /// Publishes the name of EPICS index `index`.
    pub fn put_epics_name(&self, index: u16, name: String) {
        self.epics_names.write().expect("config store poisoned").insert(index, name);
    }

    /// The name of EPICS index `index`, if announced.
    pub fn epics_name(&self, index: u16) -> Option<String> {
        self.epics_names.read().expect("config store poisoned").get(&index).cloned()
    }
}
