//! Converters that populate events from XTC payloads.
//!
//! A converter is registered for a list of (type, version) pairs. The
//! registry dispatches each leaf node the walker hands it to the converter
//! responsible for it; unknown pairs are warned about once. Configuration
//! payloads are buffered in a process-wide [`store::ConfigStore`] keyed by
//! the XTC physical id; data converters read the store to lay out their
//! payloads.

pub mod acqiris;
pub mod acqiristdc;
pub mod camera;
pub mod cspad;
pub mod machine;
pub mod pnccd;
pub mod store;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use itertools::Itertools;
use log::{error, warn};
use thiserror::Error;

use crate::event::CassEvent;
use crate::settings::Settings;
use crate::xtc::{TypeKind, XtcNode};
use store::ConfigStore;

/// Errors raised inside a converter.
#[derive(Error, Debug)]
pub enum ConversionError {
    /// The payload is smaller than the structure it should contain.
    #[error("{converter}: payload of {have} bytes is too small, need {need}")]
    PayloadTooSmall {
        /// The converter that rejected the payload.
        converter: &'static str,
        /// Bytes required.
        need: usize,
        /// Bytes present.
        have: usize,
    },

    /// A data payload arrived before its configuration transition.
    #[error("{converter}: no configuration seen yet for source {src:#010x}")]
    MissingConfig {
        /// The converter that could not find its configuration.
        converter: &'static str,
        /// Physical id of the source.
        src: u32,
    },

    /// The payload disagrees with the buffered configuration.
    #[error("{converter}: {reason}")]
    Inconsistent {
        /// The converter that found the inconsistency.
        converter: &'static str,
        /// What did not add up.
        reason: String,
    },
}

/// A format converter for one family of payloads.
pub trait Converter: Send + Sync {
    /// The (type, version) pairs this converter handles.
    fn type_list(&self) -> Vec<(TypeKind, u16)>;

    /// Extracts the payload of `node` into `event` (or into the config
    /// store, for configuration types).
    fn convert(&self, node: &XtcNode, event: &mut CassEvent) -> Result<(), ConversionError>;
}

/// Translation of wire-level (type, physical id) pairs to dense process-wide
/// ids that downstream processors refer to.
///
/// Pairs can be pinned in the settings; unseen pairs are assigned the next
/// free id in arrival order, which is deterministic for a serial decoder.
pub struct CassIdMap {
    map: RwLock<HashMap<(u16, u32), u32>>,
    next: Mutex<u32>,
}

impl CassIdMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> CassIdMap {
        CassIdMap {
            map: RwLock::new(HashMap::new()),
            next: Mutex::new(0),
        }
    }

    /// Creates a map with the pairs pinned in the `Converter` settings group
    /// (array `Detectors` of tables with `Type`, `PhysicalId`, `CassId`).
    #[must_use]
    pub fn from_settings(converter_settings: &Settings) -> CassIdMap {
        let ids = CassIdMap::new();
        let mut highest: Option<u32> = None;
        for entry in converter_settings.value_list("Detectors") {
            // entries are "Type/PhysicalId/CassId" triples in string form
            let fields = entry
                .split('/')
                .collect_tuple()
                .map(|(kind, phy, cass)| {
                    (kind.parse::<u16>().ok(), parse_u32(phy), parse_u32(cass))
                });
            match fields {
                Some((Some(kind), Some(phy), Some(cass))) => {
                    ids.map.write().expect("id map poisoned").insert((kind, phy), cass);
                    highest = Some(highest.map_or(cass, |h| h.max(cass)));
                }
                _ => warn!("ignoring malformed Detectors entry '{entry}'"),
            }
        }
        if let Some(h) = highest {
            *ids.next.lock().expect("id counter poisoned") = h + 1;
        }
        ids
    }

    /// The dense id of a (type, physical id) pair, assigning one on first
    /// sight.
    pub fn resolve(&self, kind: TypeKind, phy: u32) -> u32 {
        let key = (kind as u16, phy);
        if let Some(&id) = self.map.read().expect("id map poisoned").get(&key) {
            return id;
        }
        let mut map = self.map.write().expect("id map poisoned");
        if let Some(&id) = map.get(&key) {
            return id;
        }
        let mut next = self.next.lock().expect("id counter poisoned");
        let id = *next;
        *next += 1;
        map.insert(key, id);
        id
    }
}

impl Default for CassIdMap {
    fn default() -> Self {
        CassIdMap::new()
    }
}

fn parse_u32(text: &str) -> Option<u32> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

/// The set of converters in use, keyed by (type, version).
pub struct ConverterRegistry {
    used: HashMap<(u16, u16), Arc<dyn Converter>>,
    unknown_warned: Mutex<HashSet<(u16, u16)>>,
}

impl ConverterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> ConverterRegistry {
        ConverterRegistry {
            used: HashMap::new(),
            unknown_warned: Mutex::new(HashSet::new()),
        }
    }

    /// Registers `converter` for every pair of its type list.
    pub fn register(&mut self, converter: Arc<dyn Converter>) {
        for (kind, version) in converter.type_list() {
            self.used.insert((kind as u16, version), Arc::clone(&converter));
        }
    }

    /// True when a converter is registered for (kind, version).
    #[must_use]
    pub fn handles(&self, kind: TypeKind, version: u16) -> bool {
        self.used.contains_key(&(kind as u16, version))
    }

    /// Dispatches a leaf node to its converter.
    ///
    /// Unknown (type, version) pairs are warned about once and skipped.
    /// Converter errors are local to the node: they are logged with the
    /// event id and the subtree is skipped.
    pub fn dispatch(&self, node: &XtcNode, event: &mut CassEvent) {
        let key = (node.type_id.kind_value(), node.type_id.version());
        match self.used.get(&key) {
            Some(converter) => {
                if let Err(err) = converter.convert(node, event) {
                    error!("event {}: {err}", event.id());
                }
            }
            None => {
                let mut warned = self.unknown_warned.lock().expect("warn set poisoned");
                if warned.insert(key) {
                    warn!(
                        "no converter for type {:?} version {}, skipping",
                        node.type_id.kind(),
                        key.1
                    );
                }
            }
        }
    }
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        ConverterRegistry::new()
    }
}

/// Builds the registry from the `Converter` settings group.
///
/// The `Used` key lists the converter families to activate; it defaults to
/// all of them. Registration order is deterministic.
#[must_use]
pub fn register_all(
    settings: &Settings,
    store: &Arc<ConfigStore>,
    ids: &Arc<CassIdMap>,
) -> ConverterRegistry {
    let group = settings.group("Converter");
    let mut used = group.value_list("Used");
    if used.is_empty() {
        used = ["Acqiris", "AcqirisTDC", "pnCCD", "CsPad", "CCD", "Machine"]
            .iter()
            .map(|s| (*s).to_string())
            .collect();
    }

    let mut registry = ConverterRegistry::new();
    for name in used {
        match name.as_str() {
            "Acqiris" => registry.register(Arc::new(acqiris::AcqirisConverter::new(
                Arc::clone(store),
                Arc::clone(ids),
            ))),
            "AcqirisTDC" => registry.register(Arc::new(acqiristdc::AcqirisTdcConverter::new(
                Arc::clone(store),
                Arc::clone(ids),
            ))),
            "pnCCD" => registry.register(Arc::new(pnccd::PnccdConverter::new(
                Arc::clone(store),
                Arc::clone(ids),
            ))),
            "CsPad" => registry.register(Arc::new(cspad::CspadConverter::new(
                Arc::clone(store),
                Arc::clone(ids),
            ))),
            "CCD" => registry.register(Arc::new(camera::CameraConverter::new(Arc::clone(ids)))),
            "Machine" => registry.register(Arc::new(machine::MachineConverter::new(
                Arc::clone(store),
            ))),
            other => warn!("converter family '{other}' is unknown, ignored"),
        }
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cass_ids_are_dense_in_arrival_order() {
        let ids = CassIdMap::new();
        let a = ids.resolve(TypeKind::PnccdFrame, 0x1100);
        let b = ids.resolve(TypeKind::PnccdFrame, 0x2200);
        let c = ids.resolve(TypeKind::Frame, 0x1100);
        assert_eq!((a, b, c), (0, 1, 2));
        // resolving again yields the same ids
        assert_eq!(ids.resolve(TypeKind::PnccdFrame, 0x2200), 1);
    }

    #[test]
    fn pinned_ids_win_over_assignment() {
        let settings = Settings::from_str(
            r#"
[Converter]
Detectors = ["11/0x1100/5"]
"#,
        )
        .unwrap();
        let ids = CassIdMap::from_settings(&settings.group("Converter"));
        assert_eq!(ids.resolve(TypeKind::PnccdFrame, 0x1100), 5);
        // the next free id continues after the pinned ones
        assert_eq!(ids.resolve(TypeKind::PnccdFrame, 0x9900), 6);
    }
}
