//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use cass::conversion::store::ConfigStore;
use cass::conversion::{register_all, CassIdMap, ConverterRegistry};
use cass::event::CassEvent;
use cass::processing::{GraphContext, ProcessorGraph};
use cass::settings::Settings;
use cass::xtc::walker::{walk, WalkResult};
use cass::xtc::Datagram;

/// A converter registry with every family active and a fresh store.
pub fn full_registry() -> ConverterRegistry {
    let settings = Settings::empty();
    let store = Arc::new(ConfigStore::new());
    let ids = Arc::new(CassIdMap::new());
    register_all(&settings, &store, &ids)
}

/// Decodes one datagram into a fresh event, asserting a clean walk.
pub fn decode(datagram: &[u8], registry: &ConverterRegistry) -> CassEvent {
    let mut event = CassEvent::allocate(datagram.len().max(4096));
    event.datagram_mut()[..datagram.len()].copy_from_slice(datagram);
    event.set_datagram_len(datagram.len());

    let parsed = Datagram::parse(datagram).expect("datagram parses");
    event.set_id(parsed.event_id());
    assert_eq!(walk(&parsed.root, registry, &mut event), WalkResult::Continue);
    event
}

/// Loads a graph from a TOML string with a single worker.
pub fn load_graph(toml: &str) -> ProcessorGraph {
    let settings = Settings::from_str(toml).expect("settings parse");
    ProcessorGraph::load(&settings, &GraphContext::new(), 1).expect("graph loads")
}

/// Runs every node of `graph` on `event` and releases it again.
pub fn run_event(graph: &ProcessorGraph, event: &CassEvent) {
    graph.process_event(event, &AtomicBool::new(false));
    graph.release_event(event.id());
}
