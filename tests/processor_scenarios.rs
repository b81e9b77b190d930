//! Processor graph scenarios driven end to end from decoded datagrams.

mod common;

use cass::conversion::acqiris;
use cass::input::generator::{build_datagram, build_node};
use cass::xtc::{Src, TransitionId, TypeKind};

/// Decodes a two-channel digitizer shot with the given waveforms.
fn digitizer_event(
    registry: &cass::conversion::ConverterRegistry,
    one: &[i16],
    two: &[i16],
) -> cass::event::CassEvent {
    let src = Src::detector(1, 0, 2, 0);
    let config = build_datagram(
        TransitionId::Configure,
        500,
        0,
        &[build_node(
            TypeKind::AcqConfig,
            1,
            src,
            &acqiris::encode_config(2, one.len() as u32, 1e-9),
        )],
    );
    common::decode(&config, registry);

    let mut payload = Vec::new();
    acqiris::encode_channel(&mut payload, 1.0, 0.0, 0.0, one);
    acqiris::encode_channel(&mut payload, 1.0, 0.0, 0.0, two);
    let shot = build_datagram(
        TransitionId::L1Accept,
        500,
        3,
        &[build_node(TypeKind::AcqWaveform, 1, src, &payload)],
    );
    common::decode(&shot, registry)
}

#[test]
fn binary_operation_adds_two_waveforms() {
    let registry = common::full_registry();
    let event = digitizer_event(&registry, &[1, 2, 3, 4], &[4, 3, 2, 1]);

    let graph = common::load_graph(
        r#"
[PostProcessor.one]
Kind = "waveform"
InstrumentId = 0
ChannelNbr = 0
XNbrBins = 4
XUp = 4.0

[PostProcessor.two]
Kind = "waveform"
InstrumentId = 0
ChannelNbr = 1
XNbrBins = 4
XUp = 4.0

[PostProcessor.sum]
Kind = "operation"
HistOne = "one"
HistTwo = "two"
Operation = "+"
"#,
    );
    common::run_event(&graph, &event);

    let result = graph.find("sum").unwrap().latest();
    let result = result.read().unwrap();
    assert_eq!(result.bins(), &[5.0, 5.0, 5.0, 5.0]);
    assert_eq!(result.fills(), 1);
}

#[test]
fn false_condition_yields_the_zero_result() {
    let registry = common::full_registry();
    let event = digitizer_event(&registry, &[5, 15, 10, 11], &[0, 0, 0, 0]);

    let graph = common::load_graph(
        r#"
[PostProcessor.wave]
Kind = "waveform"
InstrumentId = 0
ChannelNbr = 0
XNbrBins = 4
XUp = 4.0

[PostProcessor.pp40]
Kind = "threshold"
HistName = "wave"
Threshold = 10.0
ConditionName = "DefaultFalseHist"
"#,
    );
    graph.process_event(&event, &std::sync::atomic::AtomicBool::new(false));

    let node = graph.find("pp40").unwrap();
    let result = node.result(event.id()).unwrap();
    let result = result.read().unwrap();
    assert_eq!(result.bins(), &[0.0, 0.0, 0.0, 0.0]);
    assert_eq!(result.fills(), 0);
    graph.release_event(event.id());
}

#[test]
fn energy_remap_preserves_the_active_range_content() {
    let registry = common::full_registry();
    let event = digitizer_event(
        &registry,
        &[0, 0, 10, 20, 30, 20, 10, 0],
        &[0, 0, 0, 0, 0, 0, 0, 0],
    );

    let graph = common::load_graph(
        r#"
[PostProcessor.tof]
Kind = "waveform"
InstrumentId = 0
ChannelNbr = 0
XNbrBins = 8
XUp = 8.0

[PostProcessor.energy]
Kind = "tof_to_energy"
HistName = "tof"
TofLow = 2.0
TofUp = 7.0
alpha = 1.0
t0 = 0.0
e0 = 0.0
NbrBins = 4
"#,
    );
    common::run_event(&graph, &event);

    let result = graph.find("energy").unwrap().latest();
    let result = result.read().unwrap();
    let remapped: f64 = result.bins().iter().sum();
    assert!(
        float_cmp::approx_eq!(f64, remapped, 90.0, epsilon = 1e-6),
        "content changed in the remap: {remapped}"
    );
}

#[test]
fn threshold_zeroes_bins_at_or_below_the_level() {
    let registry = common::full_registry();
    let event = digitizer_event(&registry, &[5, 15, 10, 11], &[0, 0, 0, 0]);

    let graph = common::load_graph(
        r#"
[PostProcessor.wave]
Kind = "waveform"
InstrumentId = 0
ChannelNbr = 0
XNbrBins = 4
XUp = 4.0

[PostProcessor.clipped]
Kind = "threshold"
HistName = "wave"
Threshold = 10.0
"#,
    );
    common::run_event(&graph, &event);

    let result = graph.find("clipped").unwrap().latest();
    let result = result.read().unwrap();
    assert_eq!(result.bins(), &[0.0, 15.0, 0.0, 11.0]);
}
