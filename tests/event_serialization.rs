//! Serialize/deserialize identity over a fully populated decoded event.

mod common;

use cass::event::CassEvent;
use cass::input::generator::DataGenerator;
use cass::input::{InputSource, InputState};
use cass::settings::Settings;
use cass::xtc::Datagram;
use cass::xtc::walker::{walk, WalkResult};

#[test]
fn decoded_devices_survive_a_serialization_roundtrip() {
    let registry = common::full_registry();
    let settings = Settings::from_str(
        r#"
[Input]
NbrOfEvents = 2
WaveformSamples = 32
FrameColumns = 8
FrameRows = 8
"#,
    )
    .unwrap();
    let mut generator = DataGenerator::from_settings(&settings);
    let mut buffer = vec![0u8; 1 << 20];
    let mut event = CassEvent::allocate(1 << 20);

    // run the configure transition and the first shot through the decoder
    loop {
        match generator.next(&mut buffer).unwrap() {
            InputState::Datagram(len) => {
                let datagram = Datagram::parse(&buffer[..len]).unwrap();
                let is_shot = datagram.is_l1_accept();
                event.reset();
                event.set_id(datagram.event_id());
                assert_eq!(walk(&datagram.root, &registry, &mut event), WalkResult::Continue);
                if is_shot {
                    break;
                }
            }
            other => panic!("generator ended early: {other:?}"),
        }
    }
    assert!(!event.device_kinds().is_empty());

    let mut bytes = Vec::new();
    event.serialize(&mut bytes).unwrap();
    let mut copy = CassEvent::allocate(16);
    copy.deserialize(&mut bytes.as_slice()).unwrap();

    assert_eq!(copy.id(), event.id());
    assert_eq!(copy.device_kinds(), event.device_kinds());

    // waveforms and machine values came through bit for bit
    let original = event.acqiris().unwrap();
    let restored = copy.acqiris().unwrap();
    for (key, instrument) in &original.instruments {
        let restored = &restored.instruments[key];
        for (a, b) in instrument.channels.iter().zip(&restored.channels) {
            assert_eq!(a.waveform, b.waveform);
            assert!((a.gain - b.gain).abs() < f64::EPSILON);
        }
    }
    let md_a = event.machine_data().unwrap();
    let md_b = copy.machine_data().unwrap();
    assert_eq!(md_a.beamline.len(), md_b.beamline.len());
    assert!((md_a.photon_energy_ev - md_b.photon_energy_ev).abs() < f64::EPSILON);
}
