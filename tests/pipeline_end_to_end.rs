//! The whole pipeline over the synthetic generator: decode, analyse,
//! persist.

use cass::input::generator::DataGenerator;
use cass::pipeline::{self, PipelineOptions};
use cass::settings::Settings;

#[test]
fn generator_run_drains_cleanly_and_persists_frames() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("shots");

    let settings = Settings::from_str(&format!(
        r#"
[Input]
NbrOfEvents = 12
WaveformSamples = 64
FrameColumns = 16
FrameRows = 16

[PostProcessor.img]
Kind = "image"
Device = "CCD"
# the digitizer claims dense id 0, the camera is the second source seen
DetectorId = 1
XNbrBins = 16
XUp = 16.0
YNbrBins = 16
YUp = 16.0

[PostProcessor.img_sum]
Kind = "statistics"
HistName = "img"
Statistic = "sum"

[PostProcessor.bright]
Kind = "operation_constant"
HistName = "img_sum"
Operation = ">"
Value = 20000.0

[PostProcessor.dump]
Kind = "cbf_writer"
HistName = "img"
DarkName = "img"
FileBaseName = "{}"
ConditionName = "bright"
"#,
        base.display()
    ))
    .unwrap();

    let source = Box::new(DataGenerator::from_settings(&settings));
    let options = PipelineOptions {
        partition: None,
        nbr_shm_buffers: 4,
        shm_buffer_size: 1 << 20,
        nbr_clients: 1,
        workers: 2,
        control_addr: None,
    };
    pipeline::run(settings, source, &options).unwrap();

    // every shot clears the brightness gate (16x16 background of 100 plus
    // the spot), so every event id produced one frame plus the dark
    let written: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    let frames = written.iter().filter(|n| n.starts_with("shots_")).count();
    assert!(frames >= 12, "only {frames} files written: {written:?}");
    assert!(written.iter().any(|n| n == "shots_Dark.cbf"));
}
