//! A single Gaussian peak on a camera frame yields exactly one table row.

mod common;

use cass::conversion::camera;
use cass::input::generator::{build_datagram, build_node};
use cass::processing::hitfinder::peak_columns;
use cass::xtc::{Src, TransitionId, TypeKind};

const COLS: usize = 1024;
const ROWS: usize = 512;

#[test]
fn one_gaussian_gives_one_row_with_a_sharp_centroid() {
    let registry = common::full_registry();

    // background 10, Gaussian of height 500 and sigma 1.2 at (200, 200)
    let (peak_col, peak_row, sigma, height) = (200.0, 200.0, 1.2f64, 500.0);
    let pixels: Vec<u16> = (0..ROWS)
        .flat_map(|row| {
            (0..COLS).map(move |col| {
                let dc = col as f64 - peak_col;
                let dr = row as f64 - peak_row;
                let gauss = height * (-(dc * dc + dr * dr) / (2.0 * sigma * sigma)).exp();
                (10.0 + gauss).round() as u16
            })
        })
        .collect();
    let payload = camera::encode_frame(COLS as u32, ROWS as u32, 0, &pixels);
    let shot = build_datagram(
        TransitionId::L1Accept,
        900,
        3,
        &[build_node(
            TypeKind::Frame,
            1,
            Src::detector(3, 0, 4, 0),
            &payload,
        )],
    );
    let event = common::decode(&shot, &registry);

    let graph = common::load_graph(
        r#"
[PostProcessor.img]
Kind = "image"
Device = "CCD"
DetectorId = 0
XNbrBins = 1024
XUp = 1024.0
YNbrBins = 512
YUp = 512.0

[PostProcessor.peaks]
Kind = "peakfind"
HistName = "img"
Threshold = 300.0
MinSignalToNoiseRatio = 20.0
BoxSizeX = 5
BoxSizeY = 5
BraggPeakRadius = 2.0
MinNbrBackgrndPixels = 10
"#,
    );
    common::run_event(&graph, &event);

    let table = graph.find("peaks").unwrap().latest();
    let table = table.read().unwrap();
    assert_eq!(table.table_rows(), 1, "expected exactly one peak");

    let row = table.table_row(0);
    assert!((row[peak_columns::CENTROID_COLUMN] - 200.0).abs() < 0.2);
    assert!((row[peak_columns::CENTROID_ROW] - 200.0).abs() < 0.2);
    let n_pixels = row[peak_columns::NBR_OF_PIXELS];
    assert!((9.0..=25.0).contains(&n_pixels), "peak had {n_pixels} pixels");
    assert!(row[peak_columns::SIGNAL_TO_NOISE] > 20.0);

    // the emitted maximum clears the background by the required ratio
    let floor = row[peak_columns::LOCAL_BACKGROUND]
        + 20.0 * row[peak_columns::LOCAL_BACKGROUND_DEVIATION];
    assert!(row[peak_columns::MAX_ADU] >= floor);
}
