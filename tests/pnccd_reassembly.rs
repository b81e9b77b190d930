//! Reassembly of the four pnCCD quarter frames into one 1024x1024 frame.

mod common;

use cass::conversion::pnccd;
use cass::event::DeviceKind;
use cass::input::generator::{build_datagram, build_node};
use cass::xtc::{Src, TransitionId, TypeKind};

#[test]
fn quadrants_land_in_their_corners_with_status_bits_masked() {
    let registry = common::full_registry();
    let src = Src::detector(0, 0, 6, 0);

    // configuration first: full-frame camera, 512x512 segments
    let config = build_datagram(
        TransitionId::Configure,
        1000,
        0,
        &[build_node(
            TypeKind::PnccdConfig,
            2,
            src,
            &pnccd::encode_config_v2(1024, 1024, 512, 512, 0),
        )],
    );
    common::decode(&config, &registry);

    // segment 0 carries the two status bits on top of value 1
    let seg0 = vec![0x4001u16; 512 * 512];
    let seg1 = vec![0x0002u16; 512 * 512];
    let seg2 = vec![0x0003u16; 512 * 512];
    let seg3 = vec![0x0004u16; 512 * 512];
    let frame = pnccd::encode_frame(&[&seg0, &seg1, &seg2, &seg3]);
    let shot = build_datagram(
        TransitionId::L1Accept,
        1000,
        3,
        &[build_node(TypeKind::PnccdFrame, 1, src, &frame)],
    );
    let event = common::decode(&shot, &registry);

    let device = event.pixel_detectors(DeviceKind::PixelDetectors).unwrap();
    let det = device.dets.values().next().unwrap();
    assert_eq!(det.shape(), (1024, 1024));
    assert_eq!(det.frame.len(), 1024 * 1024);

    let pixel = |col: usize, row: usize| det.frame[row * 1024 + col] as u16;
    // upper left quadrant comes from segment 0, status bits masked off
    assert_eq!(pixel(0, 0), 0x0001);
    assert_eq!(pixel(511, 511), 0x0001);
    // upper right from segment 3
    assert_eq!(pixel(512, 0), 0x0004);
    assert_eq!(pixel(1023, 511), 0x0004);
    // lower left from segment 1, reversed
    assert_eq!(pixel(0, 512), 0x0002);
    assert_eq!(pixel(511, 1023), 0x0002);
    // lower right from segment 2, reversed
    assert_eq!(pixel(512, 512), 0x0003);
    assert_eq!(pixel(1023, 1023), 0x0003);
}
