//! Synthetic datagram generator.
//!
//! Builds well-formed datagrams without a detector: a configure transition
//! announcing a digitizer and a camera, followed by per-shot triggers
//! carrying a noisy sine waveform, a camera frame with a travelling bright
//! spot and electron beam values. Useful for demos and end-to-end tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::conversion::{acqiris, camera, machine};
use crate::settings::Settings;
use crate::xtc::{
    Level, RawDatagramHeader, RawXtcHeader, Src, TransitionId, TypeId, TypeKind,
    DATAGRAM_HEADER_SIZE, XTC_HEADER_SIZE,
};

use super::{InputError, InputSource, InputState};

/// Serializes one leaf node.
#[must_use]
pub fn build_node(kind: TypeKind, version: u16, src: Src, payload: &[u8]) -> Vec<u8> {
    let header = RawXtcHeader {
        type_id: TypeId::new(kind, version).0,
        damage: 0,
        src_level: src.level as u32,
        src_phy: src.phy,
        payload_size: payload.len() as u32,
    };
    let mut out = header.to_bytes().to_vec();
    out.extend_from_slice(payload);
    out
}

/// Serializes a whole datagram: header, root container, children.
#[must_use]
pub fn build_datagram(
    service: TransitionId,
    seconds: u32,
    fiducials: u32,
    children: &[Vec<u8>],
) -> Vec<u8> {
    let payload: Vec<u8> = children.iter().flatten().copied().collect();
    let header = RawDatagramHeader {
        seconds: seconds.to_le(),
        nanoseconds: 0,
        fiducials: fiducials.to_le(),
        service: (service as u32).to_le(),
        env: 0,
        reserved: 0,
    };
    let mut out = bytemuck::bytes_of(&header).to_vec();
    let root = RawXtcHeader {
        type_id: TypeId::new(TypeKind::Xtc, 1).0,
        damage: 0,
        src_level: Level::Control as u32,
        src_phy: 0,
        payload_size: payload.len() as u32,
    };
    out.extend_from_slice(&root.to_bytes());
    out.extend_from_slice(&payload);
    debug_assert!(out.len() >= DATAGRAM_HEADER_SIZE + XTC_HEADER_SIZE);
    out
}

/// The generator source.
pub struct DataGenerator {
    nbr_of_events: u64,
    produced: u64,
    seconds: u32,
    fiducials: u32,
    waveform_samples: usize,
    frame_columns: u32,
    frame_rows: u32,
    rng: StdRng,
    digitizer_src: Src,
    camera_src: Src,
}

impl DataGenerator {
    /// Reads `NbrOfEvents`, `WaveformSamples`, `FrameColumns`, `FrameRows`
    /// from the `Input` settings group.
    #[must_use]
    pub fn from_settings(settings: &Settings) -> DataGenerator {
        let input = settings.group("Input");
        DataGenerator {
            nbr_of_events: input.value_usize("NbrOfEvents", 100) as u64,
            produced: 0,
            seconds: 1_600_000_000,
            fiducials: 0,
            waveform_samples: input.value_usize("WaveformSamples", 256),
            frame_columns: input.value_usize("FrameColumns", 64) as u32,
            frame_rows: input.value_usize("FrameRows", 64) as u32,
            rng: StdRng::seed_from_u64(input.value_usize("Seed", 7) as u64),
            digitizer_src: Src::detector(1, 0, 2, 0),
            camera_src: Src::detector(3, 0, 4, 0),
        }
    }

    fn configure(&self) -> Vec<u8> {
        let acq_config = acqiris::encode_config(1, self.waveform_samples as u32, 1e-9);
        build_datagram(
            TransitionId::Configure,
            self.seconds,
            self.fiducials,
            &[build_node(TypeKind::AcqConfig, 1, self.digitizer_src, &acq_config)],
        )
    }

    fn shot(&mut self) -> Vec<u8> {
        // noisy sine burst
        let samples: Vec<i16> = (0..self.waveform_samples)
            .map(|i| {
                let phase = i as f64 / 16.0;
                let noise: f64 = self.rng.gen_range(-20.0..20.0);
                (1000.0 * phase.sin() + noise) as i16
            })
            .collect();
        let mut waveform = Vec::new();
        acqiris::encode_channel(&mut waveform, 0.001, 0.0, 0.0, &samples);

        // camera frame with a travelling bright spot
        let (cols, rows) = (self.frame_columns, self.frame_rows);
        let spot = (self.produced % u64::from(cols.min(rows))) as u32;
        let pixels: Vec<u16> = (0..rows)
            .flat_map(|row| {
                (0..cols).map(move |col| {
                    let base = 100u16;
                    if row == spot && col == spot {
                        4000
                    } else {
                        base
                    }
                })
            })
            .collect();
        let frame = camera::encode_frame(cols, rows, 0, &pixels);

        let l3_energy: f64 = 13600.0 + self.rng.gen_range(-50.0..50.0);
        let pk_current: f64 = 500.0 + self.rng.gen_range(-25.0..25.0);
        let ebeam = machine::encode_ebeam(l3_energy, pk_current);

        build_datagram(
            TransitionId::L1Accept,
            self.seconds,
            self.fiducials,
            &[
                build_node(TypeKind::AcqWaveform, 1, self.digitizer_src, &waveform),
                build_node(TypeKind::Frame, 1, self.camera_src, &frame),
                build_node(
                    TypeKind::EBeam,
                    1,
                    Src {
                        level: Level::Reporter,
                        phy: 0,
                    },
                    &ebeam,
                ),
            ],
        )
    }
}

impl InputSource for DataGenerator {
    fn next(&mut self, buffer: &mut [u8]) -> Result<InputState, InputError> {
        if self.produced > self.nbr_of_events {
            return Ok(InputState::EndOfStream);
        }
        let datagram = if self.produced == 0 {
            self.configure()
        } else {
            // the fiducial counter advances at the machine rate
            self.fiducials = (self.fiducials + 3) % crate::FIDUCIAL_MODULO;
            if self.fiducials == 0 {
                self.seconds += 1;
            }
            self.shot()
        };
        self.produced += 1;

        if datagram.len() > buffer.len() {
            return Err(InputError::DatagramTooLarge {
                size: datagram.len(),
                capacity: buffer.len(),
            });
        }
        buffer[..datagram.len()].copy_from_slice(&datagram);
        Ok(InputState::Datagram(datagram.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xtc::Datagram;

    #[test]
    fn generated_datagrams_parse() {
        let settings = Settings::from_str(
            r#"
[Input]
NbrOfEvents = 3
WaveformSamples = 32
FrameColumns = 8
FrameRows = 8
"#,
        )
        .unwrap();
        let mut generator = DataGenerator::from_settings(&settings);
        let mut buffer = vec![0u8; 1 << 20];

        // first the configure transition, then the shots
        let len = match generator.next(&mut buffer).unwrap() {
            InputState::Datagram(len) => len,
            other => panic!("unexpected state {other:?}"),
        };
        let datagram = Datagram::parse(&buffer[..len]).unwrap();
        assert_eq!(datagram.service, TransitionId::Configure);

        let mut shots = 0;
        loop {
            match generator.next(&mut buffer).unwrap() {
                InputState::Datagram(len) => {
                    let datagram = Datagram::parse(&buffer[..len]).unwrap();
                    assert!(datagram.is_l1_accept());
                    shots += 1;
                }
                InputState::EndOfStream => break,
                InputState::Outdated => unreachable!(),
            }
        }
        assert_eq!(shots, 3);
    }
}
