//! Machine data payload: beamline values, EPICS values and quantities
//! derived from them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::serializer::Serializable;

/// Beamline and EPICS values of one shot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineDataDevice {
    /// Beamline data keyed by name.
    pub beamline: BTreeMap<String, f64>,

    /// EPICS process variables keyed by name.
    pub epics: BTreeMap<String, f64>,

    /// Photon energy in eV, derived from the electron beam values.
    pub photon_energy_ev: f64,

    /// Photon wavelength in nm, derived from the photon energy.
    pub wavelength_nm: f64,
}

impl MachineDataDevice {
    /// Recomputes the derived photon energy and wavelength from the electron
    /// beam values.
    ///
    /// Missing inputs leave the derived fields at their previous value.
    pub fn compute_derived(&mut self) {
        let (pk_current, l3_energy) = match (
            self.beamline.get("EbeamPkCurrBC2"),
            self.beamline.get("EbeamL3Energy"),
        ) {
            (Some(&pk), Some(&l3)) => (pk, 0.001 * l3),
            _ => return,
        };
        let e1 = l3_energy
            - 0.0016293 * pk_current
            - 0.0005 * (0.63 * l3_energy + 0.0003 * pk_current);
        self.photon_energy_ev = 44.42 * e1 * e1;
        if self.photon_energy_ev > 0.0 {
            // lambda[nm] = h*c / E, with h*c = 1239.8419 eV nm
            self.wavelength_nm = 1239.841_9 / self.photon_energy_ev;
        }
    }
}

impl Serializable for MachineDataDevice {
    const VERSION: u16 = 1;
    const NAME: &'static str = "MachineDataDevice";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_values_follow_the_beam_parameters() {
        let mut md = MachineDataDevice::default();
        md.beamline.insert("EbeamPkCurrBC2".to_string(), 500.0);
        md.beamline.insert("EbeamL3Energy".to_string(), 13600.0);
        md.compute_derived();

        let l3 = 0.001 * 13600.0;
        let e1 = l3 - 0.0016293 * 500.0 - 0.0005 * (0.63 * l3 + 0.0003 * 500.0);
        assert!((md.photon_energy_ev - 44.42 * e1 * e1).abs() < 1e-9);
        assert!(md.wavelength_nm > 0.0);
    }

    #[test]
    fn missing_inputs_keep_previous_values() {
        let mut md = MachineDataDevice {
            photon_energy_ev: 1200.0,
            wavelength_nm: 1.03,
            ..MachineDataDevice::default()
        };
        md.compute_derived();
        assert!((md.photon_energy_ev - 1200.0).abs() < f64::EPSILON);
        assert!((md.wavelength_nm - 1.03).abs() < f64::EPSILON);
    }
}
