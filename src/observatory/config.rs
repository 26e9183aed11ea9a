//! Observatory configuration, in degrees and seconds.
//!
//! Defaults are the reference values of an 8-m class survey telescope.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::activity::{Activity, default_prerequisites};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ObservatoryConfig {
    pub telescope: TelescopeConfig,
    pub rotator: RotatorConfig,
    pub dome: DomeConfig,
    pub optics: OpticsConfig,
    pub camera: CameraConfig,
    pub park: ParkConfig,
    pub slew: SlewConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TelescopeConfig {
    pub altitude_minpos: f64,
    pub altitude_maxpos: f64,
    pub azimuth_minpos: f64,
    pub azimuth_maxpos: f64,
    pub altitude_maxspeed: f64,
    pub altitude_accel: f64,
    pub altitude_decel: f64,
    pub azimuth_maxspeed: f64,
    pub azimuth_accel: f64,
    pub azimuth_decel: f64,
    pub settle_time: f64,
}

impl Default for TelescopeConfig {
    fn default() -> Self {
        Self {
            altitude_minpos: 20.0,
            altitude_maxpos: 86.5,
            azimuth_minpos: -270.0,
            azimuth_maxpos: 270.0,
            altitude_maxspeed: 3.5,
            altitude_accel: 3.5,
            altitude_decel: 3.5,
            azimuth_maxspeed: 7.0,
            azimuth_accel: 7.0,
            azimuth_decel: 7.0,
            settle_time: 3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RotatorConfig {
    pub minpos: f64,
    pub maxpos: f64,
    pub maxspeed: f64,
    pub accel: f64,
    pub decel: f64,
    /// Keep the camera fixed on the sky; otherwise it stays put relative
    /// to the telescope.
    pub follow_sky: bool,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            minpos: -90.0,
            maxpos: 90.0,
            maxspeed: 3.5,
            accel: 1.0,
            decel: 1.0,
            follow_sky: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DomeConfig {
    pub altitude_maxspeed: f64,
    pub altitude_accel: f64,
    pub altitude_decel: f64,
    pub azimuth_maxspeed: f64,
    pub azimuth_accel: f64,
    pub azimuth_decel: f64,
    pub settle_time: f64,
}

impl Default for DomeConfig {
    fn default() -> Self {
        Self {
            altitude_maxspeed: 1.75,
            altitude_accel: 0.875,
            altitude_decel: 0.875,
            azimuth_maxspeed: 1.5,
            azimuth_accel: 0.75,
            azimuth_decel: 0.75,
            settle_time: 1.0,
        }
    }
}

/// Active optics correction after an altitude change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct OpticsConfig {
    /// Open-loop correction, seconds per degree of altitude change.
    pub ol_slope: f64,
    /// Closed-loop delay for each altitude-change band in `cl_alt_limit`.
    pub cl_delay: Vec<f64>,
    /// Band edges in degrees; one more entry than `cl_delay`.
    pub cl_alt_limit: Vec<f64>,
}

impl Default for OpticsConfig {
    fn default() -> Self {
        Self {
            ol_slope: 1.0 / 3.5,
            cl_delay: vec![0.0, 36.0],
            cl_alt_limit: vec![0.0, 9.0, 90.0],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CameraConfig {
    pub readout_time: f64,
    pub shutter_time: f64,
    pub filter_change_time: f64,
    pub filter_max_changes_burst_num: usize,
    pub filter_max_changes_burst_time: f64,
    pub filter_max_changes_avg_num: usize,
    pub filter_max_changes_avg_time: f64,
    pub filter_mounted: Vec<String>,
    /// Mounted filters that may be exchanged for the dark-time filter.
    pub filter_removable: Vec<String>,
    pub filter_unmounted: Vec<String>,
    pub filter_darktime: String,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            readout_time: 2.0,
            shutter_time: 1.0,
            filter_change_time: 120.0,
            filter_max_changes_burst_num: 1,
            filter_max_changes_burst_time: 0.0,
            filter_max_changes_avg_num: 30_000,
            filter_max_changes_avg_time: 365.25 * 86_400.0,
            filter_mounted: ["g", "r", "i", "z", "y"].map(String::from).to_vec(),
            filter_removable: ["y", "z"].map(String::from).to_vec(),
            filter_unmounted: vec!["u".to_string()],
            filter_darktime: "u".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ParkConfig {
    pub telescope_altitude: f64,
    pub telescope_azimuth: f64,
    pub telescope_rotator: f64,
    pub dome_altitude: f64,
    pub dome_azimuth: f64,
    pub filter_position: String,
}

impl Default for ParkConfig {
    fn default() -> Self {
        Self {
            telescope_altitude: 86.5,
            telescope_azimuth: 0.0,
            telescope_rotator: 0.0,
            dome_altitude: 90.0,
            dome_azimuth: 0.0,
            filter_position: "z".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SlewConfig {
    /// Activity → activities that must finish before it starts.
    pub prerequisites: BTreeMap<Activity, Vec<Activity>>,
}

impl Default for SlewConfig {
    fn default() -> Self {
        Self {
            prerequisites: default_prerequisites(),
        }
    }
}
