//! Observatory state: where every axis points and which filters are loaded.

use serde::{Deserialize, Serialize};

/// A snapshot of the observatory. Angles in radians, time in epoch seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservatoryState {
    pub time: f64,
    pub ra_rad: f64,
    pub dec_rad: f64,
    pub ang_rad: f64,
    pub filter: String,
    pub tracking: bool,

    pub alt_rad: f64,
    pub az_rad: f64,
    pub pa_rad: f64,
    pub rot_rad: f64,

    pub tel_alt_rad: f64,
    pub tel_az_rad: f64,
    pub tel_rot_rad: f64,
    pub dom_alt_rad: f64,
    pub dom_az_rad: f64,

    pub mounted_filters: Vec<String>,
    pub unmounted_filters: Vec<String>,
}

impl ObservatoryState {
    pub fn is_mounted(&self, filter: &str) -> bool {
        self.mounted_filters.iter().any(|f| f == filter)
    }
}
