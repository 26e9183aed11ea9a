//! Observations reported back by the execution queue.

use serde::{Deserialize, Serialize};

use super::Target;

/// A completed visit, as reported by whatever executed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    /// Id of the target this visit answered, or `<= 0` for unsolicited visits.
    pub target_id: i64,
    pub field_id: u32,
    pub filter: String,
    /// Start of the visit, seconds since the Unix epoch.
    pub time: f64,
    pub ra_rad: f64,
    pub dec_rad: f64,
    pub ang_rad: f64,
    pub exposure_times: Vec<f64>,
}

impl Observation {
    /// The observation that executing `target` as issued would produce.
    pub fn of(target: &Target, time: f64) -> Self {
        Self {
            target_id: target.id,
            field_id: target.field_id,
            filter: target.filter.clone(),
            time,
            ra_rad: target.ra_rad,
            dec_rad: target.dec_rad,
            ang_rad: target.ang_rad,
            exposure_times: target.exposure_times.clone(),
        }
    }
}
