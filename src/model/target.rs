//! Targets: candidate and issued pointings.

use serde::{Deserialize, Serialize};

use super::Observation;

/// One proposal's interest in a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contribution {
    pub proposal_id: u32,
    pub need: f64,
    pub bonus: f64,
    pub value: f64,
    /// Time-balancing boost applied by the driver.
    pub boost: f64,
    /// Subsequence the visit advances, for sequence proposals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsequence: Option<String>,
}

impl Contribution {
    pub fn new(proposal_id: u32, need: f64, bonus: f64) -> Self {
        Self {
            proposal_id,
            need,
            bonus,
            value: need + bonus,
            boost: 1.0,
            subsequence: None,
        }
    }
}

/// Marks a visit that belongs to a multi-visit deep-drilling pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeepDrillingVisit {
    pub first_visit: bool,
    /// Visits left in the pattern, this one included.
    pub remaining_visits: u32,
    /// Time the whole pattern is expected to take, used when trialling
    /// its first visit.
    pub sequence_exposure_time: f64,
}

/// A pointing: a candidate while being ranked, the winner once issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Monotonic id assigned to winners; `-1` for the null target and `0`
    /// for candidates that were never issued.
    pub id: i64,
    pub field_id: u32,
    pub filter: String,
    pub ra_rad: f64,
    pub dec_rad: f64,
    pub ang_rad: f64,
    pub exposure_times: Vec<f64>,
    pub time: f64,

    pub airmass: f64,
    pub sky_brightness: f64,
    pub cloud: f64,
    pub seeing: f64,

    pub need: f64,
    pub bonus: f64,
    pub value: f64,
    pub boost: f64,
    pub contributions: Vec<Contribution>,

    pub slew_time: f64,
    pub cost: f64,
    pub rank: f64,

    pub group_id: u32,
    pub group_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deep_drilling: Option<DeepDrillingVisit>,
}

impl Target {
    pub fn new(
        field_id: u32,
        filter: impl Into<String>,
        ra_rad: f64,
        dec_rad: f64,
        exposure_times: Vec<f64>,
    ) -> Self {
        Self {
            id: 0,
            field_id,
            filter: filter.into(),
            ra_rad,
            dec_rad,
            ang_rad: 0.0,
            exposure_times,
            time: 0.0,
            airmass: 0.0,
            sky_brightness: 0.0,
            cloud: 0.0,
            seeing: 0.0,
            need: 0.0,
            bonus: 0.0,
            value: 0.0,
            boost: 1.0,
            contributions: Vec::new(),
            slew_time: 0.0,
            cost: 0.0,
            rank: 0.0,
            group_id: 0,
            group_index: 0,
            deep_drilling: None,
        }
    }

    /// The "nothing to observe" answer.
    pub fn null() -> Self {
        let mut target = Self::new(0, "", 0.0, 0.0, vec![0.0]);
        target.id = -1;
        target
    }

    /// A target reconstructed from an observation nobody asked for.
    pub fn from_observation(observation: &Observation) -> Self {
        let mut target = Self::new(
            observation.field_id,
            observation.filter.clone(),
            observation.ra_rad,
            observation.dec_rad,
            observation.exposure_times.clone(),
        );
        target.id = observation.target_id;
        target.ang_rad = observation.ang_rad;
        target.time = observation.time;
        target
    }

    pub fn is_null(&self) -> bool {
        self.id < 0
    }

    pub fn num_exposures(&self) -> usize {
        self.exposure_times.len()
    }

    /// Sum of exposure times, excluding shutter and readout overheads.
    pub fn exposure_time(&self) -> f64 {
        self.exposure_times.iter().sum()
    }

    /// Whether this target points at `field_id` through `filter`.
    pub fn is_for(&self, field_id: u32, filter: &str) -> bool {
        self.field_id == field_id && self.filter == filter
    }

    pub fn contribution(&self, proposal_id: u32) -> Option<&Contribution> {
        self.contributions
            .iter()
            .find(|c| c.proposal_id == proposal_id)
    }

    pub fn has_contribution(&self, proposal_id: u32) -> bool {
        self.contribution(proposal_id).is_some()
    }

    pub fn is_deep_drilling(&self) -> bool {
        self.deep_drilling.is_some()
    }

    pub fn is_first_deep_drilling_visit(&self) -> bool {
        self.deep_drilling.as_ref().is_some_and(|dd| dd.first_visit)
    }

    pub fn remaining_deep_drilling_visits(&self) -> u32 {
        self.deep_drilling
            .as_ref()
            .map_or(0, |dd| dd.remaining_visits)
    }
}
