//! The observatory model: slew feasibility, slew time and state evolution.
//!
//! The model owns the authoritative [`ObservatoryState`]. Trial executions
//! run on a clone, which is dropped afterwards.

mod activity;
mod config;
mod filters;
mod kinematics;

use std::f64::consts::{PI, TAU};

use tracing::{debug, trace};

use crate::model::{ObservatoryState, Target};
use crate::sky::SkyModel;

pub use activity::{Activity, CriticalPath, GraphError, PrerequisiteGraph, default_prerequisites};
pub use config::{
    CameraConfig, DomeConfig, ObservatoryConfig, OpticsConfig, ParkConfig, RotatorConfig,
    SlewConfig, TelescopeConfig,
};
pub use filters::{FilterChangeHistory, FilterChangeLimits};
pub use kinematics::{AxisLimits, kinematic_delay};

/// Errors in the observatory configuration.
#[derive(Debug, thiserror::Error)]
pub enum ObservatoryError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("invalid observatory configuration: {0}")]
    Invalid(String),
}

/// Why a target cannot be slewed to right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Infeasible {
    #[error("filter is not mounted")]
    UnmountedFilter,

    #[error("altitude outside the telescope range")]
    AltitudeOutOfRange,

    #[error("filter change rate limit reached")]
    FilterChangeLimited,
}

/// Limits converted to radians.
#[derive(Debug, Clone)]
struct Params {
    alt_range: (f64, f64),
    az_range: (f64, f64),
    rot_range: (f64, f64),
    tel_alt: AxisLimits,
    tel_az: AxisLimits,
    tel_rot: AxisLimits,
    dom_alt: AxisLimits,
    dom_az: AxisLimits,
    tel_settle: f64,
    dom_settle: f64,
    follow_sky: bool,
    ol_slope: f64,
    cl_delay: Vec<f64>,
    cl_alt_limit: Vec<f64>,
    readout: f64,
    shutter: f64,
    filter_change_time: f64,
    filter_limits: FilterChangeLimits,
}

/// Where a target puts the telescope, before wrap limits are applied.
struct Pointing<'a> {
    ra: f64,
    dec: f64,
    ang: f64,
    alt: f64,
    az: f64,
    pa: f64,
    rot: f64,
    filter: &'a str,
}

#[derive(Debug, Clone)]
pub struct ObservatoryModel {
    params: Params,
    graph: PrerequisiteGraph,
    state: ObservatoryState,
    park: ObservatoryState,
    filter_changes: FilterChangeHistory,
    last_slew: Option<CriticalPath>,
}

impl ObservatoryModel {
    /// Builds a parked observatory.
    pub fn new(config: &ObservatoryConfig) -> Result<Self, ObservatoryError> {
        validate(config)?;
        let graph = PrerequisiteGraph::new(config.slew.prerequisites.clone())?;

        let tel = &config.telescope;
        let rot = &config.rotator;
        let dome = &config.dome;
        let camera = &config.camera;
        let params = Params {
            alt_range: (
                tel.altitude_minpos.to_radians(),
                tel.altitude_maxpos.to_radians(),
            ),
            az_range: (
                tel.azimuth_minpos.to_radians(),
                tel.azimuth_maxpos.to_radians(),
            ),
            rot_range: (rot.minpos.to_radians(), rot.maxpos.to_radians()),
            tel_alt: AxisLimits::from_degrees(
                tel.altitude_maxspeed,
                tel.altitude_accel,
                tel.altitude_decel,
            ),
            tel_az: AxisLimits::from_degrees(
                tel.azimuth_maxspeed,
                tel.azimuth_accel,
                tel.azimuth_decel,
            ),
            tel_rot: AxisLimits::from_degrees(rot.maxspeed, rot.accel, rot.decel),
            dom_alt: AxisLimits::from_degrees(
                dome.altitude_maxspeed,
                dome.altitude_accel,
                dome.altitude_decel,
            ),
            dom_az: AxisLimits::from_degrees(
                dome.azimuth_maxspeed,
                dome.azimuth_accel,
                dome.azimuth_decel,
            ),
            tel_settle: tel.settle_time,
            dom_settle: dome.settle_time,
            follow_sky: rot.follow_sky,
            ol_slope: config.optics.ol_slope,
            cl_delay: config.optics.cl_delay.clone(),
            cl_alt_limit: config.optics.cl_alt_limit.clone(),
            readout: camera.readout_time,
            shutter: camera.shutter_time,
            filter_change_time: camera.filter_change_time,
            filter_limits: FilterChangeLimits {
                burst_num: camera.filter_max_changes_burst_num,
                burst_time: camera.filter_max_changes_burst_time,
                avg_num: camera.filter_max_changes_avg_num,
                avg_time: camera.filter_max_changes_avg_time,
            },
        };

        let park_cfg = &config.park;
        let park = ObservatoryState {
            time: 0.0,
            ra_rad: 0.0,
            dec_rad: 0.0,
            ang_rad: 0.0,
            filter: park_cfg.filter_position.clone(),
            tracking: false,
            alt_rad: park_cfg.telescope_altitude.to_radians(),
            az_rad: park_cfg.telescope_azimuth.to_radians(),
            pa_rad: 0.0,
            rot_rad: park_cfg.telescope_rotator.to_radians(),
            tel_alt_rad: park_cfg.telescope_altitude.to_radians(),
            tel_az_rad: park_cfg.telescope_azimuth.to_radians(),
            tel_rot_rad: park_cfg.telescope_rotator.to_radians(),
            dom_alt_rad: park_cfg.dome_altitude.to_radians(),
            dom_az_rad: park_cfg.dome_azimuth.to_radians(),
            mounted_filters: camera.filter_mounted.clone(),
            unmounted_filters: camera.filter_unmounted.clone(),
        };

        Ok(Self {
            params,
            graph,
            state: park.clone(),
            park,
            filter_changes: FilterChangeHistory::default(),
            last_slew: None,
        })
    }

    pub fn state(&self) -> &ObservatoryState {
        &self.state
    }

    /// Replaces the state wholesale, e.g. from telemetry.
    pub fn set_state(&mut self, state: ObservatoryState) {
        self.state = state;
    }

    /// Returns to the park position, keeping the clock and filter wheel.
    pub fn park(&mut self) {
        let time = self.state.time;
        let mounted = std::mem::take(&mut self.state.mounted_filters);
        let unmounted = std::mem::take(&mut self.state.unmounted_filters);
        self.state = ObservatoryState {
            time,
            mounted_filters: mounted,
            unmounted_filters: unmounted,
            ..self.park.clone()
        };
    }

    /// The critical path of the most recent slew-delay evaluation.
    pub fn last_critical_path(&self) -> Option<&CriticalPath> {
        self.last_slew.as_ref()
    }

    // ── Filters ──

    pub fn is_filter_change_allowed(&self) -> bool {
        self.filter_changes
            .is_change_allowed(self.state.time, &self.params.filter_limits)
    }

    /// Seconds since the last filter change, or the current time if none.
    pub fn since_last_filter_change(&self) -> f64 {
        self.filter_changes.since_last(self.state.time)
    }

    pub fn filter_change_avg_interval(&self) -> f64 {
        self.params.filter_limits.avg_interval()
    }

    pub fn filter_change_count(&self) -> usize {
        self.filter_changes.count()
    }

    /// Exchanges a mounted filter for an unmounted one.
    pub fn swap_filter(&mut self, unmount: &str, mount: &str) {
        for state in [&mut self.state, &mut self.park] {
            state.mounted_filters.retain(|f| f != unmount);
            state.unmounted_filters.retain(|f| f != mount);
            state.mounted_filters.push(mount.to_string());
            state.unmounted_filters.push(unmount.to_string());
        }
        debug!(unmount, mount, "filter swapped");
    }

    // ── Slews ──

    /// Time from now until the first exposure on `target` can start.
    ///
    /// Records the critical path of the evaluation.
    pub fn slew_delay(
        &mut self,
        target: &Target,
        sky: &dyn SkyModel,
    ) -> Result<f64, Infeasible> {
        let to = self.target_state(target, sky)?;
        let path = self
            .graph
            .evaluate(Activity::Exposures, |a| self.activity_delay(a, &to))?;
        let total = path.total;
        trace!(field = target.field_id, filter = %target.filter, total, path = ?path.path, "slew delay");
        self.last_slew = Some(path);
        Ok(total)
    }

    /// Moves onto `target` and starts tracking it. Returns the slew time.
    pub fn slew(&mut self, target: &Target, sky: &dyn SkyModel) -> Result<f64, Infeasible> {
        let delay = self.slew_delay(target, sky)?;
        let mut to = self.target_state(target, sky)?;
        if to.filter != self.state.filter {
            self.filter_changes.record(self.state.time);
        }
        to.time = self.state.time + delay;
        to.tracking = true;
        self.state = to;
        self.update_state(self.state.time, sky);
        Ok(delay)
    }

    /// Slews to `target` and takes its exposures.
    pub fn observe(&mut self, target: &Target, sky: &dyn SkyModel) -> Result<f64, Infeasible> {
        let delay = self.slew(target, sky)?;
        let end = self.state.time + self.visit_time(target);
        self.update_state(end, sky);
        Ok(delay)
    }

    /// Exposure time plus shutter and inter-exposure readout overheads.
    pub fn visit_time(&self, target: &Target) -> f64 {
        let n = target.num_exposures() as f64;
        target.exposure_time() + n * self.params.shutter + (n - 1.0).max(0.0) * self.params.readout
    }

    /// Advances the clock, following the sky while tracking.
    ///
    /// Tracking stops once the pointing leaves the altitude range.
    pub fn update_state(&mut self, time: f64, sky: &dyn SkyModel) {
        let time = time.max(self.state.time);
        if !self.state.tracking {
            self.state.time = time;
            return;
        }

        let h = sky.horizontal(time, self.state.ra_rad, self.state.dec_rad);
        let rot = if self.params.follow_sky {
            h.pa_rad - self.state.ang_rad
        } else {
            self.state.tel_rot_rad
        };
        let pointing = Pointing {
            ra: self.state.ra_rad,
            dec: self.state.dec_rad,
            ang: h.pa_rad - rot,
            alt: h.alt_rad,
            az: h.az_rad,
            pa: h.pa_rad,
            rot,
            filter: &self.state.filter,
        };
        let mut next = self.closest_state(&pointing);
        next.time = time;
        next.tracking = self.in_altitude_range(h.alt_rad);
        self.state = next;
    }

    fn in_altitude_range(&self, alt: f64) -> bool {
        let (min, max) = self.params.alt_range;
        (min..=max).contains(&alt)
    }

    fn target_state(
        &self,
        target: &Target,
        sky: &dyn SkyModel,
    ) -> Result<ObservatoryState, Infeasible> {
        if !self.state.is_mounted(&target.filter) {
            return Err(Infeasible::UnmountedFilter);
        }
        let h = sky.horizontal(self.state.time, target.ra_rad, target.dec_rad);
        if !self.in_altitude_range(h.alt_rad) {
            return Err(Infeasible::AltitudeOutOfRange);
        }

        let rot = if self.params.follow_sky {
            h.pa_rad - target.ang_rad
        } else {
            self.state.tel_rot_rad
        };
        let pointing = Pointing {
            ra: target.ra_rad,
            dec: target.dec_rad,
            ang: h.pa_rad - rot,
            alt: h.alt_rad,
            az: h.az_rad,
            pa: h.pa_rad,
            rot,
            filter: &target.filter,
        };
        Ok(self.closest_state(&pointing))
    }

    /// The axis angles that reach `p` from the current state with the
    /// shortest moves allowed by the cable wraps.
    fn closest_state(&self, p: &Pointing<'_>) -> ObservatoryState {
        let (rot_min, rot_max) = self.params.rot_range;
        let mut rot = p.rot;
        let norm_rot = (rot - rot_min).rem_euclid(TAU) + rot_min;
        if norm_rot > rot_max {
            rot = norm_rot - PI;
        }

        let (tel_alt, _) =
            closest_angle_distance(p.alt, self.state.tel_alt_rad, Some(self.params.alt_range));
        let (tel_az, _) =
            closest_angle_distance(p.az, self.state.tel_az_rad, Some(self.params.az_range));
        let (tel_rot, _) =
            closest_angle_distance(rot, self.state.tel_rot_rad, Some(self.params.rot_range));
        let (dom_alt, _) =
            closest_angle_distance(p.alt, self.state.dom_alt_rad, Some(self.params.alt_range));
        let (dom_az, _) = closest_angle_distance(p.az, self.state.dom_az_rad, None);

        ObservatoryState {
            time: self.state.time,
            ra_rad: p.ra,
            dec_rad: p.dec,
            ang_rad: p.ang,
            filter: p.filter.to_string(),
            tracking: self.state.tracking,
            alt_rad: p.alt,
            az_rad: p.az,
            pa_rad: p.pa,
            rot_rad: rot,
            tel_alt_rad: tel_alt,
            tel_az_rad: tel_az,
            tel_rot_rad: tel_rot,
            dom_alt_rad: dom_alt,
            dom_az_rad: dom_az,
            mounted_filters: self.state.mounted_filters.clone(),
            unmounted_filters: self.state.unmounted_filters.clone(),
        }
    }

    /// Own delay of one activity for the move from the current state to `to`.
    fn activity_delay(&self, activity: Activity, to: &ObservatoryState) -> Result<f64, Infeasible> {
        let from = &self.state;
        let p = &self.params;
        let d_alt = to.tel_alt_rad - from.tel_alt_rad;
        let d_az = to.tel_az_rad - from.tel_az_rad;

        let delay = match activity {
            Activity::TelAlt => p.tel_alt.delay(d_alt),
            Activity::TelAz => p.tel_az.delay(d_az),
            Activity::TelRot => p.tel_rot.delay(to.tel_rot_rad - from.tel_rot_rad),
            Activity::DomAlt => p.dom_alt.delay(to.dom_alt_rad - from.dom_alt_rad),
            Activity::DomAz => p.dom_az.delay(to.dom_az_rad - from.dom_az_rad),
            Activity::TelSettle => {
                if d_alt.abs() + d_az.abs() > 0.0 {
                    p.tel_settle
                } else {
                    0.0
                }
            }
            Activity::DomAzSettle => {
                if (to.dom_az_rad - from.dom_az_rad).abs() > 0.0 {
                    p.dom_settle
                } else {
                    0.0
                }
            }
            Activity::TelOpticsOpenLoop => d_alt.abs().to_degrees() * p.ol_slope,
            Activity::TelOpticsClosedLoop => {
                let d = d_alt.abs().to_degrees();
                p.cl_alt_limit
                    .windows(2)
                    .zip(&p.cl_delay)
                    .find(|(band, _)| band[0] <= d && d < band[1])
                    .map_or(0.0, |(_, delay)| *delay)
            }
            Activity::Filter => {
                if to.filter == from.filter {
                    0.0
                } else if self.is_filter_change_allowed() {
                    p.filter_change_time
                } else {
                    return Err(Infeasible::FilterChangeLimited);
                }
            }
            Activity::Readout => p.readout,
            Activity::Exposures => 0.0,
        };
        Ok(delay)
    }
}

/// Shortest move from `current` to `target`, honoring wrap limits.
///
/// Returns `(final_angle, distance)`. A target beyond `max` is retried half
/// a turn back; a move that would cross a limit goes the long way round.
pub fn closest_angle_distance(target: f64, current: f64, limits: Option<(f64, f64)>) -> (f64, f64) {
    let norm_target = match limits {
        Some((min, max)) => {
            let norm = (target - min).rem_euclid(TAU) + min;
            if norm > max { min.max(norm - PI) } else { norm }
        }
        None => target,
    };

    let mut distance = (norm_target - current).rem_euclid(TAU);
    if distance > PI {
        distance -= TAU;
    }

    if let Some((min, max)) = limits {
        let accumulated = current + distance;
        if accumulated > max {
            distance -= TAU;
        }
        if accumulated < min {
            distance += TAU;
        }
    }

    (current + distance, distance)
}

fn validate(config: &ObservatoryConfig) -> Result<(), ObservatoryError> {
    let tel = &config.telescope;
    if !(0.0..=90.0).contains(&tel.altitude_minpos)
        || !(0.0..=90.0).contains(&tel.altitude_maxpos)
        || tel.altitude_minpos >= tel.altitude_maxpos
    {
        return Err(ObservatoryError::Invalid(format!(
            "telescope altitude range [{}, {}] must lie within [0, 90]",
            tel.altitude_minpos, tel.altitude_maxpos
        )));
    }
    if tel.azimuth_minpos >= tel.azimuth_maxpos || config.rotator.minpos >= config.rotator.maxpos {
        return Err(ObservatoryError::Invalid(
            "axis minimum positions must be below their maximums".to_string(),
        ));
    }
    let optics = &config.optics;
    if optics.cl_alt_limit.len() != optics.cl_delay.len() + 1 {
        return Err(ObservatoryError::Invalid(
            "optics cl-alt-limit needs exactly one more entry than cl-delay".to_string(),
        ));
    }
    let camera = &config.camera;
    if !camera.filter_mounted.contains(&config.park.filter_position) {
        return Err(ObservatoryError::Invalid(format!(
            "park filter {} is not mounted",
            config.park.filter_position
        )));
    }
    Ok(())
}
