//! The scheduling driver.
//!
//! The driver owns every piece of scheduler state: the observatory model,
//! the proposals, the lookahead cache and the survey clock. The control loop
//! feeds it time and conditions, asks it for the next target, and reports
//! back what was observed.

mod night;
mod ranking;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::FieldCatalog;
use crate::config::Config;
use crate::lookahead::{IndexMode, Lookahead, LookaheadError};
use crate::model::{FilterSwap, Observation, ObservatoryState, Target};
use crate::observatory::{ObservatoryError, ObservatoryModel};
use crate::proposals::{
    self, ConstraintOverrides, NightContext, Proposal, ProposalConfig, ProposalError,
    ProposalKind, SuggestRequest,
};
use crate::sky::SkyModel;

pub use night::{DarkTime, filter_progress};
pub use ranking::{
    CandidateSet, Pricing, TimeCostCurve, filter_change_cost, time_balancing_boosts,
};

const DAY: f64 = 86_400.0;

/// Errors raised while assembling a driver.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Observatory(#[from] ObservatoryError),

    #[error(transparent)]
    Proposal(#[from] ProposalError),

    #[error(transparent)]
    Lookahead(#[from] LookaheadError),

    #[error("invalid driver configuration: {0}")]
    Config(String),
}

pub type Result<T> = core::result::Result<T, DriverError>;

/// Driver settings, the `[driver]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DriverConfig {
    /// Fold candidates for the same field and filter into one.
    pub coadd_values: bool,
    pub time_balancing: bool,
    pub timecost_time_max: f64,
    pub timecost_time_ref: f64,
    pub timecost_cost_ref: f64,
    pub timecost_weight: f64,
    pub filtercost_weight: f64,
    /// Sun altitude, in degrees, that bounds the night.
    pub night_boundary: f64,
    pub ignore_sky_brightness: bool,
    pub ignore_airmass: bool,
    pub ignore_clouds: bool,
    pub ignore_seeing: bool,
    /// Moon phase, in percent, below which a night counts as dark.
    pub new_moon_phase_threshold: f64,
    /// Seconds a trial execution observes a target for.
    pub trial_visit_time: f64,
    pub default_cloud: f64,
    pub default_seeing: f64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            coadd_values: true,
            time_balancing: true,
            timecost_time_max: 150.0,
            timecost_time_ref: 5.0,
            timecost_cost_ref: 0.033,
            timecost_weight: 1.0,
            filtercost_weight: 1.0,
            night_boundary: -12.0,
            ignore_sky_brightness: false,
            ignore_airmass: false,
            ignore_clouds: false,
            ignore_seeing: false,
            new_moon_phase_threshold: 20.0,
            trial_visit_time: 30.0,
            default_cloud: 0.0,
            default_seeing: 1.0,
        }
    }
}

impl DriverConfig {
    pub fn cost_curve(&self) -> Option<TimeCostCurve> {
        TimeCostCurve::new(
            self.timecost_time_max,
            self.timecost_time_ref,
            self.timecost_cost_ref,
        )
    }

    pub fn overrides(&self) -> ConstraintOverrides {
        ConstraintOverrides {
            ignore_sky_brightness: self.ignore_sky_brightness,
            ignore_airmass: self.ignore_airmass,
            ignore_clouds: self.ignore_clouds,
            ignore_seeing: self.ignore_seeing,
        }
    }
}

/// Proposal names by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SurveyTopology {
    pub general: Vec<String>,
    pub sequence: Vec<String>,
}

pub struct Driver {
    config: DriverConfig,
    pricing: Pricing,
    observatory: ObservatoryModel,
    sky: Box<dyn SkyModel>,
    catalog: FieldCatalog,
    lookahead: Lookahead,
    proposals: Vec<Box<dyn Proposal>>,
    removable_filters: Vec<String>,
    darktime_filter: String,

    survey_duration: f64,
    start_time: f64,
    time: f64,
    survey_started: bool,
    is_night: bool,
    night: u32,
    sunset: f64,
    sunrise: f64,

    target_id: i64,
    last_winner: Option<Target>,
    /// The visit whose deep-drilling pattern is still running.
    deep_drilling: Option<Target>,
    dark_time: DarkTime,
    pending_swap: Option<FilterSwap>,

    cloud: f64,
    seeing: f64,
}

impl Driver {
    /// Assembles a driver with a parked observatory. Proposals get ids
    /// `1..` in configuration order.
    pub fn new(
        config: &Config,
        catalog: FieldCatalog,
        mut sky: Box<dyn SkyModel>,
    ) -> Result<Self> {
        let driver = config.driver.clone();
        let curve = driver.cost_curve().ok_or_else(|| {
            DriverError::Config("time-cost calibration needs time-ref > cost-ref * time-max".into())
        })?;
        let observatory = ObservatoryModel::new(&config.observatory)?;

        let lookahead = match &config.lookahead {
            Some(settings) => Lookahead::new(settings, &config.base_dir)?,
            None => Lookahead::disabled(),
        };
        if matches!(lookahead.mode(), IndexMode::Healpix { .. })
            && config.proposals.iter().any(uses_lookahead)
        {
            return Err(DriverError::Config(
                "proposals score catalog fields; a healpix lookahead cannot serve them".into(),
            ));
        }

        let overrides = driver.overrides();
        let proposals = config
            .proposals
            .iter()
            .zip(1..)
            .map(|(p, id)| proposals::build(id, p, overrides, &config.base_dir))
            .collect::<core::result::Result<Vec<_>, _>>()?;
        sky.exclude_planets(config.proposals.iter().any(ProposalConfig::excludes_planets));

        let camera = &config.observatory.camera;
        Ok(Self {
            pricing: Pricing {
                curve,
                time_weight: driver.timecost_weight,
                filter_weight: driver.filtercost_weight,
            },
            observatory,
            sky,
            catalog,
            lookahead,
            proposals,
            removable_filters: camera.filter_removable.clone(),
            darktime_filter: camera.filter_darktime.clone(),
            survey_duration: config.survey.duration_days * DAY,
            start_time: 0.0,
            time: 0.0,
            survey_started: false,
            is_night: false,
            night: 0,
            sunset: 0.0,
            sunrise: 0.0,
            target_id: 0,
            last_winner: None,
            deep_drilling: None,
            dark_time: DarkTime::new(driver.new_moon_phase_threshold),
            pending_swap: None,
            cloud: driver.default_cloud,
            seeing: driver.default_seeing,
            config: driver,
        })
    }

    // ── Accessors ──

    pub fn observatory(&self) -> &ObservatoryModel {
        &self.observatory
    }

    pub fn proposals(&self) -> &[Box<dyn Proposal>] {
        &self.proposals
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn is_night(&self) -> bool {
        self.is_night
    }

    /// `(sunset, sunrise)` of the current or next night.
    pub fn night_boundaries(&self) -> (f64, f64) {
        (self.sunset, self.sunrise)
    }

    pub fn last_winner(&self) -> Option<&Target> {
        self.last_winner.as_ref()
    }

    /// Fraction of the survey duration elapsed.
    pub fn time_progress(&self) -> f64 {
        if self.survey_duration > 0.0 {
            (self.time - self.start_time) / self.survey_duration
        } else {
            0.0
        }
    }

    pub fn survey_topology(&self) -> SurveyTopology {
        let mut topology = SurveyTopology::default();
        for proposal in &self.proposals {
            let names = match proposal.kind() {
                ProposalKind::General => &mut topology.general,
                ProposalKind::Sequence => &mut topology.sequence,
            };
            names.push(proposal.name().to_string());
        }
        topology
    }

    // ── Survey and night lifecycle ──

    /// Starts the survey at `time`, opening the night if it is already dark.
    pub fn start_survey(&mut self, time: f64, night: u32) -> Result<()> {
        self.start_time = time;
        self.time = time;
        self.survey_started = true;
        info!(time, proposals = self.proposals.len(), "survey started");
        for proposal in &mut self.proposals {
            proposal.start_survey();
        }

        self.sky.update(time);
        let (sunset, sunrise) = self.sky.night_boundaries(self.config.night_boundary);
        self.sunset = sunset;
        self.sunrise = sunrise;
        if (sunset..sunrise).contains(&time) {
            self.start_night(time, night)?;
        }
        Ok(())
    }

    pub fn end_survey(&mut self) {
        info!(time = self.time, targets = self.target_id, "survey ended");
        for proposal in &mut self.proposals {
            proposal.end_survey();
        }
    }

    fn start_night(&mut self, time: f64, night: u32) -> Result<()> {
        self.is_night = true;
        self.night = night;
        info!(time, night, progress = self.time_progress(), "night started");

        self.lookahead.set_time(time);
        self.lookahead.start_night()?;
        self.start_proposal_nights(time);
        Ok(())
    }

    fn start_proposal_nights(&mut self, time: f64) {
        let context = NightContext {
            time,
            night: self.night,
            mounted_filters: &self.observatory.state().mounted_filters,
            catalog: &self.catalog,
        };
        for proposal in &mut self.proposals {
            proposal.start_night(&context);
        }
    }

    fn end_night(&mut self, time: f64) {
        self.is_night = false;
        info!(time, night = self.night, "night ended");
        for proposal in &mut self.proposals {
            proposal.end_night(time);
        }
        self.lookahead.end_night();
        self.last_winner = None;
        self.deep_drilling = None;

        let state = self.observatory.state();
        let filters: Vec<String> = state
            .mounted_filters
            .iter()
            .chain(&state.unmounted_filters)
            .cloned()
            .collect();
        let progress = filter_progress(&self.proposals, &filters);
        for (filter, p) in &progress {
            debug!(filter = %filter, progress = p, "filter progress");
        }

        self.sky.update(time);
        let (sunset, sunrise) = self.sky.night_boundaries(self.config.night_boundary);
        self.sunset = sunset;
        self.sunrise = sunrise;
        self.sky.update((sunset + sunrise) / 2.0);
        let phase = self.sky.moon_sun_info(&[0.0], &[0.0]).moon.phase;
        info!(phase, sunset, sunrise, "moon phase at next midnight");

        let state = self.observatory.state();
        self.pending_swap = self
            .dark_time
            .advance(phase, &progress, &self.removable_filters, &self.darktime_filter)
            .filter(|swap| state.is_mounted(&swap.unmount) && !state.is_mounted(&swap.mount));
        if let Some(swap) = &self.pending_swap {
            info!(unmount = %swap.unmount, mount = %swap.mount, "filter swap needed");
        }
    }

    /// Advances the clock. Returns whether it is night.
    pub fn update_time(&mut self, time: f64, night: u32) -> Result<bool> {
        self.time = time;
        self.observatory.update_state(time, &*self.sky);
        if !self.survey_started {
            self.start_survey(time, night)?;
        }

        if self.is_night {
            if time >= self.sunrise {
                self.end_night(time);
            }
        } else if time >= self.sunset {
            self.start_night(time, night)?;
        }
        Ok(self.is_night)
    }

    // ── Conditions ──

    /// Takes a telemetry snapshot of the observatory. A changed filter
    /// complement counts as a swap and restarts the proposals' night.
    pub fn update_internal_conditions(&mut self, state: ObservatoryState, night: u32) {
        let current = self.observatory.state();
        if state.unmounted_filters != current.unmounted_filters {
            let swap = state
                .unmounted_filters
                .first()
                .zip(current.unmounted_filters.first())
                .map(|(unmount, mount)| FilterSwap {
                    unmount: unmount.clone(),
                    mount: mount.clone(),
                });
            if let Some(swap) = swap {
                self.swap_filter(&swap.unmount, &swap.mount);
            }
            self.observatory.set_state(state.clone());
            self.night = night;
            self.start_proposal_nights(state.time);
        }
        self.time = state.time;
        self.observatory.set_state(state);
    }

    /// Missing readings fall back to the configured defaults.
    pub fn update_external_conditions(&mut self, cloud: Option<f64>, seeing: Option<f64>) {
        self.cloud = cloud.filter(|c| c.is_finite()).unwrap_or_else(|| {
            warn!(default = self.config.default_cloud, "cloud reading missing");
            self.config.default_cloud
        });
        self.seeing = seeing.filter(|s| s.is_finite()).unwrap_or_else(|| {
            warn!(default = self.config.default_seeing, "seeing reading missing");
            self.config.default_seeing
        });
    }

    /// The swap requested for the coming night, if any.
    pub fn need_filter_swap(&self) -> Option<&FilterSwap> {
        self.pending_swap.as_ref()
    }

    pub fn swap_filter(&mut self, unmount: &str, mount: &str) {
        info!(unmount, mount, "swapping filters");
        self.observatory.swap_filter(unmount, mount);
        self.dark_time.record_swap(FilterSwap {
            unmount: unmount.to_string(),
            mount: mount.to_string(),
        });
        self.pending_swap = None;
    }

    // ── Selection ──

    /// Picks the next target, or the null target when nothing can be
    /// observed.
    pub fn select_next_target(&mut self) -> Target {
        if !self.is_night {
            return Target::null();
        }

        let progress: Vec<f64> = self.proposals.iter().map(|p| p.progress()).collect();
        let boosts =
            time_balancing_boosts(&progress, self.time_progress(), self.config.time_balancing);

        let constrained_filter = (!self.observatory.is_filter_change_allowed())
            .then(|| self.observatory.state().filter.clone());
        debug!(
            changes = self.observatory.filter_change_count(),
            since_last = self.observatory.since_last_filter_change(),
            constrained = ?constrained_filter,
            "filter change status"
        );

        self.lookahead.set_time(self.time);
        self.lookahead.calculate_bonus();

        let request = SuggestRequest {
            time: self.time,
            deep_drilling: self.deep_drilling.as_ref(),
            constrained_filter: constrained_filter.as_deref(),
            cloud: self.cloud,
            seeing: self.seeing,
        };
        let mut candidates = CandidateSet::new(self.config.coadd_values);
        for (proposal, &boost) in self.proposals.iter_mut().zip(&boosts) {
            let targets =
                proposal.suggest_targets(&request, &mut *self.sky, Some(&self.lookahead));
            debug!(
                proposal = proposal.name(),
                targets = targets.len(),
                progress = proposal.progress(),
                boost,
                "proposal suggestions"
            );
            for target in targets {
                candidates.add(target, boost);
            }
        }

        let ranked = candidates.rank(&self.pricing, &mut self.observatory, &*self.sky);
        debug!(candidates = ranked.len(), "candidates ranked");

        for mut candidate in ranked {
            if self.trial(&candidate) {
                self.target_id += 1;
                candidate.id = self.target_id;
                candidate.time = self.time;
                info!(
                    id = candidate.id,
                    field = candidate.field_id,
                    filter = %candidate.filter,
                    rank = candidate.rank,
                    slew_time = candidate.slew_time,
                    "target selected"
                );
                self.last_winner = Some(candidate.clone());
                return candidate;
            }
            debug!(field = candidate.field_id, filter = %candidate.filter, "candidate rejected by trial");
        }

        // A continuation that cannot be observed ends the pattern.
        self.deep_drilling = None;
        Target::null()
    }

    /// Executes `target` on a copy of the observatory and checks it is still
    /// tracking once the visit is over.
    fn trial(&self, target: &Target) -> bool {
        let mut shadow = self.observatory.clone();
        if shadow.slew(target, &*self.sky).is_err() {
            return false;
        }
        let duration = match &target.deep_drilling {
            Some(dd) if dd.first_visit => dd.sequence_exposure_time,
            _ => self.config.trial_visit_time,
        };
        shadow.update_state(shadow.state().time + duration, &*self.sky);
        shadow.state().tracking
    }

    /// Books a completed visit. Returns each proposal's copy of the target
    /// it credited.
    pub fn register_observation(&mut self, observation: &Observation) -> Vec<Target> {
        if observation.target_id <= 0 {
            return Vec::new();
        }

        let visit = match &self.last_winner {
            Some(winner) if winner.is_for(observation.field_id, &observation.filter) => {
                let mut visit = winner.clone();
                visit.time = observation.time;
                visit.exposure_times.clone_from(&observation.exposure_times);
                visit
            }
            winner => {
                warn!(
                    target = observation.target_id,
                    field = observation.field_id,
                    filter = %observation.filter,
                    expected = ?winner.as_ref().map(|w| (w.field_id, w.filter.as_str())),
                    "observation does not match the last target"
                );
                Target::from_observation(observation)
            }
        };

        if let Err(reason) = self.observatory.observe(&visit, &*self.sky) {
            warn!(%reason, field = visit.field_id, "observation could not be applied to the model");
        }

        let credited: Vec<Target> = self
            .proposals
            .iter_mut()
            .filter_map(|p| p.register_observation(&visit))
            .collect();
        debug!(field = visit.field_id, credited = credited.len(), "observation registered");

        self.deep_drilling = (visit.remaining_deep_drilling_visits() > 1).then_some(visit);
        credited
    }
}

fn uses_lookahead(config: &ProposalConfig) -> bool {
    match config {
        ProposalConfig::Area(c) => c.scheduling.lookahead_bonus_weight > 0.0,
        ProposalConfig::Sequence(c) => c.scheduling.lookahead_bonus_weight > 0.0,
        ProposalConfig::Scripted(_) => false,
    }
}
