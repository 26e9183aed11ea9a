//! Proposals: the observing programs competing for telescope time.
//!
//! Each proposal turns the current sky into scored candidate targets and
//! keeps its own visit bookkeeping. The driver never looks inside a
//! proposal beyond the [`Proposal`] trait.

mod area;
mod scripted;
mod sequence;

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::catalog::{Field, FieldCatalog};
use crate::lookahead::Lookahead;
use crate::model::Target;
use crate::sky::{Body, SkyModel};

pub use area::{AreaConfig, AreaDistributionProposal};
pub use scripted::{ScriptedConfig, ScriptedProposal, ScriptedTargetSpec};
pub use sequence::{SequenceConfig, TimeDistributionProposal};

/// Errors raised while building a proposal.
#[derive(Debug, thiserror::Error)]
pub enum ProposalError {
    #[error("failed to read script {path}: {source}")]
    Script {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path}:{line}: {reason}")]
    ScriptLine {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("proposal {name}: {reason}")]
    Invalid { name: String, reason: String },
}

pub type Result<T> = core::result::Result<T, ProposalError>;

/// Broad scheduling style, reported in the survey topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalKind {
    General,
    Sequence,
}

/// Everything a proposal needs to know to suggest targets.
#[derive(Debug, Clone, Copy)]
pub struct SuggestRequest<'a> {
    pub time: f64,
    /// The deep-drilling visit in progress, if any.
    pub deep_drilling: Option<&'a Target>,
    /// Only this filter may be proposed, when filter changes are blocked.
    pub constrained_filter: Option<&'a str>,
    pub cloud: f64,
    pub seeing: f64,
}

/// Night start context.
#[derive(Debug, Clone, Copy)]
pub struct NightContext<'a> {
    pub time: f64,
    pub night: u32,
    pub mounted_filters: &'a [String],
    pub catalog: &'a FieldCatalog,
}

pub trait Proposal {
    fn id(&self) -> u32;
    fn name(&self) -> &str;
    fn kind(&self) -> ProposalKind;

    fn start_survey(&mut self) {}
    fn end_survey(&mut self) {}
    fn start_night(&mut self, context: &NightContext<'_>);
    fn end_night(&mut self, time: f64);

    /// Scored candidates, each carrying exactly one contribution from this
    /// proposal.
    fn suggest_targets(
        &mut self,
        request: &SuggestRequest<'_>,
        sky: &mut dyn SkyModel,
        lookahead: Option<&Lookahead>,
    ) -> Vec<Target>;

    /// Books a completed visit. Returns this proposal's view of the target
    /// when it counted.
    fn register_observation(&mut self, visit: &Target) -> Option<Target>;

    fn tally(&self) -> &Tally;

    fn progress(&self) -> f64 {
        self.tally().progress()
    }
}

/// Constraints the driver can switch off for every proposal at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConstraintOverrides {
    pub ignore_sky_brightness: bool,
    pub ignore_airmass: bool,
    pub ignore_clouds: bool,
    pub ignore_seeing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ProposalConstraints {
    pub max_airmass: f64,
    pub max_cloud: f64,
    /// Degrees.
    pub min_distance_moon: f64,
    pub exclude_planets: bool,
}

impl Default for ProposalConstraints {
    fn default() -> Self {
        Self {
            max_airmass: 2.5,
            max_cloud: 0.7,
            min_distance_moon: 30.0,
            exclude_planets: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SchedulingConfig {
    pub max_num_targets: usize,
    pub accept_serendipity: bool,
    pub accept_consecutive_visits: bool,
    pub airmass_bonus: f64,
    pub hour_angle_bonus: f64,
    /// Hours.
    pub hour_angle_max: f64,
    pub lookahead_bonus_weight: f64,
    pub restrict_grouped_visits: bool,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            max_num_targets: 100,
            accept_serendipity: false,
            accept_consecutive_visits: false,
            airmass_bonus: 0.5,
            hour_angle_bonus: 0.3,
            hour_angle_max: 6.0,
            lookahead_bonus_weight: 0.0,
            restrict_grouped_visits: true,
        }
    }
}

/// Per-filter settings. `visits` and `num-grouped-visits` only apply to
/// area proposals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FilterConfig {
    pub visits: u32,
    pub num_grouped_visits: u32,
    pub exp_times: Vec<f64>,
    pub min_brig: f64,
    pub max_brig: f64,
    pub max_seeing: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            visits: 0,
            num_grouped_visits: 1,
            exp_times: vec![15.0, 15.0],
            min_brig: 15.0,
            max_brig: 30.0,
            max_seeing: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ProposalConfig {
    Area(AreaConfig),
    Sequence(SequenceConfig),
    Scripted(ScriptedConfig),
}

impl ProposalConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::Area(c) => &c.name,
            Self::Sequence(c) => &c.name,
            Self::Scripted(c) => &c.name,
        }
    }

    pub fn excludes_planets(&self) -> bool {
        match self {
            Self::Area(c) => c.constraints.exclude_planets,
            Self::Sequence(c) => c.constraints.exclude_planets,
            Self::Scripted(_) => false,
        }
    }
}

/// Builds proposal `id`. Script paths resolve against `base_dir`.
pub fn build(
    id: u32,
    config: &ProposalConfig,
    overrides: ConstraintOverrides,
    base_dir: &Path,
) -> Result<Box<dyn Proposal>> {
    let proposal: Box<dyn Proposal> = match config {
        ProposalConfig::Area(c) => Box::new(AreaDistributionProposal::new(id, c.clone(), overrides)?),
        ProposalConfig::Sequence(c) => {
            Box::new(TimeDistributionProposal::new(id, c.clone(), overrides)?)
        }
        ProposalConfig::Scripted(c) => Box::new(ScriptedProposal::from_config(id, c, base_dir)?),
    };
    Ok(proposal)
}

// ── Bookkeeping ──

/// Visit goals and counts, survey-wide and for the current night.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tally {
    pub goal: u32,
    pub visits: u32,
    pub filter_goal: BTreeMap<String, u32>,
    pub filter_visits: BTreeMap<String, u32>,
    pub tonight_visits: u32,
    pub tonight_filter_visits: BTreeMap<String, u32>,
}

impl Tally {
    pub fn add_goal(&mut self, filter: &str, goal: u32) {
        self.goal += goal;
        *self.filter_goal.entry(filter.to_string()).or_default() += goal;
    }

    /// Grows the goal by a finished round: `visits` overall and
    /// `filter_visits` per filter.
    pub fn grow_goal(&mut self, visits: u32, filter_visits: &BTreeMap<String, u32>) {
        self.goal += visits;
        for (filter, n) in filter_visits {
            *self.filter_goal.entry(filter.clone()).or_default() += n;
        }
    }

    pub fn record_visit(&mut self, filter: &str) {
        self.visits += 1;
        self.tonight_visits += 1;
        *self.filter_visits.entry(filter.to_string()).or_default() += 1;
        *self
            .tonight_filter_visits
            .entry(filter.to_string())
            .or_default() += 1;
    }

    pub fn start_night(&mut self) {
        self.tonight_visits = 0;
        self.tonight_filter_visits.clear();
    }

    /// Fraction of the goal reached; zero without a goal.
    pub fn progress(&self) -> f64 {
        ratio(self.visits, self.goal)
    }

    pub fn filter_progress(&self, filter: &str) -> f64 {
        ratio(
            self.filter_visits.get(filter).copied().unwrap_or(0),
            self.filter_goal.get(filter).copied().unwrap_or(0),
        )
    }
}

fn ratio(visits: u32, goal: u32) -> f64 {
    if goal == 0 {
        0.0
    } else {
        f64::from(visits) / f64::from(goal)
    }
}

// ── Shared scoring ──

/// Sky conditions for a list of fields at one instant.
pub(crate) struct Conditions {
    pub airmass: Vec<f64>,
    pub moon_distance: Vec<f64>,
    pub hour_angle: Vec<f64>,
    pub sky_brightness: BTreeMap<String, Vec<f64>>,
}

impl Conditions {
    pub fn gather(sky: &mut dyn SkyModel, time: f64, fields: &[Field]) -> Self {
        sky.update(time);
        let ids: Vec<u32> = fields.iter().map(|f| f.id).collect();
        let ra: Vec<f64> = fields.iter().map(|f| f.ra).collect();
        let dec: Vec<f64> = fields.iter().map(|f| f.dec).collect();
        Self {
            airmass: sky.airmass(&ids),
            moon_distance: sky.angular_separation(Body::Moon, &ra, &dec),
            hour_angle: sky.hour_angle(&ra),
            sky_brightness: sky.sky_brightness(&ids),
        }
    }

    pub fn brightness(&self, filter: &str, index: usize) -> f64 {
        self.sky_brightness
            .get(filter)
            .and_then(|mags| mags.get(index))
            .copied()
            .unwrap_or(f64::NAN)
    }
}

/// Hard observability cuts shared by survey proposals.
pub(crate) struct Screen<'a> {
    pub constraints: &'a ProposalConstraints,
    pub overrides: ConstraintOverrides,
}

impl Screen<'_> {
    pub fn clouds_ok(&self, cloud: f64) -> bool {
        self.overrides.ignore_clouds || cloud <= self.constraints.max_cloud
    }

    pub fn field_ok(&self, airmass: f64, moon_distance: f64) -> bool {
        (self.overrides.ignore_airmass || airmass <= self.constraints.max_airmass)
            && moon_distance >= self.constraints.min_distance_moon.to_radians()
    }

    pub fn filter_ok(&self, filter: &FilterConfig, brightness: f64, seeing: f64) -> bool {
        if !self.overrides.ignore_seeing && seeing > filter.max_seeing {
            return false;
        }
        self.overrides.ignore_sky_brightness
            || (!brightness.is_nan() && (filter.min_brig..=filter.max_brig).contains(&brightness))
    }
}

/// Bonus for low airmass, full at zenith and zero at the airmass limit.
pub(crate) fn airmass_rank(airmass: f64, max_airmass: f64, weight: f64) -> f64 {
    if max_airmass <= 1.0 {
        return 0.0;
    }
    weight * (max_airmass - airmass) / (max_airmass - 1.0)
}

/// Bonus for pointings near the meridian.
pub(crate) fn hour_angle_rank(hour_angle_rad: f64, hour_angle_max: f64, weight: f64) -> f64 {
    if hour_angle_max <= 0.0 {
        return 0.0;
    }
    let hours = hour_angle_rad.to_degrees() / 15.0;
    weight * (1.0 - hours.abs() / hour_angle_max)
}

/// Splits candidates into the `n` most valuable and the rest.
pub(crate) fn take_best(mut candidates: Vec<Target>, n: usize) -> (Vec<Target>, Vec<Target>) {
    candidates.sort_by(|a, b| b.value.total_cmp(&a.value));
    let losers = candidates.split_off(n.min(candidates.len()));
    (candidates, losers)
}

/// The proposal's own copy of a visited target, if it suggested one.
pub(crate) fn find_suggested<'a>(
    winners: &'a [Target],
    losers: &'a [Target],
    visit: &Target,
) -> Option<&'a Target> {
    winners
        .iter()
        .chain(losers)
        .find(|t| t.is_for(visit.field_id, &visit.filter))
}
