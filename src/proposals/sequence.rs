//! Time distribution: per-field sequences of timed events.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::catalog::{Field, SkyRegion};
use crate::lookahead::Lookahead;
use crate::model::{Contribution, DeepDrillingVisit, Target};
use crate::sequencer::{Sequence, SequenceState, Subsequence, SubsequenceConfig};
use crate::sky::SkyModel;

use super::{
    Conditions, ConstraintOverrides, FilterConfig, NightContext, Proposal, ProposalConstraints,
    ProposalError, ProposalKind, Result, SchedulingConfig, Screen, SuggestRequest, Tally,
    airmass_rank, find_suggested, hour_angle_rank, take_best,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SequenceConfig {
    pub name: String,
    #[serde(default)]
    pub sky_region: SkyRegion,
    #[serde(default)]
    pub constraints: ProposalConstraints,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub restart_lost_sequences: bool,
    #[serde(default)]
    pub restart_complete_sequences: bool,
    /// Add the goal of a restarted sequence to the proposal's goal.
    #[serde(default = "default_true")]
    pub propagate_goal_delta: bool,
    /// Exposures and limits of every filter a subsequence uses.
    #[serde(default)]
    pub filters: BTreeMap<String, FilterConfig>,
    #[serde(default, rename = "subsequence")]
    pub subsequences: Vec<SubsequenceConfig>,
}

fn default_true() -> bool {
    true
}

pub struct TimeDistributionProposal {
    id: u32,
    config: SequenceConfig,
    overrides: ConstraintOverrides,
    fields: BTreeMap<u32, Field>,
    sequences: BTreeMap<u32, Sequence>,
    /// Fields whose sequence ended for good.
    retired: BTreeSet<u32>,
    tonight: BTreeSet<u32>,
    mounted_filters: Vec<String>,
    tally: Tally,
    winners: Vec<Target>,
    losers: Vec<Target>,
    /// Field and subsequence of the deep-drilling event in progress.
    drilling: Option<(u32, String)>,
}

impl TimeDistributionProposal {
    pub fn new(id: u32, config: SequenceConfig, overrides: ConstraintOverrides) -> Result<Self> {
        let invalid = |reason: String| ProposalError::Invalid {
            name: config.name.clone(),
            reason,
        };
        if config.subsequences.is_empty() {
            return Err(invalid("at least one subsequence is required".to_string()));
        }
        for sub in &config.subsequences {
            if sub.filters.len() != sub.visits_per_filter.len() {
                return Err(invalid(format!(
                    "subsequence {}: filters and visits-per-filter differ in length",
                    sub.name
                )));
            }
            if sub.pattern().is_empty() || sub.num_events == 0 {
                return Err(invalid(format!("subsequence {} has no visits", sub.name)));
            }
            if !sub.window.is_ordered() {
                return Err(invalid(format!(
                    "subsequence {}: time window must satisfy start < max <= end",
                    sub.name
                )));
            }
            if let Some(filter) = sub.filters.iter().find(|f| {
                config
                    .filters
                    .get(*f)
                    .is_none_or(|settings| settings.exp_times.is_empty())
            }) {
                return Err(invalid(format!(
                    "subsequence {}: filter {filter} has no exposures configured",
                    sub.name
                )));
            }
        }

        Ok(Self {
            id,
            config,
            overrides,
            fields: BTreeMap::new(),
            sequences: BTreeMap::new(),
            retired: BTreeSet::new(),
            tonight: BTreeSet::new(),
            mounted_filters: Vec::new(),
            tally: Tally::default(),
            winners: Vec::new(),
            losers: Vec::new(),
            drilling: None,
        })
    }

    pub fn sequence(&self, field_id: u32) -> Option<&Sequence> {
        self.sequences.get(&field_id)
    }

    pub fn is_retired(&self, field_id: u32) -> bool {
        self.retired.contains(&field_id)
    }

    fn pattern_filters(&self) -> BTreeSet<String> {
        self.config
            .subsequences
            .iter()
            .flat_map(|s| s.filters.iter().cloned())
            .collect()
    }

    /// Exposure time of a whole event of `sub`.
    fn event_exposure_time(&self, sub: &Subsequence) -> f64 {
        sub.pattern()
            .iter()
            .filter_map(|f| self.config.filters.get(f))
            .map(|settings| settings.exp_times.iter().sum::<f64>())
            .sum()
    }

    fn candidate(
        &self,
        field: &Field,
        sub: &Subsequence,
        request: &SuggestRequest<'_>,
    ) -> Option<Target> {
        let filter = sub.next_filter();
        let settings = self.config.filters.get(filter)?;
        let mut target = Target::new(
            field.id,
            filter,
            field.ra,
            field.dec,
            settings.exp_times.clone(),
        );
        target.time = request.time;
        target.cloud = request.cloud;
        target.seeing = request.seeing;
        if sub.is_deep_drilling() {
            target.deep_drilling = Some(DeepDrillingVisit {
                first_visit: sub.is_first_visit(),
                remaining_visits: sub.remaining_visits(),
                sequence_exposure_time: self.event_exposure_time(sub),
            });
        }
        Some(target)
    }

    fn contribution(&self, need: f64, bonus: f64, subsequence: &str) -> Contribution {
        let mut contribution = Contribution::new(self.id, need, bonus);
        contribution.subsequence = Some(subsequence.to_string());
        contribution
    }

    /// The next visit of the event in progress, the only thing proposed
    /// while drilling.
    fn continue_drilling(
        &mut self,
        field_id: u32,
        name: &str,
        request: &SuggestRequest<'_>,
    ) -> Vec<Target> {
        let next = self
            .sequences
            .get(&field_id)
            .and_then(|seq| seq.subsequence(name))
            .zip(self.fields.get(&field_id))
            .filter(|(sub, _)| self.mounted_filters.iter().any(|f| f == sub.next_filter()))
            .and_then(|(sub, field)| self.candidate(field, sub, request));
        let Some(mut target) = next else {
            self.interrupt(field_id, name, request.time);
            return Vec::new();
        };
        target.need = 1.0;
        target.value = 1.0;
        target.contributions = vec![self.contribution(1.0, 0.0, name)];
        self.winners = vec![target];
        self.winners.clone()
    }

    fn interrupt(&mut self, field_id: u32, name: &str, time: f64) {
        info!(
            proposal = %self.config.name,
            field = field_id,
            subsequence = name,
            "deep-drilling event interrupted"
        );
        self.drilling = None;
        if let Some(seq) = self.sequences.get_mut(&field_id) {
            seq.miss_observation(name, time);
        }
        self.settle(field_id);
    }

    /// Restarts or retires a sequence that has ended.
    ///
    /// A restarted sequence grows the proposal's goal by the visits it was
    /// credited during the round that ended.
    fn settle(&mut self, field_id: u32) {
        let Some(seq) = self.sequences.get_mut(&field_id) else {
            return;
        };
        let restart = match seq.state() {
            SequenceState::Lost => self.config.restart_lost_sequences,
            SequenceState::Complete => self.config.restart_complete_sequences,
            SequenceState::Idle | SequenceState::Active => return,
        };
        let state = seq.state();

        if restart {
            let credited = seq.visits();
            let filter_visits = seq.filter_visit_counts().clone();
            seq.restart();
            if self.config.propagate_goal_delta {
                self.tally.grow_goal(credited, &filter_visits);
            }
            debug!(proposal = %self.config.name, field = field_id, ?state, "sequence restarted");
        } else {
            self.sequences.remove(&field_id);
            self.tonight.remove(&field_id);
            self.retired.insert(field_id);
            debug!(proposal = %self.config.name, field = field_id, ?state, "sequence retired");
        }
    }
}

impl Proposal for TimeDistributionProposal {
    fn id(&self) -> u32 {
        self.id
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> ProposalKind {
        ProposalKind::Sequence
    }

    fn start_night(&mut self, context: &NightContext<'_>) {
        self.tally.start_night();
        self.tonight.clear();
        self.mounted_filters = context.mounted_filters.to_vec();
        let filters = self.pattern_filters();

        for field in context.catalog.select(&self.config.sky_region) {
            if self.retired.contains(&field.id) {
                continue;
            }
            let seq = self.sequences.entry(field.id).or_insert_with(|| {
                let seq = Sequence::new(field.id, &self.config.subsequences);
                for filter in &filters {
                    self.tally.add_goal(filter, seq.filter_goal(filter));
                }
                seq
            });
            seq.start_night();
            if seq.state().is_idle_or_active() {
                self.tonight.insert(field.id);
            }
            self.fields.insert(field.id, field);
        }

        debug!(
            proposal = %self.config.name,
            sequences = self.tonight.len(),
            night = context.night,
            "sequence proposal night started"
        );
    }

    fn end_night(&mut self, time: f64) {
        if let Some((field_id, name)) = self.drilling.clone() {
            self.interrupt(field_id, &name, time);
        }
        debug!(
            proposal = %self.config.name,
            visits = self.tally.tonight_visits,
            progress = self.tally.progress(),
            "sequence proposal night ended"
        );
    }

    fn suggest_targets(
        &mut self,
        request: &SuggestRequest<'_>,
        sky: &mut dyn SkyModel,
        lookahead: Option<&Lookahead>,
    ) -> Vec<Target> {
        self.winners.clear();
        self.losers.clear();

        if let Some((field_id, name)) = self.drilling.clone() {
            if request.deep_drilling.is_some_and(|dd| dd.field_id == field_id) {
                return self.continue_drilling(field_id, &name, request);
            }
            self.interrupt(field_id, &name, request.time);
        }

        let screen = Screen {
            constraints: &self.config.constraints,
            overrides: self.overrides,
        };
        if !screen.clouds_ok(request.cloud) {
            return Vec::new();
        }

        // Another proposal's deep drilling: score the field for serendipity
        // but propose nothing.
        let (field_ids, num_targets): (Vec<u32>, usize) = match request.deep_drilling {
            Some(dd) => (
                self.tonight
                    .iter()
                    .copied()
                    .filter(|id| *id == dd.field_id)
                    .collect(),
                0,
            ),
            None => (
                self.tonight.iter().copied().collect(),
                self.config.scheduling.max_num_targets,
            ),
        };
        let fields: Vec<Field> = field_ids
            .iter()
            .filter_map(|id| self.fields.get(id).cloned())
            .collect();

        let conditions = Conditions::gather(sky, request.time, &fields);
        let scheduling = &self.config.scheduling;
        let lookahead = lookahead
            .filter(|l| l.is_enabled() && scheduling.lookahead_bonus_weight > 0.0);

        let mut candidates = Vec::new();
        let mut missed = Vec::new();
        for (i, field) in fields.iter().enumerate() {
            let airmass = conditions.airmass[i];
            if !screen.field_ok(airmass, conditions.moon_distance[i]) {
                continue;
            }
            let Some(seq) = self.sequences.get(&field.id) else {
                continue;
            };
            let field_bonus = airmass_rank(
                airmass,
                self.config.constraints.max_airmass,
                scheduling.airmass_bonus,
            ) + hour_angle_rank(
                conditions.hour_angle[i],
                scheduling.hour_angle_max,
                scheduling.hour_angle_bonus,
            );

            // Best subsequence per filter.
            let mut best: BTreeMap<String, Target> = BTreeMap::new();
            for sub in seq.active_subsequences() {
                let need = sub.need(request.time);
                if need < 0.0 {
                    missed.push((field.id, sub.name().to_string()));
                    continue;
                }
                if need == 0.0 {
                    continue;
                }
                let filter = sub.next_filter();
                if request.constrained_filter.is_some_and(|c| c != filter) {
                    continue;
                }
                if !self.mounted_filters.iter().any(|f| f == filter) {
                    continue;
                }
                let Some(settings) = self.config.filters.get(filter) else {
                    continue;
                };
                let brightness = conditions.brightness(filter, i);
                if !screen.filter_ok(settings, brightness, request.seeing) {
                    continue;
                }
                let Some(mut candidate) = self.candidate(field, sub, request) else {
                    continue;
                };

                let lookahead_rank = lookahead.map_or(0.0, |l| {
                    l.lookup_field(field.id, filter) * scheduling.lookahead_bonus_weight
                });
                let bonus = field_bonus + lookahead_rank;
                candidate.airmass = airmass;
                candidate.sky_brightness = brightness;
                candidate.need = need;
                candidate.bonus = bonus;
                candidate.value = need + bonus;
                candidate.contributions = vec![self.contribution(need, bonus, sub.name())];
                trace!(field = field.id, filter, subsequence = sub.name(), need, "sequence candidate");

                let keep = best
                    .get(filter)
                    .is_none_or(|current| candidate.value > current.value);
                if keep {
                    best.insert(filter.to_string(), candidate);
                }
            }
            candidates.extend(best.into_values());
        }

        for (field_id, name) in missed {
            debug!(proposal = %self.config.name, field = field_id, subsequence = %name, "event missed");
            if let Some(seq) = self.sequences.get_mut(&field_id) {
                seq.miss_observation(&name, request.time);
            }
            self.settle(field_id);
        }
        // A settled sequence may have been retired after it was scored.
        candidates.retain(|t| self.sequences.contains_key(&t.field_id));

        let (winners, losers) = take_best(candidates, num_targets);
        self.winners = winners;
        self.losers = losers;
        self.winners.clone()
    }

    fn register_observation(&mut self, visit: &Target) -> Option<Target> {
        let contribution = visit.contribution(self.id);
        if contribution.is_none() && !self.config.scheduling.accept_serendipity {
            return None;
        }
        let suggested = find_suggested(&self.winners, &self.losers, visit)?.clone();
        let subsequence = contribution
            .or_else(|| suggested.contribution(self.id))
            .and_then(|c| c.subsequence.clone());

        let restrict = self.config.scheduling.restrict_grouped_visits;
        let seq = self.sequences.get_mut(&visit.field_id)?;
        let name = seq.register_observation(
            &visit.filter,
            subsequence.as_deref(),
            visit.time,
            restrict,
        )?;
        let drilling = seq
            .subsequence(&name)
            .is_some_and(Subsequence::in_deep_drilling);

        self.tally.record_visit(&visit.filter);
        self.drilling = drilling.then(|| (visit.field_id, name));
        self.settle(visit.field_id);
        Some(suggested)
    }

    fn tally(&self) -> &Tally {
        &self.tally
    }
}
