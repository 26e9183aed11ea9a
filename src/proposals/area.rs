//! Area distribution: spread a number of visits per filter over a region.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::catalog::{Field, SkyRegion};
use crate::lookahead::Lookahead;
use crate::model::{Contribution, Target};
use crate::sequencer::TimeWindow;
use crate::sky::SkyModel;

use super::{
    Conditions, ConstraintOverrides, FilterConfig, NightContext, Proposal, ProposalConstraints,
    ProposalError, ProposalKind, Result, SchedulingConfig, Screen, SuggestRequest, Tally,
    airmass_rank, find_suggested, hour_angle_rank, take_best,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AreaConfig {
    pub name: String,
    #[serde(default)]
    pub sky_region: SkyRegion,
    #[serde(default)]
    pub constraints: ProposalConstraints,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    /// Spacing between the visits of a group.
    #[serde(default = "default_group_window")]
    pub group_window: TimeWindow,
    #[serde(default = "default_time_weight")]
    pub time_weight: f64,
    /// Visits per field per night; zero for no limit.
    #[serde(default)]
    pub field_revisit_limit: u32,
    #[serde(default)]
    pub filters: BTreeMap<String, FilterConfig>,
}

fn default_group_window() -> TimeWindow {
    TimeWindow {
        interval: 1800.0,
        start: 0.5,
        max: 1.0,
        end: 2.0,
    }
}

fn default_time_weight() -> f64 {
    1.0
}

type Key = (u32, String);

/// Survey-wide state of one (field, filter) goal.
#[derive(Debug, Clone)]
struct AreaTarget {
    template: Target,
    goal: u32,
    visits: u32,
    group_id: u32,
    group_index: u32,
    last_visit_time: Option<f64>,
}

impl AreaTarget {
    fn progress(&self) -> f64 {
        if self.goal == 0 {
            1.0
        } else {
            f64::from(self.visits) / f64::from(self.goal)
        }
    }
}

pub struct AreaDistributionProposal {
    id: u32,
    config: AreaConfig,
    overrides: ConstraintOverrides,
    targets: BTreeMap<Key, AreaTarget>,
    /// Goals met; never recreated.
    retired: BTreeSet<Key>,
    tonight: BTreeSet<Key>,
    tonight_fields: Vec<Field>,
    visits_tonight: BTreeMap<u32, u32>,
    tally: Tally,
    winners: Vec<Target>,
    losers: Vec<Target>,
    last_observation: Option<Target>,
    last_observation_was_ours: bool,
}

impl AreaDistributionProposal {
    pub fn new(id: u32, config: AreaConfig, overrides: ConstraintOverrides) -> Result<Self> {
        let invalid = |reason: &str| ProposalError::Invalid {
            name: config.name.clone(),
            reason: reason.to_string(),
        };
        if config.constraints.max_airmass <= 1.0 {
            return Err(invalid("max-airmass must exceed 1"));
        }
        if config.filters.values().any(|f| f.exp_times.is_empty()) {
            return Err(invalid("every filter needs at least one exposure"));
        }
        if config.filters.values().any(|f| f.num_grouped_visits == 0) {
            return Err(invalid("num-grouped-visits must be at least 1"));
        }
        if config.filters.values().any(|f| f.num_grouped_visits > 1)
            && !config.group_window.is_ordered()
        {
            return Err(invalid("group window must satisfy start < max <= end"));
        }

        Ok(Self {
            id,
            config,
            overrides,
            targets: BTreeMap::new(),
            retired: BTreeSet::new(),
            tonight: BTreeSet::new(),
            tonight_fields: Vec::new(),
            visits_tonight: BTreeMap::new(),
            tally: Tally::default(),
            winners: Vec::new(),
            losers: Vec::new(),
            last_observation: None,
            last_observation_was_ours: false,
        })
    }

    /// Visits booked on one (field, filter) goal.
    pub fn target_visits(&self, field_id: u32, filter: &str) -> u32 {
        self.targets
            .get(&(field_id, filter.to_string()))
            .map_or(0, |t| t.visits)
    }

    fn close_group(&mut self, key: &Key) {
        if let Some(target) = self.targets.get_mut(key) {
            target.group_id += 1;
            target.group_index = 1;
        }
        if self.config.scheduling.restrict_grouped_visits {
            self.tonight.remove(key);
        }
    }

    fn is_repeat(&self, field_id: u32, filter: &str) -> bool {
        !self.config.scheduling.accept_consecutive_visits
            && self.last_observation_was_ours
            && self
                .last_observation
                .as_ref()
                .is_some_and(|t| t.is_for(field_id, filter))
    }
}

impl Proposal for AreaDistributionProposal {
    fn id(&self) -> u32 {
        self.id
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> ProposalKind {
        ProposalKind::General
    }

    fn start_night(&mut self, context: &NightContext<'_>) {
        self.tally.start_night();
        self.visits_tonight.clear();
        self.tonight.clear();
        self.last_observation = None;
        self.last_observation_was_ours = false;

        let fields = context.catalog.select(&self.config.sky_region);
        for field in &fields {
            for (filter, settings) in &self.config.filters {
                let key = (field.id, filter.clone());
                if settings.visits == 0 || self.retired.contains(&key) {
                    continue;
                }
                let target = self.targets.entry(key.clone()).or_insert_with(|| {
                    self.tally.add_goal(filter, settings.visits);
                    AreaTarget {
                        template: Target::new(
                            field.id,
                            filter.clone(),
                            field.ra,
                            field.dec,
                            settings.exp_times.clone(),
                        ),
                        goal: settings.visits,
                        visits: 0,
                        group_id: 1,
                        group_index: 1,
                        last_visit_time: None,
                    }
                });
                if target.progress() < 1.0 && context.mounted_filters.contains(filter) {
                    self.tonight.insert(key);
                }
            }
        }
        self.tonight_fields = fields
            .into_iter()
            .filter(|f| self.tonight.iter().any(|(id, _)| *id == f.id))
            .collect();

        debug!(
            proposal = %self.config.name,
            fields = self.tonight_fields.len(),
            targets = self.tonight.len(),
            night = context.night,
            "area proposal night started"
        );
    }

    fn end_night(&mut self, _time: f64) {
        debug!(
            proposal = %self.config.name,
            visits = self.tally.tonight_visits,
            progress = self.tally.progress(),
            "area proposal night ended"
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

        let screen = Screen {
            constraints: &self.config.constraints,
            overrides: self.overrides,
        };
        if !screen.clouds_ok(request.cloud) {
            return Vec::new();
        }

        // During deep drilling the field is only scored so that a
        // serendipitous visit still registers.
        let (fields, num_targets): (Vec<Field>, usize) = match request.deep_drilling {
            Some(dd) => (
                self.tonight_fields
                    .iter()
                    .filter(|f| f.id == dd.field_id)
                    .cloned()
                    .collect(),
                0,
            ),
            None => (
                self.tonight_fields.clone(),
                self.config.scheduling.max_num_targets,
            ),
        };

        let conditions = Conditions::gather(sky, request.time, &fields);
        let survey_progress = self.tally.progress();
        let scheduling = &self.config.scheduling;
        let lookahead = lookahead
            .filter(|l| l.is_enabled() && scheduling.lookahead_bonus_weight > 0.0);

        let mut candidates = Vec::new();
        let mut expired = Vec::new();
        for (i, field) in fields.iter().enumerate() {
            let airmass = conditions.airmass[i];
            if !screen.field_ok(airmass, conditions.moon_distance[i]) {
                continue;
            }
            let field_bonus = airmass_rank(
                airmass,
                self.config.constraints.max_airmass,
                scheduling.airmass_bonus,
            ) + hour_angle_rank(
                conditions.hour_angle[i],
                scheduling.hour_angle_max,
                scheduling.hour_angle_bonus,
            );

            for (filter, settings) in &self.config.filters {
                let key = (field.id, filter.clone());
                if !self.tonight.contains(&key) {
                    continue;
                }
                if request.constrained_filter.is_some_and(|c| c != filter.as_str()) {
                    continue;
                }
                let Some(target) = self.targets.get(&key) else {
                    continue;
                };
                let brightness = conditions.brightness(filter, i);
                if !screen.filter_ok(settings, brightness, request.seeing) {
                    continue;
                }
                if self.is_repeat(field.id, filter) {
                    continue;
                }

                let area_rank = if survey_progress < 1.0 {
                    (1.0 - target.progress()) / (1.0 - survey_progress)
                } else {
                    0.0
                };
                let need = match target.last_visit_time {
                    Some(last) if settings.num_grouped_visits > 1 && target.group_index > 1 => {
                        let time_rank = self.config.group_window.need(request.time - last);
                        if time_rank > 0.0 {
                            area_rank + time_rank * self.config.time_weight
                        } else {
                            time_rank
                        }
                    }
                    _ => area_rank,
                };
                if need < 0.0 {
                    expired.push(key);
                    continue;
                }
                if need == 0.0 {
                    continue;
                }

                let lookahead_rank = lookahead.map_or(0.0, |l| {
                    l.lookup_field(field.id, filter) * scheduling.lookahead_bonus_weight
                });
                let bonus = field_bonus + lookahead_rank;

                let mut candidate = target.template.clone();
                candidate.time = request.time;
                candidate.airmass = airmass;
                candidate.sky_brightness = brightness;
                candidate.cloud = request.cloud;
                candidate.seeing = request.seeing;
                candidate.need = need;
                candidate.bonus = bonus;
                candidate.value = need + bonus;
                candidate.group_id = target.group_id;
                candidate.group_index = target.group_index;
                candidate.contributions = vec![Contribution::new(self.id, need, bonus)];
                trace!(field = field.id, filter, need, bonus, "area candidate");
                candidates.push(candidate);
            }
        }

        for key in &expired {
            self.close_group(key);
        }

        let (winners, losers) = take_best(candidates, num_targets);
        self.winners = winners;
        self.losers = losers;
        self.winners.clone()
    }

    fn register_observation(&mut self, visit: &Target) -> Option<Target> {
        self.last_observation = Some(visit.clone());
        self.last_observation_was_ours = false;

        if !visit.has_contribution(self.id) && !self.config.scheduling.accept_serendipity {
            return None;
        }
        let suggested = find_suggested(&self.winners, &self.losers, visit)?.clone();
        let key = (visit.field_id, visit.filter.clone());
        let target = self.targets.get_mut(&key)?;

        target.visits += 1;
        target.last_visit_time = Some(visit.time);
        let progress = target.progress();
        let group_full = target.group_index
            >= self
                .config
                .filters
                .get(&visit.filter)
                .map_or(1, |f| f.num_grouped_visits);
        if !group_full {
            target.group_index += 1;
        }

        self.tally.record_visit(&visit.filter);
        self.last_observation_was_ours = true;
        let field_visits = self.visits_tonight.entry(visit.field_id).or_default();
        *field_visits += 1;
        let field_visits = *field_visits;

        let limit = self.config.field_revisit_limit;
        let limit_reached = limit > 0 && field_visits >= limit;
        if progress >= 1.0 {
            self.tonight.remove(&key);
            self.retired.insert(key);
        } else if group_full && !limit_reached {
            self.close_group(&key);
        }
        if limit_reached {
            self.tonight.retain(|(id, _)| *id != visit.field_id);
            self.tonight_fields.retain(|f| f.id != visit.field_id);
        }

        Some(suggested)
    }

    fn tally(&self) -> &Tally {
        &self.tally
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::proposals::SuggestRequest;
    use crate::testing;

    fn config(visits: u32, grouped: u32) -> AreaConfig {
        AreaConfig {
            name: "Wide".to_string(),
            sky_region: SkyRegion::default(),
            constraints: ProposalConstraints::default(),
            scheduling: SchedulingConfig::default(),
            group_window: default_group_window(),
            time_weight: 1.0,
            field_revisit_limit: 0,
            filters: BTreeMap::from([(
                "r".to_string(),
                FilterConfig {
                    visits,
                    num_grouped_visits: grouped,
                    ..FilterConfig::default()
                },
            )]),
        }
    }

    fn started(config: AreaConfig) -> AreaDistributionProposal {
        let mut proposal =
            AreaDistributionProposal::new(1, config, ConstraintOverrides::default()).unwrap();
        let catalog = testing::catalog();
        let mounted = testing::mounted_filters();
        proposal.start_night(&NightContext {
            time: 0.0,
            night: 1,
            mounted_filters: &mounted,
            catalog: &catalog,
        });
        proposal
    }

    fn request(time: f64) -> SuggestRequest<'static> {
        SuggestRequest {
            time,
            deep_drilling: None,
            constrained_filter: None,
            cloud: 0.0,
            seeing: 0.8,
        }
    }

    fn visit(target: &Target, time: f64) -> Target {
        let mut v = target.clone();
        v.time = time;
        v
    }

    #[test]
    fn suggests_observable_fields_only() {
        let mut proposal = started(config(10, 1));
        let mut sky = testing::static_sky();
        let targets = proposal.suggest_targets(&request(0.0), &mut sky, None);

        // Field 4 sits below the horizon on the static sky.
        let fields: BTreeSet<u32> = targets.iter().map(|t| t.field_id).collect();
        assert!(!fields.contains(&4));
        assert!(!targets.is_empty());
        for t in &targets {
            assert_eq!(t.contributions.len(), 1);
            assert_eq!(t.contributions[0].proposal_id, 1);
            assert!((t.value - (t.need + t.bonus)).abs() < 1e-12);
        }
        // Higher fields get a larger airmass bonus and rank first.
        assert!(targets.windows(2).all(|w| w[0].value >= w[1].value));
    }

    #[test]
    fn clouds_close_the_proposal() {
        let mut proposal = started(config(10, 1));
        let mut sky = testing::static_sky();
        let mut cloudy = request(0.0);
        cloudy.cloud = 0.9;
        assert!(proposal.suggest_targets(&cloudy, &mut sky, None).is_empty());
    }

    #[test]
    fn constrained_filter_limits_candidates() {
        let mut proposal = started(config(10, 1));
        let mut sky = testing::static_sky();
        let mut constrained = request(0.0);
        constrained.constrained_filter = Some("g");
        assert!(proposal.suggest_targets(&constrained, &mut sky, None).is_empty());
    }

    #[test]
    fn registering_counts_and_blocks_consecutive_repeat() {
        let mut proposal = started(config(10, 1));
        let mut sky = testing::static_sky();
        let targets = proposal.suggest_targets(&request(0.0), &mut sky, None);
        let first = targets[0].clone();

        let booked = proposal.register_observation(&visit(&first, 10.0)).unwrap();
        assert!(booked.is_for(first.field_id, "r"));
        assert_eq!(proposal.target_visits(first.field_id, "r"), 1);
        assert_eq!(proposal.tally().visits, 1);

        let next = proposal.suggest_targets(&request(100.0), &mut sky, None);
        assert!(next.iter().all(|t| t.field_id != first.field_id));
    }

    #[test]
    fn foreign_observations_are_ignored_without_serendipity() {
        let mut proposal = started(config(10, 1));
        let mut sky = testing::static_sky();
        let targets = proposal.suggest_targets(&request(0.0), &mut sky, None);
        let mut foreign = visit(&targets[0], 10.0);
        foreign.contributions[0].proposal_id = 99;
        assert!(proposal.register_observation(&foreign).is_none());
        assert_eq!(proposal.tally().visits, 0);
    }

    #[test]
    fn completed_goal_retires_target() {
        let mut proposal = started(config(1, 1));
        let mut sky = testing::static_sky();
        let targets = proposal.suggest_targets(&request(0.0), &mut sky, None);
        let first = targets[0].clone();
        proposal.register_observation(&visit(&first, 10.0));

        let next = proposal.suggest_targets(&request(100.0), &mut sky, None);
        assert!(next.iter().all(|t| t.field_id != first.field_id));
        assert!(proposal.retired.contains(&(first.field_id, "r".to_string())));
    }

    #[test]
    fn grouped_visits_wait_for_window() {
        let mut config = config(10, 2);
        config.scheduling.accept_consecutive_visits = true;
        let mut proposal = started(config);
        let mut sky = testing::static_sky();
        let targets = proposal.suggest_targets(&request(0.0), &mut sky, None);
        let first = targets[0].clone();
        proposal.register_observation(&visit(&first, 0.0));

        // Window opens at 900 s and peaks at 1800 s.
        let early = proposal.suggest_targets(&request(600.0), &mut sky, None);
        assert!(early.iter().all(|t| t.field_id != first.field_id));

        let ready = proposal.suggest_targets(&request(1800.0), &mut sky, None);
        let pair = ready.iter().find(|t| t.field_id == first.field_id).unwrap();
        assert_eq!(pair.group_index, 2);
        assert!(pair.need > 1.0);
    }

    #[test]
    fn missed_group_window_closes_group() {
        let mut config = config(10, 2);
        config.scheduling.accept_consecutive_visits = true;
        let mut proposal = started(config);
        let mut sky = testing::static_sky();
        let targets = proposal.suggest_targets(&request(0.0), &mut sky, None);
        let first = targets[0].clone();
        proposal.register_observation(&visit(&first, 0.0));

        let late = proposal.suggest_targets(&request(4000.0), &mut sky, None);
        assert!(late.iter().all(|t| t.field_id != first.field_id));
        let key = (first.field_id, "r".to_string());
        assert_eq!(proposal.targets[&key].group_id, 2);
        assert!(!proposal.tonight.contains(&key));
    }

    #[test]
    fn revisit_limit_drops_field_for_the_night() {
        let mut config = config(10, 1);
        config.field_revisit_limit = 1;
        config.scheduling.accept_consecutive_visits = true;
        let mut proposal = started(config);
        let mut sky = testing::static_sky();
        let targets = proposal.suggest_targets(&request(0.0), &mut sky, None);
        let first = targets[0].clone();
        proposal.register_observation(&visit(&first, 0.0));
        let next = proposal.suggest_targets(&request(100.0), &mut sky, None);
        assert!(next.iter().all(|t| t.field_id != first.field_id));
    }

    #[test]
    fn goal_met_on_revisit_limit_still_retires() {
        let mut config = config(1, 1);
        config.field_revisit_limit = 1;
        let mut proposal = started(config);
        let mut sky = testing::static_sky();
        let targets = proposal.suggest_targets(&request(0.0), &mut sky, None);
        let first = targets[0].clone();
        proposal.register_observation(&visit(&first, 0.0));

        let key = (first.field_id, "r".to_string());
        assert!(proposal.retired.contains(&key));

        let catalog = testing::catalog();
        let mounted = testing::mounted_filters();
        proposal.start_night(&NightContext {
            time: 86_400.0,
            night: 2,
            mounted_filters: &mounted,
            catalog: &catalog,
        });
        assert!(!proposal.tonight.contains(&key));
        let next = proposal.suggest_targets(&request(86_400.0), &mut sky, None);
        assert!(next.iter().all(|t| t.field_id != first.field_id));
    }

    #[test]
    fn invalid_airmass_limit_is_rejected() {
        let mut config = config(10, 1);
        config.constraints.max_airmass = 1.0;
        let err = AreaDistributionProposal::new(1, config, ConstraintOverrides::default())
            .err()
            .unwrap();
        assert!(matches!(err, ProposalError::Invalid { .. }));
    }
}
