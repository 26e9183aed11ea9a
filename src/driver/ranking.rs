//! Merging, pricing and ordering candidates.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use tracing::trace;

use crate::model::{Contribution, Target};
use crate::observatory::ObservatoryModel;
use crate::sky::SkyModel;

/// Slew-time cost: a rational curve through `(0, 0)`, `(time_ref, cost_ref)`
/// and `(time_max, 1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeCostCurve {
    dc: f64,
    dt: f64,
    k: f64,
}

impl TimeCostCurve {
    /// Returns `None` unless the calibration gives a finite, increasing
    /// curve, which needs `time_ref > cost_ref * time_max`.
    pub fn new(time_max: f64, time_ref: f64, cost_ref: f64) -> Option<Self> {
        if [time_max, time_ref, cost_ref].iter().any(|v| v.is_nan() || *v <= 0.0) {
            return None;
        }
        let denominator = time_ref - cost_ref * time_max;
        if denominator <= 0.0 {
            return None;
        }
        let dc = cost_ref * (time_max - time_ref) / denominator;
        let dt = -time_max * (dc + 1.0);
        let curve = Self { dc, dt, k: dc * dt };
        (dc.is_finite() && dc > 0.0).then_some(curve)
    }

    pub fn cost(&self, slew_time: f64) -> f64 {
        self.k / (slew_time + self.dt) - self.dc
    }
}

/// Cost of changing filter `since_last` seconds after the previous change:
/// a linear ramp from 1 down to 0 over the average change interval.
pub fn filter_change_cost(since_last: f64, avg_interval: f64) -> f64 {
    if avg_interval > 0.0 && since_last < avg_interval {
        1.0 - since_last / avg_interval
    } else {
        0.0
    }
}

/// Per-proposal boosts that favor proposals behind schedule. Normalized to a
/// mean of 1.
pub fn time_balancing_boosts(progress: &[f64], time_progress: f64, enabled: bool) -> Vec<f64> {
    let raw: Vec<f64> = progress
        .iter()
        .map(|&p| {
            if !enabled || p <= 0.0 {
                return 1.0;
            }
            let need_index = if time_progress < 1.0 {
                (1.0 - p) / (1.0 - time_progress)
            } else {
                0.0
            };
            let progress_index = if time_progress > 0.0 {
                p / time_progress
            } else {
                1.0
            };
            need_index / progress_index
        })
        .collect();

    let sum: f64 = raw.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        return vec![1.0; raw.len()];
    }
    let n = raw.len() as f64;
    raw.into_iter().map(|b| b * n / sum).collect()
}

/// Product of the contributions' boosts.
fn merged_boost(contributions: &[Contribution]) -> f64 {
    contributions.iter().map(|c| c.boost).product()
}

type Key = (u32, String);

/// Candidates from every proposal, grouped by (field, filter).
#[derive(Debug, Default)]
pub struct CandidateSet {
    coadd: bool,
    entries: BTreeMap<Key, Vec<Target>>,
}

impl CandidateSet {
    pub fn new(coadd: bool) -> Self {
        Self {
            coadd,
            entries: BTreeMap::new(),
        }
    }

    /// Adds a proposal's candidate. With coadding, a candidate for a pair
    /// already present is folded into it; otherwise it becomes another
    /// alternative.
    pub fn add(&mut self, mut target: Target, boost: f64) {
        target.boost = boost;
        for contribution in &mut target.contributions {
            contribution.boost = boost;
        }

        match self.entries.entry((target.field_id, target.filter.clone())) {
            Entry::Vacant(slot) => {
                slot.insert(vec![target]);
            }
            Entry::Occupied(mut slot) if self.coadd => {
                let merged = &mut slot.get_mut()[0];
                merged.need += target.need;
                merged.bonus += target.bonus;
                merged.value += target.value;
                merged.contributions.extend(target.contributions);
                merged.boost = merged_boost(&merged.contributions);
                if target.deep_drilling.is_some() {
                    merged.deep_drilling = target.deep_drilling;
                    merged.group_id = target.group_id;
                    merged.group_index = target.group_index;
                }
            }
            Entry::Occupied(mut slot) => slot.get_mut().push(target),
        }
    }

    /// Distinct (field, filter) pairs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Targets held for one pair.
    pub fn get(&self, field_id: u32, filter: &str) -> Option<&[Target]> {
        self.entries
            .get(&(field_id, filter.to_string()))
            .map(Vec::as_slice)
    }

    /// Prices every feasible pair and returns the candidates by descending
    /// rank. Infeasible pairs are dropped.
    ///
    /// The slew delay is evaluated once per pair on the first alternative.
    pub fn rank(
        self,
        pricing: &Pricing,
        observatory: &mut ObservatoryModel,
        sky: &dyn SkyModel,
    ) -> Vec<Target> {
        let current_filter = observatory.state().filter.clone();
        let filter_cost = pricing.filter_weight
            * filter_change_cost(
                observatory.since_last_filter_change(),
                observatory.filter_change_avg_interval(),
            );

        let mut ranked = Vec::new();
        for ((field_id, filter), targets) in self.entries {
            let Some(first) = targets.first() else {
                continue;
            };
            let slew_time = match observatory.slew_delay(first, sky) {
                Ok(delay) => delay,
                Err(reason) => {
                    trace!(field = field_id, filter = %filter, %reason, "candidate infeasible");
                    continue;
                }
            };
            let mut cost = pricing.time_weight * pricing.curve.cost(slew_time);
            if filter != current_filter {
                cost += filter_cost;
            }
            for mut target in targets {
                target.slew_time = slew_time;
                target.cost = cost;
                target.rank = target.value * target.boost - cost;
                ranked.push(target);
            }
        }
        ranked.sort_by(|a, b| b.rank.total_cmp(&a.rank));
        ranked
    }
}

/// Weights and curve used to price candidates.
#[derive(Debug, Clone, Copy)]
pub struct Pricing {
    pub curve: TimeCostCurve,
    pub time_weight: f64,
    pub filter_weight: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::observatory::ObservatoryConfig;
    use crate::testing;

    fn curve() -> TimeCostCurve {
        TimeCostCurve::new(150.0, 5.0, 0.033).unwrap()
    }

    fn candidate(field: u32, filter: &str, proposal: u32, need: f64, bonus: f64) -> Target {
        let mut t = Target::new(field, filter, 0.0, 60_f64.to_radians(), vec![15.0, 15.0]);
        t.need = need;
        t.bonus = bonus;
        t.value = need + bonus;
        t.contributions = vec![Contribution::new(proposal, need, bonus)];
        t
    }

    fn pricing() -> Pricing {
        Pricing {
            curve: curve(),
            time_weight: 1.0,
            filter_weight: 1.0,
        }
    }

    #[test]
    fn cost_curve_hits_calibration_points() {
        let c = curve();
        assert!(c.cost(0.0).abs() < 1e-9);
        assert!((c.cost(5.0) - 0.033).abs() < 1e-9);
        assert!((c.cost(150.0) - 1.0).abs() < 1e-9);
        assert!((c.cost(2.0) - 0.0132).abs() < 1e-3);
        assert!((c.cost(60.0) - 0.398).abs() < 1e-3);
        assert!((c.cost(200.0) - 1.338).abs() < 1e-3);
    }

    #[test]
    fn cost_curve_is_monotonic() {
        let c = curve();
        let costs: Vec<f64> = (0..=300).map(|t| c.cost(f64::from(t))).collect();
        assert!(costs.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn degenerate_calibration_is_rejected() {
        assert!(TimeCostCurve::new(150.0, 5.0, 0.04).is_none());
        assert!(TimeCostCurve::new(0.0, 5.0, 0.033).is_none());
    }

    #[test]
    fn filter_cost_ramps_down() {
        assert_eq!(filter_change_cost(0.0, 100.0), 1.0);
        assert!((filter_change_cost(25.0, 100.0) - 0.75).abs() < 1e-12);
        assert_eq!(filter_change_cost(150.0, 100.0), 0.0);
        assert_eq!(filter_change_cost(0.0, 0.0), 0.0);
    }

    #[test]
    fn boosts_favor_lagging_proposals() {
        let boosts = time_balancing_boosts(&[0.2, 0.6, 0.0], 0.4, true);
        let mean = boosts.iter().sum::<f64>() / 3.0;
        assert!((mean - 1.0).abs() < 1e-12);
        assert!(boosts[0] > boosts[1]);

        assert_eq!(time_balancing_boosts(&[0.2, 0.6], 0.4, false), vec![1.0, 1.0]);
        // Everything finished at the end of the survey.
        assert_eq!(time_balancing_boosts(&[1.0, 1.0], 1.0, true), vec![1.0, 1.0]);
    }

    #[test]
    fn coadding_merges_contributions() {
        let mut set = CandidateSet::new(true);
        set.add(candidate(1, "r", 1, 0.5, 0.25), 1.0);
        set.add(candidate(1, "r", 2, 0.25, 0.0), 2.0);
        set.add(candidate(2, "r", 1, 0.5, 0.0), 1.0);
        assert_eq!(set.len(), 2);

        let merged = &set.get(1, "r").unwrap()[0];
        assert_eq!(merged.contributions.len(), 2);
        assert!((merged.need - 0.75).abs() < 1e-12);
        assert!((merged.bonus - 0.25).abs() < 1e-12);
        assert!((merged.value - 1.0).abs() < 1e-12);
        assert!((merged.boost - 2.0).abs() < 1e-12);
    }

    #[test]
    fn coadded_boosts_multiply() {
        let mut set = CandidateSet::new(true);
        set.add(candidate(1, "r", 1, 0.5, 0.0), 0.5);
        set.add(candidate(1, "r", 2, 0.5, 0.0), 1.5);
        let merged = &set.get(1, "r").unwrap()[0];
        assert!((merged.boost - 0.75).abs() < 1e-12);
        assert!((merged.contributions[0].boost - 0.5).abs() < 1e-12);
        assert!((merged.contributions[1].boost - 1.5).abs() < 1e-12);
    }

    #[test]
    fn without_coadding_alternatives_remain() {
        let mut set = CandidateSet::new(false);
        set.add(candidate(1, "r", 1, 0.5, 0.0), 1.0);
        set.add(candidate(1, "r", 2, 0.25, 0.0), 1.0);
        assert_eq!(set.len(), 1);
        let alternatives = set.get(1, "r").unwrap();
        assert_eq!(alternatives.len(), 2);
        assert!(alternatives.iter().all(|t| t.contributions.len() == 1));
    }

    #[test]
    fn merged_target_takes_deep_drilling_marker() {
        let mut set = CandidateSet::new(true);
        set.add(candidate(1, "r", 1, 0.5, 0.0), 1.0);
        let mut dd = candidate(1, "r", 2, 0.5, 0.0);
        dd.deep_drilling = Some(crate::model::DeepDrillingVisit {
            first_visit: true,
            remaining_visits: 3,
            sequence_exposure_time: 90.0,
        });
        set.add(dd, 1.0);
        assert!(set.get(1, "r").unwrap()[0].is_first_deep_drilling_visit());
    }

    #[test]
    fn ranking_drops_infeasible_pairs() {
        let sky = testing::static_sky();
        let mut observatory = ObservatoryModel::new(&ObservatoryConfig::default()).unwrap();
        let mut set = CandidateSet::new(true);
        set.add(candidate(1, "z", 1, 1.0, 0.0), 1.0);
        set.add(candidate(2, "u", 1, 5.0, 0.0), 1.0);
        let mut low = candidate(3, "z", 1, 1.0, 0.0);
        low.dec_rad = 10_f64.to_radians();
        set.add(low, 1.0);

        let ranked = set.rank(&pricing(), &mut observatory, &sky);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].field_id, 1);
        assert!(ranked[0].slew_time > 0.0);
        assert!((ranked[0].rank - (1.0 - ranked[0].cost)).abs() < 1e-12);
    }

    #[test]
    fn ranking_charges_filter_changes() {
        let sky = testing::static_sky();
        let mut observatory = ObservatoryModel::new(&ObservatoryConfig::default()).unwrap();
        let mut set = CandidateSet::new(true);
        set.add(candidate(1, "z", 1, 1.0, 0.0), 1.0);
        set.add(candidate(1, "r", 1, 1.0, 0.0), 1.0);

        let ranked = set.rank(&pricing(), &mut observatory, &sky);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].filter, "z");
        assert!(ranked[1].cost > ranked[0].cost);
    }
}
