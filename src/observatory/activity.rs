//! Slew activities and their prerequisite graph.
//!
//! A slew is a set of activities (axis motions, settling, optics
//! correction, filter change, readout) that run in parallel unless one is
//! configured as a prerequisite of another. The slew finishes when its
//! longest dependency chain, the critical path, finishes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// A named step of a slew.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Activity {
    TelAlt,
    TelAz,
    TelRot,
    TelSettle,
    TelOpticsOpenLoop,
    TelOpticsClosedLoop,
    DomAlt,
    DomAz,
    DomAzSettle,
    Filter,
    Readout,
    Exposures,
}

impl Activity {
    pub const ALL: [Activity; 12] = [
        Activity::TelAlt,
        Activity::TelAz,
        Activity::TelRot,
        Activity::TelSettle,
        Activity::TelOpticsOpenLoop,
        Activity::TelOpticsClosedLoop,
        Activity::DomAlt,
        Activity::DomAz,
        Activity::DomAzSettle,
        Activity::Filter,
        Activity::Readout,
        Activity::Exposures,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::TelAlt => "tel-alt",
            Self::TelAz => "tel-az",
            Self::TelRot => "tel-rot",
            Self::TelSettle => "tel-settle",
            Self::TelOpticsOpenLoop => "tel-optics-open-loop",
            Self::TelOpticsClosedLoop => "tel-optics-closed-loop",
            Self::DomAlt => "dom-alt",
            Self::DomAz => "dom-az",
            Self::DomAzSettle => "dom-az-settle",
            Self::Filter => "filter",
            Self::Readout => "readout",
            Self::Exposures => "exposures",
        }
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The prerequisite configuration is not a DAG.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("prerequisite cycle through {0}")]
    Cycle(Activity),

    #[error("{0} lists itself as a prerequisite")]
    SelfLoop(Activity),
}

/// Reference prerequisites: the closed-loop optics correction waits on
/// everything that disturbs the beam, and exposures wait on the optics.
pub fn default_prerequisites() -> BTreeMap<Activity, Vec<Activity>> {
    use Activity::*;
    BTreeMap::from([
        (DomAzSettle, vec![DomAz]),
        (TelOpticsOpenLoop, vec![TelAlt, TelAz]),
        (
            TelOpticsClosedLoop,
            vec![
                DomAlt,
                DomAzSettle,
                TelSettle,
                Readout,
                TelOpticsOpenLoop,
                Filter,
                TelRot,
            ],
        ),
        (TelSettle, vec![TelAlt, TelAz]),
        (Exposures, vec![TelOpticsClosedLoop]),
    ])
}

/// Validated prerequisite DAG with a cached topological order.
#[derive(Debug, Clone)]
pub struct PrerequisiteGraph {
    prereqs: BTreeMap<Activity, Vec<Activity>>,
    /// Every activity, prerequisites before dependents.
    order: Vec<Activity>,
}

impl PrerequisiteGraph {
    /// Validates the configured prerequisites. Activities absent from the
    /// map have no prerequisites.
    pub fn new(prereqs: BTreeMap<Activity, Vec<Activity>>) -> Result<Self, GraphError> {
        for (activity, before) in &prereqs {
            if before.contains(activity) {
                return Err(GraphError::SelfLoop(*activity));
            }
        }

        let mut order = Vec::with_capacity(Activity::ALL.len());
        let mut done = BTreeSet::new();
        let mut in_progress = BTreeSet::new();
        for activity in Activity::ALL {
            visit(activity, &prereqs, &mut done, &mut in_progress, &mut order)?;
        }
        Ok(Self { prereqs, order })
    }

    pub fn prerequisites(&self, activity: Activity) -> &[Activity] {
        self.prereqs.get(&activity).map_or(&[][..], Vec::as_slice)
    }

    /// Longest-path evaluation of the activities `root` depends on.
    ///
    /// `own_delay` is asked once for each activity in `root`'s dependency
    /// cone. An error from it aborts the evaluation.
    pub fn evaluate<E>(
        &self,
        root: Activity,
        mut own_delay: impl FnMut(Activity) -> Result<f64, E>,
    ) -> Result<CriticalPath, E> {
        let cone = self.dependency_cone(root);

        let mut delays = BTreeMap::new();
        let mut finish: BTreeMap<Activity, f64> = BTreeMap::new();
        let mut longest_prereq: BTreeMap<Activity, Activity> = BTreeMap::new();

        for &activity in self.order.iter().filter(|a| cone.contains(*a)) {
            let own = own_delay(activity)?;
            let mut start = 0.0;
            for &before in self.prerequisites(activity) {
                let f = finish.get(&before).copied().unwrap_or(0.0);
                if f > start {
                    start = f;
                    longest_prereq.insert(activity, before);
                }
            }
            delays.insert(activity, own);
            finish.insert(activity, start + own);
        }

        let mut path = vec![root];
        let mut cursor = root;
        while let Some(&before) = longest_prereq.get(&cursor) {
            path.push(before);
            cursor = before;
        }
        path.reverse();

        Ok(CriticalPath {
            total: finish.get(&root).copied().unwrap_or(0.0),
            delays,
            path,
        })
    }

    fn dependency_cone(&self, root: Activity) -> BTreeSet<Activity> {
        let mut cone = BTreeSet::new();
        let mut stack = vec![root];
        while let Some(activity) = stack.pop() {
            if cone.insert(activity) {
                stack.extend_from_slice(self.prerequisites(activity));
            }
        }
        cone
    }
}

fn visit(
    activity: Activity,
    prereqs: &BTreeMap<Activity, Vec<Activity>>,
    done: &mut BTreeSet<Activity>,
    in_progress: &mut BTreeSet<Activity>,
    order: &mut Vec<Activity>,
) -> Result<(), GraphError> {
    if done.contains(&activity) {
        return Ok(());
    }
    if !in_progress.insert(activity) {
        return Err(GraphError::Cycle(activity));
    }
    for &before in prereqs.get(&activity).map_or(&[][..], Vec::as_slice) {
        visit(before, prereqs, done, in_progress, order)?;
    }
    in_progress.remove(&activity);
    done.insert(activity);
    order.push(activity);
    Ok(())
}

/// Outcome of a critical-path evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CriticalPath {
    /// Total delay until the root activity finishes.
    pub total: f64,
    /// Each evaluated activity's own delay.
    pub delays: BTreeMap<Activity, f64>,
    /// The chain that determined `total`, first activity to root.
    pub path: Vec<Activity>,
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use super::*;
    use Activity::*;

    fn fixed(delays: &[(Activity, f64)]) -> impl FnMut(Activity) -> Result<f64, Infallible> + '_ {
        move |a| Ok(delays.iter().find(|(x, _)| *x == a).map_or(0.0, |(_, d)| *d))
    }

    #[test]
    fn default_graph_is_acyclic() {
        let graph = PrerequisiteGraph::new(default_prerequisites()).unwrap();
        assert_eq!(graph.prerequisites(Exposures), &[TelOpticsClosedLoop]);
        assert!(graph.prerequisites(TelAlt).is_empty());
    }

    #[test]
    fn cycle_is_rejected() {
        let prereqs = BTreeMap::from([
            (TelSettle, vec![TelAlt]),
            (TelAlt, vec![Filter]),
            (Filter, vec![TelSettle]),
        ]);
        let err = PrerequisiteGraph::new(prereqs).unwrap_err();
        assert!(matches!(err, GraphError::Cycle(_)));
    }

    #[test]
    fn self_loop_is_rejected() {
        let prereqs = BTreeMap::from([(Readout, vec![Readout])]);
        let err = PrerequisiteGraph::new(prereqs).unwrap_err();
        assert_eq!(err, GraphError::SelfLoop(Readout));
    }

    #[test]
    fn parallel_branches_take_the_maximum() {
        let graph = PrerequisiteGraph::new(default_prerequisites()).unwrap();
        let delays = [
            (TelAlt, 4.0),
            (TelAz, 10.0),
            (TelSettle, 3.0),
            (Filter, 120.0),
            (Readout, 2.0),
        ];
        let path = graph.evaluate(Exposures, fixed(&delays)).unwrap();
        assert_eq!(path.total, 120.0);
        assert_eq!(path.path, vec![Filter, TelOpticsClosedLoop, Exposures]);
    }

    #[test]
    fn chained_delays_add() {
        let graph = PrerequisiteGraph::new(default_prerequisites()).unwrap();
        let delays = [(TelAz, 10.0), (TelSettle, 3.0), (Readout, 2.0)];
        let path = graph.evaluate(Exposures, fixed(&delays)).unwrap();
        assert_eq!(path.total, 13.0);
        assert_eq!(
            path.path,
            vec![TelAz, TelSettle, TelOpticsClosedLoop, Exposures]
        );
        assert_eq!(path.delays[&TelSettle], 3.0);
    }

    #[test]
    fn only_the_dependency_cone_is_evaluated() {
        let graph = PrerequisiteGraph::new(default_prerequisites()).unwrap();
        let mut asked = Vec::new();
        graph
            .evaluate(TelSettle, |a| {
                asked.push(a);
                Ok::<_, Infallible>(1.0)
            })
            .unwrap();
        asked.sort();
        assert_eq!(asked, vec![TelAlt, TelAz, TelSettle]);
    }

    #[test]
    fn errors_abort_evaluation() {
        let graph = PrerequisiteGraph::new(default_prerequisites()).unwrap();
        let result = graph.evaluate(Exposures, |a| if a == Filter { Err("blocked") } else { Ok(1.0) });
        assert_eq!(result.unwrap_err(), "blocked");
    }
}
