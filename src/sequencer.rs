//! Per-field visit sequences.
//!
//! A [`Sequence`] tracks one field of a time-distribution proposal. It is
//! made of named [`Subsequence`]s, each repeating an *event* a number of
//! times. An event is a fixed pattern of visits (for example `g g r r i i`);
//! a pattern longer than one visit is a deep-drilling event and is observed
//! back to back. Events are spaced by a time window relative to the
//! previous event.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Need returned by a subsequence that has not started yet.
pub const IDLE_NEED: f64 = 0.1;

/// Timing of an event relative to the previous one. `start`, `max` and
/// `end` are fractions of `interval` (seconds).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(rename = "time-interval")]
    pub interval: f64,
    #[serde(rename = "time-window-start")]
    pub start: f64,
    #[serde(rename = "time-window-max")]
    pub max: f64,
    #[serde(rename = "time-window-end")]
    pub end: f64,
}

impl TimeWindow {
    /// Need of a visit `dt` seconds after the previous event: 0 before the
    /// window opens, a linear ramp up to 1 at `max`, 1 until `end`, and -1
    /// once the window has been missed.
    pub fn need(&self, dt: f64) -> f64 {
        let start = self.start * self.interval;
        let max = self.max * self.interval;
        let end = self.end * self.interval;
        if dt < start {
            0.0
        } else if dt < max {
            (dt - start) / (max - start)
        } else if dt <= end {
            1.0
        } else {
            -1.0
        }
    }

    pub fn is_ordered(&self) -> bool {
        self.interval > 0.0 && self.start < self.max && self.max <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceState {
    Idle,
    Active,
    Complete,
    Lost,
}

impl SequenceState {
    pub fn is_idle_or_active(self) -> bool {
        matches!(self, Self::Idle | Self::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SubsequenceConfig {
    pub name: String,
    pub filters: Vec<String>,
    pub visits_per_filter: Vec<u32>,
    pub num_events: u32,
    pub num_max_missed: u32,
    #[serde(flatten)]
    pub window: TimeWindow,
}

impl SubsequenceConfig {
    /// The visit pattern of one event.
    pub fn pattern(&self) -> Vec<String> {
        self.filters
            .iter()
            .zip(&self.visits_per_filter)
            .flat_map(|(f, &n)| std::iter::repeat_n(f.clone(), n as usize))
            .collect()
    }
}

// ── Subsequence ──

#[derive(Debug, Clone, PartialEq)]
pub struct Subsequence {
    name: String,
    pattern: Vec<String>,
    num_events: u32,
    num_max_missed: u32,
    window: TimeWindow,
    /// Position in the pattern of the event in progress.
    index: usize,
    /// First visit of the event in progress.
    event_start: Option<f64>,
    /// Start (or miss) time of every event so far.
    events: Vec<f64>,
    observed: u32,
    missed: u32,
    visits: u32,
    state: SequenceState,
}

impl Subsequence {
    pub fn new(config: &SubsequenceConfig) -> Self {
        Self {
            name: config.name.clone(),
            pattern: config.pattern(),
            num_events: config.num_events,
            num_max_missed: config.num_max_missed,
            window: config.window,
            index: 0,
            event_start: None,
            events: Vec::new(),
            observed: 0,
            missed: 0,
            visits: 0,
            state: SequenceState::Idle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SequenceState {
        self.state
    }

    pub fn pattern(&self) -> &[String] {
        &self.pattern
    }

    /// Filter of the next visit.
    pub fn next_filter(&self) -> &str {
        &self.pattern[self.index]
    }

    pub fn is_deep_drilling(&self) -> bool {
        self.pattern.len() > 1
    }

    /// Whether an event is partly observed.
    pub fn in_deep_drilling(&self) -> bool {
        self.index > 0
    }

    pub fn is_first_visit(&self) -> bool {
        self.index == 0
    }

    /// Visits left in the current event, the next one included.
    pub fn remaining_visits(&self) -> u32 {
        u32::try_from(self.pattern.len() - self.index).unwrap_or(u32::MAX)
    }

    pub fn goal(&self) -> u32 {
        self.num_events * u32::try_from(self.pattern.len()).unwrap_or(u32::MAX)
    }

    pub fn filter_goals(&self) -> BTreeMap<String, u32> {
        let mut goals = BTreeMap::new();
        for filter in &self.pattern {
            *goals.entry(filter.clone()).or_default() += self.num_events;
        }
        goals
    }

    /// Visits made plus the credit given for missed events.
    pub fn visits(&self) -> u32 {
        self.visits
    }

    pub fn missed_events(&self) -> u32 {
        self.missed
    }

    pub fn observed_events(&self) -> u32 {
        self.observed
    }

    /// Need of the next event at `time`.
    pub fn need(&self, time: f64) -> f64 {
        match (self.state, self.events.last()) {
            (SequenceState::Idle, _) | (_, None) => IDLE_NEED,
            (_, Some(last)) => self.window.need(time - last),
        }
    }

    /// Advances the pattern. Returns whether this visit completed an event.
    ///
    /// A completed event is stamped with the time of its first visit.
    pub fn register_observation(&mut self, time: f64) -> bool {
        let start = *self.event_start.get_or_insert(time);
        self.visits += 1;
        self.index += 1;
        let completed = self.index == self.pattern.len();
        if completed {
            self.index = 0;
            self.event_start = None;
            self.events.push(start);
            self.observed += 1;
        }
        self.update_state();
        completed
    }

    /// Records a missed event, abandoning any partly observed one.
    ///
    /// Unless the miss loses the subsequence, the visits the event still
    /// lacked are credited as if they had been made.
    pub fn miss_observation(&mut self, time: f64) {
        let remaining = self.remaining_visits();
        self.index = 0;
        self.event_start = None;
        self.events.push(time);
        self.missed += 1;
        self.update_state();
        if self.state != SequenceState::Lost {
            self.visits += remaining;
        }
    }

    pub fn restart(&mut self) {
        self.index = 0;
        self.event_start = None;
        self.events.clear();
        self.observed = 0;
        self.missed = 0;
        self.visits = 0;
        self.state = SequenceState::Idle;
    }

    fn update_state(&mut self) {
        self.state = if self.events.is_empty() {
            SequenceState::Idle
        } else if self.missed > self.num_max_missed {
            SequenceState::Lost
        } else if self.observed + self.missed >= self.num_events {
            SequenceState::Complete
        } else {
            SequenceState::Active
        };
    }
}

// ── Sequence ──

/// One field's subsequences and their aggregate progress.
#[derive(Debug, Clone, PartialEq)]
pub struct Sequence {
    field_id: u32,
    subsequences: Vec<Subsequence>,
    /// Subsequences still running; finished or lost ones drop out.
    enabled: BTreeSet<String>,
    /// Subsequences whose event closed tonight under grouped-visit restriction.
    closed_tonight: BTreeSet<String>,
    /// Goal of one round; a restart does not change it.
    goal: u32,
    filter_goals: BTreeMap<String, u32>,
    filter_visits: BTreeMap<String, u32>,
    state: SequenceState,
}

impl Sequence {
    pub fn new(field_id: u32, configs: &[SubsequenceConfig]) -> Self {
        let subsequences: Vec<Subsequence> = configs.iter().map(Subsequence::new).collect();
        let mut filter_goals = BTreeMap::new();
        for sub in &subsequences {
            for (filter, goal) in sub.filter_goals() {
                *filter_goals.entry(filter).or_default() += goal;
            }
        }
        Self {
            field_id,
            enabled: subsequences.iter().map(|s| s.name.clone()).collect(),
            closed_tonight: BTreeSet::new(),
            goal: subsequences.iter().map(Subsequence::goal).sum(),
            filter_goals,
            filter_visits: BTreeMap::new(),
            state: SequenceState::Idle,
            subsequences,
        }
    }

    pub fn field_id(&self) -> u32 {
        self.field_id
    }

    pub fn state(&self) -> SequenceState {
        self.state
    }

    pub fn goal(&self) -> u32 {
        self.goal
    }

    /// Visits credited this round, missed-event credit included.
    pub fn visits(&self) -> u32 {
        self.subsequences.iter().map(Subsequence::visits).sum()
    }

    pub fn filter_goal(&self, filter: &str) -> u32 {
        self.filter_goals.get(filter).copied().unwrap_or(0)
    }

    pub fn filter_visits(&self, filter: &str) -> u32 {
        self.filter_visits.get(filter).copied().unwrap_or(0)
    }

    /// Visits made this round, by filter.
    pub fn filter_visit_counts(&self) -> &BTreeMap<String, u32> {
        &self.filter_visits
    }

    pub fn subsequence(&self, name: &str) -> Option<&Subsequence> {
        self.subsequences.iter().find(|s| s.name == name)
    }

    /// Subsequences that may be observed now.
    pub fn active_subsequences(&self) -> impl Iterator<Item = &Subsequence> {
        self.subsequences
            .iter()
            .filter(|s| self.enabled.contains(&s.name) && !self.closed_tonight.contains(&s.name))
    }

    pub fn in_deep_drilling(&self) -> bool {
        self.subsequences.iter().any(Subsequence::in_deep_drilling)
    }

    /// Re-opens subsequences closed during the previous night.
    pub fn start_night(&mut self) {
        self.closed_tonight.clear();
    }

    /// Registers a visit in `filter`, preferring the named subsequence.
    ///
    /// Returns the name of the subsequence that took the visit.
    pub fn register_observation(
        &mut self,
        filter: &str,
        subsequence: Option<&str>,
        time: f64,
        restrict_grouped_visits: bool,
    ) -> Option<String> {
        let position = subsequence
            .and_then(|name| self.active_position(|s| s.name == name && s.next_filter() == filter))
            .or_else(|| self.active_position(|s| s.next_filter() == filter))?;

        let sub = &mut self.subsequences[position];
        let completed = sub.register_observation(time);
        let name = sub.name.clone();
        let state = sub.state;

        *self.filter_visits.entry(filter.to_string()).or_default() += 1;
        if !state.is_idle_or_active() {
            self.enabled.remove(&name);
        } else if completed && restrict_grouped_visits {
            self.closed_tonight.insert(name.clone());
        }
        self.update_state();
        Some(name)
    }

    pub fn miss_observation(&mut self, name: &str, time: f64) {
        let Some(sub) = self.subsequences.iter_mut().find(|s| s.name == name) else {
            return;
        };
        sub.miss_observation(time);
        if !sub.state.is_idle_or_active() {
            self.enabled.remove(name);
        }
        self.update_state();
    }

    /// Starts a fresh round with every count back at zero.
    pub fn restart(&mut self) {
        for sub in &mut self.subsequences {
            sub.restart();
        }
        self.enabled = self.subsequences.iter().map(|s| s.name.clone()).collect();
        self.closed_tonight.clear();
        self.filter_visits.clear();
        self.update_state();
    }

    fn active_position(&self, pred: impl Fn(&Subsequence) -> bool) -> Option<usize> {
        self.subsequences.iter().position(|s| {
            self.enabled.contains(&s.name) && !self.closed_tonight.contains(&s.name) && pred(s)
        })
    }

    fn update_state(&mut self) {
        let states: Vec<SequenceState> = self.subsequences.iter().map(|s| s.state).collect();
        self.state = if states.contains(&SequenceState::Lost) {
            SequenceState::Lost
        } else if states.iter().all(|s| *s == SequenceState::Complete) {
            SequenceState::Complete
        } else if states.iter().all(|s| *s == SequenceState::Idle) {
            SequenceState::Idle
        } else {
            SequenceState::Active
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> TimeWindow {
        TimeWindow {
            interval: 1000.0,
            start: 0.5,
            max: 1.0,
            end: 2.0,
        }
    }

    fn config(name: &str, filters: &[&str], visits: &[u32], events: u32) -> SubsequenceConfig {
        SubsequenceConfig {
            name: name.to_string(),
            filters: filters.iter().map(|f| f.to_string()).collect(),
            visits_per_filter: visits.to_vec(),
            num_events: events,
            num_max_missed: 1,
            window: window(),
        }
    }

    #[test]
    fn window_need_ramps_holds_and_expires() {
        let w = window();
        assert_eq!(w.need(0.0), 0.0);
        assert_eq!(w.need(499.0), 0.0);
        assert_eq!(w.need(500.0), 0.0);
        assert!((w.need(750.0) - 0.5).abs() < 1e-12);
        assert_eq!(w.need(1000.0), 1.0);
        assert_eq!(w.need(2000.0), 1.0);
        assert_eq!(w.need(2000.1), -1.0);
        assert!(w.is_ordered());
    }

    #[test]
    fn window_need_is_monotonic_inside_ramp() {
        let w = window();
        let mut last = 0.0;
        for dt in (500..=1000).step_by(25) {
            let need = w.need(f64::from(dt));
            assert!(need >= last);
            last = need;
        }
    }

    #[test]
    fn pattern_expands_visits_per_filter() {
        let c = config("dd", &["g", "r"], &[2, 1], 3);
        assert_eq!(c.pattern(), vec!["g", "g", "r"]);
        let sub = Subsequence::new(&c);
        assert!(sub.is_deep_drilling());
        assert_eq!(sub.goal(), 9);
        assert_eq!(sub.filter_goals()["g"], 6);
    }

    #[test]
    fn event_completes_after_full_pattern() {
        let mut sub = Subsequence::new(&config("dd", &["g", "r"], &[1, 1], 2));
        assert_eq!(sub.need(0.0), IDLE_NEED);
        assert!(!sub.register_observation(10.0));
        assert!(sub.in_deep_drilling());
        assert_eq!(sub.next_filter(), "r");
        assert_eq!(sub.remaining_visits(), 1);
        assert!(sub.register_observation(20.0));
        assert!(!sub.in_deep_drilling());
        assert_eq!(sub.state(), SequenceState::Active);
        assert_eq!(sub.visits(), 2);
        // Next event is timed from the first visit of the completed one.
        assert!((sub.need(760.0) - 0.5).abs() < 1e-12);
        assert!((sub.need(770.0) - 0.52).abs() < 1e-12);
    }

    #[test]
    fn misses_lose_the_subsequence() {
        let mut sub = Subsequence::new(&config("s", &["r"], &[1], 10));
        sub.miss_observation(0.0);
        assert_eq!(sub.state(), SequenceState::Active);
        sub.miss_observation(100.0);
        assert_eq!(sub.state(), SequenceState::Lost);
    }

    #[test]
    fn miss_abandons_partial_event() {
        let mut sub = Subsequence::new(&config("dd", &["g", "r"], &[1, 1], 5));
        sub.register_observation(0.0);
        sub.miss_observation(10.0);
        assert!(!sub.in_deep_drilling());
        assert_eq!(sub.next_filter(), "g");
        assert_eq!(sub.missed_events(), 1);
        // One visit made, the unobserved `r` credited.
        assert_eq!(sub.visits(), 2);
        // Window timing restarts from the miss.
        assert!((sub.need(760.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn single_visit_miss_credits_one_visit() {
        let mut sub = Subsequence::new(&config("s", &["r"], &[1], 10));
        sub.miss_observation(0.0);
        assert_eq!(sub.visits(), 1);
    }

    #[test]
    fn losing_miss_credits_nothing() {
        let mut sub = Subsequence::new(&config("dd", &["g", "r"], &[1, 1], 5));
        sub.miss_observation(0.0);
        assert_eq!(sub.visits(), 2);
        sub.register_observation(1000.0);
        sub.miss_observation(1010.0);
        assert_eq!(sub.state(), SequenceState::Lost);
        assert_eq!(sub.visits(), 3);
    }

    #[test]
    fn sequence_registers_exactly_one_subsequence() {
        let mut seq = Sequence::new(
            7,
            &[config("a", &["r"], &[1], 2), config("b", &["r"], &[1], 2)],
        );
        assert_eq!(seq.goal(), 4);

        let name = seq.register_observation("r", Some("b"), 0.0, false);
        assert_eq!(name.as_deref(), Some("b"));
        assert_eq!(seq.subsequence("a").unwrap().visits(), 0);
        assert_eq!(seq.subsequence("b").unwrap().visits(), 1);

        let name = seq.register_observation("r", None, 10.0, false);
        assert_eq!(name.as_deref(), Some("a"));
        assert_eq!(seq.visits(), 2);
        assert_eq!(seq.filter_visits("r"), 2);
        assert_eq!(seq.state(), SequenceState::Active);
    }

    #[test]
    fn unmatched_filter_is_not_registered() {
        let mut seq = Sequence::new(1, &[config("a", &["r"], &[1], 2)]);
        assert!(seq.register_observation("g", None, 0.0, false).is_none());
        assert_eq!(seq.visits(), 0);
    }

    #[test]
    fn completed_sequence_restarts_a_fresh_round() {
        let mut seq = Sequence::new(1, &[config("a", &["r"], &[1], 1)]);
        seq.register_observation("r", None, 0.0, false);
        assert_eq!(seq.state(), SequenceState::Complete);
        assert_eq!(seq.active_subsequences().count(), 0);
        assert_eq!(seq.visits(), 1);

        seq.restart();
        assert_eq!(seq.state(), SequenceState::Idle);
        assert_eq!(seq.goal(), 1);
        assert_eq!(seq.visits(), 0);
        assert_eq!(seq.filter_visits("r"), 0);
        assert_eq!(seq.active_subsequences().count(), 1);
    }

    #[test]
    fn sequence_visits_include_miss_credit() {
        let mut seq = Sequence::new(1, &[config("dd", &["g", "r"], &[1, 1], 3)]);
        seq.register_observation("g", None, 0.0, false);
        seq.miss_observation("dd", 10.0);
        assert_eq!(seq.visits(), 2);
        assert_eq!(seq.filter_visits("g"), 1);
        assert_eq!(seq.filter_visits("r"), 0);
    }

    #[test]
    fn grouped_restriction_closes_until_next_night() {
        let mut seq = Sequence::new(1, &[config("a", &["r"], &[1], 5)]);
        seq.register_observation("r", None, 0.0, true);
        assert_eq!(seq.active_subsequences().count(), 0);
        seq.start_night();
        assert_eq!(seq.active_subsequences().count(), 1);
    }

    #[test]
    fn lost_subsequence_loses_sequence() {
        let mut seq = Sequence::new(
            1,
            &[config("a", &["r"], &[1], 5), config("b", &["g"], &[1], 5)],
        );
        seq.miss_observation("a", 0.0);
        seq.miss_observation("a", 1.0);
        assert_eq!(seq.state(), SequenceState::Lost);
    }
}
