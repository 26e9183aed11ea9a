//! Dark-time tracking and the daytime filter swap.

use std::collections::BTreeMap;

use tracing::info;

use crate::model::FilterSwap;
use crate::proposals::Proposal;

/// Follows the moon phase from one midnight to the next and decides when
/// the dark-time filter goes in or comes out.
#[derive(Debug, Clone, PartialEq)]
pub struct DarkTime {
    threshold: f64,
    dark: bool,
    midnight_phase: f64,
    last_swap: Option<FilterSwap>,
}

impl DarkTime {
    /// `threshold` is the moon phase, in percent, below which a night is
    /// dark.
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            dark: false,
            midnight_phase: 0.0,
            last_swap: None,
        }
    }

    pub fn is_dark(&self) -> bool {
        self.dark
    }

    pub fn midnight_phase(&self) -> f64 {
        self.midnight_phase
    }

    /// Remembers a swap so it can be undone when dark time ends.
    pub fn record_swap(&mut self, swap: FilterSwap) {
        self.last_swap = Some(swap);
    }

    /// Takes the moon phase at the coming midnight and returns the swap to
    /// make before that night, if any.
    ///
    /// Dark time starts once a waning moon drops below the threshold; the
    /// removable filter with the most progress makes room for the dark-time
    /// filter. It ends once a waxing moon rises above the threshold, and the
    /// previous swap is reversed.
    pub fn advance(
        &mut self,
        phase: f64,
        filter_progress: &BTreeMap<String, f64>,
        removable: &[String],
        darktime_filter: &str,
    ) -> Option<FilterSwap> {
        let previous = std::mem::replace(&mut self.midnight_phase, phase);

        if self.dark {
            if phase > previous && phase > self.threshold {
                info!(phase, "dark time ends");
                self.dark = false;
                return self.last_swap.as_ref().map(|swap| FilterSwap {
                    unmount: swap.mount.clone(),
                    mount: swap.unmount.clone(),
                });
            }
        } else if phase < previous && phase < self.threshold {
            info!(phase, "dark time starts");
            self.dark = true;
            let progress = |f: &str| filter_progress.get(f).copied().unwrap_or(0.0);
            let mut unmount: Option<&String> = None;
            for filter in removable {
                if unmount.is_none_or(|best| progress(filter) > progress(best)) {
                    unmount = Some(filter);
                }
            }
            return unmount.map(|unmount| FilterSwap {
                unmount: unmount.clone(),
                mount: darktime_filter.to_string(),
            });
        }
        None
    }
}

/// Survey-wide progress per filter, summed over proposals.
pub fn filter_progress(proposals: &[Box<dyn Proposal>], filters: &[String]) -> BTreeMap<String, f64> {
    filters
        .iter()
        .map(|filter| {
            let (visits, goal) = proposals.iter().fold((0u32, 0u32), |(v, g), p| {
                let tally = p.tally();
                (
                    v + tally.filter_visits.get(filter).copied().unwrap_or(0),
                    g + tally.filter_goal.get(filter).copied().unwrap_or(0),
                )
            });
            let progress = if goal > 0 {
                f64::from(visits) / f64::from(goal)
            } else {
                0.0
            };
            (filter.clone(), progress)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn removable() -> Vec<String> {
        vec!["y".to_string(), "z".to_string()]
    }

    fn progress() -> BTreeMap<String, f64> {
        BTreeMap::from([("y".to_string(), 0.2), ("z".to_string(), 0.5)])
    }

    #[test]
    fn waning_moon_enters_dark_time() {
        let mut dark = DarkTime::new(20.0);
        // First night: the phase rises from the initial zero.
        assert!(dark.advance(60.0, &progress(), &removable(), "u").is_none());
        assert!(dark.advance(35.0, &progress(), &removable(), "u").is_none());

        let swap = dark.advance(15.0, &progress(), &removable(), "u").unwrap();
        assert_eq!(swap.unmount, "z");
        assert_eq!(swap.mount, "u");
        assert!(dark.is_dark());

        // Still dark while the moon wanes toward new.
        assert!(dark.advance(5.0, &progress(), &removable(), "u").is_none());
    }

    #[test]
    fn waxing_moon_reverses_last_swap() {
        let mut dark = DarkTime::new(20.0);
        dark.advance(40.0, &progress(), &removable(), "u");
        let swap = dark.advance(10.0, &progress(), &removable(), "u").unwrap();
        dark.record_swap(swap);

        assert!(dark.advance(15.0, &progress(), &removable(), "u").is_none());
        let back = dark.advance(25.0, &progress(), &removable(), "u").unwrap();
        assert_eq!(back.unmount, "u");
        assert_eq!(back.mount, "z");
        assert!(!dark.is_dark());
    }

    #[test]
    fn ties_keep_first_removable_filter() {
        let mut dark = DarkTime::new(20.0);
        dark.advance(40.0, &BTreeMap::new(), &removable(), "u");
        let swap = dark.advance(10.0, &BTreeMap::new(), &removable(), "u").unwrap();
        assert_eq!(swap.unmount, "y");
    }
}
