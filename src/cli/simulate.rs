//! The dry-run control loop.

use crate::driver::{Driver, DriverError};
use crate::logbook::{Logbook, LogbookEntry, LogbookError};
use crate::model::Observation;

#[derive(Debug, thiserror::Error)]
pub(super) enum SimulationError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("logbook: {0}")]
    Logbook(#[from] LogbookError),
}

/// Counts gathered over a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub(super) struct Summary {
    pub nights: u32,
    pub targets: u64,
    pub idle_steps: u64,
    pub filter_swaps: u32,
    pub start: f64,
    pub end: f64,
}

fn record(logbook: Option<&Logbook>, entry: &LogbookEntry) -> Result<(), LogbookError> {
    match logbook {
        Some(logbook) => logbook.append(entry),
        None => Ok(()),
    }
}

/// Runs `driver` from `start` until `nights` nights have ended.
///
/// Each issued target is observed immediately. During the day the clock
/// jumps to the next sunset after any pending filter swap is done.
pub(super) fn run(
    driver: &mut Driver,
    start: f64,
    nights: u32,
    step: f64,
    logbook: Option<&Logbook>,
) -> Result<Summary, SimulationError> {
    let mut summary = Summary {
        start,
        end: start,
        ..Summary::default()
    };
    let mut time = start;
    let mut was_night = false;

    while summary.nights < nights {
        let night = summary.nights + 1;
        let is_night = driver.update_time(time, night)?;

        if is_night != was_night {
            let entry = if is_night {
                LogbookEntry::NightStart { night, time }
            } else {
                summary.nights += 1;
                LogbookEntry::NightEnd { night, time }
            };
            record(logbook, &entry)?;
            was_night = is_night;
            if !is_night && summary.nights >= nights {
                break;
            }
        }

        if !is_night {
            if let Some(swap) = driver.need_filter_swap().cloned() {
                driver.swap_filter(&swap.unmount, &swap.mount);
                summary.filter_swaps += 1;
                record(logbook, &LogbookEntry::FilterSwap { time, swap })?;
            }
            let (sunset, _) = driver.night_boundaries();
            time = if sunset > time { sunset } else { time + step };
            continue;
        }

        let target = driver.select_next_target();
        if target.id <= 0 {
            summary.idle_steps += 1;
            time += step;
            continue;
        }

        let observation = Observation::of(&target, time);
        record(logbook, &LogbookEntry::Target { target })?;
        driver.register_observation(&observation);
        record(logbook, &LogbookEntry::Observation { observation })?;
        summary.targets += 1;

        let done = driver.observatory().state().time;
        time = if done > time { done } else { time + step };
    }

    driver.end_survey();
    summary.end = time;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;

    use tempfile::TempDir;

    use crate::config::Config;
    use crate::proposals::Proposal;
    use crate::testing;

    fn driver() -> Driver {
        let config = Config::from_toml_str(
            r#"
            [driver]

            [[proposal]]
            kind = "area"
            name = "Wide"

            [proposal.filters.r]
            visits = 5
            "#,
            Path::new("."),
        )
        .unwrap();
        Driver::new(&config, testing::catalog(), Box::new(testing::static_sky())).unwrap()
    }

    #[test]
    fn simulates_whole_nights() {
        let mut driver = driver();
        let summary = run(&mut driver, 40_000.0, 2, 60.0, None).unwrap();

        assert_eq!(summary.nights, 2);
        assert!(summary.targets > 0);
        // Second night ends at the second sunrise after the start.
        assert!(summary.end >= 2.0 * 86_400.0 + 36_000.0);
        assert!(summary.end < 3.0 * 86_400.0);
        assert!(driver.proposals()[0].tally().visits > 0);
    }

    #[test]
    fn logbook_records_the_run() {
        let dir = TempDir::new().unwrap();
        let logbook = Logbook::new(dir.path().join("run.jsonl")).unwrap();
        let mut driver = driver();
        let summary = run(&mut driver, 0.0, 1, 60.0, Some(&logbook)).unwrap();

        let entries = logbook.load().unwrap();
        assert!(matches!(
            entries.first(),
            Some(LogbookEntry::NightStart { night: 1, .. })
        ));
        assert!(matches!(
            entries.last(),
            Some(LogbookEntry::NightEnd { night: 1, .. })
        ));
        let observed = entries
            .iter()
            .filter(|e| matches!(e, LogbookEntry::Observation { .. }))
            .count();
        assert_eq!(observed as u64, summary.targets);
    }
}
