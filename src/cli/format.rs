//! Output formatting for CLI display.

use std::fmt::Write;

use crate::driver::SurveyTopology;
use crate::proposals::{Proposal, ProposalKind};

use super::simulate::Summary;

pub(super) fn format_degrees(rad: f64) -> String {
    format!("{:.1}°", rad.to_degrees())
}

fn format_names(names: &[String]) -> String {
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}

pub(super) fn format_topology(topology: &SurveyTopology) -> String {
    format!(
        "General proposals: {}\nSequence proposals: {}\n",
        format_names(&topology.general),
        format_names(&topology.sequence)
    )
}

fn format_hours(seconds: f64) -> String {
    format!("{:.1}h", seconds / 3600.0)
}

/// One line per proposal, after the run totals.
pub(super) fn format_summary(summary: &Summary, proposals: &[Box<dyn Proposal>]) -> String {
    let mut out = format!(
        "{} night(s), {} targets, {} idle steps, {} filter swap(s) over {}\n",
        summary.nights,
        summary.targets,
        summary.idle_steps,
        summary.filter_swaps,
        format_hours(summary.end - summary.start)
    );
    for proposal in proposals {
        let tally = proposal.tally();
        let kind = match proposal.kind() {
            ProposalKind::General => "general",
            ProposalKind::Sequence => "sequence",
        };
        let filters: Vec<String> = tally
            .filter_visits
            .iter()
            .map(|(filter, visits)| format!("{filter}:{visits}"))
            .collect();
        let _ = writeln!(
            out,
            "  [{kind}] {}  {}/{} visits ({:.1}%)  {}",
            proposal.name(),
            tally.visits,
            tally.goal,
            100.0 * proposal.progress(),
            filters.join(" ")
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_lists_names_or_none() {
        let topology = SurveyTopology {
            general: vec!["Wide".into(), "Script".into()],
            sequence: vec![],
        };
        assert_eq!(
            format_topology(&topology),
            "General proposals: Wide, Script\nSequence proposals: none\n"
        );
    }

    #[test]
    fn degrees_have_one_decimal() {
        assert_eq!(format_degrees(std::f64::consts::FRAC_PI_2), "90.0°");
    }

    #[test]
    fn summary_without_proposals_is_one_line() {
        let summary = Summary {
            nights: 2,
            targets: 40,
            idle_steps: 3,
            filter_swaps: 1,
            start: 0.0,
            end: 7200.0,
        };
        assert_eq!(
            format_summary(&summary, &[]),
            "2 night(s), 40 targets, 3 idle steps, 1 filter swap(s) over 2.0h\n"
        );
    }
}
