//! Scripted proposal: a fixed list of pointings, issued in order.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::lookahead::Lookahead;
use crate::model::{Contribution, Target};
use crate::sky::SkyModel;

use super::{NightContext, Proposal, ProposalError, ProposalKind, Result, SuggestRequest, Tally};

/// One scripted pointing. Angles in degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScriptedTargetSpec {
    pub field_id: u32,
    pub filter: String,
    pub ra: f64,
    pub dec: f64,
    #[serde(default)]
    pub ang: f64,
    #[serde(default = "default_exp_times")]
    pub exp_times: Vec<f64>,
}

fn default_exp_times() -> Vec<f64> {
    vec![15.0, 15.0]
}

impl ScriptedTargetSpec {
    fn to_target(&self) -> Target {
        let mut target = Target::new(
            self.field_id,
            self.filter.clone(),
            self.ra.to_radians(),
            self.dec.to_radians(),
            self.exp_times.clone(),
        );
        target.ang_rad = self.ang.to_radians();
        target
    }

    /// Parses `field filter ra dec ang num_exp exp1,exp2,...`.
    fn parse(line: &str) -> core::result::Result<Self, String> {
        let columns: Vec<&str> = line.split_whitespace().collect();
        let [field_id, filter, ra, dec, ang, num_exp, exp_times] = columns[..] else {
            return Err(format!("expected 7 columns, found {}", columns.len()));
        };
        let number = |name: &str, value: &str| {
            value
                .parse::<f64>()
                .map_err(|_| format!("invalid {name}: {value}"))
        };
        let field_id = field_id
            .parse::<u32>()
            .map_err(|_| format!("invalid field id: {field_id}"))?;
        let num_exp = num_exp
            .parse::<usize>()
            .map_err(|_| format!("invalid exposure count: {num_exp}"))?;
        let exp_times = exp_times
            .split(',')
            .map(|e| number("exposure time", e))
            .collect::<core::result::Result<Vec<_>, _>>()?;
        if exp_times.len() != num_exp {
            return Err(format!(
                "exposure count {num_exp} does not match {} exposure times",
                exp_times.len()
            ));
        }
        Ok(Self {
            field_id,
            filter: filter.to_string(),
            ra: number("ra", ra)?,
            dec: number("dec", dec)?,
            ang: number("angle", ang)?,
            exp_times,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScriptedConfig {
    pub name: String,
    /// Target file, one pointing per line; appended after `targets`.
    #[serde(default)]
    pub script: Option<PathBuf>,
    #[serde(default)]
    pub targets: Vec<ScriptedTargetSpec>,
}

pub struct ScriptedProposal {
    id: u32,
    name: String,
    targets: Vec<Target>,
    next: usize,
    tally: Tally,
    suggested: Option<Target>,
}

impl ScriptedProposal {
    pub fn from_config(id: u32, config: &ScriptedConfig, base_dir: &Path) -> Result<Self> {
        let mut specs = config.targets.clone();
        if let Some(script) = &config.script {
            specs.extend(load_script(&base_dir.join(script))?);
        }
        if specs.is_empty() {
            return Err(ProposalError::Invalid {
                name: config.name.clone(),
                reason: "no targets".to_string(),
            });
        }
        Ok(Self::new(
            id,
            config.name.clone(),
            specs.iter().map(ScriptedTargetSpec::to_target).collect(),
        ))
    }

    fn new(id: u32, name: String, targets: Vec<Target>) -> Self {
        let mut tally = Tally::default();
        for target in &targets {
            tally.add_goal(&target.filter, 1);
        }
        Self {
            id,
            name,
            targets,
            next: 0,
            tally,
            suggested: None,
        }
    }

    /// Index of the pointing issued next.
    pub fn position(&self) -> usize {
        self.next
    }
}

fn load_script(path: &Path) -> Result<Vec<ScriptedTargetSpec>> {
    let contents = fs::read_to_string(path).map_err(|source| ProposalError::Script {
        path: path.to_path_buf(),
        source,
    })?;
    contents
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(number, line)| {
            ScriptedTargetSpec::parse(line).map_err(|reason| ProposalError::ScriptLine {
                path: path.to_path_buf(),
                line: number,
                reason,
            })
        })
        .collect()
}

impl Proposal for ScriptedProposal {
    fn id(&self) -> u32 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProposalKind {
        ProposalKind::General
    }

    fn start_night(&mut self, _context: &NightContext<'_>) {
        self.tally.start_night();
    }

    fn end_night(&mut self, _time: f64) {
        debug!(proposal = %self.name, position = self.next, "scripted proposal night ended");
    }

    fn suggest_targets(
        &mut self,
        request: &SuggestRequest<'_>,
        _sky: &mut dyn SkyModel,
        _lookahead: Option<&Lookahead>,
    ) -> Vec<Target> {
        self.suggested = None;
        if request.deep_drilling.is_some() {
            return Vec::new();
        }
        let Some(template) = self.targets.get(self.next) else {
            return Vec::new();
        };
        if request
            .constrained_filter
            .is_some_and(|c| c != template.filter)
        {
            return Vec::new();
        }

        let mut target = template.clone();
        target.time = request.time;
        target.cloud = request.cloud;
        target.seeing = request.seeing;
        target.need = 1.0;
        target.bonus = 0.0;
        target.value = 1.0;
        target.contributions = vec![Contribution::new(self.id, 1.0, 0.0)];
        self.suggested = Some(target.clone());
        vec![target]
    }

    fn register_observation(&mut self, visit: &Target) -> Option<Target> {
        let suggested = self
            .suggested
            .take()
            .filter(|t| visit.has_contribution(self.id) && t.is_for(visit.field_id, &visit.filter))?;
        self.tally.record_visit(&visit.filter);
        // The last pointing repeats once the script runs out.
        self.next = (self.next + 1).min(self.targets.len() - 1);
        Some(suggested)
    }

    fn tally(&self) -> &Tally {
        &self.tally
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    use tempfile::NamedTempFile;

    use crate::testing;

    fn spec(field_id: u32) -> ScriptedTargetSpec {
        ScriptedTargetSpec {
            field_id,
            filter: "z".to_string(),
            ra: 10.0 * f64::from(field_id),
            dec: 45.0,
            ang: 0.0,
            exp_times: default_exp_times(),
        }
    }

    fn request(time: f64) -> SuggestRequest<'static> {
        SuggestRequest {
            time,
            deep_drilling: None,
            constrained_filter: None,
            cloud: 0.0,
            seeing: 1.0,
        }
    }

    #[test]
    fn parses_script_lines() {
        let spec = ScriptedTargetSpec::parse("12 r 150.0 -30.5 0.0 2 15,15").unwrap();
        assert_eq!(spec.field_id, 12);
        assert_eq!(spec.filter, "r");
        assert_eq!(spec.dec, -30.5);
        assert_eq!(spec.exp_times, vec![15.0, 15.0]);

        let err = ScriptedTargetSpec::parse("12 r 150.0 -30.5 0.0 3 15,15").unwrap_err();
        assert!(err.contains("does not match"));
        assert!(ScriptedTargetSpec::parse("12 r 150.0").is_err());
    }

    #[test]
    fn loads_script_relative_to_base_dir() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# field filter ra dec ang nexp exptimes").unwrap();
        writeln!(file, "1 g 10 20 0 1 30").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "2 r 30 40 0 2 15,15").unwrap();

        let dir = file.path().parent().unwrap();
        let config = ScriptedConfig {
            name: "Script".to_string(),
            script: Some(PathBuf::from(file.path().file_name().unwrap())),
            targets: vec![spec(7)],
        };
        let proposal = ScriptedProposal::from_config(1, &config, dir).unwrap();
        let fields: Vec<u32> = proposal.targets.iter().map(|t| t.field_id).collect();
        assert_eq!(fields, vec![7, 1, 2]);
        assert_eq!(proposal.tally().goal, 3);
    }

    #[test]
    fn bad_script_line_reports_its_number() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "1 g 10 20 0 1 30").unwrap();
        writeln!(file, "2 r thirty 40 0 1 30").unwrap();
        let config = ScriptedConfig {
            name: "Script".to_string(),
            script: Some(file.path().to_path_buf()),
            targets: Vec::new(),
        };
        let err = ScriptedProposal::from_config(1, &config, Path::new("/"))
            .err()
            .unwrap();
        assert!(matches!(err, ProposalError::ScriptLine { line: 2, .. }));
    }

    #[test]
    fn empty_script_is_rejected() {
        let config = ScriptedConfig {
            name: "Script".to_string(),
            script: None,
            targets: Vec::new(),
        };
        assert!(ScriptedProposal::from_config(1, &config, Path::new(".")).is_err());
    }

    #[test]
    fn advances_on_matching_observation_and_repeats_last() {
        let config = ScriptedConfig {
            name: "Script".to_string(),
            script: None,
            targets: vec![spec(1), spec(2)],
        };
        let mut proposal = ScriptedProposal::from_config(4, &config, Path::new(".")).unwrap();
        let mut sky = testing::static_sky();

        let first = proposal.suggest_targets(&request(0.0), &mut sky, None);
        assert_eq!(first[0].field_id, 1);
        assert_eq!(first[0].value, 1.0);

        // Suggesting again does not advance.
        let again = proposal.suggest_targets(&request(10.0), &mut sky, None);
        assert_eq!(again[0].field_id, 1);

        assert!(proposal.register_observation(&again[0]).is_some());
        for _ in 0..3 {
            let target = proposal.suggest_targets(&request(20.0), &mut sky, None);
            assert_eq!(target[0].field_id, 2);
            proposal.register_observation(&target[0]);
        }
        assert_eq!(proposal.position(), 1);
        assert_eq!(proposal.tally().visits, 4);
    }

    #[test]
    fn ignores_unrelated_observations() {
        let config = ScriptedConfig {
            name: "Script".to_string(),
            script: None,
            targets: vec![spec(1), spec(2)],
        };
        let mut proposal = ScriptedProposal::from_config(4, &config, Path::new(".")).unwrap();
        let mut sky = testing::static_sky();
        proposal.suggest_targets(&request(0.0), &mut sky, None);
        let other = Target::new(9, "z", 0.0, 0.0, vec![30.0]);
        assert!(proposal.register_observation(&other).is_none());
        assert_eq!(proposal.position(), 0);
    }
}
