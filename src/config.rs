//! Scheduler configuration.
//!
//! Loaded from `~/.sextant/config.toml` unless a path is given. Relative
//! paths inside the file (catalog, scripts, lookahead segments) resolve
//! against the file's directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::catalog::{CatalogError, FieldCatalog, FieldSpec};
use crate::driver::DriverConfig;
use crate::lookahead::{LookaheadConfig, LookaheadError};
use crate::observatory::{ObservatoryConfig, ObservatoryError, ObservatoryModel};
use crate::proposals::{self, ProposalConfig, ProposalError};
use crate::sky::StaticSkyConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine home directory")]
    NoHome,

    #[error(
        "no config file found at {0}\n\
         Create one with at minimum a [driver] table and one [[proposal]]."
    )]
    Missing(PathBuf),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("missing [driver] table")]
    MissingDriver,

    #[error("no [[proposal]] configured")]
    NoProposals,

    #[error(
        "time-cost calibration needs time-ref > cost-ref * time-max \
         (time-max = {time_max}, time-ref = {time_ref}, cost-ref = {cost_ref})"
    )]
    CostCurve {
        time_max: f64,
        time_ref: f64,
        cost_ref: f64,
    },

    #[error("survey duration must be positive, got {0} days")]
    Duration(f64),

    #[error(transparent)]
    Observatory(#[from] ObservatoryError),

    #[error(transparent)]
    Proposal(#[from] ProposalError),

    #[error(transparent)]
    Lookahead(#[from] LookaheadError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

pub type Result<T> = core::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SurveyConfig {
    pub duration_days: f64,
    /// RFC 3339 start of the survey, e.g. `"2026-01-01T00:00:00Z"`.
    pub start: Option<jiff::Timestamp>,
}

impl Default for SurveyConfig {
    fn default() -> Self {
        Self {
            duration_days: 3650.0,
            start: None,
        }
    }
}

impl SurveyConfig {
    /// Survey start in epoch seconds; zero when unset.
    pub fn start_time(&self) -> f64 {
        self.start
            .map_or(0.0, |ts| ts.as_millisecond() as f64 / 1000.0)
    }
}

/// Where survey fields come from. Both sources may be combined.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CatalogConfig {
    /// SQLite database with a `Field` table.
    pub sqlite: Option<PathBuf>,
    pub fields: Vec<FieldSpec>,
}

/// The file as written, before the required tables are checked.
#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawConfig {
    driver: Option<DriverConfig>,
    #[serde(default)]
    survey: SurveyConfig,
    #[serde(default)]
    observatory: ObservatoryConfig,
    #[serde(default)]
    sky: StaticSkyConfig,
    #[serde(default)]
    catalog: CatalogConfig,
    lookahead: Option<LookaheadConfig>,
    #[serde(default, rename = "proposal")]
    proposals: Vec<ProposalConfig>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub driver: DriverConfig,
    pub survey: SurveyConfig,
    pub observatory: ObservatoryConfig,
    pub sky: StaticSkyConfig,
    pub catalog: CatalogConfig,
    pub lookahead: Option<LookaheadConfig>,
    pub proposals: Vec<ProposalConfig>,
    /// Directory relative paths resolve against.
    pub base_dir: PathBuf,
}

impl Config {
    /// Loads and validates the config at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().map_or_else(PathBuf::new, Path::to_path_buf);
        Self::parse(&contents, path, base_dir)
    }

    /// Parses a config held in memory. Relative paths resolve against
    /// `base_dir`.
    pub fn from_toml_str(contents: &str, base_dir: &Path) -> Result<Self> {
        Self::parse(contents, Path::new("<inline>"), base_dir.to_path_buf())
    }

    fn parse(contents: &str, origin: &Path, base_dir: PathBuf) -> Result<Self> {
        let raw: RawConfig = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        let config = Self {
            driver: raw.driver.ok_or(ConfigError::MissingDriver)?,
            survey: raw.survey,
            observatory: raw.observatory,
            sky: raw.sky,
            catalog: raw.catalog,
            lookahead: raw.lookahead,
            proposals: raw.proposals,
            base_dir,
        };
        config.validate()?;
        Ok(config)
    }

    /// The default config path: `~/.sextant/config.toml`.
    pub fn default_path() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(".sextant").join("config.toml"))
            .ok_or(ConfigError::NoHome)
    }

    /// Resolves a path from the file against its directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.base_dir.join(path)
    }

    /// Loads the SQLite catalog, if any, and adds the inline fields.
    pub fn load_catalog(&self) -> Result<FieldCatalog> {
        let mut fields = Vec::new();
        if let Some(path) = &self.catalog.sqlite {
            fields.extend(FieldCatalog::from_sqlite(&self.resolve(path))?.iter().cloned());
        }
        fields.extend(self.catalog.fields.iter().map(Into::into));
        let catalog = FieldCatalog::from_fields(fields);
        if catalog.is_empty() {
            return Err(CatalogError::Empty.into());
        }
        Ok(catalog)
    }

    fn validate(&self) -> Result<()> {
        if self.proposals.is_empty() {
            return Err(ConfigError::NoProposals);
        }
        let days = self.survey.duration_days;
        if days.is_nan() || days <= 0.0 {
            return Err(ConfigError::Duration(days));
        }
        if self.driver.cost_curve().is_none() {
            return Err(ConfigError::CostCurve {
                time_max: self.driver.timecost_time_max,
                time_ref: self.driver.timecost_time_ref,
                cost_ref: self.driver.timecost_cost_ref,
            });
        }
        if self
            .lookahead
            .as_ref()
            .is_some_and(|l| l.healpix && l.nside.is_none())
        {
            return Err(LookaheadError::MissingNside.into());
        }
        ObservatoryModel::new(&self.observatory)?;
        for (proposal, id) in self.proposals.iter().zip(1..) {
            proposals::build(id, proposal, self.driver.overrides(), &self.base_dir)?;
        }
        Ok(())
    }
}
