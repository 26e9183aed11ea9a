//! Lookahead visibility bonus.
//!
//! Precomputed visibility factors (airmass, moon angle, per-filter sky
//! brightness) for every field or healpixel at regular time steps are stored
//! in numbered, zstd-compressed JSON segments. The cache keeps a rolling
//! window of those steps and turns the window into a per-filter bonus that
//! favors fields whose conditions are about to get worse.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Extra steps kept beyond the window so a night's worth of trimming
/// never starves it.
pub const SEGMENT_PADDING: usize = 144;

/// Errors that can occur while loading lookahead data.
#[derive(Debug, thiserror::Error)]
pub enum LookaheadError {
    #[error("healpix lookahead requires nside")]
    MissingNside,

    #[error("first lookahead segment not found: {0}")]
    MissingSegment(PathBuf),

    #[error("corrupt lookahead segment {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = core::result::Result<T, LookaheadError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LookaheadConfig {
    /// Steps summed into the bonus. Zero disables the cache.
    pub window_size: usize,
    pub segment_dir: PathBuf,
    /// Index by healpixel instead of field id.
    pub healpix: bool,
    pub nside: Option<u32>,
    pub normalize: bool,
}

impl Default for LookaheadConfig {
    fn default() -> Self {
        Self {
            window_size: 8000,
            segment_dir: PathBuf::from("lookahead"),
            healpix: false,
            nside: None,
            normalize: true,
        }
    }
}

/// How bonus arrays are indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    /// Element `i` belongs to field id `i + 1`.
    Field,
    Healpix { nside: u32 },
}

// ── Segments ──

/// A run of consecutive time steps. Every array is `[step][index]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub timestamps: Vec<f64>,
    pub airmass: Vec<Vec<f64>>,
    pub moon_angle: Vec<Vec<f64>>,
    /// Filter → sky-brightness factors.
    pub sky: BTreeMap<String, Vec<Vec<f64>>>,
}

impl Segment {
    pub fn file_name(index: usize) -> String {
        format!("lookahead_seg_{index:03}.json.zst")
    }

    pub fn read(path: &Path) -> Result<Self> {
        let compressed = fs::read(path)?;
        let json = zstd::stream::decode_all(compressed.as_slice())?;
        let segment: Self = serde_json::from_slice(&json)?;
        segment.check(path)?;
        Ok(segment)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec(self)?;
        let compressed = zstd::stream::encode_all(json.as_slice(), 3)?;
        fs::write(path, compressed)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    fn check(&self, path: &Path) -> Result<()> {
        let n = self.len();
        let aligned = self.airmass.len() == n
            && self.moon_angle.len() == n
            && self.sky.values().all(|rows| rows.len() == n);
        if aligned {
            Ok(())
        } else {
            Err(LookaheadError::Corrupt {
                path: path.to_path_buf(),
                reason: format!("arrays are not aligned with {n} timestamps"),
            })
        }
    }

    /// Appends `other`, read from `path`. Both must carry the same filters
    /// unless nothing has been loaded yet.
    fn append(&mut self, other: Segment, path: &Path) -> Result<()> {
        let fresh = self.timestamps.is_empty() && self.sky.is_empty();
        if !fresh && !self.sky.keys().eq(other.sky.keys()) {
            return Err(LookaheadError::Corrupt {
                path: path.to_path_buf(),
                reason: format!(
                    "filters {:?} differ from the loaded {:?}",
                    other.sky.keys().collect::<Vec<_>>(),
                    self.sky.keys().collect::<Vec<_>>()
                ),
            });
        }
        self.timestamps.extend(other.timestamps);
        self.airmass.extend(other.airmass);
        self.moon_angle.extend(other.moon_angle);
        for (filter, rows) in other.sky {
            self.sky.entry(filter).or_default().extend(rows);
        }
        Ok(())
    }

    fn drain_front(&mut self, n: usize) {
        self.timestamps.drain(..n);
        self.airmass.drain(..n);
        self.moon_angle.drain(..n);
        for rows in self.sky.values_mut() {
            rows.drain(..n);
        }
    }
}

// ── Cache ──

#[derive(Debug, Clone)]
pub struct Lookahead {
    window_size: usize,
    dir: PathBuf,
    mode: IndexMode,
    normalize: bool,
    table: Segment,
    next_segment: usize,
    exhausted: bool,
    time: f64,
    bucket: Option<usize>,
    bonus: BTreeMap<String, Vec<f64>>,
}

impl Lookahead {
    /// Builds the cache; segment paths resolve against `base_dir`.
    pub fn new(config: &LookaheadConfig, base_dir: &Path) -> Result<Self> {
        let mode = if config.healpix {
            IndexMode::Healpix {
                nside: config.nside.ok_or(LookaheadError::MissingNside)?,
            }
        } else {
            IndexMode::Field
        };
        Ok(Self {
            window_size: config.window_size,
            dir: base_dir.join(&config.segment_dir),
            mode,
            normalize: config.normalize,
            table: Segment::default(),
            next_segment: 0,
            exhausted: false,
            time: 0.0,
            bucket: None,
            bonus: BTreeMap::new(),
        })
    }

    /// A cache whose lookups always return zero.
    pub fn disabled() -> Self {
        Self {
            window_size: 0,
            dir: PathBuf::new(),
            mode: IndexMode::Field,
            normalize: false,
            table: Segment::default(),
            next_segment: 0,
            exhausted: true,
            time: 0.0,
            bucket: None,
            bonus: BTreeMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.window_size > 0
    }

    pub fn mode(&self) -> IndexMode {
        self.mode
    }

    pub fn set_time(&mut self, time: f64) {
        self.time = time;
    }

    /// Steps currently held.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// The time bucket the current bonus was computed for.
    pub fn bucket(&self) -> Option<usize> {
        self.bucket
    }

    /// Appends the next numbered segment. Returns `false` once the segments
    /// run out; a missing first segment is an error.
    pub fn load_segment(&mut self) -> Result<bool> {
        let path = self.dir.join(Segment::file_name(self.next_segment));
        if !path.exists() {
            if self.next_segment == 0 {
                return Err(LookaheadError::MissingSegment(path));
            }
            self.exhausted = true;
            debug!(segments = self.next_segment, "lookahead segments exhausted");
            return Ok(false);
        }
        let segment = Segment::read(&path)?;
        debug!(path = %path.display(), steps = segment.len(), "loaded lookahead segment");
        self.table.append(segment, &path)?;
        self.next_segment += 1;
        Ok(true)
    }

    /// Loads segments until the window plus padding is covered, then drops
    /// steps that have already elapsed.
    pub fn start_night(&mut self) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        while self.table.len() < self.window_size + SEGMENT_PADDING && !self.exhausted {
            self.load_segment()?;
        }
        let elapsed = self
            .table
            .timestamps
            .iter()
            .take_while(|&&t| t < self.time)
            .count();
        self.table.drain_front(elapsed);
        self.bucket = None;
        info!(trimmed = elapsed, steps = self.table.len(), "lookahead ready for night");
        Ok(())
    }

    pub fn end_night(&mut self) {
        self.bucket = None;
    }

    /// Step closest to the current time.
    fn date_index(&self) -> Option<usize> {
        self.table
            .timestamps
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| (*a - self.time).abs().total_cmp(&(*b - self.time).abs()))
            .map(|(i, _)| i)
    }

    /// Rebuilds the bonus table when the time bucket has changed.
    pub fn calculate_bonus(&mut self) {
        if !self.is_enabled() {
            return;
        }
        let Some(index) = self.date_index() else {
            return;
        };
        if self.bucket == Some(index) {
            return;
        }

        let end = (index + self.window_size + 1).min(self.table.len());
        let rows = index..end.saturating_sub(1).max(index);
        let scale = self.window_size as f64;
        let width = self.table.airmass[index].len();
        let sum = |table: &[Vec<f64>]| -> Vec<f64> {
            let mut out = vec![0.0; width];
            for row in &table[rows.clone()] {
                for (acc, v) in out.iter_mut().zip(row) {
                    *acc += v;
                }
            }
            out.iter().map(|v| v / scale).collect()
        };

        let airmass = sum(&self.table.airmass);
        let moon = sum(&self.table.moon_angle);
        let mut scores: BTreeMap<String, Vec<f64>> = self
            .table
            .sky
            .iter()
            .map(|(filter, table)| {
                let score = sum(table)
                    .iter()
                    .zip(&airmass)
                    .zip(&moon)
                    .map(|((s, a), m)| s * a * m)
                    .collect();
                (filter.clone(), score)
            })
            .collect();

        let max = scores
            .values()
            .flatten()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let divisor = if self.normalize && max > 0.0 { max } else { 1.0 };
        for values in scores.values_mut() {
            for v in values.iter_mut() {
                *v = 1.0 - *v / divisor;
            }
        }

        self.bonus = scores;
        self.bucket = Some(index);
        debug!(bucket = index, "lookahead bonus recalculated");
    }

    /// Bonus for a field id. Zero when disabled or unknown.
    ///
    /// # Panics
    ///
    /// Panics if the cache is indexed by healpixel.
    pub fn lookup_field(&self, field_id: u32, filter: &str) -> f64 {
        assert!(
            self.mode == IndexMode::Field,
            "field lookup on a healpix-indexed lookahead"
        );
        field_id
            .checked_sub(1)
            .map_or(0.0, |i| self.lookup(i as usize, filter))
    }

    /// Bonus for a healpixel. Zero when disabled or unknown.
    ///
    /// # Panics
    ///
    /// Panics if the cache is indexed by field id.
    pub fn lookup_healpix(&self, pixel: usize, filter: &str) -> f64 {
        assert!(
            matches!(self.mode, IndexMode::Healpix { .. }),
            "healpix lookup on a field-indexed lookahead"
        );
        self.lookup(pixel, filter)
    }

    fn lookup(&self, index: usize, filter: &str) -> f64 {
        if !self.is_enabled() {
            return 0.0;
        }
        self.bonus
            .get(filter)
            .and_then(|values| values.get(index))
            .copied()
            .unwrap_or(0.0)
    }
}
