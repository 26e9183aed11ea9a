//! Append-only survey logbook.
//!
//! One JSON object per line, tagged by `entry`:
//!
//! ```text
//! {"entry":"nightStart","night":1,"time":1000.0}
//! {"entry":"target","target":{...}}
//! {"entry":"observation","observation":{...}}
//! {"entry":"filterSwap","time":50000.0,"swap":{"unmount":"y","mount":"u"}}
//! ```

use std::{
    fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::model::{FilterSwap, Observation, Target};

#[derive(Debug, thiserror::Error)]
pub enum LogbookError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = core::result::Result<T, LogbookError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "camelCase")]
pub enum LogbookEntry {
    NightStart { night: u32, time: f64 },
    NightEnd { night: u32, time: f64 },
    Target { target: Target },
    Observation { observation: Observation },
    FilterSwap { time: f64, swap: FilterSwap },
}

pub struct Logbook {
    path: PathBuf,
}

impl Logbook {
    /// Opens the logbook at `path`, creating its directory if needed.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &LogbookEntry) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Reads every entry back. A missing file is an empty logbook.
    pub fn load(&self) -> Result<Vec<LogbookEntry>> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for line in io::BufReader::new(file).lines() {
            let line = line?;
            if !line.is_empty() {
                entries.push(serde_json::from_str(&line)?);
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn target() -> Target {
        let mut target = Target::new(7, "r", 1.0, 0.5, vec![15.0, 15.0]);
        target.id = 3;
        target
    }

    #[test]
    fn missing_logbook_is_empty() {
        let dir = TempDir::new().unwrap();
        let logbook = Logbook::new(dir.path().join("survey.jsonl")).unwrap();
        assert!(logbook.load().unwrap().is_empty());
    }

    #[test]
    fn entries_come_back_in_order() {
        let dir = TempDir::new().unwrap();
        let logbook = Logbook::new(dir.path().join("runs").join("survey.jsonl")).unwrap();
        let entries = vec![
            LogbookEntry::NightStart { night: 1, time: 1000.0 },
            LogbookEntry::Target { target: target() },
            LogbookEntry::Observation {
                observation: Observation::of(&target(), 1040.0),
            },
            LogbookEntry::FilterSwap {
                time: 50_000.0,
                swap: FilterSwap {
                    unmount: "y".into(),
                    mount: "u".into(),
                },
            },
            LogbookEntry::NightEnd { night: 1, time: 36_000.0 },
        ];
        for entry in &entries {
            logbook.append(entry).unwrap();
        }

        assert_eq!(logbook.load().unwrap(), entries);
        let raw = fs::read_to_string(logbook.path()).unwrap();
        assert_eq!(raw.lines().count(), 5);
        assert!(raw.starts_with(r#"{"entry":"nightStart","night":1"#));
        assert!(raw.contains(r#""entry":"filterSwap""#));
    }

    #[test]
    fn corrupt_line_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("survey.jsonl");
        fs::write(&path, "{\"entry\":\"nightStart\"\n").unwrap();
        let err = Logbook::new(&path).unwrap().load().unwrap_err();
        assert!(matches!(err, LogbookError::Json(_)));
    }
}
