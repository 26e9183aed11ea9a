//! The static field catalog.
//!
//! Fields tile the sky; each has a fixed center in equatorial, galactic and
//! ecliptic coordinates. The catalog is read from the `Field` table of a
//! `SQLite` database or given inline in the configuration.

use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};

/// Errors that can occur while loading the catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("catalog has no fields")]
    Empty,
}

pub type Result<T> = core::result::Result<T, CatalogError>;

/// A survey field. All angles in radians.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub id: u32,
    pub ra: f64,
    pub dec: f64,
    pub gl: f64,
    pub gb: f64,
    pub el: f64,
    pub eb: f64,
    pub fov: f64,
}

impl Field {
    /// Builds a field from degree-valued columns.
    #[allow(clippy::too_many_arguments)]
    pub fn from_degrees(
        id: u32,
        fov: f64,
        ra: f64,
        dec: f64,
        gl: f64,
        gb: f64,
        el: f64,
        eb: f64,
    ) -> Self {
        Self {
            id,
            ra: ra.to_radians(),
            dec: dec.to_radians(),
            gl: gl.to_radians(),
            gb: gb.to_radians(),
            el: el.to_radians(),
            eb: eb.to_radians(),
            fov: fov.to_radians(),
        }
    }

    fn coordinate(&self, coordinate: Coordinate) -> f64 {
        match coordinate {
            Coordinate::Ra => self.ra,
            Coordinate::Dec => self.dec,
            Coordinate::GalacticLon => self.gl,
            Coordinate::GalacticLat => self.gb,
            Coordinate::EclipticLon => self.el,
            Coordinate::EclipticLat => self.eb,
        }
    }
}

/// A field as written in a configuration file, in degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FieldSpec {
    pub id: u32,
    pub ra: f64,
    pub dec: f64,
    #[serde(default)]
    pub gl: f64,
    #[serde(default)]
    pub gb: f64,
    #[serde(default)]
    pub el: f64,
    #[serde(default)]
    pub eb: f64,
    #[serde(default = "default_fov")]
    pub fov: f64,
}

fn default_fov() -> f64 {
    3.5
}

impl From<&FieldSpec> for Field {
    fn from(spec: &FieldSpec) -> Self {
        Field::from_degrees(
            spec.id, spec.fov, spec.ra, spec.dec, spec.gl, spec.gb, spec.el, spec.eb,
        )
    }
}

// ── Sky regions ──

/// Which field coordinate a region cut applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Coordinate {
    Ra,
    Dec,
    GalacticLon,
    GalacticLat,
    EclipticLon,
    EclipticLat,
}

impl Coordinate {
    fn is_longitude(self) -> bool {
        matches!(self, Self::Ra | Self::GalacticLon | Self::EclipticLon)
    }
}

/// An inclusive band on one coordinate, in degrees. Longitude bands with
/// `min > max` wrap through zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegionCut {
    pub coordinate: Coordinate,
    pub min: f64,
    pub max: f64,
}

impl RegionCut {
    pub fn contains(&self, field: &Field) -> bool {
        let value = field.coordinate(self.coordinate).to_degrees();
        if self.coordinate.is_longitude() {
            let value = value.rem_euclid(360.0);
            if self.min > self.max {
                return value >= self.min || value <= self.max;
            }
        }
        value >= self.min && value <= self.max
    }
}

/// The part of the catalog a proposal surveys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SkyRegion {
    /// Every cut must contain the field.
    #[serde(default)]
    pub cuts: Vec<RegionCut>,
    /// No exclusion may contain the field.
    #[serde(default)]
    pub exclusions: Vec<RegionCut>,
    /// Explicit field list; overrides the cuts when present.
    #[serde(default)]
    pub field_ids: Option<Vec<u32>>,
}

impl SkyRegion {
    pub fn contains(&self, field: &Field) -> bool {
        if let Some(ids) = &self.field_ids {
            return ids.contains(&field.id);
        }
        self.cuts.iter().all(|c| c.contains(field))
            && !self.exclusions.iter().any(|c| c.contains(field))
    }
}

// ── Catalog ──

/// Field id → field, ordered by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldCatalog {
    fields: BTreeMap<u32, Field>,
}

impl FieldCatalog {
    pub fn from_fields(fields: impl IntoIterator<Item = Field>) -> Self {
        Self {
            fields: fields.into_iter().map(|f| (f.id, f)).collect(),
        }
    }

    /// Loads the `Field` table of a `SQLite` database opened read-only.
    pub fn from_sqlite(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let mut stmt = conn.prepare(
            "SELECT fieldId, fieldFov, fieldRA, fieldDec, fieldGL, fieldGB, fieldEL, fieldEB
             FROM Field ORDER BY fieldId",
        )?;
        let fields = stmt
            .query_map([], |row| {
                Ok(Field::from_degrees(
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if fields.is_empty() {
            return Err(CatalogError::Empty);
        }
        Ok(Self::from_fields(fields))
    }

    pub fn get(&self, id: u32) -> Option<&Field> {
        self.fields.get(&id)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Field> {
        self.fields.values()
    }

    /// Fields inside `region`, ordered by id.
    pub fn select(&self, region: &SkyRegion) -> Vec<Field> {
        self.iter().filter(|f| region.contains(f)).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn field(id: u32, ra: f64, dec: f64) -> Field {
        Field::from_degrees(id, 3.5, ra, dec, 0.0, 0.0, 0.0, 0.0)
    }

    fn write_db(dir: &TempDir, rows: &[(u32, f64, f64)]) -> std::path::PathBuf {
        let path = dir.path().join("fields.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE Field (
                fieldId INTEGER PRIMARY KEY, fieldFov REAL, fieldRA REAL, fieldDec REAL,
                fieldGL REAL, fieldGB REAL, fieldEL REAL, fieldEB REAL
            )",
        )
        .unwrap();
        for (id, ra, dec) in rows {
            conn.execute(
                "INSERT INTO Field VALUES (?1, 3.5, ?2, ?3, 10.0, -5.0, 20.0, 1.0)",
                rusqlite::params![id, ra, dec],
            )
            .unwrap();
        }
        path
    }

    #[test]
    fn loads_fields_from_sqlite() {
        let dir = TempDir::new().unwrap();
        let path = write_db(&dir, &[(2, 90.0, -30.0), (1, 0.0, -60.0)]);

        let catalog = FieldCatalog::from_sqlite(&path).unwrap();
        assert_eq!(catalog.len(), 2);
        let ids: Vec<u32> = catalog.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![1, 2]);

        let f2 = catalog.get(2).unwrap();
        assert!((f2.ra - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
        assert!((f2.gb - (-5.0_f64).to_radians()).abs() < 1e-12);
    }

    #[test]
    fn empty_table_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = write_db(&dir, &[]);
        let err = FieldCatalog::from_sqlite(&path).unwrap_err();
        assert!(matches!(err, CatalogError::Empty));
    }

    #[test]
    fn missing_database_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = FieldCatalog::from_sqlite(&dir.path().join("nope.db")).unwrap_err();
        assert!(matches!(err, CatalogError::Sqlite(_)));
    }

    #[test]
    fn region_cuts_and_exclusions() {
        let catalog = FieldCatalog::from_fields([
            field(1, 10.0, -20.0),
            field(2, 350.0, -40.0),
            field(3, 180.0, 10.0),
        ]);
        let region = SkyRegion {
            cuts: vec![RegionCut {
                coordinate: Coordinate::Dec,
                min: -90.0,
                max: 0.0,
            }],
            exclusions: vec![RegionCut {
                coordinate: Coordinate::Dec,
                min: -25.0,
                max: -15.0,
            }],
            field_ids: None,
        };
        let ids: Vec<u32> = catalog.select(&region).iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn longitude_cut_wraps() {
        let cut = RegionCut {
            coordinate: Coordinate::Ra,
            min: 340.0,
            max: 20.0,
        };
        assert!(cut.contains(&field(1, 10.0, 0.0)));
        assert!(cut.contains(&field(2, 350.0, 0.0)));
        assert!(!cut.contains(&field(3, 180.0, 0.0)));
    }

    #[test]
    fn explicit_ids_override_cuts() {
        let catalog = FieldCatalog::from_fields([field(1, 0.0, 0.0), field(2, 0.0, 0.0)]);
        let region = SkyRegion {
            cuts: vec![RegionCut {
                coordinate: Coordinate::Dec,
                min: 50.0,
                max: 60.0,
            }],
            exclusions: vec![],
            field_ids: Some(vec![2]),
        };
        assert_eq!(catalog.select(&region).len(), 1);
        assert!(SkyRegion::default().contains(&field(9, 0.0, 0.0)));
    }
}
