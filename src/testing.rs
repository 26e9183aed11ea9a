//! Shared fixtures for unit tests.

use std::collections::BTreeMap;

use crate::catalog::{Field, FieldCatalog};
use crate::sky::{Body, Horizontal, MoonSunInfo, SkyModel, StaticSky, StaticSkyConfig};

/// Five fields; field 4 sits below the horizon of the static sky.
pub fn catalog() -> FieldCatalog {
    FieldCatalog::from_fields([
        Field::from_degrees(1, 3.5, 150.0, 60.0, 120.0, 40.0, 130.0, 45.0),
        Field::from_degrees(2, 3.5, 170.0, 45.0, 140.0, 50.0, 160.0, 35.0),
        Field::from_degrees(3, 3.5, 190.0, 75.0, 125.0, 42.0, 150.0, 70.0),
        Field::from_degrees(4, 3.5, 200.0, -10.0, 300.0, 55.0, 205.0, -2.0),
        Field::from_degrees(5, 3.5, 180.0, 30.0, 190.0, 78.0, 170.0, 28.0),
    ])
}

pub fn static_sky() -> StaticSky {
    StaticSky::new(StaticSkyConfig::default(), &catalog())
}

pub fn mounted_filters() -> Vec<String> {
    ["g", "r", "i", "z", "y"].map(String::from).to_vec()
}

/// The static sky, except that the given fields drop to 10° altitude from
/// `sets_at` onwards.
pub struct SettingSky {
    inner: StaticSky,
    setting: Vec<(f64, f64)>,
    sets_at: f64,
}

impl SettingSky {
    pub fn new(field_ids: &[u32], sets_at: f64) -> Self {
        let setting = catalog()
            .iter()
            .filter(|f| field_ids.contains(&f.id))
            .map(|f| (f.ra, f.dec))
            .collect();
        Self {
            inner: static_sky(),
            setting,
            sets_at,
        }
    }
}

impl SkyModel for SettingSky {
    fn update(&mut self, time: f64) {
        self.inner.update(time);
    }

    fn night_boundaries(&self, sun_altitude_deg: f64) -> (f64, f64) {
        self.inner.night_boundaries(sun_altitude_deg)
    }

    fn sky_brightness(&self, field_ids: &[u32]) -> BTreeMap<String, Vec<f64>> {
        self.inner.sky_brightness(field_ids)
    }

    fn airmass(&self, field_ids: &[u32]) -> Vec<f64> {
        self.inner.airmass(field_ids)
    }

    fn moon_sun_info(&self, ra_rad: &[f64], dec_rad: &[f64]) -> MoonSunInfo {
        self.inner.moon_sun_info(ra_rad, dec_rad)
    }

    fn angular_separation(&self, body: Body, ra_rad: &[f64], dec_rad: &[f64]) -> Vec<f64> {
        self.inner.angular_separation(body, ra_rad, dec_rad)
    }

    fn hour_angle(&self, ra_rad: &[f64]) -> Vec<f64> {
        self.inner.hour_angle(ra_rad)
    }

    fn horizontal(&self, time: f64, ra_rad: f64, dec_rad: f64) -> Horizontal {
        let mut h = self.inner.horizontal(time, ra_rad, dec_rad);
        let sets = self
            .setting
            .iter()
            .any(|&(ra, dec)| (ra - ra_rad).abs() < 1e-9 && (dec - dec_rad).abs() < 1e-9);
        if sets && time >= self.sets_at {
            h.alt_rad = 10_f64.to_radians();
        }
        h
    }
}
