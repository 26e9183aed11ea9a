//! The sky model seam.
//!
//! Ephemerides, sky brightness and coordinate transforms live outside the
//! scheduler. [`SkyModel`] is everything the scheduler asks of them;
//! [`StaticSky`] is a deterministic stand-in for dry runs and tests.

use std::collections::BTreeMap;
use std::f64::consts::{PI, TAU};

use serde::{Deserialize, Serialize};

use crate::catalog::FieldCatalog;

const DAY: f64 = 86_400.0;
const SYNODIC_MONTH_DAYS: f64 = 29.530_588;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Body {
    Moon,
    Sun,
}

/// Horizon coordinates of a pointing, in radians.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Horizontal {
    pub alt_rad: f64,
    pub az_rad: f64,
    /// Parallactic angle.
    pub pa_rad: f64,
}

/// Position of a body and its separation from each queried pointing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BodyInfo {
    pub ra_rad: f64,
    pub dec_rad: f64,
    pub alt_rad: f64,
    pub az_rad: f64,
    /// Illuminated fraction in percent.
    pub phase: f64,
    pub separation_rad: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MoonSunInfo {
    pub moon: BodyInfo,
    pub sun: BodyInfo,
}

/// Astronomical answers, evaluated at the time of the last [`update`].
///
/// [`update`]: SkyModel::update
pub trait SkyModel {
    fn update(&mut self, time: f64);

    /// `(sunset, sunrise)` of the night containing or following the current
    /// time, where the sun crosses `sun_altitude_deg`.
    fn night_boundaries(&self, sun_altitude_deg: f64) -> (f64, f64);

    /// Filter → per-field sky brightness (mag/arcsec²), NaN when unknown.
    fn sky_brightness(&self, field_ids: &[u32]) -> BTreeMap<String, Vec<f64>>;

    fn airmass(&self, field_ids: &[u32]) -> Vec<f64>;

    fn moon_sun_info(&self, ra_rad: &[f64], dec_rad: &[f64]) -> MoonSunInfo;

    fn angular_separation(&self, body: Body, ra_rad: &[f64], dec_rad: &[f64]) -> Vec<f64>;

    /// Hour angle of each right ascension, radians in `[-π, π)`.
    fn hour_angle(&self, ra_rad: &[f64]) -> Vec<f64>;

    /// Horizon coordinates of `(ra, dec)` at `time`.
    fn horizontal(&self, time: f64, ra_rad: f64, dec_rad: f64) -> Horizontal;

    fn exclude_planets(&mut self, _exclude: bool) {}
}

/// Angular distance between two equatorial positions.
pub fn separation(ra1: f64, dec1: f64, ra2: f64, dec2: f64) -> f64 {
    let sin_ddec = ((dec2 - dec1) / 2.0).sin();
    let sin_dra = ((ra2 - ra1) / 2.0).sin();
    let h = sin_ddec * sin_ddec + dec1.cos() * dec2.cos() * sin_dra * sin_dra;
    2.0 * h.sqrt().min(1.0).asin()
}

// ── Static sky ──

/// Parameters of [`StaticSky`]. Angles in degrees, times in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StaticSkyConfig {
    /// Sunset, in seconds after UTC midnight.
    pub sunset: f64,
    pub night_length: f64,
    pub sky_brightness: BTreeMap<String, f64>,
    pub moon_ra: f64,
    pub moon_dec: f64,
    /// Shifts the lunation so that phase 0 falls this many days after the epoch.
    pub lunation_offset_days: f64,
}

impl Default for StaticSkyConfig {
    fn default() -> Self {
        Self {
            sunset: 0.0,
            night_length: 36_000.0,
            sky_brightness: BTreeMap::from([
                ("u".to_string(), 22.9),
                ("g".to_string(), 22.3),
                ("r".to_string(), 21.2),
                ("i".to_string(), 20.5),
                ("z".to_string(), 19.6),
                ("y".to_string(), 18.6),
            ]),
            moon_ra: 180.0,
            moon_dec: -80.0,
            lunation_offset_days: 0.0,
        }
    }
}

/// A fixed-horizon sky.
///
/// Field coordinates are read directly as horizon coordinates (RA as
/// azimuth, Dec as altitude) and the sky never rotates. Nights repeat every
/// day at the configured offset and the moon phase follows a cosine
/// lunation.
#[derive(Debug, Clone)]
pub struct StaticSky {
    config: StaticSkyConfig,
    positions: BTreeMap<u32, (f64, f64)>,
    time: f64,
}

impl StaticSky {
    pub fn new(config: StaticSkyConfig, catalog: &FieldCatalog) -> Self {
        Self {
            config,
            positions: catalog.iter().map(|f| (f.id, (f.ra, f.dec))).collect(),
            time: 0.0,
        }
    }

    pub fn moon_phase(&self, time: f64) -> f64 {
        let days = time / DAY - self.config.lunation_offset_days;
        50.0 * (1.0 - (TAU * days / SYNODIC_MONTH_DAYS).cos())
    }

    fn body_position(&self, body: Body) -> (f64, f64) {
        match body {
            Body::Moon => (
                self.config.moon_ra.to_radians(),
                self.config.moon_dec.to_radians(),
            ),
            Body::Sun => (0.0, -PI / 2.0),
        }
    }

    fn body_info(&self, body: Body, ra_rad: &[f64], dec_rad: &[f64]) -> BodyInfo {
        let (ra, dec) = self.body_position(body);
        BodyInfo {
            ra_rad: ra,
            dec_rad: dec,
            alt_rad: dec,
            az_rad: ra,
            phase: match body {
                Body::Moon => self.moon_phase(self.time),
                Body::Sun => 100.0,
            },
            separation_rad: self.angular_separation(body, ra_rad, dec_rad),
        }
    }
}

impl SkyModel for StaticSky {
    fn update(&mut self, time: f64) {
        self.time = time;
    }

    fn night_boundaries(&self, _sun_altitude_deg: f64) -> (f64, f64) {
        let length = self.config.night_length;
        let k = ((self.time - self.config.sunset - length) / DAY).floor() + 1.0;
        let sunset = k * DAY + self.config.sunset;
        (sunset, sunset + length)
    }

    fn sky_brightness(&self, field_ids: &[u32]) -> BTreeMap<String, Vec<f64>> {
        self.config
            .sky_brightness
            .iter()
            .map(|(filter, mag)| {
                let mags = field_ids
                    .iter()
                    .map(|id| {
                        if self.positions.contains_key(id) {
                            *mag
                        } else {
                            f64::NAN
                        }
                    })
                    .collect();
                (filter.clone(), mags)
            })
            .collect()
    }

    fn airmass(&self, field_ids: &[u32]) -> Vec<f64> {
        field_ids
            .iter()
            .map(|id| match self.positions.get(id) {
                Some(&(_, alt)) if alt > 0.0 => 1.0 / alt.sin(),
                _ => f64::INFINITY,
            })
            .collect()
    }

    fn moon_sun_info(&self, ra_rad: &[f64], dec_rad: &[f64]) -> MoonSunInfo {
        MoonSunInfo {
            moon: self.body_info(Body::Moon, ra_rad, dec_rad),
            sun: self.body_info(Body::Sun, ra_rad, dec_rad),
        }
    }

    fn angular_separation(&self, body: Body, ra_rad: &[f64], dec_rad: &[f64]) -> Vec<f64> {
        let (body_ra, body_dec) = self.body_position(body);
        ra_rad
            .iter()
            .zip(dec_rad)
            .map(|(&ra, &dec)| separation(body_ra, body_dec, ra, dec))
            .collect()
    }

    /// The meridian sits at azimuth 180°.
    fn hour_angle(&self, ra_rad: &[f64]) -> Vec<f64> {
        ra_rad
            .iter()
            .map(|ra| ra.rem_euclid(TAU) - PI)
            .collect()
    }

    fn horizontal(&self, _time: f64, ra_rad: f64, dec_rad: f64) -> Horizontal {
        Horizontal {
            alt_rad: dec_rad,
            az_rad: ra_rad.rem_euclid(TAU),
            pa_rad: 0.0,
        }
    }
}
