//! Synthetic rooftop solar profile used as a general feeder load.

use std::f64::consts::PI;

use chrono::{NaiveDateTime, TimeDelta, Timelike};
use rand::{Rng, SeedableRng, rngs::StdRng};

/// Half-sine generation between sunrise and sunset, optionally perturbed by
/// multiplicative Gaussian noise.
///
/// # Power Flow Convention (Feeder)
/// Values are **negative** during daylight: generation offsets bus load.
#[derive(Debug, Clone, PartialEq)]
pub struct SolarProfile {
    /// Output under clear sky at solar noon (kW).
    pub kw_peak: f64,
    /// Hour of day generation starts (inclusive).
    pub sunrise_hour: f64,
    /// Hour of day generation stops (exclusive).
    pub sunset_hour: f64,
    /// Standard deviation of the noise as a fraction of output.
    pub noise_std: f64,
    pub seed: u64,
}

impl SolarProfile {
    /// Fraction of peak output at `hour` of day, in `[0, 1]`.
    pub fn daylight_frac(&self, hour: f64) -> f64 {
        if hour < self.sunrise_hour || hour >= self.sunset_hour {
            return 0.0;
        }
        let span = self.sunset_hour - self.sunrise_hour;
        if span <= 0.0 {
            return 0.0;
        }
        (PI * (hour - self.sunrise_hour) / span).sin().max(0.0)
    }

    /// Generation (kW, negative) for `len` steps of `period_minutes` from `start`.
    pub fn series(&self, start: NaiveDateTime, period_minutes: u32, len: usize) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        (0..len)
            .map(|t| {
                let at = start + TimeDelta::minutes(i64::from(period_minutes) * t as i64);
                let hour = f64::from(at.hour()) + f64::from(at.minute()) / 60.0;
                // Draw every step so the noise sequence does not depend on daylight.
                let noise = gaussian_noise(&mut rng, self.noise_std);
                let frac = self.daylight_frac(hour);
                if frac <= 0.0 {
                    return 0.0;
                }
                -(self.kw_peak.max(0.0) * frac * (1.0 + noise)).max(0.0)
            })
            .collect()
    }
}

/// Box-Muller sample with standard deviation `std_dev`.
fn gaussian_noise(rng: &mut StdRng, std_dev: f64) -> f64 {
    if std_dev <= 0.0 {
        return 0.0;
    }
    let u1: f64 = rng.random::<f64>().clamp(1e-12, 1.0);
    let u2: f64 = rng.random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos() * std_dev
}
