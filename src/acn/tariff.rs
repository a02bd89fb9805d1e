//! Time-of-use tariffs used as the price signal of cost-aware schedulers.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, TimeDelta, Timelike, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A block of the day with a flat energy price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TouPeriod {
    /// Start of the block in local hours (inclusive).
    pub start_hour: f64,
    /// End of the block in local hours (exclusive).
    pub end_hour: f64,
    /// Energy price ($/kWh).
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeOfUseTariff {
    pub name: String,
    pub weekday: Vec<TouPeriod>,
    pub weekend: Vec<TouPeriod>,
    /// Demand charge ($/kW of monthly peak).
    pub demand_charge: f64,
}

impl TimeOfUseTariff {
    /// Names of the tariffs compiled into the crate.
    pub const BUILT_IN: &[&str] = &[
        "sce_tou_ev_4_march_2019",
        "sce_tou_ev_8_june_2019",
        "pge_a10_tou_aug_2019",
    ];

    /// Looks up a tariff, preferring `<dir>/<name>.json` over the built-ins.
    ///
    /// # Errors
    ///
    /// Returns an error if the tariff file is unreadable or the name is unknown.
    pub fn load(name: &str, dir: Option<&Path>) -> Result<Self> {
        if let Some(path) = Self::override_path(name, dir) {
            let raw = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
            return serde_json::from_str(&raw).map_err(|e| Error::json(&path, e));
        }
        Self::built_in(name).ok_or_else(|| Error::UnknownTariff(name.to_string()))
    }

    /// The `<dir>/<name>.json` file that shadows a built-in, if present.
    pub fn override_path(name: &str, dir: Option<&Path>) -> Option<PathBuf> {
        dir.map(|d| d.join(format!("{name}.json"))).filter(|p| p.exists())
    }

    pub fn built_in(name: &str) -> Option<Self> {
        let (weekday, weekend, demand_charge) = match name {
            "sce_tou_ev_4_march_2019" => (
                vec![
                    period(0.0, 8.0, 0.0837),
                    period(8.0, 12.0, 0.1275),
                    period(12.0, 18.0, 0.3215),
                    period(18.0, 23.0, 0.1275),
                    period(23.0, 24.0, 0.0837),
                ],
                vec![period(0.0, 24.0, 0.0837)],
                15.51,
            ),
            "sce_tou_ev_8_june_2019" => (
                vec![
                    period(0.0, 8.0, 0.1031),
                    period(8.0, 16.0, 0.1253),
                    period(16.0, 21.0, 0.3079),
                    period(21.0, 24.0, 0.1253),
                ],
                vec![
                    period(0.0, 16.0, 0.1031),
                    period(16.0, 21.0, 0.1921),
                    period(21.0, 24.0, 0.1031),
                ],
                0.0,
            ),
            "pge_a10_tou_aug_2019" => (
                vec![
                    period(0.0, 8.5, 0.1355),
                    period(8.5, 12.0, 0.1667),
                    period(12.0, 18.0, 0.2238),
                    period(18.0, 21.5, 0.1667),
                    period(21.5, 24.0, 0.1355),
                ],
                vec![period(0.0, 24.0, 0.1355)],
                19.65,
            ),
            _ => return None,
        };
        Some(Self {
            name: name.to_string(),
            weekday,
            weekend,
            demand_charge,
        })
    }

    /// Energy price ($/kWh) in effect at local time `t`.
    pub fn price_at(&self, t: DateTime<Tz>) -> f64 {
        let hour = f64::from(t.hour()) + f64::from(t.minute()) / 60.0;
        let periods = match t.weekday() {
            Weekday::Sat | Weekday::Sun => &self.weekend,
            _ => &self.weekday,
        };
        periods
            .iter()
            .find(|p| hour >= p.start_hour && hour < p.end_hour)
            .map_or(0.0, |p| p.price)
    }

    /// Energy prices for `len` consecutive steps starting at `start`.
    pub fn prices(&self, start: DateTime<Tz>, period_minutes: u32, len: usize) -> Vec<f64> {
        (0..len)
            .map(|k| {
                let offset = TimeDelta::minutes(i64::from(period_minutes) * k as i64);
                self.price_at(start + offset)
            })
            .collect()
    }
}

fn period(start_hour: f64, end_hour: f64, price: f64) -> TouPeriod {
    TouPeriod {
        start_hour,
        end_hour,
        price,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::America::Los_Angeles;

    #[test]
    fn all_built_ins_resolve() {
        for name in TimeOfUseTariff::BUILT_IN {
            assert!(TimeOfUseTariff::load(name, None).is_ok(), "{name}");
        }
        assert!(matches!(
            TimeOfUseTariff::load("flat_rate", None),
            Err(Error::UnknownTariff(_))
        ));
    }

    #[test]
    fn on_peak_is_most_expensive_on_weekdays() {
        let tariff = TimeOfUseTariff::load("sce_tou_ev_4_march_2019", None).expect("tariff");
        // 2019-07-01 was a Monday.
        let noon = Los_Angeles.with_ymd_and_hms(2019, 7, 1, 13, 0, 0).single().expect("t");
        let night = Los_Angeles.with_ymd_and_hms(2019, 7, 1, 2, 0, 0).single().expect("t");
        assert!(tariff.price_at(noon) > tariff.price_at(night));

        let saturday = Los_Angeles.with_ymd_and_hms(2019, 7, 6, 13, 0, 0).single().expect("t");
        assert_eq!(tariff.price_at(saturday), tariff.price_at(night));
    }

    #[test]
    fn file_tariff_overrides_built_in() {
        let dir = tempfile::tempdir().expect("tempdir");
        let custom = TimeOfUseTariff {
            name: "sce_tou_ev_4_march_2019".into(),
            weekday: vec![period(0.0, 24.0, 1.0)],
            weekend: vec![period(0.0, 24.0, 1.0)],
            demand_charge: 0.0,
        };
        let path = dir.path().join("sce_tou_ev_4_march_2019.json");
        fs::write(&path, serde_json::to_string(&custom).expect("json")).expect("write");

        let loaded = TimeOfUseTariff::load("sce_tou_ev_4_march_2019", Some(dir.path()))
            .expect("tariff");
        assert_eq!(loaded, custom);
        assert_eq!(
            TimeOfUseTariff::override_path("sce_tou_ev_4_march_2019", Some(dir.path())),
            Some(path)
        );
        assert_eq!(TimeOfUseTariff::override_path("pge_a10_tou_aug_2019", Some(dir.path())), None);
    }

    #[test]
    fn prices_step_through_the_day() {
        let tariff = TimeOfUseTariff::load("pge_a10_tou_aug_2019", None).expect("tariff");
        let start = Los_Angeles.with_ymd_and_hms(2019, 7, 1, 0, 0, 0).single().expect("t");
        let prices = tariff.prices(start, 60, 24);
        assert_eq!(prices.len(), 24);
        assert_eq!(prices[0], 0.1355);
        assert_eq!(prices[13], 0.2238);
    }
}
