//! Event sources: the ACN-Data session API and a seeded synthetic generator.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::events::{ChargingSession, EventQueue};
use crate::error::Result;

/// Parameters needed to turn raw sessions into simulation events.
#[derive(Debug, Clone)]
pub struct EventRequest<'a> {
    pub site: &'a str,
    pub start: DateTime<Tz>,
    pub end: DateTime<Tz>,
    /// Step length (minutes).
    pub period: u32,
    /// EVSE voltage (V).
    pub voltage: f64,
    /// Assumed maximum battery power for every EV (kW).
    pub max_battery_power_kw: f64,
}

impl EventRequest<'_> {
    /// Number of simulation steps in the requested window.
    pub fn steps(&self) -> usize {
        steps_between(self.start, self.end, self.period)
    }

    /// Maximum battery rate (A) implied by the assumed battery power.
    pub fn max_rate_amps(&self) -> f64 {
        self.max_battery_power_kw * 1000.0 / self.voltage
    }

    fn step_index(&self, t: DateTime<Utc>) -> Option<usize> {
        let offset = t.signed_duration_since(self.start).num_minutes();
        if offset < 0 {
            return None;
        }
        usize::try_from(offset / i64::from(self.period)).ok()
    }
}

/// Number of whole `period`-minute steps between two instants.
pub fn steps_between(start: DateTime<Tz>, end: DateTime<Tz>, period: u32) -> usize {
    let minutes = end.signed_duration_since(start).num_minutes().max(0);
    usize::try_from(minutes / i64::from(period)).unwrap_or(0)
}

/// Produces the event queue for an experiment window.
pub trait EventSource {
    /// Generates plug-in events for the requested site and window.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream data cannot be obtained.
    fn generate_events(&self, request: &EventRequest<'_>) -> Result<EventQueue>;
}

const ACN_DATA_BASE_URL: &str = "https://ev.caltech.edu/api/v1/";

/// Client for the public ACN-Data charging-session API.
#[derive(Debug, Clone)]
pub struct AcnDataClient {
    api_key: String,
    base_url: String,
}

impl AcnDataClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: ACN_DATA_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn fetch_sessions(&self, request: &EventRequest<'_>) -> Result<Vec<AcnSession>> {
        let client = reqwest::blocking::Client::new();
        let where_clause = format!(
            "connectionTime>=\"{}\" and connectionTime<=\"{}\"",
            http_date(request.start.with_timezone(&Utc)),
            http_date(request.end.with_timezone(&Utc)),
        );

        let mut sessions = Vec::new();
        let mut page: SessionPage = client
            .get(format!("{}sessions/{}", self.base_url, request.site))
            .query(&[("where", where_clause.as_str())])
            .basic_auth(&self.api_key, Some(""))
            .send()?
            .error_for_status()?
            .json()?;

        loop {
            debug!(items = page.items.len(), "fetched ACN-Data page");
            sessions.append(&mut page.items);
            let Some(next) = page.links.next.take() else {
                break;
            };
            page = client
                .get(format!("{}{}", self.base_url, next.href))
                .basic_auth(&self.api_key, Some(""))
                .send()?
                .error_for_status()?
                .json()?;
        }
        Ok(sessions)
    }
}

impl EventSource for AcnDataClient {
    fn generate_events(&self, request: &EventRequest<'_>) -> Result<EventQueue> {
        let raw = self.fetch_sessions(request)?;
        let total = raw.len();
        let sessions: Vec<ChargingSession> = raw
            .into_iter()
            .filter_map(|s| s.into_session(request))
            .collect();
        if sessions.len() < total {
            warn!(
                dropped = total - sessions.len(),
                "skipped ACN-Data sessions with unusable timestamps"
            );
        }
        info!(site = request.site, sessions = sessions.len(), "generated events from ACN-Data");
        Ok(EventQueue::from_sessions(sessions))
    }
}

fn http_date(t: DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[derive(Debug, Deserialize)]
struct SessionPage {
    #[serde(rename = "_items", default)]
    items: Vec<AcnSession>,
    #[serde(rename = "_links", default)]
    links: PageLinks,
}

#[derive(Debug, Default, Deserialize)]
struct PageLinks {
    next: Option<PageLink>,
}

#[derive(Debug, Deserialize)]
struct PageLink {
    href: String,
}

#[derive(Debug, Deserialize)]
struct AcnSession {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "spaceID")]
    space_id: String,
    #[serde(rename = "connectionTime")]
    connection_time: String,
    #[serde(rename = "disconnectTime")]
    disconnect_time: Option<String>,
    #[serde(rename = "kWhDelivered")]
    kwh_delivered: f64,
}

impl AcnSession {
    fn into_session(self, request: &EventRequest<'_>) -> Option<ChargingSession> {
        let connect = DateTime::parse_from_rfc2822(&self.connection_time).ok()?;
        let disconnect = DateTime::parse_from_rfc2822(self.disconnect_time.as_deref()?).ok()?;
        let arrival = request.step_index(connect.with_timezone(&Utc))?;
        let departure = request.step_index(disconnect.with_timezone(&Utc))?;
        if departure <= arrival {
            return None;
        }
        Some(ChargingSession {
            session_id: self.session_id,
            station_id: self.space_id,
            arrival,
            departure,
            requested_energy_kwh: self.kwh_delivered,
            max_rate_amps: request.max_rate_amps(),
        })
    }
}

/// Seeded random sessions for offline experiments.
///
/// Every station gets one session per simulated day with:
/// - random dwell between `dwell_steps_min` and `dwell_steps_max`
/// - random arrival such that the vehicle leaves before midnight
/// - random demand, capped at what the vehicle could physically absorb
#[derive(Debug, Clone)]
pub struct SyntheticEvents {
    pub seed: u64,
    pub stations: usize,
    pub demand_kwh_min: f64,
    pub demand_kwh_max: f64,
    pub dwell_steps_min: usize,
    pub dwell_steps_max: usize,
}

impl Default for SyntheticEvents {
    fn default() -> Self {
        Self {
            seed: 42,
            stations: 24,
            demand_kwh_min: 4.0,
            demand_kwh_max: 30.0,
            dwell_steps_min: 24,
            dwell_steps_max: 120,
        }
    }
}

impl EventSource for SyntheticEvents {
    fn generate_events(&self, request: &EventRequest<'_>) -> Result<EventQueue> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let steps_per_day = (24 * 60 / request.period as usize).max(1);
        let total = request.steps();
        let dt_hours = f64::from(request.period) / 60.0;
        let max_rate = request.max_rate_amps();
        let prefix = request.site.to_uppercase();

        let mut sessions = Vec::new();
        let days = total.div_ceil(steps_per_day);
        for day in 0..days {
            let day_start = day * steps_per_day;
            let day_len = steps_per_day.min(total - day_start);
            for station in 0..self.stations {
                let dwell_max = self.dwell_steps_max.min(day_len);
                let dwell_min = self.dwell_steps_min.clamp(1, dwell_max.max(1));
                if dwell_max < dwell_min {
                    continue;
                }
                let dwell = rng.random_range(dwell_min..=dwell_max);
                let arrival = day_start + rng.random_range(0..=day_len - dwell);

                let deliverable_kwh = max_rate * request.voltage / 1000.0 * dt_hours * dwell as f64;
                let raw_demand = rng.random_range(self.demand_kwh_min..=self.demand_kwh_max);
                let station_id = format!("{prefix}-{:03}", station + 1);

                sessions.push(ChargingSession {
                    session_id: format!("{station_id}_{day}"),
                    station_id,
                    arrival,
                    departure: arrival + dwell,
                    requested_energy_kwh: raw_demand.min(deliverable_kwh).max(0.0),
                    max_rate_amps: max_rate,
                });
            }
        }
        debug!(
            site = request.site,
            sessions = sessions.len(),
            steps = total,
            "generated synthetic events"
        );
        Ok(EventQueue::from_sessions(sessions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use chrono_tz::America::Los_Angeles;

    fn request(days: i64) -> EventRequest<'static> {
        let start = Los_Angeles
            .with_ymd_and_hms(2019, 7, 1, 0, 0, 0)
            .single()
            .expect("valid start");
        EventRequest {
            site: "caltech",
            start,
            end: start + TimeDelta::days(days),
            period: 5,
            voltage: 208.0,
            max_battery_power_kw: 6.656,
        }
    }

    #[test]
    fn steps_cover_window() {
        assert_eq!(request(1).steps(), 288);
        assert!((request(1).max_rate_amps() - 32.0).abs() < 1e-9);
    }

    #[test]
    fn synthetic_events_are_deterministic() {
        let src = SyntheticEvents::default();
        let a = src.generate_events(&request(2)).expect("events");
        let b = src.generate_events(&request(2)).expect("events");
        assert_eq!(a, b);
        assert_eq!(a.len(), 2 * src.stations);
    }

    #[test]
    fn synthetic_sessions_stay_inside_window() {
        let req = request(1);
        let q = SyntheticEvents::default().generate_events(&req).expect("events");
        for e in q.events() {
            assert!(e.session.departure <= req.steps());
            assert!(e.session.arrival < e.session.departure);
            assert!(e.session.requested_energy_kwh >= 0.0);
        }
    }

    #[test]
    fn acn_session_conversion_uses_step_indices() {
        let req = request(1);
        let raw = AcnSession {
            session_id: "s1".into(),
            space_id: "CA-303".into(),
            connection_time: "Mon, 01 Jul 2019 15:00:00 GMT".into(),
            disconnect_time: Some("Mon, 01 Jul 2019 16:02:00 GMT".into()),
            kwh_delivered: 7.5,
        };
        // 15:00 UTC is 08:00 PDT, i.e. 96 five-minute steps after local midnight.
        let s = raw.into_session(&req).expect("session");
        assert_eq!(s.arrival, 96);
        assert_eq!(s.departure, 108);
        assert_eq!(s.station_id, "CA-303");
    }

    #[test]
    fn acn_session_without_disconnect_is_dropped() {
        let raw = AcnSession {
            session_id: "s1".into(),
            space_id: "CA-303".into(),
            connection_time: "Mon, 01 Jul 2019 15:00:00 GMT".into(),
            disconnect_time: None,
            kwh_delivered: 7.5,
        };
        assert!(raw.into_session(&request(1)).is_none());
    }
}
