//! Event-driven charging simulator.
//!
//! The simulator advances in fixed periods from step 0 to the horizon. Each
//! step it unplugs departed vehicles, plugs in arrivals, asks the scheduling
//! policy for a rate per EVSE and integrates the delivered energy.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, FixedOffset, TimeDelta};
use chrono_tz::Tz;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::algorithms::{AdaptiveConfig, SchedulingPolicy};
use super::events::{ChargingSession, EventQueue};
use super::network::ChargingNetwork;
use super::optimizer::{self, ActiveSession, ScheduleProblem};
use super::tariff::TimeOfUseTariff;
use crate::error::{Error, Result};

/// Bisection iterations used by least-laxity-first to find a feasible rate.
const BISECTION_STEPS: usize = 30;

/// Energy bookkeeping is done in amp-periods; below this the session is done.
const ENERGY_EPS: f64 = 1e-6;

/// Final state of one charging session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub session_id: String,
    pub station_id: String,
    pub arrival: usize,
    pub departure: usize,
    pub requested_energy_kwh: f64,
    pub delivered_energy_kwh: f64,
}

/// Serialized state of a completed simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub start: DateTime<FixedOffset>,
    /// Step length (minutes).
    pub period: u32,
    pub voltage: f64,
    pub algorithm: String,
    pub tariff: String,
    pub network: ChargingNetwork,
    /// Charging current (A) indexed `[evse][step]`.
    pub charging_rates: Vec<Vec<f64>>,
    pub sessions: Vec<SessionOutcome>,
}

impl SimulationResult {
    pub fn steps(&self) -> usize {
        self.charging_rates.first().map_or(0, Vec::len)
    }

    /// Total EV power drawn at each step (kW).
    pub fn aggregate_power(&self) -> Vec<f64> {
        let mut total = vec![0.0; self.steps()];
        for rates in &self.charging_rates {
            for (acc, rate) in total.iter_mut().zip(rates) {
                *acc += rate * self.voltage / 1000.0;
            }
        }
        total
    }

    /// Complex current through every network constraint at each step (A).
    pub fn constraint_currents(&self) -> BTreeMap<String, Vec<Complex64>> {
        let steps = self.steps();
        self.network
            .constraints
            .iter()
            .map(|c| {
                let currents = (0..steps)
                    .map(|t| {
                        c.members
                            .iter()
                            .map(|&(i, coeff)| {
                                self.network.evses[i].phasor() * (coeff * self.charging_rates[i][t])
                            })
                            .sum()
                    })
                    .collect();
                (c.name.clone(), currents)
            })
            .collect()
    }

    /// Magnitudes of [`SimulationResult::constraint_currents`].
    pub fn constraint_current_magnitudes(&self) -> BTreeMap<String, Vec<f64>> {
        self.constraint_currents()
            .into_iter()
            .map(|(name, currents)| (name, currents.iter().map(|i| i.norm()).collect()))
            .collect()
    }

    pub fn energy_delivered_kwh(&self) -> f64 {
        self.sessions.iter().map(|s| s.delivered_energy_kwh).sum()
    }

    /// Reads a result previously written with [`SimulationResult::to_json`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_json(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        serde_json::from_str(&raw).map_err(|e| Error::json(path, e))
    }

    /// Writes the result as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_json(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string(self).map_err(|e| Error::json(path, e))?;
        fs::write(path, raw).map_err(|e| Error::io(path, e))
    }
}

/// A plugged-in vehicle.
#[derive(Debug)]
struct Plugged {
    session: ChargingSession,
    evse: usize,
    /// Highest rate both the EVSE and the battery accept (A).
    upper_bound: f64,
    requested: f64,
    delivered: f64,
}

impl Plugged {
    fn remaining(&self) -> f64 {
        let remaining = self.requested - self.delivered;
        if remaining < ENERGY_EPS { 0.0 } else { remaining }
    }

    fn laxity(&self, t: usize) -> f64 {
        let steps_left = self.session.departure.saturating_sub(t) as f64;
        if self.upper_bound <= 0.0 {
            return steps_left;
        }
        steps_left - self.remaining() / self.upper_bound
    }
}

/// The schedule computed by the most recent optimization.
struct Plan {
    computed_at: usize,
    rates: BTreeMap<String, Vec<f64>>,
}

/// Plays an event queue against a charging network.
pub struct Simulator<'a> {
    network: &'a ChargingNetwork,
    events: &'a EventQueue,
    policy: &'a SchedulingPolicy,
    tariff: &'a TimeOfUseTariff,
    start: DateTime<Tz>,
    period: u32,
    horizon: usize,
}

impl<'a> Simulator<'a> {
    pub fn new(
        network: &'a ChargingNetwork,
        events: &'a EventQueue,
        policy: &'a SchedulingPolicy,
        tariff: &'a TimeOfUseTariff,
        start: DateTime<Tz>,
        period: u32,
        horizon: usize,
    ) -> Self {
        Self {
            network,
            events,
            policy,
            tariff,
            start,
            period,
            horizon,
        }
    }

    fn amp_periods_per_kwh(&self) -> f64 {
        1000.0 * 60.0 / (self.network.voltage * f64::from(self.period))
    }

    /// Runs the simulation to the horizon.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Solver`] if an adaptive schedule cannot be solved.
    pub fn run(&self, algorithm: &str) -> Result<SimulationResult> {
        let n_evse = self.network.evses.len();
        let index = self.network.evse_index();
        let to_amp_periods = self.amp_periods_per_kwh();

        let mut rates = vec![vec![0.0; self.horizon]; n_evse];
        let mut plugged: Vec<Plugged> = Vec::new();
        let mut outcomes: Vec<SessionOutcome> = Vec::new();
        let mut plan: Option<Plan> = None;
        let mut prev_peak_kw = 0.0_f64;

        for t in 0..self.horizon {
            let mut changed = false;

            let (gone, staying): (Vec<_>, Vec<_>) = plugged
                .into_iter()
                .partition(|p| p.session.departure <= t);
            plugged = staying;
            changed |= !gone.is_empty();
            outcomes.extend(gone.into_iter().map(|p| self.outcome(p)));

            for session in self.events.arrivals_at(t) {
                let Some(&evse) = index.get(session.station_id.as_str()) else {
                    warn!(
                        station = %session.station_id,
                        session = %session.session_id,
                        "no EVSE for station; session skipped"
                    );
                    continue;
                };
                if plugged.iter().any(|p| p.evse == evse) {
                    warn!(
                        station = %session.station_id,
                        session = %session.session_id,
                        "EVSE already occupied; session skipped"
                    );
                    continue;
                }
                let departure = session.departure.min(self.horizon);
                plugged.push(Plugged {
                    session: ChargingSession {
                        departure,
                        ..session.clone()
                    },
                    evse,
                    upper_bound: self.network.evses[evse]
                        .max_rate_amps
                        .min(session.max_rate_amps)
                        .max(0.0),
                    requested: session.requested_energy_kwh * to_amp_periods,
                    delivered: 0.0,
                });
                changed = true;
            }

            let step_rates = match self.policy {
                SchedulingPolicy::Uncontrolled => self.uncontrolled(&plugged),
                SchedulingPolicy::LeastLaxityFirst => self.least_laxity_first(&plugged, t),
                SchedulingPolicy::Adaptive(config) => {
                    let stale = plan.as_ref().is_none_or(|p| {
                        changed || t - p.computed_at >= config.max_recompute.max(1)
                    });
                    if stale {
                        plan = Some(self.optimize(config, &plugged, t, prev_peak_kw)?);
                    }
                    self.follow_plan(plan.as_ref(), &plugged, t)
                }
            };

            for (p, rate) in plugged.iter_mut().zip(&step_rates) {
                let rate = rate.clamp(0.0, p.upper_bound.min(p.remaining()));
                rates[p.evse][t] = rate;
                p.delivered += rate;
            }
            let aggregate_kw: f64 =
                rates.iter().map(|r| r[t]).sum::<f64>() * self.network.voltage / 1000.0;
            prev_peak_kw = prev_peak_kw.max(aggregate_kw);
            debug!(step = t, plugged = plugged.len(), aggregate_kw, "simulated step");
        }
        outcomes.extend(plugged.into_iter().map(|p| self.outcome(p)));
        outcomes.sort_by(|a, b| {
            a.arrival
                .cmp(&b.arrival)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });

        let result = SimulationResult {
            start: self.start.fixed_offset(),
            period: self.period,
            voltage: self.network.voltage,
            algorithm: algorithm.to_string(),
            tariff: self.tariff.name.clone(),
            network: self.network.clone(),
            charging_rates: rates,
            sessions: outcomes,
        };
        info!(
            algorithm,
            sessions = result.sessions.len(),
            energy_kwh = result.energy_delivered_kwh(),
            peak_kw = prev_peak_kw,
            "simulation finished"
        );
        Ok(result)
    }

    fn outcome(&self, p: Plugged) -> SessionOutcome {
        SessionOutcome {
            delivered_energy_kwh: p.delivered / self.amp_periods_per_kwh(),
            session_id: p.session.session_id,
            station_id: p.session.station_id,
            arrival: p.session.arrival,
            departure: p.session.departure,
            requested_energy_kwh: p.session.requested_energy_kwh,
        }
    }

    fn uncontrolled(&self, plugged: &[Plugged]) -> Vec<f64> {
        plugged
            .iter()
            .map(|p| p.upper_bound.min(p.remaining()))
            .collect()
    }

    /// Serves sessions in order of increasing laxity, giving each the largest
    /// rate that keeps every constraint feasible.
    fn least_laxity_first(&self, plugged: &[Plugged], t: usize) -> Vec<f64> {
        let mut order: Vec<usize> = (0..plugged.len()).collect();
        order.sort_by(|&a, &b| {
            plugged[a]
                .laxity(t)
                .total_cmp(&plugged[b].laxity(t))
                .then_with(|| plugged[a].session.session_id.cmp(&plugged[b].session.session_id))
        });

        let mut evse_rates = vec![0.0; self.network.evses.len()];
        let mut out = vec![0.0; plugged.len()];
        for i in order {
            let p = &plugged[i];
            let hi = p.upper_bound.min(p.remaining());
            evse_rates[p.evse] = hi;
            if !self.network.is_feasible(&evse_rates) {
                let (mut lo, mut hi) = (0.0, hi);
                for _ in 0..BISECTION_STEPS {
                    let mid = 0.5 * (lo + hi);
                    evse_rates[p.evse] = mid;
                    if self.network.is_feasible(&evse_rates) {
                        lo = mid;
                    } else {
                        hi = mid;
                    }
                }
                evse_rates[p.evse] = lo;
            }
            out[i] = evse_rates[p.evse];
        }
        out
    }

    fn optimize(
        &self,
        config: &AdaptiveConfig,
        plugged: &[Plugged],
        t: usize,
        prev_peak_kw: f64,
    ) -> Result<Plan> {
        let sessions: Vec<ActiveSession> = plugged
            .iter()
            .map(|p| ActiveSession {
                evse: p.evse,
                remaining_amp_periods: p.remaining(),
                upper_bound: p.upper_bound,
                steps_left: p.session.departure.saturating_sub(t),
            })
            .collect();
        let horizon = sessions.iter().map(|s| s.steps_left).max().unwrap_or(0);
        let step_start = self.start + TimeDelta::minutes(i64::from(self.period) * t as i64);
        let prices = self.tariff.prices(step_start, self.period, horizon);

        let problem = ScheduleProblem {
            network: self.network,
            sessions: &sessions,
            config,
            current_step: t,
            period_minutes: self.period,
            prices: &prices,
            demand_charge: self.tariff.demand_charge,
            prev_peak_kw,
        };
        let schedule = optimizer::optimize(&problem)?;
        Ok(Plan {
            computed_at: t,
            rates: plugged
                .iter()
                .map(|p| p.session.session_id.clone())
                .zip(schedule)
                .collect(),
        })
    }

    fn follow_plan(&self, plan: Option<&Plan>, plugged: &[Plugged], t: usize) -> Vec<f64> {
        plugged
            .iter()
            .map(|p| {
                plan.and_then(|plan| {
                    plan.rates
                        .get(&p.session.session_id)
                        .and_then(|r| r.get(t - plan.computed_at))
                })
                .copied()
                .unwrap_or(0.0)
            })
            .collect()
    }
}
