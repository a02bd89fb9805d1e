//! Scheduling policies and the objective terms of the adaptive scheduler.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Revenue per kWh delivered used by the cost-minimizing policy ($/kWh).
const MIN_COST_REVENUE: f64 = 0.3;

/// Nominal line-to-line voltage used to convert kVA headroom to amps.
const PEAK_LIMIT_VOLTAGE: f64 = 208.0;

/// Conic solver requested by a policy.
///
/// Every backend name is solved with Clarabel; the requested name is kept so
/// that experiment labels stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverBackend {
    Mosek,
    Ecos,
    Clarabel,
}

impl SolverBackend {
    pub fn name(self) -> &'static str {
        match self {
            Self::Mosek => "MOSEK",
            Self::Ecos => "ECOS",
            Self::Clarabel => "CLARABEL",
        }
    }
}

impl FromStr for SolverBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MOSEK" => Ok(Self::Mosek),
            "ECOS" => Ok(Self::Ecos),
            "CLARABEL" => Ok(Self::Clarabel),
            _ => Err(Error::UnknownSolver(s.to_string())),
        }
    }
}

impl fmt::Display for SolverBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A utility term maximized by the adaptive scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum Objective {
    /// Energy delivered over the horizon (kWh).
    TotalEnergy,
    /// Negative time-of-use energy cost ($).
    TouEnergyCost,
    /// Negative demand charge, scaled by the days left in the billing month.
    DaysRemainingDemandCharge {
        baseline_peak_kw: f64,
        days_in_month: usize,
    },
    /// Rewards charging earlier in the horizon.
    QuickCharge,
    /// Negative sum of squared rates; spreads current across sessions.
    EqualShare,
    /// Negative squared total load (EV plus external), divided by `scaling_factor`.
    LoadFlattening {
        external_signal: Option<Vec<f64>>,
        scaling_factor: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectiveComponent {
    pub objective: Objective,
    pub coefficient: f64,
}

impl ObjectiveComponent {
    pub fn new(objective: Objective, coefficient: f64) -> Self {
        Self {
            objective,
            coefficient,
        }
    }
}

/// Upper bound on aggregate EV current (A).
#[derive(Debug, Clone, PartialEq)]
pub enum PeakLimit {
    Constant(f64),
    /// Per-step limit; the last value holds past the end of the series.
    Series(Vec<f64>),
}

impl PeakLimit {
    pub fn at(&self, t: usize) -> f64 {
        match self {
            Self::Constant(limit) => *limit,
            Self::Series(limits) => limits
                .get(t)
                .or_else(|| limits.last())
                .copied()
                .unwrap_or(f64::INFINITY),
        }
    }
}

/// Configuration of the model-predictive scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveConfig {
    pub objective: Vec<ObjectiveComponent>,
    pub solver: SolverBackend,
    /// Re-optimize at least every `max_recompute` steps.
    pub max_recompute: usize,
    pub peak_limit: Option<PeakLimit>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulingPolicy {
    Uncontrolled,
    LeastLaxityFirst,
    Adaptive(AdaptiveConfig),
}

impl SchedulingPolicy {
    /// Resolves an algorithm name.
    ///
    /// Supported names are `unctrl`, `llf`, `min_cost`, and anything
    /// containing `load_flattening` (solved as ECOS when the name also
    /// contains `ECOS`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownAlgorithm`] for any other name.
    pub fn from_name(
        alg_name: &str,
        bus_transformer_capacity_kva: f64,
        external_load: Option<&[f64]>,
    ) -> Result<Self, Error> {
        match alg_name {
            "unctrl" => Ok(Self::Uncontrolled),
            "llf" => Ok(Self::LeastLaxityFirst),
            "min_cost" => Ok(Self::Adaptive(AdaptiveConfig {
                objective: vec![
                    ObjectiveComponent::new(Objective::TotalEnergy, MIN_COST_REVENUE),
                    ObjectiveComponent::new(Objective::TouEnergyCost, 1.0),
                    ObjectiveComponent::new(
                        Objective::DaysRemainingDemandCharge {
                            baseline_peak_kw: 0.0,
                            days_in_month: 30,
                        },
                        1.0,
                    ),
                    ObjectiveComponent::new(Objective::QuickCharge, 1e-4),
                    ObjectiveComponent::new(Objective::EqualShare, 1e-9),
                ],
                solver: SolverBackend::Mosek,
                max_recompute: 1,
                peak_limit: None,
            })),
            name if name.contains("load_flattening") => Ok(Self::Adaptive(AdaptiveConfig {
                objective: vec![
                    ObjectiveComponent::new(Objective::TotalEnergy, 100.0),
                    ObjectiveComponent::new(
                        Objective::LoadFlattening {
                            external_signal: external_load.map(<[f64]>::to_vec),
                            scaling_factor: 100.0,
                        },
                        1.0,
                    ),
                    ObjectiveComponent::new(Objective::QuickCharge, 1e-3),
                ],
                solver: if name.contains("ECOS") {
                    SolverBackend::Ecos
                } else {
                    SolverBackend::Mosek
                },
                max_recompute: 1,
                peak_limit: Some(peak_limit(bus_transformer_capacity_kva, external_load)),
            })),
            other => Err(Error::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Aggregate EV current headroom (A): `(capacity − external) × 1000 / 208`.
pub fn peak_limit(bus_transformer_capacity_kva: f64, external_load: Option<&[f64]>) -> PeakLimit {
    let to_amps = |kva: f64| kva * 1000.0 / PEAK_LIMIT_VOLTAGE;
    match external_load {
        None => PeakLimit::Constant(to_amps(bus_transformer_capacity_kva)),
        Some(load) => PeakLimit::Series(
            load.iter()
                .map(|l| to_amps(bus_transformer_capacity_kva - l))
                .collect(),
        ),
    }
}

/// Weight of the demand charge at `current_step`: one over the days left
/// in the billing month, counting today.
pub fn days_remaining_scale(current_step: usize, period_minutes: u32, days_in_month: usize) -> f64 {
    let steps_per_day = (60 / period_minutes.max(1)) as usize * 24;
    let day_index = (current_step / steps_per_day.max(1)).min(days_in_month.saturating_sub(1));
    1.0 / (days_in_month - day_index) as f64
}

/// Load-flattening utility of an aggregate EV profile starting at step `t`.
///
/// External samples past the end of the signal count as zero.
pub fn load_flattening_utility(
    aggregate_kw: &[f64],
    external_signal: Option<&[f64]>,
    t: usize,
    scaling_factor: f64,
) -> f64 {
    -aggregate_kw
        .iter()
        .enumerate()
        .map(|(k, ev)| {
            let external = external_signal
                .and_then(|s| s.get(t + k))
                .copied()
                .unwrap_or(0.0);
            ((ev + external) / scaling_factor).powi(2)
        })
        .sum::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_resolve_to_policies() {
        assert_eq!(
            SchedulingPolicy::from_name("unctrl", 225.0, None).ok(),
            Some(SchedulingPolicy::Uncontrolled)
        );
        assert_eq!(
            SchedulingPolicy::from_name("llf", 225.0, None).ok(),
            Some(SchedulingPolicy::LeastLaxityFirst)
        );
        let Ok(SchedulingPolicy::Adaptive(cfg)) =
            SchedulingPolicy::from_name("min_cost", 225.0, None)
        else {
            panic!("min_cost should be adaptive");
        };
        assert_eq!(cfg.objective.len(), 5);
        assert_eq!(cfg.solver, SolverBackend::Mosek);
        assert!(cfg.peak_limit.is_none());
    }

    #[test]
    fn unknown_algorithm_is_an_error() {
        assert!(matches!(
            SchedulingPolicy::from_name("fifo", 225.0, None),
            Err(Error::UnknownAlgorithm(_))
        ));
    }

    #[test]
    fn load_flattening_picks_solver_from_name() {
        let ext = [10.0, 20.0];
        let Ok(SchedulingPolicy::Adaptive(ecos)) =
            SchedulingPolicy::from_name("load_flattening_ECOS", 225.0, Some(&ext))
        else {
            panic!("adaptive");
        };
        assert_eq!(ecos.solver, SolverBackend::Ecos);
        let Ok(SchedulingPolicy::Adaptive(mosek)) =
            SchedulingPolicy::from_name("load_flattening", 225.0, Some(&ext))
        else {
            panic!("adaptive");
        };
        assert_eq!(mosek.solver, SolverBackend::Mosek);
    }

    #[test]
    fn peak_limit_is_headroom_in_amps() {
        let ext = [0.0, 25.0, 100.5, 225.0];
        let PeakLimit::Series(limits) = peak_limit(225.0, Some(&ext)) else {
            panic!("series expected");
        };
        for (limit, load) in limits.iter().zip(ext) {
            assert_eq!(*limit, (225.0 - load) * 1000.0 / 208.0);
        }
        assert_eq!(peak_limit(225.0, None), PeakLimit::Constant(225.0 * 1000.0 / 208.0));
    }

    #[test]
    fn peak_limit_series_holds_last_value() {
        let limit = PeakLimit::Series(vec![5.0, 7.0]);
        assert_eq!(limit.at(1), 7.0);
        assert_eq!(limit.at(50), 7.0);
    }

    #[test]
    fn demand_charge_scale_grows_through_the_month() {
        // 288 five-minute steps per day.
        assert_eq!(days_remaining_scale(0, 5, 30), 1.0 / 30.0);
        assert_eq!(days_remaining_scale(288, 5, 30), 1.0 / 29.0);
        assert_eq!(days_remaining_scale(288 * 45, 5, 30), 1.0);
    }

    #[test]
    fn flat_profiles_score_higher_than_peaky_ones() {
        let flat = load_flattening_utility(&[50.0, 50.0], None, 0, 100.0);
        let peaky = load_flattening_utility(&[100.0, 0.0], None, 0, 100.0);
        assert!(flat > peaky);

        let ext = [0.0, 0.0, 100.0, 0.0];
        let shifted = load_flattening_utility(&[100.0, 0.0], Some(&ext), 2, 100.0);
        assert_eq!(shifted, -4.0);
    }
}
