//! Model-predictive charging schedule as a conic program solved by Clarabel.
//!
//! Variables are the rates `r[i][k]` (A) of each plugged-in session `i` for
//! each remaining step `k` of its stay, plus an epigraph variable for the
//! peak when a demand-charge term is present. The adaptive objective is
//! maximized, so every utility enters the solver's minimization negated:
//!
//! ```text
//! minimize    ½ xᵀPx + qᵀx
//! subject to  0 ≤ r[i][k] ≤ ub[i]
//!             Σ_k r[i][k] ≤ remaining[i]             (energy, amp-periods)
//!             Σ_i r[i][k] ≤ peak_limit[t + k]        (optional)
//!             ‖Σ_i c·r[i][k]·e^{jθ_i}‖ ≤ limit       (each phase constraint)
//! ```

use clarabel::algebra::CscMatrix;
use clarabel::solver::{
    DefaultSettingsBuilder, DefaultSolver, IPSolver, SolverStatus, SupportedConeT,
};
use tracing::debug;

use super::algorithms::{
    AdaptiveConfig, Objective, days_remaining_scale, load_flattening_utility,
};
use super::network::ChargingNetwork;
use crate::error::{Error, Result};

/// A plugged-in session as seen by the optimizer at the current step.
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub evse: usize,
    /// Energy still owed, in amp-periods.
    pub remaining_amp_periods: f64,
    /// Highest rate the EVSE and the vehicle accept (A).
    pub upper_bound: f64,
    /// Steps until departure.
    pub steps_left: usize,
}

/// Everything the optimizer needs about the current step.
pub struct ScheduleProblem<'a> {
    pub network: &'a ChargingNetwork,
    pub sessions: &'a [ActiveSession],
    pub config: &'a AdaptiveConfig,
    pub current_step: usize,
    pub period_minutes: u32,
    /// Energy prices for the optimization horizon ($/kWh).
    pub prices: &'a [f64],
    /// Demand charge ($/kW).
    pub demand_charge: f64,
    /// Highest aggregate power realized so far (kW).
    pub prev_peak_kw: f64,
}

impl ScheduleProblem<'_> {
    pub fn horizon(&self) -> usize {
        self.sessions.iter().map(|s| s.steps_left).max().unwrap_or(0)
    }
}

/// Solves the schedule and returns each session's rates over its stay.
///
/// # Errors
///
/// Returns [`Error::Solver`] when Clarabel cannot be set up or does not
/// reach an optimal point.
pub fn optimize(problem: &ScheduleProblem<'_>) -> Result<Vec<Vec<f64>>> {
    if problem.sessions.is_empty() {
        return Ok(Vec::new());
    }
    let demand_weight: f64 = problem
        .config
        .objective
        .iter()
        .filter_map(|c| match c.objective {
            Objective::DaysRemainingDemandCharge { days_in_month, .. } => {
                let scale = days_remaining_scale(
                    problem.current_step,
                    problem.period_minutes,
                    days_in_month,
                );
                Some(c.coefficient * scale * problem.demand_charge)
            }
            _ => None,
        })
        .sum();
    let layout = Layout::new(problem, demand_weight > 0.0);
    let horizon = problem.horizon();
    let voltage = problem.network.voltage;
    let kw_per_amp = voltage / 1000.0;
    let hours_per_step = f64::from(problem.period_minutes) / 60.0;
    let kwh_per_amp_step = kw_per_amp * hours_per_step;

    let mut q = vec![0.0; layout.n_vars];
    let mut p_entries: Vec<(usize, usize, f64)> = Vec::new();

    for component in &problem.config.objective {
        let w = component.coefficient;
        match &component.objective {
            Objective::TotalEnergy => {
                for (_, _, col) in layout.rate_vars() {
                    q[col] -= w * kwh_per_amp_step;
                }
            }
            Objective::TouEnergyCost => {
                for (_, k, col) in layout.rate_vars() {
                    let price = problem.prices.get(k).copied().unwrap_or(0.0);
                    q[col] += w * price * kwh_per_amp_step;
                }
            }
            // Priced through the peak variable below.
            Objective::DaysRemainingDemandCharge { .. } => {}
            Objective::QuickCharge => {
                for (_, k, col) in layout.rate_vars() {
                    q[col] -= w * (horizon - k) as f64 / horizon as f64;
                }
            }
            Objective::EqualShare => {
                for (_, _, col) in layout.rate_vars() {
                    p_entries.push((col, col, 2.0 * w));
                }
            }
            Objective::LoadFlattening {
                external_signal,
                scaling_factor,
            } => {
                let c = w / (scaling_factor * scaling_factor);
                for k in 0..horizon {
                    let cols = layout.columns_at(k);
                    let external = external_signal
                        .as_ref()
                        .and_then(|s| s.get(problem.current_step + k))
                        .copied()
                        .unwrap_or(0.0);
                    for (a, &ca) in cols.iter().enumerate() {
                        q[ca] += 2.0 * c * kw_per_amp * external;
                        for &cb in &cols[a..] {
                            let (row, col) = if ca <= cb { (ca, cb) } else { (cb, ca) };
                            p_entries.push((row, col, 2.0 * c * kw_per_amp * kw_per_amp));
                        }
                    }
                }
            }
        }
    }

    let mut rows = RowBuilder::default();
    for (i, _, col) in layout.rate_vars() {
        rows.push(&[(col, 1.0)], problem.sessions[i].upper_bound);
        rows.push(&[(col, -1.0)], 0.0);
    }
    for (i, session) in problem.sessions.iter().enumerate() {
        let entries: Vec<(usize, f64)> = layout.session_cols(i).map(|c| (c, 1.0)).collect();
        rows.push(&entries, session.remaining_amp_periods.max(0.0));
    }
    if let Some(limit) = &problem.config.peak_limit {
        for k in 0..horizon {
            let entries: Vec<(usize, f64)> =
                layout.columns_at(k).iter().map(|&c| (c, 1.0)).collect();
            rows.push(&entries, limit.at(problem.current_step + k).max(0.0));
        }
    }
    // Peak epigraph: aggregate kW at every step and the running peak stay below it.
    if let Some(peak_col) = layout.peak_col {
        q[peak_col] += demand_weight;
        for k in 0..horizon {
            let mut entries: Vec<(usize, f64)> =
                layout.columns_at(k).iter().map(|&c| (c, kw_per_amp)).collect();
            entries.push((peak_col, -1.0));
            rows.push(&entries, 0.0);
        }
        rows.push(&[(peak_col, -1.0)], -problem.prev_peak_kw.max(baseline_peak(problem)));
    }
    let n_nonneg = rows.len();

    let mut cones = vec![SupportedConeT::NonnegativeConeT(n_nonneg)];
    for constraint in &problem.network.constraints {
        for k in 0..horizon {
            let mut re = Vec::new();
            let mut im = Vec::new();
            for (i, col) in layout.active_at(k) {
                let evse = problem.sessions[i].evse;
                if let Some(&(_, coeff)) = constraint.members.iter().find(|(m, _)| *m == evse) {
                    let phasor = problem.network.evses[evse].phasor() * coeff;
                    re.push((col, phasor.re));
                    im.push((col, phasor.im));
                }
            }
            if re.is_empty() {
                continue;
            }
            rows.push(&[], constraint.limit_amps);
            rows.push(&re, 0.0);
            rows.push(&im, 0.0);
            cones.push(SupportedConeT::SecondOrderConeT(3));
        }
    }

    let a = csc_from_triplets(rows.len(), layout.n_vars, rows.triplets);
    let p = csc_from_triplets(layout.n_vars, layout.n_vars, p_entries);

    let settings = DefaultSettingsBuilder::default()
        .verbose(false)
        .build()
        .map_err(|e| Error::Solver(format!("settings: {e:?}")))?;
    let mut solver = DefaultSolver::new(&p, &q, &a, &rows.rhs, &cones, settings)
        .map_err(|e| Error::Solver(format!("setup: {e:?}")))?;
    solver.solve();

    let solution = &solver.solution;
    if !matches!(
        solution.status,
        SolverStatus::Solved | SolverStatus::AlmostSolved
    ) {
        return Err(Error::Solver(format!(
            "{} via Clarabel returned {:?} at step {}",
            problem.config.solver, solution.status, problem.current_step
        )));
    }
    let rates: Vec<Vec<f64>> = problem
        .sessions
        .iter()
        .enumerate()
        .map(|(i, s)| {
            layout
                .session_cols(i)
                .map(|col| solution.x[col].clamp(0.0, s.upper_bound))
                .collect()
        })
        .collect();
    debug!(
        step = problem.current_step,
        sessions = problem.sessions.len(),
        horizon,
        iterations = solution.iterations,
        flattening = ?flattening_utility(problem, &rates),
        "solved adaptive schedule"
    );
    Ok(rates)
}

/// Aggregate EV power (kW) per step of the horizon for per-session rates.
pub fn aggregate_kw(problem: &ScheduleProblem<'_>, rates: &[Vec<f64>]) -> Vec<f64> {
    let kw_per_amp = problem.network.voltage / 1000.0;
    let mut total = vec![0.0; problem.horizon()];
    for session in rates {
        for (k, r) in session.iter().enumerate() {
            if let Some(slot) = total.get_mut(k) {
                *slot += r * kw_per_amp;
            }
        }
    }
    total
}

/// Load-flattening utility of `rates` against the problem's external
/// signal, or `None` when the objective has no flattening term.
pub fn flattening_utility(problem: &ScheduleProblem<'_>, rates: &[Vec<f64>]) -> Option<f64> {
    problem
        .config
        .objective
        .iter()
        .find_map(|c| match &c.objective {
            Objective::LoadFlattening {
                external_signal,
                scaling_factor,
            } => Some(load_flattening_utility(
                &aggregate_kw(problem, rates),
                external_signal.as_deref(),
                problem.current_step,
                *scaling_factor,
            )),
            _ => None,
        })
}

fn baseline_peak(problem: &ScheduleProblem<'_>) -> f64 {
    problem
        .config
        .objective
        .iter()
        .filter_map(|c| match c.objective {
            Objective::DaysRemainingDemandCharge {
                baseline_peak_kw, ..
            } => Some(baseline_peak_kw),
            _ => None,
        })
        .fold(0.0, f64::max)
}

/// Column indices of the decision variables.
struct Layout {
    /// First column of each session's rates.
    offsets: Vec<usize>,
    lengths: Vec<usize>,
    peak_col: Option<usize>,
    n_vars: usize,
}

impl Layout {
    fn new(problem: &ScheduleProblem<'_>, with_peak: bool) -> Self {
        let mut offsets = Vec::with_capacity(problem.sessions.len());
        let mut next = 0;
        for s in problem.sessions {
            offsets.push(next);
            next += s.steps_left;
        }
        Self {
            offsets,
            lengths: problem.sessions.iter().map(|s| s.steps_left).collect(),
            peak_col: with_peak.then_some(next),
            n_vars: next + usize::from(with_peak),
        }
    }

    fn session_cols(&self, i: usize) -> std::ops::Range<usize> {
        self.offsets[i]..self.offsets[i] + self.lengths[i]
    }

    /// `(session, step, column)` for every rate variable.
    fn rate_vars(&self) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        (0..self.offsets.len())
            .flat_map(move |i| self.session_cols(i).enumerate().map(move |(k, c)| (i, k, c)))
    }

    /// `(session, column)` of the sessions still plugged in at step `k`.
    fn active_at(&self, k: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.offsets.len())
            .filter(move |&i| k < self.lengths[i])
            .map(move |i| (i, self.offsets[i] + k))
    }

    fn columns_at(&self, k: usize) -> Vec<usize> {
        self.active_at(k).map(|(_, c)| c).collect()
    }
}

#[derive(Default)]
struct RowBuilder {
    triplets: Vec<(usize, usize, f64)>,
    rhs: Vec<f64>,
}

impl RowBuilder {
    fn push(&mut self, entries: &[(usize, f64)], rhs: f64) {
        let row = self.rhs.len();
        self.triplets
            .extend(entries.iter().map(|&(col, v)| (row, col, v)));
        self.rhs.push(rhs);
    }

    fn len(&self) -> usize {
        self.rhs.len()
    }
}

/// Compressed sparse column matrix from `(row, col, value)` triplets;
/// duplicate coordinates are summed.
fn csc_from_triplets(
    n_rows: usize,
    n_cols: usize,
    mut triplets: Vec<(usize, usize, f64)>,
) -> CscMatrix<f64> {
    triplets.sort_by(|a, b| (a.1, a.0).cmp(&(b.1, b.0)));

    let mut col_ptr = Vec::with_capacity(n_cols + 1);
    let mut row_idx: Vec<usize> = Vec::with_capacity(triplets.len());
    let mut values: Vec<f64> = Vec::with_capacity(triplets.len());
    let mut cursor = 0;
    for col in 0..n_cols {
        col_ptr.push(values.len());
        while cursor < triplets.len() && triplets[cursor].1 == col {
            let (row, _, v) = triplets[cursor];
            let col_start = col_ptr[col];
            if values.len() > col_start && row_idx.last() == Some(&row) {
                if let Some(last) = values.last_mut() {
                    *last += v;
                }
            } else {
                row_idx.push(row);
                values.push(v);
            }
            cursor += 1;
        }
    }
    col_ptr.push(values.len());
    CscMatrix::new(n_rows, n_cols, col_ptr, row_idx, values)
}
