//! Converts simulated EV currents into power injections on feeder loads.

use std::collections::BTreeMap;

use num_complex::Complex64;

use crate::acn::network::Site;
use crate::acn::simulator::SimulationResult;

/// Line-to-neutral voltage of the secondary phases (V).
const PHASE_VOLTAGE: f64 = 120.0;

/// Transformers whose secondaries are summed on multi-transformer sites.
const JPL_TRANSFORMERS: [&str; 2] = ["Third/Fourth Floor Transformer ", "First Floor Transformer "];

/// Phase voltages of the secondaries A, B and C.
pub fn phase_voltages() -> [(char, Complex64); 3] {
    [
        ('A', Complex64::from_polar(PHASE_VOLTAGE, 0.0)),
        ('B', Complex64::from_polar(PHASE_VOLTAGE, (-120f64).to_radians())),
        ('C', Complex64::from_polar(PHASE_VOLTAGE, 120f64.to_radians())),
    ]
}

/// Complex power (kVA) drawn at voltage `v` by current `i`: `S = V·conj(I)/1000`.
pub fn complex_power_kva(v: Complex64, i: Complex64) -> Complex64 {
    v * i.conj() / 1000.0
}

/// Per-phase current magnitudes keyed `Secondary A/B/C`; on `jpl` the two
/// transformers' secondaries are summed.
pub fn secondary_currents(result: &SimulationResult) -> BTreeMap<char, Vec<f64>> {
    let mut currents = result.constraint_current_magnitudes();
    let steps = result.steps();
    phase_voltages()
        .iter()
        .map(|&(phase, _)| {
            let name = format!("Secondary {phase}");
            let series = match result.network.site {
                Site::Jpl => {
                    let mut total = vec![0.0; steps];
                    for prefix in JPL_TRANSFORMERS {
                        if let Some(part) = currents.get(&format!("{prefix}{name}")) {
                            for (acc, v) in total.iter_mut().zip(part) {
                                *acc += v;
                            }
                        }
                    }
                    total
                }
                Site::Caltech => currents.remove(&name).unwrap_or_else(|| vec![0.0; steps]),
            };
            (phase, series)
        })
        .collect()
}

/// Per-phase power (kVA) for the loads `load_<bus>_a/_b/_c`.
pub fn unbalanced_loads(result: &SimulationResult, bus: &str) -> Vec<(String, Vec<Complex64>)> {
    let currents = secondary_currents(result);
    phase_voltages()
        .iter()
        .map(|&(phase, v)| {
            let series = currents
                .get(&phase)
                .map(|mags| {
                    mags.iter()
                        .map(|&i| complex_power_kva(v, Complex64::new(i, 0.0)))
                        .collect()
                })
                .unwrap_or_default();
            (
                format!("load_{bus}_{}", phase.to_ascii_lowercase()),
                series,
            )
        })
        .collect()
}

/// Aggregate EV power (kW, no reactive part) for the load `load_<bus>`.
pub fn balanced_load(result: &SimulationResult, bus: &str) -> (String, Vec<Complex64>) {
    (
        format!("load_{bus}"),
        result
            .aggregate_power()
            .into_iter()
            .map(|p| Complex64::new(p, 0.0))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acn::network::ChargingNetwork;
    use chrono::{FixedOffset, TimeZone};

    fn result(site: Site, rates: Vec<Vec<f64>>) -> SimulationResult {
        let ids: Vec<String> = (0..rates.len()).map(|i| format!("S-{i:02}")).collect();
        SimulationResult {
            start: FixedOffset::west_opt(7 * 3600)
                .and_then(|tz| tz.with_ymd_and_hms(2019, 7, 1, 0, 0, 0).single())
                .expect("start"),
            period: 5,
            voltage: 208.0,
            algorithm: "unctrl".into(),
            tariff: "sce_tou_ev_4_march_2019".into(),
            network: ChargingNetwork::for_site(site, 208.0, &ids),
            charging_rates: rates,
            sessions: Vec::new(),
        }
    }

    #[test]
    fn power_is_voltage_times_conjugate_current() {
        let s = complex_power_kva(Complex64::new(120.0, 0.0), Complex64::new(10.0, 5.0));
        assert!((s - Complex64::new(1.2, -0.6)).norm() < 1e-12);
    }

    #[test]
    fn balanced_three_phase_total_matches_line_power() {
        // One station per line pair at 10 A gives sqrt(3)·10 A on each phase.
        let r = result(Site::Caltech, vec![vec![10.0]; 3]);
        let loads = unbalanced_loads(&r, "1003");
        let names: Vec<&str> = loads.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["load_1003_a", "load_1003_b", "load_1003_c"]);

        let total: f64 = loads.iter().map(|(_, s)| s[0].norm()).sum();
        let expected = 3.0 * 120.0 * 10.0 * 3f64.sqrt() / 1000.0;
        assert!((total - expected).abs() < 1e-9, "{total} vs {expected}");
        // Phase B draws at -120 degrees.
        assert!((loads[1].1[0].arg().to_degrees() + 120.0).abs() < 1e-9);
    }

    #[test]
    fn jpl_sums_both_transformers() {
        // Six stations: the first triple on one transformer, the second on the other.
        let r = result(Site::Jpl, vec![vec![10.0]; 6]);
        let currents = secondary_currents(&r);
        for phase in ['A', 'B', 'C'] {
            assert!((currents[&phase][0] - 2.0 * 10.0 * 3f64.sqrt()).abs() < 1e-9);
        }
    }

    #[test]
    fn balanced_load_is_aggregate_real_power() {
        let r = result(Site::Caltech, vec![vec![32.0, 0.0], vec![16.0, 8.0]]);
        let (name, series) = balanced_load(&r, "2002");
        assert_eq!(name, "load_2002");
        assert!((series[0].re - 48.0 * 0.208).abs() < 1e-12);
        assert_eq!(series[0].im, 0.0);
        assert!((series[1].re - 8.0 * 0.208).abs() < 1e-12);
    }
}
