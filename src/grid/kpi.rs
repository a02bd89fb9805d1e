//! Voltage KPIs computed from recorded feeder telemetry.

use std::fmt;

use super::telemetry::FeederTelemetry;

/// ANSI C84.1 range A service voltage band (p.u.).
pub const UPPER_LIMIT_PU: f64 = 1.05;
pub const LOWER_LIMIT_PU: f64 = 0.95;

/// Aggregate voltage-quality indicators of a feeder run.
///
/// Computed post-hoc from [`FeederTelemetry`] so the report always matches
/// the recorded data.
#[derive(Debug, Clone, PartialEq)]
pub struct VoltageKpiReport {
    pub steps: usize,
    /// Highest node voltage seen (p.u.).
    pub max_voltage_pu: f64,
    /// Lowest node voltage seen (p.u.).
    pub min_voltage_pu: f64,
    /// Steps with at least one node above the upper limit.
    pub overvoltage_steps: usize,
    /// Steps with at least one node below the lower limit.
    pub undervoltage_steps: usize,
    /// Node-steps outside the band.
    pub node_violations: usize,
    /// Regulator tap moves between consecutive steps, summed over regulators.
    pub tap_changes: usize,
}

impl VoltageKpiReport {
    pub fn from_telemetry(telemetry: &FeederTelemetry) -> Self {
        let envelope = telemetry.voltage_envelope();
        if envelope.is_empty() {
            return Self {
                steps: 0,
                max_voltage_pu: 0.0,
                min_voltage_pu: 0.0,
                overvoltage_steps: 0,
                undervoltage_steps: 0,
                node_violations: 0,
                tap_changes: 0,
            };
        }

        let max_voltage_pu = envelope.iter().map(|e| e.max_pu).fold(f64::MIN, f64::max);
        let min_voltage_pu = envelope.iter().map(|e| e.min_pu).fold(f64::MAX, f64::min);
        let overvoltage_steps = envelope.iter().filter(|e| e.max_pu > UPPER_LIMIT_PU).count();
        let undervoltage_steps = envelope.iter().filter(|e| e.min_pu < LOWER_LIMIT_PU).count();

        let node_violations = telemetry
            .voltage_pu
            .iter()
            .flat_map(|(_, row)| row.values())
            .filter(|&&v| v > UPPER_LIMIT_PU || v < LOWER_LIMIT_PU)
            .count();

        let tap_changes = telemetry
            .taps
            .names()
            .into_iter()
            .map(|name| {
                telemetry
                    .taps
                    .series(name)
                    .windows(2)
                    .filter(|w| (w[1].1 - w[0].1).abs() > 1e-9)
                    .count()
            })
            .sum();

        Self {
            steps: envelope.len(),
            max_voltage_pu,
            min_voltage_pu,
            overvoltage_steps,
            undervoltage_steps,
            node_violations,
            tap_changes,
        }
    }
}

impl fmt::Display for VoltageKpiReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Voltage KPI Report ---")?;
        writeln!(f, "Steps solved:          {}", self.steps)?;
        writeln!(f, "Max voltage:           {:.4} p.u.", self.max_voltage_pu)?;
        writeln!(f, "Min voltage:           {:.4} p.u.", self.min_voltage_pu)?;
        writeln!(f, "Steps above {UPPER_LIMIT_PU:.2}:     {}", self.overvoltage_steps)?;
        writeln!(f, "Steps below {LOWER_LIMIT_PU:.2}:     {}", self.undervoltage_steps)?;
        writeln!(f, "Node violations:       {}", self.node_violations)?;
        write!(f, "Regulator tap changes: {}", self.tap_changes)
    }
}
