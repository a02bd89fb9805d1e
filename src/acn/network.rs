//! Charging-site models: EVSEs on delta line pairs and phase current constraints.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Maximum pilot signal of the sites' basic EVSEs (A).
pub const EVSE_MAX_RATE_AMPS: f64 = 32.0;

/// Charging sites with a known electrical layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Site {
    Caltech,
    Jpl,
}

impl Site {
    pub fn name(self) -> &'static str {
        match self {
            Self::Caltech => "caltech",
            Self::Jpl => "jpl",
        }
    }

    fn transformers(self) -> &'static [(&'static str, f64)] {
        match self {
            Self::Caltech => &[("", 150.0)],
            Self::Jpl => &[
                ("First Floor Transformer ", 150.0),
                ("Third/Fourth Floor Transformer ", 150.0),
            ],
        }
    }
}

impl FromStr for Site {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "caltech" => Ok(Self::Caltech),
            "jpl" => Ok(Self::Jpl),
            other => Err(Error::UnknownSite(other.to_string())),
        }
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Delta line pair an EVSE is wired across.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinePair {
    AB,
    BC,
    CA,
}

impl LinePair {
    const ALL: [LinePair; 3] = [LinePair::AB, LinePair::BC, LinePair::CA];

    /// Phase angle of the line-to-line current (degrees).
    pub fn angle_deg(self) -> f64 {
        match self {
            Self::AB => 30.0,
            Self::BC => -90.0,
            Self::CA => 150.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evse {
    pub station_id: String,
    pub line_pair: LinePair,
    pub max_rate_amps: f64,
}

impl Evse {
    pub fn phasor(&self) -> Complex64 {
        Complex64::from_polar(1.0, self.line_pair.angle_deg().to_radians())
    }
}

/// A current limit on one conductor, expressed over EVSE currents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub name: String,
    /// Magnitude limit (A).
    pub limit_amps: f64,
    /// `(evse index, coefficient)` pairs.
    pub members: Vec<(usize, f64)>,
}

/// The EVSEs of one site and the constraints on their combined current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargingNetwork {
    pub site: Site,
    pub voltage: f64,
    pub evses: Vec<Evse>,
    pub constraints: Vec<Constraint>,
}

impl ChargingNetwork {
    /// Lays out the given stations on `site`.
    ///
    /// Stations are sorted and dealt round-robin over the line pairs; on
    /// multi-transformer sites consecutive triples alternate transformers.
    /// Each transformer contributes `Secondary A/B/C` line constraints
    /// sized to its kVA rating on 120 V phases.
    pub fn for_site(site: Site, voltage: f64, station_ids: &[String]) -> Self {
        let mut ids = station_ids.to_vec();
        ids.sort();
        ids.dedup();

        let transformers = site.transformers();
        let mut groups: Vec<Vec<usize>> = vec![Vec::new(); transformers.len()];
        let evses: Vec<Evse> = ids
            .into_iter()
            .enumerate()
            .map(|(i, station_id)| {
                groups[(i / 3) % transformers.len()].push(i);
                Evse {
                    station_id,
                    line_pair: LinePair::ALL[i % 3],
                    max_rate_amps: EVSE_MAX_RATE_AMPS,
                }
            })
            .collect();

        let mut constraints = Vec::new();
        for ((prefix, kva), members) in transformers.iter().zip(&groups) {
            let limit_amps = kva * 1000.0 / 3.0 / 120.0;
            for (phase, plus, minus) in [
                ("A", LinePair::AB, LinePair::CA),
                ("B", LinePair::BC, LinePair::AB),
                ("C", LinePair::CA, LinePair::BC),
            ] {
                let members = members
                    .iter()
                    .filter_map(|&i| {
                        let pair = evses[i].line_pair;
                        if pair == plus {
                            Some((i, 1.0))
                        } else if pair == minus {
                            Some((i, -1.0))
                        } else {
                            None
                        }
                    })
                    .collect();
                constraints.push(Constraint {
                    name: format!("{prefix}Secondary {phase}"),
                    limit_amps,
                    members,
                });
            }
        }

        Self {
            site,
            voltage,
            evses,
            constraints,
        }
    }

    pub fn evse_index(&self) -> BTreeMap<&str, usize> {
        self.evses
            .iter()
            .enumerate()
            .map(|(i, e)| (e.station_id.as_str(), i))
            .collect()
    }

    /// Complex current through `constraint` for per-EVSE rates.
    pub fn constraint_current(&self, constraint: &Constraint, rates: &[f64]) -> Complex64 {
        constraint
            .members
            .iter()
            .map(|&(i, coeff)| self.evses[i].phasor() * (coeff * rates[i]))
            .sum()
    }

    /// Whether every constraint holds for per-EVSE rates.
    pub fn is_feasible(&self, rates: &[f64]) -> bool {
        const SLACK: f64 = 1e-6;
        self.constraints
            .iter()
            .all(|c| self.constraint_current(c, rates).norm() <= c.limit_amps + SLACK)
    }
}
