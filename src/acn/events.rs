//! Charging sessions and the plug-in event queue that drives a simulation.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One vehicle's plug-in to plug-out interval with its energy demand.
///
/// Times are simulation step indices relative to the experiment start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargingSession {
    pub session_id: String,
    pub station_id: String,
    /// First step the vehicle is plugged in.
    pub arrival: usize,
    /// First step the vehicle is gone.
    pub departure: usize,
    /// Energy the driver asked for (kWh).
    pub requested_energy_kwh: f64,
    /// Maximum rate the vehicle's battery accepts (A).
    pub max_rate_amps: f64,
}

impl ChargingSession {
    /// Number of steps the vehicle stays plugged in.
    pub fn duration(&self) -> usize {
        self.departure.saturating_sub(self.arrival)
    }
}

/// A plug-in event. The matching unplug happens implicitly at the session's
/// departure step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginEvent {
    pub timestamp: usize,
    pub session: ChargingSession,
}

/// Ordered queue of plug-in events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventQueue {
    events: Vec<PluginEvent>,
}

impl EventQueue {
    /// Builds a queue from sessions, ordered by arrival then session id.
    pub fn from_sessions(sessions: impl IntoIterator<Item = ChargingSession>) -> Self {
        let mut events: Vec<PluginEvent> = sessions
            .into_iter()
            .map(|session| PluginEvent {
                timestamp: session.arrival,
                session,
            })
            .collect();
        events.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.session.session_id.cmp(&b.session.session_id))
        });
        Self { events }
    }

    pub fn events(&self) -> &[PluginEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Sessions arriving exactly at step `t`.
    pub fn arrivals_at(&self, t: usize) -> impl Iterator<Item = &ChargingSession> {
        self.events
            .iter()
            .filter(move |e| e.timestamp == t)
            .map(|e| &e.session)
    }

    /// Distinct station ids referenced by the queue, sorted.
    pub fn station_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .events
            .iter()
            .map(|e| e.session.station_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Reads a queue previously written with [`EventQueue::to_json`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid queue.
    pub fn from_json(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        serde_json::from_str(&raw).map_err(|e| Error::json(path, e))
    }

    /// Writes the queue as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_json(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string(self).map_err(|e| Error::json(path, e))?;
        fs::write(path, raw).map_err(|e| Error::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, station: &str, arrival: usize) -> ChargingSession {
        ChargingSession {
            session_id: id.to_string(),
            station_id: station.to_string(),
            arrival,
            departure: arrival + 10,
            requested_energy_kwh: 5.0,
            max_rate_amps: 32.0,
        }
    }

    #[test]
    fn queue_is_ordered_by_arrival() {
        let q = EventQueue::from_sessions(vec![
            session("b", "CA-2", 7),
            session("a", "CA-1", 3),
            session("c", "CA-1", 7),
        ]);
        let stamps: Vec<usize> = q.events().iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![3, 7, 7]);
        assert_eq!(q.events()[1].session.session_id, "b");
    }

    #[test]
    fn station_ids_are_unique_and_sorted() {
        let q = EventQueue::from_sessions(vec![
            session("a", "CA-2", 0),
            session("b", "CA-1", 1),
            session("c", "CA-2", 2),
        ]);
        assert_eq!(q.station_ids(), vec!["CA-1", "CA-2"]);
    }

    #[test]
    fn json_file_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.json");
        let q = EventQueue::from_sessions(vec![session("a", "CA-1", 4)]);
        q.to_json(&path).expect("write");
        let back = EventQueue::from_json(&path).expect("read");
        assert_eq!(q, back);
        assert_eq!(back.arrivals_at(4).count(), 1);
    }
}
