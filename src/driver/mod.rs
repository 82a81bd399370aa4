use serde::Serialize;

use crate::analysis::topology;
use crate::engine::calendar::{CollisionCalendar, EventTally};

/// Snapshot of a run, taken between steps.
/// Used for progress telemetry and the final report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    pub events: u64,
    pub time: f64,
    pub kinetic_energy: f64,
    pub potential_energy: f64,
    pub total_energy: f64,
    pub temperature: f64,
    pub bonds: usize,
    pub conversion: f64, // Occupied bond slots / total slots
    pub longest_chain: usize,
    pub thermostat_applications: u64,
    pub tally: EventTally,
    pub wall_seconds: f64,
}

impl RunStats {
    pub fn capture(calendar: &CollisionCalendar, thermostat_applications: u64, wall_seconds: f64) -> Self {
        let bonds = calendar.bonds();
        Self {
            events: calendar.event_count(),
            time: calendar.time(),
            kinetic_energy: calendar.kinetic_energy(),
            potential_energy: calendar.potential_energy(),
            total_energy: calendar.total_energy(),
            temperature: calendar.temperature(),
            bonds: bonds.total_bonds(),
            conversion: topology::conversion(bonds),
            longest_chain: topology::chain_statistics(bonds).longest,
            thermostat_applications,
            tally: *calendar.tally(),
            wall_seconds,
        }
    }

    /// Collisions per wall-clock second.
    pub fn event_rate(&self) -> f64 {
        if self.wall_seconds > 0.0 {
            self.events as f64 / self.wall_seconds
        } else {
            0.0
        }
    }
}

/// Events emitted by the runner to the main thread.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// Diagnostic log message.
    Log(String),

    /// Periodic snapshot, every `report_interval` collisions.
    Progress(RunStats),

    /// Run has completed; carries the final snapshot.
    Finished(RunStats),
}

pub mod runner;
