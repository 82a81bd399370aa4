use std::time::Instant;

use crossbeam_channel::Sender;
use log::{info, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::core::domain::{Params, SimBox, SystemDefinition};
use crate::driver::{RunEvent, RunStats};
use crate::engine::bonds::BondTable;
use crate::engine::calendar::{CalendarSettings, CalendarState, CollisionCalendar};
use crate::engine::thermostat::Thermostat;
use crate::error::{Error, Result};

/// External driver loop: owns the calendar and the thermostat and decides
/// how far to advance.
pub struct Runner {
    calendar: CollisionCalendar,
    thermostat: Thermostat,
    params: Params,
}

impl Runner {
    pub fn new(calendar: CollisionCalendar, thermostat: Thermostat, params: Params) -> Self {
        Self {
            calendar,
            thermostat,
            params,
        }
    }

    /// Random initial configuration, empty bond table, primed-on-demand calendar.
    pub fn from_definition(def: &SystemDefinition) -> Result<Self> {
        def.validate()?;
        let params = def.params.clone();
        let boundary = def.boundary()?;
        let grid = def.interaction_grid()?;

        let mut rng = ChaCha8Rng::seed_from_u64(params.seed);
        let sim_box = SimBox::new_random(
            boundary,
            def.species.clone(),
            &params.atom_counts,
            &grid,
            params.temperature,
            &mut rng,
        )
        .ok_or_else(|| {
            Error::InvalidParam(format!(
                "could not place {:?} particles without overlap in a {:?} box",
                params.atom_counts, params.box_size
            ))
        })?;
        info!(
            "placed {} particles, packing fraction {:.4}",
            sim_box.len(),
            packing_fraction(&sim_box)
        );

        let bonds = BondTable::for_box(&sim_box)?;
        let calendar = CollisionCalendar::new(sim_box, grid, bonds, CalendarSettings::from(&params))?;
        let thermostat = Thermostat::from_params(&params)?;
        Ok(Self::new(calendar, thermostat, params))
    }

    /// Replaces the thermostat built from the parameters.
    pub fn with_thermostat(mut self, thermostat: Thermostat) -> Self {
        self.thermostat = thermostat;
        self
    }

    pub fn calendar(&self) -> &CollisionCalendar {
        &self.calendar
    }

    pub fn calendar_mut(&mut self) -> &mut CollisionCalendar {
        &mut self.calendar
    }

    pub fn thermostat(&self) -> &Thermostat {
        &self.thermostat
    }

    /// Runs for `params.duration` of simulation time if set, otherwise for
    /// `params.events` collisions. Applies the thermostat on its schedule.
    pub fn run(&mut self, tx: &Sender<RunEvent>) -> Result<RunStats> {
        let start_time = Instant::now();

        // 1. Prime
        if self.calendar.state() != CalendarState::Primed {
            self.calendar.reset()?;
        }
        let initial = RunStats::capture(&self.calendar, 0, 0.0);
        let _ = tx.send(RunEvent::Log(format!(
            "Starting run: {} particles, E={:.6}, T={:.4}",
            self.calendar.sim_box().len(),
            initial.total_energy,
            initial.temperature
        )));

        // 2. Main loop
        let mut last_report = self.calendar.event_count();
        let outcome = match self.params.duration {
            Some(duration) => self.run_for_time(duration, tx, &mut last_report, start_time),
            None => self.run_for_events(self.params.events, tx, &mut last_report, start_time),
        };
        if let Err(e) = &outcome {
            let _ = tx.send(RunEvent::Log(format!(
                "Run halted at t={:.6} after {} events: {}",
                self.calendar.time(),
                self.calendar.event_count(),
                e
            )));
        }
        outcome?;

        // 3. Report
        let stats = self.snapshot(start_time);
        if !self.thermostat.is_active() {
            let drift = (stats.total_energy - initial.total_energy).abs();
            if drift > 1e-6 * initial.total_energy.abs().max(1.0) {
                warn!("energy drifted by {:.3e} in an isolated run", drift);
            }
        }
        let _ = tx.send(RunEvent::Finished(stats.clone()));
        Ok(stats)
    }

    fn run_for_events(
        &mut self,
        events: u64,
        tx: &Sender<RunEvent>,
        last_report: &mut u64,
        start_time: Instant,
    ) -> Result<()> {
        let target = self.calendar.event_count().saturating_add(events);
        while self.calendar.event_count() < target {
            if self.calendar.step()?.is_none() {
                let _ = tx.send(RunEvent::Log("No further events predicted.".to_string()));
                break;
            }
            self.thermostat.apply_if_due(&mut self.calendar)?;
            self.report(tx, last_report, start_time);
        }
        Ok(())
    }

    fn run_for_time(
        &mut self,
        duration: f64,
        tx: &Sender<RunEvent>,
        last_report: &mut u64,
        start_time: Instant,
    ) -> Result<()> {
        if !(duration.is_finite() && duration >= 0.0) {
            return Err(Error::InvalidParam("duration must be finite and >= 0".into()));
        }
        let end = self.calendar.time() + duration;
        loop {
            let stop = end.min(self.thermostat.next_time());
            match self.calendar.next_event_time() {
                Some(t) if t <= stop => {
                    self.calendar.step()?;
                    self.report(tx, last_report, start_time);
                }
                _ => {
                    self.calendar.advance_until(stop)?;
                    if stop >= end {
                        break;
                    }
                    self.thermostat.apply_if_due(&mut self.calendar)?;
                }
            }
        }
        Ok(())
    }

    fn report(&self, tx: &Sender<RunEvent>, last_report: &mut u64, start_time: Instant) {
        let interval = self.params.report_interval;
        if interval == 0 || self.calendar.event_count() < *last_report + interval {
            return;
        }
        *last_report = self.calendar.event_count();
        let _ = tx.send(RunEvent::Progress(self.snapshot(start_time)));
    }

    fn snapshot(&self, start_time: Instant) -> RunStats {
        RunStats::capture(
            &self.calendar,
            self.thermostat.applications(),
            start_time.elapsed().as_secs_f64(),
        )
    }
}

/// Volume fraction occupied by particle cores.
fn packing_fraction(sim_box: &SimBox) -> f64 {
    let cores: f64 = sim_box
        .particles
        .iter()
        .map(|p| {
            let d = sim_box.species[p.species].diameter;
            std::f64::consts::PI * d * d * d / 6.0
        })
        .sum();
    cores / sim_box.boundary.volume()
}
