use log::{debug, info};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::core::domain::{Params, ParticleId, ThermostatKind};
use crate::engine::calendar::CollisionCalendar;
use crate::error::{Error, Result};

/// Periodic velocity perturbation applied between calendar steps.
///
/// Draws come from a private ChaCha8 stream so that a seeded run reproduces
/// the same kicks regardless of what else consumes randomness.
#[derive(Debug, Clone)]
pub struct Thermostat {
    kind: ThermostatKind,
    temperature: f64,
    interval: f64,
    next_time: f64,
    applications: u64,
    rng: ChaCha8Rng,
}

impl Thermostat {
    pub fn new(kind: ThermostatKind, temperature: f64, interval: f64, seed: u64) -> Result<Self> {
        if !(temperature.is_finite() && temperature >= 0.0) {
            return Err(Error::InvalidParam(
                "thermostat temperature must be finite and >= 0".into(),
            ));
        }
        if kind != ThermostatKind::None && !(interval.is_finite() && interval > 0.0) {
            return Err(Error::InvalidParam(
                "thermostat interval must be finite and > 0".into(),
            ));
        }
        Ok(Self {
            kind,
            temperature,
            interval,
            next_time: interval,
            applications: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    /// Built from the run parameters; the stream is offset from the placement seed.
    pub fn from_params(params: &Params) -> Result<Self> {
        Self::new(
            params.thermostat,
            params.temperature,
            params.thermostat_interval,
            params.seed.wrapping_add(1),
        )
    }

    pub fn kind(&self) -> ThermostatKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.kind != ThermostatKind::None
    }

    /// Simulation time of the next scheduled application.
    pub fn next_time(&self) -> f64 {
        if self.is_active() {
            self.next_time
        } else {
            f64::INFINITY
        }
    }

    pub fn applications(&self) -> u64 {
        self.applications
    }

    /// Applies once if the calendar clock has reached the next application time.
    pub fn apply_if_due(&mut self, calendar: &mut CollisionCalendar) -> Result<bool> {
        if !self.is_active() || calendar.time() < self.next_time {
            return Ok(false);
        }
        self.apply(calendar)?;
        self.schedule_after(calendar.time());
        Ok(true)
    }

    /// First interval multiple strictly after `now`.
    fn schedule_after(&mut self, now: f64) {
        let k = (now / self.interval).floor();
        self.next_time = [k + 1.0, k + 2.0]
            .into_iter()
            .map(|m| m * self.interval)
            .find(|&t| t > now)
            // Interval below the resolution of `now`.
            .unwrap_or_else(|| f64::from_bits(now.max(0.0).to_bits() + 1));
    }

    /// Perturbs velocities now. Affected predictions are repaired by the calendar.
    pub fn apply(&mut self, calendar: &mut CollisionCalendar) -> Result<()> {
        match self.kind {
            ThermostatKind::None => return Ok(()),
            ThermostatKind::VelocityScaling => {
                let current = calendar.temperature();
                if current <= 0.0 {
                    return Ok(());
                }
                let factor = (self.temperature / current).sqrt();
                calendar.rescale(factor)?;
                debug!(
                    "velocity scaling at t={:.4}: T {:.4} -> {:.4}",
                    calendar.time(),
                    current,
                    self.temperature
                );
            }
            ThermostatKind::Andersen => {
                calendar.randomize_all(self.temperature, &mut self.rng)?;
                debug!("Andersen redraw of all velocities at t={:.4}", calendar.time());
            }
            ThermostatKind::AndersenSingle => {
                let sim_box = calendar.sim_box();
                let mobile: Vec<ParticleId> = sim_box
                    .particles
                    .iter()
                    .map(|p| p.id)
                    .filter(|&id| sim_box.inverse_mass(id) > 0.0)
                    .collect();
                let Some(&id) = mobile.choose(&mut self.rng) else {
                    return Ok(());
                };
                calendar.randomize_one(id, self.temperature, &mut self.rng)?;
                debug!("Andersen redraw of {} at t={:.4}", id, calendar.time());
            }
        }
        self.applications += 1;
        if self.applications == 1 {
            info!(
                "thermostat {:?} active: T={:.4} every {:.4} time units",
                self.kind, self.temperature, self.interval
            );
        }
        Ok(())
    }
}
