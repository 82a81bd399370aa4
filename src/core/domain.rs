use std::fmt;

use nalgebra::{Point3, Vector3};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::core::chemistry::InteractionGrid;
use crate::core::spatial;
use crate::engine::potential::PairLaw;
use crate::error::{Error, Result};

// --- Constants ---

/// Placement attempts per particle before random packing gives up.
pub const MAX_PLACEMENT_ATTEMPTS: usize = 1000;

// --- Identity ---

/// Stable handle of a particle; also its index in every per-atom table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParticleId(pub usize);

impl ParticleId {
    #[inline(always)]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ParticleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// --- Physics Types ---

/// Immutable per-type properties shared by every particle of a species.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Species {
    pub symbol: String,
    pub mass: f64,
    pub diameter: f64,
    /// Number of bond slots (chain models use 2).
    pub valence: usize,
    /// Infinite mass: collides but is never displaced.
    pub fixed: bool,
}

impl Default for Species {
    fn default() -> Self {
        Self {
            symbol: "X".to_string(),
            mass: 1.0,
            diameter: 1.0,
            valence: 0,
            fixed: false,
        }
    }
}

impl Species {
    /// Zero for fixed (infinite-mass) species.
    #[inline]
    pub fn inverse_mass(&self) -> f64 {
        if self.fixed || self.mass.is_infinite() {
            0.0
        } else {
            1.0 / self.mass
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.fixed && !(self.mass.is_finite() && self.mass > 0.0) {
            return Err(Error::InvalidParam(format!(
                "species {}: mass must be finite and > 0",
                self.symbol
            )));
        }
        if !(self.diameter.is_finite() && self.diameter >= 0.0) {
            return Err(Error::InvalidParam(format!(
                "species {}: diameter must be finite and >= 0",
                self.symbol
            )));
        }
        Ok(())
    }

    /// Draws a Maxwell-Boltzmann velocity at `temperature` (kB = 1).
    pub fn sample_velocity<R: Rng + ?Sized>(&self, temperature: f64, rng: &mut R) -> Vector3<f64> {
        if self.fixed {
            return Vector3::zeros();
        }
        let sigma = (temperature / self.mass).sqrt();
        Vector3::new(
            sigma * rng.sample::<f64, _>(StandardNormal),
            sigma * rng.sample::<f64, _>(StandardNormal),
            sigma * rng.sample::<f64, _>(StandardNormal),
        )
    }
}

/// A single particle. Owned by the [`SimBox`]; the engine edits it in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Particle {
    pub id: ParticleId,
    pub species: usize,
    pub position: Point3<f64>,
    pub velocity: Vector3<f64>,
}

/// Rectangular box geometry with per-axis periodicity.
///
/// Non-periodic axes are closed by hard walls at `0` and `L`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Boundary {
    pub edges: Vector3<f64>,
    pub periodic: [bool; 3],
}

impl Boundary {
    pub fn new(edges: [f64; 3], periodic: [bool; 3]) -> Result<Self> {
        if !edges.iter().all(|&l| l.is_finite() && l > 0.0) {
            return Err(Error::InvalidParam(
                "box edges must be finite and > 0".into(),
            ));
        }
        Ok(Self {
            edges: Vector3::from(edges),
            periodic,
        })
    }

    pub fn cubic(edge: f64) -> Result<Self> {
        Self::new([edge; 3], [true; 3])
    }

    /// Minimum-magnitude equivalent of `dr` under periodic wrap.
    #[inline]
    pub fn nearest_image(&self, mut dr: Vector3<f64>) -> Vector3<f64> {
        for k in 0..3 {
            if self.periodic[k] {
                let l = self.edges[k];
                dr[k] -= l * (dr[k] / l).round();
            }
        }
        dr
    }

    /// Folds periodic coordinates into `[0, L)`.
    #[inline]
    pub fn wrap(&self, p: &mut Point3<f64>) {
        for k in 0..3 {
            if self.periodic[k] {
                let l = self.edges[k];
                let mut x = p[k].rem_euclid(l);
                if x >= l {
                    x -= l;
                }
                p[k] = x;
            }
        }
    }

    pub fn volume(&self) -> f64 {
        self.edges.x * self.edges.y * self.edges.z
    }
}

/// The simulation box: boundary geometry plus the particle collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimBox {
    pub boundary: Boundary,
    pub species: Vec<Species>,
    pub particles: Vec<Particle>,
}

impl SimBox {
    pub fn new(boundary: Boundary, species: Vec<Species>) -> Self {
        Self {
            boundary,
            species,
            particles: Vec::new(),
        }
    }

    /// Appends a particle and returns its handle. Fixed species get zero velocity.
    pub fn add_particle(
        &mut self,
        species: usize,
        position: Point3<f64>,
        velocity: Vector3<f64>,
    ) -> Result<ParticleId> {
        let kind = self.species.get(species).ok_or_else(|| {
            Error::InvalidParam(format!("unknown species index {}", species))
        })?;
        if !position.coords.iter().all(|x| x.is_finite()) {
            return Err(Error::InvalidParam("position must be finite".into()));
        }
        if !velocity.iter().all(|x| x.is_finite()) {
            return Err(Error::InvalidParam("velocity must be finite".into()));
        }
        let velocity = if kind.fixed { Vector3::zeros() } else { velocity };
        let mut position = position;
        self.boundary.wrap(&mut position);

        let id = ParticleId(self.particles.len());
        self.particles.push(Particle {
            id,
            species,
            position,
            velocity,
        });
        Ok(id)
    }

    /// Random sequential placement of `atom_counts[s]` particles of each species `s`.
    ///
    /// Rejects positions whose hard core overlaps an already placed particle
    /// (nearest image). Velocities are Maxwell-Boltzmann with zero net momentum,
    /// scaled to exactly `temperature`. Returns `None` if packing fails.
    pub fn new_random<R: Rng + ?Sized>(
        boundary: Boundary,
        species: Vec<Species>,
        atom_counts: &[usize],
        grid: &InteractionGrid,
        temperature: f64,
        rng: &mut R,
    ) -> Option<Self> {
        if atom_counts.len() > species.len() {
            return None;
        }
        let mut sim_box = SimBox::new(boundary, species);

        for (species_id, &count) in atom_counts.iter().enumerate() {
            for _ in 0..count {
                let mut placed = false;
                for _ in 0..MAX_PLACEMENT_ATTEMPTS {
                    let pos = random_position(&sim_box, species_id, rng);
                    let clash = sim_box.particles.iter().any(|other| {
                        let limit_sq = grid.get_collision_sq(species_id, other.species);
                        spatial::distance_sq(&pos, &other.position, &sim_box.boundary) < limit_sq
                    });
                    if !clash {
                        let v = sim_box.species[species_id].sample_velocity(temperature, rng);
                        sim_box.add_particle(species_id, pos, v).ok()?;
                        placed = true;
                        break;
                    }
                }
                if !placed {
                    return None; // Failed to pack
                }
            }
        }

        sim_box.zero_momentum();
        sim_box.scale_to_temperature(temperature);
        Some(sim_box)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.particles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    #[inline]
    pub fn particle(&self, id: ParticleId) -> &Particle {
        &self.particles[id.index()]
    }

    #[inline]
    pub fn species_of(&self, id: ParticleId) -> &Species {
        &self.species[self.particles[id.index()].species]
    }

    #[inline]
    pub fn inverse_mass(&self, id: ParticleId) -> f64 {
        self.species_of(id).inverse_mass()
    }

    pub fn kinetic_energy_of(&self, id: ParticleId) -> f64 {
        let s = self.species_of(id);
        if s.fixed {
            return 0.0;
        }
        0.5 * s.mass * self.particle(id).velocity.norm_squared()
    }

    pub fn kinetic_energy(&self) -> f64 {
        self.particles
            .iter()
            .map(|p| self.kinetic_energy_of(p.id))
            .sum()
    }

    /// Total momentum of the mobile particles.
    pub fn momentum(&self) -> Vector3<f64> {
        self.particles
            .iter()
            .filter(|p| !self.species[p.species].fixed)
            .fold(Vector3::zeros(), |acc, p| {
                acc + p.velocity * self.species[p.species].mass
            })
    }

    pub fn mobile_count(&self) -> usize {
        self.particles
            .iter()
            .filter(|p| !self.species[p.species].fixed)
            .count()
    }

    /// Kinetic temperature `2 KE / (3 N_mobile)`.
    pub fn temperature(&self) -> f64 {
        let n = self.mobile_count();
        if n == 0 {
            return 0.0;
        }
        2.0 * self.kinetic_energy() / (3.0 * n as f64)
    }

    /// Removes the centre-of-mass velocity of the mobile particles.
    pub fn zero_momentum(&mut self) {
        let total_mass: f64 = self
            .particles
            .iter()
            .filter(|p| !self.species[p.species].fixed)
            .map(|p| self.species[p.species].mass)
            .sum();
        if total_mass <= 0.0 {
            return;
        }
        let v_com = self.momentum() / total_mass;
        for p in &mut self.particles {
            if !self.species[p.species].fixed {
                p.velocity -= v_com;
            }
        }
    }

    /// Rescales mobile velocities so that `temperature()` equals `target`.
    pub fn scale_to_temperature(&mut self, target: f64) {
        let current = self.temperature();
        if current <= 0.0 || target < 0.0 {
            return;
        }
        let factor = (target / current).sqrt();
        for p in &mut self.particles {
            p.velocity *= factor;
        }
    }
}

fn random_position<R: Rng + ?Sized>(sim_box: &SimBox, species: usize, rng: &mut R) -> Point3<f64> {
    let radius = 0.5 * sim_box.species[species].diameter;
    let mut pos = Point3::origin();
    for k in 0..3 {
        let l = sim_box.boundary.edges[k];
        pos[k] = if sim_box.boundary.periodic[k] {
            rng.gen_range(0.0..l)
        } else if l > 2.0 * radius {
            rng.gen_range(radius..(l - radius))
        } else {
            0.5 * l
        };
    }
    pos
}

// --- Configuration Types ---

/// What to do when two hard cores are found overlapping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Accept the overlap; the pair separates on its own.
    Ignore,
    #[default]
    Fatal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThermostatKind {
    #[default]
    None,
    VelocityScaling,
    Andersen,
    AndersenSingle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    pub seed: u64,
    pub threads: usize,

    // Physics Constraints
    pub atom_counts: Vec<usize>, // Explicit counts per species (e.g., [200])
    pub box_size: [f64; 3],
    pub periodic: [bool; 3],
    pub temperature: f64,

    // Engine
    pub cell_range: usize,
    pub nudge: f64,
    pub overlap_policy: OverlapPolicy,
    pub max_degenerate_retries: usize,

    // Thermostat
    pub thermostat: ThermostatKind,
    pub thermostat_interval: f64,

    // Run length
    pub events: u64,
    pub duration: Option<f64>,
    pub report_interval: u64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            seed: 0,
            threads: 4,
            atom_counts: vec![], // Must be populated by main
            box_size: [10.0; 3],
            periodic: [true; 3],
            temperature: 1.0,
            cell_range: 1,
            nudge: 1e-10,
            overlap_policy: OverlapPolicy::Fatal,
            max_degenerate_retries: 32,
            thermostat: ThermostatKind::None,
            thermostat_interval: 1.0,
            events: 10_000,
            duration: None,
            report_interval: 1_000,
        }
    }
}

/// Overrides the default additive hard-sphere law for one species pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionSpec {
    pub species: (usize, usize),
    pub law: PairLaw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemDefinition {
    pub species: Vec<Species>,
    #[serde(default)]
    pub interactions: Vec<InteractionSpec>,
    #[serde(default)]
    pub params: Params,
}

impl SystemDefinition {
    pub fn from_json(text: &str) -> Result<Self> {
        let def: SystemDefinition = serde_json::from_str(text)?;
        def.validate()?;
        Ok(def)
    }

    pub fn validate(&self) -> Result<()> {
        if self.species.is_empty() {
            return Err(Error::InvalidParam("at least one species is required".into()));
        }
        for s in &self.species {
            s.validate()?;
        }
        if self.params.atom_counts.len() > self.species.len() {
            return Err(Error::InvalidParam(
                "atom_counts has more entries than species".into(),
            ));
        }
        if self.params.cell_range == 0 {
            return Err(Error::InvalidParam("cell_range must be >= 1".into()));
        }
        if !(self.params.temperature.is_finite() && self.params.temperature >= 0.0) {
            return Err(Error::InvalidParam("temperature must be finite and >= 0".into()));
        }
        Ok(())
    }

    pub fn boundary(&self) -> Result<Boundary> {
        Boundary::new(self.params.box_size, self.params.periodic)
    }

    /// Additive hard spheres for every pair, then the explicit overrides.
    pub fn interaction_grid(&self) -> Result<InteractionGrid> {
        let mut grid = InteractionGrid::new(&self.species);
        for spec in &self.interactions {
            grid.set(spec.species.0, spec.species.1, spec.law)?;
        }
        Ok(grid)
    }
}
