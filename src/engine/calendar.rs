//! Event calendar for event-driven hard-particle dynamics.
//!
//! Every particle keeps one [`CollisionRecord`]: its earliest predicted event
//! against up-list neighbors (higher handles), hard walls, and its own cell
//! faces. A pair event therefore lives in the record of the lower handle.
//! Records are mirrored into a binary heap for global selection; heap entries
//! carry a per-particle version so superseded entries are skipped on pop.
//!
//! Each particle also carries a trajectory stamp, bumped whenever its velocity
//! changes. A record remembers its partner's stamp, so a prediction against a
//! partner that has since changed course is recognised as stale, recomputed,
//! and never executed.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;

use log::{debug, info, trace, warn};
use nalgebra::Vector3;
use ordered_float::NotNan;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::agents::AgentStore;
use crate::core::chemistry::InteractionGrid;
use crate::core::domain::{Boundary, OverlapPolicy, Params, ParticleId, SimBox, Species};
use crate::core::spatial::{self, Overlap};
use crate::engine::bonds::BondTable;
use crate::engine::cells::{CellIndex, Direction};
use crate::engine::potential::{
    BumpOutcome, PairEventKind, PairKinematics, PairLaw, OVERLAP_TOLERANCE,
};
use crate::error::{Error, Result};

/// Events closer together than this count as firing at the same instant.
pub const DEGENERATE_DT: f64 = 1e-14;

// --- Event Types ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CalendarState {
    /// No valid predictions.
    #[default]
    Idle,
    /// Every particle holds a current prediction.
    Primed,
    /// Inside a step. Seen from outside only after a step failed.
    Advancing,
}

/// The other side of a predicted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Partner {
    #[default]
    None,
    Atom(ParticleId),
    /// Hard wall closing a non-periodic axis, at `0` or at `L`.
    Wall { axis: usize, upper: bool },
    /// Face of the particle's current cell.
    CellFace { axis: usize, step: i8 },
}

impl Partner {
    /// Deterministic tie-break among events at the same time.
    #[inline]
    fn order_key(&self) -> (u8, usize, i8) {
        match *self {
            Partner::Atom(id) => (0, id.index(), 0),
            Partner::Wall { axis, upper } => (1, axis, upper as i8),
            Partner::CellFace { axis, step } => (2, axis, step),
            Partner::None => (3, 0, 0),
        }
    }
}

impl fmt::Display for Partner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Partner::None => write!(f, "nothing"),
            Partner::Atom(id) => write!(f, "{}", id),
            Partner::Wall { axis, upper } => {
                write!(f, "{} wall on axis {}", if upper { "upper" } else { "lower" }, axis)
            }
            Partner::CellFace { axis, step } => write!(f, "cell face {:+} on axis {}", step, axis),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EventKind {
    #[default]
    None,
    Core,
    WellCapture,
    WellEscape,
    BondBreak,
    Wall,
    CellTransit,
}

impl EventKind {
    /// True for events that change a trajectory (counted in `event_count`).
    pub fn is_collision(self) -> bool {
        !matches!(self, EventKind::None | EventKind::CellTransit)
    }

    fn pair_kind(self) -> Option<PairEventKind> {
        match self {
            EventKind::Core => Some(PairEventKind::Core),
            EventKind::WellCapture => Some(PairEventKind::WellCapture),
            EventKind::WellEscape => Some(PairEventKind::WellEscape),
            EventKind::BondBreak => Some(PairEventKind::BondBreak),
            _ => None,
        }
    }
}

impl From<PairEventKind> for EventKind {
    fn from(kind: PairEventKind) -> Self {
        match kind {
            PairEventKind::Core => EventKind::Core,
            PairEventKind::WellCapture => EventKind::WellCapture,
            PairEventKind::WellEscape => EventKind::WellEscape,
            PairEventKind::BondBreak => EventKind::BondBreak,
        }
    }
}

/// Earliest known future event of one particle. Times are absolute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollisionRecord {
    pub time: f64,
    pub partner: Partner,
    pub kind: EventKind,
    /// Partner's trajectory stamp when the prediction was made.
    partner_stamp: u64,
}

impl Default for CollisionRecord {
    fn default() -> Self {
        Self::none()
    }
}

impl CollisionRecord {
    pub fn none() -> Self {
        Self {
            time: f64::INFINITY,
            partner: Partner::None,
            kind: EventKind::None,
            partner_stamp: 0,
        }
    }

    pub fn is_none(&self) -> bool {
        self.partner == Partner::None
    }

    #[inline]
    fn beats(&self, other: &CollisionRecord) -> bool {
        (self.time, self.partner.order_key()) < (other.time, other.partner.order_key())
    }
}

/// What a call to [`CollisionCalendar::step`] executed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutedEvent {
    pub time: f64,
    pub atom: ParticleId,
    pub partner: Partner,
    pub kind: EventKind,
    /// Pair response; `None` for walls and cell transits.
    pub outcome: Option<BumpOutcome>,
}

/// Running counts of executed events by outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTally {
    pub core: u64,
    pub captures: u64,
    pub bonds_formed: u64,
    pub repulsions: u64,
    pub well_reflections: u64,
    pub escapes: u64,
    pub bonds_broken: u64,
    pub walls: u64,
    pub transits: u64,
    /// Selected records found stale and recomputed instead of executed.
    pub stale: u64,
}

impl EventTally {
    fn record(&mut self, outcome: BumpOutcome) {
        match outcome {
            BumpOutcome::CoreReflection => self.core += 1,
            BumpOutcome::Captured => self.captures += 1,
            BumpOutcome::Bonded => self.bonds_formed += 1,
            BumpOutcome::Repelled => self.repulsions += 1,
            BumpOutcome::WellReflection => self.well_reflections += 1,
            BumpOutcome::Escaped => self.escapes += 1,
            BumpOutcome::Unbonded => self.bonds_broken += 1,
        }
    }

    /// Trajectory-changing events; matches the calendar's event count.
    pub fn collisions(&self) -> u64 {
        self.core
            + self.captures
            + self.bonds_formed
            + self.repulsions
            + self.well_reflections
            + self.escapes
            + self.bonds_broken
            + self.walls
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalendarSettings {
    pub cell_range: usize,
    /// Post-event push past the crossed boundary, as a fraction of the separation.
    pub nudge: f64,
    pub overlap_policy: OverlapPolicy,
    /// Consecutive zero-time repeats of one event tolerated before giving up.
    pub max_degenerate_retries: usize,
}

impl Default for CalendarSettings {
    fn default() -> Self {
        Self::from(&Params::default())
    }
}

impl From<&Params> for CalendarSettings {
    fn from(params: &Params) -> Self {
        Self {
            cell_range: params.cell_range,
            nudge: params.nudge,
            overlap_policy: params.overlap_policy,
            max_degenerate_retries: params.max_degenerate_retries,
        }
    }
}

/// Heap entry. Ordered by time, then handle, then partner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Scheduled {
    time: NotNan<f64>,
    atom: ParticleId,
    partner_key: (u8, usize, i8),
    version: u64,
}

#[derive(Debug, Clone, Copy)]
struct DegenerateStreak {
    atom: ParticleId,
    partner: Partner,
    repeats: usize,
}

// --- Calendar ---

#[derive(Debug, Clone)]
pub struct CollisionCalendar {
    sim_box: SimBox,
    grid: InteractionGrid,
    bonds: BondTable,
    cells: CellIndex,
    settings: CalendarSettings,

    records: AgentStore<CollisionRecord>,
    stamps: AgentStore<u64>,
    versions: AgentStore<u64>,
    queue: BinaryHeap<Reverse<Scheduled>>,

    state: CalendarState,
    time: f64,
    event_count: u64,
    potential_energy: f64,
    tally: EventTally,
    streak: Option<DegenerateStreak>,
}

impl CollisionCalendar {
    /// Takes ownership of the box and bond table. The calendar starts `Idle`;
    /// call [`reset`](Self::reset) (or just [`step`](Self::step)) to prime it.
    pub fn new(
        sim_box: SimBox,
        grid: InteractionGrid,
        bonds: BondTable,
        settings: CalendarSettings,
    ) -> Result<Self> {
        if bonds.len() != sim_box.len() {
            return Err(Error::InvalidParam(format!(
                "bond table holds {} particles, box holds {}",
                bonds.len(),
                sim_box.len()
            )));
        }
        if grid.num_species() < sim_box.species.len() {
            return Err(Error::InvalidParam(format!(
                "interaction grid covers {} species, box declares {}",
                grid.num_species(),
                sim_box.species.len()
            )));
        }
        if !(settings.nudge.is_finite() && settings.nudge >= 0.0) {
            return Err(Error::InvalidParam("nudge must be finite and >= 0".into()));
        }
        check_walls(&sim_box.boundary, &sim_box.species)?;

        let cells = CellIndex::build(&sim_box, grid.max_range(), settings.cell_range)?;
        let n = sim_box.len();
        Ok(Self {
            sim_box,
            grid,
            bonds,
            cells,
            settings,
            records: AgentStore::new(n, CollisionRecord::none()),
            stamps: AgentStore::new(n, 0),
            versions: AgentStore::new(n, 0),
            queue: BinaryHeap::new(),
            state: CalendarState::Idle,
            time: 0.0,
            event_count: 0,
            potential_energy: 0.0,
            tally: EventTally::default(),
            streak: None,
        })
    }

    // --- Accessors ---

    pub fn time(&self) -> f64 {
        self.time
    }

    /// Executed collisions (pairs and walls); cell transits are not counted.
    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    pub fn state(&self) -> CalendarState {
        self.state
    }

    pub fn tally(&self) -> &EventTally {
        &self.tally
    }

    pub fn settings(&self) -> &CalendarSettings {
        &self.settings
    }

    pub fn sim_box(&self) -> &SimBox {
        &self.sim_box
    }

    pub fn grid(&self) -> &InteractionGrid {
        &self.grid
    }

    pub fn bonds(&self) -> &BondTable {
        &self.bonds
    }

    pub fn cells(&self) -> &CellIndex {
        &self.cells
    }

    pub fn record(&self, id: ParticleId) -> &CollisionRecord {
        &self.records[id]
    }

    pub fn kinetic_energy_of(&self, id: ParticleId) -> f64 {
        self.sim_box.kinetic_energy_of(id)
    }

    pub fn kinetic_energy(&self) -> f64 {
        self.sim_box.kinetic_energy()
    }

    /// Tracked incrementally from each executed bump.
    pub fn potential_energy(&self) -> f64 {
        self.potential_energy
    }

    pub fn total_energy(&self) -> f64 {
        self.kinetic_energy() + self.potential_energy
    }

    pub fn momentum(&self) -> Vector3<f64> {
        self.sim_box.momentum()
    }

    pub fn temperature(&self) -> f64 {
        self.sim_box.temperature()
    }

    /// Time of the next valid event, if the calendar is primed and has one.
    pub fn next_event_time(&mut self) -> Option<f64> {
        if self.state != CalendarState::Primed {
            return None;
        }
        self.peek_valid().map(|s| s.time.into_inner())
    }

    /// Full scan of pair energies; also resynchronises the tracked value.
    pub fn recompute_potential_energy(&mut self) -> f64 {
        self.potential_energy = self.scan_potential_energy();
        self.potential_energy
    }

    // --- Lifecycle ---

    /// Rebuilds the cell grid and predicts every particle's next event.
    ///
    /// Overlapping cores are reported as [`Error::ConfigurationOverlap`]
    /// under [`OverlapPolicy::Fatal`] and accepted with a warning otherwise.
    pub fn reset(&mut self) -> Result<()> {
        self.state = CalendarState::Idle;

        // 1. Geometry
        spatial::wrap_all(&mut self.sim_box);
        self.cells
            .rebuild(&self.sim_box, self.grid.max_range(), self.settings.cell_range)?;
        let n = self.sim_box.len();
        self.records.resize(n, CollisionRecord::none());
        self.stamps.resize(n, 0);
        self.versions.resize(n, 0);

        // 2. Consistency of the incoming state
        self.bonds.check_consistency()?;
        let overlaps = self.scan_overlaps();
        if let Some(first) = overlaps.first() {
            match self.settings.overlap_policy {
                OverlapPolicy::Fatal => return Err(self.overlap_error(first)),
                OverlapPolicy::Ignore => {
                    warn!(
                        "accepting {} overlapping pair(s) at t={:.6}",
                        overlaps.len(),
                        self.time
                    );
                    for o in &overlaps {
                        debug!(
                            "overlap {} - {}: separation {:.6} < core {:.6}",
                            o.a, o.b, o.separation, o.core
                        );
                    }
                }
            }
        }

        // 3. Predictions
        self.potential_energy = self.scan_potential_energy();
        self.streak = None;
        self.prime();
        self.state = CalendarState::Primed;

        info!(
            "calendar primed: {} particles, t={:.6}, KE={:.6}, PE={:.6}, bonds={}",
            n,
            self.time,
            self.kinetic_energy(),
            self.potential_energy,
            self.bonds.total_bonds()
        );
        Ok(())
    }

    /// Executes the next event of any kind, cell transits included.
    ///
    /// Primes an idle calendar first. Returns `Ok(None)` if no particle has a
    /// future event. After an error the calendar refuses to step until reset.
    pub fn step(&mut self) -> Result<Option<ExecutedEvent>> {
        match self.state {
            CalendarState::Idle => self.reset()?,
            CalendarState::Advancing => {
                return Err(Error::InvalidState(
                    "a previous step failed; reset the calendar before stepping".into(),
                ))
            }
            CalendarState::Primed => {}
        }

        self.state = CalendarState::Advancing;
        let executed = self.execute_next()?;
        self.state = CalendarState::Primed;
        Ok(executed)
    }

    /// Steps until `n` more collisions have executed. Returns how many did.
    pub fn advance_events(&mut self, n: u64) -> Result<u64> {
        let start = self.event_count;
        let target = start.saturating_add(n);
        while self.event_count < target {
            if self.step()?.is_none() {
                break;
            }
        }
        Ok(self.event_count - start)
    }

    /// Executes every event up to `time() + duration`, then free-flies the
    /// system to exactly that time. Returns the number of collisions.
    pub fn advance_time(&mut self, duration: f64) -> Result<u64> {
        if !(duration.is_finite() && duration >= 0.0) {
            return Err(Error::InvalidParam(
                "duration must be finite and >= 0".into(),
            ));
        }
        self.advance_until(self.time + duration)
    }

    /// Executes every event up to the absolute time `end` and leaves the
    /// clock exactly on it. An `end` in the past is a no-op.
    pub fn advance_until(&mut self, end: f64) -> Result<u64> {
        if !end.is_finite() {
            return Err(Error::InvalidParam("end time must be finite".into()));
        }
        match self.state {
            CalendarState::Idle => self.reset()?,
            CalendarState::Advancing => {
                return Err(Error::InvalidState(
                    "a previous step failed; reset the calendar before advancing".into(),
                ))
            }
            CalendarState::Primed => {}
        }

        let start = self.event_count;
        while let Some(next) = self.peek_valid() {
            if next.time.into_inner() > end {
                break;
            }
            self.step()?;
        }
        self.drift_all(end);
        Ok(self.event_count - start)
    }

    // --- External perturbations ---

    /// Multiplies every mobile velocity by `factor` and re-predicts.
    pub fn rescale(&mut self, factor: f64) -> Result<()> {
        if !(factor.is_finite() && factor >= 0.0) {
            return Err(Error::InvalidParam(
                "rescale factor must be finite and >= 0".into(),
            ));
        }
        self.ensure_not_advancing()?;
        for i in 0..self.sim_box.len() {
            let id = ParticleId(i);
            if self.sim_box.inverse_mass(id) > 0.0 {
                self.sim_box.particles[i].velocity *= factor;
                self.stamps[id] += 1;
            }
        }
        if self.state == CalendarState::Primed {
            self.prime();
        }
        debug!("velocities rescaled by {:.6} at t={:.6}", factor, self.time);
        Ok(())
    }

    /// Sets one particle's velocity and repairs the affected predictions.
    pub fn set_velocity(&mut self, id: ParticleId, velocity: Vector3<f64>) -> Result<()> {
        if id.index() >= self.sim_box.len() {
            return Err(Error::InvalidParam(format!("no particle {}", id)));
        }
        if !velocity.iter().all(|v| v.is_finite()) {
            return Err(Error::InvalidParam("velocity must be finite".into()));
        }
        if self.sim_box.inverse_mass(id) == 0.0 {
            return Err(Error::InvalidParam(format!(
                "{} is fixed and cannot be given a velocity",
                id
            )));
        }
        self.ensure_not_advancing()?;

        self.sim_box.particles[id.index()].velocity = velocity;
        self.stamps[id] += 1;
        if self.state == CalendarState::Primed {
            self.refresh(id);
            self.propagate(id, &[id]);
        }
        Ok(())
    }

    /// Redraws one particle's velocity from Maxwell-Boltzmann at `temperature`.
    pub fn randomize_one<R: Rng + ?Sized>(
        &mut self,
        id: ParticleId,
        temperature: f64,
        rng: &mut R,
    ) -> Result<Vector3<f64>> {
        if id.index() >= self.sim_box.len() {
            return Err(Error::InvalidParam(format!("no particle {}", id)));
        }
        let velocity = self.sim_box.species_of(id).sample_velocity(temperature, rng);
        self.set_velocity(id, velocity)?;
        Ok(velocity)
    }

    /// Redraws every mobile velocity and re-predicts.
    pub fn randomize_all<R: Rng + ?Sized>(&mut self, temperature: f64, rng: &mut R) -> Result<()> {
        self.ensure_not_advancing()?;
        for i in 0..self.sim_box.len() {
            let id = ParticleId(i);
            if self.sim_box.inverse_mass(id) > 0.0 {
                let v = self.sim_box.species_of(id).sample_velocity(temperature, rng);
                self.sim_box.particles[i].velocity = v;
                self.stamps[id] += 1;
            }
        }
        if self.state == CalendarState::Primed {
            self.prime();
        }
        Ok(())
    }

    /// Scales the box (and all positions, affinely) to `edges`.
    ///
    /// Range and wall violations are rejected before anything changes. Bonded
    /// pairs stretched beyond their well are unbonded; cores squeezed into
    /// overlap are reported by the re-prime under the overlap policy.
    pub fn resize_box(&mut self, edges: [f64; 3]) -> Result<()> {
        self.ensure_not_advancing()?;
        let old = self.sim_box.boundary;
        let boundary = Boundary::new(edges, old.periodic)?;
        CellIndex::new(boundary, self.grid.max_range(), self.settings.cell_range, 0)?;
        check_walls(&boundary, &self.sim_box.species)?;

        for p in &mut self.sim_box.particles {
            for k in 0..3 {
                p.position[k] *= boundary.edges[k] / old.edges[k];
            }
        }
        self.sim_box.boundary = boundary;
        info!(
            "box resized to {:.4} x {:.4} x {:.4}",
            edges[0], edges[1], edges[2]
        );
        let dropped = self.drop_stretched_bonds()?;
        if dropped > 0 {
            info!("resize stretched {} bond(s) past their well; unbonded", dropped);
        }
        self.rebuild_after_change()
    }

    /// Replaces the law between species `a` and `b`.
    ///
    /// Bonds between particles of these species are dropped if the new law
    /// no longer forms bonds.
    pub fn set_interaction(&mut self, a: usize, b: usize, law: PairLaw) -> Result<()> {
        self.ensure_not_advancing()?;
        let mut grid = self.grid.clone();
        grid.set(a, b, law)?;
        CellIndex::new(
            self.sim_box.boundary,
            grid.max_range(),
            self.settings.cell_range,
            0,
        )?;
        self.grid = grid;

        if !law.is_bonding() {
            let mut dropped = 0;
            for i in 0..self.sim_box.len() {
                let x = ParticleId(i);
                let partners: Vec<ParticleId> = self.bonds.partners(x).filter(|&y| y > x).collect();
                for y in partners {
                    let pair = (self.sim_box.particle(x).species, self.sim_box.particle(y).species);
                    if pair == (a, b) || pair == (b, a) {
                        self.bonds.unbond(x, y)?;
                        dropped += 1;
                    }
                }
            }
            if dropped > 0 {
                info!("dropped {} bond(s) between species {} and {}", dropped, a, b);
            }
        }
        self.rebuild_after_change()
    }

    /// Bond symmetry and capacity, bonded pairs inside their well, no core overlap.
    pub fn check_invariants(&self) -> Result<()> {
        self.bonds.check_consistency()?;
        for i in 0..self.bonds.len() {
            let a = ParticleId(i);
            if self.bonds.bond_count(a) > self.bonds.capacity(a) {
                return Err(Error::BondInconsistency {
                    a,
                    b: a,
                    reason: "more partners than slots".into(),
                });
            }
            for b in self.bonds.partners(a).filter(|&b| b > a) {
                let Some(law) = self.law_between(a, b) else {
                    return Err(Error::BondInconsistency {
                        a,
                        b,
                        reason: "bonded pair has no interaction law".into(),
                    });
                };
                let r = spatial::separation(&self.sim_box, a, b).norm();
                if r > law.range() * (1.0 + OVERLAP_TOLERANCE) {
                    return Err(Error::BondInconsistency {
                        a,
                        b,
                        reason: format!("bonded pair outside its well ({:.6} > {:.6})", r, law.range()),
                    });
                }
            }
        }
        match self.scan_overlaps().first() {
            Some(o) => Err(self.overlap_error(o)),
            None => Ok(()),
        }
    }

    // --- Event execution ---

    fn execute_next(&mut self) -> Result<Option<ExecutedEvent>> {
        let Some(next) = self.peek_valid() else {
            return Ok(None);
        };
        self.queue.pop();

        let atom = next.atom;
        let record = self.records[atom];
        let dt = (record.time - self.time).max(0.0);
        self.drift_all(record.time.max(self.time));

        if record.kind.is_collision() {
            self.check_degeneracy(atom, &record, dt)?;
        }

        let executed = match record.partner {
            Partner::Atom(b) => self.execute_pair(atom, b, &record)?,
            Partner::Wall { axis, upper } => self.execute_wall(atom, axis, upper),
            Partner::CellFace { axis, step } => self.execute_transit(atom, axis, step),
            Partner::None => {
                return Err(Error::InvalidState(format!(
                    "scheduled record of {} has no partner",
                    atom
                )))
            }
        };
        self.compact_queue();
        Ok(Some(executed))
    }

    fn execute_pair(
        &mut self,
        a: ParticleId,
        b: ParticleId,
        record: &CollisionRecord,
    ) -> Result<ExecutedEvent> {
        let law = self.law_between(a, b).ok_or_else(|| {
            Error::InvalidState(format!("no interaction law between {} and {}", a, b))
        })?;
        let kind = record.kind.pair_kind().ok_or_else(|| {
            Error::InvalidState(format!("{:?} is not a pair event ({} with {})", record.kind, a, b))
        })?;

        let kin = self.kinematics(a, b);
        let rm = (self.sim_box.inverse_mass(a), self.sim_box.inverse_mass(b));
        let bump = law.bump((a, b), kind, &kin, rm, &mut self.bonds, self.settings.nudge)?;

        // 1. Velocities and positions
        let (dva, dvb) = bump.velocity_deltas(rm.0, rm.1);
        let (dra, drb) = bump.position_deltas(0.0, rm.0, rm.1);
        let boundary = self.sim_box.boundary;
        for (id, dv, dr) in [(a, dva, dra), (b, dvb, drb)] {
            let p = &mut self.sim_box.particles[id.index()];
            p.velocity += dv;
            p.position += dr;
            boundary.wrap(&mut p.position);
        }

        // 2. Bookkeeping
        self.potential_energy += bump.potential_change;
        self.stamps[a] += 1;
        self.stamps[b] += 1;
        self.event_count += 1;
        self.tally.record(bump.outcome);
        match bump.outcome {
            BumpOutcome::Bonded => debug!("bond formed {} - {} at t={:.6}", a, b, self.time),
            BumpOutcome::Unbonded => debug!("bond broken {} - {} at t={:.6}", a, b, self.time),
            _ => trace!("{:?} {} - {} at t={:.6}", bump.outcome, a, b, self.time),
        }

        // 3. Local repair
        for id in [a, b] {
            let position = self.sim_box.particle(id).position;
            self.cells.relocate(id, &position);
        }
        self.refresh(a);
        self.refresh(b);
        self.propagate(a, &[a, b]);
        self.propagate(b, &[a, b]);

        Ok(ExecutedEvent {
            time: self.time,
            atom: a,
            partner: Partner::Atom(b),
            kind: record.kind,
            outcome: Some(bump.outcome),
        })
    }

    fn execute_wall(&mut self, a: ParticleId, axis: usize, upper: bool) -> ExecutedEvent {
        let radius = 0.5 * self.sim_box.species_of(a).diameter;
        let edge = self.sim_box.boundary.edges[axis];
        let p = &mut self.sim_box.particles[a.index()];
        p.velocity[axis] = -p.velocity[axis];
        p.position[axis] = if upper { edge - radius } else { radius };
        let position = p.position;

        self.stamps[a] += 1;
        self.event_count += 1;
        self.tally.walls += 1;
        trace!("wall {} axis {} at t={:.6}", a, axis, self.time);

        self.cells.relocate(a, &position);
        self.refresh(a);
        self.propagate(a, &[a]);

        ExecutedEvent {
            time: self.time,
            atom: a,
            partner: Partner::Wall { axis, upper },
            kind: EventKind::Wall,
            outcome: None,
        }
    }

    fn execute_transit(&mut self, a: ParticleId, axis: usize, step: i8) -> ExecutedEvent {
        if !self.cells.shift(a, axis, step) {
            // Stopped by a wall face; fall back to the position.
            let position = self.sim_box.particle(a).position;
            self.cells.relocate(a, &position);
        }
        self.tally.transits += 1;

        self.refresh(a);
        self.propagate(a, &[]);

        ExecutedEvent {
            time: self.time,
            atom: a,
            partner: Partner::CellFace { axis, step },
            kind: EventKind::CellTransit,
            outcome: None,
        }
    }

    fn check_degeneracy(&mut self, atom: ParticleId, record: &CollisionRecord, dt: f64) -> Result<()> {
        if dt > DEGENERATE_DT {
            self.streak = None;
            return Ok(());
        }
        let repeats = match self.streak {
            Some(s) if s.atom == atom && s.partner == record.partner => s.repeats + 1,
            _ => 1,
        };
        self.streak = Some(DegenerateStreak {
            atom,
            partner: record.partner,
            repeats,
        });
        if repeats > self.settings.max_degenerate_retries {
            return Err(Error::NumericalDegeneracy {
                atom,
                partner: record.partner,
                kind: record.kind,
                time: self.time,
                retries: repeats,
            });
        }
        Ok(())
    }

    // --- Prediction ---

    /// Earliest event of `x` against up-list neighbors, walls and cell faces.
    fn predict(&self, x: ParticleId) -> CollisionRecord {
        let mut best = CollisionRecord::none();
        for j in self.cells.neighbor_candidates(x, Direction::Up) {
            if let Some(rec) = self.pair_record(x, j) {
                if rec.beats(&best) {
                    best = rec;
                }
            }
        }
        if let Some(rec) = self.wall_record(x) {
            if rec.beats(&best) {
                best = rec;
            }
        }
        let p = self.sim_box.particle(x);
        if let Some(t) = self.cells.transit(x, &p.position, &p.velocity) {
            let rec = CollisionRecord {
                time: self.time + t.time,
                partner: Partner::CellFace {
                    axis: t.axis,
                    step: t.step,
                },
                kind: EventKind::CellTransit,
                partner_stamp: 0,
            };
            if rec.beats(&best) {
                best = rec;
            }
        }
        best
    }

    fn pair_record(&self, x: ParticleId, j: ParticleId) -> Option<CollisionRecord> {
        let law = self.law_between(x, j)?;
        let kin = self.kinematics(x, j);
        let prediction = law.collision_time(&kin, self.bonds.is_bonded(x, j))?;
        Some(CollisionRecord {
            time: self.time + prediction.time,
            partner: Partner::Atom(j),
            kind: prediction.kind.into(),
            partner_stamp: self.stamps[j],
        })
    }

    fn wall_record(&self, x: ParticleId) -> Option<CollisionRecord> {
        let boundary = &self.sim_box.boundary;
        let radius = 0.5 * self.sim_box.species_of(x).diameter;
        let p = self.sim_box.particle(x);
        let mut best: Option<CollisionRecord> = None;

        for axis in 0..3 {
            let v = p.velocity[axis];
            if boundary.periodic[axis] || v == 0.0 {
                continue;
            }
            let upper = v > 0.0;
            let plane = if upper { boundary.edges[axis] - radius } else { radius };
            let t = ((plane - p.position[axis]) / v).max(0.0);
            let rec = CollisionRecord {
                time: self.time + t,
                partner: Partner::Wall { axis, upper },
                kind: EventKind::Wall,
                partner_stamp: 0,
            };
            if best.map_or(true, |b| rec.beats(&b)) {
                best = Some(rec);
            }
        }
        best
    }

    #[inline]
    fn law_between(&self, a: ParticleId, b: ParticleId) -> Option<PairLaw> {
        let sa = self.sim_box.particle(a).species;
        let sb = self.sim_box.particle(b).species;
        self.grid.get(sa, sb).copied()
    }

    #[inline]
    fn kinematics(&self, a: ParticleId, b: ParticleId) -> PairKinematics {
        let pa = self.sim_box.particle(a);
        let pb = self.sim_box.particle(b);
        PairKinematics::new(
            self.sim_box.boundary.nearest_image(pb.position - pa.position),
            pb.velocity - pa.velocity,
        )
    }

    // --- Record maintenance ---

    fn set_record(&mut self, x: ParticleId, record: CollisionRecord) {
        self.records[x] = record;
        self.versions[x] += 1;
        if let Ok(time) = NotNan::new(record.time) {
            if record.time.is_finite() {
                self.queue.push(Reverse(Scheduled {
                    time,
                    atom: x,
                    partner_key: record.partner.order_key(),
                    version: self.versions[x],
                }));
            }
        }
    }

    fn refresh(&mut self, x: ParticleId) {
        let record = self.predict(x);
        self.set_record(x, record);
    }

    /// Repairs down-list records around `x` after it changed course or cell.
    ///
    /// Records naming one of `involved` are recomputed; the rest only adopt a
    /// pair event with `x` if it is earlier than what they hold.
    fn propagate(&mut self, x: ParticleId, involved: &[ParticleId]) {
        let candidates: Vec<ParticleId> = self
            .cells
            .neighbor_candidates(x, Direction::Down)
            .filter(|c| !involved.contains(c))
            .collect();

        for c in candidates {
            let current = self.records[c];
            if matches!(current.partner, Partner::Atom(p) if involved.contains(&p)) {
                self.refresh(c);
                continue;
            }
            if let Some(pair) = self.pair_record(c, x) {
                if pair.beats(&current) {
                    self.set_record(c, pair);
                }
            }
        }
    }

    /// Top of the heap after discarding superseded entries and repairing
    /// records whose partner changed trajectory since the prediction.
    fn peek_valid(&mut self) -> Option<Scheduled> {
        loop {
            let Reverse(top) = *self.queue.peek()?;
            if top.version != self.versions[top.atom] {
                self.queue.pop();
                continue;
            }
            let record = self.records[top.atom];
            if let Partner::Atom(b) = record.partner {
                if self.stamps[b] != record.partner_stamp {
                    self.queue.pop();
                    self.tally.stale += 1;
                    trace!("stale prediction {} with {} repaired", top.atom, b);
                    self.refresh(top.atom);
                    continue;
                }
            }
            return Some(top);
        }
    }

    /// Bulk prediction for every particle; the read-only pass runs on rayon.
    fn prime(&mut self) {
        let n = self.sim_box.len();
        let records: Vec<CollisionRecord> = {
            let this = &*self;
            (0..n)
                .into_par_iter()
                .map(|i| this.predict(ParticleId(i)))
                .collect()
        };
        self.queue.clear();
        for (i, record) in records.into_iter().enumerate() {
            self.set_record(ParticleId(i), record);
        }
    }

    /// Rebuilds the heap from the records once superseded entries pile up.
    fn compact_queue(&mut self) {
        let n = self.sim_box.len();
        if self.queue.len() <= 4 * n + 64 {
            return;
        }
        let live: Vec<Reverse<Scheduled>> = self
            .queue
            .drain()
            .filter(|Reverse(s)| s.version == self.versions[s.atom])
            .collect();
        self.queue = BinaryHeap::from(live);
    }

    fn drift_all(&mut self, t: f64) {
        let dt = t - self.time;
        if dt > 0.0 {
            let boundary = self.sim_box.boundary;
            let species = &self.sim_box.species;
            for p in &mut self.sim_box.particles {
                if species[p.species].inverse_mass() == 0.0 {
                    continue;
                }
                p.position += p.velocity * dt;
                boundary.wrap(&mut p.position);
            }
            self.time = t;
        }
    }

    /// Unbonds pairs whose separation exceeds their well. Returns how many.
    fn drop_stretched_bonds(&mut self) -> Result<usize> {
        let mut dropped = 0;
        for i in 0..self.bonds.len() {
            let a = ParticleId(i);
            let partners: Vec<ParticleId> = self.bonds.partners(a).filter(|&b| b > a).collect();
            for b in partners {
                let inside = self.law_between(a, b).map_or(false, |law| {
                    spatial::separation(&self.sim_box, a, b).norm() <= law.range()
                });
                if !inside {
                    self.bonds.unbond(a, b)?;
                    debug!("bond {} - {} stretched past its well", a, b);
                    dropped += 1;
                }
            }
        }
        Ok(dropped)
    }

    fn rebuild_after_change(&mut self) -> Result<()> {
        match self.state {
            CalendarState::Primed => self.reset(),
            _ => {
                self.cells
                    .rebuild(&self.sim_box, self.grid.max_range(), self.settings.cell_range)?;
                self.potential_energy = self.scan_potential_energy();
                Ok(())
            }
        }
    }

    fn ensure_not_advancing(&self) -> Result<()> {
        if self.state == CalendarState::Advancing {
            return Err(Error::InvalidState(
                "calendar is halted after a failed step; reset it first".into(),
            ));
        }
        Ok(())
    }

    // --- Scans ---

    fn scan_overlaps(&self) -> Vec<Overlap> {
        let mut overlaps = Vec::new();
        for i in 0..self.sim_box.len() {
            let a = ParticleId(i);
            for b in self.cells.neighbor_candidates(a, Direction::Up) {
                let Some(law) = self.law_between(a, b) else {
                    continue;
                };
                let kin = self.kinematics(a, b);
                if law.overlaps(&kin) {
                    overlaps.push(Overlap {
                        a,
                        b,
                        separation: kin.dr.norm(),
                        core: law.core_diameter(),
                    });
                }
            }
        }
        overlaps
    }

    fn scan_potential_energy(&self) -> f64 {
        let mut total = 0.0;
        for i in 0..self.sim_box.len() {
            let a = ParticleId(i);
            for b in self.cells.neighbor_candidates(a, Direction::Up) {
                if let Some(law) = self.law_between(a, b) {
                    let r2 = self.kinematics(a, b).dr.norm_squared();
                    total += law.energy(r2, self.bonds.is_bonded(a, b));
                }
            }
        }
        total
    }

    fn overlap_error(&self, o: &Overlap) -> Error {
        Error::ConfigurationOverlap {
            a: o.a,
            b: o.b,
            separation: o.separation,
            core: o.core,
            time: self.time,
        }
    }
}

/// Every mobile species must fit between the walls of each closed axis.
fn check_walls(boundary: &Boundary, species: &[Species]) -> Result<()> {
    for k in 0..3 {
        if boundary.periodic[k] {
            continue;
        }
        let edge = boundary.edges[k];
        if let Some(s) = species.iter().find(|s| !s.fixed && s.diameter > edge) {
            return Err(Error::InvalidParam(format!(
                "species {} (diameter {}) does not fit between the walls on axis {}",
                s.symbol, s.diameter, k
            )));
        }
    }
    Ok(())
}
