//! Pair interaction laws for event-driven dynamics.
//!
//! Every law is a closed variant with the same two capabilities: predict
//! when a pair next crosses one of its discontinuities, and compute the
//! impulsive response when it does. Laws work on the nearest-image
//! separation `dr = r_b - r_a` and relative velocity `dv = v_b - v_a`.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::core::domain::ParticleId;
use crate::engine::bonds::BondTable;
use crate::error::{Error, Result};

/// Relative core penetration tolerated before a pair counts as overlapping.
pub const OVERLAP_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PairLaw {
    /// Impenetrable core of diameter `diameter`.
    HardSphere { diameter: f64 },
    /// Hard core plus an attractive plateau of depth `depth` out to `well`.
    SquareWell { core: f64, well: f64, depth: f64 },
    /// Square well whose capture writes a bond; capacity limited by bond slots.
    BondingWell { core: f64, well: f64, depth: f64 },
}

/// Which discontinuity a predicted pair event crosses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PairEventKind {
    Core,
    WellCapture,
    WellEscape,
    BondBreak,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairPrediction {
    /// Measured from the reference frame of the kinematics (includes false time).
    pub time: f64,
    pub kind: PairEventKind,
}

/// Relative state of a pair.
///
/// `false_time` is how far the pair has already been advanced past the
/// frame in which `dr` and `dv` were taken.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairKinematics {
    pub dr: Vector3<f64>,
    pub dv: Vector3<f64>,
    pub false_time: f64,
}

impl PairKinematics {
    pub fn new(dr: Vector3<f64>, dv: Vector3<f64>) -> Self {
        Self {
            dr,
            dv,
            false_time: 0.0,
        }
    }

    pub fn with_false_time(mut self, false_time: f64) -> Self {
        self.false_time = false_time;
        self
    }

    /// Separation at the current time.
    #[inline]
    pub fn current_dr(&self) -> Vector3<f64> {
        self.dr + self.dv * self.false_time
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BumpOutcome {
    /// Elastic reflection at the hard core.
    CoreReflection,
    /// Entered a plain square well.
    Captured,
    /// Entered a bonding well with free slots; pair is now bonded.
    Bonded,
    /// Reached a bonding well with a full slot table; reflected outward.
    Repelled,
    /// Tried to leave a well without enough energy; reflected inward.
    WellReflection,
    /// Left a plain square well.
    Escaped,
    /// Left a bonding well; bond cleared.
    Unbonded,
}

/// Impulsive response of a pair event.
///
/// Apply as `v_a += impulse * rm_a`, `v_b -= impulse * rm_b`; the nudge moves
/// `a` by `-nudge` and `b` by `+nudge` (positive pushes the pair apart).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bump {
    pub impulse: Vector3<f64>,
    pub nudge: Vector3<f64>,
    pub outcome: BumpOutcome,
    /// Change of the pair's potential energy (kinetic energy changes by the opposite).
    pub potential_change: f64,
}

impl Bump {
    pub fn velocity_deltas(&self, rm_a: f64, rm_b: f64) -> (Vector3<f64>, Vector3<f64>) {
        (self.impulse * rm_a, -self.impulse * rm_b)
    }

    /// Position corrections: false-time rewind of the new velocities plus the nudge.
    /// A fixed particle is never displaced; its share of the nudge goes to the partner.
    pub fn position_deltas(
        &self,
        false_time: f64,
        rm_a: f64,
        rm_b: f64,
    ) -> (Vector3<f64>, Vector3<f64>) {
        let (w_a, w_b) = match (rm_a > 0.0, rm_b > 0.0) {
            (true, true) => (1.0, 1.0),
            (true, false) => (2.0, 0.0),
            (false, true) => (0.0, 2.0),
            (false, false) => (0.0, 0.0),
        };
        let da = -self.impulse * (rm_a * false_time) - self.nudge * w_a;
        let db = self.impulse * (rm_b * false_time) + self.nudge * w_b;
        (da, db)
    }
}

impl PairLaw {
    pub fn validate(&self) -> Result<()> {
        match *self {
            PairLaw::HardSphere { diameter } => {
                if !(diameter.is_finite() && diameter > 0.0) {
                    return Err(Error::InvalidParam(
                        "hard-sphere diameter must be finite and > 0".into(),
                    ));
                }
            }
            PairLaw::SquareWell { core, well, depth } | PairLaw::BondingWell { core, well, depth } => {
                if !(core.is_finite() && core > 0.0) {
                    return Err(Error::InvalidParam("core diameter must be finite and > 0".into()));
                }
                if !(well.is_finite() && well > core) {
                    return Err(Error::InvalidParam(
                        "well diameter must be finite and larger than the core".into(),
                    ));
                }
                if !(depth.is_finite() && depth >= 0.0) {
                    return Err(Error::InvalidParam("well depth must be finite and >= 0".into()));
                }
            }
        }
        Ok(())
    }

    /// Largest separation at which the law has a discontinuity.
    #[inline]
    pub fn range(&self) -> f64 {
        match *self {
            PairLaw::HardSphere { diameter } => diameter,
            PairLaw::SquareWell { well, .. } | PairLaw::BondingWell { well, .. } => well,
        }
    }

    #[inline]
    pub fn core_diameter(&self) -> f64 {
        match *self {
            PairLaw::HardSphere { diameter } => diameter,
            PairLaw::SquareWell { core, .. } | PairLaw::BondingWell { core, .. } => core,
        }
    }

    #[inline]
    pub fn depth(&self) -> f64 {
        match *self {
            PairLaw::HardSphere { .. } => 0.0,
            PairLaw::SquareWell { depth, .. } | PairLaw::BondingWell { depth, .. } => depth,
        }
    }

    #[inline]
    pub fn is_bonding(&self) -> bool {
        matches!(self, PairLaw::BondingWell { .. })
    }

    /// True if the cores penetrate by more than [`OVERLAP_TOLERANCE`].
    pub fn overlaps(&self, kin: &PairKinematics) -> bool {
        let limit = self.core_diameter() * (1.0 - OVERLAP_TOLERANCE);
        kin.current_dr().norm_squared() < limit * limit
    }

    /// Potential energy of a pair at squared separation `r2`.
    pub fn energy(&self, r2: f64, bonded: bool) -> f64 {
        match *self {
            PairLaw::HardSphere { .. } => 0.0,
            PairLaw::SquareWell { well, depth, .. } => {
                if r2 < well * well {
                    -depth
                } else {
                    0.0
                }
            }
            PairLaw::BondingWell { depth, .. } => {
                if bonded {
                    -depth
                } else {
                    0.0
                }
            }
        }
    }

    /// Next discontinuity the pair will cross, if any.
    ///
    /// `bonded` is only consulted by [`PairLaw::BondingWell`]. An unbonded
    /// pair already inside a bonding well only sees the hard core.
    pub fn collision_time(&self, kin: &PairKinematics, bonded: bool) -> Option<PairPrediction> {
        let dr = kin.current_dr();
        let r2 = dr.norm_squared();
        let bij = dr.dot(&kin.dv);
        let v2 = kin.dv.norm_squared();
        if v2 <= 0.0 {
            return None;
        }

        let prediction = match *self {
            PairLaw::HardSphere { diameter } => {
                approach_time(bij, v2, r2, diameter * diameter).map(|t| (t, PairEventKind::Core))
            }
            PairLaw::SquareWell { core, well, .. } => {
                let well_sq = well * well;
                if r2 < well_sq {
                    match approach_time(bij, v2, r2, core * core) {
                        Some(t) => Some((t, PairEventKind::Core)),
                        None => departure_time(bij, v2, r2, well_sq)
                            .map(|t| (t, PairEventKind::WellEscape)),
                    }
                } else {
                    approach_time(bij, v2, r2, well_sq).map(|t| (t, PairEventKind::WellCapture))
                }
            }
            PairLaw::BondingWell { core, well, .. } => {
                let well_sq = well * well;
                if bonded {
                    match approach_time(bij, v2, r2, core * core) {
                        Some(t) => Some((t, PairEventKind::Core)),
                        None => departure_time(bij, v2, r2, well_sq)
                            .map(|t| (t, PairEventKind::BondBreak)),
                    }
                } else if r2 < well_sq {
                    approach_time(bij, v2, r2, core * core).map(|t| (t, PairEventKind::Core))
                } else {
                    approach_time(bij, v2, r2, well_sq).map(|t| (t, PairEventKind::WellCapture))
                }
            }
        };

        prediction.map(|(t, kind)| PairPrediction {
            time: t + kin.false_time,
            kind,
        })
    }

    /// Response of the pair `(a, b)` at the boundary `kind`.
    ///
    /// Bonding transitions are written into `bonds`; any bond-table
    /// inconsistency is returned unchanged.
    pub fn bump(
        &self,
        pair: (ParticleId, ParticleId),
        kind: PairEventKind,
        kin: &PairKinematics,
        inverse_mass: (f64, f64),
        bonds: &mut BondTable,
        nudge: f64,
    ) -> Result<Bump> {
        let (a, b) = pair;
        let rm_sum = inverse_mass.0 + inverse_mass.1;
        if rm_sum <= 0.0 {
            return Err(Error::InvalidState(format!(
                "{} and {} both have infinite mass",
                a, b
            )));
        }
        let dr = kin.current_dr();
        let r2 = dr.norm_squared();
        if r2 <= 0.0 {
            return Err(Error::InvalidState(format!(
                "coincident centres for {} and {}",
                a, b
            )));
        }
        let unit = dr / r2.sqrt();
        let u = kin.dv.dot(&unit);
        let mu = 1.0 / rm_sum;
        let reflect = 2.0 * mu * u;

        // (impulse along unit, nudge sign, outcome, potential change)
        let (j, sign, outcome, dpe) = match (*self, kind) {
            (_, PairEventKind::Core) => (reflect, 0.0, BumpOutcome::CoreReflection, 0.0),

            (PairLaw::SquareWell { depth, .. }, PairEventKind::WellCapture) => (
                capture_impulse(mu, u, depth),
                -1.0,
                BumpOutcome::Captured,
                -depth,
            ),
            (PairLaw::SquareWell { depth, .. }, PairEventKind::WellEscape) => {
                match escape_impulse(mu, u, depth) {
                    Some(j) => (j, 1.0, BumpOutcome::Escaped, depth),
                    None => (reflect, -1.0, BumpOutcome::WellReflection, 0.0),
                }
            }

            (PairLaw::BondingWell { depth, .. }, PairEventKind::WellCapture) => {
                if bonds.is_full(a) || bonds.is_full(b) {
                    (reflect, 1.0, BumpOutcome::Repelled, 0.0)
                } else {
                    bonds.bond(a, b)?;
                    (
                        capture_impulse(mu, u, depth),
                        -1.0,
                        BumpOutcome::Bonded,
                        -depth,
                    )
                }
            }
            (PairLaw::BondingWell { depth, .. }, PairEventKind::BondBreak) => {
                match escape_impulse(mu, u, depth) {
                    Some(j) => {
                        bonds.unbond(a, b)?;
                        (j, 1.0, BumpOutcome::Unbonded, depth)
                    }
                    None => (reflect, -1.0, BumpOutcome::WellReflection, 0.0),
                }
            }

            (law, kind) => {
                return Err(Error::InvalidState(format!(
                    "{:?} event is undefined for {:?} ({} with {})",
                    kind, law, a, b
                )))
            }
        };

        Ok(Bump {
            impulse: unit * j,
            nudge: dr * (sign * nudge),
            outcome,
            potential_change: dpe,
        })
    }
}

/// Earlier root of `|dr + t dv|^2 = s2` for an approaching pair.
/// A pair already inside `s2` and still approaching collides now.
fn approach_time(bij: f64, v2: f64, r2: f64, s2: f64) -> Option<f64> {
    if bij >= 0.0 {
        return None;
    }
    if r2 <= s2 {
        return Some(0.0);
    }
    let discr = bij * bij - v2 * (r2 - s2);
    if discr <= 0.0 {
        return None;
    }
    Some((r2 - s2) / (-bij + discr.sqrt()))
}

/// Later root of `|dr + t dv|^2 = s2`: when a pair inside `s2` leaves it.
fn departure_time(bij: f64, v2: f64, r2: f64, s2: f64) -> Option<f64> {
    let root = (bij * bij - v2 * (r2 - s2)).max(0.0).sqrt();
    let t = if bij > 0.0 {
        (s2 - r2) / (bij + root)
    } else {
        (-bij + root) / v2
    };
    Some(if t.is_finite() { t.max(0.0) } else { 0.0 })
}

/// Impulse taking normal velocity `u < 0` to `-sqrt(u^2 + 2 depth / mu)`.
fn capture_impulse(mu: f64, u: f64, depth: f64) -> f64 {
    mu * (u + (u * u + 2.0 * depth / mu).sqrt())
}

/// Impulse taking `u > 0` to `sqrt(u^2 - 2 depth / mu)`; `None` if too slow to escape.
fn escape_impulse(mu: f64, u: f64, depth: f64) -> Option<f64> {
    if 0.5 * mu * u * u < depth {
        return None;
    }
    Some(mu * (u - (u * u - 2.0 * depth / mu).max(0.0).sqrt()))
}
