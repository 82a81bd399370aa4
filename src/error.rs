use thiserror::Error;

use crate::core::domain::ParticleId;
use crate::engine::calendar::{EventKind, Partner};

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the event-driven engine and its collaborators.
///
/// Fatal variants carry the particle handles, simulation time and event kind
/// needed to reproduce the failing state. None of them is retried inside the
/// engine; they propagate to whoever drives the calendar.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid user or API parameter.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// Operation not allowed in the calendar's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Two particles already overlap their hard cores.
    #[error(
        "configuration overlap between {a} and {b} at t={time}: separation {separation} < core {core}"
    )]
    ConfigurationOverlap {
        a: ParticleId,
        b: ParticleId,
        separation: f64,
        core: f64,
        time: f64,
    },

    /// Interaction range too large for the periodic box; neighbors could be missed.
    #[error("interaction range {range} exceeds half the periodic edge ({limit}) on axis {axis}")]
    NeighborRange { axis: usize, range: f64, limit: f64 },

    /// Asymmetric bonding or a bond written into a full slot table.
    #[error("bond table inconsistency between {a} and {b}: {reason}")]
    BondInconsistency {
        a: ParticleId,
        b: ParticleId,
        reason: String,
    },

    /// The same event kept firing at zero elapsed time.
    #[error(
        "numerical degeneracy: {kind:?} event of {atom} with {partner} repeated {retries} times at t={time}"
    )]
    NumericalDegeneracy {
        atom: ParticleId,
        partner: Partner,
        kind: EventKind,
        time: f64,
        retries: usize,
    },

    /// Malformed system definition.
    #[error(transparent)]
    Config(#[from] serde_json::Error),
}
