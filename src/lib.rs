//! Event-driven dynamics for hard spheres, square wells and reversibly
//! bonding chains.
//!
//! Particles fly freely between discrete pair events; the
//! [`CollisionCalendar`](engine::calendar::CollisionCalendar) always jumps
//! to the earliest predicted event, executes it, and repairs only the
//! predictions that event invalidated.

pub mod analysis;
pub mod core;
pub mod driver;
pub mod engine;
pub mod error;

pub use crate::error::{Error, Result};
