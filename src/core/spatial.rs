use nalgebra::{Point3, Vector3};

use crate::core::chemistry::InteractionGrid;
use crate::core::domain::{Boundary, ParticleId, SimBox};

/// Squared separation of two points under the minimum image convention.
#[inline]
pub fn distance_sq(p1: &Point3<f64>, p2: &Point3<f64>, boundary: &Boundary) -> f64 {
    boundary.nearest_image(p2 - p1).norm_squared()
}

/// Nearest-image displacement from `a` to `b`.
#[inline]
pub fn separation(sim_box: &SimBox, a: ParticleId, b: ParticleId) -> Vector3<f64> {
    sim_box
        .boundary
        .nearest_image(sim_box.particle(b).position - sim_box.particle(a).position)
}

/// An overlapping pair found by [`check_overlap`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Overlap {
    pub a: ParticleId,
    pub b: ParticleId,
    pub separation: f64,
    pub core: f64,
}

/// Brute-force scan for hard-core overlaps, returning the first offending pair.
///
/// `O(N^2)`; meant for validating initial configurations and tests, not for
/// the event loop.
pub fn check_overlap(sim_box: &SimBox, grid: &InteractionGrid) -> Option<Overlap> {
    check_overlap_within(sim_box, grid, 0.0)
}

/// Like [`check_overlap`] but tolerates a relative core penetration of `tolerance`.
pub fn check_overlap_within(
    sim_box: &SimBox,
    grid: &InteractionGrid,
    tolerance: f64,
) -> Option<Overlap> {
    let atoms = &sim_box.particles;
    let n = atoms.len();
    let shrink = (1.0 - tolerance) * (1.0 - tolerance);

    for i in 0..n {
        for j in (i + 1)..n {
            let a_i = &atoms[i];
            let a_j = &atoms[j];

            let threshold_sq = grid.get_collision_sq(a_i.species, a_j.species) * shrink;
            let dist_sq = distance_sq(&a_i.position, &a_j.position, &sim_box.boundary);

            if dist_sq < threshold_sq {
                return Some(Overlap {
                    a: a_i.id,
                    b: a_j.id,
                    separation: dist_sq.sqrt(),
                    core: grid.get_collision_sq(a_i.species, a_j.species).sqrt(),
                });
            }
        }
    }
    None
}

/// Folds every particle into the primary periodic image.
pub fn wrap_all(sim_box: &mut SimBox) {
    let boundary = sim_box.boundary;
    for atom in &mut sim_box.particles {
        boundary.wrap(&mut atom.position);
    }
}
