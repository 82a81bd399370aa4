use serde::{Deserialize, Serialize};

use crate::core::domain::Species;
use crate::engine::potential::PairLaw;
use crate::error::{Error, Result};

/// A flattened 2D matrix storing the pair law of every species pair.
/// Access is O(1) via `index = i * N + j`; the matrix is kept symmetric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionGrid {
    num_species: usize,
    laws: Vec<Option<PairLaw>>,
    /// Stores core diameter squared, to avoid sqrt() calls in overlap scans.
    collision_matrix_sq: Vec<f64>,
}

impl InteractionGrid {
    /// Additive hard spheres: core of pair (i, j) is `(d_i + d_j) / 2`.
    /// Pairs where both diameters are zero do not interact.
    pub fn new(species: &[Species]) -> Self {
        let n = species.len();
        let mut laws = vec![None; n * n];
        let mut collision = vec![0.0; n * n];

        for i in 0..n {
            for j in 0..n {
                let sigma = 0.5 * (species[i].diameter + species[j].diameter);
                if sigma > 0.0 {
                    laws[i * n + j] = Some(PairLaw::HardSphere { diameter: sigma });
                }
                collision[i * n + j] = sigma * sigma;
            }
        }

        Self {
            num_species: n,
            laws,
            collision_matrix_sq: collision,
        }
    }

    pub fn num_species(&self) -> usize {
        self.num_species
    }

    /// Installs `law` for the unordered pair `(a, b)`.
    pub fn set(&mut self, a: usize, b: usize, law: PairLaw) -> Result<()> {
        let n = self.num_species;
        if a >= n || b >= n {
            return Err(Error::InvalidParam(format!(
                "species pair ({}, {}) out of range for {} species",
                a, b, n
            )));
        }
        law.validate()?;
        let core_sq = law.core_diameter() * law.core_diameter();
        for (i, j) in [(a, b), (b, a)] {
            self.laws[i * n + j] = Some(law);
            self.collision_matrix_sq[i * n + j] = core_sq;
        }
        Ok(())
    }

    /// Makes `(a, b)` non-interacting.
    pub fn clear(&mut self, a: usize, b: usize) {
        let n = self.num_species;
        if a >= n || b >= n {
            return;
        }
        for (i, j) in [(a, b), (b, a)] {
            self.laws[i * n + j] = None;
            self.collision_matrix_sq[i * n + j] = 0.0;
        }
    }

    #[inline(always)]
    pub fn get(&self, id_a: usize, id_b: usize) -> Option<&PairLaw> {
        self.laws[id_a * self.num_species + id_b].as_ref()
    }

    /// Returns the squared distance limit below which two cores overlap.
    #[inline(always)]
    pub fn get_collision_sq(&self, id_a: usize, id_b: usize) -> f64 {
        // Panics on an unknown species index.
        self.collision_matrix_sq[id_a * self.num_species + id_b]
    }

    /// Largest distance at which any pair can still have an event.
    pub fn max_range(&self) -> f64 {
        self.laws
            .iter()
            .flatten()
            .map(|law| law.range())
            .fold(0.0, f64::max)
    }

    /// True if any species pair uses a bond-forming law.
    pub fn has_bonding(&self) -> bool {
        self.laws.iter().flatten().any(|law| law.is_bonding())
    }
}
