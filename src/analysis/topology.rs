use serde::Serialize;

use crate::core::domain::ParticleId;
use crate::engine::bonds::BondTable;

/// Fraction of bond slots currently occupied. Zero when nothing can bond.
pub fn conversion(bonds: &BondTable) -> f64 {
    let capacity = bonds.total_capacity();
    if capacity == 0 {
        return 0.0;
    }
    (2 * bonds.total_bonds()) as f64 / capacity as f64
}

/// Size distribution of the bonded clusters.
///
/// Only particles with at least one bond slot take part; a bondable
/// particle with no partners counts as a monomer (a cluster of size 1).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChainStats {
    pub monomers: usize,
    /// Acyclic clusters of two or more particles.
    pub chains: usize,
    /// Clusters containing at least one closed loop.
    pub rings: usize,
    /// Mean cluster size, monomers included.
    pub number_average: f64,
    /// Mass-weighted mean cluster size: `sum(n^2) / sum(n)`.
    pub weight_average: f64,
    pub longest: usize,
    /// `histogram[n]` = number of clusters of size `n`.
    pub histogram: Vec<usize>,
}

/// Connected components of the bond graph.
pub fn chain_statistics(bonds: &BondTable) -> ChainStats {
    let n = bonds.len();
    let mut visited = vec![false; n];
    let mut stack: Vec<ParticleId> = Vec::new();
    let mut stats = ChainStats::default();
    let mut clusters = 0usize;
    let mut sum_n = 0usize;
    let mut sum_n2 = 0usize;

    for start in 0..n {
        let root = ParticleId(start);
        if visited[start] || bonds.capacity(root) == 0 {
            continue;
        }

        // 1. Flood fill
        visited[start] = true;
        stack.push(root);
        let mut size = 0usize;
        let mut slot_sum = 0usize;
        while let Some(a) = stack.pop() {
            size += 1;
            for b in bonds.partners(a) {
                slot_sum += 1;
                if !visited[b.index()] {
                    visited[b.index()] = true;
                    stack.push(b);
                }
            }
        }

        // 2. Classify (each bond is seen from both ends)
        let edges = slot_sum / 2;
        match size {
            1 => stats.monomers += 1,
            _ if edges >= size => stats.rings += 1,
            _ => stats.chains += 1,
        }

        clusters += 1;
        sum_n += size;
        sum_n2 += size * size;
        stats.longest = stats.longest.max(size);
        if stats.histogram.len() <= size {
            stats.histogram.resize(size + 1, 0);
        }
        stats.histogram[size] += 1;
    }

    if clusters > 0 {
        stats.number_average = sum_n as f64 / clusters as f64;
        stats.weight_average = sum_n2 as f64 / sum_n as f64;
    }
    stats
}
