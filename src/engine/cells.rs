//! Uniform cell grid over the simulation box.
//!
//! Cells are sized so that `edge * cell_range >= interaction_range` on every
//! axis; any pair that can interact therefore sits within `cell_range` cells
//! of each other. Membership is kept in per-cell vectors with a back-pointer
//! per particle, so insert, remove and relocate are O(1).

use log::info;
use nalgebra::{Point3, Vector3};

use crate::core::agents::AgentStore;
use crate::core::domain::{Boundary, ParticleId, SimBox};
use crate::error::{Error, Result};

/// Upper bound on cells per axis; larger cells are still correct, just slower.
pub const MAX_CELLS_PER_AXIS: usize = 128;

/// Which neighbors a candidate query yields, relative to the centre handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Handles greater than the centre.
    Up,
    /// Handles smaller than the centre.
    Down,
    Both,
}

impl Direction {
    #[inline]
    fn admits(self, center: ParticleId, other: ParticleId) -> bool {
        match self {
            Direction::Up => other > center,
            Direction::Down => other < center,
            Direction::Both => other != center,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CellSlot {
    cell: usize,
    index: usize,
}

/// Time until a particle leaves its cell, and through which face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transit {
    pub time: f64,
    pub axis: usize,
    /// `+1` or `-1` along `axis`.
    pub step: i8,
}

#[derive(Debug, Clone)]
pub struct CellIndex {
    boundary: Boundary,
    interaction_range: f64,
    cell_range: usize,
    dims: [usize; 3],
    edge: Vector3<f64>,
    cells: Vec<Vec<ParticleId>>,
    /// Per axis and coordinate: sorted, de-duplicated coordinates within
    /// `cell_range` (itself included). The neighbor block of a cell is the
    /// product of its three spans.
    spans: [Vec<Vec<usize>>; 3],
    slots: AgentStore<Option<CellSlot>>,
}

impl CellIndex {
    /// An empty grid for `boundary`.
    ///
    /// Fails with [`Error::NeighborRange`] if `interaction_range` exceeds half
    /// of any periodic edge.
    pub fn new(
        boundary: Boundary,
        interaction_range: f64,
        cell_range: usize,
        n_particles: usize,
    ) -> Result<Self> {
        if !(interaction_range.is_finite() && interaction_range >= 0.0) {
            return Err(Error::InvalidParam(
                "interaction range must be finite and >= 0".into(),
            ));
        }
        if cell_range == 0 {
            return Err(Error::InvalidParam("cell_range must be >= 1".into()));
        }
        for k in 0..3 {
            let limit = 0.5 * boundary.edges[k];
            if boundary.periodic[k] && interaction_range > limit {
                return Err(Error::NeighborRange {
                    axis: k,
                    range: interaction_range,
                    limit,
                });
            }
        }

        let mut dims = [1usize; 3];
        if interaction_range > 0.0 {
            for (k, dim) in dims.iter_mut().enumerate() {
                let n = (boundary.edges[k] * cell_range as f64 / interaction_range).floor();
                *dim = (n.max(1.0) as usize).min(MAX_CELLS_PER_AXIS);
            }
        }
        let edge = Vector3::new(
            boundary.edges.x / dims[0] as f64,
            boundary.edges.y / dims[1] as f64,
            boundary.edges.z / dims[2] as f64,
        );
        let total = dims[0] * dims[1] * dims[2];

        Ok(Self {
            boundary,
            interaction_range,
            cell_range,
            dims,
            edge,
            cells: vec![Vec::new(); total],
            spans: build_spans(dims, boundary.periodic, cell_range),
            slots: AgentStore::new(n_particles, None),
        })
    }

    /// A grid with every particle of `sim_box` assigned.
    pub fn build(sim_box: &SimBox, interaction_range: f64, cell_range: usize) -> Result<Self> {
        let mut index = Self::new(sim_box.boundary, interaction_range, cell_range, sim_box.len())?;
        for p in &sim_box.particles {
            index.assign(p.id, &p.position);
        }
        Ok(index)
    }

    /// Clears and reassigns every particle. The only O(N) operation.
    pub fn rebuild(
        &mut self,
        sim_box: &SimBox,
        interaction_range: f64,
        cell_range: usize,
    ) -> Result<()> {
        *self = Self::build(sim_box, interaction_range, cell_range)?;
        info!(
            "cell grid rebuilt: {}x{}x{} cells, range {:.4}, cell_range {}",
            self.dims[0], self.dims[1], self.dims[2], interaction_range, cell_range
        );
        Ok(())
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn edge(&self) -> Vector3<f64> {
        self.edge
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn interaction_range(&self) -> f64 {
        self.interaction_range
    }

    pub fn cell_range(&self) -> usize {
        self.cell_range
    }

    pub fn members(&self, cell: usize) -> &[ParticleId] {
        &self.cells[cell]
    }

    /// The cell currently recorded for `id`.
    pub fn cell_of(&self, id: ParticleId) -> Option<usize> {
        self.slots.get(id).copied().flatten().map(|s| s.cell)
    }

    /// The cell whose region contains `position` (periodic axes wrapped).
    pub fn cell_containing(&self, position: &Point3<f64>) -> usize {
        let mut coords = [0usize; 3];
        for (k, c) in coords.iter_mut().enumerate() {
            let mut x = position[k];
            if self.boundary.periodic[k] {
                x = x.rem_euclid(self.boundary.edges[k]);
            }
            let i = (x / self.edge[k]).floor().max(0.0) as usize;
            *c = i.min(self.dims[k] - 1);
        }
        self.linear(coords)
    }

    /// Inserts `id` into the cell containing `position`.
    pub fn assign(&mut self, id: ParticleId, position: &Point3<f64>) {
        if id.index() >= self.slots.len() {
            self.slots.resize(id.index() + 1, None);
        }
        let cell = self.cell_containing(position);
        self.move_to(id, cell);
    }

    /// Drops `id` from its cell; it no longer appears in any query.
    pub fn remove(&mut self, id: ParticleId) {
        let Some(slot) = self.slots.get_mut(id).and_then(|s| s.take()) else {
            return;
        };
        let members = &mut self.cells[slot.cell];
        members.swap_remove(slot.index);
        if let Some(&moved) = members.get(slot.index) {
            self.slots[moved] = Some(slot);
        }
    }

    /// Moves `id` if `position` maps to a different cell. Returns true if it moved.
    pub fn relocate(&mut self, id: ParticleId, position: &Point3<f64>) -> bool {
        let cell = self.cell_containing(position);
        if self.cell_of(id) == Some(cell) {
            return false;
        }
        self.assign(id, position);
        true
    }

    /// Moves `id` one cell along `axis` (periodic wrap). Returns false at a wall.
    pub fn shift(&mut self, id: ParticleId, axis: usize, step: i8) -> bool {
        let Some(cell) = self.cell_of(id) else {
            return false;
        };
        let mut coords = self.coords(cell);
        let n = self.dims[axis] as isize;
        let next = coords[axis] as isize + step as isize;
        coords[axis] = if self.boundary.periodic[axis] {
            next.rem_euclid(n) as usize
        } else if (0..n).contains(&next) {
            next as usize
        } else {
            return false;
        };
        let target = self.linear(coords);
        self.move_to(id, target);
        true
    }

    /// Lazily yields particles in `id`'s cell and its neighbor cells,
    /// filtered by `direction`. Yields nothing for an unassigned particle.
    pub fn neighbor_candidates(&self, id: ParticleId, direction: Direction) -> NeighborCandidates<'_> {
        let spans = self.cell_of(id).map(|cell| {
            let c = self.coords(cell);
            [
                self.spans[0][c[0]].as_slice(),
                self.spans[1][c[1]].as_slice(),
                self.spans[2][c[2]].as_slice(),
            ]
        });
        NeighborCandidates {
            index: self,
            center: id,
            direction,
            spans,
            cursor: [0; 3],
            member_cursor: 0,
        }
    }

    /// When a particle at `position` moving with `velocity` leaves its recorded cell.
    ///
    /// Faces against a wall on non-periodic axes and axes with a single cell
    /// never produce a transit. A particle already past a face transits now.
    pub fn transit(
        &self,
        id: ParticleId,
        position: &Point3<f64>,
        velocity: &Vector3<f64>,
    ) -> Option<Transit> {
        let cell = self.cell_of(id)?;
        let coords = self.coords(cell);
        let mut best: Option<Transit> = None;

        for k in 0..3 {
            let n = self.dims[k];
            let v = velocity[k];
            if n == 1 || v == 0.0 {
                continue;
            }
            let periodic = self.boundary.periodic[k];
            let (face, step) = if v > 0.0 {
                if !periodic && coords[k] == n - 1 {
                    continue;
                }
                (0.5 * self.edge[k], 1i8)
            } else {
                if !periodic && coords[k] == 0 {
                    continue;
                }
                (-0.5 * self.edge[k], -1i8)
            };

            let centre = (coords[k] as f64 + 0.5) * self.edge[k];
            let mut d = position[k] - centre;
            if periodic {
                let l = self.boundary.edges[k];
                d -= l * (d / l).round();
            }
            let time = ((face - d) / v).max(0.0);
            if best.map_or(true, |b| time < b.time) {
                best = Some(Transit { time, axis: k, step });
            }
        }
        best
    }

    fn move_to(&mut self, id: ParticleId, cell: usize) {
        self.remove(id);
        let index = self.cells[cell].len();
        self.cells[cell].push(id);
        self.slots[id] = Some(CellSlot { cell, index });
    }

    #[inline]
    fn linear(&self, c: [usize; 3]) -> usize {
        (c[0] * self.dims[1] + c[1]) * self.dims[2] + c[2]
    }

    #[inline]
    fn coords(&self, cell: usize) -> [usize; 3] {
        let z = cell % self.dims[2];
        let y = (cell / self.dims[2]) % self.dims[1];
        let x = cell / (self.dims[1] * self.dims[2]);
        [x, y, z]
    }
}

fn build_spans(dims: [usize; 3], periodic: [bool; 3], cell_range: usize) -> [Vec<Vec<usize>>; 3] {
    let r = cell_range as isize;
    std::array::from_fn(|k| {
        let n = dims[k] as isize;
        (0..n)
            .map(|base| {
                let mut span: Vec<usize> = (-r..=r)
                    .filter_map(|o| {
                        let c = base + o;
                        if periodic[k] {
                            Some(c.rem_euclid(n) as usize)
                        } else if (0..n).contains(&c) {
                            Some(c as usize)
                        } else {
                            None
                        }
                    })
                    .collect();
                span.sort_unstable();
                span.dedup();
                span
            })
            .collect()
    })
}

/// Single-pass iterator over neighbor candidates; make a fresh query to restart.
///
/// Cells are visited in ascending linear order.
pub struct NeighborCandidates<'a> {
    index: &'a CellIndex,
    center: ParticleId,
    direction: Direction,
    spans: Option<[&'a [usize]; 3]>,
    cursor: [usize; 3],
    member_cursor: usize,
}

impl Iterator for NeighborCandidates<'_> {
    type Item = ParticleId;

    fn next(&mut self) -> Option<ParticleId> {
        let [xs, ys, zs] = self.spans?;
        loop {
            let x = *xs.get(self.cursor[0])?;
            let cell = self.index.linear([x, ys[self.cursor[1]], zs[self.cursor[2]]]);
            match self.index.cells[cell].get(self.member_cursor) {
                Some(&other) => {
                    self.member_cursor += 1;
                    if self.direction.admits(self.center, other) {
                        return Some(other);
                    }
                }
                None => {
                    self.member_cursor = 0;
                    self.cursor[2] += 1;
                    if self.cursor[2] == zs.len() {
                        self.cursor[2] = 0;
                        self.cursor[1] += 1;
                        if self.cursor[1] == ys.len() {
                            self.cursor[1] = 0;
                            self.cursor[0] += 1;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::Species;

    fn line_box(positions: &[f64]) -> SimBox {
        let mut b = SimBox::new(Boundary::cubic(10.0).unwrap(), vec![Species::default()]);
        for &x in positions {
            b.add_particle(0, Point3::new(x, 5.0, 5.0), Vector3::zeros())
                .unwrap();
        }
        b
    }

    #[test]
    fn cells_cover_interaction_range() {
        let b = line_box(&[]);
        let index = CellIndex::build(&b, 1.5, 1).unwrap();
        assert_eq!(index.dims(), [6, 6, 6]);
        assert!(index.edge().x * 1.0 >= 1.5);
        let index = CellIndex::build(&b, 1.5, 2).unwrap();
        assert_eq!(index.dims(), [13, 13, 13]);
        assert!(index.edge().x * 2.0 >= 1.5);
    }

    #[test]
    fn wide_stencil_matches_brute_force() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(11);
        let mut b = SimBox::new(
            Boundary::new([7.0, 9.0, 4.5], [true, false, true]).unwrap(),
            vec![Species::default()],
        );
        for _ in 0..150 {
            let p = Point3::new(rng.gen_range(0.0..7.0), rng.gen_range(0.0..9.0), rng.gen_range(0.0..4.5));
            b.add_particle(0, p, Vector3::zeros()).unwrap();
        }
        let range = 2.0;
        let index = CellIndex::build(&b, range, 3).unwrap();
        for p in &b.particles {
            let mut found: Vec<_> = index.neighbor_candidates(p.id, Direction::Up).collect();
            found.sort();
            let mut dedup = found.clone();
            dedup.dedup();
            assert_eq!(found, dedup, "a candidate was yielded twice");
            for q in b.particles.iter().filter(|q| q.id > p.id) {
                let r2 = crate::core::spatial::distance_sq(&p.position, &q.position, &b.boundary);
                if r2 <= range * range {
                    assert!(found.contains(&q.id), "{} misses {}", p.id, q.id);
                }
            }
        }
    }

    #[test]
    fn fine_grids_with_wide_stencils_stay_small() {
        let b = SimBox::new(Boundary::cubic(30.0).unwrap(), vec![Species::default()]);
        let index = CellIndex::build(&b, 1.0, 3).unwrap();
        assert_eq!(index.dims(), [90, 90, 90]);
        let span_entries: usize = index.spans.iter().flatten().map(Vec::len).sum();
        assert_eq!(span_entries, 3 * 90 * 7);
    }

    #[test]
    fn range_beyond_half_box_is_rejected() {
        let b = line_box(&[]);
        let err = CellIndex::build(&b, 5.5, 1).unwrap_err();
        assert!(matches!(err, Error::NeighborRange { axis: 0, .. }));

        let walled = Boundary::new([10.0, 10.0, 10.0], [false, false, false]).unwrap();
        assert!(CellIndex::new(walled, 5.5, 1, 0).is_ok());
    }

    #[test]
    fn remove_keeps_back_pointers_consistent() {
        let b = line_box(&[0.1, 0.2, 0.3, 0.4]);
        let mut index = CellIndex::build(&b, 1.0, 1).unwrap();
        let cell = index.cell_of(ParticleId(0)).unwrap();
        assert_eq!(index.members(cell).len(), 4);
        index.remove(ParticleId(1));
        assert_eq!(index.members(cell).len(), 3);
        index.remove(ParticleId(3));
        index.remove(ParticleId(0));
        assert_eq!(index.members(cell), &[ParticleId(2)]);
        assert_eq!(index.cell_of(ParticleId(0)), None);
    }

    #[test]
    fn up_and_down_partition_the_neighbors() {
        let b = line_box(&[1.0, 1.5, 2.2, 8.0]);
        let index = CellIndex::build(&b, 1.0, 1).unwrap();
        let mut up: Vec<_> = index.neighbor_candidates(ParticleId(1), Direction::Up).collect();
        let mut down: Vec<_> = index.neighbor_candidates(ParticleId(1), Direction::Down).collect();
        up.sort();
        down.sort();
        assert_eq!(up, vec![ParticleId(2)]);
        assert_eq!(down, vec![ParticleId(0)]);
        assert_eq!(index.neighbor_candidates(ParticleId(3), Direction::Both).count(), 0);
    }

    #[test]
    fn relocation_across_periodic_face() {
        let mut b = line_box(&[9.95, 0.5]);
        let mut index = CellIndex::build(&b, 1.0, 1).unwrap();
        let before = index.cell_of(ParticleId(0)).unwrap();
        assert!(index
            .neighbor_candidates(ParticleId(1), Direction::Both)
            .any(|j| j == ParticleId(0)));

        b.particles[0].position.x = 0.05;
        assert!(index.relocate(ParticleId(0), &b.particles[0].position));
        assert!(!index.relocate(ParticleId(0), &b.particles[0].position));
        let after = index.cell_of(ParticleId(0)).unwrap();
        assert_ne!(before, after);
        assert!(!index.members(before).contains(&ParticleId(0)));
        assert_eq!(
            index.members(after).iter().filter(|&&j| j == ParticleId(0)).count(),
            1
        );
        assert!(index
            .neighbor_candidates(ParticleId(1), Direction::Both)
            .any(|j| j == ParticleId(0)));
        assert!(index
            .neighbor_candidates(ParticleId(0), Direction::Both)
            .any(|j| j == ParticleId(1)));
    }

    #[test]
    fn transit_time_and_shift_wrap() {
        let b = line_box(&[9.5]);
        let mut index = CellIndex::build(&b, 1.0, 1).unwrap();
        let id = ParticleId(0);
        let t = index
            .transit(id, &b.particles[0].position, &Vector3::new(2.0, 0.0, 0.0))
            .unwrap();
        assert_eq!((t.axis, t.step), (0, 1));
        assert!((t.time - 0.25).abs() < 1e-12);

        assert!(index.shift(id, 0, 1));
        assert_eq!(index.cell_of(id), Some(index.cell_containing(&Point3::new(0.0, 5.0, 5.0))));

        // Still recorded in cell 0 while sitting just below L: leaves immediately.
        let late = index
            .transit(id, &Point3::new(9.999, 5.0, 5.0), &Vector3::new(-1.0, 0.0, 0.0))
            .unwrap();
        assert_eq!(late.time, 0.0);
        assert_eq!(late.step, -1);
    }

    #[test]
    fn walls_stop_transits_on_closed_axes() {
        let mut b = SimBox::new(
            Boundary::new([10.0, 10.0, 10.0], [false, true, true]).unwrap(),
            vec![Species::default()],
        );
        b.add_particle(0, Point3::new(9.7, 5.0, 5.0), Vector3::zeros())
            .unwrap();
        let mut index = CellIndex::build(&b, 1.0, 1).unwrap();
        assert!(index
            .transit(ParticleId(0), &b.particles[0].position, &Vector3::new(1.0, 0.0, 0.0))
            .is_none());
        assert!(!index.shift(ParticleId(0), 0, 1));
    }
}
