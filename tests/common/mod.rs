#![allow(dead_code)]

use hardchain::core::chemistry::InteractionGrid;
use hardchain::core::domain::{Boundary, ParticleId, SimBox, Species};
use hardchain::engine::bonds::BondTable;
use hardchain::engine::calendar::{CalendarSettings, CollisionCalendar, ExecutedEvent};
use hardchain::engine::potential::PairLaw;
use nalgebra::{Point3, Vector3};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

pub const BONDING: PairLaw = PairLaw::BondingWell {
    core: 1.0,
    well: 1.5,
    depth: 1.0,
};

pub const SQUARE_WELL: PairLaw = PairLaw::SquareWell {
    core: 1.0,
    well: 1.5,
    depth: 1.0,
};

/// Unit mass, unit diameter species with `valence` bond slots.
pub fn monomer(valence: usize) -> Species {
    Species {
        symbol: "M".into(),
        valence,
        ..Default::default()
    }
}

/// One species, one optional override law, particles listed as (x, vx) on the line y = z = 5.
pub fn line_box(species: Species, law: Option<PairLaw>, atoms: &[(f64, f64)]) -> (SimBox, InteractionGrid) {
    let species = vec![species];
    let mut grid = InteractionGrid::new(&species);
    if let Some(law) = law {
        grid.set(0, 0, law).unwrap();
    }
    let mut b = SimBox::new(Boundary::cubic(10.0).unwrap(), species);
    for &(x, vx) in atoms {
        b.add_particle(0, Point3::new(x, 5.0, 5.0), Vector3::new(vx, 0.0, 0.0))
            .unwrap();
    }
    (b, grid)
}

pub fn calendar(sim_box: SimBox, grid: InteractionGrid, bonds: BondTable) -> CollisionCalendar {
    CollisionCalendar::new(sim_box, grid, bonds, CalendarSettings::default()).unwrap()
}

/// Random gas of `n` monomers in a cubic periodic box at temperature 1.
pub fn random_calendar(n: usize, edge: f64, valence: usize, law: Option<PairLaw>, seed: u64) -> CollisionCalendar {
    let species = vec![monomer(valence)];
    let mut grid = InteractionGrid::new(&species);
    if let Some(law) = law {
        grid.set(0, 0, law).unwrap();
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let b = SimBox::new_random(Boundary::cubic(edge).unwrap(), species, &[n], &grid, 1.0, &mut rng)
        .expect("random packing");
    let bonds = BondTable::for_box(&b).unwrap();
    calendar(b, grid, bonds)
}

/// Steps past cell transits to the next trajectory-changing event.
pub fn next_collision(cal: &mut CollisionCalendar) -> ExecutedEvent {
    loop {
        let ev = cal.step().unwrap().expect("an event is scheduled");
        if ev.kind.is_collision() {
            return ev;
        }
    }
}

pub fn ids() -> (ParticleId, ParticleId) {
    (ParticleId(0), ParticleId(1))
}
