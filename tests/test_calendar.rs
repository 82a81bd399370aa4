mod common;

use approx::assert_relative_eq;
use hardchain::core::chemistry::InteractionGrid;
use hardchain::core::domain::{Boundary, ParticleId, SimBox, Species};
use hardchain::engine::bonds::BondTable;
use hardchain::engine::calendar::{CalendarState, EventKind, Partner};
use hardchain::engine::potential::{BumpOutcome, PairLaw};
use hardchain::Error;
use nalgebra::{Point3, Vector3};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

// --- Scenarios ---

#[test]
fn two_spheres_collide_at_predicted_time() {
    let (b, grid) = common::line_box(common::monomer(0), None, &[(3.5, 1.0), (6.5, -1.0)]);
    let bonds = BondTable::for_box(&b).unwrap();
    let mut cal = common::calendar(b, grid, bonds);

    let ev = common::next_collision(&mut cal);
    assert_relative_eq!(ev.time, 1.0, epsilon = 1e-12);
    assert_eq!(ev.kind, EventKind::Core);
    assert_eq!(ev.partner, Partner::Atom(ParticleId(1)));

    let (a, b) = common::ids();
    let dv = cal.sim_box().particle(b).velocity - cal.sim_box().particle(a).velocity;
    assert_relative_eq!(dv.x, 2.0, epsilon = 1e-12);
    assert_eq!(cal.event_count(), 1);
}

#[test]
fn entering_a_bonding_well_forms_a_bond() {
    let (b, grid) = common::line_box(common::monomer(2), Some(common::BONDING), &[(4.0, 1.0), (6.0, -1.0)]);
    let bonds = BondTable::for_box(&b).unwrap();
    let mut cal = common::calendar(b, grid, bonds);
    cal.reset().unwrap();
    let e0 = cal.total_energy();

    let ev = common::next_collision(&mut cal);
    assert_relative_eq!(ev.time, 0.25, epsilon = 1e-12);
    assert_eq!(ev.outcome, Some(BumpOutcome::Bonded));
    let (a, b) = common::ids();
    assert!(cal.bonds().is_bonded(a, b));
    assert!(cal.bonds().is_bonded(b, a));
    assert_relative_eq!(cal.potential_energy(), -1.0, epsilon = 1e-12);
    assert_relative_eq!(cal.total_energy(), e0, epsilon = 1e-12);
    cal.check_invariants().unwrap();
}

#[test]
fn slow_bonded_pair_stays_bonded() {
    let (b, grid) = common::line_box(common::monomer(2), Some(common::BONDING), &[(4.4, -0.2), (5.6, 0.2)]);
    let mut bonds = BondTable::for_box(&b).unwrap();
    let (a, c) = common::ids();
    bonds.bond(a, c).unwrap();
    let mut cal = common::calendar(b, grid, bonds);
    cal.reset().unwrap();
    let ke0 = cal.kinetic_energy();

    let ev = common::next_collision(&mut cal);
    assert_eq!(ev.kind, EventKind::BondBreak);
    assert_eq!(ev.outcome, Some(BumpOutcome::WellReflection));
    assert!(cal.bonds().is_bonded(a, c));
    assert_eq!(cal.bonds().bond_count(a), 1);
    assert_eq!(cal.bonds().bond_count(c), 1);
    assert_relative_eq!(cal.kinetic_energy(), ke0, epsilon = 1e-12);
}

#[test]
fn fast_bonded_pair_breaks_and_pays_the_depth() {
    let (b, grid) = common::line_box(common::monomer(2), Some(common::BONDING), &[(4.4, -2.0), (5.6, 2.0)]);
    let mut bonds = BondTable::for_box(&b).unwrap();
    let (a, c) = common::ids();
    bonds.bond(a, c).unwrap();
    let mut cal = common::calendar(b, grid, bonds);
    cal.reset().unwrap();
    assert_relative_eq!(cal.potential_energy(), -1.0, epsilon = 1e-12);
    let ke0 = cal.kinetic_energy();

    let ev = common::next_collision(&mut cal);
    assert_eq!(ev.outcome, Some(BumpOutcome::Unbonded));
    assert!(!cal.bonds().is_bonded(a, c));
    assert_eq!(cal.bonds().first_free_slot(a), Some(0));
    assert_relative_eq!(ke0 - cal.kinetic_energy(), 1.0, epsilon = 1e-12);
    assert_relative_eq!(cal.potential_energy(), 0.0, epsilon = 1e-12);
}

#[test]
fn full_slots_repel_at_the_well_edge() {
    let (b, grid) = common::line_box(
        common::monomer(1),
        Some(common::BONDING),
        &[(2.0, 0.0), (3.2, 0.0), (6.0, -1.0)],
    );
    let mut bonds = BondTable::for_box(&b).unwrap();
    bonds.bond(ParticleId(0), ParticleId(1)).unwrap();
    let mut cal = common::calendar(b, grid, bonds);

    let ev = common::next_collision(&mut cal);
    assert_eq!(ev.partner, Partner::Atom(ParticleId(2)));
    assert_eq!(ev.outcome, Some(BumpOutcome::Repelled));
    assert!(!cal.bonds().is_bonded(ParticleId(1), ParticleId(2)));
    assert_relative_eq!(cal.sim_box().particle(ParticleId(2)).velocity.x, 1.0, epsilon = 1e-12);
    assert_relative_eq!(cal.sim_box().particle(ParticleId(1)).velocity.x, -1.0, epsilon = 1e-12);
}

// --- Conservation and invariants ---

#[test]
fn hard_sphere_gas_conserves_energy_and_momentum() {
    let mut cal = common::random_calendar(200, 10.0, 0, None, 1);
    cal.reset().unwrap();
    let e0 = cal.kinetic_energy();
    let p0 = cal.momentum();

    let executed = cal.advance_events(2_000).unwrap();
    assert_eq!(executed, 2_000);
    assert_relative_eq!(cal.kinetic_energy(), e0, max_relative = 1e-9);
    assert!((cal.momentum() - p0).norm() < 1e-9);
    cal.check_invariants().unwrap();
}

#[test]
fn square_well_fluid_conserves_total_energy() {
    let mut cal = common::random_calendar(150, 9.0, 0, Some(common::SQUARE_WELL), 2);
    cal.reset().unwrap();
    let e0 = cal.total_energy();
    let p0 = cal.momentum();

    cal.advance_events(2_000).unwrap();
    assert!(cal.tally().captures > 0);
    assert_relative_eq!(cal.total_energy(), e0, max_relative = 1e-9);
    assert!((cal.momentum() - p0).norm() < 1e-9);

    let tracked = cal.potential_energy();
    assert_relative_eq!(cal.recompute_potential_energy(), tracked, epsilon = 1e-9);
}

#[test]
fn chain_model_keeps_bond_invariants_at_every_step() {
    let mut cal = common::random_calendar(120, 8.0, 2, Some(common::BONDING), 3);
    cal.reset().unwrap();
    let e0 = cal.total_energy();
    let mut last_time = cal.time();

    while cal.event_count() < 3_000 {
        let ev = cal.step().unwrap().expect("dense fluid always has events");
        assert!(ev.time >= last_time, "clock went backwards");
        last_time = ev.time;
        if ev.kind.is_collision() {
            cal.check_invariants().unwrap();
        }
        for i in 0..cal.bonds().len() {
            let a = ParticleId(i);
            assert!(cal.bonds().bond_count(a) <= 2);
            for b in cal.bonds().partners(a) {
                assert!(cal.bonds().is_bonded(b, a));
            }
        }
    }

    assert!(cal.tally().bonds_formed > 0);
    assert!(cal.bonds().total_bonds() > 0);
    assert_relative_eq!(cal.total_energy(), e0, max_relative = 1e-9);
    assert_relative_eq!(
        cal.potential_energy(),
        -(cal.bonds().total_bonds() as f64),
        epsilon = 1e-9
    );
    assert_eq!(cal.tally().collisions(), cal.event_count());
}

#[test]
fn identical_inputs_replay_identically() {
    let run = || {
        let mut cal = common::random_calendar(80, 7.0, 2, Some(common::BONDING), 9);
        cal.advance_events(1_000).unwrap();
        cal
    };
    let (a, b) = (run(), run());
    assert_eq!(a.time(), b.time());
    assert_eq!(a.tally(), b.tally());
    for (pa, pb) in a.sim_box().particles.iter().zip(&b.sim_box().particles) {
        assert_eq!(pa.position, pb.position);
        assert_eq!(pa.velocity, pb.velocity);
    }
}

// --- Walls, fixed particles ---

#[test]
fn walls_confine_particles_and_conserve_energy() {
    let species = vec![common::monomer(0)];
    let grid = InteractionGrid::new(&species);
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let boundary = Boundary::new([8.0, 8.0, 8.0], [false, false, true]).unwrap();
    let b = SimBox::new_random(boundary, species, &[60], &grid, 1.0, &mut rng).unwrap();
    let bonds = BondTable::for_box(&b).unwrap();
    let mut cal = common::calendar(b, grid, bonds);
    cal.reset().unwrap();
    let e0 = cal.kinetic_energy();

    cal.advance_events(1_500).unwrap();
    assert!(cal.tally().walls > 0);
    assert_relative_eq!(cal.kinetic_energy(), e0, max_relative = 1e-9);
    for p in &cal.sim_box().particles {
        for k in 0..2 {
            assert!(p.position[k] >= 0.5 - 1e-9 && p.position[k] <= 7.5 + 1e-9);
        }
    }
}

#[test]
fn fixed_particles_are_never_displaced() {
    let species = vec![
        common::monomer(0),
        Species {
            symbol: "W".into(),
            fixed: true,
            ..Default::default()
        },
    ];
    let grid = InteractionGrid::new(&species);
    let mut b = SimBox::new(Boundary::cubic(10.0).unwrap(), species);
    b.add_particle(0, Point3::new(3.0, 5.0, 5.0), Vector3::new(1.0, 0.0, 0.0))
        .unwrap();
    b.add_particle(1, Point3::new(5.0, 5.0, 5.0), Vector3::zeros())
        .unwrap();
    let bonds = BondTable::for_box(&b).unwrap();
    let mut cal = common::calendar(b, grid, bonds);

    let ev = common::next_collision(&mut cal);
    assert_relative_eq!(ev.time, 1.0, epsilon = 1e-12);
    let wall = cal.sim_box().particle(ParticleId(1));
    assert_eq!(wall.position, Point3::new(5.0, 5.0, 5.0));
    assert_eq!(wall.velocity, Vector3::zeros());
    assert_relative_eq!(cal.sim_box().particle(ParticleId(0)).velocity.x, -1.0, epsilon = 1e-12);
}

// --- Driving and perturbations ---

#[test]
fn advance_time_lands_exactly_on_the_horizon() {
    let mut cal = common::random_calendar(50, 8.0, 0, None, 4);
    cal.advance_time(1.25).unwrap();
    assert_eq!(cal.time(), 1.25);
    cal.advance_time(0.75).unwrap();
    assert_relative_eq!(cal.time(), 2.0, epsilon = 1e-12);
    cal.check_invariants().unwrap();
    assert!(cal.advance_time(-1.0).is_err());
}

#[test]
fn rescale_repredicts_and_scales_energy() {
    let mut cal = common::random_calendar(100, 9.0, 0, None, 6);
    cal.advance_events(200).unwrap();
    let ke = cal.kinetic_energy();
    cal.rescale(2.0).unwrap();
    assert_relative_eq!(cal.kinetic_energy(), 4.0 * ke, max_relative = 1e-12);
    cal.advance_events(500).unwrap();
    assert_relative_eq!(cal.kinetic_energy(), 4.0 * ke, max_relative = 1e-9);
    cal.check_invariants().unwrap();
}

#[test]
fn randomizing_one_particle_keeps_calendar_consistent() {
    let mut cal = common::random_calendar(100, 9.0, 2, Some(common::BONDING), 7);
    let mut rng = ChaCha8Rng::seed_from_u64(70);
    cal.advance_events(100).unwrap();
    for i in 0..20 {
        let id = ParticleId((i * 7) % 100);
        cal.randomize_one(id, 1.0, &mut rng).unwrap();
        let e = cal.total_energy();
        cal.advance_events(25).unwrap();
        assert_relative_eq!(cal.total_energy(), e, max_relative = 1e-9);
        cal.check_invariants().unwrap();
    }
}

#[test]
fn resizing_the_box_rebuilds_cells() {
    let mut cal = common::random_calendar(60, 8.0, 0, None, 8);
    cal.advance_events(100).unwrap();
    cal.resize_box([10.0, 10.0, 10.0]).unwrap();
    assert_eq!(cal.state(), CalendarState::Primed);
    assert_eq!(cal.sim_box().boundary.edges, Vector3::new(10.0, 10.0, 10.0));
    cal.advance_events(100).unwrap();
    cal.check_invariants().unwrap();

    let err = cal.resize_box([1.8, 10.0, 10.0]).unwrap_err();
    assert!(matches!(err, Error::NeighborRange { axis: 0, .. }));
    assert_eq!(cal.sim_box().boundary.edges.x, 10.0);
}

#[test]
fn rejected_resize_leaves_the_box_untouched() {
    let species = vec![common::monomer(0)];
    let grid = InteractionGrid::new(&species);
    let boundary = Boundary::new([10.0, 10.0, 10.0], [true, true, false]).unwrap();
    let mut b = SimBox::new(boundary, species);
    b.add_particle(0, Point3::new(2.0, 5.0, 5.0), Vector3::new(1.0, 0.0, 0.0))
        .unwrap();
    let bonds = BondTable::for_box(&b).unwrap();
    let mut cal = common::calendar(b, grid, bonds);
    cal.reset().unwrap();
    let dims = cal.cells().dims();

    // x shrinks fine, but the walls on z close below one diameter.
    let err = cal.resize_box([5.0, 10.0, 0.8]).unwrap_err();
    assert!(matches!(err, Error::InvalidParam(_)));
    assert_eq!(cal.sim_box().boundary.edges, Vector3::new(10.0, 10.0, 10.0));
    assert_eq!(cal.sim_box().particle(ParticleId(0)).position, Point3::new(2.0, 5.0, 5.0));
    assert_eq!(cal.state(), CalendarState::Primed);
    assert_eq!(cal.cells().dims(), dims);
    cal.check_invariants().unwrap();

    cal.advance_events(20).unwrap();
    cal.check_invariants().unwrap();
}

#[test]
fn resize_unbonds_pairs_stretched_past_the_well() {
    let (b, grid) = common::line_box(
        common::monomer(2),
        Some(common::BONDING),
        &[(1.0, 0.0), (2.05, 0.0), (5.0, 0.0), (6.2, 0.0)],
    );
    let mut bonds = BondTable::for_box(&b).unwrap();
    bonds.bond(ParticleId(0), ParticleId(1)).unwrap();
    bonds.bond(ParticleId(2), ParticleId(3)).unwrap();
    let mut cal = common::calendar(b, grid, bonds);
    cal.reset().unwrap();
    assert_relative_eq!(cal.potential_energy(), -2.0, epsilon = 1e-12);

    // Separations scale by 1.4: 1.05 -> 1.47 stays inside 1.5, 1.2 -> 1.68 does not.
    cal.resize_box([14.0, 14.0, 14.0]).unwrap();
    assert!(cal.bonds().is_bonded(ParticleId(0), ParticleId(1)));
    assert!(!cal.bonds().is_bonded(ParticleId(2), ParticleId(3)));
    assert_eq!(cal.bonds().total_bonds(), 1);
    assert_relative_eq!(cal.potential_energy(), -1.0, epsilon = 1e-12);
    cal.check_invariants().unwrap();
}

#[test]
fn chain_model_never_overlaps_by_direct_pair_scan() {
    let mut cal = common::random_calendar(120, 8.0, 2, Some(common::BONDING), 21);
    cal.reset().unwrap();
    while cal.event_count() < 3_000 {
        cal.advance_events(100).unwrap();
        let overlap = hardchain::core::spatial::check_overlap_within(cal.sim_box(), cal.grid(), 1e-7);
        assert!(overlap.is_none(), "{:?} at event {}", overlap, cal.event_count());
    }
    assert!(cal.bonds().total_bonds() > 0);
}

#[test]
fn switching_off_bonding_drops_bonds() {
    let mut cal = common::random_calendar(100, 8.0, 2, Some(common::BONDING), 10);
    cal.advance_events(1_000).unwrap();
    assert!(cal.bonds().total_bonds() > 0);

    cal.set_interaction(0, 0, PairLaw::HardSphere { diameter: 1.0 }).unwrap();
    assert_eq!(cal.bonds().total_bonds(), 0);
    assert_eq!(cal.potential_energy(), 0.0);
    let formed = cal.tally().bonds_formed;
    cal.advance_events(200).unwrap();
    assert_eq!(cal.tally().bonds_formed, formed);
    assert_eq!(cal.bonds().total_bonds(), 0);
    cal.check_invariants().unwrap();
}

// --- Failure modes ---

#[test]
fn overlapping_start_is_reported_distinctly() {
    let (b, grid) = common::line_box(common::monomer(0), None, &[(5.0, 0.0), (5.4, 0.0)]);
    let bonds = BondTable::for_box(&b).unwrap();
    let mut cal = common::calendar(b, grid, bonds);
    match cal.reset() {
        Err(Error::ConfigurationOverlap { a, b, separation, core, .. }) => {
            assert_eq!((a, b), common::ids());
            assert_relative_eq!(separation, 0.4, epsilon = 1e-12);
            assert_relative_eq!(core, 1.0);
        }
        other => panic!("expected an overlap error, got {:?}", other),
    }
    assert_eq!(cal.state(), CalendarState::Idle);
}

#[test]
fn oversized_range_is_rejected_up_front() {
    let (b, mut grid) = common::line_box(common::monomer(0), None, &[(5.0, 0.0)]);
    grid.set(0, 0, PairLaw::SquareWell { core: 1.0, well: 5.5, depth: 1.0 })
        .unwrap();
    let bonds = BondTable::for_box(&b).unwrap();
    let err = hardchain::engine::calendar::CollisionCalendar::new(
        b,
        grid,
        bonds,
        Default::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::NeighborRange { .. }));
}
