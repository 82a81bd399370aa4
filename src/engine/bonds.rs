//! Fixed-capacity bond slots per particle.
//!
//! Bonding is symmetric: if `a` holds `b` in a slot then `b` holds `a`.
//! A particle never holds the same partner twice and never more partners
//! than its capacity.

use crate::core::agents::AgentStore;
use crate::core::domain::{ParticleId, SimBox};
use crate::error::{Error, Result};

/// Largest valence a species may declare.
pub const MAX_VALENCE: usize = 4;

/// The slot array of one particle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BondSlots {
    partners: [Option<ParticleId>; MAX_VALENCE],
    capacity: u8,
}

impl BondSlots {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity > MAX_VALENCE {
            return Err(Error::InvalidParam(format!(
                "valence {} exceeds the maximum of {}",
                capacity, MAX_VALENCE
            )));
        }
        Ok(Self {
            partners: [None; MAX_VALENCE],
            capacity: capacity as u8,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    #[inline]
    fn active(&self) -> &[Option<ParticleId>] {
        &self.partners[..self.capacity()]
    }

    pub fn partners(&self) -> impl Iterator<Item = ParticleId> + '_ {
        self.active().iter().flatten().copied()
    }

    pub fn count(&self) -> usize {
        self.active().iter().filter(|s| s.is_some()).count()
    }

    #[inline]
    pub fn holds(&self, other: ParticleId) -> bool {
        self.active().contains(&Some(other))
    }

    #[inline]
    pub fn first_free(&self) -> Option<usize> {
        self.active().iter().position(|s| s.is_none())
    }

    fn slot_of(&self, other: ParticleId) -> Option<usize> {
        self.active().iter().position(|s| *s == Some(other))
    }
}

/// Bond adjacency for every particle, backed by an [`AgentStore`].
#[derive(Debug, Clone, Default)]
pub struct BondTable {
    slots: AgentStore<BondSlots>,
}

impl BondTable {
    /// One slot array per particle with the given capacities.
    pub fn new<I: IntoIterator<Item = usize>>(capacities: I) -> Result<Self> {
        let slots = capacities
            .into_iter()
            .map(BondSlots::new)
            .collect::<Result<AgentStore<_>>>()?;
        Ok(Self { slots })
    }

    /// Capacities taken from each particle's species valence.
    pub fn for_box(sim_box: &SimBox) -> Result<Self> {
        Self::new(
            sim_box
                .particles
                .iter()
                .map(|p| sim_box.species[p.species].valence),
        )
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    pub fn capacity(&self, a: ParticleId) -> usize {
        self.slots[a].capacity()
    }

    #[inline]
    pub fn is_bonded(&self, a: ParticleId, b: ParticleId) -> bool {
        self.slots[a].holds(b)
    }

    /// All slots occupied. A zero-capacity particle is always full.
    #[inline]
    pub fn is_full(&self, a: ParticleId) -> bool {
        self.slots[a].first_free().is_none()
    }

    #[inline]
    pub fn first_free_slot(&self, a: ParticleId) -> Option<usize> {
        self.slots[a].first_free()
    }

    pub fn partners(&self, a: ParticleId) -> impl Iterator<Item = ParticleId> + '_ {
        self.slots[a].partners()
    }

    pub fn bond_count(&self, a: ParticleId) -> usize {
        self.slots[a].count()
    }

    /// Number of bonded pairs.
    pub fn total_bonds(&self) -> usize {
        self.slots.iter().map(|(_, s)| s.count()).sum::<usize>() / 2
    }

    /// Total number of slots over all particles.
    pub fn total_capacity(&self) -> usize {
        self.slots.iter().map(|(_, s)| s.capacity()).sum()
    }

    /// Writes `b` into the first free slot of `a` and vice versa.
    ///
    /// Calling this on a bonded pair or a full particle is a contract
    /// violation: the table is left untouched and the inconsistency returned.
    pub fn bond(&mut self, a: ParticleId, b: ParticleId) -> Result<()> {
        if a == b {
            return Err(inconsistency(a, b, "a particle cannot bond to itself"));
        }
        if self.is_bonded(a, b) || self.is_bonded(b, a) {
            return Err(inconsistency(a, b, "pair is already bonded"));
        }
        let (Some(slot_a), Some(slot_b)) = (self.first_free_slot(a), self.first_free_slot(b))
        else {
            return Err(inconsistency(a, b, "bond requested with no free slot"));
        };
        self.slots[a].partners[slot_a] = Some(b);
        self.slots[b].partners[slot_b] = Some(a);
        Ok(())
    }

    /// Clears the slots linking `a` and `b`.
    ///
    /// Fails loudly if only one side records the bond.
    pub fn unbond(&mut self, a: ParticleId, b: ParticleId) -> Result<()> {
        match (self.slots[a].slot_of(b), self.slots[b].slot_of(a)) {
            (Some(slot_a), Some(slot_b)) => {
                self.slots[a].partners[slot_a] = None;
                self.slots[b].partners[slot_b] = None;
                Ok(())
            }
            (None, None) => Err(inconsistency(a, b, "unbond requested for unbonded pair")),
            _ => Err(inconsistency(a, b, "asymmetric bond adjacency")),
        }
    }

    /// Drops every bond.
    pub fn clear(&mut self) {
        for i in 0..self.slots.len() {
            let id = ParticleId(i);
            let cap = self.slots[id].capacity;
            self.slots[id] = BondSlots {
                partners: [None; MAX_VALENCE],
                capacity: cap,
            };
        }
    }

    /// Verifies symmetry and uniqueness of every recorded bond.
    pub fn check_consistency(&self) -> Result<()> {
        for (a, slots) in self.slots.iter() {
            let mut seen: [Option<ParticleId>; MAX_VALENCE] = [None; MAX_VALENCE];
            for (k, b) in slots.partners().enumerate() {
                if b.index() >= self.slots.len() {
                    return Err(inconsistency(a, b, "partner handle out of range"));
                }
                if seen.contains(&Some(b)) {
                    return Err(inconsistency(a, b, "partner held in two slots"));
                }
                seen[k] = Some(b);
                if !self.slots[b].holds(a) {
                    return Err(inconsistency(a, b, "asymmetric bond adjacency"));
                }
            }
        }
        Ok(())
    }
}

fn inconsistency(a: ParticleId, b: ParticleId, reason: &str) -> Error {
    Error::BondInconsistency {
        a,
        b,
        reason: reason.to_string(),
    }
}
