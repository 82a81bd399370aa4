use std::ops::{Index, IndexMut};

use crate::core::domain::ParticleId;

/// Dense per-atom side table keyed by [`ParticleId`].
///
/// Attaches mutable simulation data (cell slot, collision record, bond slots)
/// to particles without touching [`Particle`](crate::core::domain::Particle).
#[derive(Debug, Clone, Default)]
pub struct AgentStore<T> {
    agents: Vec<T>,
}

impl<T: Clone> AgentStore<T> {
    /// `n` agents, all initialised to `init`.
    pub fn new(n: usize, init: T) -> Self {
        Self {
            agents: vec![init; n],
        }
    }

    /// Overwrites every agent with `value`.
    pub fn fill(&mut self, value: T) {
        self.agents.iter_mut().for_each(|a| *a = value.clone());
    }

    /// Grows or shrinks to `n` agents; new slots get `init`.
    pub fn resize(&mut self, n: usize, init: T) {
        self.agents.resize(n, init);
    }
}

impl<T> AgentStore<T> {
    pub fn from_fn(n: usize, f: impl FnMut(usize) -> T) -> Self {
        Self {
            agents: (0..n).map(f).collect(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    #[inline]
    pub fn get(&self, id: ParticleId) -> Option<&T> {
        self.agents.get(id.index())
    }

    #[inline]
    pub fn get_mut(&mut self, id: ParticleId) -> Option<&mut T> {
        self.agents.get_mut(id.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParticleId, &T)> {
        self.agents
            .iter()
            .enumerate()
            .map(|(i, a)| (ParticleId(i), a))
    }

    pub fn as_slice(&self) -> &[T] {
        &self.agents
    }
}

impl<T> Index<ParticleId> for AgentStore<T> {
    type Output = T;

    #[inline(always)]
    fn index(&self, id: ParticleId) -> &T {
        &self.agents[id.index()]
    }
}

impl<T> IndexMut<ParticleId> for AgentStore<T> {
    #[inline(always)]
    fn index_mut(&mut self, id: ParticleId) -> &mut T {
        &mut self.agents[id.index()]
    }
}

impl<T> FromIterator<T> for AgentStore<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            agents: iter.into_iter().collect(),
        }
    }
}
