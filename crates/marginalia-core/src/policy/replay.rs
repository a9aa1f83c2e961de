//! Bounded experience replay memory

use rand::seq::index;
use rand::Rng;
use std::collections::VecDeque;

use super::{PolicyAction, StateSnapshot};

/// One remembered decision and its outcome
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayEntry {
    state: StateSnapshot,
    action: PolicyAction,
    reward: f32,
    next_state: Option<StateSnapshot>,
}

impl ReplayEntry {
    pub fn new(
        state: StateSnapshot,
        action: PolicyAction,
        reward: f32,
        next_state: Option<StateSnapshot>,
    ) -> Self {
        Self {
            state,
            action,
            reward,
            next_state,
        }
    }

    pub fn state(&self) -> &StateSnapshot {
        &self.state
    }

    pub fn action(&self) -> PolicyAction {
        self.action
    }

    /// Fixed at insertion
    pub fn reward(&self) -> f32 {
        self.reward
    }

    pub fn next_state(&self) -> Option<&StateSnapshot> {
        self.next_state.as_ref()
    }
}

/// Fixed-capacity FIFO of replay entries; the oldest entry is evicted first
#[derive(Debug, Clone)]
pub struct ReplayMemory {
    entries: VecDeque<ReplayEntry>,
    capacity: usize,
}

impl ReplayMemory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry, returning the evicted one when at capacity
    pub fn push(&mut self, entry: ReplayEntry) -> Option<ReplayEntry> {
        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &ReplayEntry> {
        self.entries.iter()
    }

    /// Uniform sample without replacement; `None` when fewer than `batch_size` entries exist
    pub fn sample<R: Rng>(&self, batch_size: usize, rng: &mut R) -> Option<Vec<ReplayEntry>> {
        if batch_size == 0 || self.entries.len() < batch_size {
            return None;
        }
        let picked = index::sample(rng, self.entries.len(), batch_size);
        Some(picked.iter().map(|i| self.entries[i].clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn entry(reward: f32) -> ReplayEntry {
        ReplayEntry::new(StateSnapshot::from_features(vec![reward]), PolicyAction::Exploit, reward, None)
    }

    #[test]
    fn test_fifo_eviction() {
        let mut memory = ReplayMemory::new(3);
        for r in 0..3 {
            assert!(memory.push(entry(r as f32)).is_none());
        }
        let evicted = memory.push(entry(3.0)).unwrap();
        assert_eq!(evicted.reward(), 0.0);
        assert_eq!(memory.len(), 3);
        let rewards: Vec<f32> = memory.iter().map(|e| e.reward()).collect();
        assert_eq!(rewards, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_sample_without_replacement() {
        let mut memory = ReplayMemory::new(10);
        for r in 0..10 {
            memory.push(entry(r as f32));
        }
        let mut rng = StdRng::seed_from_u64(1);
        assert!(memory.sample(11, &mut rng).is_none());

        let batch = memory.sample(10, &mut rng).unwrap();
        let distinct: HashSet<u32> = batch.iter().map(|e| e.reward() as u32).collect();
        assert_eq!(distinct.len(), 10);
    }
}
