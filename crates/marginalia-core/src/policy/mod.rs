//! Epsilon-greedy feedback policy with experience replay
//!
//! The policy decides, per regeneration, whether to decode exploratively
//! (sampling) or to exploit (arg-max). Outcomes are remembered in a bounded
//! replay memory and periodically replayed into a linear action-value
//! function. Replay is best-effort: numerical trouble is logged and the
//! update discarded, never surfaced to the regeneration path.

pub mod replay;
pub mod state;

use ndarray::{Array1, Array2, ArrayView1};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::PolicyConfig;
use crate::generation::{DecodeMode, Decoder, GenerationRequest, GenerationResult};
use crate::Result;

pub use replay::{ReplayEntry, ReplayMemory};
pub use state::StateSnapshot;

/// Decision taken for one regeneration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Explore,
    Exploit,
}

impl PolicyAction {
    pub const ALL: [PolicyAction; 2] = [PolicyAction::Explore, PolicyAction::Exploit];

    /// Decode mode implementing the action
    pub fn decode_mode(self) -> DecodeMode {
        match self {
            Self::Explore => DecodeMode::Sample,
            Self::Exploit => DecodeMode::Greedy,
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Explore => 0,
            Self::Exploit => 1,
        }
    }
}

/// Exploration rate with multiplicative decay down to a floor
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PolicyState {
    epsilon: f32,
    decay: f32,
    floor: f32,
}

impl PolicyState {
    pub fn new(initial: f32, decay: f32, floor: f32) -> Self {
        let floor = floor.clamp(0.0, 1.0);
        Self {
            epsilon: initial.clamp(floor, 1.0),
            decay: decay.clamp(0.0, 1.0),
            floor,
        }
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    pub fn floor(&self) -> f32 {
        self.floor
    }

    /// Apply one decay step
    pub fn decay(&mut self) {
        self.epsilon = (self.epsilon * self.decay).max(self.floor);
    }
}

/// Linear action-value function, one weight row per action
#[derive(Debug, Clone)]
struct ValueFunction {
    weights: Array2<f32>,
}

impl ValueFunction {
    fn new(dim: usize) -> Self {
        Self {
            weights: Array2::zeros((PolicyAction::ALL.len(), dim)),
        }
    }

    fn accepts(&self, state: &StateSnapshot) -> bool {
        state.dim() == self.weights.ncols()
    }

    fn q(&self, state: &StateSnapshot, action: PolicyAction) -> f32 {
        let features = ArrayView1::from(state.features());
        self.weights.row(action.index()).dot(&features)
    }

    /// Zero for states of the wrong dimension
    fn best_value(&self, state: &StateSnapshot) -> f32 {
        if !self.accepts(state) {
            return 0.0;
        }
        PolicyAction::ALL
            .iter()
            .map(|&a| self.q(state, a))
            .fold(f32::NEG_INFINITY, f32::max)
    }

    /// Greedy action; ties resolve to exploiting
    fn best_action(&self, state: &StateSnapshot) -> PolicyAction {
        if !self.accepts(state) {
            warn!("State has {} features, expected {}; exploiting", state.dim(), self.weights.ncols());
            return PolicyAction::Exploit;
        }
        if self.q(state, PolicyAction::Explore) > self.q(state, PolicyAction::Exploit) {
            PolicyAction::Explore
        } else {
            PolicyAction::Exploit
        }
    }

    fn norm(&self) -> f32 {
        self.weights.iter().map(|w| w * w).sum::<f32>().sqrt()
    }
}

/// Outcome of one replay pass
#[derive(Debug, Clone, Serialize)]
pub struct ReplayStats {
    pub batch_size: usize,
    pub mean_squared_error: f32,
    pub value_norm: f32,
}

/// Point-in-time view of the policy
#[derive(Debug, Clone, Serialize)]
pub struct PolicySnapshot {
    pub epsilon: f32,
    pub memory_len: usize,
    pub memory_capacity: usize,
    pub decisions: u64,
    pub replays: u64,
    pub value_norm: f32,
}

#[derive(Debug)]
struct Counters {
    decisions: u64,
    insertions: u64,
    replays: u64,
}

/// Shared epsilon-greedy controller
#[derive(Debug)]
pub struct FeedbackPolicy {
    gamma: f32,
    learning_rate: f32,
    batch_size: usize,
    replay_interval: usize,
    feature_dim: usize,
    state: Mutex<PolicyState>,
    memory: Mutex<ReplayMemory>,
    value: Mutex<ValueFunction>,
    rng: Mutex<StdRng>,
    counters: Mutex<Counters>,
}

impl FeedbackPolicy {
    pub fn new(config: &PolicyConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            gamma: config.gamma,
            learning_rate: config.learning_rate,
            batch_size: config.batch_size,
            replay_interval: config.replay_interval,
            feature_dim: config.feature_dim,
            state: Mutex::new(PolicyState::new(config.epsilon, config.epsilon_decay, config.epsilon_min)),
            memory: Mutex::new(ReplayMemory::new(config.memory_capacity)),
            value: Mutex::new(ValueFunction::new(config.feature_dim + 1)),
            rng: Mutex::new(rng),
            counters: Mutex::new(Counters {
                decisions: 0,
                insertions: 0,
                replays: 0,
            }),
        }
    }

    /// Features for a regeneration context
    pub fn observe(&self, content: &str, note: &str, feedback: &str) -> StateSnapshot {
        StateSnapshot::from_text(&[content, note, feedback], self.feature_dim)
    }

    pub fn epsilon(&self) -> f32 {
        self.state.lock().epsilon()
    }

    /// Epsilon-greedy decision; epsilon decays after every call
    pub fn select_action(&self, state: &StateSnapshot) -> PolicyAction {
        let draw: f32 = self.rng.lock().gen();

        let action = {
            let mut policy_state = self.state.lock();
            let explore = draw < policy_state.epsilon();
            policy_state.decay();
            if explore {
                PolicyAction::Explore
            } else {
                self.value.lock().best_action(state)
            }
        };

        self.counters.lock().decisions += 1;
        debug!("Policy chose {:?} (draw {:.3})", action, draw);
        action
    }

    /// Choose an action for `state` and decode `request` in the matching mode
    pub fn act(
        &self,
        state: &StateSnapshot,
        decoder: &Decoder,
        request: GenerationRequest,
    ) -> Result<(PolicyAction, GenerationResult)> {
        let action = self.select_action(state);
        let result = decoder.generate(&request.with_mode(action.decode_mode()))?;
        Ok((action, result))
    }

    /// Store an outcome; every `replay_interval` insertions triggers a replay pass
    pub fn remember(&self, entry: ReplayEntry) -> Option<ReplayStats> {
        self.memory.lock().push(entry);

        let due = {
            let mut counters = self.counters.lock();
            counters.insertions += 1;
            self.replay_interval > 0 && counters.insertions % self.replay_interval as u64 == 0
        };

        if due {
            self.replay(self.batch_size)
        } else {
            None
        }
    }

    /// Fit the value function to a random minibatch of remembered outcomes.
    ///
    /// Returns `None` when fewer than `batch_size` entries exist or when the
    /// update was discarded as numerically unstable.
    pub fn replay(&self, batch_size: usize) -> Option<ReplayStats> {
        let batch = {
            let memory = self.memory.lock();
            let mut rng = self.rng.lock();
            memory.sample(batch_size, &mut *rng)?
        };

        let mut value = self.value.lock();
        let mut weights = value.weights.clone();
        let mut squared_error = 0.0f32;

        for entry in &batch {
            if entry.state().dim() != weights.ncols() {
                warn!(
                    "Skipping replay entry with {} features, expected {}",
                    entry.state().dim(),
                    weights.ncols()
                );
                continue;
            }
            if let Some(next) = entry.next_state().filter(|next| next.dim() != weights.ncols()) {
                warn!(
                    "Skipping replay entry whose next state has {} features, expected {}",
                    next.dim(),
                    weights.ncols()
                );
                continue;
            }
            let target = match entry.next_state() {
                Some(next) => entry.reward() + self.gamma * value.best_value(next),
                None => entry.reward(),
            };
            let features = Array1::from(entry.state().features().to_vec());
            let row = entry.action().index();
            let error = weights.row(row).dot(&features) - target;
            squared_error += error * error;
            weights
                .row_mut(row)
                .scaled_add(-self.learning_rate * error, &features);
        }

        if !squared_error.is_finite() || weights.iter().any(|w| !w.is_finite()) {
            warn!("Discarding replay update: non-finite values in batch of {}", batch.len());
            return None;
        }

        value.weights = weights;
        let stats = ReplayStats {
            batch_size: batch.len(),
            mean_squared_error: squared_error / batch.len() as f32,
            value_norm: value.norm(),
        };
        drop(value);

        self.counters.lock().replays += 1;
        debug!(
            "Replayed {} entries, mse {:.4}",
            stats.batch_size, stats.mean_squared_error
        );
        Some(stats)
    }

    pub fn memory_len(&self) -> usize {
        self.memory.lock().len()
    }

    pub fn snapshot(&self) -> PolicySnapshot {
        let (memory_len, memory_capacity) = {
            let memory = self.memory.lock();
            (memory.len(), memory.capacity())
        };
        let counters = self.counters.lock();
        PolicySnapshot {
            epsilon: self.epsilon(),
            memory_len,
            memory_capacity,
            decisions: counters.decisions,
            replays: counters.replays,
            value_norm: self.value.lock().norm(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PolicyConfig {
        PolicyConfig {
            seed: Some(17),
            feature_dim: 8,
            batch_size: 4,
            replay_interval: 4,
            learning_rate: 0.5,
            ..PolicyConfig::default()
        }
    }

    fn state(policy: &FeedbackPolicy, text: &str) -> StateSnapshot {
        policy.observe(text, "", "dislike")
    }

    #[test]
    fn test_epsilon_decays_per_decision_to_floor() {
        let policy = FeedbackPolicy::new(&PolicyConfig {
            epsilon: 1.0,
            epsilon_decay: 0.5,
            epsilon_min: 0.1,
            ..config()
        });
        let s = state(&policy, "x");
        policy.select_action(&s);
        assert!((policy.epsilon() - 0.5).abs() < 1e-6);
        for _ in 0..10 {
            policy.select_action(&s);
        }
        assert_eq!(policy.epsilon(), 0.1);
    }

    #[test]
    fn test_full_exploration_then_exploitation() {
        let policy = FeedbackPolicy::new(&PolicyConfig {
            epsilon: 1.0,
            epsilon_decay: 1.0,
            ..config()
        });
        let s = state(&policy, "x");
        assert!((0..20).all(|_| policy.select_action(&s) == PolicyAction::Explore));

        let policy = FeedbackPolicy::new(&PolicyConfig {
            epsilon: 0.0,
            epsilon_min: 0.0,
            ..config()
        });
        assert!((0..20).all(|_| policy.select_action(&s) == PolicyAction::Exploit));
    }

    #[test]
    fn test_replay_is_noop_below_batch_size() {
        let policy = FeedbackPolicy::new(&config());
        let s = state(&policy, "x");
        policy.remember(ReplayEntry::new(s, PolicyAction::Exploit, 1.0, None));
        assert!(policy.replay(4).is_none());
        assert_eq!(policy.snapshot().replays, 0);
    }

    #[test]
    fn test_replay_learns_rewarded_action() {
        let policy = FeedbackPolicy::new(&PolicyConfig {
            epsilon: 0.0,
            epsilon_min: 0.0,
            replay_interval: 0,
            ..config()
        });
        let s = state(&policy, "photosynthesis");
        for _ in 0..8 {
            policy.remember(ReplayEntry::new(s.clone(), PolicyAction::Explore, 1.0, None));
            policy.remember(ReplayEntry::new(s.clone(), PolicyAction::Exploit, -1.0, None));
        }
        for _ in 0..20 {
            policy.replay(4);
        }
        assert_eq!(policy.select_action(&s), PolicyAction::Explore);
    }

    #[test]
    fn test_periodic_replay_on_remember() {
        let policy = FeedbackPolicy::new(&config());
        let s = state(&policy, "x");
        let mut replays = 0;
        for i in 0..8 {
            let next = if i % 2 == 0 { Some(s.clone()) } else { None };
            if policy.remember(ReplayEntry::new(s.clone(), PolicyAction::Exploit, 1.0, next)).is_some() {
                replays += 1;
            }
        }
        assert_eq!(replays, 2);
        assert_eq!(policy.snapshot().replays, 2);
    }

    #[test]
    fn test_mismatched_states_are_skipped() {
        let policy = FeedbackPolicy::new(&PolicyConfig {
            epsilon: 0.0,
            epsilon_min: 0.0,
            replay_interval: 0,
            ..config()
        });
        let s = state(&policy, "x");
        let short = StateSnapshot::from_features(vec![1.0]);
        for _ in 0..4 {
            policy.remember(ReplayEntry::new(s.clone(), PolicyAction::Exploit, 1.0, Some(short.clone())));
        }

        let stats = policy.replay(4).unwrap();
        assert_eq!(stats.value_norm, 0.0);
        assert_eq!(policy.select_action(&short), PolicyAction::Exploit);
    }

    #[test]
    fn test_unstable_update_is_discarded() {
        let policy = FeedbackPolicy::new(&config());
        let s = state(&policy, "x");
        for _ in 0..4 {
            policy.remember(ReplayEntry::new(s.clone(), PolicyAction::Explore, f32::NAN, None));
        }
        assert!(policy.replay(4).is_none());
        assert_eq!(policy.snapshot().value_norm, 0.0);
    }
}
