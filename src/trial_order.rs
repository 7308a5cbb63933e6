//! Trial order generation
//!
//! Expands conditions x repetitions into the concrete sequence of trials. The
//! sequence is generated once per run, before any trial executes, and saved
//! verbatim as `trial_order.json`.
//!
//! - Randomization disabled: `repetitions` passes over the conditions in
//!   declaration order.
//! - `block`: each repetition is an independent permutation of the conditions.
//! - `trial`: one permutation over the whole conditions x repetitions multiset;
//!   `blockNumber` is `null` because trials no longer line up with repetitions.
//!
//! All shuffling is driven by a `StdRng` seeded once per run, so a given seed
//! always yields the same order.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::AppResult;
use crate::protocol::{Randomization, RandomizationMethod};

/// One scheduled trial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialRecord {
    /// 1-based position in execution order
    pub trial_number: usize,
    #[serde(rename = "conditionID")]
    pub condition_id: String,
    /// 1-based repetition index
    pub repetition: u32,
    /// Repetition block, `None` for trial-level randomization
    pub block_number: Option<u32>,
}

/// The generated order plus what is needed to reproduce it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialOrder {
    /// Seed used for shuffling; `None` when randomization is disabled
    pub seed: Option<u64>,
    /// `none`, `block` or `trial`
    pub method: String,
    pub trials: Vec<TrialRecord>,
}

impl TrialOrder {
    /// Generate the order for `conditions` and `repetitions`.
    ///
    /// When randomization is enabled without an explicit seed, a fresh seed is
    /// drawn and recorded in the returned order.
    pub fn generate(
        conditions: &[String],
        repetitions: u32,
        randomization: &Randomization,
    ) -> Self {
        let seed = if randomization.enabled {
            Some(randomization.seed.unwrap_or_else(rand::random::<u64>))
        } else {
            None
        };
        let trials = generate_trial_order(conditions, repetitions, randomization, seed);
        let method = if randomization.enabled {
            randomization.method.to_string()
        } else {
            "none".to_string()
        };
        Self {
            seed,
            method,
            trials,
        }
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    pub fn save_json(&self, path: &Path) -> AppResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load_json(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Deterministic trial order for the given inputs.
///
/// `seed` is only consulted when randomization is enabled; a missing seed then
/// falls back to 0.
pub fn generate_trial_order(
    conditions: &[String],
    repetitions: u32,
    randomization: &Randomization,
    seed: Option<u64>,
) -> Vec<TrialRecord> {
    let mut rng = StdRng::seed_from_u64(seed.unwrap_or(0));
    let mut trials = Vec::with_capacity(conditions.len() * repetitions as usize);

    let method = if randomization.enabled {
        Some(randomization.method)
    } else {
        None
    };

    match method {
        None | Some(RandomizationMethod::Block) => {
            for rep in 1..=repetitions {
                let mut block: Vec<&String> = conditions.iter().collect();
                if method.is_some() {
                    block.shuffle(&mut rng);
                }
                for id in block {
                    trials.push(TrialRecord {
                        trial_number: trials.len() + 1,
                        condition_id: id.clone(),
                        repetition: rep,
                        block_number: Some(rep),
                    });
                }
            }
        }
        Some(RandomizationMethod::Trial) => {
            let mut pool: Vec<(&String, u32)> = (1..=repetitions)
                .flat_map(|rep| conditions.iter().map(move |id| (id, rep)))
                .collect();
            pool.shuffle(&mut rng);
            for (id, rep) in pool {
                trials.push(TrialRecord {
                    trial_number: trials.len() + 1,
                    condition_id: id.clone(),
                    repetition: rep,
                    block_number: None,
                });
            }
        }
    }

    trials
}
