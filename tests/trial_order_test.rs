//! Properties of generated trial orders.

use arena_protocol::protocol::{Protocol, Randomization, RandomizationMethod};
use arena_protocol::trial_order::{generate_trial_order, TrialOrder, TrialRecord};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

fn conditions(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("C{}", i)).collect()
}

fn randomized(method: RandomizationMethod) -> Randomization {
    Randomization {
        enabled: true,
        seed: None,
        method,
    }
}

fn counts(trials: &[TrialRecord]) -> BTreeMap<&str, usize> {
    let mut counts = BTreeMap::new();
    for t in trials {
        *counts.entry(t.condition_id.as_str()).or_default() += 1;
    }
    counts
}

#[test]
fn every_method_presents_each_condition_once_per_repetition() {
    let ids = conditions(5);
    let settings = [
        Randomization::default(),
        randomized(RandomizationMethod::Block),
        randomized(RandomizationMethod::Trial),
    ];

    for randomization in &settings {
        for seed in [0_u64, 1, 42, 9_999] {
            let trials = generate_trial_order(&ids, 4, randomization, Some(seed));
            assert_eq!(trials.len(), 20);
            assert!(counts(&trials).values().all(|&c| c == 4));

            let numbers: Vec<usize> = trials.iter().map(|t| t.trial_number).collect();
            assert_eq!(numbers, (1..=20).collect::<Vec<_>>());

            // Each (condition, repetition) pair occurs exactly once
            let pairs: BTreeSet<(&str, u32)> = trials
                .iter()
                .map(|t| (t.condition_id.as_str(), t.repetition))
                .collect();
            assert_eq!(pairs.len(), 20);
        }
    }
}

#[test]
fn block_randomization_keeps_repetitions_contiguous() {
    let ids = conditions(6);
    let trials = generate_trial_order(&ids, 3, &randomized(RandomizationMethod::Block), Some(11));

    for (block, chunk) in trials.chunks(6).enumerate() {
        let expected = block as u32 + 1;
        assert!(chunk.iter().all(|t| t.block_number == Some(expected)));
        assert!(chunk.iter().all(|t| t.repetition == expected));
        let seen: BTreeSet<&str> = chunk.iter().map(|t| t.condition_id.as_str()).collect();
        assert_eq!(seen.len(), 6);
    }
}

#[test]
fn same_seed_same_order_for_both_methods() {
    let ids = conditions(8);
    for method in [RandomizationMethod::Block, RandomizationMethod::Trial] {
        let r = randomized(method);
        assert_eq!(
            generate_trial_order(&ids, 5, &r, Some(2024)),
            generate_trial_order(&ids, 5, &r, Some(2024))
        );
    }
}

#[test]
fn randomized_orders_differ_from_declaration_order_for_some_seed() {
    let ids = conditions(6);
    let sequential = generate_trial_order(&ids, 2, &Randomization::default(), None);
    let r = randomized(RandomizationMethod::Trial);

    let shuffled = (0..10_u64).any(|seed| generate_trial_order(&ids, 2, &r, Some(seed)) != sequential);
    assert!(shuffled);
}

#[test]
fn explicit_seed_is_kept_and_saved_order_round_trips() {
    let ids = conditions(3);
    let r = Randomization {
        enabled: true,
        seed: Some(5),
        method: RandomizationMethod::Block,
    };
    let order = TrialOrder::generate(&ids, 2, &r);
    assert_eq!(order.seed, Some(5));
    assert_eq!(order.method, "block");
    assert_eq!(order.trials, generate_trial_order(&ids, 2, &r, Some(5)));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trial_order.json");
    order.save_json(&path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("\"conditionID\""));
    assert!(text.contains("\"blockNumber\": 1"));
    assert_eq!(TrialOrder::load_json(&path).unwrap(), order);
}

fn replay_protocol(seed: u64) -> Protocol {
    let doc = json!({
        "version": 1,
        "experiment_info": {"name": "replay"},
        "arena_info": {"generation": "G4", "num_rows": 3, "num_cols": 12},
        "experiment_structure": {
            "repetitions": 3,
            "randomization": {"enabled": true, "method": "trial", "seed": seed}
        },
        "block": {"conditions": [
            {"id": "C1", "commands": []},
            {"id": "C2", "commands": []},
            {"id": "C3", "commands": []},
            {"id": "C4", "commands": []}
        ]}
    });
    Protocol::from_document(&doc).unwrap()
}

#[test]
fn logged_seeds_reproduce_the_order_when_written_back_into_the_protocol() {
    let ids = conditions(4);
    let r = randomized(RandomizationMethod::Trial);
    let logged = TrialOrder::generate(&ids, 3, &r);
    let drawn = logged.seed.unwrap();

    for seed in [drawn, u64::MAX, i64::MAX as u64 + 1] {
        let protocol = replay_protocol(seed);
        assert_eq!(protocol.structure.randomization.seed, Some(seed));

        let replayed = TrialOrder::generate(
            &protocol.condition_ids(),
            protocol.structure.repetitions,
            &protocol.structure.randomization,
        );
        assert_eq!(replayed.seed, Some(seed));
        assert_eq!(replayed.trials, generate_trial_order(&ids, 3, &r, Some(seed)));
    }
    assert_eq!(
        TrialOrder::generate(&ids, 3, &replay_protocol(drawn).structure.randomization).trials,
        logged.trials
    );
}
