use std::collections::HashSet;

use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use dci::{Dci, DciError, QueryConfig};

/// Budgets loose enough that the traversal retrieves the whole population
fn exhaustive() -> QueryConfig {
    QueryConfig {
        num_to_visit: usize::MAX,
        prop_to_retrieve: 1.0,
        ..QueryConfig::default()
    }
}

/// The corners of the unit square, column-major, two rows per point
fn unit_square() -> Vec<f64> {
    vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0]
}

fn brute_force(data: &[f64], dim: usize, query: &[f64], k: usize) -> Vec<u32> {
    let mut ranked = data
        .chunks_exact(dim)
        .enumerate()
        .map(|(id, point)| {
            let dist = query
                .iter()
                .zip(point)
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f64>()
                .sqrt();
            (OrderedFloat(dist), id as u32)
        })
        .collect::<Vec<_>>();
    ranked.sort_unstable();
    ranked.into_iter().take(k).map(|(_, id)| id).collect()
}

#[test]
fn unit_square_single_nearest() {
    let data = unit_square();
    let mut index = Dci::builder()
        .comp_indices(2)
        .simp_indices(2)
        .seed(3)
        .build(2)
        .unwrap();
    index.add(&data, 1, &QueryConfig::default()).unwrap();

    let found = index.query(&[0.1, 0.1], 1, &exhaustive()).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].len(), 1);
    assert_eq!(found[0][0].id.into_inner(), 0);
}

#[test]
#[allow(clippy::float_cmp)]
fn unit_square_two_nearest() {
    let data = unit_square();
    let mut index = Dci::builder()
        .comp_indices(2)
        .simp_indices(2)
        .seed(3)
        .build(2)
        .unwrap();
    index.add(&data, 1, &QueryConfig::default()).unwrap();

    let found = index.query(&[0.9, 0.9], 2, &exhaustive()).unwrap();
    let nearest = &found[0];
    assert_eq!(nearest.len(), 2);
    assert_eq!(nearest[0].id.into_inner(), 3);
    assert!((nearest[0].distance - 0.02f64.sqrt()).abs() < 1e-12);
    // Points 1 and 2 tie at the second position.
    assert!(nearest[1].id.into_inner() == 1 || nearest[1].id.into_inner() == 2);
    assert!((nearest[1].distance - 0.82f64.sqrt()).abs() < 1e-12);
}

#[test]
fn gaussian_recall_with_hierarchy() {
    const SEED: u64 = 87;
    const DIM: usize = 8;
    const NUM_POINTS: usize = 1000;
    const K: usize = 10;

    let mut rng = StdRng::seed_from_u64(SEED);
    let data: Vec<f64> = (0..DIM * NUM_POINTS)
        .map(|_| rng.sample(StandardNormal))
        .collect();

    let config = QueryConfig {
        num_to_visit: usize::MAX,
        num_to_retrieve: 16,
        prop_to_retrieve: 0.25,
        field_of_view: 16,
        ..QueryConfig::default()
    };
    let mut index = Dci::builder()
        .comp_indices(25)
        .simp_indices(3)
        .seed(SEED)
        .build(DIM)
        .unwrap();
    index.add(&data, 2, &config).unwrap();

    let num_queries = 10;
    let queries: Vec<f64> = (0..DIM * num_queries)
        .map(|_| rng.sample(StandardNormal))
        .collect();
    let found = index.query(&queries, K, &config).unwrap();

    let mut hits = 0;
    for (at, neighbors) in found.iter().enumerate() {
        let query = &queries[at * DIM..][..DIM];
        let truth = brute_force(&data, DIM, query, K)
            .into_iter()
            .collect::<HashSet<_>>();
        hits += neighbors
            .iter()
            .filter(|n| truth.contains(&n.id.into_inner()))
            .count();
    }

    let recall = hits as f64 / (num_queries * K) as f64;
    println!("recall@{K} = {recall} (seed = {SEED})");
    assert!(recall >= 0.9, "expected recall of at least 0.9, got {recall}");
}

#[test]
fn blind_mode_respects_visit_budget() {
    const SEED: u64 = 41;
    const DIM: usize = 4;
    const NUM_POINTS: usize = 1000;

    let mut rng = StdRng::seed_from_u64(SEED);
    let data: Vec<f64> = (0..DIM * NUM_POINTS)
        .map(|_| rng.sample(StandardNormal))
        .collect();

    let mut index = Dci::builder()
        .comp_indices(2)
        .simp_indices(2)
        .seed(SEED)
        .build(DIM)
        .unwrap();
    index.add(&data, 1, &exhaustive()).unwrap();

    // Query a point of the dataset itself so at least one candidate is
    // certain to surface within the budget.
    let config = QueryConfig {
        blind: true,
        num_to_visit: 50,
        prop_to_visit: 0.0,
        ..QueryConfig::default()
    };
    let found = index.query(&data[..DIM], 0, &config).unwrap();
    let returned = &found[0];

    assert!(!returned.is_empty());
    assert!(returned.len() <= 50);
    assert_eq!(returned[0].id.into_inner(), 0);
    assert_eq!(returned[0].distance, 0.0);

    let unique = returned
        .iter()
        .map(|n| n.id.into_inner())
        .collect::<HashSet<_>>();
    assert_eq!(unique.len(), returned.len());
    for pair in returned.windows(2) {
        assert!(pair[0].distance <= pair[1].distance);
    }
}

#[test]
fn dimension_mismatch_is_reported() {
    let truncated = [0.0; 8];
    let aligned = [0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0];
    let mut index = Dci::builder().seed(1).build(3).unwrap();

    let err = index
        .add(&truncated, 1, &QueryConfig::default())
        .unwrap_err();
    assert!(matches!(
        err,
        DciError::DimensionMismatch {
            expected: 3,
            actual: 8
        }
    ));

    index.add(&aligned, 1, &QueryConfig::default()).unwrap();
    let err = index.query(&[0.0; 4], 1, &exhaustive()).unwrap_err();
    assert!(matches!(err, DciError::DimensionMismatch { .. }));
}

#[test]
fn query_fails_before_add_and_after_clear() {
    let data = unit_square();
    let mut index = Dci::builder()
        .comp_indices(2)
        .simp_indices(2)
        .seed(5)
        .build(2)
        .unwrap();

    let err = index.query(&[0.5, 0.5], 1, &exhaustive()).unwrap_err();
    assert!(matches!(err, DciError::EmptyIndex));

    index.add(&data, 1, &QueryConfig::default()).unwrap();
    assert_eq!(index.len(), 4);
    index.query(&[0.5, 0.5], 1, &exhaustive()).unwrap();

    index.clear();
    assert!(index.is_empty());
    let err = index.query(&[0.5, 0.5], 1, &exhaustive()).unwrap_err();
    assert!(matches!(err, DciError::EmptyIndex));
}

#[test]
fn invalid_budgets_are_rejected() {
    let data = unit_square();
    let mut index = Dci::builder()
        .comp_indices(2)
        .simp_indices(2)
        .seed(5)
        .build(2)
        .unwrap();
    index.add(&data, 1, &QueryConfig::default()).unwrap();

    let no_retrieval = QueryConfig {
        num_to_retrieve: 0,
        prop_to_retrieve: 0.0,
        ..QueryConfig::default()
    };
    let err = index.query(&[0.5, 0.5], 1, &no_retrieval).unwrap_err();
    assert!(matches!(err, DciError::InvalidConfig(_)));

    // The same thresholds are fine once blind disables retrieval tracking.
    let blind = QueryConfig {
        blind: true,
        num_to_visit: 4,
        ..no_retrieval
    };
    index.query(&[0.5, 0.5], 1, &blind).unwrap();

    assert!(matches!(
        Dci::builder().comp_indices(0).build(2).unwrap_err(),
        DciError::InvalidConfig(_)
    ));
}

#[test]
fn queries_are_deterministic_across_indices() {
    const SEED: u64 = 17;
    const DIM: usize = 6;

    let mut rng = StdRng::seed_from_u64(SEED);
    let data: Vec<f64> = (0..DIM * 300).map(|_| rng.sample(StandardNormal)).collect();
    let query: Vec<f64> = (0..DIM).map(|_| rng.sample(StandardNormal)).collect();

    let build = || {
        let mut index = Dci::builder()
            .comp_indices(4)
            .simp_indices(2)
            .seed(SEED)
            .build(DIM)
            .unwrap();
        index.add(&data, 2, &QueryConfig::default()).unwrap();
        index
    };

    let first = build();
    let second = build();
    let once = first.query(&query, 5, &QueryConfig::default()).unwrap();
    let again = first.query(&query, 5, &QueryConfig::default()).unwrap();
    let other = second.query(&query, 5, &QueryConfig::default()).unwrap();

    assert_eq!(once, again);
    assert_eq!(once, other);
}

#[test]
fn reset_then_add_reproduces_results() {
    const SEED: u64 = 29;
    const DIM: usize = 5;

    let mut rng = StdRng::seed_from_u64(SEED);
    let data: Vec<f64> = (0..DIM * 200).map(|_| rng.sample(StandardNormal)).collect();
    let query: Vec<f64> = (0..DIM).map(|_| rng.sample(StandardNormal)).collect();

    let mut index = Dci::builder()
        .comp_indices(3)
        .simp_indices(3)
        .seed(SEED)
        .build(DIM)
        .unwrap();
    index.add(&data, 2, &QueryConfig::default()).unwrap();
    let before = index.query(&query, 8, &QueryConfig::default()).unwrap();

    index.reset();
    index.add(&data, 2, &QueryConfig::default()).unwrap();
    let after = index.query(&query, 8, &QueryConfig::default()).unwrap();

    assert_eq!(before, after);
}

#[test]
fn hierarchical_exhaustive_matches_brute_force() {
    const SEED: u64 = 53;
    const DIM: usize = 4;
    const NUM_POINTS: usize = 200;
    const K: usize = 5;

    let mut rng = StdRng::seed_from_u64(SEED);
    let data: Vec<f64> = (0..DIM * NUM_POINTS)
        .map(|_| rng.sample(StandardNormal))
        .collect();

    // A field of view covering the whole coarse level makes the hierarchical
    // walk equivalent to a flat exhaustive traversal.
    let config = QueryConfig {
        num_to_visit: usize::MAX,
        prop_to_retrieve: 1.0,
        field_of_view: usize::MAX,
        ..QueryConfig::default()
    };
    let mut index = Dci::builder()
        .comp_indices(5)
        .simp_indices(2)
        .seed(SEED)
        .build(DIM)
        .unwrap();
    index.add(&data, 2, &config).unwrap();

    for _ in 0..5 {
        let query: Vec<f64> = (0..DIM).map(|_| rng.sample(StandardNormal)).collect();
        let found = index.query(&query, K, &config).unwrap();
        let ids = found[0]
            .iter()
            .map(|n| n.id.into_inner())
            .collect::<Vec<_>>();
        assert_eq!(ids, brute_force(&data, DIM, &query, K));
    }
}
