use bencher::{benchmark_group, benchmark_main, Bencher};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use dci::{Dci, QueryConfig};

benchmark_main!(benches);
benchmark_group!(benches, build_two_levels, query_ten_nearest);

const SEED: u64 = 123456789;
const DIM: usize = 16;
const NUM_POINTS: usize = 1024;

fn dataset() -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(SEED);
    (0..DIM * NUM_POINTS)
        .map(|_| rng.gen_range(-1.0..1.0))
        .collect()
}

fn build_two_levels(bench: &mut Bencher) {
    let data = dataset();
    bench.iter(|| {
        let mut index = Dci::builder()
            .comp_indices(8)
            .simp_indices(2)
            .seed(SEED)
            .build(DIM)
            .unwrap();
        index.add(&data, 2, &QueryConfig::default()).unwrap();
        index.len()
    })
}

fn query_ten_nearest(bench: &mut Bencher) {
    let data = dataset();
    let mut index = Dci::builder()
        .comp_indices(8)
        .simp_indices(2)
        .seed(SEED)
        .build(DIM)
        .unwrap();
    index.add(&data, 2, &QueryConfig::default()).unwrap();

    let mut rng = StdRng::seed_from_u64(SEED + 1);
    let query: Vec<f64> = (0..DIM).map(|_| rng.gen_range(-1.0..1.0)).collect();
    bench.iter(|| index.query(&query, 10, &QueryConfig::default()).unwrap().len())
}
