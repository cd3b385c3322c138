//! Benchmarks for the genotype-probability and genome-scan kernels

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::Array2;
use qtl2_rs::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// F2 cross: n individuals, one chromosome with markers every 5 cM and 5% missing calls.
fn f2_cross(n_ind: usize, n_mar: usize, seed: u64) -> Cross {
    let mut rng = StdRng::seed_from_u64(seed);
    let markers: Vec<String> = (0..n_mar).map(|k| format!("m{}", k)).collect();
    let positions: Vec<f64> = (0..n_mar).map(|k| k as f64 * 5.0).collect();
    let gmap = GeneticMap::new(vec![ChromosomeMap::new("1", markers, positions).unwrap()]);

    let calls = Array2::from_shape_fn((n_ind, n_mar), |_| {
        if rng.gen::<f64>() < 0.05 {
            0
        } else {
            rng.gen_range(1..=3u8)
        }
    });
    let ind_ids: Vec<String> = (0..n_ind).map(|i| format!("i{}", i)).collect();
    let pheno = PhenotypeTable::new(
        ind_ids.clone(),
        vec!["y".into(), "z".into()],
        Array2::from_shape_fn((n_ind, 2), |_| rng.gen::<f64>()),
    )
    .unwrap();

    Cross::new(
        CrossType::F2,
        vec!["A".into(), "B".into()],
        ind_ids,
        gmap,
        vec![ChromosomeGenotypes {
            chr: "1".into(),
            calls,
        }],
        pheno,
    )
    .unwrap()
}

fn bench_genoprob(c: &mut Criterion) {
    let mut group = c.benchmark_group("calc_genoprob");
    let cross = f2_cross(200, 40, 42);
    let map = insert_pseudomarkers(
        &cross.gmap,
        &PseudomarkerOptions {
            step: 1.0,
            ..Default::default()
        },
    )
    .unwrap();

    group.bench_function("200ind_40mar_step1", |b| {
        b.iter(|| calc_genoprob(black_box(&cross), &map, &GenoprobOptions::default()))
    });
    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan1");
    let cross = f2_cross(200, 40, 7);
    let map = insert_pseudomarkers(&cross.gmap, &PseudomarkerOptions::default()).unwrap();
    let probs = calc_genoprob(&cross, &map, &GenoprobOptions::default()).unwrap();
    let kinship = calc_kinship(&probs, &KinshipOptions::default()).unwrap();

    group.bench_function("hk_200ind_40pos", |b| {
        b.iter(|| scan1(black_box(&probs), &cross.pheno, None, None, &ScanOptions::default()))
    });
    group.bench_function("lmm_200ind_40pos", |b| {
        b.iter(|| {
            scan1(
                black_box(&probs),
                &cross.pheno,
                Some(&kinship),
                None,
                &ScanOptions::default(),
            )
        })
    });
    group.finish();
}

criterion_group!(benches, bench_genoprob, bench_scan);
criterion_main!(benches);
