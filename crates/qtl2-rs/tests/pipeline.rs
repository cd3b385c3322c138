//! End-to-end checks on simulated backcrosses

use ndarray::Array2;
use qtl2_rs::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Backcross with evenly spaced markers (10 cM apart) on each chromosome.
/// The phenotype is 1.0 for AB at the causal marker plus small noise.
fn simulate(
    n_ind: usize,
    chrs: &[(&str, usize)],
    causal: (&str, usize),
    seed: u64,
) -> Cross {
    let mut rng = StdRng::seed_from_u64(seed);
    let r = MapFunction::Haldane.rec_frac(10.0);

    let ind_ids: Vec<String> = (0..n_ind).map(|i| format!("ind{:03}", i)).collect();
    let mut maps = Vec::new();
    let mut geno = Vec::new();
    let mut qtl_geno = vec![1u8; n_ind];

    for &(chr, n_mar) in chrs {
        let markers: Vec<String> = (0..n_mar).map(|k| format!("{}_m{}", chr, k + 1)).collect();
        let positions: Vec<f64> = (0..n_mar).map(|k| k as f64 * 10.0).collect();
        maps.push(ChromosomeMap::new(chr, markers, positions).unwrap());

        let mut calls = Array2::<u8>::zeros((n_ind, n_mar));
        for i in 0..n_ind {
            let mut g: u8 = if rng.gen::<f64>() < 0.5 { 1 } else { 2 };
            for k in 0..n_mar {
                if k > 0 && rng.gen::<f64>() < r {
                    g = 3 - g;
                }
                calls[(i, k)] = g;
            }
            if chr == causal.0 {
                qtl_geno[i] = calls[(i, causal.1)];
            }
        }
        geno.push(ChromosomeGenotypes {
            chr: chr.to_string(),
            calls,
        });
    }

    let values = Array2::from_shape_fn((n_ind, 1), |(i, _)| {
        let noise = (rng.gen::<f64>() - 0.5) * 0.6;
        if qtl_geno[i] == 2 {
            1.0 + noise
        } else {
            noise
        }
    });
    let pheno = PhenotypeTable::new(ind_ids.clone(), vec!["trait".into()], values).unwrap();

    Cross::new(
        CrossType::BC,
        vec!["A".into(), "B".into()],
        ind_ids,
        GeneticMap::new(maps),
        geno,
        pheno,
    )
    .unwrap()
}

#[test]
fn test_single_chromosome_qtl_detected() {
    let cross = simulate(100, &[("1", 5)], ("1", 2), 2024);
    let map = insert_pseudomarkers(&cross.gmap, &PseudomarkerOptions::default()).unwrap();
    let probs = calc_genoprob(&cross, &map, &GenoprobOptions::default()).unwrap();
    assert!(probs.max_sum_deviation() < 1e-6);

    let scan_opts = ScanOptions {
        cores: 2,
        ..Default::default()
    };
    let scan = scan1(&probs, &cross.pheno, None, None, &scan_opts).unwrap();
    let (chr, marker, _, lod) = scan.max_position(0).unwrap();
    assert_eq!(chr, "1");
    assert!(
        ["1_m2", "1_m3", "1_m4"].contains(&marker),
        "peak at {}",
        marker
    );

    let perm_opts = PermOptions {
        n_perm: 100,
        seed: 1,
        cores: 2,
    };
    let perm = scan1perm(&probs, &cross.pheno, None, None, &scan_opts, &perm_opts, None).unwrap();
    let threshold = perm.thresholds(0.05).unwrap()[0];
    assert!(lod > threshold, "LOD {} below threshold {}", lod, threshold);

    let peaks = find_peaks(
        &scan,
        &Threshold::Single(threshold),
        &PeakOptions {
            drop: Some(1.5),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(peaks.len(), 1);
    assert!(peaks[0].ci_lo.unwrap() <= peaks[0].pos && peaks[0].pos <= peaks[0].ci_hi.unwrap());
}

#[test]
fn test_pseudomarkers_and_effects() {
    let cross = simulate(80, &[("1", 5)], ("1", 2), 7);
    let map = insert_pseudomarkers(
        &cross.gmap,
        &PseudomarkerOptions {
            step: 2.5,
            ..Default::default()
        },
    )
    .unwrap();
    assert!(map.n_positions() > cross.n_markers());

    let probs = calc_genoprob(&cross, &map, &GenoprobOptions::default()).unwrap();
    let scan = scan1(&probs, &cross.pheno, None, None, &ScanOptions::default()).unwrap();
    let (_, _, pos, _) = scan.max_position(0).unwrap();
    assert!((10.0..=30.0).contains(&pos), "peak at {} cM", pos);

    let fit = fit1(&probs, &cross.pheno, 0, "1", "1_m3", None, None, &ScanOptions::default())
        .unwrap();
    let effect = fit.coef[1] - fit.coef[0];
    assert!((effect - 1.0).abs() < 0.25, "effect {}", effect);

    let calls = maxmarg_position(&probs, "1", "1_m3", &MaxmargOptions::default()).unwrap();
    let called = calls.iter().filter(|c| c.is_some()).count();
    assert!(called > 70);
}

#[test]
fn test_loco_lmm_scan() {
    let cross = simulate(60, &[("1", 4), ("2", 4)], ("2", 1), 99);
    let map = insert_pseudomarkers(&cross.gmap, &PseudomarkerOptions::default()).unwrap();
    let probs = calc_genoprob(&cross, &map, &GenoprobOptions::default()).unwrap();
    let kinship = calc_kinship(
        &probs,
        &KinshipOptions {
            kind: KinshipType::Loco,
            ..Default::default()
        },
    )
    .unwrap();

    let scan = scan1(&probs, &cross.pheno, Some(&kinship), None, &ScanOptions::default()).unwrap();
    let hsq = scan.hsq.as_ref().unwrap();
    assert_eq!(hsq.labels, vec!["1", "2"]);
    assert!(hsq.values.iter().all(|h| (0.0..=1.0).contains(h)));

    let (chr, _, _, lod) = scan.max_position(0).unwrap();
    assert_eq!(chr, "2");
    assert!(lod > 5.0);
}
