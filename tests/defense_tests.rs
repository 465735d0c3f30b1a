//! Integration tests for Qora-Defense dispatch and defenses

use std::cell::RefCell;

use ndarray::{ArrayD, IxDyn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use qora_defense::aggregation::{partition, weighted_mean};
use qora_defense::defenses::geometric_median::weiszfeld;
use qora_defense::defenses::norm_diff_clipping::clip_towards;
use qora_defense::math::{payload, payload_l2_norm};
use qora_defense::{
    AuxiliaryInfo, BaseAggregator, CClip, Contribution, Defender, DefenseError, DefenseSettings,
    DefenseType, Krum, Payload, PayloadLayout, Settings, WeightedMean,
};

/// A two-layer model: a 2x3 weight matrix and a bias vector of 3.
fn model(rng: &mut ChaCha20Rng, scale: f32) -> Payload {
    let mut p = Payload::new();
    p.insert(
        "fc.weight".to_string(),
        ArrayD::from_shape_fn(IxDyn(&[2, 3]), |_| rng.gen_range(-scale..scale)),
    );
    p.insert(
        "fc.bias".to_string(),
        ArrayD::from_shape_fn(IxDyn(&[3]), |_| rng.gen_range(-scale..scale)),
    );
    p
}

fn filled(value: f32) -> Payload {
    let mut p = Payload::new();
    p.insert(
        "fc.weight".to_string(),
        ArrayD::from_elem(IxDyn(&[2, 3]), value),
    );
    p.insert("fc.bias".to_string(), ArrayD::from_elem(IxDyn(&[3]), value));
    p
}

fn fake_model_list(n: usize, seed: u64) -> Vec<Contribution> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let weight = rng.gen_range(10.0..100.0);
            Contribution::new(weight, model(&mut rng, 1.0))
        })
        .collect()
}

fn assert_close(a: &Payload, b: &Payload, tol: f32) {
    assert_eq!(a.keys().collect::<Vec<_>>(), b.keys().collect::<Vec<_>>());
    for (name, x) in a {
        let y = &b[name];
        assert_eq!(x.shape(), y.shape(), "shape of {}", name);
        for (u, v) in x.iter().zip(y.iter()) {
            assert!((u - v).abs() <= tol, "{}: {} vs {}", name, u, v);
        }
    }
}

/// Settings carrying every parameter any defense needs.
fn full_settings(defense_type: DefenseType) -> DefenseSettings {
    DefenseSettings {
        norm_bound: Some(10.0),
        robust_threshold: Some(2),
        server_learning_rate: Some(1.0),
        byzantine_client_num: Some(1),
        krum_param_m: Some(1),
        tau: Some(10.0),
        bucket_size: Some(3),
        trim_fraction: Some(0.2),
        alpha: Some(1.0),
        stddev: Some(0.0),
        epsilon: Some(1e12),
        delta: Some(1e-5),
        seed: Some(7),
        ..DefenseSettings::enabled(defense_type.as_str())
    }
}

#[test]
fn test_consensus_is_fixed_point_for_every_defense() {
    let mut rng = ChaCha20Rng::seed_from_u64(1);
    let consensus = model(&mut rng, 0.5);
    let global = filled(0.0);
    let batch = vec![Contribution::new(1.0, consensus.clone()); 6];
    let aux = AuxiliaryInfo::none().with_global_model(&global).with_round(3);

    for defense_type in DefenseType::ALL {
        let defender = Defender::new(&full_settings(defense_type)).unwrap();
        let result = defender.defend(&batch, &WeightedMean, &aux).unwrap();
        assert_close(&result, &consensus, 1e-4);
    }
}

#[test]
fn test_krum_never_selects_outlier() {
    let mut rng = ChaCha20Rng::seed_from_u64(2);
    let common = model(&mut rng, 1.0);
    let outlier = filled(1e4);

    let mut batch = vec![Contribution::new(1.0, outlier.clone()); 5];
    batch.extend(vec![Contribution::new(1.0, common.clone()); 15]);

    let settings = DefenseSettings {
        byzantine_client_num: Some(5),
        client_num_per_round: Some(20),
        ..DefenseSettings::enabled("krum")
    };
    let defender = Defender::new(&settings).unwrap();
    let result = defender
        .defend(&batch, &WeightedMean, &AuxiliaryInfo::none())
        .unwrap();
    assert_eq!(result, common);
}

#[test]
fn test_geometric_median_converges_on_bounded_batch() {
    let batch = fake_model_list(15, 3);
    let layout = PayloadLayout::of_batch(&batch).unwrap();
    let points: Vec<_> = batch
        .iter()
        .map(|c| layout.flatten(&c.payload).unwrap())
        .collect();
    let alphas: Vec<f64> = batch.iter().map(|c| f64::from(c.weight)).collect();

    let estimate = weiszfeld(&points, &alphas, 1000, 1e-4).unwrap();
    assert!(estimate.converged);
    assert!(estimate.iterations <= 1000);
}

#[test]
fn test_geometric_median_symmetric_batch() {
    let mut rng = ChaCha20Rng::seed_from_u64(4);
    let center = model(&mut rng, 1.0);
    let mut batch = vec![Contribution::new(1.0, center.clone())];
    for _ in 0..4 {
        let offset = model(&mut rng, 2.0);
        batch.push(Contribution::new(1.0, payload::add(&center, &offset).unwrap()));
        batch.push(Contribution::new(1.0, payload::sub(&center, &offset).unwrap()));
    }

    let settings = DefenseSettings {
        tolerance: Some(1e-6),
        max_iterations: Some(500),
        ..DefenseSettings::enabled("geometric_median")
    };
    let defender = Defender::new(&settings).unwrap();
    let result = defender
        .defend(&batch, &WeightedMean, &AuxiliaryInfo::none())
        .unwrap();
    assert_close(&result, &center, 1e-3);
}

#[test]
fn test_norm_diff_clipping_bounds_delta() {
    let mut rng = ChaCha20Rng::seed_from_u64(5);
    let global = model(&mut rng, 1.0);
    let tau = 0.5;

    for _ in 0..20 {
        let update = model(&mut rng, 1.0);
        let delta = payload::sub(&update, &global).unwrap();
        let clipped = clip_towards(&update, &global, tau).unwrap();
        let clipped_delta = payload::sub(&clipped, &global).unwrap();

        if payload_l2_norm(&delta) > tau {
            assert!((payload_l2_norm(&clipped_delta) - tau).abs() < 1e-4);
        } else {
            assert_eq!(clipped, update);
        }
    }
}

#[test]
fn test_cclip_reference_scenario() {
    let batch = fake_model_list(20, 6);
    let cclip = CClip::new(10.0, 3).unwrap();
    assert_eq!(cclip.bucket_count(20), 7);

    let ranges = partition(20, 3);
    assert_eq!(ranges.iter().filter(|r| r.len() == 3).count(), 6);
    assert_eq!(ranges[6].len(), 2);

    let calls = RefCell::new(Vec::new());
    let recording = |members: &[Contribution]| {
        calls.borrow_mut().push(members.len());
        weighted_mean(members)
    };

    let settings = DefenseSettings {
        tau: Some(10.0),
        bucket_size: Some(3),
        ..DefenseSettings::enabled("cclip")
    };
    let defender = Defender::new(&settings).unwrap();
    let result = defender
        .defend(&batch, &recording, &AuxiliaryInfo::none())
        .unwrap();

    // Seven bucket reductions, then one over the clipped bucket estimates
    assert_eq!(*calls.borrow(), vec![3, 3, 3, 3, 3, 3, 2, 7]);
    let layout = PayloadLayout::of_batch(&batch).unwrap();
    layout.check(&result).unwrap();
    assert_eq!(
        result.keys().collect::<Vec<_>>(),
        batch[0].payload.keys().collect::<Vec<_>>()
    );
}

#[test]
fn test_disabled_defense_is_transparent() {
    let batch = fake_model_list(10, 7);
    let defender = Defender::new(&DefenseSettings::default()).unwrap();
    assert!(!defender.is_enabled());

    let defended = defender
        .defend(&batch, &WeightedMean, &AuxiliaryInfo::none())
        .unwrap();
    let direct = WeightedMean.aggregate(&batch).unwrap();
    assert_eq!(defended, direct);
}

#[test]
fn test_krum_configuration_error_before_any_work() {
    let err = Krum::new(2, 1, Some(4)).unwrap_err();
    assert!(matches!(err, DefenseError::Config(_)));

    let settings = DefenseSettings {
        byzantine_client_num: Some(2),
        client_num_per_round: Some(4),
        ..DefenseSettings::enabled("krum")
    };
    let mut defender = Defender::disabled();
    assert!(defender.init(&settings).unwrap_err().is_configuration());

    // No aggregation may run while the defense is unbuilt
    let calls = RefCell::new(0usize);
    let counting = |members: &[Contribution]| {
        *calls.borrow_mut() += 1;
        weighted_mean(members)
    };
    let result = defender.defend(&fake_model_list(4, 8), &counting, &AuxiliaryInfo::none());
    assert!(matches!(result, Err(DefenseError::Uninitialized)));
    assert_eq!(*calls.borrow(), 0);
}

#[test]
fn test_inconsistent_batch_rejected() {
    let mut batch = fake_model_list(5, 9);
    batch[2]
        .payload
        .insert("fc.bias".to_string(), ArrayD::zeros(IxDyn(&[4])));

    let defender = Defender::new(&full_settings(DefenseType::GeometricMedian)).unwrap();
    let err = defender
        .defend(&batch, &WeightedMean, &AuxiliaryInfo::none())
        .unwrap_err();
    assert!(err.is_shape_mismatch());
}

#[test]
fn test_settings_file_with_environment_override() {
    std::env::set_var("QORA_DEFENSE__BYZANTINE_CLIENT_NUM", "3");
    let settings = Settings::new("configs/defense.toml").unwrap();
    std::env::remove_var("QORA_DEFENSE__BYZANTINE_CLIENT_NUM");

    assert_eq!(settings.defense.byzantine_client_num, Some(3));
    let defender = Defender::new(&settings.defense).unwrap();
    assert_eq!(defender.active_strategy_name(), Some("krum"));
}

#[test]
fn test_non_finite_contribution_rejected() {
    let mut batch = vec![Contribution::new(1.0, filled(1.0)); 6];
    batch.insert(0, Contribution::new(1.0, filled(f32::NAN)));

    for defense_type in [DefenseType::Krum, DefenseType::GeometricMedian] {
        let defender = Defender::new(&full_settings(defense_type)).unwrap();
        let err = defender
            .defend(&batch, &WeightedMean, &AuxiliaryInfo::none())
            .unwrap_err();
        assert!(matches!(err, DefenseError::NonFiniteValue { index: 0, .. }));
    }
}

#[test]
fn test_cclip_tolerates_zero_weight_bucket() {
    let mut batch = vec![Contribution::new(1.0, filled(1.0)); 3];
    batch.extend(vec![Contribution::new(0.0, filled(-50.0)); 3]);

    let defender = Defender::new(&full_settings(DefenseType::CClip)).unwrap();
    let result = defender
        .defend(&batch, &WeightedMean, &AuxiliaryInfo::none())
        .unwrap();
    assert_close(&result, &filled(1.0), 1e-5);
}

#[test]
fn test_cclip_single_bucket_rejected() {
    let settings = DefenseSettings {
        tau: Some(10.0),
        bucket_size: Some(50),
        ..DefenseSettings::enabled("cclip")
    };
    let defender = Defender::new(&settings).unwrap();
    let err = defender
        .defend(&fake_model_list(2, 10), &WeightedMean, &AuxiliaryInfo::none())
        .unwrap_err();
    assert!(err.is_configuration());
}
