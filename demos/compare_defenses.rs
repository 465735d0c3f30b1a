//! Compare every registered defense under the same attack

use ndarray::array;
use qora_defense::{
    AuxiliaryInfo, BaseAggregator, Contribution, Defender, DefenseSettings, DefenseType, Payload,
    TrimPolicy, WeightedMean,
};

fn update(value: f32) -> Payload {
    let mut p = Payload::new();
    p.insert("w".to_string(), array![value].into_dyn());
    p
}

fn settings_for(defense_type: DefenseType) -> DefenseSettings {
    DefenseSettings {
        norm_bound: Some(1.0),
        robust_threshold: Some(8),
        byzantine_client_num: Some(3),
        tau: Some(1.0),
        bucket_size: Some(2),
        trim_fraction: Some(0.3),
        trim_policy: Some(TrimPolicy::Coordinate),
        stddev: Some(0.01),
        epsilon: Some(0.9),
        delta: Some(1e-5),
        seed: Some(42),
        ..DefenseSettings::enabled(defense_type.as_str())
    }
}

fn main() {
    println!("Comparing Defenses\n");
    println!("Scenario: 7 honest clients (value=1.0), 3 Byzantine (value=100.0)\n");

    let mut batch = vec![Contribution::new(1.0, update(1.0)); 7];
    batch.extend(vec![Contribution::new(1.0, update(100.0)); 3]);

    let global = update(0.8);
    let aux = AuxiliaryInfo::none().with_global_model(&global);

    match WeightedMean.aggregate(&batch) {
        Ok(result) => println!(
            "{:<25} Result: {:.2}  CORRUPTED",
            "weighted mean",
            result["w"][[0]]
        ),
        Err(e) => println!("{:<25} failed: {}", "weighted mean", e),
    }

    for defense_type in DefenseType::ALL {
        let outcome = Defender::new(&settings_for(defense_type))
            .and_then(|defender| defender.defend(&batch, &WeightedMean, &aux));

        match outcome {
            Ok(result) => {
                let value = result["w"][[0]];
                let status = if (value - 1.0).abs() < 0.5 {
                    "ROBUST"
                } else {
                    "CORRUPTED"
                };
                println!("{:<25} Result: {:.2}  {}", defense_type, value, status);
            }
            Err(e) => println!("{:<25} failed: {}", defense_type, e),
        }
    }
}
