//! Quickstart example: load settings, configure logging and defend one round

use ndarray::Array1;
use qora_defense::logging;
use qora_defense::{AuxiliaryInfo, Contribution, Defender, Payload, Settings, WeightedMean};

fn update(values: [f32; 3]) -> Payload {
    let mut p = Payload::new();
    p.insert(
        "layer.weight".to_string(),
        Array1::from(values.to_vec()).into_dyn(),
    );
    p
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::new("configs/defense.toml")?;
    logging::configure(&settings.log)?;

    println!("Qora-Defense Quickstart Demo\n");

    let defender = Defender::new(&settings.defense)?;
    println!(
        "Defense: {}\n",
        defender.active_strategy_name().unwrap_or("none")
    );

    println!("Simulating 10 clients (7 honest, 3 Byzantine)...\n");

    // 7 honest clients with similar updates
    let mut batch = vec![Contribution::new(1.0, update([1.0, 2.0, 3.0])); 7];

    // 3 Byzantine attackers with extreme values
    batch.extend(vec![
        Contribution::new(1.0, update([100.0, 200.0, 300.0]));
        3
    ]);

    let global = update([0.0, 0.0, 0.0]);
    let aux = AuxiliaryInfo::none().with_global_model(&global).with_round(1);
    let result = defender.defend(&batch, &WeightedMean, &aux)?;

    println!("Aggregation complete!");
    println!("   Result: {:?}", result["layer.weight"]);
    println!("   Expected (close to honest mean): [1.0, 2.0, 3.0]");
    Ok(())
}
