use clap::Parser;
use fisk_trainer::ml::{run_training, TrainArgs};
use fisk_trainer::model::TrainingSettings;

fn main() -> anyhow::Result<()> {
    fisk_trainer::init_tracing();
    let args = TrainArgs::parse();
    let report = run_training(&TrainingSettings::from(args))?;
    println!("Saved: {}", report.export.quantized_model.display());
    println!("Saved: {}", report.labels_path.display());
    Ok(())
}
