use clap::Parser;
use fisk_trainer::ml::{run_calibration, CalibrateArgs};
use fisk_trainer::model::CalibrationSettings;

fn main() -> anyhow::Result<()> {
    fisk_trainer::init_tracing();
    let args = CalibrateArgs::parse();
    let report = run_calibration(&CalibrationSettings::from(args))?;
    println!(
        "Updated thresholds: {}",
        serde_json::to_string_pretty(&report.thresholds)?
    );
    Ok(())
}
