//! Fish classifier training, export and per-class threshold calibration.

pub mod calibration;
pub mod error;
pub mod ml;
pub mod model;

pub use calibration::{CalibrationPolicy, ConfidenceCollector, PerClassThresholds};
pub use error::{FiskError, FiskResult};

#[cfg(feature = "wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;

pub type TrainAutodiff = burn::backend::Autodiff<TrainBackend>;

/// Install the fmt subscriber; `RUST_LOG` overrides the default `info` level.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init();
}
