//! Q-Transformer - autoregressive multi-action Q-value policies on Burn
//!
//! Observations are encoded into a single state token; a causal transformer
//! then decides one discretized action dimension at a time, reusing its
//! key/value cache between dimensions.
//!
//! ```rust,ignore
//! use burn::backend::NdArray;
//! use qtransformer::{ModelConfig, QTransformer, QTransformerConfig};
//!
//! let device = Default::default();
//! let config = QTransformerConfig::from(&ModelConfig::default());
//! let model: QTransformer<NdArray> = config.init(&device);
//! let actions = model.select_actions(observations);
//! ```

pub mod config;
pub mod loader;
pub mod model;

pub use config::ModelConfig;
pub use loader::{LoadedWeights, WeightLoader};
pub use model::{DecodeState, QTransformer, QTransformerConfig};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global `tracing` subscriber.
///
/// Honors `RUST_LOG`, defaulting to `qtransformer=info`. Later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "qtransformer=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
