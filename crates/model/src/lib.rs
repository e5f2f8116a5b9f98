pub mod config;
pub mod model;

pub use config::{MlpConfig, OutputHead};
pub use model::Mlp;
