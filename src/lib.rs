#![recursion_limit = "256"]

pub mod cfg;
pub mod config;
pub mod error;
pub mod grid;
pub mod layers;
pub mod models;

pub use cfg::{LayerSpec, load_cfg, parse_cfg};
pub use config::{Architecture, DarknetConfig, Hyperparameters};
pub use error::{ModelError, Result};
pub use models::{Darknet, Detections, Mode};
