pub mod blocks;
pub mod builder;
pub mod darknet;
pub mod yolo;

use burn::tensor::backend::Backend;

pub use builder::{BuiltModules, Layer, ModuleBuilder, build_modules};
pub use darknet::{Darknet, Detections};
pub use yolo::{YoloLayer, YoloOutput};

/// Whether detection heads return raw logits (`Train`) or decoded boxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Infer,
}

impl Mode {
    /// `Train` on autodiff backends, `Infer` otherwise.
    pub fn from_backend<B: Backend>() -> Self {
        if B::ad_enabled() {
            Mode::Train
        } else {
            Mode::Infer
        }
    }
}
