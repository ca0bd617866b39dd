use std::{fmt, str::FromStr};

use argh::FromArgs;
use burn::config::Config;

use crate::error::ModelError;

/// Hyperparameters consumed by the detection heads.
///
/// `context_factor` corrects the height/width asymmetry of boxes that were
/// labelled with extra context around the object. A value of `1.0` disables the
/// correction.
#[derive(Config, Debug)]
pub struct Hyperparameters {
    #[config(default = 1.0)]
    pub context_factor: f64,
}

/// Model level settings that are not part of the cfg layer list.
#[derive(Config, Debug)]
pub struct DarknetConfig {
    #[config(default = "String::from(\"default\")")]
    pub arc: String,
    pub hyp: Hyperparameters,
}

/// Activation family used by the detection heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArcFamily {
    /// Independent sigmoid on objectness and every class score.
    Default,
    /// Sigmoid on class scores, objectness fixed to 1.
    Bce,
    /// Softmax across objectness and class scores, objectness fixed to 1.
    Ce,
}

/// Architecture variant selecting the detection head activation convention and
/// the bias initialization of the convolution feeding each head.
///
/// Relevant excerpt from
///
/// “Focal Loss for Dense Object Detection”
/// Authors: Tsung-Yi Lin, Priya Goyal, Ross Girshick, Kaiming He, Piotr Dollár
/// Link (official): https://arxiv.org/abs/1708.02002
///
/// Initialization - Lin et al. - Pg 4
///
/// For the final conv layer of the classification subnet, we set the bias
/// initialization to b = − log((1 − π)/π), where π specifies that at the start
/// of training every anchor should be labeled as foreground with confidence of
/// ∼π.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    Default,
    DefaultPw,
    FocalDefault,
    FocalDefaultPw,
    UnifiedBce,
    UnifiedFocalBce,
    UnifiedFocalBcePw,
    UnifiedCe,
    UnifiedFocalCe,
}

impl Architecture {
    pub fn as_list() -> Vec<Architecture> {
        vec![
            Architecture::Default,
            Architecture::DefaultPw,
            Architecture::FocalDefault,
            Architecture::FocalDefaultPw,
            Architecture::UnifiedBce,
            Architecture::UnifiedFocalBce,
            Architecture::UnifiedFocalBcePw,
            Architecture::UnifiedCe,
            Architecture::UnifiedFocalCe,
        ]
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Architecture::Default => "default",
            Architecture::DefaultPw => "defaultpw",
            Architecture::FocalDefault => "Fdefault",
            Architecture::FocalDefaultPw => "Fdefaultpw",
            Architecture::UnifiedBce => "uBCE",
            Architecture::UnifiedFocalBce => "uFBCE",
            Architecture::UnifiedFocalBcePw => "uFBCEpw",
            Architecture::UnifiedCe => "uCE",
            Architecture::UnifiedFocalCe => "uFCE",
        }
    }

    pub fn family(&self) -> ArcFamily {
        match self {
            Architecture::Default | Architecture::DefaultPw | Architecture::FocalDefault | Architecture::FocalDefaultPw => {
                ArcFamily::Default
            }
            Architecture::UnifiedBce | Architecture::UnifiedFocalBce | Architecture::UnifiedFocalBcePw => ArcFamily::Bce,
            Architecture::UnifiedCe | Architecture::UnifiedFocalCe => ArcFamily::Ce,
        }
    }

    /// Target `(objectness, class)` bias means for the convolution preceding a
    /// detection head.
    pub fn bias_targets(&self) -> (f32, f32) {
        match self {
            Architecture::Default => (-5.5, -4.0),
            Architecture::DefaultPw | Architecture::FocalDefaultPw => (-4.0, -3.6),
            Architecture::FocalDefault => (-2.1, -1.8),
            Architecture::UnifiedBce => (0.0, -8.5),
            Architecture::UnifiedFocalBce | Architecture::UnifiedFocalBcePw => (0.0, -6.5),
            Architecture::UnifiedCe => (10.0, -0.1),
            Architecture::UnifiedFocalCe => (7.7, -1.1),
        }
    }
}

impl FromStr for Architecture {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Architecture::as_list()
            .into_iter()
            .find(|arc| arc.tag() == s)
            .ok_or_else(|| ModelError::UnknownArc(s.to_string()))
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(FromArgs, PartialEq, Debug)]
/// Top-level command.
pub struct YoloCmd {
    #[argh(subcommand)]
    pub commands: Commands,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
pub enum Commands {
    Inspect(SubCommandInspect),
}

#[derive(FromArgs, PartialEq, Debug)]
/// Build a model from a darknet cfg and print its layers and output shapes
#[argh(subcommand, name = "inspect")]
pub struct SubCommandInspect {
    #[argh(option)]
    /// darknet cfg file describing the network
    pub c: String,
    #[argh(option)]
    /// square input size in pixels, defaults to the [net] width or 416
    pub s: Option<usize>,
    #[argh(option)]
    /// architecture variant (default, uBCE, uCE, ...)
    pub arc: Option<String>,
    #[argh(option)]
    /// json file holding the detection head hyperparameters
    pub hyp: Option<String>,
    #[argh(option)]
    /// checkpoint to load before running
    pub w: Option<String>,
    #[argh(switch)]
    /// fold batch-norms into the preceding convolutions
    pub fuse: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arc_tags_round_trip() {
        for arc in Architecture::as_list() {
            assert_eq!(arc.tag().parse::<Architecture>().unwrap(), arc);
        }
        assert!(matches!(
            "yolo".parse::<Architecture>(),
            Err(ModelError::UnknownArc(_))
        ));
    }

    #[test]
    fn test_arc_families() {
        assert_eq!(Architecture::Default.family(), ArcFamily::Default);
        assert_eq!(Architecture::FocalDefaultPw.family(), ArcFamily::Default);
        assert_eq!(Architecture::UnifiedBce.family(), ArcFamily::Bce);
        assert_eq!(Architecture::UnifiedFocalBcePw.family(), ArcFamily::Bce);
        assert_eq!(Architecture::UnifiedCe.family(), ArcFamily::Ce);
        assert_eq!(Architecture::UnifiedFocalCe.family(), ArcFamily::Ce);
    }

    #[test]
    fn test_default_bias_targets() {
        assert_eq!(Architecture::Default.bias_targets(), (-5.5, -4.0));
        assert_eq!(Architecture::UnifiedCe.bias_targets(), (10.0, -0.1));
    }

    #[test]
    fn test_hyperparameter_defaults() {
        let hyp = Hyperparameters::new();
        assert_eq!(hyp.context_factor, 1.0);
        let hyp = hyp.with_context_factor(1.5);
        assert_eq!(hyp.context_factor, 1.5);

        let cfg = DarknetConfig::new(Hyperparameters::new());
        assert_eq!(cfg.arc, "default");
    }
}
