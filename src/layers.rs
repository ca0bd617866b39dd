use std::fmt;

/// Layer types understood by the darknet graph builder.
///
/// Each variant corresponds to a `[section]` tag of a darknet cfg file. The
/// builder dispatches on this enum once, when the graph is assembled, and the
/// executor dispatches on the built layer; no other code compares type strings.
///
/// Relevant excerpt from
///
/// “YOLOv3: An Incremental Improvement”
/// Authors: Joseph Redmon, Ali Farhadi
/// Link (official): https://arxiv.org/abs/1804.02767
///
/// - Redmon et al. - Pg 2
///
/// Our system extracts features from those scales using a similar concept to
/// feature pyramid networks. From our base feature extractor we add several
/// convolutional layers. The last of these predicts a 3-d tensor encoding
/// bounding box, objectness, and class predictions.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerKind {
    /// `[convolutional]`: conv with optional batch-norm and activation.
    Convolutional,
    /// `[d-convolutional]`: dilated conv, usually sharing weights with an earlier conv.
    DilatedConvolutional,
    /// `[maxpool]`
    MaxPool,
    /// `[upsample]`, nearest neighbour.
    Upsample,
    /// `[se]`: squeeze and excitation channel gate.
    SqueezeExcite,
    /// `[route]`: passthrough or channel concatenation of earlier outputs.
    Route,
    /// `[shortcut]`: residual sum with an earlier output.
    Shortcut,
    /// `[reorg3d]`: marker only, the route repair performs the downsampling.
    Reorg3d,
    /// `[yolo]` detection head.
    Yolo,
    /// Anything else, kept so the layer count stays aligned with the cfg.
    Unknown(String),
}

impl LayerKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "convolutional" => LayerKind::Convolutional,
            "d-convolutional" => LayerKind::DilatedConvolutional,
            "maxpool" => LayerKind::MaxPool,
            "upsample" => LayerKind::Upsample,
            "se" => LayerKind::SqueezeExcite,
            "route" => LayerKind::Route,
            "shortcut" => LayerKind::Shortcut,
            "reorg3d" => LayerKind::Reorg3d,
            "yolo" => LayerKind::Yolo,
            other => LayerKind::Unknown(other.to_string()),
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            LayerKind::Convolutional => "convolutional",
            LayerKind::DilatedConvolutional => "d-convolutional",
            LayerKind::MaxPool => "maxpool",
            LayerKind::Upsample => "upsample",
            LayerKind::SqueezeExcite => "se",
            LayerKind::Route => "route",
            LayerKind::Shortcut => "shortcut",
            LayerKind::Reorg3d => "reorg3d",
            LayerKind::Yolo => "yolo",
            LayerKind::Unknown(tag) => tag,
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_round_trip() {
        for tag in [
            "convolutional",
            "d-convolutional",
            "maxpool",
            "upsample",
            "se",
            "route",
            "shortcut",
            "reorg3d",
            "yolo",
        ] {
            let kind = LayerKind::from_tag(tag);
            assert!(!matches!(kind, LayerKind::Unknown(_)));
            assert_eq!(kind.tag(), tag);
        }
    }

    #[test]
    fn test_unknown_tag_is_preserved() {
        let kind = LayerKind::from_tag("local");
        assert_eq!(kind, LayerKind::Unknown("local".into()));
        assert_eq!(kind.to_string(), "local");
    }
}
