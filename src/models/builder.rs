use std::collections::BTreeSet;

use burn::{
    module::{Ignored, Module},
    tensor::backend::Backend,
};
use tracing::warn;

use crate::{
    cfg::LayerSpec,
    config::{Architecture, Hyperparameters},
    error::{ModelError, Result},
    layers::LayerKind,
    models::{
        blocks::{ActivationKind, ConvBlock, ConvGeometry, MaxPoolLayer, SqueezeExcite, UpsampleLayer},
        yolo::{YoloLayer, init_head_bias},
    },
};

/// Concatenates (or, with one source, forwards) earlier layer outputs.
#[derive(Module, Clone, Debug)]
pub struct RouteLayer {
    sources: Ignored<Vec<usize>>,
}

impl RouteLayer {
    pub fn sources(&self) -> &[usize] {
        &self.sources.0
    }
}

/// Residual sum of the running tensor and one earlier output.
#[derive(Module, Clone, Debug)]
pub struct ShortcutLayer {
    source: usize,
}

impl ShortcutLayer {
    pub fn source(&self) -> usize {
        self.source
    }
}

/// Placeholder for a cfg section without an executable counterpart. The
/// running tensor passes through unchanged, but the layer's own output can not
/// be referenced by a route or shortcut.
#[derive(Module, Clone, Debug)]
pub struct UnsupportedLayer {
    kind: Ignored<String>,
}

impl UnsupportedLayer {
    pub fn kind(&self) -> &str {
        &self.kind.0
    }
}

#[derive(Module, Debug)]
pub enum Layer<B: Backend> {
    Conv(ConvBlock<B>),
    MaxPool(MaxPoolLayer),
    Upsample(UpsampleLayer),
    SqueezeExcite(SqueezeExcite<B>),
    Route(RouteLayer),
    Shortcut(ShortcutLayer),
    Yolo(YoloLayer<B>),
    Unsupported(UnsupportedLayer),
}

impl<B: Backend> Layer<B> {
    pub fn name(&self) -> &str {
        match self {
            Layer::Conv(block) if block.weight_from().is_some() => "conv (shared)",
            Layer::Conv(_) => "conv",
            Layer::MaxPool(_) => "maxpool",
            Layer::Upsample(_) => "upsample",
            Layer::SqueezeExcite(_) => "se",
            Layer::Route(_) => "route",
            Layer::Shortcut(_) => "shortcut",
            Layer::Yolo(_) => "yolo",
            Layer::Unsupported(inert) => inert.kind(),
        }
    }
}

/// Everything the builder derives from a cfg: the executable layers plus the
/// bookkeeping the executor needs to wire them together.
#[derive(Debug)]
pub struct BuiltModules<B: Backend> {
    pub layers: Vec<Layer<B>>,
    /// Output channels, `[input channels, layer 0, layer 1, ...]`.
    pub output_filters: Vec<usize>,
    /// Layers whose outputs are referenced by a later route or shortcut.
    pub retained: BTreeSet<usize>,
    /// Indices of the detection heads, in head order.
    pub yolo_layers: Vec<usize>,
    /// Layers whose convolution weights are borrowed by a later layer.
    pub shared_weights: BTreeSet<usize>,
}

/// Turns parsed layer specs into burn modules.
///
/// `specs[0]` must be the `[net]` record; layer `i` of the built graph is
/// `specs[i + 1]`.
#[derive(Debug, Clone)]
pub struct ModuleBuilder {
    arc: Architecture,
    hyp: Hyperparameters,
    leaky: ActivationKind,
    dilated_leaky: ActivationKind,
}

impl ModuleBuilder {
    pub fn new(arc: Architecture, hyp: Hyperparameters) -> Self {
        Self {
            arc,
            hyp,
            leaky: ActivationKind::PRelu,
            dilated_leaky: ActivationKind::Leaky,
        }
    }

    pub fn arc(&self) -> Architecture {
        self.arc
    }

    /// Activation instantiated for `activation=leaky` on plain convolutions.
    pub fn with_leaky(mut self, kind: ActivationKind) -> Self {
        self.leaky = kind;
        self
    }

    /// Activation instantiated for `activation=leaky` on dilated convolutions.
    pub fn with_dilated_leaky(mut self, kind: ActivationKind) -> Self {
        self.dilated_leaky = kind;
        self
    }

    pub fn build<B: Backend>(&self, specs: &[LayerSpec], device: &B::Device) -> Result<BuiltModules<B>> {
        if !(self.hyp.context_factor > 0.0) {
            return Err(ModelError::config(
                0,
                "net",
                format!("context_factor must be positive, found {}", self.hyp.context_factor),
            ));
        }

        let (net, layer_specs) = specs
            .split_first()
            .ok_or_else(|| ModelError::config(0, "net", "empty layer list"))?;

        let channels = net
            .parse_or::<usize>("channels", 3)
            .map_err(|message| ModelError::config(0, net.kind(), message))?;

        let mut built = BuiltModules {
            layers: Vec::with_capacity(layer_specs.len()),
            output_filters: vec![channels],
            retained: BTreeSet::new(),
            yolo_layers: Vec::new(),
            shared_weights: BTreeSet::new(),
        };

        for (i, spec) in layer_specs.iter().enumerate() {
            let kind = LayerKind::from_tag(spec.kind());
            let err = |message: String| ModelError::config(i, spec.kind(), message);
            let in_filters = built.output_filters[i];

            let (layer, filters) = match &kind {
                LayerKind::Convolutional | LayerKind::DilatedConvolutional => {
                    let block = self
                        .conv_block::<B>(i, spec, &kind, in_filters, &built, device)
                        .map_err(err)?;
                    if let Some(source) = block.weight_from() {
                        built.shared_weights.insert(source);
                    }
                    let filters = block.geometry().filters;
                    (Layer::Conv(block), filters)
                }
                LayerKind::MaxPool => {
                    let size = spec.parse::<usize>("size").map_err(err)?;
                    let stride = spec.parse_or::<usize>("stride", 1).map_err(err)?;
                    if size == 0 || stride == 0 {
                        return Err(err("maxpool size and stride must be positive".into()));
                    }
                    (Layer::MaxPool(MaxPoolLayer::new(size, stride)), in_filters)
                }
                LayerKind::Upsample => {
                    let stride = spec.parse::<usize>("stride").map_err(err)?;
                    if stride == 0 {
                        return Err(err("upsample stride must be positive".into()));
                    }
                    (Layer::Upsample(UpsampleLayer::new(stride)), in_filters)
                }
                LayerKind::SqueezeExcite => {
                    let channels = spec.parse_or::<usize>("channels", in_filters).map_err(err)?;
                    if channels != in_filters {
                        return Err(err(format!(
                            "se gates {channels} channels but its input has {in_filters}"
                        )));
                    }
                    (Layer::SqueezeExcite(SqueezeExcite::new(channels, device)), in_filters)
                }
                LayerKind::Route => {
                    let sources: Vec<usize> = spec
                        .list::<isize>("layers")
                        .and_then(|raw| {
                            if raw.is_empty() {
                                return Err("route lists no layers".to_string());
                            }
                            raw.into_iter().map(|idx| resolve_source(i, idx)).collect()
                        })
                        .map_err(err)?;

                    let filters = sources.iter().map(|&s| built.output_filters[s + 1]).sum::<usize>();
                    built.retained.extend(sources.iter().copied());

                    (
                        Layer::Route(RouteLayer {
                            sources: Ignored(sources),
                        }),
                        filters,
                    )
                }
                LayerKind::Shortcut => {
                    let source = spec
                        .parse::<isize>("from")
                        .and_then(|idx| resolve_source(i, idx))
                        .map_err(err)?;

                    let filters = built.output_filters[source + 1];
                    if filters != in_filters {
                        return Err(err(format!(
                            "shortcut adds {filters} channels from layer {source} to {in_filters}"
                        )));
                    }
                    built.retained.insert(source);

                    (Layer::Shortcut(ShortcutLayer { source }), filters)
                }
                LayerKind::Yolo => {
                    // a channel mismatch surfaces here as a bias warning and
                    // as a shape error once the head runs
                    let head = self.yolo_layer::<B>(spec, built.yolo_layers.len()).map_err(err)?;

                    let previous = i.checked_sub(1).and_then(|p| built.layers.get_mut(p));
                    let conv = match previous {
                        Some(Layer::Conv(block)) => block.conv.as_mut(),
                        _ => None,
                    };
                    if let Err(e) =
                        init_head_bias(conv, head.num_anchors(), head.num_classes(), self.arc)
                    {
                        warn!("yolo layer {i}: skipping detection bias initialization: {e}");
                    }

                    built.yolo_layers.push(i);
                    (Layer::Yolo(head), in_filters)
                }
                LayerKind::Reorg3d => (
                    Layer::Unsupported(UnsupportedLayer {
                        kind: Ignored(kind.tag().to_string()),
                    }),
                    in_filters,
                ),
                LayerKind::Unknown(tag) => {
                    warn!("layer {i}: unsupported layer type [{tag}], it will have no effect");
                    (
                        Layer::Unsupported(UnsupportedLayer {
                            kind: Ignored(tag.clone()),
                        }),
                        in_filters,
                    )
                }
            };

            built.layers.push(layer);
            built.output_filters.push(filters);
        }

        Ok(built)
    }

    fn conv_block<B: Backend>(
        &self,
        index: usize,
        spec: &LayerSpec,
        kind: &LayerKind,
        in_channels: usize,
        built: &BuiltModules<B>,
        device: &B::Device,
    ) -> std::result::Result<ConvBlock<B>, String> {
        let batch_normalize = spec.flag("batch_normalize")?;
        let filters = spec.parse::<usize>("filters")?;
        let kernel_size = spec.parse::<usize>("size")?;
        let stride = spec.parse_or::<usize>("stride", 1)?;
        let pad = spec.flag("pad")?;

        if filters == 0 || kernel_size == 0 || stride == 0 {
            return Err("filters, size and stride must be positive".into());
        }

        let (dilation, leaky) = match kind {
            LayerKind::DilatedConvolutional => (spec.pair("dilation")?, self.dilated_leaky),
            _ => ([1, 1], self.leaky),
        };
        // dilated layers pad by their dilation whatever the kernel size
        let padding = match (pad, kind) {
            (false, _) => [0, 0],
            (true, LayerKind::DilatedConvolutional) => dilation,
            (true, _) => [(kernel_size - 1) / 2; 2],
        };

        let activation = match spec.get("activation").unwrap_or("linear") {
            "leaky" => Some(leaky),
            "swish" => Some(ActivationKind::Swish),
            "relu" => Some(ActivationKind::Relu),
            "linear" => None,
            other => return Err(format!("unsupported activation '{other}'")),
        };

        let weight_from = match spec.get("weight_from") {
            Some(_) => {
                let raw = spec.parse::<isize>("weight_from")?;
                Some(resolve_weight_source(index, raw)?)
            }
            None => None,
        };

        let geometry = ConvGeometry {
            in_channels,
            filters,
            kernel_size,
            stride,
            padding,
            dilation,
            weight_from,
        };

        if let Some(source) = weight_from {
            if stride != 1 {
                return Err(format!(
                    "weight_from layer runs at stride 1, found stride {stride}"
                ));
            }

            match &built.layers[source] {
                Layer::Conv(block) if block.conv.is_some() => {
                    let source_shape = block.geometry().weight_shape();
                    if source_shape != geometry.weight_shape() {
                        return Err(format!(
                            "weight_from layer {source} has weights {source_shape:?}, this layer needs {:?}",
                            geometry.weight_shape()
                        ));
                    }
                }
                other => {
                    return Err(format!(
                        "weight_from layer {source} ({}) owns no convolution weights",
                        other.name()
                    ));
                }
            }
        }

        Ok(ConvBlock::new(geometry, batch_normalize, activation, device))
    }

    fn yolo_layer<B: Backend>(
        &self,
        spec: &LayerSpec,
        yolo_index: usize,
    ) -> std::result::Result<YoloLayer<B>, String> {
        let (start, end) = spec.range("mask")?;
        let classes = spec.parse::<usize>("classes")?;
        let flat = spec.list::<f32>("anchors")?;

        if classes == 0 {
            return Err("classes must be positive".into());
        }

        if flat.len() % 3 != 0 {
            return Err(format!(
                "anchors must be (w,h,angle) triples, found {} values",
                flat.len()
            ));
        }

        let anchors = flat
            .chunks_exact(3)
            .map(|c| [c[0], c[1], c[2]])
            .collect::<Vec<_>>();

        if end >= anchors.len() {
            return Err(format!(
                "mask {start}-{end} selects beyond the {} available anchors",
                anchors.len()
            ));
        }

        Ok(YoloLayer::new(
            anchors[start..=end].to_vec(),
            classes,
            yolo_index,
            self.arc,
            &self.hyp,
        ))
    }
}

/// Builds with the default activation choices.
pub fn build_modules<B: Backend>(
    specs: &[LayerSpec],
    arc: Architecture,
    hyp: &Hyperparameters,
    device: &B::Device,
) -> Result<BuiltModules<B>> {
    ModuleBuilder::new(arc, hyp.clone()).build(specs, device)
}

/// Route and shortcut indices: positive values are absolute layer indices,
/// zero and negative values are relative to `current`.
fn resolve_source(current: usize, idx: isize) -> std::result::Result<usize, String> {
    let absolute = if idx > 0 {
        idx
    } else {
        current as isize + idx
    };

    if absolute < 0 || absolute as usize >= current {
        return Err(format!(
            "index {idx} resolves to layer {absolute}, which is not an earlier layer"
        ));
    }

    Ok(absolute as usize)
}

/// `weight_from` is absolute when non negative and relative otherwise.
fn resolve_weight_source(current: usize, idx: isize) -> std::result::Result<usize, String> {
    let absolute = if idx >= 0 {
        idx
    } else {
        current as isize + idx
    };

    if absolute < 0 || absolute as usize >= current {
        return Err(format!(
            "weight_from {idx} resolves to layer {absolute}, which is not an earlier layer"
        ));
    }

    Ok(absolute as usize)
}
