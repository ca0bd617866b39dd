use std::{collections::BTreeSet, fmt::Write as _, path::PathBuf};

use burn::{
    module::{Ignored, Module},
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::{Tensor, backend::Backend},
};
use tracing::{debug, info};

use crate::{
    cfg::{LayerSpec, load_cfg, parse_cfg},
    config::{Architecture, DarknetConfig},
    error::{ModelError, Result},
    models::{
        Mode,
        blocks::resize_nearest,
        builder::{Layer, ModuleBuilder},
        yolo::YoloOutput,
    },
};

type WeightsRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Result of a forward pass.
#[derive(Clone, Debug)]
pub enum Detections<B: Backend> {
    /// Raw `[B, A, H, W, C + 6]` logits, one tensor per detection head.
    Train(Vec<Tensor<B, 5>>),
    /// Decoded boxes of every head concatenated along the box axis,
    /// `[B, total boxes, C + 6]`, plus the raw logits per head.
    Infer {
        decoded: Tensor<B, 3>,
        raw: Vec<Tensor<B, 5>>,
    },
}

/// A layer output as seen by later layers.
enum Slot<B: Backend> {
    Retained(Tensor<B, 4>),
    /// Not referenced by any route or shortcut.
    Dropped,
    /// Produced by a detection head or an unsupported layer.
    Missing,
}

/// A darknet style network assembled from a cfg.
///
/// The graph is a flat list of layers. Routes and shortcuts refer back to
/// earlier outputs by index; only the outputs actually referenced somewhere
/// are kept alive during a forward pass.
///
/// ```text
///    x ─ conv ─ maxpool ─ ... ─ conv ─ yolo          (stride 32)
///                │                │
///                │              route ─ conv ─ upsample ─┐
///                └──────────────────────────── route ────┴─ conv ─ yolo (stride 16)
/// ```
#[derive(Module, Debug)]
pub struct Darknet<B: Backend> {
    layers: Vec<Layer<B>>,
    specs: Ignored<Vec<LayerSpec>>,
    output_filters: Ignored<Vec<usize>>,
    retained: Ignored<BTreeSet<usize>>,
    yolo_layers: Ignored<Vec<usize>>,
    shared_weights: Ignored<BTreeSet<usize>>,
    arc: Ignored<Architecture>,
}

impl<B: Backend> Darknet<B> {
    pub fn new(specs: Vec<LayerSpec>, config: &DarknetConfig, device: &B::Device) -> Result<Self> {
        let arc = config.arc.parse::<Architecture>()?;
        Self::from_builder(specs, &ModuleBuilder::new(arc, config.hyp.clone()), device)
    }

    pub fn from_builder(
        specs: Vec<LayerSpec>,
        builder: &ModuleBuilder,
        device: &B::Device,
    ) -> Result<Self> {
        let built = builder.build::<B>(&specs, device)?;

        debug!(
            "built {} layers, {} detection heads, {} retained outputs",
            built.layers.len(),
            built.yolo_layers.len(),
            built.retained.len()
        );

        Ok(Self {
            layers: built.layers,
            specs: Ignored(specs),
            output_filters: Ignored(built.output_filters),
            retained: Ignored(built.retained),
            yolo_layers: Ignored(built.yolo_layers),
            shared_weights: Ignored(built.shared_weights),
            arc: Ignored(builder.arc()),
        })
    }

    pub fn from_cfg_str(text: &str, config: &DarknetConfig, device: &B::Device) -> Result<Self> {
        Self::new(parse_cfg(text)?, config, device)
    }

    pub fn from_cfg_file(
        path: impl AsRef<std::path::Path>,
        config: &DarknetConfig,
        device: &B::Device,
    ) -> Result<Self> {
        Self::new(load_cfg(path)?, config, device)
    }

    /// Replaces the parameters with those of a checkpoint written by
    /// [`Darknet::save_weights`] for the same cfg.
    pub fn load_weights(self, path: impl Into<PathBuf>, device: &B::Device) -> Result<Self> {
        let record = WeightsRecorder::new().load(path.into(), device)?;
        Ok(self.load_record(record))
    }

    pub fn save_weights(self, path: impl Into<PathBuf>) -> Result<()> {
        self.save_file(path, &WeightsRecorder::new())?;
        Ok(())
    }

    pub fn layers(&self) -> &[Layer<B>] {
        &self.layers
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn specs(&self) -> &[LayerSpec] {
        &self.specs.0
    }

    /// `[input channels, layer 0, layer 1, ...]`
    pub fn output_filters(&self) -> &[usize] {
        &self.output_filters.0
    }

    pub fn retained(&self) -> &BTreeSet<usize> {
        &self.retained.0
    }

    pub fn yolo_layers(&self) -> &[usize] {
        &self.yolo_layers.0
    }

    pub fn arc(&self) -> Architecture {
        self.arc.0
    }

    pub fn input_channels(&self) -> usize {
        self.output_filters.0[0]
    }

    /// `[height, width]` declared by the `[net]` section, if both are present.
    pub fn input_size(&self) -> Option<[usize; 2]> {
        let net = self.specs.0.first()?;
        let h = net.parse::<usize>("height").ok()?;
        let w = net.parse::<usize>("width").ok()?;
        Some([h, w])
    }

    /// Runs the graph on a `[B, C, H, W]` batch.
    ///
    /// Takes `&mut self` because detection heads cache their anchor grid; the
    /// same instance must not be shared across concurrent callers.
    pub fn forward(&mut self, x: Tensor<B, 4>, mode: Mode) -> Result<Detections<B>> {
        let [_, channels, h, w] = x.dims();
        if channels != self.input_channels() {
            return Err(ModelError::shape(format!(
                "network expects {} input channels, found {channels}",
                self.input_channels()
            )));
        }

        let img_size = [h, w];
        let mut history: Vec<Slot<B>> = Vec::with_capacity(self.layers.len());
        let mut running = Some(x);
        let mut consumed_by = 0;
        let mut heads = Vec::with_capacity(self.yolo_layers.0.len());

        for i in 0..self.layers.len() {
            let shared_weight = self.shared_weight(i)?;

            let consumed = consumed_by;
            let take = move |running: &mut Option<Tensor<B, 4>>| {
                running.take().ok_or(ModelError::MissingOutput {
                    layer: consumed,
                    referenced_by: i,
                })
            };

            let (output, slot) = match &mut self.layers[i] {
                Layer::Conv(block) => (Some(block.forward(take(&mut running)?, shared_weight)?), true),
                Layer::MaxPool(pool) => (Some(pool.forward(take(&mut running)?)), true),
                Layer::Upsample(upsample) => (Some(upsample.forward(take(&mut running)?)), true),
                Layer::SqueezeExcite(se) => (Some(se.forward(take(&mut running)?)), true),
                Layer::Route(route) => (Some(route_outputs(&history, route.sources(), i)?), true),
                Layer::Shortcut(shortcut) => {
                    let x = take(&mut running)?;
                    let source = retained_output(&history, shortcut.source(), i)?;
                    if x.dims() != source.dims() {
                        return Err(ModelError::shape(format!(
                            "layer {i}: shortcut adds {:?} from layer {} to {:?}",
                            source.dims(),
                            shortcut.source(),
                            x.dims()
                        )));
                    }
                    (Some(x + source), true)
                }
                Layer::Yolo(head) => {
                    heads.push(head.forward(take(&mut running)?, img_size, mode)?);
                    consumed_by = i;
                    (None, false)
                }
                Layer::Unsupported(_) => (running.take(), false),
            };

            history.push(match (&output, slot) {
                (Some(out), true) if self.retained.0.contains(&i) => Slot::Retained(out.clone()),
                (_, true) => Slot::Dropped,
                (_, false) => Slot::Missing,
            });
            running = output;
        }

        match mode {
            Mode::Train => Ok(Detections::Train(
                heads
                    .into_iter()
                    .map(|head| match head {
                        YoloOutput::Raw(raw) | YoloOutput::Decoded { raw, .. } => raw,
                    })
                    .collect(),
            )),
            Mode::Infer => {
                if heads.is_empty() {
                    return Err(ModelError::NoDetectionHeads);
                }

                let (decoded, raw): (Vec<_>, Vec<_>) = heads
                    .into_iter()
                    .map(|head| match head {
                        YoloOutput::Decoded { decoded, raw } => Ok((decoded, raw)),
                        YoloOutput::Raw(_) => Err(ModelError::shape(
                            "detection head returned raw logits in inference mode",
                        )),
                    })
                    .collect::<Result<Vec<_>>>()?
                    .into_iter()
                    .unzip();

                Ok(Detections::Infer {
                    decoded: Tensor::cat(decoded, 1),
                    raw,
                })
            }
        }
    }

    /// Weights borrowed by layer `i`, if its cfg names a `weight_from` layer.
    fn shared_weight(&self, i: usize) -> Result<Option<Tensor<B, 4>>> {
        let Layer::Conv(block) = &self.layers[i] else {
            return Ok(None);
        };
        let Some(source) = block.weight_from() else {
            return Ok(None);
        };

        match &self.layers[source] {
            Layer::Conv(owner) => owner
                .conv
                .as_ref()
                .map(|conv| Some(conv.weight.val()))
                .ok_or_else(|| {
                    ModelError::shape(format!(
                        "layer {i} borrows weights from layer {source}, which has none"
                    ))
                }),
            other => Err(ModelError::shape(format!(
                "layer {i} borrows weights from layer {source} ({})",
                other.name()
            ))),
        }
    }

    /// Folds every batch-norm into the convolution in front of it.
    ///
    /// Convolutions whose weights are borrowed by another layer are left
    /// alone, the borrower applies its own batch-norm to the raw weights.
    /// A fused model has no batch-norm left, so fusing again changes nothing.
    pub fn fuse(self) -> Self {
        let shared = &self.shared_weights.0;
        let mut fused = 0;

        let layers = self
            .layers
            .into_iter()
            .enumerate()
            .map(|(i, layer)| match layer {
                Layer::Conv(block) if !shared.contains(&i) => {
                    if block.conv.is_some() && block.bn.is_some() {
                        fused += 1;
                    }
                    Layer::Conv(block.fuse())
                }
                other => other,
            })
            .collect();

        info!("fused {fused} convolution/batch-norm pairs");

        Self {
            layers,
            specs: self.specs,
            output_filters: self.output_filters,
            retained: self.retained,
            yolo_layers: self.yolo_layers,
            shared_weights: self.shared_weights,
            arc: self.arc,
        }
    }

    /// One line per layer: index, type, output channels and the layer's wiring
    /// or geometry.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{:>5}  {:<16}{:>8}  detail", "layer", "type", "filters");

        for (i, layer) in self.layers.iter().enumerate() {
            let detail = match layer {
                Layer::Conv(block) => {
                    let g = block.geometry();
                    let mut detail = format!(
                        "{}x{}/{} {} -> {}",
                        g.kernel_size, g.kernel_size, g.stride, g.in_channels, g.filters
                    );
                    if g.dilation != [1, 1] {
                        let _ = write!(detail, ", dilation {:?}", g.dilation);
                    }
                    if let Some(source) = g.weight_from {
                        let _ = write!(detail, ", weights of {source}");
                    }
                    if block.bn.is_some() {
                        detail.push_str(", bn");
                    }
                    detail
                }
                Layer::Route(route) => format!("{:?}", route.sources()),
                Layer::Shortcut(shortcut) => format!("from {}", shortcut.source()),
                Layer::Yolo(head) => format!(
                    "head {}, {} anchors, {} classes, {}",
                    head.yolo_index(),
                    head.num_anchors(),
                    head.num_classes(),
                    self.arc.0
                ),
                _ => String::new(),
            };

            let _ = writeln!(
                out,
                "{i:>5}  {:<16}{:>8}  {detail}",
                layer.name(),
                self.output_filters.0[i + 1]
            );
        }

        out
    }
}

fn retained_output<B: Backend>(
    history: &[Slot<B>],
    layer: usize,
    referenced_by: usize,
) -> Result<Tensor<B, 4>> {
    match history.get(layer) {
        Some(Slot::Retained(t)) => Ok(t.clone()),
        _ => Err(ModelError::MissingOutput {
            layer,
            referenced_by,
        }),
    }
}

fn concat_compatible<B: Backend>(tensors: &[Tensor<B, 4>]) -> bool {
    let [b, _, h, w] = tensors[0].dims();
    tensors.iter().all(|t| {
        let [tb, _, th, tw] = t.dims();
        (tb, th, tw) == (b, h, w)
    })
}

/// Forwards a single source or concatenates several along the channel axis.
///
/// When the sources disagree spatially, the last one is halved with nearest
/// neighbour sampling and the concatenation tried once more. This covers cfgs
/// that relied on a `reorg3d` layer to downsample a route input.
fn route_outputs<B: Backend>(
    history: &[Slot<B>],
    sources: &[usize],
    current: usize,
) -> Result<Tensor<B, 4>> {
    let mut tensors = sources
        .iter()
        .map(|&s| retained_output(history, s, current))
        .collect::<Result<Vec<_>>>()?;

    if tensors.len() == 1 {
        return Ok(tensors.remove(0));
    }

    if !concat_compatible(&tensors) {
        let last = tensors.pop().ok_or_else(|| ModelError::shape("route without sources"))?;
        let [_, _, h, w] = last.dims();
        debug!(
            "layer {current}: route sources disagree spatially, halving layer {:?} from {h}x{w}",
            sources.last()
        );
        tensors.push(resize_nearest(last, [h / 2, w / 2]));

        if !concat_compatible(&tensors) {
            let dims = tensors.iter().map(|t| t.dims()).collect::<Vec<_>>();
            return Err(ModelError::shape(format!(
                "layer {current}: route sources {sources:?} can not be concatenated, shapes {dims:?}"
            )));
        }
    }

    Ok(Tensor::cat(tensors, 1))
}
