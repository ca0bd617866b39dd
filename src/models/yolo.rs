use std::marker::PhantomData;

use burn::{
    module::{Ignored, Module, Param},
    nn::conv::Conv2d,
    tensor::{
        Tensor,
        activation::{sigmoid, softmax},
        backend::Backend,
        cast::ToElement,
    },
};
use thiserror::Error;
use tracing::debug;

use crate::{
    config::{Architecture, ArcFamily, Hyperparameters},
    error::{ModelError, Result},
    grid::AnchorGrid,
    models::Mode,
};

/// Fields per anchor before the class scores: x, y, w, h, angle, objectness.
pub const BOX_FIELDS: usize = 6;

/// Output of one detection head.
#[derive(Clone, Debug)]
pub enum YoloOutput<B: Backend> {
    /// `[B, A, H, W, C + 6]` raw logits.
    Raw(Tensor<B, 5>),
    /// `decoded` is `[B, A * H * W, C + 6]` in input image pixels, `raw` as above.
    Decoded {
        decoded: Tensor<B, 3>,
        raw: Tensor<B, 5>,
    },
}

/// Detection head for one scale.
///
/// The head owns no weights; the preceding convolution produces
/// `A * (C + 6)` channels and this layer reshapes them into per anchor, per
/// cell prediction vectors. At inference time the vectors are decoded:
///
/// ```text
/// cx, cy = (sigmoid(tx, ty) + (col, row)) * stride
/// w, h   = exp(tw, th) * anchor_wh
/// angle  = atan(ta) + anchor_angle
/// h     /= context_factor
/// w     -= h * (context_factor - 1)
/// ```
///
/// The anchor grid is cached per feature map size as host data, so the cache
/// survives `valid()` and device moves unchanged. Because it is refreshed from
/// inside `forward`, the method takes `&mut self`: one model instance serves
/// one caller at a time.
///
/// Relevant excerpt from
///
/// “YOLO9000: Better, Faster, Stronger”
/// Authors: Joseph Redmon, Ali Farhadi
/// Link (official): https://arxiv.org/abs/1612.08242
///
/// Direct location prediction - Redmon et al. - Pg 3
///
/// The network predicts 5 coordinates for each bounding box, tx, ty, tw, th,
/// and to. If the cell is offset from the top left corner of the image by
/// (cx, cy) and the bounding box prior has width and height pw, ph, then the
/// predictions correspond to: bx = σ(tx) + cx, by = σ(ty) + cy, bw = pw e^tw,
/// bh = ph e^th.
///
#[derive(Module, Debug)]
pub struct YoloLayer<B: Backend> {
    anchors: Ignored<Vec<[f32; 3]>>,
    num_classes: usize,
    yolo_index: usize,
    arc: Ignored<Architecture>,
    context_factor: f64,
    grid: Ignored<Option<AnchorGrid>>,
    backend: PhantomData<B>,
}

impl<B: Backend> YoloLayer<B> {
    pub fn new(
        anchors: Vec<[f32; 3]>,
        num_classes: usize,
        yolo_index: usize,
        arc: Architecture,
        hyp: &Hyperparameters,
    ) -> Self {
        Self {
            anchors: Ignored(anchors),
            num_classes,
            yolo_index,
            arc: Ignored(arc),
            context_factor: hyp.context_factor,
            grid: Ignored(None),
            backend: PhantomData,
        }
    }

    pub fn num_anchors(&self) -> usize {
        self.anchors.0.len()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn anchors(&self) -> &[[f32; 3]] {
        &self.anchors.0
    }

    pub fn yolo_index(&self) -> usize {
        self.yolo_index
    }

    /// The cached grid, if a forward pass has run.
    pub fn grid(&self) -> Option<&AnchorGrid> {
        self.grid.0.as_ref()
    }

    fn refresh_grid(
        &mut self,
        img_size: [usize; 2],
        feature_size: [usize; 2],
        device: &B::Device,
    ) -> Result<AnchorGrid> {
        match &self.grid.0 {
            Some(grid) if grid.matches(img_size, feature_size) => Ok(grid.clone()),
            _ => {
                debug!(
                    "yolo head {}: building anchor grid for {:?} feature map, image {:?}",
                    self.yolo_index, feature_size, img_size
                );
                let grid = AnchorGrid::new::<B>(&self.anchors.0, img_size, feature_size, device)?;
                self.grid.0 = Some(grid.clone());
                Ok(grid)
            }
        }
    }

    /// `p` is the `[B, A * (C + 6), H, W]` output of the preceding convolution
    /// and `img_size` the `[height, width]` of the network input.
    pub fn forward(
        &mut self,
        p: Tensor<B, 4>,
        img_size: [usize; 2],
        mode: Mode,
    ) -> Result<YoloOutput<B>> {
        let [bs, channels, ny, nx] = p.dims();
        let na = self.num_anchors();
        let nc = self.num_classes;
        let fields = nc + BOX_FIELDS;

        if nc == 0 {
            return Err(ModelError::shape(format!(
                "yolo head {} has no classes to score",
                self.yolo_index
            )));
        }

        if channels != na * fields {
            return Err(ModelError::shape(format!(
                "yolo head {} expects {} channels ({} anchors x {} fields), found {}",
                self.yolo_index,
                na * fields,
                na,
                fields,
                channels
            )));
        }

        let grid = self.refresh_grid(img_size, [ny, nx], &p.device())?;

        // (B, A * F, H, W) -> (B, A, F, H, W) -> (B, A, H, W, F)
        let p = p.reshape([bs, na, fields, ny, nx]).permute([0, 1, 3, 4, 2]);

        if mode == Mode::Train {
            return Ok(YoloOutput::Raw(p));
        }

        let io = self.decode(p.clone(), &grid);

        Ok(YoloOutput::Decoded {
            decoded: io.reshape([bs, na * ny * nx, fields]),
            raw: p,
        })
    }

    fn decode(&self, p: Tensor<B, 5>, grid: &AnchorGrid) -> Tensor<B, 5> {
        let [bs, na, ny, nx, _] = p.dims();
        let nc = self.num_classes;
        let device = p.device();
        let pair = [bs, na, ny, nx, 2];
        let single = [bs, na, ny, nx, 1];

        let anchor_whb = grid.anchor_whb::<B>(&device);

        let xy = sigmoid(p.clone().narrow(4, 0, 2)) + grid.grid_xy::<B>(&device).expand(pair);
        let wh = p.clone().narrow(4, 2, 2).exp() * anchor_whb.clone().narrow(4, 0, 2).expand(pair);
        let angle = p.clone().narrow(4, 4, 1).atan() + anchor_whb.narrow(4, 2, 1).expand(single);

        // back to input image pixels
        let xy = xy.mul_scalar(grid.stride);
        let wh = wh.mul_scalar(grid.stride);

        let cf = self.context_factor;
        let h = wh.clone().narrow(4, 1, 1).div_scalar(cf);
        let w = wh.narrow(4, 0, 1) - h.clone().mul_scalar(cf - 1.0);

        let scores = p.narrow(4, 5, nc + 1);
        let ones = || Tensor::<B, 5>::ones(single, &device);

        let scores = match self.arc.0.family() {
            ArcFamily::Default => sigmoid(scores),
            ArcFamily::Bce => Tensor::cat(vec![ones(), sigmoid(scores.narrow(4, 1, nc))], 4),
            ArcFamily::Ce => {
                let probs = softmax(scores, 4);
                Tensor::cat(vec![ones(), probs.narrow(4, 1, nc)], 4)
            }
        };

        // single class models always predict that class
        let scores = if nc == 1 {
            Tensor::cat(vec![scores.narrow(4, 0, 1), ones()], 4)
        } else {
            scores
        };

        Tensor::cat(vec![xy, w, h, angle, scores], 4)
    }
}

/// Reasons the detection bias initialization could not be applied.
#[derive(Debug, Error, PartialEq)]
pub enum BiasInitError {
    #[error("no convolution precedes the yolo layer")]
    NoConvolution,
    #[error("the preceding convolution has no bias")]
    NoBias,
    #[error("bias of length {len} cannot be split into {anchors} anchors of {fields} fields")]
    Shape {
        len: usize,
        anchors: usize,
        fields: usize,
    },
}

/// Shifts the bias of the convolution feeding a detection head so the mean
/// objectness and class logits start at the architecture's targets.
///
/// Relevant excerpt from
///
/// “Focal Loss for Dense Object Detection”
/// Authors: Tsung-Yi Lin, Priya Goyal, Ross Girshick, Kaiming He, Piotr Dollár
/// Link (official): https://arxiv.org/abs/1708.02002
///
/// Pg 4 - This has the effect of initializing the network such that the
/// probability of an anchor being foreground is low, which prevents the large
/// number of background anchors from generating a large, destabilizing loss
/// value in the first iteration of training.
///
pub fn init_head_bias<B: Backend>(
    conv: Option<&mut Conv2d<B>>,
    num_anchors: usize,
    num_classes: usize,
    arc: Architecture,
) -> std::result::Result<(), BiasInitError> {
    let conv = conv.ok_or(BiasInitError::NoConvolution)?;
    let bias = conv.bias.as_ref().ok_or(BiasInitError::NoBias)?.val();

    let [len] = bias.dims();
    let fields = num_classes + BOX_FIELDS;

    if len != num_anchors * fields {
        return Err(BiasInitError::Shape {
            len,
            anchors: num_anchors,
            fields,
        });
    }

    let (obj_target, cls_target) = arc.bias_targets();

    let bias = bias.reshape([num_anchors, fields]);
    let geometry = bias.clone().narrow(1, 0, 5);
    let obj = bias.clone().narrow(1, 5, 1);
    let cls = bias.narrow(1, 6, num_classes);

    let obj_mean = obj.clone().mean().into_scalar().to_f32();
    let cls_mean = cls.clone().mean().into_scalar().to_f32();

    let obj = obj.add_scalar(obj_target - obj_mean);
    let cls = cls.add_scalar(cls_target - cls_mean);

    let bias = Tensor::cat(vec![geometry, obj, cls], 1).reshape([len]);
    conv.bias = Some(Param::from_tensor(bias));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{NdArray, ndarray::NdArrayDevice};
    use burn::nn::conv::Conv2dConfig;
    use burn::tensor::Distribution;

    type B = NdArray<f32>;
    type FT = burn::tensor::ops::FloatElem<B>;

    const ANCHORS: [[f32; 3]; 3] = [[10.0, 13.0, 0.0], [16.0, 30.0, 0.5], [33.0, 23.0, -0.5]];

    fn head(num_classes: usize, arc: Architecture, context_factor: f64) -> YoloLayer<B> {
        YoloLayer::new(
            ANCHORS.to_vec(),
            num_classes,
            0,
            arc,
            &Hyperparameters::new().with_context_factor(context_factor),
        )
    }

    fn values(t: Tensor<B, 3>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_train_mode_returns_raw_reshape() {
        let device = &NdArrayDevice::default();
        let mut yolo = head(2, Architecture::Default, 1.0);

        let p = Tensor::<B, 4>::random([2, 3 * 8, 13, 13], Distribution::Default, device);
        let out = yolo.forward(p.clone(), [416, 416], Mode::Train).unwrap();

        let YoloOutput::Raw(raw) = out else {
            panic!("training mode must not decode");
        };
        assert_eq!(raw.dims(), [2, 3, 13, 13, 8]);

        // raw[b, a, y, x, f] == p[b, a * 8 + f, y, x]
        let expected = p
            .reshape([2, 3, 8, 13, 13])
            .permute([0, 1, 3, 4, 2]);
        expected
            .into_data()
            .assert_approx_eq::<FT>(&raw.into_data(), burn::tensor::Tolerance::default());
    }

    #[test]
    fn test_channel_mismatch_is_a_shape_error() {
        let device = &NdArrayDevice::default();
        let mut yolo = head(2, Architecture::Default, 1.0);
        let p = Tensor::<B, 4>::zeros([1, 20, 13, 13], device);
        assert!(matches!(
            yolo.forward(p, [416, 416], Mode::Infer),
            Err(ModelError::Shape(_))
        ));
    }

    #[test]
    fn test_decode_zero_logits() {
        let device = &NdArrayDevice::default();
        let mut yolo = head(2, Architecture::Default, 1.0);

        let p = Tensor::<B, 4>::zeros([1, 3 * 8, 2, 2], device);
        let YoloOutput::Decoded { decoded, raw } =
            yolo.forward(p, [64, 64], Mode::Infer).unwrap()
        else {
            panic!("inference mode must decode");
        };
        assert_eq!(raw.dims(), [1, 3, 2, 2, 8]);
        assert_eq!(decoded.dims(), [1, 12, 8]);

        let v = values(decoded);
        let row = |i: usize| &v[i * 8..(i + 1) * 8];

        // anchor 0, cell (0, 0): centre is half a cell, size is the anchor itself
        let r = row(0);
        assert!((r[0] - 16.0).abs() < 1e-4);
        assert!((r[1] - 16.0).abs() < 1e-4);
        assert!((r[2] - 10.0).abs() < 1e-4);
        assert!((r[3] - 13.0).abs() < 1e-4);
        assert!(r[4].abs() < 1e-6);
        assert!(r[5..].iter().all(|s| (s - 0.5).abs() < 1e-6));

        // anchor 0, cell (col 1, row 0)
        let r = row(1);
        assert!((r[0] - 48.0).abs() < 1e-4);
        assert!((r[1] - 16.0).abs() < 1e-4);

        // anchor 1, cell (col 0, row 1) carries that anchor's angle bias
        let r = row(4 + 2);
        assert!((r[0] - 16.0).abs() < 1e-4);
        assert!((r[1] - 48.0).abs() < 1e-4);
        assert!((r[2] - 16.0).abs() < 1e-4);
        assert!((r[3] - 30.0).abs() < 1e-4);
        assert!((r[4] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_context_factor_correction() {
        let device = &NdArrayDevice::default();
        let mut yolo = head(2, Architecture::Default, 2.0);

        let p = Tensor::<B, 4>::zeros([1, 3 * 8, 1, 1], device);
        let YoloOutput::Decoded { decoded, .. } = yolo.forward(p, [32, 32], Mode::Infer).unwrap()
        else {
            panic!("inference mode must decode");
        };

        let v = values(decoded);
        // anchor 1: w = 16, h = 30 -> h = 15, w = 16 - 15 * (2 - 1) = 1
        let r = &v[8..16];
        assert!((r[3] - 15.0).abs() < 1e-4);
        assert!((r[2] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_zero_classes_is_a_shape_error() {
        let device = &NdArrayDevice::default();
        let mut yolo = head(0, Architecture::UnifiedBce, 1.0);
        let p = Tensor::<B, 4>::zeros([1, 3 * BOX_FIELDS, 2, 2], device);
        assert!(matches!(
            yolo.forward(p, [64, 64], Mode::Infer),
            Err(ModelError::Shape(_))
        ));
    }

    #[test]
    fn test_cached_grid_survives_clone() {
        let device = &NdArrayDevice::default();
        let mut yolo = head(2, Architecture::Default, 1.0);

        let p = Tensor::<B, 4>::random([1, 3 * 8, 2, 2], Distribution::Default, device);
        let YoloOutput::Decoded { decoded: first, .. } =
            yolo.forward(p.clone(), [64, 64], Mode::Infer).unwrap()
        else {
            panic!("inference mode must decode");
        };

        let grid = yolo.grid().unwrap();
        assert_eq!(grid.grid_xy::<B>(device).dims(), [1, 1, 2, 2, 2]);
        assert_eq!(grid.anchor_whb::<B>(device).dims(), [1, 3, 1, 1, 3]);

        let mut copy = yolo.clone();
        assert!(copy.grid().unwrap().matches([64, 64], [2, 2]));

        let YoloOutput::Decoded { decoded: second, .. } =
            copy.forward(p, [64, 64], Mode::Infer).unwrap()
        else {
            panic!("inference mode must decode");
        };
        assert_eq!(first.into_data(), second.into_data());
    }

    #[test]
    fn test_decode_is_deterministic_with_cached_grid() {
        let device = &NdArrayDevice::default();
        let mut yolo = head(3, Architecture::Default, 1.0);

        let p = Tensor::<B, 4>::random([1, 3 * 9, 13, 13], Distribution::Default, device);

        let YoloOutput::Decoded { decoded: first, .. } =
            yolo.forward(p.clone(), [416, 416], Mode::Infer).unwrap()
        else {
            panic!("inference mode must decode");
        };
        let YoloOutput::Decoded { decoded: second, .. } =
            yolo.forward(p, [416, 416], Mode::Infer).unwrap()
        else {
            panic!("inference mode must decode");
        };

        assert_eq!(first.into_data(), second.into_data());
    }

    #[test]
    fn test_grid_invalidated_on_new_feature_size() {
        let device = &NdArrayDevice::default();
        let mut yolo = head(1, Architecture::Default, 1.0);

        let p = Tensor::<B, 4>::zeros([1, 3 * 7, 13, 13], device);
        yolo.forward(p, [416, 416], Mode::Infer).unwrap();
        assert_eq!(yolo.grid().unwrap().stride, 32.0);

        let p = Tensor::<B, 4>::zeros([1, 3 * 7, 26, 26], device);
        let YoloOutput::Decoded { decoded, .. } =
            yolo.forward(p, [416, 416], Mode::Infer).unwrap()
        else {
            panic!("inference mode must decode");
        };

        let grid = yolo.grid().unwrap();
        assert_eq!(grid.stride, 16.0);
        assert_eq!((grid.nx, grid.ny), (26, 26));

        // last cell of anchor 0 sits at (25.5, 25.5) cells = 408 px
        let v = values(decoded);
        let r = &v[(26 * 26 - 1) * 7..26 * 26 * 7];
        assert!((r[0] - 408.0).abs() < 1e-3);
        assert!((r[1] - 408.0).abs() < 1e-3);
        // anchor 0 width is unchanged in pixels at the finer stride
        assert!((r[2] - 10.0).abs() < 1e-3);
    }

    #[test]
    fn test_single_class_score_is_one() {
        let device = &NdArrayDevice::default();
        let mut yolo = head(1, Architecture::Default, 1.0);

        let p = Tensor::<B, 4>::random([2, 3 * 7, 4, 4], Distribution::Normal(0.0, 5.0), device);
        let YoloOutput::Decoded { decoded, .. } = yolo.forward(p, [64, 64], Mode::Infer).unwrap()
        else {
            panic!("inference mode must decode");
        };

        let cls = decoded.narrow(2, 6, 1).into_data().to_vec::<f32>().unwrap();
        assert!(cls.iter().all(|c| *c == 1.0));
    }

    #[test]
    fn test_bce_forces_objectness() {
        let device = &NdArrayDevice::default();
        let mut yolo = head(2, Architecture::UnifiedBce, 1.0);

        let p = Tensor::<B, 4>::zeros([1, 3 * 8, 2, 2], device);
        let YoloOutput::Decoded { decoded, .. } = yolo.forward(p, [64, 64], Mode::Infer).unwrap()
        else {
            panic!("inference mode must decode");
        };

        let v = values(decoded);
        assert_eq!(v[5], 1.0);
        assert!((v[6] - 0.5).abs() < 1e-6);
        assert!((v[7] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_ce_softmax_over_objectness_and_classes() {
        let device = &NdArrayDevice::default();
        let mut yolo = head(2, Architecture::UnifiedCe, 1.0);

        let p = Tensor::<B, 4>::zeros([1, 3 * 8, 2, 2], device);
        let YoloOutput::Decoded { decoded, .. } = yolo.forward(p, [64, 64], Mode::Infer).unwrap()
        else {
            panic!("inference mode must decode");
        };

        // softmax over three equal logits, objectness then replaced by 1
        let v = values(decoded);
        assert_eq!(v[5], 1.0);
        assert!((v[6] - 1.0 / 3.0).abs() < 1e-6);
        assert!((v[7] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_init_head_bias_targets() {
        let device = &NdArrayDevice::default();
        let mut conv = Conv2dConfig::new([8, 3 * 8], [1, 1]).init::<B>(device);

        init_head_bias(Some(&mut conv), 3, 2, Architecture::Default).unwrap();

        let bias = conv.bias.as_ref().unwrap().val().reshape([3, 8]);
        let obj_mean = bias.clone().narrow(1, 5, 1).mean().into_scalar().to_f32();
        let cls_mean = bias.narrow(1, 6, 2).mean().into_scalar().to_f32();

        assert!((obj_mean + 5.5).abs() < 1e-4);
        assert!((cls_mean + 4.0).abs() < 1e-4);
    }

    #[test]
    fn test_init_head_bias_failures() {
        let device = &NdArrayDevice::default();

        assert_eq!(
            init_head_bias::<B>(None, 3, 2, Architecture::Default),
            Err(BiasInitError::NoConvolution)
        );

        let mut no_bias = Conv2dConfig::new([8, 24], [1, 1])
            .with_bias(false)
            .init::<B>(device);
        assert_eq!(
            init_head_bias(Some(&mut no_bias), 3, 2, Architecture::Default),
            Err(BiasInitError::NoBias)
        );

        let mut wrong = Conv2dConfig::new([8, 20], [1, 1]).init::<B>(device);
        assert!(matches!(
            init_head_bias(Some(&mut wrong), 3, 2, Architecture::Default),
            Err(BiasInitError::Shape { len: 20, .. })
        ));
    }
}
