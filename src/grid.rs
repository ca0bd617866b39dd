use burn::{
    prelude::Backend,
    tensor::{Device, Int, Tensor, TensorData},
};

use crate::error::{ModelError, Result};

/// Matrix indexed coordinate grids, `x` varies along dim 0 and `y` along dim 1.
pub fn meshgrid<B: Backend>(x: Tensor<B, 1>, y: Tensor<B, 1>) -> (Tensor<B, 2>, Tensor<B, 2>) {
    let [nx] = x.dims();
    let [ny] = y.dims();

    let xv = x.reshape([nx, 1]).repeat(&[1, ny]);
    let yv = y.reshape([1, ny]).repeat(&[nx, 1]);

    (xv, yv)
}

/// Per-cell `(col, row)` origins shaped `[1, 1, ny, nx, 2]` so they broadcast
/// over batch and anchors of a `[B, A, ny, nx, C]` prediction.
pub fn grid_xy<B: Backend>(nx: usize, ny: usize, device: &Device<B>) -> Tensor<B, 5> {
    let rows = Tensor::<B, 1, Int>::arange(0..ny as i64, device).float();
    let cols = Tensor::<B, 1, Int>::arange(0..nx as i64, device).float();

    let (yv, xv) = meshgrid(rows, cols);

    Tensor::stack::<3>(vec![xv, yv], 2).reshape([1, 1, ny, nx, 2])
}

/// Anchors as `[1, A, 1, 1, 3]`, width and height expressed in feature map cells.
/// The angle bias is not a length and is left untouched.
pub fn scaled_anchors<B: Backend>(
    anchors: &[[f32; 3]],
    stride: f32,
    device: &Device<B>,
) -> Tensor<B, 5> {
    let values = anchors
        .iter()
        .flat_map(|[w, h, angle]| [w / stride, h / stride, *angle])
        .collect::<Vec<f32>>();

    Tensor::<B, 1>::from_data(values.as_slice(), device).reshape([1, anchors.len(), 1, 1, 3])
}

/// Geometry a detection head needs to turn cell relative predictions into image
/// coordinates. Valid for one feature map size and one input image size.
///
/// The tensors are kept as host data so the cache does not tie the head to a
/// backend; they are moved to the device on use.
#[derive(Clone, Debug)]
pub struct AnchorGrid {
    pub nx: usize,
    pub ny: usize,
    pub img_size: [usize; 2],
    pub stride: f32,
    cells: TensorData,
    anchors: TensorData,
}

impl AnchorGrid {
    /// `img_size` and `feature_size` are both `[height, width]`.
    pub fn new<B: Backend>(
        anchors: &[[f32; 3]],
        img_size: [usize; 2],
        feature_size: [usize; 2],
        device: &Device<B>,
    ) -> Result<Self> {
        let [img_h, img_w] = img_size;
        let [ny, nx] = feature_size;

        if nx == 0 || ny == 0 {
            return Err(ModelError::shape(format!(
                "empty feature map {ny}x{nx} for image {img_h}x{img_w}"
            )));
        }

        let stride_y = img_h as f32 / ny as f32;
        let stride_x = img_w as f32 / nx as f32;

        if (stride_x - stride_y).abs() > f32::EPSILON * stride_x.max(stride_y) {
            return Err(ModelError::shape(format!(
                "feature map {ny}x{nx} does not evenly scale image {img_h}x{img_w} \
                 (stride {stride_y} vs {stride_x})"
            )));
        }

        Ok(Self {
            nx,
            ny,
            img_size,
            stride: stride_x,
            cells: grid_xy::<B>(nx, ny, device).into_data(),
            anchors: scaled_anchors::<B>(anchors, stride_x, device).into_data(),
        })
    }

    pub fn matches(&self, img_size: [usize; 2], feature_size: [usize; 2]) -> bool {
        self.img_size == img_size && [self.ny, self.nx] == feature_size
    }

    /// Cell origins, `[1, 1, ny, nx, 2]`.
    pub fn grid_xy<B: Backend>(&self, device: &Device<B>) -> Tensor<B, 5> {
        Tensor::from_data(self.cells.clone(), device)
    }

    /// Anchors in cell units, `[1, A, 1, 1, 3]`.
    pub fn anchor_whb<B: Backend>(&self, device: &Device<B>) -> Tensor<B, 5> {
        Tensor::from_data(self.anchors.clone(), device)
    }
}
