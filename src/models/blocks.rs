use burn::{
    module::{Ignored, Module, Param},
    nn::{
        BatchNorm, BatchNormConfig, LeakyRelu, LeakyReluConfig, Linear, LinearConfig,
        PaddingConfig2d, PRelu, PReluConfig, Relu,
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
    },
    tensor::{
        Tensor,
        activation::{relu, sigmoid, silu},
        backend::Backend,
        module::{conv2d, interpolate},
        ops::{ConvOptions, InterpolateMode, InterpolateOptions},
    },
};

use crate::error::{ModelError, Result};

/// Activation choices for the `leaky` tag of a cfg.
///
/// Darknet cfgs only say `activation=leaky`; which non-linearity is actually
/// instantiated is a builder decision so it can be swapped without touching
/// the rest of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    /// Parametric ReLU with a single learned slope initialised at 0.1.
    PRelu,
    /// Fixed 0.1 slope leaky ReLU.
    Leaky,
    /// `x * sigmoid(x)`
    Swish,
    Relu,
}

impl ActivationKind {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Activation<B> {
        match self {
            ActivationKind::PRelu => Activation::PRelu(
                PReluConfig::new()
                    .with_num_parameters(1)
                    .with_alpha(0.1)
                    .init(device),
            ),
            ActivationKind::Leaky => {
                Activation::Leaky(LeakyReluConfig::new().with_negative_slope(0.1).init())
            }
            ActivationKind::Swish => Activation::Swish(Swish),
            ActivationKind::Relu => Activation::Relu(Relu::new()),
        }
    }
}

#[derive(Module, Clone, Debug, Default)]
pub struct Swish;

#[derive(Module, Debug)]
pub enum Activation<B: Backend> {
    PRelu(PRelu<B>),
    Leaky(LeakyRelu),
    Swish(Swish),
    Relu(Relu),
}

impl<B: Backend> Activation<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Activation::PRelu(prelu) => prelu.forward(x),
            Activation::Leaky(leaky) => leaky.forward(x),
            Activation::Swish(_) => silu(x),
            Activation::Relu(_) => relu(x),
        }
    }
}

/// Static description of a convolution, kept next to the module so that a
/// layer borrowing these weights can be checked and executed with its own
/// padding and dilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvGeometry {
    pub in_channels: usize,
    pub filters: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: [usize; 2],
    pub dilation: [usize; 2],
    /// Absolute index of the layer whose weights this convolution uses.
    pub weight_from: Option<usize>,
}

impl ConvGeometry {
    pub fn weight_shape(&self) -> [usize; 4] {
        [
            self.filters,
            self.in_channels,
            self.kernel_size,
            self.kernel_size,
        ]
    }
}

/// Convolution followed by an optional batch-norm and an optional activation.
///
/// `conv` is `None` when the layer borrows its weights from an earlier layer;
/// the executor then hands those weights to [`ConvBlock::forward`].
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Option<Conv2d<B>>,
    pub bn: Option<BatchNorm<B>>,
    pub activation: Option<Activation<B>>,
    geometry: Ignored<ConvGeometry>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(
        geometry: ConvGeometry,
        batch_normalize: bool,
        activation: Option<ActivationKind>,
        device: &B::Device,
    ) -> Self {
        let conv = match geometry.weight_from {
            Some(_) => None,
            None => Some(
                Conv2dConfig::new(
                    [geometry.in_channels, geometry.filters],
                    [geometry.kernel_size, geometry.kernel_size],
                )
                .with_stride([geometry.stride, geometry.stride])
                .with_padding(PaddingConfig2d::Explicit(
                    geometry.padding[0],
                    geometry.padding[1],
                ))
                .with_dilation(geometry.dilation)
                .with_bias(!batch_normalize)
                .init(device),
            ),
        };

        let bn = batch_normalize.then(|| {
            BatchNormConfig::new(geometry.filters)
                .with_momentum(0.1)
                .init(device)
        });

        Self {
            conv,
            bn,
            activation: activation.map(|kind| kind.init(device)),
            geometry: Ignored(geometry),
        }
    }

    pub fn geometry(&self) -> &ConvGeometry {
        &self.geometry.0
    }

    pub fn weight_from(&self) -> Option<usize> {
        self.geometry.0.weight_from
    }

    /// Runs the block. `shared_weight` replaces the convolution with a bias free
    /// unit stride convolution over borrowed weights, using this layer's padding
    /// and dilation; batch-norm and activation are still applied afterwards.
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        shared_weight: Option<Tensor<B, 4>>,
    ) -> Result<Tensor<B, 4>> {
        let geometry = self.geometry();

        let x = match (shared_weight, &self.conv) {
            (Some(weight), _) => conv2d(
                x,
                weight,
                None,
                ConvOptions::new([1, 1], geometry.padding, geometry.dilation, 1),
            ),
            (None, Some(conv)) => conv.forward(x),
            (None, None) => {
                return Err(ModelError::shape(format!(
                    "convolution expects weights shared from layer {:?} but none were provided",
                    geometry.weight_from
                )));
            }
        };

        let x = match &self.bn {
            Some(bn) => bn.forward(x),
            None => x,
        };

        Ok(match &self.activation {
            Some(activation) => activation.forward(x),
            None => x,
        })
    }

    /// Folds the batch-norm statistics into the convolution weights and bias.
    ///
    /// W' = W * γ / sqrt(σ² + ε)
    /// b' = β + (b - μ) * γ / sqrt(σ² + ε)
    ///
    /// Blocks without their own convolution or without batch-norm are returned
    /// unchanged, which makes the operation idempotent.
    pub fn fuse(self) -> Self {
        let (mut conv, bn) = match (self.conv, self.bn) {
            (Some(conv), Some(bn)) => (conv, bn),
            (conv, bn) => {
                return Self {
                    conv,
                    bn,
                    activation: self.activation,
                    geometry: self.geometry,
                };
            }
        };

        let weight = conv.weight.val();
        let [filters, _, _, _] = weight.dims();
        let device = weight.device();

        let scale = bn.gamma.val() / bn.running_var.value().add_scalar(bn.epsilon).sqrt();

        let bias = match &conv.bias {
            Some(bias) => bias.val(),
            None => Tensor::zeros([filters], &device),
        };

        let fused_bias = bn.beta.val() + (bias - bn.running_mean.value()) * scale.clone();
        let fused_weight = weight.clone() * scale.reshape([filters, 1, 1, 1]).expand(weight.dims());

        conv.weight = Param::from_tensor(fused_weight);
        conv.bias = Some(Param::from_tensor(fused_bias));

        Self {
            conv: Some(conv),
            bn: None,
            activation: self.activation,
            geometry: self.geometry,
        }
    }
}

/// Max pooling with darknet's stride 1 special case: a kernel 2 stride 1 pool
/// is preceded by a one pixel zero pad on the right and bottom so the output
/// keeps the input's spatial size and alignment.
#[derive(Module, Clone, Debug)]
pub struct MaxPoolLayer {
    pool: MaxPool2d,
    zero_pad: bool,
}

impl MaxPoolLayer {
    pub fn new(kernel_size: usize, stride: usize) -> Self {
        let padding = (kernel_size - 1) / 2;
        let pool = MaxPool2dConfig::new([kernel_size, kernel_size])
            .with_strides([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .init();

        Self {
            pool,
            zero_pad: kernel_size == 2 && stride == 1,
        }
    }

    pub fn forward<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = if self.zero_pad { zero_pad_br(x) } else { x };
        self.pool.forward(x)
    }
}

/// Appends one row of zeros at the bottom and one column at the right.
fn zero_pad_br<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [b, c, h, w] = x.dims();
    let device = x.device();

    let x = Tensor::cat(vec![x, Tensor::zeros([b, c, h, 1], &device)], 3);
    Tensor::cat(vec![x, Tensor::zeros([b, c, 1, w + 1], &device)], 2)
}

/// Nearest neighbour upsampling by an integer factor.
#[derive(Module, Clone, Debug)]
pub struct UpsampleLayer {
    scale_factor: usize,
}

impl UpsampleLayer {
    pub fn new(scale_factor: usize) -> Self {
        Self { scale_factor }
    }

    pub fn forward<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, h, w] = x.dims();
        resize_nearest(x, [h * self.scale_factor, w * self.scale_factor])
    }
}

pub fn resize_nearest<B: Backend>(x: Tensor<B, 4>, size: [usize; 2]) -> Tensor<B, 4> {
    interpolate(x, size, InterpolateOptions::new(InterpolateMode::Nearest))
}

/// Squeeze and excitation channel gate.
///
/// “Squeeze-and-Excitation Networks”
/// Authors: Jie Hu, Li Shen, Gang Sun
/// Link (official): https://arxiv.org/abs/1709.01507
///
#[derive(Module, Debug)]
pub struct SqueezeExcite<B: Backend> {
    pool: AdaptiveAvgPool2d,
    fc1: Linear<B>,
    fc2: Linear<B>,
}

impl<B: Backend> SqueezeExcite<B> {
    pub const REDUCTION: usize = 16;

    pub fn new(channels: usize, device: &B::Device) -> Self {
        let hidden = (channels / Self::REDUCTION).max(1);

        Self {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc1: LinearConfig::new(channels, hidden)
                .with_bias(false)
                .init(device),
            fc2: LinearConfig::new(hidden, channels)
                .with_bias(false)
                .init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, c, h, w] = x.dims();

        let y = self.pool.forward(x.clone()).reshape([b, c]);
        let y = relu(self.fc1.forward(y));
        let y = sigmoid(self.fc2.forward(y));

        x * y.reshape([b, c, 1, 1]).expand([b, c, h, w])
    }
}
