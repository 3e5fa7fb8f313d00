//! Fish classifier: a convolutional backbone plus a small classification head.

use std::path::Path;

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{
        activation::{sigmoid, softmax},
        backend::Backend,
        Int, Tensor,
    },
    train::ClassificationOutput,
};
use image::imageops::{self, FilterType};

use crate::error::{FiskError, FiskResult};

/// Model configuration
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// Number of classes; a single class trains a sigmoid output
    pub num_classes: usize,
    /// Square input resolution
    #[config(default = 224)]
    pub image_size: usize,
    /// Output channels of each backbone block, each block halving the resolution
    #[config(default = "vec![32, 64, 96, 128, 160]")]
    pub backbone_channels: Vec<usize>,
    #[config(default = 256)]
    pub hidden_size: usize,
    #[config(default = 0.4)]
    pub dropout: f64,
}

impl ModelConfig {
    /// Width of the output layer.
    pub fn num_outputs(&self) -> usize {
        if self.num_classes <= 1 {
            1
        } else {
            self.num_classes
        }
    }

    pub fn init_backbone<B: Backend>(&self, device: &B::Device) -> Backbone<B> {
        let mut in_channels = 3;
        let blocks = self
            .backbone_channels
            .iter()
            .map(|&out_channels| {
                let block = ConvBlock {
                    conv: Conv2dConfig::new([in_channels, out_channels], [3, 3])
                        .with_stride([2, 2])
                        .with_padding(PaddingConfig2d::Explicit(1, 1))
                        .init(device),
                    activation: Relu::new(),
                };
                in_channels = out_channels;
                block
            })
            .collect();
        Backbone { blocks }
    }

    /// Initialize the model
    pub fn init<B: Backend>(&self, device: &B::Device) -> FishClassifier<B> {
        let features = self.backbone_channels.last().copied().unwrap_or(3);
        FishClassifier {
            backbone: self.init_backbone(device),
            head: ClassificationHead {
                pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
                hidden: LinearConfig::new(features, self.hidden_size).init(device),
                activation: Relu::new(),
                dropout: DropoutConfig::new(self.dropout).init(),
                output: LinearConfig::new(self.hidden_size, self.num_outputs()).init(device),
            },
        }
    }
}

/// 3x3 stride-2 convolution followed by ReLU.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    activation: Relu,
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.activation.forward(self.conv.forward(x))
    }
}

/// Feature extractor shared with pretrained backbone records.
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
}

impl<B: Backend> Backbone<B> {
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Run all blocks, cutting the gradient after the first `frozen_blocks`.
    ///
    /// On a backend without autodiff the detach is a no-op.
    pub fn forward(&self, images: Tensor<B, 4>, frozen_blocks: usize) -> Tensor<B, 4> {
        let mut x = images;
        for (idx, block) in self.blocks.iter().enumerate() {
            x = block.forward(x);
            if idx + 1 == frozen_blocks {
                x = x.detach();
            }
        }
        x
    }
}

/// Pool -> Linear -> ReLU -> Dropout -> Linear
#[derive(Module, Debug)]
pub struct ClassificationHead<B: Backend> {
    pool: AdaptiveAvgPool2d,
    hidden: Linear<B>,
    activation: Relu,
    dropout: Dropout,
    output: Linear<B>,
}

impl<B: Backend> ClassificationHead<B> {
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, channels, _, _] = features.dims();
        let x = self.pool.forward(features).reshape([batch_size, channels]);
        let x = self.activation.forward(self.hidden.forward(x));
        let x = self.dropout.forward(x);
        self.output.forward(x)
    }

    pub fn num_outputs(&self) -> usize {
        self.output.weight.val().dims()[1]
    }
}

/// Fish classifier
///
/// # Architecture
/// - Backbone: N x {Conv 3x3 (stride 2, padding 1) + ReLU}
/// - Global average pool
/// - FC: channels -> hidden + ReLU + Dropout
/// - FC: hidden -> num_classes (softmax), or hidden -> 1 (sigmoid) for a single class
#[derive(Module, Debug)]
pub struct FishClassifier<B: Backend> {
    pub backbone: Backbone<B>,
    pub head: ClassificationHead<B>,
}

impl<B: Backend> FishClassifier<B> {
    pub fn num_outputs(&self) -> usize {
        self.head.num_outputs()
    }

    pub fn num_backbone_blocks(&self) -> usize {
        self.backbone.num_blocks()
    }

    /// Logits for a batch `[batch_size, 3, size, size]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward_frozen(images, 0)
    }

    /// Logits with gradients stopped after the first `frozen_blocks` backbone blocks.
    pub fn forward_frozen(&self, images: Tensor<B, 4>, frozen_blocks: usize) -> Tensor<B, 2> {
        let features = self.backbone.forward(images, frozen_blocks);
        self.head.forward(features)
    }

    /// Class probabilities: softmax over classes, or sigmoid for a single output.
    pub fn predict_proba(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let logits = self.forward(images);
        if self.num_outputs() == 1 {
            sigmoid(logits)
        } else {
            softmax(logits, 1)
        }
    }

    /// Forward pass with loss, for training and validation.
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
        frozen_blocks: usize,
    ) -> ClassificationOutput<B> {
        let output = self.forward_frozen(images, frozen_blocks);
        let loss = if self.num_outputs() == 1 {
            binary_cross_entropy(output.clone(), targets.clone())
        } else {
            CrossEntropyLossConfig::new()
                .init(&output.device())
                .forward(output.clone(), targets.clone())
        };

        ClassificationOutput::new(loss, output, targets)
    }
}

/// Mean BCE on the sigmoid of single-column logits.
fn binary_cross_entropy<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
    let [batch_size, _] = logits.dims();
    let eps = 1e-6;
    let probs = sigmoid(logits).clamp(eps, 1.0 - eps);
    let targets = targets.float().reshape([batch_size, 1]);
    let inverse_targets = targets.ones_like() - targets.clone();
    let inverse_probs = probs.ones_like() - probs.clone();
    -(targets * probs.log() + inverse_targets * inverse_probs.log()).mean()
}

/// Load an image and normalize it to [-1, 1], resizing to `image_size` when needed.
///
/// # Returns
/// - pixel data flattened in (C, H, W) order
pub fn load_and_normalize_image(path: &Path, image_size: usize) -> FiskResult<Vec<f32>> {
    let img = image::open(path)
        .map_err(|source| FiskError::Image {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();
    let size = image_size as u32;
    let img = if img.dimensions() == (size, size) {
        img
    } else {
        imageops::resize(&img, size, size, FilterType::Triangle)
    };

    let mut data = Vec::with_capacity(3 * image_size * image_size);
    for channel in 0..3 {
        for y in 0..size {
            for x in 0..size {
                let value = img.get_pixel(x, y)[channel] as f32;
                data.push(value / 127.5 - 1.0);
            }
        }
    }

    Ok(data)
}
