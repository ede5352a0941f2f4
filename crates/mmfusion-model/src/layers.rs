//! Serializable layer specifications and the [`Sequential`] runtime.
//!
//! A [`LayerSpec`] only names the output width of a layer; input widths are
//! inferred from the previous layer's [`FeatureShape`], so the same spec list
//! can sit on top of any compatible base.
//!
//! Parameters of layer `i` live under `"{i}.weight"` and `"{i}.bias"`.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Conv2dConfig, ModuleT, VarBuilder};
use mmfusion_core::{FusionError, InputShape, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Element-wise output activation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
    Softmax,
}

impl Activation {
    fn apply(self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Activation::Linear => Ok(xs.clone()),
            Activation::Relu => xs.relu(),
            Activation::Softmax => candle_nn::ops::softmax(xs, D::Minus1),
        }
    }
}

/// Convolution border handling (stride is always 1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    #[default]
    Valid,
    Same,
}

/// One layer of a network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    Conv2d {
        filters: usize,
        kernel_size: usize,
        #[serde(default)]
        padding: Padding,
        #[serde(default)]
        activation: Activation,
        /// Input shape declared on the first layer of a plain stack.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_shape: Option<InputShape>,
    },
    MaxPool2d {
        size: usize,
    },
    Flatten {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_shape: Option<InputShape>,
    },
    Dense {
        units: usize,
        #[serde(default)]
        activation: Activation,
    },
    Dropout {
        rate: f32,
    },
}

impl LayerSpec {
    pub fn dense(units: usize, activation: Activation) -> Self {
        LayerSpec::Dense { units, activation }
    }

    pub fn dropout(rate: f32) -> Self {
        LayerSpec::Dropout { rate }
    }

    pub fn conv2d(filters: usize, kernel_size: usize, padding: Padding, activation: Activation) -> Self {
        LayerSpec::Conv2d {
            filters,
            kernel_size,
            padding,
            activation,
            input_shape: None,
        }
    }

    /// Input shape this layer declares, if any.
    pub fn declared_input(&self) -> Option<InputShape> {
        match self {
            LayerSpec::Conv2d { input_shape, .. } | LayerSpec::Flatten { input_shape } => *input_shape,
            _ => None,
        }
    }

    /// Shape produced by this layer for `input`.
    pub fn output_shape(&self, input: FeatureShape) -> Result<FeatureShape> {
        match (self, input) {
            (
                LayerSpec::Conv2d {
                    filters,
                    kernel_size,
                    padding,
                    ..
                },
                FeatureShape::Spatial { height, width, .. },
            ) => {
                if *filters == 0 || *kernel_size == 0 {
                    return Err(FusionError::Shape("conv2d needs filters and kernel_size > 0".into()));
                }
                let (height, width) = match padding {
                    Padding::Same => {
                        if kernel_size % 2 == 0 {
                            return Err(FusionError::Shape(format!(
                                "'same' padding needs an odd kernel, got {kernel_size}"
                            )));
                        }
                        (height, width)
                    }
                    Padding::Valid => {
                        if height < *kernel_size || width < *kernel_size {
                            return Err(FusionError::Shape(format!(
                                "conv2d kernel {kernel_size} larger than input {height}x{width}"
                            )));
                        }
                        (height - kernel_size + 1, width - kernel_size + 1)
                    }
                };
                Ok(FeatureShape::Spatial {
                    channels: *filters,
                    height,
                    width,
                })
            }
            (LayerSpec::MaxPool2d { size }, FeatureShape::Spatial { channels, height, width }) => {
                if *size == 0 || height < *size || width < *size {
                    return Err(FusionError::Shape(format!(
                        "max_pool2d size {size} invalid for {height}x{width}"
                    )));
                }
                Ok(FeatureShape::Spatial {
                    channels,
                    height: height / size,
                    width: width / size,
                })
            }
            (LayerSpec::Flatten { .. }, shape) => Ok(FeatureShape::Flat(shape.numel())),
            (LayerSpec::Dense { units, .. }, FeatureShape::Flat(_)) => {
                if *units == 0 {
                    return Err(FusionError::Shape("dense needs units > 0".into()));
                }
                Ok(FeatureShape::Flat(*units))
            }
            (LayerSpec::Dropout { rate }, shape) => {
                if !(0.0..1.0).contains(rate) {
                    return Err(FusionError::Shape(format!("dropout rate {rate} not in [0, 1)")));
                }
                Ok(shape)
            }
            (spec, shape) => Err(FusionError::Shape(format!(
                "{} cannot follow a {shape} feature map",
                spec.kind()
            ))),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            LayerSpec::Conv2d { .. } => "conv2d",
            LayerSpec::MaxPool2d { .. } => "max_pool2d",
            LayerSpec::Flatten { .. } => "flatten",
            LayerSpec::Dense { .. } => "dense",
            LayerSpec::Dropout { .. } => "dropout",
        }
    }
}

/// Per-sample feature shape flowing between layers (batch axis excluded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureShape {
    /// Channel-first feature map.
    Spatial {
        channels: usize,
        height: usize,
        width: usize,
    },
    Flat(usize),
}

impl FeatureShape {
    pub fn numel(&self) -> usize {
        match *self {
            FeatureShape::Spatial {
                channels,
                height,
                width,
            } => channels * height * width,
            FeatureShape::Flat(n) => n,
        }
    }

    /// Width of a flat shape, `None` for feature maps.
    pub fn flat_width(&self) -> Option<usize> {
        match *self {
            FeatureShape::Flat(n) => Some(n),
            FeatureShape::Spatial { .. } => None,
        }
    }
}

impl From<InputShape> for FeatureShape {
    fn from(shape: InputShape) -> Self {
        FeatureShape::Spatial {
            channels: shape.channels,
            height: shape.height,
            width: shape.width,
        }
    }
}

impl std::fmt::Display for FeatureShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeatureShape::Spatial {
                channels,
                height,
                width,
            } => write!(f, "{channels}x{height}x{width}"),
            FeatureShape::Flat(n) => write!(f, "flat({n})"),
        }
    }
}

#[derive(Debug, Clone)]
enum Layer {
    Conv2d {
        conv: candle_nn::Conv2d,
        activation: Activation,
    },
    MaxPool2d(usize),
    Flatten,
    Dense {
        linear: candle_nn::Linear,
        activation: Activation,
    },
    Dropout(candle_nn::Dropout),
}

/// A plain stack of layers.
#[derive(Debug, Clone)]
pub struct Sequential {
    specs: Vec<LayerSpec>,
    layers: Vec<Layer>,
    input: FeatureShape,
    output: FeatureShape,
}

impl Sequential {
    /// A stack with no layers; forwards its input unchanged.
    pub fn empty(input: FeatureShape) -> Self {
        Self {
            specs: Vec::new(),
            layers: Vec::new(),
            input,
            output: input,
        }
    }

    /// Build layers for `specs` on top of `input`, drawing parameters from `vb`.
    pub fn build(specs: &[LayerSpec], input: FeatureShape, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(specs.len());
        let mut shape = input;

        for (i, spec) in specs.iter().enumerate() {
            let next = spec.output_shape(shape)?;
            let vb = vb.pp(i.to_string());
            let layer = match (spec, shape) {
                (
                    LayerSpec::Conv2d {
                        filters,
                        kernel_size,
                        padding,
                        activation,
                        ..
                    },
                    FeatureShape::Spatial { channels, .. },
                ) => {
                    let cfg = Conv2dConfig {
                        padding: match padding {
                            Padding::Same => kernel_size / 2,
                            Padding::Valid => 0,
                        },
                        ..Default::default()
                    };
                    let conv = candle_nn::conv2d(channels, *filters, *kernel_size, cfg, vb)
                        .map_err(|e| FusionError::Model(format!("Failed to create layer {i} (conv2d): {e}")))?;
                    Layer::Conv2d {
                        conv,
                        activation: *activation,
                    }
                }
                (LayerSpec::MaxPool2d { size }, _) => Layer::MaxPool2d(*size),
                (LayerSpec::Flatten { .. }, _) => Layer::Flatten,
                (LayerSpec::Dense { units, activation }, FeatureShape::Flat(in_dim)) => {
                    let linear = candle_nn::linear(in_dim, *units, vb)
                        .map_err(|e| FusionError::Model(format!("Failed to create layer {i} (dense): {e}")))?;
                    Layer::Dense {
                        linear,
                        activation: *activation,
                    }
                }
                (LayerSpec::Dropout { rate }, _) => Layer::Dropout(candle_nn::Dropout::new(*rate)),
                // output_shape already rejected every other pairing
                (spec, shape) => {
                    return Err(FusionError::Shape(format!(
                        "{} cannot follow a {shape} feature map",
                        spec.kind()
                    )))
                }
            };
            layers.push(layer);
            shape = next;
        }

        Ok(Self {
            specs: specs.to_vec(),
            layers,
            input,
            output: shape,
        })
    }

    /// Rebuild from named tensors (`"{i}.weight"`, `"{i}.bias"`).
    ///
    /// The tensors are used as constants: the result has no trainable variables.
    pub fn from_tensors(
        specs: &[LayerSpec],
        input: FeatureShape,
        tensors: HashMap<String, Tensor>,
        device: &Device,
    ) -> Result<Self> {
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        Self::build(specs, input, vb)
    }

    pub fn specs(&self) -> &[LayerSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn input_shape(&self) -> FeatureShape {
        self.input
    }

    pub fn output_shape(&self) -> FeatureShape {
        self.output
    }

    /// Parameters keyed `"{i}.weight"` / `"{i}.bias"`.
    pub fn named_tensors(&self) -> Vec<(String, Tensor)> {
        let mut out = Vec::new();
        for (i, layer) in self.layers.iter().enumerate() {
            let (weight, bias) = match layer {
                Layer::Conv2d { conv, .. } => (conv.weight(), conv.bias()),
                Layer::Dense { linear, .. } => (linear.weight(), linear.bias()),
                _ => continue,
            };
            out.push((format!("{i}.weight"), weight.clone()));
            if let Some(bias) = bias {
                out.push((format!("{i}.bias"), bias.clone()));
            }
        }
        out
    }

    /// Copy of this stack whose parameters are detached constants.
    pub fn frozen(&self) -> Result<Self> {
        let Some(device) = self.named_tensors().first().map(|(_, t)| t.device().clone()) else {
            return Ok(self.clone());
        };
        Self::from_tensors(&self.specs, self.input, detached(self.named_tensors())?, &device)
    }

    /// Copy of this stack without its final layer.
    pub fn truncate_last(&self) -> Result<Self> {
        if self.layers.is_empty() {
            return Err(FusionError::Shape(
                "cannot cut the final layer of an empty network".to_string(),
            ));
        }
        let keep = self.layers.len() - 1;
        let mut shape = self.input;
        for spec in &self.specs[..keep] {
            shape = spec.output_shape(shape)?;
        }
        Ok(Self {
            specs: self.specs[..keep].to_vec(),
            layers: self.layers[..keep].to_vec(),
            input: self.input,
            output: shape,
        })
    }

    /// Frozen stack running `self` then `next`.
    pub fn frozen_concat(&self, next: &Sequential, device: &Device) -> Result<Self> {
        if self.output != next.input {
            return Err(FusionError::Shape(format!(
                "cannot stack a network taking {} on one producing {}",
                next.input, self.output
            )));
        }
        let offset = self.layers.len();
        let mut tensors = self.named_tensors();
        for (name, t) in next.named_tensors() {
            let (idx, param) = name
                .split_once('.')
                .ok_or_else(|| FusionError::Model(format!("unexpected parameter name {name}")))?;
            let idx: usize = idx
                .parse()
                .map_err(|_| FusionError::Model(format!("unexpected parameter name {name}")))?;
            tensors.push((format!("{}.{param}", idx + offset), t));
        }
        let specs: Vec<LayerSpec> = self.specs.iter().chain(next.specs.iter()).cloned().collect();
        Self::from_tensors(&specs, self.input, detached(tensors)?, device)
    }

    /// Forward pass. With `logits`, a trailing softmax is left out.
    ///
    /// Spatial inputs are channel-first `[B, C, H, W]`.
    pub fn forward_logits_t(&self, xs: &Tensor, train: bool, logits: bool) -> candle_core::Result<Tensor> {
        let last = self.layers.len().saturating_sub(1);
        let mut xs = xs.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            let skip_softmax = logits && i == last;
            xs = match layer {
                Layer::Conv2d { conv, activation } => {
                    activation.apply(&candle_nn::Module::forward(conv, &xs)?)?
                }
                Layer::MaxPool2d(size) => xs.max_pool2d(*size)?,
                Layer::Flatten => xs.flatten_from(1)?,
                Layer::Dense { linear, activation } => {
                    let ys = candle_nn::Module::forward(linear, &xs)?;
                    if skip_softmax && *activation == Activation::Softmax {
                        ys
                    } else {
                        activation.apply(&ys)?
                    }
                }
                Layer::Dropout(dropout) => dropout.forward_t(&xs, train)?,
            };
        }
        Ok(xs)
    }
}

impl ModuleT for Sequential {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        self.forward_logits_t(xs, train, false)
    }
}

fn detached(tensors: Vec<(String, Tensor)>) -> Result<HashMap<String, Tensor>> {
    tensors
        .into_iter()
        .map(|(name, t)| Ok((name, t.copy()?.detach())))
        .collect()
}

/// `[B, H, W, C]` (or a single `[H, W, C]`) → contiguous `[B, C, H, W]`.
pub fn to_channels_first(xs: &Tensor) -> candle_core::Result<Tensor> {
    let xs = if xs.rank() == 3 { xs.unsqueeze(0)? } else { xs.clone() };
    xs.permute((0, 3, 1, 2))?.contiguous()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn spatial(c: usize, h: usize, w: usize) -> FeatureShape {
        FeatureShape::Spatial {
            channels: c,
            height: h,
            width: w,
        }
    }

    fn small_cnn() -> Vec<LayerSpec> {
        vec![
            LayerSpec::conv2d(4, 3, Padding::Same, Activation::Relu),
            LayerSpec::MaxPool2d { size: 4 },
            LayerSpec::Flatten { input_shape: None },
            LayerSpec::dense(8, Activation::Relu),
            LayerSpec::dense(3, Activation::Softmax),
        ]
    }

    #[test]
    fn test_shape_inference() {
        let specs = small_cnn();
        let mut shape = spatial(1, 64, 64);
        let expected = [
            spatial(4, 64, 64),
            spatial(4, 16, 16),
            FeatureShape::Flat(1024),
            FeatureShape::Flat(8),
            FeatureShape::Flat(3),
        ];
        for (spec, want) in specs.iter().zip(expected) {
            shape = spec.output_shape(shape).unwrap();
            assert_eq!(shape, want);
        }
    }

    #[test]
    fn test_valid_padding_shrinks() {
        let spec = LayerSpec::conv2d(2, 5, Padding::Valid, Activation::Linear);
        assert_eq!(spec.output_shape(spatial(1, 64, 64)).unwrap(), spatial(2, 60, 60));
        let even = LayerSpec::conv2d(2, 4, Padding::Same, Activation::Linear);
        assert!(even.output_shape(spatial(1, 64, 64)).is_err());
    }

    #[test]
    fn test_dense_on_feature_map_rejected() {
        let spec = LayerSpec::dense(8, Activation::Relu);
        assert!(spec.output_shape(spatial(1, 8, 8)).is_err());
    }

    #[test]
    fn test_spec_json_shape() {
        let spec = LayerSpec::dense(128, Activation::Relu);
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, r#"{"type":"dense","units":128,"activation":"relu"}"#);
        let back: LayerSpec = serde_json::from_str(r#"{"type":"dropout","rate":0.3}"#).unwrap();
        assert_eq!(back, LayerSpec::dropout(0.3));
    }

    #[test]
    fn test_forward_shapes_and_softmax() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let net = Sequential::build(&small_cnn(), spatial(1, 64, 64), vb).unwrap();
        assert_eq!(net.output_shape(), FeatureShape::Flat(3));

        let xs = Tensor::rand(0f32, 1f32, (2, 1, 64, 64), &device).unwrap();
        let probs = net.forward_t(&xs, false).unwrap();
        assert_eq!(probs.dims(), &[2, 3]);
        let sums: Vec<f32> = probs.sum(1).unwrap().to_vec1().unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_named_tensors_and_frozen_copy() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let net = Sequential::build(&small_cnn(), spatial(1, 64, 64), vb).unwrap();
        let names: Vec<String> = net.named_tensors().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec!["0.weight", "0.bias", "3.weight", "3.bias", "4.weight", "4.bias"]
        );

        let frozen = net.frozen().unwrap();
        let xs = Tensor::rand(0f32, 1f32, (1, 1, 64, 64), &device).unwrap();
        let a: Vec<f32> = net.forward_t(&xs, false).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = frozen.forward_t(&xs, false).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_truncate_last_exposes_penultimate() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let net = Sequential::build(&small_cnn(), spatial(1, 64, 64), vb).unwrap();
        let cut = net.truncate_last().unwrap();
        assert_eq!(cut.len(), 4);
        assert_eq!(cut.output_shape(), FeatureShape::Flat(8));
        assert!(Sequential::empty(FeatureShape::Flat(3)).truncate_last().is_err());
    }

    #[test]
    fn test_frozen_concat_renumbers() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let a = Sequential::build(
            &[LayerSpec::dense(6, Activation::Relu)],
            FeatureShape::Flat(4),
            vb.pp("a"),
        )
        .unwrap();
        let b = Sequential::build(
            &[LayerSpec::dropout(0.2), LayerSpec::dense(3, Activation::Softmax)],
            FeatureShape::Flat(6),
            vb.pp("b"),
        )
        .unwrap();
        let joined = a.frozen_concat(&b, &device).unwrap();
        assert_eq!(joined.len(), 3);
        let names: Vec<String> = joined.named_tensors().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["0.weight", "0.bias", "2.weight", "2.bias"]);
        assert!(b.frozen_concat(&a, &device).is_err());
    }

    #[test]
    fn test_to_channels_first() {
        let device = Device::Cpu;
        let single = Tensor::zeros((64, 64, 1), DType::F32, &device).unwrap();
        assert_eq!(to_channels_first(&single).unwrap().dims(), &[1, 1, 64, 64]);
        let batch = Tensor::zeros((5, 64, 64, 1), DType::F32, &device).unwrap();
        assert_eq!(to_channels_first(&batch).unwrap().dims(), &[5, 1, 64, 64]);
    }
}
