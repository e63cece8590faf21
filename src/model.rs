use std::path::Path;

use ndarray::prelude::*;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session},
};
use parking_lot::Mutex;

use crate::context::{Device, InferenceContext};
use crate::errors::{Result, SegCamError};

/// Tensor names the ONNX export has to use.
pub const INPUT_TENSOR: &str = "input";
pub const SCORES_OUTPUT: &str = "out";
pub const FEATURES_OUTPUT: &str = "features";
pub const FEATURE_SCALE_INPUT: &str = "feature_scale";

/// What a backend can do beyond a plain forward pass.
///
/// CAM methods check these before running: gradient methods need
/// `gradients`, AblationCAM needs `ablation`, and every method needs
/// `activations`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub activations: bool,
    pub gradients: bool,
    pub ablation: bool,
}

/// Forward pass with the intermediate feature maps kept.
pub struct TracedOutput {
    /// Per-class score maps, shape (N, C, H, W).
    pub scores: Array4<f32>,
    /// Feature maps from the hooked layer, shape (N, K, u, v).
    pub activations: Array4<f32>,
}

/// Gradients from one backward pass.
#[derive(Debug)]
pub struct GradientTrace {
    /// d(loss)/d(activations), shape (N, K, u, v).
    pub activation_grads: Array4<f32>,
    /// d(loss)/d(input), shape (N, 3, H, W).
    pub input_grads: Array4<f32>,
}

/// Segmentation backend seam.
///
/// `forward` takes a normalized NCHW tensor and returns per-class score maps.
/// The backward methods take a seed tensor shaped like the score maps; the
/// loss they differentiate is `sum(seed * scores)`. Backends that cannot
/// differentiate keep the default implementations, which report the missing
/// capability.
pub trait SegmentationModel: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    fn forward(&self, input: ArrayView4<f32>) -> Result<Array4<f32>>;

    fn forward_traced(&self, input: ArrayView4<f32>) -> Result<TracedOutput>;

    fn backward(&self, _input: ArrayView4<f32>, _seed: ArrayView4<f32>) -> Result<GradientTrace> {
        Err(SegCamError::Unsupported {
            backend: self.name(),
            capability: "gradients",
        })
    }

    /// Like `backward` for the input gradient, but negative upstream
    /// gradients are clamped at every ReLU (guided backpropagation).
    fn backward_guided(
        &self,
        _input: ArrayView4<f32>,
        _seed: ArrayView4<f32>,
    ) -> Result<Array4<f32>> {
        Err(SegCamError::Unsupported {
            backend: self.name(),
            capability: "gradients",
        })
    }

    /// Runs one forward pass per entry of `channels`, zeroing that feature
    /// channel, and returns the score maps stacked along the batch axis.
    fn forward_ablated(
        &self,
        _input: ArrayView4<f32>,
        _channels: &[usize],
    ) -> Result<Array4<f32>> {
        Err(SegCamError::Unsupported {
            backend: self.name(),
            capability: "feature ablation",
        })
    }
}

/// ONNX Runtime backend.
///
/// Works with exports that follow the tensor naming above: `input` and `out`
/// are required, `features` enables activation-based CAM methods and
/// `feature_scale` enables AblationCAM. ONNX Runtime has no autograd, so the
/// gradient capabilities stay off.
pub struct OnnxSegmentation {
    session: Mutex<Session>,
    has_features: bool,
    ablation_channels: Option<usize>,
    fixed_hw: Option<(usize, usize)>,
}

impl OnnxSegmentation {
    pub fn new(model_path: &Path, ctx: &InferenceContext) -> Result<Self> {
        let builder = SessionBuilder::new().map_err(|e| SegCamError::Model {
            operation: "セッションビルダー初期化".to_string(),
            source: Box::new(e),
        })?;

        let builder = match ctx.device {
            Device::Cuda { device_id } => builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_device_id(device_id)
                        .build(),
                    CUDAExecutionProvider::default()
                        .with_device_id(device_id)
                        .build(),
                ])
                .map_err(|e| SegCamError::Model {
                    operation: "実行プロバイダー設定".to_string(),
                    source: Box::new(e),
                })?,
            Device::Cpu => builder,
        };

        let mut session = builder
            .with_memory_pattern(true)
            .map_err(|e| SegCamError::Model {
                operation: "メモリパターン設定".to_string(),
                source: Box::new(e),
            })?
            .commit_from_file(model_path)
            .map_err(|e| SegCamError::Model {
                operation: format!("モデルファイル読み込み: {}", model_path.display()),
                source: Box::new(e),
            })?;

        let input = session
            .inputs
            .iter()
            .find(|i| i.name == INPUT_TENSOR)
            .ok_or_else(|| SegCamError::Model {
                operation: "モデル入力形状取得".to_string(),
                source: Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("入力テンソル `{INPUT_TENSOR}` がありません"),
                )),
            })?;
        let fixed_hw = input.input_type.tensor_shape().and_then(|shape| {
            let h = *shape.get(2)?;
            let w = *shape.get(3)?;
            (h > 0 && w > 0).then_some((h as usize, w as usize))
        });

        if !session.outputs.iter().any(|o| o.name == SCORES_OUTPUT) {
            return Err(SegCamError::Model {
                operation: "モデル出力形状取得".to_string(),
                source: Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("出力テンソル `{SCORES_OUTPUT}` がありません"),
                )),
            });
        }
        let has_features = session.outputs.iter().any(|o| o.name == FEATURES_OUTPUT);

        let ablation_channels = match session
            .inputs
            .iter()
            .find(|i| i.name == FEATURE_SCALE_INPUT)
        {
            Some(scale) => {
                let channels = scale
                    .input_type
                    .tensor_shape()
                    .and_then(|shape| shape.get(1).copied())
                    .unwrap_or(-1);
                if channels <= 0 {
                    return Err(SegCamError::Model {
                        operation: "モデル入力形状取得".to_string(),
                        source: Box::new(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!("`{FEATURE_SCALE_INPUT}` のチャンネル数が静的ではありません"),
                        )),
                    });
                }
                Some(channels as usize)
            }
            None => None,
        };

        // initialize model
        if let Some((h, w)) = fixed_hw {
            let data = Array4::<f32>::zeros((1, 3, h, w));
            let scale = ablation_channels.map(|k| Array4::<f32>::ones((1, k, 1, 1)));
            let warmup = match &scale {
                Some(scale) => session.run(ort::inputs![
                    INPUT_TENSOR => TensorRef::from_array_view(&data)?,
                    FEATURE_SCALE_INPUT => TensorRef::from_array_view(scale)?,
                ]),
                None => session.run(ort::inputs![
                    INPUT_TENSOR => TensorRef::from_array_view(&data)?,
                ]),
            };
            warmup.map_err(|e| SegCamError::Model {
                operation: "モデル初期化実行".to_string(),
                source: Box::new(e),
            })?;
        }

        Ok(Self {
            session: Mutex::new(session),
            has_features,
            ablation_channels,
            fixed_hw,
        })
    }

    fn check_input(&self, input: &ArrayView4<f32>) -> Result<()> {
        let (_, _, h, w) = input.dim();
        if let Some((fh, fw)) = self.fixed_hw {
            if (h, w) != (fh, fw) {
                return Err(SegCamError::Validation {
                    field: "input image".to_string(),
                    reason: format!("must be {fh}x{fw} for this model, got {h}x{w}"),
                });
            }
        }
        Ok(())
    }

    /// Unit scale tensor fed whenever the export declares `feature_scale`.
    fn unit_scale(&self, batch: usize) -> Option<Array4<f32>> {
        self.ablation_channels
            .map(|k| Array4::<f32>::ones((batch, k, 1, 1)))
    }

    fn run_scores(&self, input: ArrayView4<f32>, scale: Option<Array4<f32>>) -> Result<Array4<f32>> {
        let mut binding = self.session.lock();
        let outputs = match &scale {
            Some(scale) => binding.run(ort::inputs![
                INPUT_TENSOR => TensorRef::from_array_view(&input.as_standard_layout())?,
                FEATURE_SCALE_INPUT => TensorRef::from_array_view(scale)?,
            ])?,
            None => binding.run(ort::inputs![
                INPUT_TENSOR => TensorRef::from_array_view(&input.as_standard_layout())?,
            ])?,
        };
        Ok(outputs[SCORES_OUTPUT]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned())
    }
}

impl SegmentationModel for OnnxSegmentation {
    fn name(&self) -> &'static str {
        "onnx"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            activations: self.has_features,
            gradients: false,
            ablation: self.ablation_channels.is_some(),
        }
    }

    fn forward(&self, input: ArrayView4<f32>) -> Result<Array4<f32>> {
        self.check_input(&input)?;
        let scale = self.unit_scale(input.dim().0);
        self.run_scores(input, scale)
    }

    fn forward_traced(&self, input: ArrayView4<f32>) -> Result<TracedOutput> {
        if !self.has_features {
            return Err(SegCamError::Unsupported {
                backend: self.name(),
                capability: "activation traces",
            });
        }
        self.check_input(&input)?;
        let scale = self.unit_scale(input.dim().0);
        let mut binding = self.session.lock();
        let outputs = match &scale {
            Some(scale) => binding.run(ort::inputs![
                INPUT_TENSOR => TensorRef::from_array_view(&input.as_standard_layout())?,
                FEATURE_SCALE_INPUT => TensorRef::from_array_view(scale)?,
            ])?,
            None => binding.run(ort::inputs![
                INPUT_TENSOR => TensorRef::from_array_view(&input.as_standard_layout())?,
            ])?,
        };
        let scores = outputs[SCORES_OUTPUT]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned();
        let activations = outputs[FEATURES_OUTPUT]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned();
        Ok(TracedOutput {
            scores,
            activations,
        })
    }

    fn forward_ablated(&self, input: ArrayView4<f32>, channels: &[usize]) -> Result<Array4<f32>> {
        let Some(k) = self.ablation_channels else {
            return Err(SegCamError::Unsupported {
                backend: self.name(),
                capability: "feature ablation",
            });
        };
        self.check_input(&input)?;
        let (batch, c, h, w) = input.dim();
        if batch != 1 {
            return Err(SegCamError::Validation {
                field: "ablation input".to_string(),
                reason: format!("expected a single sample, got a batch of {batch}"),
            });
        }

        let n = channels.len();
        let mut scale = Array4::<f32>::ones((n, k, 1, 1));
        for (i, &channel) in channels.iter().enumerate() {
            if channel >= k {
                return Err(SegCamError::Validation {
                    field: "ablation channel".to_string(),
                    reason: format!("{channel} exceeds the {k} feature channels"),
                });
            }
            scale[[i, channel, 0, 0]] = 0.0;
        }

        // 1サンプルをバッチ次元に複製し、行ごとに別チャンネルを消す
        let sample = input.index_axis(Axis(0), 0);
        let tiled = sample
            .broadcast((n, c, h, w))
            .ok_or_else(|| SegCamError::Validation {
                field: "ablation input".to_string(),
                reason: "could not tile the input across the batch axis".to_string(),
            })?;

        let mut binding = self.session.lock();
        let outputs = binding.run(ort::inputs![
            INPUT_TENSOR => TensorRef::from_array_view(&tiled.as_standard_layout())?,
            FEATURE_SCALE_INPUT => TensorRef::from_array_view(&scale)?,
        ])?;
        Ok(outputs[SCORES_OUTPUT]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned())
    }
}
