use ndarray::prelude::*;

use crate::errors::{Result, SegCamError};
use crate::model::{Capabilities, GradientTrace, SegmentationModel, TracedOutput};

/// テスト用の線形セグメンテーションモデル
///
/// The whole network is linear: pixel intensity is the channel mean of the
/// input, feature map `k` is `gain[k] * intensity`, and class map `c` is
/// `sum_k weights[c][k] * feature_k`. Every gradient therefore has a closed
/// form, which makes the full pipeline checkable by hand. Guided
/// backpropagation equals plain backpropagation because there is no ReLU.
#[derive(Debug, Clone)]
pub struct LinearStubModel {
    channel_gain: Array1<f32>,
    class_weights: Array2<f32>,
    capabilities: Capabilities,
}

impl LinearStubModel {
    pub fn new(channel_gain: Vec<f32>, class_weights: Array2<f32>) -> Self {
        Self {
            channel_gain: Array1::from_vec(channel_gain),
            class_weights,
            capabilities: Capabilities {
                activations: true,
                gradients: true,
                ablation: true,
            },
        }
    }

    /// Unit gains with per-class weights 1 + c/4, so class scores are
    /// strictly ordered and the argmax is unambiguous.
    pub fn graded(classes: usize, channels: usize) -> Self {
        let weights =
            Array2::from_shape_fn((classes, channels), |(c, _)| 1.0 + 0.25 * c as f32);
        Self::new(vec![1.0; channels], weights)
    }

    /// Drops everything but plain forwards, for capability gating tests.
    pub fn forward_only(mut self) -> Self {
        self.capabilities = Capabilities {
            activations: true,
            gradients: false,
            ablation: false,
        };
        self
    }

    pub fn classes(&self) -> usize {
        self.class_weights.nrows()
    }

    pub fn channels(&self) -> usize {
        self.channel_gain.len()
    }

    fn intensity(&self, input: ArrayView4<f32>) -> Array3<f32> {
        let channels = input.dim().1 as f32;
        input.sum_axis(Axis(1)) / channels
    }

    fn feature_maps(&self, intensity: &Array3<f32>) -> Array4<f32> {
        let (n, h, w) = intensity.dim();
        let mut features = Array4::zeros((n, self.channels(), h, w));
        for (k, &gain) in self.channel_gain.iter().enumerate() {
            features
                .slice_mut(s![.., k, .., ..])
                .assign(&(intensity * gain));
        }
        features
    }

    fn score_maps(&self, features: &Array4<f32>) -> Array4<f32> {
        let (n, _, h, w) = features.dim();
        let mut scores = Array4::zeros((n, self.classes(), h, w));
        for c in 0..self.classes() {
            let mut acc = Array3::<f32>::zeros((n, h, w));
            for k in 0..self.channels() {
                acc += &(&features.slice(s![.., k, .., ..]) * self.class_weights[[c, k]]);
            }
            scores.slice_mut(s![.., c, .., ..]).assign(&acc);
        }
        scores
    }
}

impl SegmentationModel for LinearStubModel {
    fn name(&self) -> &'static str {
        "linear-stub"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn forward(&self, input: ArrayView4<f32>) -> Result<Array4<f32>> {
        let features = self.feature_maps(&self.intensity(input));
        Ok(self.score_maps(&features))
    }

    fn forward_traced(&self, input: ArrayView4<f32>) -> Result<TracedOutput> {
        let features = self.feature_maps(&self.intensity(input));
        let scores = self.score_maps(&features);
        Ok(TracedOutput {
            scores,
            activations: features,
        })
    }

    fn backward(&self, input: ArrayView4<f32>, seed: ArrayView4<f32>) -> Result<GradientTrace> {
        let (n, classes, h, w) = seed.dim();
        if classes != self.classes() {
            return Err(SegCamError::Validation {
                field: "seed".to_string(),
                reason: format!("has {classes} classes, the model has {}", self.classes()),
            });
        }

        // dL/dA_k = sum_c seed_c * W[c][k]
        let mut activation_grads = Array4::zeros((n, self.channels(), h, w));
        for k in 0..self.channels() {
            let mut acc = Array3::<f32>::zeros((n, h, w));
            for c in 0..classes {
                acc += &(&seed.slice(s![.., c, .., ..]) * self.class_weights[[c, k]]);
            }
            activation_grads.slice_mut(s![.., k, .., ..]).assign(&acc);
        }

        // dL/dI = sum_k dL/dA_k * gain_k, split evenly over input channels
        let mut intensity_grad = Array3::<f32>::zeros((n, h, w));
        for (k, &gain) in self.channel_gain.iter().enumerate() {
            intensity_grad += &(&activation_grads.slice(s![.., k, .., ..]) * gain);
        }
        let input_channels = input.dim().1;
        let per_channel = intensity_grad / input_channels as f32;
        let mut input_grads = Array4::zeros((n, input_channels, h, w));
        for channel in 0..input_channels {
            input_grads
                .slice_mut(s![.., channel, .., ..])
                .assign(&per_channel);
        }

        Ok(GradientTrace {
            activation_grads,
            input_grads,
        })
    }

    fn backward_guided(&self, input: ArrayView4<f32>, seed: ArrayView4<f32>) -> Result<Array4<f32>> {
        // 線形モデルなので guided と通常の勾配は一致する
        Ok(self.backward(input, seed)?.input_grads)
    }

    fn forward_ablated(&self, input: ArrayView4<f32>, channels: &[usize]) -> Result<Array4<f32>> {
        let (batch, _, h, w) = input.dim();
        if batch != 1 {
            return Err(SegCamError::Validation {
                field: "ablation input".to_string(),
                reason: format!("expected a single sample, got a batch of {batch}"),
            });
        }
        let intensity = self.intensity(input);
        let base = intensity.index_axis(Axis(0), 0);

        let mut out = Array4::zeros((channels.len(), self.classes(), h, w));
        for (i, &muted) in channels.iter().enumerate() {
            if muted >= self.channels() {
                return Err(SegCamError::Validation {
                    field: "ablation channel".to_string(),
                    reason: format!("{muted} exceeds the {} feature channels", self.channels()),
                });
            }
            for c in 0..self.classes() {
                let mut acc = Array2::<f32>::zeros((h, w));
                for k in 0..self.channels() {
                    if k == muted {
                        continue;
                    }
                    acc += &(&base * (self.class_weights[[c, k]] * self.channel_gain[k]));
                }
                out.slice_mut(s![i, c, .., ..]).assign(&acc);
            }
        }
        Ok(out)
    }
}

/// テスト用のファクトリー関数
pub fn create_stub_model() -> LinearStubModel {
    LinearStubModel::graded(4, 3)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_input() -> Array4<f32> {
        Array4::from_shape_fn((1, 3, 2, 2), |(_, c, y, x)| {
            0.1 + 0.2 * c as f32 + 0.3 * y as f32 + 0.4 * x as f32
        })
    }

    #[test]
    fn test_forward_shapes() {
        let model = create_stub_model();
        let input = Array4::<f32>::zeros((2, 3, 4, 5));
        let scores = model.forward(input.view()).unwrap();
        assert_eq!(scores.dim(), (2, 4, 4, 5));

        let traced = model.forward_traced(input.view()).unwrap();
        assert_eq!(traced.activations.dim(), (2, 3, 4, 5));
    }

    #[test]
    fn test_activation_gradients_have_closed_form() {
        let model = create_stub_model();
        let input = sample_input();
        let mut seed = Array4::<f32>::zeros((1, 4, 2, 2));
        seed[[0, 1, 0, 1]] = 1.0;

        let trace = model.backward(input.view(), seed.view()).unwrap();
        // dL/dA_k は選択画素でのみ W[1][k]
        for k in 0..3 {
            assert_eq!(trace.activation_grads[[0, k, 0, 1]], 1.25);
            assert_eq!(trace.activation_grads[[0, k, 0, 0]], 0.0);
        }
    }

    #[test]
    fn test_input_gradients_match_finite_differences() {
        let model = create_stub_model();
        let input = sample_input();
        let mut seed = Array4::<f32>::zeros((1, 4, 2, 2));
        seed[[0, 2, 1, 0]] = 1.0;
        seed[[0, 0, 0, 0]] = 0.5;

        let loss = |input: &Array4<f32>| -> f32 {
            let scores = model.forward(input.view()).unwrap();
            (&scores * &seed).sum()
        };

        let trace = model.backward(input.view(), seed.view()).unwrap();
        let h = 1e-2;
        for &(c, y, x) in &[(0, 0, 0), (1, 1, 0), (2, 0, 1)] {
            let mut plus = input.clone();
            plus[[0, c, y, x]] += h;
            let mut minus = input.clone();
            minus[[0, c, y, x]] -= h;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * h);
            let analytic = trace.input_grads[[0, c, y, x]];
            assert!(
                (numeric - analytic).abs() < 1e-3,
                "channel {c} pixel ({y}, {x}): numeric {numeric} vs analytic {analytic}"
            );
        }
    }

    #[test]
    fn test_guided_equals_plain_for_linear_model() {
        let model = create_stub_model();
        let input = sample_input();
        let mut seed = Array4::<f32>::zeros((1, 4, 2, 2));
        seed[[0, 3, 0, 0]] = 1.0;
        let plain = model.backward(input.view(), seed.view()).unwrap().input_grads;
        let guided = model.backward_guided(input.view(), seed.view()).unwrap();
        assert_eq!(plain, guided);
    }

    #[test]
    fn test_ablation_removes_one_channel_contribution() {
        let model = create_stub_model();
        let input = sample_input();
        let full = model.forward(input.view()).unwrap();
        let ablated = model.forward_ablated(input.view(), &[1, 2]).unwrap();
        assert_eq!(ablated.dim(), (2, 4, 2, 2));

        // ぬいたチャンネルの寄与は W[c][k] * gain_k * I
        let intensity = input.sum_axis(Axis(1)) / 3.0;
        let expected = full[[0, 0, 1, 1]] - 1.0 * intensity[[0, 1, 1]];
        assert!((ablated[[0, 0, 1, 1]] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_forward_only_strips_capabilities() {
        let model = create_stub_model().forward_only();
        let caps = model.capabilities();
        assert!(caps.activations);
        assert!(!caps.gradients);
        assert!(!caps.ablation);
    }
}
