use clap::ValueEnum;
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::prelude::*;
use rayon::prelude::*;
use tracing::warn;

use crate::adapter::{argmax, RoiClassifier, TracedScores};
use crate::context::InferenceContext;
use crate::errors::{Result, SegCamError};
use crate::model::{Capabilities, SegmentationModel};

const POWER_ITERATIONS: usize = 50;

/// CAM variants, named as on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CamMethod {
    #[value(name = "gradcam")]
    GradCam,
    #[value(name = "gradcam++")]
    GradCamPlusPlus,
    #[value(name = "scorecam")]
    ScoreCam,
    #[value(name = "xgradcam")]
    XGradCam,
    #[value(name = "ablationcam")]
    AblationCam,
    #[value(name = "eigencam")]
    EigenCam,
    #[value(name = "eigengradcam")]
    EigenGradCam,
}

impl CamMethod {
    pub const ALL: [Self; 7] = [
        Self::GradCam,
        Self::GradCamPlusPlus,
        Self::ScoreCam,
        Self::XGradCam,
        Self::AblationCam,
        Self::EigenCam,
        Self::EigenGradCam,
    ];

    /// The CLI spelling, also used in artifact file names.
    pub const fn label(self) -> &'static str {
        match self {
            Self::GradCam => "gradcam",
            Self::GradCamPlusPlus => "gradcam++",
            Self::ScoreCam => "scorecam",
            Self::XGradCam => "xgradcam",
            Self::AblationCam => "ablationcam",
            Self::EigenCam => "eigencam",
            Self::EigenGradCam => "eigengradcam",
        }
    }

    pub const fn needs_gradients(self) -> bool {
        matches!(
            self,
            Self::GradCam | Self::GradCamPlusPlus | Self::XGradCam | Self::EigenGradCam
        )
    }

    pub const fn needs_ablation(self) -> bool {
        matches!(self, Self::AblationCam)
    }

    pub const fn supported_by(self, caps: Capabilities) -> bool {
        caps.activations
            && (!self.needs_gradients() || caps.gradients)
            && (!self.needs_ablation() || caps.ablation)
    }
}

/// Methods the given backend can run.
pub fn supported_methods(caps: Capabilities) -> Vec<CamMethod> {
    CamMethod::ALL
        .into_iter()
        .filter(|method| method.supported_by(caps))
        .collect()
}

/// Fails fast when the backend lacks a capability the method needs.
pub fn ensure_supported(
    method: CamMethod,
    caps: Capabilities,
    backend: &'static str,
) -> Result<()> {
    let missing = if !caps.activations {
        Some("activation traces")
    } else if method.needs_gradients() && !caps.gradients {
        Some("gradients")
    } else if method.needs_ablation() && !caps.ablation {
        Some("feature ablation")
    } else {
        None
    };
    if let Some(capability) = missing {
        let supported: Vec<_> = supported_methods(caps)
            .iter()
            .map(|method| method.label())
            .collect();
        if supported.is_empty() {
            warn!("no CAM method runs on the {backend} backend");
        } else {
            warn!(
                "methods available on the {backend} backend: {}",
                supported.join(", ")
            );
        }
        return Err(SegCamError::Unsupported {
            backend,
            capability,
        });
    }
    Ok(())
}

/// Optional smoothing passes applied on top of the base method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Smoothing {
    /// Average maps over flipped and brightness-shifted inputs.
    pub augment: bool,
    /// Replace the channel sum with a first-principal-component projection.
    pub eigen: bool,
}

pub struct CamResult {
    /// Attribution map normalized to [0, 1], shape (H, W).
    pub map: Array2<f32>,
    /// Class the map explains.
    pub target: usize,
    /// Number of classes the model predicts.
    pub classes: usize,
}

/// Computes class activation maps for one classifier and method.
pub struct CamEngine<'a, M: SegmentationModel> {
    classifier: &'a RoiClassifier<M>,
    method: CamMethod,
    smoothing: Smoothing,
    ctx: InferenceContext,
}

impl<'a, M: SegmentationModel> CamEngine<'a, M> {
    pub fn new(
        classifier: &'a RoiClassifier<M>,
        method: CamMethod,
        smoothing: Smoothing,
        ctx: InferenceContext,
    ) -> Result<Self> {
        ensure_supported(method, classifier.capabilities(), classifier.model().name())?;
        Ok(Self {
            classifier,
            method,
            smoothing,
            ctx,
        })
    }

    /// Computes the map for `target`, or for the highest reduced score when
    /// `target` is None.
    pub fn compute(&self, input: ArrayView4<f32>, target: Option<usize>) -> Result<CamResult> {
        let traced = self.classifier.forward_traced(input)?;
        let classes = traced.scores.ncols();
        let target = match target {
            Some(t) if t < classes => t,
            Some(t) => {
                return Err(SegCamError::Validation {
                    field: "target class".to_string(),
                    reason: format!("{t} exceeds the {classes} model classes"),
                })
            }
            None => argmax(traced.scores.row(0)),
        };

        let map = if self.smoothing.augment {
            self.augmented_cam(input, target)?
        } else {
            self.cam_once(input, target, Some(traced))?
        };
        Ok(CamResult {
            map,
            target,
            classes,
        })
    }

    /// One CAM pass on one input variant.
    fn cam_once(
        &self,
        input: ArrayView4<f32>,
        target: usize,
        traced: Option<TracedScores>,
    ) -> Result<Array2<f32>> {
        let traced = match traced {
            Some(traced) => traced,
            None => self.classifier.forward_traced(input)?,
        };
        let classes = traced.scores.ncols();
        let activations = traced.activations.index_axis_move(Axis(0), 0);
        let (_, _, height, width) = input.dim();

        let weighted = match self.method {
            CamMethod::GradCam | CamMethod::GradCamPlusPlus | CamMethod::XGradCam => {
                let grads = self
                    .classifier
                    .backward(input, target, classes)?
                    .activation_grads
                    .index_axis_move(Axis(0), 0);
                let weights = match self.method {
                    CamMethod::GradCam => gradcam_weights(grads.view()),
                    CamMethod::GradCamPlusPlus => {
                        gradcam_pp_weights(activations.view(), grads.view())
                    }
                    CamMethod::XGradCam => xgradcam_weights(activations.view(), grads.view()),
                    _ => unreachable!(),
                };
                apply_weights(&activations, &weights)
            }
            CamMethod::EigenCam => activations.clone(),
            CamMethod::EigenGradCam => {
                let grads = self
                    .classifier
                    .backward(input, target, classes)?
                    .activation_grads
                    .index_axis_move(Axis(0), 0);
                &grads * &activations
            }
            CamMethod::ScoreCam => {
                let weights = self.score_weights(input, activations.view(), target)?;
                apply_weights(&activations, &weights)
            }
            CamMethod::AblationCam => {
                let original = traced.scores[[0, target]];
                let weights =
                    self.ablation_weights(input, target, original, activations.dim().0)?;
                apply_weights(&activations, &weights)
            }
        };

        let eigen = self.smoothing.eigen
            || matches!(self.method, CamMethod::EigenCam | CamMethod::EigenGradCam);
        let cam = if eigen {
            principal_projection(weighted.view())?
        } else {
            weighted.sum_axis(Axis(0))
        };
        let cam = cam.mapv(|v| v.max(0.0));
        resize_map(&scale_map(&cam), height, width)
    }

    /// Averages maps over horizontal flips and brightness shifts, undoing
    /// the flip on each map before averaging.
    fn augmented_cam(&self, input: ArrayView4<f32>, target: usize) -> Result<Array2<f32>> {
        let gains = [1.0_f32, 0.9, 1.1];
        let (_, _, height, width) = input.dim();
        let mut acc = Array2::<f32>::zeros((height, width));
        for flip in [false, true] {
            for gain in gains {
                let variant = if flip {
                    input.slice(s![.., .., .., ..;-1]).to_owned() * gain
                } else {
                    input.to_owned() * gain
                };
                let cam = self.cam_once(variant.view(), target, None)?;
                if flip {
                    acc += &cam.slice(s![.., ..;-1]);
                } else {
                    acc += &cam;
                }
            }
        }
        Ok(acc / (2.0 * gains.len() as f32))
    }

    /// ScoreCAM weights: each channel is upsampled, normalized, used to mask
    /// the input, and rescored. The weights are the softmax of the target
    /// scores over the masked inputs.
    fn score_weights(
        &self,
        input: ArrayView4<f32>,
        activations: ArrayView3<f32>,
        target: usize,
    ) -> Result<Array1<f32>> {
        let channels = activations.dim().0;
        let (_, input_channels, height, width) = input.dim();

        let planes: Vec<_> = activations.outer_iter().collect();
        let masks = planes
            .into_par_iter()
            .map(|plane| -> Result<Array2<f32>> {
                let resized = resize_map(&plane.to_owned(), height, width)?;
                let min = resized.iter().fold(f32::INFINITY, |a, &b| a.min(b));
                let max = resized.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
                if max - min <= f32::EPSILON {
                    return Ok(Array2::zeros((height, width)));
                }
                Ok(resized.mapv(|v| (v - min) / (max - min)))
            })
            .collect::<Result<Vec<_>>>()?;

        let single = input.index_axis(Axis(0), 0);
        let mut scores = Vec::with_capacity(channels);
        let pb = progress_bar(channels as u64, "scorecam");
        for chunk in masks.chunks(self.ctx.batch_size.max(1)) {
            let mut batch = Array4::<f32>::zeros((chunk.len(), input_channels, height, width));
            for (i, mask) in chunk.iter().enumerate() {
                let masked = &single * &mask.view().insert_axis(Axis(0));
                batch.slice_mut(s![i, .., .., ..]).assign(&masked);
            }
            let reduced = self.classifier.forward(batch.view())?;
            for row in reduced.outer_iter() {
                scores.push(row[target]);
            }
            pb.inc(chunk.len() as u64);
        }
        pb.finish_and_clear();
        Ok(softmax(Array1::from_vec(scores).view()))
    }

    /// AblationCAM weights: the relative score drop when each feature
    /// channel is zeroed.
    fn ablation_weights(
        &self,
        input: ArrayView4<f32>,
        target: usize,
        original: f32,
        channels: usize,
    ) -> Result<Array1<f32>> {
        if original.abs() < 1e-7 {
            warn!("the target score is ~0, ablation weights are undefined and set to zero");
            return Ok(Array1::zeros(channels));
        }
        let all: Vec<usize> = (0..channels).collect();
        let mut weights = Vec::with_capacity(channels);
        let pb = progress_bar(channels as u64, "ablation");
        for chunk in all.chunks(self.ctx.batch_size.max(1)) {
            let reduced = self.classifier.scores_with_ablation(input, chunk)?;
            for row in reduced.outer_iter() {
                weights.push((original - row[target]) / original);
            }
            pb.inc(chunk.len() as u64);
        }
        pb.finish_and_clear();
        Ok(Array1::from_vec(weights))
    }
}

fn progress_bar(len: u64, label: &'static str) -> ProgressBar {
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::with_template(
        "{msg} {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
    ) {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb.set_message(label);
    pb
}

fn apply_weights(activations: &Array3<f32>, weights: &Array1<f32>) -> Array3<f32> {
    let weights = weights
        .view()
        .insert_axis(Axis(1))
        .insert_axis(Axis(2));
    activations * &weights
}

/// GradCAM: each channel weighted by the spatial mean of its gradient.
fn gradcam_weights(grads: ArrayView3<f32>) -> Array1<f32> {
    let (_, u, v) = grads.dim();
    grads.sum_axis(Axis(2)).sum_axis(Axis(1)) / (u * v) as f32
}

/// GradCAM++ alpha weighting from the second and third gradient powers.
fn gradcam_pp_weights(activations: ArrayView3<f32>, grads: ArrayView3<f32>) -> Array1<f32> {
    let grads_2 = grads.mapv(|g| g * g);
    let grads_3 = &grads_2 * &grads;
    let sum_activations = activations
        .sum_axis(Axis(2))
        .sum_axis(Axis(1))
        .insert_axis(Axis(1))
        .insert_axis(Axis(2));
    let denom = &(&grads_2 * 2.0) + &(&grads_3 * &sum_activations) + 1e-6;
    let mut aij = &grads_2 / &denom;
    aij.zip_mut_with(&grads, |a, &g| {
        if g == 0.0 {
            *a = 0.0;
        }
    });
    let relu_grads = grads.mapv(|g| g.max(0.0));
    (&relu_grads * &aij).sum_axis(Axis(2)).sum_axis(Axis(1))
}

/// XGradCAM: gradients scaled by activations and normalized per channel.
fn xgradcam_weights(activations: ArrayView3<f32>, grads: ArrayView3<f32>) -> Array1<f32> {
    let sum_activations = activations
        .sum_axis(Axis(2))
        .sum_axis(Axis(1))
        .insert_axis(Axis(1))
        .insert_axis(Axis(2))
        + 1e-7;
    (&(&grads * &activations) / &sum_activations)
        .sum_axis(Axis(2))
        .sum_axis(Axis(1))
}

fn softmax(scores: ArrayView1<f32>) -> Array1<f32> {
    let max = scores.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exp = scores.mapv(|s| (s - max).exp());
    let sum = exp.sum();
    exp / sum
}

/// Projects the channel stack onto its first principal component over
/// spatial locations. The component is found by power iteration on the
/// mean-centered Gram matrix, and the sign is fixed so the strongest
/// response is positive.
pub fn principal_projection(stack: ArrayView3<f32>) -> Result<Array2<f32>> {
    let (channels, u, v) = stack.dim();
    let locations = u * v;
    let mut flat = Array2::<f32>::zeros((locations, channels));
    for (channel, plane) in stack.outer_iter().enumerate() {
        for ((row, col), &value) in plane.indexed_iter() {
            flat[[row * v + col, channel]] = value;
        }
    }
    let means = flat
        .mean_axis(Axis(0))
        .ok_or_else(|| SegCamError::Validation {
            field: "feature maps".to_string(),
            reason: "cannot project empty activations".to_string(),
        })?;
    let centered = flat - &means;

    let gram = centered.t().dot(&centered);
    let mut component = Array1::<f32>::from_elem(channels, 1.0 / (channels as f32).sqrt());
    for _ in 0..POWER_ITERATIONS {
        let next = gram.dot(&component);
        let norm = next.mapv(|x| x * x).sum().sqrt();
        if norm <= f32::EPSILON {
            return Ok(Array2::zeros((u, v)));
        }
        component = next / norm;
    }

    let mut projection = centered.dot(&component);
    let mut max_abs = 0.0_f32;
    let mut sign = 1.0_f32;
    for &p in projection.iter() {
        if p.abs() > max_abs {
            max_abs = p.abs();
            sign = p.signum();
        }
    }
    if sign < 0.0 {
        projection.mapv_inplace(|p| -p);
    }
    Ok(Array2::from_shape_vec((u, v), projection.to_vec())?)
}

/// Min-max normalization used on every map before display.
pub fn scale_map(map: &Array2<f32>) -> Array2<f32> {
    let min = map.iter().fold(f32::INFINITY, |a, &b| a.min(b));
    let max = map.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    map.mapv(|v| (v - min) / (max - min + 1e-7))
}

/// Bilinear resize of a 2D map. Same-size calls return the map unchanged.
pub fn resize_map(map: &Array2<f32>, height: usize, width: usize) -> Result<Array2<f32>> {
    let (h, w) = map.dim();
    if (h, w) == (height, width) {
        return Ok(map.clone());
    }
    let buffer = ImageBuffer::<Luma<f32>, Vec<f32>>::from_raw(
        w as u32,
        h as u32,
        map.iter().copied().collect(),
    )
    .ok_or_else(|| SegCamError::Validation {
        field: "cam map".to_string(),
        reason: "buffer size mismatch during resize".to_string(),
    })?;
    let resized = imageops::resize(&buffer, width as u32, height as u32, FilterType::Triangle);
    Ok(Array2::from_shape_vec((height, width), resized.into_raw())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::create_stub_model;
    use crate::roi::{Roi, RoiBinding};

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    /// 背景0.5、1画素だけ2.0の正値入力。活性がすべて正になる
    fn peak_input(height: usize, width: usize, peak: (usize, usize)) -> Array4<f32> {
        let mut input = Array4::from_elem((1, 3, height, width), 0.5_f32);
        input.slice_mut(s![0, .., peak.0, peak.1]).fill(2.0);
        input
    }

    fn map_argmax(map: &Array2<f32>) -> (usize, usize) {
        let mut best = (0, 0);
        for ((row, col), &value) in map.indexed_iter() {
            if value > map[best] {
                best = (row, col);
            }
        }
        best
    }

    #[test]
    fn test_method_labels_match_cli_names() {
        assert_eq!(CamMethod::GradCamPlusPlus.label(), "gradcam++");
        assert_eq!(CamMethod::EigenGradCam.label(), "eigengradcam");
        assert_eq!(CamMethod::ALL.len(), 7);
    }

    #[test]
    fn test_supported_methods_without_gradients() {
        let caps = Capabilities {
            activations: true,
            gradients: false,
            ablation: true,
        };
        let supported = supported_methods(caps);
        assert_eq!(
            supported,
            vec![CamMethod::ScoreCam, CamMethod::AblationCam, CamMethod::EigenCam]
        );
        assert!(ensure_supported(CamMethod::GradCam, caps, "onnx").is_err());
        assert!(ensure_supported(CamMethod::ScoreCam, caps, "onnx").is_ok());
    }

    #[test]
    fn test_nothing_runs_without_activations() {
        let caps = Capabilities::default();
        assert!(supported_methods(caps).is_empty());
        let err = ensure_supported(CamMethod::EigenCam, caps, "onnx").unwrap_err();
        assert!(matches!(
            err,
            SegCamError::Unsupported {
                capability: "activation traces",
                ..
            }
        ));
    }

    #[test]
    fn test_gradcam_weights_are_spatial_means() {
        let mut grads = Array3::<f32>::zeros((2, 2, 2));
        grads.slice_mut(s![0, .., ..]).fill(1.0);
        grads[[1, 0, 1]] = 2.0;
        grads[[1, 1, 0]] = 4.0;
        grads[[1, 1, 1]] = 6.0;
        let weights = gradcam_weights(grads.view());
        assert!(close(weights[0], 1.0));
        assert!(close(weights[1], 3.0));
    }

    #[test]
    fn test_gradcam_pp_zero_gradients_give_zero_weights() {
        let activations = Array3::<f32>::ones((3, 4, 4));
        let grads = Array3::<f32>::zeros((3, 4, 4));
        let weights = gradcam_pp_weights(activations.view(), grads.view());
        assert!(weights.iter().all(|&w| w == 0.0));
    }

    #[test]
    fn test_xgradcam_weights_hand_check() {
        // 1チャンネル: 勾配1、活性は計4 → 重み = 4/(4+eps) ≈ 1
        let activations = Array3::<f32>::ones((1, 2, 2));
        let grads = Array3::<f32>::ones((1, 2, 2));
        let weights = xgradcam_weights(activations.view(), grads.view());
        assert!(close(weights[0], 1.0));
    }

    #[test]
    fn test_softmax_normalizes() {
        let scores = ndarray::arr1(&[1.0_f32, 2.0, 3.0]);
        let probs = softmax(scores.view());
        assert!(close(probs.sum(), 1.0));
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn test_principal_projection_recovers_shared_pattern() {
        // 全チャンネルが同じ空間パターンの定数倍 → 射影はそのパターンに比例
        let mut pattern = Array2::<f32>::zeros((2, 2));
        pattern[[0, 0]] = 10.0;
        let mut stack = Array3::<f32>::zeros((3, 2, 2));
        for (k, scale) in [1.0_f32, 2.0, 3.0].iter().enumerate() {
            stack.slice_mut(s![k, .., ..]).assign(&(&pattern * *scale));
        }
        let projection = principal_projection(stack.view()).unwrap();
        assert!(projection[[0, 0]] > 0.0);
        assert!(projection[[0, 0]] > projection[[1, 1]]);
        assert!(projection[[0, 1]] < 0.0);
    }

    #[test]
    fn test_scale_map_bounds() {
        let map = ndarray::arr2(&[[2.0_f32, 4.0], [6.0, 8.0]]);
        let scaled = scale_map(&map);
        assert!(close(scaled[[0, 0]], 0.0));
        assert!((scaled[[1, 1]] - 1.0).abs() < 1e-3);
        assert!(scaled.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_resize_map_dimensions() {
        let map = Array2::<f32>::ones((4, 6));
        let same = resize_map(&map, 4, 6).unwrap();
        assert_eq!(same, map);
        let up = resize_map(&map, 8, 12).unwrap();
        assert_eq!(up.dim(), (8, 12));
        assert!(up.iter().all(|&v| close(v, 1.0)));
    }

    #[test]
    fn test_every_method_highlights_the_bright_pixel() -> Result<()> {
        let classifier =
            RoiClassifier::new(create_stub_model(), RoiBinding::fixed(Roi::full(6, 5)));
        let input = peak_input(6, 5, (2, 3));
        for method in CamMethod::ALL {
            let engine = CamEngine::new(
                &classifier,
                method,
                Smoothing::default(),
                InferenceContext::cpu(),
            )?;
            let result = engine.compute(input.view(), None)?;
            // graded(4, 3) はクラス3の重みが最大
            assert_eq!(result.target, 3, "{}", method.label());
            assert_eq!(result.map.dim(), (6, 5), "{}", method.label());
            assert!(
                result.map.iter().all(|&v| (0.0..=1.0).contains(&v)),
                "{} map out of bounds",
                method.label()
            );
            assert_eq!(map_argmax(&result.map), (2, 3), "{}", method.label());
        }
        Ok(())
    }

    #[test]
    fn test_ablation_weights_are_relative_score_drops() -> Result<()> {
        // クラス3のスコアは 5.25·ΣP、1チャンネル消すと 3.5·ΣP → 重みは 1/3
        let classifier =
            RoiClassifier::new(create_stub_model(), RoiBinding::fixed(Roi::full(4, 4)));
        let engine = CamEngine::new(
            &classifier,
            CamMethod::AblationCam,
            Smoothing::default(),
            InferenceContext::cpu(),
        )?;
        let input = peak_input(4, 4, (1, 2));
        let original = classifier.forward_traced(input.view())?.scores[[0, 3]];
        assert!(original > 0.0);

        let weights = engine.ablation_weights(input.view(), 3, original, 3)?;
        assert_eq!(weights.len(), 3);
        for &weight in weights.iter() {
            assert!(close(weight, 1.0 / 3.0));
        }
        Ok(())
    }

    #[test]
    fn test_zero_original_score_gives_zero_ablation_weights() -> Result<()> {
        let classifier =
            RoiClassifier::new(create_stub_model(), RoiBinding::fixed(Roi::full(4, 4)));
        let engine = CamEngine::new(
            &classifier,
            CamMethod::AblationCam,
            Smoothing::default(),
            InferenceContext::cpu(),
        )?;
        let input = Array4::<f32>::zeros((1, 3, 4, 4));
        let weights = engine.ablation_weights(input.view(), 0, 0.0, 3)?;
        assert!(weights.iter().all(|&w| w == 0.0));
        Ok(())
    }
}
