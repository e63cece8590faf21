use std::sync::atomic::{AtomicBool, Ordering};

use ndarray::prelude::*;
use tracing::warn;

use crate::errors::{Result, SegCamError};
use crate::model::{Capabilities, GradientTrace, SegmentationModel};
use crate::roi::{Roi, RoiBinding};

/// Reduced forward pass with the feature maps kept for CAM weighting.
pub struct TracedScores {
    /// Per-class scalar scores, shape (N, C).
    pub scores: Array2<f32>,
    /// Feature maps from the hooked layer, shape (N, K, u, v).
    pub activations: Array4<f32>,
}

/// Wraps a segmentation backend as a per-class scalar classifier.
///
/// Score maps of shape (N, C, H, W) are reduced to (N, C) by summing each
/// class map over the pixels the bound ROI selects. CAM attribution then
/// explains those scalars, so the maps answer "what drove this class inside
/// this region".
#[derive(Debug)]
pub struct RoiClassifier<M> {
    model: M,
    roi: RoiBinding,
    warned_empty: AtomicBool,
}

impl<M: SegmentationModel> RoiClassifier<M> {
    pub fn new(model: M, roi: RoiBinding) -> Self {
        Self {
            model,
            roi,
            warned_empty: AtomicBool::new(false),
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn roi(&self) -> &RoiBinding {
        &self.roi
    }

    pub fn capabilities(&self) -> Capabilities {
        self.model.capabilities()
    }

    /// Forward pass reduced to (N, C).
    pub fn forward(&self, input: ArrayView4<f32>) -> Result<Array2<f32>> {
        let maps = self.model.forward(input)?;
        self.reduce(maps.view())
    }

    /// Forward pass reduced to (N, C), keeping the feature maps.
    pub fn forward_traced(&self, input: ArrayView4<f32>) -> Result<TracedScores> {
        let traced = self.model.forward_traced(input)?;
        let scores = self.reduce(traced.scores.view())?;
        Ok(TracedScores {
            scores,
            activations: traced.activations,
        })
    }

    /// Reduced scores with one feature channel zeroed per row of the result.
    pub fn scores_with_ablation(
        &self,
        input: ArrayView4<f32>,
        channels: &[usize],
    ) -> Result<Array2<f32>> {
        let maps = self.model.forward_ablated(input, channels)?;
        self.reduce(maps.view())
    }

    /// Gradients of the reduced score for `target` with respect to the
    /// feature maps and the input.
    pub fn backward(
        &self,
        input: ArrayView4<f32>,
        target: usize,
        classes: usize,
    ) -> Result<GradientTrace> {
        let seed = self.seed(input.dim(), target, classes)?;
        self.model.backward(input, seed.view())
    }

    /// Guided-backpropagation input gradient for the reduced `target` score.
    pub fn backward_guided(
        &self,
        input: ArrayView4<f32>,
        target: usize,
        classes: usize,
    ) -> Result<Array4<f32>> {
        let seed = self.seed(input.dim(), target, classes)?;
        self.model.backward_guided(input, seed.view())
    }

    /// Upstream gradient of the reduction: the ROI indicator on the target
    /// class channel, zero everywhere else.
    fn seed(
        &self,
        input_dim: (usize, usize, usize, usize),
        target: usize,
        classes: usize,
    ) -> Result<Array4<f32>> {
        let (n, _, h, w) = input_dim;
        if target >= classes {
            return Err(SegCamError::Validation {
                field: "target class".to_string(),
                reason: format!("{target} exceeds the {classes} model classes"),
            });
        }
        let roi = self.roi.snapshot();
        if roi.dimensions() != (h, w) {
            let (rh, rw) = roi.dimensions();
            return Err(SegCamError::Validation {
                field: "roi".to_string(),
                reason: format!("selector is {rh}x{rw} but the score maps are {h}x{w}"),
            });
        }
        let mut seed = Array4::zeros((n, classes, h, w));
        seed.slice_mut(s![.., target, .., ..]).assign(&roi.mask_f32());
        Ok(seed)
    }

    fn reduce(&self, scores: ArrayView4<f32>) -> Result<Array2<f32>> {
        let roi = self.roi.snapshot();
        let (_, _, h, w) = scores.dim();
        if roi.dimensions() != (h, w) {
            let (rh, rw) = roi.dimensions();
            return Err(SegCamError::Validation {
                field: "roi".to_string(),
                reason: format!("selector is {rh}x{rw} but the score maps are {h}x{w}"),
            });
        }
        if roi.is_empty() && !self.warned_empty.swap(true, Ordering::Relaxed) {
            warn!("the ROI selects no pixels, every class score reduces to zero");
        }

        let reduced = match &roi {
            // 単一画素は総和を取らずスライスで厳密に返す
            Roi::Pixel { row, col, .. } => scores.slice(s![.., .., *row, *col]).to_owned(),
            Roi::Full { .. } => scores.sum_axis(Axis(3)).sum_axis(Axis(2)),
            Roi::Region { .. } => {
                let mask = roi.mask_f32().insert_axis(Axis(0)).insert_axis(Axis(0));
                let weighted = &scores * &mask;
                weighted.sum_axis(Axis(3)).sum_axis(Axis(2))
            }
        };
        Ok(reduced)
    }
}

/// Per-pixel argmax over the class axis for the first sample, shape (H, W).
pub fn label_map(scores: &Array4<f32>) -> Array2<usize> {
    let maps = scores.index_axis(Axis(0), 0);
    let (classes, height, width) = maps.dim();
    Array2::from_shape_fn((height, width), |(row, col)| {
        let mut best = 0;
        for class in 1..classes {
            if maps[[class, row, col]] > maps[[best, row, col]] {
                best = class;
            }
        }
        best
    })
}

/// Index of the first strict maximum. Ties, including an all-zero row from
/// an empty ROI, resolve to the lowest class id.
pub(crate) fn argmax(row: ArrayView1<f32>) -> usize {
    let mut best = 0;
    for (index, &value) in row.iter().enumerate() {
        if value > row[best] {
            best = index;
        }
    }
    best
}
