use ndarray::prelude::*;

use crate::adapter::RoiClassifier;
use crate::errors::{Result, SegCamError};
use crate::model::SegmentationModel;

/// Guided backpropagation against the reduced per-class score.
///
/// The backend applies the guided ReLU rule while differentiating, so the
/// engine only builds the seed through the classifier and reorders the
/// result to (H, W, 3) for rendering.
pub struct GuidedBackprop<'a, M: SegmentationModel> {
    classifier: &'a RoiClassifier<M>,
}

impl<'a, M: SegmentationModel> GuidedBackprop<'a, M> {
    pub fn new(classifier: &'a RoiClassifier<M>) -> Result<Self> {
        if !classifier.capabilities().gradients {
            return Err(SegCamError::Unsupported {
                backend: classifier.model().name(),
                capability: "gradients",
            });
        }
        Ok(Self { classifier })
    }

    /// Input-space gradient for `target`, shape (H, W, 3).
    pub fn compute(
        &self,
        input: ArrayView4<f32>,
        target: usize,
        classes: usize,
    ) -> Result<Array3<f32>> {
        let grads = self.classifier.backward_guided(input, target, classes)?;
        let grads = grads.index_axis_move(Axis(0), 0);
        Ok(grads.permuted_axes([1, 2, 0]).as_standard_layout().to_owned())
    }
}
