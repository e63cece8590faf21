pub mod adapter;
pub mod cam;
pub mod config;
pub mod context;
pub mod errors;
pub mod gb;
pub mod model;
pub mod render;
pub mod roi;

pub mod mocks;

use std::fs;
use std::path::{Path, PathBuf};

use image::{Rgb32FImage, RgbImage};
use ndarray::Array2;
use tracing::info;

pub use adapter::{label_map, RoiClassifier, TracedScores};
pub use cam::{supported_methods, CamEngine, CamMethod, CamResult, Smoothing};
pub use config::{ComponentPick, Config, RoiMode};
pub use context::{Device, InferenceContext};
pub use errors::{Result, SegCamError};
pub use gb::GuidedBackprop;
pub use model::{Capabilities, OnnxSegmentation, SegmentationModel};
pub use roi::{PendingSelection, RegionPick, Roi, RoiBinding};

#[cfg(test)]
pub use mocks::*;

/// End-to-end attribution run for one image.
///
/// Construction validates the method against the backend capabilities, so a
/// configuration the backend cannot serve fails before any inference. `run`
/// then computes the attribution map and, unless guided backprop was skipped,
/// the gradient visualizations.
#[derive(Debug)]
pub struct Pipeline<M: SegmentationModel> {
    classifier: RoiClassifier<M>,
    method: CamMethod,
    smoothing: Smoothing,
    ctx: InferenceContext,
    with_gb: bool,
}

impl<M: SegmentationModel> Pipeline<M> {
    pub fn new(
        classifier: RoiClassifier<M>,
        method: CamMethod,
        smoothing: Smoothing,
        ctx: InferenceContext,
        with_gb: bool,
    ) -> Result<Self> {
        let caps = classifier.capabilities();
        cam::ensure_supported(method, caps, classifier.model().name())?;
        if with_gb && !caps.gradients {
            return Err(SegCamError::Unsupported {
                backend: classifier.model().name(),
                capability: "gradients",
            });
        }
        Ok(Self {
            classifier,
            method,
            smoothing,
            ctx,
            with_gb,
        })
    }

    pub fn classifier(&self) -> &RoiClassifier<M> {
        &self.classifier
    }

    pub fn run(&self, image: &Rgb32FImage, target: Option<usize>) -> Result<Artifacts> {
        let tensor = render::preprocess(image);

        let engine = CamEngine::new(&self.classifier, self.method, self.smoothing, self.ctx)?;
        let result = engine.compute(tensor.view(), target)?;
        info!(
            "attribution target: class {} ({})",
            result.target,
            roi::class_label(result.target).unwrap_or("unnamed")
        );
        let cam_image = render::overlay_heatmap(image, &result.map)?;

        let (gb_image, cam_gb_image) = if self.with_gb {
            let gb = GuidedBackprop::new(&self.classifier)?;
            let grads = gb.compute(tensor.view(), result.target, result.classes)?;
            let gb_image = render::deprocess_gradients(&grads);
            let cam_gb_image = render::merge_cam_gradients(&result.map, &grads)?;
            (Some(gb_image), Some(cam_gb_image))
        } else {
            (None, None)
        };

        Ok(Artifacts {
            cam: result.map,
            target: result.target,
            cam_image,
            gb_image,
            cam_gb_image,
        })
    }
}

/// Rendered outputs of one pipeline run.
#[derive(Debug)]
pub struct Artifacts {
    /// Attribution map in [0, 1], shape (H, W).
    pub cam: Array2<f32>,
    /// Class the run explained.
    pub target: usize,
    pub cam_image: RgbImage,
    pub gb_image: Option<RgbImage>,
    pub cam_gb_image: Option<RgbImage>,
}

impl Artifacts {
    /// Writes `{method}_cam.jpg` and, when present, `{method}_gb.jpg` and
    /// `{method}_cam_gb.jpg` into `dir`. Returns the written paths.
    pub fn save(&self, method: CamMethod, dir: &Path) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(dir).map_err(|e| SegCamError::FileSystem {
            path: dir.to_path_buf(),
            operation: "出力ディレクトリ作成".to_string(),
            source: e,
        })?;

        let mut written = Vec::new();
        let path = dir.join(format!("{}_cam.jpg", method.label()));
        render::save_jpeg(&self.cam_image, &path)?;
        written.push(path);

        if let Some(gb_image) = &self.gb_image {
            let path = dir.join(format!("{}_gb.jpg", method.label()));
            render::save_jpeg(gb_image, &path)?;
            written.push(path);
        }
        if let Some(cam_gb_image) = &self.cam_gb_image {
            let path = dir.join(format!("{}_cam_gb.jpg", method.label()));
            render::save_jpeg(cam_gb_image, &path)?;
            written.push(path);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_artifacts() -> Artifacts {
        Artifacts {
            cam: Array2::zeros((2, 2)),
            target: 0,
            cam_image: RgbImage::new(2, 2),
            gb_image: Some(RgbImage::new(2, 2)),
            cam_gb_image: Some(RgbImage::new(2, 2)),
        }
    }

    #[test]
    fn test_artifact_names_follow_the_method() -> Result<()> {
        let temp = tempfile::TempDir::new()?;
        let written = sample_artifacts().save(CamMethod::GradCamPlusPlus, temp.path())?;
        let names: Vec<_> = written
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .collect();
        assert_eq!(
            names,
            vec!["gradcam++_cam.jpg", "gradcam++_gb.jpg", "gradcam++_cam_gb.jpg"]
        );
        for path in &written {
            assert!(path.exists());
        }
        Ok(())
    }

    #[test]
    fn test_save_without_gb_writes_only_the_cam() -> Result<()> {
        let temp = tempfile::TempDir::new()?;
        let artifacts = Artifacts {
            gb_image: None,
            cam_gb_image: None,
            ..sample_artifacts()
        };
        let written = artifacts.save(CamMethod::EigenCam, temp.path())?;
        assert_eq!(written.len(), 1);
        assert!(written[0].ends_with("eigencam_cam.jpg"));
        Ok(())
    }
}
