use std::io;

use anyhow::{ensure, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use seg_cam_rs::adapter::label_map;
use seg_cam_rs::render;
use seg_cam_rs::roi::{
    class_components, class_label, class_region, read_index_from, read_point_from, RegionPick,
    Roi, RoiBinding,
};
use seg_cam_rs::{
    ComponentPick, Config, OnnxSegmentation, Pipeline, RoiClassifier, RoiMode, SegmentationModel,
};

fn main() -> Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    ensure!(config.model_path.exists(), "Model path does not exist");
    ensure!(config.image_path.exists(), "Image path does not exist");

    let ctx = config.inference_context();
    if ctx.device.is_cuda() {
        info!("Using GPU for acceleration");
    } else {
        info!("Using CPU for computation");
    }

    let image = render::load_rgb_image(&config.image_path)?;
    let (height, width) = (image.height() as usize, image.width() as usize);

    let model = OnnxSegmentation::new(&config.model_path, &ctx)?;

    let (binding, pending) = match config.roi_mode()? {
        RoiMode::All => (RoiBinding::fixed(Roi::full(height, width)), None),
        RoiMode::FixedPixel => (
            RoiBinding::fixed(Roi::pixel(
                config.pixel_row,
                config.pixel_col,
                height,
                width,
            )?),
            None,
        ),
        RoiMode::InteractivePixel => {
            let provisional = Roi::pixel(config.pixel_row, config.pixel_col, height, width)?;
            let (binding, pending) = RoiBinding::pending(provisional);
            (binding, Some(pending))
        }
        RoiMode::ClassRegion => {
            let labels = predict_labels(&model, &image)?;
            let roi = select_class_region(&config, labels.view())?;
            (RoiBinding::fixed(roi), None)
        }
    };

    let classifier = RoiClassifier::new(model, binding);
    let pipeline = Pipeline::new(
        classifier,
        config.method,
        config.smoothing(),
        ctx,
        !config.skip_gb,
    )?;

    // 選択待ちはモデル検証の後に行う
    if let Some(pending) = pending {
        eprintln!("select a pixel as `row col` (image is {height}x{width})");
        let (row, col) = read_point_from(io::stdin().lock(), height, width)?;
        pending.resolve(row, col)?;
        info!("pixel ROI fixed at ({row}, {col})");
    }

    let artifacts = pipeline.run(&image, None)?;

    let output_dir = if config.save {
        config.output_dir.clone()
    } else {
        std::env::temp_dir().join(format!("seg-cam-{}", std::process::id()))
    };
    let written = artifacts.save(config.method, &output_dir)?;
    for path in &written {
        println!("{}", path.display());
    }

    Ok(())
}

fn predict_labels(
    model: &OnnxSegmentation,
    image: &image::Rgb32FImage,
) -> Result<ndarray::Array2<usize>> {
    let tensor = render::preprocess(image);
    let maps = model.forward(tensor.view())?;
    Ok(label_map(&maps))
}

fn select_class_region(config: &Config, labels: ndarray::ArrayView2<usize>) -> Result<Roi> {
    let roi = match config.component {
        ComponentPick::Largest => class_region(labels, config.class_id, RegionPick::Largest)?,
        ComponentPick::Smallest => class_region(labels, config.class_id, RegionPick::Smallest)?,
        ComponentPick::Class => class_region(labels, config.class_id, RegionPick::WholeClass)?,
        ComponentPick::Pick => {
            let mut components = class_components(labels, config.class_id)?;
            eprintln!(
                "components of class {} ({}):",
                config.class_id,
                class_label(config.class_id).unwrap_or("unnamed")
            );
            for (index, component) in components.iter().enumerate() {
                eprintln!(
                    "  [{index}] {} px, top-left ({}, {})",
                    component.size, component.top_left.0, component.top_left.1
                );
            }
            eprintln!("select a component index");
            let index = read_index_from(io::stdin().lock(), components.len())?;
            components.swap_remove(index).into_roi()
        }
    };
    info!(
        "class-region ROI covers {} of {} pixels",
        roi.selected(),
        labels.len()
    );
    Ok(roi)
}
