use std::path::Path;

use image::{ImageFormat, Rgb, Rgb32FImage, RgbImage};
use ndarray::prelude::*;
use nshare::AsNdarray3;

use crate::errors::{Result, SegCamError};

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Decodes an image into RGB with subpixels scaled to [0, 1].
pub fn load_rgb_image(path: &Path) -> Result<Rgb32FImage> {
    let image = image::open(path).map_err(|e| SegCamError::Image {
        path: path.display().to_string(),
        operation: "decode".to_string(),
        source: Box::new(e),
    })?;
    Ok(image.to_rgb32f())
}

/// ImageNet-normalized NCHW tensor for the segmentation backends.
pub fn preprocess(image: &Rgb32FImage) -> Array4<f32> {
    let mut tensor = image
        .as_ndarray3()
        .slice(s![NewAxis, .., .., ..])
        .to_owned();
    for channel in 0..3 {
        let mean = IMAGENET_MEAN[channel];
        let std = IMAGENET_STD[channel];
        tensor
            .slice_mut(s![0, channel, .., ..])
            .mapv_inplace(|v| (v - mean) / std);
    }
    tensor
}

/// Piecewise-linear jet colormap, intensity in [0, 1] to RGB in [0, 1].
pub fn jet(v: f32) -> [f32; 3] {
    let v = v.clamp(0.0, 1.0);
    let r = (1.5 - (4.0 * v - 3.0).abs()).clamp(0.0, 1.0);
    let g = (1.5 - (4.0 * v - 2.0).abs()).clamp(0.0, 1.0);
    let b = (1.5 - (4.0 * v - 1.0).abs()).clamp(0.0, 1.0);
    [r, g, b]
}

/// Blends a jet heatmap of the map onto the image and renormalizes by the
/// brightest blended value.
pub fn overlay_heatmap(image: &Rgb32FImage, cam: &Array2<f32>) -> Result<RgbImage> {
    let (width, height) = image.dimensions();
    if cam.dim() != (height as usize, width as usize) {
        let (ch, cw) = cam.dim();
        return Err(SegCamError::Validation {
            field: "cam map".to_string(),
            reason: format!("is {ch}x{cw} but the image is {height}x{width}"),
        });
    }

    let mut blended = Array3::<f32>::zeros((height as usize, width as usize, 3));
    let mut max = f32::NEG_INFINITY;
    for ((row, col), &v) in cam.indexed_iter() {
        let heat = jet(v);
        let pixel = image.get_pixel(col as u32, row as u32);
        for channel in 0..3 {
            let value = heat[channel] + pixel.0[channel];
            blended[[row, col, channel]] = value;
            max = max.max(value);
        }
    }
    let max = max.max(f32::EPSILON);

    Ok(RgbImage::from_fn(width, height, |x, y| {
        let (row, col) = (y as usize, x as usize);
        Rgb([
            (255.0 * blended[[row, col, 0]] / max) as u8,
            (255.0 * blended[[row, col, 1]] / max) as u8,
            (255.0 * blended[[row, col, 2]] / max) as u8,
        ])
    }))
}

/// Standardizes a gradient image around mid gray for display.
pub fn deprocess_gradients(grads: &Array3<f32>) -> RgbImage {
    let mean = grads.mean().unwrap_or(0.0);
    let std = grads
        .mapv(|g| (g - mean).powi(2))
        .mean()
        .unwrap_or(0.0)
        .sqrt();
    let (height, width, _) = grads.dim();
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let scale = |channel: usize| {
            let v = (grads[[y as usize, x as usize, channel]] - mean) / (std + 1e-5);
            (255.0 * (v * 0.1 + 0.5).clamp(0.0, 1.0)) as u8
        };
        Rgb([scale(0), scale(1), scale(2)])
    })
}

/// Gradients gated by the attribution map, then deprocessed.
pub fn merge_cam_gradients(cam: &Array2<f32>, grads: &Array3<f32>) -> Result<RgbImage> {
    let (height, width, _) = grads.dim();
    if cam.dim() != (height, width) {
        let (ch, cw) = cam.dim();
        return Err(SegCamError::Validation {
            field: "cam map".to_string(),
            reason: format!("is {ch}x{cw} but the gradients are {height}x{width}"),
        });
    }
    let mask = cam.view().insert_axis(Axis(2));
    let weighted = grads * &mask;
    Ok(deprocess_gradients(&weighted))
}

pub fn save_jpeg(image: &RgbImage, path: &Path) -> Result<()> {
    image
        .save_with_format(path, ImageFormat::Jpeg)
        .map_err(|e| SegCamError::Image {
            path: path.display().to_string(),
            operation: "save".to_string(),
            source: Box::new(e),
        })
}
