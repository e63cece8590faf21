use std::collections::HashMap;
use std::io::BufRead;
use std::sync::Arc;

use image::{GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use ndarray::prelude::*;
use parking_lot::RwLock;
use tracing::warn;

use crate::errors::{Result, SegCamError};

/// Pascal VOC class names, indexed by class id. FCN exports trained on VOC
/// predict 21 channels in this order.
pub const VOC_LABELS: [&str; 21] = [
    "background",
    "aeroplane",
    "bicycle",
    "bird",
    "boat",
    "bottle",
    "bus",
    "car",
    "cat",
    "chair",
    "cow",
    "diningtable",
    "dog",
    "horse",
    "motorbike",
    "person",
    "pottedplant",
    "sheep",
    "sofa",
    "train",
    "tvmonitor",
];

pub fn class_label(class_id: usize) -> Option<&'static str> {
    VOC_LABELS.get(class_id).copied()
}

/// Spatial region that gates the per-class score reduction.
///
/// All coordinates are `(row, col)` into the score map, which matches the
/// input image pixel grid for the supported exports.
#[derive(Debug, Clone, PartialEq)]
pub enum Roi {
    /// Every pixel participates.
    Full { height: usize, width: usize },
    /// A single pixel participates.
    Pixel {
        row: usize,
        col: usize,
        height: usize,
        width: usize,
    },
    /// Pixels where the mask is true participate.
    Region { mask: Array2<bool> },
}

impl Roi {
    pub const fn full(height: usize, width: usize) -> Self {
        Self::Full { height, width }
    }

    pub fn pixel(row: usize, col: usize, height: usize, width: usize) -> Result<Self> {
        if row >= height || col >= width {
            return Err(SegCamError::OutOfBounds {
                row,
                col,
                height,
                width,
            });
        }
        Ok(Self::Pixel {
            row,
            col,
            height,
            width,
        })
    }

    pub fn dimensions(&self) -> (usize, usize) {
        match self {
            Self::Full { height, width } | Self::Pixel { height, width, .. } => (*height, *width),
            Self::Region { mask } => mask.dim(),
        }
    }

    /// Number of participating pixels.
    pub fn selected(&self) -> usize {
        match self {
            Self::Full { height, width } => height * width,
            Self::Pixel { .. } => 1,
            Self::Region { mask } => mask.iter().filter(|&&m| m).count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.selected() == 0
    }

    pub fn contains(&self, row: usize, col: usize) -> bool {
        let (height, width) = self.dimensions();
        if row >= height || col >= width {
            return false;
        }
        match self {
            Self::Full { .. } => true,
            Self::Pixel { row: r, col: c, .. } => row == *r && col == *c,
            Self::Region { mask } => mask[[row, col]],
        }
    }

    /// Dense indicator mask, 1.0 where the pixel participates.
    pub fn mask_f32(&self) -> Array2<f32> {
        match self {
            Self::Full { height, width } => Array2::ones((*height, *width)),
            Self::Pixel {
                row, col, height, width, ..
            } => {
                let mut mask = Array2::zeros((*height, *width));
                mask[[*row, *col]] = 1.0;
                mask
            }
            Self::Region { mask } => mask.mapv(|m| if m { 1.0 } else { 0.0 }),
        }
    }
}

/// One 8-connected component of a class in a predicted label map.
///
/// Components are reported in raster-scan order of their first pixel, so the
/// component with the lowest top-left coordinate comes first.
#[derive(Debug, Clone)]
pub struct Component {
    pub size: usize,
    pub top_left: (usize, usize),
    mask: Array2<bool>,
}

impl Component {
    pub fn into_roi(self) -> Roi {
        Roi::Region { mask: self.mask }
    }
}

/// Which component of the class becomes the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionPick {
    Largest,
    Smallest,
    WholeClass,
}

/// Indicator mask of every pixel predicted as `class_id`.
pub fn class_mask(labels: ArrayView2<usize>, class_id: usize) -> Result<Array2<bool>> {
    let mask = labels.mapv(|label| label == class_id);
    if !mask.iter().any(|&m| m) {
        return Err(SegCamError::UnknownClass { class_id });
    }
    Ok(mask)
}

/// Splits the class mask into 8-connected components.
pub fn class_components(labels: ArrayView2<usize>, class_id: usize) -> Result<Vec<Component>> {
    let mask = class_mask(labels, class_id)?;
    let (height, width) = mask.dim();

    let binary = GrayImage::from_fn(width as u32, height as u32, |x, y| {
        Luma([u8::from(mask[[y as usize, x as usize]])])
    });
    let labeled = connected_components(&binary, Connectivity::Eight, Luma([0u8]));

    let mut components: Vec<Component> = Vec::new();
    let mut index_of: HashMap<u32, usize> = HashMap::new();
    for row in 0..height {
        for col in 0..width {
            let label = labeled.get_pixel(col as u32, row as u32)[0];
            if label == 0 {
                continue;
            }
            let index = *index_of.entry(label).or_insert_with(|| {
                components.push(Component {
                    size: 0,
                    top_left: (row, col),
                    mask: Array2::from_elem((height, width), false),
                });
                components.len() - 1
            });
            components[index].size += 1;
            components[index].mask[[row, col]] = true;
        }
    }
    Ok(components)
}

/// Builds a class-region ROI from a label map.
///
/// Ties between equally sized components go to the one whose first pixel
/// comes earlier in raster order.
pub fn class_region(labels: ArrayView2<usize>, class_id: usize, pick: RegionPick) -> Result<Roi> {
    if pick == RegionPick::WholeClass {
        let mask = class_mask(labels, class_id)?;
        return Ok(Roi::Region { mask });
    }

    let mut components = class_components(labels, class_id)?;
    let mut index = 0;
    for (i, component) in components.iter().enumerate().skip(1) {
        let better = match pick {
            RegionPick::Largest => component.size > components[index].size,
            RegionPick::Smallest => component.size < components[index].size,
            RegionPick::WholeClass => unreachable!(),
        };
        if better {
            index = i;
        }
    }
    Ok(components.swap_remove(index).into_roi())
}

/// Shared handle to the ROI used by the score reduction.
///
/// Cloning the binding shares the underlying descriptor, which is how an
/// interactive pick made after the classifier was built still reaches it.
#[derive(Debug, Clone)]
pub struct RoiBinding {
    inner: Arc<RwLock<Roi>>,
}

impl RoiBinding {
    /// A binding that never changes.
    pub fn fixed(roi: Roi) -> Self {
        Self {
            inner: Arc::new(RwLock::new(roi)),
        }
    }

    /// A binding that starts at `provisional` and can be replaced exactly
    /// once through the returned [`PendingSelection`].
    pub fn pending(provisional: Roi) -> (Self, PendingSelection) {
        let binding = Self::fixed(provisional);
        let pending = PendingSelection {
            binding: binding.clone(),
        };
        (binding, pending)
    }

    pub fn snapshot(&self) -> Roi {
        self.inner.read().clone()
    }

    pub fn dimensions(&self) -> (usize, usize) {
        self.inner.read().dimensions()
    }
}

/// One-shot writer half of an interactive pixel selection.
///
/// `resolve` consumes the selection, so a second pick is rejected at compile
/// time. Until it is called, reductions see the provisional pixel.
#[derive(Debug)]
pub struct PendingSelection {
    binding: RoiBinding,
}

impl PendingSelection {
    pub fn resolve(self, row: usize, col: usize) -> Result<Roi> {
        let (height, width) = self.binding.dimensions();
        let roi = Roi::pixel(row, col, height, width)?;
        *self.binding.inner.write() = roi.clone();
        Ok(roi)
    }
}

/// Parses `row col` or `row,col` into a coordinate pair.
pub fn parse_point(line: &str) -> Option<(usize, usize)> {
    let mut parts = line
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty());
    let row = parts.next()?.parse().ok()?;
    let col = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((row, col))
}

/// Reads coordinate lines until one parses and lands inside the image.
pub fn read_point_from<R: BufRead>(reader: R, height: usize, width: usize) -> Result<(usize, usize)> {
    for line in reader.lines() {
        let line = line.map_err(|source| SegCamError::FileSystem {
            path: "stdin".into(),
            operation: "read pixel selection".to_string(),
            source,
        })?;
        match parse_point(&line) {
            Some((row, col)) if row < height && col < width => return Ok((row, col)),
            Some((row, col)) => {
                warn!("pixel ({row}, {col}) lies outside the {height}x{width} image, try again");
            }
            None => warn!("expected `row col`, got {line:?}"),
        }
    }
    Err(SegCamError::Configuration {
        message: "input closed before a pixel was selected".to_string(),
    })
}

/// Reads index lines until one parses and is below `len`.
pub fn read_index_from<R: BufRead>(reader: R, len: usize) -> Result<usize> {
    if len == 0 {
        return Err(SegCamError::Configuration {
            message: "there are no components to choose from".to_string(),
        });
    }
    for line in reader.lines() {
        let line = line.map_err(|source| SegCamError::FileSystem {
            path: "stdin".into(),
            operation: "read component selection".to_string(),
            source,
        })?;
        match line.trim().parse::<usize>() {
            Ok(index) if index < len => return Ok(index),
            Ok(index) => warn!("component {index} does not exist (0-{})", len - 1),
            Err(_) => warn!("expected a component index, got {line:?}"),
        }
    }
    Err(SegCamError::Configuration {
        message: "input closed before a component was selected".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_pixel_roi_rejects_out_of_bounds() {
        assert!(Roi::pixel(3, 0, 4, 4).is_ok());
        let err = Roi::pixel(4, 0, 4, 4).unwrap_err();
        assert!(matches!(err, SegCamError::OutOfBounds { row: 4, .. }));
        assert!(Roi::pixel(0, 9, 4, 4).is_err());
    }

    #[test]
    fn test_mask_f32_shapes() {
        let full = Roi::full(2, 3).mask_f32();
        assert_eq!(full.dim(), (2, 3));
        assert!(full.iter().all(|&v| v == 1.0));

        let pixel = Roi::pixel(1, 2, 2, 3).unwrap().mask_f32();
        assert_eq!(pixel.sum(), 1.0);
        assert_eq!(pixel[[1, 2]], 1.0);
    }

    #[test]
    fn test_contains() {
        let roi = Roi::pixel(1, 1, 3, 3).unwrap();
        assert!(roi.contains(1, 1));
        assert!(!roi.contains(0, 1));
        assert!(!roi.contains(5, 5));

        let full = Roi::full(3, 3);
        assert!(full.contains(2, 2));
        assert!(!full.contains(3, 0));
    }

    #[test]
    fn test_class_mask_unknown_class() {
        let labels = Array2::<usize>::zeros((4, 4));
        let err = class_mask(labels.view(), 12).unwrap_err();
        assert!(matches!(err, SegCamError::UnknownClass { class_id: 12 }));
    }

    #[test]
    fn test_diagonal_pixels_are_one_component() {
        // 8連結なので斜め隣接は同じ成分になる
        let mut labels = Array2::<usize>::zeros((4, 4));
        labels[[0, 0]] = 5;
        labels[[1, 1]] = 5;
        labels[[2, 2]] = 5;
        let components = class_components(labels.view(), 5).unwrap();
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].size, 3);
        assert_eq!(components[0].top_left, (0, 0));
    }

    #[test]
    fn test_pending_selection_updates_binding() {
        let provisional = Roi::pixel(0, 0, 8, 8).unwrap();
        let (binding, pending) = RoiBinding::pending(provisional);
        assert_eq!(binding.snapshot(), Roi::pixel(0, 0, 8, 8).unwrap());

        let resolved = pending.resolve(3, 5).unwrap();
        assert_eq!(resolved, Roi::pixel(3, 5, 8, 8).unwrap());
        assert_eq!(binding.snapshot(), resolved);
    }

    #[test]
    fn test_pending_selection_rejects_out_of_bounds() {
        let (_, pending) = RoiBinding::pending(Roi::full(4, 4));
        assert!(pending.resolve(4, 0).is_err());
    }

    #[test]
    fn test_parse_point() {
        assert_eq!(parse_point("3 5"), Some((3, 5)));
        assert_eq!(parse_point("3,5"), Some((3, 5)));
        assert_eq!(parse_point("  3 , 5 "), Some((3, 5)));
        assert_eq!(parse_point("3"), None);
        assert_eq!(parse_point("3 5 7"), None);
        assert_eq!(parse_point("a b"), None);
    }

    #[test]
    fn test_read_point_skips_invalid_lines() {
        let input = Cursor::new("nonsense\n99 99\n2 3\n");
        assert_eq!(read_point_from(input, 10, 10).unwrap(), (2, 3));
    }

    #[test]
    fn test_read_point_eof_is_an_error() {
        let input = Cursor::new("");
        assert!(read_point_from(input, 10, 10).is_err());
    }

    #[test]
    fn test_read_index() {
        let input = Cursor::new("9\nx\n1\n");
        assert_eq!(read_index_from(input, 3).unwrap(), 1);
    }

    #[test]
    fn test_read_index_with_nothing_to_choose() {
        // 候補ゼロでは読む前にエラーになる
        let input = Cursor::new("0\n");
        let err = read_index_from(input, 0).unwrap_err();
        assert!(matches!(err, SegCamError::Configuration { .. }));
    }

    #[test]
    fn test_voc_labels() {
        assert_eq!(class_label(12), Some("dog"));
        assert_eq!(class_label(0), Some("background"));
        assert_eq!(class_label(21), None);
    }
}
