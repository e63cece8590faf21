use ndarray::prelude::*;

use seg_cam_rs::roi::{class_components, class_region, RegionPick};
use seg_cam_rs::{Roi, SegCamError};

const DOG: usize = 12;

// 3つの離れた成分を持つラベルマップ（サイズ 5, 3, 8）
fn three_component_labels() -> Array2<usize> {
    let mut labels = Array2::<usize>::zeros((10, 10));
    // 成分A: 1x5、左上 (0, 0)
    labels.slice_mut(s![0, 0..5]).fill(DOG);
    // 成分B: 1x3、左上 (3, 0)
    labels.slice_mut(s![3, 0..3]).fill(DOG);
    // 成分C: 2x4、左上 (6, 5)
    labels.slice_mut(s![6..8, 5..9]).fill(DOG);
    labels
}

#[test]
fn test_components_are_listed_in_raster_order() {
    let labels = three_component_labels();
    let components = class_components(labels.view(), DOG).unwrap();

    assert_eq!(components.len(), 3);
    assert_eq!(components[0].top_left, (0, 0));
    assert_eq!(components[0].size, 5);
    assert_eq!(components[1].top_left, (3, 0));
    assert_eq!(components[1].size, 3);
    assert_eq!(components[2].top_left, (6, 5));
    assert_eq!(components[2].size, 8);
}

#[test]
fn test_largest_component_becomes_region() {
    let labels = three_component_labels();
    let roi = class_region(labels.view(), DOG, RegionPick::Largest).unwrap();

    assert_eq!(roi.selected(), 8);
    assert!(roi.contains(6, 5));
    assert!(roi.contains(7, 8));
    assert!(!roi.contains(0, 0));
    assert!(!roi.contains(3, 0));
}

#[test]
fn test_smallest_component_becomes_region() {
    let labels = three_component_labels();
    let roi = class_region(labels.view(), DOG, RegionPick::Smallest).unwrap();

    assert_eq!(roi.selected(), 3);
    assert!(roi.contains(3, 0));
    assert!(roi.contains(3, 2));
    assert!(!roi.contains(0, 0));
}

#[test]
fn test_whole_class_unions_every_component() {
    let labels = three_component_labels();
    let roi = class_region(labels.view(), DOG, RegionPick::WholeClass).unwrap();

    assert_eq!(roi.selected(), 5 + 3 + 8);
    assert!(roi.contains(0, 4));
    assert!(roi.contains(3, 1));
    assert!(roi.contains(7, 7));
    assert!(!roi.contains(5, 5));
}

#[test]
fn test_equal_sizes_keep_the_earlier_component() {
    // 同サイズの成分が2つ → ラスタ順で先に現れた方が勝つ
    let mut labels = Array2::<usize>::zeros((8, 8));
    labels.slice_mut(s![0, 0..4]).fill(DOG);
    labels.slice_mut(s![4, 2..6]).fill(DOG);

    let largest = class_region(labels.view(), DOG, RegionPick::Largest).unwrap();
    assert!(largest.contains(0, 0));
    assert!(!largest.contains(4, 2));

    let smallest = class_region(labels.view(), DOG, RegionPick::Smallest).unwrap();
    assert!(smallest.contains(0, 0));
    assert!(!smallest.contains(4, 2));
}

#[test]
fn test_missing_class_is_an_error() {
    let labels = three_component_labels();
    let err = class_region(labels.view(), 5, RegionPick::Largest).unwrap_err();
    assert!(matches!(err, SegCamError::UnknownClass { class_id: 5 }));
}

#[test]
fn test_region_mask_matches_component_pixels() {
    let labels = three_component_labels();
    let roi = class_region(labels.view(), DOG, RegionPick::Largest).unwrap();

    let Roi::Region { mask } = &roi else {
        panic!("class region should be a mask ROI");
    };
    assert_eq!(mask.dim(), (10, 10));
    for row in 0..10 {
        for col in 0..10 {
            let expected = (6..8).contains(&row) && (5..9).contains(&col);
            assert_eq!(mask[[row, col]], expected, "pixel ({row}, {col})");
        }
    }
}
