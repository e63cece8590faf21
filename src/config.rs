use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::cam::{CamMethod, Smoothing};
use crate::context::{Device, InferenceContext};
use crate::errors::{Result, SegCamError};

#[derive(Parser, Clone)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// ONNX segmentation model exported with a `features` output
    #[arg(short, long)]
    pub model_path: PathBuf,

    #[arg(long, default_value = "./examples/both.png")]
    pub image_path: PathBuf,

    /// Run inference on the NVIDIA GPU
    #[arg(long)]
    pub use_cuda: bool,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,

    #[arg(short, long, default_value_t = 32)]
    pub batch_size: usize,

    #[arg(long, value_enum, default_value = "gradcam")]
    pub method: CamMethod,

    /// Average CAMs over flipped and brightness-shifted copies of the input
    #[arg(long = "aug_smooth")]
    pub aug_smooth: bool,

    /// Project weighted activations onto their first principal component
    #[arg(long = "eigen_smooth")]
    pub eigen_smooth: bool,

    /// ROI mode: 0 = whole map, 1 = fixed pixel, 2 = interactive pixel, 3 = class region
    #[arg(long = "roimode", default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=3))]
    pub roimode: u8,

    /// Pixel row for ROI modes 1 and 2 (mode 2 treats it as the provisional pick)
    #[arg(long, default_value_t = 50)]
    pub pixel_row: usize,

    #[arg(long, default_value_t = 130)]
    pub pixel_col: usize,

    /// Class whose connected components form the ROI in mode 3
    #[arg(long, default_value_t = 12)]
    pub class_id: usize,

    #[arg(long, value_enum, default_value = "largest")]
    pub component: ComponentPick,

    /// Write artifacts to --output-dir instead of a temporary directory
    #[arg(long)]
    pub save: bool,

    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Skip the guided backpropagation artifacts
    #[arg(long)]
    pub skip_gb: bool,
}

/// Which connected component of the chosen class becomes the ROI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ComponentPick {
    Largest,
    Smallest,
    /// Union of every component of the class
    Class,
    /// List the components and read an index from stdin
    Pick,
}

/// ROI restriction modes, numbered as on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoiMode {
    All,
    FixedPixel,
    InteractivePixel,
    ClassRegion,
}

impl TryFrom<u8> for RoiMode {
    type Error = SegCamError;

    fn try_from(mode: u8) -> Result<Self> {
        match mode {
            0 => Ok(Self::All),
            1 => Ok(Self::FixedPixel),
            2 => Ok(Self::InteractivePixel),
            3 => Ok(Self::ClassRegion),
            _ => Err(SegCamError::InvalidMode { mode }),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self::parse()
    }

    pub fn roi_mode(&self) -> Result<RoiMode> {
        RoiMode::try_from(self.roimode)
    }

    pub const fn smoothing(&self) -> Smoothing {
        Smoothing {
            augment: self.aug_smooth,
            eigen: self.eigen_smooth,
        }
    }

    /// 推論設定はここで確定し、以降は変更しない
    pub const fn inference_context(&self) -> InferenceContext {
        let device = if self.use_cuda {
            Device::Cuda {
                device_id: self.device_id,
            }
        } else {
            Device::Cpu
        };
        InferenceContext::new(device, self.batch_size)
    }
}
