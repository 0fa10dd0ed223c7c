pub mod blip;
pub mod dispatch;
pub mod error;
pub mod resource;
pub mod vit_gpt2;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use candle_core::Device;
use image::DynamicImage;
use tracing::info;

pub use crate::dispatch::{generate_caption, Convention, GenerationOptions, Pipeline};
pub use crate::error::CaptionError;

/// Which pretrained captioning model a request runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelSelection {
    BlipBase,
    BlipLarge,
    VitGpt2,
}

/// One row of the model table: everything the dispatcher needs to know about
/// a selectable model.
pub struct ModelSpec {
    pub selection: ModelSelection,
    /// Short identifier used on the command line and in config files.
    pub identifier: &'static str,
    /// Hub repository holding the weights.
    pub repo: &'static str,
    /// Revision carrying a safetensors export.
    pub revision: &'static str,
    pub convention: Convention,
    pub loader: fn(ModelSelection, &Device) -> anyhow::Result<Pipeline>,
}

pub const MODELS: [ModelSpec; 3] = [
    ModelSpec {
        selection: ModelSelection::BlipBase,
        identifier: "blip-image-captioning-base",
        repo: "Salesforce/blip-image-captioning-base",
        revision: "main",
        convention: Convention::Blip,
        loader: resource::load_blip,
    },
    ModelSpec {
        selection: ModelSelection::BlipLarge,
        identifier: "blip-image-captioning-large",
        repo: "Salesforce/blip-image-captioning-large",
        revision: "refs/pr/18",
        convention: Convention::Blip,
        loader: resource::load_blip,
    },
    ModelSpec {
        selection: ModelSelection::VitGpt2,
        identifier: "vit-gpt2-image-captioning",
        repo: "nlpconnect/vit-gpt2-image-captioning",
        revision: "main",
        convention: Convention::EncoderDecoder,
        loader: resource::load_vit_gpt2,
    },
];

impl ModelSelection {
    pub fn spec(self) -> &'static ModelSpec {
        match self {
            ModelSelection::BlipBase => &MODELS[0],
            ModelSelection::BlipLarge => &MODELS[1],
            ModelSelection::VitGpt2 => &MODELS[2],
        }
    }

    pub fn identifier(self) -> &'static str {
        self.spec().identifier
    }

    pub fn convention(self) -> Convention {
        self.spec().convention
    }
}

impl fmt::Display for ModelSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

impl FromStr for ModelSelection {
    type Err = CaptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blip-base" | "blip-image-captioning-base" => Ok(Self::BlipBase),
            "blip-large" | "blip-image-captioning-large" => Ok(Self::BlipLarge),
            "vit-gpt2" | "vit-gpt2-image-captioning" => Ok(Self::VitGpt2),
            other => Err(CaptionError::InvalidSelection(other.to_string())),
        }
    }
}

pub fn load_image<P: AsRef<Path>>(path: P) -> error::Result<DynamicImage> {
    let path = path.as_ref();
    image::ImageReader::open(path)
        .map_err(|e| CaptionError::InvalidImage(format!("open {}: {e}", path.display())))?
        .decode()
        .map_err(|e| CaptionError::InvalidImage(format!("decode {}: {e}", path.display())))
}

/// Color-normalize to 8-bit three-channel RGB. Grayscale, RGBA and paletted
/// inputs all land on the same representation, before dispatch ever sees them.
pub fn to_rgb(image: DynamicImage) -> DynamicImage {
    match image {
        DynamicImage::ImageRgb8(_) => image,
        other => DynamicImage::ImageRgb8(other.to_rgb8()),
    }
}

/// Mean per-channel values, the quick sanity stat printed before captioning.
pub fn mean_rgb(image: &DynamicImage) -> Option<[f64; 3]> {
    let rgb = match image {
        DynamicImage::ImageRgb8(img) => img,
        _ => return None,
    };
    let count = rgb.width() as f64 * rgb.height() as f64;
    if count == 0.0 {
        return None;
    }
    let mut sums = [0f64; 3];
    for pixel in rgb.pixels() {
        for (sum, v) in sums.iter_mut().zip(pixel.0.iter()) {
            *sum += *v as f64;
        }
    }
    Some([sums[0] / count, sums[1] / count, sums[2] / count])
}

/// One caption request: the model choice plus an RGB image, consumed once.
pub struct CaptionRequest {
    pub selection: ModelSelection,
    pub image: DynamicImage,
}

impl CaptionRequest {
    /// Build a request from an already-decoded image, converting it to RGB.
    pub fn new(selection: ModelSelection, image: DynamicImage) -> Self {
        Self {
            selection,
            image: to_rgb(image),
        }
    }

    pub fn from_path<P: AsRef<Path>>(selection: ModelSelection, path: P) -> error::Result<Self> {
        Ok(Self::new(selection, load_image(path)?))
    }

    /// Run the request against an already-loaded pipeline.
    pub fn run(self, pipeline: &mut Pipeline, opts: &GenerationOptions) -> error::Result<String> {
        generate_caption(pipeline, &self.image, opts)
    }
}

/// Caption each image file with the selected model, in order.
pub fn caption_files(
    selection: ModelSelection,
    images: &[String],
    opts: &GenerationOptions,
) -> anyhow::Result<Vec<String>> {
    let device = Device::Cpu;
    let mut pipeline = resource::load(selection, &device)?;
    let mut captions = Vec::with_capacity(images.len());
    for path in images {
        let image = to_rgb(load_image(path)?);
        info!(
            "image {}: {}x{}, mean rgb {:?}",
            path,
            image.width(),
            image.height(),
            mean_rgb(&image)
        );
        let start = std::time::Instant::now();
        let caption = generate_caption(&mut pipeline, &image, opts)?;
        info!("generate costs:{:?}", start.elapsed());
        captions.push(caption);
    }
    Ok(captions)
}

#[cfg(test)]
mod tests {
    use image::{ImageBuffer, Luma, Rgb, Rgba};

    use super::*;

    #[test]
    fn selections_parse_from_short_and_full_identifiers() {
        assert_eq!(
            "blip-base".parse::<ModelSelection>().unwrap(),
            ModelSelection::BlipBase
        );
        assert_eq!(
            "blip-image-captioning-large".parse::<ModelSelection>().unwrap(),
            ModelSelection::BlipLarge
        );
        assert_eq!(
            "vit-gpt2".parse::<ModelSelection>().unwrap(),
            ModelSelection::VitGpt2
        );
        assert_eq!(
            ModelSelection::VitGpt2.to_string(),
            "vit-gpt2-image-captioning"
        );
    }

    #[test]
    fn unknown_selections_are_invalid() {
        let err = "unknown".parse::<ModelSelection>().unwrap_err();
        assert!(matches!(err, CaptionError::InvalidSelection(s) if s == "unknown"));
    }

    #[test]
    fn the_two_conventions_split_as_expected() {
        assert_eq!(ModelSelection::BlipBase.convention(), Convention::Blip);
        assert_eq!(ModelSelection::BlipLarge.convention(), Convention::Blip);
        assert_eq!(
            ModelSelection::VitGpt2.convention(),
            Convention::EncoderDecoder
        );
    }

    #[test]
    fn the_model_table_is_keyed_consistently() {
        for spec in MODELS.iter() {
            assert_eq!(spec.selection.spec().identifier, spec.identifier);
            assert_eq!(spec.selection.spec().convention, spec.convention);
        }
    }

    #[test]
    fn to_rgb_normalizes_other_color_modes() {
        let gray = DynamicImage::ImageLuma8(ImageBuffer::from_pixel(4, 4, Luma([9])));
        assert!(matches!(to_rgb(gray), DynamicImage::ImageRgb8(_)));
        let rgba = DynamicImage::ImageRgba8(ImageBuffer::from_pixel(4, 4, Rgba([1, 2, 3, 4])));
        assert!(matches!(to_rgb(rgba), DynamicImage::ImageRgb8(_)));
    }

    #[test]
    fn requests_convert_to_rgb_on_construction() {
        let gray = DynamicImage::ImageLuma8(ImageBuffer::from_pixel(4, 4, Luma([9])));
        let request = CaptionRequest::new(ModelSelection::BlipBase, gray);
        assert!(matches!(request.image, DynamicImage::ImageRgb8(_)));
    }

    #[test]
    fn mean_rgb_of_a_solid_color() {
        let red = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(6, 3, Rgb([200, 50, 0])));
        let mean = mean_rgb(&red).unwrap();
        assert_eq!(mean, [200.0, 50.0, 0.0]);
    }
}
