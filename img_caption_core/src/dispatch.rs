//! Dispatch between the two captioning call conventions.
//!
//! BLIP checkpoints take one combined preprocessing call whose output feeds
//! generation directly and is decoded by the processor's own tokenizer. The
//! encoder-decoder checkpoints take a pixel-value tensor only and decode with
//! a separate tokenizer. The two conventions never mix for a given model.

use candle_core::Tensor;
use image::DynamicImage;

use crate::error::{CaptionError, Result};

/// Calling convention of a captioning model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    Blip,
    EncoderDecoder,
}

/// Decoding bounds shared by both conventions.
///
/// The defaults pin greedy decoding, so one image and one model always yield
/// the same caption.
#[derive(Debug, Clone, Copy)]
pub struct GenerationOptions {
    /// Upper bound on generated tokens per caption.
    pub max_tokens: usize,
    /// Seed for the logits processor; only observable when sampling is on.
    pub seed: u64,
    /// Softmax temperature; `None` keeps decoding greedy.
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: 64,
            seed: 299792458,
            temperature: None,
            top_p: None,
        }
    }
}

/// BLIP convention: one combined preprocessing call produces the bundle the
/// generation call consumes, and the processor-side tokenizer decodes.
pub trait BlipConvention {
    fn process(&self, image: &DynamicImage) -> Result<Tensor>;
    fn generate(&mut self, inputs: &Tensor, opts: &GenerationOptions) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32]) -> Result<String>;
}

/// Encoder-decoder convention: pixel values only on the way in, a separate
/// tokenizer on the way out.
pub trait EncoderDecoderConvention {
    fn pixel_values(&self, image: &DynamicImage) -> Result<Tensor>;
    fn generate(&mut self, pixel_values: &Tensor, opts: &GenerationOptions) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32]) -> Result<String>;
}

/// A loaded model behind one of the two calling conventions. The model,
/// processor and tokenizer handles live inside the boxed value; the
/// dispatcher holds no state of its own between calls.
pub enum Pipeline {
    Blip(Box<dyn BlipConvention>),
    EncoderDecoder(Box<dyn EncoderDecoderConvention>),
}

impl Pipeline {
    pub fn convention(&self) -> Convention {
        match self {
            Pipeline::Blip(_) => Convention::Blip,
            Pipeline::EncoderDecoder(_) => Convention::EncoderDecoder,
        }
    }
}

/// Callers convert to RGB before dispatch; this only re-checks the
/// precondition instead of converting silently.
fn validate_image(image: &DynamicImage) -> Result<()> {
    if image.width() == 0 || image.height() == 0 {
        return Err(CaptionError::InvalidImage("zero-sized image".to_string()));
    }
    if !matches!(image, DynamicImage::ImageRgb8(_)) {
        return Err(CaptionError::InvalidImage(format!(
            "expected 8-bit RGB pixels, got {:?}",
            image.color()
        )));
    }
    Ok(())
}

/// Run one caption request through the pipeline, using the call sequence its
/// convention demands.
pub fn generate_caption(
    pipeline: &mut Pipeline,
    image: &DynamicImage,
    opts: &GenerationOptions,
) -> Result<String> {
    validate_image(image)?;
    match pipeline {
        Pipeline::Blip(p) => run_blip(p.as_mut(), image, opts),
        Pipeline::EncoderDecoder(p) => run_encoder_decoder(p.as_mut(), image, opts),
    }
}

fn run_blip(
    pipeline: &mut dyn BlipConvention,
    image: &DynamicImage,
    opts: &GenerationOptions,
) -> Result<String> {
    let inputs = pipeline.process(image)?;
    let ids = pipeline.generate(&inputs, opts)?;
    pipeline.decode(&ids)
}

fn run_encoder_decoder(
    pipeline: &mut dyn EncoderDecoderConvention,
    image: &DynamicImage,
    opts: &GenerationOptions,
) -> Result<String> {
    let pixel_values = pipeline.pixel_values(image)?;
    let ids = pipeline.generate(&pixel_values, opts)?;
    pipeline.decode(&ids)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use candle_core::{DType, Device};
    use image::{DynamicImage, ImageBuffer, Luma, Rgb};

    use super::*;

    type CallLog = Rc<RefCell<Vec<&'static str>>>;

    struct FakeBlip {
        calls: CallLog,
        fail_generate: bool,
    }

    impl BlipConvention for FakeBlip {
        fn process(&self, _image: &DynamicImage) -> Result<Tensor> {
            self.calls.borrow_mut().push("process");
            Ok(Tensor::zeros((1, 3, 4, 4), DType::F32, &Device::Cpu)?)
        }

        fn generate(&mut self, _inputs: &Tensor, _opts: &GenerationOptions) -> Result<Vec<u32>> {
            self.calls.borrow_mut().push("generate");
            if self.fail_generate {
                return Err(CaptionError::ModelInvocation(candle_core::Error::Msg(
                    "malformed tensor".to_string(),
                )));
            }
            Ok(vec![30522, 7, 8, 9])
        }

        fn decode(&self, ids: &[u32]) -> Result<String> {
            self.calls.borrow_mut().push("decode");
            Ok(format!("a caption over {} ids", ids.len()))
        }
    }

    struct FakeVit {
        calls: CallLog,
    }

    impl EncoderDecoderConvention for FakeVit {
        fn pixel_values(&self, _image: &DynamicImage) -> Result<Tensor> {
            self.calls.borrow_mut().push("pixel_values");
            Ok(Tensor::zeros((1, 3, 2, 2), DType::F32, &Device::Cpu)?)
        }

        fn generate(
            &mut self,
            _pixel_values: &Tensor,
            _opts: &GenerationOptions,
        ) -> Result<Vec<u32>> {
            self.calls.borrow_mut().push("generate");
            Ok(vec![50256, 11, 12])
        }

        fn decode(&self, _ids: &[u32]) -> Result<String> {
            self.calls.borrow_mut().push("tokenizer_decode");
            Ok("a caption from the separate tokenizer".to_string())
        }
    }

    fn red_image() -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_pixel(224, 224, Rgb([255, 0, 0])))
    }

    #[test]
    fn blip_runs_process_then_generate_then_decode() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let calls: CallLog = Rc::default();
        let mut pipeline = Pipeline::Blip(Box::new(FakeBlip {
            calls: calls.clone(),
            fail_generate: false,
        }));
        let caption =
            generate_caption(&mut pipeline, &red_image(), &GenerationOptions::default()).unwrap();
        assert!(!caption.is_empty());
        assert_eq!(*calls.borrow(), vec!["process", "generate", "decode"]);
    }

    #[test]
    fn encoder_decoder_runs_pixel_values_then_its_own_tokenizer() {
        let calls: CallLog = Rc::default();
        let mut pipeline = Pipeline::EncoderDecoder(Box::new(FakeVit {
            calls: calls.clone(),
        }));
        let caption =
            generate_caption(&mut pipeline, &red_image(), &GenerationOptions::default()).unwrap();
        assert!(!caption.is_empty());
        assert_eq!(
            *calls.borrow(),
            vec!["pixel_values", "generate", "tokenizer_decode"]
        );
    }

    #[test]
    fn grayscale_images_are_rejected_before_any_model_call() {
        let calls: CallLog = Rc::default();
        let mut pipeline = Pipeline::Blip(Box::new(FakeBlip {
            calls: calls.clone(),
            fail_generate: false,
        }));
        let gray = DynamicImage::ImageLuma8(ImageBuffer::from_pixel(8, 8, Luma([127])));
        let err = generate_caption(&mut pipeline, &gray, &GenerationOptions::default()).unwrap_err();
        assert!(matches!(err, CaptionError::InvalidImage(_)));
        assert!(calls.borrow().is_empty());
    }

    #[test]
    fn zero_sized_images_are_rejected() {
        let calls: CallLog = Rc::default();
        let mut pipeline = Pipeline::EncoderDecoder(Box::new(FakeVit {
            calls: calls.clone(),
        }));
        let empty = DynamicImage::ImageRgb8(ImageBuffer::new(0, 0));
        let err = generate_caption(&mut pipeline, &empty, &GenerationOptions::default()).unwrap_err();
        assert!(matches!(err, CaptionError::InvalidImage(_)));
        assert!(calls.borrow().is_empty());
    }

    #[test]
    fn model_failures_surface_unchanged() {
        let mut pipeline = Pipeline::Blip(Box::new(FakeBlip {
            calls: Rc::default(),
            fail_generate: true,
        }));
        let err = generate_caption(&mut pipeline, &red_image(), &GenerationOptions::default())
            .unwrap_err();
        assert!(matches!(err, CaptionError::ModelInvocation(_)));
    }

    #[test]
    fn captions_repeat_under_the_default_greedy_options() {
        let mut pipeline = Pipeline::Blip(Box::new(FakeBlip {
            calls: Rc::default(),
            fail_generate: false,
        }));
        let opts = GenerationOptions::default();
        let first = generate_caption(&mut pipeline, &red_image(), &opts).unwrap();
        let second = generate_caption(&mut pipeline, &red_image(), &opts).unwrap();
        assert_eq!(first, second);
    }
}
