//! BLIP captioning behind the combined-processor convention.

use candle_core::{DType, Device, Result, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::blip::{self, BlipForConditionalGeneration};
use image::DynamicImage;
use tokenizers::Tokenizer;

use crate::dispatch::{BlipConvention, GenerationOptions};
use crate::error::{CaptionError, Result as CaptionResult};

const IMAGE_SIZE: usize = 384;
// OpenAI CLIP statistics, shared by both BLIP checkpoints.
const IMAGE_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
const IMAGE_STD: [f32; 3] = [0.26862954, 0.261_302_6, 0.275_777_1];

const BOS_TOKEN_ID: u32 = 30522;
const SEP_TOKEN_ID: u32 = 102;

/// Config for the base checkpoint. candle only ships the large one; the base
/// variant shrinks the vision tower and the text encoder width.
pub fn image_captioning_base_config() -> blip::Config {
    let mut cfg = blip::Config::image_captioning_large();
    cfg.vision_config.hidden_size = 768;
    cfg.vision_config.intermediate_size = 3072;
    cfg.vision_config.num_hidden_layers = 12;
    cfg.vision_config.num_attention_heads = 12;
    cfg.text_config.encoder_hidden_size = 768;
    cfg
}

/// The combined preprocessing call: resize to 384x384, scale to [0, 1],
/// normalize, NCHW with a batch dim.
pub fn preprocess(image: &DynamicImage, device: &Device) -> Result<Tensor> {
    let img = image
        .resize_to_fill(
            IMAGE_SIZE as u32,
            IMAGE_SIZE as u32,
            image::imageops::FilterType::Triangle,
        )
        .to_rgb8();
    let data = img.into_raw();
    let data = Tensor::from_vec(data, (IMAGE_SIZE, IMAGE_SIZE, 3), device)?.permute((2, 0, 1))?;
    let mean = Tensor::new(&IMAGE_MEAN, device)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&IMAGE_STD, device)?.reshape((3, 1, 1))?;
    let data = (data.to_dtype(DType::F32)? / 255.)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)?;
    data.unsqueeze(0)
}

pub struct BlipCaptioner {
    model: BlipForConditionalGeneration,
    tokenizer: Tokenizer,
    device: Device,
}

impl BlipCaptioner {
    pub fn new(model: BlipForConditionalGeneration, tokenizer: Tokenizer, device: Device) -> Self {
        Self {
            model,
            tokenizer,
            device,
        }
    }
}

impl BlipConvention for BlipCaptioner {
    fn process(&self, image: &DynamicImage) -> CaptionResult<Tensor> {
        Ok(preprocess(image, &self.device)?)
    }

    fn generate(&mut self, inputs: &Tensor, opts: &GenerationOptions) -> CaptionResult<Vec<u32>> {
        // Stale cache entries from a previous request would poison this one.
        self.model.reset_kv_cache();
        let image_embeds = inputs.apply(self.model.vision_model())?;
        let mut logits_processor = LogitsProcessor::new(opts.seed, opts.temperature, opts.top_p);
        let mut token_ids = vec![BOS_TOKEN_ID];
        for index in 0..opts.max_tokens {
            let context_size = if index > 0 { 1 } else { token_ids.len() };
            let start_pos = token_ids.len().saturating_sub(context_size);
            let input_ids = Tensor::new(&token_ids[start_pos..], &self.device)?.unsqueeze(0)?;
            let logits = self.model.text_decoder().forward(&input_ids, &image_embeds)?;
            let logits = logits.squeeze(0)?;
            let logits = logits.get(logits.dim(0)? - 1)?;
            let token = logits_processor.sample(&logits)?;
            if token == SEP_TOKEN_ID {
                break;
            }
            token_ids.push(token);
        }
        Ok(token_ids)
    }

    fn decode(&self, ids: &[u32]) -> CaptionResult<String> {
        self.tokenizer
            .decode(ids, true)
            .map_err(|e| CaptionError::ModelInvocation(candle_core::Error::Msg(e.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use image::{ImageBuffer, Rgb};

    use super::*;

    #[test]
    fn base_config_shrinks_the_vision_tower() {
        let base = image_captioning_base_config();
        let large = blip::Config::image_captioning_large();
        assert_eq!(base.vision_config.hidden_size, 768);
        assert_eq!(base.vision_config.num_hidden_layers, 12);
        assert_eq!(base.text_config.encoder_hidden_size, 768);
        assert_eq!(large.vision_config.num_hidden_layers, 24);
    }

    #[test]
    fn preprocess_yields_one_normalized_nchw_bundle() {
        let img = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(100, 60, Rgb([255, 0, 0])));
        let t = preprocess(&img, &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[1, 3, IMAGE_SIZE, IMAGE_SIZE]);
    }
}
