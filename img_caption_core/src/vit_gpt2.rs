//! ViT-GPT2 captioning, the encoder-decoder side of the dispatcher.
//!
//! The checkpoint is a ViT-base patch16 encoder bolted onto a GPT-2 decoder
//! with cross-attention. candle-transformers ships no VisionEncoderDecoder,
//! so the graph is assembled here from candle-nn building blocks.

use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::ops::softmax_last_dim;
use candle_nn::{
    conv2d, embedding, layer_norm, linear, Conv2d, Conv2dConfig, Embedding, LayerNorm, Linear,
    Module, VarBuilder,
};
use candle_transformers::generation::LogitsProcessor;
use image::DynamicImage;
use tokenizers::Tokenizer;

use crate::dispatch::{EncoderDecoderConvention, GenerationOptions};
use crate::error::{CaptionError, Result as CaptionResult};

const IMAGE_SIZE: usize = 224;
const IMAGE_MEAN: [f32; 3] = [0.5, 0.5, 0.5];
const IMAGE_STD: [f32; 3] = [0.5, 0.5, 0.5];

#[derive(Debug, Clone)]
pub struct Config {
    pub image_size: usize,
    pub patch_size: usize,
    pub num_channels: usize,
    pub encoder_hidden_size: usize,
    pub encoder_layers: usize,
    pub encoder_heads: usize,
    pub encoder_intermediate_size: usize,
    pub encoder_layer_norm_eps: f64,
    pub vocab_size: usize,
    pub n_positions: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    pub decoder_layer_norm_eps: f64,
    // bos doubles as the decoder-start token and eos, GPT-2 style.
    pub bos_token_id: u32,
    pub eos_token_id: u32,
}

impl Config {
    pub fn vit_gpt2_image_captioning() -> Self {
        Self {
            image_size: IMAGE_SIZE,
            patch_size: 16,
            num_channels: 3,
            encoder_hidden_size: 768,
            encoder_layers: 12,
            encoder_heads: 12,
            encoder_intermediate_size: 3072,
            encoder_layer_norm_eps: 1e-12,
            vocab_size: 50257,
            n_positions: 1024,
            n_embd: 768,
            n_layer: 12,
            n_head: 12,
            decoder_layer_norm_eps: 1e-5,
            bos_token_id: 50256,
            eos_token_id: 50256,
        }
    }
}

/// Pixel-value-only preprocessing: resize to 224x224, scale to [0, 1],
/// normalize with mean/std 0.5, NCHW with a batch dim. No attention mask and
/// no text-side tensors, unlike the BLIP bundle.
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

fn split_heads(xs: &Tensor, num_heads: usize, head_dim: usize) -> Result<Tensor> {
    let (b, t, _) = xs.dims3()?;
    xs.contiguous()?
        .reshape((b, t, num_heads, head_dim))?
        .permute((0, 2, 1, 3))?
        .contiguous()
}

fn merge_heads(xs: &Tensor) -> Result<Tensor> {
    xs.transpose(1, 2)?.contiguous()?.flatten_from(2)
}

fn attend(q: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>, head_dim: usize) -> Result<Tensor> {
    let scale = 1f64 / (head_dim as f64).sqrt();
    let mut scores = (q.matmul(&k.t()?)? * scale)?;
    if let Some(mask) = mask {
        scores = scores.broadcast_add(mask)?;
    }
    let probs = softmax_last_dim(&scores)?;
    probs.matmul(v)
}

fn causal_mask(t: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..t)
        .flat_map(|i| (0..t).map(move |j| if j > i { f32::NEG_INFINITY } else { 0. }))
        .collect();
    Tensor::from_vec(mask, (t, t), device)
}

struct VitEmbeddings {
    cls_token: Tensor,
    position_embeddings: Tensor,
    projection: Conv2d,
    hidden_size: usize,
}

impl VitEmbeddings {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let cls_token = vb.get((1, 1, cfg.encoder_hidden_size), "cls_token")?;
        let num_patches = (cfg.image_size / cfg.patch_size) * (cfg.image_size / cfg.patch_size);
        let position_embeddings = vb.get(
            (1, num_patches + 1, cfg.encoder_hidden_size),
            "position_embeddings",
        )?;
        let conv_cfg = Conv2dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };
        let projection = conv2d(
            cfg.num_channels,
            cfg.encoder_hidden_size,
            cfg.patch_size,
            conv_cfg,
            vb.pp("patch_embeddings").pp("projection"),
        )?;
        Ok(Self {
            cls_token,
            position_embeddings,
            projection,
            hidden_size: cfg.encoder_hidden_size,
        })
    }

    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let batch = pixel_values.dim(0)?;
        let xs = self.projection.forward(pixel_values)?;
        let xs = xs.flatten_from(2)?.transpose(1, 2)?;
        let cls = self.cls_token.expand((batch, 1, self.hidden_size))?;
        let xs = Tensor::cat(&[&cls, &xs], 1)?;
        xs.broadcast_add(&self.position_embeddings)
    }
}

struct VitAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl VitAttention {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let h = cfg.encoder_hidden_size;
        Ok(Self {
            query: linear(h, h, vb.pp("attention").pp("query"))?,
            key: linear(h, h, vb.pp("attention").pp("key"))?,
            value: linear(h, h, vb.pp("attention").pp("value"))?,
            output: linear(h, h, vb.pp("output").pp("dense"))?,
            num_heads: cfg.encoder_heads,
            head_dim: h / cfg.encoder_heads,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let q = split_heads(&self.query.forward(xs)?, self.num_heads, self.head_dim)?;
        let k = split_heads(&self.key.forward(xs)?, self.num_heads, self.head_dim)?;
        let v = split_heads(&self.value.forward(xs)?, self.num_heads, self.head_dim)?;
        let ctx = attend(&q, &k, &v, None, self.head_dim)?;
        self.output.forward(&merge_heads(&ctx)?)
    }
}

struct VitLayer {
    attention: VitAttention,
    intermediate: Linear,
    output: Linear,
    layernorm_before: LayerNorm,
    layernorm_after: LayerNorm,
}

impl VitLayer {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let h = cfg.encoder_hidden_size;
        Ok(Self {
            attention: VitAttention::new(cfg, vb.pp("attention"))?,
            intermediate: linear(
                h,
                cfg.encoder_intermediate_size,
                vb.pp("intermediate").pp("dense"),
            )?,
            output: linear(cfg.encoder_intermediate_size, h, vb.pp("output").pp("dense"))?,
            layernorm_before: layer_norm(h, cfg.encoder_layer_norm_eps, vb.pp("layernorm_before"))?,
            layernorm_after: layer_norm(h, cfg.encoder_layer_norm_eps, vb.pp("layernorm_after"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let attn = self.attention.forward(&self.layernorm_before.forward(xs)?)?;
        let xs = (xs + attn)?;
        let mlp = self
            .intermediate
            .forward(&self.layernorm_after.forward(&xs)?)?
            .gelu_erf()?;
        let mlp = self.output.forward(&mlp)?;
        xs + mlp
    }
}

/// GPT-2 checkpoints store Conv1D weights as (in, out); transpose once at
/// load so they behave as ordinary linears.
fn conv1d(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get((in_dim, out_dim), "weight")?.t()?.contiguous()?;
    let bias = vb.get(out_dim, "bias")?;
    Ok(Linear::new(weight, Some(bias)))
}

struct Gpt2Attention {
    c_attn: Linear,
    c_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl Gpt2Attention {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let c = cfg.n_embd;
        Ok(Self {
            c_attn: conv1d(c, 3 * c, vb.pp("c_attn"))?,
            c_proj: conv1d(c, c, vb.pp("c_proj"))?,
            num_heads: cfg.n_head,
            head_dim: c / cfg.n_head,
        })
    }

    fn forward(&self, xs: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (_b, _t, c) = xs.dims3()?;
        let qkv = self.c_attn.forward(xs)?;
        let q = split_heads(&qkv.narrow(D::Minus1, 0, c)?, self.num_heads, self.head_dim)?;
        let k = split_heads(&qkv.narrow(D::Minus1, c, c)?, self.num_heads, self.head_dim)?;
        let v = split_heads(&qkv.narrow(D::Minus1, 2 * c, c)?, self.num_heads, self.head_dim)?;
        let ctx = attend(&q, &k, &v, Some(mask), self.head_dim)?;
        self.c_proj.forward(&merge_heads(&ctx)?)
    }
}

struct Gpt2CrossAttention {
    q_attn: Linear,
    c_attn: Linear,
    c_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl Gpt2CrossAttention {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let c = cfg.n_embd;
        Ok(Self {
            q_attn: conv1d(c, c, vb.pp("q_attn"))?,
            c_attn: conv1d(c, 2 * c, vb.pp("c_attn"))?,
            c_proj: conv1d(c, c, vb.pp("c_proj"))?,
            num_heads: cfg.n_head,
            head_dim: c / cfg.n_head,
        })
    }

    fn forward(&self, xs: &Tensor, encoder_states: &Tensor) -> Result<Tensor> {
        let c = xs.dim(D::Minus1)?;
        let q = split_heads(&self.q_attn.forward(xs)?, self.num_heads, self.head_dim)?;
        let kv = self.c_attn.forward(encoder_states)?;
        let k = split_heads(&kv.narrow(D::Minus1, 0, c)?, self.num_heads, self.head_dim)?;
        let v = split_heads(&kv.narrow(D::Minus1, c, c)?, self.num_heads, self.head_dim)?;
        let ctx = attend(&q, &k, &v, None, self.head_dim)?;
        self.c_proj.forward(&merge_heads(&ctx)?)
    }
}

struct Gpt2Mlp {
    c_fc: Linear,
    c_proj: Linear,
}

impl Gpt2Mlp {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            c_fc: conv1d(cfg.n_embd, 4 * cfg.n_embd, vb.pp("c_fc"))?,
            c_proj: conv1d(4 * cfg.n_embd, cfg.n_embd, vb.pp("c_proj"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // GPT-2 uses the tanh-approximated gelu.
        self.c_proj.forward(&self.c_fc.forward(xs)?.gelu()?)
    }
}

struct Gpt2Block {
    ln_1: LayerNorm,
    attn: Gpt2Attention,
    ln_cross_attn: LayerNorm,
    cross_attn: Gpt2CrossAttention,
    ln_2: LayerNorm,
    mlp: Gpt2Mlp,
}

impl Gpt2Block {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let eps = cfg.decoder_layer_norm_eps;
        Ok(Self {
            ln_1: layer_norm(cfg.n_embd, eps, vb.pp("ln_1"))?,
            attn: Gpt2Attention::new(cfg, vb.pp("attn"))?,
            ln_cross_attn: layer_norm(cfg.n_embd, eps, vb.pp("ln_cross_attn"))?,
            cross_attn: Gpt2CrossAttention::new(cfg, vb.pp("crossattention"))?,
            ln_2: layer_norm(cfg.n_embd, eps, vb.pp("ln_2"))?,
            mlp: Gpt2Mlp::new(cfg, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, xs: &Tensor, encoder_states: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let xs = (xs + self.attn.forward(&self.ln_1.forward(xs)?, mask)?)?;
        let xs = (&xs
            + self
                .cross_attn
                .forward(&self.ln_cross_attn.forward(&xs)?, encoder_states)?)?;
        let mlp = self.mlp.forward(&self.ln_2.forward(&xs)?)?;
        xs + mlp
    }
}

struct Gpt2Decoder {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Gpt2Block>,
    ln_f: LayerNorm,
    lm_head: Linear,
}

impl Gpt2Decoder {
    fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let tf = vb.pp("transformer");
        let wte = embedding(cfg.vocab_size, cfg.n_embd, tf.pp("wte"))?;
        let wpe = embedding(cfg.n_positions, cfg.n_embd, tf.pp("wpe"))?;
        let blocks = (0..cfg.n_layer)
            .map(|i| Gpt2Block::new(cfg, tf.pp("h").pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let ln_f = layer_norm(cfg.n_embd, cfg.decoder_layer_norm_eps, tf.pp("ln_f"))?;
        // The lm head is tied to the token embedding.
        let lm_head = Linear::new(wte.embeddings().clone(), None);
        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
        })
    }

    fn forward(&self, input_ids: &Tensor, encoder_states: &Tensor) -> Result<Tensor> {
        let (_b, t) = input_ids.dims2()?;
        let device = input_ids.device();
        let tok = self.wte.forward(input_ids)?;
        let positions = Tensor::arange(0u32, t as u32, device)?;
        let pos = self.wpe.forward(&positions)?;
        let mut xs = tok.broadcast_add(&pos)?;
        let mask = causal_mask(t, device)?;
        for block in self.blocks.iter() {
            xs = block.forward(&xs, encoder_states, &mask)?;
        }
        self.lm_head.forward(&self.ln_f.forward(&xs)?)
    }
}

pub struct VitGpt2Model {
    embeddings: VitEmbeddings,
    layers: Vec<VitLayer>,
    layernorm: LayerNorm,
    decoder: Gpt2Decoder,
}

impl VitGpt2Model {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let enc = vb.pp("encoder");
        let embeddings = VitEmbeddings::new(cfg, enc.pp("embeddings"))?;
        let layers = (0..cfg.encoder_layers)
            .map(|i| VitLayer::new(cfg, enc.pp("encoder").pp("layer").pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let layernorm = layer_norm(
            cfg.encoder_hidden_size,
            cfg.encoder_layer_norm_eps,
            enc.pp("layernorm"),
        )?;
        let decoder = Gpt2Decoder::new(cfg, vb.pp("decoder"))?;
        Ok(Self {
            embeddings,
            layers,
            layernorm,
            decoder,
        })
    }

    /// Encode pixel values into the hidden states the decoder cross-attends to.
    pub fn encode(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let mut xs = self.embeddings.forward(pixel_values)?;
        for layer in self.layers.iter() {
            xs = layer.forward(&xs)?;
        }
        self.layernorm.forward(&xs)
    }

    pub fn decode(&self, input_ids: &Tensor, encoder_states: &Tensor) -> Result<Tensor> {
        self.decoder.forward(input_ids, encoder_states)
    }
}

pub struct VitGpt2Captioner {
    model: VitGpt2Model,
    tokenizer: Tokenizer,
    config: Config,
    device: Device,
}

impl VitGpt2Captioner {
    pub fn new(model: VitGpt2Model, tokenizer: Tokenizer, config: Config, device: Device) -> Self {
        Self {
            model,
            tokenizer,
            config,
            device,
        }
    }
}

impl EncoderDecoderConvention for VitGpt2Captioner {
    fn pixel_values(&self, image: &DynamicImage) -> CaptionResult<Tensor> {
        Ok(preprocess(image, &self.device)?)
    }

    fn generate(&mut self, pixel_values: &Tensor, opts: &GenerationOptions) -> CaptionResult<Vec<u32>> {
        let encoder_states = self.model.encode(pixel_values)?;
        let mut logits_processor = LogitsProcessor::new(opts.seed, opts.temperature, opts.top_p);
        let mut token_ids = vec![self.config.bos_token_id];
        for _ in 0..opts.max_tokens {
            // No kv cache: captions are short, so the full sequence is
            // recomputed each step.
            let input_ids = Tensor::new(token_ids.as_slice(), &self.device)?.unsqueeze(0)?;
            let logits = self.model.decode(&input_ids, &encoder_states)?;
            let logits = logits.squeeze(0)?;
            let logits = logits.get(logits.dim(0)? - 1)?;
            let token = logits_processor.sample(&logits)?;
            if token == self.config.eos_token_id {
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
    use candle_core::IndexOp;
    use image::{ImageBuffer, Rgb};

    use super::*;

    fn tiny_config() -> Config {
        Config {
            image_size: 8,
            patch_size: 4,
            num_channels: 3,
            encoder_hidden_size: 8,
            encoder_layers: 1,
            encoder_heads: 2,
            encoder_intermediate_size: 16,
            encoder_layer_norm_eps: 1e-12,
            vocab_size: 16,
            n_positions: 32,
            n_embd: 8,
            n_layer: 1,
            n_head: 2,
            decoder_layer_norm_eps: 1e-5,
            bos_token_id: 0,
            eos_token_id: 1,
        }
    }

    #[test]
    fn causal_mask_hides_the_future() {
        let mask = causal_mask(3, &Device::Cpu).unwrap();
        let rows = mask.to_vec2::<f32>().unwrap();
        assert_eq!(rows[0][0], 0.0);
        assert!(rows[0][1].is_infinite() && rows[0][1] < 0.0);
        assert!(rows[1][2].is_infinite() && rows[1][2] < 0.0);
        assert_eq!(rows[2][0], 0.0);
        assert_eq!(rows[2][2], 0.0);
    }

    #[test]
    fn encode_and_decode_shapes_line_up() {
        let cfg = tiny_config();
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let model = VitGpt2Model::new(&cfg, vb).unwrap();
        let pixels = Tensor::zeros((1, 3, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let states = model.encode(&pixels).unwrap();
        // 4 patches plus the CLS token.
        assert_eq!(states.dims(), &[1, 5, 8]);
        let ids = Tensor::new(&[0u32, 2, 3], &Device::Cpu)
            .unwrap()
            .unsqueeze(0)
            .unwrap();
        let logits = model.decode(&ids, &states).unwrap();
        assert_eq!(logits.dims(), &[1, 3, 16]);
    }

    #[test]
    fn preprocess_yields_pixel_values_only() {
        let img = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(10, 10, Rgb([255, 0, 0])));
        let t = preprocess(&img, &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[1, 3, IMAGE_SIZE, IMAGE_SIZE]);
        let red = t.i((0, 0, 0, 0)).unwrap().to_scalar::<f32>().unwrap();
        let green = t.i((0, 1, 0, 0)).unwrap().to_scalar::<f32>().unwrap();
        assert!((red - 1.0).abs() < 1e-5);
        assert!((green + 1.0).abs() < 1e-5);
    }
}
