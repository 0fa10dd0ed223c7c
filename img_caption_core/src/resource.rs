use anyhow::Result;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use candle_transformers::models::blip;

#[cfg(feature = "fat")]
use rust_embed::Embed;
use tokenizers::Tokenizer;
use tracing::info;

use crate::blip::BlipCaptioner;
use crate::dispatch::Pipeline;
use crate::vit_gpt2::{self, VitGpt2Captioner};
use crate::ModelSelection;

#[cfg(feature = "fat")]
#[derive(Embed)]
#[folder = "resource/"]
struct Asset;

#[cfg(not(feature = "fat"))]
struct Asset;
#[cfg(not(feature = "fat"))]
struct FakeEmbedFile<'a> {
    data: &'a [u8],
}
#[cfg(not(feature = "fat"))]
impl Asset {
    fn get(_: &str) -> Option<FakeEmbedFile> {
        None
    }
}

fn fetch(repo: &str, revision: &str, filename: &str) -> Result<Vec<u8>> {
    let mut builder = hf_hub::api::sync::ApiBuilder::new();
    if let Ok(endpoint) = std::env::var("HF_ENDPOINT") {
        builder = builder.with_endpoint(endpoint);
    }
    let api = builder.build()?;
    let api = api.repo(hf_hub::Repo::with_revision(
        repo.to_string(),
        hf_hub::RepoType::Model,
        revision.to_string(),
    ));
    let v = api.get(filename)?;
    Ok(std::fs::read(v)?)
}

pub fn get_weights(selection: ModelSelection) -> Result<Vec<u8>> {
    let spec = selection.spec();
    let data = if cfg!(feature = "fat") {
        let name = format!("{}/model.safetensors", spec.identifier);
        let f = Asset::get(&name).ok_or(anyhow::format_err!("not found"))?;
        f.data.to_vec()
    } else {
        fetch(spec.repo, spec.revision, "model.safetensors")?
    };
    Ok(data)
}

pub fn get_tokenizer(selection: ModelSelection) -> Result<Tokenizer> {
    let spec = selection.spec();
    let data = if cfg!(feature = "fat") {
        let name = format!("{}/tokenizer.json", spec.identifier);
        let f = Asset::get(&name).ok_or(anyhow::format_err!("not found"))?;
        f.data.to_vec()
    } else {
        fetch(spec.repo, spec.revision, "tokenizer.json")?
    };
    Tokenizer::from_bytes(data).map_err(|e| anyhow::anyhow!("failed to create tokenizer, {}", e))
}

pub fn load_blip(selection: ModelSelection, device: &Device) -> Result<Pipeline> {
    let config = match selection {
        ModelSelection::BlipLarge => blip::Config::image_captioning_large(),
        _ => crate::blip::image_captioning_base_config(),
    };
    let weights = get_weights(selection)?;
    let tokenizer = get_tokenizer(selection)?;
    let vb = VarBuilder::from_slice_safetensors(&weights, DType::F32, device)?;
    let model = blip::BlipForConditionalGeneration::new(&config, vb)?;
    Ok(Pipeline::Blip(Box::new(BlipCaptioner::new(
        model,
        tokenizer,
        device.clone(),
    ))))
}

pub fn load_vit_gpt2(selection: ModelSelection, device: &Device) -> Result<Pipeline> {
    let config = vit_gpt2::Config::vit_gpt2_image_captioning();
    let weights = get_weights(selection)?;
    let tokenizer = get_tokenizer(selection)?;
    let vb = VarBuilder::from_slice_safetensors(&weights, DType::F32, device)?;
    let model = vit_gpt2::VitGpt2Model::new(&config, vb)?;
    Ok(Pipeline::EncoderDecoder(Box::new(VitGpt2Captioner::new(
        model,
        tokenizer,
        config,
        device.clone(),
    ))))
}

/// Resolve the model, processor and tokenizer triple for a selection.
pub fn load(selection: ModelSelection, device: &Device) -> Result<Pipeline> {
    let spec = selection.spec();
    info!("loading {} from {}", spec.identifier, spec.repo);
    (spec.loader)(selection, device)
}
