use clap::Parser;
use tracing::info;

use img_caption_core::{GenerationOptions, ModelSelection};

#[derive(Parser)]
struct Args {
    #[arg(long, use_value_delimiter = true)]
    images: Vec<String>,

    /// One of blip-base, blip-large or vit-gpt2.
    #[arg(long)]
    model: Option<String>,

    /// Upper bound on generated tokens per caption.
    #[arg(long)]
    max_tokens: Option<usize>,

    /// Seed for the logits processor.
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    config: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct FileConfig {
    model: String,
    max_tokens: Option<usize>,
    seed: Option<u64>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            model: "blip-image-captioning-base".to_string(),
            max_tokens: None,
            seed: None,
        }
    }
}

impl FileConfig {
    fn load(path: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(&std::fs::read_to_string(path)?)?)
    }
}

pub fn main() -> anyhow::Result<()> {
    std::env::set_var("RUST_BACKTRACE", "full");
    let args = Args::parse();
    tracing_subscriber::fmt::init();

    let file_config = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    let selection: ModelSelection = args
        .model
        .as_deref()
        .unwrap_or(&file_config.model)
        .parse()?;

    let mut opts = GenerationOptions::default();
    if let Some(max_tokens) = args.max_tokens.or(file_config.max_tokens) {
        opts.max_tokens = max_tokens;
    }
    if let Some(seed) = args.seed.or(file_config.seed) {
        opts.seed = seed;
    }

    let captions = img_caption_core::caption_files(selection, &args.images, &opts)?;
    for (path, caption) in args.images.iter().zip(captions.iter()) {
        info!("\n\nCaption for image: {}\n{}", path, caption);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::FileConfig;

    #[test]
    fn config_files_fill_in_defaults() {
        let config: FileConfig = toml::from_str("model = \"vit-gpt2\"\nmax_tokens = 32\n").unwrap();
        assert_eq!(config.model, "vit-gpt2");
        assert_eq!(config.max_tokens, Some(32));
        assert_eq!(config.seed, None);

        let empty: FileConfig = toml::from_str("").unwrap();
        assert_eq!(empty.model, "blip-image-captioning-base");
    }
}
