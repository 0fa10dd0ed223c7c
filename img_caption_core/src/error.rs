/// Errors surfaced by the caption dispatcher.
///
/// `ModelInvocation` carries failures from the underlying model or tokenizer
/// unchanged; nothing is retried and there is no fallback model.
#[derive(Debug, thiserror::Error)]
pub enum CaptionError {
    #[error("unknown model selection `{0}`")]
    InvalidSelection(String),
    #[error("invalid image, {0}")]
    InvalidImage(String),
    #[error("model invocation error, {0}")]
    ModelInvocation(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, CaptionError>;
