pub mod causal_lm;
pub mod echo;

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::config::{ModelBackend, ModelConfig};

pub use causal_lm::CausalLmGenerator;
pub use echo::EchoGenerator;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("invalid sampling parameters: {0}")]
    InvalidParams(String),
    #[error("failed to load model: {0}")]
    Load(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("model error: {0}")]
    Model(String),
    #[error("generation worker failed: {0}")]
    Worker(String),
}

impl From<candle::Error> for GenerationError {
    fn from(err: candle::Error) -> Self {
        Self::Model(err.to_string())
    }
}

/// Per-request sampling knobs. Sampling is always on; there is no greedy mode.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    /// Total length in tokens, prompt included.
    pub max_length: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub seed: Option<u64>,
}

impl SamplingParams {
    pub fn validate(&self, max_length_limit: usize) -> Result<(), GenerationError> {
        if self.max_length == 0 {
            return Err(GenerationError::InvalidParams(
                "max_length must be at least 1".into(),
            ));
        }
        if self.max_length > max_length_limit {
            return Err(GenerationError::InvalidParams(format!(
                "max_length {} exceeds the limit of {max_length_limit}",
                self.max_length
            )));
        }
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            return Err(GenerationError::InvalidParams(format!(
                "temperature must be a positive number, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(GenerationError::InvalidParams(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        Ok(())
    }
}

/// Values used when a request leaves a sampling parameter out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingDefaults {
    pub max_length: usize,
    pub temperature: f64,
    pub top_p: f64,
}

impl Default for SamplingDefaults {
    fn default() -> Self {
        Self {
            max_length: 50,
            temperature: 1.0,
            top_p: 1.0,
        }
    }
}

impl SamplingDefaults {
    pub fn to_params(self) -> SamplingParams {
        SamplingParams {
            max_length: self.max_length,
            temperature: self.temperature,
            top_p: self.top_p,
            seed: None,
        }
    }
}

/// A pretrained text-generation capability.
///
/// Calls are synchronous and can take seconds; async callers must move them
/// onto a blocking thread.
pub trait TextGenerator: Send + Sync {
    /// Returns the prompt followed by its sampled continuation.
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<String, GenerationError>;

    fn name(&self) -> &str;
}

pub fn load_generator(cfg: &ModelConfig) -> Result<Arc<dyn TextGenerator>, GenerationError> {
    match cfg.backend {
        ModelBackend::Echo => {
            info!("using echo generator, no model weights loaded");
            Ok(Arc::new(EchoGenerator::new()))
        }
        ModelBackend::Candle => Ok(Arc::new(CausalLmGenerator::load(cfg)?)),
    }
}
