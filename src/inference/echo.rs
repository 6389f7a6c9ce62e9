use super::{GenerationError, SamplingParams, TextGenerator};

/// Deterministic stand-in that returns the prompt unchanged.
#[derive(Debug, Default, Clone)]
pub struct EchoGenerator;

impl EchoGenerator {
    pub fn new() -> Self {
        Self
    }
}

impl TextGenerator for EchoGenerator {
    fn generate(&self, prompt: &str, _params: &SamplingParams) -> Result<String, GenerationError> {
        Ok(prompt.to_string())
    }

    fn name(&self) -> &str {
        "echo"
    }
}
