use std::sync::Arc;

use tracing::{info, instrument};

use crate::{
    api::types::GenerateRequest,
    db::HistoryStore,
    error::AppError,
    inference::{GenerationError, SamplingDefaults, SamplingParams, TextGenerator},
    model::GenerationRecord,
};

/// Prompt in, text out, one history row per success.
pub struct GenerationService {
    generator: Arc<dyn TextGenerator>,
    store: HistoryStore,
    defaults: SamplingDefaults,
    max_length_limit: usize,
}

impl GenerationService {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        store: HistoryStore,
        defaults: SamplingDefaults,
        max_length_limit: usize,
    ) -> Self {
        Self {
            generator,
            store,
            defaults,
            max_length_limit,
        }
    }

    pub fn model_name(&self) -> &str {
        self.generator.name()
    }

    pub fn defaults(&self) -> SamplingDefaults {
        self.defaults
    }

    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    /// Validate, generate, then persist. Nothing is written unless generation
    /// succeeded.
    #[instrument(skip_all, fields(prompt_len = req.prompt.len()))]
    pub async fn generate(&self, req: GenerateRequest) -> Result<GenerationRecord, AppError> {
        if req.prompt.trim().is_empty() {
            return Err(AppError::EmptyPrompt);
        }

        let params = self.resolve_params(&req);
        params.validate(self.max_length_limit)?;

        let generator = self.generator.clone();
        let prompt = req.prompt;
        let output = {
            let prompt = prompt.clone();
            tokio::task::spawn_blocking(move || generator.generate(&prompt, &params))
                .await
                .map_err(|e| GenerationError::Worker(e.to_string()))??
        };

        let record = self.store.insert(&prompt, &output).await?;
        info!(id = record.id, output_len = output.len(), "generation stored");
        Ok(record)
    }

    pub async fn history(&self) -> Result<Vec<GenerationRecord>, AppError> {
        Ok(self.store.list_all().await?)
    }

    fn resolve_params(&self, req: &GenerateRequest) -> SamplingParams {
        SamplingParams {
            max_length: req.max_length.unwrap_or(self.defaults.max_length),
            temperature: req.temperature.unwrap_or(self.defaults.temperature),
            top_p: req.top_p.unwrap_or(self.defaults.top_p),
            seed: req.seed,
        }
    }
}
