use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use candle::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::{mistral, phi3};
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use super::{GenerationError, SamplingParams, TextGenerator};
use crate::config::{DeviceSpec, ModelConfig};

const SAFETENSORS_INDEX: &str = "model.safetensors.index.json";
const SINGLE_SAFETENSORS: &str = "model.safetensors";
const FALLBACK_EOS_TOKENS: &[&str] = &["</s>", "<|endoftext|>", "<|end|>", "<eos>"];

// ---------------------------------------------------------
// Supported decoder-only architectures
// ---------------------------------------------------------
enum Backbone {
    Mistral(mistral::Model),
    Phi3(phi3::Model),
}

impl Backbone {
    fn load(config: &serde_json::Value, vb: VarBuilder) -> Result<Self, GenerationError> {
        let model_type = config["model_type"].as_str().unwrap_or_default();
        match model_type {
            "mistral" => {
                let cfg: mistral::Config = serde_json::from_value(config.clone())
                    .map_err(|e| GenerationError::Load(format!("mistral config: {e}")))?;
                Ok(Self::Mistral(mistral::Model::new(&cfg, vb)?))
            }
            "phi3" => {
                let cfg: phi3::Config = serde_json::from_value(config.clone())
                    .map_err(|e| GenerationError::Load(format!("phi3 config: {e}")))?;
                Ok(Self::Phi3(phi3::Model::new(&cfg, vb)?))
            }
            other => Err(GenerationError::Load(format!(
                "unsupported model_type '{other}' (expected mistral or phi3)"
            ))),
        }
    }

    fn forward(&mut self, input: &Tensor, seqlen_offset: usize) -> candle::Result<Tensor> {
        match self {
            Self::Mistral(m) => m.forward(input, seqlen_offset),
            Self::Phi3(m) => m.forward(input, seqlen_offset),
        }
    }

    fn clear_kv_cache(&mut self) {
        match self {
            Self::Mistral(m) => m.clear_kv_cache(),
            Self::Phi3(m) => m.clear_kv_cache(),
        }
    }
}

// ---------------------------------------------------------
// Snapshot files, local or from the Hub
// ---------------------------------------------------------
#[derive(Debug)]
struct ModelFiles {
    config: PathBuf,
    tokenizer: PathBuf,
    weights: Vec<PathBuf>,
}

impl ModelFiles {
    fn from_dir(dir: &Path) -> Result<Self, GenerationError> {
        let index = dir.join(SAFETENSORS_INDEX);
        let weights = if index.exists() {
            shard_names(&read_json(&index)?)?
                .into_iter()
                .map(|name| dir.join(name))
                .collect()
        } else {
            let single = dir.join(SINGLE_SAFETENSORS);
            if !single.exists() {
                return Err(GenerationError::Load(format!(
                    "no safetensors weights found in {}",
                    dir.display()
                )));
            }
            vec![single]
        };

        Ok(Self {
            config: dir.join("config.json"),
            tokenizer: dir.join("tokenizer.json"),
            weights,
        })
    }

    fn from_hub(model_id: &str, revision: &str) -> Result<Self, GenerationError> {
        let api = Api::new().map_err(|e| GenerationError::Load(format!("hub client: {e}")))?;
        let repo = api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));

        let weights = match repo.get(SAFETENSORS_INDEX) {
            Ok(index) => shard_names(&read_json(&index)?)?
                .iter()
                .map(|name| fetch(&repo, name))
                .collect::<Result<Vec<_>, _>>()?,
            Err(_) => vec![fetch(&repo, SINGLE_SAFETENSORS)?],
        };

        Ok(Self {
            config: fetch(&repo, "config.json")?,
            tokenizer: fetch(&repo, "tokenizer.json")?,
            weights,
        })
    }
}

fn fetch(repo: &ApiRepo, file: &str) -> Result<PathBuf, GenerationError> {
    repo.get(file)
        .map_err(|e| GenerationError::Load(format!("download {file}: {e}")))
}

fn read_json(path: &Path) -> Result<serde_json::Value, GenerationError> {
    let bytes = fs::read(path)
        .map_err(|e| GenerationError::Load(format!("read {}: {e}", path.display())))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| GenerationError::Load(format!("parse {}: {e}", path.display())))
}

/// Distinct shard file names from a safetensors index, in stable order.
fn shard_names(index: &serde_json::Value) -> Result<Vec<String>, GenerationError> {
    let map = index["weight_map"]
        .as_object()
        .ok_or_else(|| GenerationError::Load("index weight_map is not an object".into()))?;

    let names = map
        .values()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| GenerationError::Load("invalid shard entry in index".into()))
        })
        .collect::<Result<BTreeSet<_>, _>>()?;

    Ok(names.into_iter().collect())
}

/// `eos_token_id` may be a single id or a list of ids in `config.json`.
fn eos_ids_from_config(config: &serde_json::Value) -> Vec<u32> {
    match &config["eos_token_id"] {
        serde_json::Value::Number(n) => n.as_u64().map(|id| vec![id as u32]).unwrap_or_default(),
        serde_json::Value::Array(ids) => ids
            .iter()
            .filter_map(|v| v.as_u64())
            .map(|id| id as u32)
            .collect(),
        _ => Vec::new(),
    }
}

/// `max_length` counts the prompt, so a prompt that already fills it leaves
/// nothing to sample.
fn ensure_room_to_generate(prompt_tokens: usize, max_length: usize) -> Result<(), GenerationError> {
    if prompt_tokens >= max_length {
        return Err(GenerationError::InvalidParams(format!(
            "prompt is {prompt_tokens} tokens, which already reaches max_length {max_length}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------
// Generator
// ---------------------------------------------------------
pub struct CausalLmGenerator {
    model: Mutex<Backbone>,
    tokenizer: Tokenizer,
    device: Device,
    eos_ids: Vec<u32>,
    name: String,
    seed: Option<u64>,
}

impl CausalLmGenerator {
    pub fn load(cfg: &ModelConfig) -> Result<Self, GenerationError> {
        let device = match cfg.device {
            DeviceSpec::Cpu => Device::Cpu,
            DeviceSpec::Cuda(id) => Device::new_cuda(id).map_err(|e| {
                GenerationError::Load(format!(
                    "failed to initialize CUDA device {id} ({e}); build with the `cuda` feature"
                ))
            })?,
        };

        let (files, name) = match &cfg.local_dir {
            Some(dir) => {
                info!(snapshot = %dir.display(), "loading model from local snapshot");
                (ModelFiles::from_dir(dir)?, dir.display().to_string())
            }
            None => {
                info!(model = %cfg.model_id, revision = %cfg.revision, "fetching model from hub");
                (
                    ModelFiles::from_hub(&cfg.model_id, &cfg.revision)?,
                    cfg.model_id.clone(),
                )
            }
        };

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| GenerationError::Tokenizer(e.to_string()))?;

        let config = read_json(&files.config)?;
        let mut eos_ids = eos_ids_from_config(&config);
        if eos_ids.is_empty() {
            eos_ids = FALLBACK_EOS_TOKENS
                .iter()
                .filter_map(|tok| tokenizer.token_to_id(tok))
                .collect();
        }

        let dtype = if device.is_cuda() { DType::F16 } else { DType::F32 };
        info!(shards = files.weights.len(), ?dtype, "mapping weights");
        // SAFETY: the safetensors files are memory-mapped read-only and are not
        // modified while the process runs.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? };
        let model = Backbone::load(&config, vb)?;

        info!(model = %name, device = ?device, "model ready");

        Ok(Self {
            model: Mutex::new(model),
            tokenizer,
            device,
            eos_ids,
            name,
            seed: cfg.seed,
        })
    }

    fn decode(&self, ids: &[u32]) -> Result<String, GenerationError> {
        self.tokenizer
            .decode(ids, true)
            .map_err(|e| GenerationError::Tokenizer(e.to_string()))
    }

    /// Text added after the prompt, taken as the difference of the two
    /// decodings so word boundaries survive detokenization.
    fn continuation(&self, prompt_ids: &[u32], all_ids: &[u32]) -> Result<String, GenerationError> {
        if all_ids.len() == prompt_ids.len() {
            return Ok(String::new());
        }
        let full = self.decode(all_ids)?;
        let head = self.decode(prompt_ids)?;
        match full.strip_prefix(head.as_str()) {
            Some(rest) => Ok(rest.to_string()),
            None => self.decode(&all_ids[prompt_ids.len()..]),
        }
    }
}

impl TextGenerator for CausalLmGenerator {
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<String, GenerationError> {
        let enc = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| GenerationError::Tokenizer(e.to_string()))?;
        let prompt_ids = enc.get_ids().to_vec();
        if prompt_ids.is_empty() {
            return Err(GenerationError::Tokenizer("prompt produced no tokens".into()));
        }
        ensure_room_to_generate(prompt_ids.len(), params.max_length)?;

        let seed = params.seed.or(self.seed).unwrap_or_else(rand::random);
        let mut sampler = LogitsProcessor::new(seed, Some(params.temperature), Some(params.top_p));

        // A panic mid-generation poisons the lock; the cache reset below makes
        // the model usable again.
        let mut model = self.model.lock().unwrap_or_else(PoisonError::into_inner);
        model.clear_kv_cache();

        let mut tokens = prompt_ids.clone();
        let mut pos = 0usize;

        while tokens.len() < params.max_length {
            // first step: whole prompt; later: last token only
            let ctx: &[u32] = if pos == 0 {
                &tokens
            } else {
                &tokens[tokens.len() - 1..]
            };

            let input = Tensor::new(ctx, &self.device)?.unsqueeze(0)?;
            let out = model.forward(&input, pos)?;
            let seq_len = out.dim(1)?;
            let logits = out.i((0, seq_len - 1))?.to_dtype(DType::F32)?;
            pos += ctx.len();

            let next = sampler.sample(&logits)?;
            if self.eos_ids.contains(&next) {
                break;
            }
            tokens.push(next);
        }
        drop(model);

        debug!(
            new_tokens = tokens.len() - prompt_ids.len(),
            seed, "generation finished"
        );

        let continuation = self.continuation(&prompt_ids, &tokens)?;
        Ok(format!("{prompt}{continuation}"))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn shard_names_are_deduplicated_and_sorted() {
        let index = json!({
            "weight_map": {
                "a.weight": "model-00002-of-00002.safetensors",
                "b.weight": "model-00001-of-00002.safetensors",
                "c.weight": "model-00001-of-00002.safetensors"
            }
        });
        assert_eq!(
            shard_names(&index).unwrap(),
            vec![
                "model-00001-of-00002.safetensors".to_string(),
                "model-00002-of-00002.safetensors".to_string()
            ]
        );
    }

    #[test]
    fn shard_names_reject_malformed_index() {
        assert!(shard_names(&json!({ "weight_map": [] })).is_err());
        assert!(shard_names(&json!({ "weight_map": { "a": 3 } })).is_err());
    }

    #[test]
    fn eos_ids_accept_scalar_and_list() {
        assert_eq!(eos_ids_from_config(&json!({ "eos_token_id": 2 })), vec![2]);
        assert_eq!(
            eos_ids_from_config(&json!({ "eos_token_id": [32000, 32007] })),
            vec![32000, 32007]
        );
        assert!(eos_ids_from_config(&json!({})).is_empty());
    }

    #[test]
    fn prompt_must_leave_room_for_new_tokens() {
        assert!(ensure_room_to_generate(5, 6).is_ok());
        for (prompt_tokens, max_length) in [(6, 6), (10, 6)] {
            let err = ensure_room_to_generate(prompt_tokens, max_length).unwrap_err();
            assert!(
                matches!(err, GenerationError::InvalidParams(ref msg) if msg.contains("max_length"))
            );
        }
    }

    #[test]
    fn local_dir_without_weights_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ModelFiles::from_dir(dir.path()).unwrap_err();
        assert!(matches!(err, GenerationError::Load(_)));
    }

    #[test]
    fn local_dir_lists_indexed_shards() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(SAFETENSORS_INDEX),
            json!({ "weight_map": { "x": "part-1.safetensors", "y": "part-2.safetensors" } })
                .to_string(),
        )
        .unwrap();

        let files = ModelFiles::from_dir(dir.path()).unwrap();
        assert_eq!(
            files.weights,
            vec![
                dir.path().join("part-1.safetensors"),
                dir.path().join("part-2.safetensors")
            ]
        );
        assert_eq!(files.tokenizer, dir.path().join("tokenizer.json"));
    }

    #[test]
    fn samples_continuation_from_local_snapshot() {
        let Some(dir) = std::env::var_os("TEXTGEN_TEST_MODEL_DIR").map(PathBuf::from) else {
            eprintln!("TEXTGEN_TEST_MODEL_DIR not set, skipping test");
            return;
        };
        let cfg = ModelConfig {
            backend: crate::config::ModelBackend::Candle,
            model_id: String::new(),
            revision: "main".into(),
            local_dir: Some(dir),
            device: DeviceSpec::Cpu,
            seed: Some(42),
        };
        let generator = CausalLmGenerator::load(&cfg).expect("failed to load model");
        let params = SamplingParams {
            max_length: 24,
            temperature: 0.7,
            top_p: 0.9,
            seed: None,
        };
        let out = generator
            .generate("The capital of France is", &params)
            .expect("generation failed");
        assert!(out.starts_with("The capital of France is"));

        let too_short = SamplingParams {
            max_length: 2,
            ..params
        };
        let err = generator
            .generate("The capital of France is", &too_short)
            .unwrap_err();
        assert!(matches!(err, GenerationError::InvalidParams(_)));
    }
}
