//! Configuration for providers, the optimizer and the trainer.
//!
//! Every struct deserializes from partial JSON (missing fields take their
//! defaults), so a config file only needs to name what it changes.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::OptimError;
use crate::sanitize::SanitizeOptions;

/// Connection settings for an OpenAI-compatible chat provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider key: `openrouter` or `openai_compatible`.
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Required for `openai_compatible`; `openrouter` has a default.
    pub api_base_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub system_prompt: Option<String>,
}

impl LlmConfig {
    /// Reads the `TRACELM_LLM_*` environment variables. Blank values count
    /// as unset.
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        LlmConfig {
            provider: var("TRACELM_LLM_PROVIDER"),
            model: var("TRACELM_LLM_MODEL"),
            api_base_url: var("TRACELM_LLM_BASE_URL"),
            api_key: var("TRACELM_LLM_API_KEY"),
            system_prompt: var("TRACELM_LLM_SYSTEM_PROMPT"),
        }
    }

    /// True when enough is set to attempt a request.
    pub fn is_configured(&self) -> bool {
        let base_ok = match self.provider.as_deref() {
            Some("openrouter") => true,
            Some("openai_compatible") => self.api_base_url.is_some(),
            _ => false,
        };
        base_ok && self.model.is_some() && self.api_key.is_some()
    }
}

/// Behavior of a single optimization step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Task statement placed under `#Instruction`.
    pub objective: String,
    /// Separator used when merging feedback from several terminals.
    pub feedback_separator: String,
    pub sanitize: SanitizeOptions,
    /// Ask the provider for a JSON object with a `"suggestion"` map instead
    /// of `name = value` lines.
    pub json_mode: bool,
    /// How many past (variables, feedback) pairs to show the provider as
    /// `#History`.
    pub memory_size: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            objective: "You need to change the values of the variables in #Variables to improve the output in accordance with #Feedback.".to_string(),
            feedback_separator: "\n\n".to_string(),
            sanitize: SanitizeOptions::default(),
            json_mode: false,
            memory_size: 0,
        }
    }
}

/// Minibatch training loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub num_epochs: usize,
    pub batch_size: usize,
    /// Evaluate on the test set every this many updates; 0 disables.
    pub eval_frequency: usize,
    /// Log progress every this many updates; defaults to `eval_frequency`.
    pub log_frequency: Option<usize>,
    /// Score given to instances whose forward pass failed.
    pub min_score: f64,
    /// Shuffle each epoch with this seed; `None` keeps dataset order.
    pub shuffle_seed: Option<u64>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        TrainerConfig {
            num_epochs: 1,
            batch_size: 1,
            eval_frequency: 1,
            log_frequency: None,
            min_score: 0.0,
            shuffle_seed: None,
        }
    }
}

/// Reads a JSON config file into any of the config structs.
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, OptimError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}
