//! LLM-driven optimization of traced parameters.
//!
//! Turns the feedback collected on a [`tracelm_core::TraceGraph`] into a
//! prompt, asks a text generator for new parameter values and applies the
//! part of the reply that fits.
//!
//! # Modules
//!
//! - [`sanitize`]: quote escaping and unprintable-character stripping
//! - [`parser`]: `name = value` reply parsing into a [`ParsedUpdate`]
//! - [`llm`]: the [`LlmProvider`] capability and its implementations
//! - [`context`]: the problem statement built from the graph
//! - [`optimizer`]: one optimization step
//! - [`trainer`]: the minibatch training loop
//! - [`config`]: provider, optimizer and trainer settings
//! - [`render`]: step reports

pub mod config;
pub mod context;
pub mod error;
pub mod llm;
pub mod optimizer;
pub mod parser;
pub mod render;
pub mod sanitize;
pub mod trainer;

pub use config::{load_json, LlmConfig, OptimizerConfig, TrainerConfig};
pub use context::ProblemContext;
pub use error::OptimError;
pub use llm::{LlmProvider, OpenAiCompatibleProvider, ProposalRequest, ScriptedProvider};
pub use optimizer::{cast_value, AppliedUpdate, Optimizer, ParameterChange, StepRecord};
pub use parser::{parse_equations, parse_response, ParsedUpdate};
pub use render::render_step;
pub use sanitize::{escape_inner_quotes, sanitize, strip_unprintable, Charset, SanitizeOptions};
pub use trainer::{Agent, DataLoader, Dataset, Guide, Judgement, MinibatchTrainer, TrainingSummary};
