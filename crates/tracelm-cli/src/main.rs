//! tracelm command-line tools.
//!
//! Provides the `tracelm` binary:
//! - `parse` prints the parameter update a model reply proposes, as JSON.
//! - `sanitize` prints a reply after quote escaping and character stripping.
//! - `step` runs one optimizer step on an exported trace graph.
//!
//! `step` talks to the provider configured through the environment:
//! - `TRACELM_LLM_PROVIDER`: `openrouter` or `openai_compatible`
//! - `TRACELM_LLM_MODEL`, `TRACELM_LLM_API_KEY`
//! - `TRACELM_LLM_BASE_URL` (required for `openai_compatible`)
//! - `TRACELM_LLM_SYSTEM_PROMPT` (optional)
//!
//! Log output goes to stderr and is filtered with `RUST_LOG`.

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tracelm_core::{NodeId, TraceGraph};
use tracelm_optim::{
    load_json, parse_response, render_step, sanitize, Charset, LlmConfig, LlmProvider,
    OpenAiCompatibleProvider, OptimError, Optimizer, OptimizerConfig, SanitizeOptions,
    ScriptedProvider,
};

#[derive(Parser)]
#[command(name = "tracelm", about = "Trace-graph feedback propagation and LLM reply tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a model reply into a parameter update.
    Parse {
        /// File holding the reply text.
        file: PathBuf,

        /// Strip everything outside printable ASCII.
        #[arg(long)]
        ascii: bool,
    },

    /// Sanitize a model reply.
    Sanitize {
        /// File holding the reply text.
        file: PathBuf,

        /// Strip everything outside printable ASCII.
        #[arg(long)]
        ascii: bool,

        /// Only strip characters; leave quotes alone.
        #[arg(long)]
        no_escape: bool,
    },

    /// Propagate feedback from a terminal node and run one optimizer step.
    Step {
        /// Exported trace graph (JSON).
        #[arg(short, long)]
        graph: PathBuf,

        /// Id of the terminal node the feedback is about.
        #[arg(short, long)]
        terminal: u32,

        /// Feedback text for the terminal.
        #[arg(short, long)]
        feedback: String,

        /// Optimizer config (JSON). Missing fields take defaults.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Use the reply in this file instead of calling the provider.
        #[arg(long)]
        reply: Option<PathBuf>,

        /// Where to write the updated graph (default: stdout).
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let exit_code = match cli.command {
        Commands::Parse { file, ascii } => run_parse(&file, ascii),
        Commands::Sanitize {
            file,
            ascii,
            no_escape,
        } => run_sanitize(&file, ascii, no_escape),
        Commands::Step {
            graph,
            terminal,
            feedback,
            config,
            reply,
            out,
        } => {
            let result = run_step(&graph, NodeId(terminal), &feedback, config, reply, out).await;
            match result {
                Ok(()) => 0,
                Err(err) => {
                    eprintln!("Error: {}", err);
                    exit_code(&err)
                }
            }
        }
    };
    process::exit(exit_code);
}

/// Exit code for a failed command: 1 = bad input, 2 = provider failure,
/// 3 = I/O error.
fn exit_code(err: &OptimError) -> i32 {
    match err {
        OptimError::Core(_) | OptimError::Serialization(_) | OptimError::Execution { .. } => 1,
        OptimError::Provider(_) | OptimError::Config(_) => 2,
        OptimError::Io(_) => 3,
    }
}

fn sanitize_options(ascii: bool, escape_quotes: bool) -> SanitizeOptions {
    SanitizeOptions {
        charset: if ascii { Charset::Ascii } else { Charset::Unicode },
        escape_quotes,
    }
}

fn read_text(path: &Path) -> Result<String, i32> {
    std::fs::read_to_string(path).map_err(|e| {
        eprintln!("Error: failed to read '{}': {}", path.display(), e);
        3
    })
}

fn run_parse(file: &Path, ascii: bool) -> i32 {
    let text = match read_text(file) {
        Ok(text) => text,
        Err(code) => return code,
    };
    let update = parse_response(&text, &sanitize_options(ascii, true));
    match serde_json::to_string_pretty(&update) {
        Ok(json) => {
            println!("{}", json);
            0
        }
        Err(e) => {
            eprintln!("Error: failed to serialize update: {}", e);
            1
        }
    }
}

fn run_sanitize(file: &Path, ascii: bool, no_escape: bool) -> i32 {
    match read_text(file) {
        Ok(text) => {
            print!("{}", sanitize(&text, &sanitize_options(ascii, !no_escape)));
            0
        }
        Err(code) => code,
    }
}

async fn run_step(
    graph_path: &Path,
    terminal: NodeId,
    feedback: &str,
    config_path: Option<PathBuf>,
    reply_path: Option<PathBuf>,
    out: Option<PathBuf>,
) -> Result<(), OptimError> {
    let mut graph: TraceGraph = load_json(graph_path)?;
    graph.validate()?;
    let config: OptimizerConfig = match config_path {
        Some(path) => load_json(path)?,
        None => OptimizerConfig::default(),
    };

    match reply_path {
        Some(path) => {
            let reply = std::fs::read_to_string(path)?;
            step_with(ScriptedProvider::new([reply]), &mut graph, terminal, feedback, config).await?
        }
        None => {
            let llm = LlmConfig::from_env();
            if !llm.is_configured() {
                return Err(OptimError::Config(
                    "set TRACELM_LLM_PROVIDER, TRACELM_LLM_MODEL and TRACELM_LLM_API_KEY".to_string(),
                ));
            }
            let provider = OpenAiCompatibleProvider::new(llm)?;
            step_with(provider, &mut graph, terminal, feedback, config).await?
        }
    }

    let json = serde_json::to_string_pretty(&graph)?;
    match out {
        Some(path) => std::fs::write(path, json)?,
        None => println!("{}", json),
    }
    Ok(())
}

async fn step_with<P: LlmProvider>(
    provider: P,
    graph: &mut TraceGraph,
    terminal: NodeId,
    feedback: &str,
    config: OptimizerConfig,
) -> Result<(), OptimError> {
    let mut optimizer = Optimizer::new(provider, graph.parameters(), config);
    optimizer.zero_feedback(graph);
    let report = optimizer.backward(graph, terminal, feedback)?;
    tracing::info!(
        terminal = %terminal,
        visited = report.visited.len(),
        parameters = report.reached_parameters.len(),
        "propagated feedback"
    );
    let record = optimizer.step(graph).await?;
    eprint!("{}", render_step(&record));
    Ok(())
}
