//! SPIRAL CLI
//!
//! Command-line driver for evaluating SPIRAL documents: load a JSON
//! program, evaluate it against the builtin registry (plus any stdlib
//! documents), and print the result.

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{Shell, generate};
use spiral_core::Env;
use spiral_runtime::driver::{DEFAULT_MAX_STEPS, EvalOptions, evaluate};
use spiral_runtime::effects::EffectRegistry;
use spiral_runtime::{Document, Value, builtins, stdlib};
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::rc::Rc;
use tracing_subscriber::EnvFilter;

#[derive(ClapParser)]
#[command(name = "spiral")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "SPIRAL - evaluate multi-tier IR documents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a document and print its result as JSON
    Run {
        /// Input document (JSON)
        input: PathBuf,

        /// Step budget before the evaluation is aborted
        #[arg(long, default_value_t = DEFAULT_MAX_STEPS)]
        max_steps: u64,

        /// Log per-node evaluation and print the effect history
        #[arg(long)]
        trace: bool,

        /// Record effects without executing them
        #[arg(long)]
        queued_effects: bool,

        /// Pre-bound input, as name=json (repeatable)
        #[arg(long = "input", value_name = "NAME=JSON")]
        inputs: Vec<String>,

        /// Stdlib document(s) to load before evaluation
        #[arg(long = "stdlib", value_name = "PATH")]
        stdlib: Vec<PathBuf>,
    },

    /// Load and shape-check a document without evaluating it
    Check {
        /// Input document (JSON)
        input: PathBuf,
    },

    /// List registered builtin operators with signatures
    Ops,

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            input,
            max_steps,
            trace,
            queued_effects,
            inputs,
            stdlib,
        } => run(&input, max_steps, trace, queued_effects, &inputs, &stdlib),
        Commands::Check { input } => check(&input),
        Commands::Ops => ops(),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "spiral", &mut io::stdout());
        }
    }
}

fn load_document(path: &Path) -> Document {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("error: cannot read {}: {}", path.display(), e);
            process::exit(2);
        }
    };
    match Document::from_str(&text) {
        Ok(doc) => doc,
        Err(e) => {
            eprintln!("error: {}: {}", path.display(), e);
            process::exit(2);
        }
    }
}

fn parse_inputs(pairs: &[String]) -> Env<Value> {
    let mut env = Env::empty();
    for pair in pairs {
        let Some((name, raw)) = pair.split_once('=') else {
            eprintln!("error: input '{}' is not NAME=JSON", pair);
            process::exit(2);
        };
        let value = match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(json) => Value::from_json(&json),
            // A bare word reads as a string input.
            Err(_) => Value::Str(raw.to_string()),
        };
        env = env.extend(name.to_string(), value);
    }
    env
}

fn run(
    input: &Path,
    max_steps: u64,
    trace: bool,
    queued_effects: bool,
    inputs: &[String],
    stdlib_paths: &[PathBuf],
) {
    let doc = load_document(input);
    let registry = builtins::default_registry();
    let effects = Rc::new(if queued_effects {
        EffectRegistry::queued()
    } else {
        EffectRegistry::console()
    });
    let options = EvalOptions { max_steps, trace };

    if !stdlib_paths.is_empty() {
        let docs: Vec<Document> = stdlib_paths.iter().map(|p| load_document(p)).collect();
        if let Err(e) = stdlib::load_batch(&docs, &registry, &effects, &options) {
            eprintln!("error: {}", e);
            process::exit(2);
        }
    }

    let env = if inputs.is_empty() {
        None
    } else {
        Some(parse_inputs(inputs))
    };

    let evaluation = evaluate(doc, registry, effects, env, options);
    let rendered = serde_json::to_string_pretty(&evaluation.result.to_json())
        .unwrap_or_else(|_| "null".to_string());
    println!("{}", rendered);

    if trace {
        eprintln!("steps: {}", evaluation.steps);
        for effect in &evaluation.effects {
            let args: Vec<String> = effect
                .args
                .iter()
                .map(|a| a.to_json().to_string())
                .collect();
            eprintln!("effect: {}({})", effect.name, args.join(", "));
        }
    }

    if evaluation.result.is_error() {
        process::exit(1);
    }
}

fn check(input: &Path) {
    let doc = load_document(input);
    println!(
        "ok: {} node(s), {} def(s), result '{}'",
        doc.nodes.len(),
        doc.air_defs.len(),
        doc.result
    );
}

fn ops() {
    let registry = builtins::default_registry();
    for op in registry.all() {
        let params: Vec<&str> = op.params.iter().map(|t| t.kind_name()).collect();
        println!(
            "{}({}) -> {}{}",
            op.qualified(),
            params.join(", "),
            op.returns.kind_name(),
            if op.pure { "" } else { " [effectful]" }
        );
    }
}
