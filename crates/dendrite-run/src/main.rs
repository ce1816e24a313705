//! dendrite-run - compiles a model into a generated simulator program.
//!
//! Loads a model document, digests it, and writes the generated Rust
//! source plus job artifacts (a `params` file listing overridable
//! constants) into the job directory. On digest failure the diagnostics go
//! to stderr and a `failure` sentinel is left in the job directory.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dendrite_codegen::{emit_program, Settings};
use dendrite_digest::{digest, Target};
use dendrite_model::{EquationSet, Node};

#[derive(Parser, Debug)]
#[command(name = "dendrite-run")]
#[command(about = "Compile a model into a generated simulator program")]
struct Cli {
    /// Path to the model document
    model: PathBuf,

    /// Numeric regime: float, double, or int (fixed-point).
    /// Defaults to the model's `backend/rust/type` metadata, then double.
    #[arg(long)]
    target: Option<String>,

    /// Job directory for generated artifacts
    #[arg(short, long, default_value = "job")]
    out: PathBuf,

    /// Emit the library ABI instead of a standalone main
    #[arg(long)]
    library: bool,

    /// Random seed baked into the generated program
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Also write the digested model as JSON, for inspection
    #[arg(long)]
    dump_digest: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dendrite_run=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match compile(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{message}");
            let _ = std::fs::create_dir_all(&cli.out);
            let _ = std::fs::write(cli.out.join("failure"), &message);
            eprintln!("Exception: {message}");
            ExitCode::FAILURE
        }
    }
}

fn compile(cli: &Cli) -> Result<(), String> {
    let text = std::fs::read_to_string(&cli.model)
        .map_err(|e| format!("cannot read {}: {e}", cli.model.display()))?;
    let document = Node::from_text(&text).map_err(|e| e.to_string())?;
    let name = cli
        .model
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    info!(model = %name, "loaded");

    let mut model = EquationSet::from_node(name, &document).map_err(|e| e.to_string())?;

    let requested = cli.target.clone().unwrap_or_else(|| {
        let from_metadata = model
            .metadata
            .child_path(&["backend", "rust", "type"])
            .map(|n| n.value.clone())
            .unwrap_or_default();
        if from_metadata.is_empty() {
            "double".to_string()
        } else {
            from_metadata
        }
    });
    let target = match requested.as_str() {
        "float" => Target::Float,
        "double" => Target::Double,
        "int" => Target::Int,
        other => return Err(format!("unknown target '{other}'")),
    };
    let digest = digest(&mut model, target).map_err(|errors| {
        errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    })?;
    info!(params = digest.params.len(), "digested");

    std::fs::create_dir_all(&cli.out).map_err(|e| e.to_string())?;

    if cli.dump_digest {
        let json = serde_json::to_string_pretty(&model).map_err(|e| e.to_string())?;
        std::fs::write(cli.out.join("digest.json"), json).map_err(|e| e.to_string())?;
    }

    let mut params = String::new();
    for param in &digest.params {
        params.push_str(&param.name);
        params.push('=');
        params.push_str(&param.value);
        if !param.hint.is_empty() {
            params.push(';');
            params.push_str(&param.hint);
        }
        params.push('\n');
    }
    std::fs::write(cli.out.join("params"), params).map_err(|e| e.to_string())?;

    let settings = Settings {
        target,
        seed: cli.seed,
        library: cli.library,
        ..Settings::default()
    };
    let source = emit_program(&model, &digest.params, &settings).map_err(|e| e.to_string())?;
    let out = cli.out.join("model.rs");
    std::fs::write(&out, source).map_err(|e| e.to_string())?;
    info!(file = %out.display(), "emitted");
    Ok(())
}
