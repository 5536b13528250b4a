//! Shale CLI
//!
//! Runs the shape analyzer on a serialized program (JSON produced by a
//! front-end through `shale-ir`) and prints the detected memory-safety
//! violations, or dumps heap plots of the final per-block states.

use clap::{Parser, Subcommand};
use shale::{AnalyzerConfig, analyze_storage, exec_fnc_with_states, EngineCtx};
use shale_ir::{FncId, Storage};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "shale")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Shape analyzer for pointer-manipulating programs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a program and print the detected violations
    Analyze {
        /// Serialized program (JSON)
        program: PathBuf,

        /// Analyzer configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Analyze a program and dump heap plots of the final states
    Plot {
        /// Serialized program (JSON)
        program: PathBuf,

        /// Directory receiving the .dot files
        #[arg(long, default_value = "plots")]
        out_dir: PathBuf,

        /// Analyzer configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> Result<AnalyzerConfig, String> {
    let Some(path) = path else {
        return Ok(AnalyzerConfig::new());
    };
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    AnalyzerConfig::from_toml(&text).map_err(|e| format!("{}: {}", path.display(), e))
}

fn load_program(path: &Path) -> Result<Arc<Storage>, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let stor: Storage =
        serde_json::from_str(&text).map_err(|e| format!("{}: {}", path.display(), e))?;
    Ok(Arc::new(stor))
}

fn cmd_analyze(program: &Path, config: Option<&Path>) -> Result<i32, String> {
    let config = load_config(config)?;
    let stor = load_program(program)?;

    let result = analyze_storage(config, stor);

    for report in result.reports.as_slice() {
        println!("{}", report);
        for loc in result.trace.insn_trail(report.trace).into_iter().skip(1) {
            println!("    reached from {}", loc);
        }
    }
    if !result.complete {
        eprintln!("warning: analysis incomplete, results may miss defects");
    }

    info!(errors = result.reports.len(), "analysis finished");
    Ok(if result.reports.is_empty() { 0 } else { 1 })
}

fn cmd_plot(program: &Path, out_dir: &Path, config: Option<&Path>) -> Result<i32, String> {
    let config = load_config(config)?;
    let stor = load_program(program)?;

    std::fs::create_dir_all(out_dir)
        .map_err(|e| format!("cannot create {}: {}", out_dir.display(), e))?;

    let mut ctx = EngineCtx::new(config);
    let mut reports = shale::CollectedReports::new();
    let mut written = 0usize;

    for id in 0..stor.fncs.len() as u32 {
        let id = FncId(id);
        let fnc = stor.fnc(id);
        if !fnc.is_defined() {
            continue;
        }

        let (states, _) = exec_fnc_with_states(&mut ctx, &stor, id, &mut reports);
        for bb in fnc.block_ids() {
            let Some(state) = states.state(bb) else {
                continue;
            };
            for sh in state.iter() {
                let name = format!("{}-{}", fnc.name, fnc.block(bb).name);
                shale::plot::plot_heap_to_file(out_dir, sh, &name)
                    .map_err(|e| format!("plot failed: {}", e))?;
                written += 1;
            }
        }
    }

    println!("{} heap plots written to {}", written, out_dir.display());
    Ok(0)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let outcome = match &cli.command {
        Commands::Analyze { program, config } => cmd_analyze(program, config.as_deref()),
        Commands::Plot {
            program,
            out_dir,
            config,
        } => cmd_plot(program, out_dir, config.as_deref()),
    };

    match outcome {
        Ok(code) => process::exit(code),
        Err(msg) => {
            eprintln!("error: {}", msg);
            process::exit(2);
        }
    }
}
