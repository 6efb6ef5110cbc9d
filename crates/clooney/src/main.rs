// Copyright 2026 Clooney Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use clooney::codegen::{default_generators, generate_all};
use clooney::config::RunConfig;
use clooney::convergence::ConvergenceLoop;
use clooney::model::SchemaModel;
use clooney::normalize::Classifier;
use clooney::oracle::{DisabledOracle, GeminiConfig, GeminiOracle, Oracle};
use clooney::probe::HttpProbe;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "clooney",
    about = "Clooney: clone a REST API from captured traffic",
    version,
    after_help = "Run 'clooney <command> --help' for details on each command."
)]
struct Cli {
    /// Run configuration file (JSON)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose/debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the schema model from a capture file
    Parse {
        /// Capture file (JSON array of exchanges)
        capture: Option<PathBuf>,
        /// Where to write the schema model
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Render artifacts from a schema model
    Generate {
        /// Schema model file
        model: Option<PathBuf>,
        /// Output directory
        #[arg(long, short)]
        out_dir: Option<PathBuf>,
    },
    /// Run the convergence loop against a running clone
    Improve {
        /// Base URL of the clone under test
        #[arg(long)]
        base_url: Option<String>,
        /// Iteration budget
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Quality threshold in [0, 1]
        #[arg(long)]
        threshold: Option<f64>,
    },
}

fn init_tracing(json: bool, verbose: bool) -> Result<()> {
    let directive = if verbose { "clooney=debug" } else { "clooney=info" };
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(directive.parse().context("invalid log directive")?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn build_oracle(config: &RunConfig) -> Result<Arc<dyn Oracle>> {
    if !config.oracle.enabled {
        return Ok(Arc::new(DisabledOracle));
    }
    match GeminiConfig::from_env() {
        Some(gemini) => {
            info!(model = %gemini.model, "using gemini oracle");
            Ok(Arc::new(GeminiOracle::new(gemini).context("failed to build gemini client")?))
        }
        None => {
            warn!("GEMINI_API_KEY not set, running without oracle");
            Ok(Arc::new(DisabledOracle))
        }
    }
}

async fn run_parse(
    mut config: RunConfig,
    capture: Option<PathBuf>,
    output: Option<PathBuf>,
) -> Result<()> {
    if let Some(capture) = capture {
        config.capture_path = Some(capture);
    }
    let Some(capture) = config.capture_path.clone() else {
        bail!("no capture file given (argument, config, or CLOONEY_CAPTURE)");
    };
    let output = output
        .or_else(|| config.model_path.clone())
        .unwrap_or_else(|| PathBuf::from("schema_model.json"));

    let messages = clooney::capture::load_capture(&capture)
        .with_context(|| format!("failed to read capture {}", capture.display()))?;
    let classifier = Classifier::new(&config.classifier)?;
    let mut model =
        SchemaModel::from_capture(&messages, &classifier, &config.inference_options());
    let oracle = build_oracle(&config)?;
    clooney::enrich::enrich_model(&mut model, oracle.as_ref()).await;
    model
        .save(&output)
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!(
        "{} endpoints, {} entities with relationships -> {}",
        model.endpoints.len(),
        model.relationships.len(),
        output.display()
    );
    Ok(())
}

fn run_generate(config: RunConfig, model: Option<PathBuf>, out_dir: Option<PathBuf>) -> Result<()> {
    let Some(model_path) = model.or(config.model_path) else {
        bail!("no schema model given (argument, config, or CLOONEY_MODEL)");
    };
    let out_dir = out_dir
        .or(config.output_dir)
        .unwrap_or_else(|| PathBuf::from("generated"));
    let model = SchemaModel::load(&model_path)
        .with_context(|| format!("failed to load {}", model_path.display()))?;
    let artifacts = generate_all(&default_generators(), &model, Some(&out_dir))?;
    for artifact in artifacts {
        println!("{}", out_dir.join(artifact.filename).display());
    }
    Ok(())
}

async fn run_improve(
    mut config: RunConfig,
    base_url: Option<String>,
    max_iterations: Option<u32>,
    threshold: Option<f64>,
) -> Result<()> {
    if let Some(url) = base_url {
        config.probe.base_url = url;
    }
    if let Some(n) = max_iterations {
        config.max_iterations = n;
    }
    if let Some(t) = threshold {
        config.quality_threshold = t;
    }
    config.validate()?;

    let oracle = build_oracle(&config)?;
    let probe = Arc::new(HttpProbe::new(&config.probe.base_url, config.probe.timeout())?);
    let mut runner = ConvergenceLoop::new(config, oracle, probe, default_generators());
    let report = runner.run().await.context("convergence loop failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json, cli.verbose)?;

    let config = RunConfig::resolve(cli.config.as_deref()).context("failed to resolve config")?;
    info!("clooney v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Parse { capture, output } => run_parse(config, capture, output).await,
        Commands::Generate { model, out_dir } => run_generate(config, model, out_dir),
        Commands::Improve {
            base_url,
            max_iterations,
            threshold,
        } => run_improve(config, base_url, max_iterations, threshold).await,
    }
}
