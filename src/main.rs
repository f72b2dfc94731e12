//! editloc-rs CLI: layer-sweep evaluation of localized model editing

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use editloc_rs::{
    run_sweep, Alg, EditableModel, ObjectiveMode, RunConfig, SweepConfig, SWEEP_ALL_LAYERS,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "editloc-rs")]
#[command(about = "Evaluate localized weight editing across layers and objectives")]
#[command(version)]
struct Cli {
    /// Editing algorithm (ROME or FT)
    #[arg(long)]
    alg_name: String,

    /// Model ID from `HuggingFace` (e.g., "gpt2", "gpt2-xl")
    #[arg(long, default_value = "gpt2-xl")]
    model_name: String,

    /// Dataset registry name (currently "cf")
    #[arg(long, default_value = "cf")]
    ds_name: String,

    /// Path to the dataset JSON file
    #[arg(long, default_value = "data/counterfact.json")]
    data_path: PathBuf,

    /// Optional JSON file of reference essence texts per subject
    #[arg(long)]
    snippet_path: Option<PathBuf>,

    /// Layer to edit; -1 edits the embedding, -2 defers to the sweep grid
    #[arg(long, default_value_t = SWEEP_ALL_LAYERS)]
    edit_layer: i64,

    /// Window sizes, space- or comma-separated (e.g. "1 3")
    #[arg(long, default_value = "1")]
    window_sizes: String,

    /// Truncate the dataset to the first n cases
    #[arg(long, short = 'n', default_value_t = 1000)]
    dataset_size_limit: usize,

    /// Overwrite previous per-case results instead of skipping them
    #[arg(long)]
    overwrite: bool,

    /// More printing during editing
    #[arg(long, short)]
    verbose: bool,

    /// Skip the essence drift test
    #[arg(long)]
    no_essence_tests: bool,

    /// Run slow generation-based consistency tests
    #[arg(long)]
    generation_tests: bool,

    /// Change the output to the prediction from the noised tracing input
    #[arg(long)]
    tracing_reversal: bool,

    /// Restore the true answer while the subject stays corrupted
    #[arg(long)]
    fact_forcing: bool,

    /// Erase the fact by pushing it toward its noised prior
    #[arg(long)]
    fact_erasure: bool,

    /// Fact-forcing variant attributed to weight-level causal tracing
    #[arg(long)]
    weight_based_tracing: bool,

    /// Keep weight backups on the accelerator instead of host memory
    #[arg(long)]
    no_conserve_memory: bool,

    /// Disable the gate that only edits cases the unedited model answers
    /// correctly
    #[arg(long)]
    no_correctness_check: bool,

    /// Only edit cases whose true target exceeds this probability (0 = off)
    #[arg(long, default_value_t = 0.1)]
    target_prob_check: f64,

    /// Skip running; only aggregate existing per-case results
    #[arg(long)]
    aggregate_only: bool,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long)]
    cpu: bool,

    /// Directory holding run directories and the summary CSV
    #[arg(long, default_value = "results")]
    results_dir: PathBuf,

    /// Directory holding per-(algorithm, model) hyperparameter files
    #[arg(long, default_value = "hparams")]
    hparams_dir: PathBuf,

    /// Object-storage endpoint for the summary CSV (skipped when unset)
    #[arg(long)]
    upload_endpoint: Option<String>,
}

fn parse_window_sizes(raw: &str) -> Result<Vec<usize>> {
    let sizes: Vec<usize> = raw
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect::<Result<_, _>>()?;
    if sizes.is_empty() {
        anyhow::bail!("no window sizes given");
    }
    Ok(sizes)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let alg = Alg::from_name(&cli.alg_name)?;
    let objective = ObjectiveMode::from_flags(
        cli.tracing_reversal,
        cli.fact_forcing,
        cli.fact_erasure,
        cli.weight_based_tracing,
    )?;
    let window_sizes = parse_window_sizes(&cli.window_sizes)?;

    println!("=== editloc-rs: localized model-editing evaluation ===");
    println!("Algorithm: {}", alg.name());
    println!("Model:     {}", cli.model_name);
    println!("Dataset:   {} ({})", cli.ds_name, cli.data_path.display());
    println!("Objective: {objective:?}");
    if cli.cpu {
        println!("Mode:      CPU (forced)");
    }

    info!("Loading model...");
    let mut model = EditableModel::from_pretrained(&cli.model_name, Some(cli.cpu))?;
    info!(
        "Model: {} layers, {} hidden, {} vocab",
        model.n_layers(),
        model.d_model(),
        model.vocab_size()
    );

    let run = RunConfig {
        alg,
        model_name: cli.model_name,
        ds_name: cli.ds_name,
        data_path: cli.data_path,
        snippet_path: cli.snippet_path,
        dataset_size_limit: Some(cli.dataset_size_limit),
        do_essence_tests: !cli.no_essence_tests,
        skip_generation_tests: !cli.generation_tests,
        conserve_memory: !cli.no_conserve_memory,
        verbose: cli.verbose,
        overwrite: cli.overwrite,
        correctness_check: !cli.no_correctness_check,
        target_prob_check: cli.target_prob_check,
        objective,
        results_dir: cli.results_dir,
        hparams_dir: cli.hparams_dir,
    };
    let sweep = SweepConfig {
        run,
        window_sizes,
        edit_layer: cli.edit_layer,
        run_experiments: !cli.aggregate_only,
        upload_endpoint: cli.upload_endpoint,
    };

    let (table, save_path) = run_sweep(&mut model, &sweep)?;
    if cli.verbose {
        println!("\nsample rows:");
        for row in table.rows.iter().take(5) {
            println!(
                " {} | {} -> {} | post_score {}",
                row.case_id,
                row.target.trim(),
                row.request.trim(),
                row.post_score
                    .map_or_else(|| "n/a".to_string(), |s| format!("{s:.3}")),
            );
        }
    }
    println!(
        "\nDone: {} row(s) written to {}",
        table.len(),
        save_path.display()
    );
    Ok(())
}
