//! Fetches every catalog model into the local models directory ahead of
//! serving, so the API never has to download on a request path.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use logprompt_service::{
    model::{ArtifactStore, ModelDescriptor, registry},
    telemetry::init_tracing,
};

#[derive(Debug, Parser)]
#[command(name = "download_models", about = "Download the supported models before starting the API")]
struct Args {
    /// Directory holding one hub cache per model.
    #[arg(long, env = "MODELS_DIR", default_value = "./models")]
    models_dir: PathBuf,

    /// Only fetch these models (repeatable). Defaults to the whole catalog.
    #[arg(long = "model", value_name = "NAME")]
    models: Vec<String>,

    /// Download again even when the files are already present.
    #[arg(long)]
    force: bool,

    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    hf_token: Option<String>,
}

enum Outcome {
    AlreadyPresent,
    Downloaded,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let targets = select_models(&args.models)?;
    let store = ArtifactStore::new(&args.models_dir)
        .with_token(args.hf_token.clone())
        .with_progress(true);
    store
        .ensure_models_dir()
        .with_context(|| format!("creating {}", args.models_dir.display()))?;

    let storage = std::fs::canonicalize(store.models_dir()).unwrap_or_else(|_| args.models_dir.clone());
    println!("LogPrompt Model Downloader");
    println!("{}", "=".repeat(50));
    println!("Downloading {} models...", targets.len());
    println!("Storage directory: {}", storage.display());
    println!();

    let overall = ProgressBar::new(targets.len() as u64);
    overall.set_style(
        ProgressStyle::with_template("{prefix} [{bar:40}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    overall.set_prefix("Overall progress");

    let report = run_batch(&store, &targets, args.force, &overall);
    overall.finish();

    println!();
    println!("{}", "=".repeat(50));
    if report.failed.is_empty() {
        println!("All {} models downloaded successfully!", report.succeeded.len());
    } else {
        println!("{} models failed to download:", report.failed.len());
        for (name, error) in &report.failed {
            println!("   - {name}: {error}");
        }
        println!();
        println!("{} models downloaded successfully", report.succeeded.len());
    }
    println!("Models stored in: {}", storage.display());
    println!("You can now start the API server with: logprompt_service");

    Ok(())
}

/// Per-model results of one downloader run.
#[derive(Debug, Default)]
struct BatchReport {
    succeeded: Vec<&'static str>,
    failed: Vec<(&'static str, String)>,
}

/// Processes every target in order. A failure is recorded and the batch moves
/// on to the next model.
fn run_batch(
    store: &ArtifactStore,
    targets: &[&'static ModelDescriptor],
    force: bool,
    overall: &ProgressBar,
) -> BatchReport {
    let total = targets.len();
    let mut report = BatchReport::default();

    for (i, descriptor) in targets.iter().copied().enumerate() {
        overall.println(format!("[{}/{}] Processing: {}", i + 1, total, descriptor.short_id));
        match download_one(store, descriptor, force, overall) {
            Ok(Outcome::AlreadyPresent) => {
                overall.set_message(format!("{} (cached)", descriptor.short_id));
                report.succeeded.push(descriptor.short_id);
            }
            Ok(Outcome::Downloaded) => {
                tracing::info!(model = descriptor.short_id, "downloaded");
                overall.set_message(format!("{} done", descriptor.short_id));
                report.succeeded.push(descriptor.short_id);
            }
            Err(err) => {
                tracing::error!(model = descriptor.short_id, error = %err, "download failed");
                overall.set_message(format!("{} failed", descriptor.short_id));
                report.failed.push((descriptor.short_id, err.to_string()));
            }
        }
        overall.inc(1);
    }
    report
}

fn select_models(requested: &[String]) -> anyhow::Result<Vec<&'static ModelDescriptor>> {
    if requested.is_empty() {
        return Ok(registry::CATALOG.iter().collect());
    }
    let mut selected: Vec<&'static ModelDescriptor> = Vec::new();
    for name in requested {
        let descriptor = registry::resolve(name)?;
        if !selected.contains(&descriptor) {
            selected.push(descriptor);
        }
    }
    Ok(selected)
}

fn download_one(
    store: &ArtifactStore,
    descriptor: &ModelDescriptor,
    force: bool,
    overall: &ProgressBar,
) -> anyhow::Result<Outcome> {
    if !force && store.locate(descriptor).is_some() {
        overall.println(format!("   already present in {}", store.cache_dir(descriptor).display()));
        return Ok(Outcome::AlreadyPresent);
    }

    // The hub client draws its own per-file bars; keep ours out of the way.
    let files = overall.suspend(|| {
        if force {
            store.force_fetch(descriptor)
        } else {
            store.fetch(descriptor).map(|(files, _)| files)
        }
    })?;

    for path in files.iter() {
        tracing::debug!(model = descriptor.short_id, file = %path.display(), "stored");
    }
    Ok(Outcome::Downloaded)
}
