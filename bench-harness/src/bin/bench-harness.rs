//! Aggregates Criterion's per-benchmark `estimates.json` files into a single
//! run manifest, and optionally diffs that manifest against a prior one to
//! flag regressions past a threshold.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bench-harness", about = "Criterion run aggregator and regression detector")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan a `target/criterion` directory and write a run manifest.
    Collect {
        /// Root of Criterion's output tree, usually `target/criterion`.
        #[arg(long, default_value = "target/criterion")]
        criterion_dir: PathBuf,
        /// Where to write the aggregated manifest.
        #[arg(long, default_value = "target/bench-manifest.json")]
        out: PathBuf,
    },
    /// Compare two manifests and fail if any benchmark regressed past the threshold.
    Compare {
        baseline: PathBuf,
        current: PathBuf,
        /// Allowed regression as a fraction of the baseline mean (0.10 = 10%).
        #[arg(long, default_value_t = 0.10)]
        threshold: f64,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct BenchResult {
    name: String,
    mean_ns: f64,
    std_dev_ns: f64,
}

#[derive(Serialize, Deserialize, Debug)]
struct RunManifest {
    generated_at: String,
    benches: Vec<BenchResult>,
}

/// Minimal shape of Criterion's `estimates.json`; only the mean point
/// estimate and its standard error are needed for regression detection.
#[derive(Deserialize)]
struct CriterionEstimates {
    mean: CriterionPointEstimate,
}

#[derive(Deserialize)]
struct CriterionPointEstimate {
    point_estimate: f64,
    standard_error: f64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();
    match cli.command {
        Command::Collect { criterion_dir, out } => collect(&criterion_dir, &out),
        Command::Compare { baseline, current, threshold } => compare(&baseline, &current, threshold),
    }
}

fn collect(criterion_dir: &Path, out: &Path) -> Result<()> {
    if !criterion_dir.is_dir() {
        bail!("criterion directory {} does not exist", criterion_dir.display());
    }

    let mut benches = Vec::new();
    let pattern = format!("{}/**/new/estimates.json", criterion_dir.display());
    for entry in glob::glob(&pattern).context("invalid glob pattern")? {
        let path = entry?;
        let name = bench_name_from_estimates_path(criterion_dir, &path)
            .unwrap_or_else(|| path.display().to_string());
        let raw = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let estimates: CriterionEstimates =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        benches.push(BenchResult {
            name,
            mean_ns: estimates.mean.point_estimate,
            std_dev_ns: estimates.mean.standard_error,
        });
    }

    benches.sort_by(|a, b| a.name.cmp(&b.name));
    if benches.is_empty() {
        tracing::warn!(dir = %criterion_dir.display(), "no estimates.json files found");
    }

    let manifest = RunManifest {
        generated_at: Utc::now().to_rfc3339(),
        benches,
    };
    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent).ok();
    }
    fs::write(out, serde_json::to_string_pretty(&manifest)?)
        .with_context(|| format!("writing {}", out.display()))?;
    tracing::info!(out = %out.display(), count = manifest.benches.len(), "wrote run manifest");
    Ok(())
}

/// `<criterion_dir>/<group>/<bench_id>/new/estimates.json` -> `group/bench_id`.
fn bench_name_from_estimates_path(criterion_dir: &Path, estimates_path: &Path) -> Option<String> {
    let relative = estimates_path.strip_prefix(criterion_dir).ok()?;
    let mut components: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    // Drop the trailing `new/estimates.json`.
    components.pop()?;
    components.pop()?;
    if components.is_empty() {
        return None;
    }
    Some(components.join("/"))
}

fn compare(baseline_path: &Path, current_path: &Path, threshold: f64) -> Result<()> {
    let baseline = read_manifest(baseline_path)?;
    let current = read_manifest(current_path)?;

    let baseline_by_name: BTreeMap<_, _> = baseline.benches.iter().map(|b| (b.name.clone(), b)).collect();
    let mut regressed = Vec::new();

    for bench in &current.benches {
        let Some(before) = baseline_by_name.get(&bench.name) else {
            tracing::info!(bench = %bench.name, "new benchmark, no baseline to compare");
            continue;
        };
        if before.mean_ns <= 0.0 {
            continue;
        }
        let delta = (bench.mean_ns - before.mean_ns) / before.mean_ns;
        if delta > threshold {
            regressed.push((bench.name.clone(), before.mean_ns, bench.mean_ns, delta));
        }
    }

    if regressed.is_empty() {
        tracing::info!(count = current.benches.len(), "no regressions past threshold");
        return Ok(());
    }

    for (name, before, after, delta) in &regressed {
        tracing::error!(
            bench = %name,
            before_ns = before,
            after_ns = after,
            regression_pct = delta * 100.0,
            "regression exceeds threshold"
        );
    }
    bail!("{} benchmark(s) regressed past {:.0}% threshold", regressed.len(), threshold * 100.0);
}

fn read_manifest(path: &Path) -> Result<RunManifest> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}
