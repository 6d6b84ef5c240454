use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tabula_core::{Registry, TabulaConfig};
use tabula_coord::{BenchHarness, BenchReport, BenchRow};
use tabula_gpu::Backend;

use crate::{select_backend, SelectedBackend};

/// Median trial time may grow this much over the baseline before the run fails.
const REGRESSION_PERCENT: f64 = 5.0;

pub async fn run_benchmark(
    config: TabulaConfig,
    json: bool,
    baseline_path: PathBuf,
    update_baseline: bool,
) -> Result<()> {
    let coordinator = &config.coordinator;
    let report = match select_backend(config.backend.kind, coordinator.width, coordinator.height)? {
        SelectedBackend::Wgpu(backend) => sweep(backend, &config).await?,
        SelectedBackend::Headless(backend) => sweep(backend, &config).await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let baselines = load_baselines(&baseline_path);
        let failed = print_report(&report, &baselines);
        if failed && !update_baseline {
            anyhow::bail!("Performance regression detected. See report above.");
        }
    }

    if update_baseline {
        if let Some(parent) = baseline_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(&report.rows)?;
        std::fs::write(&baseline_path, json)
            .with_context(|| format!("failed to write baseline: {}", baseline_path.display()))?;
        println!("📸 Updated baseline at {}", baseline_path.display());
    }

    Ok(())
}

async fn sweep<B: Backend>(backend: B, config: &TabulaConfig) -> Result<BenchReport> {
    let bench = &config.bench;
    println!("⚡ Tabula Encoding Benchmark");
    println!("   Backend:   {}", backend.name());
    println!(
        "   Workload:  {} dispatches x {} trials, 1..={} workers",
        bench.dispatch_count, bench.trials, bench.max_workers
    );

    let mut harness = BenchHarness::new(backend, Registry::shared(), bench.clone(), &config.ids)
        .context("failed to prepare benchmark")?;
    harness.sweep().await.context("benchmark run failed")
}

fn baseline_key(row: &BenchRow) -> String {
    format!("{}w@{}", row.workers, row.dispatch_count)
}

fn load_baselines(path: &Path) -> HashMap<String, BenchRow> {
    let mut baselines = HashMap::new();
    if let Ok(contents) = std::fs::read_to_string(path) {
        match serde_json::from_str::<Vec<BenchRow>>(&contents) {
            Ok(rows) => {
                for row in rows {
                    baselines.insert(baseline_key(&row), row);
                }
            }
            Err(e) => tracing::warn!("ignoring unreadable baseline {}: {}", path.display(), e),
        }
    }
    baselines
}

/// Print the table. Returns true when any row regressed against its baseline.
fn print_report(report: &BenchReport, baselines: &HashMap<String, BenchRow>) -> bool {
    println!("\n📊 Benchmark Report ({}):", report.backend);
    println!(
        "{:<8} | {:<10} | {:<12} | {:<12} | {:<12} | {}",
        "Workers", "Per worker", "Worker (ms)", "Trial (ms)", "Device (ms)", "Regression"
    );
    println!(
        "{:-<8}-+-{:-<10}-+-{:-<12}-+-{:-<12}-+-{:-<12}-+-{:-<10}",
        "", "", "", "", "", ""
    );

    let mut failed = false;
    for row in &report.rows {
        let mut regression = String::from("-");
        if let Some(baseline) = baselines.get(&baseline_key(row)) {
            if baseline.median_trial_ms > 0.0 {
                let percent =
                    (row.median_trial_ms - baseline.median_trial_ms) / baseline.median_trial_ms * 100.0;
                regression = if percent > REGRESSION_PERCENT {
                    failed = true;
                    format!("❌ +{:.1}%", percent)
                } else if percent < -REGRESSION_PERCENT {
                    format!("✅ {:.1}%", percent)
                } else {
                    format!("➖ {:.1}%", percent)
                };
            }
        }

        let per_worker = report.dispatch_count / row.workers.max(1) as u32;
        let device = row
            .median_device_ms
            .map_or_else(|| "-".to_string(), |ms| format!("{:.3}", ms));
        println!(
            "{:<8} | {:>10} | {:>12.3} | {:>12.3} | {:>12} | {}",
            row.workers, per_worker, row.median_worker_ms, row.median_trial_ms, device, regression
        );
    }
    println!();
    failed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(workers: usize, median_trial_ms: f64) -> BenchRow {
        BenchRow {
            workers,
            dispatch_count: 1000,
            trials: 10,
            median_worker_ms: 1.0,
            mean_worker_ms: 1.0,
            median_trial_ms,
            mean_trial_ms: median_trial_ms,
            median_device_ms: None,
            mean_device_ms: None,
        }
    }

    fn report(rows: Vec<BenchRow>) -> BenchReport {
        BenchReport {
            backend: "headless".into(),
            dispatch_count: 1000,
            trials: 10,
            rows,
        }
    }

    #[test]
    fn test_regression_flagged_over_threshold() {
        let baselines: HashMap<String, BenchRow> =
            [row(1, 10.0)].into_iter().map(|r| (baseline_key(&r), r)).collect();
        assert!(print_report(&report(vec![row(1, 11.0)]), &baselines));
        assert!(!print_report(&report(vec![row(1, 10.2)]), &baselines));
        assert!(!print_report(&report(vec![row(2, 50.0)]), &baselines));
    }

    #[test]
    fn test_missing_baseline_file_is_empty() {
        assert!(load_baselines(Path::new("/nonexistent/tabula/baseline.json")).is_empty());
    }
}
