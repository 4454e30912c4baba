use std::cmp::Ordering;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Local;
use colored::Colorize;
use serde_json::json;

use crate::config::Settings;
use crate::limiter::StatsSnapshot;
use crate::tester::TestResult;

/// Sorts successful results first, by speed descending with latency
/// ascending as tiebreaker. The order is total, so identical inputs always
/// produce identical output.
pub fn rank(results: &mut [TestResult]) {
    results.sort_by(compare);
}

fn compare(a: &TestResult, b: &TestResult) -> Ordering {
    match (a.is_success(), b.is_success()) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }

    option_desc(a.speed_mbps, b.speed_mbps)
        .then_with(|| option_asc(a.latency_ms, b.latency_ms))
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.server.cmp(&b.server))
        .then_with(|| a.port.cmp(&b.port))
}

fn option_desc(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn option_asc(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Builds the persisted report document for an already-ranked result list.
pub fn build_report(results: &[TestResult], settings: &Settings) -> serde_json::Value {
    let success: Vec<&TestResult> = results.iter().filter(|r| r.is_success()).collect();
    let success_rate = if results.is_empty() {
        "0%".to_string()
    } else {
        format!("{:.1}%", success.len() as f64 / results.len() as f64 * 100.0)
    };

    let top_n = settings.output.show_top_nodes.min(success.len());
    let top: Vec<&TestResult> = success[..top_n].to_vec();
    let all: Vec<&TestResult> = if settings.output.save_all_results {
        results.iter().collect()
    } else {
        success.clone()
    };

    json!({
        "timestamp": Local::now().to_rfc3339(),
        "total_tested": results.len(),
        "success_count": success.len(),
        "success_rate": success_rate,
        "test_config": {
            "max_nodes": settings.test.max_nodes,
            "concurrency": settings.test.concurrency,
            "timeout": settings.test.timeout_secs,
        },
        "top_nodes": top,
        "all_results": all,
    })
}

/// Writes the report under the results directory with a timestamped name.
pub fn save_report(results: &[TestResult], settings: &Settings) -> Result<PathBuf> {
    let dir = PathBuf::from(&settings.output.results_dir);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create results dir {}", dir.display()))?;

    let filename = format!(
        "subscheck_results_{}.json",
        Local::now().format("%Y%m%d_%H%M%S")
    );
    let path = dir.join(filename);
    let report = build_report(results, settings);
    std::fs::write(&path, serde_json::to_string_pretty(&report)?)
        .with_context(|| format!("failed to write report to {}", path.display()))?;

    log::info!("results saved to {}", path.display());
    Ok(path)
}

/// Terminal table of the best nodes, ranked input assumed.
pub fn print_table(results: &[TestResult], top_n: usize) {
    let success: Vec<&TestResult> = results.iter().filter(|r| r.is_success()).collect();

    println!("\n{}", "=".repeat(80));
    println!("{}", "Test results".bold());
    println!("{}", "=".repeat(80));
    println!("Total tested: {}", results.len());
    println!("Successful:   {}", success.len().to_string().green());
    if !results.is_empty() {
        println!(
            "Success rate: {:.1}%",
            success.len() as f64 / results.len() as f64 * 100.0
        );
    }

    let shown = top_n.min(success.len());
    if shown == 0 {
        println!("\n{}", "No usable nodes found.".yellow());
        return;
    }

    println!("\nTop {shown} nodes by speed:");
    println!("{}", "-".repeat(80));
    println!(
        "{:<3} {:<35} {:>12} {:>10} {:<20}",
        "#", "Name", "Speed", "Latency", "Server"
    );
    println!("{}", "-".repeat(80));
    for (i, result) in success.iter().take(shown).enumerate() {
        let speed = result
            .speed_mbps
            .map(|s| format!("{s:.2}Mbps"))
            .unwrap_or_else(|| "N/A".to_string());
        let latency = result
            .latency_ms
            .map(|l| format!("{l:.0}ms"))
            .unwrap_or_else(|| "N/A".to_string());
        let name: String = result.name.chars().take(34).collect();
        println!(
            "{:<3} {:<35} {:>12} {:>10} {:<20}",
            i + 1,
            name,
            speed.cyan(),
            latency,
            result.server
        );
    }
}

/// End-of-run traffic and counter summary.
pub fn print_summary(stats: &StatsSnapshot, elapsed_secs: f64) {
    println!("\n{}", "Run statistics".bold());
    println!(
        "  Traffic: {} | Tested: {} | Success: {} | Failed: {} | Rate: {:.1}% | Took: {:.1}s",
        format!("{:.2} MiB", stats.total_mib()).cyan(),
        stats.nodes_tested,
        stats.successful_nodes.to_string().green(),
        stats.failed_nodes,
        stats.success_rate(),
        elapsed_secs,
    );
}
