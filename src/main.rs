mod cli;
mod config;
mod engine;
mod ipinfo;
mod limiter;
mod node;
mod parser;
mod pool;
mod ports;
mod probe;
mod process;
mod report;
mod resources;
mod scheduler;
mod socks;
mod subscription;
mod tester;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::{Generator, generate};
use colored::Colorize;

use cli::{Args, Commands};
use config::Settings;
use node::NodeKind;
use pool::WorkerPool;
use resources::ResourceManager;
use subscription::Fetcher;
use tester::{NodeTester, TestContext};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(cmd) = args.cmd {
        match cmd {
            Commands::Completions { shell } => {
                print_completions(shell, &mut Args::command());
                return Ok(());
            }
        }
    }

    let log_level = match (args.debug, args.verbose) {
        (true, _) => "debug",
        (false, true) => "info",
        _ => "warn",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    args.validate().context("Invalid command line arguments")?;

    print_banner();

    let mut settings =
        config::load_settings(Path::new(&args.config)).context("Failed to load configuration")?;
    if let Some(max_nodes) = args.max_nodes {
        settings.test.max_nodes = max_nodes;
    }

    let interrupted = if args.scheduler {
        if !settings.scheduler.enabled {
            log::warn!("scheduler not enabled in config, running on --scheduler flag anyway");
        }
        let run_time = settings.scheduler.time.clone();
        let subscription = args.subscription.clone();
        scheduler::run_daily(&run_time, move || {
            let settings = settings.clone();
            let subscription = subscription.clone();
            async move { run_pipeline(settings, Path::new(&subscription)).await }
        })
        .await
        .context("Scheduler failed")?;
        // The daily loop only returns once a run was interrupted.
        true
    } else {
        run_pipeline(settings, Path::new(&args.subscription))
            .await
            .context("Pipeline failed")?
    };

    if interrupted {
        std::process::exit(130);
    }
    Ok(())
}

/// One full pass: fetch, parse, dedupe, test, rank, persist. Returns
/// whether the run was cut short by an interrupt; partial results are still
/// reported in that case.
async fn run_pipeline(settings: Settings, subscription_path: &Path) -> Result<bool> {
    let started = Instant::now();

    let resources = Arc::new(ResourceManager::new(&settings.test));
    let signal_task = resources::spawn_signal_handler(Arc::clone(&resources));

    let urls = subscription::read_subscription_file(subscription_path)?;
    log::info!("found {} subscription URL(s)", urls.len());

    let fetcher = Fetcher::new(&settings.network).context("Failed to build HTTP client")?;
    let raw_nodes = subscription::collect_nodes(
        &fetcher,
        &urls,
        settings.test.max_nodes,
        settings.network.fetch_concurrency,
    )
    .await;

    log::info!(
        "parsed nodes - vmess: {}, vless: {}, trojan: {}, ss: {}",
        raw_nodes.iter().filter(|n| n.kind() == NodeKind::Vmess).count(),
        raw_nodes.iter().filter(|n| n.kind() == NodeKind::Vless).count(),
        raw_nodes.iter().filter(|n| n.kind() == NodeKind::Trojan).count(),
        raw_nodes
            .iter()
            .filter(|n| n.kind() == NodeKind::Shadowsocks)
            .count(),
    );

    let mut nodes = node::dedupe(raw_nodes);
    log::info!("{} unique node(s) after deduplication", nodes.len());
    if settings.test.max_nodes > 0 && nodes.len() > settings.test.max_nodes {
        nodes.truncate(settings.test.max_nodes);
        log::info!("capped test list at {} node(s)", settings.test.max_nodes);
    }

    if nodes.is_empty() {
        log::warn!("no testable nodes; writing empty report");
        report::print_table(&[], settings.output.show_top_nodes);
        report::save_report(&[], &settings)?;
        resources.cleanup_all().await;
        let interrupted = resources.stop_requested();
        signal_task.abort();
        return Ok(interrupted);
    }

    let ctx = Arc::new(
        TestContext::new(settings.clone(), Arc::clone(&resources))
            .context("Failed to initialize test context")?,
    );
    let tester = Arc::new(NodeTester::new(Arc::clone(&ctx)));

    println!(
        "\n{} Testing {} nodes with {} workers",
        "[subprobe]".blue().bold(),
        nodes.len().to_string().cyan(),
        settings.test.concurrency.to_string().cyan(),
    );

    let pool = WorkerPool::new(settings.test.concurrency, settings.test.success_limit);
    let mut results = pool
        .run(nodes, Arc::clone(&resources), {
            let tester = Arc::clone(&tester);
            let ctx = Arc::clone(&ctx);
            move |node, index| {
                let tester = Arc::clone(&tester);
                let ctx = Arc::clone(&ctx);
                async move {
                    let result = tester.test_node(&node, index).await;
                    ctx.stats.record_node(result.is_success());
                    result
                }
            }
        })
        .await;

    report::rank(&mut results);
    report::print_table(&results, settings.output.show_top_nodes);
    report::save_report(&results, &settings)?;
    report::print_summary(&ctx.stats.snapshot(), started.elapsed().as_secs_f64());

    resources.cleanup_all().await;
    let interrupted = resources.stop_requested();
    signal_task.abort();

    if interrupted {
        println!("\n{} Run interrupted, partial report written", "[subprobe]".yellow().bold());
    } else {
        println!("\n{} Run completed", "[subprobe]".blue().bold());
    }
    Ok(interrupted)
}

fn print_completions<G: Generator>(generator: G, cmd: &mut clap::Command) {
    generate(
        generator,
        cmd,
        cmd.get_name().to_string(),
        &mut std::io::stdout(),
    );
}

fn print_banner() {
    println!(
        "{} {}",
        "subprobe".blue().bold(),
        "- subscription node tester powered by sing-box".white()
    );
}
