mod checker;
mod db;
mod extract;
mod fetch;
mod health;
mod notify;
mod scheduler;
mod settings;
mod shutdown;
mod store;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tracing::error;

use checker::TargetChecker;
use fetch::Fetchers;
use scheduler::Scheduler;
use settings::AppConfig;

#[derive(Parser)]
#[command(name = "nabory_bot", about = "Watches listing pages and emails new entries")]
struct Cli {
    /// Config file (JSON, TOML or YAML by extension)
    #[arg(short, long, default_value = "config.json", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the health endpoint and check all targets forever (default)
    Run,
    /// Check every target once, save state and exit
    Check,
    /// Fetch one target and list its items without recording or notifying
    Preview {
        /// Target name as written in the config
        #[arg(short, long)]
        target: String,
    },
    /// Show stored state and configured targets
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let cfg = settings::load(&cli.config)?;

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(cfg).await,
        Commands::Check => {
            let mut scheduler = build_scheduler(&cfg)?;
            scheduler
                .store()
                .flush()
                .context("Failed to write seen items")?;
            let report = scheduler.run_pass(&shutdown::create_shutdown_token()).await;
            println!(
                "Checked {} targets: {} new items, {} errors. {} items seen in total.",
                report.targets,
                report.new_items,
                report.errors,
                scheduler.store().len()
            );
            Ok(())
        }
        Commands::Preview { target } => preview(&cfg, &target).await,
        Commands::Stats => {
            let store = store::open(&cfg.state).context("Failed to load seen items")?;
            println!("State:     {:?} {}", cfg.state.backend, cfg.state.path.display());
            if store.is_empty() {
                println!("Seen:      none yet");
            } else {
                println!("Seen:      {}", store.len());
            }
            println!("Interval:  {} min", cfg.check_interval_minutes);
            println!("Email:     {}", if cfg.email.enabled { "enabled" } else { "disabled" });
            println!("Targets:   {}", cfg.targets.len());
            for (i, t) in cfg.targets.iter().enumerate() {
                println!(
                    "{:>3} | {:<24} | {:<6} | {}",
                    i + 1,
                    truncate(&t.name, 24),
                    t.fetch_mode,
                    t.url
                );
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn build_scheduler(cfg: &AppConfig) -> anyhow::Result<Scheduler> {
    // Unreadable state is fatal: running on would re-announce everything.
    let store = store::open(&cfg.state).context("Failed to load seen items")?;
    let fetchers = Fetchers::from_config(cfg)?;
    let notifier = notify::from_config(&cfg.email).context("Failed to set up email")?;
    let checker = TargetChecker::new(fetchers, notifier, &cfg.email.subject_prefix);
    Ok(Scheduler::new(
        cfg.targets.clone(),
        checker,
        store,
        cfg.check_interval(),
    ))
}

async fn run(cfg: AppConfig) -> anyhow::Result<()> {
    let scheduler = build_scheduler(&cfg)?;
    let shutdown = shutdown::create_shutdown_token();

    let health_task = cfg.health.enabled.then(|| {
        let health_cfg = cfg.health.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = health::serve(health_cfg, token).await {
                error!("Health endpoint stopped: {:#}", e);
            }
        })
    });

    scheduler.run(shutdown.clone()).await;

    shutdown.cancel();
    if let Some(task) = health_task {
        if let Err(e) = task.await {
            error!("Health endpoint task failed: {}", e);
        }
    }
    Ok(())
}

async fn preview(cfg: &AppConfig, name: &str) -> anyhow::Result<()> {
    let target = cfg
        .targets
        .iter()
        .find(|t| t.name == name)
        .ok_or_else(|| anyhow!("No target named {:?} in config", name))?;

    let store = store::open(&cfg.state).context("Failed to load seen items")?;
    let fetchers = Fetchers::from_config(cfg)?;
    let html = fetchers
        .for_mode(target.fetch_mode)?
        .fetch(&target.url)
        .await
        .with_context(|| format!("Failed to fetch {}", target.url))?;

    let items = extract::extract(&html, &target.selector, &target.base_url);
    if items.is_empty() {
        println!("Selector {:?} matched no linked items.", target.selector);
        return Ok(());
    }

    println!("{:>3} | {:<4} | {:<48} | {}", "#", "Seen", "Title", "URL");
    println!("{}", "-".repeat(100));
    let mut unseen = 0;
    for (i, item) in items.iter().enumerate() {
        let seen = store.contains(&item.id);
        if !seen {
            unseen += 1;
        }
        println!(
            "{:>3} | {:<4} | {:<48} | {}",
            i + 1,
            if seen { "yes" } else { "-" },
            truncate(&item.title, 48),
            item.url
        );
    }

    println!("\n{} items, {} not seen yet", items.len(), unseen);
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
