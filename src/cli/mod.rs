//! CLI layer: argument parsing, command dispatch, and subcommand implementations.

pub mod args;

pub use args::*;

use std::sync::{Arc, RwLock};

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use contrib_ledger::config::{self, Settings};
use contrib_ledger::git::{LocalGitSource, is_git_checkout};
use contrib_ledger::github::GitHubSource;
use contrib_ledger::identity::IdentitySet;
use contrib_ledger::ledger::{FsBackend, LedgerStore};
use contrib_ledger::pipeline::{Pipeline, RunControl, RunSummary};
use contrib_ledger::{RepoTarget, StatsError, Totals, readme};

// ─── CLI ─────────────────────────────────────────────────────────────

/// Incremental ledger of lines added, lines deleted and images contributed across repositories
#[derive(Parser, Debug)]
#[command(name = "contrib-ledger", version, about, after_help = "\
Run 'contrib-ledger <COMMAND> --help' for detailed options.\n\
Environment: USERNAME (login), GH_TOKEN / GITHUB_TOKEN (token), CONTRIB_LEDGER_CACHE (cache dir)")]
pub(crate) struct Cli {
    /// Log level: error, warn, info, debug, trace (RUST_LOG overrides)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Update every repository's ledger and print the totals
    Run(RunArgs),

    /// Show store metadata and per-repository ledgers
    Info(InfoArgs),

    /// Remove every cached ledger (the identity set is kept)
    ClearCache(ClearCacheArgs),
}

// ─── Main entry point ───────────────────────────────────────────────

pub fn run() {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_json);

    let result = match cli.command {
        Commands::Run(args) => cmd_run(args),
        Commands::Info(args) => cmd_info(args),
        Commands::ClearCache(args) => cmd_clear_cache(args),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Install the stderr subscriber. `RUST_LOG` wins over `--log-level`.
fn init_logging(level: &str, json: bool) {
    let level = match level {
        "error" | "warn" | "debug" | "trace" => level,
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn store_for(cache_dir: Option<std::path::PathBuf>) -> (Settings, LedgerStore<FsBackend>) {
    let settings = Settings {
        cache_dir: cache_dir.unwrap_or_else(config::default_cache_dir),
        ..Settings::default()
    };
    let store = LedgerStore::new(FsBackend::new(settings.ledger_dir()));
    (settings, store)
}

// ─── run ────────────────────────────────────────────────────────────

fn cmd_run(args: RunArgs) -> Result<(), StatsError> {
    let json = args.json;
    let settings = args.into_settings()?;

    let mut identities = IdentitySet::load(&settings.identity_file()).unwrap_or_else(|e| {
        warn!(error = %e, "Identity set unreadable, starting empty");
        IdentitySet::new()
    });
    identities.extend(settings.identities.iter().cloned());
    let identities = Arc::new(RwLock::new(identities));

    let store = LedgerStore::new(FsBackend::new(settings.ledger_dir()));
    let local = LocalGitSource::new(Arc::clone(&identities));
    let remote = GitHubSource::new(&settings)?;

    let keys = if settings.repositories.is_empty() {
        remote.list_repositories()?
    } else {
        settings.repositories.clone()
    };
    let targets: Vec<RepoTarget> = keys
        .into_iter()
        .map(|key| {
            let checkout = settings.checkout_for(&key).filter(|p| is_git_checkout(p));
            RepoTarget { key, checkout }
        })
        .collect();

    if targets.is_empty() {
        eprintln!("No repositories to process.");
        return Ok(());
    }

    eprintln!(
        "Processing {} repositories with {} worker(s), cache at {}",
        targets.len(),
        settings.jobs.min(targets.len()),
        settings.cache_dir.display()
    );

    let control = Arc::new(RunControl::new(settings.deadline));
    {
        let control = Arc::clone(&control);
        if let Err(e) = ctrlc::set_handler(move || {
            eprintln!("Interrupt received, finishing repositories in progress...");
            control.stop();
        }) {
            warn!(error = %e, "Could not install Ctrl-C handler");
        }
    }

    let pipeline = Pipeline::new(&store, &local, &remote, &identities).with_batch_size(settings.batch_size);
    let summary = pipeline.run(&targets, settings.jobs, &control);

    let snapshot = identities.read().unwrap_or_else(|e| e.into_inner()).clone();
    if let Err(e) = snapshot.save(&settings.identity_file()) {
        warn!(error = %e, "Failed to save identity set");
    }

    if let Some(path) = &settings.readme {
        match readme::update(path, &summary.totals) {
            Ok(n) => info!(path = %path.display(), replaced = n, "README stats refreshed"),
            Err(e) => eprintln!("Warning: README {} not updated: {}", path.display(), e),
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn format_totals(totals: &Totals) -> String {
    format!("+{} -{} images:{}", totals.additions, totals.deletions, totals.images)
}

fn print_summary(summary: &RunSummary) {
    eprintln!();
    for r in &summary.repositories {
        let state = match r.state {
            Some(s) => format!("{:?}", s),
            None => "skipped".to_string(),
        };
        eprintln!(
            "  {:<40} {:<14} {:>5} records  hits {:>4} / misses {:>4} ({:.1}%)  {}{}",
            r.repository,
            state,
            r.records,
            r.hits,
            r.misses,
            r.hit_rate(),
            format_totals(&r.totals),
            if r.persisted { "" } else { "  [NOT SAVED]" }
        );
        if let Some(d) = &r.degraded {
            eprintln!("      ~ {}", d);
        }
        for e in &r.errors {
            eprintln!("      ! {}", e);
        }
    }
    if summary.interrupted() {
        eprintln!();
        eprintln!("Stopped early; not started: {}", summary.not_started.join(", "));
    }
    eprintln!();
    eprintln!(
        "Total: {} across {} repositories in {:.1}s ({} with errors)",
        format_totals(&summary.totals),
        summary.repositories.len(),
        summary.elapsed_secs,
        summary.with_errors()
    );
}

// ─── info ───────────────────────────────────────────────────────────

fn cmd_info(args: InfoArgs) -> Result<(), StatsError> {
    let (settings, store) = store_for(args.cache_dir);
    let metadata = store.metadata()?;
    let repositories = store.repositories()?;

    if args.json {
        let repos: Vec<serde_json::Value> = repositories
            .iter()
            .map(|(key, ledger)| match ledger {
                Ok(l) => serde_json::json!({ "repository": key, "records": l.len(), "totals": Totals::of(l) }),
                Err(e) => serde_json::json!({ "repository": key, "error": e.to_string() }),
            })
            .collect();
        let out = serde_json::json!({
            "cache_dir": settings.cache_dir,
            "metadata": metadata,
            "repositories": repos,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    eprintln!("Cache directory: {}", settings.cache_dir.display());
    match &metadata {
        Some(m) => eprintln!(
            "Last updated {}: {} records in {} repositories",
            m.last_updated, m.total_commits, m.repositories
        ),
        None => {
            eprintln!("No ledgers found. Use 'contrib-ledger run' to create them.");
            return Ok(());
        }
    }
    eprintln!();

    let mut grand = Totals::default();
    for (key, ledger) in &repositories {
        match ledger {
            Ok(l) => {
                let totals = Totals::of(l);
                grand += totals;
                println!("  {:<40} {:>5} records  {}", key, l.len(), format_totals(&totals));
            }
            Err(e) => eprintln!("  Warning: {}: {}", key, e),
        }
    }
    eprintln!();
    eprintln!("Total: {}", format_totals(&grand));
    Ok(())
}

// ─── clear-cache ────────────────────────────────────────────────────

fn cmd_clear_cache(args: ClearCacheArgs) -> Result<(), StatsError> {
    let (settings, store) = store_for(args.cache_dir);
    let removed = store.clear()?;
    if removed == 0 {
        eprintln!("Cache is empty: {}", settings.ledger_dir().display());
    } else {
        eprintln!("Removed {} cache file(s) from {}", removed, settings.ledger_dir().display());
    }
    Ok(())
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
#[path = "cli_tests.rs"]
mod tests;
