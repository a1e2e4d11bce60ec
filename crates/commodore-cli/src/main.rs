use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use commodore::Reporter;
use commodore::compile::{CompileOptions, CompileSummary, compile};
use commodore::config::Config;
use commodore::diff::Migration;
use commodore::workdir::Workdir;

#[derive(Parser, Debug)]
#[command(name = "commodore", version)]
#[command(about = "Tenant-aware catalog compiler for GitOps-managed Kubernetes fleets")]
struct Cli {
    /// Working directory (inventory, dependencies, compiled output,
    /// catalog checkout).
    #[arg(long, default_value = ".")]
    working_dir: PathBuf,

    /// Lieutenant API base URL (overrides COMMODORE_API_URL and
    /// .commodore.toml).
    #[arg(long)]
    api_url: Option<String>,

    /// Lieutenant bearer token (overrides COMMODORE_API_TOKEN).
    #[arg(long)]
    api_token: Option<String>,

    /// Request timeout for Lieutenant calls (e.g. 5s, 750ms).
    #[arg(long)]
    api_timeout: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Work with cluster catalogs.
    #[command(subcommand)]
    Catalog(CatalogCommands),
}

#[derive(Subcommand, Debug)]
enum CatalogCommands {
    /// Compile the catalog for one cluster.
    Compile {
        /// Cluster id as known to Lieutenant.
        cluster_id: String,

        /// Push the catalog after a successful compile.
        #[arg(long)]
        push: bool,

        /// Show the catalog diff and ask before pushing.
        #[arg(short, long)]
        interactive: bool,

        /// Discard local modifications in dependency worktrees and the
        /// catalog checkout.
        #[arg(long)]
        force: bool,

        /// Bound on concurrent dependency fetches (default: CPU count).
        #[arg(long)]
        parallelism: Option<usize>,

        /// Hide migration noise in the diff (`ignore-yaml-formatting` or
        /// `kapitan-0.29-to-0.30`).
        #[arg(long, value_parser = parse_migration)]
        migration: Option<Migration>,

        /// Compile against this revision of the global defaults
        /// repository. Refuses to combine with --push.
        #[arg(long)]
        global_revision_override: Option<String>,

        /// Compile against this revision of the tenant repository.
        /// Refuses to combine with --push.
        #[arg(long)]
        tenant_revision_override: Option<String>,
    },
    /// Remove all local compile state from the working directory.
    Clean,
    /// List clusters known to Lieutenant.
    List,
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = Config::load(&cli.working_dir)?;
    if let Some(api_url) = cli.api_url.clone() {
        cfg.api_url = Some(api_url);
    }
    if let Some(api_token) = cli.api_token.clone() {
        cfg.api_token = Some(api_token);
    }
    if let Some(timeout) = cli.api_timeout.as_deref() {
        cfg.api_timeout =
            humantime::parse_duration(timeout).with_context(|| format!("invalid duration: {timeout}"))?;
    }

    let workdir = Workdir::new(&cli.working_dir);
    let mut reporter = CliReporter;

    match cli.cmd {
        Commands::Catalog(CatalogCommands::Compile {
            cluster_id,
            push,
            interactive,
            force,
            parallelism,
            migration,
            global_revision_override,
            tenant_revision_override,
        }) => {
            let opts = CompileOptions {
                push,
                interactive,
                force,
                parallelism,
                migration,
                global_revision_override,
                tenant_revision_override,
            };
            let summary = compile(&workdir, &cfg, &opts, &cluster_id, &mut reporter)?;
            print_summary(&summary);
        }
        Commands::Catalog(CatalogCommands::Clean) => {
            workdir.clean()?;
            eprintln!("[info] working directory cleaned");
        }
        Commands::Catalog(CatalogCommands::List) => {
            run_list(&cfg)?;
        }
    }

    Ok(())
}

fn parse_migration(s: &str) -> Result<Migration, String> {
    s.parse()
}

fn print_summary(summary: &CompileSummary) {
    println!("cluster: {}", summary.cluster_id);
    println!("targets:");
    for target in &summary.targets {
        println!("  - {target}");
    }
    if summary.material_change {
        if !summary.diff.is_empty() {
            println!("{}", summary.diff);
        }
        println!(
            "catalog: {}{}",
            if summary.committed { "committed" } else { "commit skipped" },
            if summary.pushed { ", pushed" } else { "" }
        );
    } else {
        println!("catalog: unchanged");
    }
    for warning in &summary.warnings {
        eprintln!("[warn] {warning}");
    }
}

fn run_list(cfg: &Config) -> Result<()> {
    let api_url = cfg
        .api_url
        .as_deref()
        .context("no Lieutenant API URL configured (COMMODORE_API_URL)")?;
    let api = commodore::api::ApiClient::new(api_url, cfg.api_token.clone(), cfg.api_timeout)?;
    let mut clusters = api.clusters()?;
    clusters.sort_by(|a, b| a.id.cmp(&b.id));
    for cluster in clusters {
        println!(
            "{}\t{}\t{}",
            cluster.id,
            cluster.tenant,
            cluster.display_name.unwrap_or_default()
        );
    }
    Ok(())
}
