//! Thin CLI front-end for [`conda_link`]: parses arguments, sets up logging, probes the default
//! link type once, and sequences `link` over the selected distributions.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use conda_link::{Config, Dist, Engine, LinkMethod};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Links one or more distributions from the package cache into a target environment prefix.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Opt {
    /// File listing distributions to link, one per line (`#` comments stripped). Defaults to
    /// every distribution with an extracted directory in the cache.
    #[clap(long = "file", value_name = "PATH")]
    file: Option<PathBuf>,

    /// Target environment prefix. Defaults to the engine's own install prefix.
    #[clap(long = "prefix", value_name = "PATH")]
    prefix: Option<PathBuf>,

    /// One or more package-cache directories to scan.
    #[clap(long = "pkgs-dir", value_name = "PATH", required = true)]
    pkgs_dirs: Vec<PathBuf>,

    /// Log probe choice and per-distribution actions.
    #[clap(short, long)]
    verbose: bool,
}

fn main() {
    let opt = Opt::parse();
    init_tracing(opt.verbose);

    if let Err(err) = run(opt) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_filter.into())
        .from_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .without_time()
        .init();
}

fn run(opt: Opt) -> anyhow::Result<()> {
    let prefix = opt
        .prefix
        .clone()
        .unwrap_or_else(|| opt.pkgs_dirs[0].clone());
    let config = Config::new(prefix.clone(), opt.pkgs_dirs.clone());
    let mut engine = Engine::new(config);

    let dists = selected_distributions(&opt, &mut engine)?;
    if dists.is_empty() {
        tracing::info!("nothing to link");
        return Ok(());
    }

    let first_tail = dists[0].tail().to_string();
    let linktype = engine.probe_link_type(&opt.pkgs_dirs[0], &first_tail, &prefix);
    tracing::info!(%linktype, "probed default link type");

    for dist in &dists {
        tracing::info!(dist = %dist, "linking");
        engine
            .link(&prefix, dist, linktype, None)
            .with_context(|| format!("failed to link {dist}"))?;
    }

    Ok(())
}

fn selected_distributions(opt: &Opt, engine: &mut Engine) -> anyhow::Result<Vec<Dist>> {
    match &opt.file {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            contents
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(|l| Dist::parse(l).with_context(|| format!("invalid distribution key: {l}")))
                .collect()
        }
        None => Ok(engine
            .extracted_distributions()
            .into_iter()
            .filter_map(|k| Dist::parse(&k).ok())
            .collect()),
    }
}
