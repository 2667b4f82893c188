//! layerfs - inspect a layered (union) filesystem from the command line
//!
//! Usage:
//!   layerfs layers                 - Show the layer stack
//!   layerfs ls [path]              - List a merged directory
//!   layerfs cat <path>             - Print a file from the merged view
//!   layerfs which <path>           - Show which layer provides a path
//!   layerfs versions <path>        - Show every physical copy of a path
//!   layerfs diff                   - Show changes in the writable layer
//!   layerfs tree [path]            - Print the merged tree

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use layerfs::{
    config::{Config, LayerConfig},
    fs::overlay::TreeNode,
    LayeredFs,
};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "layerfs")]
#[command(author = "layerfs Contributors")]
#[command(version)]
#[command(about = "Layered (union) filesystem over plain directory trees")]
struct Cli {
    /// Configuration file path (JSON or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Read-only layer, repeatable; the first one given is the highest
    #[arg(short, long = "lower", value_name = "DIR")]
    lower: Vec<PathBuf>,

    /// Writable layer
    #[arg(short = 'w', long = "upper", value_name = "DIR")]
    upper: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the layer stack, top first
    Layers,

    /// List a merged directory
    Ls {
        /// Directory in the merged view
        #[arg(default_value = "/")]
        path: PathBuf,
    },

    /// Print a file from the merged view
    Cat {
        path: PathBuf,
    },

    /// Show which layer provides a path
    Which {
        path: PathBuf,
    },

    /// Show every physical copy of a path
    Versions {
        path: PathBuf,
    },

    /// Show changes recorded in the writable layer
    Diff,

    /// Print the merged tree
    Tree {
        #[arg(default_value = "/")]
        path: PathBuf,

        /// Maximum depth
        #[arg(short, long)]
        depth: Option<usize>,
    },
}

#[derive(Serialize)]
struct LayerInfo {
    label: String,
    root: PathBuf,
    writable: bool,
    active: bool,
}

fn main() {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    let fs = LayeredFs::from_config(&config).context("failed to assemble layer stack")?;
    debug!(layers = fs.layers().len(), "Layer stack ready");

    match cli.command {
        Commands::Layers => cmd_layers(&fs, cli.json),
        Commands::Ls { path } => cmd_ls(&fs, &path, cli.json),
        Commands::Cat { path } => cmd_cat(&fs, &path),
        Commands::Which { path } => cmd_which(&fs, &path, cli.json),
        Commands::Versions { path } => cmd_versions(&fs, &path, cli.json),
        Commands::Diff => cmd_diff(&fs, cli.json),
        Commands::Tree { path, depth } => cmd_tree(&fs, &path, depth, cli.json),
    }
}

/// Layers given on the command line replace the configured stack
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(expand_tilde(path))
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => {
            let default = Config::default_path();
            if default.exists() && cli.lower.is_empty() && cli.upper.is_none() {
                Config::load(&default)?
            } else {
                Config::default()
            }
        }
    };

    if !cli.lower.is_empty() || cli.upper.is_some() {
        config.layers = cli
            .lower
            .iter()
            .map(|p| LayerConfig::readonly(expand_tilde(p)))
            .collect();
        if let Some(upper) = &cli.upper {
            config.layers.push(LayerConfig::writable(expand_tilde(upper)));
        }
    }

    config.apply_env_overrides();
    if config.layers.is_empty() {
        bail!("no layers configured (use --config, --lower or --upper)");
    }
    Ok(config)
}

fn cmd_layers(fs: &LayeredFs, json: bool) -> anyhow::Result<()> {
    let active = fs.writable_layer();
    let layers: Vec<LayerInfo> = fs
        .layers()
        .iter()
        .map(|l| LayerInfo {
            label: l.label().to_string(),
            root: l.root().to_path_buf(),
            writable: l.is_writable(),
            active: active.as_ref().map_or(false, |a| a.label() == l.label()),
        })
        .collect();

    if json {
        return print_json(&layers);
    }
    for (depth, layer) in layers.iter().enumerate() {
        let mode = match (layer.writable, layer.active) {
            (true, true) => "rw*",
            (true, false) => "rw",
            _ => "ro",
        };
        println!("{:>2} {:<4} {:<16} {}", depth, mode, layer.label, layer.root.display());
    }
    Ok(())
}

fn cmd_ls(fs: &LayeredFs, path: &Path, json: bool) -> anyhow::Result<()> {
    let entries = fs.entries(path)?;
    if json {
        return print_json(&entries);
    }
    for entry in entries {
        let suffix = if entry.is_dir() { "/" } else { "" };
        println!("{:<10} {:<16} {}{}", entry.kind, entry.layer, entry.name, suffix);
    }
    Ok(())
}

fn cmd_cat(fs: &LayeredFs, path: &Path) -> anyhow::Result<()> {
    let data = fs.read_binary(path)?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&data)?;
    stdout.flush()?;
    Ok(())
}

fn cmd_which(fs: &LayeredFs, path: &Path, json: bool) -> anyhow::Result<()> {
    let resolved = match fs.resolve(path)? {
        Some(resolved) => resolved,
        None => bail!("{}: not found in the merged view", path.display()),
    };
    if json {
        return print_json(&serde_json::json!({
            "layer": resolved.label(),
            "path": resolved.path,
        }));
    }
    println!("{}\t{}", resolved.label(), resolved.path.display());
    Ok(())
}

fn cmd_versions(fs: &LayeredFs, path: &Path, json: bool) -> anyhow::Result<()> {
    let versions = fs.all_versions(path)?;
    if json {
        return print_json(&versions);
    }
    if versions.is_empty() {
        println!("{}: no layer holds this path", path.display());
    }
    for v in versions {
        println!(
            "{:<16} {:<3} {:<10} {:>10} {}",
            v.layer,
            if v.writable { "rw" } else { "ro" },
            v.kind,
            v.size,
            v.path.display()
        );
    }
    Ok(())
}

fn cmd_diff(fs: &LayeredFs, json: bool) -> anyhow::Result<()> {
    let changes = fs.diff()?;
    if json {
        return print_json(&changes);
    }
    for change in changes {
        let marker = match change.change {
            layerfs::ChangeKind::Added => "A",
            layerfs::ChangeKind::Modified => "M",
            layerfs::ChangeKind::Deleted => "D",
            layerfs::ChangeKind::Opaque => "O",
        };
        println!("{} /{}", marker, change.path.display());
    }
    Ok(())
}

fn cmd_tree(fs: &LayeredFs, path: &Path, depth: Option<usize>, json: bool) -> anyhow::Result<()> {
    let tree = fs.tree(path, depth)?;
    if json {
        return print_json(&tree);
    }
    println!("{}", path.display());
    print_tree(&tree, "");
    Ok(())
}

fn print_tree(node: &TreeNode, prefix: &str) {
    let count = node.children.len();
    for (i, child) in node.children.iter().enumerate() {
        let last = i + 1 == count;
        let branch = if last { "`-- " } else { "|-- " };
        let layer = child.layer.as_deref().unwrap_or("?");
        println!("{}{}{} [{}]", prefix, branch, child.name, layer);
        let next = format!("{}{}", prefix, if last { "    " } else { "|   " });
        print_tree(child, &next);
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
