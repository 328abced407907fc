#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(unix))]
compile_error!("Only unix-like platforms are currently supported");

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "cadence", about = "High-throughput email campaign delivery pipeline")]
struct Args {
    /// Path to the configuration file. Overrides the search below.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => find_config_file()?,
    };
    let config_content = std::fs::read_to_string(&config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to read config from {}: {}",
            config_path.display(),
            e
        )
    })?;
    let cadence: cadence::Cadence = ron::from_str(&config_content)?;

    cadence.run().await
}

/// Find the configuration file using the following precedence:
/// 1. `CADENCE_CONFIG` environment variable
/// 2. ./cadence.config.ron (current working directory)
/// 3. /etc/cadence/cadence.config.ron (system-wide config)
fn find_config_file() -> anyhow::Result<PathBuf> {
    if let Ok(env_path) = std::env::var("CADENCE_CONFIG") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "CADENCE_CONFIG points to non-existent file: {}",
            path.display()
        );
    }

    let default_paths = vec![
        PathBuf::from("./cadence.config.ron"),
        PathBuf::from("/etc/cadence/cadence.config.ron"),
    ];

    for path in &default_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - CADENCE_CONFIG environment variable\n{paths_tried}"
    )
}
