//! `branchline init` — scaffold `.branchline/branchline.toml` and the
//! `.pipeline/` state directory, generalizing `cmd/project.rs::cmd_init`'s
//! "write defaults, print the created layout, stay idempotent" shape.

use std::path::PathBuf;

use anyhow::Result;

use crate::config::{Config, CONFIG_RELATIVE_PATH};

pub async fn cmd_init(project_dir: PathBuf) -> Result<()> {
    let config_path = project_dir.join(CONFIG_RELATIVE_PATH);
    let already_initialized = config_path.exists();

    if let Some(parent) = config_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if !already_initialized {
        let toml = toml::to_string_pretty(&Config::default())?;
        tokio::fs::write(&config_path, toml).await?;
    }

    let state_dir = project_dir.join(".pipeline");
    tokio::fs::create_dir_all(&state_dir).await?;

    if already_initialized {
        println!("branchline already initialized at {}", config_path.display());
    } else {
        println!("Initialized branchline project at {}", config_path.parent().unwrap().display());
        println!();
        println!("Created directory structure:");
        println!("  .branchline/");
        println!("  └── branchline.toml   # tiers, agents, resilience, director, adapters");
        println!("  .pipeline/");
        println!("  └── manifest.json     # created on first ready pipeline");
        println!();
        println!("Next steps:");
        println!("  1. Edit .branchline/branchline.toml (agent models, webhook adapters, tier bands)");
        println!("  2. Run `branchline run` to submit a pipeline request");
        println!("  3. Run `branchline director` (and `branchline serve` for the webhook adapter) as a daemon");
    }

    Ok(())
}
