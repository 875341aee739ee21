//! Config command handlers.

use std::path::Path;

use anyhow::{Context, Result};
use kinship_core::config::{self, paths};

pub fn path(home: &Path) {
    println!("{}", paths::config_path_in(home).display());
}

pub fn init(home: &Path) -> Result<()> {
    let config_path = paths::config_path_in(home);
    config::Config::init(&config_path)
        .with_context(|| format!("init config at {}", config_path.display()))?;
    println!("Created config at {}", config_path.display());
    Ok(())
}
