//! `routeqa config`: Configuration management commands.

use std::path::Path;

use routeqa_config::AppConfig;

use super::runtime::{CliResult, config_file, load_config};

pub fn init(config_path: Option<&Path>, force: bool) -> CliResult<()> {
    let path = config_file(config_path);
    if path.exists() && !force {
        println!("  Config already exists: {}", path.display());
        println!("  Use --force to overwrite it.");
        return Ok(());
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(&path, AppConfig::default_toml())?;
    println!("  ✅ Wrote default configuration to {}", path.display());
    println!();
    println!("  Next steps:");
    println!("    1. Set GOOGLE_API_KEY (or api_key in the file)");
    println!("    2. Point [database] at the sales database");
    println!("    3. Build the corpora with `routeqa index --kind product --input <dir>`");
    Ok(())
}

pub fn show(config_path: Option<&Path>) -> CliResult<()> {
    let config = load_config(config_path)?;
    println!("{}", toml::to_string_pretty(&config.redacted())?);
    Ok(())
}

pub fn path(config_path: Option<&Path>) {
    println!("{}", config_file(config_path).display());
}
