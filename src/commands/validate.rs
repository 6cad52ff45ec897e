use anyhow::Result;
use owo_colors::OwoColorize;
use std::path::Path;

use crate::config::resolve::resolve_config;
use crate::config::LoadedConfig;

pub fn run(config_file: Option<&Path>) -> Result<()> {
    let config_path = resolve_config(config_file)?;
    let loaded = LoadedConfig::load(&config_path)?;

    let filename = config_path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| crate::config::CONFIG_FILENAME.to_string());

    match loaded.validate() {
        Ok(()) => {
            println!(
                "  {} {} is valid ({} instances, {} chat providers, {} channels)",
                "\u{2713}".green(),
                filename,
                loaded.config.instances.len(),
                loaded.config.chat.providers.len(),
                loaded.config.chat.channels.len(),
            );
            Ok(())
        }
        Err(errors) => {
            for err in errors {
                let report: miette::Report = err.into();
                eprintln!("{:?}", report);
            }
            std::process::exit(1);
        }
    }
}
