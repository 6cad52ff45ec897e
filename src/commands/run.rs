use anyhow::{bail, Result};
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table};
use is_terminal::IsTerminal;
use owo_colors::OwoColorize;
use std::path::Path;

use crate::config::resolve::resolve_config;
use crate::config::LoadedConfig;
use crate::engine::{Engine, EngineDeps};

pub async fn run(config_file: Option<&Path>) -> Result<()> {
    let config_path = resolve_config(config_file)?;
    let loaded = LoadedConfig::load(&config_path)?;
    if let Err(errors) = loaded.validate() {
        let count = errors.len();
        for err in errors {
            let report: miette::Report = err.into();
            eprintln!("{:?}", report);
        }
        bail!("{} has {} configuration error(s)", config_path.display(), count);
    }

    let deps = EngineDeps::from_config(&loaded);
    let engine = Engine::new(loaded.config, &loaded.base_dir, deps)?;
    engine.start().await;
    print_summary(&engine);

    tokio::signal::ctrl_c().await.ok();
    eprintln!("\nShutting down...");
    engine.shutdown().await;
    Ok(())
}

fn print_summary(engine: &Engine) {
    let use_color = std::io::stdout().is_terminal();
    println!();
    if use_color {
        println!(
            "  {} {}",
            "warden".bold(),
            engine.state_dir().display().dimmed()
        );
    } else {
        println!("  warden {}", engine.state_dir().display());
    }
    println!();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Instance").set_alignment(CellAlignment::Left),
        Cell::new("Port").set_alignment(CellAlignment::Right),
        Cell::new("Artifact").set_alignment(CellAlignment::Left),
        Cell::new("State").set_alignment(CellAlignment::Center),
    ]);

    for id in engine.instances() {
        let Ok(status) = engine.instance_status(&id) else {
            continue;
        };
        let port = status
            .active
            .as_ref()
            .map(|s| s.port.to_string())
            .unwrap_or_else(|| "-".to_string());
        let artifact = status
            .artifact
            .as_ref()
            .map(|a| a.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        let state = if !use_color {
            status.state.to_string()
        } else if status.state.is_running() {
            status.state.green().to_string()
        } else {
            status.state.yellow().to_string()
        };
        table.add_row(vec![
            Cell::new(&id),
            Cell::new(&port),
            Cell::new(&artifact),
            Cell::new(&state),
        ]);
    }

    for line in table.to_string().lines() {
        println!("  {}", line);
    }
    println!();
}
