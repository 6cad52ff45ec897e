use anyhow::Result;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table};
use is_terminal::IsTerminal;
use owo_colors::OwoColorize;
use std::path::Path;

use crate::config::resolve::resolve_config;
use crate::config::LoadedConfig;
use crate::jobs::{FileJobStore, Job, JobStatus, JobStore};

/// Reads the job store directly; works whether or not `warden run` is up.
pub fn run(config_file: Option<&Path>, instance: Option<&str>) -> Result<()> {
    let config_path = resolve_config(config_file)?;
    let loaded = LoadedConfig::load(&config_path)?;
    let store = FileJobStore::new(&loaded.state_dir());

    let mut jobs: Vec<Job> = store
        .load_jobs()?
        .into_iter()
        .filter(|j| instance.map_or(true, |id| j.instance_id == id))
        .collect();
    jobs.sort_by_key(|j| j.id);

    if jobs.is_empty() {
        println!("  No jobs found.");
        return Ok(());
    }
    for line in render_table(&jobs, std::io::stdout().is_terminal()).lines() {
        println!("  {}", line);
    }
    Ok(())
}

fn render_table(jobs: &[Job], use_color: bool) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("ID").set_alignment(CellAlignment::Right),
        Cell::new("Instance").set_alignment(CellAlignment::Left),
        Cell::new("Kind").set_alignment(CellAlignment::Left),
        Cell::new("Status").set_alignment(CellAlignment::Center),
        Cell::new("Progress").set_alignment(CellAlignment::Right),
        Cell::new("Started").set_alignment(CellAlignment::Left),
        Cell::new("Error").set_alignment(CellAlignment::Left),
    ]);

    for job in jobs {
        let progress = job
            .progress_percent
            .map(|p| format!("{}%", p))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(job.id),
            Cell::new(&job.instance_id),
            Cell::new(&job.kind),
            Cell::new(status_text(job.status, use_color)),
            Cell::new(&progress),
            Cell::new(job.started_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(job.error_message.as_deref().unwrap_or("")),
        ]);
    }
    table.to_string()
}

fn status_text(status: JobStatus, use_color: bool) -> String {
    if !use_color {
        return status.to_string();
    }
    match status {
        JobStatus::Succeeded => status.green().to_string(),
        JobStatus::Failed => status.red().to_string(),
        JobStatus::Cancelled | JobStatus::Cancelling => status.yellow().to_string(),
        JobStatus::Queued | JobStatus::Running => status.cyan().to_string(),
    }
}
