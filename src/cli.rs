use clap::{Args, Parser, Subcommand};
use clap_complete::aot::Shell;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "warden", version, about = "Game server instance supervisor")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Use a specific config file
    #[arg(short = 'f', long = "file", global = true)]
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Supervise all configured instances until interrupted
    Run,
    /// Validate the configuration file
    Validate,
    /// List persisted jobs
    Jobs {
        /// Only show jobs of this instance
        #[arg(short, long)]
        instance: Option<String>,
    },
    /// Send a raw topic query to a running session
    Topic {
        /// Session port
        #[arg(short, long)]
        port: u16,
        /// Session host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// How long to wait for the reply
        #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
        timeout: Duration,
        /// Query parameters as key=value
        #[arg(value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, _)) if key.is_empty() => Err(format!("'{}' has an empty key", s)),
        Some((key, value)) => Ok((key.to_string(), value.to_string())),
        None => Ok((s.to_string(), String::new())),
    }
}
