use clap::{CommandFactory, Parser};
use clap_complete::aot::generate;
use warden::cli::{Cli, Commands};
use warden::commands;
use warden::logging::{self, FileLogging};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_file = cli.global.config_file.as_deref();

    let file_logging = match cli.command {
        Commands::Run => FileLogging::discover(config_file),
        _ => None,
    };
    let log_guard = match logging::init(file_logging.as_ref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Warning: file logging disabled: {:#}", e);
            logging::init(None).ok().flatten()
        }
    };

    let result = match cli.command {
        Commands::Run => commands::run::run(config_file).await,
        Commands::Validate => commands::validate::run(config_file),
        Commands::Jobs { instance } => commands::jobs::run(config_file, instance.as_deref()),
        Commands::Topic {
            port,
            host,
            timeout,
            params,
        } => commands::topic::run(&host, port, timeout, params).await,
        Commands::Completions { shell } => {
            generate(shell, &mut Cli::command(), "warden", &mut std::io::stdout());
            Ok(())
        }
    };

    if let Err(e) = result {
        drop(log_guard);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
    drop(log_guard);
}
