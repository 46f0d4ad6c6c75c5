use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use settings_store::SettingsStore;
use tracing_subscriber::EnvFilter;

/// Print every section of a settings file
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Settings file to load
    #[arg(default_value = settings_store::DEFAULT_FILE_NAME)]
    path: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut settings = SettingsStore::new(&args.path);
    if let Err(err) = settings.load() {
        eprintln!("Unable to load {}: {}", args.path.display(), err);
        return ExitCode::FAILURE;
    }

    for (section, props) in &settings {
        println!("{}", section);
        for (k, v) in props {
            println!("{} = {}", k, v);
        }
    }
    ExitCode::SUCCESS
}
