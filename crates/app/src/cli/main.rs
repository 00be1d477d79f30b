//! Mixdown CLI Application

mod tone;

use anyhow::Context;
use clap::{Parser, Subcommand};
use mixdown_core::{AudioEnumerator, DeviceInfo, MixerConfig};
use mixdown_infra::CpalBackend;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "mixdown")]
#[command(about = "Mix many audio sources onto shared output devices", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List output devices and their capabilities
    Devices {
        /// Print the list as JSON
        #[arg(long)]
        json: bool,
    },

    /// Play sine tones from several sources mixed onto one device
    Tone(tone::ToneArgs),

    /// Print the effective configuration
    Config {
        /// Also write it to the configuration file
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "mixdown=debug,info" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    tracing::info!("Mixdown starting...");

    let config = load_config(cli.config.as_ref()).await?;

    match cli.command {
        Command::Devices { json } => list_devices(json),
        Command::Tone(args) => tone::run(Arc::new(CpalBackend::new()), config, args).await,
        Command::Config { save } => {
            print!("{}", toml::to_string_pretty(&config)?);
            if save {
                let path = match cli.config {
                    Some(path) => path,
                    None => MixerConfig::default_path()?,
                };
                config.save_to_file(&path).await?;
                println!("# saved to {}", path.display());
            }
            Ok(())
        }
    }
}

/// Explicit file, else the default file when it exists, else defaults
async fn load_config(path: Option<&PathBuf>) -> anyhow::Result<MixerConfig> {
    if let Some(path) = path {
        return MixerConfig::load_from_file(path)
            .await
            .with_context(|| format!("loading {}", path.display()));
    }

    match MixerConfig::default_path() {
        Ok(path) if path.exists() => MixerConfig::load_from_file(&path)
            .await
            .with_context(|| format!("loading {}", path.display())),
        _ => Ok(MixerConfig::default()),
    }
}

fn list_devices(json: bool) -> anyhow::Result<()> {
    let backend = CpalBackend::new();
    let devices: Vec<DeviceInfo> = if json {
        backend.output_devices()?
    } else {
        backend.log_devices()?.into_iter().filter(DeviceInfo::is_output).collect()
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    for device in &devices {
        let marker = if device.is_default_output { "*" } else { " " };
        let rates: Vec<String> = device.sample_rates.iter().map(u32::to_string).collect();
        println!(
            "{} {} ({} ch, {} hz)",
            marker,
            device.name,
            device.max_output_channels,
            rates.join("/")
        );
    }
    Ok(())
}
