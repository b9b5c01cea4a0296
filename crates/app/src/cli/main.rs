//! Patchbay CLI Application

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use patchbay_core::domain::{
    Action, AudioRouter, Command, CommandResult, ConfigManager, GroupId, PatchbayConfig,
    PlaybackMode, TrackId,
};
use patchbay_infra::audio::{
    default_output_config, list_devices, CpalCapture, CpalOutput, DeviceConfig, SoftwareContext,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "patchbay")]
#[command(about = "Per-channel audio routing graphs", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List audio devices
    Devices {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Build a routing graph on a silent input and print its topology
    Inspect {
        /// Play through a playback element instead of the node graph
        #[arg(long)]
        element: bool,
    },

    /// Route the default input to the default output, controlled from stdin
    Monitor {
        /// Play through a playback element instead of the node graph
        #[arg(long)]
        element: bool,

        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the configuration file location
    Path,
}

fn mode(element: bool) -> PlaybackMode {
    if element {
        PlaybackMode::Element
    } else {
        PlaybackMode::Graph
    }
}

fn config_manager() -> anyhow::Result<ConfigManager> {
    Ok(ConfigManager::new(ConfigManager::default_config_dir()?))
}

/// `--config` when given, the managed file otherwise
fn config_file(path: Option<&Path>) -> anyhow::Result<PathBuf> {
    match path {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(config_manager()?.config_path().to_path_buf()),
    }
}

async fn load_config(path: Option<&Path>) -> anyhow::Result<PatchbayConfig> {
    match path {
        // an explicit file must be valid
        Some(path) => PatchbayConfig::load_from_file(path)
            .await
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(config_manager()?.load().await),
    }
}

fn init_tracing(verbose: bool, default_filter: &str) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
    };

    // stdout carries command results
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn devices(json: bool) -> anyhow::Result<()> {
    let devices = list_devices()?;
    if json {
        return print_json(&devices);
    }
    for device in devices {
        let layout = |config: Option<DeviceConfig>| {
            config
                .map(|c| format!("{}ch @ {}Hz", c.channels, c.sample_rate))
                .unwrap_or_else(|| "-".to_string())
        };
        println!(
            "{:<8} {}  (in: {}, out: {})",
            device.direction,
            device.name,
            layout(device.default_input),
            layout(device.default_output)
        );
    }
    Ok(())
}

async fn config_command(action: ConfigAction, path: Option<&Path>) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(path).await?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::Init { force } => {
            let target = config_file(path)?;
            if target.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    target.display()
                );
            }
            PatchbayConfig::default().save_to_file(&target).await?;
            println!("{}", target.display());
        }
        ConfigAction::Path => {
            println!("{}", config_file(path)?.display());
        }
    }
    Ok(())
}

fn ids(config: &PatchbayConfig) -> (GroupId, TrackId) {
    (
        GroupId::new(config.app.group.clone()),
        TrackId::new(config.app.track.clone()),
    )
}

fn inspect(config: &PatchbayConfig, element: bool) -> anyhow::Result<()> {
    let router_config = config.router_config()?;
    let context = Arc::new(SoftwareContext::new(
        config.app.sample_rate,
        router_config.output.channels,
    ));
    let mut router = AudioRouter::with_config(context.clone(), router_config);

    let (group, track) = ids(config);
    let input = context.create_input_stream(router_config.input.channels)?;
    router
        .add_instance(group.clone(), track.clone(), mode(element))
        .attach_stream(input)?;

    let status = router.instance_status(&group, &track);
    let report = serde_json::json!({
        "status": status,
        "nodes": router.instance(&group, &track).and_then(|g| g.nodes()),
        "edges": context.edges(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn monitor(
    config: &PatchbayConfig,
    element: bool,
    seconds: Option<u64>,
) -> anyhow::Result<()> {
    let router_config = config.router_config()?;
    let output = default_output_config().context("probing the default output device")?;
    let context = Arc::new(SoftwareContext::new(output.sample_rate, output.channels));

    let capture = CpalCapture::open_default(&context).context("opening the default input")?;
    if capture.media().channels != router_config.input.channels {
        warn!(
            captured = capture.media().channels,
            configured = router_config.input.channels,
            "Capture channel count differs from the configured input layout"
        );
    }

    let mut router = AudioRouter::with_config(context.clone(), router_config);
    let (group, track) = ids(config);

    let added = router.execute(Command::AddInstance {
        group: group.clone(),
        track: track.clone(),
        mode: mode(element),
    });
    debug!(?added, "Instance registered");

    if let Some(graph) = router.instance_mut(&group, &track) {
        graph.attach_stream(capture.media())?;
    }
    print_json(&router.execute(Command::control(
        group.clone(),
        track.clone(),
        Action::Play { channel: None },
    )))?;

    let _output = CpalOutput::start(context.clone()).context("opening the default output")?;
    info!("Monitoring; type play/stop/mute/unmute [ch], gain <v> [ch], status or quit");

    let deadline = async {
        match seconds {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = &mut deadline => {
                info!("Monitor time elapsed");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let line = line.trim();
                match line {
                    "" => continue,
                    "quit" | "exit" => break,
                    "status" => print_json(&router.status())?,
                    _ => {
                        let result = match line.parse::<Action>() {
                            Ok(action) => router.execute(Command::control(
                                group.clone(),
                                track.clone(),
                                action,
                            )),
                            Err(e) => CommandResult::Error {
                                message: e.to_string(),
                            },
                        };
                        print_json(&result)?;
                    }
                }
            }
        }
    }

    router.remove_instance(&group, &track)?;
    info!("Monitor stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    // the log filter lives in the config, so load it before tracing is up
    let config = match &cli.command {
        Some(Commands::Inspect { .. }) | Some(Commands::Monitor { .. }) => {
            Some(load_config(config_path).await?)
        }
        _ => None,
    };
    let filter = config
        .as_ref()
        .map(|c| c.app.log_filter.clone())
        .unwrap_or_else(|| "info".to_string());
    init_tracing(cli.verbose, &filter);

    tracing::info!("🎛️ Patchbay starting...");

    match (cli.command, config) {
        (Some(Commands::Devices { json }), _) => devices(json),
        (Some(Commands::Config { action }), _) => config_command(action, config_path).await,
        (Some(Commands::Inspect { element }), Some(config)) => inspect(&config, element),
        (Some(Commands::Monitor { element, seconds }), Some(config)) => {
            monitor(&config, element, seconds).await
        }
        (None, _) => devices(false),
        _ => Ok(()),
    }
}
