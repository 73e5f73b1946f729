mod config;
mod decoder;
mod gain;
mod predict;
mod receiver;
mod relay;
mod scheduler;
mod web;

use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::config::{Config, Topology};
use crate::decoder::CommandDecoder;
use crate::gain::AutoGainController;
use crate::predict::{PassSource, StationLocation, TleLoader};
use crate::receiver::{LocalReceiver, ProcessDevice, Receiver};
use crate::relay::{endpoint_address, LinkMonitor, RelayClient, RelayServer};
use crate::scheduler::{CaptureScheduler, Runner, SchedulerSettings};
use crate::web::AppState;

#[derive(Parser)]
#[command(name = "sat-capture")]
#[command(about = "Automatic weather satellite capture")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the configuration and TLE folder
    Validate,
    /// Print upcoming passes
    Predict {
        /// Hours ahead (default from config)
        #[arg(long)]
        hours: Option<f64>,
        /// Minimum elevation in degrees (default from config)
        #[arg(long)]
        min_elevation: Option<f64>,
    },
    /// Run the configured topology until interrupted
    Run,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Some(c) => c,
        None => return ExitCode::FAILURE,
    };

    match cli.command {
        Commands::Validate => validate(&config),
        Commands::Predict {
            hours,
            min_elevation,
        } => predict(&config, hours, min_elevation),
        Commands::Run => run(config).await,
    }
}

fn load_config(path: &Path) -> Option<Config> {
    match Config::from_file(path) {
        Ok(c) => Some(c),
        Err(e) => {
            eprintln!("Error loading {}: {}", path.display(), e);
            None
        }
    }
}

fn pass_source(config: &Config, station: StationLocation) -> PassSource {
    PassSource {
        station,
        options: config.predict.options(),
        tle_folder: config.predict.tle_folder.clone(),
        satellites: config.satellites.clone(),
        high_quality_min_elevation: config.predict.high_quality_min_elevation,
    }
}

fn validate(config: &Config) -> ExitCode {
    let station = match config.station_location() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    println!(
        "Configuration is valid ({} topology, station {:.4}, {:.4})",
        topology_name(config.topology),
        station.latitude_deg,
        station.longitude_deg
    );

    if config.topology == Topology::SdrRelay {
        return ExitCode::SUCCESS;
    }

    let mut loader = TleLoader::new(config.predict.tle_folder.clone());
    if let Err(e) = loader.load_all() {
        eprintln!("TLE error: {}", e);
        return ExitCode::FAILURE;
    }
    let matched = loader.match_profiles(&config.satellites);
    println!(
        "  {} element sets, {} of {} enabled satellites matched",
        loader.len(),
        matched.len(),
        config.satellites.iter().filter(|s| s.enabled).count()
    );
    for (profile, _) in matched {
        let mode = if profile.event_based { "scan" } else { "pass" };
        println!(
            "  {} ({}): {} Hz {} [{}]",
            profile.name,
            profile.norad_id,
            profile.frequency_hz,
            profile.signal.as_str(),
            mode
        );
    }
    ExitCode::SUCCESS
}

fn predict(config: &Config, hours: Option<f64>, min_elevation: Option<f64>) -> ExitCode {
    let station = match config.station_location() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let mut source = pass_source(config, station);
    if let Some(hours) = hours {
        source.options.hours_ahead = hours;
    }
    if let Some(min) = min_elevation {
        source.options.min_elevation = min;
    }

    let passes = match source.predict(Utc::now()) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Prediction failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    println!("{} passes", passes.len());
    for pass in &passes {
        println!(
            "  {} - {}  {:<16} max {:5.1}° at {}  az {:3.0}° -> {:3.0}°  {}s",
            pass.aos.format("%Y-%m-%d %H:%M:%S"),
            pass.los.format("%H:%M:%S"),
            pass.satellite,
            pass.max_elevation_deg,
            pass.max_elevation_time.format("%H:%M:%S"),
            pass.aos_azimuth_deg,
            pass.los_azimuth_deg,
            pass.duration_seconds
        );
    }
    ExitCode::SUCCESS
}

async fn run(config: Config) -> ExitCode {
    let sdr = &config.sdr;
    match config.topology {
        Topology::SdrRelay => run_relay(&config).await,
        Topology::Full => {
            let device = ProcessDevice::new(sdr.capture_command.clone(), sdr.chunk_size);
            let receiver = LocalReceiver::new(device, sdr.spectrum, sdr.buffer_depth);
            run_scheduler(&config, Box::new(receiver), None).await
        }
        Topology::Server => {
            let url = config.relay.url.as_deref().unwrap_or_default();
            let address = match endpoint_address(url) {
                Ok(a) => a,
                Err(e) => {
                    eprintln!("{}", e);
                    return ExitCode::FAILURE;
                }
            };
            log::info!("Using relay at {}", address);
            let client = RelayClient::connect(address, config.relay.link.clone(), sdr.spectrum);
            let monitor = client.monitor();
            run_scheduler(&config, Box::new(client), Some(monitor)).await
        }
    }
}

async fn run_scheduler(
    config: &Config,
    receiver: Box<dyn Receiver>,
    link: Option<LinkMonitor>,
) -> ExitCode {
    let station = match config.station_location() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    log::info!(
        "Station {} at {:.4}, {:.4} ({} topology)",
        config.station.name.as_deref().unwrap_or("unnamed"),
        station.latitude_deg,
        station.longitude_deg,
        topology_name(config.topology)
    );

    let (reports_tx, reports_rx) = mpsc::unbounded_channel();
    let decoder = CommandDecoder::new(
        config.decoder.commands.clone(),
        config.decoder.output_dir.clone(),
        reports_tx,
    );
    let mut gain = AutoGainController::new(config.gain_control.limits, config.sdr.gain);
    if !config.gain_control.enabled {
        gain.disable();
    }
    let scheduler = CaptureScheduler::new(
        SchedulerSettings::from_config(&config.scheduler),
        config.satellites.clone(),
        receiver,
        gain,
        Box::new(decoder),
    );
    let (runner, handle) = Runner::new(
        scheduler,
        pass_source(config, station),
        config.scheduler.tick,
        config.predict.refresh,
        reports_rx,
    );

    if let Some(bind) = config.web.bind.clone() {
        let state = AppState {
            scheduler: handle,
            topology: config.topology,
            link,
        };
        tokio::spawn(async move {
            if let Err(e) = web::run_server(bind, state).await {
                log::error!("Status API stopped: {}", e);
            }
        });
    }

    runner
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    ExitCode::SUCCESS
}

async fn run_relay(config: &Config) -> ExitCode {
    let Some(bind) = config.relay.bind.as_deref() else {
        eprintln!("relay.bind is required for the sdr-relay topology");
        return ExitCode::FAILURE;
    };
    let listener = match TcpListener::bind(bind).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Cannot listen on {}: {}", bind, e);
            return ExitCode::FAILURE;
        }
    };
    let device = ProcessDevice::new(config.sdr.capture_command.clone(), config.sdr.chunk_size);
    let server = RelayServer::new(device, config.relay.link.clone());

    tokio::select! {
        result = server.serve(listener) => {
            if let Err(e) = result {
                eprintln!("Relay failed: {}", e);
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => log::info!("Relay shutting down"),
    }
    ExitCode::SUCCESS
}

fn topology_name(topology: Topology) -> &'static str {
    match topology {
        Topology::Full => "full",
        Topology::SdrRelay => "sdr-relay",
        Topology::Server => "server",
    }
}
