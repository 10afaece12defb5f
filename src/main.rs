//! Edge traffic-monitoring pipeline entry point: radar, camera and
//! weather ingestion, consolidation, durable persistence, real-time
//! broadcast and a read-only query API, all running as a supervised
//! set of tasks behind a single shutdown signal.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use edge_traffic_monitor::api::state::AppState;
use edge_traffic_monitor::broadcaster::Broadcaster;
use edge_traffic_monitor::broker::{Broker, InMemoryBroker};
use edge_traffic_monitor::camera::source::{BrokerCameraSource, CameraSource, FileDropCameraSource};
use edge_traffic_monitor::camera::CameraReader;
use edge_traffic_monitor::config::{self, AppConfig, CameraSourceConfig};
use edge_traffic_monitor::consolidator::Consolidator;
use edge_traffic_monitor::error::PipelineError;
use edge_traffic_monitor::maintenance::Maintenance;
use edge_traffic_monitor::persistence::{self, Persister};
use edge_traffic_monitor::radar::RadarReader;
use edge_traffic_monitor::weather::local::{LocalWeatherReader, SysfsLocalSensor};
use edge_traffic_monitor::weather::remote::{ReqwestRemoteWeatherClient, RemoteWeatherReader};

#[derive(Parser, Debug)]
#[command(name = "edge-traffic-monitor")]
#[command(about = "Edge traffic-monitoring pipeline")]
#[command(version)]
struct CliArgs {
    /// Override the radar serial port (env: TRAFFIC_RADAR_PORT)
    #[arg(long)]
    radar_port: Option<String>,

    /// Override the API bind address (default: 0.0.0.0)
    #[arg(long)]
    bind_addr: Option<String>,

    /// Override the API port (default: 8080)
    #[arg(long)]
    port: Option<u16>,

    /// Delete the relational store and durable queue before starting.
    /// Destructive; intended for test rigs, not field units.
    #[arg(long)]
    reset_db: bool,
}

#[derive(Debug, Clone, Copy)]
enum TaskName {
    Radar,
    Camera,
    LocalWeather,
    RemoteWeather,
    Consolidator,
    Persister,
    PersisterQueueDrain,
    Broadcaster,
    Api,
    Maintenance,
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskName::Radar => "radar_reader",
            TaskName::Camera => "camera_reader",
            TaskName::LocalWeather => "local_weather_reader",
            TaskName::RemoteWeather => "remote_weather_reader",
            TaskName::Consolidator => "consolidator",
            TaskName::Persister => "persister",
            TaskName::PersisterQueueDrain => "persister_queue_drain",
            TaskName::Broadcaster => "broadcaster",
            TaskName::Api => "api",
            TaskName::Maintenance => "maintenance",
        };
        write!(f, "{name}")
    }
}

fn reset_persisted_state(config: &AppConfig) -> Result<()> {
    warn!("--reset-db passed, removing store and durable queue before startup");
    if config.persister.store_path.exists() {
        std::fs::remove_file(&config.persister.store_path).context("failed to remove store file")?;
    }
    if config.persister.durable_queue_path.exists() {
        std::fs::remove_file(&config.persister.durable_queue_path).context("failed to remove durable queue file")?;
    }
    Ok(())
}

fn camera_source(config: &edge_traffic_monitor::config::CameraConfig, broker: &Arc<dyn Broker>) -> Box<dyn CameraSource> {
    match &config.source {
        CameraSourceConfig::Broker => Box::new(BrokerCameraSource::new(broker)),
        CameraSourceConfig::FileDrop { directory } => Box::new(FileDropCameraSource::new(directory.clone())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .json()
        .init();

    let args = CliArgs::parse();

    let mut app_config = AppConfig::from_env();
    if let Some(port) = args.radar_port {
        app_config.radar.port = port;
    }
    if let Some(bind_addr) = args.bind_addr {
        app_config.api.bind_addr = bind_addr;
    }
    if let Some(port) = args.port {
        app_config.api.port = port;
    }

    if args.reset_db {
        reset_persisted_state(&app_config).map_err(|e| PipelineError::Startup(e.to_string()))?;
    }

    config::init(app_config.clone()).map_err(|_| PipelineError::Config("config already initialized".to_string()))?;

    info!("edge traffic monitor starting");

    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    let store = persistence::open_pooled(&app_config.persister.store_path)
        .map_err(|e| PipelineError::Startup(format!("failed to open store: {e}")))?;

    let cancel = CancellationToken::new();
    let sigint = CancellationToken::new();
    {
        let cancel = cancel.clone();
        let sigint = sigint.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received shutdown signal");
            }
            cancel.cancel();
            sigint.cancel();
        });
    }

    let mut tasks: JoinSet<(TaskName, ())> = JoinSet::new();

    let radar = Arc::new(RadarReader::new(broker.clone(), app_config.radar.clone()));
    {
        let radar = radar.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            radar.run(cancel).await;
            (TaskName::Radar, ())
        });
    }

    let camera_reader = Arc::new(CameraReader::new(broker.clone(), app_config.camera.clone()));
    {
        let camera_reader = camera_reader.clone();
        let source = camera_source(&app_config.camera, &broker);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            camera_reader.run(source, cancel).await;
            (TaskName::Camera, ())
        });
    }

    let local_sensor = Arc::new(SysfsLocalSensor::new("/sys/bus/iio/devices/iio:device0/dht22".into()));
    let local_weather = Arc::new(LocalWeatherReader::new(
        broker.clone(),
        local_sensor,
        std::time::Duration::from_secs(app_config.weather.local_poll_interval_secs),
    ));
    {
        let local_weather = local_weather.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            local_weather.run(cancel).await;
            (TaskName::LocalWeather, ())
        });
    }

    let remote_client = Arc::new(ReqwestRemoteWeatherClient::new(
        app_config.weather.remote_url.clone(),
        std::time::Duration::from_secs(app_config.weather.remote_timeout_secs),
    ));
    let remote_weather = Arc::new(RemoteWeatherReader::new(
        broker.clone(),
        remote_client,
        std::time::Duration::from_secs(app_config.weather.remote_poll_interval_secs),
        std::time::Duration::from_secs(app_config.weather.local_poll_interval_secs),
        app_config.weather.timeseries_window_secs,
    ));
    {
        let remote_weather = remote_weather.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            remote_weather.run(cancel).await;
            (TaskName::RemoteWeather, ())
        });
    }

    let consolidator = Arc::new(Consolidator::new(broker.clone(), app_config.consolidator.clone()));
    {
        let consolidator = consolidator.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            consolidator.run(cancel).await;
            (TaskName::Consolidator, ())
        });
    }

    let persister = Arc::new(
        Persister::new(broker.clone(), store.clone(), app_config.persister.clone())
            .map_err(|e| PipelineError::Startup(format!("failed to open durable queue: {e}")))?,
    );
    {
        let persister = persister.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            persister.run(cancel).await;
            (TaskName::Persister, ())
        });
    }
    {
        let persister = persister.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            persister.run_queue_drain(cancel).await;
            (TaskName::PersisterQueueDrain, ())
        });
    }

    let broadcaster = Arc::new(Broadcaster::new(broker.clone(), store.clone(), app_config.broadcaster.clone()));
    {
        let broadcaster = broadcaster.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            broadcaster.run(cancel).await;
            (TaskName::Broadcaster, ())
        });
    }

    let maintenance = Arc::new(Maintenance::new(broker.clone(), store.clone(), app_config.maintenance.clone()));
    {
        let maintenance = maintenance.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            maintenance.run(cancel).await;
            (TaskName::Maintenance, ())
        });
    }

    let api_state = Arc::new(AppState {
        broker: broker.clone(),
        store: store.clone(),
        config: app_config.api.clone(),
    });
    {
        let cancel = cancel.clone();
        let bind_addr = app_config.api.bind_addr.clone();
        let port = app_config.api.port;
        tasks.spawn(async move {
            if let Err(e) = edge_traffic_monitor::api::run(api_state, &bind_addr, port, cancel).await {
                error!(component = "api", error = %e, "server exited with error");
            }
            (TaskName::Api, ())
        });
    }

    info!("all components started, supervising until shutdown");

    let reason = loop {
        tokio::select! {
            _ = sigint.cancelled() => {
                info!("shutdown signal received, draining tasks");
                cancel.cancel();
                break ShutdownReason::Signal;
            }
            result = tasks.join_next() => match result {
                Some(Ok((name, ()))) => {
                    warn!(task = %name, "task exited before shutdown was requested");
                }
                Some(Err(e)) => {
                    error!(error = %e, "task panicked");
                    cancel.cancel();
                    break ShutdownReason::Fatal;
                }
                None => {
                    info!("all tasks completed");
                    break ShutdownReason::AllDone;
                }
            }
        }
    };

    drain(tasks, app_config.shutdown_deadline_secs).await;

    let exit_code = match reason {
        ShutdownReason::Signal => 130,
        ShutdownReason::Fatal => 2,
        ShutdownReason::AllDone => 0,
    };

    info!(exit_code, "edge traffic monitor shutdown complete");
    std::process::exit(exit_code);
}

enum ShutdownReason {
    Signal,
    Fatal,
    AllDone,
}

/// Waits for remaining tasks up to `deadline_secs`, per §5's bounded
/// shutdown drain. Tasks still running past the deadline are abandoned;
/// the process exits regardless.
async fn drain(mut tasks: JoinSet<(TaskName, ())>, deadline_secs: u64) {
    let deadline = std::time::Duration::from_secs(deadline_secs);
    let drain_result = tokio::time::timeout(deadline, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;

    if drain_result.is_err() {
        warn!("shutdown deadline elapsed with tasks still running, exiting anyway");
    }
}
