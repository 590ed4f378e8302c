use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use nsm_mctp::{MctpSocket, Requester, RequesterConfig};
use nsmd::config::{build_device, Config, EidTable};
use nsmd::events::EventRouter;
use nsmd::publish::LogSurface;
use nsmd::scheduler::{run_device, SchedulerConfig};

#[derive(Debug, Parser)]
#[command(
    name = "nsmd",
    version,
    about = "Polls NVIDIA management endpoints over MCTP and publishes their telemetry."
)]
struct Opt {
    /// Path to the JSON sensor configuration.
    #[arg(long, default_value = "/etc/nsmd/config.json")]
    config: PathBuf,

    /// Abstract-namespace socket name of the MCTP demultiplexer.
    /// Defaults to "mctp-mux", or the NSM_MCTP_SOCKET environment variable.
    #[arg(long)]
    socket: Option<String>,

    /// Pause between polling ticks, in milliseconds.
    #[arg(long, default_value = "999")]
    tick_ms: u64,

    /// Maximum concurrent requests per endpoint (1-32).
    #[arg(long, default_value = "4")]
    max_in_flight: u8,
}

fn response_timeout_from_env() -> Duration {
    std::env::var("NSM_DEFAULT_TIMEOUT_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(2))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("NSM_LOG_LEVEL", "info"),
    )
    .init();

    let opt = Opt::parse();

    let config_text = match std::fs::read_to_string(&opt.config) {
        Ok(text) => text,
        Err(err) => {
            error!("could not read {:?}: {err}", opt.config);
            return ExitCode::FAILURE;
        }
    };
    let config = match Config::from_json(&config_text) {
        Ok(config) => config,
        Err(err) => {
            error!("bad configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    let socket_name = opt.socket.unwrap_or_else(nsm_mctp::socket_path_from_env);
    let socket = match MctpSocket::connect(&socket_name) {
        Ok(socket) => socket,
        Err(err) => {
            error!("could not connect to MCTP demultiplexer at {socket_name:?}: {err}");
            return ExitCode::FAILURE;
        }
    };

    let response_timeout = response_timeout_from_env();
    let (requester, transport_events) = Requester::new(
        socket,
        RequesterConfig {
            max_in_flight_per_endpoint: opt.max_in_flight,
            default_timeout: response_timeout,
        },
    );
    let requester = Arc::new(requester);

    let router = EventRouter::new();
    tokio::spawn(router.clone().run(transport_events));

    let scheduler_config = SchedulerConfig {
        tick_interval: Duration::from_millis(opt.tick_ms),
        response_timeout,
        ..SchedulerConfig::default()
    };

    let eid_table = EidTable::from_config(&config.eid_table);
    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    for device_config in &config.devices {
        let Some(entry) = eid_table.lookup(&device_config.uuid) else {
            warn!(
                "device {} ({}): no EID mapping, skipping",
                device_config.name, device_config.uuid
            );
            continue;
        };
        let device = match build_device(device_config, entry.eid) {
            Ok(device) => device,
            Err(err) => {
                error!("device {}: {err}", device_config.name);
                return ExitCode::FAILURE;
            }
        };
        let events = router.register(entry.eid);
        tasks.push(tokio::spawn(run_device(
            device,
            requester.clone(),
            Box::new(LogSurface),
            events,
            scheduler_config,
            cancel.child_token(),
        )));
    }

    if tasks.is_empty() {
        error!("no devices to poll");
        return ExitCode::FAILURE;
    }

    info!("nsmd running, {} devices", tasks.len());
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("signal handling failed: {err}");
    }

    info!("shutting down");
    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    requester.shutdown();
    ExitCode::SUCCESS
}
